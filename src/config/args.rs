//! 命令行参数
//!
//! 兼容单横线长参数（`-serv x`、`-serv=x`），同时接受 `--serv x`。

use std::ffi::OsString;

use clap::Parser;

use crate::error::{Result, ServError};

/// 启动参数
#[derive(Debug, Clone, Default, PartialEq, Eq, Parser)]
#[command(name = "flare-bootstrap")]
pub struct CmdArgs {
    /// 单个日志文件的最大大小（MB），0 表示不切分
    #[arg(long = "logmaxsize", default_value_t = 0)]
    pub log_max_size: u64,

    /// 保留的历史日志文件数量，0 表示全部保留
    #[arg(long = "logmaxbackups", default_value_t = 0)]
    pub log_max_backups: usize,

    /// 服务位置（如 `base/account`）
    #[arg(long = "serv", default_value = "")]
    pub serv_loc: String,

    /// 日志目录，`console` 表示输出到控制台
    #[arg(long = "logdir", default_value = "")]
    pub log_dir: String,

    /// 服务会话 key
    #[arg(long = "skey", default_value = "")]
    pub sess_key: String,

    /// 服务分组
    #[arg(long = "group", default_value = "")]
    pub group: String,
}

impl CmdArgs {
    /// 从进程参数解析
    pub fn parse_flag() -> Result<Self> {
        Self::parse_from_args(std::env::args_os())
    }

    /// 从给定参数解析（第一个元素为程序名）
    pub fn parse_from_args<I, T>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString>,
    {
        let args = normalize_long_flags(args.into_iter().map(Into::into));
        let parsed = Self::try_parse_from(args)?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// 校验必需参数
    pub fn validate(&self) -> Result<()> {
        if self.serv_loc.is_empty() {
            return Err(ServError::MissingArgument("serv"));
        }
        if self.sess_key.is_empty() {
            return Err(ServError::MissingArgument("skey"));
        }
        Ok(())
    }
}

/// 将 `-name` 形式的长参数改写为 `--name`
///
/// 单字符短参数（`-h`）、`--` 之后的位置参数以及负数保持不变。
fn normalize_long_flags(args: impl Iterator<Item = OsString>) -> Vec<OsString> {
    let mut out = Vec::new();
    let mut passthrough = false;

    for (idx, arg) in args.enumerate() {
        if idx == 0 || passthrough {
            out.push(arg);
            continue;
        }

        let Some(text) = arg.to_str() else {
            out.push(arg);
            continue;
        };

        if text == "--" {
            passthrough = true;
            out.push(arg);
            continue;
        }

        let is_single_dash_long = text.starts_with('-')
            && !text.starts_with("--")
            && text
                .split('=')
                .next()
                .map(|name| name.len() > 2 && name[1..].chars().all(|c| c.is_ascii_alphabetic()))
                .unwrap_or(false);

        if is_single_dash_long {
            out.push(OsString::from(format!("-{}", text)));
        } else {
            out.push(arg);
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_dash_flags() {
        let args = CmdArgs::parse_from_args([
            "svc",
            "-serv",
            "base/account",
            "-skey",
            "abc",
            "-group=canary",
            "-logdir",
            "/var/log/svc",
            "-logmaxsize",
            "64",
            "-logmaxbackups=3",
        ])
        .unwrap();

        assert_eq!(args.serv_loc, "base/account");
        assert_eq!(args.sess_key, "abc");
        assert_eq!(args.group, "canary");
        assert_eq!(args.log_dir, "/var/log/svc");
        assert_eq!(args.log_max_size, 64);
        assert_eq!(args.log_max_backups, 3);
    }

    #[test]
    fn test_parse_double_dash_flags() {
        let args =
            CmdArgs::parse_from_args(["svc", "--serv", "base/account", "--skey", "k"]).unwrap();
        assert_eq!(args.serv_loc, "base/account");
        assert_eq!(args.sess_key, "k");
        assert!(args.group.is_empty());
        assert_eq!(args.log_max_size, 0);
    }

    #[test]
    fn test_missing_serv() {
        let err = CmdArgs::parse_from_args(["svc", "-skey", "k"]).unwrap_err();
        assert_eq!(err.to_string(), "serv args need!");
    }

    #[test]
    fn test_missing_skey() {
        let err = CmdArgs::parse_from_args(["svc", "-serv", "base/account"]).unwrap_err();
        assert_eq!(err.to_string(), "skey args need!");
    }

    #[test]
    fn test_empty_skey_is_missing() {
        let err = CmdArgs::parse_from_args(["svc", "-serv", "a/b", "-skey="]).unwrap_err();
        assert!(matches!(err, ServError::MissingArgument("skey")));
    }

    #[test]
    fn test_normalize_keeps_short_and_positional() {
        let out = normalize_long_flags(
            ["svc", "-h", "-serv", "-1", "--", "-group"]
                .into_iter()
                .map(OsString::from),
        );
        let out: Vec<_> = out.iter().map(|s| s.to_str().unwrap()).collect();
        assert_eq!(out, vec!["svc", "-h", "--serv", "-1", "--", "-group"]);
    }
}
