//! Flare Bootstrap 配置模块
//!
//! 该模块提供启动层需要的配置：
//! - 命令行参数解析
//! - etcd 注册中心配置
//! - 从注册中心加载服务配置子树，并叠加到默认值之上

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use toml::Value;

use crate::error::{Result, ServError};
use crate::servbase::ServBase;

mod args;
pub use args::CmdArgs;

/// 默认 etcd 根路径
pub const DEFAULT_BASE_LOC: &str = "/flare";

/// etcd 注册中心配置
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct EtcdConfig {
    /// etcd 端点列表
    pub endpoints: Vec<String>,
    /// 注册根路径
    #[serde(default = "default_base_loc")]
    pub base_loc: String,
}

fn default_base_loc() -> String {
    DEFAULT_BASE_LOC.to_string()
}

impl EtcdConfig {
    pub fn new(endpoints: Vec<String>, base_loc: impl Into<String>) -> Self {
        Self {
            endpoints,
            base_loc: base_loc.into(),
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogSettings {
    /// 日志级别（TRACE/DEBUG/INFO/WARN/ERROR）
    #[serde(default = "default_log_level", alias = "Level")]
    pub level: String,
    /// 日志根目录
    #[serde(default, alias = "Dir")]
    pub dir: String,
}

fn default_log_level() -> String {
    "INFO".to_string()
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: String::new(),
        }
    }
}

/// 服务配置中的日志段
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogSection {
    #[serde(default, alias = "Log")]
    pub log: LogSettings,
}

/// 加载服务配置，并叠加到默认值之上
///
/// 远端缺失的字段保留 `defaults` 中的值；表递归合并，标量直接覆盖。
///
/// # 示例
/// ```rust,ignore
/// let section = serv_config(sb.as_ref(), LogSection::default()).await?;
/// println!("log level: {}", section.log.level);
/// ```
pub async fn serv_config<T>(sb: &dyn ServBase, defaults: T) -> Result<T>
where
    T: Serialize + DeserializeOwned,
{
    let remote = sb.serv_config_value().await?;
    overlay(defaults, remote)
}

/// 将配置文档叠加到默认值上
pub fn overlay<T>(defaults: T, remote: Option<Value>) -> Result<T>
where
    T: Serialize + DeserializeOwned,
{
    let Some(remote) = remote else {
        return Ok(defaults);
    };

    let mut merged = Value::try_from(&defaults)
        .map_err(|e| ServError::Config(format!("encode defaults: {}", e)))?;
    merge_value(&mut merged, remote);

    merged
        .try_into()
        .map_err(|e| ServError::Config(format!("invalid config after merging: {}", e)))
}

/// 解析配置文档（支持 TOML 或 JSON 格式）
pub fn parse_document(raw: &str) -> Result<Value> {
    if raw.trim_start().starts_with('{') {
        let json: serde_json::Value = serde_json::from_str(raw)?;
        Value::try_from(json).map_err(|e| ServError::Config(format!("convert json: {}", e)))
    } else {
        toml::from_str(raw).map_err(|e| ServError::Config(format!("invalid toml: {}", e)))
    }
}

/// 合并值
fn merge_value(base: &mut Value, overlay: Value) {
    match overlay {
        Value::Table(overlay_table) => {
            if let Value::Table(base_table) = base {
                for (key, overlay_value) in overlay_table.into_iter() {
                    match base_table.get_mut(&key) {
                        Some(base_value) => merge_value(base_value, overlay_value),
                        None => {
                            base_table.insert(key, overlay_value);
                        }
                    }
                }
            } else {
                *base = Value::Table(overlay_table);
            }
        }
        other => {
            *base = other;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlay_without_remote_keeps_defaults() {
        let section = overlay(LogSection::default(), None).unwrap();
        assert_eq!(section.log.level, "INFO");
        assert!(section.log.dir.is_empty());
    }

    #[test]
    fn test_overlay_keeps_missing_fields() {
        let remote = parse_document("[log]\ndir = \"/data/logs\"\n").unwrap();
        let section = overlay(LogSection::default(), Some(remote)).unwrap();
        assert_eq!(section.log.level, "INFO");
        assert_eq!(section.log.dir, "/data/logs");
    }

    #[test]
    fn test_overlay_json_document() {
        let remote = parse_document(r#"{"log": {"level": "DEBUG"}}"#).unwrap();
        let section = overlay(LogSection::default(), Some(remote)).unwrap();
        assert_eq!(section.log.level, "DEBUG");
    }

    #[test]
    fn test_overlay_ignores_unrelated_sections() {
        let remote = parse_document("[db]\nurl = \"x\"\n[log]\nlevel = \"WARN\"\n").unwrap();
        let section = overlay(LogSection::default(), Some(remote)).unwrap();
        assert_eq!(section.log.level, "WARN");
    }

    #[test]
    fn test_invalid_document() {
        assert!(matches!(
            parse_document("[log\nlevel="),
            Err(ServError::Config(_))
        ));
    }

    #[test]
    fn test_etcd_config_default_base() {
        let cfg: EtcdConfig = toml::from_str("endpoints = [\"http://127.0.0.1:2379\"]").unwrap();
        assert_eq!(cfg.base_loc, DEFAULT_BASE_LOC);
    }
}
