//! # 日志与追踪模块
//!
//! - 日志：控制台，或 `<dir>/<copyname>/serv.log` + `stat.log` 两个按大小切分的文件
//! - 统计日志：target 为 `stat` 的事件只写入 `stat.log`，见 [`statlog!`](crate::statlog)
//! - 追踪：记录 HTTP span 使用的服务名；启用 `otel` feature 时安装 OpenTelemetry tracer provider
//!
//! 日志级别优先使用环境变量 `RUST_LOG`，否则使用服务配置 `log.level`。

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use tracing::{Metadata, Subscriber, info};
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

use crate::config::{CmdArgs, LogSection, serv_config};
use crate::error::{Result, ServError};
use crate::servbase::ServBase;

pub mod rolling;

pub use rolling::RollingFile;

#[doc(hidden)]
pub use ::tracing::info as __stat_info;

/// 统计日志 target
pub const STAT_TARGET: &str = "stat";

/// 服务日志文件名
pub const SERV_LOG_FILE: &str = "serv.log";

/// 统计日志文件名
pub const STAT_LOG_FILE: &str = "stat.log";

/// `-logdir` 取该值时输出到控制台
pub const CONSOLE_LOG_DIR: &str = "console";

/// 写入统计日志
///
/// ```rust,ignore
/// statlog!(uid = 10086, cost_ms = 12, "login");
/// ```
#[macro_export]
macro_rules! statlog {
    ($($arg:tt)+) => {
        $crate::tracing::__stat_info!(target: "stat", $($arg)+)
    };
}

/// 日志输出目标
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    Console,
    Dir(PathBuf),
}

/// 计算日志目录
///
/// 配置目录 `<dir>/<copyname>`，命令行 `-logdir` 覆盖配置，`-logdir console` 或两者都为空时输出到控制台。
pub fn resolve_log_target(config_dir: &str, flag_dir: &str, copyname: &str) -> LogTarget {
    if flag_dir == CONSOLE_LOG_DIR {
        return LogTarget::Console;
    }
    let root = if !flag_dir.is_empty() {
        flag_dir
    } else {
        config_dir
    };
    if root.is_empty() {
        LogTarget::Console
    } else {
        LogTarget::Dir(Path::new(root).join(copyname))
    }
}

/// 将配置中的日志级别映射为过滤指令
pub fn level_directive(level: &str) -> &'static str {
    match level.trim().to_ascii_uppercase().as_str() {
        "TRACE" => "trace",
        "DEBUG" => "debug",
        "INFO" => "info",
        "WARN" | "WARNING" => "warn",
        "ERROR" | "FATAL" | "PANIC" => "error",
        _ => "info",
    }
}

fn env_filter(level: &str) -> EnvFilter {
    // 优先使用环境变量 RUST_LOG，如果没有则使用配置文件的日志级别
    match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new(level_directive(level)),
    }
}

fn not_stat(meta: &Metadata<'_>) -> bool {
    meta.target() != STAT_TARGET
}

fn only_stat(meta: &Metadata<'_>) -> bool {
    meta.target() == STAT_TARGET
}

/// 构建日志订阅器
pub fn build_subscriber(
    target: &LogTarget,
    level: &str,
    max_size_mb: u64,
    max_backups: usize,
) -> Result<Box<dyn Subscriber + Send + Sync>> {
    let filter = env_filter(level);

    match target {
        LogTarget::Console => {
            let subscriber = tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_target(true));
            Ok(Box::new(subscriber))
        }
        LogTarget::Dir(dir) => {
            let serv = RollingFile::open(dir.join(SERV_LOG_FILE), max_size_mb, max_backups)
                .map_err(|e| ServError::Log(format!("open {}: {}", SERV_LOG_FILE, e)))?;
            let stat = RollingFile::open(dir.join(STAT_LOG_FILE), max_size_mb, max_backups)
                .map_err(|e| ServError::Log(format!("open {}: {}", STAT_LOG_FILE, e)))?;

            let serv_layer = fmt::layer()
                .with_writer(serv)
                .with_ansi(false)
                .with_filter(filter_fn(not_stat));
            let stat_layer = fmt::layer()
                .with_writer(stat)
                .with_ansi(false)
                .with_target(false)
                .with_filter(filter_fn(only_stat));

            let subscriber = tracing_subscriber::registry()
                .with(filter)
                .with(serv_layer)
                .with(stat_layer);
            Ok(Box::new(subscriber))
        }
    }
}

/// 初始化日志
///
/// 读取服务配置中的 `log` 段，结合命令行参数决定输出位置，安装全局订阅器。
pub async fn init_log(sb: &dyn ServBase, args: &CmdArgs) -> Result<LogTarget> {
    let section = serv_config(sb, LogSection::default()).await?;
    let target = resolve_log_target(&section.log.dir, &args.log_dir, &sb.copyname());

    let subscriber = build_subscriber(
        &target,
        &section.log.level,
        args.log_max_size,
        args.log_max_backups,
    )?;
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| ServError::Log(e.to_string()))?;

    info!(
        target_dir = ?target,
        serv = %args.serv_loc,
        level = %section.log.level,
        "init log"
    );
    Ok(target)
}

static TRACER_SERVICE: OnceLock<String> = OnceLock::new();

/// 追踪使用的服务名，未初始化时为空
pub fn tracer_service() -> &'static str {
    TRACER_SERVICE.get().map(String::as_str).unwrap_or("")
}

/// 初始化追踪
///
/// 同一进程只能绑定一个服务名，重复使用相同服务名初始化视为成功。
pub fn init_tracer(service: &str) -> Result<()> {
    if service.is_empty() {
        return Err(ServError::Tracer("service name empty".to_string()));
    }

    let current = TRACER_SERVICE.get_or_init(|| service.to_string());
    if current != service {
        return Err(ServError::Tracer(format!(
            "tracer already initialized for {}",
            current
        )));
    }

    #[cfg(feature = "otel")]
    install_otel_provider(service);

    info!(service = %service, "tracer initialized");
    Ok(())
}

#[cfg(feature = "otel")]
fn install_otel_provider(service: &str) {
    use opentelemetry_sdk::Resource;
    use opentelemetry_sdk::trace::SdkTracerProvider;

    let provider = SdkTracerProvider::builder()
        .with_resource(
            Resource::builder()
                .with_service_name(service.to_string())
                .build(),
        )
        .build();
    opentelemetry::global::set_tracer_provider(provider);
}
