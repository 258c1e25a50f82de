//! Flare Bootstrap 错误模块
//!
//! - 启动流程、注册中心、处理器加载统一使用 `ServError`
//! - 用户回调（初始化函数、处理器 init）使用 `anyhow`，在边界处包装

use thiserror::Error;

/// 启动层错误类型
#[derive(Debug, Error)]
pub enum ServError {
    /// 缺少必需的命令行参数
    #[error("{0} args need!")]
    MissingArgument(&'static str),

    /// 参数非法
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// 命令行解析失败
    #[error("parse args: {0}")]
    Args(#[from] clap::Error),

    /// 注册中心存储错误
    #[error("registry store: {0}")]
    Store(String),

    /// etcd 客户端错误
    #[error("etcd: {0}")]
    Etcd(#[from] etcd_client::Error),

    /// 会话 key 已被其他存活实例占用
    #[error("session key {skey} of {serv_loc} already held by servid {servid}")]
    SessionKeyInUse {
        serv_loc: String,
        skey: String,
        servid: i64,
    },

    /// 处理器名称不合法
    #[error("{0}")]
    ProcessorName(String),

    /// 处理器初始化失败
    #[error("processor:{name} init err:{cause:#}")]
    ProcessorInit { name: String, cause: anyhow::Error },

    /// 找不到可重载的驱动
    #[error("processor:{0} driver not recognition")]
    DriverNotRecognized(String),

    /// 监听失败
    #[error("processor:{name} listen {addr}: {source}")]
    Bind {
        name: String,
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// 初始化回调失败
    #[error("init callback: {0:#}")]
    InitCallback(anyhow::Error),

    /// 配置解析失败
    #[error("config: {0}")]
    Config(String),

    /// JSON 序列化失败
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),

    /// 追踪初始化失败
    #[error("tracer: {0}")]
    Tracer(String),

    /// 日志初始化失败
    #[error("log: {0}")]
    Log(String),

    /// IO 错误
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// 其他错误
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// 启动层结果类型
pub type Result<T> = std::result::Result<T, ServError>;

/// 便捷宏：构造注册中心存储错误并提前返回
#[macro_export]
macro_rules! bail_store {
    ($($arg:tt)*) => {
        return Err($crate::error::ServError::Store(format!($($arg)*)))
    };
}
