//! Flare Bootstrap 服务启动库
//!
//! 解析命令行参数，建立注册中心会话，按驱动类型启动处理器并注册监听地址，
//! 同时拉起日志、追踪、指标和后门诊断接口。
//!
//! ```rust,ignore
//! let mut procs = flare_bootstrap::Processors::new();
//! procs.insert("api".to_string(), Box::new(MyHttpProcessor::default()));
//!
//! flare_bootstrap::serve(
//!     vec!["http://127.0.0.1:2379".to_string()],
//!     "/flare",
//!     |sb| async move { Ok(()) },
//!     procs,
//! )
//! .await?;
//! ```

pub mod backdoor;
pub mod config;
pub mod error;
pub mod metrics;
pub mod netutil;
pub mod processor;
pub mod servbase;
pub mod service;
pub mod tracing;

pub use backdoor::BackDoorHttp;
pub use config::{CmdArgs, EtcdConfig, serv_config};
pub use error::{Result, ServError};
pub use processor::{Driver, FramedProcessor, GrpcServer, Processor, ProcessorKind};
pub use servbase::{ServBase, ServBaseV2, ServInfo};
pub use service::{
    Processors, Service, get_serv_base, get_serv_id, get_serv_name, init, reload_router, serve,
    shutdown, test,
};
