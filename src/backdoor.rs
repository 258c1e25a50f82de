//! 后门诊断接口
//!
//! 固定端口 60000 上的 HTTP 服务，提供健康检查以及可执行文件 md5 和启动时间。

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::metrics::METRICS;
use crate::processor::{Driver, Processor};

/// 后门默认监听地址
pub const DEFAULT_BACKDOOR_ADDR: &str = "0.0.0.0:60000";

/// 启动时间格式
const STARTUP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// 实例标识
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildInfo {
    /// 可执行文件 md5（小写十六进制，读取失败时为空）
    pub md5: String,
    /// 启动时间（本地时间）
    pub start_up: String,
}

/// 后门处理器
#[derive(Debug, Clone)]
pub struct BackDoorHttp {
    addr: String,
    info: Arc<BuildInfo>,
}

impl Default for BackDoorHttp {
    fn default() -> Self {
        Self::new()
    }
}

impl BackDoorHttp {
    pub fn new() -> Self {
        Self::with_addr(DEFAULT_BACKDOOR_ADDR)
    }

    pub fn with_addr(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            info: Arc::new(BuildInfo::default()),
        }
    }

    pub fn build_info(&self) -> &BuildInfo {
        &self.info
    }

    /// 后门路由
    pub fn router(&self) -> Router {
        Router::new()
            .route("/backdoor/health/check", get(health_check))
            .route("/backdoor/md5", get(build_md5))
            .with_state(self.info.clone())
    }
}

async fn executable_md5() -> String {
    let path = match std::env::current_exe() {
        Ok(path) => path,
        Err(e) => {
            warn!(error = %e, "resolve executable path failed");
            return String::new();
        }
    };

    match tokio::fs::read(&path).await {
        Ok(content) => format!("{:x}", md5::compute(content)),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "read executable failed");
            String::new()
        }
    }
}

async fn health_check() -> Json<Value> {
    METRICS
        .backdoor_requests_total
        .with_label_values(&["/backdoor/health/check"])
        .inc();
    info!("backdoor health check");
    Json(json!({}))
}

async fn build_md5(State(info): State<Arc<BuildInfo>>) -> Json<BuildInfo> {
    METRICS
        .backdoor_requests_total
        .with_label_values(&["/backdoor/md5"])
        .inc();
    Json(info.as_ref().clone())
}

#[async_trait]
impl Processor for BackDoorHttp {
    async fn init(&mut self) -> anyhow::Result<()> {
        let started = chrono::Local::now();
        let md5 = executable_md5().await;
        METRICS.startup_timestamp_seconds.set(started.timestamp());

        self.info = Arc::new(BuildInfo {
            md5,
            start_up: started.format(STARTUP_FORMAT).to_string(),
        });
        info!(md5 = %self.info.md5, start_up = %self.info.start_up, "backdoor initialized");
        Ok(())
    }

    fn driver(&self) -> (String, Option<Driver>) {
        (self.addr.clone(), Some(Driver::Http(self.router())))
    }
}
