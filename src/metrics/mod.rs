//! # Prometheus 指标收集模块
//!
//! 启动层自身的指标，以及对外暴露 `/metrics` 的指标处理器。

use async_trait::async_trait;
use axum::Router;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use crate::error::{Result, ServError};
use crate::processor::{Driver, Processor};

/// 全局指标注册表
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// 启动层指标
pub static METRICS: Lazy<BootstrapMetrics> = Lazy::new(BootstrapMetrics::new);

/// 指标处理器默认监听地址（随机端口，通过注册中心发现）
pub const DEFAULT_METRICS_ADDR: &str = "0.0.0.0:0";

/// 启动层指标
pub struct BootstrapMetrics {
    /// 已启动的处理器数，按类型
    pub processors_powered_total: IntCounterVec,
    /// 注册失败次数，按注册目标（dist / backdoor / metrics）
    pub registration_failures_total: IntCounterVec,
    /// 后门请求数，按路径
    pub backdoor_requests_total: IntCounterVec,
    /// 启动时间（Unix 秒）
    pub startup_timestamp_seconds: IntGauge,
}

impl BootstrapMetrics {
    pub fn new() -> Self {
        let processors_powered_total = IntCounterVec::new(
            Opts::new(
                "bootstrap_processors_powered_total",
                "Total number of processors powered",
            ),
            &["kind"],
        )
        .expect("Failed to create bootstrap_processors_powered_total metric");

        let registration_failures_total = IntCounterVec::new(
            Opts::new(
                "bootstrap_registration_failures_total",
                "Total number of service base registration failures",
            ),
            &["target"],
        )
        .expect("Failed to create bootstrap_registration_failures_total metric");

        let backdoor_requests_total = IntCounterVec::new(
            Opts::new(
                "bootstrap_backdoor_requests_total",
                "Total number of backdoor requests",
            ),
            &["path"],
        )
        .expect("Failed to create bootstrap_backdoor_requests_total metric");

        let startup_timestamp_seconds = IntGauge::new(
            "bootstrap_startup_timestamp_seconds",
            "Process startup time as unix timestamp",
        )
        .expect("Failed to create bootstrap_startup_timestamp_seconds metric");

        // 忽略重复注册错误（测试中可能重复创建）
        let _ = REGISTRY.register(Box::new(processors_powered_total.clone()));
        let _ = REGISTRY.register(Box::new(registration_failures_total.clone()));
        let _ = REGISTRY.register(Box::new(backdoor_requests_total.clone()));
        let _ = REGISTRY.register(Box::new(startup_timestamp_seconds.clone()));

        Self {
            processors_powered_total,
            registration_failures_total,
            backdoor_requests_total,
            startup_timestamp_seconds,
        }
    }
}

impl Default for BootstrapMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// 获取 Prometheus 指标导出格式
pub fn gather_metrics() -> Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| ServError::Other(e.into()))?;
    String::from_utf8(buffer).map_err(|e| ServError::Other(e.into()))
}

async fn metrics_handler() -> impl IntoResponse {
    match gather_metrics() {
        Ok(output) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            output,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            e.to_string(),
        ),
    }
}

/// 指标处理器
#[derive(Debug, Clone)]
pub struct MetricsProcessor {
    addr: String,
}

impl Default for MetricsProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsProcessor {
    pub fn new() -> Self {
        Self {
            addr: DEFAULT_METRICS_ADDR.to_string(),
        }
    }

    pub fn with_addr(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    pub fn router() -> Router {
        Router::new().route("/metrics", get(metrics_handler))
    }
}

#[async_trait]
impl Processor for MetricsProcessor {
    async fn init(&mut self) -> anyhow::Result<()> {
        Lazy::force(&METRICS);
        Ok(())
    }

    fn driver(&self) -> (String, Option<Driver>) {
        (self.addr.clone(), Some(Driver::Http(Self::router())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_metrics_endpoint_exposes_registry() {
        METRICS
            .processors_powered_total
            .with_label_values(&["http"])
            .inc();

        let resp = MetricsProcessor::router()
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("bootstrap_processors_powered_total"));
    }

    #[tokio::test]
    async fn test_metrics_processor_driver() {
        let mut processor = MetricsProcessor::new();
        processor.init().await.unwrap();
        let (addr, driver) = processor.driver();
        assert_eq!(addr, "0.0.0.0:0");
        assert!(matches!(driver, Some(Driver::Http(_))));
    }
}
