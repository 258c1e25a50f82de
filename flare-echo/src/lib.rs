//! Echo 示例服务
//!
//! - `http`：`GET /echo/{msg}` 返回带问候语前缀的消息
//! - `gin`：`GET /version` 返回路由版本，可通过 `reload_router` 热更新
//! - `frame`：长度前缀帧原样返回

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use axum::Router;
use axum::extract::{Path, State};
use axum::routing::get;
use bytes::Bytes;
use flare_bootstrap::{Driver, FramedProcessor, Processor, Processors, ServBase, serv_config};
use serde::{Deserialize, Serialize};
use tracing::info;

/// gin 处理器名
pub const GIN_PROCESSOR: &str = "gin";

/// 服务配置
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EchoConfig {
    #[serde(default)]
    pub echo: EchoSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EchoSection {
    #[serde(default = "default_greeting")]
    pub greeting: String,
}

fn default_greeting() -> String {
    "echo".to_string()
}

impl Default for EchoSection {
    fn default() -> Self {
        Self {
            greeting: default_greeting(),
        }
    }
}

/// 问候语，初始化回调从服务配置加载
#[derive(Debug, Clone, Default)]
pub struct Greeting(Arc<RwLock<String>>);

impl Greeting {
    pub fn get(&self) -> String {
        self.0.read().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn set(&self, greeting: String) {
        if let Ok(mut guard) = self.0.write() {
            *guard = greeting;
        }
    }

    /// 从服务配置加载
    pub async fn load(&self, sb: Arc<dyn ServBase>) -> anyhow::Result<()> {
        let config = serv_config(sb.as_ref(), EchoConfig::default()).await?;
        info!(
            serv = %sb.servname(),
            servid = sb.servid(),
            greeting = %config.echo.greeting,
            "echo config loaded"
        );
        self.set(config.echo.greeting);
        Ok(())
    }
}

async fn echo(State(greeting): State<Greeting>, Path(msg): Path<String>) -> String {
    format!("{}: {}", greeting.get(), msg)
}

/// HTTP 处理器
#[derive(Debug, Clone)]
pub struct EchoHttp {
    addr: String,
    greeting: Greeting,
}

impl EchoHttp {
    pub fn new(addr: impl Into<String>, greeting: Greeting) -> Self {
        Self {
            addr: addr.into(),
            greeting,
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/echo/{msg}", get(echo))
            .with_state(self.greeting.clone())
    }
}

#[async_trait]
impl Processor for EchoHttp {
    async fn init(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn driver(&self) -> (String, Option<Driver>) {
        (self.addr.clone(), Some(Driver::Http(self.router())))
    }
}

/// 带版本号的 gin 路由
pub fn versioned_router(version: u32) -> Router {
    Router::new().route("/version", get(move || async move { format!("v{}", version) }))
}

/// gin 处理器
#[derive(Debug, Clone)]
pub struct EchoGin {
    addr: String,
}

impl EchoGin {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl Processor for EchoGin {
    async fn init(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn driver(&self) -> (String, Option<Driver>) {
        (self.addr.clone(), Some(Driver::Gin(versioned_router(1))))
    }
}

/// 原样返回帧
#[derive(Debug, Default)]
pub struct FrameEcho;

#[async_trait]
impl FramedProcessor for FrameEcho {
    async fn process(&self, frame: Bytes) -> anyhow::Result<Bytes> {
        Ok(frame)
    }
}

/// 帧处理器
#[derive(Debug, Clone)]
pub struct EchoFrame {
    addr: String,
}

impl EchoFrame {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl Processor for EchoFrame {
    async fn init(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn driver(&self) -> (String, Option<Driver>) {
        (self.addr.clone(), Some(Driver::Thrift(Arc::new(FrameEcho))))
    }
}

/// 监听地址
#[derive(Debug, Clone)]
pub struct EchoAddrs {
    pub http: String,
    pub gin: String,
    pub frame: String,
}

impl Default for EchoAddrs {
    fn default() -> Self {
        Self {
            http: ":0".to_string(),
            gin: ":0".to_string(),
            frame: ":0".to_string(),
        }
    }
}

/// 组装全部处理器
pub fn processors(addrs: &EchoAddrs, greeting: &Greeting) -> Processors {
    let mut procs = Processors::new();
    procs.insert(
        "http".to_string(),
        Box::new(EchoHttp::new(addrs.http.clone(), greeting.clone())),
    );
    procs.insert(
        GIN_PROCESSOR.to_string(),
        Box::new(EchoGin::new(addrs.gin.clone())),
    );
    procs.insert(
        "frame".to_string(),
        Box::new(EchoFrame::new(addrs.frame.clone())),
    );
    procs
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    async fn get_text(router: Router, uri: &str) -> (StatusCode, String) {
        let resp = router
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_echo_uses_greeting() {
        let greeting = Greeting::default();
        greeting.set("hi".to_string());
        let http = EchoHttp::new(":0", greeting.clone());

        let (status, body) = get_text(http.router(), "/echo/flare").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "hi: flare");

        greeting.set("hello".to_string());
        let (_, body) = get_text(http.router(), "/echo/flare").await;
        assert_eq!(body, "hello: flare");
    }

    #[tokio::test]
    async fn test_versioned_router() {
        let (_, body) = get_text(versioned_router(3), "/version").await;
        assert_eq!(body, "v3");
    }

    #[tokio::test]
    async fn test_frame_echo() {
        let frame = Bytes::from_static(b"\x80\x01\x00\x01ping");
        assert_eq!(FrameEcho.process(frame.clone()).await.unwrap(), frame);
    }

    #[test]
    fn test_processors_drivers() {
        let procs = processors(&EchoAddrs::default(), &Greeting::default());
        assert_eq!(procs.len(), 3);
        assert!(matches!(procs["http"].driver().1, Some(Driver::Http(_))));
        assert!(matches!(procs[GIN_PROCESSOR].driver().1, Some(Driver::Gin(_))));
        assert!(matches!(procs["frame"].driver().1, Some(Driver::Thrift(_))));
    }

    #[test]
    fn test_config_defaults() {
        let config: EchoConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.echo.greeting, "echo");
    }
}
