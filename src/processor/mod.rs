//! 处理器模块
//!
//! 处理器是可插拔的网络监听抽象：`init` 完成依赖准备，`driver` 交出监听地址和具体的驱动，
//! 启动层按驱动类型拉起监听并把地址注册到注册中心。

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tonic::service::Routes;

pub mod power;

pub use power::{ListenerHandle, RouterHandle};

/// HTTP 处理器类型
pub const PROCESSOR_HTTP: &str = "http";
/// Thrift 处理器类型
pub const PROCESSOR_THRIFT: &str = "thrift";
/// gRPC 处理器类型（注册值沿用既有拼写，下游按此值识别）
pub const PROCESSOR_GRPC: &str = "gprc";
/// Gin 处理器类型
pub const PROCESSOR_GIN: &str = "gin";

/// 处理器类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessorKind {
    Http,
    Thrift,
    Grpc,
    Gin,
}

impl ProcessorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessorKind::Http => PROCESSOR_HTTP,
            ProcessorKind::Thrift => PROCESSOR_THRIFT,
            ProcessorKind::Grpc => PROCESSOR_GRPC,
            ProcessorKind::Gin => PROCESSOR_GIN,
        }
    }
}

impl fmt::Display for ProcessorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 帧处理器
///
/// 收发 4 字节大端长度前缀的帧（Thrift framed transport 的帧格式），帧内容对启动层不透明。
#[async_trait]
pub trait FramedProcessor: Send + Sync {
    /// 处理一个请求帧，返回响应帧
    async fn process(&self, frame: Bytes) -> anyhow::Result<Bytes>;
}

/// gRPC 服务集合
#[derive(Debug, Clone, Default)]
pub struct GrpcServer {
    routes: Routes,
}

impl GrpcServer {
    pub fn new(routes: Routes) -> Self {
        Self { routes }
    }

    pub fn into_routes(self) -> Routes {
        self.routes
    }
}

impl From<Routes> for GrpcServer {
    fn from(routes: Routes) -> Self {
        Self::new(routes)
    }
}

/// 监听驱动
pub enum Driver {
    /// 普通 HTTP 路由
    Http(axum::Router),
    /// 帧协议处理器
    Thrift(Arc<dyn FramedProcessor>),
    /// gRPC 服务
    Grpc(GrpcServer),
    /// 可热更新的 HTTP 路由，见 `reload_router`
    Gin(axum::Router),
}

impl Driver {
    pub fn kind(&self) -> ProcessorKind {
        match self {
            Driver::Http(_) => ProcessorKind::Http,
            Driver::Thrift(_) => ProcessorKind::Thrift,
            Driver::Grpc(_) => ProcessorKind::Grpc,
            Driver::Gin(_) => ProcessorKind::Gin,
        }
    }
}

impl fmt::Debug for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Driver::{:?}", self.kind())
    }
}

/// 处理器
#[async_trait]
pub trait Processor: Send + Sync {
    /// 初始化
    async fn init(&mut self) -> anyhow::Result<()>;

    /// 监听地址与驱动；返回 None 表示该处理器不需要监听
    fn driver(&self) -> (String, Option<Driver>);
}
