//! 驱动启动
//!
//! 每种驱动绑定规范化后的地址，在独立任务中服务，观察同一个关闭信号，返回对外地址。

use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::Request;
use futures::{SinkExt, Stream, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tower::ServiceExt;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, info_span, warn};

use super::{FramedProcessor, GrpcServer, ProcessorKind};
use crate::error::{Result, ServError};
use crate::netutil::{advertise_addr, normalize_listen_addr};

/// 帧协议单帧上限（字节）
pub const MAX_FRAME_LENGTH: usize = 16_384_000;

/// accept 出错后的重试间隔
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// 帧编解码：4 字节大端长度前缀
pub fn framed_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

/// 可热更新的路由
///
/// 每个请求在到达时读取当前路由，`swap` 之后的新请求使用新路由，进行中的请求不受影响。
#[derive(Clone)]
pub struct RouterHandle {
    inner: Arc<RwLock<Router>>,
}

impl std::fmt::Debug for RouterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterHandle").finish_non_exhaustive()
    }
}

impl RouterHandle {
    pub fn new(router: Router) -> Self {
        Self {
            inner: Arc::new(RwLock::new(router)),
        }
    }

    /// 当前路由
    pub fn current(&self) -> Router {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// 替换路由
    pub fn swap(&self, router: Router) {
        match self.inner.write() {
            Ok(mut guard) => *guard = router,
            Err(poisoned) => *poisoned.into_inner() = router,
        }
    }

    /// 转发到当前路由的外层路由
    pub fn dispatcher(&self) -> Router {
        let handle = self.clone();
        Router::new().fallback_service(tower::service_fn(move |req: Request<Body>| {
            let router = handle.current();
            async move { router.oneshot(req).await }
        }))
    }
}

/// 运行中的监听
#[derive(Debug)]
pub struct ListenerHandle {
    name: String,
    kind: ProcessorKind,
    local_addr: SocketAddr,
    addr: String,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ProcessorKind {
        self.kind
    }

    /// 实际绑定地址
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// 对外注册地址
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// 等待监听任务退出，超时后强制终止
    pub async fn join(self, timeout: Duration) {
        let abort = self.task.abort_handle();
        if tokio::time::timeout(timeout, self.task).await.is_err() {
            warn!(processor = %self.name, "listener did not stop in time, aborting");
            abort.abort();
        }
    }
}

async fn bind(name: &str, addr: &str) -> Result<(TcpListener, SocketAddr)> {
    let addr = normalize_listen_addr(addr)?;
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|source| ServError::Bind {
            name: name.to_string(),
            addr: addr.clone(),
            source,
        })?;
    let local = listener.local_addr()?;
    Ok((listener, local))
}

async fn wait_shutdown(mut shutdown: watch::Receiver<bool>) {
    // 发送端被丢弃同样视为关闭
    let _ = shutdown.wait_for(|stop| *stop).await;
}

fn http_trace(router: Router) -> Router {
    router.layer(
        TraceLayer::new_for_http().make_span_with(|req: &Request<Body>| {
            info_span!(
                "http",
                service = %crate::tracing::tracer_service(),
                method = %req.method(),
                uri = %req.uri(),
            )
        }),
    )
}

fn handle(
    name: &str,
    kind: ProcessorKind,
    local_addr: SocketAddr,
    task: JoinHandle<()>,
) -> ListenerHandle {
    let addr = advertise_addr(local_addr);
    info!(
        processor = %name,
        kind = %kind,
        listen = %local_addr,
        addr = %addr,
        "processor powered"
    );
    ListenerHandle {
        name: name.to_string(),
        kind,
        local_addr,
        addr,
        task,
    }
}

async fn serve_router(
    name: &str,
    kind: ProcessorKind,
    addr: &str,
    router: Router,
    shutdown: watch::Receiver<bool>,
) -> Result<ListenerHandle> {
    let (listener, local) = bind(name, addr).await?;
    let router = http_trace(router);
    let task_name = name.to_string();

    let task = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(wait_shutdown(shutdown))
            .await;
        match result {
            Ok(()) => info!(processor = %task_name, "http listener stopped"),
            Err(e) => error!(processor = %task_name, error = %e, "http listener failed"),
        }
    });

    Ok(handle(name, kind, local, task))
}

/// 启动 HTTP 路由
pub async fn power_http(
    name: &str,
    addr: &str,
    router: Router,
    shutdown: watch::Receiver<bool>,
) -> Result<ListenerHandle> {
    serve_router(name, ProcessorKind::Http, addr, router, shutdown).await
}

/// 启动可热更新的路由
pub async fn power_gin(
    name: &str,
    addr: &str,
    router: &RouterHandle,
    shutdown: watch::Receiver<bool>,
) -> Result<ListenerHandle> {
    serve_router(name, ProcessorKind::Gin, addr, router.dispatcher(), shutdown).await
}

/// 启动帧协议处理器
pub async fn power_thrift(
    name: &str,
    addr: &str,
    processor: Arc<dyn FramedProcessor>,
    shutdown: watch::Receiver<bool>,
) -> Result<ListenerHandle> {
    let (listener, local) = bind(name, addr).await?;
    let task = tokio::spawn(accept_framed(
        name.to_string(),
        TcpListenerStream::new(listener),
        processor,
        shutdown,
    ));

    Ok(handle(name, ProcessorKind::Thrift, local, task))
}

/// 帧协议连接循环，accept 出错时等待后重试
async fn accept_framed<S>(
    name: String,
    mut incoming: S,
    processor: Arc<dyn FramedProcessor>,
    shutdown: watch::Receiver<bool>,
) where
    S: Stream<Item = std::io::Result<TcpStream>> + Unpin,
{
    let mut stop = shutdown.clone();
    loop {
        tokio::select! {
            accepted = incoming.next() => match accepted {
                Some(Ok(stream)) => {
                    let peer = stream
                        .peer_addr()
                        .map(|a| a.to_string())
                        .unwrap_or_default();
                    debug!(processor = %name, peer = %peer, "framed connection accepted");
                    let processor = processor.clone();
                    let shutdown = shutdown.clone();
                    let conn_name = name.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_framed(stream, processor, shutdown).await {
                            warn!(processor = %conn_name, peer = %peer, error = %e, "framed connection closed with error");
                        }
                    });
                }
                Some(Err(e)) => {
                    warn!(processor = %name, error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
                None => break,
            },
            _ = stop.wait_for(|stop| *stop) => break,
        }
    }
    info!(processor = %name, "framed listener stopped");
}

async fn serve_framed(
    stream: TcpStream,
    processor: Arc<dyn FramedProcessor>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut framed = Framed::new(stream, framed_codec());
    loop {
        let frame = tokio::select! {
            frame = framed.next() => frame,
            _ = shutdown.wait_for(|stop| *stop) => return Ok(()),
        };
        let Some(frame) = frame else {
            return Ok(());
        };
        let reply = processor.process(frame?.freeze()).await?;
        framed.send(reply).await?;
    }
}

/// 启动 gRPC 服务
pub async fn power_grpc(
    name: &str,
    addr: &str,
    server: GrpcServer,
    shutdown: watch::Receiver<bool>,
) -> Result<ListenerHandle> {
    let (listener, local) = bind(name, addr).await?;
    let task_name = name.to_string();

    let task = tokio::spawn(async move {
        let result = tonic::transport::Server::builder()
            .add_routes(server.into_routes())
            .serve_with_incoming_shutdown(
                TcpListenerStream::new(listener),
                wait_shutdown(shutdown),
            )
            .await;
        match result {
            Ok(()) => info!(processor = %task_name, "grpc listener stopped"),
            Err(e) => error!(processor = %task_name, error = %e, "grpc listener failed"),
        }
    });

    Ok(handle(name, ProcessorKind::Grpc, local, task))
}
