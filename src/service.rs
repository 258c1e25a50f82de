//! 服务启动编排
//!
//! 启动顺序：建立注册中心会话 → 初始化日志 → 用户初始化回调 → 追踪 → 处理器 → 分组 → 后门 → 指标。
//! 核心步骤失败直接返回错误，追踪、后门、指标失败只记录日志。

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use once_cell::sync::Lazy;
use tokio::sync::{OnceCell, watch};
use tracing::{error, info, warn};

use crate::backdoor::{BackDoorHttp, DEFAULT_BACKDOOR_ADDR};
use crate::config::{CmdArgs, EtcdConfig};
use crate::error::{Result, ServError};
use crate::metrics::{METRICS, MetricsProcessor};
use crate::processor::power::{power_gin, power_grpc, power_http, power_thrift};
use crate::processor::{Driver, ListenerHandle, Processor, RouterHandle};
use crate::servbase::{ServBase, ServBaseV2, ServInfo};
use crate::tracing::LogTarget;

/// 后门处理器名
pub const PROC_BACKDOOR: &str = "_PROC_BACKDOOR";

/// 指标处理器名
pub const PROC_METRICS: &str = "_PROC_METRICS";

/// 处理器集合，key 为处理器名
pub type Processors = HashMap<String, Box<dyn Processor>>;

/// 等待监听退出的时间
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// 服务
pub struct Service {
    sbase: RwLock<Option<Arc<dyn ServBase>>>,
    servers: Mutex<HashMap<String, RouterHandle>>,
    listeners: Mutex<Vec<ListenerHandle>>,
    shutdown: watch::Sender<bool>,
    stopped: OnceCell<()>,
    backdoor_addr: String,
    metrics_addr: String,
}

impl Default for Service {
    fn default() -> Self {
        Self::new()
    }
}

impl Service {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            sbase: RwLock::new(None),
            servers: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
            shutdown,
            stopped: OnceCell::new(),
            backdoor_addr: DEFAULT_BACKDOOR_ADDR.to_string(),
            metrics_addr: crate::metrics::DEFAULT_METRICS_ADDR.to_string(),
        }
    }

    /// 指定后门监听地址
    pub fn with_backdoor_addr(mut self, addr: impl Into<String>) -> Self {
        self.backdoor_addr = addr.into();
        self
    }

    /// 指定指标监听地址
    pub fn with_metrics_addr(mut self, addr: impl Into<String>) -> Self {
        self.metrics_addr = addr.into();
        self
    }

    /// 当前注册中心
    pub fn serv_base(&self) -> Option<Arc<dyn ServBase>> {
        self.sbase.read().ok().and_then(|guard| guard.clone())
    }

    fn set_serv_base(&self, sb: Arc<dyn ServBase>) {
        if let Ok(mut guard) = self.sbase.write() {
            *guard = Some(sb);
        }
    }

    /// 运行中的监听地址，按处理器名
    pub fn listen_addrs(&self) -> HashMap<String, std::net::SocketAddr> {
        self.listeners
            .lock()
            .map(|guard| {
                guard
                    .iter()
                    .map(|l| (l.name().to_string(), l.local_addr()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn add_listener(&self, listener: ListenerHandle) {
        if let Ok(mut guard) = self.listeners.lock() {
            guard.push(listener);
        }
    }

    fn add_server(&self, processor: &str, router: RouterHandle) {
        if let Ok(mut guard) = self.servers.lock() {
            guard.insert(processor.to_string(), router);
        }
    }

    /// 按驱动类型启动处理器，返回注册信息
    ///
    /// 没有驱动的处理器跳过；任一处理器启动失败立即返回。
    pub async fn load_driver(&self, procs: &Processors) -> Result<HashMap<String, ServInfo>> {
        let mut infos = HashMap::new();

        for (name, processor) in procs {
            let (addr, driver) = processor.driver();
            let Some(driver) = driver else {
                info!(processor = %name, "processor has no driver");
                continue;
            };

            info!(processor = %name, kind = %driver.kind(), addr = %addr, "loading processor");

            let shutdown = self.shutdown.subscribe();
            let listener = match driver {
                Driver::Http(router) => power_http(name, &addr, router, shutdown).await?,
                Driver::Thrift(framed) => power_thrift(name, &addr, framed, shutdown).await?,
                Driver::Grpc(server) => power_grpc(name, &addr, server, shutdown).await?,
                Driver::Gin(router) => {
                    let handle = RouterHandle::new(router);
                    let listener = power_gin(name, &addr, &handle, shutdown).await?;
                    self.add_server(name, handle);
                    listener
                }
            };

            METRICS
                .processors_powered_total
                .with_label_values(&[listener.kind().as_str()])
                .inc();
            info!(processor = %name, addr = %listener.addr(), "load ok");

            infos.insert(
                name.clone(),
                ServInfo::new(listener.kind().as_str(), listener.addr()),
            );
            self.add_listener(listener);
        }

        Ok(infos)
    }

    /// 校验、初始化并启动用户处理器，注册服务地址
    pub async fn init_processor(&self, sb: &dyn ServBase, procs: &mut Processors) -> Result<()> {
        for (name, processor) in procs.iter_mut() {
            validate_processor_name(name)?;

            if let Err(cause) = processor.init().await {
                error!(processor = %name, error = %cause, "processor init failed");
                return Err(ServError::ProcessorInit {
                    name: name.clone(),
                    cause,
                });
            }
        }

        let infos = self.load_driver(procs).await.inspect_err(|e| {
            error!(error = %e, "load driver failed");
        })?;

        if let Err(e) = sb.register_service(&infos).await {
            METRICS
                .registration_failures_total
                .with_label_values(&["dist"])
                .inc();
            error!(error = %e, "register service failed");
            return Err(e);
        }

        Ok(())
    }

    /// 替换 gin 处理器的路由
    pub fn reload_router(&self, processor: &str, router: axum::Router) -> Result<()> {
        let handle = self
            .servers
            .lock()
            .ok()
            .and_then(|guard| guard.get(processor).cloned());

        match handle {
            Some(handle) => {
                handle.swap(router);
                info!(processor = %processor, "router reloaded");
                Ok(())
            }
            None => Err(ServError::DriverNotRecognized(processor.to_string())),
        }
    }

    /// 初始化日志
    pub async fn init_log(&self, sb: &dyn ServBase, args: &CmdArgs) -> Result<LogTarget> {
        crate::tracing::init_log(sb, args).await
    }

    /// 初始化追踪，失败只记录日志
    pub fn init_tracer(&self, serv_loc: &str) -> Result<()> {
        crate::tracing::init_tracer(serv_loc).inspect_err(|e| {
            error!(serv = %serv_loc, error = %e, "init tracer failed");
        })
    }

    /// 启动后门，失败只记录日志
    pub async fn init_backdoor(&self, sb: &dyn ServBase) -> Result<()> {
        let mut backdoor = BackDoorHttp::with_addr(self.backdoor_addr.clone());
        if let Err(e) = backdoor.init().await {
            error!(error = %e, "init backdoor failed");
            return Err(ServError::Other(e));
        }

        let mut procs: Processors = HashMap::new();
        procs.insert(PROC_BACKDOOR.to_string(), Box::new(backdoor));

        let infos = self.load_driver(&procs).await.inspect_err(|e| {
            warn!(error = %e, "load backdoor driver failed");
        })?;

        sb.register_backdoor(&infos).await.inspect_err(|e| {
            METRICS
                .registration_failures_total
                .with_label_values(&["backdoor"])
                .inc();
            error!(error = %e, "register backdoor failed");
        })
    }

    /// 启动指标处理器，失败只记录日志
    pub async fn init_metric(&self, sb: &dyn ServBase) -> Result<()> {
        let mut metrics = MetricsProcessor::with_addr(self.metrics_addr.clone());
        if let Err(e) = metrics.init().await {
            warn!(error = %e, "init metrics failed");
        }

        let mut procs: Processors = HashMap::new();
        procs.insert(PROC_METRICS.to_string(), Box::new(metrics));

        let infos = self.load_driver(&procs).await.inspect_err(|e| {
            warn!(error = %e, "load metrics driver failed");
        })?;

        sb.register_metrics(&infos).await.inspect_err(|e| {
            METRICS
                .registration_failures_total
                .with_label_values(&["metrics"])
                .inc();
            warn!(error = %e, "register metrics failed");
        })
    }

    /// 在已建立的注册中心会话上完成启动，不阻塞
    pub async fn start_with_base<F, Fut>(
        &self,
        sb: Arc<dyn ServBase>,
        args: &CmdArgs,
        initfn: F,
        mut procs: Processors,
    ) -> Result<()>
    where
        F: FnOnce(Arc<dyn ServBase>) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        self.set_serv_base(sb.clone());

        if let Err(e) = self.init_log(sb.as_ref(), args).await {
            error!(error = %e, "init log failed");
        }

        if let Err(e) = initfn(sb.clone()).await {
            error!(error = %e, "init callback failed");
            return Err(ServError::InitCallback(e));
        }

        // 处理器的 trace 中间件依赖追踪服务名，需在处理器之前初始化
        let _ = self.init_tracer(&args.serv_loc);

        if let Err(e) = self.init_processor(sb.as_ref(), &mut procs).await {
            error!(error = %e, "init processor failed");
            return Err(e);
        }

        if let Err(e) = sb.set_group(&args.group).await {
            warn!(group = %args.group, error = %e, "set group failed");
        }

        let _ = self.init_backdoor(sb.as_ref()).await;
        let _ = self.init_metric(sb.as_ref()).await;

        info!(
            serv = %sb.servname(),
            servid = sb.servid(),
            group = %args.group,
            "service started"
        );
        Ok(())
    }

    /// 启动服务，失败时停止已启动的监听并关闭会话
    pub async fn start<F, Fut>(
        &self,
        sb: Arc<dyn ServBase>,
        args: &CmdArgs,
        initfn: F,
        procs: Processors,
    ) -> Result<()>
    where
        F: FnOnce(Arc<dyn ServBase>) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        if let Err(e) = self.start_with_base(sb, args, initfn, procs).await {
            self.stop().await;
            return Err(e);
        }
        Ok(())
    }

    /// 启动服务并阻塞，直到收到退出信号
    pub async fn init<F, Fut>(
        &self,
        etcd: &EtcdConfig,
        args: &CmdArgs,
        initfn: F,
        procs: Processors,
    ) -> Result<()>
    where
        F: FnOnce(Arc<dyn ServBase>) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let sb = ServBaseV2::connect(etcd, &args.serv_loc, &args.sess_key)
            .await
            .inspect_err(|e| {
                error!(
                    serv = %args.serv_loc,
                    skey = %args.sess_key,
                    error = %e,
                    "init servbase failed"
                );
            })?;

        self.start(Arc::new(sb), args, initfn, procs).await?;

        self.wait_for_shutdown().await;
        self.stop().await;
        Ok(())
    }

    /// 解析命令行参数并启动服务
    pub async fn serve<F, Fut>(&self, etcd: &EtcdConfig, initfn: F, procs: Processors) -> Result<()>
    where
        F: FnOnce(Arc<dyn ServBase>) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let args = CmdArgs::parse_flag().inspect_err(|e| {
            error!(error = %e, "parse arg failed");
        })?;
        self.init(etcd, &args, initfn, procs).await
    }

    /// 请求退出
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// 等待 Ctrl+C、SIGTERM 或 `shutdown()`
    pub async fn wait_for_shutdown(&self) {
        let mut requested = self.shutdown.subscribe();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received (Ctrl+C)");
            }
            _ = terminate() => {
                info!("shutdown signal received (SIGTERM)");
            }
            _ = requested.wait_for(|stop| *stop) => {
                info!("shutdown requested");
            }
        }
    }

    /// 停止所有监听并关闭注册中心会话
    ///
    /// 只执行一次，并发调用等待首次停止完成。
    pub async fn stop(&self) {
        self.stopped.get_or_init(|| self.stop_once()).await;
    }

    async fn stop_once(&self) {
        self.shutdown.send_replace(true);

        let listeners: Vec<ListenerHandle> = self
            .listeners
            .lock()
            .map(|mut guard| guard.drain(..).collect())
            .unwrap_or_default();
        for listener in listeners {
            listener.join(STOP_TIMEOUT).await;
        }

        if let Some(sb) = self.serv_base() {
            if let Err(e) = sb.close().await {
                warn!(error = %e, "close servbase failed");
            }
        }
        info!("service stopped");
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sig) => {
            sig.recv().await;
        }
        Err(e) => {
            warn!(error = %e, "install SIGTERM handler failed");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}

/// 校验用户处理器名，`_` 前缀保留给内部处理器
pub fn validate_processor_name(name: &str) -> Result<()> {
    if name.is_empty() {
        error!("processor name empty");
        return Err(ServError::ProcessorName("processor name empty".to_string()));
    }
    if name.starts_with('_') {
        error!(processor = %name, "processor name can not prefix '_'");
        return Err(ServError::ProcessorName(
            "processor name can not prefix '_'".to_string(),
        ));
    }
    Ok(())
}

static SERVICE: Lazy<Service> = Lazy::new(Service::new);

fn etcd_config(etcds: Vec<String>, base_loc: &str) -> EtcdConfig {
    EtcdConfig::new(etcds, base_loc)
}

/// 解析命令行参数，启动服务并阻塞
pub async fn serve<F, Fut>(
    etcds: Vec<String>,
    base_loc: &str,
    initfn: F,
    procs: Processors,
) -> Result<()>
where
    F: FnOnce(Arc<dyn ServBase>) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    SERVICE
        .serve(&etcd_config(etcds, base_loc), initfn, procs)
        .await
}

/// 使用给定参数启动服务并阻塞
#[allow(clippy::too_many_arguments)]
pub async fn init<F, Fut>(
    etcds: Vec<String>,
    base_loc: &str,
    serv_loc: &str,
    serv_key: &str,
    log_dir: &str,
    initfn: F,
    procs: Processors,
) -> Result<()>
where
    F: FnOnce(Arc<dyn ServBase>) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let args = CmdArgs {
        serv_loc: serv_loc.to_string(),
        sess_key: serv_key.to_string(),
        log_dir: log_dir.to_string(),
        ..CmdArgs::default()
    };
    args.validate()?;
    SERVICE
        .init(&etcd_config(etcds, base_loc), &args, initfn, procs)
        .await
}

/// 测试环境启动：服务位置 `test/test`，会话 key `test`，日志输出到控制台，没有用户处理器
///
/// 启动完成后立即返回，退出时调用 [`shutdown`]。
pub async fn test<F, Fut>(etcds: Vec<String>, base_loc: &str, initfn: F) -> Result<()>
where
    F: FnOnce(Arc<dyn ServBase>) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let args = test_args();
    let etcd = etcd_config(etcds, base_loc);
    let sb = ServBaseV2::connect(&etcd, &args.serv_loc, &args.sess_key)
        .await
        .inspect_err(|e| error!(error = %e, "init test servbase failed"))?;
    SERVICE
        .start(Arc::new(sb), &args, initfn, Processors::new())
        .await
}

fn test_args() -> CmdArgs {
    CmdArgs {
        serv_loc: "test/test".to_string(),
        sess_key: "test".to_string(),
        log_dir: crate::tracing::CONSOLE_LOG_DIR.to_string(),
        ..CmdArgs::default()
    }
}

/// 替换 gin 处理器的路由
pub fn reload_router(processor: &str, router: axum::Router) -> Result<()> {
    SERVICE.reload_router(processor, router)
}

/// 全局服务退出：唤醒阻塞中的 `init`/`serve`，停止监听并关闭会话
pub async fn shutdown() {
    SERVICE.shutdown();
    SERVICE.stop().await;
}

/// 全局服务的注册中心
pub fn get_serv_base() -> Option<Arc<dyn ServBase>> {
    SERVICE.serv_base()
}

/// 服务位置，未启动时为空
pub fn get_serv_name() -> String {
    get_serv_base()
        .map(|sb| sb.servname().to_string())
        .unwrap_or_default()
}

/// 实例 ID，未启动时为 0
pub fn get_serv_id() -> i64 {
    get_serv_base().map(|sb| sb.servid()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_processor_name() {
        assert!(validate_processor_name("api").is_ok());
        assert_eq!(
            validate_processor_name("").unwrap_err().to_string(),
            "processor name empty"
        );
        assert_eq!(
            validate_processor_name("_PROC_X").unwrap_err().to_string(),
            "processor name can not prefix '_'"
        );
    }

    #[test]
    fn test_test_args() {
        let args = test_args();
        assert_eq!(args.serv_loc, "test/test");
        assert_eq!(args.sess_key, "test");
        assert_eq!(args.log_dir, "console");
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_reload_unknown_processor() {
        let service = Service::new();
        let err = service
            .reload_router("missing", axum::Router::new())
            .unwrap_err();
        assert_eq!(err.to_string(), "processor:missing driver not recognition");
    }

    #[test]
    fn test_global_accessors_before_start() {
        assert!(get_serv_base().is_none());
        assert_eq!(get_serv_name(), "");
        assert_eq!(get_serv_id(), 0);
    }
}
