//! 服务注册模块
//!
//! `ServBase` 是启动层依赖的注册中心接口：发布监听地址、读取服务配置、提供实例元信息。
//! `ServBaseV2` 基于 `KvStore` 实现该接口，key 布局如下（`B` 为根路径，`L` 为服务位置，`N` 为实例 ID）：
//!
//! ```text
//! B/ids/L/N         -> <skey>     持久，ID 占用记录，先于 skey 映射写入
//! B/skey/L/<skey>   -> N          持久，同一 skey 总是拿到同一个 ID
//! B/lock/L/N        -> <skey>     会话，防止两个存活实例使用同一个 ID
//! B/dist/L/N        -> RegData    会话，服务监听地址
//! B/backdoor/L/N    -> RegData    会话，后门地址
//! B/metrics/L/N     -> RegData    会话，指标地址
//! B/conf/L          -> 配置文档（TOML 或 JSON）
//! ```
//!
//! 会话丢失并重建后，lock 与已发布的注册记录会重新写入。

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{EtcdConfig, parse_document};
use crate::error::{Result, ServError};

pub mod etcd;
pub mod store;

pub use etcd::{DEFAULT_LEASE_TTL, EtcdStore};
pub use store::{KvStore, Lease, MemoryStore};

/// 分配 ID 时的最大尝试次数
const MAX_ALLOC_RETRIES: usize = 32;

/// 服务监听信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServInfo {
    /// 处理器类型（http / thrift / gprc / gin）
    #[serde(rename = "type")]
    pub kind: String,
    /// 对外地址
    pub addr: String,
}

impl ServInfo {
    pub fn new(kind: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            addr: addr.into(),
        }
    }
}

/// 注册记录
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegData {
    pub servs: BTreeMap<String, ServInfo>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group: String,
}

/// 注册中心接口
#[async_trait]
pub trait ServBase: Send + Sync {
    /// 注册服务监听地址
    async fn register_service(&self, infos: &HashMap<String, ServInfo>) -> Result<()>;

    /// 注册后门地址
    async fn register_backdoor(&self, infos: &HashMap<String, ServInfo>) -> Result<()>;

    /// 注册指标地址
    async fn register_metrics(&self, infos: &HashMap<String, ServInfo>) -> Result<()>;

    /// 服务配置文档，未配置时返回 None
    async fn serv_config_value(&self) -> Result<Option<toml::Value>>;

    /// 设置分组，已注册的服务记录会重新发布
    async fn set_group(&self, group: &str) -> Result<()>;

    /// 服务位置
    fn servname(&self) -> &str;

    /// 实例 ID
    fn servid(&self) -> i64;

    /// 实例名（服务名末段 + ID）
    fn copyname(&self) -> String;

    /// 当前分组
    fn group(&self) -> String;

    /// 撤销会话，注销所有会话 key
    async fn close(&self) -> Result<()>;
}

/// 注册目标
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Dist,
    Backdoor,
    Metrics,
}

impl Target {
    fn dir(self) -> &'static str {
        match self {
            Target::Dist => "dist",
            Target::Backdoor => "backdoor",
            Target::Metrics => "metrics",
        }
    }
}

/// 基于 KV 存储的注册中心实现
pub struct ServBaseV2 {
    store: Arc<dyn KvStore>,
    base_loc: String,
    serv_loc: String,
    sess_key: String,
    servid: i64,
    group: RwLock<String>,
    services: RwLock<Option<BTreeMap<String, ServInfo>>>,
    /// 已发布的会话记录（key -> value），会话重建后重新写入
    published: Arc<Mutex<BTreeMap<String, String>>>,
    restorer: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for ServBaseV2 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServBaseV2")
            .field("base_loc", &self.base_loc)
            .field("serv_loc", &self.serv_loc)
            .field("servid", &self.servid)
            .finish()
    }
}

impl ServBaseV2 {
    /// 连接 etcd 并建立实例会话
    pub async fn connect(etcd: &EtcdConfig, serv_loc: &str, sess_key: &str) -> Result<Self> {
        let store = EtcdStore::connect(&etcd.endpoints, DEFAULT_LEASE_TTL).await?;
        Self::with_store(Arc::new(store), &etcd.base_loc, serv_loc, sess_key).await
    }

    /// 在给定存储上建立实例会话
    pub async fn with_store(
        store: Arc<dyn KvStore>,
        base_loc: &str,
        serv_loc: &str,
        sess_key: &str,
    ) -> Result<Self> {
        let serv_loc = serv_loc.trim_matches('/');
        if serv_loc.is_empty() {
            return Err(ServError::InvalidArgument("serv location empty".to_string()));
        }
        if sess_key.is_empty() || sess_key.contains('/') {
            return Err(ServError::InvalidArgument(format!(
                "invalid session key: {:?}",
                sess_key
            )));
        }

        let base_loc = format!("/{}", base_loc.trim_matches('/'));
        let servid = alloc_servid(store.as_ref(), &base_loc, serv_loc, sess_key).await?;

        let lock_key = format!("{}/lock/{}/{}", base_loc, serv_loc, servid);
        if !store.create(&lock_key, sess_key, Lease::Session).await? {
            return Err(ServError::SessionKeyInUse {
                serv_loc: serv_loc.to_string(),
                skey: sess_key.to_string(),
                servid,
            });
        }

        info!(
            base = %base_loc,
            serv = %serv_loc,
            servid = servid,
            "service base session ready"
        );

        let published = Arc::new(Mutex::new(BTreeMap::new()));
        let restorer = store.session_changes().map(|changes| {
            tokio::spawn(restore_on_change(
                store.clone(),
                changes,
                lock_key,
                sess_key.to_string(),
                published.clone(),
            ))
        });

        Ok(Self {
            store,
            base_loc,
            serv_loc: serv_loc.to_string(),
            sess_key: sess_key.to_string(),
            servid,
            group: RwLock::new(String::new()),
            services: RwLock::new(None),
            published,
            restorer: Mutex::new(restorer),
            closed: AtomicBool::new(false),
        })
    }

    /// 注册 key
    fn reg_key(&self, target: Target) -> String {
        format!(
            "{}/{}/{}/{}",
            self.base_loc,
            target.dir(),
            self.serv_loc,
            self.servid
        )
    }

    /// 配置 key
    pub fn conf_key(&self) -> String {
        format!("{}/conf/{}", self.base_loc, self.serv_loc)
    }

    /// 会话 key
    pub fn sess_key(&self) -> &str {
        &self.sess_key
    }

    async fn publish(&self, target: Target, servs: BTreeMap<String, ServInfo>) -> Result<()> {
        let data = RegData {
            servs,
            group: self.group(),
        };
        let value = serde_json::to_string(&data)?;
        let key = self.reg_key(target);
        if let Ok(mut guard) = self.published.lock() {
            guard.insert(key.clone(), value.clone());
        }
        self.store.put(&key, &value, Lease::Session).await?;
        info!(key = %key, value = %value, "registered");
        Ok(())
    }

    fn stop_restorer(&self) {
        if let Ok(mut guard) = self.restorer.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

impl Drop for ServBaseV2 {
    fn drop(&mut self) {
        self.stop_restorer();
    }
}

/// 等待会话重建通知，重新写入 lock 与注册记录
async fn restore_on_change(
    store: Arc<dyn KvStore>,
    mut changes: watch::Receiver<u64>,
    lock_key: String,
    sess_key: String,
    published: Arc<Mutex<BTreeMap<String, String>>>,
) {
    while changes.changed().await.is_ok() {
        if let Err(e) = restore_session(store.as_ref(), &lock_key, &sess_key, &published).await {
            error!(lock = %lock_key, error = %e, "service base session restore failed");
        }
    }
}

async fn restore_session(
    store: &dyn KvStore,
    lock_key: &str,
    sess_key: &str,
    published: &Mutex<BTreeMap<String, String>>,
) -> Result<()> {
    if !store.create(lock_key, sess_key, Lease::Session).await? {
        crate::bail_store!("lock {} taken while session was lost", lock_key);
    }

    let records: Vec<(String, String)> = published
        .lock()
        .map(|guard| guard.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default();
    for (key, value) in &records {
        store.put(key, value, Lease::Session).await?;
    }
    info!(lock = %lock_key, records = records.len(), "service base session restored");
    Ok(())
}

/// 分配或复用实例 ID
///
/// 先用 create-if-absent 占用 `ids/N`，成功后才写入 `skey -> N`；
/// 同一 skey 的并发实例以先写入的映射为准。
async fn alloc_servid(
    store: &dyn KvStore,
    base_loc: &str,
    serv_loc: &str,
    sess_key: &str,
) -> Result<i64> {
    let skey_prefix = format!("{}/skey/{}/", base_loc, serv_loc);
    let skey_key = format!("{}{}", skey_prefix, sess_key);
    if let Some(raw) = store.get(&skey_key).await? {
        return parse_servid(&skey_key, &raw);
    }

    let ids_prefix = format!("{}/ids/{}/", base_loc, serv_loc);
    let mut next = max_servid(store, &skey_prefix, &ids_prefix).await? + 1;

    for _ in 0..MAX_ALLOC_RETRIES {
        let id_key = format!("{}{}", ids_prefix, next);
        if !store.create(&id_key, sess_key, Lease::None).await? {
            debug!(key = %id_key, "servid taken, trying next");
            next = (next + 1).max(max_servid(store, &skey_prefix, &ids_prefix).await? + 1);
            continue;
        }

        if store.create(&skey_key, &next.to_string(), Lease::None).await? {
            return Ok(next);
        }

        // 同一 skey 的另一个实例先写入了映射
        warn!(key = %skey_key, claimed = next, "session key mapped concurrently");
        return match store.get(&skey_key).await? {
            Some(raw) => parse_servid(&skey_key, &raw),
            None => crate::bail_store!("session key {} vanished during allocation", skey_key),
        };
    }

    crate::bail_store!(
        "allocate servid for {} exceeded {} retries",
        skey_key,
        MAX_ALLOC_RETRIES
    )
}

/// 已分配的最大 ID（ID 占用记录与 skey 映射取最大）
async fn max_servid(store: &dyn KvStore, skey_prefix: &str, ids_prefix: &str) -> Result<i64> {
    let mut max_id = 0;
    for (k, v) in store.get_prefix(skey_prefix).await? {
        max_id = max_id.max(parse_servid(&k, &v)?);
    }
    for (k, _) in store.get_prefix(ids_prefix).await? {
        let id = k.strip_prefix(ids_prefix).unwrap_or(&k);
        max_id = max_id.max(parse_servid(&k, id)?);
    }
    Ok(max_id)
}

fn parse_servid(key: &str, raw: &str) -> Result<i64> {
    raw.trim()
        .parse::<i64>()
        .map_err(|_| ServError::Store(format!("invalid servid {:?} at {}", raw, key)))
}

fn to_sorted(infos: &HashMap<String, ServInfo>) -> BTreeMap<String, ServInfo> {
    infos
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

#[async_trait]
impl ServBase for ServBaseV2 {
    async fn register_service(&self, infos: &HashMap<String, ServInfo>) -> Result<()> {
        let servs = to_sorted(infos);
        self.publish(Target::Dist, servs.clone()).await?;
        if let Ok(mut guard) = self.services.write() {
            *guard = Some(servs);
        }
        Ok(())
    }

    async fn register_backdoor(&self, infos: &HashMap<String, ServInfo>) -> Result<()> {
        self.publish(Target::Backdoor, to_sorted(infos)).await
    }

    async fn register_metrics(&self, infos: &HashMap<String, ServInfo>) -> Result<()> {
        self.publish(Target::Metrics, to_sorted(infos)).await
    }

    async fn serv_config_value(&self) -> Result<Option<toml::Value>> {
        match self.store.get(&self.conf_key()).await? {
            Some(raw) if !raw.trim().is_empty() => Ok(Some(parse_document(&raw)?)),
            _ => Ok(None),
        }
    }

    async fn set_group(&self, group: &str) -> Result<()> {
        if let Ok(mut guard) = self.group.write() {
            *guard = group.to_string();
        }

        let registered = self
            .services
            .read()
            .ok()
            .and_then(|guard| guard.clone());
        match registered {
            Some(servs) => self.publish(Target::Dist, servs).await,
            None => Ok(()),
        }
    }

    fn servname(&self) -> &str {
        &self.serv_loc
    }

    fn servid(&self) -> i64 {
        self.servid
    }

    fn copyname(&self) -> String {
        let short = self.serv_loc.rsplit('/').next().unwrap_or(&self.serv_loc);
        format!("{}{}", short, self.servid)
    }

    fn group(&self) -> String {
        self.group
            .read()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.stop_restorer();
        self.store.revoke_session().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_base(store: &Arc<MemoryStore>, skey: &str) -> Result<ServBaseV2> {
        ServBaseV2::with_store(store.clone(), "/flare", "base/account", skey).await
    }

    /// 每次读取后让出执行权，使并发启动的实例交错执行
    struct YieldingStore(MemoryStore);

    #[async_trait]
    impl KvStore for YieldingStore {
        async fn get(&self, key: &str) -> Result<Option<String>> {
            let value = self.0.get(key).await;
            tokio::task::yield_now().await;
            value
        }

        async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
            let kvs = self.0.get_prefix(prefix).await;
            tokio::task::yield_now().await;
            kvs
        }

        async fn put(&self, key: &str, value: &str, lease: Lease) -> Result<()> {
            self.0.put(key, value, lease).await
        }

        async fn create(&self, key: &str, value: &str, lease: Lease) -> Result<bool> {
            self.0.create(key, value, lease).await
        }

        async fn revoke_session(&self) -> Result<()> {
            self.0.revoke_session().await
        }
    }

    async fn yielding_base(shared: &MemoryStore, skey: &str) -> Result<ServBaseV2> {
        let store = Arc::new(YieldingStore(shared.new_session()));
        ServBaseV2::with_store(store, "/flare", "base/account", skey).await
    }

    #[tokio::test]
    async fn test_concurrent_distinct_skeys_get_distinct_ids() {
        let shared = MemoryStore::new();
        let (alpha, beta) = tokio::join!(
            yielding_base(&shared, "alpha"),
            yielding_base(&shared, "beta")
        );
        let (alpha, beta) = (alpha.unwrap(), beta.unwrap());
        assert_ne!(alpha.servid(), beta.servid());

        for sb in [&alpha, &beta] {
            let key = format!("/flare/skey/base/account/{}", sb.sess_key());
            let mapped = shared.get(&key).await.unwrap().unwrap();
            assert_eq!(mapped, sb.servid().to_string());
            let claim = format!("/flare/ids/base/account/{}", sb.servid());
            assert_eq!(shared.get(&claim).await.unwrap().as_deref(), Some(sb.sess_key()));
        }

        // 重启后复用原 ID
        let beta_id = beta.servid();
        beta.close().await.unwrap();
        let again = yielding_base(&shared, "beta").await.unwrap();
        assert_eq!(again.servid(), beta_id);
    }

    #[tokio::test]
    async fn test_concurrent_same_skey_shares_one_id() {
        let shared = MemoryStore::new();
        let (first, second) = tokio::join!(
            yielding_base(&shared, "alpha"),
            yielding_base(&shared, "alpha")
        );

        let (winner, loser) = match (first, second) {
            (Ok(sb), Err(e)) | (Err(e), Ok(sb)) => (sb, e),
            other => panic!("expected exactly one live instance, got {:?}", other),
        };
        let id = winner.servid();
        assert!(matches!(loser, ServError::SessionKeyInUse { servid, .. } if servid == id));
        assert_eq!(
            shared.get("/flare/skey/base/account/alpha").await.unwrap(),
            Some(id.to_string())
        );
    }

    #[tokio::test]
    async fn test_allocation_skips_claimed_ids() {
        let store = Arc::new(MemoryStore::new());
        store
            .put("/flare/ids/base/account/1", "ghost", Lease::None)
            .await
            .unwrap();
        store
            .put("/flare/skey/base/account/old", "3", Lease::None)
            .await
            .unwrap();

        let sb = memory_base(&store, "alpha").await.unwrap();
        assert_eq!(sb.servid(), 4);
    }

    #[tokio::test]
    async fn test_session_loss_restores_registration() {
        let store = Arc::new(MemoryStore::new());
        let sb = memory_base(&store, "alpha").await.unwrap();

        let mut infos = HashMap::new();
        infos.insert("api".to_string(), ServInfo::new("http", "10.0.0.1:8080"));
        sb.register_service(&infos).await.unwrap();
        sb.register_metrics(&infos).await.unwrap();

        store.expire_session().unwrap();
        assert!(store.get("/flare/dist/base/account/1").await.unwrap().is_none());

        let mut restored = false;
        for _ in 0..100 {
            if store.get("/flare/dist/base/account/1").await.unwrap().is_some() {
                restored = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(restored);
        assert!(store.get("/flare/metrics/base/account/1").await.unwrap().is_some());
        assert_eq!(
            store.get("/flare/lock/base/account/1").await.unwrap().as_deref(),
            Some("alpha")
        );

        sb.close().await.unwrap();
        assert!(store.get("/flare/dist/base/account/1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let sb = memory_base(&store, "alpha").await.unwrap();
        sb.close().await.unwrap();
        sb.close().await.unwrap();
        assert!(store.get("/flare/lock/base/account/1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_servid_allocation_is_stable_per_skey() {
        let shared = MemoryStore::new();

        let first = Arc::new(shared.new_session());
        let sb = memory_base(&first, "alpha").await.unwrap();
        assert_eq!(sb.servid(), 1);
        sb.close().await.unwrap();

        let again = Arc::new(shared.new_session());
        let sb = memory_base(&again, "alpha").await.unwrap();
        assert_eq!(sb.servid(), 1);

        let other = Arc::new(shared.new_session());
        let sb2 = memory_base(&other, "beta").await.unwrap();
        assert_eq!(sb2.servid(), 2);
    }

    #[tokio::test]
    async fn test_same_skey_while_alive_collides() {
        let shared = MemoryStore::new();
        let first = Arc::new(shared.new_session());
        let _sb = memory_base(&first, "alpha").await.unwrap();

        let second = Arc::new(shared.new_session());
        let err = memory_base(&second, "alpha").await.unwrap_err();
        assert!(matches!(err, ServError::SessionKeyInUse { servid: 1, .. }));
    }

    #[tokio::test]
    async fn test_invalid_arguments() {
        let store = Arc::new(MemoryStore::new());
        assert!(matches!(
            ServBaseV2::with_store(store.clone(), "/flare", "", "k").await,
            Err(ServError::InvalidArgument(_))
        ));
        assert!(matches!(
            ServBaseV2::with_store(store, "/flare", "base/account", "").await,
            Err(ServError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_metadata() {
        let store = Arc::new(MemoryStore::new());
        let sb = memory_base(&store, "alpha").await.unwrap();
        assert_eq!(sb.servname(), "base/account");
        assert_eq!(sb.servid(), 1);
        assert_eq!(sb.copyname(), "account1");
        assert_eq!(sb.conf_key(), "/flare/conf/base/account");
    }

    #[tokio::test]
    async fn test_register_service_and_group() {
        let store = Arc::new(MemoryStore::new());
        let sb = memory_base(&store, "alpha").await.unwrap();

        let mut infos = HashMap::new();
        infos.insert("api".to_string(), ServInfo::new("http", "10.0.0.1:8080"));
        sb.register_service(&infos).await.unwrap();

        let raw = store.get("/flare/dist/base/account/1").await.unwrap().unwrap();
        let data: RegData = serde_json::from_str(&raw).unwrap();
        assert_eq!(data.servs["api"], ServInfo::new("http", "10.0.0.1:8080"));
        assert!(data.group.is_empty());

        sb.set_group("canary").await.unwrap();
        let raw = store.get("/flare/dist/base/account/1").await.unwrap().unwrap();
        let data: RegData = serde_json::from_str(&raw).unwrap();
        assert_eq!(data.group, "canary");
        assert_eq!(sb.group(), "canary");
    }

    #[tokio::test]
    async fn test_register_backdoor_and_metrics_keys() {
        let store = Arc::new(MemoryStore::new());
        let sb = memory_base(&store, "alpha").await.unwrap();

        let mut infos = HashMap::new();
        infos.insert("_PROC_BACKDOOR".to_string(), ServInfo::new("http", "h:60000"));
        sb.register_backdoor(&infos).await.unwrap();
        sb.register_metrics(&infos).await.unwrap();

        assert!(store.get("/flare/backdoor/base/account/1").await.unwrap().is_some());
        assert!(store.get("/flare/metrics/base/account/1").await.unwrap().is_some());

        sb.close().await.unwrap();
        assert!(store.get("/flare/backdoor/base/account/1").await.unwrap().is_none());
        assert!(store.get("/flare/skey/base/account/alpha").await.unwrap().is_some());
    }

    #[test]
    fn test_serv_info_json_shape() {
        let json = serde_json::to_string(&ServInfo::new("gprc", "1.2.3.4:5")).unwrap();
        assert_eq!(json, r#"{"type":"gprc","addr":"1.2.3.4:5"}"#);
    }

    #[tokio::test]
    async fn test_serv_config_value() {
        let store = Arc::new(MemoryStore::new());
        let sb = memory_base(&store, "alpha").await.unwrap();
        assert!(sb.serv_config_value().await.unwrap().is_none());

        store
            .put("/flare/conf/base/account", "[log]\nlevel = \"DEBUG\"\n", Lease::None)
            .await
            .unwrap();
        let value = sb.serv_config_value().await.unwrap().unwrap();
        assert_eq!(value["log"]["level"].as_str(), Some("DEBUG"));
    }
}
