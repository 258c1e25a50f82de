//! etcd 存储实现
//!
//! 连接时申请一个租约作为实例会话，后台任务定期续约；会话 key 全部挂在该租约上。
//! 续约失败时退避重试，租约过期则重新申请并通过 `session_changes` 通知上层重新写入会话 key。

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, GetOptions, PutOptions, Txn, TxnOp,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::store::{KvStore, Lease};
use crate::error::{Result, ServError};

/// 默认租约 TTL（秒）
pub const DEFAULT_LEASE_TTL: i64 = 10;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// 续约重试的起始与最大间隔
const RETRY_MIN_BACKOFF: Duration = Duration::from_millis(200);
const RETRY_MAX_BACKOFF: Duration = Duration::from_secs(5);

/// etcd KV 存储
pub struct EtcdStore {
    client: Client,
    lease_id: Arc<AtomicI64>,
    changes: watch::Sender<u64>,
    keepalive: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for EtcdStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtcdStore")
            .field("lease_id", &self.lease_id())
            .finish()
    }
}

impl EtcdStore {
    /// 连接 etcd 并建立会话租约
    pub async fn connect(endpoints: &[String], ttl: i64) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(ServError::InvalidArgument(
                "etcd endpoints empty".to_string(),
            ));
        }

        let options = ConnectOptions::new()
            .with_connect_timeout(CONNECT_TIMEOUT)
            .with_timeout(CONNECT_TIMEOUT);
        let mut client = Client::connect(endpoints, Some(options)).await?;

        let lease_id = Arc::new(AtomicI64::new(client.lease_grant(ttl, None).await?.id()));
        let changes = watch::Sender::new(0);
        let keepalive = tokio::spawn(keep_lease(
            client.clone(),
            lease_id.clone(),
            ttl,
            changes.clone(),
        ));

        info!(
            endpoints = ?endpoints,
            lease_id = lease_id.load(Ordering::SeqCst),
            ttl = ttl,
            "etcd session established"
        );

        Ok(Self {
            client,
            lease_id,
            changes,
            keepalive: Mutex::new(Some(keepalive)),
        })
    }

    /// 当前租约 ID
    pub fn lease_id(&self) -> i64 {
        self.lease_id.load(Ordering::SeqCst)
    }

    fn put_options(&self, lease: Lease) -> Option<PutOptions> {
        match lease {
            Lease::None => None,
            Lease::Session => Some(PutOptions::new().with_lease(self.lease_id())),
        }
    }

    fn stop_keepalive(&self) {
        if let Ok(mut guard) = self.keepalive.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

impl Drop for EtcdStore {
    fn drop(&mut self) {
        self.stop_keepalive();
    }
}

/// 下一次重试间隔
fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(RETRY_MAX_BACKOFF)
}

/// 续约任务：连接错误退避重试，租约过期时重新申请
async fn keep_lease(
    mut client: Client,
    lease_id: Arc<AtomicI64>,
    ttl: i64,
    changes: watch::Sender<u64>,
) {
    let period = Duration::from_secs((ttl / 3).max(1) as u64);
    let mut backoff = RETRY_MIN_BACKOFF;

    loop {
        let current = lease_id.load(Ordering::SeqCst);
        let result = match renew_until_expired(&mut client, current, period).await {
            Ok(()) => client.lease_grant(ttl, None).await.map_err(ServError::from),
            Err(e) => Err(e),
        };

        match result {
            Ok(resp) => {
                lease_id.store(resp.id(), Ordering::SeqCst);
                changes.send_modify(|generation| *generation += 1);
                warn!(
                    old_lease_id = current,
                    lease_id = resp.id(),
                    "lease expired, new lease granted"
                );
                backoff = RETRY_MIN_BACKOFF;
            }
            Err(e) => {
                warn!(
                    lease_id = current,
                    error = %e,
                    retry_in = ?backoff,
                    "lease keepalive failed, retrying"
                );
                tokio::time::sleep(backoff).await;
                backoff = next_backoff(backoff);
            }
        }
    }
}

/// 按周期续约，直到租约过期（返回 Ok）或连接出错
async fn renew_until_expired(client: &mut Client, lease_id: i64, period: Duration) -> Result<()> {
    let (mut keeper, mut stream) = client.lease_keep_alive(lease_id).await?;
    let mut ticker = tokio::time::interval(period);
    loop {
        ticker.tick().await;
        keeper.keep_alive().await?;
        match stream.message().await? {
            Some(resp) if resp.ttl() > 0 => {
                debug!(lease_id = lease_id, ttl = resp.ttl(), "lease renewed");
            }
            Some(_) => return Ok(()),
            None => crate::bail_store!("lease {} keepalive stream closed", lease_id),
        }
    }
}

#[async_trait]
impl KvStore for EtcdStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut client = self.client.clone();
        let resp = client.get(key, None).await?;
        match resp.kvs().first() {
            Some(kv) => Ok(Some(kv.value_str()?.to_string())),
            None => Ok(None),
        }
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let mut client = self.client.clone();
        let options = GetOptions::new().with_prefix().with_sort(
            etcd_client::SortTarget::Key,
            etcd_client::SortOrder::Ascend,
        );
        let resp = client.get(prefix, Some(options)).await?;

        let mut out = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            out.push((kv.key_str()?.to_string(), kv.value_str()?.to_string()));
        }
        Ok(out)
    }

    async fn put(&self, key: &str, value: &str, lease: Lease) -> Result<()> {
        let mut client = self.client.clone();
        client.put(key, value, self.put_options(lease)).await?;
        Ok(())
    }

    async fn create(&self, key: &str, value: &str, lease: Lease) -> Result<bool> {
        let mut client = self.client.clone();
        let txn = Txn::new()
            .when(vec![Compare::create_revision(key, CompareOp::Equal, 0)])
            .and_then(vec![TxnOp::put(key, value, self.put_options(lease))]);
        let resp = client.txn(txn).await?;
        Ok(resp.succeeded())
    }

    async fn revoke_session(&self) -> Result<()> {
        self.stop_keepalive();
        let lease_id = self.lease_id();
        let mut client = self.client.clone();
        client.lease_revoke(lease_id).await?;
        info!(lease_id = lease_id, "etcd session revoked");
        Ok(())
    }

    fn session_changes(&self) -> Option<watch::Receiver<u64>> {
        Some(self.changes.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints() -> Vec<String> {
        std::env::var("FLARE_ETCD_ENDPOINTS")
            .unwrap_or_else(|_| "http://127.0.0.1:2379".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    fn test_prefix(name: &str) -> String {
        format!(
            "/flare-test/{}/{}/",
            name,
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        )
    }

    #[test]
    fn test_backoff_grows_to_cap() {
        let mut backoff = RETRY_MIN_BACKOFF;
        for _ in 0..10 {
            backoff = next_backoff(backoff);
        }
        assert_eq!(backoff, RETRY_MAX_BACKOFF);
        assert_eq!(next_backoff(RETRY_MIN_BACKOFF), Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_connect_requires_endpoints() {
        assert!(matches!(
            EtcdStore::connect(&[], DEFAULT_LEASE_TTL).await,
            Err(ServError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    #[ignore] // 需要 etcd
    async fn test_create_only_when_absent() {
        let store = EtcdStore::connect(&endpoints(), DEFAULT_LEASE_TTL)
            .await
            .unwrap();
        let key = format!("{}id", test_prefix("create"));

        assert!(store.create(&key, "1", Lease::None).await.unwrap());
        assert!(!store.create(&key, "2", Lease::None).await.unwrap());
        assert_eq!(store.get(&key).await.unwrap().as_deref(), Some("1"));
        store.revoke_session().await.unwrap();
    }

    #[tokio::test]
    #[ignore] // 需要 etcd
    async fn test_get_prefix_sorted() {
        let store = EtcdStore::connect(&endpoints(), DEFAULT_LEASE_TTL)
            .await
            .unwrap();
        let prefix = test_prefix("prefix");
        store.put(&format!("{}b", prefix), "2", Lease::Session).await.unwrap();
        store.put(&format!("{}a", prefix), "1", Lease::Session).await.unwrap();

        let kvs = store.get_prefix(&prefix).await.unwrap();
        assert_eq!(
            kvs,
            vec![
                (format!("{}a", prefix), "1".to_string()),
                (format!("{}b", prefix), "2".to_string()),
            ]
        );
        store.revoke_session().await.unwrap();
    }

    #[tokio::test]
    #[ignore] // 需要 etcd
    async fn test_revoke_removes_leased_keys_only() {
        let store = EtcdStore::connect(&endpoints(), DEFAULT_LEASE_TTL)
            .await
            .unwrap();
        let prefix = test_prefix("revoke");
        let persist = format!("{}persist", prefix);
        let leased = format!("{}leased", prefix);
        store.put(&persist, "1", Lease::None).await.unwrap();
        assert!(store.create(&leased, "2", Lease::Session).await.unwrap());

        store.revoke_session().await.unwrap();

        let other = EtcdStore::connect(&endpoints(), DEFAULT_LEASE_TTL)
            .await
            .unwrap();
        assert!(other.get(&leased).await.unwrap().is_none());
        assert_eq!(other.get(&persist).await.unwrap().as_deref(), Some("1"));
        other.revoke_session().await.unwrap();
    }
}
