//! 注册中心 KV 存储抽象
//!
//! `ServBaseV2` 只依赖这里的少量操作，生产环境使用 etcd，测试与本地运行使用内存实现。

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::{Result, ServError};

/// key 的生命周期
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lease {
    /// 持久 key
    None,
    /// 绑定当前会话，会话撤销后删除
    Session,
}

/// KV 存储
#[async_trait]
pub trait KvStore: Send + Sync {
    /// 读取单个 key
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// 按前缀读取，结果按 key 排序
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>>;

    /// 写入（覆盖）
    async fn put(&self, key: &str, value: &str, lease: Lease) -> Result<()>;

    /// 不存在时写入，返回是否写入成功
    async fn create(&self, key: &str, value: &str, lease: Lease) -> Result<bool>;

    /// 撤销会话，删除所有会话 key
    async fn revoke_session(&self) -> Result<()>;

    /// 会话重建通知：会话丢失并重新建立后计数加一，会话 key 需要重新写入
    fn session_changes(&self) -> Option<watch::Receiver<u64>> {
        None
    }
}

#[derive(Debug)]
struct Entry {
    value: String,
    session: Option<u64>,
}

/// 内存 KV 存储
///
/// 同一份数据可以被多个会话共享（`new_session`），用于模拟多个实例。
#[derive(Debug)]
pub struct MemoryStore {
    data: Arc<Mutex<BTreeMap<String, Entry>>>,
    next_session: Arc<AtomicU64>,
    session: u64,
    revoked: AtomicBool,
    changes: watch::Sender<u64>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            data: Arc::new(Mutex::new(BTreeMap::new())),
            next_session: Arc::new(AtomicU64::new(2)),
            session: 1,
            revoked: AtomicBool::new(false),
            changes: watch::Sender::new(0),
        }
    }

    /// 共享数据、拥有独立会话的新句柄
    pub fn new_session(&self) -> Self {
        Self {
            data: self.data.clone(),
            next_session: self.next_session.clone(),
            session: self.next_session.fetch_add(1, Ordering::SeqCst),
            revoked: AtomicBool::new(false),
            changes: watch::Sender::new(0),
        }
    }

    /// 模拟会话过期：删除本会话的 key，随后以新会话继续
    pub fn expire_session(&self) -> Result<()> {
        let session = self.session;
        self.lock()?.retain(|_, e| e.session != Some(session));
        self.changes.send_modify(|generation| *generation += 1);
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<String, Entry>>> {
        self.data
            .lock()
            .map_err(|_| ServError::Store("memory store poisoned".to_string()))
    }

    fn entry(&self, value: &str, lease: Lease) -> Result<Entry> {
        let session = match lease {
            Lease::None => None,
            Lease::Session => {
                if self.revoked.load(Ordering::SeqCst) {
                    return Err(ServError::Store("session revoked".to_string()));
                }
                Some(self.session)
            }
        };
        Ok(Entry {
            value: value.to_string(),
            session,
        })
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lock()?.get(key).map(|e| e.value.clone()))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let data = self.lock()?;
        Ok(data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect())
    }

    async fn put(&self, key: &str, value: &str, lease: Lease) -> Result<()> {
        let entry = self.entry(value, lease)?;
        self.lock()?.insert(key.to_string(), entry);
        Ok(())
    }

    async fn create(&self, key: &str, value: &str, lease: Lease) -> Result<bool> {
        let entry = self.entry(value, lease)?;
        let mut data = self.lock()?;
        if data.contains_key(key) {
            return Ok(false);
        }
        data.insert(key.to_string(), entry);
        Ok(true)
    }

    async fn revoke_session(&self) -> Result<()> {
        self.revoked.store(true, Ordering::SeqCst);
        let session = self.session;
        self.lock()?.retain(|_, e| e.session != Some(session));
        Ok(())
    }

    fn session_changes(&self) -> Option<watch::Receiver<u64>> {
        Some(self.changes.subscribe())
    }
}
