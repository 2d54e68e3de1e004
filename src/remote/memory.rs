//! 进程内远端存储
//!
//! 文档保存在内存中。支持故障注入：离线开关、让第 N 个请求失败、
//! 让接下来的 N 个请求失败，以及人为延迟。

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, error};

use super::{DocumentPath, RemoteError, RemoteResult, RemoteStore};
use crate::sync_meta::EntityType;

/// 安全地获取 Mutex 锁，在中毒时恢复锁并返回 guard
fn safe_lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            error!(
                "[Remote::Memory] Mutex poisoned! Attempting recovery for type: {:?}",
                std::any::type_name::<T>()
            );
            poisoned.into_inner()
        }
    }
}

/// 调用计数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteCallStats {
    /// 全部请求（含失败）
    pub requests: u64,
    pub puts: u64,
    pub deletes: u64,
    pub gets: u64,
    pub failures: u64,
}

#[derive(Default)]
struct FaultPlan {
    /// 该序号（从 1 开始的全局请求序号）的请求失败
    fail_at: Vec<u64>,
    /// 接下来还要失败的请求数
    fail_next: u64,
    latency: Option<Duration>,
}

/// 进程内远端存储
#[derive(Default)]
pub struct MemoryRemoteStore {
    documents: Mutex<BTreeMap<DocumentPath, Value>>,
    offline: AtomicBool,
    faults: Mutex<FaultPlan>,
    stats: Mutex<RemoteCallStats>,
    sequence: AtomicU64,
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 模拟断网：所有请求返回网络错误
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// 让从现在起的第 `n` 个请求失败（n 从 1 开始）
    pub fn fail_nth_request(&self, n: u64) {
        let target = self.sequence.load(Ordering::SeqCst) + n.max(1);
        safe_lock(&self.faults).fail_at.push(target);
    }

    /// 让接下来的 `count` 个请求失败
    pub fn fail_next_requests(&self, count: u64) {
        safe_lock(&self.faults).fail_next = count;
    }

    /// 每个请求的人为延迟
    pub fn set_latency(&self, latency: Option<Duration>) {
        safe_lock(&self.faults).latency = latency;
    }

    pub fn stats(&self) -> RemoteCallStats {
        *safe_lock(&self.stats)
    }

    pub fn document(&self, path: &DocumentPath) -> Option<Value> {
        safe_lock(&self.documents).get(path).cloned()
    }

    /// 某所有者某集合下的全部文档，按 id 升序
    pub fn documents(&self, owner_id: &str, entity: EntityType) -> Vec<(i64, Value)> {
        safe_lock(&self.documents)
            .iter()
            .filter(|(path, _)| path.owner_id == owner_id && path.collection == entity.collection())
            .map(|(path, doc)| (path.id, doc.clone()))
            .collect()
    }

    pub fn document_count(&self) -> usize {
        safe_lock(&self.documents).len()
    }

    /// 直接写入文档（不计数、不注入故障）
    pub fn seed_document(&self, path: DocumentPath, document: Value) {
        safe_lock(&self.documents).insert(path, document);
    }

    /// 请求入口：计数、延迟、故障注入
    async fn begin_request(&self, op: &str, path: &DocumentPath) -> RemoteResult<()> {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        safe_lock(&self.stats).requests += 1;

        let latency = safe_lock(&self.faults).latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let injected = {
            let mut faults = safe_lock(&self.faults);
            if faults.fail_next > 0 {
                faults.fail_next -= 1;
                true
            } else if let Some(pos) = faults.fail_at.iter().position(|n| *n == seq) {
                faults.fail_at.swap_remove(pos);
                true
            } else {
                false
            }
        };

        let failure = if self.offline.load(Ordering::SeqCst) {
            Some(RemoteError::Network("remote store unreachable".into()))
        } else if injected {
            Some(RemoteError::Network(format!("injected failure on request #{seq}")))
        } else {
            None
        };

        match failure {
            Some(err) => {
                safe_lock(&self.stats).failures += 1;
                debug!("[Remote::Memory] {} {} failed: {}", op, path, err);
                Err(err)
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    fn provider_name(&self) -> &'static str {
        "Memory"
    }

    async fn check_connection(&self) -> RemoteResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(RemoteError::Network("remote store unreachable".into()))
        } else {
            Ok(())
        }
    }

    async fn put_document(&self, path: &DocumentPath, document: &Value) -> RemoteResult<()> {
        self.begin_request("PUT", path).await?;
        safe_lock(&self.documents).insert(path.clone(), document.clone());
        safe_lock(&self.stats).puts += 1;
        Ok(())
    }

    async fn delete_document(&self, path: &DocumentPath) -> RemoteResult<()> {
        self.begin_request("DELETE", path).await?;
        safe_lock(&self.documents).remove(path);
        safe_lock(&self.stats).deletes += 1;
        Ok(())
    }

    async fn get_document(&self, path: &DocumentPath) -> RemoteResult<Option<Value>> {
        self.begin_request("GET", path).await?;
        safe_lock(&self.stats).gets += 1;
        Ok(self.document(path))
    }
}
