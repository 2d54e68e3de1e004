//! 测试辅助工具
//!
//! 供单元测试与 `tests/` 集成测试共用。

use std::sync::{Arc, Mutex};

use crate::database::Database;
use crate::local_store::LocalStore;
use crate::sync::SyncRequester;
use crate::sync_meta::{EntityType, OwnerContext};

/// 单连接内存数据库上的本地存储
///
/// # Panics
/// 内存数据库无法打开时 panic（仅测试使用）
pub fn memory_store() -> LocalStore {
    match Database::in_memory() {
        Ok(db) => LocalStore::new(Arc::new(db)),
        Err(e) => panic!("failed to open in-memory database: {e}"),
    }
}

/// 只记录、不调度的同步请求器
#[derive(Default)]
pub struct RecordingRequester {
    requests: Mutex<Vec<(EntityType, OwnerContext)>>,
}

impl RecordingRequester {
    pub fn requests(&self) -> Vec<(EntityType, OwnerContext)> {
        self.lock().clone()
    }

    pub fn entities(&self) -> Vec<EntityType> {
        self.lock().iter().map(|(entity, _)| *entity).collect()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(EntityType, OwnerContext)>> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SyncRequester for RecordingRequester {
    fn request_sync(&self, entity: EntityType, owner: &OwnerContext) {
        self.lock().push((entity, owner.clone()));
    }
}
