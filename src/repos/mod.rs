//! Repository 层
//!
//! 所有写入都经由 Repository：先写本地存储（同时置脏），再请求同步。
//! Repository 从不直接访问远端，远端写入由对应实体类型的 Worker 独占。
//!
//! ## 核心方法
//! - `insert` / `update` / `delete`: 恰好一次本地写入 + 一次同步请求
//! - `get` / `list` / `observe`: 只返回该所有者下未删除的记录

mod test_repo;

pub use test_repo::TestRepo;

use futures::stream::{BoxStream, StreamExt};
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::debug;

use crate::entities::{Category, FlashCard, Lesson, Question, Summary};
use crate::local_store::{LocalStore, RecordFilter, SyncRecord};
use crate::models::{AppError, AppResult};
use crate::sync::SyncRequester;
use crate::sync_meta::{OwnerContext, SyncMeta};

pub type CategoryRepo = SyncRepo<Category>;
pub type LessonRepo = SyncRepo<Lesson>;
pub type FlashCardRepo = SyncRepo<FlashCard>;
pub type QuestionRepo = SyncRepo<Question>;
pub type SummaryRepo = SyncRepo<Summary>;

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// 通用可同步 Repository
pub struct SyncRepo<R: SyncRecord> {
    store: LocalStore,
    requester: Arc<dyn SyncRequester>,
    _record: PhantomData<fn() -> R>,
}

impl<R: SyncRecord> Clone for SyncRepo<R> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            requester: Arc::clone(&self.requester),
            _record: PhantomData,
        }
    }
}

impl<R: SyncRecord> SyncRepo<R> {
    pub fn new(store: LocalStore, requester: Arc<dyn SyncRequester>) -> Self {
        Self {
            store,
            requester,
            _record: PhantomData,
        }
    }

    pub(crate) fn store(&self) -> &LocalStore {
        &self.store
    }

    pub(crate) fn requester(&self) -> &Arc<dyn SyncRequester> {
        &self.requester
    }

    /// 新建记录
    ///
    /// `id <= 0` 时由本地存储分配；`id > 0` 时按 id 插入或整行替换。
    ///
    /// # Errors
    /// * `Unauthenticated` - 实体要求登录但当前匿名
    /// * `NotFound` - 同 id 的行属于其他所有者
    /// * `Database` - 本地写入失败
    pub fn insert(&self, owner: &OwnerContext, mut record: R) -> AppResult<R> {
        let owner_id = owner.owner_for_write(R::ENTITY)?;
        *record.meta_mut() = SyncMeta {
            owner_id: owner_id.to_string(),
            is_synced: false,
            is_deleted: false,
            local_version: 1,
        };
        record.touch(now_millis());

        self.store.insert_or_replace(&mut record)?;
        debug!("[Repo] Inserted {} {} for {}", R::ENTITY, record.id(), owner_id);
        self.requester.request_sync(R::ENTITY, owner);
        Ok(record)
    }

    /// 更新记录的业务字段
    ///
    /// # Errors
    /// 记录不存在、已删除或不属于该所有者时返回 `NotFound`
    pub fn update(&self, owner: &OwnerContext, mut record: R) -> AppResult<R> {
        let owner_id = owner.owner_for_write(R::ENTITY)?;
        if record.id() <= 0 {
            return Err(AppError::validation(format!(
                "{} must have an id to be updated",
                R::ENTITY
            )));
        }
        record.meta_mut().owner_id = owner_id.to_string();
        record.touch(now_millis());

        let version = self.store.update(&record)?;
        let meta = record.meta_mut();
        meta.is_synced = false;
        meta.is_deleted = false;
        meta.local_version = version;

        self.requester.request_sync(R::ENTITY, owner);
        Ok(record)
    }

    /// 删除记录（写入墓碑）
    ///
    /// 对已删除的记录重复调用是无操作的成功。
    pub fn delete(&self, owner: &OwnerContext, id: i64) -> AppResult<()> {
        let owner_id = owner.owner_for_write(R::ENTITY)?;
        if self.store.tombstone(R::ENTITY, owner_id, id)? {
            debug!("[Repo] Tombstoned {} {}", R::ENTITY, id);
            self.requester.request_sync(R::ENTITY, owner);
        }
        Ok(())
    }

    /// 按 id 读取（墓碑与其他所有者的记录不可见）
    pub fn get(&self, owner: &OwnerContext, id: i64) -> AppResult<Option<R>> {
        let record = self.store.get::<R>(id)?;
        Ok(record.filter(|r| !r.meta().is_deleted && r.meta().owner_id == owner.owner_id()))
    }

    /// 列出该所有者下未删除的记录，可按父记录过滤
    pub fn list(&self, owner: &OwnerContext, parent_id: Option<i64>) -> AppResult<Vec<R>> {
        let filter = RecordFilter::visible(owner.owner_id()).with_parent(parent_id);
        Ok(self.store.query(&filter)?)
    }

    /// `list` 的可观察版本
    pub fn observe(
        &self,
        owner: &OwnerContext,
        parent_id: Option<i64>,
    ) -> BoxStream<'static, AppResult<Vec<R>>> {
        let filter = RecordFilter::visible(owner.owner_id()).with_parent(parent_id);
        self.store
            .observe::<R>(filter)
            .map(|snapshot| snapshot.map_err(AppError::from))
            .boxed()
    }
}
