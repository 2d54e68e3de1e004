//! 记录对账 Worker
//!
//! ## 算法
//! 1. 查询该所有者下全部 `is_synced = 0` 的记录（含墓碑，不含被隔离记录），按 id 升序
//! 2. 为空则直接成功
//! 3. 逐条处理：
//!    - 墓碑：删除远端文档，确认后物理删除本地行
//!    - 其他：覆盖写入公开投影，确认后置 `is_synced = 1`
//! 4. 第一次远端失败即中止本轮并返回 `Retry`（fail-fast），已确认的记录保持已同步
//!
//! 本地回写以推送时的 `local_version` 为条件；条件不满足说明期间有新的本地写入，
//! 记录保持脏状态，由该写入触发的下一轮处理。

use async_trait::async_trait;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::{SyncError, SyncOutcome, SyncWorker};
use crate::local_store::{LocalStore, RecordFilter, StoreError, SyncRecord};
use crate::remote::{DocumentPath, RemoteStore};
use crate::sync_meta::{EntityType, OwnerContext};

/// 单轮对账统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub pushed: usize,
    pub deleted: usize,
    /// 推送期间被新写入覆盖、留待下一轮的记录
    pub superseded: usize,
    /// 本地簿记致命失败而被隔离的记录
    pub blocked: usize,
}

/// 通用记录 Worker（每种实体类型一个实例）
pub struct RecordSyncWorker<R: SyncRecord> {
    store: LocalStore,
    remote: Arc<dyn RemoteStore>,
    _record: PhantomData<fn() -> R>,
}

impl<R: SyncRecord> RecordSyncWorker<R> {
    pub fn new(store: LocalStore, remote: Arc<dyn RemoteStore>) -> Self {
        Self {
            store,
            remote,
            _record: PhantomData,
        }
    }

    /// 执行一轮对账
    ///
    /// # Errors
    /// 远端失败或暂时性本地错误时中止并返回错误
    pub async fn reconcile(&self, owner_id: &str) -> Result<SyncReport, SyncError> {
        let mut report = SyncReport::default();
        let dirty: Vec<R> = self.store.query(&RecordFilter::dirty(owner_id))?;
        if dirty.is_empty() {
            return Ok(report);
        }

        debug!(
            "[Sync::Worker] {} has {} dirty record(s) for {}",
            R::ENTITY,
            dirty.len(),
            owner_id
        );

        for record in dirty {
            let path = DocumentPath::new(owner_id, R::ENTITY, record.id());
            let version = record.meta().local_version;

            if record.meta().is_deleted {
                self.remote.delete_document(&path).await?;
                match self.store.purge_tombstone(R::ENTITY, record.id(), version) {
                    Ok(true) => report.deleted += 1,
                    Ok(false) => report.superseded += 1,
                    Err(e) => self.handle_local_failure(&record, e, &mut report)?,
                }
                continue;
            }

            let projection = match record.projection() {
                Ok(projection) => projection,
                Err(e) => {
                    let e = StoreError::from(e);
                    self.handle_local_failure(&record, e, &mut report)?;
                    continue;
                }
            };

            self.remote.put_document(&path, &projection).await?;
            match self.store.mark_synced(R::ENTITY, record.id(), version) {
                Ok(true) => report.pushed += 1,
                Ok(false) => report.superseded += 1,
                Err(e) => self.handle_local_failure(&record, e, &mut report)?,
            }
        }

        Ok(report)
    }

    /// 本地簿记失败：暂时性错误中止本轮，其余错误隔离该记录后继续
    fn handle_local_failure(
        &self,
        record: &R,
        err: StoreError,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        if err.is_transient() {
            return Err(SyncError::Store(err));
        }

        error!(
            "[Sync::Worker] {} {} failed local bookkeeping, excluded until next write: {}",
            R::ENTITY,
            record.id(),
            err
        );
        match self
            .store
            .block_record(R::ENTITY, record.id(), record.meta().local_version)
        {
            Ok(_) => report.blocked += 1,
            Err(block_err) => {
                error!(
                    "[Sync::Worker] Failed to block {} {}: {}",
                    R::ENTITY,
                    record.id(),
                    block_err
                );
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<R: SyncRecord> SyncWorker for RecordSyncWorker<R> {
    fn entity(&self) -> EntityType {
        R::ENTITY
    }

    async fn run(&self, owner: &OwnerContext) -> SyncOutcome {
        // 匿名记录只在认领后上传
        if !owner.is_authenticated() {
            debug!("[Sync::Worker] {} skipped for anonymous owner", R::ENTITY);
            return SyncOutcome::Success;
        }

        match self.reconcile(owner.owner_id()).await {
            Ok(report) => {
                if report != SyncReport::default() {
                    info!(
                        "[Sync::Worker] {} reconciled for {}: pushed={}, deleted={}, superseded={}, blocked={}",
                        R::ENTITY,
                        owner.owner_id(),
                        report.pushed,
                        report.deleted,
                        report.superseded,
                        report.blocked
                    );
                }
                SyncOutcome::Success
            }
            Err(e) => {
                warn!(
                    "[Sync::Worker] {} run for {} aborted, will retry: {}",
                    R::ENTITY,
                    owner.owner_id(),
                    e
                );
                SyncOutcome::Retry
            }
        }
    }
}
