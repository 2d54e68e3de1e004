//! 后台对账
//!
//! - `worker`: 每种实体类型一个 Worker，把脏记录推送到远端并回写本地元数据
//! - `scheduler`: 决定 Worker 何时运行，保证同一实体类型同一所有者至多一个任务
//! - `network`: 在线状态，任务只在在线时运行
//! - `job`: 任务标签、状态机与事件

pub mod job;
pub mod network;
pub mod scheduler;
pub mod worker;

pub use job::{ExistingPeriodicPolicy, SyncJobEvent, SyncJobStatus, SyncTag};
pub use network::NetworkMonitor;
pub use scheduler::{SchedulerConfig, SyncScheduler};
pub use worker::{RecordSyncWorker, SyncReport};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::local_store::StoreError;
use crate::remote::RemoteError;
use crate::sync_meta::{EntityType, OwnerContext};

/// Worker 运行结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    Success,
    Retry,
}

/// 单次对账中止的原因（均映射为 `Retry`）
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("remote store: {0}")]
    Remote(#[from] RemoteError),

    #[error("local store: {0}")]
    Store(#[from] StoreError),
}

/// 对账 Worker
///
/// 实现者不得向外抛出错误：所有失败都折算为 [`SyncOutcome::Retry`]。
#[async_trait]
pub trait SyncWorker: Send + Sync {
    fn entity(&self) -> EntityType;

    async fn run(&self, owner: &OwnerContext) -> SyncOutcome;
}

/// 同步请求入口（Repository 写入后调用，即发即忘）
pub trait SyncRequester: Send + Sync {
    fn request_sync(&self, entity: EntityType, owner: &OwnerContext);
}
