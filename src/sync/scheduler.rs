//! 同步任务调度器
//!
//! ## 职责
//! - **去重**：同一 [`SyncTag`] 同时至多一个任务，任务未结束前的新请求直接丢弃。
//!   Worker 每次运行都重新查询脏记录；运行期间写入的记录因版本校验保持脏状态，
//!   由下一次请求或周期触发器处理。
//! - **网络门控**：离线时任务挂起等待，不计失败；运行中断网则取消本次运行。
//! - **重试**：`Retry` 按指数退避重排，超过最大次数后任务以 `Failed` 结束，
//!   下一次由周期触发器接手。
//! - **周期兜底**：`request_periodic_sync` 按固定间隔重新请求同步。

use backon::{BackoffBuilder, ExponentialBuilder};
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::job::{ExistingPeriodicPolicy, SyncJobEvent, SyncJobStatus, SyncTag};
use super::network::NetworkMonitor;
use super::{SyncOutcome, SyncRequester, SyncWorker};
use crate::sync_meta::{EntityType, OwnerContext};

/// 事件通道容量
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// 调度器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct SchedulerConfig {
    /// 周期兜底间隔（秒）
    pub periodic_interval_secs: u64,
    /// 首次重试延迟（毫秒）
    pub retry_min_delay_ms: u64,
    /// 重试延迟上限（毫秒）
    pub retry_max_delay_ms: u64,
    /// 单个任务最多运行次数（含首次）
    pub max_attempts: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            periodic_interval_secs: 15 * 60,
            retry_min_delay_ms: 5_000,
            retry_max_delay_ms: 5 * 60 * 1000,
            max_attempts: 5,
        }
    }
}

impl SchedulerConfig {
    pub fn periodic_interval(&self) -> Duration {
        Duration::from_secs(self.periodic_interval_secs.max(1))
    }

    /// 重试延迟序列（长度为 `max_attempts - 1`）
    fn backoff(&self) -> impl Iterator<Item = Duration> {
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(self.retry_min_delay_ms))
            .with_max_delay(Duration::from_millis(
                self.retry_max_delay_ms.max(self.retry_min_delay_ms),
            ))
            .with_max_times(self.max_attempts.saturating_sub(1))
            .build()
    }
}

struct JobEntry {
    job_id: String,
    status: SyncJobStatus,
    attempt: u32,
    cancel: CancellationToken,
}

struct PeriodicEntry {
    interval: Duration,
    cancel: CancellationToken,
}

struct Inner {
    config: SchedulerConfig,
    network: NetworkMonitor,
    workers: DashMap<EntityType, Arc<dyn SyncWorker>>,
    jobs: DashMap<SyncTag, JobEntry>,
    periodic: DashMap<SyncTag, PeriodicEntry>,
    events: broadcast::Sender<SyncJobEvent>,
    shutdown: CancellationToken,
}

/// 同步任务调度器（可廉价克隆）
#[derive(Clone)]
pub struct SyncScheduler {
    inner: Arc<Inner>,
}

impl SyncScheduler {
    pub fn new(config: SchedulerConfig, network: NetworkMonitor) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                config,
                network,
                workers: DashMap::new(),
                jobs: DashMap::new(),
                periodic: DashMap::new(),
                events,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// 注册 Worker（同一实体类型后注册者覆盖先注册者）
    pub fn register_worker(&self, worker: Arc<dyn SyncWorker>) {
        let entity = worker.entity();
        if self.inner.workers.insert(entity, worker).is_some() {
            warn!("[Sync::Scheduler] Worker for {} replaced", entity);
        }
    }

    pub fn network(&self) -> &NetworkMonitor {
        &self.inner.network
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncJobEvent> {
        self.inner.events.subscribe()
    }

    pub fn job_status(&self, tag: &SyncTag) -> Option<SyncJobStatus> {
        self.inner.jobs.get(tag).map(|entry| entry.status)
    }

    /// 当前全部未结束的任务
    pub fn active_jobs(&self) -> Vec<(SyncTag, SyncJobStatus)> {
        self.inner
            .jobs
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().status))
            .collect()
    }

    /// 已注册的周期触发器及其间隔
    pub fn periodic_triggers(&self) -> Vec<(SyncTag, Duration)> {
        self.inner
            .periodic
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().interval))
            .collect()
    }

    /// 等待全部任务结束
    pub async fn wait_until_idle(&self) {
        let mut rx = self.inner.events.subscribe();
        loop {
            if self.inner.jobs.is_empty() {
                return;
            }
            match rx.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    /// 请求一次同步（即发即忘，按标签去重）
    pub fn request_sync(&self, entity: EntityType, owner: &OwnerContext) {
        if !owner.is_authenticated() {
            debug!(
                "[Sync::Scheduler] Ignoring {} sync request for anonymous owner",
                entity
            );
            return;
        }
        if self.inner.shutdown.is_cancelled() {
            debug!("[Sync::Scheduler] Scheduler stopped, dropping {} request", entity);
            return;
        }
        let Some(worker) = self.inner.workers.get(&entity).map(|w| Arc::clone(w.value())) else {
            warn!("[Sync::Scheduler] No worker registered for {}", entity);
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                "[Sync::Scheduler] No async runtime available, dropping {} request",
                entity
            );
            return;
        };

        let tag = SyncTag::new(entity, owner.owner_id());
        let cancel = match self.inner.jobs.entry(tag.clone()) {
            Entry::Occupied(existing) => {
                debug!(
                    "[Sync::Scheduler] {} already {:?}, request dropped",
                    tag,
                    existing.get().status
                );
                return;
            }
            Entry::Vacant(slot) => {
                let cancel = self.inner.shutdown.child_token();
                slot.insert(JobEntry {
                    job_id: Uuid::new_v4().to_string(),
                    status: SyncJobStatus::Enqueued,
                    attempt: 0,
                    cancel: cancel.clone(),
                });
                cancel
            }
        };

        self.inner.emit_current(&tag, None);
        let inner = Arc::clone(&self.inner);
        runtime.spawn(async move { inner.run_job(tag, worker, cancel).await });
    }

    /// 注册周期同步
    ///
    /// # Returns
    /// 是否新建了触发器（`KeepExisting` 且已存在时返回 false）
    pub fn request_periodic_sync(
        &self,
        entity: EntityType,
        owner: &OwnerContext,
        interval: Duration,
        policy: ExistingPeriodicPolicy,
    ) -> bool {
        if !owner.is_authenticated() || self.inner.shutdown.is_cancelled() {
            return false;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("[Sync::Scheduler] No async runtime available for periodic {}", entity);
            return false;
        };

        let tag = SyncTag::new(entity, owner.owner_id());
        let interval = interval.max(Duration::from_secs(1));
        let cancel = self.inner.shutdown.child_token();
        match self.inner.periodic.entry(tag.clone()) {
            Entry::Occupied(mut existing) => match policy {
                ExistingPeriodicPolicy::KeepExisting => {
                    debug!("[Sync::Scheduler] Periodic {} already registered", tag);
                    return false;
                }
                ExistingPeriodicPolicy::Replace => {
                    existing.get().cancel.cancel();
                    existing.insert(PeriodicEntry {
                        interval,
                        cancel: cancel.clone(),
                    });
                }
            },
            Entry::Vacant(slot) => {
                slot.insert(PeriodicEntry {
                    interval,
                    cancel: cancel.clone(),
                });
            }
        }

        info!(
            "[Sync::Scheduler] Periodic {} every {}s",
            tag,
            interval.as_secs()
        );
        let scheduler = self.clone();
        let owner = owner.clone();
        runtime.spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => scheduler.request_sync(entity, &owner),
                }
            }
        });
        true
    }

    /// 停止调度：取消全部任务与周期触发器，之后的请求被忽略
    pub fn shutdown(&self) {
        info!(
            "[Sync::Scheduler] Shutting down ({} active job(s))",
            self.inner.jobs.len()
        );
        self.inner.shutdown.cancel();
        self.inner.periodic.clear();
    }
}

impl SyncRequester for SyncScheduler {
    fn request_sync(&self, entity: EntityType, owner: &OwnerContext) {
        SyncScheduler::request_sync(self, entity, owner)
    }
}

impl Inner {
    async fn run_job(
        self: Arc<Self>,
        tag: SyncTag,
        worker: Arc<dyn SyncWorker>,
        cancel: CancellationToken,
    ) {
        let owner = OwnerContext::authenticated(tag.owner_id.clone());
        let mut delays = self.config.backoff();

        let final_status = loop {
            if !self.network.is_online() {
                self.transition(&tag, SyncJobStatus::WaitingForNetwork, None);
                tokio::select! {
                    _ = cancel.cancelled() => break SyncJobStatus::Cancelled,
                    _ = self.network.wait_until_online() => {}
                }
            }

            self.begin_attempt(&tag);
            let outcome = tokio::select! {
                _ = cancel.cancelled() => break SyncJobStatus::Cancelled,
                _ = self.network.wait_until_offline() => None,
                outcome = worker.run(&owner) => Some(outcome),
            };

            match outcome {
                None => {
                    info!("[Sync::Scheduler] {} interrupted by connectivity loss", tag);
                }
                Some(SyncOutcome::Success) => break SyncJobStatus::Succeeded,
                Some(SyncOutcome::Retry) => {
                    let Some(delay) = delays.next() else {
                        warn!("[Sync::Scheduler] {} exhausted retries", tag);
                        break SyncJobStatus::Failed;
                    };
                    self.transition(
                        &tag,
                        SyncJobStatus::Retrying,
                        Some(format!("retry in {}ms", delay.as_millis())),
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break SyncJobStatus::Cancelled,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        };

        if let Some((_, job)) = self.jobs.remove(&tag) {
            self.emit(SyncJobEvent {
                job_id: job.job_id,
                tag: tag.clone(),
                status: final_status,
                attempt: job.attempt,
                message: None,
                timestamp: Utc::now(),
            });
        }
        debug!("[Sync::Scheduler] {} finished as {:?}", tag, final_status);
    }

    fn begin_attempt(&self, tag: &SyncTag) {
        let event = {
            let Some(mut job) = self.jobs.get_mut(tag) else {
                return;
            };
            if !job.status.can_transition_to(SyncJobStatus::Running) {
                warn!(
                    "[Sync::Scheduler] Invalid transition {:?} -> Running for {}",
                    job.status, tag
                );
                return;
            }
            job.attempt += 1;
            job.status = SyncJobStatus::Running;
            Self::event_for(tag, &job, None)
        };
        debug!("[Sync::Scheduler] {} attempt {}", tag, event.attempt);
        self.emit(event);
    }

    fn transition(&self, tag: &SyncTag, status: SyncJobStatus, message: Option<String>) {
        let event = {
            let Some(mut job) = self.jobs.get_mut(tag) else {
                return;
            };
            if !job.status.can_transition_to(status) {
                warn!(
                    "[Sync::Scheduler] Invalid transition {:?} -> {:?} for {}",
                    job.status, status, tag
                );
                return;
            }
            job.status = status;
            Self::event_for(tag, &job, message)
        };
        self.emit(event);
    }

    fn emit_current(&self, tag: &SyncTag, message: Option<String>) {
        let event = self
            .jobs
            .get(tag)
            .map(|job| Self::event_for(tag, &job, message));
        if let Some(event) = event {
            self.emit(event);
        }
    }

    fn event_for(tag: &SyncTag, job: &JobEntry, message: Option<String>) -> SyncJobEvent {
        SyncJobEvent {
            job_id: job.job_id.clone(),
            tag: tag.clone(),
            status: job.status,
            attempt: job.attempt,
            message,
            timestamp: Utc::now(),
        }
    }

    fn emit(&self, event: SyncJobEvent) {
        // 无订阅者时发送失败，忽略
        let _ = self.events.send(event);
    }
}
