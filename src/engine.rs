//! 同步引擎门面
//!
//! 把数据库、本地存储、远端存储、调度器、六个 Repository 与六个 Worker
//! 装配在一起。应用只需持有一个 [`SyncEngine`]。

use std::sync::Arc;
use tracing::info;

use crate::database::Database;
use crate::entities::{Category, FlashCard, Lesson, Question, Summary, Test};
use crate::local_store::{LocalStore, SyncBacklog};
use crate::models::{AppError, AppResult};
use crate::remote::RemoteStore;
use crate::repos::{CategoryRepo, FlashCardRepo, LessonRepo, QuestionRepo, SummaryRepo, TestRepo};
use crate::sync::{
    ExistingPeriodicPolicy, NetworkMonitor, RecordSyncWorker, SchedulerConfig, SyncRequester,
    SyncScheduler,
};
use crate::sync_meta::{EntityType, OwnerContext};

pub struct SyncEngine {
    store: LocalStore,
    remote: Arc<dyn RemoteStore>,
    scheduler: SyncScheduler,
    categories: CategoryRepo,
    lessons: LessonRepo,
    flashcards: FlashCardRepo,
    tests: TestRepo,
    questions: QuestionRepo,
    summaries: SummaryRepo,
}

impl SyncEngine {
    pub fn new(
        database: Arc<Database>,
        remote: Arc<dyn RemoteStore>,
        config: SchedulerConfig,
        network: NetworkMonitor,
    ) -> Self {
        let store = LocalStore::new(database);
        let scheduler = SyncScheduler::new(config, network);

        scheduler.register_worker(Arc::new(RecordSyncWorker::<Category>::new(
            store.clone(),
            Arc::clone(&remote),
        )));
        scheduler.register_worker(Arc::new(RecordSyncWorker::<Lesson>::new(
            store.clone(),
            Arc::clone(&remote),
        )));
        scheduler.register_worker(Arc::new(RecordSyncWorker::<FlashCard>::new(
            store.clone(),
            Arc::clone(&remote),
        )));
        scheduler.register_worker(Arc::new(RecordSyncWorker::<Test>::new(
            store.clone(),
            Arc::clone(&remote),
        )));
        scheduler.register_worker(Arc::new(RecordSyncWorker::<Question>::new(
            store.clone(),
            Arc::clone(&remote),
        )));
        scheduler.register_worker(Arc::new(RecordSyncWorker::<Summary>::new(
            store.clone(),
            Arc::clone(&remote),
        )));

        let requester: Arc<dyn SyncRequester> = Arc::new(scheduler.clone());
        Self {
            categories: CategoryRepo::new(store.clone(), Arc::clone(&requester)),
            lessons: LessonRepo::new(store.clone(), Arc::clone(&requester)),
            flashcards: FlashCardRepo::new(store.clone(), Arc::clone(&requester)),
            tests: TestRepo::new(store.clone(), Arc::clone(&requester)),
            questions: QuestionRepo::new(store.clone(), Arc::clone(&requester)),
            summaries: SummaryRepo::new(store.clone(), requester),
            store,
            remote,
            scheduler,
        }
    }

    pub fn categories(&self) -> &CategoryRepo {
        &self.categories
    }

    pub fn lessons(&self) -> &LessonRepo {
        &self.lessons
    }

    pub fn flashcards(&self) -> &FlashCardRepo {
        &self.flashcards
    }

    pub fn tests(&self) -> &TestRepo {
        &self.tests
    }

    pub fn questions(&self) -> &QuestionRepo {
        &self.questions
    }

    pub fn summaries(&self) -> &SummaryRepo {
        &self.summaries
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn remote(&self) -> &Arc<dyn RemoteStore> {
        &self.remote
    }

    pub fn scheduler(&self) -> &SyncScheduler {
        &self.scheduler
    }

    pub fn network(&self) -> &NetworkMonitor {
        self.scheduler.network()
    }

    /// 为每种实体类型注册周期兜底同步（已存在则保留）
    ///
    /// # Returns
    /// 新注册的触发器数量
    pub fn start_periodic(&self, owner: &OwnerContext) -> usize {
        let interval = self.scheduler.config().periodic_interval();
        let registered = EntityType::ALL
            .iter()
            .filter(|entity| {
                self.scheduler.request_periodic_sync(
                    **entity,
                    owner,
                    interval,
                    ExistingPeriodicPolicy::KeepExisting,
                )
            })
            .count();
        if registered > 0 {
            info!(
                "[SyncEngine] Registered {} periodic trigger(s) for {}",
                registered,
                owner.owner_id()
            );
        }
        registered
    }

    /// 为每种实体类型请求一次同步
    pub fn request_full_sync(&self, owner: &OwnerContext) {
        for entity in EntityType::ALL {
            self.scheduler.request_sync(entity, owner);
        }
    }

    /// 各实体类型的待对账统计
    pub fn backlog(&self, owner: &OwnerContext) -> AppResult<Vec<SyncBacklog>> {
        Ok(self.store.backlog(owner.owner_id())?)
    }

    /// 登录后认领匿名记录：转给该用户并请求全量同步
    ///
    /// # Errors
    /// 未登录时返回 `Unauthenticated`
    pub fn claim_anonymous_records(&self, owner: &OwnerContext) -> AppResult<usize> {
        if !owner.is_authenticated() {
            return Err(AppError::unauthenticated(
                "Claiming anonymous records requires a signed-in user",
            ));
        }
        let claimed = self.store.claim_anonymous(owner.owner_id())?;
        if claimed > 0 {
            self.request_full_sync(owner);
        }
        Ok(claimed)
    }

    /// 停止调度（本地数据不受影响）
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{DocumentPath, MemoryRemoteStore};

    fn engine() -> (SyncEngine, Arc<MemoryRemoteStore>) {
        let remote = Arc::new(MemoryRemoteStore::new());
        let engine = SyncEngine::new(
            Arc::new(Database::in_memory().unwrap()),
            remote.clone(),
            SchedulerConfig::default(),
            NetworkMonitor::new(true),
        );
        (engine, remote)
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_anonymous_records_then_sync() {
        let (engine, remote) = engine();
        let cat = engine
            .categories()
            .insert(&OwnerContext::Anonymous, Category::new("Draft"))
            .unwrap();
        engine.scheduler().wait_until_idle().await;
        assert_eq!(remote.document_count(), 0);

        let owner = OwnerContext::authenticated("u1");
        assert_eq!(engine.claim_anonymous_records(&owner).unwrap(), 1);
        engine.scheduler().wait_until_idle().await;

        assert!(remote
            .document(&DocumentPath::new("u1", EntityType::Category, cat.id))
            .is_some());
        assert!(engine.backlog(&owner).unwrap().iter().all(|b| b.is_clear()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_periodic_registers_each_entity_once() {
        let (engine, _) = engine();
        let owner = OwnerContext::authenticated("u1");
        assert_eq!(engine.start_periodic(&owner), 6);
        assert_eq!(engine.start_periodic(&owner), 0);
        assert_eq!(engine.start_periodic(&OwnerContext::Anonymous), 0);
        engine.shutdown();
    }

    #[test]
    fn test_claim_requires_identity() {
        let (engine, _) = engine();
        assert!(engine
            .claim_anonymous_records(&OwnerContext::Anonymous)
            .is_err());
    }
}
