//! 测验 Repository
//!
//! 删除测验时在同一本地事务内墓碑其全部题目，两种实体类型随后由各自的
//! Worker 独立对账。

use futures::stream::BoxStream;
use std::sync::Arc;
use tracing::debug;

use super::SyncRepo;
use crate::entities::{Question, Test};
use crate::local_store::LocalStore;
use crate::models::AppResult;
use crate::sync::SyncRequester;
use crate::sync_meta::{EntityType, OwnerContext};

#[derive(Clone)]
pub struct TestRepo {
    tests: SyncRepo<Test>,
    questions: SyncRepo<Question>,
}

impl TestRepo {
    pub fn new(store: LocalStore, requester: Arc<dyn SyncRequester>) -> Self {
        Self {
            tests: SyncRepo::new(store.clone(), Arc::clone(&requester)),
            questions: SyncRepo::new(store, requester),
        }
    }

    pub fn insert(&self, owner: &OwnerContext, test: Test) -> AppResult<Test> {
        self.tests.insert(owner, test)
    }

    pub fn update(&self, owner: &OwnerContext, test: Test) -> AppResult<Test> {
        self.tests.update(owner, test)
    }

    /// 删除测验并级联墓碑其题目
    pub fn delete(&self, owner: &OwnerContext, id: i64) -> AppResult<()> {
        let owner_id = owner.owner_for_write(EntityType::Test)?;
        let store = self.tests.store();
        if store.tombstone_test_with_questions(owner_id, id)? {
            debug!("[Repo] Tombstoned test {} with its questions", id);
            let requester = self.tests.requester();
            requester.request_sync(EntityType::Test, owner);
            requester.request_sync(EntityType::Question, owner);
        }
        Ok(())
    }

    pub fn get(&self, owner: &OwnerContext, id: i64) -> AppResult<Option<Test>> {
        self.tests.get(owner, id)
    }

    /// 按课程列出测验
    pub fn list(&self, owner: &OwnerContext, lesson_id: Option<i64>) -> AppResult<Vec<Test>> {
        self.tests.list(owner, lesson_id)
    }

    pub fn observe(
        &self,
        owner: &OwnerContext,
        lesson_id: Option<i64>,
    ) -> BoxStream<'static, AppResult<Vec<Test>>> {
        self.tests.observe(owner, lesson_id)
    }

    /// 某测验下未删除的题目
    pub fn questions(&self, owner: &OwnerContext, test_id: i64) -> AppResult<Vec<Question>> {
        self.questions.list(owner, Some(test_id))
    }
}
