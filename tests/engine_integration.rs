//! 引擎端到端测试：Repository → 调度器 → Worker → 远端

use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use study_sync_lib::database::Database;
use study_sync_lib::entities::{Category, FlashCard, Lesson};
use study_sync_lib::local_store::RecordFilter;
use study_sync_lib::remote::{DocumentPath, MemoryRemoteStore};
use study_sync_lib::sync::{NetworkMonitor, SchedulerConfig, SyncJobStatus, SyncTag};
use study_sync_lib::{EntityType, OwnerContext, SyncEngine};

fn fast_scheduler() -> SchedulerConfig {
    SchedulerConfig {
        periodic_interval_secs: 60,
        retry_min_delay_ms: 50,
        retry_max_delay_ms: 500,
        max_attempts: 10,
    }
}

fn engine_with(
    online: bool,
) -> (SyncEngine, Arc<MemoryRemoteStore>, TempDir) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let database =
        Database::new(&temp_dir.path().join("study.db")).expect("Failed to open database");
    let remote = Arc::new(MemoryRemoteStore::new());
    let engine = SyncEngine::new(
        Arc::new(database),
        remote.clone(),
        fast_scheduler(),
        NetworkMonitor::new(online),
    );
    (engine, remote, temp_dir)
}

#[tokio::test(start_paused = true)]
async fn rapid_requests_run_one_job() {
    let (engine, remote, _dir) = engine_with(true);
    remote.set_latency(Some(Duration::from_millis(100)));
    let owner = OwnerContext::authenticated("u1");
    let mut events = engine.scheduler().subscribe();

    engine.categories().insert(&owner, Category::new("A")).unwrap();
    engine.categories().insert(&owner, Category::new("B")).unwrap();
    engine.scheduler().wait_until_idle().await;

    let mut runs = 0;
    while let Ok(event) = events.try_recv() {
        if event.tag.entity == EntityType::Category && event.status == SyncJobStatus::Running {
            runs += 1;
        }
    }
    assert_eq!(runs, 1);
    assert_eq!(remote.stats().puts, 2);
}

#[tokio::test(start_paused = true)]
async fn converges_despite_transient_failures() {
    let (engine, remote, _dir) = engine_with(false);
    let owner = OwnerContext::authenticated("u1");
    let categories = engine.categories();

    let mut kept = Vec::new();
    for i in 0..6 {
        kept.push(
            categories
                .insert(&owner, Category::new(format!("c{i}")))
                .unwrap(),
        );
    }
    let mut edited = kept[1].clone();
    edited.name = "edited".into();
    categories.update(&owner, edited).unwrap();
    categories.delete(&owner, kept[2].id).unwrap();
    categories.delete(&owner, kept[4].id).unwrap();

    let tag = SyncTag::new(EntityType::Category, "u1");
    assert_eq!(
        engine.scheduler().job_status(&tag),
        Some(SyncJobStatus::Enqueued)
    );

    remote.fail_nth_request(1);
    remote.fail_nth_request(3);
    remote.fail_nth_request(6);
    engine.network().set_online(true);
    engine.scheduler().wait_until_idle().await;

    let dirty: Vec<Category> = engine
        .store()
        .query(&RecordFilter::dirty("u1"))
        .unwrap();
    assert!(dirty.is_empty());
    assert!(engine.store().get::<Category>(kept[2].id).unwrap().is_none());
    assert!(engine.store().get::<Category>(kept[4].id).unwrap().is_none());

    let docs = remote.documents("u1", EntityType::Category);
    let ids: Vec<i64> = docs.iter().map(|(id, _)| *id).collect();
    assert_eq!(ids, vec![kept[0].id, kept[1].id, kept[3].id, kept[5].id]);
    assert_eq!(docs[1].1["name"], "edited");
    assert!(remote.stats().failures >= 3);
}

#[tokio::test(start_paused = true)]
async fn writes_during_a_run_are_not_lost() {
    let (engine, remote, _dir) = engine_with(true);
    remote.set_latency(Some(Duration::from_millis(200)));
    let owner = OwnerContext::authenticated("u1");
    let lessons = engine.lessons();

    let lesson = lessons.insert(&owner, Lesson::new(1, "Draft", "")).unwrap();
    // 让任务进入运行状态后再修改
    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut edited = lesson.clone();
    edited.title = "Final".into();
    lessons.update(&owner, edited).unwrap();

    engine.scheduler().wait_until_idle().await;
    let path = DocumentPath::new("u1", EntityType::Lesson, lesson.id);
    // 运行中的任务不会因新请求重跑；上传的是旧版本，本地行保持脏状态
    assert_eq!(remote.document(&path).unwrap()["title"], "Draft");
    let row: Lesson = engine.store().get(lesson.id).unwrap().unwrap();
    assert!(!row.meta.is_synced);
    assert_eq!(row.title, "Final");

    engine.scheduler().request_sync(EntityType::Lesson, &owner);
    engine.scheduler().wait_until_idle().await;
    assert_eq!(remote.document(&path).unwrap()["title"], "Final");
    let row: Lesson = engine.store().get(lesson.id).unwrap().unwrap();
    assert!(row.meta.is_synced);
}

#[tokio::test(start_paused = true)]
async fn offline_mutations_sync_after_reconnect() {
    let (engine, remote, _dir) = engine_with(false);
    let owner = OwnerContext::authenticated("u1");
    let card = engine
        .flashcards()
        .insert(&owner, FlashCard::new(1, "front", "back"))
        .unwrap();

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(remote.document_count(), 0);
    let backlog = engine.backlog(&owner).unwrap();
    let cards = backlog
        .iter()
        .find(|b| b.entity == EntityType::FlashCard)
        .unwrap();
    assert_eq!(cards.pending_upserts, 1);

    engine.network().set_online(true);
    engine.scheduler().wait_until_idle().await;
    assert!(remote
        .document(&DocumentPath::new("u1", EntityType::FlashCard, card.id))
        .is_some());
}

#[tokio::test(start_paused = true)]
async fn periodic_trigger_picks_up_failed_jobs() {
    let (engine, remote, _dir) = engine_with(true);
    let owner = OwnerContext::authenticated("u1");
    engine.start_periodic(&owner);

    remote.set_offline(true);
    engine
        .categories()
        .insert(&owner, Category::new("Math"))
        .unwrap();
    engine.scheduler().wait_until_idle().await;
    assert_eq!(remote.document_count(), 0);

    remote.set_offline(false);
    tokio::time::sleep(Duration::from_secs(61)).await;
    engine.scheduler().wait_until_idle().await;
    assert_eq!(remote.documents("u1", EntityType::Category).len(), 1);
    engine.shutdown();
}

#[tokio::test]
async fn observe_emits_live_snapshots() {
    let (engine, _remote, _dir) = engine_with(false);
    let owner = OwnerContext::authenticated("u1");
    let mut stream = engine.categories().observe(&owner, None);

    assert!(stream.next().await.unwrap().unwrap().is_empty());

    let cat = engine
        .categories()
        .insert(&owner, Category::new("Math"))
        .unwrap();
    let snapshot = stream.next().await.unwrap().unwrap();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].name, "Math");

    engine.categories().delete(&owner, cat.id).unwrap();
    assert!(stream.next().await.unwrap().unwrap().is_empty());
}
