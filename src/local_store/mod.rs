//! 本地存储（Local Store）
//!
//! 所有读取的唯一事实来源。在 [`Database`] 之上提供按实体类型的类型化操作：
//!
//! ## 核心方法
//! - `insert_or_replace` / `update` / `tombstone`: Repository 写入路径（总是置脏）
//! - `query` / `observe`: 谓词查询与可观察查询
//! - `mark_synced` / `purge_tombstone` / `block_record`: Worker 回写路径，
//!   均以 `local_version` 为条件，与并发的本地写入互不覆盖
//! - `backlog` / `claim_anonymous`: 诊断与账户认领
//!
//! 所有方法提供 `_with_conn` 版本时，调用方可在同一事务内组合多次写入。

pub mod record;

use futures::stream::{self, BoxStream, StreamExt};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::database::Database;
pub use crate::database::{StoreError, StoreResult};
use crate::sync_meta::{EntityType, SyncMeta, ANONYMOUS_OWNER};
pub use record::{RecordFilter, SyncRecord};

/// 同步元数据列（与 `record::FIELD_OFFSET` 对应）
const META_COLUMNS: &str = "id, owner_id, is_synced, is_deleted, local_version";

/// 单个实体类型的待对账统计
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncBacklog {
    pub entity: EntityType,
    /// 待上传（脏且未删除）
    pub pending_upserts: u64,
    /// 待云端删除的墓碑
    pub pending_deletes: u64,
    /// 被隔离、等待用户重新写入的记录
    pub blocked: u64,
}

impl SyncBacklog {
    pub fn is_clear(&self) -> bool {
        self.pending_upserts == 0 && self.pending_deletes == 0
    }
}

/// 级联墓碑的子表描述：(子实体类型, 指向父记录的列)
pub type CascadeChild = (EntityType, &'static str);

/// 本地存储句柄（可廉价克隆）
#[derive(Clone)]
pub struct LocalStore {
    db: Arc<Database>,
}

impl LocalStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    fn select_sql<R: SyncRecord>() -> String {
        format!(
            "SELECT {}, {} FROM {}",
            META_COLUMNS,
            R::FIELDS.join(", "),
            R::ENTITY.table_name()
        )
    }

    fn read_record<R: SyncRecord>(row: &rusqlite::Row<'_>) -> rusqlite::Result<R> {
        let id: i64 = row.get(0)?;
        let meta = SyncMeta {
            owner_id: row.get(1)?,
            is_synced: row.get(2)?,
            is_deleted: row.get(3)?,
            local_version: row.get(4)?,
        };
        R::from_row(id, meta, row)
    }

    // ========================================================================
    // Repository 写入路径
    // ========================================================================

    /// 插入或整行替换
    ///
    /// `id <= 0` 时由 AUTOINCREMENT 分配新 id；替换已有行时 `local_version` 在旧值上递增。
    /// 成功后回填记录的 `id` 与 `local_version`。
    ///
    /// # Errors
    /// 同 id 的行属于其他所有者时不做任何修改，返回 `NotFound`
    pub fn insert_or_replace<R: SyncRecord>(&self, record: &mut R) -> StoreResult<()> {
        let conn = self.db.get_conn()?;
        Self::insert_or_replace_with_conn(&conn, record)?;
        self.db.notify_changed(R::ENTITY);
        Ok(())
    }

    pub fn insert_or_replace_with_conn<R: SyncRecord>(
        conn: &Connection,
        record: &mut R,
    ) -> StoreResult<()> {
        let table = R::ENTITY.table_name();
        let fields = R::FIELDS;
        let placeholders = (0..fields.len() + 5)
            .map(|i| format!("?{}", i + 1))
            .collect::<Vec<_>>()
            .join(", ");
        let updates = fields
            .iter()
            .map(|f| format!("{f} = excluded.{f}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO {table} (id, owner_id, is_synced, is_deleted, local_version, {cols})
             VALUES ({placeholders})
             ON CONFLICT(id) DO UPDATE SET
                owner_id = excluded.owner_id,
                is_synced = excluded.is_synced,
                is_deleted = excluded.is_deleted,
                local_version = {table}.local_version + 1,
                sync_blocked = 0,
                {updates}
             WHERE {table}.owner_id = excluded.owner_id
             RETURNING id, local_version",
            cols = fields.join(", "),
        );

        let meta = record.meta();
        let mut values = vec![
            if record.id() > 0 {
                Value::Integer(record.id())
            } else {
                Value::Null
            },
            Value::Text(meta.owner_id.clone()),
            Value::Integer(meta.is_synced as i64),
            Value::Integer(meta.is_deleted as i64),
            Value::Integer(meta.local_version.max(1)),
        ];
        values.extend(record.field_values());

        let (id, version): (i64, i64) = conn
            .query_row(&sql, params_from_iter(values), |row| Ok((row.get(0)?, row.get(1)?)))
            .optional()?
            .ok_or(StoreError::NotFound {
                entity: R::ENTITY,
                id: record.id(),
            })?;

        record.set_id(id);
        record.meta_mut().local_version = version;
        debug!("[LocalStore] {} {} written (version {})", R::ENTITY, id, version);
        Ok(())
    }

    /// 更新业务字段并置脏
    ///
    /// 只作用于该所有者下未删除的行；`is_synced` 置 0、`local_version` 递增、解除隔离。
    /// 返回新的 `local_version`。
    ///
    /// # Errors
    /// 行不存在、属于其他所有者或已是墓碑时返回 `NotFound`
    pub fn update<R: SyncRecord>(&self, record: &R) -> StoreResult<i64> {
        let table = R::ENTITY.table_name();
        let assignments = R::FIELDS
            .iter()
            .enumerate()
            .map(|(i, f)| format!("{} = ?{}", f, i + 3))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE {table} SET {assignments},
                is_synced = 0,
                local_version = local_version + 1,
                sync_blocked = 0
             WHERE id = ?1 AND owner_id = ?2 AND is_deleted = 0
             RETURNING local_version"
        );

        let mut values = vec![
            Value::Integer(record.id()),
            Value::Text(record.meta().owner_id.clone()),
        ];
        values.extend(record.field_values());

        let conn = self.db.get_conn()?;
        let version: Option<i64> = conn
            .query_row(&sql, params_from_iter(values), |row| row.get(0))
            .optional()?;
        drop(conn);

        match version {
            Some(version) => {
                self.db.notify_changed(R::ENTITY);
                Ok(version)
            }
            None => Err(StoreError::NotFound {
                entity: R::ENTITY,
                id: record.id(),
            }),
        }
    }

    /// 软删除：`is_deleted = 1, is_synced = 0`，物理行保留
    ///
    /// 返回 `true` 表示本次新写入墓碑，`false` 表示记录早已是墓碑。
    pub fn tombstone(&self, entity: EntityType, owner_id: &str, id: i64) -> StoreResult<bool> {
        self.tombstone_cascade(entity, owner_id, id, &[])
    }

    /// 在同一事务内墓碑父记录及其全部子记录
    pub fn tombstone_cascade(
        &self,
        entity: EntityType,
        owner_id: &str,
        id: i64,
        children: &[CascadeChild],
    ) -> StoreResult<bool> {
        let mut conn = self.db.get_conn()?;
        let tx = conn.transaction()?;

        let newly = Self::tombstone_with_conn(&tx, entity, owner_id, id)?;
        let mut cascaded = 0usize;
        for (child, column) in children {
            cascaded += tx.execute(
                &format!(
                    "UPDATE {} SET is_deleted = 1, is_synced = 0,
                        local_version = local_version + 1, sync_blocked = 0
                     WHERE {} = ?1 AND owner_id = ?2 AND is_deleted = 0",
                    child.table_name(),
                    column
                ),
                params![id, owner_id],
            )?;
        }
        tx.commit()?;
        drop(conn);

        if !children.is_empty() {
            debug!(
                "[LocalStore] {} {} tombstoned with {} child record(s)",
                entity, id, cascaded
            );
        }
        self.db.notify_changed(entity);
        for (child, _) in children {
            self.db.notify_changed(*child);
        }
        Ok(newly)
    }

    /// 删除测验及其全部题目（单一事务）
    pub fn tombstone_test_with_questions(&self, owner_id: &str, test_id: i64) -> StoreResult<bool> {
        self.tombstone_cascade(
            EntityType::Test,
            owner_id,
            test_id,
            &[(EntityType::Question, "test_id")],
        )
    }

    fn tombstone_with_conn(
        conn: &Connection,
        entity: EntityType,
        owner_id: &str,
        id: i64,
    ) -> StoreResult<bool> {
        let table = entity.table_name();
        let changed = conn.execute(
            &format!(
                "UPDATE {table} SET is_deleted = 1, is_synced = 0,
                    local_version = local_version + 1, sync_blocked = 0
                 WHERE id = ?1 AND owner_id = ?2 AND is_deleted = 0"
            ),
            params![id, owner_id],
        )?;
        if changed > 0 {
            return Ok(true);
        }

        let deleted: Option<bool> = conn
            .query_row(
                &format!("SELECT is_deleted FROM {table} WHERE id = ?1 AND owner_id = ?2"),
                params![id, owner_id],
                |row| row.get(0),
            )
            .optional()?;
        match deleted {
            Some(true) => Ok(false),
            _ => Err(StoreError::NotFound { entity, id }),
        }
    }

    // ========================================================================
    // 读取路径
    // ========================================================================

    /// 按 id 读取（不过滤墓碑）
    pub fn get<R: SyncRecord>(&self, id: i64) -> StoreResult<Option<R>> {
        let conn = self.db.get_conn()?;
        let sql = format!("{} WHERE id = ?1", Self::select_sql::<R>());
        let record = conn
            .query_row(&sql, params![id], Self::read_record::<R>)
            .optional()?;
        Ok(record)
    }

    /// 谓词查询，按 id 升序
    pub fn query<R: SyncRecord>(&self, filter: &RecordFilter) -> StoreResult<Vec<R>> {
        let conn = self.db.get_conn()?;
        Self::query_with_conn(&conn, filter)
    }

    pub fn query_with_conn<R: SyncRecord>(
        conn: &Connection,
        filter: &RecordFilter,
    ) -> StoreResult<Vec<R>> {
        let (where_sql, values) = filter.to_sql(R::PARENT_COLUMN);
        let sql = format!("{}{} ORDER BY id ASC", Self::select_sql::<R>(), where_sql);
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), Self::read_record::<R>)?;
        let records = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// 可观察查询
    ///
    /// 惰性、可重启：每次调用返回新的流。首个元素是当前快照，
    /// 之后每当该实体类型的表提交变更就重新查询并发射一次。
    /// 多次变更可能合并为一次发射（只保证发射最新状态）。
    pub fn observe<R: SyncRecord>(
        &self,
        filter: RecordFilter,
    ) -> BoxStream<'static, StoreResult<Vec<R>>> {
        let changes = self.db.subscribe(R::ENTITY);
        let state = (self.clone(), changes, filter, true);

        stream::unfold(state, |(store, mut changes, filter, first)| async move {
            match changes.as_mut() {
                Some(rx) if first => {
                    rx.borrow_and_update();
                }
                Some(rx) => {
                    if rx.changed().await.is_err() {
                        return None;
                    }
                }
                None if first => {}
                None => return None,
            }
            let snapshot = store.query::<R>(&filter);
            Some((snapshot, (store, changes, filter, false)))
        })
        .boxed()
    }

    // ========================================================================
    // Worker 回写路径
    // ========================================================================

    /// 云端写入确认后置 `is_synced = 1`
    ///
    /// 仅当记录仍处于被推送时的版本才生效；返回 `false` 表示期间有新的本地写入，
    /// 记录保持脏状态由下一轮对账处理。
    pub fn mark_synced(&self, entity: EntityType, id: i64, version: i64) -> StoreResult<bool> {
        let conn = self.db.get_conn()?;
        let changed = conn.execute(
            &format!(
                "UPDATE {} SET is_synced = 1
                 WHERE id = ?1 AND local_version = ?2 AND is_deleted = 0 AND is_synced = 0",
                entity.table_name()
            ),
            params![id, version],
        )?;
        drop(conn);
        if changed > 0 {
            self.db.notify_changed(entity);
        }
        Ok(changed > 0)
    }

    /// 云端删除确认后物理删除墓碑
    pub fn purge_tombstone(&self, entity: EntityType, id: i64, version: i64) -> StoreResult<bool> {
        let conn = self.db.get_conn()?;
        let changed = conn.execute(
            &format!(
                "DELETE FROM {} WHERE id = ?1 AND local_version = ?2 AND is_deleted = 1",
                entity.table_name()
            ),
            params![id, version],
        )?;
        drop(conn);
        if changed > 0 {
            self.db.notify_changed(entity);
        }
        Ok(changed > 0)
    }

    /// 无条件物理删除
    ///
    /// 不留墓碑，云端副本不会被删除。Repository 的删除路径走 [`tombstone`](Self::tombstone)；
    /// 此方法只用于从未上传或云端已确认删除的行。
    pub fn delete_by_id(&self, entity: EntityType, id: i64) -> StoreResult<bool> {
        let conn = self.db.get_conn()?;
        let changed = conn.execute(
            &format!("DELETE FROM {} WHERE id = ?1", entity.table_name()),
            params![id],
        )?;
        drop(conn);
        if changed > 0 {
            self.db.notify_changed(entity);
        }
        Ok(changed > 0)
    }

    /// 隔离记录：本地簿记出现致命错误后不再自动重试，直到下一次 Repository 写入
    pub fn block_record(&self, entity: EntityType, id: i64, version: i64) -> StoreResult<bool> {
        let conn = self.db.get_conn()?;
        let changed = conn.execute(
            &format!(
                "UPDATE {} SET sync_blocked = 1 WHERE id = ?1 AND local_version = ?2",
                entity.table_name()
            ),
            params![id, version],
        )?;
        if changed > 0 {
            warn!(
                "[LocalStore] {} {} blocked from automatic sync (version {})",
                entity, id, version
            );
        }
        Ok(changed > 0)
    }

    // ========================================================================
    // 诊断与账户认领
    // ========================================================================

    /// 各实体类型的待对账统计
    pub fn backlog(&self, owner_id: &str) -> StoreResult<Vec<SyncBacklog>> {
        let conn = self.db.get_conn()?;
        EntityType::ALL
            .iter()
            .map(|entity| {
                let (upserts, deletes, blocked): (i64, i64, i64) = conn.query_row(
                    &format!(
                        "SELECT
                            COALESCE(SUM(is_synced = 0 AND is_deleted = 0), 0),
                            COALESCE(SUM(is_synced = 0 AND is_deleted = 1), 0),
                            COALESCE(SUM(sync_blocked = 1), 0)
                         FROM {} WHERE owner_id = ?1",
                        entity.table_name()
                    ),
                    params![owner_id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )?;
                Ok(SyncBacklog {
                    entity: *entity,
                    pending_upserts: upserts.max(0) as u64,
                    pending_deletes: deletes.max(0) as u64,
                    blocked: blocked.max(0) as u64,
                })
            })
            .collect()
    }

    /// 把匿名哨兵下的全部记录转给已登录所有者，并全部置脏
    pub fn claim_anonymous(&self, owner_id: &str) -> StoreResult<usize> {
        let mut conn = self.db.get_conn()?;
        let tx = conn.transaction()?;
        let mut claimed = Vec::new();
        for entity in EntityType::ALL {
            let changed = tx.execute(
                &format!(
                    "UPDATE {} SET owner_id = ?1, is_synced = 0,
                        local_version = local_version + 1, sync_blocked = 0
                     WHERE owner_id = ?2",
                    entity.table_name()
                ),
                params![owner_id, ANONYMOUS_OWNER],
            )?;
            if changed > 0 {
                claimed.push((entity, changed));
            }
        }
        tx.commit()?;
        drop(conn);

        let total = claimed.iter().map(|(_, n)| n).sum();
        for (entity, _) in &claimed {
            self.db.notify_changed(*entity);
        }
        if total > 0 {
            info!(
                "[LocalStore] Claimed {} anonymous record(s) for owner {}",
                total, owner_id
            );
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{Category, Question, Test};

    fn setup_store() -> LocalStore {
        LocalStore::new(Arc::new(Database::in_memory().expect("Failed to open database")))
    }

    fn owned<R: SyncRecord>(mut record: R, owner: &str) -> R {
        record.meta_mut().owner_id = owner.to_string();
        record
    }

    #[test]
    fn test_insert_assigns_monotonic_ids() {
        let store = setup_store();
        let mut a = owned(Category::new("A"), "u1");
        let mut b = owned(Category::new("B"), "u1");
        store.insert_or_replace(&mut a).unwrap();
        store.insert_or_replace(&mut b).unwrap();

        assert!(a.id > 0);
        assert!(b.id > a.id);
        assert_eq!(a.meta.local_version, 1);
    }

    #[test]
    fn test_replace_bumps_version() {
        let store = setup_store();
        let mut cat = owned(Category::new("A"), "u1");
        store.insert_or_replace(&mut cat).unwrap();
        cat.name = "A2".into();
        store.insert_or_replace(&mut cat).unwrap();

        let stored: Category = store.get(cat.id).unwrap().unwrap();
        assert_eq!(stored.name, "A2");
        assert_eq!(stored.meta.local_version, 2);
    }

    #[test]
    fn test_update_requires_visible_row() {
        let store = setup_store();
        let mut cat = owned(Category::new("A"), "u1");
        store.insert_or_replace(&mut cat).unwrap();

        let stranger = owned(cat.clone(), "u2");
        assert!(matches!(
            store.update(&stranger),
            Err(StoreError::NotFound { .. })
        ));

        store.tombstone(EntityType::Category, "u1", cat.id).unwrap();
        assert!(matches!(store.update(&cat), Err(StoreError::NotFound { .. })));
    }

    #[test]
    fn test_replace_cannot_take_over_foreign_row() {
        let store = setup_store();
        let mut cat = owned(Category::new("Alice's"), "alice");
        store.insert_or_replace(&mut cat).unwrap();
        store
            .mark_synced(EntityType::Category, cat.id, cat.meta.local_version)
            .unwrap();

        let mut forged = owned(Category::new("Bob's"), "bob");
        forged.id = cat.id;
        assert!(matches!(
            store.insert_or_replace(&mut forged),
            Err(StoreError::NotFound { id, .. }) if id == cat.id
        ));

        let stored: Category = store.get(cat.id).unwrap().unwrap();
        assert_eq!(stored.name, "Alice's");
        assert_eq!(stored.meta.owner_id, "alice");
        assert_eq!(stored.meta.local_version, 1);
        assert!(stored.meta.is_synced);
    }

    #[test]
    fn test_mark_synced_is_version_guarded() {
        let store = setup_store();
        let mut cat = owned(Category::new("A"), "u1");
        store.insert_or_replace(&mut cat).unwrap();
        let pushed_version = cat.meta.local_version;

        // 推送期间发生新的本地写入
        cat.name = "changed".into();
        store.update(&cat).unwrap();

        assert!(!store
            .mark_synced(EntityType::Category, cat.id, pushed_version)
            .unwrap());
        let stored: Category = store.get(cat.id).unwrap().unwrap();
        assert!(!stored.meta.is_synced);
    }

    #[test]
    fn test_tombstone_is_idempotent_and_checks_owner() {
        let store = setup_store();
        let mut cat = owned(Category::new("A"), "u1");
        store.insert_or_replace(&mut cat).unwrap();

        assert!(store.tombstone(EntityType::Category, "u1", cat.id).unwrap());
        assert!(!store.tombstone(EntityType::Category, "u1", cat.id).unwrap());
        assert!(matches!(
            store.tombstone(EntityType::Category, "u2", cat.id),
            Err(StoreError::NotFound { .. })
        ));
    }

    #[test]
    fn test_purge_only_removes_tombstones() {
        let store = setup_store();
        let mut cat = owned(Category::new("A"), "u1");
        store.insert_or_replace(&mut cat).unwrap();
        assert!(!store
            .purge_tombstone(EntityType::Category, cat.id, cat.meta.local_version)
            .unwrap());

        store.tombstone(EntityType::Category, "u1", cat.id).unwrap();
        let tombstone: Category = store.get(cat.id).unwrap().unwrap();
        assert!(store
            .purge_tombstone(EntityType::Category, cat.id, tombstone.meta.local_version)
            .unwrap());
        assert!(store.get::<Category>(cat.id).unwrap().is_none());
    }

    #[test]
    fn test_delete_by_id_leaves_no_tombstone() {
        let store = setup_store();
        let mut cat = owned(Category::new("A"), "u1");
        store.insert_or_replace(&mut cat).unwrap();
        let rx = store.database().subscribe(EntityType::Category).unwrap();

        assert!(store.delete_by_id(EntityType::Category, cat.id).unwrap());
        assert!(rx.has_changed().unwrap());
        assert!(store.get::<Category>(cat.id).unwrap().is_none());
        let dirty: Vec<Category> = store.query(&RecordFilter::dirty("u1")).unwrap();
        assert!(dirty.is_empty());

        assert!(!store.delete_by_id(EntityType::Category, cat.id).unwrap());
    }

    #[test]
    fn test_cascade_tombstones_children_in_one_step() {
        let store = setup_store();
        let mut test = owned(Test::new(1, "Quiz"), "u1");
        store.insert_or_replace(&mut test).unwrap();
        for i in 0..3 {
            let mut q = owned(Question::new(test.id, format!("q{i}"), vec![], 0), "u1");
            store.insert_or_replace(&mut q).unwrap();
        }

        store.tombstone_test_with_questions("u1", test.id).unwrap();

        let visible: Vec<Question> = store.query(&RecordFilter::visible("u1")).unwrap();
        assert!(visible.is_empty());
        let dirty: Vec<Question> = store.query(&RecordFilter::dirty("u1")).unwrap();
        assert_eq!(dirty.len(), 3);
        assert!(dirty.iter().all(|q| q.meta.is_deleted));
    }

    #[test]
    fn test_blocked_records_leave_dirty_query_until_rewritten() {
        let store = setup_store();
        let mut cat = owned(Category::new("A"), "u1");
        store.insert_or_replace(&mut cat).unwrap();
        store
            .block_record(EntityType::Category, cat.id, cat.meta.local_version)
            .unwrap();

        let dirty: Vec<Category> = store.query(&RecordFilter::dirty("u1")).unwrap();
        assert!(dirty.is_empty());
        let backlog = store.backlog("u1").unwrap();
        assert_eq!(backlog[0].blocked, 1);

        store.update(&cat).unwrap();
        let dirty: Vec<Category> = store.query(&RecordFilter::dirty("u1")).unwrap();
        assert_eq!(dirty.len(), 1);
    }

    #[test]
    fn test_claim_anonymous_moves_records() {
        let store = setup_store();
        let mut cat = Category::new("A");
        store.insert_or_replace(&mut cat).unwrap();
        assert_eq!(cat.meta.owner_id, ANONYMOUS_OWNER);

        assert_eq!(store.claim_anonymous("u1").unwrap(), 1);
        let stored: Category = store.get(cat.id).unwrap().unwrap();
        assert_eq!(stored.meta.owner_id, "u1");
        assert!(stored.meta.is_dirty());
        assert_eq!(store.claim_anonymous("u1").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_observe_reemits_on_change() {
        let store = setup_store();
        let mut stream = store.observe::<Category>(RecordFilter::visible("u1"));

        let first = stream.next().await.unwrap().unwrap();
        assert!(first.is_empty());

        let mut cat = owned(Category::new("Math"), "u1");
        store.insert_or_replace(&mut cat).unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.len(), 1);

        store.tombstone(EntityType::Category, "u1", cat.id).unwrap();
        let third = stream.next().await.unwrap().unwrap();
        assert!(third.is_empty());
    }
}
