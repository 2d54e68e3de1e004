//! 本地数据库管理模块
//!
//! 提供同步引擎的 SQLite 数据库初始化和连接池管理。
//!
//! ## 设计原则
//! - **连接池管理**：使用 r2d2 管理连接池，WAL 模式支持读写并发
//! - **变更通知**：每次提交写入后按实体类型递增一个 watch 计数器，
//!   供可观察查询重新发射快照
//! - **内存模式**：测试使用单连接内存库，避免每个连接各自一份内存数据库

pub mod error;
pub mod schema;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::sync_meta::EntityType;
pub use error::{StoreError, StoreResult};

/// SQLite 连接池类型
pub type SqlitePool = Pool<SqliteConnectionManager>;

/// SQLite 池化连接类型
pub type SqlitePooledConnection = r2d2::PooledConnection<SqliteConnectionManager>;

/// 本地数据库
///
/// 持有连接池与每种实体类型的变更计数器。
pub struct Database {
    pool: SqlitePool,
    db_path: Option<PathBuf>,
    changes: HashMap<EntityType, watch::Sender<u64>>,
}

impl Database {
    /// 打开（或创建）磁盘数据库并初始化 Schema
    ///
    /// # Errors
    /// * 目录创建失败
    /// * 连接池构建失败
    /// * 建表失败
    pub fn new(db_path: &Path) -> StoreResult<Self> {
        info!("[Database] Opening database: {}", db_path.display());

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
            conn.pragma_update(None, "foreign_keys", "ON")?;
            // 使用 WAL 模式提升并发性能
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            // 写锁等待上限，超时交给上层重试
            conn.pragma_update(None, "busy_timeout", 5000i64)?;
            Ok(())
        });

        let pool = Pool::builder()
            .max_size(8) // SQLite 单写者模型下无需太多连接
            .min_idle(Some(1))
            .connection_timeout(Duration::from_secs(5))
            .idle_timeout(Some(Duration::from_secs(600)))
            .build(manager)
            .map_err(|e| StoreError::Pool(format!("Failed to create connection pool: {}", e)))?;

        Self::with_pool(pool, Some(db_path.to_path_buf()))
    }

    /// 单连接内存数据库（测试与演示用）
    pub fn in_memory() -> StoreResult<Self> {
        let manager = SqliteConnectionManager::memory()
            .with_init(|conn| conn.pragma_update(None, "foreign_keys", "ON"));
        let pool = Pool::builder()
            .max_size(1)
            // 连接被回收即丢失整个内存库
            .max_lifetime(None)
            .idle_timeout(None)
            .connection_timeout(Duration::from_secs(5))
            .build(manager)
            .map_err(|e| StoreError::Pool(format!("创建内存连接池失败: {}", e)))?;

        Self::with_pool(pool, None)
    }

    fn with_pool(pool: SqlitePool, db_path: Option<PathBuf>) -> StoreResult<Self> {
        {
            let conn = pool.get()?;
            schema::initialize(&conn)?;
        }

        let changes = EntityType::ALL
            .iter()
            .map(|entity| (*entity, watch::channel(0u64).0))
            .collect();

        Ok(Self {
            pool,
            db_path,
            changes,
        })
    }

    /// 获取数据库连接
    pub fn get_conn(&self) -> StoreResult<SqlitePooledConnection> {
        self.pool
            .get()
            .map_err(|e| StoreError::Pool(format!("Failed to get connection: {}", e)))
    }

    /// 数据库文件路径（内存库为 None）
    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    /// 标记某实体类型的数据已变更（写事务提交后调用）
    pub fn notify_changed(&self, entity: EntityType) {
        if let Some(sender) = self.changes.get(&entity) {
            sender.send_modify(|generation| *generation = generation.wrapping_add(1));
            debug!("[Database] {} changed (generation {})", entity, *sender.borrow());
        }
    }

    /// 订阅某实体类型的变更计数器
    pub fn subscribe(&self, entity: EntityType) -> Option<watch::Receiver<u64>> {
        self.changes.get(&entity).map(|sender| sender.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_file_database_creates_parent_dirs() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let path = temp_dir.path().join("nested").join("study.db");
        let db = Database::new(&path).expect("Failed to open database");
        assert_eq!(db.db_path(), Some(path.as_path()));
        assert!(path.exists());
    }

    #[test]
    fn test_notify_changed_bumps_generation() {
        let db = Database::in_memory().unwrap();
        let mut rx = db.subscribe(EntityType::Lesson).unwrap();
        let other = db.subscribe(EntityType::Category).unwrap();

        db.notify_changed(EntityType::Lesson);

        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), 1);
        assert!(!other.has_changed().unwrap());
    }
}
