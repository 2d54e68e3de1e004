//! 本地 Schema
//!
//! 父子关系只以整数列表达，不声明外键：父记录的物理删除只取决于
//! 自身的云端删除确认，与子记录的对账进度无关。

use rusqlite::Connection;

use super::error::StoreResult;

/// 当前 Schema 版本（写入 `PRAGMA user_version`）
pub const CURRENT_SCHEMA_VERSION: i64 = 1;

/// 所有同步表共享的列
const SYNC_COLUMNS_SQL: &str = "
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    owner_id TEXT NOT NULL,
    is_synced INTEGER NOT NULL DEFAULT 0,
    is_deleted INTEGER NOT NULL DEFAULT 0,
    local_version INTEGER NOT NULL DEFAULT 1,
    sync_blocked INTEGER NOT NULL DEFAULT 0,";

/// (表名, 业务字段定义, 父外键列)
const TABLES: &[(&str, &str, Option<&str>)] = &[
    (
        "categories",
        "name TEXT NOT NULL,
         description TEXT,
         created_at INTEGER NOT NULL,
         updated_at INTEGER NOT NULL",
        None,
    ),
    (
        "lessons",
        "category_id INTEGER NOT NULL,
         title TEXT NOT NULL,
         content TEXT NOT NULL DEFAULT '',
         created_at INTEGER NOT NULL,
         updated_at INTEGER NOT NULL",
        Some("category_id"),
    ),
    (
        "flashcards",
        "lesson_id INTEGER NOT NULL,
         front TEXT NOT NULL,
         back TEXT NOT NULL,
         created_at INTEGER NOT NULL,
         updated_at INTEGER NOT NULL",
        Some("lesson_id"),
    ),
    (
        "tests",
        "lesson_id INTEGER NOT NULL,
         title TEXT NOT NULL,
         created_at INTEGER NOT NULL,
         updated_at INTEGER NOT NULL",
        Some("lesson_id"),
    ),
    (
        "questions",
        "test_id INTEGER NOT NULL,
         prompt TEXT NOT NULL,
         options_json TEXT NOT NULL DEFAULT '[]',
         answer_index INTEGER NOT NULL DEFAULT 0,
         created_at INTEGER NOT NULL,
         updated_at INTEGER NOT NULL",
        Some("test_id"),
    ),
    (
        "summaries",
        "lesson_id INTEGER NOT NULL,
         content TEXT NOT NULL,
         created_at INTEGER NOT NULL,
         updated_at INTEGER NOT NULL",
        Some("lesson_id"),
    ),
];

/// 建表（幂等）
pub fn initialize(conn: &Connection) -> StoreResult<()> {
    let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    if version >= CURRENT_SCHEMA_VERSION {
        return Ok(());
    }

    let mut sql = String::from("BEGIN;\n");
    for (table, fields, parent) in TABLES {
        sql.push_str(&format!(
            "CREATE TABLE IF NOT EXISTS {table} ({SYNC_COLUMNS_SQL}\n{fields});\n"
        ));
        sql.push_str(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_owner_synced ON {table}(owner_id, is_synced);\n"
        ));
        sql.push_str(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_owner_deleted ON {table}(owner_id, is_deleted);\n"
        ));
        if let Some(parent) = parent {
            sql.push_str(&format!(
                "CREATE INDEX IF NOT EXISTS idx_{table}_{parent} ON {table}({parent});\n"
            ));
        }
    }
    sql.push_str(&format!("PRAGMA user_version = {CURRENT_SCHEMA_VERSION};\nCOMMIT;"));

    conn.execute_batch(&sql)?;
    tracing::info!(
        "[Database] Schema initialized (version {} -> {})",
        version,
        CURRENT_SCHEMA_VERSION
    );
    Ok(())
}
