//! 可同步记录抽象与查询谓词

use rusqlite::types::Value;
use rusqlite::Row;
use serde::Serialize;

use crate::sync_meta::{EntityType, SyncMeta};

/// 查询结果中业务字段的起始列
///
/// 固定前缀：`id, owner_id, is_synced, is_deleted, local_version`
pub const FIELD_OFFSET: usize = 5;

/// 一张可同步表的记录
///
/// 实现者只描述业务字段；同步元数据列由 [`LocalStore`](super::LocalStore) 统一维护。
pub trait SyncRecord: Clone + Send + Sync + Serialize + 'static {
    const ENTITY: EntityType;

    /// 业务字段列名，顺序必须与 `field_values` / `from_row` 一致
    const FIELDS: &'static [&'static str];

    /// 指向父实体的外键列
    const PARENT_COLUMN: Option<&'static str> = None;

    fn id(&self) -> i64;
    fn set_id(&mut self, id: i64);
    fn meta(&self) -> &SyncMeta;
    fn meta_mut(&mut self) -> &mut SyncMeta;
    fn field_values(&self) -> Vec<Value>;

    /// 从查询行读取业务字段（从 [`FIELD_OFFSET`] 开始）
    fn from_row(id: i64, meta: SyncMeta, row: &Row<'_>) -> rusqlite::Result<Self>;

    /// 更新修改时间
    fn touch(&mut self, now_millis: i64);

    fn parent_id(&self) -> Option<i64> {
        None
    }

    /// 推送到云端的公开投影（不含同步元数据）
    fn projection(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }
}

/// 查询谓词
///
/// 各字段为 `None` 时不参与过滤。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    pub owner_id: Option<String>,
    pub is_synced: Option<bool>,
    pub is_deleted: Option<bool>,
    pub parent_id: Option<i64>,
    /// 是否包含被隔离（`sync_blocked`）的记录
    pub include_blocked: bool,
}

impl RecordFilter {
    /// 读取路径：某所有者下未删除的记录
    pub fn visible(owner_id: &str) -> Self {
        Self {
            owner_id: Some(owner_id.to_string()),
            is_deleted: Some(false),
            include_blocked: true,
            ..Default::default()
        }
    }

    /// Worker 路径：某所有者下全部待对账记录（含墓碑，不含被隔离记录）
    pub fn dirty(owner_id: &str) -> Self {
        Self {
            owner_id: Some(owner_id.to_string()),
            is_synced: Some(false),
            include_blocked: false,
            ..Default::default()
        }
    }

    pub fn with_parent(mut self, parent_id: Option<i64>) -> Self {
        self.parent_id = parent_id;
        self
    }

    /// 生成 WHERE 子句与参数
    pub(crate) fn to_sql(&self, parent_column: Option<&str>) -> (String, Vec<Value>) {
        let mut clauses = Vec::new();
        let mut params = Vec::new();

        if let Some(owner) = &self.owner_id {
            clauses.push("owner_id = ?".to_string());
            params.push(Value::Text(owner.clone()));
        }
        if let Some(synced) = self.is_synced {
            clauses.push("is_synced = ?".to_string());
            params.push(Value::Integer(synced as i64));
        }
        if let Some(deleted) = self.is_deleted {
            clauses.push("is_deleted = ?".to_string());
            params.push(Value::Integer(deleted as i64));
        }
        if let (Some(parent), Some(column)) = (self.parent_id, parent_column) {
            clauses.push(format!("{} = ?", column));
            params.push(Value::Integer(parent));
        }
        if !self.include_blocked {
            clauses.push("sync_blocked = 0".to_string());
        }

        if clauses.is_empty() {
            (String::new(), params)
        } else {
            (format!(" WHERE {}", clauses.join(" AND ")), params)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visible_filter_sql() {
        let (sql, params) = RecordFilter::visible("u1")
            .with_parent(Some(3))
            .to_sql(Some("lesson_id"));
        assert_eq!(sql, " WHERE owner_id = ? AND is_deleted = ? AND lesson_id = ?");
        assert_eq!(
            params,
            vec![Value::Text("u1".into()), Value::Integer(0), Value::Integer(3)]
        );
    }

    #[test]
    fn test_dirty_filter_excludes_blocked() {
        let (sql, _) = RecordFilter::dirty("u1").to_sql(None);
        assert_eq!(sql, " WHERE owner_id = ? AND is_synced = ? AND sync_blocked = 0");
    }

    #[test]
    fn test_parent_ignored_without_column() {
        let (sql, params) = RecordFilter::default()
            .with_parent(Some(1))
            .to_sql(None);
        assert_eq!(sql, " WHERE sync_blocked = 0");
        assert!(params.is_empty());
    }
}
