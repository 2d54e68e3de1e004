//! 同步元数据模型
//!
//! 每个可同步实体都携带 `{owner_id, is_synced, is_deleted}` 三元组，
//! 另加 `local_version` 作为本地写入计数。
//!
//! ## 语义
//! - `is_synced = false`：本地与云端存在差异，需要一次对账（dirty record）
//! - `is_deleted = true`：墓碑，所有读取路径都必须隐藏；物理行保留到云端确认删除
//! - `local_version`：每次 Repository 写入自增；Worker 只在版本未变时回写同步结果

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::models::{AppError, AppResult};

/// 未登录时使用的哨兵所有者
pub const ANONYMOUS_OWNER: &str = "anonymous";

/// 可同步实体类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Category,
    Lesson,
    FlashCard,
    Test,
    Question,
    Summary,
}

impl EntityType {
    pub const ALL: [EntityType; 6] = [
        EntityType::Category,
        EntityType::Lesson,
        EntityType::FlashCard,
        EntityType::Test,
        EntityType::Question,
        EntityType::Summary,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Category => "category",
            EntityType::Lesson => "lesson",
            EntityType::FlashCard => "flashcard",
            EntityType::Test => "test",
            EntityType::Question => "question",
            EntityType::Summary => "summary",
        }
    }

    /// 本地表名
    pub fn table_name(&self) -> &'static str {
        match self {
            EntityType::Category => "categories",
            EntityType::Lesson => "lessons",
            EntityType::FlashCard => "flashcards",
            EntityType::Test => "tests",
            EntityType::Question => "questions",
            EntityType::Summary => "summaries",
        }
    }

    /// 云端集合名（与表名一致）
    pub fn collection(&self) -> &'static str {
        self.table_name()
    }

    /// 写入是否必须有已登录身份
    ///
    /// 分类、课程、卡片允许匿名写入（落在哨兵所有者下）；
    /// 测验、题目、总结属于账户内容，匿名写入直接拒绝。
    pub fn requires_identity(&self) -> bool {
        matches!(
            self,
            EntityType::Test | EntityType::Question | EntityType::Summary
        )
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s || t.table_name() == s)
            .ok_or_else(|| AppError::validation(format!("unknown entity type: {}", s)))
    }
}

/// 附着在每条可同步记录上的元数据
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMeta {
    pub owner_id: String,
    pub is_synced: bool,
    pub is_deleted: bool,
    pub local_version: i64,
}

impl Default for SyncMeta {
    fn default() -> Self {
        Self {
            owner_id: ANONYMOUS_OWNER.to_string(),
            is_synced: false,
            is_deleted: false,
            local_version: 0,
        }
    }
}

impl SyncMeta {
    /// 是否需要对账
    pub fn is_dirty(&self) -> bool {
        !self.is_synced
    }
}

/// 显式所有权上下文，随每次 Repository / Worker 调用传入
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OwnerContext {
    Authenticated(String),
    Anonymous,
}

impl OwnerContext {
    pub fn authenticated(owner_id: impl Into<String>) -> Self {
        OwnerContext::Authenticated(owner_id.into())
    }

    /// 空白 id 视为未登录
    pub fn from_optional(owner_id: Option<&str>) -> Self {
        match owner_id.map(str::trim) {
            Some(id) if !id.is_empty() && id != ANONYMOUS_OWNER => {
                OwnerContext::Authenticated(id.to_string())
            }
            _ => OwnerContext::Anonymous,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self, OwnerContext::Authenticated(_))
    }

    /// 存储层使用的所有者 id（匿名时为哨兵值）
    pub fn owner_id(&self) -> &str {
        match self {
            OwnerContext::Authenticated(id) => id,
            OwnerContext::Anonymous => ANONYMOUS_OWNER,
        }
    }

    /// 解析某实体类型写入时的所有者
    ///
    /// # Errors
    /// 实体要求真实身份但当前为匿名时返回 `Unauthenticated`
    pub fn owner_for_write(&self, entity: EntityType) -> AppResult<&str> {
        if entity.requires_identity() && !self.is_authenticated() {
            return Err(AppError::unauthenticated(format!(
                "{} requires a signed-in user",
                entity
            )));
        }
        Ok(self.owner_id())
    }
}
