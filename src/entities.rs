//! 可同步实体定义
//!
//! 分类 → 课程 → {卡片, 测验 → 题目, 总结}。
//! `id` 由本地存储分配（0 表示尚未入库），同步元数据不参与序列化，
//! 序列化结果即云端文档的公开投影。

use rusqlite::types::Value;
use rusqlite::Row;
use serde::{Deserialize, Serialize};

use crate::local_store::record::{SyncRecord, FIELD_OFFSET};
use crate::sync_meta::{EntityType, SyncMeta};

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// 学习分类
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Category {
    pub id: i64,
    #[serde(skip)]
    pub meta: SyncMeta,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Category {
    pub fn new(name: impl Into<String>) -> Self {
        let now = now_millis();
        Self {
            id: 0,
            meta: SyncMeta::default(),
            name: name.into(),
            description: None,
            created_at: now,
            updated_at: now,
        }
    }
}

impl SyncRecord for Category {
    const ENTITY: EntityType = EntityType::Category;
    const FIELDS: &'static [&'static str] = &["name", "description", "created_at", "updated_at"];

    fn id(&self) -> i64 {
        self.id
    }
    fn set_id(&mut self, id: i64) {
        self.id = id;
    }
    fn meta(&self) -> &SyncMeta {
        &self.meta
    }
    fn meta_mut(&mut self) -> &mut SyncMeta {
        &mut self.meta
    }

    fn field_values(&self) -> Vec<Value> {
        vec![
            Value::from(self.name.clone()),
            Value::from(self.description.clone()),
            Value::from(self.created_at),
            Value::from(self.updated_at),
        ]
    }

    fn from_row(id: i64, meta: SyncMeta, row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id,
            meta,
            name: row.get(FIELD_OFFSET)?,
            description: row.get(FIELD_OFFSET + 1)?,
            created_at: row.get(FIELD_OFFSET + 2)?,
            updated_at: row.get(FIELD_OFFSET + 3)?,
        })
    }

    fn touch(&mut self, now_millis: i64) {
        self.updated_at = now_millis;
    }
}

/// 课程，隶属于分类
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lesson {
    pub id: i64,
    #[serde(skip)]
    pub meta: SyncMeta,
    pub category_id: i64,
    pub title: String,
    pub content: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Lesson {
    pub fn new(category_id: i64, title: impl Into<String>, content: impl Into<String>) -> Self {
        let now = now_millis();
        Self {
            id: 0,
            meta: SyncMeta::default(),
            category_id,
            title: title.into(),
            content: content.into(),
            created_at: now,
            updated_at: now,
        }
    }
}

impl SyncRecord for Lesson {
    const ENTITY: EntityType = EntityType::Lesson;
    const FIELDS: &'static [&'static str] =
        &["category_id", "title", "content", "created_at", "updated_at"];
    const PARENT_COLUMN: Option<&'static str> = Some("category_id");

    fn id(&self) -> i64 {
        self.id
    }
    fn set_id(&mut self, id: i64) {
        self.id = id;
    }
    fn meta(&self) -> &SyncMeta {
        &self.meta
    }
    fn meta_mut(&mut self) -> &mut SyncMeta {
        &mut self.meta
    }

    fn field_values(&self) -> Vec<Value> {
        vec![
            Value::from(self.category_id),
            Value::from(self.title.clone()),
            Value::from(self.content.clone()),
            Value::from(self.created_at),
            Value::from(self.updated_at),
        ]
    }

    fn from_row(id: i64, meta: SyncMeta, row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id,
            meta,
            category_id: row.get(FIELD_OFFSET)?,
            title: row.get(FIELD_OFFSET + 1)?,
            content: row.get(FIELD_OFFSET + 2)?,
            created_at: row.get(FIELD_OFFSET + 3)?,
            updated_at: row.get(FIELD_OFFSET + 4)?,
        })
    }

    fn touch(&mut self, now_millis: i64) {
        self.updated_at = now_millis;
    }

    fn parent_id(&self) -> Option<i64> {
        Some(self.category_id)
    }
}

/// 记忆卡片，隶属于课程
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlashCard {
    pub id: i64,
    #[serde(skip)]
    pub meta: SyncMeta,
    pub lesson_id: i64,
    pub front: String,
    pub back: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl FlashCard {
    pub fn new(lesson_id: i64, front: impl Into<String>, back: impl Into<String>) -> Self {
        let now = now_millis();
        Self {
            id: 0,
            meta: SyncMeta::default(),
            lesson_id,
            front: front.into(),
            back: back.into(),
            created_at: now,
            updated_at: now,
        }
    }
}

impl SyncRecord for FlashCard {
    const ENTITY: EntityType = EntityType::FlashCard;
    const FIELDS: &'static [&'static str] =
        &["lesson_id", "front", "back", "created_at", "updated_at"];
    const PARENT_COLUMN: Option<&'static str> = Some("lesson_id");

    fn id(&self) -> i64 {
        self.id
    }
    fn set_id(&mut self, id: i64) {
        self.id = id;
    }
    fn meta(&self) -> &SyncMeta {
        &self.meta
    }
    fn meta_mut(&mut self) -> &mut SyncMeta {
        &mut self.meta
    }

    fn field_values(&self) -> Vec<Value> {
        vec![
            Value::from(self.lesson_id),
            Value::from(self.front.clone()),
            Value::from(self.back.clone()),
            Value::from(self.created_at),
            Value::from(self.updated_at),
        ]
    }

    fn from_row(id: i64, meta: SyncMeta, row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id,
            meta,
            lesson_id: row.get(FIELD_OFFSET)?,
            front: row.get(FIELD_OFFSET + 1)?,
            back: row.get(FIELD_OFFSET + 2)?,
            created_at: row.get(FIELD_OFFSET + 3)?,
            updated_at: row.get(FIELD_OFFSET + 4)?,
        })
    }

    fn touch(&mut self, now_millis: i64) {
        self.updated_at = now_millis;
    }

    fn parent_id(&self) -> Option<i64> {
        Some(self.lesson_id)
    }
}

/// 测验，隶属于课程；删除时级联墓碑其题目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Test {
    pub id: i64,
    #[serde(skip)]
    pub meta: SyncMeta,
    pub lesson_id: i64,
    pub title: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Test {
    pub fn new(lesson_id: i64, title: impl Into<String>) -> Self {
        let now = now_millis();
        Self {
            id: 0,
            meta: SyncMeta::default(),
            lesson_id,
            title: title.into(),
            created_at: now,
            updated_at: now,
        }
    }
}

impl SyncRecord for Test {
    const ENTITY: EntityType = EntityType::Test;
    const FIELDS: &'static [&'static str] = &["lesson_id", "title", "created_at", "updated_at"];
    const PARENT_COLUMN: Option<&'static str> = Some("lesson_id");

    fn id(&self) -> i64 {
        self.id
    }
    fn set_id(&mut self, id: i64) {
        self.id = id;
    }
    fn meta(&self) -> &SyncMeta {
        &self.meta
    }
    fn meta_mut(&mut self) -> &mut SyncMeta {
        &mut self.meta
    }

    fn field_values(&self) -> Vec<Value> {
        vec![
            Value::from(self.lesson_id),
            Value::from(self.title.clone()),
            Value::from(self.created_at),
            Value::from(self.updated_at),
        ]
    }

    fn from_row(id: i64, meta: SyncMeta, row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id,
            meta,
            lesson_id: row.get(FIELD_OFFSET)?,
            title: row.get(FIELD_OFFSET + 1)?,
            created_at: row.get(FIELD_OFFSET + 2)?,
            updated_at: row.get(FIELD_OFFSET + 3)?,
        })
    }

    fn touch(&mut self, now_millis: i64) {
        self.updated_at = now_millis;
    }

    fn parent_id(&self) -> Option<i64> {
        Some(self.lesson_id)
    }
}

/// 测验题目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Question {
    pub id: i64,
    #[serde(skip)]
    pub meta: SyncMeta,
    pub test_id: i64,
    pub prompt: String,
    pub options: Vec<String>,
    pub answer_index: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Question {
    pub fn new(
        test_id: i64,
        prompt: impl Into<String>,
        options: Vec<String>,
        answer_index: i64,
    ) -> Self {
        let now = now_millis();
        Self {
            id: 0,
            meta: SyncMeta::default(),
            test_id,
            prompt: prompt.into(),
            options,
            answer_index,
            created_at: now,
            updated_at: now,
        }
    }
}

impl SyncRecord for Question {
    const ENTITY: EntityType = EntityType::Question;
    const FIELDS: &'static [&'static str] = &[
        "test_id",
        "prompt",
        "options_json",
        "answer_index",
        "created_at",
        "updated_at",
    ];
    const PARENT_COLUMN: Option<&'static str> = Some("test_id");

    fn id(&self) -> i64 {
        self.id
    }
    fn set_id(&mut self, id: i64) {
        self.id = id;
    }
    fn meta(&self) -> &SyncMeta {
        &self.meta
    }
    fn meta_mut(&mut self) -> &mut SyncMeta {
        &mut self.meta
    }

    fn field_values(&self) -> Vec<Value> {
        // Vec<String> 的序列化不会失败
        let options_json = serde_json::to_string(&self.options).unwrap_or_else(|_| "[]".into());
        vec![
            Value::from(self.test_id),
            Value::from(self.prompt.clone()),
            Value::from(options_json),
            Value::from(self.answer_index),
            Value::from(self.created_at),
            Value::from(self.updated_at),
        ]
    }

    fn from_row(id: i64, meta: SyncMeta, row: &Row<'_>) -> rusqlite::Result<Self> {
        let options_json: String = row.get(FIELD_OFFSET + 2)?;
        let options = serde_json::from_str(&options_json).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                FIELD_OFFSET + 2,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })?;
        Ok(Self {
            id,
            meta,
            test_id: row.get(FIELD_OFFSET)?,
            prompt: row.get(FIELD_OFFSET + 1)?,
            options,
            answer_index: row.get(FIELD_OFFSET + 3)?,
            created_at: row.get(FIELD_OFFSET + 4)?,
            updated_at: row.get(FIELD_OFFSET + 5)?,
        })
    }

    fn touch(&mut self, now_millis: i64) {
        self.updated_at = now_millis;
    }

    fn parent_id(&self) -> Option<i64> {
        Some(self.test_id)
    }
}

/// 课程总结
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub id: i64,
    #[serde(skip)]
    pub meta: SyncMeta,
    pub lesson_id: i64,
    pub content: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Summary {
    pub fn new(lesson_id: i64, content: impl Into<String>) -> Self {
        let now = now_millis();
        Self {
            id: 0,
            meta: SyncMeta::default(),
            lesson_id,
            content: content.into(),
            created_at: now,
            updated_at: now,
        }
    }
}

impl SyncRecord for Summary {
    const ENTITY: EntityType = EntityType::Summary;
    const FIELDS: &'static [&'static str] = &["lesson_id", "content", "created_at", "updated_at"];
    const PARENT_COLUMN: Option<&'static str> = Some("lesson_id");

    fn id(&self) -> i64 {
        self.id
    }
    fn set_id(&mut self, id: i64) {
        self.id = id;
    }
    fn meta(&self) -> &SyncMeta {
        &self.meta
    }
    fn meta_mut(&mut self) -> &mut SyncMeta {
        &mut self.meta
    }

    fn field_values(&self) -> Vec<Value> {
        vec![
            Value::from(self.lesson_id),
            Value::from(self.content.clone()),
            Value::from(self.created_at),
            Value::from(self.updated_at),
        ]
    }

    fn from_row(id: i64, meta: SyncMeta, row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id,
            meta,
            lesson_id: row.get(FIELD_OFFSET)?,
            content: row.get(FIELD_OFFSET + 1)?,
            created_at: row.get(FIELD_OFFSET + 2)?,
            updated_at: row.get(FIELD_OFFSET + 3)?,
        })
    }

    fn touch(&mut self, now_millis: i64) {
        self.updated_at = now_millis;
    }

    fn parent_id(&self) -> Option<i64> {
        Some(self.lesson_id)
    }
}
