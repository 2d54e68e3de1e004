//! 远端文档存储
//!
//! 每个用户一个命名空间，每种实体类型一个集合，文档按本地 id 寻址：
//! `users/{ownerId}/{collection}/{id}`。
//!
//! ## 后端
//! - **Memory**: 进程内文档表，支持故障注入（测试与演示）
//! - **WebDAV**: 每个文档一个 JSON 文件

mod config;
mod memory;
mod webdav;

pub use config::{RemoteConfig, RemoteProvider, WebDavConfig};
pub use memory::{MemoryRemoteStore, RemoteCallStats};
pub use webdav::WebDavRemoteStore;

use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::sync_meta::EntityType;

pub type RemoteResult<T> = Result<T, RemoteError>;

/// 远端错误
///
/// 对 Worker 而言全部是暂时性的（结果为 `Retry`）。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Rate limited by remote store")]
    RateLimited,

    #[error("Remote returned HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Remote configuration error: {0}")]
    Configuration(String),
}

impl From<serde_json::Error> for RemoteError {
    fn from(err: serde_json::Error) -> Self {
        RemoteError::Serialization(err.to_string())
    }
}

/// 文档地址
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentPath {
    pub owner_id: String,
    pub collection: &'static str,
    pub id: i64,
}

impl DocumentPath {
    pub fn new(owner_id: impl Into<String>, entity: EntityType, id: i64) -> Self {
        Self {
            owner_id: owner_id.into(),
            collection: entity.collection(),
            id,
        }
    }
}

/// 校验所有者 id 可作为单个路径段使用
///
/// 拒绝空值、`.`/`..`、路径分隔符与控制字符。
pub fn validate_owner_id(owner_id: &str) -> RemoteResult<()> {
    let invalid = owner_id.trim().is_empty()
        || owner_id == "."
        || owner_id == ".."
        || owner_id
            .chars()
            .any(|c| c == '/' || c == '\\' || c.is_control());
    if invalid {
        return Err(RemoteError::Configuration(format!(
            "Owner id {owner_id:?} is not a valid path segment"
        )));
    }
    Ok(())
}

impl fmt::Display for DocumentPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "users/{}/{}/{}", self.owner_id, self.collection, self.id)
    }
}

/// 统一的远端文档存储接口
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// 后端名称（用于日志）
    fn provider_name(&self) -> &'static str;

    /// 检查远端是否可达
    async fn check_connection(&self) -> RemoteResult<()>;

    /// 以公开投影整体覆盖写入文档（按 id 幂等）
    async fn put_document(&self, path: &DocumentPath, document: &Value) -> RemoteResult<()>;

    /// 删除文档；文档不存在视为成功
    async fn delete_document(&self, path: &DocumentPath) -> RemoteResult<()>;

    /// 读取文档
    ///
    /// # Returns
    /// * `Ok(None)` - 文档不存在
    async fn get_document(&self, path: &DocumentPath) -> RemoteResult<Option<Value>>;
}

/// 根据配置创建远端存储
pub fn create_remote_store(config: &RemoteConfig) -> RemoteResult<Arc<dyn RemoteStore>> {
    config.validate().map_err(RemoteError::Configuration)?;

    match config.provider {
        RemoteProvider::Memory => Ok(Arc::new(MemoryRemoteStore::new())),
        RemoteProvider::WebDav => {
            let webdav = config
                .webdav
                .clone()
                .ok_or_else(|| RemoteError::Configuration("Missing WebDAV config".into()))?;
            Ok(Arc::new(WebDavRemoteStore::new(webdav, config.root())?))
        }
    }
}
