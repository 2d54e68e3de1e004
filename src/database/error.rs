//! 本地存储错误类型

use crate::sync_meta::EntityType;

/// 本地存储操作结果类型别名
pub type StoreResult<T> = Result<T, StoreError>;

/// 本地存储错误
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{entity} {id} not found")]
    NotFound { entity: EntityType, id: i64 },

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// 是否为暂时性错误（连接池耗尽、写锁竞争）
    ///
    /// 暂时性错误让 Worker 返回 `Retry`；其余错误对单条记录是致命的。
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Pool(_) => true,
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

impl From<r2d2::Error> for StoreError {
    fn from(err: r2d2::Error) -> Self {
        StoreError::Pool(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}
