// Study Sync library entry
// 离线优先同步引擎：本地写入立即生效，后台对账推送到远端文档存储。

pub mod config;
pub mod database;
pub mod engine;
pub mod entities;
pub mod local_store;
pub mod logging;
pub mod models;
pub mod remote;
pub mod repos;
pub mod sync;
pub mod sync_meta;
pub mod test_utils;

pub use engine::SyncEngine;
pub use models::{AppError, AppErrorType, AppResult};
pub use sync_meta::{EntityType, OwnerContext, ANONYMOUS_OWNER};
