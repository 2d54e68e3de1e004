//! 运行配置
//!
//! 来源（后者覆盖前者）：
//! 1. 内置默认值
//! 2. 配置文件（默认 `config/study_sync.toml`，不存在则跳过）
//! 3. `STUDY_SYNC__*` 环境变量（层级分隔符 `__`，如 `STUDY_SYNC__REMOTE__PROVIDER=memory`），
//!    启动时先从 `.env` 补充

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::models::{AppError, AppResult};
use crate::remote::{validate_owner_id, RemoteConfig};
use crate::sync::SchedulerConfig;
use crate::sync_meta::OwnerContext;

pub const DEFAULT_CONFIG_PATH: &str = "config/study_sync.toml";
const ENV_PREFIX: &str = "STUDY_SYNC";

/// 网络探测配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// 连通性探测间隔（秒）
    pub probe_interval_secs: u64,
    /// 启动时是否假定在线
    pub start_online: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            probe_interval_secs: 30,
            start_online: true,
        }
    }
}

impl NetworkConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub database_path: PathBuf,
    /// 已登录用户；为空表示匿名
    pub owner_id: Option<String>,
    /// 默认日志过滤（`RUST_LOG` 优先）
    pub log_filter: String,
    pub scheduler: SchedulerConfig,
    pub network: NetworkConfig,
    pub remote: RemoteConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/study_sync.db"),
            owner_id: None,
            log_filter: "info".to_string(),
            scheduler: SchedulerConfig::default(),
            network: NetworkConfig::default(),
            remote: RemoteConfig::default(),
        }
    }
}

impl SyncConfig {
    /// 进程入口：先加载 `.env`，再读取配置文件与环境变量
    ///
    /// `path` 为空时使用 [`DEFAULT_CONFIG_PATH`]。
    pub fn from_env_and_file(path: Option<&Path>) -> anyhow::Result<Self> {
        if let Ok(env_file) = dotenvy::dotenv() {
            debug!("[Config] Loaded {}", env_file.display());
        }
        Self::load(path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH)))
    }

    /// 从指定配置文件（不存在则跳过）与环境变量加载
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();
        if path.exists() {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let loaded = builder.build()?;
        let config: SyncConfig = loaded.try_deserialize()?;
        Ok(config)
    }

    pub fn owner_context(&self) -> OwnerContext {
        OwnerContext::from_optional(self.owner_id.as_deref())
    }

    pub fn validate(&self) -> AppResult<()> {
        self.remote.validate().map_err(AppError::configuration)?;
        if let OwnerContext::Authenticated(owner_id) = self.owner_context() {
            validate_owner_id(&owner_id)?;
        }
        if self.scheduler.max_attempts == 0 {
            return Err(AppError::configuration(
                "scheduler.max_attempts must be at least 1",
            ));
        }
        if self.scheduler.retry_max_delay_ms < self.scheduler.retry_min_delay_ms {
            return Err(AppError::configuration(
                "scheduler.retry_max_delay_ms must not be below retry_min_delay_ms",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::RemoteProvider;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_load_from_toml_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("study_sync.toml");
        fs::write(
            &path,
            r#"
database_path = "/tmp/study.db"
owner_id = "u1"

[scheduler]
periodic_interval_secs = 600
max_attempts = 3

[remote]
provider = "memory"
"#,
        )
        .unwrap();

        let config = SyncConfig::load(&path).unwrap();
        assert_eq!(config.database_path, PathBuf::from("/tmp/study.db"));
        assert_eq!(config.owner_context(), OwnerContext::authenticated("u1"));
        assert_eq!(config.scheduler.periodic_interval(), Duration::from_secs(600));
        assert_eq!(config.scheduler.max_attempts, 3);
        assert_eq!(
            config.scheduler.retry_min_delay_ms,
            SchedulerConfig::default().retry_min_delay_ms
        );
        assert_eq!(config.remote.provider, RemoteProvider::Memory);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_env_and_file_applies_env_overrides() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("study_sync.toml");
        fs::write(&path, "[network]\nprobe_interval_secs = 10\nstart_online = false\n").unwrap();
        std::env::set_var("STUDY_SYNC__NETWORK__PROBE_INTERVAL_SECS", "45");

        let config = SyncConfig::from_env_and_file(Some(&path)).unwrap();
        std::env::remove_var("STUDY_SYNC__NETWORK__PROBE_INTERVAL_SECS");

        assert_eq!(config.network.probe_interval(), Duration::from_secs(45));
        assert!(!config.network.start_online);
    }

    #[test]
    fn test_owner_must_be_a_path_segment() {
        let mut config = SyncConfig {
            owner_id: Some("../alice".into()),
            ..Default::default()
        };
        config.remote.provider = RemoteProvider::Memory;
        let err = config.validate().unwrap_err();
        assert_eq!(err.error_type, crate::models::AppErrorType::Configuration);

        config.owner_id = Some("alice".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_defaults_require_webdav_settings() {
        let config = SyncConfig::default();
        assert_eq!(config.owner_context(), OwnerContext::Anonymous);
        assert!(config.validate().is_err());
    }
}
