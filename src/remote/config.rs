//! 远端存储配置

use serde::{Deserialize, Serialize};

/// 远端提供商
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RemoteProvider {
    /// WebDAV（坚果云、Nextcloud、自建服务）
    #[default]
    WebDav,
    /// 进程内存储
    Memory,
}

impl std::fmt::Display for RemoteProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemoteProvider::WebDav => write!(f, "WebDAV"),
            RemoteProvider::Memory => write!(f, "Memory"),
        }
    }
}

/// WebDAV 配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct WebDavConfig {
    /// 服务器地址（如 https://dav.jianguoyun.com/dav/）
    pub endpoint: String,
    pub username: String,
    /// 密码或应用专用密码
    #[serde(default)]
    pub password: String,
}

/// 远端存储配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RemoteConfig {
    #[serde(default)]
    pub provider: RemoteProvider,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webdav: Option<WebDavConfig>,
    /// 根目录（所有文档位于其下）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<String>,
}

impl RemoteConfig {
    /// 根目录，默认 "study-sync"
    pub fn root(&self) -> String {
        self.root
            .as_deref()
            .filter(|r| !r.trim().is_empty())
            .unwrap_or("study-sync")
            .trim_matches('/')
            .to_string()
    }

    /// 验证配置是否完整
    pub fn validate(&self) -> Result<(), String> {
        match self.provider {
            RemoteProvider::Memory => Ok(()),
            RemoteProvider::WebDav => {
                let config = self.webdav.as_ref().ok_or("Missing WebDAV config")?;
                if config.endpoint.trim().is_empty() {
                    return Err("WebDAV endpoint must not be empty".into());
                }
                if config.username.trim().is_empty() {
                    return Err("WebDAV username must not be empty".into());
                }
                // 密码可以为空（部分服务支持匿名访问）
                Ok(())
            }
        }
    }
}
