//! WebDAV 文档存储
//!
//! 基于 reqwest 的 WebDAV 客户端，每个文档一个 JSON 文件：
//! `{root}/users/{owner}/{collection}/{id}.json`

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use base64::{engine::general_purpose, Engine as _};
use dashmap::DashSet;
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::config::WebDavConfig;
use super::{validate_owner_id, DocumentPath, RemoteError, RemoteResult, RemoteStore};

/// 传输层重试次数（不含首次）
const TRANSPORT_RETRIES: usize = 2;

/// WebDAV 文档存储
pub struct WebDavRemoteStore {
    base_url: Url,
    username: String,
    password: String,
    root: String,
    http: Client,
    /// 已确认存在的目录 URL
    known_dirs: DashSet<String>,
}

impl WebDavRemoteStore {
    pub fn new(config: WebDavConfig, root: String) -> RemoteResult<Self> {
        if config.endpoint.trim().is_empty() {
            return Err(RemoteError::Configuration(
                "WebDAV endpoint must not be empty".into(),
            ));
        }

        let url = Url::parse(config.endpoint.trim()).map_err(|e| {
            RemoteError::Configuration(format!("Invalid WebDAV endpoint: {e}"))
        })?;

        if url.cannot_be_a_base() {
            return Err(RemoteError::Configuration(format!(
                "WebDAV endpoint {url} cannot carry a path"
            )));
        }

        let is_local = matches!(url.host_str(), Some("localhost" | "127.0.0.1" | "[::1]"));
        if !is_local && url.scheme() != "https" {
            return Err(RemoteError::Configuration(
                "WebDAV endpoint must use HTTPS to protect Basic Auth credentials (HTTP only allowed for localhost)"
                    .to_string(),
            ));
        }

        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| RemoteError::Configuration(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url: url,
            username: config.username,
            password: config.password,
            root: root.trim_matches('/').to_string(),
            http,
            known_dirs: DashSet::new(),
        })
    }

    /// 构建 Basic 认证头
    fn auth_header(&self) -> String {
        let raw = format!("{}:{}", self.username, self.password);
        format!("Basic {}", general_purpose::STANDARD.encode(raw))
    }

    /// 在根目录下逐段拼接 URL
    ///
    /// 每段单独百分号编码，段内的 `/` 不会产生新层级。`directory` 为真时以 `/` 结尾。
    fn build_url(&self, segments: &[&str], directory: bool) -> Url {
        let mut url = self.base_url.clone();
        // new() 已排除 cannot-be-a-base 的 URL
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty();
            path.extend(self.root.split('/').filter(|s| !s.is_empty()));
            path.extend(segments);
            if directory {
                path.push("");
            }
        }
        url
    }

    /// 文档 URL：`{root}/users/{owner}/{collection}/{id}.json`
    fn document_url(&self, path: &DocumentPath) -> RemoteResult<Url> {
        validate_owner_id(&path.owner_id)?;
        let file = format!("{}.json", path.id);
        Ok(self.build_url(
            &["users", path.owner_id.as_str(), path.collection, file.as_str()],
            false,
        ))
    }

    fn mkcol_method() -> RemoteResult<Method> {
        Method::from_bytes(b"MKCOL")
            .map_err(|e| RemoteError::Configuration(format!("Invalid WebDAV method MKCOL: {e}")))
    }

    fn map_transport_error(method: &Method, err: reqwest::Error) -> RemoteError {
        if err.is_timeout() {
            RemoteError::Timeout(format!("WebDAV {method}: {err}"))
        } else {
            RemoteError::Network(format!("WebDAV {method} failed: {err}"))
        }
    }

    fn map_status(method: &Method, status: StatusCode) -> RemoteError {
        if status == StatusCode::TOO_MANY_REQUESTS {
            RemoteError::RateLimited
        } else {
            RemoteError::Http {
                status: status.as_u16(),
                message: format!(
                    "WebDAV {} {}",
                    method,
                    status.canonical_reason().unwrap_or("")
                ),
            }
        }
    }

    /// 发送 HTTP 请求（传输错误时指数退避重试）
    async fn request(
        &self,
        method: Method,
        url: &Url,
        body: Option<Vec<u8>>,
    ) -> RemoteResult<reqwest::Response> {
        let auth = self.auth_header();
        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(200))
            .with_max_delay(Duration::from_secs(2))
            .with_max_times(TRANSPORT_RETRIES);

        let send = || {
            let builder = self
                .http
                .request(method.clone(), url.clone())
                .header("Authorization", auth.clone());
            let builder = match &body {
                Some(b) => builder
                    .header("Content-Type", "application/json")
                    .body(b.clone()),
                None => builder,
            };
            builder.send()
        };

        send.retry(&backoff)
            .when(|e: &reqwest::Error| e.is_connect() || e.is_timeout())
            .await
            .map_err(|e| Self::map_transport_error(&method, e))
    }

    /// 确保文档所在集合存在（从根目录逐级 MKCOL，已确认的目录跳过）
    async fn ensure_collection(&self, path: &DocumentPath) -> RemoteResult<()> {
        validate_owner_id(&path.owner_id)?;
        let levels = ["users", path.owner_id.as_str(), path.collection];

        for depth in 0..=levels.len() {
            let dir = self.build_url(&levels[..depth], true);
            if self.known_dirs.contains(dir.as_str()) {
                continue;
            }
            let res = self.request(Self::mkcol_method()?, &dir, None).await?;
            // 405 / 409 表示目录已存在
            if !matches!(
                res.status(),
                StatusCode::OK
                    | StatusCode::CREATED
                    | StatusCode::METHOD_NOT_ALLOWED
                    | StatusCode::CONFLICT
            ) {
                debug!("[Remote::WebDAV] MKCOL {} returned {}", dir, res.status());
                continue;
            }
            self.known_dirs.insert(dir.into());
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for WebDavRemoteStore {
    fn provider_name(&self) -> &'static str {
        "WebDAV"
    }

    async fn check_connection(&self) -> RemoteResult<()> {
        let root = self.build_url(&[], true);
        let res = self.request(Self::mkcol_method()?, &root, None).await?;
        if matches!(
            res.status(),
            StatusCode::OK
                | StatusCode::CREATED
                | StatusCode::METHOD_NOT_ALLOWED
                | StatusCode::CONFLICT
        ) {
            return Ok(());
        }

        // 回退：GET 根目录
        let res = self.request(Method::GET, &root, None).await?;
        if res.status().is_success() || res.status() == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(Self::map_status(&Method::GET, res.status()))
        }
    }

    async fn put_document(&self, path: &DocumentPath, document: &Value) -> RemoteResult<()> {
        let url = self.document_url(path)?;
        self.ensure_collection(path).await?;

        let body = serde_json::to_vec(document)?;
        let res = self.request(Method::PUT, &url, Some(body)).await?;
        if res.status().is_success() {
            debug!("[Remote::WebDAV] PUT {} -> {}", url.path(), res.status());
            Ok(())
        } else {
            Err(Self::map_status(&Method::PUT, res.status()))
        }
    }

    async fn delete_document(&self, path: &DocumentPath) -> RemoteResult<()> {
        let url = self.document_url(path)?;
        let res = self.request(Method::DELETE, &url, None).await?;
        if res.status().is_success() || res.status() == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(Self::map_status(&Method::DELETE, res.status()))
        }
    }

    async fn get_document(&self, path: &DocumentPath) -> RemoteResult<Option<Value>> {
        let url = self.document_url(path)?;
        let res = self.request(Method::GET, &url, None).await?;
        if res.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !res.status().is_success() {
            return Err(Self::map_status(&Method::GET, res.status()));
        }

        let bytes = res
            .bytes()
            .await
            .map_err(|e| Self::map_transport_error(&Method::GET, e))?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync_meta::EntityType;
    use mockito::Matcher;
    use serde_json::json;

    fn store_for(server: &mockito::ServerGuard) -> WebDavRemoteStore {
        WebDavRemoteStore::new(
            WebDavConfig {
                endpoint: server.url(),
                username: "user".into(),
                password: "pass".into(),
            },
            "study-sync".into(),
        )
        .unwrap()
    }

    #[test]
    fn test_rejects_plain_http_for_remote_hosts() {
        let result = WebDavRemoteStore::new(
            WebDavConfig {
                endpoint: "http://dav.example.com/".into(),
                username: "user".into(),
                password: "pass".into(),
            },
            "root".into(),
        );
        assert!(matches!(result, Err(RemoteError::Configuration(_))));
    }

    #[test]
    fn test_document_url_joins_root_and_segments() {
        let store = WebDavRemoteStore::new(
            WebDavConfig {
                endpoint: "https://dav.example.com/dav/".into(),
                username: "user".into(),
                password: "".into(),
            },
            "/study-sync/".into(),
        )
        .unwrap();
        let url = store
            .document_url(&DocumentPath::new("u1", EntityType::Category, 1))
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://dav.example.com/dav/study-sync/users/u1/categories/1.json"
        );

        let url = store
            .document_url(&DocumentPath::new("ana maría", EntityType::Lesson, 2))
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://dav.example.com/dav/study-sync/users/ana%20mar%C3%ADa/lessons/2.json"
        );
        assert_eq!(
            store.build_url(&[], true).as_str(),
            "https://dav.example.com/dav/study-sync/"
        );
    }

    #[tokio::test]
    async fn test_owner_outside_namespace_sends_nothing() {
        let mut server = mockito::Server::new_async().await;
        let mkcol = server
            .mock("MKCOL", Matcher::Any)
            .expect(0)
            .create_async()
            .await;
        let put = server
            .mock("PUT", Matcher::Any)
            .expect(0)
            .create_async()
            .await;
        let delete = server
            .mock("DELETE", Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        let store = store_for(&server);
        for owner in ["../alice", "bob/../../alice", ".."] {
            let path = DocumentPath::new(owner, EntityType::Category, 1);
            assert!(matches!(
                store.put_document(&path, &json!({"name": "x"})).await,
                Err(RemoteError::Configuration(_))
            ));
            assert!(matches!(
                store.delete_document(&path).await,
                Err(RemoteError::Configuration(_))
            ));
        }

        mkcol.assert_async().await;
        put.assert_async().await;
        delete.assert_async().await;
    }

    #[tokio::test]
    async fn test_put_document_creates_collections_once() {
        let mut server = mockito::Server::new_async().await;
        let mkcol = server
            .mock("MKCOL", Matcher::Any)
            .with_status(201)
            .expect(4)
            .create_async()
            .await;
        let put = server
            .mock("PUT", Matcher::Regex(r"^/study-sync/users/u1/categories/\d+\.json$".into()))
            .match_header("authorization", "Basic dXNlcjpwYXNz")
            .match_body(Matcher::Json(json!({"name": "Math"})))
            .with_status(201)
            .expect(2)
            .create_async()
            .await;

        let store = store_for(&server);
        let doc = json!({"name": "Math"});
        store
            .put_document(&DocumentPath::new("u1", EntityType::Category, 1), &doc)
            .await
            .unwrap();
        store
            .put_document(&DocumentPath::new("u1", EntityType::Category, 2), &doc)
            .await
            .unwrap();

        mkcol.assert_async().await;
        put.assert_async().await;
    }

    #[tokio::test]
    async fn test_delete_missing_document_is_success() {
        let mut server = mockito::Server::new_async().await;
        let _delete = server
            .mock("DELETE", "/study-sync/users/u1/lessons/7.json")
            .with_status(404)
            .create_async()
            .await;

        let store = store_for(&server);
        let result = store
            .delete_document(&DocumentPath::new("u1", EntityType::Lesson, 7))
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_get_document_maps_status() {
        let mut server = mockito::Server::new_async().await;
        let _found = server
            .mock("GET", "/study-sync/users/u1/summaries/1.json")
            .with_status(200)
            .with_body(r#"{"content":"notes"}"#)
            .create_async()
            .await;
        let _missing = server
            .mock("GET", "/study-sync/users/u1/summaries/2.json")
            .with_status(404)
            .create_async()
            .await;
        let _limited = server
            .mock("GET", "/study-sync/users/u1/summaries/3.json")
            .with_status(429)
            .create_async()
            .await;

        let store = store_for(&server);
        let found = store
            .get_document(&DocumentPath::new("u1", EntityType::Summary, 1))
            .await
            .unwrap();
        assert_eq!(found, Some(json!({"content": "notes"})));

        let missing = store
            .get_document(&DocumentPath::new("u1", EntityType::Summary, 2))
            .await
            .unwrap();
        assert_eq!(missing, None);

        let limited = store
            .get_document(&DocumentPath::new("u1", EntityType::Summary, 3))
            .await;
        assert_eq!(limited, Err(RemoteError::RateLimited));
    }
}
