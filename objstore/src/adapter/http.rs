//! Read-only adapter for objects published over plain HTTP(S).

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use reqwest::{
    Client, StatusCode,
    header::{CONTENT_ENCODING, CONTENT_TYPE, HeaderName},
};
use serde::Deserialize;

use crate::adapter::{ObjectAttrs, ObjectBackend, RawObject, is_transport_failure};
use crate::error::{Result, StorageError};
use crate::target::{BackendKind, validate_key};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Whole-request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { timeout_secs: 30 }
    }
}

pub struct HttpBackend {
    client: Client,
    origin: String,
}

impl HttpBackend {
    /// `origin` is `scheme://host[:port]` without a trailing slash.
    pub fn connect(origin: impl Into<String>, config: &HttpConfig) -> Result<Self> {
        let origin = origin.into();
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| StorageError::connection(BackendKind::Http, origin.clone(), None, e))?;
        Ok(Self { client, origin })
    }

    fn url(&self, key: &str) -> String {
        format!("{}/{}", self.origin, key)
    }

    fn translate(&self, key: &str, err: reqwest::Error) -> StorageError {
        if is_transport_failure(&err) {
            StorageError::connection(BackendKind::Http, self.origin.clone(), Some(key), err)
        } else {
            StorageError::backend(BackendKind::Http, self.origin.clone(), Some(key), err)
        }
    }

    fn read_only(&self, key: Option<&str>, op: &str) -> StorageError {
        StorageError::backend(
            BackendKind::Http,
            self.origin.clone(),
            key,
            format!("{op} is not supported on a read-only http target"),
        )
    }
}

#[async_trait]
impl ObjectBackend for HttpBackend {
    async fn get_object(&self, key: &str) -> Result<Option<RawObject>> {
        validate_key(key)?;
        let resp = self
            .client
            .get(self.url(key))
            .send()
            .await
            .map_err(|e| self.translate(key, e))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = resp.error_for_status().map_err(|e| self.translate(key, e))?;
        let header = |name: HeaderName| {
            resp.headers()
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_owned)
        };
        let encoding = header(CONTENT_ENCODING).filter(|e| !e.eq_ignore_ascii_case("identity"));
        let content_type = header(CONTENT_TYPE);
        let data = resp.bytes().await.map_err(|e| self.translate(key, e))?;
        Ok(Some(RawObject {
            data,
            encoding,
            content_type,
        }))
    }

    async fn put_object(&self, key: &str, _data: Bytes, _attrs: &ObjectAttrs) -> Result<()> {
        Err(self.read_only(Some(key), "put"))
    }

    async fn delete_object(&self, key: &str, _strict: bool) -> Result<()> {
        Err(self.read_only(Some(key), "delete"))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        let resp = self
            .client
            .head(self.url(key))
            .send()
            .await
            .map_err(|e| self.translate(key, e))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        resp.error_for_status().map_err(|e| self.translate(key, e))?;
        Ok(true)
    }

    fn list_objects(&self, _prefix: &str, _recursive: bool) -> BoxStream<'static, Result<String>> {
        let err = self.read_only(None, "list");
        Box::pin(futures::stream::once(async move { Err::<String, _>(err) }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    #[tokio::test]
    async fn test_writes_are_rejected() {
        let backend = HttpBackend::connect("http://127.0.0.1:9", &HttpConfig::default()).unwrap();
        let err = backend
            .put_object("a", Bytes::new(), &ObjectAttrs::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Backend { .. }));
        assert!(backend.delete_object("a", false).await.is_err());
        let listed: Result<Vec<String>> = backend.list_objects("", true).try_collect().await;
        assert!(listed.is_err());
    }

    #[tokio::test]
    async fn test_unreachable_host_is_connection_error() {
        let config = HttpConfig { timeout_secs: 2 };
        let backend = HttpBackend::connect("http://127.0.0.1:9", &config).unwrap();
        let err = backend.get_object("missing").await.unwrap_err();
        assert!(err.is_connection(), "{err}");
    }
}
