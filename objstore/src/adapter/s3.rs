//! S3 adapter on aws-sdk-s3: content-encoding/type headers, Content-MD5 on
//! every upload and concurrent multipart upload for large objects.
//!
//! Retries are left to the SDK's own retry policy; this layer adds none.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region, timeout::TimeoutConfig};
use aws_sdk_s3::{
    Client,
    error::SdkError,
    primitives::ByteStream,
    types::{CompletedMultipartUpload, CompletedPart},
};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use bytes::Bytes;
use futures::{StreamExt, stream::BoxStream};
use serde::Deserialize;
use tokio::sync::Semaphore;

use crate::adapter::{DEFAULT_CONTENT_TYPE, ObjectAttrs, ObjectBackend, RawObject};
use crate::error::{Result, StorageError};
use crate::target::BackendKind;

const MAX_KEY_BYTES: usize = 1024;

/// S3 connection options, shared by every bucket in a registry.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct S3Config {
    /// Region override; the SDK provider chain is used when unset.
    pub region: Option<String>,
    /// Custom endpoint for S3-compatible stores (MinIO, RustFS, ...).
    pub endpoint_url: Option<String>,
    pub force_path_style: bool,
    /// Multipart part size in bytes, 8-64MiB recommended.
    pub part_size: usize,
    /// Maximum concurrent part uploads per object.
    pub max_concurrency: usize,
    /// Per-operation timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            region: None,
            endpoint_url: None,
            force_path_style: false,
            part_size: 8 * 1024 * 1024, // 8MB
            max_concurrency: 8,
            timeout_secs: 30,
        }
    }
}

pub struct S3Backend {
    client: Client,
    bucket: String,
    config: S3Config,
}

macro_rules! with_attrs {
    ($req:expr, $attrs:expr) => {
        $req.set_content_encoding($attrs.encoding.header_value().map(str::to_owned))
            .content_type(
                $attrs
                    .content_type
                    .as_deref()
                    .unwrap_or(DEFAULT_CONTENT_TYPE),
            )
            .set_cache_control($attrs.cache_control.clone())
            .set_metadata((!$attrs.metadata.is_empty()).then(|| $attrs.metadata.clone()))
    };
}

impl S3Backend {
    pub async fn connect(bucket: impl Into<String>, config: &S3Config) -> Result<Self> {
        let timeouts = TimeoutConfig::builder()
            .operation_timeout(Duration::from_secs(config.timeout_secs))
            .build();
        let mut loader = aws_config::defaults(BehaviorVersion::latest()).timeout_config(timeouts);
        if let Some(region) = &config.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let Some(endpoint) = &config.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;
        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(config.force_path_style)
            .build();
        Ok(Self {
            client: Client::from_conf(s3_config),
            bucket: bucket.into(),
            config: config.clone(),
        })
    }

    fn target(&self) -> String {
        format!("s3://{}", self.bucket)
    }

    fn md5_base64(data: &[u8]) -> String {
        let sum = md5::compute(data);
        B64.encode(sum.0)
    }

    fn check_key(key: &str) -> Result<()> {
        let reason = if key.is_empty() {
            "key is empty"
        } else if key.len() > MAX_KEY_BYTES {
            "key exceeds 1024 bytes"
        } else {
            return Ok(());
        };
        Err(StorageError::InvalidKey {
            key: key.to_owned(),
            reason,
        })
    }

    fn translate<E, R>(&self, key: Option<&str>, err: SdkError<E, R>) -> StorageError
    where
        E: std::error::Error + Send + Sync + 'static,
        R: std::fmt::Debug + Send + Sync + 'static,
    {
        translate(&self.target(), key, err)
    }

    async fn put_single(&self, key: &str, data: Bytes, attrs: &ObjectAttrs) -> Result<()> {
        let checksum = Self::md5_base64(&data);
        let req = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_md5(checksum)
            .body(ByteStream::from(data));
        with_attrs!(req, attrs)
            .send()
            .await
            .map_err(|e| self.translate(Some(key), e))?;
        Ok(())
    }

    async fn put_multipart(&self, key: &str, data: Bytes, attrs: &ObjectAttrs) -> Result<()> {
        let req = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key);
        let create = with_attrs!(req, attrs)
            .send()
            .await
            .map_err(|e| self.translate(Some(key), e))?;
        let upload_id = create.upload_id().unwrap_or_default().to_string();

        let part_size = self.config.part_size.max(1);
        let semaphore = Semaphore::new(self.config.max_concurrency.max(1));
        let uploads = (0..data.len()).step_by(part_size).zip(1i32..).map(|(start, part_number)| {
            let end = (start + part_size).min(data.len());
            self.upload_part(key, &upload_id, part_number, data.slice(start..end), &semaphore)
        });

        let parts = match futures::future::try_join_all(uploads).await {
            Ok(parts) => parts,
            Err(e) => {
                let aborted = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await;
                if let Err(abort_err) = aborted {
                    tracing::error!(
                        key,
                        upload_id = %upload_id,
                        "failed to abort multipart upload: {abort_err}"
                    );
                }
                return Err(e);
            }
        };

        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(parts))
            .build();
        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|e| self.translate(Some(key), e))?;
        Ok(())
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Bytes,
        semaphore: &Semaphore,
    ) -> Result<CompletedPart> {
        let _permit = semaphore
            .acquire()
            .await
            .map_err(|e| StorageError::backend(BackendKind::S3, self.target(), Some(key), e))?;
        let checksum = Self::md5_base64(&data);
        let resp = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .content_md5(checksum)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| self.translate(Some(key), e))?;
        Ok(CompletedPart::builder()
            .part_number(part_number)
            .set_e_tag(resp.e_tag().map(str::to_owned))
            .build())
    }
}

/// Dispatch failures and timeouts never reached S3; everything else did.
fn translate<E, R>(target: &str, key: Option<&str>, err: SdkError<E, R>) -> StorageError
where
    E: std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug + Send + Sync + 'static,
{
    match err {
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) => {
            StorageError::connection(BackendKind::S3, target, key, err)
        }
        err => StorageError::backend(BackendKind::S3, target, key, err),
    }
}

#[async_trait]
impl ObjectBackend for S3Backend {
    async fn get_object(&self, key: &str) -> Result<Option<RawObject>> {
        Self::check_key(key)?;
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;
        match resp {
            Ok(out) => {
                let encoding = out.content_encoding().map(str::to_owned);
                let content_type = out.content_type().map(str::to_owned);
                let data = out.body.collect().await.map_err(|e| {
                    StorageError::connection(BackendKind::S3, self.target(), Some(key), e)
                })?;
                Ok(Some(RawObject {
                    data: data.into_bytes(),
                    encoding,
                    content_type,
                }))
            }
            Err(e) if e.as_service_error().is_some_and(|se| se.is_no_such_key()) => Ok(None),
            Err(e) => Err(self.translate(Some(key), e)),
        }
    }

    async fn put_object(&self, key: &str, data: Bytes, attrs: &ObjectAttrs) -> Result<()> {
        Self::check_key(key)?;
        if data.len() <= self.config.part_size {
            self.put_single(key, data, attrs).await
        } else {
            self.put_multipart(key, data, attrs).await
        }
    }

    async fn delete_object(&self, key: &str, strict: bool) -> Result<()> {
        Self::check_key(key)?;
        // S3 deletes are idempotent, so strictness needs its own probe.
        if strict && !self.exists(key).await? {
            return Err(StorageError::NotFound {
                target: self.target(),
                key: key.to_owned(),
            });
        }
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| self.translate(Some(key), e))?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Self::check_key(key)?;
        let resp = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;
        match resp {
            Ok(_) => Ok(true),
            Err(e) if e.as_service_error().is_some_and(|se| se.is_not_found()) => Ok(false),
            Err(e) => Err(self.translate(Some(key), e)),
        }
    }

    fn list_objects(&self, prefix: &str, recursive: bool) -> BoxStream<'static, Result<String>> {
        let pages = ListPages {
            client: self.client.clone(),
            bucket: self.bucket.clone(),
            prefix: prefix.to_owned(),
            delimiter: (!recursive).then(|| "/".to_owned()),
            token: None,
            exhausted: false,
            ready: VecDeque::new(),
        };
        futures::stream::try_unfold(pages, ListPages::next).boxed()
    }
}

/// ListObjectsV2 pagination, fetching a page only once the last is drained.
struct ListPages {
    client: Client,
    bucket: String,
    prefix: String,
    delimiter: Option<String>,
    token: Option<String>,
    exhausted: bool,
    ready: VecDeque<String>,
}

impl ListPages {
    async fn next(mut self) -> Result<Option<(String, Self)>> {
        loop {
            if let Some(key) = self.ready.pop_front() {
                return Ok(Some((key, self)));
            }
            if self.exhausted {
                return Ok(None);
            }
            let page = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&self.prefix)
                .set_delimiter(self.delimiter.clone())
                .set_continuation_token(self.token.take())
                .send()
                .await
                .map_err(|e| translate(&format!("s3://{}", self.bucket), None, e))?;
            self.ready.extend(
                page.contents()
                    .iter()
                    .filter_map(|object| object.key())
                    .map(str::to_owned),
            );
            self.token = page.next_continuation_token().map(str::to_owned);
            self.exhausted = self.token.is_none();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Encoding;

    #[test]
    fn test_md5_base64() {
        assert_eq!(S3Backend::md5_base64(b""), "1B2M2Y8AsgTpgAmY7PhCfg==");
    }

    #[test]
    fn test_check_key() {
        assert!(S3Backend::check_key("a/b.txt").is_ok());
        assert!(S3Backend::check_key("").is_err());
        assert!(S3Backend::check_key(&"k".repeat(1025)).is_err());
    }

    #[tokio::test]
    #[ignore = "requires an S3-compatible endpoint, see S3Config::endpoint_url"]
    async fn test_s3_backend() -> Result<()> {
        let config = S3Config {
            endpoint_url: Some("http://127.0.0.1:9000/".into()),
            force_path_style: true,
            ..Default::default()
        };
        let backend = S3Backend::connect("main", &config).await?;
        let attrs = ObjectAttrs {
            encoding: Encoding::Identity,
            ..Default::default()
        };
        backend
            .put_object("test_0", Bytes::from_static(b"hello"), &attrs)
            .await?;
        let res = backend.get_object("test_0").await?.expect("object was just written");
        assert_eq!(res.data, Bytes::from_static(b"hello"));
        backend.delete_object("test_0", true).await?;
        assert!(!backend.exists("test_0").await?);
        Ok(())
    }
}
