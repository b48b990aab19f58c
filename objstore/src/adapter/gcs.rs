//! Google Cloud Storage adapter on `object_store`'s gcp client.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt, stream::BoxStream};
use object_store::gcp::{GoogleCloudStorage, GoogleCloudStorageBuilder};
use object_store::path::Path;
use object_store::{
    Attribute, AttributeValue, Attributes, ObjectStore, PutOptions, PutPayload,
};
use serde::Deserialize;

use crate::adapter::{
    DEFAULT_CONTENT_TYPE, ObjectAttrs, ObjectBackend, RawObject, is_transport_failure,
};
use crate::error::{Result, StorageError};
use crate::target::{BackendKind, is_direct_child};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GcsConfig {
    /// Service account key file; application default credentials otherwise.
    pub service_account_path: Option<String>,
}

pub struct GcsBackend {
    store: Arc<GoogleCloudStorage>,
    bucket: String,
}

impl GcsBackend {
    pub fn connect(bucket: impl Into<String>, config: &GcsConfig) -> Result<Self> {
        let bucket = bucket.into();
        let mut builder = GoogleCloudStorageBuilder::from_env().with_bucket_name(&bucket);
        if let Some(path) = &config.service_account_path {
            builder = builder.with_service_account_path(path);
        }
        let store = builder
            .build()
            .map_err(|e| StorageError::backend(BackendKind::Gcs, format!("gs://{bucket}"), None, e))?;
        Ok(Self {
            store: Arc::new(store),
            bucket,
        })
    }

    fn target(&self) -> String {
        format!("gs://{}", self.bucket)
    }

    fn location(key: &str) -> Result<Path> {
        if key.is_empty() {
            return Err(StorageError::InvalidKey {
                key: key.to_owned(),
                reason: "key is empty",
            });
        }
        Path::parse(key).map_err(|_| StorageError::InvalidKey {
            key: key.to_owned(),
            reason: "not a valid object path",
        })
    }

    fn translate(&self, key: Option<&str>, err: object_store::Error) -> StorageError {
        translate(&self.target(), key, err)
    }
}

fn translate(target: &str, key: Option<&str>, err: object_store::Error) -> StorageError {
    match err {
        object_store::Error::NotFound { .. } => StorageError::NotFound {
            target: target.to_owned(),
            key: key.unwrap_or_default().to_owned(),
        },
        err if is_transport_failure(&err) => StorageError::connection(BackendKind::Gcs, target, key, err),
        err => StorageError::backend(BackendKind::Gcs, target, key, err),
    }
}

fn to_attributes(attrs: &ObjectAttrs) -> Attributes {
    let mut out = Attributes::new();
    if let Some(encoding) = attrs.encoding.header_value() {
        out.insert(Attribute::ContentEncoding, AttributeValue::from(encoding.to_owned()));
    }
    let content_type = attrs.content_type.as_deref().unwrap_or(DEFAULT_CONTENT_TYPE);
    out.insert(Attribute::ContentType, AttributeValue::from(content_type.to_owned()));
    if let Some(cache_control) = &attrs.cache_control {
        out.insert(Attribute::CacheControl, AttributeValue::from(cache_control.clone()));
    }
    for (name, value) in &attrs.metadata {
        out.insert(
            Attribute::Metadata(name.clone().into()),
            AttributeValue::from(value.clone()),
        );
    }
    out
}

fn attribute(attrs: &Attributes, name: &Attribute) -> Option<String> {
    attrs.get(name).map(|value| value.to_string())
}

#[async_trait]
impl ObjectBackend for GcsBackend {
    async fn get_object(&self, key: &str) -> Result<Option<RawObject>> {
        let location = Self::location(key)?;
        let result = match self.store.get(&location).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(self.translate(Some(key), e)),
        };
        let encoding = attribute(&result.attributes, &Attribute::ContentEncoding);
        let content_type = attribute(&result.attributes, &Attribute::ContentType);
        let data = result
            .bytes()
            .await
            .map_err(|e| self.translate(Some(key), e))?;
        Ok(Some(RawObject {
            data,
            encoding,
            content_type,
        }))
    }

    async fn put_object(&self, key: &str, data: Bytes, attrs: &ObjectAttrs) -> Result<()> {
        let location = Self::location(key)?;
        let opts = PutOptions {
            attributes: to_attributes(attrs),
            ..Default::default()
        };
        self.store
            .put_opts(&location, PutPayload::from(data), opts)
            .await
            .map_err(|e| self.translate(Some(key), e))?;
        Ok(())
    }

    async fn delete_object(&self, key: &str, strict: bool) -> Result<()> {
        let location = Self::location(key)?;
        match self.store.delete(&location).await {
            Ok(()) => Ok(()),
            Err(object_store::Error::NotFound { .. }) if !strict => Ok(()),
            Err(e) => Err(self.translate(Some(key), e)),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let location = Self::location(key)?;
        match self.store.head(&location).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(self.translate(Some(key), e)),
        }
    }

    fn list_objects(&self, prefix: &str, recursive: bool) -> BoxStream<'static, Result<String>> {
        // object_store prefixes match whole path segments, so list the
        // enclosing directory and filter on the raw string prefix.
        let dir = prefix.rfind('/').map(|idx| Path::from(&prefix[..idx]));
        let target = self.target();
        let wanted = prefix.to_owned();

        let keys: BoxStream<'static, object_store::Result<String>> = if recursive {
            self.store
                .list(dir.as_ref())
                .map_ok(|meta| meta.location.to_string())
                .boxed()
        } else {
            let store = self.store.clone();
            futures::stream::once(async move {
                let listing = store.list_with_delimiter(dir.as_ref()).await?;
                let keys: Vec<object_store::Result<String>> = listing
                    .objects
                    .into_iter()
                    .map(|meta| Ok(meta.location.to_string()))
                    .collect();
                Ok::<_, object_store::Error>(futures::stream::iter(keys))
            })
            .try_flatten()
            .boxed()
        };

        keys.map_err(move |e| translate(&target, None, e))
            .try_filter(move |key| {
                let keep = key.starts_with(&wanted) && (recursive || is_direct_child(&wanted, key));
                futures::future::ready(keep)
            })
            .boxed()
    }
}
