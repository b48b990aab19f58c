//! In-process object store, mainly for tests and scratch pipelines.
//!
//! The map lives inside the pooled connection, so every facade bound to the
//! same `mem://name` shares it until the pool entry is reset.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, stream::BoxStream};
use tokio::sync::RwLock;

use crate::adapter::{ObjectAttrs, ObjectBackend, RawObject};
use crate::error::{Result, StorageError};
use crate::target::is_direct_child;

#[derive(Debug, Clone)]
struct MemoryEntry {
    object: RawObject,
    attrs: ObjectAttrs,
}

#[derive(Clone)]
pub struct MemoryBackend {
    name: String,
    objects: Arc<RwLock<BTreeMap<String, MemoryEntry>>>,
}

impl MemoryBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            objects: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    /// Attributes the object was written with.
    pub async fn attrs(&self, key: &str) -> Option<ObjectAttrs> {
        self.objects
            .read()
            .await
            .get(key)
            .map(|entry| entry.attrs.clone())
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }
}

#[async_trait]
impl ObjectBackend for MemoryBackend {
    async fn get_object(&self, key: &str) -> Result<Option<RawObject>> {
        let objects = self.objects.read().await;
        Ok(objects.get(key).map(|entry| entry.object.clone()))
    }

    async fn put_object(&self, key: &str, data: Bytes, attrs: &ObjectAttrs) -> Result<()> {
        let entry = MemoryEntry {
            object: RawObject {
                data,
                encoding: attrs.encoding.header_value().map(str::to_owned),
                content_type: attrs.content_type.clone(),
            },
            attrs: attrs.clone(),
        };
        self.objects.write().await.insert(key.to_owned(), entry);
        Ok(())
    }

    async fn delete_object(&self, key: &str, strict: bool) -> Result<()> {
        let removed = self.objects.write().await.remove(key);
        if removed.is_none() && strict {
            return Err(StorageError::NotFound {
                target: format!("mem://{}", self.name),
                key: key.to_owned(),
            });
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.objects.read().await.contains_key(key))
    }

    fn list_objects(&self, prefix: &str, recursive: bool) -> BoxStream<'static, Result<String>> {
        let objects = self.objects.clone();
        let prefix = prefix.to_owned();
        // Snapshot on first poll: later writes do not affect a listing in flight.
        futures::stream::once(async move {
            let objects = objects.read().await;
            let keys: Vec<Result<String>> = objects
                .range(prefix.clone()..)
                .map(|(key, _)| key)
                .take_while(|key| key.starts_with(&prefix))
                .filter(|key| recursive || is_direct_child(&prefix, key))
                .map(|key| Ok(key.clone()))
                .collect();
            futures::stream::iter(keys)
        })
        .flatten()
        .boxed()
    }
}
