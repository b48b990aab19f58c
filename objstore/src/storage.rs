//! The storage facade.
//!
//! A `Storage` binds one target to a pooled backend, an execution strategy
//! and a default compression policy. Single calls and batches both go
//! through the strategy, so a thread-pool facade does all of its backend
//! I/O on its workers.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt, stream::BoxStream};
use serde::{Serialize, de::DeserializeOwned};
use tracing::instrument;

use crate::adapter::{DEFAULT_CONTENT_TYPE, ObjectAttrs, ObjectBackend};
use crate::codec::{self, Encoding, Method};
use crate::config::{CompressionPolicy, StorageOptions};
use crate::error::{Result, StorageError};
use crate::exec::{BatchOptions, Executor, Handler, Outcome, Request, Strategy, StrategyKind};
use crate::pool::{self, ConnectionRegistry, PooledConnection};
use crate::target::{Target, validate_key};

pub const JSON_CONTENT_TYPE: &str = "application/json";

/// A decoded object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageObject {
    /// Content after decompression.
    pub content: Bytes,
    /// Encoding the object was stored with.
    pub encoding: Encoding,
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GetOptions {
    /// Names the payload in codec errors; defaults to the key.
    pub label: Option<String>,
    /// Encoding to assume when the backend recorded none.
    pub encoding_hint: Option<Encoding>,
}

impl GetOptions {
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn encoding_hint(mut self, encoding: Encoding) -> Self {
        self.encoding_hint = Some(encoding);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutOptions {
    /// Overrides the facade's compression method.
    pub compress: Option<Encoding>,
    pub level: Option<u32>,
    /// `application/octet-stream` when unset.
    pub content_type: Option<String>,
    pub cache_control: Option<String>,
    pub metadata: HashMap<String, String>,
}

impl PutOptions {
    /// Accepts the same spellings as `codec::compress`, `true` included.
    pub fn compress<'a>(mut self, method: impl Into<Method<'a>>) -> Result<Self> {
        self.compress = Some(Encoding::resolve(method)?);
        Ok(self)
    }

    pub fn level(mut self, level: u32) -> Self {
        self.level = Some(level);
        self
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn cache_control(mut self, cache_control: impl Into<String>) -> Self {
        self.cache_control = Some(cache_control.into());
        self
    }

    pub fn metadata(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(name.into(), value.into());
        self
    }
}

/// A target bound to its registry. This is what strategies run requests on.
struct Binding {
    target: Target,
    registry: Arc<ConnectionRegistry>,
    compression: CompressionPolicy,
}

impl Binding {
    async fn connection(&self) -> Result<PooledConnection> {
        self.registry.acquire(&self.target).await
    }

    /// Connection failures poison the pooled entry they came from.
    fn settle<T>(&self, conn: &PooledConnection, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_connection() {
                self.registry.invalidate(conn);
            }
        }
        result
    }

    fn not_found(&self, key: &str) -> StorageError {
        StorageError::NotFound {
            target: self.target.to_string(),
            key: key.to_owned(),
        }
    }

    fn encode<'c>(
        &self,
        content: &'c [u8],
        method: Option<Encoding>,
        level: Option<u32>,
    ) -> Result<(Encoding, Cow<'c, [u8]>)> {
        let encoding = method.unwrap_or(self.compression.method);
        let level = match level {
            Some(level) => Some(level),
            None if encoding == self.compression.method => self.compression.level,
            None => None,
        };
        Ok((encoding, codec::compress(content, encoding, level)?))
    }

    #[instrument(level = "debug", skip(self, options), fields(target = %self.target))]
    async fn get(&self, key: &str, options: GetOptions) -> Result<StorageObject> {
        validate_key(key)?;
        let conn = self.connection().await?;
        let raw = self.settle(&conn, conn.get_object(&self.target.object_key(key)).await)?;
        let raw = raw.ok_or_else(|| self.not_found(key))?;

        let encoding = match raw.encoding.as_deref().filter(|e| !e.is_empty()) {
            Some(stored) => Encoding::resolve(stored)?,
            None => options.encoding_hint.unwrap_or_default(),
        };
        let label = options.label.as_deref().unwrap_or(key);
        let content = match codec::decompress(&raw.data, encoding, Some(label))? {
            Cow::Borrowed(_) => raw.data.clone(),
            Cow::Owned(decoded) => Bytes::from(decoded),
        };
        Ok(StorageObject {
            content,
            encoding,
            content_type: raw.content_type,
        })
    }

    #[instrument(level = "debug", skip(self, content, options), fields(target = %self.target, len = content.len()))]
    async fn put(&self, key: &str, content: Bytes, options: PutOptions) -> Result<()> {
        validate_key(key)?;
        let (encoding, data) = match self.encode(&content, options.compress, options.level)? {
            (encoding, Cow::Borrowed(_)) => (encoding, content.clone()),
            (encoding, Cow::Owned(encoded)) => (encoding, Bytes::from(encoded)),
        };
        let attrs = ObjectAttrs {
            encoding,
            content_type: Some(
                options
                    .content_type
                    .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_owned()),
            ),
            cache_control: options.cache_control,
            metadata: options.metadata,
        };
        let conn = self.connection().await?;
        let object_key = self.target.object_key(key);
        self.settle(&conn, conn.put_object(&object_key, data, &attrs).await)
    }

    async fn delete(&self, key: &str, strict: bool) -> Result<()> {
        validate_key(key)?;
        let conn = self.connection().await?;
        let object_key = self.target.object_key(key);
        match self.settle(&conn, conn.delete_object(&object_key, strict).await) {
            // Adapters name the backend key; callers know the facade key.
            Err(StorageError::NotFound { .. }) => Err(self.not_found(key)),
            other => other,
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        let conn = self.connection().await?;
        self.settle(&conn, conn.exists(&self.target.object_key(key)).await)
    }

    fn list(self: &Arc<Self>, prefix: &str, recursive: bool) -> BoxStream<'static, Result<String>> {
        let binding = self.clone();
        let prefix = self.target.object_key(prefix);
        futures::stream::once(async move {
            let conn = binding.connection().await?;
            let target = binding.target.clone();
            let registry = binding.registry.clone();
            let listed = conn.list_objects(&prefix, recursive);
            let keys = listed
                .map_ok(move |key| target.relative_key(&key).map(str::to_owned).unwrap_or(key))
                .inspect_err(move |e| {
                    if e.is_connection() {
                        registry.invalidate(&conn);
                    }
                });
            Ok::<_, StorageError>(keys)
        })
        .try_flatten()
        .boxed()
    }
}

#[async_trait]
impl Handler for Binding {
    async fn handle(&self, request: Request) -> Result<Outcome> {
        match request {
            Request::Get { key, options } => self.get(&key, options).await.map(Outcome::Object),
            Request::Put {
                key,
                content,
                options,
            } => self.put(&key, content, options).await.map(|()| Outcome::Stored),
            Request::Delete { key, strict } => {
                self.delete(&key, strict).await.map(|()| Outcome::Deleted)
            }
            Request::Exists { key } => self.exists(&key).await.map(Outcome::Exists),
        }
    }
}

fn expect<T>(
    key: &str,
    result: Result<Outcome>,
    pick: impl FnOnce(Outcome) -> Option<T>,
) -> Result<T> {
    result.and_then(|outcome| {
        pick(outcome).ok_or_else(|| StorageError::Worker {
            key: key.to_owned(),
            reason: "outcome does not match the request".to_owned(),
        })
    })
}

pub struct Storage {
    binding: Arc<Binding>,
    strategy: Strategy,
    options: StorageOptions,
}

impl Storage {
    /// Opens `target` against the process-wide connection registry.
    pub async fn open(target: &str, options: StorageOptions) -> Result<Self> {
        Self::open_in(pool::global(), target, options).await
    }

    /// Opens `target` against `registry`; the pooled connection is
    /// established here so that a bad target fails early.
    pub async fn open_in(
        registry: Arc<ConnectionRegistry>,
        target: &str,
        options: StorageOptions,
    ) -> Result<Self> {
        let target: Target = target.parse()?;
        let strategy = Strategy::new(options.strategy, options.concurrency)?;
        registry.acquire(&target).await?;
        Ok(Self {
            binding: Arc::new(Binding {
                target,
                registry,
                compression: options.compression,
            }),
            strategy,
            options,
        })
    }

    pub fn target(&self) -> &Target {
        &self.binding.target
    }

    pub fn strategy(&self) -> StrategyKind {
        self.strategy.kind()
    }

    pub fn options(&self) -> &StorageOptions {
        &self.options
    }

    /// Runs a mixed batch with the facade's default batch options.
    pub async fn submit(&self, batch: Vec<Request>) -> Result<Vec<Result<Outcome>>> {
        self.submit_with(batch, &self.options.batch_options()).await
    }

    pub async fn submit_with(
        &self,
        batch: Vec<Request>,
        options: &BatchOptions,
    ) -> Result<Vec<Result<Outcome>>> {
        let handler: Arc<dyn Handler> = self.binding.clone();
        self.strategy.submit(handler, batch, options).await
    }

    async fn run_one(&self, request: Request) -> Result<Outcome> {
        let key = request.key().to_owned();
        let mut results = self.submit(vec![request]).await?;
        results.pop().unwrap_or_else(|| {
            Err(StorageError::Worker {
                key,
                reason: "strategy returned no result".to_owned(),
            })
        })
    }

    pub async fn get(&self, key: &str) -> Result<StorageObject> {
        self.get_with(key, GetOptions::default()).await
    }

    pub async fn get_with(&self, key: &str, options: GetOptions) -> Result<StorageObject> {
        let request = Request::Get {
            key: key.to_owned(),
            options,
        };
        expect(key, self.run_one(request).await, Outcome::into_object)
    }

    pub async fn put(&self, key: &str, content: impl Into<Bytes>) -> Result<()> {
        self.put_with(key, content, PutOptions::default()).await
    }

    pub async fn put_with(
        &self,
        key: &str,
        content: impl Into<Bytes>,
        options: PutOptions,
    ) -> Result<()> {
        let request = Request::Put {
            key: key.to_owned(),
            content: content.into(),
            options,
        };
        expect(key, self.run_one(request).await, |o| {
            matches!(o, Outcome::Stored).then_some(())
        })
    }

    /// Deleting a missing key succeeds.
    pub async fn delete(&self, key: &str) -> Result<()> {
        self.delete_inner(key, false).await
    }

    /// Like `delete`, but a missing key fails with `NotFound`.
    pub async fn delete_strict(&self, key: &str) -> Result<()> {
        self.delete_inner(key, true).await
    }

    async fn delete_inner(&self, key: &str, strict: bool) -> Result<()> {
        let request = Request::Delete {
            key: key.to_owned(),
            strict,
        };
        expect(key, self.run_one(request).await, |o| {
            matches!(o, Outcome::Deleted).then_some(())
        })
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        expect(key, self.run_one(Request::exists(key)).await, Outcome::into_exists)
    }

    /// Lazily lists keys under `prefix`, relative to the facade's target.
    /// Listing is driven by the caller and does not use the strategy.
    pub fn list(&self, prefix: &str, recursive: bool) -> BoxStream<'static, Result<String>> {
        self.binding.list(prefix, recursive)
    }

    pub async fn list_all(&self, prefix: &str, recursive: bool) -> Result<Vec<String>> {
        self.list(prefix, recursive).try_collect().await
    }

    async fn many<T>(
        &self,
        batch: Vec<Request>,
        pick: impl Fn(Outcome) -> Option<T>,
    ) -> Result<Vec<Result<T>>> {
        let keys: Vec<String> = batch.iter().map(|r| r.key().to_owned()).collect();
        let results = self.submit(batch).await?;
        Ok(keys
            .iter()
            .zip(results)
            .map(|(key, result)| expect(key, result, &pick))
            .collect())
    }

    pub async fn get_many<I, K>(&self, keys: I) -> Result<Vec<Result<StorageObject>>>
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        let batch = keys.into_iter().map(Request::get).collect();
        self.many(batch, Outcome::into_object).await
    }

    pub async fn put_many<I, K, V>(&self, items: I) -> Result<Vec<Result<()>>>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Bytes>,
    {
        let batch = items
            .into_iter()
            .map(|(key, content)| Request::put(key, content))
            .collect();
        self.many(batch, |o| matches!(o, Outcome::Stored).then_some(()))
            .await
    }

    pub async fn delete_many<I, K>(&self, keys: I) -> Result<Vec<Result<()>>>
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        self.delete_batch(keys, false).await
    }

    /// Batched `delete_strict`: missing keys fail their own slot with `NotFound`.
    pub async fn delete_many_strict<I, K>(&self, keys: I) -> Result<Vec<Result<()>>>
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        self.delete_batch(keys, true).await
    }

    async fn delete_batch<I, K>(&self, keys: I, strict: bool) -> Result<Vec<Result<()>>>
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        let batch = keys
            .into_iter()
            .map(|key| Request::Delete {
                key: key.into(),
                strict,
            })
            .collect();
        self.many(batch, |o| matches!(o, Outcome::Deleted).then_some(()))
            .await
    }

    pub async fn exists_many<I, K>(&self, keys: I) -> Result<Vec<Result<bool>>>
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        let batch = keys.into_iter().map(Request::exists).collect();
        self.many(batch, Outcome::into_exists).await
    }

    pub async fn put_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let content = serde_json::to_vec(value).map_err(|source| StorageError::Json {
            key: key.to_owned(),
            source,
        })?;
        self.put_with(key, content, PutOptions::default().content_type(JSON_CONTENT_TYPE))
            .await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let object = self.get(key).await?;
        serde_json::from_slice(&object.content).map_err(|source| StorageError::Json {
            key: key.to_owned(),
            source,
        })
    }

    /// Compresses `content` with the facade's policy.
    pub fn encode(&self, content: &[u8]) -> Result<(Encoding, Bytes)> {
        let (encoding, data) = self.binding.encode(content, None, None)?;
        Ok((encoding, Bytes::from(data.into_owned())))
    }

    pub fn decode(&self, content: &[u8], encoding: Encoding, label: Option<&str>) -> Result<Bytes> {
        let data = codec::decompress(content, encoding, label)?;
        Ok(Bytes::from(data.into_owned()))
    }

    /// Drains the strategy per the configured `DrainPolicy`. Pooled
    /// connections stay in the registry for later facades.
    pub async fn close(mut self) {
        self.strategy.drain(self.options.drain).await;
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("target", &self.binding.target)
            .field("strategy", &self.strategy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendSettings;

    fn registry() -> Arc<ConnectionRegistry> {
        Arc::new(ConnectionRegistry::new(BackendSettings::default()))
    }

    async fn open(target: &str, options: StorageOptions) -> Storage {
        Storage::open_in(registry(), target, options).await.unwrap()
    }

    #[tokio::test]
    async fn test_policy_compresses_and_get_decodes() {
        let options = StorageOptions::default()
            .with_strategy(StrategyKind::Sequential)
            .with_compression(CompressionPolicy::gzip());
        let storage = open("mem://policy", options).await;
        storage.put("k", &b"hello"[..]).await.unwrap();

        let object = storage.get("k").await.unwrap();
        assert_eq!(object.content, Bytes::from_static(b"hello"));
        assert_eq!(object.encoding, Encoding::Gzip);
        assert_eq!(object.content_type.as_deref(), Some(DEFAULT_CONTENT_TYPE));
    }

    #[tokio::test]
    async fn test_per_call_override_beats_policy() {
        let options = StorageOptions::default()
            .with_strategy(StrategyKind::Fibers)
            .with_compression(CompressionPolicy::gzip());
        let storage = open("mem://override", options).await;
        let put = PutOptions::default().compress("br").unwrap().level(11);
        storage.put_with("k", &b"data"[..], put).await.unwrap();
        assert_eq!(storage.get("k").await.unwrap().encoding, Encoding::Brotli);

        let put = PutOptions::default().compress(false).unwrap();
        storage.put_with("plain", &b"data"[..], put).await.unwrap();
        assert_eq!(storage.get("plain").await.unwrap().encoding, Encoding::Identity);
    }

    #[tokio::test]
    async fn test_encoding_hint_applies_only_without_stored_encoding() {
        let registry = registry();
        let storage = Storage::open_in(registry.clone(), "mem://hint", StorageOptions::default())
            .await
            .unwrap();
        let gz = codec::compress(b"payload", "gzip", None).unwrap().into_owned();
        // Stored as identity bytes that happen to be gzip.
        storage.put("k", gz.clone()).await.unwrap();

        let hinted = GetOptions::default().encoding_hint(Encoding::Gzip);
        let object = storage.get_with("k", hinted).await.unwrap();
        assert_eq!(object.content, Bytes::from_static(b"payload"));
        assert_eq!(storage.get("k").await.unwrap().content, Bytes::from(gz));
        storage.close().await;
    }

    #[tokio::test]
    async fn test_malformed_payload_carries_label() {
        let storage = open("mem://label", StorageOptions::default()).await;
        storage.put("k", &b"not gzip"[..]).await.unwrap();
        let options = GetOptions::default()
            .label("layer/info")
            .encoding_hint(Encoding::Gzip);
        let err = storage.get_with("k", options).await.unwrap_err();
        assert!(matches!(err, StorageError::MalformedPayload { .. }));
        assert!(err.to_string().starts_with("layer/info:"), "{err}");
    }

    #[tokio::test]
    async fn test_prefix_is_applied_and_stripped() {
        let registry = registry();
        let scoped = Storage::open_in(registry.clone(), "mem://pfx/layer", StorageOptions::default())
            .await
            .unwrap();
        let root = Storage::open_in(registry, "mem://pfx", StorageOptions::default())
            .await
            .unwrap();
        scoped.put("a/b", &b"x"[..]).await.unwrap();
        assert!(root.exists("layer/a/b").await.unwrap());
        assert_eq!(scoped.list_all("a/", true).await.unwrap(), vec!["a/b"]);
    }

    #[tokio::test]
    async fn test_delete_strict_reports_facade_key() {
        let storage = open("mem://strict/pre", StorageOptions::default()).await;
        let err = storage.delete_strict("gone").await.unwrap_err();
        match err {
            StorageError::NotFound { key, target } => {
                assert_eq!(key, "gone");
                assert_eq!(target, "mem://strict/pre");
            }
            other => panic!("unexpected {other}"),
        }
    }

    #[tokio::test]
    async fn test_delete_many_strict_fails_only_missing_keys() {
        let storage = Storage::open_in(registry(), "mem://strict-many", StorageOptions::default())
            .await
            .unwrap();
        storage.put("present", &b"v"[..]).await.unwrap();
        let results = storage
            .delete_many_strict(["present", "absent"])
            .await
            .unwrap();
        assert!(results[0].is_ok());
        assert!(results[1].as_ref().unwrap_err().is_not_found());
        assert!(!storage.exists("present").await.unwrap());
    }

    #[tokio::test]
    async fn test_empty_key_is_rejected() {
        let storage = open("mem://keys", StorageOptions::default()).await;
        assert!(matches!(
            storage.get("").await.unwrap_err(),
            StorageError::InvalidKey { .. }
        ));
    }

    #[tokio::test]
    async fn test_encode_decode_pass_through() {
        let options = StorageOptions::default()
            .with_compression(CompressionPolicy::new(Encoding::Brotli, Some(3)));
        let storage = open("mem://codec", options).await;
        let (encoding, encoded) = storage.encode(b"abcabcabc").unwrap();
        assert_eq!(encoding, Encoding::Brotli);
        let decoded = storage.decode(&encoded, encoding, None).unwrap();
        assert_eq!(decoded, Bytes::from_static(b"abcabcabc"));
    }

    #[tokio::test]
    async fn test_bad_target_fails_open() {
        let err = Storage::open_in(registry(), "ftp://x", StorageOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidTarget { .. }));
    }
}
