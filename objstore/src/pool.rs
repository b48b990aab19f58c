//! Connection registry.
//!
//! Backend connections are expensive (TLS, credential loading), so each
//! `(kind, authority)` pair gets one shared `Backend` created on first
//! `acquire`. Concurrent acquires for a key wait on the same initialisation.
//! `reset` marks matching slots invalidated and drops them. An acquire that
//! raced with a reset notices the mark and starts over on a fresh slot, so
//! it never hands out a connection that was reset under it.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use once_cell::sync::{Lazy, OnceCell};
use tracing::{debug, info, warn};

use crate::adapter::{
    Backend, GcsBackend, HttpBackend, LocalFsBackend, MemoryBackend, S3Backend,
};
use crate::config::BackendSettings;
use crate::error::Result;
use crate::target::{BackendKind, PoolKey, Target};

/// Creates backend connections for the registry.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, kind: BackendKind, authority: &str) -> Result<Backend>;
}

/// Builds the real adapters from `BackendSettings`.
#[derive(Debug, Clone, Default)]
pub struct DefaultConnector {
    settings: BackendSettings,
}

impl DefaultConnector {
    pub fn new(settings: BackendSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Connector for DefaultConnector {
    async fn connect(&self, kind: BackendKind, authority: &str) -> Result<Backend> {
        Ok(match kind {
            BackendKind::Local => Backend::Local(LocalFsBackend::new(authority)),
            BackendKind::Memory => Backend::Memory(MemoryBackend::new(authority)),
            BackendKind::S3 => Backend::S3(S3Backend::connect(authority, &self.settings.s3).await?),
            BackendKind::Gcs => Backend::Gcs(GcsBackend::connect(authority, &self.settings.gcs)?),
            BackendKind::Http => {
                Backend::Http(HttpBackend::connect(authority, &self.settings.http)?)
            }
        })
    }
}

#[derive(Default)]
struct Slot {
    backend: tokio::sync::OnceCell<Arc<Backend>>,
    invalidated: AtomicBool,
}

/// A shared handle to a pooled backend.
#[derive(Clone)]
pub struct PooledConnection {
    key: PoolKey,
    backend: Arc<Backend>,
    slot: Arc<Slot>,
}

impl PooledConnection {
    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    /// False once the registry entry this came from has been reset.
    pub fn is_valid(&self) -> bool {
        !self.slot.invalidated.load(Ordering::Acquire)
    }

    /// Whether both handles point at the same connection instance.
    pub fn same_as(&self, other: &PooledConnection) -> bool {
        Arc::ptr_eq(&self.backend, &other.backend)
    }
}

impl Deref for PooledConnection {
    type Target = Backend;

    fn deref(&self) -> &Backend {
        &self.backend
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("key", &self.key)
            .field("valid", &self.is_valid())
            .finish()
    }
}

/// Which registry entries a `reset` drops. Unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResetFilter {
    pub kind: Option<BackendKind>,
    pub authority: Option<String>,
}

impl ResetFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn kind(kind: BackendKind) -> Self {
        Self {
            kind: Some(kind),
            authority: None,
        }
    }

    pub fn target(target: &Target) -> Self {
        Self {
            kind: Some(target.kind()),
            authority: Some(target.authority().to_owned()),
        }
    }

    fn matches(&self, (kind, authority): &PoolKey) -> bool {
        self.kind.is_none_or(|k| k == *kind)
            && self.authority.as_deref().is_none_or(|a| a == authority)
    }
}

pub struct ConnectionRegistry {
    connector: Arc<dyn Connector>,
    slots: Mutex<HashMap<PoolKey, Arc<Slot>>>,
}

impl ConnectionRegistry {
    pub fn new(settings: BackendSettings) -> Self {
        Self::with_connector(Arc::new(DefaultConnector::new(settings)))
    }

    pub fn with_connector(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<PoolKey, Arc<Slot>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn acquire(&self, target: &Target) -> Result<PooledConnection> {
        self.acquire_key(target.pool_key()).await
    }

    /// Returns the pooled connection for `key`, connecting on first use.
    /// A failed connect is not cached.
    pub async fn acquire_key(&self, key: PoolKey) -> Result<PooledConnection> {
        loop {
            let slot = self.slots().entry(key.clone()).or_default().clone();
            let backend = slot
                .backend
                .get_or_try_init(|| async {
                    debug!(kind = %key.0, authority = %key.1, "creating pooled connection");
                    self.connector.connect(key.0, &key.1).await.map(Arc::new)
                })
                .await?
                .clone();
            if slot.invalidated.load(Ordering::Acquire) {
                continue;
            }
            return Ok(PooledConnection { key, backend, slot });
        }
    }

    /// Drops every entry matching `filter`; returns how many were dropped.
    pub fn reset(&self, filter: &ResetFilter) -> usize {
        let mut slots = self.slots();
        let before = slots.len();
        slots.retain(|key, slot| {
            let keep = !filter.matches(key);
            if !keep {
                slot.invalidated.store(true, Ordering::Release);
            }
            keep
        });
        let dropped = before - slots.len();
        info!(?filter, dropped, "connection pool reset");
        dropped
    }

    /// Drops the entry `conn` came from, unless it was already replaced.
    pub fn invalidate(&self, conn: &PooledConnection) -> bool {
        let mut slots = self.slots();
        match slots.get(&conn.key) {
            Some(slot) if Arc::ptr_eq(slot, &conn.slot) => {
                slot.invalidated.store(true, Ordering::Release);
                slots.remove(&conn.key);
                warn!(kind = %conn.key.0, authority = %conn.key.1, "pooled connection invalidated");
                true
            }
            _ => false,
        }
    }

    /// Number of keys with a live or pending connection.
    pub fn len(&self) -> usize {
        self.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots().is_empty()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(BackendSettings::default())
    }
}

static SETTINGS: OnceCell<BackendSettings> = OnceCell::new();

static GLOBAL: Lazy<Arc<ConnectionRegistry>> = Lazy::new(|| {
    let settings = SETTINGS.get().cloned().unwrap_or_default();
    Arc::new(ConnectionRegistry::new(settings))
});

/// Sets the settings the process-wide registry is created with. Returns
/// false when the registry was already configured.
pub fn configure_global(settings: BackendSettings) -> bool {
    SETTINGS.set(settings).is_ok() && Lazy::get(&GLOBAL).is_none()
}

/// The process-wide registry used by `Storage::open`.
pub fn global() -> Arc<ConnectionRegistry> {
    GLOBAL.clone()
}

/// Drops every connection in the process-wide registry.
pub fn reset_connection_pools() -> usize {
    GLOBAL.reset(&ResetFilter::all())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Default)]
    struct CountingConnector {
        connects: AtomicUsize,
        fail_first: AtomicBool,
    }

    #[async_trait]
    impl Connector for CountingConnector {
        async fn connect(&self, _kind: BackendKind, authority: &str) -> Result<Backend> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.fail_first.swap(false, Ordering::SeqCst) {
                return Err(crate::error::StorageError::connection(
                    BackendKind::Memory,
                    authority,
                    None,
                    std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
                ));
            }
            Ok(Backend::Memory(MemoryBackend::new(authority)))
        }
    }

    fn key(name: &str) -> PoolKey {
        (BackendKind::Memory, name.to_owned())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_acquire_creates_once() {
        let connector = Arc::new(CountingConnector::default());
        let registry = Arc::new(ConnectionRegistry::with_connector(connector.clone()));

        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.acquire_key(key("a")).await.unwrap() })
            })
            .collect();
        let conns = futures::future::try_join_all(tasks).await.unwrap();

        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert!(conns.iter().all(|c| c.same_as(&conns[0])));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_reset_forces_recreation() {
        let connector = Arc::new(CountingConnector::default());
        let registry = ConnectionRegistry::with_connector(connector.clone());

        let first = registry.acquire_key(key("a")).await.unwrap();
        assert_eq!(registry.reset(&ResetFilter::all()), 1);
        assert!(!first.is_valid());

        let second = registry.acquire_key(key("a")).await.unwrap();
        assert!(!first.same_as(&second));
        assert!(second.is_valid());
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_reset_filters() {
        let registry = ConnectionRegistry::with_connector(Arc::new(CountingConnector::default()));
        registry.acquire_key(key("a")).await.unwrap();
        registry.acquire_key(key("b")).await.unwrap();
        registry
            .acquire_key((BackendKind::Local, "/tmp".to_owned()))
            .await
            .unwrap();

        let target: Target = "mem://a/prefix".parse().unwrap();
        assert_eq!(registry.reset(&ResetFilter::target(&target)), 1);
        assert_eq!(registry.reset(&ResetFilter::kind(BackendKind::S3)), 0);
        assert_eq!(registry.reset(&ResetFilter::kind(BackendKind::Memory)), 1);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_invalidate_only_matching_slot() {
        let registry = ConnectionRegistry::with_connector(Arc::new(CountingConnector::default()));
        let stale = registry.acquire_key(key("a")).await.unwrap();
        assert!(registry.invalidate(&stale));

        let fresh = registry.acquire_key(key("a")).await.unwrap();
        // A second report about the old handle must not drop the new one.
        assert!(!registry.invalidate(&stale));
        assert!(fresh.is_valid());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_connect_is_not_cached() {
        let connector = Arc::new(CountingConnector::default());
        connector.fail_first.store(true, Ordering::SeqCst);
        let registry = ConnectionRegistry::with_connector(connector.clone());

        let err = registry.acquire_key(key("a")).await.unwrap_err();
        assert!(err.is_connection());
        registry.acquire_key(key("a")).await.unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_reset_during_acquire_never_returns_stale() {
        let registry = Arc::new(ConnectionRegistry::with_connector(Arc::new(
            CountingConnector::default(),
        )));
        let pending = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.acquire_key(key("a")).await.unwrap() })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        registry.reset(&ResetFilter::all());
        let conn = pending.await.unwrap();
        assert!(conn.is_valid());
    }
}
