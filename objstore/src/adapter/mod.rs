//! Object store adapters
//!
//! Submodules:
//! - `localfs`: directory tree on the local filesystem
//! - `memory`: in-process map, shared through the connection pool
//! - `s3`: S3-compatible stores through aws-sdk-s3
//! - `gcs`: Google Cloud Storage through object_store
//! - `http`: read-only access to objects served over HTTP
//!
//! Every adapter translates its native failures into `StorageError` so that
//! callers never branch on the backend kind. Adapters keep no per-call state
//! and may be shared between workers once pooled.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::codec::Encoding;
use crate::error::Result;
use crate::target::BackendKind;

pub mod gcs;
pub mod http;
pub mod localfs;
pub mod memory;
pub mod s3;

pub use gcs::{GcsBackend, GcsConfig};
pub use http::{HttpBackend, HttpConfig};
pub use localfs::LocalFsBackend;
pub use memory::MemoryBackend;
pub use s3::{S3Backend, S3Config};

pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Object bytes as stored, before any decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawObject {
    pub data: Bytes,
    /// Content-encoding recorded by the backend, if any.
    pub encoding: Option<String>,
    pub content_type: Option<String>,
}

/// Attributes written alongside an object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectAttrs {
    pub encoding: Encoding,
    pub content_type: Option<String>,
    pub cache_control: Option<String>,
    pub metadata: HashMap<String, String>,
}

/// Capability set shared by every backend.
#[async_trait]
pub trait ObjectBackend: Send + Sync {
    /// `Ok(None)` only when the backend explicitly reports the key absent.
    async fn get_object(&self, key: &str) -> Result<Option<RawObject>>;

    async fn put_object(&self, key: &str, data: Bytes, attrs: &ObjectAttrs) -> Result<()>;

    /// Deleting a missing key succeeds unless `strict` is set.
    async fn delete_object(&self, key: &str, strict: bool) -> Result<()>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Lazily lists backend keys starting with `prefix`. Non-recursive
    /// listings only yield keys directly under the prefix's directory.
    fn list_objects(&self, prefix: &str, recursive: bool) -> BoxStream<'static, Result<String>>;
}

/// The closed set of backends a target can resolve to.
pub enum Backend {
    Local(LocalFsBackend),
    Memory(MemoryBackend),
    S3(S3Backend),
    Gcs(GcsBackend),
    Http(HttpBackend),
}

macro_rules! dispatch {
    ($self:ident, $backend:ident => $call:expr) => {
        match $self {
            Backend::Local($backend) => $call,
            Backend::Memory($backend) => $call,
            Backend::S3($backend) => $call,
            Backend::Gcs($backend) => $call,
            Backend::Http($backend) => $call,
        }
    };
}

impl Backend {
    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::Local(_) => BackendKind::Local,
            Backend::Memory(_) => BackendKind::Memory,
            Backend::S3(_) => BackendKind::S3,
            Backend::Gcs(_) => BackendKind::Gcs,
            Backend::Http(_) => BackendKind::Http,
        }
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Backend").field(&self.kind()).finish()
    }
}

#[async_trait]
impl ObjectBackend for Backend {
    async fn get_object(&self, key: &str) -> Result<Option<RawObject>> {
        dispatch!(self, b => b.get_object(key).await)
    }

    async fn put_object(&self, key: &str, data: Bytes, attrs: &ObjectAttrs) -> Result<()> {
        dispatch!(self, b => b.put_object(key, data, attrs).await)
    }

    async fn delete_object(&self, key: &str, strict: bool) -> Result<()> {
        dispatch!(self, b => b.delete_object(key, strict).await)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        dispatch!(self, b => b.exists(key).await)
    }

    fn list_objects(&self, prefix: &str, recursive: bool) -> BoxStream<'static, Result<String>> {
        dispatch!(self, b => b.list_objects(prefix, recursive))
    }
}

/// Walks an error's source chain looking for a transport-level failure
/// (refused or reset connection, timeout) as opposed to a backend answer.
pub(crate) fn is_transport_failure(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(err) = current {
        if let Some(req) = err.downcast_ref::<reqwest::Error>() {
            if req.is_connect() || req.is_timeout() {
                return true;
            }
        }
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            use std::io::ErrorKind::*;
            if matches!(
                io.kind(),
                ConnectionRefused | ConnectionReset | ConnectionAborted | NotConnected | TimedOut
            ) {
                return true;
            }
        }
        current = err.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_failure_in_source_chain() {
        #[derive(Debug)]
        struct Wrapper(std::io::Error);
        impl std::fmt::Display for Wrapper {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "wrapped")
            }
        }
        impl std::error::Error for Wrapper {
            fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
                Some(&self.0)
            }
        }

        let refused = Wrapper(std::io::Error::from(std::io::ErrorKind::ConnectionRefused));
        assert!(is_transport_failure(&refused));
        let denied = Wrapper(std::io::Error::from(std::io::ErrorKind::PermissionDenied));
        assert!(!is_transport_failure(&denied));
    }
}
