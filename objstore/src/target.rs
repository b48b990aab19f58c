//! Target location parsing.
//!
//! A target string picks the backend by its scheme:
//!
//! ```text
//! file:///abs/root, /abs/root, ./rel/root  -> local filesystem
//! s3://<bucket>[/<prefix>]                 -> S3
//! gs://<bucket>[/<prefix>]                 -> Google Cloud Storage
//! mem://<name>[/<prefix>]                  -> in-process memory store
//! http(s)://<host>[/<prefix>]              -> read-only HTTP
//! ```
//!
//! The authority (bucket, memory name, local root or http origin) selects the
//! pooled connection; the prefix is prepended to every key.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StorageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Local,
    Memory,
    S3,
    Gcs,
    Http,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendKind::Local => "file",
            BackendKind::Memory => "mem",
            BackendKind::S3 => "s3",
            BackendKind::Gcs => "gs",
            BackendKind::Http => "http",
        };
        f.write_str(name)
    }
}

/// Key of a pooled connection.
pub type PoolKey = (BackendKind, String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    kind: BackendKind,
    authority: String,
    prefix: String,
    raw: String,
}

impl Target {
    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Key prefix inside the authority, empty or ending in `/`.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn pool_key(&self) -> PoolKey {
        (self.kind, self.authority.clone())
    }

    /// Backend key for a caller key.
    pub fn object_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    /// Caller key for a backend key, `None` when it lies outside the prefix.
    pub fn relative_key<'k>(&self, object_key: &'k str) -> Option<&'k str> {
        object_key.strip_prefix(self.prefix.as_str())
    }

    fn invalid(raw: &str, reason: impl Into<String>) -> StorageError {
        StorageError::InvalidTarget {
            target: raw.to_owned(),
            reason: reason.into(),
        }
    }

    fn bucket_style(kind: BackendKind, raw: &str, rest: &str) -> Result<Self> {
        let (authority, path) = rest.split_once('/').unwrap_or((rest, ""));
        if authority.is_empty() {
            return Err(Self::invalid(raw, "missing bucket name"));
        }
        Ok(Self {
            kind,
            authority: authority.to_owned(),
            prefix: normalize_prefix(path),
            raw: raw.to_owned(),
        })
    }
}

fn normalize_prefix(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{trimmed}/")
    }
}

impl FromStr for Target {
    type Err = StorageError;

    fn from_str(raw: &str) -> Result<Self> {
        if raw.is_empty() {
            return Err(Self::invalid(raw, "empty target"));
        }
        let Some((scheme, rest)) = raw.split_once("://") else {
            let root = match raw.trim_end_matches('/') {
                "" => "/",
                root => root,
            };
            return Ok(Self {
                kind: BackendKind::Local,
                authority: root.to_owned(),
                prefix: String::new(),
                raw: raw.to_owned(),
            });
        };

        match scheme.to_ascii_lowercase().as_str() {
            "file" => {
                let root = rest.trim_end_matches('/');
                if root.is_empty() {
                    return Err(Self::invalid(raw, "missing filesystem path"));
                }
                Ok(Self {
                    kind: BackendKind::Local,
                    authority: root.to_owned(),
                    prefix: String::new(),
                    raw: raw.to_owned(),
                })
            }
            "s3" => Self::bucket_style(BackendKind::S3, raw, rest),
            "gs" => Self::bucket_style(BackendKind::Gcs, raw, rest),
            "mem" => Self::bucket_style(BackendKind::Memory, raw, rest),
            scheme @ ("http" | "https") => {
                let (host, path) = rest.split_once('/').unwrap_or((rest, ""));
                if host.is_empty() {
                    return Err(Self::invalid(raw, "missing host"));
                }
                Ok(Self {
                    kind: BackendKind::Http,
                    authority: format!("{scheme}://{host}"),
                    prefix: normalize_prefix(path),
                    raw: raw.to_owned(),
                })
            }
            other => Err(Self::invalid(raw, format!("unknown scheme `{other}`"))),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Checks shared by every backend; adapters add their own restrictions.
pub(crate) fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(StorageError::InvalidKey {
            key: key.to_owned(),
            reason: "key is empty",
        });
    }
    Ok(())
}

/// Whether `key` sits directly under the directory part of `prefix`.
pub(crate) fn is_direct_child(prefix: &str, key: &str) -> bool {
    let base = prefix.rfind('/').map_or(0, |idx| idx + 1);
    key.get(base..).is_some_and(|rest| !rest.contains('/'))
}
