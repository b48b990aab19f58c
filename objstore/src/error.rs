use std::time::Duration;

use thiserror::Error;

use crate::codec::{Encoding, GZIP_MAGIC};
use crate::target::BackendKind;

/// Boxed backend-native error, kept as the `source` of translated errors.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub type Result<T, E = StorageError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum StorageError {
    // Codec errors
    #[error("compression method `{method}` is not supported (supported: none, gzip, br)")]
    UnsupportedCodec { method: String },

    #[error("compression level {level} is out of range for {encoding} (max {max})")]
    InvalidLevel {
        encoding: Encoding,
        level: u32,
        max: u32,
    },

    #[error(
        "{}: payload is not in gzip format, magic bytes {} did not match {}",
        label_or_na(.label),
        hex_bytes(.observed),
        hex_bytes(.expected)
    )]
    MalformedPayload {
        label: Option<String>,
        expected: [u8; 2],
        observed: Vec<u8>,
    },

    #[error("{}: {encoding} codec failed: {source}", label_or_na(.label))]
    CodecFailure {
        encoding: Encoding,
        label: Option<String>,
        #[source]
        source: std::io::Error,
    },

    // Backend errors
    #[error("{key} not found in {target}")]
    NotFound { target: String, key: String },

    #[error(
        "connection to {kind} target {target} failed{}: {source}",
        key_suffix(.key)
    )]
    Connection {
        kind: BackendKind,
        target: String,
        key: Option<String>,
        #[source]
        source: BoxError,
    },

    #[error("{kind} backend error on {target}{}: {source}", key_suffix(.key))]
    Backend {
        kind: BackendKind,
        target: String,
        key: Option<String>,
        #[source]
        source: BoxError,
    },

    #[error("invalid key `{key}`: {reason}")]
    InvalidKey { key: String, reason: &'static str },

    #[error("invalid target `{target}`: {reason}")]
    InvalidTarget { target: String, reason: String },

    // Execution errors
    #[error("execution strategy unavailable: {0}")]
    Strategy(String),

    #[error("batch cancelled")]
    Cancelled,

    #[error("request for {key} abandoned after {after:?}")]
    Timeout { key: String, after: Duration },

    #[error("worker failed while handling {key}: {reason}")]
    Worker { key: String, reason: String },

    #[error("invalid json for {key}: {source}")]
    Json {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// True for errors that invalidate the pooled connection they came from.
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }

    pub(crate) fn malformed_gzip(observed: &[u8], label: Option<&str>) -> Self {
        Self::MalformedPayload {
            label: label.map(str::to_owned),
            expected: GZIP_MAGIC,
            observed: observed.to_vec(),
        }
    }

    pub(crate) fn backend(
        kind: BackendKind,
        target: impl Into<String>,
        key: Option<&str>,
        source: impl Into<BoxError>,
    ) -> Self {
        Self::Backend {
            kind,
            target: target.into(),
            key: key.map(str::to_owned),
            source: source.into(),
        }
    }

    pub(crate) fn connection(
        kind: BackendKind,
        target: impl Into<String>,
        key: Option<&str>,
        source: impl Into<BoxError>,
    ) -> Self {
        Self::Connection {
            kind,
            target: target.into(),
            key: key.map(str::to_owned),
            source: source.into(),
        }
    }
}

fn label_or_na(label: &Option<String>) -> &str {
    label.as_deref().unwrap_or("N/A")
}

fn key_suffix(key: &Option<String>) -> String {
    key.as_ref().map(|k| format!(" ({k})")).unwrap_or_default()
}

fn hex_bytes(bytes: &[u8]) -> String {
    let parts: Vec<String> = bytes.iter().map(|b| format!("{b:#04x}")).collect();
    format!("[{}]", parts.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_payload_message_carries_label_and_bytes() {
        let err = StorageError::malformed_gzip(&[0x00, 0x01], Some("layer/info"));
        let msg = err.to_string();
        assert!(msg.starts_with("layer/info:"), "{msg}");
        assert!(msg.contains("[0x00, 0x01]"), "{msg}");
        assert!(msg.contains("[0x1f, 0x8b]"), "{msg}");
    }

    #[test]
    fn test_malformed_payload_without_label() {
        let err = StorageError::malformed_gzip(&[], None);
        assert!(err.to_string().starts_with("N/A:"));
    }

    #[test]
    fn test_backend_error_mentions_key() {
        let err = StorageError::backend(
            BackendKind::S3,
            "s3://bucket",
            Some("a/b"),
            std::io::Error::other("denied"),
        );
        assert_eq!(err.to_string(), "s3 backend error on s3://bucket (a/b): denied");
        assert!(!err.is_connection());
    }

    #[test]
    fn test_cancelled_message_fits_any_point_of_cancellation() {
        assert_eq!(StorageError::Cancelled.to_string(), "batch cancelled");
    }

    #[test]
    fn test_connection_error_mentions_key() {
        let err = StorageError::connection(
            BackendKind::Http,
            "http://127.0.0.1:9",
            Some("a/b"),
            std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
        );
        assert!(err.is_connection());
        let msg = err.to_string();
        assert!(msg.contains("failed (a/b):"), "{msg}");
    }
}
