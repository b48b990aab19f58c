use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::adapter::{GcsConfig, HttpConfig, S3Config};
use crate::codec::Encoding;
use crate::exec::{BatchOptions, DEFAULT_CONCURRENCY, DrainPolicy, StrategyKind};

/// Connection settings shared by every target of a registry.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BackendSettings {
    pub s3: S3Config,
    pub gcs: GcsConfig,
    pub http: HttpConfig,
}

/// Default compression applied by `put`; reads use the stored encoding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CompressionPolicy {
    pub method: Encoding,
    /// Codec default when unset.
    pub level: Option<u32>,
}

impl CompressionPolicy {
    pub fn new(method: Encoding, level: Option<u32>) -> Self {
        Self { method, level }
    }

    pub fn gzip() -> Self {
        Self::new(Encoding::Gzip, None)
    }
}

/// Per-facade settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageOptions {
    pub strategy: StrategyKind,
    /// Worker threads or fibers; ignored by the sequential strategy.
    pub concurrency: usize,
    pub compression: CompressionPolicy,
    pub drain: DrainPolicy,
    /// Timeout applied to every batch, in seconds.
    pub batch_timeout_secs: Option<u64>,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::default(),
            concurrency: DEFAULT_CONCURRENCY,
            compression: CompressionPolicy::default(),
            drain: DrainPolicy::default(),
            batch_timeout_secs: None,
        }
    }
}

impl StorageOptions {
    pub fn with_strategy(mut self, strategy: StrategyKind) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_compression(mut self, compression: CompressionPolicy) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_drain(mut self, drain: DrainPolicy) -> Self {
        self.drain = drain;
        self
    }

    pub(crate) fn batch_options(&self) -> BatchOptions {
        BatchOptions {
            timeout: self.batch_timeout_secs.map(Duration::from_secs),
            cancel: None,
        }
    }
}

/// Top-level YAML file read by the `objstore` binary.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageOptions,
    pub backends: BackendSettings,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        let cfg: Config = serde_yaml::from_str(&content).context("Failed to parse YAML config")?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.storage.strategy, StrategyKind::Threads);
        assert_eq!(cfg.storage.concurrency, DEFAULT_CONCURRENCY);
        assert_eq!(cfg.storage.compression.method, Encoding::Identity);
        assert_eq!(cfg.storage.drain, DrainPolicy::Wait);
        assert_eq!(cfg.backends.s3.part_size, 8 * 1024 * 1024);
    }

    #[test]
    fn test_load_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
storage:
  strategy: fibers
  concurrency: 8
  compression:
    method: br
    level: 7
  drain: cancel
  batch_timeout_secs: 30
backends:
  s3:
    endpoint_url: http://127.0.0.1:9000
    force_path_style: true
  http:
    timeout_secs: 5
"#
        )
        .unwrap();
        let cfg = Config::load(file.path()).unwrap();
        assert_eq!(cfg.storage.strategy, StrategyKind::Fibers);
        assert_eq!(cfg.storage.concurrency, 8);
        assert_eq!(
            cfg.storage.compression,
            CompressionPolicy::new(Encoding::Brotli, Some(7))
        );
        assert_eq!(cfg.storage.drain, DrainPolicy::Cancel);
        assert_eq!(
            cfg.storage.batch_options().timeout,
            Some(Duration::from_secs(30))
        );
        assert!(cfg.backends.s3.force_path_style);
        assert_eq!(cfg.backends.s3.max_concurrency, 8);
        assert_eq!(cfg.backends.http.timeout_secs, 5);
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load("/nonexistent/objstore.yaml").unwrap_err();
        assert!(err.to_string().contains("Failed to read config"));
    }
}
