//! Uniform key-value object storage over local directories, S3, GCS,
//! in-process memory and read-only HTTP, with transparent gzip/brotli
//! content encoding and pluggable batch execution strategies.

pub mod adapter;
pub mod codec;
pub mod config;
pub mod error;
pub mod exec;
pub mod pool;
pub mod storage;
pub mod target;

pub use codec::{Encoding, compress, decompress};
pub use config::{BackendSettings, CompressionPolicy, Config, StorageOptions};
pub use error::{Result, StorageError};
pub use exec::{BatchOptions, DrainPolicy, Outcome, Request, StrategyKind};
pub use pool::{ConnectionRegistry, ResetFilter, reset_connection_pools};
pub use storage::{GetOptions, PutOptions, Storage, StorageObject};
pub use target::{BackendKind, Target};
