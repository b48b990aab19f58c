//! Batch execution strategies.
//!
//! A batch is a `Vec<Request>`; every strategy answers with one result per
//! request, `results[i]` pairing with `batch[i]`. Individual failures stay
//! in their own slot. Only strategy-level problems (workers that cannot be
//! started, a batch cancelled before dispatch) fail the whole `submit`.

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Result, StorageError};
use crate::storage::{GetOptions, PutOptions, StorageObject};

pub mod fiber;
pub mod sequential;
pub mod thread_pool;

pub use fiber::FiberExecutor;
pub use sequential::SequentialExecutor;
pub use thread_pool::ThreadPoolExecutor;

/// Worker count used when none is configured.
pub const DEFAULT_CONCURRENCY: usize = 20;

#[derive(Debug, Clone)]
pub enum Request {
    Get { key: String, options: GetOptions },
    Put {
        key: String,
        content: Bytes,
        options: PutOptions,
    },
    Delete { key: String, strict: bool },
    Exists { key: String },
}

impl Request {
    pub fn get(key: impl Into<String>) -> Self {
        Request::Get {
            key: key.into(),
            options: GetOptions::default(),
        }
    }

    pub fn put(key: impl Into<String>, content: impl Into<Bytes>) -> Self {
        Request::Put {
            key: key.into(),
            content: content.into(),
            options: PutOptions::default(),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Request::Delete {
            key: key.into(),
            strict: false,
        }
    }

    pub fn exists(key: impl Into<String>) -> Self {
        Request::Exists { key: key.into() }
    }

    pub fn key(&self) -> &str {
        match self {
            Request::Get { key, .. }
            | Request::Put { key, .. }
            | Request::Delete { key, .. }
            | Request::Exists { key } => key,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Object(StorageObject),
    Stored,
    Deleted,
    Exists(bool),
}

impl Outcome {
    pub fn into_object(self) -> Option<StorageObject> {
        match self {
            Outcome::Object(object) => Some(object),
            _ => None,
        }
    }

    pub fn into_exists(self) -> Option<bool> {
        match self {
            Outcome::Exists(exists) => Some(exists),
            _ => None,
        }
    }
}

/// Performs a single request. Implemented by the facade's target binding.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, request: Request) -> Result<Outcome>;
}

/// Per-batch controls.
#[derive(Debug, Clone, Default)]
pub struct BatchOptions {
    /// Requests unfinished after this long resolve to `Timeout`.
    pub timeout: Option<Duration>,
    /// Cancelled before `submit`: nothing is dispatched. Cancelled later:
    /// unfinished requests resolve to `Cancelled`.
    pub cancel: Option<CancellationToken>,
}

impl BatchOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// What teardown does with work still in flight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DrainPolicy {
    /// Let outstanding requests finish.
    #[default]
    Wait,
    /// Stop the workers and drop whatever is still running.
    Cancel,
}

#[async_trait]
pub trait Executor: Send + Sync {
    async fn submit(
        &self,
        handler: Arc<dyn Handler>,
        batch: Vec<Request>,
        options: &BatchOptions,
    ) -> Result<Vec<Result<Outcome>>>;

    /// Tears the executor down according to `policy`.
    async fn drain(&mut self, policy: DrainPolicy);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    Sequential,
    #[default]
    #[serde(alias = "thread-pool", alias = "thread_pool")]
    Threads,
    #[serde(alias = "fiber")]
    Fibers,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StrategyKind::Sequential => "sequential",
            StrategyKind::Threads => "threads",
            StrategyKind::Fibers => "fibers",
        })
    }
}

impl FromStr for StrategyKind {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sequential" => Ok(StrategyKind::Sequential),
            "threads" | "thread-pool" | "thread_pool" => Ok(StrategyKind::Threads),
            "fibers" | "fiber" => Ok(StrategyKind::Fibers),
            other => Err(StorageError::Strategy(format!("unknown strategy `{other}`"))),
        }
    }
}

/// The closed set of strategies a facade can be built with.
pub enum Strategy {
    Sequential(SequentialExecutor),
    ThreadPool(ThreadPoolExecutor),
    Fiber(FiberExecutor),
}

impl Strategy {
    pub fn new(kind: StrategyKind, concurrency: usize) -> Result<Self> {
        if concurrency == 0 {
            return Err(StorageError::Strategy(
                "concurrency must be at least 1".to_owned(),
            ));
        }
        Ok(match kind {
            StrategyKind::Sequential => Strategy::Sequential(SequentialExecutor),
            StrategyKind::Threads => Strategy::ThreadPool(ThreadPoolExecutor::new(concurrency)),
            StrategyKind::Fibers => Strategy::Fiber(FiberExecutor::new(concurrency)),
        })
    }

    pub fn kind(&self) -> StrategyKind {
        match self {
            Strategy::Sequential(_) => StrategyKind::Sequential,
            Strategy::ThreadPool(_) => StrategyKind::Threads,
            Strategy::Fiber(_) => StrategyKind::Fibers,
        }
    }
}

impl fmt::Debug for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Strategy").field(&self.kind()).finish()
    }
}

#[async_trait]
impl Executor for Strategy {
    async fn submit(
        &self,
        handler: Arc<dyn Handler>,
        batch: Vec<Request>,
        options: &BatchOptions,
    ) -> Result<Vec<Result<Outcome>>> {
        debug!(strategy = %self.kind(), requests = batch.len(), "submitting batch");
        match self {
            Strategy::Sequential(e) => e.submit(handler, batch, options).await,
            Strategy::ThreadPool(e) => e.submit(handler, batch, options).await,
            Strategy::Fiber(e) => e.submit(handler, batch, options).await,
        }
    }

    async fn drain(&mut self, policy: DrainPolicy) {
        debug!(strategy = %self.kind(), ?policy, "draining");
        match self {
            Strategy::Sequential(e) => e.drain(policy).await,
            Strategy::ThreadPool(e) => e.drain(policy).await,
            Strategy::Fiber(e) => e.drain(policy).await,
        }
    }
}

/// Deadline and cancellation state shared by every request of one batch.
#[derive(Clone)]
pub(crate) struct Watch {
    deadline: Option<(Instant, Duration)>,
    cancel: CancellationToken,
}

impl Watch {
    /// Fails with `Cancelled` when the batch was cancelled before dispatch.
    pub(crate) fn start(options: &BatchOptions) -> Result<Self> {
        let cancel = options.cancel.clone().unwrap_or_default();
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        Ok(Self {
            deadline: options.timeout.map(|after| (Instant::now() + after, after)),
            cancel,
        })
    }

    /// Drives `fut` unless the batch is cancelled or runs out of time first,
    /// in which case the request is abandoned and its result discarded.
    pub(crate) async fn run<F>(&self, key: &str, fut: F) -> Result<Outcome>
    where
        F: Future<Output = Result<Outcome>>,
    {
        if self.cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        if let Some((at, after)) = self.deadline {
            if Instant::now() >= at {
                return Err(StorageError::Timeout {
                    key: key.to_owned(),
                    after,
                });
            }
        }

        let expired = async {
            match self.deadline {
                Some((at, after)) => {
                    tokio::time::sleep_until(at).await;
                    after
                }
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            biased;
            out = fut => out,
            _ = self.cancel.cancelled() => {
                warn!(key, "request abandoned, batch cancelled");
                Err(StorageError::Cancelled)
            }
            after = expired => {
                warn!(key, ?after, "request abandoned, batch timed out");
                Err(StorageError::Timeout { key: key.to_owned(), after })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Answers `Exists(key.len() is even)`. Keys starting with `fail` are
    /// missing, keys starting with `down` lose their connection and keys
    /// starting with `slow` take half a second.
    #[derive(Default)]
    struct FakeHandler {
        calls: AtomicUsize,
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl Handler for FakeHandler {
        async fn handle(&self, request: Request) -> Result<Outcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let key = request.key().to_owned();
            if key.starts_with("slow") {
                tokio::time::sleep(Duration::from_millis(500)).await;
            } else {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            self.running.fetch_sub(1, Ordering::SeqCst);
            if key.starts_with("fail") {
                return Err(StorageError::NotFound {
                    target: "fake".into(),
                    key,
                });
            }
            if key.starts_with("down") {
                return Err(StorageError::connection(
                    crate::target::BackendKind::Http,
                    "fake",
                    Some(&key),
                    std::io::Error::from(std::io::ErrorKind::ConnectionReset),
                ));
            }
            Ok(Outcome::Exists(key.len() % 2 == 0))
        }
    }

    fn all_strategies(concurrency: usize) -> Vec<Strategy> {
        [StrategyKind::Sequential, StrategyKind::Threads, StrategyKind::Fibers]
            .into_iter()
            .map(|kind| Strategy::new(kind, concurrency).unwrap())
            .collect()
    }

    fn summarize(results: &[Result<Outcome>]) -> Vec<String> {
        results
            .iter()
            .map(|r| match r {
                Ok(outcome) => format!("{outcome:?}"),
                Err(e) => format!("err: {e}"),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_results_pair_with_requests() {
        let keys: Vec<String> = (0..40)
            .map(|i| if i % 7 == 0 { format!("fail-{i}") } else { format!("k{}", "x".repeat(i)) })
            .collect();
        for strategy in all_strategies(4) {
            let handler = Arc::new(FakeHandler::default());
            let batch = keys.iter().map(Request::exists).collect();
            let results = strategy
                .submit(handler, batch, &BatchOptions::default())
                .await
                .unwrap();
            assert_eq!(results.len(), keys.len(), "{strategy:?}");
            for (key, result) in keys.iter().zip(&results) {
                if key.starts_with("fail") {
                    assert!(result.as_ref().unwrap_err().is_not_found(), "{strategy:?} {key}");
                } else {
                    assert_eq!(result.as_ref().unwrap(), &Outcome::Exists(key.len() % 2 == 0));
                }
            }
        }
    }

    #[tokio::test]
    async fn test_strategies_agree() {
        let batch: Vec<Request> = ["a", "bb", "fail", "ccc", "dddd"]
            .into_iter()
            .map(Request::exists)
            .collect();
        let mut seen = Vec::new();
        for strategy in all_strategies(3) {
            let results = strategy
                .submit(Arc::new(FakeHandler::default()), batch.clone(), &BatchOptions::default())
                .await
                .unwrap();
            seen.push(summarize(&results));
        }
        assert_eq!(seen[0], seen[1]);
        assert_eq!(seen[1], seen[2]);
    }

    #[tokio::test]
    async fn test_empty_batch() {
        for strategy in all_strategies(2) {
            let results = strategy
                .submit(Arc::new(FakeHandler::default()), Vec::new(), &BatchOptions::default())
                .await
                .unwrap();
            assert!(results.is_empty());
        }
    }

    #[tokio::test]
    async fn test_cancelled_batch_dispatches_nothing() {
        let token = CancellationToken::new();
        token.cancel();
        let options = BatchOptions::default().with_cancel(token);
        for strategy in all_strategies(2) {
            let handler = Arc::new(FakeHandler::default());
            let err = strategy
                .submit(handler.clone(), vec![Request::exists("a")], &options)
                .await
                .unwrap_err();
            assert!(matches!(err, StorageError::Cancelled));
            assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
        }
    }

    #[tokio::test]
    async fn test_cancel_mid_batch_keeps_finished_results() {
        for strategy in all_strategies(2) {
            let token = CancellationToken::new();
            let options = BatchOptions::default().with_cancel(token.clone());
            let canceller = tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(150)).await;
                token.cancel();
            });
            let batch = vec![Request::exists("ab"), Request::exists("slow")];
            let results = strategy
                .submit(Arc::new(FakeHandler::default()), batch, &options)
                .await
                .unwrap();
            canceller.await.unwrap();
            assert_eq!(results.len(), 2);
            assert_eq!(results[0].as_ref().unwrap(), &Outcome::Exists(true), "{strategy:?}");
            assert!(
                matches!(results[1], Err(StorageError::Cancelled)),
                "{strategy:?}: {:?}",
                results[1]
            );
        }
    }

    #[tokio::test]
    async fn test_connection_failure_leaves_siblings_alone() {
        let batch: Vec<Request> = ["ab", "down-1", "abc", "fail", "abcd"]
            .into_iter()
            .map(Request::exists)
            .collect();
        for strategy in all_strategies(3) {
            let handler = Arc::new(FakeHandler::default());
            let results = strategy
                .submit(handler.clone(), batch.clone(), &BatchOptions::default())
                .await
                .unwrap();
            assert_eq!(handler.calls.load(Ordering::SeqCst), 5, "{strategy:?}");
            assert_eq!(results[0].as_ref().unwrap(), &Outcome::Exists(true));
            assert!(results[1].as_ref().unwrap_err().is_connection(), "{strategy:?}");
            assert_eq!(results[2].as_ref().unwrap(), &Outcome::Exists(false));
            assert!(results[3].as_ref().unwrap_err().is_not_found());
            assert_eq!(results[4].as_ref().unwrap(), &Outcome::Exists(true));
        }
    }

    #[tokio::test]
    async fn test_timeout_abandons_slow_requests() {
        let options = BatchOptions::default().with_timeout(Duration::from_millis(150));
        for strategy in all_strategies(4) {
            let batch = vec![Request::exists("slow"), Request::exists("ab")];
            let results = strategy
                .submit(Arc::new(FakeHandler::default()), batch, &options)
                .await
                .unwrap();
            assert!(
                matches!(results[0], Err(StorageError::Timeout { .. })),
                "{strategy:?}"
            );
            if strategy.kind() != StrategyKind::Sequential {
                assert_eq!(results[1].as_ref().unwrap(), &Outcome::Exists(true));
            }
        }
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        for kind in [StrategyKind::Threads, StrategyKind::Fibers] {
            let strategy = Strategy::new(kind, 3).unwrap();
            let handler = Arc::new(FakeHandler::default());
            let batch = (0..30).map(|i| Request::exists(format!("k{i}"))).collect();
            strategy
                .submit(handler.clone(), batch, &BatchOptions::default())
                .await
                .unwrap();
            let peak = handler.peak.load(Ordering::SeqCst);
            assert!(peak <= 3 && peak >= 1, "{kind}: peak {peak}");
        }
    }

    #[test]
    fn test_zero_concurrency_is_rejected() {
        let err = Strategy::new(StrategyKind::Threads, 0).unwrap_err();
        assert!(matches!(err, StorageError::Strategy(_)));
    }

    #[test]
    fn test_strategy_kind_names() {
        assert_eq!("thread-pool".parse::<StrategyKind>().unwrap(), StrategyKind::Threads);
        assert_eq!("Fibers".parse::<StrategyKind>().unwrap(), StrategyKind::Fibers);
        assert!("actors".parse::<StrategyKind>().is_err());
    }
}
