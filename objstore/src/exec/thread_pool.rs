//! Preemptive worker pool on a dedicated multi-threaded tokio runtime.
//!
//! Every request is spawned onto the pool and holds one of `threads`
//! permits for the whole backend call. Requests beyond that wait in the
//! runtime queue, which is unbounded.

use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use tokio::runtime::{Builder, Runtime};
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::debug;

use crate::error::{Result, StorageError};
use crate::exec::{BatchOptions, DrainPolicy, Executor, Handler, Outcome, Request, Watch};

const THREAD_NAME: &str = "objstore-worker";

pub struct ThreadPoolExecutor {
    threads: usize,
    runtime: OnceCell<Runtime>,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
}

impl ThreadPoolExecutor {
    /// The runtime is only started by the first `submit`.
    pub fn new(threads: usize) -> Self {
        let threads = threads.max(1);
        Self {
            threads,
            runtime: OnceCell::new(),
            permits: Arc::new(Semaphore::new(threads)),
            tracker: TaskTracker::new(),
        }
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    fn runtime(&self) -> Result<&Runtime> {
        if self.tracker.is_closed() {
            return Err(StorageError::Strategy("worker pool is shut down".to_owned()));
        }
        self.runtime.get_or_try_init(|| {
            debug!(threads = self.threads, "starting worker pool");
            Builder::new_multi_thread()
                .worker_threads(self.threads)
                .thread_name(THREAD_NAME)
                .enable_all()
                .build()
                .map_err(|e| {
                    StorageError::Strategy(format!(
                        "cannot start {} worker threads: {e}",
                        self.threads
                    ))
                })
        })
    }

    fn shutdown(&mut self) {
        self.tracker.close();
        self.permits.close();
        // Dropping a runtime from async code panics; let it go in the background.
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

#[async_trait]
impl Executor for ThreadPoolExecutor {
    async fn submit(
        &self,
        handler: Arc<dyn Handler>,
        batch: Vec<Request>,
        options: &BatchOptions,
    ) -> Result<Vec<Result<Outcome>>> {
        let watch = Watch::start(options)?;
        let handle = self.runtime()?.handle().clone();

        let pending = batch.into_iter().map(|request| {
            let key = request.key().to_owned();
            let handler = handler.clone();
            let permits = self.permits.clone();
            let task = self.tracker.spawn_on(
                async move {
                    let _permit = permits
                        .acquire_owned()
                        .await
                        .map_err(|_| StorageError::Strategy("worker pool is shut down".to_owned()))?;
                    handler.handle(request).await
                },
                &handle,
            );
            let watch = &watch;
            async move {
                let joined = watch.run(&key, async {
                    task.await.unwrap_or_else(|e| {
                        Err(StorageError::Worker {
                            key: key.clone(),
                            reason: e.to_string(),
                        })
                    })
                });
                joined.await
            }
        });
        Ok(futures::future::join_all(pending).await)
    }

    async fn drain(&mut self, policy: DrainPolicy) {
        self.tracker.close();
        if policy == DrainPolicy::Wait {
            self.tracker.wait().await;
        }
        self.shutdown();
    }
}

impl Drop for ThreadPoolExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
