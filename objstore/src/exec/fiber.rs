//! Cooperative fibers: up to `M` requests interleaved on the caller's task.
//!
//! Nothing is spawned. Requests only yield at their own await points, so a
//! request that never awaits holds the whole batch up.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;

use crate::error::Result;
use crate::exec::{BatchOptions, DrainPolicy, Executor, Handler, Outcome, Request, Watch};

#[derive(Debug)]
pub struct FiberExecutor {
    fibers: usize,
}

impl FiberExecutor {
    pub fn new(fibers: usize) -> Self {
        Self {
            fibers: fibers.max(1),
        }
    }
}

#[async_trait]
impl Executor for FiberExecutor {
    async fn submit(
        &self,
        handler: Arc<dyn Handler>,
        batch: Vec<Request>,
        options: &BatchOptions,
    ) -> Result<Vec<Result<Outcome>>> {
        let watch = Watch::start(options)?;
        let watch = &watch;
        let mut finished: Vec<(usize, Result<Outcome>)> =
            futures::stream::iter(batch.into_iter().enumerate())
                .map(|(idx, request)| {
                    let handler = handler.clone();
                    async move {
                        let key = request.key().to_owned();
                        (idx, watch.run(&key, handler.handle(request)).await)
                    }
                })
                .buffer_unordered(self.fibers)
                .collect()
                .await;
        finished.sort_unstable_by_key(|(idx, _)| *idx);
        Ok(finished.into_iter().map(|(_, result)| result).collect())
    }

    async fn drain(&mut self, _policy: DrainPolicy) {}
}
