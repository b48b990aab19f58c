//! One request at a time on the caller's task.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::exec::{BatchOptions, DrainPolicy, Executor, Handler, Outcome, Request, Watch};

#[derive(Debug, Default)]
pub struct SequentialExecutor;

#[async_trait]
impl Executor for SequentialExecutor {
    async fn submit(
        &self,
        handler: Arc<dyn Handler>,
        batch: Vec<Request>,
        options: &BatchOptions,
    ) -> Result<Vec<Result<Outcome>>> {
        let watch = Watch::start(options)?;
        let mut results = Vec::with_capacity(batch.len());
        for request in batch {
            let key = request.key().to_owned();
            results.push(watch.run(&key, handler.handle(request)).await);
        }
        Ok(results)
    }

    async fn drain(&mut self, _policy: DrainPolicy) {}
}
