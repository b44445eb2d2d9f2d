//! Bounded pool of blocking worker slots
//!
//! Plugin entry points may block arbitrarily, so they never run on the async
//! reactor. A semaphore permit is held for as long as the blocking task runs;
//! the pool size is therefore the ceiling for concurrent plugin calls and
//! streams.

use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::error::GatewayError;
use crate::plugin::schema::PluginError;

#[derive(Debug)]
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Slots not currently held by a running task
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Wait for a free slot, then start `job` on the blocking thread pool
    pub async fn spawn<F, T>(&self, job: F) -> Result<JoinHandle<T>, GatewayError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| GatewayError::PoolClosed)?;

        Ok(tokio::task::spawn_blocking(move || {
            let _permit = permit;
            job()
        }))
    }

    /// Run `job` in a slot and wait for its result
    pub async fn run<F, T>(&self, job: F) -> Result<T, GatewayError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.spawn(job).await?.await.map_err(|e| {
            GatewayError::Plugin(PluginError::runtime(format!("Plugin task failed: {e}")))
        })
    }

    pub fn close(&self) {
        self.semaphore.close();
    }
}
