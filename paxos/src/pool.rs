use std::{future::Future, sync::Arc};

use labrpc::anyhow::Result;
use labrpc::tokio::{
    runtime::Handle,
    sync::Semaphore,
    task::{self, JoinHandle},
};
use log::error;

/// Bounded set of concurrently running tasks shared by every group.
///
/// A task that fails or panics is logged and does not affect the others.
#[derive(Clone)]
pub struct WorkerPool {
    handle: Handle,
    permits: Arc<Semaphore>,
}

impl WorkerPool {
    /// Must be called from within a tokio runtime.
    pub fn new(max_threads: usize) -> Result<Self> {
        Ok(Self {
            handle: Handle::try_current()?,
            permits: Arc::new(Semaphore::new(max_threads.max(1))),
        })
    }

    /// Run `fut` once a worker is free. Failures are logged under `what`.
    pub fn spawn<F>(&self, what: String, fut: F) -> JoinHandle<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let permits = self.permits.clone();
        self.handle.spawn(async move {
            let _permit = match permits.acquire_owned().await {
                Ok(p) => p,
                Err(_) => return,
            };
            match task::spawn(fut).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("task {} failed: {:#}", what, e),
                Err(e) if e.is_panic() => error!("task {} panicked", what),
                Err(_) => {}
            }
        })
    }

    /// Permits not held by a running task.
    pub fn idle(&self) -> usize {
        self.permits.available_permits()
    }

    /// Refuse further tasks. Running ones finish.
    pub fn close(&self) {
        self.permits.close();
    }
}
