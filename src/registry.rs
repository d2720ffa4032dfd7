//! Per-workflow background workers
//!
//! Each workflow being driven runs a heartbeat and a task-queue writer.
//! Workers are keyed by workflow id and receive a `watch` shutdown signal;
//! stopping waits a bounded time for the worker to acknowledge before the
//! task is aborted. After `stop` returns the registry holds no entry for the
//! workflow.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Registry of one kind of background worker
#[derive(Clone)]
pub struct WorkerRegistry {
    name: &'static str,
    workers: Arc<Mutex<HashMap<Uuid, WorkerHandle>>>,
}

impl WorkerRegistry {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            workers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, WorkerHandle>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn a worker for `workflow_id`.
    ///
    /// A worker already registered under the same id is signalled and
    /// aborted, so at most one worker per id ever runs.
    pub fn start<F, Fut>(&self, workflow_id: Uuid, worker: F)
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown, rx) = watch::channel(false);
        let handle = tokio::spawn(worker(rx));

        let previous = self
            .lock()
            .insert(workflow_id, WorkerHandle { shutdown, handle });

        if let Some(previous) = previous {
            warn!(registry = self.name, %workflow_id, "Replacing running worker");
            let _ = previous.shutdown.send(true);
            previous.handle.abort();
        }
        debug!(registry = self.name, %workflow_id, "Worker started");
    }

    /// Signal the worker and wait up to `timeout` for it to exit.
    ///
    /// Returns `false` when the worker had to be aborted or was not running.
    pub async fn stop(&self, workflow_id: Uuid, timeout: Duration) -> bool {
        let Some(WorkerHandle { shutdown, handle }) = self.lock().remove(&workflow_id) else {
            return false;
        };

        let _ = shutdown.send(true);
        let abort = handle.abort_handle();

        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(())) => {
                debug!(registry = self.name, %workflow_id, "Worker stopped");
                true
            }
            Ok(Err(e)) => {
                warn!(registry = self.name, %workflow_id, error = %e, "Worker ended abnormally");
                true
            }
            Err(_) => {
                warn!(
                    registry = self.name,
                    %workflow_id,
                    ?timeout,
                    "Worker did not stop in time, aborting"
                );
                abort.abort();
                false
            }
        }
    }

    pub fn contains(&self, workflow_id: Uuid) -> bool {
        self.lock().contains_key(&workflow_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Stop every registered worker, used at process shutdown
    pub async fn stop_all(&self, timeout: Duration) {
        let ids: Vec<Uuid> = self.lock().keys().copied().collect();
        for id in ids {
            self.stop(id, timeout).await;
        }
    }
}
