//! Bounded concurrent task scheduler
//!
//! `enqueue` never blocks: every task is spawned immediately and waits on a
//! semaphore permit, so at most `max_concurrency` tasks execute at once.
//! `wait` drains every submitted task (including ones enqueued while it is
//! waiting) and reports the first error without short-circuiting the rest.
//!
//! The queue's token is a child of the driver's context, so a lost lease or
//! a cancel reaches every queued task directly and `enqueue` refuses new
//! work once it has fired.
//!
//! The queue publishes a snapshot of its task list on a `watch` channel; the
//! task-queue writer persists it onto the workflow row.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::TaskError;
use crate::models::{QueuedTaskStatus, TaskSnapshot};
use crate::store::WorkflowRepository;

/// A unit of work run by the scheduler
#[async_trait]
pub trait Task: Send + Sync {
    /// Human-readable label for logs and the persisted task list
    fn name(&self) -> String;

    /// Run to completion. Implementations check `cancel` between I/O calls.
    async fn execute(&self, cancel: CancellationToken) -> Result<(), TaskError>;
}

type TaskHandle = JoinHandle<Result<(), TaskError>>;

pub struct TaskQueue {
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
    handles: Mutex<Vec<TaskHandle>>,
    snapshot: Arc<watch::Sender<Vec<TaskSnapshot>>>,
}

impl TaskQueue {
    /// `cancel` is normally a child of the driving context's token
    pub fn new(max_concurrency: usize, cancel: CancellationToken) -> Self {
        let (snapshot, _) = watch::channel(Vec::new());
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrency.max(1))),
            cancel,
            handles: Mutex::new(Vec::new()),
            snapshot: Arc::new(snapshot),
        }
    }

    fn handles(&self) -> std::sync::MutexGuard<'_, Vec<TaskHandle>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Submit a task; returns its id in the task list.
    ///
    /// After cancellation the task is listed as cancelled and never runs;
    /// `wait` then reports `TaskError::Cancelled`.
    pub fn enqueue(&self, task: Arc<dyn Task>) -> Uuid {
        let task_id = Uuid::new_v4();
        let name = task.name();
        let refused = self.cancel.is_cancelled();

        self.snapshot.send_modify(|tasks| {
            tasks.retain(|t| {
                !matches!(
                    t.status,
                    QueuedTaskStatus::Completed | QueuedTaskStatus::Cancelled
                )
            });
            tasks.push(TaskSnapshot {
                task_id,
                name: name.clone(),
                status: if refused {
                    QueuedTaskStatus::Cancelled
                } else {
                    QueuedTaskStatus::Queued
                },
                error: None,
            });
        });

        if refused {
            debug!(task = %name, "Queue cancelled, task not submitted");
            self.handles()
                .push(tokio::spawn(std::future::ready(Err(TaskError::Cancelled))));
            return task_id;
        }

        let semaphore = self.semaphore.clone();
        let cancel = self.cancel.clone();
        let snapshot = self.snapshot.clone();

        let handle = tokio::spawn(async move {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = semaphore.acquire_owned() => permit.ok(),
            };
            let Some(_permit) = permit.filter(|_| !cancel.is_cancelled()) else {
                set_status(&snapshot, task_id, QueuedTaskStatus::Cancelled, None);
                return Err(TaskError::Cancelled);
            };

            set_status(&snapshot, task_id, QueuedTaskStatus::Running, None);
            debug!(task = %name, "Task started");

            let result = task.execute(cancel.child_token()).await;
            match &result {
                Ok(()) => set_status(&snapshot, task_id, QueuedTaskStatus::Completed, None),
                Err(TaskError::Cancelled) => {
                    set_status(&snapshot, task_id, QueuedTaskStatus::Cancelled, None)
                }
                Err(e) => {
                    warn!(task = %name, error = %e, "Task failed");
                    set_status(
                        &snapshot,
                        task_id,
                        QueuedTaskStatus::Failed,
                        Some(e.to_string()),
                    )
                }
            }
            result
        });

        self.handles().push(handle);
        task_id
    }

    /// Wait for every submitted task.
    ///
    /// Returns the first task error after all tasks have finished, or
    /// `TaskError::Cancelled` as soon as `ctx` is cancelled (the queue is
    /// cancelled too, so remaining tasks stop at their next checkpoint).
    pub async fn wait(&self, ctx: &CancellationToken) -> Result<(), TaskError> {
        let mut first_error: Option<TaskError> = None;

        loop {
            let batch = std::mem::take(&mut *self.handles());
            if batch.is_empty() {
                break;
            }

            let mut pending: FuturesUnordered<TaskHandle> = batch.into_iter().collect();
            loop {
                let next = tokio::select! {
                    _ = ctx.cancelled() => {
                        self.cancel();
                        return Err(TaskError::Cancelled);
                    }
                    next = pending.next() => next,
                };
                let Some(joined) = next else { break };

                let outcome = joined.unwrap_or_else(|e| Err(TaskError::Panicked(e.to_string())));
                if let Err(e) = outcome {
                    match first_error {
                        None => first_error = Some(e),
                        Some(_) => debug!(error = %e, "Additional task error"),
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Stop scheduling: queued tasks resolve as cancelled and running tasks
    /// see their token fire.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Submitted tasks not yet collected by `wait`
    pub fn len(&self) -> usize {
        self.handles().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles().is_empty()
    }

    /// Current task list
    pub fn snapshot(&self) -> Vec<TaskSnapshot> {
        self.snapshot.borrow().clone()
    }

    /// Follow task list changes
    pub fn subscribe(&self) -> watch::Receiver<Vec<TaskSnapshot>> {
        self.snapshot.subscribe()
    }
}

fn set_status(
    snapshot: &watch::Sender<Vec<TaskSnapshot>>,
    task_id: Uuid,
    status: QueuedTaskStatus,
    error: Option<String>,
) {
    snapshot.send_modify(|tasks| {
        if let Some(entry) = tasks.iter_mut().find(|t| t.task_id == task_id) {
            entry.status = status;
            entry.error = error;
        }
    });
}

/// Persist task list changes onto the workflow row.
///
/// Writes at most once per `flush_interval` and once more on shutdown so the
/// final list is never lost.
pub async fn run_task_queue_writer(
    workflows: Arc<dyn WorkflowRepository>,
    workflow_id: Uuid,
    mut tasks: watch::Receiver<Vec<TaskSnapshot>>,
    flush_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(%workflow_id, "Task queue writer started");

    loop {
        tokio::select! {
            changed = tasks.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = shutdown.changed() => break,
        }

        let snapshot = tasks.borrow_and_update().clone();
        persist(workflows.as_ref(), workflow_id, &snapshot).await;

        tokio::select! {
            _ = tokio::time::sleep(flush_interval) => {}
            _ = shutdown.changed() => break,
        }
    }

    let snapshot = tasks.borrow().clone();
    persist(workflows.as_ref(), workflow_id, &snapshot).await;
    debug!(%workflow_id, "Task queue writer stopped");
}

async fn persist(workflows: &dyn WorkflowRepository, workflow_id: Uuid, tasks: &[TaskSnapshot]) {
    if let Err(e) = workflows.update_task_queue(workflow_id, tasks).await {
        warn!(%workflow_id, error = %e, "Failed to persist task queue");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::DriveContext;
    use crate::models::{Workflow, WorkflowKind};
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SleepTask {
        running: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl Task for SleepTask {
        fn name(&self) -> String {
            "sleep".to_string()
        }

        async fn execute(&self, _cancel: CancellationToken) -> Result<(), TaskError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            if self.fail {
                return Err(TaskError::InvalidState("boom".into()));
            }
            Ok(())
        }
    }

    fn sleep_tasks(n: usize, failing: usize) -> (Vec<Arc<dyn Task>>, Arc<AtomicUsize>) {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let tasks = (0..n)
            .map(|i| {
                Arc::new(SleepTask {
                    running: running.clone(),
                    peak: peak.clone(),
                    fail: i < failing,
                }) as Arc<dyn Task>
            })
            .collect();
        (tasks, peak)
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let queue = TaskQueue::new(2, CancellationToken::new());
        let (tasks, peak) = sleep_tasks(6, 0);
        for task in tasks {
            queue.enqueue(task);
        }
        assert_eq!(queue.len(), 6);

        queue.wait(&CancellationToken::new()).await.unwrap();
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert!(queue.is_empty());
        assert!(queue
            .snapshot()
            .iter()
            .all(|t| t.status == QueuedTaskStatus::Completed));
    }

    #[tokio::test]
    async fn test_wait_reports_error_after_all_tasks_finish() {
        let queue = TaskQueue::new(4, CancellationToken::new());
        let (tasks, _) = sleep_tasks(4, 1);
        for task in tasks {
            queue.enqueue(task);
        }

        let err = queue.wait(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, TaskError::InvalidState(_)));

        let snapshot = queue.snapshot();
        assert_eq!(
            snapshot
                .iter()
                .filter(|t| t.status == QueuedTaskStatus::Completed)
                .count(),
            3
        );
        assert_eq!(
            snapshot
                .iter()
                .filter(|t| t.status == QueuedTaskStatus::Failed)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_cancelled_queue_skips_unstarted_tasks() {
        let queue = TaskQueue::new(1, CancellationToken::new());
        queue.cancel();
        let (tasks, peak) = sleep_tasks(3, 0);
        for task in tasks {
            queue.enqueue(task);
        }

        let err = queue.wait(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, TaskError::Cancelled));
        assert_eq!(peak.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_wait_returns_on_context_cancellation() {
        struct Forever;

        #[async_trait]
        impl Task for Forever {
            fn name(&self) -> String {
                "forever".to_string()
            }

            async fn execute(&self, cancel: CancellationToken) -> Result<(), TaskError> {
                cancel.cancelled().await;
                Err(TaskError::Cancelled)
            }
        }

        let queue = TaskQueue::new(1, CancellationToken::new());
        queue.enqueue(Arc::new(Forever));

        let ctx = CancellationToken::new();
        let trigger = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let err = queue.wait(&ctx).await.unwrap_err();
        assert!(matches!(err, TaskError::Cancelled));
        assert!(queue.is_cancelled());
    }

    struct Recording {
        executed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Task for Recording {
        fn name(&self) -> String {
            "recording".to_string()
        }

        async fn execute(&self, _cancel: CancellationToken) -> Result<(), TaskError> {
            self.executed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_lost_lease_stops_submission() {
        let ctx = DriveContext::new();
        let queue = TaskQueue::new(4, ctx.token().child_token());
        ctx.mark_lease_lost();
        assert!(queue.is_cancelled());

        let executed = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            queue.enqueue(Arc::new(Recording {
                executed: executed.clone(),
            }));
        }

        let err = queue.wait(ctx.token()).await.unwrap_err();
        assert!(matches!(err, TaskError::Cancelled));
        assert_eq!(executed.load(Ordering::SeqCst), 0);
        assert!(queue
            .snapshot()
            .iter()
            .all(|t| t.status == QueuedTaskStatus::Cancelled));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_lease_loss_reaches_tasks_waiting_for_a_permit() {
        struct Hold;

        #[async_trait]
        impl Task for Hold {
            fn name(&self) -> String {
                "hold".to_string()
            }

            async fn execute(&self, cancel: CancellationToken) -> Result<(), TaskError> {
                cancel.cancelled().await;
                Err(TaskError::Cancelled)
            }
        }

        let ctx = DriveContext::new();
        let queue = TaskQueue::new(1, ctx.token().child_token());
        queue.enqueue(Arc::new(Hold));
        let executed = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            queue.enqueue(Arc::new(Recording {
                executed: executed.clone(),
            }));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        ctx.mark_lease_lost();
        // Nobody is in `wait` yet; the tasks must still see the loss
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(executed.load(Ordering::SeqCst), 0);
        assert!(queue
            .snapshot()
            .iter()
            .all(|t| t.status == QueuedTaskStatus::Cancelled));

        let err = queue.wait(ctx.token()).await.unwrap_err();
        assert!(matches!(err, TaskError::Cancelled));
        assert_eq!(executed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_writer_flushes_final_snapshot_on_stop() {
        let store = Arc::new(MemoryStore::new());
        let wf = Workflow::new(WorkflowKind::Extraction, uuid::Uuid::new_v4(), None);
        WorkflowRepository::create(store.as_ref(), &wf).await.unwrap();

        let queue = TaskQueue::new(2, CancellationToken::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let writer = tokio::spawn(run_task_queue_writer(
            store.clone(),
            wf.id,
            queue.subscribe(),
            Duration::from_millis(5),
            shutdown_rx,
        ));

        let (tasks, _) = sleep_tasks(3, 0);
        for task in tasks {
            queue.enqueue(task);
        }
        queue.wait(&CancellationToken::new()).await.unwrap();

        shutdown_tx.send(true).unwrap();
        writer.await.unwrap();

        let stored = WorkflowRepository::get(store.as_ref(), wf.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.task_queue, queue.snapshot());
        assert_eq!(stored.task_queue.len(), 3);
    }
}
