//! Cancellable run-once unit of asynchronous work.
//!
//! A [`Task`] wraps one operation future. The first call to [`Task::run`]
//! drives it; every other caller (a second `run`, or
//! [`Task::wait_until_finished`]) receives a clone of the same outcome.
//! Outcomes are broadcast over a `tokio::sync::watch` channel so late waiters
//! see a value that was published before they subscribed.

use crate::error::{LifecycleError, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::watch;

/// Process-unique identifier of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Identifier of one install or uninstall batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BatchId(u64);

impl BatchId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "batch-{}", self.0)
    }
}

/// Run-once, cancellable operation with a shared outcome
pub struct Task<T> {
    id: TaskId,
    operation: Mutex<Option<BoxFuture<'static, Result<T>>>>,
    cancel_tx: watch::Sender<bool>,
    outcome_tx: watch::Sender<Option<Result<T>>>,
}

impl<T> Task<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new<F>(operation: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let (cancel_tx, _) = watch::channel(false);
        let (outcome_tx, _) = watch::channel(None);
        Self {
            id: TaskId::next(),
            operation: Mutex::new(Some(operation.boxed())),
            cancel_tx,
            outcome_tx,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Drive the operation, or wait for whoever is already driving it
    pub async fn run(&self) -> Result<T> {
        let operation = self
            .operation
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        let Some(operation) = operation else {
            return self.wait_until_finished().await;
        };

        if self.is_cancelled() {
            self.finish(Err(LifecycleError::cancelled()));
            return self.wait_until_finished().await;
        }

        let mut guard = RunGuard {
            task: self,
            armed: true,
        };

        let cancel_rx = self.cancel_tx.subscribe();
        let outcome = tokio::select! {
            outcome = operation => outcome,
            _ = wait_cancelled(cancel_rx) => Err(LifecycleError::cancelled()),
        };

        self.finish(outcome);
        guard.armed = false;
        self.wait_until_finished().await
    }

    /// Request cancellation.
    ///
    /// A task that has not started is cancelled permanently. A running task
    /// drops its operation at the next suspension point.
    pub fn cancel(&self) {
        self.cancel_tx.send_replace(true);

        let pending = self
            .operation
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if pending.is_some() {
            drop(pending);
            self.finish(Err(LifecycleError::cancelled()));
        }
    }

    /// Wait for the outcome without driving the operation
    pub async fn wait_until_finished(&self) -> Result<T> {
        let mut rx = self.outcome_tx.subscribe();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(outcome) = current {
                return outcome;
            }
            if rx.changed().await.is_err() {
                return Err(LifecycleError::internal("Task outcome channel closed"));
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    pub fn is_finished(&self) -> bool {
        self.outcome_tx.borrow().is_some()
    }

    /// Outcome if the task already finished
    pub fn outcome(&self) -> Option<Result<T>> {
        self.outcome_tx.borrow().clone()
    }

    /// Publish the outcome; only the first publication counts
    fn finish(&self, outcome: Result<T>) {
        let mut outcome = Some(outcome);
        self.outcome_tx.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = outcome.take();
                true
            } else {
                false
            }
        });
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("cancelled", &*self.cancel_tx.borrow())
            .field("finished", &self.outcome_tx.borrow().is_some())
            .finish()
    }
}

/// Publishes `Cancelled` when a `run` future is dropped before completing
struct RunGuard<'a, T>
where
    T: Clone + Send + Sync + 'static,
{
    task: &'a Task<T>,
    armed: bool,
}

impl<T> Drop for RunGuard<'_, T>
where
    T: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        if self.armed {
            self.task.finish(Err(LifecycleError::cancelled()));
        }
    }
}

async fn wait_cancelled(mut rx: watch::Receiver<bool>) {
    loop {
        let cancelled = *rx.borrow_and_update();
        if cancelled {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
