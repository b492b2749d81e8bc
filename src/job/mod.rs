//! Asynchronous job tracking
//!
//! Methods that start long-running work hand back a [`Task`]:
//! - [`VmTask`]: a live concrete job kept current by events and re-checks
//! - [`CompletedTask`]: an outcome known at call time
//! - [`NetworkTaskWait`]: a job on a host that may drop off the network
//!   while the job runs
//!
//! [`TaskConnectionTester`] fails running tasks when their server stops
//! answering.

pub mod completed;
pub mod connection_tester;
pub mod msvm_error;
pub mod network_wait;
pub mod state;
pub mod task;

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;

use crate::error::{Error, ErrorCodeMapper, Operation, Result};
use crate::locks;

pub use completed::CompletedTask;
pub use connection_tester::TaskConnectionTester;
pub use msvm_error::MsvmError;
pub use network_wait::NetworkTaskWait;
pub use state::{JobState, TaskStatus};
pub use task::VmTask;

/// Called once with the final status
pub type CompletedHandler = Arc<dyn Fn(TaskStatus) + Send + Sync>;

/// Requested state that cancels a job
pub const REQUEST_CANCEL_STATE: u16 = 4;

#[async_trait]
pub trait Task: Send + Sync {
    /// Server-side job id; empty for tasks without a job object
    fn instance_id(&self) -> String;

    fn name(&self) -> String;

    fn status(&self) -> TaskStatus;

    fn is_completed(&self) -> bool {
        self.status().is_finished()
    }

    /// Server error code, or a negative client code when the job was lost
    fn error_code(&self) -> i64;

    fn percent_complete(&self) -> u16;

    fn error_summary(&self) -> Option<String>;

    fn error_detail(&self) -> Option<String>;

    fn is_deleted(&self) -> bool;

    /// Message recorded when the client gave up on the job
    fn client_failure_message(&self) -> Option<String> {
        None
    }

    async fn cancel(&self) -> Result<()>;

    /// Wait for a terminal status. `false` when `timeout` elapsed first.
    async fn wait_for_completion(&self, timeout: Option<Duration>) -> bool;

    async fn get_errors(&self) -> Result<Vec<MsvmError>>;

    /// Register a completion handler. A task that already completed calls
    /// it immediately instead.
    fn on_completed(&self, handler: CompletedHandler) -> u64;

    /// Release everything the task holds. Safe to call more than once.
    async fn dispose(&self);

    /// The error to surface for a task that finished without success
    fn failure(&self, operation: Operation, mapper: &dyn ErrorCodeMapper) -> Option<Error> {
        let status = self.status();
        match status {
            TaskStatus::Running | TaskStatus::CompletedSuccessfully => None,
            TaskStatus::Canceled | TaskStatus::CompletedWithErrors => Some(Error::operation_failed(
                operation,
                self.error_code(),
                self.error_summary(),
                self.error_detail().or_else(|| self.client_failure_message()),
                status == TaskStatus::Canceled,
                mapper,
            )),
        }
    }
}

/// One-shot completion signal with handlers
pub(crate) struct Completion {
    done: watch::Sender<bool>,
    handlers: RwLock<Vec<(u64, CompletedHandler)>>,
    next_id: AtomicU64,
}

impl Completion {
    pub(crate) fn new() -> Self {
        Self {
            done: watch::channel(false).0,
            handlers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn is_signaled(&self) -> bool {
        *self.done.borrow()
    }

    /// Wake waiters without firing handlers
    pub(crate) fn wake(&self) -> bool {
        self.done.send_if_modified(|done| !std::mem::replace(done, true))
    }

    /// Wake waiters and fire the handlers. Only the first call fires.
    pub(crate) fn signal(&self, status: TaskStatus) {
        self.wake();
        let handlers = std::mem::take(&mut *locks::write(&self.handlers));
        for (_, handler) in handlers {
            handler(status);
        }
    }

    pub(crate) fn subscribe(&self, handler: CompletedHandler, finished: Option<TaskStatus>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        match finished {
            Some(status) => handler(status),
            None => locks::write(&self.handlers).push((id, handler)),
        }
        id
    }

    pub(crate) async fn wait(&self, timeout: Option<Duration>) -> bool {
        let mut rx = self.done.subscribe();
        match timeout {
            None => rx.wait_for(|done| *done).await.is_ok(),
            Some(limit) => matches!(
                tokio::time::timeout(limit, rx.wait_for(|done| *done)).await,
                Ok(Ok(_))
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn test_completion_wait_and_timeout() {
        let completion = Arc::new(Completion::new());
        assert!(!completion.wait(Some(Duration::from_secs(1))).await);

        let waiter = {
            let completion = completion.clone();
            tokio::spawn(async move { completion.wait(None).await })
        };
        completion.signal(TaskStatus::CompletedSuccessfully);
        assert!(waiter.await.unwrap());
        assert!(completion.wait(Some(Duration::ZERO)).await);
    }

    #[tokio::test]
    async fn test_handlers_fire_once() {
        let completion = Completion::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        completion.subscribe(
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            None,
        );
        completion.signal(TaskStatus::Canceled);
        completion.signal(TaskStatus::Canceled);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
