//! Waiting on a job across network outages
//!
//! Operations such as live migration can take the managing host off the
//! network while their job runs. [`NetworkTaskWait`] keeps polling for the
//! job, tolerating transient unreachability until the outage ceiling, and
//! swaps in the real [`VmTask`] once it resolves.

use async_trait::async_trait;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use virtmgmt_core_interface::ObjectPath;
use virtmgmt_core_resilience::{OutageConfig, OutageTracker, Verdict};

use super::{CompletedHandler, Completion, MsvmError, Task, TaskStatus, VmTask};
use crate::config::ModelConfig;
use crate::error::{codes, DefaultErrorCodeMapper, Error, Result};
use crate::locks;

/// Resolves a job path to a live task
#[async_trait]
pub trait TaskSource: Send + Sync {
    async fn resolve_task(&self, path: &ObjectPath) -> Result<Arc<VmTask>>;
}

/// Why the client stopped waiting
#[derive(Debug, Clone, PartialEq, Eq)]
enum WaitFailure {
    NetworkTimeout,
    Deleted,
    Unexpected(String),
}

impl WaitFailure {
    fn code(&self) -> i64 {
        match self {
            WaitFailure::NetworkTimeout => codes::CLIENT_NETWORK_TIMEOUT,
            WaitFailure::Deleted => codes::CLIENT_DELETED,
            WaitFailure::Unexpected(_) => codes::CLIENT_DISCONNECTED,
        }
    }

    fn message(&self) -> String {
        match self {
            WaitFailure::NetworkTimeout => {
                "The server could not be reached before the network timeout elapsed.".to_string()
            }
            WaitFailure::Deleted => "The task was deleted before it completed.".to_string(),
            WaitFailure::Unexpected(message) => message.clone(),
        }
    }
}

pub struct NetworkTaskWait {
    path: ObjectPath,
    source: Arc<dyn TaskSource>,
    connected: RwLock<Option<Arc<VmTask>>>,
    failure: RwLock<Option<WaitFailure>>,
    completion: Completion,
    tracker: OutageTracker,
    poll_interval: Duration,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl NetworkTaskWait {
    /// Begin polling for the job at `path`
    pub fn start(path: ObjectPath, source: Arc<dyn TaskSource>, config: &ModelConfig) -> Arc<Self> {
        let wait = Arc::new(Self::new(path, source, config));
        wait.spawn_poller();
        wait
    }

    /// Wrap a task that is already attached; polling keeps it current
    /// through outages
    pub fn for_task(
        task: Arc<VmTask>,
        source: Arc<dyn TaskSource>,
        config: &ModelConfig,
    ) -> Arc<Self> {
        let wait = Arc::new(Self::new(task.path().clone(), source, config));
        wait.connect(task);
        wait.spawn_poller();
        wait
    }

    fn new(path: ObjectPath, source: Arc<dyn TaskSource>, config: &ModelConfig) -> Self {
        Self {
            path,
            source,
            connected: RwLock::new(None),
            failure: RwLock::new(None),
            completion: Completion::new(),
            tracker: OutageTracker::new(OutageConfig {
                ceiling: config.network_ceiling(),
            }),
            poll_interval: config.network_poll_interval(),
            poller: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &ObjectPath {
        &self.path
    }

    /// The real task, once it has been resolved
    pub fn connected_task(&self) -> Option<Arc<VmTask>> {
        locks::read(&self.connected).clone()
    }

    fn failure(&self) -> Option<WaitFailure> {
        locks::read(&self.failure).clone()
    }

    fn connect(self: &Arc<Self>, task: Arc<VmTask>) {
        info!("Connected to job {}", self.path);
        *locks::write(&self.connected) = Some(task.clone());
        let wait = Arc::downgrade(self);
        task.on_completed(Arc::new(move |_| {
            if let Some(wait) = wait.upgrade() {
                wait.completion.signal(wait.status());
            }
        }));
    }

    fn fail(&self, failure: WaitFailure) {
        {
            let mut slot = locks::write(&self.failure);
            if slot.is_some() {
                return;
            }
            *slot = Some(failure);
        }
        self.completion.signal(self.status());
    }

    fn spawn_poller(self: &Arc<Self>) {
        let wait = Arc::downgrade(self);
        let period = self.poll_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let Some(wait) = wait.upgrade() else {
                    break;
                };
                if wait.poll_once().await {
                    break;
                }
            }
        });
        *locks::lock(&self.poller) = Some(handle);
    }

    /// One poll round. Returns true once the wait is over.
    async fn poll_once(self: &Arc<Self>) -> bool {
        if self.is_completed() {
            return true;
        }
        let attempt = match self.connected_task() {
            Some(task) => task.refresh(self.poll_interval).await.map(|_| ()),
            None => self
                .source
                .resolve_task(&self.path)
                .await
                .map(|task| self.connect(task)),
        };

        match attempt {
            Ok(()) => self.tracker.record_success().await,
            Err(e) if e.is_transient() => match self.tracker.record_failure().await {
                Verdict::Retry { elapsed, failures } => info!(
                    "Job {} unreachable for {:?} ({} attempts), still polling: {}",
                    self.path, elapsed, failures, e
                ),
                Verdict::GiveUp { elapsed, .. } => {
                    warn!(
                        "Giving up on job {} after {:?} without a connection",
                        self.path, elapsed
                    );
                    self.fail(WaitFailure::NetworkTimeout);
                }
            },
            Err(e) if e.is_object_gone() => {
                warn!("Job {} is gone: {}", self.path, e);
                self.fail(WaitFailure::Deleted);
            }
            Err(e) => {
                error!("Waiting on job {} failed: {}", self.path, e);
                self.fail(WaitFailure::Unexpected(e.summary()));
            }
        }

        if self.is_completed() {
            self.completion.signal(self.status());
            return true;
        }
        false
    }
}

#[async_trait]
impl Task for NetworkTaskWait {
    fn instance_id(&self) -> String {
        self.path
            .key("InstanceID")
            .and_then(|k| k.as_str())
            .unwrap_or_default()
            .to_string()
    }

    fn name(&self) -> String {
        self.connected_task().map(|t| t.name()).unwrap_or_default()
    }

    fn status(&self) -> TaskStatus {
        if self.failure().is_some() {
            return TaskStatus::CompletedWithErrors;
        }
        self.connected_task()
            .map_or(TaskStatus::Running, |t| t.status())
    }

    fn error_code(&self) -> i64 {
        match self.failure() {
            Some(failure) => failure.code(),
            None => self.connected_task().map_or(codes::SUCCESS, |t| t.error_code()),
        }
    }

    fn percent_complete(&self) -> u16 {
        if self.failure().is_some() {
            return 100;
        }
        self.connected_task().map_or(0, |t| t.percent_complete())
    }

    fn error_summary(&self) -> Option<String> {
        self.connected_task().and_then(|t| t.error_summary())
    }

    fn error_detail(&self) -> Option<String> {
        self.connected_task().and_then(|t| t.error_detail())
    }

    fn is_deleted(&self) -> bool {
        self.failure() == Some(WaitFailure::Deleted)
            || self.connected_task().is_some_and(|t| t.is_deleted())
    }

    fn client_failure_message(&self) -> Option<String> {
        match self.failure() {
            Some(failure) => Some(failure.message()),
            None => self.connected_task().and_then(|t| t.client_failure_message()),
        }
    }

    async fn cancel(&self) -> Result<()> {
        match self.connected_task() {
            Some(task) => task.cancel().await,
            None => Err(Error::cancel_task_failed(
                codes::CLIENT_DISCONNECTED,
                &DefaultErrorCodeMapper,
            )),
        }
    }

    async fn wait_for_completion(&self, timeout: Option<Duration>) -> bool {
        self.completion.wait(timeout).await
    }

    async fn get_errors(&self) -> Result<Vec<MsvmError>> {
        match self.connected_task() {
            Some(task) => task.get_errors().await,
            None => Ok(Vec::new()),
        }
    }

    fn on_completed(&self, handler: CompletedHandler) -> u64 {
        let finished = self.completion.is_signaled().then(|| self.status());
        self.completion.subscribe(handler, finished)
    }

    async fn dispose(&self) {
        if let Some(poller) = locks::lock(&self.poller).take() {
            poller.abort();
        }
        if let Some(task) = self.connected_task() {
            task.dispose().await;
        }
    }
}

impl fmt::Debug for NetworkTaskWait {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkTaskWait")
            .field("path", &self.path)
            .field("connected", &self.connected_task().is_some())
            .field("failure", &self.failure())
            .finish_non_exhaustive()
    }
}
