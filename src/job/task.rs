//! Live tracking of a server-side concrete job

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use virtmgmt_core_interface::{NativeErrorCode, ObjectPath, Value};

use super::{
    CompletedHandler, Completion, JobState, MsvmError, Task, TaskConnectionTester, TaskStatus,
    REQUEST_CANCEL_STATE,
};
use crate::embedded::EmbeddedInstance;
use crate::error::{codes, Error, Result};
use crate::locks;
use crate::proxy::{DeletedSubscription, ModificationRegistration, ModificationStrategy, Proxy};

#[derive(Default)]
struct Strings {
    name: Option<String>,
    detail: Option<String>,
    summary: Option<String>,
}

/// State and server code captured at the first terminal observation
#[derive(Debug, Clone, Copy)]
struct Frozen {
    state: JobState,
    server_code: u16,
}

#[derive(Default)]
struct Watch {
    cache_handler: Option<u64>,
    modification: Option<ModificationRegistration>,
    deleted: Option<DeletedSubscription>,
    recheck: Option<JoinHandle<()>>,
}

pub struct VmTask {
    proxy: Arc<Proxy>,
    strings: RwLock<Strings>,
    frozen: Mutex<Option<Frozen>>,
    deleted: AtomicBool,
    client_error: AtomicI64,
    client_message: RwLock<Option<String>>,
    completion: Completion,
    watch: Mutex<Watch>,
    stopped: AtomicBool,
    tester: Mutex<Option<(Weak<TaskConnectionTester>, u64)>>,
    disposed: AtomicBool,
}

impl VmTask {
    fn new(proxy: Arc<Proxy>) -> Self {
        Self {
            proxy,
            strings: RwLock::new(Strings::default()),
            frozen: Mutex::new(None),
            deleted: AtomicBool::new(false),
            client_error: AtomicI64::new(codes::SUCCESS),
            client_message: RwLock::new(None),
            completion: Completion::new(),
            watch: Mutex::new(Watch::default()),
            stopped: AtomicBool::new(false),
            tester: Mutex::new(None),
            disposed: AtomicBool::new(false),
        }
    }

    /// Start tracking the job behind `proxy`.
    ///
    /// The localized strings are loaded before anything is subscribed. A job
    /// that is already terminal completes immediately and never subscribes.
    /// Otherwise the task registers for bulk modification events and for
    /// deletion, refreshes once so a completion that raced the subscription
    /// is not missed, then joins `tester` and starts the periodic re-check.
    pub async fn attach(
        proxy: Arc<Proxy>,
        tester: Option<Arc<TaskConnectionTester>>,
    ) -> Result<Arc<VmTask>> {
        let task = Arc::new(VmTask::new(proxy));
        task.load_strings(true).await?;

        if task.cached_state().is_some_and(JobState::is_terminal) {
            task.stopped.store(true, Ordering::Release);
            task.observe();
            return Ok(task);
        }

        let weak = Arc::downgrade(&task);
        let handler_id = task.proxy.on_cache_updated(Arc::new(move |_: &Proxy| {
            if let Some(task) = weak.upgrade() {
                task.observe();
            }
        }));
        task.keep(|watch| watch.cache_handler = Some(handler_id));

        if let Err(e) = task.subscribe().await {
            task.stop_watching();
            return Err(e);
        }

        match task.proxy.refresh_now().await {
            Ok(()) => {}
            Err(e) if e.is_object_gone() => {
                debug!("Job {} vanished while attaching", task.proxy.path());
                task.on_job_deleted();
            }
            Err(e) => {
                task.stop_watching();
                return Err(e);
            }
        }

        if !task.is_completed() {
            if let Some(tester) = tester {
                let id = tester.register(&task);
                *locks::lock(&task.tester) = Some((Arc::downgrade(&tester), id));
            }
            let recheck = task.spawn_recheck();
            let mut watch = locks::lock(&task.watch);
            if task.stopped.load(Ordering::Acquire) {
                recheck.abort();
                drop(watch);
                task.leave_tester();
            } else {
                watch.recheck = Some(recheck);
            }
        }
        Ok(task)
    }

    async fn subscribe(self: &Arc<Self>) -> Result<()> {
        let modification = self
            .proxy
            .register_modification_events(ModificationStrategy::Bulk)
            .await?;
        self.keep(|watch| watch.modification = Some(modification));

        let weak = Arc::downgrade(self);
        let deleted = self
            .proxy
            .on_deleted(Arc::new(move |_: &ObjectPath| {
                if let Some(task) = weak.upgrade() {
                    task.on_job_deleted();
                }
            }))
            .await?;
        self.keep(|watch| watch.deleted = Some(deleted));
        Ok(())
    }

    /// Store a registration unless watching already stopped, in which case
    /// it is dropped and released right away
    fn keep(&self, store: impl FnOnce(&mut Watch)) {
        let mut watch = locks::lock(&self.watch);
        if self.stopped.load(Ordering::Acquire) {
            let mut discarded = Watch::default();
            store(&mut discarded);
            drop(watch);
            self.release(discarded);
        } else {
            store(&mut watch);
        }
    }

    pub fn proxy(&self) -> &Arc<Proxy> {
        &self.proxy
    }

    pub fn path(&self) -> &ObjectPath {
        self.proxy.path()
    }

    /// Refresh the job if its cache is older than `threshold`
    pub async fn refresh(&self, threshold: Duration) -> Result<bool> {
        self.proxy.refresh_properties(threshold).await
    }

    /// Fail the task because its server can no longer be reached
    pub fn inform_server_disconnected(&self, message: &str) {
        if self.is_completed() {
            return;
        }
        warn!("Task {} lost its server: {}", self.proxy.path(), message);
        *locks::write(&self.client_message) = Some(message.to_string());
        self.client_error
            .store(codes::CLIENT_DISCONNECTED, Ordering::Release);
        self.stop_watching();
        self.completion.signal(self.status());
    }

    async fn load_strings(&self, with_name: bool) -> Result<()> {
        match self.proxy.context().session().get_instance(self.proxy.path()).await {
            Ok(instance) => {
                let text = |name: &str| {
                    instance
                        .get(name)
                        .and_then(Value::as_str)
                        .map(str::to_string)
                };
                {
                    let mut strings = locks::write(&self.strings);
                    if with_name {
                        strings.name = text("ElementName");
                    }
                    strings.detail = text("ErrorDescription");
                    strings.summary = text("ErrorSummaryDescription");
                }
                if with_name {
                    self.proxy.update_from(instance);
                }
                Ok(())
            }
            Err(e) => {
                if e.native_code() != Some(NativeErrorCode::NotFound) {
                    error!("Could not load strings for job {}: {}", self.proxy.path(), e);
                }
                let name = if with_name {
                    let value = self.proxy.get_property("ElementName").await?;
                    value.as_str().map(str::to_string)
                } else {
                    None
                };
                let cached = |name: &str| {
                    self.proxy
                        .cached_property(name)
                        .ok()
                        .flatten()
                        .and_then(|v| v.as_str().map(str::to_string))
                };
                let mut strings = locks::write(&self.strings);
                if with_name {
                    strings.name = name;
                }
                strings.detail = cached("ErrorDescription");
                strings.summary = cached("ErrorSummaryDescription");
                Ok(())
            }
        }
    }

    fn cached_state(&self) -> Option<JobState> {
        self.proxy
            .cached_property("JobState")
            .ok()
            .flatten()
            .and_then(|v| v.as_u16())
            .and_then(JobState::from_code)
    }

    fn cached_server_code(&self) -> u16 {
        self.proxy
            .cached_property("ErrorCode")
            .ok()
            .flatten()
            .and_then(|v| v.as_u16())
            .unwrap_or(0)
    }

    fn frozen(&self) -> Option<Frozen> {
        *locks::lock(&self.frozen)
    }

    fn current_state(&self) -> Option<JobState> {
        self.frozen().map(|f| f.state).or_else(|| self.cached_state())
    }

    fn client_failed(&self) -> bool {
        self.deleted.load(Ordering::Acquire) || self.client_error.load(Ordering::Acquire) != 0
    }

    /// React to a cache update: freeze on the first terminal state
    fn observe(self: &Arc<Self>) {
        let Some(state) = self.cached_state() else {
            return;
        };
        if !state.is_terminal() {
            debug!("Job {} is {}", self.proxy.path(), state);
            return;
        }
        let server_code = self.cached_server_code();
        {
            let mut frozen = locks::lock(&self.frozen);
            if frozen.is_some() {
                return;
            }
            *frozen = Some(Frozen { state, server_code });
        }
        info!(
            "Job {} finished: {} (error code {})",
            self.proxy.path(),
            state,
            server_code
        );
        self.stop_watching();

        let code = i64::from(server_code);
        let reload = (code != codes::SUCCESS && code != codes::JOB_STARTED)
            || state == JobState::CompletedWithWarnings;
        if reload {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                let task = self.clone();
                runtime.spawn(async move {
                    if let Err(e) = task.load_strings(false).await {
                        warn!("Could not reload strings for job {}: {}", task.proxy.path(), e);
                    }
                    task.completion.signal(task.status());
                });
                return;
            }
        }
        self.completion.signal(self.status());
    }

    fn on_job_deleted(&self) {
        let watch = {
            let mut watch = locks::lock(&self.watch);
            if self.stopped.swap(true, Ordering::AcqRel) {
                return;
            }
            self.deleted.store(true, Ordering::Release);
            std::mem::take(&mut *watch)
        };
        info!("Job {} was deleted before completing", self.proxy.path());
        self.release(watch);
        self.completion.signal(self.status());
    }

    /// Stop events, the re-check and connection testing. Runs once.
    fn stop_watching(&self) {
        let watch = {
            let mut watch = locks::lock(&self.watch);
            if self.stopped.swap(true, Ordering::AcqRel) {
                return;
            }
            std::mem::take(&mut *watch)
        };
        self.release(watch);
    }

    /// Registrations dropped here release themselves in the background
    fn release(&self, watch: Watch) {
        if let Some(id) = watch.cache_handler {
            self.proxy.remove_cache_updated(id);
        }
        if let Some(recheck) = watch.recheck {
            recheck.abort();
        }
        self.leave_tester();
    }

    fn leave_tester(&self) {
        if let Some((tester, id)) = locks::lock(&self.tester).take() {
            if let Some(tester) = tester.upgrade() {
                tester.unregister(id);
            }
        }
    }

    fn spawn_recheck(self: &Arc<Self>) -> JoinHandle<()> {
        let task = Arc::downgrade(self);
        let period = self.proxy.context().config().job_recheck_interval();
        let path = self.proxy.path().clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(task) = task.upgrade() else {
                    break;
                };
                if task.stopped.load(Ordering::Acquire) {
                    break;
                }
                match task.refresh(period).await {
                    Ok(_) => {}
                    Err(e) if e.is_object_gone() => break,
                    Err(e) => debug!("Re-check of job {} failed: {}", path, e),
                }
            }
        })
    }
}

#[async_trait]
impl Task for VmTask {
    fn instance_id(&self) -> String {
        self.proxy
            .path()
            .key("InstanceID")
            .and_then(|k| k.as_str())
            .unwrap_or_default()
            .to_string()
    }

    fn name(&self) -> String {
        locks::read(&self.strings).name.clone().unwrap_or_default()
    }

    fn status(&self) -> TaskStatus {
        let failed = self.client_failed();
        match self.current_state() {
            Some(state) => TaskStatus::from_state(state, failed),
            None if failed => TaskStatus::CompletedWithErrors,
            None => TaskStatus::Running,
        }
    }

    fn is_completed(&self) -> bool {
        self.client_failed() || self.current_state().is_some_and(JobState::is_terminal)
    }

    fn error_code(&self) -> i64 {
        let server_code = i64::from(
            self.frozen()
                .map(|f| f.server_code)
                .unwrap_or_else(|| self.cached_server_code()),
        );
        let client_code = if self.deleted.load(Ordering::Acquire) {
            codes::CLIENT_DELETED
        } else {
            self.client_error.load(Ordering::Acquire)
        };
        let server_accepted = server_code == codes::SUCCESS || server_code == codes::JOB_STARTED;
        if client_code != 0 && server_accepted {
            client_code
        } else {
            server_code
        }
    }

    fn percent_complete(&self) -> u16 {
        if self.frozen().is_some() || self.client_failed() {
            return 100;
        }
        self.proxy
            .cached_property("PercentComplete")
            .ok()
            .flatten()
            .and_then(|v| v.as_u16())
            .unwrap_or(0)
    }

    fn error_summary(&self) -> Option<String> {
        locks::read(&self.strings).summary.clone()
    }

    fn error_detail(&self) -> Option<String> {
        locks::read(&self.strings).detail.clone()
    }

    fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    fn client_failure_message(&self) -> Option<String> {
        locks::read(&self.client_message).clone()
    }

    async fn cancel(&self) -> Result<()> {
        let mapper = self.proxy.context().mapper();
        if self.is_completed() {
            return Err(Error::cancel_task_failed(codes::FAILED, mapper));
        }
        info!("Canceling job {}", self.proxy.path());
        let output = self
            .proxy
            .invoke(
                "RequestStateChange",
                &[("RequestedState".to_string(), Value::from(REQUEST_CANCEL_STATE))],
            )
            .await?;
        match i64::from(output.return_value) {
            codes::SUCCESS => Ok(()),
            codes::JOB_STARTED => {
                self.wait_for_completion(None).await;
                match self.status() {
                    TaskStatus::Canceled => Ok(()),
                    _ => Err(Error::cancel_task_failed(self.error_code(), mapper)),
                }
            }
            code => Err(Error::cancel_task_failed(code, mapper)),
        }
    }

    async fn wait_for_completion(&self, timeout: Option<Duration>) -> bool {
        self.completion.wait(timeout).await
    }

    async fn get_errors(&self) -> Result<Vec<MsvmError>> {
        let output = self.proxy.invoke("GetErrorEx", &[]).await?;
        if output.return_value != 0 {
            warn!(
                "GetErrorEx on {} returned {}",
                self.proxy.path(),
                output.return_value
            );
            return Ok(Vec::new());
        }
        let blobs = output
            .get("Errors")
            .and_then(Value::as_str_array)
            .unwrap_or_default();
        let mut errors = Vec::with_capacity(blobs.len());
        for blob in blobs {
            match EmbeddedInstance::parse(blob, None).and_then(|e| e.convert_to::<MsvmError>()) {
                Ok(error) => errors.push(error),
                Err(e) => warn!("Skipping undecodable job error on {}: {}", self.proxy.path(), e),
            }
        }
        Ok(errors)
    }

    fn on_completed(&self, handler: CompletedHandler) -> u64 {
        let finished = self
            .completion
            .is_signaled()
            .then(|| self.status());
        self.completion.subscribe(handler, finished)
    }

    async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let watch = {
            let mut watch = locks::lock(&self.watch);
            self.stopped.store(true, Ordering::Release);
            std::mem::take(&mut *watch)
        };
        if let Some(id) = watch.cache_handler {
            self.proxy.remove_cache_updated(id);
        }
        if let Some(recheck) = watch.recheck {
            recheck.abort();
        }
        self.leave_tester();
        if let Some(modification) = watch.modification {
            modification.release().await;
        }
        if let Some(deleted) = watch.deleted {
            deleted.release().await;
        }
        debug!("Disposed task for {}", self.proxy.path());
    }
}

impl std::fmt::Debug for VmTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmTask")
            .field("path", self.proxy.path())
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::context::ServerContext;
    use crate::embedded::serialize;
    use crate::keys::{classes, namespaces};
    use crate::session::mock::{MockOp, MockSession};
    use std::sync::atomic::AtomicUsize;
    use virtmgmt_core_interface::{Instance, MethodOutput};

    fn job(state: u16, error_code: u16) -> Instance {
        Instance::new("HOST01", namespaces::VIRTUALIZATION, classes::CONCRETE_JOB)
            .with_key("InstanceID", "job-1")
            .with_property("ElementName", "Start VM")
            .with_property("JobState", state)
            .with_property("ErrorCode", error_code)
            .with_property("PercentComplete", 40u16)
            .with_property("ErrorDescription", "")
            .with_property("ErrorSummaryDescription", "")
    }

    async fn attach(session: &MockSession) -> Arc<VmTask> {
        let ctx = ServerContext::new(Arc::new(session.clone()), Arc::new(ModelConfig::default()));
        let proxy = Proxy::new(job(4, 0).path(), ctx, Weak::new());
        VmTask::attach(proxy, None).await.unwrap()
    }

    #[tokio::test]
    async fn test_terminal_job_never_subscribes() {
        let session = MockSession::new("HOST01").with_instance(job(7, 0));
        let task = attach(&session).await;
        assert_eq!(task.status(), TaskStatus::CompletedSuccessfully);
        assert_eq!(task.name(), "Start VM");
        assert_eq!(task.instance_id(), "job-1");
        assert_eq!(task.percent_complete(), 100);
        assert!(task.wait_for_completion(Some(Duration::ZERO)).await);
        assert_eq!(session.subscribe_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_completes_and_freezes() {
        let session = MockSession::new("HOST01").with_instance(job(4, 0));
        let task = attach(&session).await;
        assert_eq!(task.status(), TaskStatus::Running);
        assert_eq!(task.percent_complete(), 40);

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        task.on_completed(Arc::new(move |status| {
            assert_eq!(status, TaskStatus::CompletedSuccessfully);
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        session.update_and_emit(job(7, 0));
        assert!(task.wait_for_completion(Some(Duration::from_secs(5))).await);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // later snapshots do not change the frozen outcome
        task.proxy().update_from(job(10, 32768));
        assert_eq!(task.status(), TaskStatus::CompletedSuccessfully);
        assert_eq!(task.error_code(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_job_reloads_strings() {
        let session = MockSession::new("HOST01").with_instance(job(4, 0));
        let task = attach(&session).await;

        let failed = job(10, 32768)
            .with_property("ErrorDescription", "Disk not found")
            .with_property("ErrorSummaryDescription", "Start failed");
        session.update_and_emit(failed);
        assert!(task.wait_for_completion(Some(Duration::from_secs(5))).await);
        assert_eq!(task.status(), TaskStatus::CompletedWithErrors);
        assert_eq!(task.error_code(), 32768);
        assert_eq!(task.error_summary().as_deref(), Some("Start failed"));
        assert_eq!(task.error_detail().as_deref(), Some("Disk not found"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deleted_job_reports_client_code() {
        let session = MockSession::new("HOST01").with_instance(job(4, 0));
        let task = attach(&session).await;

        session.delete_and_emit(&job(4, 0).path());
        assert!(task.wait_for_completion(Some(Duration::from_secs(5))).await);
        assert!(task.is_deleted());
        assert_eq!(task.status(), TaskStatus::CompletedWithErrors);
        assert_eq!(task.error_code(), codes::CLIENT_DELETED);
        assert_eq!(task.percent_complete(), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recheck_catches_missed_event() {
        let session = MockSession::new("HOST01").with_instance(job(4, 0));
        let task = attach(&session).await;

        session.put_instance(job(7, 0));
        assert!(task.wait_for_completion(Some(Duration::from_secs(5))).await);
        assert_eq!(task.status(), TaskStatus::CompletedSuccessfully);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_waits_for_terminated() {
        let session = MockSession::new("HOST01").with_instance(job(4, 0));
        let task = attach(&session).await;

        let server = session.clone();
        session.on_invoke("RequestStateChange", move |_, args| {
            assert_eq!(args[0].1.as_u16(), Some(REQUEST_CANCEL_STATE));
            server.put_instance(job(8, 0));
            Ok(MethodOutput::new(4096))
        });
        task.cancel().await.unwrap();
        assert_eq!(task.status(), TaskStatus::Canceled);
        assert_eq!(task.error_code(), 0);

        let err = task.cancel().await.unwrap_err();
        assert!(matches!(err, Error::CancelTaskFailed { error_code: codes::FAILED, .. }));
    }

    #[tokio::test]
    async fn test_cancel_rejected_by_server() {
        let session = MockSession::new("HOST01").with_instance(job(4, 0));
        let task = attach(&session).await;
        session.on_invoke("RequestStateChange", |_, _| Ok(MethodOutput::new(32775)));
        let err = task.cancel().await.unwrap_err();
        assert!(matches!(err, Error::CancelTaskFailed { error_code: 32775, .. }));
        task.dispose().await;
    }

    #[tokio::test]
    async fn test_get_errors_skips_bad_entries() {
        let session = MockSession::new("HOST01").with_instance(job(10, 32768));
        let task = attach(&session).await;
        let good = serialize(
            &Instance::new("HOST01", namespaces::VIRTUALIZATION, "Msvm_Error")
                .with_property("Message", "Out of memory")
                .with_property("MessageID", "4"),
        )
        .unwrap();
        session.on_invoke("GetErrorEx", move |_, _| {
            Ok(MethodOutput::new(0).with_out(
                "Errors",
                Value::Array(vec![Value::from(good.clone()), Value::from("<not an instance")]),
            ))
        });
        let errors = task.get_errors().await.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "Out of memory");
        assert_eq!(errors[0].id, 4);
    }

    #[tokio::test]
    async fn test_dispose_releases_subscriptions_once() {
        let session = MockSession::new("HOST01").with_instance(job(4, 0));
        let task = attach(&session).await;
        assert_eq!(session.active_subscriptions().len(), 2);

        task.dispose().await;
        task.dispose().await;
        assert!(session.active_subscriptions().is_empty());
        assert_eq!(session.calls(MockOp::Subscribe), 2);
    }
}
