//! Fails running tasks when their server stops answering
//!
//! Job completion normally arrives through events. If the server goes away
//! those events never come, so while any task is registered the tester
//! probes the management service and, on failure, tells every registered
//! task it was disconnected.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};
use virtmgmt_core_interface::Session;

use super::{Task, VmTask};
use crate::keys::{classes, namespaces};
use crate::locks;

const NOT_CONNECTED: &str = "The connection to the server was lost while the task was running.";
const SERVICE_NOT_RUNNING: &str =
    "The virtual machine management service stopped while the task was running.";

#[derive(Default)]
struct Registry {
    tasks: Vec<(u64, Weak<VmTask>)>,
    probe: Option<JoinHandle<()>>,
}

pub struct TaskConnectionTester {
    session: Arc<dyn Session>,
    interval: Duration,
    registry: Mutex<Registry>,
    next_id: AtomicU64,
}

impl TaskConnectionTester {
    pub fn new(session: Arc<dyn Session>, interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            session,
            interval,
            registry: Mutex::new(Registry::default()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Track `task` until it completes. Starts probing on the first task.
    pub fn register(self: &Arc<Self>, task: &Arc<VmTask>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut registry = locks::lock(&self.registry);
        registry.tasks.push((id, Arc::downgrade(task)));
        if registry.probe.is_none() {
            debug!(
                "Starting connection checks for tasks on {}",
                self.session.server_name()
            );
            registry.probe = Some(self.spawn_probe());
        }
        id
    }

    pub fn unregister(&self, id: u64) {
        let mut registry = locks::lock(&self.registry);
        registry.tasks.retain(|(task_id, _)| *task_id != id);
        if registry.tasks.is_empty() {
            if let Some(probe) = registry.probe.take() {
                probe.abort();
            }
        }
    }

    pub fn len(&self) -> usize {
        locks::lock(&self.registry).tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_probing(&self) -> bool {
        locks::lock(&self.registry).probe.is_some()
    }

    fn spawn_probe(self: &Arc<Self>) -> JoinHandle<()> {
        let tester = Arc::downgrade(self);
        let interval = self.interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                let Some(tester) = tester.upgrade() else {
                    break;
                };
                if !tester.check_once().await {
                    break;
                }
            }
        })
    }

    /// One probe round. Returns false when probing should stop.
    async fn check_once(&self) -> bool {
        {
            let mut registry = locks::lock(&self.registry);
            registry
                .tasks
                .retain(|(_, task)| task.upgrade().is_some_and(|t| !t.is_completed()));
            if registry.tasks.is_empty() {
                registry.probe = None;
                return false;
            }
        }

        debug!(
            "Testing the connection to {} for running tasks",
            self.session.server_name()
        );
        let failure = match self
            .session
            .enumerate_instances(
                namespaces::VIRTUALIZATION,
                classes::VIRTUAL_SYSTEM_MANAGEMENT_SERVICE,
            )
            .await
        {
            Ok(services) if services.is_empty() => SERVICE_NOT_RUNNING,
            Ok(_) => return true,
            Err(e) => {
                debug!("Connection probe failed: {}", e);
                NOT_CONNECTED
            }
        };

        warn!(
            "Server {} is unreachable or its management service stopped; failing running tasks",
            self.session.server_name()
        );
        let tasks = {
            let mut registry = locks::lock(&self.registry);
            registry.probe = None;
            std::mem::take(&mut registry.tasks)
        };
        for task in tasks.into_iter().filter_map(|(_, task)| task.upgrade()) {
            task.inform_server_disconnected(failure);
        }
        false
    }
}
