//! Class-wide modification monitoring
//!
//! Watching thousands of jobs with one subscription each overwhelms the
//! server, so the bulk monitor opens a single modification subscription per
//! class and dispatches by identity on the client.
//!
//! An event can arrive before the consumer interested in it registers (a job
//! may change state while its creator is still wiring itself up). Such events
//! are parked in a two-generation buffer: a registration replays the newest
//! parked event for its identity, and every cleanup interval the current
//! generation becomes the previous one and the old previous is discarded.

use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use virtmgmt_core_interface::{
    EventKind, EventStream, InstanceEvent, ObjectPath, QueryDialect, Session,
};
use virtmgmt_core_resilience::RefCountMap;

use super::manager::EventHandler;
use crate::error::{Error, Result};
use crate::locks;
use crate::query;

#[derive(Default)]
struct Missed {
    current: HashMap<ObjectPath, InstanceEvent>,
    previous: HashMap<ObjectPath, InstanceEvent>,
}

impl Missed {
    fn take(&mut self, path: &ObjectPath) -> Option<InstanceEvent> {
        let newer = self.current.remove(path);
        let older = self.previous.remove(path);
        newer.or(older)
    }

    fn rotate(&mut self) {
        self.previous = std::mem::take(&mut self.current);
    }
}

#[derive(Default)]
struct ClassShared {
    registrations: RwLock<HashMap<ObjectPath, Vec<(u64, EventHandler)>>>,
    missed: StdMutex<Missed>,
}

impl ClassShared {
    fn dispatch(&self, event: InstanceEvent) {
        let path = event.target.path();
        let handlers: Vec<EventHandler> = {
            let registrations = locks::read(&self.registrations);
            match registrations.get(&path) {
                Some(list) if !list.is_empty() => {
                    list.iter().map(|(_, h)| h.clone()).collect()
                }
                _ => {
                    // parked under the read lock so a concurrent register
                    // either sees it or was already in the map
                    locks::lock(&self.missed).current.insert(path, event);
                    return;
                }
            }
        };
        for handler in handlers {
            handler(&event);
        }
    }

    /// Add a handler, replaying the parked event for `path` first.
    ///
    /// The replay runs under the write lock so `dispatch` cannot deliver a
    /// newer event to the handler before the older parked one.
    fn add(&self, path: ObjectPath, id: u64, handler: EventHandler) -> bool {
        let mut registrations = locks::write(&self.registrations);
        let replay = locks::lock(&self.missed).take(&path);
        let replayed = replay.is_some();
        if let Some(event) = replay {
            debug!("Replaying parked event for {}", path);
            handler(&event);
        }
        registrations.entry(path).or_default().push((id, handler));
        replayed
    }

    fn remove(&self, path: &ObjectPath, id: u64) -> bool {
        let mut registrations = locks::write(&self.registrations);
        let Some(list) = registrations.get_mut(path) else {
            return false;
        };
        let before = list.len();
        list.retain(|(handler_id, _)| *handler_id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            registrations.remove(path);
        }
        removed
    }
}

struct ClassFeed {
    shared: Arc<ClassShared>,
    pump: JoinHandle<()>,
    rotation: JoinHandle<()>,
}

#[derive(Default)]
struct State {
    refs: RefCountMap<ObjectPath>,
    classes: HashMap<ObjectPath, ClassFeed>,
}

pub struct BulkMonitor {
    session: Arc<dyn Session>,
    within: Duration,
    cleanup_interval: Duration,
    state: Mutex<State>,
    next_id: AtomicU64,
}

impl BulkMonitor {
    pub fn new(
        session: Arc<dyn Session>,
        within: Duration,
        cleanup_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            session,
            within,
            cleanup_interval,
            state: Mutex::new(State::default()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Watch `path` for modifications.
    ///
    /// If an event for `path` was parked before this call, `handler` sees the
    /// newest one before `register` returns.
    pub async fn register(
        self: &Arc<Self>,
        path: ObjectPath,
        handler: EventHandler,
    ) -> Result<BulkSubscription> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let class = path.class_path();
        let mut state = self.state.lock().await;

        if state.refs.increment(class.clone()).is_first() {
            match self.open_class(&class).await {
                Ok(feed) => {
                    state.classes.insert(class.clone(), feed);
                }
                Err(e) => {
                    state.refs.decrement(&class);
                    return Err(e);
                }
            }
        }

        if let Some(feed) = state.classes.get(&class) {
            feed.shared.add(path.clone(), id, handler);
        }
        drop(state);

        Ok(BulkSubscription {
            monitor: Arc::downgrade(self),
            path,
            id,
            released: AtomicBool::new(false),
        })
    }

    async fn open_class(&self, class: &ObjectPath) -> Result<ClassFeed> {
        let text =
            query::event_query(EventKind::Modified, class, self.within, Vec::<String>::new());
        let stream = self
            .session
            .subscribe(class.namespace(), QueryDialect::Wql, &text)
            .await
            .map_err(|e| Error::from_session(self.session.server_name(), e, false))?;
        debug!("Bulk monitor subscribed: {}", text);

        let shared = Arc::new(ClassShared::default());
        let server = self.session.server_name().to_string();
        let pump = spawn_class_pump(stream, shared.clone(), server, text);
        let rotation = spawn_rotation(shared.clone(), self.cleanup_interval);
        Ok(ClassFeed {
            shared,
            pump,
            rotation,
        })
    }

    pub async fn unregister(&self, path: &ObjectPath, id: u64) {
        let class = path.class_path();
        let mut state = self.state.lock().await;
        let removed = state
            .classes
            .get(&class)
            .is_some_and(|feed| feed.shared.remove(path, id));
        if !removed {
            return;
        }

        if state.refs.decrement(&class).is_last() {
            if let Some(feed) = state.classes.remove(&class) {
                feed.rotation.abort();
                feed.pump.abort();
                let _ = feed.pump.await;
                debug!("Bulk monitor unsubscribed from {}", class.class_name());
            }
        }
    }

    /// Number of live registrations for `path`
    pub async fn registration_count(&self, path: &ObjectPath) -> usize {
        let state = self.state.lock().await;
        state
            .classes
            .get(&path.class_path())
            .and_then(|feed| {
                locks::read(&feed.shared.registrations)
                    .get(path)
                    .map(Vec::len)
            })
            .unwrap_or(0)
    }

    /// Whether an event for `path` is parked in either generation
    pub async fn has_missed_event(&self, path: &ObjectPath) -> bool {
        let state = self.state.lock().await;
        state.classes.get(&path.class_path()).is_some_and(|feed| {
            let missed = locks::lock(&feed.shared.missed);
            missed.current.contains_key(path) || missed.previous.contains_key(path)
        })
    }

    /// Number of classes with an open subscription
    pub async fn class_count(&self) -> usize {
        self.state.lock().await.classes.len()
    }

    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        state.refs.drain();
        for (_, feed) in state.classes.drain() {
            feed.rotation.abort();
            feed.pump.abort();
            let _ = feed.pump.await;
        }
    }
}

fn spawn_class_pump(
    mut stream: EventStream,
    shared: Arc<ClassShared>,
    server: String,
    query: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(next) = stream.next().await {
            match next {
                Ok(event) => shared.dispatch(event),
                Err(e) => {
                    let err = Error::from_session(&server, e, true);
                    warn!("Bulk event delivery failed for '{}': {}", query, err);
                }
            }
        }
        debug!("Bulk event stream ended: {}", query);
    })
}

fn spawn_rotation(shared: Arc<ClassShared>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            ticker.tick().await;
            locks::lock(&shared.missed).rotate();
        }
    })
}

/// Handle for one bulk registration; same release rules as
/// [`Subscription`](super::Subscription)
pub struct BulkSubscription {
    monitor: Weak<BulkMonitor>,
    path: ObjectPath,
    id: u64,
    released: AtomicBool,
}

impl BulkSubscription {
    pub fn path(&self) -> &ObjectPath {
        &self.path
    }

    pub async fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(monitor) = self.monitor.upgrade() {
            monitor.unregister(&self.path, self.id).await;
        }
    }
}

impl Drop for BulkSubscription {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(monitor) = self.monitor.upgrade() else {
            return;
        };
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let path = self.path.clone();
            let id = self.id;
            handle.spawn(async move { monitor.unregister(&path, id).await });
        }
    }
}
