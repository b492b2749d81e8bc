//! Deduplicated instance event subscriptions
//!
//! Every distinct [`EventKey`] maps to exactly one remote subscription no
//! matter how many consumers register for it. The first registration
//! subscribes and spawns a pump that fans events out to the handler list;
//! the last release aborts the pump, which drops the stream and with it the
//! remote subscription.

use futures::StreamExt;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use virtmgmt_core_interface::{
    EventKind, EventStream, InstanceEvent, ObjectPath, QueryDialect, Session,
};
use virtmgmt_core_resilience::RefCountMap;

use crate::error::{Error, Result};
use crate::locks;
use crate::query;

/// Callback invoked for every delivered event
pub type EventHandler = Arc<dyn Fn(&InstanceEvent) + Send + Sync>;

pub(crate) type HandlerList = Arc<RwLock<Vec<(u64, EventHandler)>>>;

/// What to listen for. Equal keys share one remote subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventKey {
    /// Instance path, or a class path for class-wide events
    pub path: ObjectPath,
    pub kind: EventKind,
    /// Extra `WHERE` conditions, ANDed in sorted order
    pub conditions: BTreeSet<String>,
}

impl EventKey {
    pub fn new(path: ObjectPath, kind: EventKind) -> Self {
        Self {
            path,
            kind,
            conditions: BTreeSet::new(),
        }
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.conditions.insert(condition.into());
        self
    }

    pub fn query_text(&self, within: Duration) -> String {
        query::event_query(self.kind, &self.path, within, &self.conditions)
    }
}

struct Feed {
    handlers: HandlerList,
    pump: JoinHandle<()>,
    query: String,
}

#[derive(Default)]
struct State {
    refs: RefCountMap<EventKey>,
    feeds: HashMap<EventKey, Feed>,
}

pub struct InstanceEventManager {
    session: Arc<dyn Session>,
    within: Duration,
    state: Mutex<State>,
    next_id: AtomicU64,
}

impl InstanceEventManager {
    pub fn new(session: Arc<dyn Session>, within: Duration) -> Arc<Self> {
        Arc::new(Self {
            session,
            within,
            state: Mutex::new(State::default()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Add `handler` for `key`, subscribing remotely if this is the first
    pub async fn register(
        self: &Arc<Self>,
        key: EventKey,
        handler: EventHandler,
    ) -> Result<Subscription> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock().await;

        if state.refs.increment(key.clone()).is_first() {
            let text = key.query_text(self.within);
            let stream = match self
                .session
                .subscribe(key.path.namespace(), QueryDialect::Wql, &text)
                .await
            {
                Ok(stream) => stream,
                Err(e) => {
                    state.refs.decrement(&key);
                    return Err(Error::from_session(self.session.server_name(), e, false));
                }
            };
            debug!("Subscribed to {} events: {}", key.kind, text);

            let handlers: HandlerList = Arc::new(RwLock::new(vec![(id, handler)]));
            let pump = spawn_pump(
                stream,
                handlers.clone(),
                self.session.server_name().to_string(),
                text.clone(),
            );
            state.feeds.insert(
                key.clone(),
                Feed {
                    handlers,
                    pump,
                    query: text,
                },
            );
        } else if let Some(feed) = state.feeds.get(&key) {
            locks::write(&feed.handlers).push((id, handler));
        }

        Ok(Subscription {
            manager: Arc::downgrade(self),
            key,
            id,
            released: AtomicBool::new(false),
        })
    }

    /// Remove one handler; the last one tears the remote subscription down
    pub async fn unregister(&self, key: &EventKey, id: u64) {
        let mut state = self.state.lock().await;
        let removed = match state.feeds.get(key) {
            Some(feed) => {
                let mut handlers = locks::write(&feed.handlers);
                let before = handlers.len();
                handlers.retain(|(handler_id, _)| *handler_id != id);
                handlers.len() != before
            }
            None => false,
        };
        if !removed {
            return;
        }

        if state.refs.decrement(key).is_last() {
            if let Some(feed) = state.feeds.remove(key) {
                feed.pump.abort();
                let _ = feed.pump.await;
                debug!("Unsubscribed from {} events: {}", key.kind, feed.query);
            }
        }
    }

    pub async fn handler_count(&self, key: &EventKey) -> usize {
        let state = self.state.lock().await;
        state
            .feeds
            .get(key)
            .map(|feed| locks::read(&feed.handlers).len())
            .unwrap_or(0)
    }

    /// Number of open remote subscriptions
    pub async fn subscription_count(&self) -> usize {
        self.state.lock().await.feeds.len()
    }

    /// Drop every subscription regardless of outstanding handles
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        state.refs.drain();
        for (_, feed) in state.feeds.drain() {
            feed.pump.abort();
            let _ = feed.pump.await;
        }
    }
}

pub(crate) fn spawn_pump(
    mut stream: EventStream,
    handlers: HandlerList,
    server: String,
    query: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(next) = stream.next().await {
            match next {
                Ok(event) => {
                    let snapshot: Vec<EventHandler> = locks::read(&handlers)
                        .iter()
                        .map(|(_, handler)| handler.clone())
                        .collect();
                    for handler in snapshot {
                        handler(&event);
                    }
                }
                Err(e) => {
                    let err = Error::from_session(&server, e, true);
                    warn!("Event delivery failed for '{}': {}", query, err);
                }
            }
        }
        debug!("Event stream ended: {}", query);
    })
}

/// Handle for one registered handler.
///
/// `release` is idempotent. Dropping an unreleased handle releases it on the
/// current runtime.
pub struct Subscription {
    manager: Weak<InstanceEventManager>,
    key: EventKey,
    id: u64,
    released: AtomicBool,
}

impl Subscription {
    pub fn key(&self) -> &EventKey {
        &self.key
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    pub async fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(manager) = self.manager.upgrade() {
            manager.unregister(&self.key, self.id).await;
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let key = self.key.clone();
                let id = self.id;
                handle.spawn(async move { manager.unregister(&key, id).await });
            }
            Err(_) => debug!("Subscription for {} dropped outside a runtime", self.key.path),
        }
    }
}
