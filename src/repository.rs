//! Identity map of live proxies
//!
//! At most one [`Proxy`] exists per identity. Entries are held strongly
//! while in use; once idle past the timeout they are downgraded to a weak
//! reference so the proxy dies with its last outside user. A lookup that
//! still finds the proxy alive re-upgrades the entry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;
use virtmgmt_core_interface::ObjectPath;

use crate::locks;
use crate::proxy::Proxy;

struct Slot {
    strong: Option<Arc<Proxy>>,
    weak: Weak<Proxy>,
    last_access: Instant,
}

impl Slot {
    fn new(proxy: &Arc<Proxy>) -> Self {
        Self {
            strong: Some(proxy.clone()),
            weak: Arc::downgrade(proxy),
            last_access: Instant::now(),
        }
    }

    fn touch(&mut self) -> Option<Arc<Proxy>> {
        let proxy = self.weak.upgrade()?;
        self.strong = Some(proxy.clone());
        self.last_access = Instant::now();
        Some(proxy)
    }
}

pub struct ProxyRepository {
    entries: Mutex<HashMap<ObjectPath, Slot>>,
    idle_timeout: Duration,
}

impl ProxyRepository {
    pub fn new(idle_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            idle_timeout,
        })
    }

    /// Live proxy for `path`, if any
    pub fn get(&self, path: &ObjectPath) -> Option<Arc<Proxy>> {
        let mut entries = locks::lock(&self.entries);
        let slot = entries.get_mut(path)?;
        match slot.touch() {
            Some(proxy) => Some(proxy),
            None => {
                entries.remove(path);
                None
            }
        }
    }

    /// Existing proxy for `path`, or the one `make` builds.
    ///
    /// `make` runs under the repository lock and receives the back reference
    /// the new proxy should hold. The flag is true when `make` ran.
    pub fn get_or_insert_with<F>(self: &Arc<Self>, path: &ObjectPath, make: F) -> (Arc<Proxy>, bool)
    where
        F: FnOnce(Weak<ProxyRepository>) -> Arc<Proxy>,
    {
        let mut entries = locks::lock(&self.entries);
        if let Some(proxy) = entries.get_mut(path).and_then(Slot::touch) {
            return (proxy, false);
        }
        let proxy = make(Arc::downgrade(self));
        entries.insert(path.clone(), Slot::new(&proxy));
        debug!("Created proxy for {}", path);
        (proxy, true)
    }

    /// Forget `path`. Returns false if it was not registered.
    pub fn unregister(&self, path: &ObjectPath) -> bool {
        let removed = locks::lock(&self.entries).remove(path);
        match removed {
            Some(_) => {
                debug!("Evicted proxy for {}", path);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, path: &ObjectPath) -> bool {
        locks::lock(&self.entries)
            .get(path)
            .is_some_and(|slot| slot.weak.strong_count() > 0)
    }

    /// Drop the strong reference of every entry idle past the timeout
    pub fn downgrade_idle(&self) -> usize {
        let mut dropped = Vec::new();
        let mut entries = locks::lock(&self.entries);
        for slot in entries.values_mut() {
            if slot.strong.is_some() && slot.last_access.elapsed() > self.idle_timeout {
                dropped.extend(slot.strong.take());
            }
        }
        drop(entries);
        dropped.len()
    }

    /// Remove entries whose proxy is gone
    pub fn purge_dead(&self) -> usize {
        let mut entries = locks::lock(&self.entries);
        let before = entries.len();
        entries.retain(|_, slot| slot.weak.strong_count() > 0);
        before - entries.len()
    }

    pub fn cleanup(&self) {
        let downgraded = self.downgrade_idle();
        let purged = self.purge_dead();
        if downgraded + purged > 0 {
            debug!(
                "Repository cleanup: {} downgraded, {} purged, {} remaining",
                downgraded,
                purged,
                self.len()
            );
        }
    }

    /// Run [`cleanup`](Self::cleanup) every `interval` until the repository
    /// is dropped
    pub fn spawn_cleanup(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let repository = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                match repository.upgrade() {
                    Some(repository) => repository.cleanup(),
                    None => break,
                }
            }
        })
    }

    pub fn len(&self) -> usize {
        locks::lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let drained: Vec<Slot> = locks::lock(&self.entries).drain().map(|(_, s)| s).collect();
        drop(drained);
    }
}
