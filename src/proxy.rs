//! The local representative of one remote instance
//!
//! A [`Proxy`] owns the property and association caches for its identity and
//! is the only path through which the object model talks to the remote
//! instance. Event registrations on a proxy are reference counted: the first
//! deletion watcher or modification registration subscribes, the last
//! release unsubscribes.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use virtmgmt_core_interface::{
    ClassSchema, EventKind, Instance, InstanceEvent, MethodOutput, NativeErrorCode, ObjectPath,
    QueryDialect, Value,
};

use crate::cache::{Association, AssociationCache, CacheState, PropertyCache};
use crate::context::ServerContext;
use crate::error::{Error, MemberKind, Result};
use crate::events::{EventHandler, EventKey, EventRegistration};
use crate::locks;
use crate::repository::ProxyRepository;

pub type DeletedHandler = Arc<dyn Fn(&ObjectPath) + Send + Sync>;
pub type CacheUpdatedHandler = Arc<dyn Fn(&Proxy) + Send + Sync>;

/// How modification events reach a proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModificationStrategy {
    /// A dedicated subscription on this identity
    PerInstance,
    /// The class-wide bulk monitor
    Bulk,
}

#[derive(Default)]
struct RefSlot {
    count: u64,
    registration: Option<EventRegistration>,
}

pub struct Proxy {
    path: ObjectPath,
    ctx: Arc<ServerContext>,
    properties: PropertyCache,
    associations: AssociationCache,
    repository: Weak<ProxyRepository>,
    deleted: AtomicBool,
    deleted_handlers: RwLock<Vec<(u64, DeletedHandler)>>,
    deleted_slot: Mutex<RefSlot>,
    modification_slot: Mutex<RefSlot>,
    cache_handlers: RwLock<Vec<(u64, CacheUpdatedHandler)>>,
    refresh_lock: Mutex<()>,
    next_id: AtomicU64,
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("path", &self.path)
            .field("deleted", &self.is_deleted())
            .finish_non_exhaustive()
    }
}

impl Proxy {
    pub fn new(
        path: ObjectPath,
        ctx: Arc<ServerContext>,
        repository: Weak<ProxyRepository>,
    ) -> Arc<Self> {
        Arc::new(Self {
            properties: PropertyCache::new(path.clone()),
            path,
            ctx,
            associations: AssociationCache::new(),
            repository,
            deleted: AtomicBool::new(false),
            deleted_handlers: RwLock::new(Vec::new()),
            deleted_slot: Mutex::new(RefSlot::default()),
            modification_slot: Mutex::new(RefSlot::default()),
            cache_handlers: RwLock::new(Vec::new()),
            refresh_lock: Mutex::new(()),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn path(&self) -> &ObjectPath {
        &self.path
    }

    pub fn class_name(&self) -> &str {
        self.path.class_name()
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    pub fn properties(&self) -> &PropertyCache {
        &self.properties
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Property value, fetching the instance only if nothing is cached yet
    pub async fn get_property(&self, name: &str) -> Result<Value> {
        if let CacheState::Cached(value) = self.properties.lookup(name)? {
            return Ok(value);
        }
        self.refresh_now().await?;
        match self.properties.lookup(name)? {
            CacheState::Cached(value) => Ok(value),
            CacheState::NotFetched => Err(Error::ObjectNotFound {
                server: self.ctx.server_name().to_string(),
                target: self.path.to_string(),
            }),
        }
    }

    /// Cached value without any remote call; `None` if never fetched
    pub fn cached_property(&self, name: &str) -> Result<Option<Value>> {
        Ok(match self.properties.lookup(name)? {
            CacheState::Cached(value) => Some(value),
            CacheState::NotFetched => None,
        })
    }

    /// Write properties to the server immediately
    pub async fn set_properties(&self, updates: &[(String, Value)]) -> Result<()> {
        if let Some(schema) = self.properties.schema() {
            if let Some((name, _)) = updates.iter().find(|(name, _)| !schema.has_property(name)) {
                return Err(Error::schema_mismatch(MemberKind::Property, self.class_name(), name));
            }
        }

        self.ctx
            .session()
            .modify_instance(&self.path, updates)
            .await
            .map_err(|e| self.server_failure(e))?;

        debug!("Modified {} properties of {}", updates.len(), self.path);
        self.properties.merge(updates);
        self.notify_cache_updated();
        Ok(())
    }

    pub async fn invoke(&self, method: &str, args: &[(String, Value)]) -> Result<MethodOutput> {
        debug!("Invoking {} on {}", method, self.path);
        match self.ctx.session().invoke_method(&self.path, method, args).await {
            Ok(output) => Ok(output),
            Err(e) => match e.native_code() {
                Some(
                    NativeErrorCode::MethodNotFound
                    | NativeErrorCode::MethodNotAvailable
                    | NativeErrorCode::InvalidParameter,
                ) => {
                    warn!("{} rejected method {}: {}", self.class_name(), method, e);
                    Err(Error::schema_mismatch(MemberKind::Method, self.class_name(), method))
                }
                _ => Err(self.server_failure(e)),
            },
        }
    }

    /// Related identities, re-queried when older than the configured threshold
    pub async fn get_related(&self, association: &Association) -> Result<Arc<Vec<ObjectPath>>> {
        self.refresh_association(association, self.ctx.config().association_refresh_threshold())
            .await
    }

    /// Fetch the instance if the cache is older than `threshold`.
    /// Returns true when a fetch happened.
    pub async fn refresh_properties(&self, threshold: Duration) -> Result<bool> {
        if !self.properties.is_stale(threshold) {
            return Ok(false);
        }
        let _guard = self.refresh_lock.lock().await;
        if !self.properties.is_stale(threshold) {
            return Ok(false);
        }
        self.fetch_and_replace().await?;
        Ok(true)
    }

    /// Fetch the instance regardless of cache age
    pub async fn refresh_now(&self) -> Result<()> {
        let _guard = self.refresh_lock.lock().await;
        self.fetch_and_replace().await
    }

    async fn fetch_and_replace(&self) -> Result<()> {
        let instance = self
            .ctx
            .session()
            .get_instance(&self.path)
            .await
            .map_err(|e| self.server_failure(e))?;
        let schema = self.ctx.schema_for(&instance).await;
        self.apply_snapshot(instance, schema);
        Ok(())
    }

    pub async fn refresh_association(
        &self,
        association: &Association,
        threshold: Duration,
    ) -> Result<Arc<Vec<ObjectPath>>> {
        if !self.associations.needs_refresh(association, threshold) {
            if let Some(entry) = self.associations.get(association) {
                return Ok(entry.related);
            }
        }
        let instances = self.query_related(association).await?;
        Ok(self
            .associations
            .get(association)
            .map(|entry| entry.related)
            .unwrap_or_else(|| Arc::new(instances.iter().map(Instance::path).collect())))
    }

    /// Run the association query, store the result and push the returned
    /// snapshots into proxies that already exist
    pub async fn query_related(&self, association: &Association) -> Result<Vec<Instance>> {
        let text = association.build_query(&self.path)?;
        let instances = self
            .ctx
            .session()
            .query(self.path.namespace(), QueryDialect::Wql, &text)
            .await
            .map_err(|e| self.server_failure(e))?;

        self.associations
            .store(association, instances.iter().map(Instance::path).collect());

        if let Some(repository) = self.repository.upgrade() {
            for instance in &instances {
                if let Some(proxy) = repository.get(&instance.path()) {
                    proxy.update_from(instance.clone());
                }
            }
        }
        Ok(instances)
    }

    /// Cached association entry without any remote call
    pub fn cached_related(&self, association: &Association) -> Option<Arc<Vec<ObjectPath>>> {
        self.associations.get(association).map(|entry| entry.related)
    }

    pub fn needs_association_refresh(&self, association: &Association) -> bool {
        self.associations
            .needs_refresh(association, self.ctx.config().association_refresh_threshold())
    }

    pub fn invalidate_properties(&self) {
        self.properties.invalidate();
    }

    pub fn invalidate_association(&self, association: &Association) {
        self.associations.invalidate(association);
    }

    pub fn invalidate_associations(&self) {
        self.associations.invalidate_all();
    }

    /// Replace the cached snapshot with one delivered by an event or query
    pub fn update_from(&self, instance: Instance) {
        if instance.path() != self.path {
            warn!("Ignoring snapshot of {} pushed to {}", instance.path(), self.path);
            return;
        }
        let schema = self
            .properties
            .schema()
            .unwrap_or_else(|| Arc::new(ClassSchema::infer_from(&instance)));
        self.apply_snapshot(instance, schema);
    }

    pub(crate) fn apply_snapshot(&self, instance: Instance, schema: Arc<ClassSchema>) {
        self.properties.replace(instance, schema);
        self.notify_cache_updated();
    }

    fn apply_event(&self, event: &InstanceEvent) {
        match event.kind {
            EventKind::Created | EventKind::Modified => self.update_from(event.target.clone()),
            EventKind::Deleted => self.handle_deleted(),
        }
    }

    fn server_failure(&self, err: virtmgmt_core_interface::SessionError) -> Error {
        let err = self.ctx.classify(err);
        if matches!(err, Error::ServerObjectDeleted { .. }) {
            self.handle_deleted();
        }
        err
    }

    /// Mark deleted, notify watchers once and leave the repository
    pub(crate) fn handle_deleted(&self) {
        if self.deleted.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Instance deleted: {}", self.path);

        let handlers: Vec<DeletedHandler> = locks::read(&self.deleted_handlers)
            .iter()
            .map(|(_, h)| h.clone())
            .collect();
        for handler in handlers {
            handler(&self.path);
        }
        if let Some(repository) = self.repository.upgrade() {
            repository.unregister(&self.path);
        }
    }

    fn notify_cache_updated(&self) {
        let handlers: Vec<CacheUpdatedHandler> = locks::read(&self.cache_handlers)
            .iter()
            .map(|(_, h)| h.clone())
            .collect();
        for handler in handlers {
            handler(self);
        }
    }

    pub fn on_cache_updated(&self, handler: CacheUpdatedHandler) -> u64 {
        let id = self.next_id();
        locks::write(&self.cache_handlers).push((id, handler));
        id
    }

    pub fn remove_cache_updated(&self, id: u64) {
        locks::write(&self.cache_handlers).retain(|(handler_id, _)| *handler_id != id);
    }

    /// Watch for deletion of the remote instance
    pub async fn on_deleted(
        self: &Arc<Self>,
        handler: DeletedHandler,
    ) -> Result<DeletedSubscription> {
        let id = self.next_id();
        locks::write(&self.deleted_handlers).push((id, handler));

        let mut slot = self.deleted_slot.lock().await;
        slot.count += 1;
        if slot.count == 1 {
            let proxy = Arc::downgrade(self);
            let forward: EventHandler = Arc::new(move |event: &InstanceEvent| {
                if let Some(proxy) = proxy.upgrade() {
                    proxy.apply_event(event);
                }
            });
            let key = EventKey::new(self.path.clone(), EventKind::Deleted);
            match self.ctx.events().register(key, forward).await {
                Ok(sub) => slot.registration = Some(EventRegistration::Instance(sub)),
                Err(e) => {
                    slot.count -= 1;
                    locks::write(&self.deleted_handlers).retain(|(h, _)| *h != id);
                    return Err(e);
                }
            }
        }

        Ok(ProxySubscription {
            proxy: Arc::downgrade(self),
            target: Target::Deleted(id),
            released: AtomicBool::new(false),
        })
    }

    /// Keep the property cache current from modification events.
    ///
    /// Registrations share one subscription; the strategy of the first
    /// registration is used until the last one is released.
    pub async fn register_modification_events(
        self: &Arc<Self>,
        strategy: ModificationStrategy,
    ) -> Result<ModificationRegistration> {
        let mut slot = self.modification_slot.lock().await;
        slot.count += 1;
        if slot.count == 1 {
            let proxy = Arc::downgrade(self);
            let forward: EventHandler = Arc::new(move |event: &InstanceEvent| {
                if let Some(proxy) = proxy.upgrade() {
                    proxy.apply_event(event);
                }
            });
            let registration = match strategy {
                ModificationStrategy::PerInstance => self
                    .ctx
                    .events()
                    .register(EventKey::new(self.path.clone(), EventKind::Modified), forward)
                    .await
                    .map(EventRegistration::Instance),
                ModificationStrategy::Bulk => self
                    .ctx
                    .bulk()
                    .register(self.path.clone(), forward)
                    .await
                    .map(EventRegistration::Bulk),
            };
            match registration {
                Ok(registration) => slot.registration = Some(registration),
                Err(e) => {
                    slot.count -= 1;
                    return Err(e);
                }
            }
        }

        Ok(ProxySubscription {
            proxy: Arc::downgrade(self),
            target: Target::Modification,
            released: AtomicBool::new(false),
        })
    }

    async fn release(&self, target: Target) {
        let slot = match target {
            Target::Deleted(id) => {
                locks::write(&self.deleted_handlers).retain(|(h, _)| *h != id);
                &self.deleted_slot
            }
            Target::Modification => &self.modification_slot,
        };
        let mut slot = slot.lock().await;
        if slot.count == 0 {
            return;
        }
        slot.count -= 1;
        if slot.count == 0 {
            if let Some(registration) = slot.registration.take() {
                registration.release().await;
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Target {
    Deleted(u64),
    Modification,
}

/// Handle returned by [`Proxy::on_deleted`] and
/// [`Proxy::register_modification_events`]
pub struct ProxySubscription {
    proxy: Weak<Proxy>,
    target: Target,
    released: AtomicBool,
}

pub type DeletedSubscription = ProxySubscription;
pub type ModificationRegistration = ProxySubscription;

impl ProxySubscription {
    pub async fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(proxy) = self.proxy.upgrade() {
            proxy.release(self.target).await;
        }
    }
}

impl Drop for ProxySubscription {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(proxy) = self.proxy.upgrade() else {
            return;
        };
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let target = self.target;
            handle.spawn(async move { proxy.release(target).await });
        }
    }
}
