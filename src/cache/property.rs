//! Scalar property cache

use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use virtmgmt_core_interface::{eq_fold, ClassSchema, Instance, ObjectPath, Value};

use crate::error::{Error, MemberKind, Result};
use crate::locks;

/// Names that resolve from the identity, never from the remote snapshot
pub const PSEUDO_PROPERTIES: [&str; 4] = ["__CLASS", "__SERVER", "__NAMESPACE", "__PATH"];

/// Values plus the schema they were validated against
#[derive(Debug, Clone)]
pub struct PropertySnapshot {
    pub instance: Instance,
    pub schema: Arc<ClassSchema>,
}

/// Outcome of a cache lookup that did not hit a schema mismatch
#[derive(Debug, Clone, PartialEq)]
pub enum CacheState {
    /// Nothing has been fetched for this identity yet
    NotFetched,
    Cached(Value),
}

#[derive(Debug, Default)]
struct Slot {
    snapshot: Option<Arc<PropertySnapshot>>,
    last_refreshed: Option<Instant>,
}

#[derive(Debug)]
pub struct PropertyCache {
    path: ObjectPath,
    slot: RwLock<Slot>,
}

impl PropertyCache {
    pub fn new(path: ObjectPath) -> Self {
        Self {
            path,
            slot: RwLock::new(Slot::default()),
        }
    }

    pub fn path(&self) -> &ObjectPath {
        &self.path
    }

    pub fn snapshot(&self) -> Option<Arc<PropertySnapshot>> {
        locks::read(&self.slot).snapshot.clone()
    }

    pub fn schema(&self) -> Option<Arc<ClassSchema>> {
        self.snapshot().map(|s| s.schema.clone())
    }

    pub fn is_fetched(&self) -> bool {
        locks::read(&self.slot).snapshot.is_some()
    }

    pub fn last_refreshed(&self) -> Option<Instant> {
        locks::read(&self.slot).last_refreshed
    }

    /// True when never refreshed or refreshed more than `threshold` ago
    pub fn is_stale(&self, threshold: Duration) -> bool {
        match locks::read(&self.slot).last_refreshed {
            Some(at) => at.elapsed() > threshold,
            None => true,
        }
    }

    /// Look a property up.
    ///
    /// Properties the schema declares but the snapshot lacks read as null.
    pub fn lookup(&self, name: &str) -> Result<CacheState> {
        if let Some(value) = self.pseudo(name) {
            return Ok(CacheState::Cached(value));
        }
        let Some(snapshot) = self.snapshot() else {
            return Ok(CacheState::NotFetched);
        };
        if let Some(value) = snapshot.instance.get(name) {
            return Ok(CacheState::Cached(value.clone()));
        }
        if snapshot.schema.has_property(name) {
            Ok(CacheState::Cached(Value::Null))
        } else {
            Err(Error::schema_mismatch(
                MemberKind::Property,
                self.path.class_name(),
                name,
            ))
        }
    }

    fn pseudo(&self, name: &str) -> Option<Value> {
        let value = if eq_fold(name, "__CLASS") {
            self.path.class_name().to_string()
        } else if eq_fold(name, "__SERVER") {
            self.path.server().to_string()
        } else if eq_fold(name, "__NAMESPACE") {
            self.path.namespace().to_string()
        } else if eq_fold(name, "__PATH") {
            self.path.to_string()
        } else {
            return None;
        };
        Some(Value::Str(value))
    }

    /// Swap in a freshly fetched snapshot
    pub fn replace(&self, instance: Instance, schema: Arc<ClassSchema>) {
        let snapshot = Arc::new(PropertySnapshot { instance, schema });
        let mut slot = locks::write(&self.slot);
        slot.snapshot = Some(snapshot);
        slot.last_refreshed = Some(Instant::now());
    }

    /// Apply locally written values without restarting the staleness clock
    pub fn merge(&self, updates: &[(String, Value)]) {
        let mut slot = locks::write(&self.slot);
        let Some(current) = slot.snapshot.as_ref() else {
            return;
        };
        let mut instance = current.instance.clone();
        for (name, value) in updates {
            instance.set(name.clone(), value.clone());
        }
        slot.snapshot = Some(Arc::new(PropertySnapshot {
            instance,
            schema: current.schema.clone(),
        }));
    }

    /// Force the next refresh to fetch; cached values stay readable
    pub fn invalidate(&self) {
        locks::write(&self.slot).last_refreshed = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use virtmgmt_core_interface::ValueKind;

    fn path() -> ObjectPath {
        ObjectPath::instance(
            "HOST01",
            "root\\virtualization\\v2",
            "Msvm_ComputerSystem",
            [("Name", "vm1")],
        )
    }

    fn schema() -> Arc<ClassSchema> {
        Arc::new(
            ClassSchema::new("Msvm_ComputerSystem")
                .with_key("Name", ValueKind::String)
                .with_property("ElementName", ValueKind::String)
                .with_property("EnabledState", ValueKind::Integer),
        )
    }

    fn instance(name: &str) -> Instance {
        Instance::new("HOST01", "root\\virtualization\\v2", "Msvm_ComputerSystem")
            .with_key("Name", "vm1")
            .with_property("ElementName", name)
    }

    #[test]
    fn test_not_fetched_until_replaced() {
        let cache = PropertyCache::new(path());
        assert_eq!(cache.lookup("ElementName").unwrap(), CacheState::NotFetched);
        assert!(cache.is_stale(Duration::from_secs(3600)));

        cache.replace(instance("web"), schema());
        assert_eq!(
            cache.lookup("elementname").unwrap(),
            CacheState::Cached(Value::from("web"))
        );
    }

    #[test]
    fn test_declared_but_missing_reads_null() {
        let cache = PropertyCache::new(path());
        cache.replace(instance("web"), schema());
        assert_eq!(
            cache.lookup("EnabledState").unwrap(),
            CacheState::Cached(Value::Null)
        );
    }

    #[test]
    fn test_unknown_property_is_schema_mismatch() {
        let cache = PropertyCache::new(path());
        cache.replace(instance("web"), schema());
        assert!(matches!(
            cache.lookup("Bogus"),
            Err(Error::SchemaMismatch { kind: MemberKind::Property, .. })
        ));
    }

    #[test]
    fn test_pseudo_properties_always_resolve() {
        let cache = PropertyCache::new(path());
        assert_eq!(
            cache.lookup("__CLASS").unwrap(),
            CacheState::Cached(Value::from("Msvm_ComputerSystem"))
        );
        assert_eq!(
            cache.lookup("__server").unwrap(),
            CacheState::Cached(Value::from("HOST01"))
        );
        assert_eq!(
            cache.lookup("__PATH").unwrap(),
            CacheState::Cached(Value::from(path().to_string()))
        );
    }

    #[test]
    fn test_merge_keeps_other_values() {
        let cache = PropertyCache::new(path());
        cache.replace(instance("web"), schema());
        let before = cache.snapshot().unwrap();

        cache.merge(&[("EnabledState".to_string(), Value::UInt(2))]);
        assert_eq!(
            cache.lookup("EnabledState").unwrap(),
            CacheState::Cached(Value::UInt(2))
        );
        assert_eq!(
            cache.lookup("ElementName").unwrap(),
            CacheState::Cached(Value::from("web"))
        );
        // readers holding the old snapshot are unaffected
        assert!(before.instance.get("EnabledState").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_staleness_and_invalidate() {
        let cache = PropertyCache::new(path());
        cache.replace(instance("web"), schema());
        assert!(!cache.is_stale(Duration::from_secs(1)));

        tokio::time::advance(Duration::from_millis(1500)).await;
        assert!(cache.is_stale(Duration::from_secs(1)));
        assert!(!cache.is_stale(Duration::from_secs(2)));

        cache.invalidate();
        assert!(cache.is_stale(Duration::from_secs(3600)));
        assert!(cache.is_fetched());
    }
}
