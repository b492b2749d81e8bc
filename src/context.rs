//! Per-server shared state
//!
//! Everything a proxy needs besides its own caches: the session, tunables,
//! the two event layers, a class schema cache and the error code mapper.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::warn;
use virtmgmt_core_interface::{ClassSchema, Instance, ObjectPath, Session, SessionError};

use crate::config::ModelConfig;
use crate::error::{DefaultErrorCodeMapper, Error, ErrorCodeMapper, Result};
use crate::events::{BulkMonitor, InstanceEventManager};
use crate::locks;

pub struct ServerContext {
    session: Arc<dyn Session>,
    config: Arc<ModelConfig>,
    events: Arc<InstanceEventManager>,
    bulk: Arc<BulkMonitor>,
    schemas: RwLock<HashMap<ObjectPath, Arc<ClassSchema>>>,
    mapper: Arc<dyn ErrorCodeMapper>,
}

impl ServerContext {
    pub fn new(session: Arc<dyn Session>, config: Arc<ModelConfig>) -> Arc<Self> {
        Self::with_mapper(session, config, Arc::new(DefaultErrorCodeMapper))
    }

    pub fn with_mapper(
        session: Arc<dyn Session>,
        config: Arc<ModelConfig>,
        mapper: Arc<dyn ErrorCodeMapper>,
    ) -> Arc<Self> {
        let events = InstanceEventManager::new(session.clone(), config.event_within());
        let bulk = BulkMonitor::new(
            session.clone(),
            config.event_within(),
            config.bulk_cleanup_interval(),
        );
        Arc::new(Self {
            session,
            config,
            events,
            bulk,
            schemas: RwLock::new(HashMap::new()),
            mapper,
        })
    }

    pub fn server_name(&self) -> &str {
        self.session.server_name()
    }

    pub fn session(&self) -> &Arc<dyn Session> {
        &self.session
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn events(&self) -> &Arc<InstanceEventManager> {
        &self.events
    }

    pub fn bulk(&self) -> &Arc<BulkMonitor> {
        &self.bulk
    }

    pub fn mapper(&self) -> &dyn ErrorCodeMapper {
        self.mapper.as_ref()
    }

    /// Classify a failure of a direct call
    pub fn classify(&self, err: SessionError) -> Error {
        Error::from_session(self.server_name(), err, false)
    }

    /// Class descriptor, fetched once per class
    pub async fn class_schema(
        &self,
        namespace: &str,
        class_name: &str,
    ) -> Result<Arc<ClassSchema>> {
        let key = ObjectPath::class(self.server_name(), namespace, class_name);
        if let Some(schema) = locks::read(&self.schemas).get(&key) {
            return Ok(schema.clone());
        }

        let schema = self
            .session
            .get_class(namespace, class_name)
            .await
            .map_err(|e| self.classify(e))?;
        let schema = Arc::new(schema);
        locks::write(&self.schemas)
            .entry(key)
            .or_insert_with(|| schema.clone());
        Ok(schema)
    }

    /// Schema to validate `instance` against. Falls back to one inferred
    /// from the snapshot when the class cannot be fetched.
    pub async fn schema_for(&self, instance: &Instance) -> Arc<ClassSchema> {
        match self
            .class_schema(&instance.namespace, &instance.class_name)
            .await
        {
            Ok(schema) => schema,
            Err(e) => {
                warn!(
                    "Using inferred schema for {}: {}",
                    instance.class_name,
                    e.summary()
                );
                Arc::new(ClassSchema::infer_from(instance))
            }
        }
    }

    /// Drop every event subscription held for this server
    pub async fn shutdown(&self) {
        self.events.shutdown().await;
        self.bulk.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::mock::{MockOp, MockSession};
    use virtmgmt_core_interface::ValueKind;

    const NS: &str = "root\\virtualization\\v2";

    #[tokio::test]
    async fn test_schema_fetched_once_per_class() {
        let session = MockSession::new("HOST01").with_schema(
            ClassSchema::new("Msvm_ComputerSystem").with_key("Name", ValueKind::String),
        );
        let ctx = ServerContext::new(Arc::new(session.clone()), Arc::new(ModelConfig::default()));

        let a = ctx.class_schema(NS, "Msvm_ComputerSystem").await.unwrap();
        let b = ctx.class_schema(NS, "MSVM_COMPUTERSYSTEM").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(session.calls(MockOp::GetClass), 1);
    }

    #[tokio::test]
    async fn test_schema_for_falls_back_to_inference() {
        let session = MockSession::new("HOST01");
        let ctx = ServerContext::new(Arc::new(session), Arc::new(ModelConfig::default()));
        let instance = Instance::new("HOST01", NS, "Msvm_Unpublished").with_property("Size", 10u64);

        let schema = ctx.schema_for(&instance).await;
        assert_eq!(schema.property("Size").unwrap().kind, ValueKind::Integer);
    }
}
