//! Finding objects on a server
//!
//! The locator is the entry point callers use to turn identities, queries
//! and method outputs into proxies, views and tasks. Every proxy it hands
//! out comes from the server's repository, so two lookups of the same
//! identity share one cache.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;
use virtmgmt_core_interface::{
    Instance, MethodOutput, ObjectPath, QueryDialect, Value, LOCAL_SERVER,
};

use crate::cache::Association;
use crate::error::{codes, Error, Result};
use crate::job::network_wait::TaskSource;
use crate::job::{CompletedTask, NetworkTaskWait, Task, VmTask};
use crate::keys::{self, ServiceKey};
use crate::proxy::Proxy;
use crate::query;
use crate::server::Server;
use crate::view::View;

#[derive(Clone)]
pub struct ObjectLocator {
    server: Arc<Server>,
}

impl ObjectLocator {
    pub fn new(server: Arc<Server>) -> Self {
        Self { server }
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    /// Paths without a server, or naming the local machine, belong to this
    /// server
    fn normalize(&self, path: &ObjectPath) -> ObjectPath {
        if path.server().is_empty() || path.server() == LOCAL_SERVER {
            path.with_server(self.server.name())
        } else {
            path.clone()
        }
    }

    fn not_found(&self, target: impl ToString) -> Error {
        Error::ObjectNotFound {
            server: self.server.name().to_string(),
            target: target.to_string(),
        }
    }

    /// Proxy for `path`. A newly created proxy is loaded once so a missing
    /// object is reported here rather than on first use.
    pub async fn get_proxy(&self, path: &ObjectPath) -> Result<Arc<Proxy>> {
        let path = self.normalize(path);
        let ctx = self.server.context().clone();
        let (proxy, created) = self
            .server
            .repository()
            .get_or_insert_with(&path, |repository| Proxy::new(path.clone(), ctx, repository));
        if created {
            match proxy.refresh_now().await {
                Ok(()) => {}
                Err(e) if e.is_object_gone() => {
                    self.server.repository().unregister(&path);
                    return Err(self.not_found(&path));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(proxy)
    }

    /// Proxy for an instance returned by a query, refreshed from it
    pub async fn proxy_for_instance(&self, instance: Instance) -> Arc<Proxy> {
        let path = self.normalize(&instance.path());
        let ctx = self.server.context().clone();
        let (proxy, _) = self
            .server
            .repository()
            .get_or_insert_with(&path, |repository| Proxy::new(path.clone(), ctx, repository));
        let schema = self.server.context().schema_for(&instance).await;
        proxy.apply_snapshot(instance, schema);
        proxy
    }

    pub async fn get_view(&self, path: &ObjectPath) -> Result<View> {
        let proxy = self.get_proxy(path).await?;
        self.server.views().create(proxy).await
    }

    pub async fn view_for_instance(&self, instance: Instance) -> Result<View> {
        let proxy = self.proxy_for_instance(instance).await;
        self.server.views().create(proxy).await
    }

    /// Views of `class_name` whose `property` matches any of `values`.
    ///
    /// Long value lists are split over several queries; results are
    /// deduplicated by identity in first-seen order. No values selects every
    /// instance of the class.
    pub async fn query_views(
        &self,
        namespace: &str,
        class_name: &str,
        property: &str,
        values: &[&str],
        allow_wildcards: bool,
    ) -> Result<Vec<View>> {
        let queries = if values.is_empty() {
            vec![query::select_all(class_name)]
        } else {
            let filters: Vec<String> = values
                .iter()
                .map(|value| query::filter(property, value, allow_wildcards))
                .collect();
            query::batched_select(class_name, &filters, self.server.config().max_query_length)
        };

        let ctx = self.server.context();
        let mut seen = HashSet::new();
        let mut views = Vec::new();
        for text in queries {
            debug!("Querying {}: {}", self.server.name(), text);
            let instances = ctx
                .session()
                .query(namespace, QueryDialect::Wql, &text)
                .await
                .map_err(|e| ctx.classify(e))?;
            for instance in instances {
                if seen.insert(instance.path()) {
                    views.push(self.view_for_instance(instance).await?);
                }
            }
        }
        Ok(views)
    }

    /// Views of `class_name` by `ElementName`, wildcards allowed
    pub async fn query_views_by_names(
        &self,
        namespace: &str,
        class_name: &str,
        names: &[&str],
    ) -> Result<Vec<View>> {
        self.query_views(namespace, class_name, "ElementName", names, true)
            .await
    }

    /// Views of the objects related to `proxy`.
    ///
    /// A cached association within its staleness budget is resolved through
    /// the repository without querying; otherwise the association is
    /// re-queried and the returned snapshots are bound directly.
    pub async fn get_related_views(
        &self,
        proxy: &Proxy,
        association: &Association,
    ) -> Result<Vec<View>> {
        let cached = if proxy.needs_association_refresh(association) {
            None
        } else {
            proxy.cached_related(association)
        };

        let mut views = Vec::new();
        match cached {
            Some(related) => {
                for path in related.iter() {
                    match self.get_view(path).await {
                        Ok(view) => views.push(view),
                        Err(e) if e.is_object_gone() => {
                            debug!("Related object {} is gone", path);
                            proxy.invalidate_association(association);
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
            None => {
                let mut seen = HashSet::new();
                for instance in proxy.query_related(association).await? {
                    if seen.insert(instance.path()) {
                        views.push(self.view_for_instance(instance).await?);
                    }
                }
            }
        }
        Ok(views)
    }

    /// The single object across `association`
    pub async fn get_related_view(&self, proxy: &Proxy, association: &Association) -> Result<View> {
        self.get_related_views(proxy, association)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| self.not_found(format!("{} of {}", association.name(), proxy.path())))
    }

    /// Live task for the job at `path`, watched by the server's connection
    /// tester
    pub async fn get_task(&self, path: &ObjectPath) -> Result<Arc<VmTask>> {
        let proxy = self.get_proxy(path).await?;
        VmTask::attach(proxy, Some(self.server.tester().clone())).await
    }

    /// Task for the outcome of a method that may start a job.
    ///
    /// Job started hands back the live job from the `Job` out parameter;
    /// any other return value is already final.
    pub async fn task_from_output(&self, output: &MethodOutput) -> Result<Arc<dyn Task>> {
        match i64::from(output.return_value) {
            codes::JOB_STARTED => {
                let job = job_reference(output)?;
                let task: Arc<dyn Task> = self.get_task(&job).await?;
                Ok(task)
            }
            code => {
                let task: Arc<dyn Task> = Arc::new(CompletedTask::from_code(code));
                Ok(task)
            }
        }
    }

    /// Wait on a job whose host may leave the network while it runs
    pub fn begin_network_task(&self, path: &ObjectPath) -> Arc<NetworkTaskWait> {
        NetworkTaskWait::start(
            self.normalize(path),
            Arc::new(self.clone()),
            self.server.config(),
        )
    }

    pub async fn get_host_computer_system(&self) -> Result<View> {
        self.get_view(&keys::host_computer_system(self.server.name()))
            .await
    }

    pub async fn get_vm_by_id(&self, vm_id: &str) -> Result<View> {
        self.get_view(&keys::vm_computer_system(self.server.name(), vm_id))
            .await
    }

    pub async fn get_service(&self, key: ServiceKey) -> Result<View> {
        self.get_view(&keys::service(self.server.name(), key)).await
    }

    pub async fn virtualization_service(&self) -> Result<View> {
        self.get_service(keys::VIRTUAL_SYSTEM_MANAGEMENT).await
    }
}

#[async_trait]
impl TaskSource for ObjectLocator {
    async fn resolve_task(&self, path: &ObjectPath) -> Result<Arc<VmTask>> {
        self.get_task(path).await
    }
}

fn job_reference(output: &MethodOutput) -> Result<ObjectPath> {
    match output.get("Job") {
        Some(Value::Reference(path)) => Ok(path.clone()),
        Some(Value::Str(text)) => text
            .parse()
            .map_err(|_| Error::invalid_value("Job", text, "a job reference")),
        other => Err(Error::invalid_value("Job", other, "a job reference")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::associations;
    use crate::config::ModelConfig;
    use crate::job::TaskStatus;
    use crate::keys::{classes, namespaces};
    use crate::session::mock::{MockOp, MockSession};
    use crate::view::capabilities::ManagementObject;
    use crate::view::{ViewFactory, ViewKind};
    use virtmgmt_core_interface::Credential;

    const NS: &str = namespaces::VIRTUALIZATION;

    fn vm(id: &str, name: &str) -> Instance {
        Instance::new("HOST01", NS, classes::COMPUTER_SYSTEM)
            .with_key("CreationClassName", classes::COMPUTER_SYSTEM)
            .with_key("Name", id)
            .with_property("ElementName", name)
            .with_property("EnabledState", 2u16)
    }

    fn job(state: u16) -> Instance {
        Instance::new("HOST01", NS, classes::CONCRETE_JOB)
            .with_key("InstanceID", "job-9")
            .with_property("ElementName", "Stop VM")
            .with_property("JobState", state)
            .with_property("JobType", 2u16)
            .with_property("ErrorCode", 0u16)
            .with_property("PercentComplete", 0u16)
    }

    fn locator(session: &MockSession, config: ModelConfig) -> ObjectLocator {
        let server = Arc::new(Server::new(
            Arc::new(session.clone()),
            Credential::Current,
            Arc::new(config),
            ViewFactory::with_defaults(),
        ));
        server.locator()
    }

    #[tokio::test]
    async fn test_get_proxy_shares_identity_and_reports_missing() {
        let session = MockSession::new("HOST01").with_instance(vm("A", "web01"));
        let locator = locator(&session, ModelConfig::default());

        let local = keys::vm_computer_system(LOCAL_SERVER, "A");
        let first = locator.get_proxy(&local).await.unwrap();
        let second = locator
            .get_proxy(&keys::vm_computer_system("HOST01", "a"))
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(session.calls(MockOp::GetInstance), 1);

        let err = locator.get_vm_by_id("missing").await.unwrap_err();
        assert!(matches!(err, Error::ObjectNotFound { .. }));
        let missing = keys::vm_computer_system("HOST01", "missing");
        assert!(!locator.server().repository().contains(&missing));
    }

    #[tokio::test]
    async fn test_query_views_batches_and_dedups() {
        let session = MockSession::new("HOST01")
            .with_instance(vm("A", "web01"))
            .with_instance(vm("B", "web02"))
            .with_instance(vm("C", "db01"));
        let config = ModelConfig {
            max_query_length: 80,
            ..ModelConfig::default()
        };
        let locator = locator(&session, config);

        let views = locator
            .query_views_by_names(NS, classes::COMPUTER_SYSTEM, &["web*", "web01", "db01"])
            .await
            .unwrap();
        assert!(session.queries().len() > 1);
        let names: Vec<_> = views
            .iter()
            .map(|v| v.path().key("Name").and_then(|k| k.as_str()).unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["A", "B", "C"]);
        assert!(views.iter().all(|v| v.kind() == ViewKind::VirtualMachine));
    }

    #[tokio::test]
    async fn test_related_views_and_missing_related() {
        let session = MockSession::new("HOST01")
            .with_instance(vm("A", "web01"))
            .with_instance(job(4));
        session.link_with_role(
            &vm("A", "").path(),
            "Msvm_AffectedJobElement",
            &job(4).path(),
            "AffectingElement",
        );
        let locator = locator(&session, ModelConfig::default());

        let proxy = locator.get_vm_by_id("A").await.unwrap().proxy().clone();
        let jobs = locator
            .get_related_views(&proxy, &associations::element_jobs())
            .await
            .unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].kind(), ViewKind::VirtualizationTask);

        let err = locator
            .get_related_view(&proxy, &associations::affected_job_element())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ObjectNotFound { .. }));
    }

    #[tokio::test]
    async fn test_related_views_use_association_cache() {
        let summary = Instance::new("HOST01", NS, classes::SUMMARY_INFORMATION)
            .with_key("InstanceID", "Microsoft:A")
            .with_property("ElementName", "web01");
        let session = MockSession::new("HOST01")
            .with_instance(vm("A", "web01"))
            .with_instance(job(4))
            .with_instance(summary.clone());
        let source = vm("A", "").path();
        session.link_with_role(
            &source,
            "Msvm_AffectedJobElement",
            &job(4).path(),
            "AffectingElement",
        );
        session.link(&source, "Msvm_ComputerSystemSummaryInformation", &summary.path());
        let locator = locator(&session, ModelConfig::default());
        let proxy = locator.get_vm_by_id("A").await.unwrap().proxy().clone();

        let first = locator
            .get_related_views(&proxy, &associations::element_jobs())
            .await
            .unwrap();
        let second = locator
            .get_related_views(&proxy, &associations::element_jobs())
            .await
            .unwrap();
        assert_eq!(session.calls(MockOp::Query), 1);
        assert!(Arc::ptr_eq(first[0].proxy(), second[0].proxy()));

        for _ in 0..2 {
            let views = locator
                .get_related_views(&proxy, &associations::system_to_summary())
                .await
                .unwrap();
            assert_eq!(views[0].kind(), ViewKind::SummaryInformation);
        }
        assert_eq!(session.calls(MockOp::Query), 3);
    }

    #[tokio::test]
    async fn test_task_from_output() {
        let session = MockSession::new("HOST01").with_instance(job(7));
        let locator = locator(&session, ModelConfig::default());

        let started = MethodOutput::new(4096).with_out("Job", Value::Reference(job(7).path()));
        let task = locator.task_from_output(&started).await.unwrap();
        assert_eq!(task.status(), TaskStatus::CompletedSuccessfully);
        assert_eq!(task.name(), "Stop VM");

        let done = locator.task_from_output(&MethodOutput::new(0)).await.unwrap();
        assert_eq!(done.status(), TaskStatus::CompletedSuccessfully);

        let denied = locator.task_from_output(&MethodOutput::new(32769)).await.unwrap();
        assert_eq!(denied.error_code(), codes::ACCESS_DENIED);

        let broken = MethodOutput::new(4096);
        assert!(matches!(
            locator.task_from_output(&broken).await,
            Err(Error::InvalidValue { .. })
        ));
    }

    #[tokio::test]
    async fn test_well_known_objects() {
        let service = Instance::new("HOST01", NS, keys::VIRTUAL_SYSTEM_MANAGEMENT.class_name)
            .with_key("CreationClassName", keys::VIRTUAL_SYSTEM_MANAGEMENT.class_name)
            .with_key("Name", "vmms")
            .with_key("SystemCreationClassName", classes::COMPUTER_SYSTEM)
            .with_key("SystemName", "HOST01");
        let session = MockSession::new("HOST01")
            .with_instance(vm("HOST01", "HOST01"))
            .with_instance(service);
        let locator = locator(&session, ModelConfig::default());

        let host = locator.get_host_computer_system().await.unwrap();
        assert_eq!(host.kind(), ViewKind::Host);
        let vsms = locator.virtualization_service().await.unwrap();
        assert_eq!(vsms.kind(), ViewKind::ManagementService);
    }
}
