//! Class name to view kind registry
//!
//! Most classes map to one fixed [`ViewKind`]. A few are polymorphic and
//! need a [`Resolver`] that inspects the cached properties to pick the kind.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use virtmgmt_core_interface::{eq_fold, ObjectPath, Value};

use super::device::{DeviceSettingType, ResourcePoolKind};
use super::{View, ViewKind};
use crate::error::{Error, Result};
use crate::proxy::Proxy;

/// Picks the kind of a polymorphic class from a loaded proxy
pub type Resolver = Arc<dyn Fn(&Proxy) -> Result<ViewKind> + Send + Sync>;

/// Network jobs use this range of `JobType`
const NETWORK_JOB_TYPES: std::ops::RangeInclusive<u16> = 130..=139;

#[derive(Clone)]
enum Mapping {
    Fixed(ViewKind),
    Dynamic(Resolver),
}

#[derive(Clone, Default)]
pub struct ViewFactory {
    classes: HashMap<String, Mapping>,
}

impl ViewFactory {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let mut factory = Self::new();

        for class in [
            "Msvm_ResourceAllocationSettingData",
            "Msvm_StorageAllocationSettingData",
            "Msvm_FcPortAllocationSettingData",
        ] {
            factory.register_resolver(class, Arc::new(resolve_device_setting));
        }
        factory.register_resolver(
            "Msvm_EthernetPortAllocationSettingData",
            Arc::new(resolve_ethernet_port_setting),
        );
        factory.register_resolver("Msvm_ResourcePool", Arc::new(resolve_resource_pool));
        factory.register_resolver("Msvm_ComputerSystem", Arc::new(resolve_computer_system));
        factory.register_resolver("Msvm_ConcreteJob", Arc::new(resolve_job));
        factory.register_resolver("MSCluster_Resource", Arc::new(resolve_cluster_resource));

        let fixed = [
            ("Msvm_VirtualSystemManagementService", ViewKind::ManagementService),
            ("Msvm_ImageManagementService", ViewKind::ImageManagementService),
            (
                "Msvm_VirtualEthernetSwitchManagementService",
                ViewKind::SwitchManagementService,
            ),
            ("Msvm_CollectionManagementService", ViewKind::Service),
            ("Msvm_VirtualSystemMigrationService", ViewKind::Service),
            ("Msvm_ReplicationService", ViewKind::Service),
            ("Msvm_VirtualEthernetSwitch", ViewKind::VirtualSwitch),
            ("Msvm_VirtualSystemSettingData", ViewKind::SystemSettings),
            ("Msvm_SummaryInformation", ViewKind::SummaryInformation),
            ("Msvm_Error", ViewKind::MsvmError),
            ("Msvm_MigrationJob", ViewKind::VirtualizationTask),
            ("Msvm_StorageJob", ViewKind::VirtualizationTask),
        ];
        for (class, kind) in fixed {
            factory.register_class(class, kind);
        }
        factory
    }

    /// Map `class_name` to one kind. Replaces any earlier registration.
    pub fn register_class(&mut self, class_name: &str, kind: ViewKind) -> &mut Self {
        self.classes
            .insert(class_name.to_ascii_lowercase(), Mapping::Fixed(kind));
        self
    }

    pub fn register_resolver(&mut self, class_name: &str, resolver: Resolver) -> &mut Self {
        self.classes
            .insert(class_name.to_ascii_lowercase(), Mapping::Dynamic(resolver));
        self
    }

    pub fn is_mapped(&self, class_name: &str) -> bool {
        self.classes.contains_key(&class_name.to_ascii_lowercase())
    }

    /// True when resolving `class_name` reads properties
    pub fn needs_properties(&self, class_name: &str) -> bool {
        matches!(
            self.classes.get(&class_name.to_ascii_lowercase()),
            Some(Mapping::Dynamic(_))
        )
    }

    /// Kind for `proxy`. Polymorphic classes need loaded properties.
    pub fn resolve(&self, proxy: &Proxy) -> Result<ViewKind> {
        let class_name = proxy.class_name();
        match self.classes.get(&class_name.to_ascii_lowercase()) {
            Some(Mapping::Fixed(kind)) => Ok(*kind),
            Some(Mapping::Dynamic(resolver)) => {
                if !proxy.properties().is_fetched() {
                    return Err(unmapped(class_name, "instance properties are not loaded"));
                }
                resolver(proxy)
            }
            None => {
                warn!("No view registered for class {}", class_name);
                Err(unmapped(class_name, "no view registered for this class"))
            }
        }
    }

    /// Resolve and bind, loading the instance first when the class is
    /// polymorphic
    pub async fn create(&self, proxy: Arc<Proxy>) -> Result<View> {
        if self.needs_properties(proxy.class_name()) && !proxy.properties().is_fetched() {
            proxy.refresh_now().await?;
        }
        let kind = self.resolve(&proxy)?;
        debug!("Resolved {} as {}", proxy.path(), kind);
        Ok(View::new(kind, proxy))
    }
}

fn unmapped(class_name: &str, detail: &str) -> Error {
    Error::UnmappedClass {
        class_name: class_name.to_string(),
        detail: detail.to_string(),
    }
}

/// Cached value, with undeclared and null properties read as absent
fn cached(proxy: &Proxy, name: &str) -> Result<Option<Value>> {
    match proxy.cached_property(name) {
        Ok(value) => Ok(value.filter(|v| !v.is_null())),
        Err(Error::SchemaMismatch { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}

fn cached_string(proxy: &Proxy, name: &str) -> Result<Option<String>> {
    Ok(cached(proxy, name)?.and_then(|v| v.as_str().map(str::to_string)))
}

fn cached_u16(proxy: &Proxy, name: &str) -> Result<Option<u16>> {
    match cached(proxy, name)? {
        None => Ok(None),
        Some(value) => value
            .as_u16()
            .map(Some)
            .ok_or_else(|| Error::invalid_value(name, value, "uint16")),
    }
}

fn resolve_device_setting(proxy: &Proxy) -> Result<ViewKind> {
    let resource_type = cached_u16(proxy, "ResourceType")?.unwrap_or(0);
    let sub_type = cached_string(proxy, "ResourceSubType")?;
    let other = cached_string(proxy, "OtherResourceType")?;
    Ok(ViewKind::DeviceSetting(DeviceSettingType::from_resource(
        resource_type,
        sub_type.as_deref(),
        other.as_deref(),
    )))
}

fn resolve_ethernet_port_setting(proxy: &Proxy) -> Result<ViewKind> {
    let first = cached(proxy, "HostResource")?.and_then(|value| match value {
        Value::Array(mut items) if !items.is_empty() => Some(items.swap_remove(0)),
        _ => None,
    });
    let class_name = match first {
        None => return Ok(ViewKind::EthernetConnectionRequest),
        Some(Value::Reference(path)) => path.class_name().to_string(),
        Some(Value::Str(text)) if text.is_empty() => {
            return Ok(ViewKind::EthernetConnectionRequest)
        }
        Some(Value::Str(text)) => text
            .parse::<ObjectPath>()
            .map_err(|_| Error::invalid_value("HostResource", &text, "an object path"))?
            .class_name()
            .to_string(),
        Some(other) => return Err(Error::invalid_value("HostResource", other, "an object path")),
    };
    if eq_fold(&class_name, "Msvm_VirtualEthernetSwitch") {
        Ok(ViewKind::EthernetConnectionRequest)
    } else {
        Ok(ViewKind::SwitchPortSetting)
    }
}

fn resolve_resource_pool(proxy: &Proxy) -> Result<ViewKind> {
    let resource_type = cached_u16(proxy, "ResourceType")?.unwrap_or(0);
    let sub_type = cached_string(proxy, "ResourceSubType")?;
    Ok(ViewKind::ResourcePool(ResourcePoolKind::from_resource(
        resource_type,
        sub_type.as_deref(),
    )))
}

fn resolve_computer_system(proxy: &Proxy) -> Result<ViewKind> {
    let server = proxy.context().server_name();
    let is_host = proxy
        .path()
        .key("Name")
        .and_then(|name| name.as_str())
        .is_some_and(|name| eq_fold(name, server));
    Ok(if is_host {
        ViewKind::Host
    } else {
        ViewKind::VirtualMachine
    })
}

fn resolve_job(proxy: &Proxy) -> Result<ViewKind> {
    let job_type = cached_u16(proxy, "JobType")?.unwrap_or(0);
    Ok(if NETWORK_JOB_TYPES.contains(&job_type) {
        ViewKind::NetworkTask
    } else {
        ViewKind::VirtualizationTask
    })
}

fn resolve_cluster_resource(proxy: &Proxy) -> Result<ViewKind> {
    const TYPES: [(&str, ViewKind); 5] = [
        ("Virtual Machine", ViewKind::ClusterVmResource),
        ("Virtual Machine Configuration", ViewKind::ClusterVmConfigurationResource),
        ("Virtual Machine Cluster WMI", ViewKind::ClusterWmiProviderResource),
        ("Virtual Machine Replication Broker", ViewKind::ClusterReplicaBrokerResource),
        ("Network Name", ViewKind::ClusterCapResource),
    ];
    let resource_type = cached_string(proxy, "Type")?.unwrap_or_default();
    TYPES
        .iter()
        .find(|(name, _)| eq_fold(name, &resource_type))
        .map(|(_, kind)| *kind)
        .ok_or_else(|| {
            unmapped(
                proxy.class_name(),
                &format!("cluster resource type '{}' has no view", resource_type),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::context::ServerContext;
    use crate::session::mock::{MockOp, MockSession};
    use std::sync::Weak;
    use virtmgmt_core_interface::Instance;

    const NS: &str = "root\\virtualization\\v2";

    fn proxy_for(session: &MockSession, instance: &Instance) -> Arc<Proxy> {
        let ctx = ServerContext::new(Arc::new(session.clone()), Arc::new(ModelConfig::default()));
        Proxy::new(instance.path(), ctx, Weak::new())
    }

    async fn resolve(instance: Instance) -> Result<ViewKind> {
        let session = MockSession::new("HOST01").with_instance(instance.clone());
        let proxy = proxy_for(&session, &instance);
        ViewFactory::with_defaults().create(proxy).await.map(|view| view.kind())
    }

    fn rasd(resource_type: u16, sub_type: &str) -> Instance {
        Instance::new("HOST01", NS, "Msvm_ResourceAllocationSettingData")
            .with_key("InstanceID", "Microsoft:vm1\\dev")
            .with_property("ResourceType", resource_type)
            .with_property("ResourceSubType", sub_type)
    }

    #[tokio::test]
    async fn test_computer_system_named_like_server_is_host() {
        let host = Instance::new("HOST01", NS, "Msvm_ComputerSystem")
            .with_key("CreationClassName", "Msvm_ComputerSystem")
            .with_key("Name", "host01");
        let vm = Instance::new("HOST01", NS, "Msvm_ComputerSystem")
            .with_key("CreationClassName", "Msvm_ComputerSystem")
            .with_key("Name", "6A1F0E2C-0000-4A6B-9C11-0123456789AB");
        assert_eq!(resolve(host).await.unwrap(), ViewKind::Host);
        assert_eq!(resolve(vm).await.unwrap(), ViewKind::VirtualMachine);
    }

    #[tokio::test]
    async fn test_job_type_range_selects_network_task() {
        let job = |job_type: u16| {
            Instance::new("HOST01", NS, "Msvm_ConcreteJob")
                .with_key("InstanceID", format!("job-{}", job_type))
                .with_property("JobType", job_type)
        };
        assert_eq!(resolve(job(130)).await.unwrap(), ViewKind::NetworkTask);
        assert_eq!(resolve(job(139)).await.unwrap(), ViewKind::NetworkTask);
        assert_eq!(resolve(job(140)).await.unwrap(), ViewKind::VirtualizationTask);
        assert_eq!(resolve(job(1)).await.unwrap(), ViewKind::VirtualizationTask);
    }

    #[tokio::test]
    async fn test_allocation_settings_by_subtype() {
        let kind = resolve(rasd(17, "Microsoft:Hyper-V:Synthetic Disk Drive")).await.unwrap();
        assert_eq!(kind, ViewKind::DeviceSetting(DeviceSettingType::HardDiskSyntheticDrive));

        let battery =
            rasd(1, "").with_property("OtherResourceType", "Microsoft:Hyper-V:Virtual Battery");
        assert_eq!(
            resolve(battery).await.unwrap(),
            ViewKind::DeviceSetting(DeviceSettingType::Battery)
        );
    }

    #[tokio::test]
    async fn test_ethernet_port_setting_by_host_resource() {
        let port = |host_resource: Vec<Value>| {
            Instance::new("HOST01", NS, "Msvm_EthernetPortAllocationSettingData")
                .with_key("InstanceID", "Microsoft:vm1\\port")
                .with_property("HostResource", host_resource)
        };
        let switch = "\\\\HOST01\\root\\virtualization\\v2:Msvm_VirtualEthernetSwitch.CreationClassName=\"Msvm_VirtualEthernetSwitch\",Name=\"sw\"";
        let other = "\\\\HOST01\\root\\virtualization\\v2:Msvm_ExternalEthernetPort.Name=\"nic\"";

        assert_eq!(resolve(port(vec![])).await.unwrap(), ViewKind::EthernetConnectionRequest);
        assert_eq!(
            resolve(port(vec![Value::from(switch)])).await.unwrap(),
            ViewKind::EthernetConnectionRequest
        );
        assert_eq!(
            resolve(port(vec![Value::from(other)])).await.unwrap(),
            ViewKind::SwitchPortSetting
        );
    }

    #[tokio::test]
    async fn test_cluster_resource_types() {
        let resource = |kind: &str| {
            Instance::new("HOST01", "root\\MSCluster", "MSCluster_Resource")
                .with_key("Name", format!("res {}", kind))
                .with_property("Type", kind)
        };
        assert_eq!(
            resolve(resource("Virtual Machine")).await.unwrap(),
            ViewKind::ClusterVmResource
        );
        assert_eq!(resolve(resource("network name")).await.unwrap(), ViewKind::ClusterCapResource);
        assert!(matches!(
            resolve(resource("Physical Disk")).await,
            Err(Error::UnmappedClass { .. })
        ));
    }

    #[tokio::test]
    async fn test_fixed_classes_do_not_fetch() {
        let service = Instance::new("HOST01", NS, "Msvm_VirtualSystemManagementService")
            .with_key("Name", "vmms");
        let session = MockSession::new("HOST01").with_instance(service.clone());
        let proxy = proxy_for(&session, &service);

        let view = ViewFactory::with_defaults().create(proxy).await.unwrap();
        assert_eq!(view.kind(), ViewKind::ManagementService);
        assert_eq!(session.calls(MockOp::GetInstance), 0);
    }

    #[tokio::test]
    async fn test_unmapped_and_custom_registrations() {
        let thing = Instance::new("HOST01", NS, "Contoso_Widget").with_key("Id", 1i64);
        assert!(matches!(resolve(thing.clone()).await, Err(Error::UnmappedClass { .. })));

        let mut factory = ViewFactory::with_defaults();
        factory.register_class("CONTOSO_WIDGET", ViewKind::Service);
        assert!(factory.is_mapped("contoso_widget"));
        let session = MockSession::new("HOST01").with_instance(thing.clone());
        let view = factory.create(proxy_for(&session, &thing)).await.unwrap();
        assert_eq!(view.kind(), ViewKind::Service);
    }
}
