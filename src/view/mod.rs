//! Typed views over proxies
//!
//! A [`View`] pairs a proxy with the [`ViewKind`] the [`ViewFactory`]
//! resolved for it. Behaviour specific to a family of kinds lives in the
//! capability traits of [`capabilities`]; a view hands out the ones its kind
//! supports.

pub mod capabilities;
pub mod device;
pub mod factory;

use std::fmt;
use std::sync::Arc;
use virtmgmt_core_interface::ObjectPath;

use crate::proxy::Proxy;

pub use capabilities::{DeviceSettingView, EnabledState, ManagementObject, PowerState, TaskView};
pub use device::{DeviceFamily, DeviceSettingType, ResourcePoolKind};
pub use factory::{Resolver, ViewFactory};

/// Concrete local kind of a remote object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewKind {
    Host,
    VirtualMachine,
    VirtualizationTask,
    NetworkTask,
    DeviceSetting(DeviceSettingType),
    EthernetConnectionRequest,
    SwitchPortSetting,
    ResourcePool(ResourcePoolKind),
    ClusterVmResource,
    ClusterVmConfigurationResource,
    ClusterWmiProviderResource,
    ClusterReplicaBrokerResource,
    ClusterCapResource,
    ManagementService,
    ImageManagementService,
    SwitchManagementService,
    Service,
    VirtualSwitch,
    SystemSettings,
    SummaryInformation,
    MsvmError,
}

impl ViewKind {
    pub fn is_task(self) -> bool {
        matches!(self, ViewKind::VirtualizationTask | ViewKind::NetworkTask)
    }

    pub fn is_computer_system(self) -> bool {
        matches!(self, ViewKind::Host | ViewKind::VirtualMachine)
    }

    pub fn is_device_setting(self) -> bool {
        matches!(
            self,
            ViewKind::DeviceSetting(_)
                | ViewKind::EthernetConnectionRequest
                | ViewKind::SwitchPortSetting
        )
    }
}

impl fmt::Display for ViewKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ViewKind::DeviceSetting(device) => write!(f, "DeviceSetting({})", device),
            ViewKind::ResourcePool(pool) => write!(f, "ResourcePool({:?})", pool),
            other => fmt::Debug::fmt(other, f),
        }
    }
}

/// A proxy bound to its resolved kind
#[derive(Clone)]
pub struct View {
    kind: ViewKind,
    proxy: Arc<Proxy>,
}

impl fmt::Debug for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("View")
            .field("kind", &self.kind)
            .field("path", self.proxy.path())
            .finish()
    }
}

impl View {
    pub fn new(kind: ViewKind, proxy: Arc<Proxy>) -> Self {
        Self { kind, proxy }
    }

    pub fn kind(&self) -> ViewKind {
        self.kind
    }

    pub fn path(&self) -> &ObjectPath {
        self.proxy.path()
    }

    pub fn as_power_state(&self) -> Option<&dyn PowerState> {
        self.kind.is_computer_system().then_some(self as &dyn PowerState)
    }

    pub fn as_device_setting(&self) -> Option<&dyn DeviceSettingView> {
        self.kind.is_device_setting().then_some(self as &dyn DeviceSettingView)
    }

    pub fn as_task(&self) -> Option<&dyn TaskView> {
        self.kind.is_task().then_some(self as &dyn TaskView)
    }
}

impl PartialEq for View {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.proxy, &other.proxy)
    }
}

impl Eq for View {}
