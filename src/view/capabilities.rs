//! Capability traits implemented by [`View`]

use async_trait::async_trait;
use std::sync::Arc;
use virtmgmt_core_interface::{eq_fold, ObjectPath, Value};

use super::{DeviceSettingType, View, ViewKind};
use crate::error::{Error, Result};
use crate::job::JobState;
use crate::proxy::Proxy;

/// Shared by every view
#[async_trait]
pub trait ManagementObject: Send + Sync {
    fn proxy(&self) -> &Arc<Proxy>;

    fn server_name(&self) -> &str {
        self.proxy().context().server_name()
    }

    fn class_name(&self) -> &str {
        self.proxy().class_name()
    }

    fn is_deleted(&self) -> bool {
        self.proxy().is_deleted()
    }

    async fn property(&self, name: &str) -> Result<Value> {
        self.proxy().get_property(name).await
    }

    /// Re-read the instance if the cache is older than the configured
    /// threshold
    async fn update_properties(&self) -> Result<()> {
        let proxy = self.proxy();
        proxy
            .refresh_properties(proxy.context().config().property_refresh_threshold())
            .await
            .map(|_| ())
    }

    async fn element_name(&self) -> Result<String> {
        let value = self.property("ElementName").await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn instance_id(&self) -> Result<Option<String>> {
        let value = self.property("InstanceID").await?;
        Ok(value.as_str().map(str::to_string))
    }
}

/// `EnabledState` of a computer system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnabledState {
    Unknown,
    Running,
    Off,
    Stopping,
    Saved,
    Paused,
    Starting,
    Reset,
    Saving,
    Pausing,
    Resuming,
    FastSaved,
    FastSaving,
    ComponentServicing,
}

impl EnabledState {
    const OTHER: u16 = 1;

    /// Decode `EnabledState`, consulting `OtherEnabledState` when the
    /// server reports Other
    pub fn from_wire(code: u16, other: Option<&str>) -> Option<Self> {
        let state = match code {
            0 => EnabledState::Unknown,
            Self::OTHER => return Some(Self::from_other(other.unwrap_or_default())),
            2 => EnabledState::Running,
            3 => EnabledState::Off,
            4 => EnabledState::Stopping,
            6 => EnabledState::Saved,
            9 => EnabledState::Paused,
            10 => EnabledState::Starting,
            11 => EnabledState::Reset,
            32773 => EnabledState::Saving,
            32776 => EnabledState::Pausing,
            32777 => EnabledState::Resuming,
            32779 => EnabledState::FastSaved,
            32780 => EnabledState::FastSaving,
            _ => return None,
        };
        Some(state)
    }

    fn from_other(other: &str) -> Self {
        const TABLE: [(&str, EnabledState); 5] = [
            ("Quiescing", EnabledState::Pausing),
            ("Resuming", EnabledState::Resuming),
            ("Saving", EnabledState::Saving),
            ("FastSaving", EnabledState::FastSaving),
            ("ComponentServicing", EnabledState::ComponentServicing),
        ];
        TABLE
            .iter()
            .find(|(name, _)| eq_fold(name, other))
            .map(|(_, state)| *state)
            .unwrap_or(EnabledState::Unknown)
    }

    /// Code accepted by `RequestStateChange`
    pub fn requested_state(self) -> Option<u16> {
        match self {
            EnabledState::Running => Some(2),
            EnabledState::Off => Some(3),
            EnabledState::Stopping => Some(4),
            EnabledState::Saved => Some(6),
            EnabledState::Paused => Some(9),
            EnabledState::Reset => Some(11),
            _ => None,
        }
    }
}

/// Host and virtual machine state
#[async_trait]
pub trait PowerState: ManagementObject {
    async fn enabled_state(&self) -> Result<EnabledState> {
        let code = self.property("EnabledState").await?;
        let raw = code
            .as_u16()
            .ok_or_else(|| Error::invalid_value("EnabledState", &code, "uint16"))?;
        let other = if raw == EnabledState::OTHER {
            self.property("OtherEnabledState").await?
        } else {
            Value::Null
        };
        match EnabledState::from_wire(raw, other.as_str()) {
            Some(EnabledState::Unknown) | None => {
                Err(Error::invalid_value("EnabledState", raw, "a known computer system state"))
            }
            Some(state) => Ok(state),
        }
    }

    async fn is_running(&self) -> Result<bool> {
        Ok(self.enabled_state().await? == EnabledState::Running)
    }
}

/// Allocation setting data of a virtual device
#[async_trait]
pub trait DeviceSettingView: ManagementObject {
    fn device_type(&self) -> DeviceSettingType;

    /// Controller or port this device hangs off
    async fn parent(&self) -> Result<Option<ObjectPath>> {
        let value = self.property("Parent").await?;
        parse_reference("Parent", &value)
    }

    async fn address(&self) -> Result<Option<String>> {
        let value = self.property("Address").await?;
        Ok(value.as_str().map(str::to_string))
    }

    async fn host_resources(&self) -> Result<Vec<String>> {
        let value = self.property("HostResource").await?;
        Ok(match value.as_array() {
            Some(items) => items
                .iter()
                .filter_map(|item| match item {
                    Value::Reference(path) => Some(path.to_string()),
                    other => other.as_str().map(str::to_string),
                })
                .collect(),
            None => Vec::new(),
        })
    }
}

/// Read-only view of a job object
#[async_trait]
pub trait TaskView: ManagementObject {
    async fn job_state(&self) -> Result<JobState> {
        let value = self.property("JobState").await?;
        value
            .as_u16()
            .and_then(JobState::from_code)
            .ok_or_else(|| Error::invalid_value("JobState", &value, "a job state code"))
    }

    async fn percent_complete(&self) -> Result<u16> {
        let value = self.property("PercentComplete").await?;
        Ok(value.as_u16().unwrap_or(0))
    }

    async fn job_type(&self) -> Result<u16> {
        let value = self.property("JobType").await?;
        Ok(value.as_u16().unwrap_or(0))
    }
}

fn parse_reference(name: &str, value: &Value) -> Result<Option<ObjectPath>> {
    match value {
        Value::Null => Ok(None),
        Value::Reference(path) => Ok(Some(path.clone())),
        Value::Str(text) if text.is_empty() => Ok(None),
        Value::Str(text) => text
            .parse()
            .map(Some)
            .map_err(|_| Error::invalid_value(name, text, "an object path")),
        other => Err(Error::invalid_value(name, other, "an object path")),
    }
}

impl ManagementObject for View {
    fn proxy(&self) -> &Arc<Proxy> {
        &self.proxy
    }
}

impl PowerState for View {}

impl DeviceSettingView for View {
    fn device_type(&self) -> DeviceSettingType {
        match self.kind {
            ViewKind::DeviceSetting(device) => device,
            ViewKind::EthernetConnectionRequest => DeviceSettingType::EthernetConnection,
            _ => DeviceSettingType::Unknown,
        }
    }
}

impl TaskView for View {}
