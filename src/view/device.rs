//! Device setting and resource pool classification
//!
//! Allocation setting data instances all share a handful of classes; the
//! concrete device is told apart by `ResourceType` and `ResourceSubType`.
//! A `ResourceType` of 1 (Other) moves the discriminating string into
//! `OtherResourceType`.

use std::fmt;

/// `ResourceType` value meaning "see OtherResourceType"
pub const RESOURCE_TYPE_OTHER: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceSettingType {
    Unknown,
    Memory,
    PmemController,
    Processor,
    SerialPort,
    ScsiSyntheticController,
    IdeController,
    DisketteController,
    HardDiskSyntheticDrive,
    DisketteSyntheticDrive,
    DvdSyntheticDrive,
    GpuPartition,
    HardDiskPhysicalDrive,
    KeyStorageDrive,
    HardDisk,
    IsoDisk,
    FloppyDisk,
    SerialController,
    EthernetPortEmulated,
    EthernetPortSynthetic,
    EthernetConnection,
    FibreChannelPort,
    FibreChannelConnection,
    SynthVideo,
    SynthKeyboard,
    SynthMouse,
    S3Video,
    Synth3dVideo,
    PciExpress,
    Battery,
}

/// (type, ResourceType, ResourceSubType) for every known device
const DEVICE_TABLE: &[(DeviceSettingType, u16, &str)] = &[
    (DeviceSettingType::Memory, 4, "Microsoft:Hyper-V:Memory"),
    (DeviceSettingType::PmemController, 32771, "Microsoft:Hyper-V:Persistent Memory Controller"),
    (DeviceSettingType::Processor, 3, "Microsoft:Hyper-V:Processor"),
    (DeviceSettingType::SerialPort, 21, "Microsoft:Hyper-V:Serial Port"),
    (DeviceSettingType::ScsiSyntheticController, 6, "Microsoft:Hyper-V:Synthetic SCSI Controller"),
    (DeviceSettingType::IdeController, 5, "Microsoft:Hyper-V:Emulated IDE Controller"),
    (DeviceSettingType::DisketteController, 1, "Microsoft:Hyper-V:Virtual Diskette Controller"),
    (DeviceSettingType::HardDiskSyntheticDrive, 17, "Microsoft:Hyper-V:Synthetic Disk Drive"),
    (DeviceSettingType::DisketteSyntheticDrive, 14, "Microsoft:Hyper-V:Synthetic Diskette Drive"),
    (DeviceSettingType::DvdSyntheticDrive, 16, "Microsoft:Hyper-V:Synthetic DVD Drive"),
    (DeviceSettingType::GpuPartition, 32770, "Microsoft:Hyper-V:GPU Partition"),
    (DeviceSettingType::HardDiskPhysicalDrive, 17, "Microsoft:Hyper-V:Physical Disk Drive"),
    (DeviceSettingType::KeyStorageDrive, 32768, "Microsoft:Hyper-V:Storage Logical Unit"),
    (DeviceSettingType::HardDisk, 31, "Microsoft:Hyper-V:Virtual Hard Disk"),
    (DeviceSettingType::IsoDisk, 31, "Microsoft:Hyper-V:Virtual CD/DVD Disk"),
    (DeviceSettingType::FloppyDisk, 31, "Microsoft:Hyper-V:Virtual Floppy Disk"),
    (DeviceSettingType::SerialController, 13, "Microsoft:Hyper-V:Serial Controller"),
    (DeviceSettingType::EthernetPortEmulated, 10, "Microsoft:Hyper-V:Emulated Ethernet Port"),
    (DeviceSettingType::EthernetPortSynthetic, 10, "Microsoft:Hyper-V:Synthetic Ethernet Port"),
    (DeviceSettingType::EthernetConnection, 33, "Microsoft:Hyper-V:Ethernet Connection"),
    (DeviceSettingType::FibreChannelPort, 7, "Microsoft:Hyper-V:Synthetic FibreChannel Port"),
    (DeviceSettingType::FibreChannelConnection, 64764, "Microsoft:Hyper-V:FibreChannel Connection"),
    (DeviceSettingType::SynthVideo, 24, "Microsoft:Hyper-V:Synthetic Display Controller"),
    (DeviceSettingType::SynthKeyboard, 13, "Microsoft:Hyper-V:Synthetic Keyboard"),
    (DeviceSettingType::SynthMouse, 13, "Microsoft:Hyper-V:Synthetic Mouse"),
    (DeviceSettingType::S3Video, 24, "Microsoft:Hyper-V:S3 Display Controller"),
    (DeviceSettingType::Synth3dVideo, 24, "Microsoft:Hyper-V:Synthetic 3D Display Controller"),
    (DeviceSettingType::PciExpress, 32769, "Microsoft:Hyper-V:Virtual Pci Express Port"),
    (DeviceSettingType::Battery, 1, "Microsoft:Hyper-V:Virtual Battery"),
];

impl DeviceSettingType {
    /// Classify an allocation setting.
    ///
    /// Subtype comparison is exact; the server reports these strings
    /// verbatim.
    pub fn from_resource(
        resource_type: u16,
        resource_sub_type: Option<&str>,
        other_resource_type: Option<&str>,
    ) -> Self {
        let sub_type = if resource_type == RESOURCE_TYPE_OTHER {
            other_resource_type
        } else {
            resource_sub_type
        };
        let Some(sub_type) = sub_type else {
            return DeviceSettingType::Unknown;
        };
        DEVICE_TABLE
            .iter()
            .find(|(_, _, known)| *known == sub_type)
            .map(|(kind, _, _)| *kind)
            .unwrap_or(DeviceSettingType::Unknown)
    }

    /// `(ResourceType, ResourceSubType)` used when creating this device.
    /// `None` for [`DeviceSettingType::Unknown`].
    pub fn resource_type(self) -> Option<(u16, &'static str)> {
        match self {
            // serial ports are created with an empty subtype
            DeviceSettingType::SerialPort => Some((21, "")),
            _ => DEVICE_TABLE
                .iter()
                .find(|(kind, _, _)| *kind == self)
                .map(|(_, rt, sub)| (*rt, *sub)),
        }
    }

    pub fn family(self) -> DeviceFamily {
        use DeviceSettingType::*;
        match self {
            IdeController | DisketteController => DeviceFamily::DriveController,
            ScsiSyntheticController => DeviceFamily::ScsiController,
            PmemController => DeviceFamily::PmemController,
            DisketteSyntheticDrive | HardDiskSyntheticDrive | HardDiskPhysicalDrive
            | DvdSyntheticDrive | KeyStorageDrive => DeviceFamily::Drive,
            Memory => DeviceFamily::Memory,
            Processor => DeviceFamily::Processor,
            SerialController => DeviceFamily::SerialController,
            SerialPort => DeviceFamily::SerialPort,
            EthernetPortEmulated => DeviceFamily::EmulatedEthernetPort,
            EthernetPortSynthetic => DeviceFamily::SyntheticEthernetPort,
            EthernetConnection => DeviceFamily::EthernetConnectionRequest,
            FibreChannelPort => DeviceFamily::FibreChannelPort,
            FibreChannelConnection => DeviceFamily::FibreChannelAllocation,
            GpuPartition => DeviceFamily::GpuPartitionAdapter,
            HardDisk | IsoDisk | FloppyDisk => DeviceFamily::VirtualDisk,
            S3Video => DeviceFamily::S3DisplayController,
            SynthVideo => DeviceFamily::SyntheticDisplayController,
            SynthKeyboard => DeviceFamily::SyntheticKeyboard,
            SynthMouse => DeviceFamily::SyntheticMouse,
            PciExpress => DeviceFamily::AssignableDevice,
            Battery => DeviceFamily::Battery,
            Unknown | Synth3dVideo => DeviceFamily::Generic,
        }
    }

    pub fn is_drive(self) -> bool {
        self.family() == DeviceFamily::Drive
    }
}

impl fmt::Display for DeviceSettingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Groups of devices sharing one set of view operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceFamily {
    DriveController,
    ScsiController,
    PmemController,
    Drive,
    Memory,
    Processor,
    SerialController,
    SerialPort,
    EmulatedEthernetPort,
    SyntheticEthernetPort,
    EthernetConnectionRequest,
    FibreChannelPort,
    FibreChannelAllocation,
    GpuPartitionAdapter,
    VirtualDisk,
    S3DisplayController,
    SyntheticDisplayController,
    SyntheticKeyboard,
    SyntheticMouse,
    AssignableDevice,
    Battery,
    Generic,
}

/// Kind of a `Msvm_ResourcePool`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourcePoolKind {
    Processor,
    FibreChannel,
    VirtualDisk,
    Synth3dVideo,
    EthernetConnection,
    PciExpress,
    GpuPartition,
    Generic,
}

impl ResourcePoolKind {
    /// Pools never use OtherResourceType
    pub fn from_resource(resource_type: u16, resource_sub_type: Option<&str>) -> Self {
        Self::from(DeviceSettingType::from_resource(resource_type, resource_sub_type, None))
    }
}

impl From<DeviceSettingType> for ResourcePoolKind {
    fn from(device: DeviceSettingType) -> Self {
        match device {
            DeviceSettingType::Processor => ResourcePoolKind::Processor,
            DeviceSettingType::FibreChannelConnection => ResourcePoolKind::FibreChannel,
            DeviceSettingType::HardDisk
            | DeviceSettingType::IsoDisk
            | DeviceSettingType::FloppyDisk => ResourcePoolKind::VirtualDisk,
            DeviceSettingType::Synth3dVideo => ResourcePoolKind::Synth3dVideo,
            DeviceSettingType::EthernetConnection => ResourcePoolKind::EthernetConnection,
            DeviceSettingType::PciExpress => ResourcePoolKind::PciExpress,
            DeviceSettingType::GpuPartition => ResourcePoolKind::GpuPartition,
            _ => ResourcePoolKind::Generic,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subtype_selects_device() {
        assert_eq!(
            DeviceSettingType::from_resource(
                17,
                Some("Microsoft:Hyper-V:Synthetic Disk Drive"),
                None
            ),
            DeviceSettingType::HardDiskSyntheticDrive
        );
        assert_eq!(
            DeviceSettingType::from_resource(
                31,
                Some("Microsoft:Hyper-V:Virtual CD/DVD Disk"),
                None
            ),
            DeviceSettingType::IsoDisk
        );
    }

    #[test]
    fn test_other_resource_type_replaces_subtype() {
        let kind = DeviceSettingType::from_resource(
            RESOURCE_TYPE_OTHER,
            Some("Microsoft:Hyper-V:Memory"),
            Some("Microsoft:Hyper-V:Virtual Battery"),
        );
        assert_eq!(kind, DeviceSettingType::Battery);

        let missing = DeviceSettingType::from_resource(
            RESOURCE_TYPE_OTHER,
            Some("Microsoft:Hyper-V:Memory"),
            None,
        );
        assert_eq!(missing, DeviceSettingType::Unknown);
    }

    #[test]
    fn test_unknown_subtype() {
        let kind = DeviceSettingType::from_resource(10, Some("Contoso:Fancy NIC"), None);
        assert_eq!(kind, DeviceSettingType::Unknown);
        assert_eq!(kind.family(), DeviceFamily::Generic);
        assert_eq!(kind.resource_type(), None);
    }

    #[test]
    fn test_resource_type_reverse_lookup() {
        assert_eq!(
            DeviceSettingType::EthernetPortSynthetic.resource_type(),
            Some((10, "Microsoft:Hyper-V:Synthetic Ethernet Port"))
        );
        assert_eq!(DeviceSettingType::SerialPort.resource_type(), Some((21, "")));
        assert!(DeviceSettingType::DvdSyntheticDrive.is_drive());
    }

    #[test]
    fn test_pool_kinds() {
        assert_eq!(
            ResourcePoolKind::from_resource(31, Some("Microsoft:Hyper-V:Virtual Floppy Disk")),
            ResourcePoolKind::VirtualDisk
        );
        assert_eq!(
            ResourcePoolKind::from_resource(4, Some("Microsoft:Hyper-V:Memory")),
            ResourcePoolKind::Generic
        );
        // pools ignore OtherResourceType
        assert_eq!(
            ResourcePoolKind::from_resource(
                RESOURCE_TYPE_OTHER,
                Some("Microsoft:Hyper-V:Processor")
            ),
            ResourcePoolKind::Generic
        );
    }
}
