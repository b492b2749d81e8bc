//! Identities of well-known objects
//!
//! Management services are singletons keyed by the hosting computer system,
//! so their paths can be built without a round trip.

use virtmgmt_core_interface::ObjectPath;

pub mod namespaces {
    pub const VIRTUALIZATION: &str = "root\\virtualization\\v2";
    pub const CIMV2: &str = "root\\cimv2";
    pub const INTEROP: &str = "root\\interop";
    pub const CLUSTER: &str = "root\\MSCluster";

    pub const ALL: [&str; 4] = [VIRTUALIZATION, CIMV2, INTEROP, CLUSTER];
}

pub mod classes {
    pub const COMPUTER_SYSTEM: &str = "Msvm_ComputerSystem";
    pub const CONCRETE_JOB: &str = "Msvm_ConcreteJob";
    pub const SUMMARY_INFORMATION: &str = "Msvm_SummaryInformation";
    pub const VIRTUAL_SYSTEM_MANAGEMENT_SERVICE: &str = "Msvm_VirtualSystemManagementService";
}

/// A singleton management service: class name and service `Name`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceKey {
    pub class_name: &'static str,
    pub name: &'static str,
}

pub const VIRTUAL_SYSTEM_MANAGEMENT: ServiceKey = ServiceKey {
    class_name: classes::VIRTUAL_SYSTEM_MANAGEMENT_SERVICE,
    name: "vmms",
};
pub const REPLICATION: ServiceKey = ServiceKey {
    class_name: "Msvm_ReplicationService",
    name: "replicasvc",
};
pub const SNAPSHOT: ServiceKey = ServiceKey {
    class_name: "Msvm_VirtualSystemSnapshotService",
    name: "vssnapsvc",
};
pub const SWITCH_MANAGEMENT: ServiceKey = ServiceKey {
    class_name: "Msvm_VirtualEthernetSwitchManagementService",
    name: "nvspwmi",
};
pub const IMAGE_MANAGEMENT: ServiceKey = ServiceKey {
    class_name: "Msvm_ImageManagementService",
    name: "vhdsvc",
};
pub const MIGRATION: ServiceKey = ServiceKey {
    class_name: "Msvm_VirtualSystemMigrationService",
    name: "migrationwmi",
};
pub const RESOURCE_POOL_CONFIGURATION: ServiceKey = ServiceKey {
    class_name: "Msvm_ResourcePoolConfigurationService",
    name: "poolcfgsvc",
};
pub const COLLECTION_MANAGEMENT: ServiceKey = ServiceKey {
    class_name: "Msvm_CollectionManagementService",
    name: "collectionsvc",
};

pub const SERVICES: [ServiceKey; 8] = [
    VIRTUAL_SYSTEM_MANAGEMENT,
    REPLICATION,
    SNAPSHOT,
    SWITCH_MANAGEMENT,
    IMAGE_MANAGEMENT,
    MIGRATION,
    RESOURCE_POOL_CONFIGURATION,
    COLLECTION_MANAGEMENT,
];

/// Service on `server`, hosted by the computer system named like the server
pub fn service(server: &str, key: ServiceKey) -> ObjectPath {
    ObjectPath::instance(
        server,
        namespaces::VIRTUALIZATION,
        key.class_name,
        [
            ("CreationClassName", key.class_name),
            ("Name", key.name),
            ("SystemCreationClassName", classes::COMPUTER_SYSTEM),
            ("SystemName", server),
        ],
    )
}

pub fn host_computer_system(server: &str) -> ObjectPath {
    computer_system(server, server)
}

/// Virtual machine by its id (the `Name` key)
pub fn vm_computer_system(server: &str, vm_id: &str) -> ObjectPath {
    computer_system(server, vm_id)
}

fn computer_system(server: &str, name: &str) -> ObjectPath {
    ObjectPath::instance(
        server,
        namespaces::VIRTUALIZATION,
        classes::COMPUTER_SYSTEM,
        [
            ("CreationClassName", classes::COMPUTER_SYSTEM),
            ("Name", name),
        ],
    )
}

pub fn vm_summary_information(server: &str, vm_id: &str) -> ObjectPath {
    ObjectPath::instance(
        server,
        namespaces::VIRTUALIZATION,
        classes::SUMMARY_INFORMATION,
        [("InstanceID", format!("Microsoft:{}", vm_id))],
    )
}

pub fn concrete_job(server: &str, instance_id: &str) -> ObjectPath {
    ObjectPath::instance(
        server,
        namespaces::VIRTUALIZATION,
        classes::CONCRETE_JOB,
        [("InstanceID", instance_id)],
    )
}

/// Service whose class is `class_name`, if it is one of the well-known ones
pub fn find_service(class_name: &str) -> Option<ServiceKey> {
    SERVICES
        .iter()
        .copied()
        .find(|key| key.class_name.eq_ignore_ascii_case(class_name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_path_keys() {
        let path = service("HOST01", VIRTUAL_SYSTEM_MANAGEMENT);
        assert_eq!(
            path.to_string(),
            "\\\\HOST01\\root\\virtualization\\v2:Msvm_VirtualSystemManagementService.CreationClassName=\"Msvm_VirtualSystemManagementService\",Name=\"vmms\",SystemCreationClassName=\"Msvm_ComputerSystem\",SystemName=\"HOST01\""
        );
    }

    #[test]
    fn test_host_and_vm_share_class() {
        let host = host_computer_system("HOST01");
        let vm = vm_computer_system("HOST01", "5C1D-AA");
        assert_eq!(host.class_name(), vm.class_name());
        assert_eq!(host.key("Name").and_then(|k| k.as_str()), Some("HOST01"));
        assert_ne!(host, vm);
    }

    #[test]
    fn test_summary_information_prefix() {
        let path = vm_summary_information("HOST01", "abc");
        assert_eq!(path.key("InstanceID").and_then(|k| k.as_str()), Some("Microsoft:abc"));
    }

    #[test]
    fn test_find_service() {
        assert_eq!(find_service("msvm_imagemanagementservice"), Some(IMAGE_MANAGEMENT));
        assert_eq!(find_service("Msvm_Nothing"), None);
    }
}
