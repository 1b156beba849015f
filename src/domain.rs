use serde::{Deserialize, Serialize};

use crate::network::types::MacAddr;
use crate::vmi::VmiSpec;

/// Largest number of queues a multi-queue tap device accepts.
const MAX_NET_QUEUES: u32 = 256;

/// Host-side device an interface is wired to. `managed` stays `"no"` so the
/// hypervisor never tears down a tap it does not own.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InterfaceTarget {
    pub device: String,
    pub managed: String,
}

impl InterfaceTarget {
    pub fn unmanaged(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            managed: "no".to_string(),
        }
    }
}

/// Interface entry in the domain device list.
///
/// Entries stamped by the domain generator carry `alias` and `model`; the
/// copy cached between the plug phases carries only the fields discovered
/// and produced in phase 1.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DomainInterface {
    pub alias: Option<String>,
    pub model: Option<String>,
    pub mac: Option<MacAddr>,
    pub mtu: Option<u16>,
    pub target: Option<InterfaceTarget>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DomainDevices {
    #[serde(default)]
    pub interfaces: Vec<DomainInterface>,
}

/// The slice of the domain definition the network core decorates in phase 2.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DomainSpec {
    #[serde(default)]
    pub devices: DomainDevices,
    /// Extra hypervisor command-line arguments, appended pairwise.
    #[serde(default)]
    pub qemu_args: Vec<String>,
}

/// Queue count for a multi-queue interface: one queue per vCPU, bounded by
/// what the tap driver accepts.
pub fn calculate_network_queues(vmi: &VmiSpec) -> u32 {
    vmi.cpu_cores.unwrap_or(1).min(MAX_NET_QUEUES)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_queues_default_to_one() {
        let vmi = VmiSpec::default();
        assert_eq!(calculate_network_queues(&vmi), 1);
    }

    #[test]
    fn test_network_queues_follow_vcpus_up_to_the_cap() {
        let mut vmi = VmiSpec {
            cpu_cores: Some(4),
            ..Default::default()
        };
        assert_eq!(calculate_network_queues(&vmi), 4);

        vmi.cpu_cores = Some(1024);
        assert_eq!(calculate_network_queues(&vmi), 256);
    }

    #[test]
    fn test_cached_interface_round_trip() {
        let iface = DomainInterface {
            mac: Some("02:00:00:11:22:33".parse().unwrap()),
            mtu: Some(1450),
            target: Some(InterfaceTarget::unmanaged("tap0")),
            ..Default::default()
        };

        let json = serde_json::to_string(&iface).unwrap();
        let parsed: DomainInterface = serde_json::from_str(&json).unwrap();
        assert_eq!(iface, parsed);
        assert_eq!(parsed.target.unwrap().managed, "no");
    }
}
