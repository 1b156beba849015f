use serde::{Deserialize, Serialize};

/// Binding protocol requested for an interface.
///
/// SR-IOV devices are passed through by an external device plugin, so both
/// plug phases treat them as a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindingMethod {
    Bridge,
    Masquerade,
    Slirp,
    Macvtap,
    Sriov,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// Port exposed by a masquerade interface. When no ports are listed the
/// guest receives all inbound traffic instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortSpec {
    pub name: Option<String>,
    pub protocol: Option<Protocol>,
    pub port: u16,
}

impl PortSpec {
    pub fn new(protocol: Protocol, port: u16) -> Self {
        Self {
            name: None,
            protocol: Some(protocol),
            port,
        }
    }

    /// Declared protocol, defaulting to TCP.
    pub fn protocol(&self) -> Protocol {
        self.protocol.unwrap_or(Protocol::Tcp)
    }
}

/// Extra options handed verbatim to the DHCP server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DhcpOptions {
    pub boot_file_name: Option<String>,
    pub tftp_server_name: Option<String>,
    #[serde(default)]
    pub ntp_servers: Vec<String>,
}

/// One network interface requested by the VM spec.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InterfaceSpec {
    pub name: String,
    pub binding: Option<BindingMethod>,
    /// Explicit MAC for the guest-facing side; generated or discovered when
    /// unset.
    pub mac_address: Option<String>,
    /// NIC model handed to the hypervisor (e.g. `virtio`).
    pub model: Option<String>,
    #[serde(default)]
    pub ports: Vec<PortSpec>,
    pub dhcp_options: Option<DhcpOptions>,
}

impl InterfaceSpec {
    pub fn new(name: impl Into<String>, binding: BindingMethod) -> Self {
        Self {
            name: name.into(),
            binding: Some(binding),
            ..Default::default()
        }
    }
}

/// The network a VM interface attaches to.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkSpec {
    pub name: String,
    /// CIDR carved out for the guest in masquerade mode; defaults apply when
    /// unset.
    pub vm_network_cidr: Option<String>,
    pub vm_ipv6_network_cidr: Option<String>,
}

/// The slice of the VM instance spec the network core consumes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VmiSpec {
    pub uid: String,
    pub name: String,
    #[serde(default)]
    pub interfaces: Vec<InterfaceSpec>,
    pub network_interface_multiqueue: Option<bool>,
    pub cpu_cores: Option<u32>,
}
