use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Result};
use rand::Rng;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::vmi::InterfaceSpec;

/// 6-byte hardware address, serialized in the usual colon-separated form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacAddr([u8; 6]);

impl MacAddr {
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Random locally-administered unicast address (0x02 first byte).
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        Self([
            0x02,
            rng.gen::<u8>(),
            rng.gen::<u8>(),
            rng.gen::<u8>(),
            rng.gen::<u8>(),
            rng.gen::<u8>(),
        ])
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

impl FromStr for MacAddr {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut octets = [0u8; 6];
        let mut parts = s.split(':');
        for octet in octets.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| anyhow!("invalid MAC address: {}", s))?;
            *octet = u8::from_str_radix(part, 16)
                .map_err(|_| anyhow!("invalid MAC address: {}", s))?;
        }
        if parts.next().is_some() {
            bail!("invalid MAC address: {}", s);
        }
        Ok(Self(octets))
    }
}

impl Serialize for MacAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// Address plus prefix length, e.g. `10.244.0.7/24`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpSubnet {
    pub ip: IpAddr,
    pub prefix: u8,
}

impl IpSubnet {
    pub fn new(ip: IpAddr, prefix: u8) -> Self {
        Self { ip, prefix }
    }

    pub fn is_ipv6(&self) -> bool {
        self.ip.is_ipv6()
    }
}

impl fmt::Display for IpSubnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.ip, self.prefix)
    }
}

impl FromStr for IpSubnet {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (ip, prefix) = match s.split_once('/') {
            Some((ip, prefix)) => {
                let ip: IpAddr = ip
                    .parse()
                    .with_context(|| format!("invalid address in {}", s))?;
                let prefix: u8 = prefix
                    .parse()
                    .with_context(|| format!("invalid prefix length in {}", s))?;
                (ip, prefix)
            }
            // A bare address is a host route
            None => {
                let ip: IpAddr = s.parse().with_context(|| format!("invalid address {}", s))?;
                (ip, if ip.is_ipv4() { 32 } else { 128 })
            }
        };
        let max = if ip.is_ipv4() { 32 } else { 128 };
        if prefix > max {
            bail!("prefix length {} out of range for {}", prefix, ip);
        }
        Ok(Self { ip, prefix })
    }
}

impl Serialize for IpSubnet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for IpSubnet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// One kernel routing-table entry as discovered on the sandbox interface.
/// `dst == None` is the default route.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteRecord {
    pub dst: Option<IpSubnet>,
    pub src: Option<IpAddr>,
    pub gw: Option<IpAddr>,
}

/// Discovery record for one sandbox interface: everything phase 1 learns
/// before reshaping, persisted for phase 2. The addressing fields stay unset
/// when the sandbox interface carried no address at discovery (IPAM
/// disabled).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Vif {
    pub name: String,
    pub mac: Option<MacAddr>,
    pub ip: Option<IpSubnet>,
    pub ipv6: Option<IpSubnet>,
    pub mtu: u16,
    pub gateway: Option<IpAddr>,
    pub gateway_ipv6: Option<IpAddr>,
    /// Non-default routes replayed to the guest as classless static routes.
    #[serde(default)]
    pub routes: Vec<RouteRecord>,
    pub ipam_disabled: bool,
    /// Tap handed to the hypervisor; empty for bindings that create none.
    #[serde(default)]
    pub tap_device: String,
}

impl Vif {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Normalize gateway address forms after a JSON round trip so equality
    /// tests and kernel calls see 4-byte v4 and 16-byte v6 addresses.
    pub fn canonicalize(&mut self) {
        if let Some(IpAddr::V6(v6)) = self.gateway {
            if let Some(v4) = v6.to_ipv4_mapped() {
                self.gateway = Some(IpAddr::V4(v4));
            }
        }
        if let Some(IpAddr::V4(v4)) = self.gateway_ipv6 {
            self.gateway_ipv6 = Some(IpAddr::V6(v4.to_ipv6_mapped()));
        }
    }
}

/// User-visible status written once per interface, capturing the sandbox
/// addressing as it was before any reshaping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodCacheInterface {
    pub iface: InterfaceSpec,
    pub pod_ip: String,
    #[serde(default)]
    pub pod_ips: Vec<String>,
}

/// `eth0` -> `tap0`: the 3-character prefix of the sandbox interface name is
/// replaced.
pub(crate) fn tap_device_name(pod_interface_name: &str) -> String {
    format!(
        "tap{}",
        &pod_interface_name[3.min(pod_interface_name.len())..]
    )
}

pub(crate) fn is_global_unicast(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_loopback()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_broadcast()
                || v4.is_unspecified())
        }
        IpAddr::V6(v6) => {
            !(v6.is_loopback()
                || v6.is_multicast()
                || v6.is_unspecified()
                || (v6.segments()[0] & 0xffc0) == 0xfe80)
        }
    }
}

/// Drop routes the guest must not replay: all-empty entries and routes
/// sourced from the address the guest itself will claim.
pub(crate) fn filter_pod_network_routes(routes: &[RouteRecord], vif: &Vif) -> Vec<RouteRecord> {
    routes
        .iter()
        .filter(|route| !(route.dst.is_none() && route.src.is_none() && route.gw.is_none()))
        .filter(|route| match (route.src, &vif.ip) {
            (Some(src), Some(ip)) => src != ip.ip,
            _ => true,
        })
        .cloned()
        .collect()
}

/// Split a CIDR into the first two usable addresses: network+1 for the
/// gateway side and network+2 for the VM, both keeping the prefix length.
pub fn host_and_gw_addresses_from_cidr(cidr: &str) -> Result<(IpSubnet, IpSubnet)> {
    let subnet: IpSubnet = cidr.parse().with_context(|| format!("invalid CIDR {}", cidr))?;
    match subnet.ip {
        IpAddr::V4(ip) => {
            if subnet.prefix > 30 {
                bail!("CIDR {} has no room for a gateway and a vm address", cidr);
            }
            let mask = if subnet.prefix == 0 {
                0
            } else {
                u32::MAX << (32 - subnet.prefix)
            };
            let base = u32::from(ip) & mask;
            Ok((
                IpSubnet::new(IpAddr::V4(Ipv4Addr::from(base + 1)), subnet.prefix),
                IpSubnet::new(IpAddr::V4(Ipv4Addr::from(base + 2)), subnet.prefix),
            ))
        }
        IpAddr::V6(ip) => {
            if subnet.prefix > 126 {
                bail!("CIDR {} has no room for a gateway and a vm address", cidr);
            }
            let mask = if subnet.prefix == 0 {
                0
            } else {
                u128::MAX << (128 - subnet.prefix)
            };
            let base = u128::from(ip) & mask;
            Ok((
                IpSubnet::new(IpAddr::V6(Ipv6Addr::from(base + 1)), subnet.prefix),
                IpSubnet::new(IpAddr::V6(Ipv6Addr::from(base + 2)), subnet.prefix),
            ))
        }
    }
}
