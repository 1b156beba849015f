#![allow(dead_code)]

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;

use vmnet::network::handler::{AddressFamily, Link, NatFamily, NetHandler};
use vmnet::network::types::{self, IpSubnet, MacAddr, RouteRecord, Vif};
use vmnet::vmi::DhcpOptions;

/// Kernel state the mock serves and mutates.
#[derive(Default)]
pub struct MockState {
    pub links: HashMap<String, Link>,
    pub addrs: HashMap<String, Vec<IpSubnet>>,
    pub routes: HashMap<String, Vec<RouteRecord>>,
    pub ipv6_enabled: bool,
    pub ipv4_primary: bool,
    pub nat_iptables: bool,
    pub nftables_load_ok: bool,
    /// Method name whose next invocations fail, for crash-path tests.
    pub fail_on: Option<&'static str>,
}

impl MockState {
    pub fn with_link(mut self, name: &str, mtu: i64, mac: &str) -> Self {
        self.links.insert(
            name.to_string(),
            Link {
                name: name.to_string(),
                index: self.links.len() as u32 + 2,
                mtu,
                mac: Some(mac.parse().unwrap()),
            },
        );
        self
    }

    pub fn with_addrs(mut self, name: &str, addrs: &[&str]) -> Self {
        self.addrs.insert(
            name.to_string(),
            addrs.iter().map(|a| a.parse().unwrap()).collect(),
        );
        self
    }

    pub fn with_default_route(mut self, name: &str, gw: &str) -> Self {
        self.routes.entry(name.to_string()).or_default().push(RouteRecord {
            dst: None,
            src: None,
            gw: Some(gw.parse().unwrap()),
        });
        self
    }
}

/// Capability calls that change kernel state, as opposed to queries.
const MUTATING_CALLS: &[&str] = &[
    "link_add_bridge",
    "link_add_dummy",
    "link_set_up",
    "link_set_down",
    "link_set_master",
    "link_set_learning_off",
    "addr_add",
    "addr_del",
    "set_random_mac",
    "create_tap_device",
    "bind_tap_device_to_bridge",
    "configure_ipv6_forwarding",
    "iptables_new_chain",
    "iptables_append_rule",
    "nftables_load",
    "nftables_new_chain",
    "nftables_append_rule",
    "disable_tx_offload_checksum",
];

/// Recording in-memory stand-in for the kernel capability surface.
pub struct MockNetHandler {
    pub state: Mutex<MockState>,
    calls: Mutex<Vec<String>>,
}

impl MockNetHandler {
    pub fn new(state: MockState) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(state),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn record(&self, name: &'static str, detail: impl AsRef<str>) -> Result<()> {
        if self.state.lock().unwrap().fail_on == Some(name) {
            bail!("injected {} failure", name);
        }
        let detail = detail.as_ref();
        let call = if detail.is_empty() {
            name.to_string()
        } else {
            format!("{} {}", name, detail)
        };
        self.calls.lock().unwrap().push(call);
        Ok(())
    }

    pub fn set_fail_on(&self, name: Option<&'static str>) {
        self.state.lock().unwrap().fail_on = name;
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn count_calls(&self, name: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.split_whitespace().next() == Some(name))
            .count()
    }

    /// Kernel-mutating calls in invocation order, by method name.
    pub fn mutation_sequence(&self) -> Vec<String> {
        self.calls()
            .iter()
            .filter_map(|call| {
                let name = call.split_whitespace().next().unwrap_or_default();
                MUTATING_CALLS.contains(&name).then(|| name.to_string())
            })
            .collect()
    }

    pub fn nat_rule_count(&self, call: &str, family: NatFamily) -> usize {
        let prefix = format!("{} {:?} ", call, family);
        self.calls()
            .iter()
            .filter(|recorded| recorded.starts_with(&prefix))
            .count()
    }

    pub fn has_link(&self, name: &str) -> bool {
        self.state.lock().unwrap().links.contains_key(name)
    }

    pub fn link_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().unwrap().links.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn link_mac(&self, name: &str) -> Option<MacAddr> {
        self.state.lock().unwrap().links.get(name).and_then(|link| link.mac)
    }

    pub fn addrs_of(&self, name: &str) -> Vec<IpSubnet> {
        self.state
            .lock()
            .unwrap()
            .addrs
            .get(name)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl NetHandler for MockNetHandler {
    async fn link_by_name(&self, name: &str) -> Result<Link> {
        self.record("link_by_name", name)?;
        self.state
            .lock()
            .unwrap()
            .links
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("link {} not found", name))
    }

    async fn link_add_bridge(&self, name: &str, mtu: Option<u16>) -> Result<()> {
        self.record("link_add_bridge", name)?;
        let mut state = self.state.lock().unwrap();
        // The kernel refuses to create a second link under the same name
        if state.links.contains_key(name) {
            bail!("link {} already exists", name);
        }
        let index = state.links.len() as u32 + 2;
        state.links.insert(
            name.to_string(),
            Link {
                name: name.to_string(),
                index,
                mtu: mtu.map(i64::from).unwrap_or(1500),
                mac: None,
            },
        );
        Ok(())
    }

    async fn link_add_dummy(&self, name: &str, mtu: u16) -> Result<()> {
        self.record("link_add_dummy", name)?;
        let mut state = self.state.lock().unwrap();
        if state.links.contains_key(name) {
            bail!("link {} already exists", name);
        }
        let index = state.links.len() as u32 + 2;
        state.links.insert(
            name.to_string(),
            Link {
                name: name.to_string(),
                index,
                mtu: i64::from(mtu),
                mac: None,
            },
        );
        Ok(())
    }

    async fn link_set_up(&self, name: &str) -> Result<()> {
        self.record("link_set_up", name)
    }

    async fn link_set_down(&self, name: &str) -> Result<()> {
        self.record("link_set_down", name)
    }

    async fn link_set_master(&self, name: &str, master: &str) -> Result<()> {
        self.record("link_set_master", format!("{} {}", name, master))
    }

    async fn link_set_learning_off(&self, name: &str) -> Result<()> {
        self.record("link_set_learning_off", name)
    }

    async fn addr_list(&self, name: &str, family: AddressFamily) -> Result<Vec<IpSubnet>> {
        self.record("addr_list", name)?;
        let addrs = self
            .state
            .lock()
            .unwrap()
            .addrs
            .get(name)
            .cloned()
            .unwrap_or_default();
        Ok(addrs
            .into_iter()
            .filter(|addr| match family {
                AddressFamily::V4 => !addr.is_ipv6(),
                AddressFamily::V6 => addr.is_ipv6(),
                AddressFamily::All => true,
            })
            .collect())
    }

    async fn addr_add(&self, name: &str, addr: &IpSubnet) -> Result<()> {
        self.record("addr_add", format!("{} {}", name, addr))?;
        self.state
            .lock()
            .unwrap()
            .addrs
            .entry(name.to_string())
            .or_default()
            .push(*addr);
        Ok(())
    }

    async fn addr_del(&self, name: &str, addr: &IpSubnet) -> Result<()> {
        self.record("addr_del", format!("{} {}", name, addr))?;
        if let Some(addrs) = self.state.lock().unwrap().addrs.get_mut(name) {
            addrs.retain(|existing| existing != addr);
        }
        Ok(())
    }

    async fn route_list(&self, name: &str, _family: AddressFamily) -> Result<Vec<RouteRecord>> {
        self.record("route_list", name)?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .routes
            .get(name)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_mac_details(&self, name: &str) -> Result<MacAddr> {
        self.record("get_mac_details", name)?;
        self.state
            .lock()
            .unwrap()
            .links
            .get(name)
            .and_then(|link| link.mac)
            .with_context(|| format!("link {} carries no mac", name))
    }

    async fn set_random_mac(&self, name: &str) -> Result<MacAddr> {
        self.record("set_random_mac", name)?;
        let mac = MacAddr::random();
        let mut state = self.state.lock().unwrap();
        let link = state
            .links
            .get_mut(name)
            .with_context(|| format!("link {} not found", name))?;
        link.mac = Some(mac);
        Ok(mac)
    }

    fn generate_random_mac(&self) -> MacAddr {
        self.calls
            .lock()
            .unwrap()
            .push("generate_random_mac".to_string());
        MacAddr::random()
    }

    async fn create_tap_device(
        &self,
        name: &str,
        queues: u32,
        launcher_pid: i32,
        mtu: u16,
    ) -> Result<()> {
        self.record(
            "create_tap_device",
            format!("{} queues {} pid {}", name, queues, launcher_pid),
        )?;
        let mut state = self.state.lock().unwrap();
        if state.links.contains_key(name) {
            bail!("link {} already exists", name);
        }
        let index = state.links.len() as u32 + 2;
        state.links.insert(
            name.to_string(),
            Link {
                name: name.to_string(),
                index,
                mtu: i64::from(mtu),
                mac: None,
            },
        );
        Ok(())
    }

    async fn bind_tap_device_to_bridge(&self, tap: &str, bridge: &str) -> Result<()> {
        self.record("bind_tap_device_to_bridge", format!("{} {}", tap, bridge))
    }

    async fn is_ipv6_enabled(&self, name: &str) -> Result<bool> {
        self.record("is_ipv6_enabled", name)?;
        Ok(self.state.lock().unwrap().ipv6_enabled)
    }

    async fn configure_ipv6_forwarding(&self) -> Result<()> {
        self.record("configure_ipv6_forwarding", "")
    }

    async fn is_ipv4_primary(&self) -> Result<bool> {
        self.record("is_ipv4_primary", "")?;
        Ok(self.state.lock().unwrap().ipv4_primary)
    }

    async fn has_nat_iptables(&self, family: NatFamily) -> bool {
        if self.record("has_nat_iptables", format!("{:?}", family)).is_err() {
            return false;
        }
        self.state.lock().unwrap().nat_iptables
    }

    async fn iptables_new_chain(&self, family: NatFamily, table: &str, chain: &str) -> Result<()> {
        self.record(
            "iptables_new_chain",
            format!("{:?} {} {}", family, table, chain),
        )
    }

    async fn iptables_append_rule(
        &self,
        family: NatFamily,
        table: &str,
        chain: &str,
        rule: &[&str],
    ) -> Result<()> {
        self.record(
            "iptables_append_rule",
            format!("{:?} {} {} {}", family, table, chain, rule.join(" ")),
        )
    }

    async fn nftables_load(&self, ruleset: &str) -> Result<()> {
        self.record("nftables_load", ruleset)?;
        if !self.state.lock().unwrap().nftables_load_ok {
            bail!("nftables ruleset {} unavailable", ruleset);
        }
        Ok(())
    }

    async fn nftables_new_chain(&self, family: NatFamily, table: &str, chain: &str) -> Result<()> {
        self.record(
            "nftables_new_chain",
            format!("{:?} {} {}", family, table, chain),
        )
    }

    async fn nftables_append_rule(
        &self,
        family: NatFamily,
        table: &str,
        chain: &str,
        rule: &[&str],
    ) -> Result<()> {
        self.record(
            "nftables_append_rule",
            format!("{:?} {} {} {}", family, table, chain, rule.join(" ")),
        )
    }

    fn nft_ip_string(&self, family: NatFamily) -> &'static str {
        match family {
            NatFamily::Ipv4 => "ip",
            NatFamily::Ipv6 => "ip6",
        }
    }

    async fn disable_tx_offload_checksum(&self, name: &str) -> Result<()> {
        self.record("disable_tx_offload_checksum", name)
    }

    fn host_and_gw_addresses_from_cidr(&self, cidr: &str) -> Result<(IpSubnet, IpSubnet)> {
        types::host_and_gw_addresses_from_cidr(cidr)
    }

    async fn start_dhcp(
        &self,
        _vif: &Vif,
        server_addr: IpAddr,
        bridge: &str,
        _options: Option<&DhcpOptions>,
    ) -> Result<()> {
        self.record("start_dhcp", format!("{} {}", bridge, server_addr))
    }
}
