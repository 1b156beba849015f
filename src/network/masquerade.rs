use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tracing::{info, warn};

use crate::domain::{DomainInterface, DomainSpec, InterfaceTarget};
use crate::network::cache::CacheStore;
use crate::network::handler::{NatFamily, NetHandler};
use crate::network::nat::{self, NatSpec};
use crate::network::types::{tap_device_name, IpSubnet, Vif};
use crate::network::{BindMechanism, NetworkContext};
use crate::vmi::{InterfaceSpec, NetworkSpec};

/// Guest CIDR used when the network spec leaves it unset.
pub const DEFAULT_VM_CIDR: &str = "10.0.2.0/24";
pub const DEFAULT_VM_IPV6_CIDR: &str = "fd10:0:2::/120";

/// Gives the guest a stable per-sandbox CIDR behind a dummy-backed bridge
/// and NATs its traffic to and from the sandbox interface.
pub struct MasqueradeBinding {
    handler: Arc<dyn NetHandler>,
    cache: CacheStore,
    iface: InterfaceSpec,
    pod_interface_name: String,
    bridge_name: String,
    vm_network_cidr: String,
    vm_ipv6_network_cidr: String,
    vif: Vif,
    virt_iface: DomainInterface,
    gateway_addr: Option<IpSubnet>,
    gateway_ipv6_addr: Option<IpSubnet>,
}

impl MasqueradeBinding {
    pub(crate) fn new(
        ctx: &NetworkContext,
        iface: &InterfaceSpec,
        network: &NetworkSpec,
        pod_interface_name: &str,
        vif: Vif,
    ) -> Self {
        Self {
            handler: ctx.handler.clone(),
            cache: ctx.cache.clone(),
            iface: iface.clone(),
            pod_interface_name: pod_interface_name.to_string(),
            bridge_name: format!("k6t-{}", pod_interface_name),
            vm_network_cidr: network
                .vm_network_cidr
                .clone()
                .unwrap_or_else(|| DEFAULT_VM_CIDR.to_string()),
            vm_ipv6_network_cidr: network
                .vm_ipv6_network_cidr
                .clone()
                .unwrap_or_else(|| DEFAULT_VM_IPV6_CIDR.to_string()),
            vif,
            virt_iface: DomainInterface::default(),
            gateway_addr: None,
            gateway_ipv6_addr: None,
        }
    }

    fn configure_v4_addresses(&mut self) -> Result<()> {
        let (gateway, vm) = self
            .handler
            .host_and_gw_addresses_from_cidr(&self.vm_network_cidr)
            .with_context(|| {
                format!(
                    "failed to get gw and vm available addresses from CIDR {}",
                    self.vm_network_cidr
                )
            })?;
        self.vif.gateway = Some(gateway.ip);
        self.gateway_addr = Some(gateway);
        self.vif.ip = Some(vm);
        Ok(())
    }

    fn configure_v6_addresses(&mut self) -> Result<()> {
        let (gateway, vm) = self
            .handler
            .host_and_gw_addresses_from_cidr(&self.vm_ipv6_network_cidr)
            .with_context(|| {
                format!(
                    "failed to get gw and vm available ipv6 addresses from CIDR {}",
                    self.vm_ipv6_network_cidr
                )
            })?;
        self.vif.gateway_ipv6 = Some(gateway.ip);
        self.gateway_ipv6_addr = Some(gateway);
        self.vif.ipv6 = Some(vm);
        Ok(())
    }

    /// Install one family's NAT rule set, preferring iptables and falling
    /// back to loading the bundled nftables ruleset.
    async fn create_nat_rules(&self, family: NatFamily) -> Result<()> {
        let (vm_ip, gateway_ip) = match family {
            NatFamily::Ipv4 => (
                self.vif.ip.context("masquerade vif lost its address")?.ip,
                self.gateway_addr.context("masquerade gateway not configured")?.ip,
            ),
            NatFamily::Ipv6 => (
                self.vif.ipv6.context("masquerade vif lost its ipv6 address")?.ip,
                self.gateway_ipv6_addr
                    .context("masquerade ipv6 gateway not configured")?
                    .ip,
            ),
        };
        let spec = NatSpec {
            family,
            vm_ip,
            gateway_ip,
            pod_interface_name: &self.pod_interface_name,
            bridge_name: &self.bridge_name,
            ports: &self.iface.ports,
        };
        nat::create_nat_rules(self.handler.as_ref(), &spec).await
    }
}

#[async_trait]
impl BindMechanism for MasqueradeBinding {
    async fn discover_pod_network_interface(&mut self) -> Result<()> {
        let link = self
            .handler
            .link_by_name(&self.pod_interface_name)
            .await
            .with_context(|| format!("failed to get a link for {}", self.pod_interface_name))?;

        if link.mtu <= 0 || link.mtu > 65535 {
            bail!("MTU value out of range");
        }
        self.vif.mtu = link.mtu as u16;

        self.configure_v4_addresses()?;

        let ipv6_enabled = self
            .handler
            .is_ipv6_enabled(&self.pod_interface_name)
            .await
            .with_context(|| {
                format!(
                    "failed to verify whether ipv6 is configured on {}",
                    self.pod_interface_name
                )
            })?;
        if ipv6_enabled {
            self.configure_v6_addresses()?;
        }
        Ok(())
    }

    async fn prepare_pod_network_interfaces(
        &mut self,
        queue_number: u32,
        launcher_pid: i32,
    ) -> Result<()> {
        // Dummy uplink keeps the bridge's own MAC stable
        let nic_name = format!("{}-nic", self.bridge_name);
        self.handler
            .link_add_dummy(&nic_name, self.vif.mtu)
            .await
            .with_context(|| format!("failed to create interface {}", nic_name))?;
        self.handler.link_set_up(&nic_name).await?;

        if self.iface.mac_address.is_none() {
            self.vif.mac = Some(self.handler.generate_random_mac());
        }

        self.handler
            .link_add_bridge(&self.bridge_name, Some(self.vif.mtu))
            .await
            .with_context(|| format!("failed to create bridge {}", self.bridge_name))?;
        self.handler.link_set_master(&nic_name, &self.bridge_name).await?;
        self.handler.link_set_up(&self.bridge_name).await?;

        let gateway = self.gateway_addr.context("masquerade gateway not configured")?;
        self.handler
            .addr_add(&self.bridge_name, &gateway)
            .await
            .context("failed to set bridge IP")?;

        let ipv6_enabled = self
            .handler
            .is_ipv6_enabled(&self.pod_interface_name)
            .await?;
        if ipv6_enabled {
            let gateway_ipv6 = self
                .gateway_ipv6_addr
                .context("masquerade ipv6 gateway not configured")?;
            self.handler
                .addr_add(&self.bridge_name, &gateway_ipv6)
                .await
                .context("failed to set bridge IPv6")?;
        }

        self.handler
            .disable_tx_offload_checksum(&self.bridge_name)
            .await
            .context("failed to disable TX offload checksum on bridge interface")?;

        let tap_device = tap_device_name(&self.pod_interface_name);
        self.handler
            .create_tap_device(&tap_device, queue_number, launcher_pid, self.vif.mtu)
            .await
            .with_context(|| format!("failed to create tap device named {}", tap_device))?;
        self.handler
            .bind_tap_device_to_bridge(&tap_device, &self.bridge_name)
            .await?;
        self.vif.tap_device = tap_device.clone();

        if self.handler.has_nat_iptables(NatFamily::Ipv4).await
            || self.handler.nftables_load("ipv4-nat").await.is_ok()
        {
            self.create_nat_rules(NatFamily::Ipv4)
                .await
                .context("failed to create ipv4 nat rules")?;
        } else {
            bail!("couldn't configure ipv4 nat rules");
        }

        if ipv6_enabled {
            if self.handler.has_nat_iptables(NatFamily::Ipv6).await
                || self.handler.nftables_load("ipv6-nat").await.is_ok()
            {
                self.handler
                    .configure_ipv6_forwarding()
                    .await
                    .context("failed to configure ipv6 forwarding")?;
                self.create_nat_rules(NatFamily::Ipv6)
                    .await
                    .context("failed to create ipv6 nat rules")?;
            } else {
                bail!("couldn't configure ipv6 nat rules");
            }
        }

        self.virt_iface = DomainInterface {
            mac: self.vif.mac,
            mtu: Some(self.vif.mtu),
            target: Some(InterfaceTarget::unmanaged(tap_device)),
            ..Default::default()
        };

        info!(
            iface = %self.pod_interface_name,
            bridge = %self.bridge_name,
            vm_ip = ?self.vif.ip,
            "masquerade networking configured"
        );
        Ok(())
    }

    async fn load_cached_interface(&mut self, pid: &str, name: &str) -> Result<bool> {
        match self.cache.read_interface(pid, name).await? {
            Some(iface) => {
                self.virt_iface = iface;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn set_cached_interface(&self, pid: &str, name: &str) -> Result<()> {
        self.cache.write_interface(pid, name, &self.virt_iface).await
    }

    async fn load_cached_vif(&mut self, pid: &str, name: &str) -> Result<bool> {
        match self.cache.read_vif(pid, name).await? {
            Some(mut vif) => {
                vif.canonicalize();
                self.vif = vif;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn set_cached_vif(&self, pid: &str, name: &str) -> Result<()> {
        self.cache.write_vif(pid, name, &self.vif).await
    }

    fn decorate_config(&self, domain: &mut DomainSpec) -> Result<()> {
        for entry in domain.devices.interfaces.iter_mut() {
            if entry.alias.as_deref() == Some(self.iface.name.as_str()) {
                entry.mtu = self.virt_iface.mtu;
                entry.mac = self.vif.mac;
                entry.target = self.virt_iface.target.clone();
                return Ok(());
            }
        }
        warn!(iface = %self.iface.name, "no matching interface in the domain spec");
        Ok(())
    }

    async fn start_dhcp(&self) -> Result<()> {
        let gateway = self
            .vif
            .gateway
            .context("masquerade vif carries no gateway")?;
        self.handler
            .start_dhcp(
                &self.vif,
                gateway,
                &self.bridge_name,
                self.iface.dhcp_options.as_ref(),
            )
            .await
    }
}
