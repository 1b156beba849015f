use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use tracing::{info, warn};

use crate::domain::{DomainInterface, DomainSpec, InterfaceTarget};
use crate::network::cache::CacheStore;
use crate::network::handler::{AddressFamily, NetHandler};
use crate::network::types::{filter_pod_network_routes, tap_device_name, IpSubnet, Vif};
use crate::network::{BindMechanism, NetworkContext};
use crate::vmi::{InterfaceSpec, VmiSpec};

/// Link-local address given to the in-sandbox bridge so the DHCP server has
/// a source address outside the pod CIDR. The interface's position in the VM
/// spec becomes part of the last octet.
pub(crate) fn fake_bridge_address(
    interfaces: &[InterfaceSpec],
    iface_name: &str,
) -> Result<IpSubnet> {
    let position = interfaces
        .iter()
        .position(|iface| iface.name == iface_name)
        .ok_or_else(|| {
            anyhow!(
                "failed to generate bridge fake address for interface {}",
                iface_name
            )
        })?;
    let octet: u8 = format!("1{}", position).parse().map_err(|_| {
        anyhow!(
            "interface {} at position {} does not fit the bridge fake address",
            iface_name,
            position
        )
    })?;
    Ok(IpSubnet::new(
        IpAddr::V4(Ipv4Addr::new(169, 254, 75, octet)),
        32,
    ))
}

/// Reparents the sandbox interface under an in-sandbox bridge and hands its
/// original L2/L3 identity to the guest.
///
/// The sandbox interface keeps carrying frames but under a randomized MAC,
/// so the guest can claim the original one; the addressing moves to the
/// guest via the internal DHCP server.
pub struct BridgeBinding {
    handler: Arc<dyn NetHandler>,
    cache: CacheStore,
    vmi: VmiSpec,
    iface: InterfaceSpec,
    pod_interface_name: String,
    bridge_name: String,
    vif: Vif,
    virt_iface: DomainInterface,
}

impl BridgeBinding {
    pub(crate) fn new(
        ctx: &NetworkContext,
        vmi: &VmiSpec,
        iface: &InterfaceSpec,
        pod_interface_name: &str,
        vif: Vif,
    ) -> Self {
        Self {
            handler: ctx.handler.clone(),
            cache: ctx.cache.clone(),
            vmi: vmi.clone(),
            iface: iface.clone(),
            pod_interface_name: pod_interface_name.to_string(),
            bridge_name: format!("k6t-{}", pod_interface_name),
            vif,
            virt_iface: DomainInterface::default(),
        }
    }

    async fn set_interface_routes(&mut self) -> Result<()> {
        let routes = self
            .handler
            .route_list(&self.pod_interface_name, AddressFamily::V4)
            .await?;
        let gateway = routes.first().and_then(|route| route.gw);
        if gateway.is_none() {
            bail!(
                "no gateway address found in routes for {}",
                self.pod_interface_name
            );
        }
        self.vif.gateway = gateway;
        if routes.len() > 1 {
            self.vif.routes = filter_pod_network_routes(&routes, &self.vif);
        }
        Ok(())
    }
}

#[async_trait]
impl BindMechanism for BridgeBinding {
    async fn discover_pod_network_interface(&mut self) -> Result<()> {
        let link = self
            .handler
            .link_by_name(&self.pod_interface_name)
            .await
            .with_context(|| format!("failed to get a link for {}", self.pod_interface_name))?;

        let addrs = self
            .handler
            .addr_list(&self.pod_interface_name, AddressFamily::V4)
            .await
            .with_context(|| format!("failed to get an ip address for {}", self.pod_interface_name))?;
        match addrs.first() {
            Some(addr) => {
                self.vif.ip = Some(*addr);
                self.vif.ipam_disabled = false;
            }
            None => self.vif.ipam_disabled = true,
        }

        if self.vif.mac.is_none() {
            let mac = self
                .handler
                .get_mac_details(&self.pod_interface_name)
                .await
                .with_context(|| format!("failed to get MAC for {}", self.pod_interface_name))?;
            self.vif.mac = Some(mac);
        }

        if link.mtu <= 0 || link.mtu > 65535 {
            bail!("MTU value out of range");
        }
        self.vif.mtu = link.mtu as u16;

        if !self.vif.ipam_disabled {
            self.set_interface_routes().await?;
        }
        Ok(())
    }

    async fn prepare_pod_network_interfaces(
        &mut self,
        queue_number: u32,
        launcher_pid: i32,
    ) -> Result<()> {
        // The link must be down while its MAC changes; bringing it back up
        // before the bridge exists keeps neighbor caches from going stale
        // under the old address.
        self.handler
            .link_set_down(&self.pod_interface_name)
            .await
            .with_context(|| format!("failed to bring link down for {}", self.pod_interface_name))?;
        self.handler.set_random_mac(&self.pod_interface_name).await?;
        self.handler
            .link_set_up(&self.pod_interface_name)
            .await
            .with_context(|| format!("failed to bring link up for {}", self.pod_interface_name))?;

        self.handler
            .link_add_bridge(&self.bridge_name, None)
            .await
            .with_context(|| format!("failed to create bridge {}", self.bridge_name))?;
        self.handler
            .link_set_master(&self.pod_interface_name, &self.bridge_name)
            .await
            .with_context(|| {
                format!(
                    "failed to connect {} to bridge {}",
                    self.pod_interface_name, self.bridge_name
                )
            })?;
        self.handler.link_set_up(&self.bridge_name).await?;

        let tap_device = tap_device_name(&self.pod_interface_name);
        self.handler
            .create_tap_device(&tap_device, queue_number, launcher_pid, self.vif.mtu)
            .await
            .with_context(|| format!("failed to create tap device named {}", tap_device))?;
        self.handler
            .bind_tap_device_to_bridge(&tap_device, &self.bridge_name)
            .await?;
        self.vif.tap_device = tap_device.clone();

        if !self.vif.ipam_disabled {
            // The guest claims this address; the sandbox side must stop
            // answering for it
            let ip = self
                .vif
                .ip
                .context("discovered interface lost its address")?;
            self.handler
                .addr_del(&self.pod_interface_name, &ip)
                .await
                .with_context(|| {
                    format!("failed to delete address for {}", self.pod_interface_name)
                })?;
        }

        self.handler
            .link_set_learning_off(&self.pod_interface_name)
            .await
            .with_context(|| {
                format!("failed to disable mac learning for {}", self.pod_interface_name)
            })?;

        let fake_addr = fake_bridge_address(&self.vmi.interfaces, &self.iface.name)?;
        self.handler.addr_add(&self.bridge_name, &fake_addr).await?;
        self.handler
            .disable_tx_offload_checksum(&self.bridge_name)
            .await
            .context("failed to disable TX offload checksum on bridge interface")?;

        self.virt_iface = DomainInterface {
            mac: self.vif.mac,
            mtu: Some(self.vif.mtu),
            target: Some(InterfaceTarget::unmanaged(tap_device)),
            ..Default::default()
        };

        info!(
            iface = %self.pod_interface_name,
            bridge = %self.bridge_name,
            tap = %self.vif.tap_device,
            "sandbox interface reparented under bridge"
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
        if self.vif.ipam_disabled {
            return Ok(());
        }
        let fake_addr = fake_bridge_address(&self.vmi.interfaces, &self.iface.name)?;
        info!(iface = %self.pod_interface_name, vif = ?self.vif, "starting dhcp for bridged interface");
        self.handler
            .start_dhcp(
                &self.vif,
                fake_addr.ip,
                &self.bridge_name,
                self.iface.dhcp_options.as_ref(),
            )
            .await
    }
}
