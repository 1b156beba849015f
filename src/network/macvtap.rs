use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tracing::warn;

use crate::domain::{DomainInterface, DomainSpec, InterfaceTarget};
use crate::network::cache::CacheStore;
use crate::network::handler::NetHandler;
use crate::network::types::Vif;
use crate::network::{BindMechanism, NetworkContext};
use crate::vmi::InterfaceSpec;

/// The sandbox interface is already a macvtap created by the network plugin;
/// the guest consumes it directly. Nothing to reshape, no bridge, no NAT,
/// and the parent subnet provides DHCP.
pub struct MacvtapBinding {
    handler: Arc<dyn NetHandler>,
    cache: CacheStore,
    iface: InterfaceSpec,
    pod_interface_name: String,
    vif: Vif,
    virt_iface: DomainInterface,
}

impl MacvtapBinding {
    pub(crate) fn new(
        ctx: &NetworkContext,
        iface: &InterfaceSpec,
        pod_interface_name: &str,
        vif: Vif,
    ) -> Self {
        Self {
            handler: ctx.handler.clone(),
            cache: ctx.cache.clone(),
            iface: iface.clone(),
            pod_interface_name: pod_interface_name.to_string(),
            vif,
            virt_iface: DomainInterface::default(),
        }
    }
}

#[async_trait]
impl BindMechanism for MacvtapBinding {
    async fn discover_pod_network_interface(&mut self) -> Result<()> {
        let link = self
            .handler
            .link_by_name(&self.pod_interface_name)
            .await
            .with_context(|| format!("failed to get a link for {}", self.pod_interface_name))?;

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
        Ok(())
    }

    async fn prepare_pod_network_interfaces(
        &mut self,
        _queue_number: u32,
        _launcher_pid: i32,
    ) -> Result<()> {
        self.virt_iface = DomainInterface {
            mac: self.vif.mac,
            mtu: Some(self.vif.mtu),
            target: Some(InterfaceTarget::unmanaged(self.pod_interface_name.clone())),
            ..Default::default()
        };
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
            Some(vif) => {
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
        // The host subnet the macvtap multiplexes off already serves one
        Ok(())
    }
}
