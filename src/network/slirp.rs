use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tracing::info;

use crate::domain::DomainSpec;
use crate::network::BindMechanism;
use crate::vmi::InterfaceSpec;

const DEFAULT_NIC_MODEL: &str = "virtio";

/// User-mode networking emulated by the hypervisor. No kernel plumbing:
/// the interface leaves the domain device list and reappears as hypervisor
/// command-line arguments; addressing comes from the emulator's own DHCP.
pub struct SlirpBinding {
    iface: InterfaceSpec,
}

impl SlirpBinding {
    pub(crate) fn new(iface: &InterfaceSpec) -> Self {
        Self {
            iface: iface.clone(),
        }
    }
}

#[async_trait]
impl BindMechanism for SlirpBinding {
    async fn discover_pod_network_interface(&mut self) -> Result<()> {
        Ok(())
    }

    async fn prepare_pod_network_interfaces(
        &mut self,
        _queue_number: u32,
        _launcher_pid: i32,
    ) -> Result<()> {
        Ok(())
    }

    // Slirp owns no kernel or cached state; reporting the caches as present
    // keeps the orchestrator control flow uniform across variants.
    async fn load_cached_interface(&mut self, _pid: &str, _name: &str) -> Result<bool> {
        Ok(true)
    }

    async fn set_cached_interface(&self, _pid: &str, _name: &str) -> Result<()> {
        Ok(())
    }

    async fn load_cached_vif(&mut self, _pid: &str, _name: &str) -> Result<bool> {
        Ok(true)
    }

    async fn set_cached_vif(&self, _pid: &str, _name: &str) -> Result<()> {
        Ok(())
    }

    fn decorate_config(&self, domain: &mut DomainSpec) -> Result<()> {
        let interfaces = &mut domain.devices.interfaces;
        let position = interfaces
            .iter()
            .position(|entry| entry.alias.as_deref() == Some(self.iface.name.as_str()))
            .ok_or_else(|| {
                anyhow!("failed to find interface {} in the domain spec", self.iface.name)
            })?;
        let removed = interfaces.remove(position);

        let model = removed
            .model
            .unwrap_or_else(|| DEFAULT_NIC_MODEL.to_string());
        let mut device_arg = format!(
            "{},netdev={},id={}",
            model, self.iface.name, self.iface.name
        );
        if let Some(mac) = &self.iface.mac_address {
            // Validated upstream; handed to the hypervisor as-is
            device_arg.push_str(&format!(",mac={}", mac));
        }

        domain.qemu_args.push("-device".to_string());
        domain.qemu_args.push(device_arg);

        info!(iface = %self.iface.name, "interface moved to user-mode networking");
        Ok(())
    }

    async fn start_dhcp(&self) -> Result<()> {
        // The emulator serves DHCP to the guest itself
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DomainDevices, DomainInterface};
    use crate::vmi::BindingMethod;

    fn domain_with(aliases: &[&str]) -> DomainSpec {
        DomainSpec {
            devices: DomainDevices {
                interfaces: aliases
                    .iter()
                    .map(|alias| DomainInterface {
                        alias: Some(alias.to_string()),
                        model: Some("virtio".to_string()),
                        ..Default::default()
                    })
                    .collect(),
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_decorate_moves_interface_to_qemu_args() {
        let mut iface = InterfaceSpec::new("net1", BindingMethod::Slirp);
        iface.mac_address = Some("02:00:00:00:00:aa".to_string());
        let binding = SlirpBinding::new(&iface);

        let mut domain = domain_with(&["default", "net1"]);
        binding.decorate_config(&mut domain).unwrap();

        assert_eq!(domain.devices.interfaces.len(), 1);
        assert_eq!(domain.devices.interfaces[0].alias.as_deref(), Some("default"));
        assert_eq!(
            domain.qemu_args,
            vec![
                "-device".to_string(),
                "virtio,netdev=net1,id=net1,mac=02:00:00:00:00:aa".to_string()
            ]
        );
    }

    #[test]
    fn test_decorate_without_mac_omits_the_suffix() {
        let iface = InterfaceSpec::new("net1", BindingMethod::Slirp);
        let binding = SlirpBinding::new(&iface);

        let mut domain = domain_with(&["net1"]);
        binding.decorate_config(&mut domain).unwrap();

        assert_eq!(domain.qemu_args[1], "virtio,netdev=net1,id=net1");
    }

    #[test]
    fn test_decorate_fails_without_a_matching_entry() {
        let iface = InterfaceSpec::new("net1", BindingMethod::Slirp);
        let binding = SlirpBinding::new(&iface);

        let mut domain = domain_with(&["other"]);
        assert!(binding.decorate_config(&mut domain).is_err());
    }
}
