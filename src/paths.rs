use std::path::PathBuf;
use std::sync::OnceLock;

/// Root directory for all cross-phase state (interface/VIF caches, pod-IP
/// status, DHCP sentinels).
/// Defaults to `/var/run/kubevirt-private` but can be overridden with
/// `VMNET_CACHE_DIR`.
pub fn cache_root() -> PathBuf {
    static CACHE_ROOT: OnceLock<PathBuf> = OnceLock::new();

    CACHE_ROOT
        .get_or_init(|| {
            let default = "/var/run/kubevirt-private".to_string();
            let configured = std::env::var("VMNET_CACHE_DIR").unwrap_or(default);
            PathBuf::from(shellexpand::tilde(&configured).as_ref())
        })
        .clone()
}

/// DHCP server binary spawned for interfaces that advertise addressing to
/// the guest. Overridable with `VMNET_DHCP_SERVER`.
pub fn dhcp_server_binary() -> PathBuf {
    static DHCP_SERVER: OnceLock<PathBuf> = OnceLock::new();

    DHCP_SERVER
        .get_or_init(|| {
            let default = "vmnet-dhcpd".to_string();
            let configured = std::env::var("VMNET_DHCP_SERVER").unwrap_or(default);
            PathBuf::from(shellexpand::tilde(&configured).as_ref())
        })
        .clone()
}
