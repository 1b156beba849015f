pub mod bridge;
pub mod cache;
pub mod handler;
pub mod macvtap;
pub mod masquerade;
pub mod nat;
pub mod slirp;
pub mod types;

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tracing::{error, info};

pub use cache::CacheStore;
pub use handler::{AddressFamily, Link, LinuxNetHandler, NatFamily, NetHandler};
pub use types::{IpSubnet, MacAddr, PodCacheInterface, RouteRecord, Vif};

use crate::domain::{self, DomainSpec};
use crate::network::bridge::BridgeBinding;
use crate::network::macvtap::MacvtapBinding;
use crate::network::masquerade::MasqueradeBinding;
use crate::network::slirp::SlirpBinding;
use crate::vmi::{BindingMethod, InterfaceSpec, NetworkSpec, VmiSpec};

/// Phase-1 failure after discovery: the kernel may hold partial state and
/// the sandbox is unusable until the pod is replaced.
#[derive(Debug, thiserror::Error)]
#[error("critical network error: {0}")]
pub struct CriticalNetworkError(pub String);

fn critical(err: anyhow::Error) -> anyhow::Error {
    anyhow::Error::new(CriticalNetworkError(format!("{:#}", err)))
}

/// Capabilities a plug phase needs from its embedder. Passed explicitly so
/// tests inject a mock handler without process-wide side effects.
#[derive(Clone)]
pub struct NetworkContext {
    pub handler: Arc<dyn NetHandler>,
    pub cache: CacheStore,
}

impl NetworkContext {
    pub fn new(handler: Arc<dyn NetHandler>, cache: CacheStore) -> Self {
        Self { handler, cache }
    }
}

impl Default for NetworkContext {
    fn default() -> Self {
        Self {
            handler: Arc::new(LinuxNetHandler),
            cache: CacheStore::default(),
        }
    }
}

/// One binding protocol's worth of behavior, shared by both plug phases.
///
/// Phase 1 calls discovery, preparation and the cache setters; phase 2 calls
/// the cache loaders, `decorate_config` and `start_dhcp`. Variants without
/// kernel or cached state implement the untouched methods as explicit no-ops
/// so behavior stays visible at the call site.
#[async_trait]
pub trait BindMechanism: Send {
    /// Snapshot the sandbox interface into the VIF. Never mutates the
    /// kernel.
    async fn discover_pod_network_interface(&mut self) -> Result<()>;

    /// Reshape the kernel for the guest and fill in the domain-interface
    /// skeleton. Ordering within each variant is strict.
    async fn prepare_pod_network_interfaces(
        &mut self,
        queue_number: u32,
        launcher_pid: i32,
    ) -> Result<()>;

    async fn load_cached_interface(&mut self, pid: &str, name: &str) -> Result<bool>;
    async fn set_cached_interface(&self, pid: &str, name: &str) -> Result<()>;

    // Phase 1 runs privileged and rewires the sandbox; by the time the
    // launcher executes phase 2 the plugin-configured routes and addresses
    // may be gone. The cached VIF carries the discovered state across.
    async fn load_cached_vif(&mut self, pid: &str, name: &str) -> Result<bool>;
    async fn set_cached_vif(&self, pid: &str, name: &str) -> Result<()>;

    /// Stamp MAC, MTU and target onto the matching domain interface.
    /// Phase 2 only.
    fn decorate_config(&self, domain: &mut DomainSpec) -> Result<()>;
    async fn start_dhcp(&self) -> Result<()>;
}

/// Parse an explicit spec MAC into the VIF so discovery skips reading the
/// kernel one. Only the kernel-touching variants carry a VIF; Slirp hands
/// its MAC string to the hypervisor untouched.
fn populate_mac_address(vif: &mut Vif, iface: &InterfaceSpec) -> Result<()> {
    if let Some(mac) = &iface.mac_address {
        vif.mac = Some(
            mac.parse()
                .with_context(|| format!("invalid MAC address on interface {}", iface.name))?,
        );
    }
    Ok(())
}

/// Pick the binding for an interface spec. Exactly one binding method must
/// be set; SR-IOV is handled by the callers before resolution.
fn resolve_binding(
    ctx: &NetworkContext,
    vmi: &VmiSpec,
    iface: &InterfaceSpec,
    network: &NetworkSpec,
    pod_interface_name: &str,
) -> Result<Box<dyn BindMechanism>> {
    match iface.binding {
        Some(BindingMethod::Bridge) => {
            let mut vif = Vif::new(pod_interface_name);
            populate_mac_address(&mut vif, iface)?;
            Ok(Box::new(BridgeBinding::new(
                ctx,
                vmi,
                iface,
                pod_interface_name,
                vif,
            )))
        }
        Some(BindingMethod::Masquerade) => {
            let mut vif = Vif::new(pod_interface_name);
            populate_mac_address(&mut vif, iface)?;
            Ok(Box::new(MasqueradeBinding::new(
                ctx,
                iface,
                network,
                pod_interface_name,
                vif,
            )))
        }
        Some(BindingMethod::Slirp) => Ok(Box::new(SlirpBinding::new(iface))),
        Some(BindingMethod::Macvtap) => {
            let mut vif = Vif::new(pod_interface_name);
            populate_mac_address(&mut vif, iface)?;
            Ok(Box::new(MacvtapBinding::new(
                ctx,
                iface,
                pod_interface_name,
                vif,
            )))
        }
        Some(BindingMethod::Sriov) | None => bail!("not implemented"),
    }
}

/// Privileged phase: discover the sandbox interface, reshape the kernel for
/// the chosen binding and persist the results for phase 2.
///
/// Safe to re-run: a completed interface short-circuits on its cache, and a
/// failed run writes no cache so the retry rediscovers from scratch.
pub async fn plug_phase1(
    ctx: &NetworkContext,
    vmi: &VmiSpec,
    iface: &InterfaceSpec,
    network: &NetworkSpec,
    pod_interface_name: &str,
    launcher_pid: i32,
) -> Result<()> {
    // Nothing to plug for SR-IOV: the device plugin hands the VF through
    if iface.binding == Some(BindingMethod::Sriov) {
        return Ok(());
    }

    let mut binding = resolve_binding(ctx, vmi, iface, network, pod_interface_name)?;

    let pid = launcher_pid.to_string();
    let cached = binding.load_cached_interface(&pid, &iface.name).await?;

    // The pod IPs go out as seen before any reshaping. Slirp never caches,
    // so it refreshes the status on every run.
    if !cached || iface.binding == Some(BindingMethod::Slirp) {
        set_pod_interface_cache(ctx, iface, pod_interface_name, &vmi.uid).await?;
    }

    if cached {
        return Ok(());
    }

    binding.discover_pod_network_interface().await?;

    let multiqueue = vmi.network_interface_multiqueue.unwrap_or(false);
    let queue_number = if multiqueue {
        domain::calculate_network_queues(vmi)
    } else {
        0
    };

    if let Err(err) = binding
        .prepare_pod_network_interfaces(queue_number, launcher_pid)
        .await
    {
        error!(iface = %pod_interface_name, "failed to prepare pod networking: {:#}", err);
        return Err(critical(err));
    }

    if let Err(err) = binding.set_cached_interface(&pid, &iface.name).await {
        error!(iface = %pod_interface_name, "failed to save interface configuration: {:#}", err);
        return Err(critical(err));
    }
    if let Err(err) = binding.set_cached_vif(&pid, &iface.name).await {
        error!(iface = %pod_interface_name, "failed to save vif configuration: {:#}", err);
        return Err(critical(err));
    }

    info!(iface = %pod_interface_name, "pod networking prepared");
    Ok(())
}

/// Launcher phase: reload what phase 1 persisted, decorate the domain and
/// make sure a DHCP server is running where the binding needs one.
///
/// Missing caches abort the phase: decorating a domain from zero-valued
/// state would boot an unreachable guest.
pub async fn plug_phase2(
    ctx: &NetworkContext,
    vmi: &VmiSpec,
    iface: &InterfaceSpec,
    network: &NetworkSpec,
    domain: &mut DomainSpec,
    pod_interface_name: &str,
) -> Result<()> {
    if iface.binding == Some(BindingMethod::Sriov) {
        return Ok(());
    }

    let mut binding = resolve_binding(ctx, vmi, iface, network, pod_interface_name)?;

    let pid = "self";
    if !binding
        .load_cached_interface(pid, &iface.name)
        .await
        .context("failed to load cached interface configuration")?
    {
        error!(iface = %pod_interface_name, "cached interface configuration doesn't exist");
        bail!(
            "cached interface configuration for {} doesn't exist",
            iface.name
        );
    }
    if !binding
        .load_cached_vif(pid, &iface.name)
        .await
        .context("failed to load cached vif configuration")?
    {
        error!(iface = %pod_interface_name, "cached vif configuration doesn't exist");
        bail!("cached vif configuration for {} doesn't exist", iface.name);
    }

    binding
        .decorate_config(domain)
        .context("failed to create domain configuration")?;

    // Without DHCP the guest boots without addresses; surfacing the error
    // lets the launcher restart instead of limping on
    if let Err(err) = ensure_dhcp(ctx, binding.as_ref(), pod_interface_name).await {
        error!(iface = %pod_interface_name, "failed to ensure dhcp service: {:#}", err);
        return Err(err);
    }
    Ok(())
}

/// Start the binding's DHCP server at most once per sandbox interface across
/// launcher restarts, gated by the on-disk sentinel.
async fn ensure_dhcp(
    ctx: &NetworkContext,
    binding: &dyn BindMechanism,
    pod_interface_name: &str,
) -> Result<()> {
    if ctx.cache.dhcp_started(pod_interface_name).await {
        return Ok(());
    }
    binding.start_dhcp().await.with_context(|| {
        format!(
            "failed to start DHCP server for interface {}",
            pod_interface_name
        )
    })?;
    ctx.cache.mark_dhcp_started(pod_interface_name).await
}

/// Record the sandbox addressing, ordered cluster-primary-family first, for
/// the interface status surfaced to users. Skipped entirely when the
/// interface holds no global-unicast address.
async fn set_pod_interface_cache(
    ctx: &NetworkContext,
    iface: &InterfaceSpec,
    pod_interface_name: &str,
    uid: &str,
) -> Result<()> {
    let (ipv4, ipv6) = read_ip_addresses_from_link(ctx, pod_interface_name).await?;

    let pod_ips = match (ipv4, ipv6) {
        (Some(ipv4), Some(ipv6)) => {
            if ctx.handler.is_ipv4_primary().await? {
                vec![ipv4, ipv6]
            } else {
                vec![ipv6, ipv4]
            }
        }
        (Some(ipv4), None) => vec![ipv4],
        (None, Some(ipv6)) => vec![ipv6],
        (None, None) => return Ok(()),
    };

    let cache = PodCacheInterface {
        iface: iface.clone(),
        pod_ip: pod_ips[0].clone(),
        pod_ips,
    };
    ctx.cache
        .write_pod_interface(uid, &iface.name, &cache)
        .await
        .context("failed to write pod interface to cache")
}

/// First global-unicast v4 and v6 addresses on the link, as strings.
async fn read_ip_addresses_from_link(
    ctx: &NetworkContext,
    pod_interface_name: &str,
) -> Result<(Option<String>, Option<String>)> {
    let addrs = ctx
        .handler
        .addr_list(pod_interface_name, AddressFamily::All)
        .await
        .with_context(|| format!("failed to get addresses for {}", pod_interface_name))?;

    let mut ipv4 = None;
    let mut ipv6 = None;
    for addr in addrs {
        if !types::is_global_unicast(&addr.ip) {
            continue;
        }
        if addr.ip.is_ipv6() {
            ipv6.get_or_insert_with(|| addr.ip.to_string());
        } else {
            ipv4.get_or_insert_with(|| addr.ip.to_string());
        }
    }
    Ok((ipv4, ipv6))
}
