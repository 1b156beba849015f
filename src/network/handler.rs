use std::net::IpAddr;
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use crate::network::types::{self, IpSubnet, MacAddr, RouteRecord, Vif};
use crate::paths;
use crate::vmi::DhcpOptions;

/// Address family selector for address and route queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    V4,
    V6,
    All,
}

/// Protocol family for NAT programming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NatFamily {
    Ipv4,
    Ipv6,
}

impl NatFamily {
    /// Loopback address used by the port-keyed DNAT/SNAT rules.
    pub fn loopback(&self) -> &'static str {
        match self {
            NatFamily::Ipv4 => "127.0.0.1",
            NatFamily::Ipv6 => "::1",
        }
    }

    pub fn iptables_binary(&self) -> &'static str {
        match self {
            NatFamily::Ipv4 => "iptables",
            NatFamily::Ipv6 => "ip6tables",
        }
    }
}

/// Kernel link attributes the core consumes.
#[derive(Debug, Clone)]
pub struct Link {
    pub name: String,
    pub index: u32,
    pub mtu: i64,
    pub mac: Option<MacAddr>,
}

/// Thin capability surface over the kernel and firewall tooling.
///
/// Both plug phases consume this surface exclusively, so tests can swap in a
/// recording mock and the production implementation stays free of policy.
#[async_trait]
pub trait NetHandler: Send + Sync {
    async fn link_by_name(&self, name: &str) -> Result<Link>;
    async fn link_add_bridge(&self, name: &str, mtu: Option<u16>) -> Result<()>;
    async fn link_add_dummy(&self, name: &str, mtu: u16) -> Result<()>;
    async fn link_set_up(&self, name: &str) -> Result<()>;
    async fn link_set_down(&self, name: &str) -> Result<()>;
    async fn link_set_master(&self, name: &str, master: &str) -> Result<()>;
    /// Turn off bridge-port MAC learning for an enslaved interface.
    async fn link_set_learning_off(&self, name: &str) -> Result<()>;

    async fn addr_list(&self, name: &str, family: AddressFamily) -> Result<Vec<IpSubnet>>;
    async fn addr_add(&self, name: &str, addr: &IpSubnet) -> Result<()>;
    async fn addr_del(&self, name: &str, addr: &IpSubnet) -> Result<()>;
    async fn route_list(&self, name: &str, family: AddressFamily) -> Result<Vec<RouteRecord>>;

    async fn get_mac_details(&self, name: &str) -> Result<MacAddr>;
    /// Rewrite the interface MAC to a fresh locally-administered address and
    /// return it. The link must be down.
    async fn set_random_mac(&self, name: &str) -> Result<MacAddr>;
    fn generate_random_mac(&self) -> MacAddr;

    /// Create a tap device inside the network namespace of `launcher_pid`.
    /// The most privileged operation on this surface.
    async fn create_tap_device(
        &self,
        name: &str,
        queues: u32,
        launcher_pid: i32,
        mtu: u16,
    ) -> Result<()>;
    async fn bind_tap_device_to_bridge(&self, tap: &str, bridge: &str) -> Result<()>;

    async fn is_ipv6_enabled(&self, name: &str) -> Result<bool>;
    async fn configure_ipv6_forwarding(&self) -> Result<()>;
    /// Whether the cluster orders pod IPs v4-first.
    async fn is_ipv4_primary(&self) -> Result<bool>;

    async fn has_nat_iptables(&self, family: NatFamily) -> bool;
    async fn iptables_new_chain(&self, family: NatFamily, table: &str, chain: &str) -> Result<()>;
    async fn iptables_append_rule(
        &self,
        family: NatFamily,
        table: &str,
        chain: &str,
        rule: &[&str],
    ) -> Result<()>;
    async fn nftables_load(&self, ruleset: &str) -> Result<()>;
    async fn nftables_new_chain(&self, family: NatFamily, table: &str, chain: &str) -> Result<()>;
    async fn nftables_append_rule(
        &self,
        family: NatFamily,
        table: &str,
        chain: &str,
        rule: &[&str],
    ) -> Result<()>;
    /// Address-family keyword in nftables rule syntax.
    fn nft_ip_string(&self, family: NatFamily) -> &'static str;

    async fn disable_tx_offload_checksum(&self, name: &str) -> Result<()>;

    /// Split a CIDR into (gateway, vm) addresses.
    fn host_and_gw_addresses_from_cidr(&self, cidr: &str) -> Result<(IpSubnet, IpSubnet)>;

    /// Launch the out-of-process DHCP server advertising `vif` on `bridge`.
    /// Runs for the sandbox lifetime; failures before the exec are surfaced.
    async fn start_dhcp(
        &self,
        vif: &Vif,
        server_addr: IpAddr,
        bridge: &str,
        options: Option<&DhcpOptions>,
    ) -> Result<()>;
}

// `ip -json` output slices

#[derive(Deserialize)]
struct IpLinkEntry {
    ifindex: u32,
    ifname: String,
    mtu: i64,
    address: Option<String>,
}

#[derive(Deserialize)]
struct IpAddrEntry {
    #[serde(default)]
    addr_info: Vec<IpAddrInfo>,
}

#[derive(Deserialize)]
struct IpAddrInfo {
    family: String,
    local: IpAddr,
    prefixlen: u8,
}

#[derive(Deserialize)]
struct IpRouteEntry {
    dst: Option<String>,
    gateway: Option<IpAddr>,
    prefsrc: Option<IpAddr>,
}

/// Configuration handed to the DHCP server process on stdin.
#[derive(Serialize)]
struct DhcpServeConfig<'a> {
    interface: &'a str,
    server_addr: IpAddr,
    vif: &'a Vif,
    options: Option<&'a DhcpOptions>,
}

/// Production handler driving `ip`, `nsenter`, `sysctl`, `ethtool`,
/// `iptables`/`ip6tables` and `nft` as subprocesses.
#[derive(Debug, Default)]
pub struct LinuxNetHandler;

impl LinuxNetHandler {
    async fn run(program: &str, args: &[&str]) -> Result<String> {
        debug!(program = %program, ?args, "exec");
        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .with_context(|| format!("executing {}", program))?;

        if !output.status.success() {
            bail!(
                "{} {} failed: {}",
                program,
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn run_ip(args: &[&str]) -> Result<String> {
        Self::run("ip", args).await
    }

    /// Run an `ip` command inside the network namespace of `pid`.
    async fn run_ip_in_netns(pid: i32, args: &[&str]) -> Result<String> {
        let pid = pid.to_string();
        let mut full = vec!["-t", pid.as_str(), "-n", "--", "ip"];
        full.extend_from_slice(args);
        Self::run("nsenter", &full).await
    }

    fn family_flag(family: AddressFamily) -> Option<&'static str> {
        match family {
            AddressFamily::V4 => Some("-4"),
            AddressFamily::V6 => Some("-6"),
            AddressFamily::All => None,
        }
    }
}

#[async_trait]
impl NetHandler for LinuxNetHandler {
    async fn link_by_name(&self, name: &str) -> Result<Link> {
        let stdout = Self::run_ip(&["-j", "link", "show", "dev", name])
            .await
            .with_context(|| format!("failed to get a link for interface {}", name))?;
        let mut entries: Vec<IpLinkEntry> =
            serde_json::from_str(&stdout).context("parsing ip link output")?;
        let entry = match entries.pop() {
            Some(entry) => entry,
            None => bail!("link {} not found", name),
        };
        let mac = match entry.address {
            Some(address) => Some(address.parse()?),
            None => None,
        };
        Ok(Link {
            name: entry.ifname,
            index: entry.ifindex,
            mtu: entry.mtu,
            mac,
        })
    }

    async fn link_add_bridge(&self, name: &str, mtu: Option<u16>) -> Result<()> {
        let mtu = mtu.map(|mtu| mtu.to_string());
        let mut args = vec!["link", "add", name];
        if let Some(mtu) = &mtu {
            args.extend_from_slice(&["mtu", mtu]);
        }
        args.extend_from_slice(&["type", "bridge"]);
        Self::run_ip(&args).await?;
        Ok(())
    }

    async fn link_add_dummy(&self, name: &str, mtu: u16) -> Result<()> {
        let mtu = mtu.to_string();
        Self::run_ip(&["link", "add", name, "mtu", &mtu, "type", "dummy"]).await?;
        Ok(())
    }

    async fn link_set_up(&self, name: &str) -> Result<()> {
        Self::run_ip(&["link", "set", name, "up"]).await?;
        Ok(())
    }

    async fn link_set_down(&self, name: &str) -> Result<()> {
        Self::run_ip(&["link", "set", name, "down"]).await?;
        Ok(())
    }

    async fn link_set_master(&self, name: &str, master: &str) -> Result<()> {
        Self::run_ip(&["link", "set", name, "master", master]).await?;
        Ok(())
    }

    async fn link_set_learning_off(&self, name: &str) -> Result<()> {
        Self::run_ip(&["link", "set", name, "type", "bridge_slave", "learning", "off"]).await?;
        Ok(())
    }

    async fn addr_list(&self, name: &str, family: AddressFamily) -> Result<Vec<IpSubnet>> {
        let mut args = vec!["-j"];
        args.extend(Self::family_flag(family));
        args.extend_from_slice(&["addr", "show", "dev", name]);
        let stdout = Self::run_ip(&args)
            .await
            .with_context(|| format!("failed to get addresses for interface {}", name))?;
        let entries: Vec<IpAddrEntry> =
            serde_json::from_str(&stdout).context("parsing ip addr output")?;

        let addrs = entries
            .into_iter()
            .flat_map(|entry| entry.addr_info)
            .filter(|info| match family {
                AddressFamily::V4 => info.family == "inet",
                AddressFamily::V6 => info.family == "inet6",
                AddressFamily::All => info.family == "inet" || info.family == "inet6",
            })
            .map(|info| IpSubnet::new(info.local, info.prefixlen))
            .collect();
        Ok(addrs)
    }

    async fn addr_add(&self, name: &str, addr: &IpSubnet) -> Result<()> {
        let addr = addr.to_string();
        Self::run_ip(&["addr", "add", &addr, "dev", name]).await?;
        Ok(())
    }

    async fn addr_del(&self, name: &str, addr: &IpSubnet) -> Result<()> {
        let addr = addr.to_string();
        Self::run_ip(&["addr", "del", &addr, "dev", name]).await?;
        Ok(())
    }

    async fn route_list(&self, name: &str, family: AddressFamily) -> Result<Vec<RouteRecord>> {
        let mut args = vec!["-j"];
        args.extend(Self::family_flag(family));
        args.extend_from_slice(&["route", "show", "dev", name]);
        let stdout = Self::run_ip(&args)
            .await
            .with_context(|| format!("failed to get routes for interface {}", name))?;
        let entries: Vec<IpRouteEntry> =
            serde_json::from_str(&stdout).context("parsing ip route output")?;

        let mut routes = Vec::with_capacity(entries.len());
        for entry in entries {
            let dst = match entry.dst.as_deref() {
                None | Some("default") => None,
                Some(dst) => Some(dst.parse()?),
            };
            routes.push(RouteRecord {
                dst,
                src: entry.prefsrc,
                gw: entry.gateway,
            });
        }
        Ok(routes)
    }

    async fn get_mac_details(&self, name: &str) -> Result<MacAddr> {
        let link = self.link_by_name(name).await?;
        link.mac
            .with_context(|| format!("interface {} carries no hardware address", name))
    }

    async fn set_random_mac(&self, name: &str) -> Result<MacAddr> {
        let mac = MacAddr::random();
        let addr = mac.to_string();
        Self::run_ip(&["link", "set", "dev", name, "address", &addr]).await?;
        Ok(mac)
    }

    fn generate_random_mac(&self) -> MacAddr {
        MacAddr::random()
    }

    async fn create_tap_device(
        &self,
        name: &str,
        queues: u32,
        launcher_pid: i32,
        mtu: u16,
    ) -> Result<()> {
        let mut args = vec!["tuntap", "add", "dev", name, "mode", "tap"];
        if queues > 0 {
            args.push("multi_queue");
        }
        Self::run_ip_in_netns(launcher_pid, &args).await?;

        let mtu = mtu.to_string();
        Self::run_ip_in_netns(launcher_pid, &["link", "set", name, "mtu", &mtu]).await?;
        Self::run_ip_in_netns(launcher_pid, &["link", "set", name, "up"]).await?;

        info!(tap = %name, pid = launcher_pid, queues, "created tap device in launcher netns");
        Ok(())
    }

    async fn bind_tap_device_to_bridge(&self, tap: &str, bridge: &str) -> Result<()> {
        Self::run_ip(&["link", "set", tap, "master", bridge]).await?;
        Self::run_ip(&["link", "set", tap, "up"]).await?;
        Ok(())
    }

    async fn is_ipv6_enabled(&self, name: &str) -> Result<bool> {
        let path = format!("/proc/sys/net/ipv6/conf/{}/disable_ipv6", name);
        match tokio::fs::read_to_string(&path).await {
            Ok(value) => Ok(value.trim() == "0"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err).with_context(|| format!("reading {}", path)),
        }
    }

    async fn configure_ipv6_forwarding(&self) -> Result<()> {
        Self::run("sysctl", &["-w", "net.ipv6.conf.all.forwarding=1"]).await?;
        Ok(())
    }

    async fn is_ipv4_primary(&self) -> Result<bool> {
        let pod_ip = std::env::var("MY_POD_IP").context("MY_POD_IP is not set")?;
        let ip: IpAddr = pod_ip
            .parse()
            .with_context(|| format!("invalid MY_POD_IP {}", pod_ip))?;
        Ok(ip.is_ipv4())
    }

    async fn has_nat_iptables(&self, family: NatFamily) -> bool {
        match Self::run(family.iptables_binary(), &["-t", "nat", "-L", "-n"]).await {
            Ok(_) => true,
            Err(err) => {
                debug!(?family, "nat iptables unavailable: {:#}", err);
                false
            }
        }
    }

    async fn iptables_new_chain(&self, family: NatFamily, table: &str, chain: &str) -> Result<()> {
        Self::run(family.iptables_binary(), &["-t", table, "-N", chain]).await?;
        Ok(())
    }

    async fn iptables_append_rule(
        &self,
        family: NatFamily,
        table: &str,
        chain: &str,
        rule: &[&str],
    ) -> Result<()> {
        let mut args = vec!["-t", table, "-A", chain];
        args.extend_from_slice(rule);
        Self::run(family.iptables_binary(), &args).await?;
        Ok(())
    }

    async fn nftables_load(&self, ruleset: &str) -> Result<()> {
        let path = format!("/etc/nftables/{}.nft", ruleset);
        Self::run("nft", &["-f", &path]).await?;
        Ok(())
    }

    async fn nftables_new_chain(&self, family: NatFamily, table: &str, chain: &str) -> Result<()> {
        Self::run(
            "nft",
            &["add", "chain", self.nft_ip_string(family), table, chain],
        )
        .await?;
        Ok(())
    }

    async fn nftables_append_rule(
        &self,
        family: NatFamily,
        table: &str,
        chain: &str,
        rule: &[&str],
    ) -> Result<()> {
        let mut args = vec!["add", "rule", self.nft_ip_string(family), table, chain];
        args.extend_from_slice(rule);
        Self::run("nft", &args).await?;
        Ok(())
    }

    fn nft_ip_string(&self, family: NatFamily) -> &'static str {
        match family {
            NatFamily::Ipv4 => "ip",
            NatFamily::Ipv6 => "ip6",
        }
    }

    async fn disable_tx_offload_checksum(&self, name: &str) -> Result<()> {
        Self::run("ethtool", &["-K", name, "tx", "off"]).await?;
        Ok(())
    }

    fn host_and_gw_addresses_from_cidr(&self, cidr: &str) -> Result<(IpSubnet, IpSubnet)> {
        types::host_and_gw_addresses_from_cidr(cidr)
    }

    async fn start_dhcp(
        &self,
        vif: &Vif,
        server_addr: IpAddr,
        bridge: &str,
        options: Option<&DhcpOptions>,
    ) -> Result<()> {
        let config = DhcpServeConfig {
            interface: bridge,
            server_addr,
            vif,
            options,
        };
        let payload = serde_json::to_vec(&config).context("serializing dhcp configuration")?;

        let binary = paths::dhcp_server_binary();
        let mut child = Command::new(&binary)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("failed to spawn dhcp server {}", binary.display()))?;

        let mut stdin = child
            .stdin
            .take()
            .context("dhcp server stdin not captured")?;
        stdin
            .write_all(&payload)
            .await
            .context("handing configuration to dhcp server")?;
        drop(stdin);

        // The server stays up for the sandbox lifetime; it is not awaited.
        info!(bridge = %bridge, server = %server_addr, "dhcp server started");
        Ok(())
    }
}
