use std::net::IpAddr;

use anyhow::Result;
use tracing::info;

use crate::network::handler::{NatFamily, NetHandler};
use crate::vmi::PortSpec;

/// Chain receiving inbound DNAT rules in the nat table.
pub const PREINBOUND_CHAIN: &str = "KUBEVIRT_PREINBOUND";
/// Chain receiving outbound SNAT rules in the nat table.
pub const POSTINBOUND_CHAIN: &str = "KUBEVIRT_POSTINBOUND";

/// One family's worth of masquerade NAT programming.
pub(crate) struct NatSpec<'a> {
    pub family: NatFamily,
    pub vm_ip: IpAddr,
    pub gateway_ip: IpAddr,
    pub pod_interface_name: &'a str,
    pub bridge_name: &'a str,
    pub ports: &'a [PortSpec],
}

/// Install the masquerade rule set for one protocol family, through
/// iptables when its nat machinery is present and nftables otherwise.
///
/// Rule order matters: the base MASQUERADE/jump rules come first, then one
/// SNAT/DNAT/OUTPUT triplet per declared port, or a single catch-all DNAT
/// when no ports are declared.
pub(crate) async fn create_nat_rules(handler: &dyn NetHandler, spec: &NatSpec<'_>) -> Result<()> {
    if handler.has_nat_iptables(spec.family).await {
        create_rules_using_iptables(handler, spec).await
    } else {
        create_rules_using_nftables(handler, spec).await
    }
}

async fn create_rules_using_iptables(handler: &dyn NetHandler, spec: &NatSpec<'_>) -> Result<()> {
    let family = spec.family;
    let vm_ip = spec.vm_ip.to_string();
    let gateway_ip = spec.gateway_ip.to_string();

    handler.iptables_new_chain(family, "nat", PREINBOUND_CHAIN).await?;
    handler.iptables_new_chain(family, "nat", POSTINBOUND_CHAIN).await?;

    handler
        .iptables_append_rule(family, "nat", "POSTROUTING", &["-s", &vm_ip, "-j", "MASQUERADE"])
        .await?;
    handler
        .iptables_append_rule(
            family,
            "nat",
            "PREROUTING",
            &["-i", spec.pod_interface_name, "-j", PREINBOUND_CHAIN],
        )
        .await?;
    handler
        .iptables_append_rule(
            family,
            "nat",
            "POSTROUTING",
            &["-o", spec.bridge_name, "-j", POSTINBOUND_CHAIN],
        )
        .await?;

    if spec.ports.is_empty() {
        handler
            .iptables_append_rule(
                family,
                "nat",
                PREINBOUND_CHAIN,
                &["-j", "DNAT", "--to-destination", &vm_ip],
            )
            .await?;
        info!(family = ?family, "installed catch-all inbound nat rules");
        return Ok(());
    }

    for port in spec.ports {
        let proto = port.protocol().to_string();
        let dport = port.port.to_string();

        handler
            .iptables_append_rule(
                family,
                "nat",
                POSTINBOUND_CHAIN,
                &[
                    "-p",
                    &proto,
                    "--dport",
                    &dport,
                    "--source",
                    family.loopback(),
                    "-j",
                    "SNAT",
                    "--to-source",
                    &gateway_ip,
                ],
            )
            .await?;

        handler
            .iptables_append_rule(
                family,
                "nat",
                PREINBOUND_CHAIN,
                &["-p", &proto, "--dport", &dport, "-j", "DNAT", "--to-destination", &vm_ip],
            )
            .await?;

        // Locally-originated traffic to the loopback address still reaches
        // the guest through its advertised address
        handler
            .iptables_append_rule(
                family,
                "nat",
                "OUTPUT",
                &[
                    "-p",
                    &proto,
                    "--dport",
                    &dport,
                    "--destination",
                    family.loopback(),
                    "-j",
                    "DNAT",
                    "--to-destination",
                    &vm_ip,
                ],
            )
            .await?;
    }

    info!(family = ?family, ports = spec.ports.len(), "installed port nat rules");
    Ok(())
}

async fn create_rules_using_nftables(handler: &dyn NetHandler, spec: &NatSpec<'_>) -> Result<()> {
    let family = spec.family;
    let ip_keyword = handler.nft_ip_string(family);
    let vm_ip = spec.vm_ip.to_string();
    let gateway_ip = spec.gateway_ip.to_string();

    handler.nftables_new_chain(family, "nat", PREINBOUND_CHAIN).await?;
    handler.nftables_new_chain(family, "nat", POSTINBOUND_CHAIN).await?;

    handler
        .nftables_append_rule(
            family,
            "nat",
            "postrouting",
            &[ip_keyword, "saddr", &vm_ip, "counter", "masquerade"],
        )
        .await?;
    handler
        .nftables_append_rule(
            family,
            "nat",
            "prerouting",
            &["iifname", spec.pod_interface_name, "counter", "jump", PREINBOUND_CHAIN],
        )
        .await?;
    handler
        .nftables_append_rule(
            family,
            "nat",
            "postrouting",
            &["oifname", spec.bridge_name, "counter", "jump", POSTINBOUND_CHAIN],
        )
        .await?;

    if spec.ports.is_empty() {
        handler
            .nftables_append_rule(
                family,
                "nat",
                PREINBOUND_CHAIN,
                &["counter", "dnat", "to", &vm_ip],
            )
            .await?;
        info!(family = ?family, "installed catch-all inbound nat rules");
        return Ok(());
    }

    for port in spec.ports {
        let proto = port.protocol().to_string();
        let dport = port.port.to_string();

        handler
            .nftables_append_rule(
                family,
                "nat",
                POSTINBOUND_CHAIN,
                &[
                    &proto,
                    "dport",
                    &dport,
                    ip_keyword,
                    "saddr",
                    family.loopback(),
                    "counter",
                    "snat",
                    "to",
                    &gateway_ip,
                ],
            )
            .await?;

        handler
            .nftables_append_rule(
                family,
                "nat",
                PREINBOUND_CHAIN,
                &[&proto, "dport", &dport, "counter", "dnat", "to", &vm_ip],
            )
            .await?;

        handler
            .nftables_append_rule(
                family,
                "nat",
                "output",
                &[
                    ip_keyword,
                    "daddr",
                    family.loopback(),
                    &proto,
                    "dport",
                    &dport,
                    "counter",
                    "dnat",
                    "to",
                    &vm_ip,
                ],
            )
            .await?;
    }

    info!(family = ?family, ports = spec.ports.len(), "installed port nat rules");
    Ok(())
}
