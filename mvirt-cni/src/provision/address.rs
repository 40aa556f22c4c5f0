//! Addresses and routes on both sides of the pair.
//!
//! Inside the container every family gets a default route through the host
//! end: IPv4 via a synthetic link-local next hop answered by proxy ARP, IPv6
//! via the host end's own link-local address. On the host, each allocation
//! gets a directly connected route through the host end.

use super::link::VethPair;
use crate::config::{Allocation, IpFamily};
use crate::error::{ProvisionError, Result};
use crate::kernel::{Link, Namespace, Netlink, Route};
use crate::ledger::{Ledger, Resource};
use ipnet::{IpNet, Ipv4Net};
use std::net::{IpAddr, Ipv4Addr};
use tracing::{debug, info};

/// Next hop for IPv4 default routes inside the container.
pub const IPV4_NEXT_HOP: Ipv4Addr = Ipv4Addr::new(169, 254, 1, 1);

/// Address families seen while configuring the container side.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Families {
    pub ipv4: bool,
    pub ipv6: bool,
}

/// Install routes and addresses in the container namespace.
pub async fn configure_container<N: Netlink + ?Sized>(
    netlink: &N,
    netns: &Namespace,
    pair: &VethPair,
    ips: &[Allocation],
    ledger: &mut Ledger,
) -> Result<Families> {
    let mut families = Families::default();
    let ifname = pair.container.name.as_str();

    for ip in ips {
        match ip.family() {
            IpFamily::V4 => {
                if !families.ipv4 {
                    add_ipv4_default(netlink, netns, &pair.container, ledger).await?;
                }
                families.ipv4 = true;
            }
            IpFamily::V6 => {
                if !families.ipv6 {
                    add_ipv6_default(netlink, netns, pair, ledger).await?;
                }
                families.ipv6 = true;
            }
        }

        netlink
            .add_address(pair.container.index, ip.address)
            .await
            .map_err(ProvisionError::address(ifname))?;
        ledger.record(Resource::Address {
            link: ifname.to_string(),
            address: ip.address,
            netns: netns.clone(),
        });
        info!(ifname, address = %ip.address, "Address assigned");
    }

    Ok(families)
}

async fn add_ipv4_default<N: Netlink + ?Sized>(
    netlink: &N,
    netns: &Namespace,
    container: &Link,
    ledger: &mut Ledger,
) -> Result<()> {
    // Connected route to the next hop first, otherwise the gateway is unreachable.
    let next_hop = IpNet::V4(Ipv4Net::from(IPV4_NEXT_HOP));
    add_route(
        netlink,
        netns,
        container,
        Route::link_scope(next_hop, container.index),
        ledger,
    )
    .await?;
    add_route(
        netlink,
        netns,
        container,
        Route::default_via(IpAddr::V4(IPV4_NEXT_HOP), container.index),
        ledger,
    )
    .await
}

async fn add_ipv6_default<N: Netlink + ?Sized>(
    netlink: &N,
    netns: &Namespace,
    pair: &VethPair,
    ledger: &mut Ledger,
) -> Result<()> {
    let host_addresses = netlink
        .addresses(pair.host.index, IpFamily::V6)
        .await
        .map_err(ProvisionError::address(&pair.host.name))?;

    // No IPv6 on the host end means the host cannot route the allocation.
    let Some(next_hop) = host_addresses.first().copied() else {
        return Err(ProvisionError::CapabilityFailure {
            ifname: pair.host.name.clone(),
        });
    };
    debug!(next_hop = %next_hop, "Using host end address as IPv6 next hop");

    add_route(
        netlink,
        netns,
        &pair.container,
        Route::default_via(next_hop, pair.container.index),
        ledger,
    )
    .await
}

async fn add_route<N: Netlink + ?Sized>(
    netlink: &N,
    netns: &Namespace,
    link: &Link,
    route: Route,
    ledger: &mut Ledger,
) -> Result<()> {
    netlink
        .add_route(&route)
        .await
        .map_err(ProvisionError::address(&link.name))?;
    ledger.record(Resource::Route {
        link: link.name.clone(),
        destination: route.destination,
        netns: netns.clone(),
    });
    debug!(
        ifname = %link.name,
        destination = %route.destination,
        gateway = ?route.gateway,
        "Route added"
    );
    Ok(())
}

/// One connected route per allocation on the host end, in the host namespace.
pub async fn install_host_routes<N: Netlink + ?Sized>(
    netlink: &N,
    host: &Link,
    ips: &[Allocation],
    ledger: &mut Ledger,
) -> Result<()> {
    for ip in ips {
        let route = Route::link_scope(ip.address.trunc(), host.index);
        add_route(netlink, &Namespace::Host, host, route, ledger).await?;
    }
    Ok(())
}
