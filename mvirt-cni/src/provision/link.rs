//! Veth pair creation and the namespace move of its host end.

use crate::error::{ProvisionError, Result};
use crate::kernel::{Link, Namespace, Netlink, VethSpec};
use crate::ledger::{Ledger, Resource};
use tracing::{debug, info};

/// Transmit queue length for every link this crate creates.
pub const TX_QUEUE_LEN: u32 = 1000;

/// Both ends of a freshly created pair, still in the container namespace.
#[derive(Debug, Clone)]
pub struct VethPair {
    pub container: Link,
    pub host: Link,
}

/// Delete whatever link currently holds `ifname` in this namespace.
pub async fn remove_stale<N: Netlink + ?Sized>(netlink: &N, ifname: &str) -> Result<()> {
    let Some(stale) = netlink
        .link_by_name(ifname)
        .await
        .map_err(ProvisionError::lookup(ifname))?
    else {
        return Ok(());
    };
    netlink
        .delete_link(stale.index)
        .await
        .map_err(ProvisionError::creation("replacement for stale link", ifname))?;
    info!(ifname, index = stale.index, "Removed stale link");
    Ok(())
}

/// Create the pair inside the container namespace and bring the host end up.
pub async fn create_pair<N: Netlink + ?Sized>(
    netlink: &N,
    netns: &Namespace,
    container_ifname: &str,
    host_ifname: &str,
    mtu: u32,
    ledger: &mut Ledger,
) -> Result<VethPair> {
    let spec = VethSpec {
        name: container_ifname.to_string(),
        peer: host_ifname.to_string(),
        mtu,
        txqueuelen: TX_QUEUE_LEN,
        up: true,
    };
    netlink
        .add_veth(&spec)
        .await
        .map_err(ProvisionError::creation("veth pair", host_ifname))?;
    ledger.record(Resource::VethPair {
        container: container_ifname.to_string(),
        host: host_ifname.to_string(),
        netns: netns.clone(),
    });
    info!(container = container_ifname, host = host_ifname, mtu, "Created veth pair");

    let host = lookup(netlink, host_ifname).await?;

    // The up flag at creation is not honoured by every kernel.
    // Without it the host end never gets an IPv6 link-local address.
    netlink
        .set_link_up(host.index)
        .await
        .map_err(ProvisionError::creation("link state", host_ifname))?;

    let container = lookup(netlink, container_ifname).await?;
    debug!(mac = %container.mac_string(), ifname = container_ifname, "Found MAC for container veth");

    Ok(VethPair { container, host })
}

/// Move the host end into the host namespace. The kernel leaves it down.
pub async fn move_to_host<N: Netlink + ?Sized>(netlink: &N, host: &Link) -> Result<()> {
    netlink
        .move_link(host.index, &Namespace::Host)
        .await
        .map_err(|source| ProvisionError::NamespaceFailure {
            ifname: host.name.clone(),
            source,
        })?;
    debug!(ifname = %host.name, "Moved host end to host namespace");
    Ok(())
}

/// Find the host end again after the move and bring it back up.
pub async fn activate_on_host<N: Netlink + ?Sized>(netlink: &N, ifname: &str) -> Result<Link> {
    let link = lookup(netlink, ifname).await?;
    netlink
        .set_link_up(link.index)
        .await
        .map_err(ProvisionError::creation("link state", ifname))?;
    info!(ifname, index = link.index, "Host end is up");
    Ok(link)
}

pub async fn lookup<N: Netlink + ?Sized>(netlink: &N, ifname: &str) -> Result<Link> {
    netlink
        .link_by_name(ifname)
        .await
        .map_err(ProvisionError::lookup(ifname))?
        .ok_or_else(|| ProvisionError::not_found(ifname))
}
