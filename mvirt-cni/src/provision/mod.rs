//! Container network attach.
//!
//! `provision` runs the stages in a fixed order and stops at the first
//! failure:
//!
//! 1. remove a stale link holding the host-side name
//! 2. create the veth pair inside the container namespace
//! 3. container-side routes and addresses
//! 4. move the host end to the host namespace
//! 5. bring it back up and write its sysctls
//! 6. host-side routes to the allocations
//! 7. optional egress and ingress shaping
//!
//! Everything created is recorded in the caller's `Ledger`, including the
//! objects from stages that completed before a failure.

pub mod address;
pub mod link;
pub mod shaping;
pub mod sysctl;

use crate::config::ProvisionRequest;
use crate::error::{ProvisionError, Result};
use crate::kernel::{Kernel, Namespace};
use crate::ledger::Ledger;
use crate::naming;
use serde::Serialize;
use tracing::{debug, info};

/// Result of a successful attach.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Provisioned {
    pub host_ifname: String,
    /// MAC of the container-side interface, `aa:bb:cc:dd:ee:ff`.
    pub container_mac: String,
}

/// Attach the container described by `request` to the host.
pub async fn provision<K: Kernel + ?Sized>(
    kernel: &K,
    request: &ProvisionRequest,
    ledger: &mut Ledger,
) -> Result<Provisioned> {
    request.validate()?;

    let host_ifname = naming::host_ifname(&request.container_id, request.host_ifname.as_deref());
    let netns = Namespace::Path(request.netns.clone());
    info!(
        container_id = %request.container_id,
        netns = %netns,
        ifname = %request.ifname,
        host_ifname = %host_ifname,
        "Provisioning container network"
    );

    let host = kernel
        .netlink(&Namespace::Host)
        .await
        .map_err(ProvisionError::creation("netlink handle", &host_ifname))?;
    link::remove_stale(&host, &host_ifname).await?;

    let container = kernel
        .netlink(&netns)
        .await
        .map_err(ProvisionError::creation("veth pair", &host_ifname))?;
    let pair = link::create_pair(
        &container,
        &netns,
        &request.ifname,
        &host_ifname,
        request.mtu,
        ledger,
    )
    .await?;

    let families =
        address::configure_container(&container, &netns, &pair, &request.ips, ledger).await?;

    link::move_to_host(&container, &pair.host).await?;
    drop(container);

    let host_link = link::activate_on_host(&host, &host_ifname).await?;
    sysctl::configure(kernel, &host_ifname, families, ledger)?;

    address::install_host_routes(&host, &host_link, &request.ips, ledger).await?;

    match request.egress_limit() {
        Some(rate) => shaping::shape_egress(&host, &host_link, rate, ledger).await?,
        None => debug!(ifname = %host_ifname, "Egress shaping skipped"),
    }
    match request.ingress_limit() {
        Some(rate) => {
            let ifb = naming::ifb_name(&request.container_id);
            shaping::shape_ingress(&host, &host_link, &ifb, rate, ledger).await?;
        }
        None => debug!(ifname = %host_ifname, "Ingress shaping skipped"),
    }

    let container_mac = pair.container.mac_string();
    info!(
        host_ifname = %host_ifname,
        mac = %container_mac,
        resources = ledger.len(),
        "Container network provisioned"
    );
    Ok(Provisioned {
        host_ifname,
        container_mac,
    })
}
