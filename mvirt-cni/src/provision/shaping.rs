//! HTB bandwidth caps on the host end.
//!
//! Egress (container to host) is shaped on the host end's root. Ingress
//! traffic entering the host end is redirected to an IFB device and shaped
//! on the IFB's root, since HTB cannot sit on an ingress hook.
//!
//! Each hierarchy is read back after creation and must contain exactly one
//! root qdisc, one class and one classifier rule.

use super::link::{TX_QUEUE_LEN, lookup, remove_stale};
use crate::error::{ProvisionError, Result};
use crate::kernel::{
    ClassSpec, FilterSpec, FilterTarget, Link, Namespace, Netlink, QdiscKind, QdiscSpec, TcHandle,
};
use crate::ledger::{Ledger, Resource};
use tracing::{debug, info};

const FILTER_PRIORITY: u16 = 1;

/// Handles and burst of one HTB hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hierarchy {
    pub qdisc: TcHandle,
    pub class: TcHandle,
    /// Bytes.
    pub burst: u32,
}

pub const EGRESS: Hierarchy = Hierarchy {
    qdisc: TcHandle::new(2, 0),
    class: TcHandle::new(2, 0x56cb),
    burst: 3_200_000,
};

pub const INGRESS: Hierarchy = Hierarchy {
    qdisc: TcHandle::new(1, 0),
    class: TcHandle::new(1, 0x56cb),
    burst: 32 * 1024,
};

/// Cap traffic leaving the host end at `rate` bits per second.
pub async fn shape_egress<N: Netlink + ?Sized>(
    netlink: &N,
    host: &Link,
    rate: u64,
    ledger: &mut Ledger,
) -> Result<()> {
    build(netlink, host, &EGRESS, rate, ledger).await?;
    verify(netlink, host, &EGRESS).await?;
    info!(ifname = %host.name, rate, "Egress shaping installed");
    Ok(())
}

/// Redirect traffic entering the host end to `ifb_name` and cap it there.
pub async fn shape_ingress<N: Netlink + ?Sized>(
    netlink: &N,
    host: &Link,
    ifb_name: &str,
    rate: u64,
    ledger: &mut Ledger,
) -> Result<Link> {
    // A redirect device left behind by an earlier attach of the same container.
    remove_stale(netlink, ifb_name).await?;

    netlink
        .add_ifb(ifb_name, TX_QUEUE_LEN)
        .await
        .map_err(ProvisionError::creation("redirect device", ifb_name))?;
    ledger.record(Resource::Link {
        name: ifb_name.to_string(),
        netns: Namespace::Host,
    });
    let ifb = lookup(netlink, ifb_name).await?;
    netlink
        .set_link_up(ifb.index)
        .await
        .map_err(ProvisionError::creation("link state", ifb_name))?;
    debug!(ifname = ifb_name, index = ifb.index, "Redirect device is up");

    let ingress = QdiscSpec::ingress(host.index);
    netlink
        .add_qdisc(&ingress)
        .await
        .map_err(ProvisionError::creation("ingress qdisc", &host.name))?;
    ledger.record(Resource::Qdisc {
        link: host.name.clone(),
        handle: ingress.handle,
    });

    let redirect = FilterSpec {
        link: host.index,
        parent: ingress.handle,
        priority: FILTER_PRIORITY,
        target: FilterTarget::Redirect { ifindex: ifb.index },
    };
    netlink
        .add_filter(&redirect)
        .await
        .map_err(ProvisionError::creation("redirect filter", &host.name))?;
    ledger.record(Resource::Filter {
        link: host.name.clone(),
        parent: ingress.handle,
    });

    build(netlink, &ifb, &INGRESS, rate, ledger).await?;
    verify(netlink, &ifb, &INGRESS).await?;
    info!(ifname = %host.name, ifb = ifb_name, rate, "Ingress shaping installed");
    Ok(ifb)
}

async fn build<N: Netlink + ?Sized>(
    netlink: &N,
    link: &Link,
    hierarchy: &Hierarchy,
    rate: u64,
    ledger: &mut Ledger,
) -> Result<()> {
    let qdisc = QdiscSpec::htb_root(link.index, hierarchy.qdisc);
    netlink
        .add_qdisc(&qdisc)
        .await
        .map_err(ProvisionError::creation("htb qdisc", &link.name))?;
    ledger.record(Resource::Qdisc {
        link: link.name.clone(),
        handle: hierarchy.qdisc,
    });

    let class = ClassSpec {
        link: link.index,
        parent: hierarchy.qdisc,
        handle: hierarchy.class,
        rate,
        burst: hierarchy.burst,
    };
    netlink
        .replace_class(&class)
        .await
        .map_err(ProvisionError::creation("htb class", &link.name))?;
    ledger.record(Resource::Class {
        link: link.name.clone(),
        handle: hierarchy.class,
    });

    let filter = FilterSpec {
        link: link.index,
        parent: hierarchy.qdisc,
        priority: FILTER_PRIORITY,
        target: FilterTarget::Class(hierarchy.class),
    };
    netlink
        .add_filter(&filter)
        .await
        .map_err(ProvisionError::creation("classifier", &link.name))?;
    ledger.record(Resource::Filter {
        link: link.name.clone(),
        parent: hierarchy.qdisc,
    });

    debug!(
        ifname = %link.name,
        qdisc = %hierarchy.qdisc,
        class = %hierarchy.class,
        rate,
        burst = hierarchy.burst,
        "HTB hierarchy created"
    );
    Ok(())
}

async fn verify<N: Netlink + ?Sized>(
    netlink: &N,
    link: &Link,
    hierarchy: &Hierarchy,
) -> Result<()> {
    let qdiscs = netlink
        .root_qdiscs(link.index)
        .await
        .map_err(ProvisionError::read_back(&link.name))?;
    expect_one("root qdisc", link, qdiscs.len())?;
    let root = &qdiscs[0];
    if root.kind != QdiscKind::Htb.as_str() || root.handle != hierarchy.qdisc {
        return Err(ProvisionError::UnexpectedRootQdisc {
            ifname: link.name.clone(),
            expected: hierarchy.qdisc,
            kind: root.kind.clone(),
            handle: root.handle,
        });
    }

    let classes = netlink
        .classes(link.index, hierarchy.qdisc)
        .await
        .map_err(ProvisionError::read_back(&link.name))?;
    expect_one("class", link, classes.len())?;

    let filters = netlink
        .filters(link.index, hierarchy.qdisc)
        .await
        .map_err(ProvisionError::read_back(&link.name))?;
    expect_one("filter", link, filters.len())
}

fn expect_one(what: &'static str, link: &Link, found: usize) -> Result<()> {
    if found != 1 {
        return Err(ProvisionError::ConsistencyFailure {
            what,
            ifname: link.name.clone(),
            found,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::Kernel;
    use crate::test_util::{FakeKernel, FakeOp};

    async fn host_link(kernel: &FakeKernel, name: &str) -> Link {
        kernel.add_dummy(&Namespace::Host, name);
        let host = kernel.netlink(&Namespace::Host).await.unwrap();
        host.link_by_name(name).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_egress_hierarchy() {
        let kernel = FakeKernel::new();
        let link = host_link(&kernel, "cali1").await;
        let host = kernel.netlink(&Namespace::Host).await.unwrap();
        let mut ledger = Ledger::new();

        shape_egress(&host, &link, 2_000_000, &mut ledger).await.unwrap();

        let qdiscs = kernel.qdiscs(link.index);
        assert_eq!(qdiscs, vec![QdiscSpec::htb_root(link.index, TcHandle::new(2, 0))]);
        let classes = kernel.classes(link.index);
        assert_eq!(classes.len(), 1);
        assert_eq!(classes[0].handle.to_string(), "2:56cb");
        assert_eq!(classes[0].rate, 2_000_000);
        assert_eq!(classes[0].burst, 3_200_000);
        let filters = kernel.filters(link.index);
        assert_eq!(filters.len(), 1);
        assert_eq!(filters[0].target, FilterTarget::Class(EGRESS.class));
        assert_eq!(ledger.len(), 3);
    }

    #[tokio::test]
    async fn test_ingress_redirects_to_ifb() {
        let kernel = FakeKernel::new();
        let link = host_link(&kernel, "cali1").await;
        let host = kernel.netlink(&Namespace::Host).await.unwrap();
        let mut ledger = Ledger::new();

        let ifb = shape_ingress(&host, &link, "ifb1", 1_000_000, &mut ledger)
            .await
            .unwrap();

        let fake_ifb = kernel.link(&Namespace::Host, "ifb1").unwrap();
        assert!(fake_ifb.up);
        assert_eq!(fake_ifb.txqueuelen, TX_QUEUE_LEN);

        let on_host = kernel.qdiscs(link.index);
        assert_eq!(on_host, vec![QdiscSpec::ingress(link.index)]);
        let redirect = kernel.filters(link.index);
        assert_eq!(redirect.len(), 1);
        assert_eq!(
            redirect[0].target,
            FilterTarget::Redirect { ifindex: ifb.index }
        );

        let classes = kernel.classes(ifb.index);
        assert_eq!(classes.len(), 1);
        assert_eq!(classes[0].handle, TcHandle::new(1, 0x56cb));
        assert_eq!(classes[0].rate, 1_000_000);
        assert_eq!(classes[0].burst, 32_768);
    }

    #[tokio::test]
    async fn test_ingress_replaces_stale_ifb() {
        let kernel = FakeKernel::new();
        let link = host_link(&kernel, "cali1").await;
        let stale = kernel.add_dummy(&Namespace::Host, "ifb1");
        let host = kernel.netlink(&Namespace::Host).await.unwrap();

        let ifb = shape_ingress(&host, &link, "ifb1", 1_000_000, &mut Ledger::new())
            .await
            .unwrap();
        assert_ne!(ifb.index, stale);
    }

    #[tokio::test]
    async fn test_duplicate_filter_is_inconsistent() {
        let kernel = FakeKernel::new();
        kernel.double_filters();
        let link = host_link(&kernel, "cali1").await;
        let host = kernel.netlink(&Namespace::Host).await.unwrap();

        let err = shape_egress(&host, &link, 2_000_000, &mut Ledger::new())
            .await
            .unwrap_err();
        match err {
            ProvisionError::ConsistencyFailure { what, found, .. } => {
                assert_eq!(what, "filter");
                assert_eq!(found, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_class_failure_keeps_qdisc_in_ledger() {
        let kernel = FakeKernel::new();
        kernel.fail_on(FakeOp::ReplaceClass);
        let link = host_link(&kernel, "cali1").await;
        let host = kernel.netlink(&Namespace::Host).await.unwrap();
        let mut ledger = Ledger::new();

        let err = shape_egress(&host, &link, 2_000_000, &mut ledger)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProvisionError::CreationFailure {
                what: "htb class",
                ..
            }
        ));
        assert_eq!(
            ledger.resources(),
            &[Resource::Qdisc {
                link: "cali1".to_string(),
                handle: EGRESS.qdisc,
            }]
        );
    }

    #[tokio::test]
    async fn test_foreign_root_qdisc_is_reported() {
        let kernel = FakeKernel::new();
        let link = host_link(&kernel, "cali1").await;
        let host = kernel.netlink(&Namespace::Host).await.unwrap();
        kernel
            .lock()
            .qdiscs
            .push(QdiscSpec::htb_root(link.index, TcHandle::new(3, 0)));

        let err = verify(&host, &link, &EGRESS).await.unwrap_err();
        match &err {
            ProvisionError::UnexpectedRootQdisc {
                expected,
                kind,
                handle,
                ..
            } => {
                assert_eq!(*expected, EGRESS.qdisc);
                assert_eq!(kind, "htb");
                assert_eq!(*handle, TcHandle::new(3, 0));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.to_string().contains("found htb qdisc 3:0"));
    }

    #[tokio::test]
    async fn test_failed_dump_is_read_back_failure() {
        let kernel = FakeKernel::new();
        kernel.fail_on(FakeOp::ListTc);
        let link = host_link(&kernel, "cali1").await;
        let host = kernel.netlink(&Namespace::Host).await.unwrap();
        let mut ledger = Ledger::new();

        let err = shape_egress(&host, &link, 2_000_000, &mut ledger)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProvisionError::ReadBackFailure { ref ifname, .. } if ifname == "cali1"
        ));
        assert!(!err.to_string().contains("not found"));
        assert_eq!(ledger.len(), 3);
    }
}
