//! Narrow interface to the kernel networking primitives the pipeline needs.
//!
//! - `Kernel`: opens a `Netlink` handle bound to a namespace and writes sysctls
//! - `Netlink`: link, address, route and traffic-control requests in one namespace
//!
//! `rtnl` is the production backend. Tests use `crate::test_util::FakeKernel`.

pub mod netns;
pub mod rtnl;
pub mod tc;

use crate::config::IpFamily;
use crate::error::KernelError;
use async_trait::async_trait;
use ipnet::IpNet;
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;

pub use tc::{ClassSpec, FilterSpec, FilterTarget, QdiscKind, QdiscSpec, TcEntry, TcHandle};

pub type KernelResult<T> = std::result::Result<T, KernelError>;

/// Which network namespace a handle operates in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize)]
pub enum Namespace {
    /// The namespace the process was started in.
    Host,
    /// A namespace identified by a bind-mount or `/proc/<pid>/ns/net` path.
    Path(PathBuf),
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Namespace::Host => write!(f, "host"),
            Namespace::Path(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Kernel view of one network interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub index: u32,
    pub name: String,
    pub mac: Option<[u8; 6]>,
    pub up: bool,
}

impl Link {
    /// Hardware address in `aa:bb:cc:dd:ee:ff` form, empty if the link has none.
    pub fn mac_string(&self) -> String {
        self.mac.map(|mac| format_mac(&mac)).unwrap_or_default()
    }
}

pub fn format_mac(mac: &[u8; 6]) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}

/// A veth pair to create. `name` stays in the current namespace with `peer`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VethSpec {
    pub name: String,
    pub peer: String,
    pub mtu: u32,
    pub txqueuelen: u32,
    pub up: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteScope {
    Universe,
    Link,
}

/// A unicast route in the main table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub destination: IpNet,
    pub gateway: Option<IpAddr>,
    pub oif: u32,
    pub scope: RouteScope,
}

impl Route {
    /// Directly connected route, no next hop.
    pub fn link_scope(destination: IpNet, oif: u32) -> Self {
        Self {
            destination,
            gateway: None,
            oif,
            scope: RouteScope::Link,
        }
    }

    /// Default route for the gateway's family.
    pub fn default_via(gateway: IpAddr, oif: u32) -> Self {
        let destination = match gateway {
            IpAddr::V4(_) => IpNet::V4(Default::default()),
            IpAddr::V6(_) => IpNet::V6(Default::default()),
        };
        Self {
            destination,
            gateway: Some(gateway),
            oif,
            scope: RouteScope::Universe,
        }
    }
}

/// Netlink requests scoped to one namespace.
#[async_trait]
pub trait Netlink: Send + Sync {
    /// Look a link up by name. `Ok(None)` if it does not exist.
    async fn link_by_name(&self, name: &str) -> KernelResult<Option<Link>>;

    async fn delete_link(&self, index: u32) -> KernelResult<()>;

    /// Create a veth pair. Both ends are named and carry the MTU.
    async fn add_veth(&self, spec: &VethSpec) -> KernelResult<()>;

    /// Create an IFB device.
    async fn add_ifb(&self, name: &str, txqueuelen: u32) -> KernelResult<()>;

    async fn set_link_up(&self, index: u32) -> KernelResult<()>;

    /// Move a link into another namespace. The kernel leaves it down.
    async fn move_link(&self, index: u32, target: &Namespace) -> KernelResult<()>;

    async fn addresses(&self, index: u32, family: IpFamily) -> KernelResult<Vec<IpAddr>>;

    async fn add_address(&self, index: u32, address: IpNet) -> KernelResult<()>;

    async fn add_route(&self, route: &Route) -> KernelResult<()>;

    async fn add_qdisc(&self, qdisc: &QdiscSpec) -> KernelResult<()>;

    /// Create or replace a class.
    async fn replace_class(&self, class: &ClassSpec) -> KernelResult<()>;

    async fn add_filter(&self, filter: &FilterSpec) -> KernelResult<()>;

    /// Qdiscs attached directly at the root of a link.
    async fn root_qdiscs(&self, index: u32) -> KernelResult<Vec<TcEntry>>;

    /// Classes on a link whose parent is `parent` or a descendant of it.
    async fn classes(&self, index: u32, parent: TcHandle) -> KernelResult<Vec<TcEntry>>;

    /// Classifier rules attached to `parent`. Hash-table bookkeeping
    /// entries are not counted.
    async fn filters(&self, index: u32, parent: TcHandle) -> KernelResult<Vec<TcEntry>>;
}

/// Factory for namespace-bound handles plus host sysctl access.
#[async_trait]
pub trait Kernel: Send + Sync {
    type Handle: Netlink;

    /// Open a handle whose requests act in `namespace`.
    async fn netlink(&self, namespace: &Namespace) -> KernelResult<Self::Handle>;

    /// Write `value` to the sysctl `key` (relative to `net/`, e.g.
    /// `ipv4/conf/eth0/forwarding`) in the host namespace.
    fn write_sysctl(&self, key: &str, value: &str) -> KernelResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_string() {
        let link = Link {
            index: 4,
            name: "eth0".to_string(),
            mac: Some([0xee, 0xee, 0x0a, 0x00, 0x00, 0x05]),
            up: true,
        };
        assert_eq!(link.mac_string(), "ee:ee:0a:00:00:05");

        let bare = Link { mac: None, ..link };
        assert_eq!(bare.mac_string(), "");
    }

    #[test]
    fn test_default_via() {
        let v4 = Route::default_via("169.254.1.1".parse().unwrap(), 3);
        assert_eq!(v4.destination, "0.0.0.0/0".parse::<IpNet>().unwrap());
        assert_eq!(v4.scope, RouteScope::Universe);

        let v6 = Route::default_via("fe80::1".parse().unwrap(), 3);
        assert_eq!(v6.destination, "::/0".parse::<IpNet>().unwrap());
    }
}
