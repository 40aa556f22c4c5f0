//! In-memory kernel for exercising the pipeline without privileges.
//!
//! `FakeKernel` keeps links, addresses, routes, tc objects and sysctl writes
//! per namespace and enforces the kernel rules the pipeline depends on:
//! moving a link leaves it down and strips its addresses, gateways must be
//! reachable, sysctl paths exist only for links in the host namespace, and
//! tc objects need an existing parent.

use crate::config::IpFamily;
use crate::error::KernelError;
use crate::kernel::{
    ClassSpec, FilterSpec, FilterTarget, Kernel, KernelResult, Link, Namespace, Netlink,
    QdiscKind, QdiscSpec, Route, TcEntry, TcHandle, VethSpec,
};
use async_trait::async_trait;
use ipnet::{IpNet, Ipv6Net};
use std::collections::{BTreeMap, HashSet};
use std::io;
use std::net::{IpAddr, Ipv6Addr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Operations that can be told to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FakeOp {
    DeleteLink,
    AddVeth,
    AddIfb,
    SetLinkUp,
    MoveLink,
    AddAddress,
    AddRoute,
    AddQdisc,
    ReplaceClass,
    AddFilter,
    /// Qdisc, class and filter dumps.
    ListTc,
    WriteSysctl,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeLinkKind {
    Veth { peer: u32 },
    Ifb,
    Dummy,
}

#[derive(Debug, Clone)]
pub struct FakeLink {
    pub index: u32,
    pub name: String,
    pub namespace: Namespace,
    pub kind: FakeLinkKind,
    pub mac: [u8; 6],
    pub mtu: u32,
    pub txqueuelen: u32,
    pub up: bool,
    pub addresses: Vec<IpNet>,
}

#[derive(Debug, Default)]
pub struct FakeState {
    next_index: u32,
    namespaces: HashSet<PathBuf>,
    pub links: Vec<FakeLink>,
    pub routes: Vec<(Namespace, Route)>,
    pub qdiscs: Vec<QdiscSpec>,
    pub classes: Vec<ClassSpec>,
    pub filters: Vec<FilterSpec>,
    pub sysctls: BTreeMap<String, String>,
    failing: HashSet<FakeOp>,
    ipv6: bool,
    double_filters: bool,
}

impl FakeState {
    fn fail(&self, op: FakeOp) -> KernelResult<()> {
        if self.failing.contains(&op) {
            return Err(KernelError::Unsupported(format!("injected {op:?} failure")));
        }
        Ok(())
    }

    fn find(&self, namespace: &Namespace, name: &str) -> Option<&FakeLink> {
        self.links
            .iter()
            .find(|l| &l.namespace == namespace && l.name == name)
    }

    fn by_index(&mut self, namespace: &Namespace, index: u32) -> KernelResult<&mut FakeLink> {
        self.links
            .iter_mut()
            .find(|l| &l.namespace == namespace && l.index == index)
            .ok_or_else(|| KernelError::NotFound(format!("ifindex {index}")))
    }

    fn new_link(&mut self, namespace: &Namespace, name: &str, kind: FakeLinkKind) -> u32 {
        self.next_index += 1;
        let index = self.next_index;
        self.links.push(FakeLink {
            index,
            name: name.to_string(),
            namespace: namespace.clone(),
            kind,
            mac: [0x02, 0x00, 0x00, 0x00, (index >> 8) as u8, index as u8],
            mtu: 1500,
            txqueuelen: 1000,
            up: false,
            addresses: Vec::new(),
        });
        index
    }

    fn has_root_qdisc(&self, link: u32, handle: TcHandle) -> bool {
        self.qdiscs.iter().any(|q| {
            q.link == link && q.parent == TcHandle::ROOT && q.handle.major() == handle.major()
        })
    }

    fn gateway_reachable(&self, namespace: &Namespace, oif: u32, gw: IpAddr) -> bool {
        if let IpAddr::V6(v6) = gw
            && v6.segments()[0] & 0xffc0 == 0xfe80
        {
            return true;
        }
        let via_route = self.routes.iter().any(|(ns, r)| {
            ns == namespace && r.oif == oif && r.gateway.is_none() && r.destination.contains(&gw)
        });
        let via_address = self
            .links
            .iter()
            .filter(|l| &l.namespace == namespace && l.index == oif)
            .flat_map(|l| l.addresses.iter())
            .any(|a| a.trunc().contains(&gw));
        via_route || via_address
    }
}

/// In-memory `Kernel`. Clones share state.
#[derive(Clone)]
pub struct FakeKernel {
    state: Arc<Mutex<FakeState>>,
}

impl Default for FakeKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeKernel {
    /// A host namespace with IPv6 enabled, so links get a link-local address when up.
    pub fn new() -> Self {
        let state = FakeState {
            ipv6: true,
            ..Default::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Links never get IPv6 link-local addresses.
    pub fn without_ipv6() -> Self {
        let kernel = Self::new();
        kernel.lock().ipv6 = false;
        kernel
    }

    pub fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a namespace path so handles can be opened for it.
    pub fn add_namespace(&self, path: impl Into<PathBuf>) -> Namespace {
        let path = path.into();
        self.lock().namespaces.insert(path.clone());
        Namespace::Path(path)
    }

    /// Create a plain link, e.g. a stale veth end left behind by a previous attach.
    pub fn add_dummy(&self, namespace: &Namespace, name: &str) -> u32 {
        self.lock().new_link(namespace, name, FakeLinkKind::Dummy)
    }

    pub fn fail_on(&self, op: FakeOp) {
        self.lock().failing.insert(op);
    }

    /// Every added filter shows up twice in listings.
    pub fn double_filters(&self) {
        self.lock().double_filters = true;
    }

    pub fn link(&self, namespace: &Namespace, name: &str) -> Option<FakeLink> {
        self.lock().find(namespace, name).cloned()
    }

    pub fn routes(&self, namespace: &Namespace) -> Vec<Route> {
        self.lock()
            .routes
            .iter()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, r)| r.clone())
            .collect()
    }

    pub fn sysctl(&self, key: &str) -> Option<String> {
        self.lock().sysctls.get(key).cloned()
    }

    pub fn qdiscs(&self, link: u32) -> Vec<QdiscSpec> {
        self.lock()
            .qdiscs
            .iter()
            .filter(|q| q.link == link)
            .cloned()
            .collect()
    }

    pub fn classes(&self, link: u32) -> Vec<ClassSpec> {
        self.lock()
            .classes
            .iter()
            .filter(|c| c.link == link)
            .cloned()
            .collect()
    }

    pub fn filters(&self, link: u32) -> Vec<FilterSpec> {
        self.lock()
            .filters
            .iter()
            .filter(|f| f.link == link)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Kernel for FakeKernel {
    type Handle = FakeHandle;

    async fn netlink(&self, namespace: &Namespace) -> KernelResult<FakeHandle> {
        if let Namespace::Path(path) = namespace
            && !self.lock().namespaces.contains(path)
        {
            return Err(KernelError::Namespace {
                path: path.clone(),
                source: io::Error::from(io::ErrorKind::NotFound),
            });
        }
        Ok(FakeHandle {
            state: Arc::clone(&self.state),
            namespace: namespace.clone(),
        })
    }

    fn write_sysctl(&self, key: &str, value: &str) -> KernelResult<()> {
        let mut state = self.lock();
        state.fail(FakeOp::WriteSysctl)?;

        // Per-interface entries exist only while the link is in the host namespace.
        let parts: Vec<&str> = key.split('/').collect();
        if let [_, "conf" | "neigh", ifname, _] = parts.as_slice()
            && state.find(&Namespace::Host, ifname).is_none()
        {
            return Err(KernelError::Sysctl {
                path: PathBuf::from(key),
                source: io::Error::from(io::ErrorKind::NotFound),
            });
        }
        state.sysctls.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Handle bound to one fake namespace.
pub struct FakeHandle {
    state: Arc<Mutex<FakeState>>,
    namespace: Namespace,
}

impl FakeHandle {
    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Netlink for FakeHandle {
    async fn link_by_name(&self, name: &str) -> KernelResult<Option<Link>> {
        Ok(self.lock().find(&self.namespace, name).map(|l| Link {
            index: l.index,
            name: l.name.clone(),
            mac: Some(l.mac),
            up: l.up,
        }))
    }

    async fn delete_link(&self, index: u32) -> KernelResult<()> {
        let mut state = self.lock();
        state.fail(FakeOp::DeleteLink)?;
        let link = state.by_index(&self.namespace, index)?.clone();
        let peer = match link.kind {
            FakeLinkKind::Veth { peer } => Some(peer),
            _ => None,
        };
        state
            .links
            .retain(|l| l.index != index && Some(l.index) != peer);
        state
            .routes
            .retain(|(_, r)| r.oif != index && Some(r.oif) != peer);
        state.qdiscs.retain(|q| q.link != index);
        state.classes.retain(|c| c.link != index);
        state.filters.retain(|f| f.link != index);
        Ok(())
    }

    async fn add_veth(&self, spec: &VethSpec) -> KernelResult<()> {
        let mut state = self.lock();
        state.fail(FakeOp::AddVeth)?;
        for name in [&spec.name, &spec.peer] {
            if state.find(&self.namespace, name).is_some() {
                return Err(KernelError::Exists(name.clone()));
            }
        }
        let first = state.new_link(&self.namespace, &spec.name, FakeLinkKind::Dummy);
        let second = state.new_link(&self.namespace, &spec.peer, FakeLinkKind::Veth { peer: first });
        for link in state.links.iter_mut() {
            if link.index == first {
                link.kind = FakeLinkKind::Veth { peer: second };
            }
            if link.index == first || link.index == second {
                link.mtu = spec.mtu;
                link.txqueuelen = spec.txqueuelen;
            }
            // Like some kernels, the up flag at creation is not applied to the peer.
            if link.index == first {
                link.up = spec.up;
            }
        }
        Ok(())
    }

    async fn add_ifb(&self, name: &str, txqueuelen: u32) -> KernelResult<()> {
        let mut state = self.lock();
        state.fail(FakeOp::AddIfb)?;
        if state.find(&self.namespace, name).is_some() {
            return Err(KernelError::Exists(name.to_string()));
        }
        let index = state.new_link(&self.namespace, name, FakeLinkKind::Ifb);
        state.by_index(&self.namespace, index)?.txqueuelen = txqueuelen;
        Ok(())
    }

    async fn set_link_up(&self, index: u32) -> KernelResult<()> {
        let mut state = self.lock();
        state.fail(FakeOp::SetLinkUp)?;
        let ipv6 = state.ipv6;
        let link = state.by_index(&self.namespace, index)?;
        link.up = true;
        let has_link_local = link.addresses.iter().any(|a| match a {
            IpNet::V6(net) => net.addr().segments()[0] & 0xffc0 == 0xfe80,
            IpNet::V4(_) => false,
        });
        if ipv6 && !has_link_local {
            let m = link.mac;
            let addr = Ipv6Addr::new(
                0xfe80,
                0,
                0,
                0,
                u16::from_be_bytes([m[0] ^ 0x02, m[1]]),
                u16::from_be_bytes([m[2], 0xff]),
                u16::from_be_bytes([0xfe, m[3]]),
                u16::from_be_bytes([m[4], m[5]]),
            );
            if let Ok(net) = Ipv6Net::new(addr, 64) {
                link.addresses.push(IpNet::V6(net));
            }
        }
        Ok(())
    }

    async fn move_link(&self, index: u32, target: &Namespace) -> KernelResult<()> {
        let mut state = self.lock();
        state.fail(FakeOp::MoveLink)?;
        if let Namespace::Path(path) = target
            && !state.namespaces.contains(path)
        {
            return Err(KernelError::NotFound(path.display().to_string()));
        }
        let name = state.by_index(&self.namespace, index)?.name.clone();
        if state.find(target, &name).is_some() {
            return Err(KernelError::Exists(name));
        }
        let link = state.by_index(&self.namespace, index)?;
        link.namespace = target.clone();
        link.up = false;
        link.addresses.clear();
        state.routes.retain(|(_, r)| r.oif != index);
        Ok(())
    }

    async fn addresses(&self, index: u32, family: IpFamily) -> KernelResult<Vec<IpAddr>> {
        let mut state = self.lock();
        let link = state.by_index(&self.namespace, index)?;
        Ok(link
            .addresses
            .iter()
            .filter(|a| match family {
                IpFamily::V4 => matches!(a, IpNet::V4(_)),
                IpFamily::V6 => matches!(a, IpNet::V6(_)),
            })
            .map(|a| a.addr())
            .collect())
    }

    async fn add_address(&self, index: u32, address: IpNet) -> KernelResult<()> {
        let mut state = self.lock();
        state.fail(FakeOp::AddAddress)?;
        let link = state.by_index(&self.namespace, index)?;
        if link.addresses.contains(&address) {
            return Err(KernelError::Exists(address.to_string()));
        }
        link.addresses.push(address);
        Ok(())
    }

    async fn add_route(&self, route: &Route) -> KernelResult<()> {
        let mut state = self.lock();
        state.fail(FakeOp::AddRoute)?;
        state.by_index(&self.namespace, route.oif)?;
        if let Some(gw) = route.gateway
            && !state.gateway_reachable(&self.namespace, route.oif, gw)
        {
            return Err(KernelError::NotFound(format!("no route to gateway {gw}")));
        }
        let duplicate = state
            .routes
            .iter()
            .any(|(ns, r)| ns == &self.namespace && r.destination == route.destination);
        if duplicate {
            return Err(KernelError::Exists(route.destination.to_string()));
        }
        state.routes.push((self.namespace.clone(), route.clone()));
        Ok(())
    }

    async fn add_qdisc(&self, qdisc: &QdiscSpec) -> KernelResult<()> {
        let mut state = self.lock();
        state.fail(FakeOp::AddQdisc)?;
        state.by_index(&self.namespace, qdisc.link)?;
        let clash = state
            .qdiscs
            .iter()
            .any(|q| q.link == qdisc.link && q.parent == qdisc.parent);
        if clash {
            return Err(KernelError::Exists(format!(
                "{} qdisc on ifindex {}",
                qdisc.kind.as_str(),
                qdisc.link
            )));
        }
        state.qdiscs.push(qdisc.clone());
        Ok(())
    }

    async fn replace_class(&self, class: &ClassSpec) -> KernelResult<()> {
        let mut state = self.lock();
        state.fail(FakeOp::ReplaceClass)?;
        state.by_index(&self.namespace, class.link)?;
        if !state.has_root_qdisc(class.link, class.parent) {
            return Err(KernelError::NotFound(format!("qdisc {}", class.parent)));
        }
        state
            .classes
            .retain(|c| !(c.link == class.link && c.handle == class.handle));
        state.classes.push(class.clone());
        Ok(())
    }

    async fn add_filter(&self, filter: &FilterSpec) -> KernelResult<()> {
        let mut state = self.lock();
        state.fail(FakeOp::AddFilter)?;
        state.by_index(&self.namespace, filter.link)?;
        let parent_exists = state
            .qdiscs
            .iter()
            .any(|q| q.link == filter.link && q.handle == filter.parent);
        if !parent_exists {
            return Err(KernelError::NotFound(format!("qdisc {}", filter.parent)));
        }
        if let FilterTarget::Redirect { ifindex } = filter.target {
            state.by_index(&self.namespace, ifindex)?;
        }
        state.filters.push(filter.clone());
        if state.double_filters {
            state.filters.push(filter.clone());
        }
        Ok(())
    }

    async fn root_qdiscs(&self, index: u32) -> KernelResult<Vec<TcEntry>> {
        let state = self.lock();
        state.fail(FakeOp::ListTc)?;
        Ok(state
            .qdiscs
            .iter()
            .filter(|q| q.link == index && q.parent == TcHandle::ROOT)
            .map(|q| TcEntry {
                handle: q.handle,
                parent: q.parent,
                kind: q.kind.as_str().to_string(),
            })
            .collect())
    }

    async fn classes(&self, index: u32, parent: TcHandle) -> KernelResult<Vec<TcEntry>> {
        let state = self.lock();
        state.fail(FakeOp::ListTc)?;
        Ok(state
            .classes
            .iter()
            .filter(|c| c.link == index && c.handle.major() == parent.major())
            .map(|c| TcEntry {
                handle: c.handle,
                parent: c.parent,
                kind: QdiscKind::Htb.as_str().to_string(),
            })
            .collect())
    }

    async fn filters(&self, index: u32, parent: TcHandle) -> KernelResult<Vec<TcEntry>> {
        let state = self.lock();
        state.fail(FakeOp::ListTc)?;
        Ok(state
            .filters
            .iter()
            .filter(|f| f.link == index && f.parent == parent)
            .enumerate()
            .map(|(i, f)| TcEntry {
                handle: TcHandle::from_raw(0x8000_0800 + i as u32),
                parent: f.parent,
                kind: f.kind().to_string(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_move_link_leaves_it_down() {
        let kernel = FakeKernel::new();
        let ns = kernel.add_namespace("/var/run/netns/a");
        let handle = kernel.netlink(&ns).await.unwrap();
        handle
            .add_veth(&VethSpec {
                name: "eth0".to_string(),
                peer: "cali1".to_string(),
                mtu: 1500,
                txqueuelen: 1000,
                up: true,
            })
            .await
            .unwrap();
        let peer = handle.link_by_name("cali1").await.unwrap().unwrap();
        assert!(!peer.up);
        handle.set_link_up(peer.index).await.unwrap();
        handle.move_link(peer.index, &Namespace::Host).await.unwrap();

        assert!(handle.link_by_name("cali1").await.unwrap().is_none());
        let moved = kernel.link(&Namespace::Host, "cali1").unwrap();
        assert!(!moved.up);
        assert!(moved.addresses.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_namespace() {
        let kernel = FakeKernel::new();
        let err = kernel
            .netlink(&Namespace::Path("/nope".into()))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, KernelError::Namespace { .. }));
    }

    #[tokio::test]
    async fn test_gateway_must_be_reachable() {
        let kernel = FakeKernel::new();
        let host = kernel.netlink(&Namespace::Host).await.unwrap();
        let index = kernel.add_dummy(&Namespace::Host, "eth0");
        let gw: IpAddr = "169.254.1.1".parse().unwrap();

        let err = host.add_route(&Route::default_via(gw, index)).await;
        assert!(err.is_err());

        host.add_route(&Route::link_scope("169.254.1.1/32".parse().unwrap(), index))
            .await
            .unwrap();
        host.add_route(&Route::default_via(gw, index)).await.unwrap();
    }

    #[test]
    fn test_sysctl_requires_host_link() {
        let kernel = FakeKernel::new();
        assert!(kernel.write_sysctl("ipv4/conf/cali1/forwarding", "1").is_err());
        kernel.add_dummy(&Namespace::Host, "cali1");
        kernel.write_sysctl("ipv4/conf/cali1/forwarding", "1").unwrap();
        assert_eq!(kernel.sysctl("ipv4/conf/cali1/forwarding").as_deref(), Some("1"));
    }
}
