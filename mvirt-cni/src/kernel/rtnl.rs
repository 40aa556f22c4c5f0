//! rtnetlink backend. Link, address and route requests go through the
//! rtnetlink request builders; traffic-control requests are assembled from
//! `kernel::tc` attribute payloads and sent as raw `TcMessage`s.

use super::netns::Netns;
use super::tc::Psched;
use super::{
    ClassSpec, FilterSpec, Kernel, KernelResult, Link, Namespace, Netlink, QdiscSpec, Route,
    RouteScope, TcEntry, TcHandle, VethSpec,
};
use crate::config::IpFamily;
use crate::error::KernelError;
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use ipnet::IpNet;
use netlink_packet_core::{
    NLM_F_ACK, NLM_F_CREATE, NLM_F_DUMP, NLM_F_EXCL, NLM_F_REPLACE, NLM_F_REQUEST,
    NetlinkMessage, NetlinkPayload,
};
use netlink_packet_route::address::AddressAttribute;
use netlink_packet_route::link::{
    InfoData, InfoKind, InfoVeth, LinkAttribute, LinkFlag, LinkInfo, LinkMessage, State,
};
use netlink_packet_route::route::RouteScope as NlRouteScope;
use netlink_packet_route::tc::{TcAttribute, TcMessage, TcOption};
use netlink_packet_route::{AddressFamily, RouteNetlinkMessage};
use netlink_packet_utils::nla::DefaultNla;
use nix::libc;
use rtnetlink::Handle;
use std::fs::OpenOptions;
use std::io::Write;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Default location of the `net.*` sysctl tree.
pub const SYSCTL_ROOT: &str = "/proc/sys/net";

/// Default location of the packet scheduler clock parameters.
pub const PSCHED_PATH: &str = "/proc/net/psched";

/// u32 node handles carry the key id in the low 12 bits; hash tables have none.
const U32_NODE_MASK: u32 = 0xfff;

/// Production kernel backed by rtnetlink and `/proc/sys`.
pub struct RtnlKernel {
    host: Arc<Netns>,
    sysctl_root: PathBuf,
    psched: Psched,
}

impl RtnlKernel {
    /// Must be called from the host namespace; that namespace becomes `Namespace::Host`.
    pub fn new(sysctl_root: impl Into<PathBuf>, psched_path: &Path) -> Result<Self, KernelError> {
        Ok(Self {
            host: Arc::new(Netns::current()?),
            sysctl_root: sysctl_root.into(),
            psched: Psched::load(psched_path),
        })
    }
}

#[async_trait]
impl Kernel for RtnlKernel {
    type Handle = RtnlHandle;

    async fn netlink(&self, namespace: &Namespace) -> KernelResult<RtnlHandle> {
        let (connection, handle, _) = match namespace {
            Namespace::Host => rtnetlink::new_connection().map_err(KernelError::Open)?,
            Namespace::Path(path) => {
                // The socket stays bound to the namespace it was opened in.
                let netns = Netns::open(path)?;
                let _guard = netns.enter()?;
                rtnetlink::new_connection().map_err(KernelError::Open)?
            }
        };
        tokio::spawn(connection);

        debug!(netns = %namespace, "Netlink connection opened");
        Ok(RtnlHandle {
            handle,
            host: Arc::clone(&self.host),
            psched: self.psched,
        })
    }

    fn write_sysctl(&self, key: &str, value: &str) -> KernelResult<()> {
        let path = self.sysctl_root.join(key);
        let sysctl_err = |source| KernelError::Sysctl {
            path: path.clone(),
            source,
        };
        let mut file = OpenOptions::new()
            .write(true)
            .open(&path)
            .map_err(sysctl_err)?;
        file.write_all(value.as_bytes()).map_err(sysctl_err)?;
        debug!(path = %path.display(), value, "Sysctl written");
        Ok(())
    }
}

/// Netlink handle bound to one namespace.
pub struct RtnlHandle {
    handle: Handle,
    host: Arc<Netns>,
    psched: Psched,
}

impl RtnlHandle {
    async fn tc_request(&self, message: RouteNetlinkMessage, flags: u16) -> KernelResult<()> {
        let mut request = NetlinkMessage::from(message);
        request.header.flags = flags;

        let mut handle = self.handle.clone();
        let mut response = handle.request(request)?;
        while let Some(message) = response.next().await {
            if let NetlinkPayload::Error(err) = message.payload
                && err.code.is_some()
            {
                return Err(rtnetlink::Error::NetlinkError(err).into());
            }
        }
        Ok(())
    }

    async fn tc_dump(&self, message: RouteNetlinkMessage) -> KernelResult<Vec<TcMessage>> {
        let mut request = NetlinkMessage::from(message);
        request.header.flags = NLM_F_REQUEST | NLM_F_DUMP;

        let mut handle = self.handle.clone();
        let mut response = handle.request(request)?;
        let mut messages = Vec::new();
        while let Some(message) = response.next().await {
            match message.payload {
                NetlinkPayload::InnerMessage(
                    RouteNetlinkMessage::NewQueueDiscipline(msg)
                    | RouteNetlinkMessage::NewTrafficClass(msg)
                    | RouteNetlinkMessage::NewTrafficFilter(msg),
                ) => messages.push(msg),
                NetlinkPayload::Error(err) if err.code.is_some() => {
                    return Err(rtnetlink::Error::NetlinkError(err).into());
                }
                _ => {}
            }
        }
        Ok(messages)
    }
}

#[async_trait]
impl Netlink for RtnlHandle {
    async fn link_by_name(&self, name: &str) -> KernelResult<Option<Link>> {
        let mut links = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute();
        match links.try_next().await {
            Ok(Some(msg)) => Ok(Some(link_from_message(msg))),
            Ok(None) => Ok(None),
            Err(rtnetlink::Error::NetlinkError(e)) if e.raw_code() == -libc::ENODEV => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_link(&self, index: u32) -> KernelResult<()> {
        self.handle.link().del(index).execute().await?;
        Ok(())
    }

    async fn add_veth(&self, spec: &VethSpec) -> KernelResult<()> {
        let mut request = self
            .handle
            .link()
            .add()
            .veth(spec.name.clone(), spec.peer.clone());
        if spec.up {
            let header = &mut request.message_mut().header;
            header.flags.push(LinkFlag::Up);
            header.change_mask.push(LinkFlag::Up);
        }
        let msg = request.message_mut();
        msg.attributes.push(LinkAttribute::Mtu(spec.mtu));
        msg.attributes.push(LinkAttribute::TxQueueLen(spec.txqueuelen));
        set_veth_peer_params(msg, spec.mtu, spec.txqueuelen);
        request.execute().await?;
        Ok(())
    }

    async fn add_ifb(&self, name: &str, txqueuelen: u32) -> KernelResult<()> {
        let mut request = self.handle.link().add();
        let msg = request.message_mut();
        msg.attributes.push(LinkAttribute::IfName(name.to_string()));
        msg.attributes.push(LinkAttribute::TxQueueLen(txqueuelen));
        msg.attributes
            .push(LinkAttribute::LinkInfo(vec![LinkInfo::Kind(InfoKind::Ifb)]));
        request.execute().await?;
        Ok(())
    }

    async fn set_link_up(&self, index: u32) -> KernelResult<()> {
        self.handle.link().set(index).up().execute().await?;
        Ok(())
    }

    async fn move_link(&self, index: u32, target: &Namespace) -> KernelResult<()> {
        let opened;
        let netns = match target {
            Namespace::Host => self.host.as_ref(),
            Namespace::Path(path) => {
                opened = Netns::open(path)?;
                &opened
            }
        };
        self.handle
            .link()
            .set(index)
            .setns_by_fd(netns.fd())
            .execute()
            .await?;
        Ok(())
    }

    async fn addresses(&self, index: u32, family: IpFamily) -> KernelResult<Vec<IpAddr>> {
        let wanted = match family {
            IpFamily::V4 => AddressFamily::Inet,
            IpFamily::V6 => AddressFamily::Inet6,
        };
        let mut stream = self
            .handle
            .address()
            .get()
            .set_link_index_filter(index)
            .execute();

        let mut addresses = Vec::new();
        while let Some(msg) = stream.try_next().await? {
            if msg.header.index != index || msg.header.family != wanted {
                continue;
            }
            for attr in msg.attributes {
                if let AddressAttribute::Address(addr) = attr {
                    addresses.push(addr);
                }
            }
        }
        Ok(addresses)
    }

    async fn add_address(&self, index: u32, address: IpNet) -> KernelResult<()> {
        self.handle
            .address()
            .add(index, address.addr(), address.prefix_len())
            .execute()
            .await?;
        Ok(())
    }

    async fn add_route(&self, route: &Route) -> KernelResult<()> {
        let scope = match route.scope {
            RouteScope::Universe => NlRouteScope::Universe,
            RouteScope::Link => NlRouteScope::Link,
        };
        let request = self
            .handle
            .route()
            .add()
            .output_interface(route.oif)
            .scope(scope);

        match route.destination {
            IpNet::V4(dst) => {
                let mut request = request.v4().destination_prefix(dst.addr(), dst.prefix_len());
                if let Some(IpAddr::V4(gw)) = route.gateway {
                    request = request.gateway(gw);
                }
                request.execute().await?;
            }
            IpNet::V6(dst) => {
                let mut request = request.v6().destination_prefix(dst.addr(), dst.prefix_len());
                if let Some(IpAddr::V6(gw)) = route.gateway {
                    request = request.gateway(gw);
                }
                request.execute().await?;
            }
        }
        Ok(())
    }

    async fn add_qdisc(&self, qdisc: &QdiscSpec) -> KernelResult<()> {
        let msg = tc_message(
            qdisc.link,
            qdisc.handle,
            qdisc.parent,
            0,
            qdisc.kind.as_str(),
            qdisc.options(),
        );
        self.tc_request(
            RouteNetlinkMessage::NewQueueDiscipline(msg),
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
        )
        .await
    }

    async fn replace_class(&self, class: &ClassSpec) -> KernelResult<()> {
        let msg = tc_message(
            class.link,
            class.handle,
            class.parent,
            0,
            "htb",
            class.options(&self.psched),
        );
        self.tc_request(
            RouteNetlinkMessage::NewTrafficClass(msg),
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_REPLACE,
        )
        .await
    }

    async fn add_filter(&self, filter: &FilterSpec) -> KernelResult<()> {
        let msg = tc_message(
            filter.link,
            TcHandle::UNSPEC,
            filter.parent,
            filter.info(),
            filter.kind(),
            filter.options(),
        );
        self.tc_request(
            RouteNetlinkMessage::NewTrafficFilter(msg),
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
        )
        .await
    }

    async fn root_qdiscs(&self, index: u32) -> KernelResult<Vec<TcEntry>> {
        // Qdisc dumps are not filtered by the kernel.
        let messages = self
            .tc_dump(RouteNetlinkMessage::GetQueueDiscipline(TcMessage::default()))
            .await?;
        Ok(messages
            .into_iter()
            .filter(|msg| msg.header.index == index as i32)
            .map(tc_entry)
            .filter(|entry| entry.parent == TcHandle::ROOT)
            .collect())
    }

    async fn classes(&self, index: u32, parent: TcHandle) -> KernelResult<Vec<TcEntry>> {
        let mut request = TcMessage::default();
        request.header.index = index as i32;
        let messages = self
            .tc_dump(RouteNetlinkMessage::GetTrafficClass(request))
            .await?;
        Ok(messages
            .into_iter()
            .map(tc_entry)
            .filter(|entry| entry.handle.major() == parent.major())
            .collect())
    }

    async fn filters(&self, index: u32, parent: TcHandle) -> KernelResult<Vec<TcEntry>> {
        let mut request = TcMessage::default();
        request.header.index = index as i32;
        request.header.parent = parent.raw().into();
        let messages = self
            .tc_dump(RouteNetlinkMessage::GetTrafficFilter(request))
            .await?;
        Ok(messages
            .into_iter()
            .map(tc_entry)
            .filter(|entry| entry.parent == parent)
            .filter(|entry| match entry.kind.as_str() {
                "u32" => entry.handle.raw() & U32_NODE_MASK != 0,
                _ => entry.handle != TcHandle::UNSPEC,
            })
            .collect())
    }
}

/// Peer settings ride in the create request; otherwise the peer starts with
/// kernel defaults and a second request could fail after the pair exists.
fn set_veth_peer_params(msg: &mut LinkMessage, mtu: u32, txqueuelen: u32) {
    for attr in msg.attributes.iter_mut() {
        let LinkAttribute::LinkInfo(infos) = attr else {
            continue;
        };
        for info in infos.iter_mut() {
            if let LinkInfo::Data(InfoData::Veth(InfoVeth::Peer(peer))) = info {
                peer.attributes.push(LinkAttribute::Mtu(mtu));
                peer.attributes.push(LinkAttribute::TxQueueLen(txqueuelen));
            }
        }
    }
}

fn link_from_message(msg: LinkMessage) -> Link {
    let mut link = Link {
        index: msg.header.index,
        name: String::new(),
        mac: None,
        up: false,
    };
    for attr in msg.attributes {
        match attr {
            LinkAttribute::IfName(name) => link.name = name,
            LinkAttribute::Address(addr) => link.mac = addr.try_into().ok(),
            LinkAttribute::OperState(state) => {
                link.up = matches!(state, State::Up | State::Unknown);
            }
            _ => {}
        }
    }
    link
}

fn tc_message(
    link: u32,
    handle: TcHandle,
    parent: TcHandle,
    info: u32,
    kind: &str,
    options: Vec<(u16, Vec<u8>)>,
) -> TcMessage {
    let mut msg = TcMessage::default();
    msg.header.index = link as i32;
    msg.header.handle = handle.raw().into();
    msg.header.parent = parent.raw().into();
    msg.header.info = info;
    msg.attributes.push(TcAttribute::Kind(kind.to_string()));
    if !options.is_empty() {
        msg.attributes.push(TcAttribute::Options(
            options
                .into_iter()
                .map(|(kind, value)| TcOption::Other(DefaultNla::new(kind, value)))
                .collect(),
        ));
    }
    msg
}

fn tc_entry(msg: TcMessage) -> TcEntry {
    let kind = msg
        .attributes
        .iter()
        .find_map(|attr| match attr {
            TcAttribute::Kind(kind) => Some(kind.clone()),
            _ => None,
        })
        .unwrap_or_default();
    TcEntry {
        handle: TcHandle::from_raw(msg.header.handle.into()),
        parent: TcHandle::from_raw(msg.header.parent.into()),
        kind,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tc_message_roundtrip_entry() {
        let spec = QdiscSpec::htb_root(7, TcHandle::new(2, 0));
        let msg = tc_message(7, spec.handle, spec.parent, 0, "htb", spec.options());
        assert_eq!(msg.header.index, 7);
        assert_eq!(msg.attributes.len(), 2);

        let entry = tc_entry(msg);
        assert_eq!(entry.kind, "htb");
        assert_eq!(entry.handle, TcHandle::new(2, 0));
        assert_eq!(entry.parent, TcHandle::ROOT);
    }

    #[test]
    fn test_ingress_message_has_no_options() {
        let spec = QdiscSpec::ingress(7);
        let msg = tc_message(7, spec.handle, spec.parent, 0, "ingress", spec.options());
        assert_eq!(msg.attributes.len(), 1);
    }

    #[test]
    fn test_veth_peer_carries_mtu_and_txqueuelen() {
        let mut peer = LinkMessage::default();
        peer.attributes
            .push(LinkAttribute::IfName("caliabc".to_string()));
        let mut msg = LinkMessage::default();
        msg.attributes.push(LinkAttribute::IfName("eth0".to_string()));
        msg.attributes.push(LinkAttribute::LinkInfo(vec![
            LinkInfo::Kind(InfoKind::Veth),
            LinkInfo::Data(InfoData::Veth(InfoVeth::Peer(peer))),
        ]));

        set_veth_peer_params(&mut msg, 1400, 1000);

        let peer_attrs = msg
            .attributes
            .iter()
            .find_map(|attr| match attr {
                LinkAttribute::LinkInfo(infos) => infos.iter().find_map(|info| match info {
                    LinkInfo::Data(InfoData::Veth(InfoVeth::Peer(peer))) => {
                        Some(peer.attributes.clone())
                    }
                    _ => None,
                }),
                _ => None,
            })
            .unwrap();
        assert!(peer_attrs.contains(&LinkAttribute::Mtu(1400)));
        assert!(peer_attrs.contains(&LinkAttribute::TxQueueLen(1000)));
        // The container end is left alone.
        assert!(!msg.attributes.contains(&LinkAttribute::Mtu(1400)));
    }

    #[test]
    fn test_write_sysctl() {
        let dir = tempfile::tempdir().unwrap();
        let conf = dir.path().join("ipv4/conf/cali0");
        std::fs::create_dir_all(&conf).unwrap();
        std::fs::write(conf.join("proxy_arp"), "0").unwrap();

        let Ok(kernel) = RtnlKernel::new(dir.path(), Path::new(PSCHED_PATH)) else {
            eprintln!("Skipping test: cannot open own network namespace");
            return;
        };
        kernel.write_sysctl("ipv4/conf/cali0/proxy_arp", "1").unwrap();
        assert_eq!(
            std::fs::read_to_string(conf.join("proxy_arp")).unwrap(),
            "1"
        );

        // Sysctl files are never created.
        let err = kernel
            .write_sysctl("ipv4/conf/missing/forwarding", "1")
            .unwrap_err();
        assert!(matches!(err, KernelError::Sysctl { .. }));
    }
}
