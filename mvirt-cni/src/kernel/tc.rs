//! Traffic-control objects: handles, the qdisc/class/filter requests the
//! shaper issues, and the kernel attribute layouts for HTB, u32 and mirred.
//!
//! Only what a single-class HTB hierarchy with a catch-all u32 classifier
//! needs is modelled here.

use std::fmt;
use std::path::Path;
use tracing::debug;

/// `ETH_P_IP`, host order.
pub const ETH_P_IP: u16 = 0x0800;

/// Default psched tick length on kernels with a 1 GHz clock source.
const DEFAULT_TICK_IN_USEC: f64 = 15.625;

const TIME_UNITS_PER_SEC: f64 = 1_000_000.0;

// HTB attributes (linux/pkt_sched.h)
const TCA_HTB_PARMS: u16 = 1;
const TCA_HTB_INIT: u16 = 2;
const TCA_HTB_RATE64: u16 = 6;
const TCA_HTB_CEIL64: u16 = 7;
const HTB_VERSION: u32 = 3;
const HTB_RATE2QUANTUM: u32 = 10;
const TC_LINKLAYER_ETHERNET: u8 = 1;

// u32 classifier (linux/pkt_cls.h)
const TCA_U32_CLASSID: u16 = 1;
const TCA_U32_SEL: u16 = 5;
const TCA_U32_ACT: u16 = 7;
const TC_U32_TERMINAL: u8 = 1;

// actions (linux/pkt_cls.h, linux/tc_act/tc_mirred.h)
const TCA_ACT_KIND: u16 = 1;
const TCA_ACT_OPTIONS: u16 = 2;
const TCA_MIRRED_PARMS: u16 = 2;
const TCA_EGRESS_REDIR: i32 = 1;
const TC_ACT_STOLEN: i32 = 4;

/// A `major:minor` traffic-control handle.
#[derive(Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub struct TcHandle(u32);

impl TcHandle {
    pub const UNSPEC: TcHandle = TcHandle(0);
    pub const ROOT: TcHandle = TcHandle(0xFFFF_FFFF);
    pub const INGRESS: TcHandle = TcHandle(0xFFFF_FFF1);

    pub const fn new(major: u16, minor: u16) -> Self {
        TcHandle(((major as u32) << 16) | minor as u32)
    }

    pub const fn from_raw(raw: u32) -> Self {
        TcHandle(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn major(self) -> u16 {
        (self.0 >> 16) as u16
    }

    pub const fn minor(self) -> u16 {
        self.0 as u16
    }
}

impl fmt::Display for TcHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            TcHandle::ROOT => write!(f, "root"),
            TcHandle::INGRESS => write!(f, "ingress"),
            _ => write!(f, "{:x}:{:x}", self.major(), self.minor()),
        }
    }
}

impl fmt::Debug for TcHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TcHandle({self})")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QdiscKind {
    /// Hierarchical token bucket. Unclassified traffic bypasses shaping.
    Htb,
    /// Ingress hook. Holds classifiers only.
    Ingress,
}

impl QdiscKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QdiscKind::Htb => "htb",
            QdiscKind::Ingress => "ingress",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QdiscSpec {
    pub link: u32,
    pub handle: TcHandle,
    pub parent: TcHandle,
    pub kind: QdiscKind,
}

impl QdiscSpec {
    pub fn htb_root(link: u32, handle: TcHandle) -> Self {
        Self {
            link,
            handle,
            parent: TcHandle::ROOT,
            kind: QdiscKind::Htb,
        }
    }

    pub fn ingress(link: u32) -> Self {
        Self {
            link,
            handle: TcHandle::new(0xffff, 0),
            parent: TcHandle::INGRESS,
            kind: QdiscKind::Ingress,
        }
    }

    /// `TCA_OPTIONS` payload attributes.
    pub fn options(&self) -> Vec<(u16, Vec<u8>)> {
        match self.kind {
            QdiscKind::Htb => vec![(TCA_HTB_INIT, htb_glob())],
            QdiscKind::Ingress => Vec::new(),
        }
    }
}

/// An HTB class. `rate` is in bits per second, `burst` in bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassSpec {
    pub link: u32,
    pub parent: TcHandle,
    pub handle: TcHandle,
    pub rate: u64,
    pub burst: u32,
}

impl ClassSpec {
    /// `TCA_OPTIONS` payload attributes. Ceil equals rate.
    pub fn options(&self, psched: &Psched) -> Vec<(u16, Vec<u8>)> {
        let bytes_per_sec = (self.rate / 8).max(1);
        let buffer = psched.xmittime(bytes_per_sec, self.burst);

        let mut attrs = vec![(
            TCA_HTB_PARMS,
            htb_opt(bytes_per_sec, bytes_per_sec, buffer, buffer),
        )];
        if bytes_per_sec > u32::MAX as u64 {
            attrs.push((TCA_HTB_RATE64, bytes_per_sec.to_ne_bytes().to_vec()));
            attrs.push((TCA_HTB_CEIL64, bytes_per_sec.to_ne_bytes().to_vec()));
        }
        attrs
    }
}

/// Where a catch-all classifier sends IPv4 traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterTarget {
    Class(TcHandle),
    /// Egress-redirect to another link (mirred).
    Redirect { ifindex: u32 },
}

/// A u32 classifier matching every IPv4 packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterSpec {
    pub link: u32,
    pub parent: TcHandle,
    pub priority: u16,
    pub target: FilterTarget,
}

impl FilterSpec {
    pub fn kind(&self) -> &'static str {
        "u32"
    }

    /// `tcm_info`: priority in the upper half, protocol (network order) below.
    pub fn info(&self) -> u32 {
        ((self.priority as u32) << 16) | ETH_P_IP.to_be() as u32
    }

    /// `TCA_OPTIONS` payload attributes.
    pub fn options(&self) -> Vec<(u16, Vec<u8>)> {
        let mut attrs = vec![(TCA_U32_SEL, match_all_selector())];
        match self.target {
            FilterTarget::Class(class) => {
                attrs.push((TCA_U32_CLASSID, class.raw().to_ne_bytes().to_vec()));
            }
            FilterTarget::Redirect { ifindex } => {
                attrs.push((TCA_U32_ACT, redirect_action(ifindex)));
            }
        }
        attrs
    }
}

/// A qdisc, class or filter as reported back by the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcEntry {
    pub handle: TcHandle,
    pub parent: TcHandle,
    pub kind: String,
}

/// Kernel packet scheduler clock, from `/proc/net/psched`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Psched {
    tick_in_usec: f64,
}

impl Default for Psched {
    fn default() -> Self {
        Self {
            tick_in_usec: DEFAULT_TICK_IN_USEC,
        }
    }
}

impl Psched {
    /// Read the scheduler clock. Falls back to the default on any error.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::parse(&content).unwrap_or_default(),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "psched unavailable, using default tick");
                Self::default()
            }
        }
    }

    fn parse(content: &str) -> Option<Self> {
        let mut fields = content
            .split_whitespace()
            .map(|f| u32::from_str_radix(f, 16).ok());
        let mut t2us = fields.next()??;
        let us2t = fields.next()??;
        let clock_res = fields.next()??;
        if us2t == 0 {
            return None;
        }
        if clock_res == 1_000_000_000 {
            t2us = us2t;
        }
        let clock_factor = clock_res as f64 / TIME_UNITS_PER_SEC;
        Some(Self {
            tick_in_usec: t2us as f64 / us2t as f64 * clock_factor,
        })
    }

    /// Ticks needed to send `size` bytes at `rate` bytes per second.
    pub fn xmittime(&self, rate: u64, size: u32) -> u32 {
        let usec = TIME_UNITS_PER_SEC * (size as f64 / rate as f64);
        let ticks = usec * self.tick_in_usec;
        if ticks >= u32::MAX as f64 {
            u32::MAX
        } else {
            ticks as u32
        }
    }
}

/// `struct tc_htb_glob`
fn htb_glob() -> Vec<u8> {
    let mut buf = Vec::with_capacity(20);
    buf.extend_from_slice(&HTB_VERSION.to_ne_bytes());
    buf.extend_from_slice(&HTB_RATE2QUANTUM.to_ne_bytes());
    buf.extend_from_slice(&0u32.to_ne_bytes()); // defcls
    buf.extend_from_slice(&0u32.to_ne_bytes()); // debug
    buf.extend_from_slice(&0u32.to_ne_bytes()); // direct_pkts
    buf
}

/// `struct tc_ratespec`
fn ratespec(bytes_per_sec: u64) -> [u8; 12] {
    let rate = u32::try_from(bytes_per_sec).unwrap_or(u32::MAX);
    let mut spec = [0u8; 12];
    spec[0] = 0; // cell_log
    spec[1] = TC_LINKLAYER_ETHERNET;
    spec[2..4].copy_from_slice(&0u16.to_ne_bytes()); // overhead
    spec[4..6].copy_from_slice(&(-1i16).to_ne_bytes()); // cell_align
    spec[6..8].copy_from_slice(&0u16.to_ne_bytes()); // mpu
    spec[8..12].copy_from_slice(&rate.to_ne_bytes());
    spec
}

/// `struct tc_htb_opt`
fn htb_opt(rate: u64, ceil: u64, buffer: u32, cbuffer: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(44);
    buf.extend_from_slice(&ratespec(rate));
    buf.extend_from_slice(&ratespec(ceil));
    buf.extend_from_slice(&buffer.to_ne_bytes());
    buf.extend_from_slice(&cbuffer.to_ne_bytes());
    buf.extend_from_slice(&0u32.to_ne_bytes()); // quantum
    buf.extend_from_slice(&0u32.to_ne_bytes()); // level
    buf.extend_from_slice(&0u32.to_ne_bytes()); // prio
    buf
}

/// `struct tc_u32_sel` with a single zero-mask key: matches everything.
fn match_all_selector() -> Vec<u8> {
    let mut buf = Vec::with_capacity(32);
    buf.push(TC_U32_TERMINAL); // flags
    buf.push(0); // offshift
    buf.push(1); // nkeys
    buf.push(0); // pad
    buf.extend_from_slice(&0u16.to_be_bytes()); // offmask
    buf.extend_from_slice(&0u16.to_ne_bytes()); // off
    buf.extend_from_slice(&0i16.to_ne_bytes()); // offoff
    buf.extend_from_slice(&0i16.to_ne_bytes()); // hoff
    buf.extend_from_slice(&0u32.to_be_bytes()); // hmask
    // struct tc_u32_key
    buf.extend_from_slice(&0u32.to_be_bytes()); // mask
    buf.extend_from_slice(&0u32.to_be_bytes()); // val
    buf.extend_from_slice(&0i32.to_ne_bytes()); // off
    buf.extend_from_slice(&0i32.to_ne_bytes()); // offmask
    buf
}

/// Nested action list holding one mirred egress-redirect action.
fn redirect_action(ifindex: u32) -> Vec<u8> {
    let mut parms = Vec::with_capacity(28);
    parms.extend_from_slice(&0u32.to_ne_bytes()); // index
    parms.extend_from_slice(&0u32.to_ne_bytes()); // capab
    parms.extend_from_slice(&TC_ACT_STOLEN.to_ne_bytes()); // action
    parms.extend_from_slice(&0i32.to_ne_bytes()); // refcnt
    parms.extend_from_slice(&0i32.to_ne_bytes()); // bindcnt
    parms.extend_from_slice(&TCA_EGRESS_REDIR.to_ne_bytes()); // eaction
    parms.extend_from_slice(&ifindex.to_ne_bytes());

    let mut action = nla(TCA_ACT_KIND, b"mirred\0");
    action.extend(nla(TCA_ACT_OPTIONS, &nla(TCA_MIRRED_PARMS, &parms)));

    // Action order 1.
    nla(1, &action)
}

/// Encode one netlink attribute, padded to four bytes.
fn nla(kind: u16, payload: &[u8]) -> Vec<u8> {
    let len = 4 + payload.len();
    let mut buf = Vec::with_capacity((len + 3) & !3);
    buf.extend_from_slice(&(len as u16).to_ne_bytes());
    buf.extend_from_slice(&kind.to_ne_bytes());
    buf.extend_from_slice(payload);
    buf.resize((len + 3) & !3, 0);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    fn u32_at(buf: &[u8], off: usize) -> u32 {
        u32::from_ne_bytes(buf[off..off + 4].try_into().unwrap())
    }

    #[test]
    fn test_handle_parts() {
        let h = TcHandle::new(2, 0x56cb);
        assert_eq!(h.raw(), 0x0002_56cb);
        assert_eq!(h.major(), 2);
        assert_eq!(h.minor(), 0x56cb);
        assert_eq!(h.to_string(), "2:56cb");
        assert_eq!(TcHandle::ROOT.to_string(), "root");
        assert_eq!(QdiscSpec::ingress(3).handle.raw(), 0xffff_0000);
    }

    #[test]
    fn test_nla_padding() {
        let attr = nla(1, b"htb\0");
        assert_eq!(attr.len(), 8);
        let attr = nla(1, b"mirred\0");
        assert_eq!(&attr[0..2], &11u16.to_ne_bytes());
        assert_eq!(attr.len(), 12);
    }

    #[test]
    fn test_htb_glob_layout() {
        let glob = htb_glob();
        assert_eq!(glob.len(), 20);
        assert_eq!(u32_at(&glob, 0), 3);
        assert_eq!(u32_at(&glob, 4), 10);
        assert_eq!(u32_at(&glob, 8), 0);
    }

    #[test]
    fn test_class_options_rate_in_bytes() {
        let class = ClassSpec {
            link: 5,
            parent: TcHandle::new(2, 0),
            handle: TcHandle::new(2, 0x56cb),
            rate: 2_000_000,
            burst: 32 * 1024,
        };
        let attrs = class.options(&Psched::default());
        assert_eq!(attrs.len(), 1);
        let (kind, opt) = &attrs[0];
        assert_eq!(*kind, TCA_HTB_PARMS);
        assert_eq!(opt.len(), 44);
        // rate and ceil, bytes per second
        assert_eq!(u32_at(opt, 8), 250_000);
        assert_eq!(u32_at(opt, 20), 250_000);
        assert_eq!(opt[1], TC_LINKLAYER_ETHERNET);
        // buffer == cbuffer, non-zero
        assert_eq!(u32_at(opt, 24), u32_at(opt, 28));
        assert!(u32_at(opt, 24) > 0);
    }

    #[test]
    fn test_class_options_64bit_rate() {
        let class = ClassSpec {
            link: 5,
            parent: TcHandle::new(1, 0),
            handle: TcHandle::new(1, 0x56cb),
            rate: 100_000_000_000 * 8,
            burst: 32 * 1024,
        };
        let attrs = class.options(&Psched::default());
        let kinds: Vec<u16> = attrs.iter().map(|(k, _)| *k).collect();
        assert_eq!(kinds, vec![TCA_HTB_PARMS, TCA_HTB_RATE64, TCA_HTB_CEIL64]);
        assert_eq!(u32_at(&attrs[0].1, 8), u32::MAX);
    }

    #[test]
    fn test_selector_matches_all() {
        let sel = match_all_selector();
        assert_eq!(sel.len(), 32);
        assert_eq!(sel[0], TC_U32_TERMINAL);
        assert_eq!(sel[2], 1);
        // key mask and value are zero
        assert!(sel[16..24].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_filter_info() {
        let filter = FilterSpec {
            link: 4,
            parent: TcHandle::new(2, 0),
            priority: 1,
            target: FilterTarget::Class(TcHandle::new(2, 0x56cb)),
        };
        assert_eq!(filter.info() >> 16, 1);
        assert_eq!((filter.info() & 0xffff) as u16, ETH_P_IP.to_be());

        let attrs = filter.options();
        assert_eq!(attrs[1], (TCA_U32_CLASSID, 0x0002_56cbu32.to_ne_bytes().to_vec()));
    }

    #[test]
    fn test_redirect_action_carries_ifindex() {
        let act = redirect_action(42);
        // order(4) + kind(12) + options(4) + parms hdr(4) + tc_mirred(28)
        assert_eq!(act.len(), 52);
        assert_eq!(&act[8..14], b"mirred");
        assert_eq!(u32_at(&act, act.len() - 4), 42);
        assert_eq!(u32_at(&act, act.len() - 8) as i32, TCA_EGRESS_REDIR);
    }

    #[test]
    fn test_psched_parse() {
        let p = Psched::parse("000003e8 00000040 000f4240 3b9aca00\n").unwrap();
        assert_eq!(p, Psched::default());

        let p = Psched::parse("00000001 00000001 3b9aca00 3b9aca00").unwrap();
        assert_eq!(p.tick_in_usec, 1000.0);

        assert!(Psched::parse("garbage").is_none());
    }

    #[test]
    fn test_xmittime() {
        let p = Psched::default();
        // one second worth of data
        assert_eq!(p.xmittime(1000, 1000), 15_625_000);
        assert_eq!(p.xmittime(1, u32::MAX), u32::MAX);
    }
}
