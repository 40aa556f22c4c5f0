//! mvirt-cni - routed veth attach for container network namespaces.
//!
//! Each container gets a veth pair. The container end carries the allocated
//! addresses and a default route through the host end; the host end stays in
//! the host namespace with proxy ARP/NDP, forwarding and a connected route per
//! allocation. Optional HTB caps shape egress on the host end and ingress on
//! an IFB device fed by a redirect filter.
//!
//! ## Modules
//!
//! - **provision**: the attach pipeline
//! - **kernel**: netlink, namespace and sysctl access behind the `Kernel` trait
//! - **ledger**: objects created during an attach, for the caller's teardown

pub mod config;
pub mod error;
pub mod kernel;
pub mod ledger;
pub mod naming;
pub mod provision;

pub mod test_util;

pub use config::{Allocation, IpFamily, ProvisionRequest};
pub use error::{KernelError, ProvisionError};
pub use kernel::rtnl::RtnlKernel;
pub use ledger::{Ledger, Resource};
pub use provision::{Provisioned, provision};
