//! Error types for mvirt-cni.

use crate::kernel::TcHandle;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Faults raised by a kernel backend.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("Open netlink socket: {0}")]
    Open(#[source] io::Error),

    #[error("Netlink: {0}")]
    Netlink(#[from] rtnetlink::Error),

    #[error("Namespace {}: {source}", path.display())]
    Namespace {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Write {}: {source}", path.display())]
    Sysctl {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    Exists(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),
}

/// Pipeline failures. Each variant names the interface it was working on.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("Link {ifname} not found")]
    LookupFailure {
        ifname: String,
        #[source]
        source: Option<KernelError>,
    },

    #[error("Failed to create {what} on {ifname}: {source}")]
    CreationFailure {
        what: &'static str,
        ifname: String,
        #[source]
        source: KernelError,
    },

    #[error("Failed to configure address or route on {ifname}: {source}")]
    AddressFailure {
        ifname: String,
        #[source]
        source: KernelError,
    },

    #[error("Host side {ifname} has no IPv6 address to use as next hop")]
    CapabilityFailure { ifname: String },

    #[error("Failed to configure sysctls for {ifname}: {source}")]
    SysctlFailure {
        ifname: String,
        #[source]
        source: KernelError,
    },

    #[error("Failed to move {ifname} between namespaces: {source}")]
    NamespaceFailure {
        ifname: String,
        #[source]
        source: KernelError,
    },

    #[error("Expected exactly one {what} on {ifname}, found {found}")]
    ConsistencyFailure {
        what: &'static str,
        ifname: String,
        found: usize,
    },

    #[error("Expected htb root qdisc {expected} on {ifname}, found {kind} qdisc {handle}")]
    UnexpectedRootQdisc {
        ifname: String,
        expected: TcHandle,
        kind: String,
        handle: TcHandle,
    },

    #[error("Failed to read back traffic control state on {ifname}: {source}")]
    ReadBackFailure {
        ifname: String,
        #[source]
        source: KernelError,
    },

    #[error("Invalid request: {0}")]
    ConfigurationFailure(String),
}

impl ProvisionError {
    pub(crate) fn creation(what: &'static str, ifname: &str) -> impl FnOnce(KernelError) -> Self {
        let ifname = ifname.to_string();
        move |source| ProvisionError::CreationFailure {
            what,
            ifname,
            source,
        }
    }

    pub(crate) fn address(ifname: &str) -> impl FnOnce(KernelError) -> Self {
        let ifname = ifname.to_string();
        move |source| ProvisionError::AddressFailure { ifname, source }
    }

    pub(crate) fn lookup(ifname: &str) -> impl FnOnce(KernelError) -> Self {
        let ifname = ifname.to_string();
        move |source| ProvisionError::LookupFailure {
            ifname,
            source: Some(source),
        }
    }

    pub(crate) fn read_back(ifname: &str) -> impl FnOnce(KernelError) -> Self {
        let ifname = ifname.to_string();
        move |source| ProvisionError::ReadBackFailure { ifname, source }
    }

    pub(crate) fn not_found(ifname: &str) -> Self {
        ProvisionError::LookupFailure {
            ifname: ifname.to_string(),
            source: None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ProvisionError>;
