//! Record of kernel objects created during one attach.
//!
//! Nothing is rolled back on failure. The orchestrator owns the ledger and
//! uses it for compensating teardown.

use crate::kernel::{Namespace, TcHandle};
use ipnet::IpNet;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Resource {
    /// Deleting `host` from the host namespace removes both ends.
    VethPair {
        container: String,
        host: String,
        netns: Namespace,
    },
    Link {
        name: String,
        netns: Namespace,
    },
    Address {
        link: String,
        address: IpNet,
        netns: Namespace,
    },
    Route {
        link: String,
        destination: IpNet,
        netns: Namespace,
    },
    Sysctl {
        key: String,
        value: String,
    },
    Qdisc {
        link: String,
        handle: TcHandle,
    },
    Class {
        link: String,
        handle: TcHandle,
    },
    Filter {
        link: String,
        parent: TcHandle,
    },
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct Ledger {
    resources: Vec<Resource>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, resource: Resource) {
        self.resources.push(resource);
    }

    /// Created objects, oldest first.
    pub fn resources(&self) -> &[Resource] {
        &self.resources
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }
}
