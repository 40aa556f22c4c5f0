//! Provisioning request as handed over by the orchestrator.

use crate::error::{ProvisionError, Result};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Default MTU when the request does not carry one.
pub const DEFAULT_MTU: u32 = 1500;

/// Address family of an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IpFamily {
    #[serde(rename = "4")]
    V4,
    #[serde(rename = "6")]
    V6,
}

/// One address handed out by IPAM. Read-only here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub address: IpNet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<IpFamily>,
}

impl Allocation {
    pub fn new(address: IpNet) -> Self {
        Self {
            address,
            version: None,
        }
    }

    pub fn family(&self) -> IpFamily {
        match self.address {
            IpNet::V4(_) => IpFamily::V4,
            IpNet::V6(_) => IpFamily::V6,
        }
    }
}

/// Everything needed for one container attach.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionRequest {
    pub container_id: String,
    /// Path of the container's network namespace, e.g. `/proc/<pid>/ns/net`.
    pub netns: PathBuf,
    /// Interface name inside the container.
    pub ifname: String,
    /// Explicit host-side veth name; replaces the derived one.
    #[serde(default)]
    pub host_ifname: Option<String>,
    #[serde(default = "default_mtu")]
    pub mtu: u32,
    #[serde(default)]
    pub ips: Vec<Allocation>,
    /// Egress cap in bits per second, decimal.
    #[serde(default)]
    pub egress_rate: String,
    /// Ingress cap in bits per second, decimal.
    #[serde(default)]
    pub ingress_rate: String,
}

fn default_mtu() -> u32 {
    DEFAULT_MTU
}

impl ProvisionRequest {
    /// Reject requests the pipeline can never satisfy before touching the kernel.
    pub fn validate(&self) -> Result<()> {
        if self.ifname.is_empty() {
            return Err(ProvisionError::ConfigurationFailure(
                "container interface name is empty".to_string(),
            ));
        }
        if self.ifname.len() >= libc::IFNAMSIZ {
            return Err(ProvisionError::ConfigurationFailure(format!(
                "container interface name {} is too long",
                self.ifname
            )));
        }
        if let Some(name) = &self.host_ifname
            && name.len() >= libc::IFNAMSIZ
        {
            return Err(ProvisionError::ConfigurationFailure(format!(
                "host interface name {name} is too long"
            )));
        }
        if self.mtu == 0 {
            return Err(ProvisionError::ConfigurationFailure(
                "MTU must be non-zero".to_string(),
            ));
        }
        for ip in &self.ips {
            if let Some(version) = ip.version
                && version != ip.family()
            {
                return Err(ProvisionError::ConfigurationFailure(format!(
                    "allocation {} tagged with the wrong family",
                    ip.address
                )));
            }
        }
        Ok(())
    }

    pub fn egress_limit(&self) -> Option<u64> {
        parse_rate("egress", &self.egress_rate)
    }

    pub fn ingress_limit(&self) -> Option<u64> {
        parse_rate("ingress", &self.ingress_rate)
    }
}

/// Parse a decimal bits-per-second rate. `None` disables shaping for `direction`.
pub fn parse_rate(direction: &str, raw: &str) -> Option<u64> {
    let raw = raw.trim();
    if raw.is_empty() {
        debug!(direction, "No rate given, shaping disabled");
        return None;
    }
    match raw.parse::<u64>() {
        Ok(0) => {
            info!(direction, "Rate is zero, shaping disabled");
            None
        }
        Ok(rate) => Some(rate),
        Err(e) => {
            warn!(direction, rate = raw, error = %e, "Unparsable rate, skipping shaping");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ProvisionRequest {
        serde_json::from_str(
            r#"{
                "container_id": "abcdefghijklmnop",
                "netns": "/var/run/netns/test",
                "ifname": "eth0",
                "ips": [{"address": "10.0.0.5/32"}, {"address": "fd00::5/128", "version": "6"}],
                "egress_rate": "2000000",
                "ingress_rate": "1000000"
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_request_defaults() {
        let req = request();
        assert_eq!(req.mtu, DEFAULT_MTU);
        assert_eq!(req.host_ifname, None);
        assert_eq!(req.ips.len(), 2);
        assert_eq!(req.ips[0].family(), IpFamily::V4);
        assert_eq!(req.ips[1].family(), IpFamily::V6);
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_limits() {
        let req = request();
        assert_eq!(req.egress_limit(), Some(2_000_000));
        assert_eq!(req.ingress_limit(), Some(1_000_000));
    }

    #[test]
    fn test_parse_rate_rejects_garbage() {
        assert_eq!(parse_rate("egress", "10mbit"), None);
        assert_eq!(parse_rate("egress", "-5"), None);
        assert_eq!(parse_rate("egress", ""), None);
        assert_eq!(parse_rate("egress", "0"), None);
        assert_eq!(parse_rate("egress", " 42 "), Some(42));
    }

    #[test]
    fn test_validate_family_mismatch() {
        let mut req = request();
        req.ips[0].version = Some(IpFamily::V6);
        assert!(matches!(
            req.validate(),
            Err(ProvisionError::ConfigurationFailure(_))
        ));
    }

    #[test]
    fn test_validate_long_ifname() {
        let mut req = request();
        req.ifname = "averyveryverylongname".to_string();
        assert!(req.validate().is_err());
    }
}
