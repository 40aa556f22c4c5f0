//! Per-interface proxy and forwarding sysctls for the host end.

use super::address::Families;
use crate::error::{ProvisionError, Result};
use crate::kernel::Kernel;
use crate::ledger::{Ledger, Resource};
use tracing::info;

/// Sysctl writes for `ifname`, in the order they are applied.
pub fn settings(ifname: &str, families: Families) -> Vec<(String, &'static str)> {
    let mut settings = Vec::new();
    if families.ipv4 {
        // Answer ARP for the container's synthetic next hop without assigning it.
        settings.push((format!("ipv4/conf/{ifname}/proxy_arp"), "1"));
        settings.push((format!("ipv4/neigh/{ifname}/proxy_delay"), "0"));
        settings.push((format!("ipv4/conf/{ifname}/forwarding"), "1"));
    }
    if families.ipv6 {
        settings.push((format!("ipv6/conf/{ifname}/proxy_ndp"), "1"));
        settings.push((format!("ipv6/conf/{ifname}/forwarding"), "1"));
    }
    settings
}

/// Apply the settings. Earlier writes stay in place if a later one fails.
pub fn configure<K: Kernel + ?Sized>(
    kernel: &K,
    ifname: &str,
    families: Families,
    ledger: &mut Ledger,
) -> Result<()> {
    for (key, value) in settings(ifname, families) {
        kernel
            .write_sysctl(&key, value)
            .map_err(|source| ProvisionError::SysctlFailure {
                ifname: ifname.to_string(),
                source,
            })?;
        ledger.record(Resource::Sysctl {
            key,
            value: value.to_string(),
        });
    }
    info!(ifname, ipv4 = families.ipv4, ipv6 = families.ipv6, "Sysctls configured");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_ipv4_only() {
        let families = Families {
            ipv4: true,
            ipv6: false,
        };
        let keys: Vec<_> = settings("cali1", families)
            .into_iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        assert_eq!(
            keys,
            vec![
                "ipv4/conf/cali1/proxy_arp=1",
                "ipv4/neigh/cali1/proxy_delay=0",
                "ipv4/conf/cali1/forwarding=1",
            ]
        );
    }

    #[test]
    fn test_settings_ipv6_only() {
        let families = Families {
            ipv4: false,
            ipv6: true,
        };
        let keys: Vec<_> = settings("cali1", families)
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(
            keys,
            vec!["ipv6/conf/cali1/proxy_ndp", "ipv6/conf/cali1/forwarding"]
        );
    }

    #[test]
    fn test_settings_none() {
        assert!(settings("cali1", Families::default()).is_empty());
    }
}
