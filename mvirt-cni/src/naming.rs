//! Interface name derivation.
//!
//! Names are derived from the container id alone, so two containers whose ids
//! share the same first eleven characters collide. Callers must guarantee the
//! ids are unique in that prefix; nothing here detects a clash.

/// Prefix of the host-side veth end.
pub const HOST_PREFIX: &str = "cali";

/// Prefix of the ingress redirect (IFB) device.
pub const IFB_PREFIX: &str = "ifb";

/// Number of container id characters appended to a prefix.
pub const ID_CHARS: usize = 11;

/// Host-side veth name. An explicit override always wins.
pub fn host_ifname(container_id: &str, override_name: Option<&str>) -> String {
    match override_name {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => derive(HOST_PREFIX, container_id),
    }
}

/// Name of the redirect device used for ingress shaping.
pub fn ifb_name(container_id: &str) -> String {
    derive(IFB_PREFIX, container_id)
}

fn derive(prefix: &str, container_id: &str) -> String {
    let short: String = container_id.chars().take(ID_CHARS).collect();
    format!("{prefix}{short}")
}
