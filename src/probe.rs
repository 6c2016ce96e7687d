//! Resolves the address the server advertises in discovery acks.
//!
//! Run once at startup. There is no retry and no interface-change watcher —
//! a server that changes IP address needs to restart, same as the rest of
//! the fabric's "restart to recover" posture.

use std::net::{IpAddr, Ipv4Addr};

/// Used when no non-loopback IPv4 interface can be found. A controller that
/// gets this back in an ack will simply fail to reach the TCP port, which is
/// no worse than the server not having started.
pub const FALLBACK_ADDRESS: Ipv4Addr = Ipv4Addr::LOCALHOST;

/// Enumerates local network interfaces and picks the first non-loopback
/// IPv4 address, falling back to [`FALLBACK_ADDRESS`] if enumeration fails
/// or nothing suitable is found.
pub fn probe_primary_ipv4() -> Ipv4Addr {
    match if_addrs::get_if_addrs() {
        Ok(interfaces) => {
            let candidates = interfaces
                .into_iter()
                .filter(|iface| !iface.is_loopback())
                .map(|iface| iface.ip());
            primary_ipv4_from(candidates)
        }
        Err(error) => {
            tracing::warn!(%error, "failed to enumerate network interfaces, falling back to loopback");
            FALLBACK_ADDRESS
        }
    }
}

/// Pure selection logic, factored out so it can be exercised without
/// touching real interfaces.
fn primary_ipv4_from(addrs: impl IntoIterator<Item = IpAddr>) -> Ipv4Addr {
    addrs
        .into_iter()
        .find_map(|ip| match ip {
            IpAddr::V4(v4) if !v4.is_loopback() => Some(v4),
            _ => None,
        })
        .unwrap_or_else(|| {
            tracing::warn!("no non-loopback IPv4 interface found, falling back to loopback");
            FALLBACK_ADDRESS
        })
}
