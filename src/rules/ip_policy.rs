//! IP Policy Evaluator
//!
//! Decides allow/block for a requester address against the IP lists bound
//! to a resource. The decision surface is kept exactly as deployed proxies
//! expect it:
//!
//! - no lists bound: allow
//! - unparseable address: block
//! - `blacklist` list containing the address: block
//! - any list *not* containing the address: block, whatever its type
//!
//! The first block wins. Note the last rule: an address must be covered by
//! every bound list to pass.

use std::net::{IpAddr, SocketAddr};
use tracing::debug;

use super::{IpList, ScanResult};

pub const REASON_IP_ALLOWED: &str = "Requester IP was detected in ip list.";
pub const REASON_INVALID_IP: &str = "Invalid IP address format.";
pub const REASON_BLACKLISTED: &str = "Requester IP is blacklisted.";
pub const REASON_NOT_LISTED: &str = "Requester IP is not covered by the ip list.";

/// Parse a requester address, dropping any port suffix.
///
/// Accepts `1.2.3.4`, `1.2.3.4:8080`, `::1`, `[::1]` and `[::1]:8080`.
pub fn parse_requester_ip(raw: &str) -> Option<IpAddr> {
    let raw = raw.trim();

    if let Ok(socket) = raw.parse::<SocketAddr>() {
        return Some(socket.ip());
    }
    if let Ok(ip) = raw.parse::<IpAddr>() {
        return Some(ip);
    }
    if let Some(inner) = raw.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
        return inner.parse().ok();
    }

    // host:port where the port is not numeric
    match raw.split_once(':') {
        Some((host, port)) if !port.contains(':') => host.parse().ok(),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IpPolicyEvaluator;

impl IpPolicyEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Evaluate `requester` against `lists` in the given order
    pub fn evaluate(&self, requester: &str, lists: &[IpList]) -> ScanResult {
        if lists.is_empty() {
            return ScanResult::allow(REASON_IP_ALLOWED);
        }

        let ip = match parse_requester_ip(requester) {
            Some(ip) => ip,
            None => {
                debug!("Unparseable requester address {:?}", requester);
                return ScanResult::block(REASON_INVALID_IP);
            }
        };

        for list in lists {
            if let Some(blocked) = Self::check_list(ip, list) {
                debug!(
                    "Requester {} blocked by ip list {} ({} {})",
                    ip, list.id, list.list_type, list.ip
                );
                return blocked;
            }
        }

        ScanResult::allow(REASON_IP_ALLOWED)
    }

    /// Block verdict for a single list, if any
    fn check_list(ip: IpAddr, list: &IpList) -> Option<ScanResult> {
        let contained = list.contains(ip);

        if contained && list.is_blacklist() {
            Some(ScanResult::block(REASON_BLACKLISTED))
        } else if !contained {
            Some(ScanResult::block(REASON_NOT_LISTED))
        } else {
            None
        }
    }
}
