//! Job keys.
//!
//! Every mutation is serialized on one of these keys; see
//! [`JobCoordinator`](elan_orch_common::JobCoordinator).

use elan_types::{DatapathId, MacAddress};

/// Membership, group and tag mutation of a domain.
pub fn domain_key(domain: &str) -> String {
    format!("elan:{}", domain)
}

/// Add/remove lifecycle of an interface.
pub fn port_key(port: &str) -> String {
    format!("port:{}", port)
}

/// Ownership decisions for a MAC address.
pub fn mac_key(domain: &str, mac: &MacAddress) -> String {
    format!("mac:{}:{}", domain, mac)
}

/// Forwarding rule programming for a MAC address on one switch.
pub fn mac_switch_key(domain: &str, mac: &MacAddress, dpn: DatapathId) -> String {
    format!("mac:{}:{}:{}", domain, mac, dpn)
}
