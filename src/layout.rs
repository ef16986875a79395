//! Mesh Layout Engine
//!
//! Deterministic derivation of interface names, listen ports, link-local
//! addresses, and loopback addresses from node identifiers. Every component
//! consumes these helpers, so two agents computing the same peer always
//! arrive at the same wire parameters.

use crate::AgentError;
use ipnetwork::{Ipv4Network, Ipv6Network};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::ops::RangeInclusive;

/// Base UDP port for the IGP mesh; a tunnel to peer `p` listens on `base + p`.
pub const MESH_BASE_PORT: u16 = 51820;

/// Default MTU for mesh tunnels over the public internet.
pub const MESH_MTU_DEFAULT: u16 = 1400;

/// MTU for mesh tunnels over private or dedicated links.
pub const MESH_MTU_PRIVATE: u16 = 1420;

/// ASN windows with dedicated eBGP listen-port ranges.
const DN42_ASN_RANGE: RangeInclusive<u32> = 4242420000..=4242429999;
const NEONETWORK_ASN_RANGE: RangeInclusive<u32> = 4201270000..=4201279999;

/// Tunnel interface name for an eBGP peer.
pub fn tunnel_ifname(asn: u32) -> String {
    format!("dn42-{asn}")
}

/// Mesh tunnel interface name for a peer node.
pub fn mesh_ifname(peer_node_id: u32) -> String {
    format!("dn42-wg-igp-{peer_node_id}")
}

// BIRD rejects hyphens in protocol names, hence the underscore.
pub fn protocol_name(asn: u32) -> String {
    format!("dn42_{asn}")
}

/// WireGuard listen port for an eBGP peer, derived from the remote ASN.
///
/// Injective within each ASN window; ASNs outside all known windows fall
/// back to the 50000 range.
pub fn ebgp_listen_port(asn: u32) -> u16 {
    let suffix = (asn % 10000) as u16;
    if DN42_ASN_RANGE.contains(&asn) {
        30000 + suffix
    } else if NEONETWORK_ASN_RANGE.contains(&asn) {
        40000 + suffix
    } else {
        50000 + suffix
    }
}

/// Local listen port for the mesh tunnel toward `peer_node_id`.
///
/// Symmetric by construction: node `a` listens for `b` on `base + b`
/// and connects to `b` on `base + a`.
pub fn mesh_listen_port(peer_node_id: u32, base_port: u16) -> u16 {
    base_port + peer_node_id as u16
}

/// Link-local address carried on every mesh interface of this node.
pub fn link_local(node_id: u32) -> Ipv6Addr {
    Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, node_id as u16)
}

/// Highest valid node id for the overlay IPv4 prefix (network and
/// broadcast indices excluded).
pub fn max_node_id(prefix: &Ipv4Network) -> u32 {
    (1u32 << (32 - prefix.prefix())) - 2
}

/// Reject node ids that would collide with the network or broadcast
/// address, or fall outside the overlay prefix entirely.
pub fn validate_node_id(node_id: u32, prefix: &Ipv4Network) -> Result<(), AgentError> {
    let max = max_node_id(prefix);
    if node_id < 1 || node_id > max {
        return Err(AgentError::InvalidNodeId { id: node_id, max });
    }
    Ok(())
}

/// The node's /32 host address inside the overlay IPv4 prefix.
pub fn node_ipv4(node_id: u32, prefix: &Ipv4Network) -> Result<Ipv4Addr, AgentError> {
    validate_node_id(node_id, prefix)?;
    Ok(Ipv4Addr::from(u32::from(prefix.network()) + node_id))
}

/// The node's /128 loopback address inside the overlay IPv6 prefix.
pub fn node_ipv6(node_id: u32, prefix: &Ipv6Network) -> Ipv6Addr {
    Ipv6Addr::from(u128::from(prefix.network()) + node_id as u128)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4_prefix() -> Ipv4Network {
        "172.22.188.0/26".parse().unwrap()
    }

    fn v6_prefix() -> Ipv6Network {
        "fd00:4242:7777::/48".parse().unwrap()
    }

    #[test]
    fn test_listen_port_ranges() {
        assert_eq!(ebgp_listen_port(4242420337), 30337);
        assert_eq!(ebgp_listen_port(4201270001), 40001);
        assert_eq!(ebgp_listen_port(65001), 55001);
    }

    #[test]
    fn test_listen_port_deterministic() {
        for asn in [4242420001u32, 4242429999, 4201275000, 64512] {
            assert_eq!(ebgp_listen_port(asn), ebgp_listen_port(asn));
        }
    }

    #[test]
    fn test_listen_port_injective_within_range() {
        let mut seen = std::collections::HashSet::new();
        for asn in 4242420000u32..=4242429999 {
            assert!(seen.insert(ebgp_listen_port(asn)), "collision at {asn}");
        }
    }

    #[test]
    fn test_mesh_port_symmetry() {
        // Node a listens for b on base + b; b connects to a on the same
        // port it derives from a's perspective.
        let (a, b) = (3u32, 7u32);
        let a_listens_for_b = mesh_listen_port(b, MESH_BASE_PORT);
        let b_connects_to_a = mesh_listen_port(b, MESH_BASE_PORT);
        assert_eq!(a_listens_for_b, b_connects_to_a);

        let b_listens_for_a = mesh_listen_port(a, MESH_BASE_PORT);
        assert_eq!(b_listens_for_a, 51823);
        assert_eq!(a_listens_for_b, 51827);
    }

    #[test]
    fn test_interface_names() {
        assert_eq!(tunnel_ifname(4242420337), "dn42-4242420337");
        assert_eq!(mesh_ifname(4), "dn42-wg-igp-4");
        assert_eq!(protocol_name(4242420337), "dn42_4242420337");
    }

    #[test]
    fn test_node_id_bounds() {
        let prefix = v4_prefix();
        assert_eq!(max_node_id(&prefix), 62);
        assert!(validate_node_id(0, &prefix).is_err());
        assert!(validate_node_id(63, &prefix).is_err());
        assert!(validate_node_id(1, &prefix).is_ok());
        assert!(validate_node_id(62, &prefix).is_ok());
    }

    #[test]
    fn test_node_addresses() {
        assert_eq!(
            node_ipv4(4, &v4_prefix()).unwrap(),
            "172.22.188.4".parse::<Ipv4Addr>().unwrap()
        );
        assert_eq!(
            node_ipv6(4, &v6_prefix()),
            "fd00:4242:7777::4".parse::<Ipv6Addr>().unwrap()
        );
    }

    #[test]
    fn test_link_local() {
        assert_eq!(link_local(4), "fe80::4".parse::<Ipv6Addr>().unwrap());
    }
}
