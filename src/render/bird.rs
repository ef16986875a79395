//! BIRD config rendering
//!
//! Per-peer eBGP protocol blocks and iBGP underlay sessions. Output is
//! byte-stable for a given input and parses back into the same logical
//! peer, which the reconciler relies on for drift detection.

use crate::layout;
use crate::model::{IbgpPeerSpec, PeerSpec};

/// Render the eBGP protocol block for one peer.
///
/// The session address prefers the in-tunnel IPv6 neighbor (link-local
/// sessions carry the interface with `%`); IPv4-only peers get a plain
/// IPv4 neighbor.
pub fn render_ebgp_peer(peer: &PeerSpec, local_asn: u32) -> String {
    let protocol = layout::protocol_name(peer.asn);
    let ifname = layout::tunnel_ifname(peer.asn);

    let neighbor = match (&peer.bgp.peer_ipv6, &peer.bgp.peer_ipv4) {
        (Some(v6), _) if v6.starts_with("fe80") => format!("{v6} % '{ifname}'"),
        (Some(v6), _) => v6.clone(),
        (None, Some(v4)) => v4.clone(),
        (None, None) => format!("fe80::1 % '{ifname}'"),
    };

    let mut out = String::new();
    out.push_str(&format!("# AS{}\n", peer.asn));
    out.push_str(&format!("protocol bgp {protocol} {{\n"));
    out.push_str(&format!("    local as {local_asn};\n"));
    out.push_str(&format!("    neighbor {neighbor} as {};\n", peer.asn));
    if let Some(source) = source_address(peer) {
        out.push_str(&format!("    source address {source};\n"));
    }
    if let Some(hops) = peer.bgp.multihop {
        out.push_str(&format!("    multihop {hops};\n"));
    }
    out.push_str("    path metric 1;\n");

    let enh = peer.bgp.extended_next_hop.unwrap_or(false);
    out.push_str("    ipv4 {\n");
    out.push_str("        import filter dn42_import;\n");
    out.push_str("        export filter dn42_export;\n");
    if enh {
        out.push_str("        extended next hop on;\n");
    }
    out.push_str("    };\n");
    out.push_str("    ipv6 {\n");
    out.push_str("        import filter dn42_import;\n");
    out.push_str("        export filter dn42_export;\n");
    out.push_str("    };\n");
    out.push_str("}\n");

    out
}

fn source_address(peer: &PeerSpec) -> Option<String> {
    // Match the source family to the session family.
    match (&peer.bgp.peer_ipv6, &peer.bgp.peer_ipv4) {
        (Some(v6), _) if !v6.starts_with("fe80") => peer.bgp.local_ipv6.clone(),
        (Some(_), _) => None,
        (None, Some(_)) => peer.bgp.local_ipv4.clone(),
        (None, None) => None,
    }
}

/// Render an iBGP session toward a mesh peer's loopback.
pub fn render_ibgp_peer(
    peer: &IbgpPeerSpec,
    local_asn: u32,
    local_loopback: Option<&str>,
    rr_client: bool,
) -> String {
    let mut out = String::new();
    out.push_str(&format!("# iBGP {}\n", peer.name));
    out.push_str(&format!("protocol bgp ibgp_{} {{\n", safe_name(&peer.name)));
    out.push_str(&format!("    local as {local_asn};\n"));
    if let Some(source) = local_loopback {
        out.push_str(&format!("    source address {source};\n"));
    }
    out.push_str(&format!("    neighbor {} as {local_asn};\n", peer.loopback));
    out.push_str("    multihop;\n");
    if rr_client {
        out.push_str("    rr client;\n");
    }
    for family in ["ipv4", "ipv6"] {
        out.push_str(&format!("    {family} {{\n"));
        out.push_str("        import all;\n");
        out.push_str("        export all;\n");
        out.push_str("        next hop self;\n");
        out.push_str("    };\n");
    }
    out.push_str("}\n");
    out
}

/// File-name-safe form of a peer name (BIRD also dislikes dots and
/// hyphens in protocol names).
pub fn safe_name(name: &str) -> String {
    name.replace(['.', '-'], "_")
}

/// Logical peer recovered from a rendered eBGP protocol block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedBgpPeer {
    pub protocol: String,
    pub asn: u32,
    pub local_asn: u32,
    pub neighbor: String,
    pub neighbor_interface: Option<String>,
    pub source_address: Option<String>,
    pub multihop: Option<u8>,
    pub extended_next_hop: bool,
}

/// Parse a rendered eBGP protocol block back into its logical peer.
pub fn parse_ebgp_peer(config: &str) -> Option<ParsedBgpPeer> {
    let mut peer = ParsedBgpPeer::default();
    let mut found_protocol = false;

    for line in config.lines() {
        let line = line.trim().trim_end_matches(';');
        if let Some(rest) = line.strip_prefix("protocol bgp ") {
            peer.protocol = rest.trim_end_matches(" {").trim().to_string();
            found_protocol = true;
        } else if let Some(rest) = line.strip_prefix("local as ") {
            peer.local_asn = rest.trim().parse().ok()?;
        } else if let Some(rest) = line.strip_prefix("neighbor ") {
            let (addr, asn) = rest.split_once(" as ")?;
            peer.asn = asn.trim().parse().ok()?;
            let addr = addr.trim();
            match addr.split_once('%') {
                Some((ip, ifname)) => {
                    peer.neighbor = ip.trim().to_string();
                    peer.neighbor_interface =
                        Some(ifname.trim().trim_matches('\'').to_string());
                }
                None => peer.neighbor = addr.to_string(),
            }
        } else if let Some(rest) = line.strip_prefix("source address ") {
            peer.source_address = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("multihop ") {
            peer.multihop = rest.trim().parse().ok();
        } else if line == "extended next hop on" {
            peer.extended_next_hop = true;
        }
    }

    found_protocol.then_some(peer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BgpSpec, TunnelSpec};

    fn sample_peer() -> PeerSpec {
        PeerSpec {
            asn: 4242420337,
            tunnel: TunnelSpec {
                kind: "wireguard".into(),
                public_key: "K1".into(),
                ..Default::default()
            },
            bgp: BgpSpec {
                peer_ipv4: Some("172.22.188.42".into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_render_parse_roundtrip_ipv4() {
        let peer = sample_peer();
        let text = render_ebgp_peer(&peer, 4242420998);
        let parsed = parse_ebgp_peer(&text).unwrap();
        assert_eq!(parsed.protocol, "dn42_4242420337");
        assert_eq!(parsed.asn, 4242420337);
        assert_eq!(parsed.local_asn, 4242420998);
        assert_eq!(parsed.neighbor, "172.22.188.42");
        assert_eq!(parsed.neighbor_interface, None);
        assert_eq!(parsed.multihop, None);
        assert!(!parsed.extended_next_hop);
    }

    #[test]
    fn test_render_parse_roundtrip_link_local() {
        let mut peer = sample_peer();
        peer.bgp.peer_ipv6 = Some("fe80::42".into());
        peer.bgp.extended_next_hop = Some(true);
        let text = render_ebgp_peer(&peer, 4242420998);
        let parsed = parse_ebgp_peer(&text).unwrap();
        assert_eq!(parsed.neighbor, "fe80::42");
        assert_eq!(parsed.neighbor_interface.as_deref(), Some("dn42-4242420337"));
        assert!(parsed.extended_next_hop);
    }

    #[test]
    fn test_render_parse_roundtrip_multihop() {
        let mut peer = sample_peer();
        peer.bgp.peer_ipv6 = Some("fd42:2337::1".into());
        peer.bgp.local_ipv6 = Some("fd00:4242:7777::3".into());
        peer.bgp.multihop = Some(2);
        let text = render_ebgp_peer(&peer, 4242420998);
        let parsed = parse_ebgp_peer(&text).unwrap();
        assert_eq!(parsed.neighbor, "fd42:2337::1");
        assert_eq!(parsed.source_address.as_deref(), Some("fd00:4242:7777::3"));
        assert_eq!(parsed.multihop, Some(2));
    }

    #[test]
    fn test_render_is_byte_stable() {
        let peer = sample_peer();
        assert_eq!(
            render_ebgp_peer(&peer, 4242420998),
            render_ebgp_peer(&peer, 4242420998)
        );
    }

    #[test]
    fn test_render_ibgp_peer() {
        let peer = IbgpPeerSpec {
            name: "sfo-rr1.dn42".into(),
            loopback: "fd00:4242:7777::7".into(),
            is_rr_client: false,
        };
        let text = render_ibgp_peer(&peer, 4242420998, Some("fd00:4242:7777::3"), true);
        assert!(text.contains("protocol bgp ibgp_sfo_rr1_dn42 {"));
        assert!(text.contains("neighbor fd00:4242:7777::7 as 4242420998;"));
        assert!(text.contains("source address fd00:4242:7777::3;"));
        assert!(text.contains("rr client;"));
        assert!(text.contains("next hop self;"));
    }

    #[test]
    fn test_safe_name() {
        assert_eq!(safe_name("sfo-rr1.dn42"), "sfo_rr1_dn42");
    }
}
