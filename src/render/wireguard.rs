//! WireGuard config rendering
//!
//! INI-style interface configs for eBGP peer tunnels and mesh tunnels.
//! The executor parses these files back when driving `wg` directly, so the
//! key names here are load-bearing.

use crate::layout;
use crate::model::{MeshPeerSpec, PeerSpec};

/// Render the tunnel config for an eBGP peer.
///
/// The allowed-address set is the base overlay coverage (all of IPv4, the
/// overlay ULA range, link-local IPv6); a publicly routable peer IPv6 gets
/// its /128 appended so the session address stays inside the tunnel.
pub fn render_peer_tunnel(
    peer: &PeerSpec,
    private_key: &str,
    listen_port: u16,
    local_address: Option<&str>,
) -> String {
    let ifname = layout::tunnel_ifname(peer.asn);
    let mut out = String::new();

    out.push_str("[Interface]\n");
    out.push_str(&format!("# {ifname}\n"));
    out.push_str(&format!("PrivateKey = {private_key}\n"));
    out.push_str(&format!("ListenPort = {listen_port}\n"));
    if let Some(addr) = local_address {
        out.push_str(&format!("Address = {addr}\n"));
    }

    out.push_str("\n[Peer]\n");
    out.push_str(&format!("PublicKey = {}\n", peer.tunnel.public_key));
    if let Some(psk) = &peer.tunnel.preshared_key {
        out.push_str(&format!("PresharedKey = {psk}\n"));
    }
    if let Some(endpoint) = &peer.tunnel.endpoint {
        out.push_str(&format!("Endpoint = {endpoint}\n"));
    }
    out.push_str(&format!("AllowedIPs = {}\n", allowed_ips(peer).join(", ")));

    out
}

fn allowed_ips(peer: &PeerSpec) -> Vec<String> {
    let mut ips = vec![
        "0.0.0.0/0".to_string(),
        "fd00::/8".to_string(),
        "fe80::/10".to_string(),
    ];
    if let Some(v6) = &peer.bgp.peer_ipv6 {
        if !v6.starts_with("fe80") {
            ips.push(format!("{v6}/128"));
        }
    }
    ips
}

/// Render the tunnel config for a mesh peer.
///
/// Listen port and endpoint port follow the symmetric scheme: we listen on
/// `base + peer_id`, the peer listens for us on `base + own_id`.
pub fn render_mesh_interface(
    private_key: &str,
    own_node_id: u32,
    peer: &MeshPeerSpec,
    base_port: u16,
) -> String {
    let ifname = layout::mesh_ifname(peer.node_id);
    let listen_port = layout::mesh_listen_port(peer.node_id, base_port);
    let link_local = layout::link_local(own_node_id);

    let mut out = String::new();
    out.push_str("[Interface]\n");
    out.push_str(&format!("# {ifname} -> {}\n", peer.name));
    out.push_str(&format!("PrivateKey = {private_key}\n"));
    out.push_str(&format!("ListenPort = {listen_port}\n"));
    out.push_str(&format!("Address = {link_local}/64\n"));

    out.push_str("\n[Peer]\n");
    out.push_str(&format!("PublicKey = {}\n", peer.public_key));
    if let Some(endpoint) = &peer.endpoint {
        let port = peer
            .port
            .unwrap_or_else(|| layout::mesh_listen_port(own_node_id, base_port));
        out.push_str(&format!("Endpoint = {endpoint}:{port}\n"));
        out.push_str("PersistentKeepalive = 25\n");
    }
    // The kernel owns routing; cryptokey routing only gates per interface.
    out.push_str("AllowedIPs = 0.0.0.0/0, ::/0\n");

    out
}

/// Minimal view of a rendered interface config, as the executor needs it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedInterface {
    pub private_key: Option<String>,
    pub listen_port: Option<u16>,
    pub address: Option<String>,
    /// Everything from `[Peer]` onward, fed verbatim to `wg setconf`.
    pub peer_section: Option<String>,
}

/// Parse the fields the executor re-applies after `setconf`.
pub fn parse_interface(config: &str) -> ParsedInterface {
    let mut parsed = ParsedInterface::default();

    if let Some(idx) = config.find("[Peer]") {
        parsed.peer_section = Some(config[idx..].to_string());
    }

    for line in config.lines() {
        let line = line.trim();
        if line == "[Peer]" {
            break;
        }
        if let Some((key, value)) = line.split_once('=') {
            let (key, value) = (key.trim(), value.trim());
            match key {
                "PrivateKey" => parsed.private_key = Some(value.to_string()),
                "ListenPort" => parsed.listen_port = value.parse().ok(),
                "Address" => parsed.address = Some(value.to_string()),
                _ => {}
            }
        }
    }

    parsed
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
                public_key: "PEER_PUB_KEY".into(),
                preshared_key: None,
                endpoint: Some("198.51.100.7:51820".into()),
                listen_port: None,
            },
            bgp: BgpSpec {
                peer_ipv4: Some("172.22.188.42".into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_render_is_deterministic() {
        let peer = sample_peer();
        let a = render_peer_tunnel(&peer, "PRIV", 30337, Some("fe80::3/64"));
        let b = render_peer_tunnel(&peer, "PRIV", 30337, Some("fe80::3/64"));
        assert_eq!(a, b);
    }

    #[test]
    fn test_render_peer_tunnel_contents() {
        let peer = sample_peer();
        let text = render_peer_tunnel(&peer, "PRIV", 30337, None);
        assert!(text.contains("# dn42-4242420337"));
        assert!(text.contains("ListenPort = 30337"));
        assert!(text.contains("PublicKey = PEER_PUB_KEY"));
        assert!(text.contains("Endpoint = 198.51.100.7:51820"));
        assert!(text.contains("AllowedIPs = 0.0.0.0/0, fd00::/8, fe80::/10"));
        assert!(!text.contains("PresharedKey"));
    }

    #[test]
    fn test_public_peer_ipv6_appended() {
        let mut peer = sample_peer();
        peer.bgp.peer_ipv6 = Some("fd42:2337::1".into());
        let text = render_peer_tunnel(&peer, "PRIV", 30337, None);
        assert!(text.contains("fd42:2337::1/128"));

        peer.bgp.peer_ipv6 = Some("fe80::42".into());
        let text = render_peer_tunnel(&peer, "PRIV", 30337, None);
        assert!(!text.contains("fe80::42/128"));
    }

    #[test]
    fn test_render_mesh_interface() {
        let peer = MeshPeerSpec {
            node_id: 7,
            name: "jp-edge".into(),
            public_key: "MESH_PUB".into(),
            loopback: "fd00:4242:7777::7".into(),
            endpoint: Some("203.0.113.9".into()),
            port: None,
        };
        let text = render_mesh_interface("PRIV", 3, &peer, layout::MESH_BASE_PORT);
        assert!(text.contains("# dn42-wg-igp-7 -> jp-edge"));
        assert!(text.contains("ListenPort = 51827"));
        assert!(text.contains("Endpoint = 203.0.113.9:51823"));
        assert!(text.contains("Address = fe80::3/64"));
        assert!(text.contains("PersistentKeepalive = 25"));
    }

    #[test]
    fn test_parse_interface_roundtrip() {
        let peer = sample_peer();
        let text = render_peer_tunnel(&peer, "PRIV", 30337, Some("fe80::3/64"));
        let parsed = parse_interface(&text);
        assert_eq!(parsed.private_key.as_deref(), Some("PRIV"));
        assert_eq!(parsed.listen_port, Some(30337));
        assert_eq!(parsed.address.as_deref(), Some("fe80::3/64"));
        let section = parsed.peer_section.unwrap();
        assert!(section.starts_with("[Peer]"));
        assert!(section.contains("PublicKey = PEER_PUB_KEY"));
    }
}
