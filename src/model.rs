//! Control-plane wire model
//!
//! Typed documents exchanged with the control plane. Unknown keys are
//! preserved in an `extensions` map so newer control planes can ship
//! fields this agent does not understand yet.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Desired configuration document pulled from the control plane.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DesiredConfig {
    #[serde(default)]
    pub version_hash: Option<String>,
    #[serde(default)]
    pub peers: Vec<PeerSpec>,
    #[serde(default)]
    pub ibgp_peers: Vec<IbgpPeerSpec>,
    #[serde(default)]
    pub local_ipv6: Option<String>,
    #[serde(default)]
    pub node_info: Option<NodeInfo>,
    #[serde(flatten)]
    pub extensions: BTreeMap<String, serde_json::Value>,
}

/// Node-scoped network attributes attached to the desired config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeInfo {
    #[serde(default)]
    pub dn42_ipv4: Option<String>,
    #[serde(default)]
    pub dn42_ipv6: Option<String>,
    #[serde(default)]
    pub loopback: Option<String>,
    #[serde(flatten)]
    pub extensions: BTreeMap<String, serde_json::Value>,
}

/// One eBGP peer, keyed by its remote ASN.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeerSpec {
    pub asn: u32,
    #[serde(default)]
    pub tunnel: TunnelSpec,
    #[serde(default)]
    pub bgp: BgpSpec,
    #[serde(flatten)]
    pub extensions: BTreeMap<String, serde_json::Value>,
}

/// Tunnel parameters for a peer. Exactly one tunnel type per peer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TunnelSpec {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub public_key: String,
    #[serde(default)]
    pub preshared_key: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub listen_port: Option<u16>,
}

impl TunnelSpec {
    pub fn is_wireguard(&self) -> bool {
        self.kind == "wireguard" || self.kind == "wg"
    }
}

/// BGP session parameters for a peer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BgpSpec {
    #[serde(default)]
    pub local_ipv4: Option<String>,
    #[serde(default)]
    pub local_ipv6: Option<String>,
    #[serde(default)]
    pub peer_ipv4: Option<String>,
    #[serde(default)]
    pub peer_ipv6: Option<String>,
    #[serde(default)]
    pub multihop: Option<u8>,
    #[serde(default)]
    pub extended_next_hop: Option<bool>,
}

/// iBGP peer entry carried in the desired config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IbgpPeerSpec {
    pub name: String,
    pub loopback: String,
    #[serde(default)]
    pub is_rr_client: bool,
}

/// Mesh configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeshConfig {
    #[serde(default)]
    pub loopback: Option<String>,
    #[serde(default)]
    pub dn42_ipv4: Option<String>,
    #[serde(default)]
    pub dn42_ipv6: Option<String>,
    #[serde(default)]
    pub is_rr: bool,
    #[serde(default)]
    pub peers: Vec<MeshPeerSpec>,
}

/// One mesh peer; maps to one point-to-point tunnel interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshPeerSpec {
    pub node_id: u32,
    pub name: String,
    pub public_key: String,
    /// IPv6 /128 loopback of the peer.
    pub loopback: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Optional override for the port we connect to on the peer.
    #[serde(default)]
    pub port: Option<u16>,
}

/// Registration request sent on startup.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegisterRequest {
    pub hostname: String,
    pub agent_version: String,
    pub region: String,
    pub is_rr: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv4: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dn42_ipv4: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dn42_ipv6: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loopback_ipv6: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mesh_public_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ebgp_public_key: Option<String>,
}

/// Registration response; `numeric_node_id` establishes the node identity.
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterResponse {
    pub status: String,
    pub node_name: String,
    #[serde(default)]
    pub numeric_node_id: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_spec_roundtrip_preserves_unknown_keys() {
        let raw = serde_json::json!({
            "asn": 4242420337u32,
            "tunnel": {"type": "wireguard", "public_key": "K1", "endpoint": "198.51.100.7:51820"},
            "bgp": {"peer_ipv4": "172.22.188.42"},
            "experimental_flag": true,
        });
        let peer: PeerSpec = serde_json::from_value(raw).unwrap();
        assert_eq!(peer.asn, 4242420337);
        assert!(peer.tunnel.is_wireguard());
        assert_eq!(peer.extensions.get("experimental_flag").unwrap(), &serde_json::json!(true));

        let back = serde_json::to_value(&peer).unwrap();
        assert_eq!(back.get("experimental_flag").unwrap(), &serde_json::json!(true));
    }

    #[test]
    fn test_desired_config_defaults() {
        let cfg: DesiredConfig = serde_json::from_str(r#"{"version_hash": "v1"}"#).unwrap();
        assert_eq!(cfg.version_hash.as_deref(), Some("v1"));
        assert!(cfg.peers.is_empty());
        assert!(cfg.ibgp_peers.is_empty());
    }
}
