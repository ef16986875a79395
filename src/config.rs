//! Agent configuration
//!
//! Loaded from a JSON file (`AGENT_CONFIG`, default `config.json`), with
//! environment variables layered on top so containerized deployments can
//! run file-less.

use crate::AgentError;
use ipnetwork::{Ipv4Network, Ipv6Network};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Control plane base URL.
    pub control_plane_url: String,
    /// Bearer token for control-plane calls.
    pub control_plane_token: String,
    /// This node's name, as registered with the control plane.
    pub node_name: String,

    /// Seconds between configuration syncs.
    pub sync_interval: u64,
    /// Seconds between heartbeats.
    pub heartbeat_interval: u64,

    /// Directory holding the state journal and mesh private key.
    pub state_dir: PathBuf,
    /// BIRD configuration root (`peers.d/`, `ibgp.d/`, `filters.d/`).
    pub bird_config_dir: PathBuf,
    /// BIRD control socket.
    pub bird_ctl: PathBuf,
    /// WireGuard configuration directory.
    pub wg_config_dir: PathBuf,

    /// Operator API bind address and port.
    pub api_host: String,
    pub api_port: u16,
    /// Bearer token for the operator API; empty disables auth.
    pub api_token: String,

    /// Local autonomous system number.
    pub local_asn: u32,
    /// Overlay prefixes the node addresses are carved from.
    pub dn42_ipv4_prefix: Ipv4Network,
    pub dn42_ipv6_prefix: Ipv6Network,
    /// Base UDP port for mesh tunnels.
    pub mesh_base_port: u16,

    /// Geographic region reported at registration.
    pub region: String,
    /// Route-reflector role; inferred from the node name when unset.
    pub is_rr: Option<bool>,
    /// Public addresses reported at registration.
    pub public_ipv4: Option<String>,
    pub public_ipv6: Option<String>,
    /// Overlay addresses reported at registration.
    pub dn42_ipv4: Option<String>,
    pub dn42_ipv6: Option<String>,

    /// Latency prober switch and cadence.
    pub probe_enabled: bool,
    pub probe_interval: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            control_plane_url: String::new(),
            control_plane_token: String::new(),
            node_name: String::new(),
            sync_interval: 60,
            heartbeat_interval: 30,
            state_dir: PathBuf::from("/var/lib/moenet-agent"),
            bird_config_dir: PathBuf::from("/etc/bird"),
            bird_ctl: PathBuf::from("/var/run/bird/bird.ctl"),
            wg_config_dir: PathBuf::from("/etc/wireguard"),
            api_host: "0.0.0.0".into(),
            api_port: 8043,
            api_token: String::new(),
            local_asn: 4242420998,
            dn42_ipv4_prefix: "172.22.188.0/26".parse().expect("valid default prefix"),
            dn42_ipv6_prefix: "fd00:4242:7777::/48".parse().expect("valid default prefix"),
            mesh_base_port: crate::layout::MESH_BASE_PORT,
            region: "unknown".into(),
            is_rr: None,
            public_ipv4: None,
            public_ipv6: None,
            dn42_ipv4: None,
            dn42_ipv6: None,
            probe_enabled: true,
            probe_interval: 300,
        }
    }
}

impl AgentConfig {
    /// Load from `AGENT_CONFIG` (default `config.json`), then apply
    /// environment overrides, then validate.
    pub fn load() -> Result<Self, AgentError> {
        let path = std::env::var("AGENT_CONFIG").unwrap_or_else(|_| "config.json".into());
        let mut config = Self::load_file(Path::new(&path))?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn load_file(path: &Path) -> Result<Self, AgentError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw)
            .map_err(|e| AgentError::Config(format!("{}: {e}", path.display())))
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("CONTROL_PLANE_URL") {
            self.control_plane_url = v;
        }
        if let Ok(v) = std::env::var("CONTROL_PLANE_TOKEN") {
            self.control_plane_token = v;
        }
        if let Ok(v) = std::env::var("NODE_NAME") {
            self.node_name = v;
        }
        if let Ok(v) = std::env::var("SYNC_INTERVAL") {
            if let Ok(v) = v.parse() {
                self.sync_interval = v;
            }
        }
        if let Ok(v) = std::env::var("HEARTBEAT_INTERVAL") {
            if let Ok(v) = v.parse() {
                self.heartbeat_interval = v;
            }
        }
        if let Ok(v) = std::env::var("STATE_PATH") {
            self.state_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("API_HOST") {
            self.api_host = v;
        }
        if let Ok(v) = std::env::var("API_PORT") {
            if let Ok(v) = v.parse() {
                self.api_port = v;
            }
        }
        if let Ok(v) = std::env::var("API_TOKEN") {
            self.api_token = v;
        }
    }

    fn validate(&self) -> Result<(), AgentError> {
        if self.control_plane_url.is_empty() {
            return Err(AgentError::Config("control_plane_url is required".into()));
        }
        if self.node_name.is_empty() {
            return Err(AgentError::Config("node_name is required".into()));
        }
        Ok(())
    }

    /// Route-reflector role: explicit config wins, otherwise inferred
    /// from the node name.
    pub fn is_route_reflector(&self) -> bool {
        self.is_rr
            .unwrap_or_else(|| self.node_name.to_lowercase().contains("rr"))
    }

    pub fn state_path(&self) -> PathBuf {
        self.state_dir.join("last_state.json")
    }

    pub fn mesh_key_path(&self) -> PathBuf {
        self.state_dir.join("mesh_private_key")
    }

    pub fn agent_version() -> &'static str {
        env!("CARGO_PKG_VERSION")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.sync_interval, 60);
        assert_eq!(config.heartbeat_interval, 30);
        assert_eq!(config.local_asn, 4242420998);
        assert_eq!(config.mesh_base_port, 51820);
        assert!(config.probe_enabled);
    }

    #[test]
    fn test_validate_requires_url_and_name() {
        let config = AgentConfig::default();
        assert!(config.validate().is_err());

        let config = AgentConfig {
            control_plane_url: "https://cp.moenet.example".into(),
            node_name: "hk-edge".into(),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rr_inference() {
        let mut config = AgentConfig {
            node_name: "sfo-rr1".into(),
            ..Default::default()
        };
        assert!(config.is_route_reflector());

        config.node_name = "hk-edge".into();
        assert!(!config.is_route_reflector());

        config.is_rr = Some(true);
        assert!(config.is_route_reflector());
    }

    #[test]
    fn test_load_file_partial_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"control_plane_url": "https://cp", "node_name": "hk-edge", "api_port": 9000}"#,
        )
        .unwrap();
        let config = AgentConfig::load_file(&path).unwrap();
        assert_eq!(config.api_port, 9000);
        assert_eq!(config.sync_interval, 60);
        assert_eq!(config.node_name, "hk-edge");
    }

    #[test]
    fn test_derived_paths() {
        let config = AgentConfig::default();
        assert_eq!(
            config.state_path(),
            PathBuf::from("/var/lib/moenet-agent/last_state.json")
        );
        assert_eq!(
            config.mesh_key_path(),
            PathBuf::from("/var/lib/moenet-agent/mesh_private_key")
        );
    }
}
