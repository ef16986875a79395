//! Control-plane client
//!
//! JSON over HTTP with bearer-token auth. Every call carries a total
//! timeout; any network error or non-2xx is surfaced as
//! [`AgentError::ControlPlane`] and treated as transient by callers.

use crate::model::{DesiredConfig, MeshConfig, PeerSpec, RegisterRequest, RegisterResponse};
use crate::state::AppliedSnapshot;
use crate::AgentError;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP client for the control-plane API.
pub struct ControlPlaneClient {
    http: reqwest::Client,
    base_url: String,
    node_name: String,
}

impl ControlPlaneClient {
    pub fn new(base_url: &str, node_name: &str, token: &str) -> Result<Self, AgentError> {
        let mut headers = reqwest::header::HeaderMap::new();
        if !token.is_empty() {
            let value = format!("Bearer {token}")
                .parse()
                .map_err(|_| AgentError::Config("control plane token is not valid ASCII".into()))?;
            headers.insert(reqwest::header::AUTHORIZATION, value);
        }

        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .default_headers(headers)
            .build()
            .map_err(|e| AgentError::ControlPlane(e.to_string()))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            node_name: node_name.to_string(),
        })
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Fetch the desired configuration for this node.
    pub async fn get_config(&self) -> Result<DesiredConfig, AgentError> {
        let url = format!("{}/api/v1/agent/config", self.base_url);
        let resp = self
            .http
            .get(&url)
            .query(&[("node", self.node_name.as_str())])
            .send()
            .await
            .map_err(|e| AgentError::ControlPlane(format!("fetch config: {e}")))?;
        Self::expect_ok(&resp.status(), "fetch config")?;
        resp.json()
            .await
            .map_err(|e| AgentError::ControlPlane(format!("decode config: {e}")))
    }

    /// Fetch the mesh configuration for this node.
    pub async fn get_mesh_config(&self) -> Result<MeshConfig, AgentError> {
        let url = format!("{}/api/v1/mesh/config/{}", self.base_url, self.node_name);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| AgentError::ControlPlane(format!("fetch mesh config: {e}")))?;
        Self::expect_ok(&resp.status(), "fetch mesh config")?;
        resp.json()
            .await
            .map_err(|e| AgentError::ControlPlane(format!("decode mesh config: {e}")))
    }

    /// Register this node; the response carries the numeric node id that
    /// establishes the node identity.
    pub async fn register_node(
        &self,
        request: &RegisterRequest,
    ) -> Result<RegisterResponse, AgentError> {
        let url = format!("{}/api/v1/agent/register", self.base_url);
        let resp = self
            .http
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| AgentError::ControlPlane(format!("register: {e}")))?;
        Self::expect_ok(&resp.status(), "register")?;
        let parsed: RegisterResponse = resp
            .json()
            .await
            .map_err(|e| AgentError::ControlPlane(format!("decode registration: {e}")))?;
        debug!(status = %parsed.status, node = %parsed.node_name, "node registered");
        Ok(parsed)
    }

    /// Register the mesh WireGuard public key.
    pub async fn register_mesh_key(&self, public_key: &str) -> Result<(), AgentError> {
        let url = format!(
            "{}/api/v1/mesh/register-key/{}",
            self.base_url, self.node_name
        );
        let resp = self
            .http
            .post(&url)
            .json(&serde_json::json!({ "public_key": public_key }))
            .send()
            .await
            .map_err(|e| AgentError::ControlPlane(format!("register mesh key: {e}")))?;
        Self::expect_ok(&resp.status(), "register mesh key")
    }

    /// Post a heartbeat with the current health status.
    pub async fn send_heartbeat(
        &self,
        config_hash: Option<&str>,
        status: &serde_json::Value,
    ) -> Result<(), AgentError> {
        let url = format!("{}/api/v1/agent/heartbeat", self.base_url);
        let payload = serde_json::json!({
            "node_id": self.node_name,
            "agent_version": crate::config::AgentConfig::agent_version(),
            "config_version_hash": config_hash,
            "status": status,
        });
        let resp = self
            .http
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| AgentError::ControlPlane(format!("heartbeat: {e}")))?;
        Self::expect_ok(&resp.status(), "heartbeat")
    }

    /// Upload the applied-state journal for disaster recovery.
    pub async fn report_state(&self, state: &AppliedSnapshot) -> Result<(), AgentError> {
        let url = format!("{}/api/v1/agent/state", self.base_url);
        let payload = serde_json::json!({
            "node_id": self.node_name,
            "last_state": state,
        });
        let resp = self
            .http
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| AgentError::ControlPlane(format!("report state: {e}")))?;
        Self::expect_ok(&resp.status(), "report state")
    }

    fn expect_ok(status: &StatusCode, what: &str) -> Result<(), AgentError> {
        if status.is_success() {
            Ok(())
        } else {
            Err(AgentError::ControlPlane(format!("{what}: HTTP {status}")))
        }
    }

    /// Deterministic hash of the peer list, used when the server does not
    /// supply a version hash.
    pub fn compute_config_hash(config: &DesiredConfig) -> String {
        let mut peers: Vec<&PeerSpec> = config.peers.iter().collect();
        peers.sort_by_key(|p| p.asn);
        let canonical = serde_json::to_string(&peers).unwrap_or_default();
        let digest = Sha256::digest(canonical.as_bytes());
        format!("sha256:{}", &hex::encode(digest)[..16])
    }
}
