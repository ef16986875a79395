//! WireGuard executor
//!
//! Drives `ip` and `wg` directly instead of wg-quick: wg-quick installs
//! routes for AllowedIPs, and those conflict with the loopback addresses
//! on the dummy interface. `wg setconf` resets interface-level settings,
//! so the private key and listen port are re-applied with `wg set`
//! afterwards; the ordering is load-bearing.

use crate::cmd;
use crate::render::wireguard::parse_interface;
use crate::AgentError;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, error, info};
use x25519_dalek::{PublicKey, StaticSecret};

const IP_TIMEOUT: Duration = Duration::from_secs(10);
const WG_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_MTU: u16 = 1420;

/// Interface summary reported in heartbeats.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WireguardStatus {
    pub interfaces: usize,
    pub names: Vec<String>,
}

/// Tunnel executor; owns the eBGP private key.
pub struct WireguardExecutor {
    config_dir: PathBuf,
    private_key: String,
    public_key: String,
}

/// Generate a fresh WireGuard keypair (base64-encoded).
pub fn generate_keypair() -> (String, String) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    (
        BASE64.encode(secret.to_bytes()),
        BASE64.encode(public.as_bytes()),
    )
}

/// Derive the base64 public key from a base64 private key.
pub fn derive_public_key(private_key: &str) -> Result<String, AgentError> {
    let raw = BASE64
        .decode(private_key.trim())
        .map_err(|e| AgentError::Config(format!("invalid private key: {e}")))?;
    let bytes: [u8; 32] = raw
        .try_into()
        .map_err(|_| AgentError::Config("private key must be 32 bytes".into()))?;
    let secret = StaticSecret::from(bytes);
    Ok(BASE64.encode(PublicKey::from(&secret).as_bytes()))
}

/// Load a private key from `path`, generating and persisting one (mode
/// 0600) when absent. Returns (private, public).
pub fn load_or_create_key(path: &PathBuf) -> Result<(String, String), AgentError> {
    if path.exists() {
        let private = std::fs::read_to_string(path)?.trim().to_string();
        let public = derive_public_key(&private)?;
        debug!(path = %path.display(), "loaded WireGuard private key");
        return Ok((private, public));
    }
    let (private, public) = generate_keypair();
    super::write_atomic(path, &format!("{private}\n"), 0o600)?;
    info!(path = %path.display(), "generated new WireGuard private key");
    Ok((private, public))
}

impl WireguardExecutor {
    pub fn new(config_dir: impl Into<PathBuf>) -> Result<Self, AgentError> {
        let config_dir = config_dir.into();
        std::fs::create_dir_all(&config_dir)?;
        let key_path = config_dir.join("private.key");
        let (private_key, public_key) = load_or_create_key(&key_path)?;
        Ok(Self {
            config_dir,
            private_key,
            public_key,
        })
    }

    pub fn private_key(&self) -> &str {
        &self.private_key
    }

    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    pub fn config_path(&self, ifname: &str) -> PathBuf {
        self.config_dir.join(format!("{ifname}.conf"))
    }

    /// Write an interface config atomically with mode 0600.
    pub fn write_interface(&self, ifname: &str, config: &str) -> Result<(), AgentError> {
        super::write_atomic(&self.config_path(ifname), config, 0o600)
    }

    pub fn remove_interface(&self, ifname: &str) -> Result<bool, AgentError> {
        let path = self.config_path(ifname);
        if path.exists() {
            std::fs::remove_file(&path)?;
            return Ok(true);
        }
        Ok(false)
    }

    pub async fn interface_exists(&self, ifname: &str) -> bool {
        cmd::run("ip", &["link", "show", ifname], IP_TIMEOUT)
            .await
            .map(|out| out.success)
            .unwrap_or(false)
    }

    /// Reconcile the kernel interface with the on-disk config. Safe to
    /// call when nothing changed; it heals post-reboot state.
    pub async fn up(&self, ifname: &str) -> Result<(), AgentError> {
        let path = self.config_path(ifname);
        let config = std::fs::read_to_string(&path).map_err(|e| {
            AgentError::Executor(format!("config for {ifname} not found: {e}"))
        })?;
        let parsed = parse_interface(&config);

        let existed = self.interface_exists(ifname).await;
        if !existed {
            let out = cmd::run(
                "ip",
                &["link", "add", ifname, "type", "wireguard"],
                IP_TIMEOUT,
            )
            .await?;
            if !out.success && !out.stderr.contains("exists") {
                return Err(AgentError::Executor(format!(
                    "create {ifname}: {}",
                    out.stderr.trim()
                )));
            }
        }

        // setconf first: it resets interface-level settings.
        if let Some(peer_section) = &parsed.peer_section {
            let tmp = self.config_dir.join(format!(".{ifname}.peer.tmp"));
            super::write_atomic(&tmp, peer_section, 0o600)?;
            let result = cmd::run(
                "wg",
                &["setconf", ifname, &tmp.display().to_string()],
                WG_TIMEOUT,
            )
            .await;
            let _ = std::fs::remove_file(&tmp);
            let out = result?;
            if !out.success {
                return Err(AgentError::Executor(format!(
                    "wg setconf {ifname}: {}",
                    out.stderr.trim()
                )));
            }
        }

        // Key and port after setconf, which wiped them.
        if let Some(private_key) = &parsed.private_key {
            let out = cmd::run_with_stdin(
                "wg",
                &["set", ifname, "private-key", "/dev/stdin"],
                Some(private_key),
                WG_TIMEOUT,
            )
            .await?;
            if !out.success {
                return Err(AgentError::Executor(format!(
                    "wg set private-key {ifname}: {}",
                    out.stderr.trim()
                )));
            }
        }
        if let Some(port) = parsed.listen_port {
            let out = cmd::run(
                "wg",
                &["set", ifname, "listen-port", &port.to_string()],
                WG_TIMEOUT,
            )
            .await?;
            if !out.success {
                return Err(AgentError::Executor(format!(
                    "wg set listen-port {ifname}: {}",
                    out.stderr.trim()
                )));
            }
        }

        if !existed {
            let mtu = DEFAULT_MTU.to_string();
            cmd::run(
                "ip",
                &["link", "set", ifname, "mtu", &mtu, "up"],
                IP_TIMEOUT,
            )
            .await?;
        }

        if let Some(address) = &parsed.address {
            self.ensure_address(ifname, address).await;
        }

        debug!(ifname, "interface reconciled");
        Ok(())
    }

    /// Add the configured address when absent. "Already exists" is
    /// success.
    async fn ensure_address(&self, ifname: &str, address: &str) {
        let family = if address.contains(':') { "-6" } else { "-4" };
        let bare = address.split('/').next().unwrap_or(address);

        let shown = cmd::capture("ip", &[family, "addr", "show", "dev", ifname], IP_TIMEOUT)
            .await
            .unwrap_or_default();
        if shown.contains(bare) {
            return;
        }

        let full = if address.contains('/') {
            address.to_string()
        } else if address.contains(':') {
            format!("{address}/64")
        } else {
            format!("{address}/32")
        };
        match cmd::run("ip", &[family, "addr", "add", &full, "dev", ifname], IP_TIMEOUT).await {
            Ok(out) if out.success || out.stderr.contains("exists") => {
                debug!(ifname, address = %full, "configured interface address");
            }
            Ok(out) => error!(ifname, address = %full, stderr = %out.stderr.trim(), "failed to add address"),
            Err(e) => error!(ifname, error = %e, "failed to add address"),
        }
    }

    /// Set the interface MTU.
    pub async fn set_mtu(&self, ifname: &str, mtu: u16) -> bool {
        cmd::run_ok(
            "ip",
            &["link", "set", "dev", ifname, "mtu", &mtu.to_string()],
            IP_TIMEOUT,
        )
        .await
    }

    /// Delete the kernel interface when present; always succeeds.
    pub async fn down(&self, ifname: &str) -> bool {
        if self.interface_exists(ifname).await {
            let removed = cmd::run_ok("ip", &["link", "del", ifname], IP_TIMEOUT).await;
            if removed {
                info!(ifname, "removed interface");
            }
            return removed;
        }
        true
    }

    /// Interfaces reported by `wg show interfaces`, filtered to ours.
    pub async fn status(&self) -> WireguardStatus {
        let Some(output) = cmd::capture("wg", &["show", "interfaces"], WG_TIMEOUT).await else {
            return WireguardStatus::default();
        };
        let names: Vec<String> = output
            .split_whitespace()
            .filter(|name| name.starts_with("dn42-"))
            .map(str::to_string)
            .collect();
        WireguardStatus {
            interfaces: names.len(),
            names,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn test_generate_keypair_shape() {
        let (private, public) = generate_keypair();
        assert_eq!(BASE64.decode(&private).unwrap().len(), 32);
        assert_eq!(BASE64.decode(&public).unwrap().len(), 32);
        assert_ne!(private, public);
    }

    #[test]
    fn test_derive_public_key_matches_generation() {
        let (private, public) = generate_keypair();
        assert_eq!(derive_public_key(&private).unwrap(), public);
    }

    #[test]
    fn test_derive_public_key_rejects_garbage() {
        assert!(derive_public_key("not-base64!").is_err());
        assert!(derive_public_key(&BASE64.encode([0u8; 16])).is_err());
    }

    #[test]
    fn test_load_or_create_key_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mesh_private_key");

        let (private, public) = load_or_create_key(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        // Second load returns the same key.
        let (private2, public2) = load_or_create_key(&path).unwrap();
        assert_eq!(private, private2);
        assert_eq!(public, public2);
    }

    #[test]
    fn test_executor_key_and_config_mode() {
        let dir = tempfile::tempdir().unwrap();
        let wg = WireguardExecutor::new(dir.path()).unwrap();
        assert!(!wg.public_key().is_empty());

        wg.write_interface("dn42-4242420337", "[Interface]\n").unwrap();
        let mode = std::fs::metadata(wg.config_path("dn42-4242420337"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_remove_interface_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let wg = WireguardExecutor::new(dir.path()).unwrap();
        wg.write_interface("dn42-1", "[Interface]\n").unwrap();
        assert!(wg.remove_interface("dn42-1").unwrap());
        assert!(!wg.remove_interface("dn42-1").unwrap());
    }
}
