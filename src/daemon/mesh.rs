//! Mesh underlay sync
//!
//! One WireGuard interface per mesh peer (P2P mode): complete
//! AllowedIPs per interface, per-interface MTU, and a deterministic
//! port scheme — we listen on `base + peer_id`, the peer listens for us
//! on `base + own_id`. Stale interfaces from departed peers are torn
//! down on every pass.

use crate::client::ControlPlaneClient;
use crate::community::mtu::MtuProber;
use crate::executor::firewall::FirewallExecutor;
use crate::executor::loopback::LoopbackExecutor;
use crate::executor::wireguard::{self, WireguardExecutor};
use crate::layout;
use crate::model::MeshPeerSpec;
use crate::render;
use crate::AgentError;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Mesh synchronizer for the IGP underlay.
pub struct MeshSync {
    client: Arc<ControlPlaneClient>,
    wg: Arc<WireguardExecutor>,
    loopback: Arc<LoopbackExecutor>,
    firewall: Arc<FirewallExecutor>,
    mtu: Arc<MtuProber>,
    node_id: u32,
    base_port: u16,
    private_key: String,
    public_key: String,
    key_registered: AtomicBool,
}

impl MeshSync {
    pub fn new(
        client: Arc<ControlPlaneClient>,
        wg: Arc<WireguardExecutor>,
        loopback: Arc<LoopbackExecutor>,
        firewall: Arc<FirewallExecutor>,
        mtu: Arc<MtuProber>,
        node_id: u32,
        base_port: u16,
        key_path: PathBuf,
    ) -> Result<Self, AgentError> {
        // The mesh keypair is separate from the eBGP one and lives in
        // the state directory.
        let (private_key, public_key) = wireguard::load_or_create_key(&key_path)?;
        Ok(Self {
            client,
            wg,
            loopback,
            firewall,
            mtu,
            node_id,
            base_port,
            private_key,
            public_key,
            key_registered: AtomicBool::new(false),
        })
    }

    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    async fn ensure_key_registered(&self) {
        if self.key_registered.load(Ordering::SeqCst) {
            return;
        }
        match self.client.register_mesh_key(&self.public_key).await {
            Ok(()) => {
                info!("registered mesh key with control plane");
                self.key_registered.store(true, Ordering::SeqCst);
            }
            Err(e) => warn!(error = %e, "mesh key registration failed, will retry"),
        }
    }

    /// One mesh convergence pass. Returns `false` when the mesh config
    /// could not be fetched.
    pub async fn sync_mesh(&self) -> bool {
        info!("syncing mesh network");
        self.ensure_key_registered().await;

        let mesh = match self.client.get_mesh_config().await {
            Ok(mesh) => mesh,
            Err(e) => {
                warn!(error = %e, "mesh config fetch failed");
                return false;
            }
        };

        // Loopback addresses the control plane assigns to this node.
        for addr in [&mesh.loopback, &mesh.dn42_ipv4, &mesh.dn42_ipv6]
            .into_iter()
            .flatten()
        {
            self.loopback.add_address(&with_host_suffix(addr)).await;
        }

        info!(peers = mesh.peers.len(), "mesh peers");
        let mut active: BTreeSet<u32> = BTreeSet::new();

        let mut peers: Vec<&MeshPeerSpec> = mesh.peers.iter().collect();
        peers.sort_by_key(|p| p.node_id);

        for peer in peers {
            if peer.node_id == self.node_id {
                continue;
            }
            active.insert(peer.node_id);
            if let Err(e) = self.apply_mesh_peer(peer).await {
                warn!(peer = peer.node_id, error = %e, "mesh peer apply failed");
            }
        }

        self.cleanup_stale(&active).await;
        info!("mesh sync complete");
        true
    }

    async fn apply_mesh_peer(&self, peer: &MeshPeerSpec) -> Result<(), AgentError> {
        let ifname = layout::mesh_ifname(peer.node_id);
        let listen_port = layout::mesh_listen_port(peer.node_id, self.base_port);

        let config = render::wireguard::render_mesh_interface(
            &self.private_key,
            self.node_id,
            peer,
            self.base_port,
        );

        if crate::daemon::sync::text_digest(&config)
            != crate::daemon::sync::file_digest(&self.wg.config_path(&ifname))
        {
            self.firewall.allow_port(listen_port).await;
            self.wg.write_interface(&ifname, &config)?;
            info!(ifname, peer = %peer.name, "updated mesh interface config");
        }
        self.wg.up(&ifname).await?;
        self.cleanup_link_local(&ifname).await;

        // Public-internet default unless a path probe said lower.
        let mtu = peer
            .endpoint
            .as_deref()
            .and_then(|endpoint| self.mtu.cached(endpoint))
            .map(|probe| probe.optimal_mtu.min(layout::MESH_MTU_DEFAULT))
            .unwrap_or(layout::MESH_MTU_DEFAULT);
        self.wg.set_mtu(&ifname, mtu).await;

        debug!(ifname, listen_port, "mesh interface reconciled");
        Ok(())
    }

    /// After an identity change the interface keeps the old node's
    /// link-local address; remove every fe80:: address that is not the
    /// current one.
    async fn cleanup_link_local(&self, ifname: &str) {
        let keep = layout::link_local(self.node_id).to_string();
        let Some(output) = crate::cmd::capture(
            "ip",
            &["-6", "addr", "show", "dev", ifname],
            std::time::Duration::from_secs(10),
        )
        .await
        else {
            return;
        };

        for line in output.lines() {
            let mut tokens = line.split_whitespace();
            if tokens.next() != Some("inet6") {
                continue;
            }
            let Some((addr, _len)) = tokens.next().and_then(|t| t.split_once('/')) else {
                continue;
            };
            if !addr.starts_with("fe80") || addr == keep {
                continue;
            }
            info!(interface = ifname, addr, "removing stale link-local address");
            crate::cmd::run_ok(
                "ip",
                &["-6", "addr", "del", &format!("{addr}/64"), "dev", ifname],
                std::time::Duration::from_secs(10),
            )
            .await;
        }
    }

    /// Remove interfaces for peers no longer in the mesh.
    async fn cleanup_stale(&self, active: &BTreeSet<u32>) {
        let status = self.wg.status().await;
        for name in status.names {
            let Some(id) = name
                .strip_prefix("dn42-wg-igp-")
                .and_then(|suffix| suffix.parse::<u32>().ok())
            else {
                continue;
            };
            if active.contains(&id) {
                continue;
            }
            info!(interface = %name, "removing stale mesh interface");
            self.wg.down(&name).await;
            if let Err(e) = self.wg.remove_interface(&name) {
                warn!(interface = %name, error = %e, "failed to remove mesh config");
            }
            self.firewall
                .remove_port(layout::mesh_listen_port(id, self.base_port))
                .await;
        }
    }
}

/// Append the conventional host suffix when an address arrives bare.
fn with_host_suffix(addr: &str) -> String {
    if addr.contains('/') {
        addr.to_string()
    } else if addr.contains(':') {
        format!("{addr}/128")
    } else {
        format!("{addr}/32")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_host_suffix() {
        assert_eq!(with_host_suffix("172.22.188.3"), "172.22.188.3/32");
        assert_eq!(with_host_suffix("fd00:4242:7777::3"), "fd00:4242:7777::3/128");
        assert_eq!(with_host_suffix("172.22.188.0/26"), "172.22.188.0/26");
    }

    #[test]
    fn test_stale_suffix_parsing() {
        assert_eq!(
            "dn42-wg-igp-7".strip_prefix("dn42-wg-igp-").unwrap().parse::<u32>().unwrap(),
            7
        );
        assert!("dn42-4242420337"
            .strip_prefix("dn42-wg-igp-")
            .is_none());
    }
}
