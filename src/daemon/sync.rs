//! Reconciliation loop
//!
//! Pulls the desired configuration, diffs it against the applied
//! snapshot, and drives the executors to converge. The loop never
//! propagates errors upward: every failure becomes a log line and a
//! boolean so heartbeats keep flowing while the control plane observes
//! the config hash not advancing.

use super::ibgp::IbgpSync;
use super::mesh::MeshSync;
use super::PeerLocks;
use crate::client::ControlPlaneClient;
use crate::community::manager::CommunityManager;
use crate::community::probe::LatencyProber;
use crate::executor::bird::BirdExecutor;
use crate::executor::firewall::FirewallExecutor;
use crate::executor::wireguard::WireguardExecutor;
use crate::layout;
use crate::model::{DesiredConfig, IbgpPeerSpec, PeerSpec};
use crate::render;
use crate::state::StateStore;
use crate::AgentError;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// The reconciliation daemon; owns the sync/heartbeat cadence.
pub struct SyncDaemon {
    client: Arc<ControlPlaneClient>,
    state: Arc<StateStore>,
    bird: Arc<BirdExecutor>,
    wg: Arc<WireguardExecutor>,
    firewall: Arc<FirewallExecutor>,
    prober: Arc<LatencyProber>,
    community: Arc<CommunityManager>,
    locks: Arc<PeerLocks>,
    mesh: Arc<MeshSync>,
    ibgp: Arc<IbgpSync>,
    local_asn: u32,
    sync_interval: Duration,
    heartbeat_interval: Duration,
    running: AtomicBool,
    // At most one sync_config in flight; a new tick waits for the
    // previous one.
    sync_guard: Mutex<()>,
    // iBGP entries carried in the last desired config, merged into the
    // mesh-driven iBGP sync.
    ibgp_extras: parking_lot::Mutex<Vec<IbgpPeerSpec>>,
}

#[allow(clippy::too_many_arguments)]
impl SyncDaemon {
    pub fn new(
        client: Arc<ControlPlaneClient>,
        state: Arc<StateStore>,
        bird: Arc<BirdExecutor>,
        wg: Arc<WireguardExecutor>,
        firewall: Arc<FirewallExecutor>,
        prober: Arc<LatencyProber>,
        community: Arc<CommunityManager>,
        locks: Arc<PeerLocks>,
        mesh: Arc<MeshSync>,
        ibgp: Arc<IbgpSync>,
        local_asn: u32,
        sync_interval: Duration,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            client,
            state,
            bird,
            wg,
            firewall,
            prober,
            community,
            locks,
            mesh,
            ibgp,
            local_asn,
            sync_interval,
            heartbeat_interval,
            running: AtomicBool::new(false),
            sync_guard: Mutex::new(()),
            ibgp_extras: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// One full reconciliation cycle. Returns `false` when the desired
    /// config could not be fetched; partial per-peer failures still
    /// complete the cycle.
    pub async fn sync_config(&self) -> bool {
        let _in_flight = self.sync_guard.lock().await;

        info!("syncing config from control plane");
        let config = match self.client.get_config().await {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %e, "config fetch failed, keeping prior state");
                return false;
            }
        };

        let remote_hash = config
            .version_hash
            .clone()
            .unwrap_or_else(|| ControlPlaneClient::compute_config_hash(&config));

        info!(
            ebgp = config.peers.len(),
            ibgp = config.ibgp_peers.len(),
            hash = %remote_hash,
            "received desired config"
        );
        *self.ibgp_extras.lock() = config.ibgp_peers.clone();

        // Hash match alone is not enough: missing files (manual deletion,
        // volume reinitialization) force regeneration.
        if Some(remote_hash.as_str()) == self.state.config_hash().as_deref()
            && self.expected_files_present(&config)
        {
            debug!("config up to date");
            return true;
        }

        let applied: BTreeSet<u32> = self.state.applied_peers().iter().map(|p| p.asn).collect();
        let desired: BTreeSet<u32> = config.peers.iter().map(|p| p.asn).collect();

        let mut peers: Vec<&PeerSpec> = config.peers.iter().collect();
        peers.sort_by_key(|p| p.asn);

        let mut failures = 0usize;
        for peer in peers {
            if let Err(e) = self.apply_peer(peer).await {
                error!(asn = peer.asn, error = %e, "peer apply failed");
                failures += 1;
            }
        }

        for asn in applied.difference(&desired) {
            if let Err(e) = self.retract_peer(*asn).await {
                error!(asn, error = %e, "peer retract failed");
                failures += 1;
            }
        }

        // Files are on disk even when the reload fails; the next reload
        // attempt picks them up, so the snapshot is committed regardless.
        self.bird.reload();
        if let Err(e) = self.state.update_applied(&config.peers, &remote_hash) {
            error!(error = %e, "failed to persist applied snapshot");
        }
        if let Err(e) = self.client.report_state(&self.state.snapshot()).await {
            debug!(error = %e, "state report failed");
        }

        if failures == 0 {
            info!("config sync complete");
        } else {
            warn!(failures, "config sync completed with failures");
        }
        true
    }

    fn expected_files_present(&self, config: &DesiredConfig) -> bool {
        config.peers.iter().all(|peer| {
            let bird_present = self.bird.peer_path(peer.asn).exists();
            let wg_present = !peer.tunnel.is_wireguard()
                || self
                    .wg
                    .config_path(&layout::tunnel_ifname(peer.asn))
                    .exists();
            bird_present && wg_present
        })
    }

    /// Converge one peer: render, digest-compare, write, open firewall,
    /// reconcile the interface. Bring-up runs even when nothing changed;
    /// it is idempotent and heals post-reboot state.
    pub async fn apply_peer(&self, peer: &PeerSpec) -> Result<(), AgentError> {
        let lock = self.locks.lock_for(peer.asn);
        let _guard = lock.lock().await;

        let listen_port = peer
            .tunnel
            .listen_port
            .unwrap_or_else(|| layout::ebgp_listen_port(peer.asn));

        if peer.tunnel.is_wireguard() {
            let ifname = layout::tunnel_ifname(peer.asn);
            let local_addr = peer
                .bgp
                .local_ipv6
                .as_deref()
                .or(peer.bgp.local_ipv4.as_deref());
            let expected = render::wireguard::render_peer_tunnel(
                peer,
                self.wg.private_key(),
                listen_port,
                local_addr,
            );

            if text_digest(&expected) != file_digest(&self.wg.config_path(&ifname)) {
                self.firewall.allow_port(listen_port).await;
                self.wg.write_interface(&ifname, &expected)?;
                info!(asn = peer.asn, "updated tunnel config");
            }
            self.wg.up(&ifname).await?;
        }

        let expected_bird = render::bird::render_ebgp_peer(peer, self.local_asn);
        if text_digest(&expected_bird) != file_digest(&self.bird.peer_path(peer.asn)) {
            self.bird.write_peer(peer.asn, &expected_bird)?;
            info!(asn = peer.asn, "updated BIRD config");
        }

        // In-tunnel session address doubles as the probe target.
        if let Some(endpoint) = probe_endpoint(peer) {
            self.prober.add_peer(peer.asn, endpoint);
        }

        Ok(())
    }

    /// Tear down one peer: firewall rule, interface, config files,
    /// probe registration.
    pub async fn retract_peer(&self, asn: u32) -> Result<(), AgentError> {
        let lock = self.locks.lock_for(asn);
        let _guard = lock.lock().await;
        info!(asn, "retracting peer");

        self.firewall
            .remove_port(layout::ebgp_listen_port(asn))
            .await;

        let ifname = layout::tunnel_ifname(asn);
        self.wg.down(&ifname).await;
        self.wg.remove_interface(&ifname)?;
        self.bird.remove_peer(asn)?;

        self.prober.remove_peer(asn);
        self.community.drop_peer(asn);
        drop(_guard);
        self.locks.forget(asn);
        Ok(())
    }

    /// Post health to the control plane and into the state journal.
    pub async fn heartbeat(&self) -> bool {
        let bird_status = self.bird.status().await;
        let wg_status = self.wg.status().await;
        let status = serde_json::json!({
            "running": bird_status.running,
            "protocols_up": bird_status.protocols_up,
            "protocols_down": bird_status.protocols_down,
            "interfaces": wg_status.interfaces,
            "ebgp_public_key": self.wg.public_key(),
        });

        if let Err(e) = self.state.update_health(status.clone()) {
            error!(error = %e, "failed to persist health");
        }

        match self
            .client
            .send_heartbeat(self.state.config_hash().as_deref(), &status)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "heartbeat failed");
                false
            }
        }
    }

    /// Ticker: every fast tick heartbeats, every N-th triggers a config
    /// sync plus mesh and iBGP resyncs.
    pub async fn run(&self) {
        self.running.store(true, Ordering::SeqCst);
        self.sync_config().await;

        let mut elapsed = Duration::ZERO;
        while self.running.load(Ordering::SeqCst) {
            tokio::time::sleep(self.heartbeat_interval).await;
            elapsed += self.heartbeat_interval;

            self.heartbeat().await;

            if elapsed >= self.sync_interval {
                elapsed = Duration::ZERO;
                self.sync_config().await;
                if !self.mesh.sync_mesh().await {
                    warn!("mesh sync failed, will retry next interval");
                }
                let extras = self.ibgp_extras.lock().clone();
                if !self.ibgp.sync_ibgp(&extras).await {
                    warn!("iBGP sync failed, will retry next interval");
                }
            }
        }
        info!("reconciliation loop stopped");
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Probe target for a peer: the in-tunnel session address, preferring
/// IPv4 (link-local IPv6 needs zone handling that ping6 resolves per
/// interface).
fn probe_endpoint(peer: &PeerSpec) -> Option<&str> {
    if let Some(v4) = peer.bgp.peer_ipv4.as_deref() {
        return Some(v4);
    }
    peer.bgp
        .peer_ipv6
        .as_deref()
        .filter(|v6| !v6.starts_with("fe80"))
}

pub(crate) fn text_digest(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// Digest of the on-disk text; an absent file hashes to the empty
/// string so it always differs from any rendered config.
pub(crate) fn file_digest(path: &Path) -> String {
    match std::fs::read(path) {
        Ok(raw) => hex::encode(Sha256::digest(&raw)),
        Err(_) => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BgpSpec;

    #[test]
    fn test_digest_of_missing_file_differs_from_any_text() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.conf");
        assert_eq!(file_digest(&missing), "");
        assert_ne!(text_digest(""), file_digest(&missing));
    }

    #[test]
    fn test_digest_matches_after_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peer.conf");
        std::fs::write(&path, "config body").unwrap();
        assert_eq!(text_digest("config body"), file_digest(&path));
        assert_ne!(text_digest("other"), file_digest(&path));
    }

    #[test]
    fn test_probe_endpoint_prefers_ipv4() {
        let mut peer = PeerSpec {
            asn: 1,
            bgp: BgpSpec {
                peer_ipv4: Some("172.22.188.42".into()),
                peer_ipv6: Some("fd42::1".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(probe_endpoint(&peer), Some("172.22.188.42"));

        peer.bgp.peer_ipv4 = None;
        assert_eq!(probe_endpoint(&peer), Some("fd42::1"));

        peer.bgp.peer_ipv6 = Some("fe80::1".into());
        assert_eq!(probe_endpoint(&peer), None);
    }
}
