//! iBGP underlay sync
//!
//! Full-mesh iBGP sessions over the mesh loopbacks, one config file per
//! peer under `ibgp.d/`. Peers come from the mesh config; extra entries
//! from the desired config are merged in. Stale files are cleaned up by
//! glob and a debounced reload is requested after changes.

use crate::client::ControlPlaneClient;
use crate::executor::bird::BirdExecutor;
use crate::model::IbgpPeerSpec;
use crate::render::bird::{render_ibgp_peer, safe_name};
use crate::AgentError;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// iBGP configuration synchronizer.
pub struct IbgpSync {
    client: Arc<ControlPlaneClient>,
    bird: Arc<BirdExecutor>,
    local_asn: u32,
}

impl IbgpSync {
    pub fn new(client: Arc<ControlPlaneClient>, bird: Arc<BirdExecutor>, local_asn: u32) -> Self {
        Self {
            client,
            bird,
            local_asn,
        }
    }

    /// One iBGP convergence pass. `extra_peers` lets the reconciliation
    /// loop merge iBGP entries carried in the desired config.
    pub async fn sync_ibgp(&self, extra_peers: &[IbgpPeerSpec]) -> bool {
        info!("syncing iBGP peer configurations");

        let mesh = match self.client.get_mesh_config().await {
            Ok(mesh) => mesh,
            Err(e) => {
                warn!(error = %e, "mesh config fetch failed for iBGP sync");
                return false;
            }
        };

        // Keyed by sanitized name so mesh and desired-config entries
        // dedupe onto the same file.
        let mut peers: BTreeMap<String, IbgpPeerSpec> = BTreeMap::new();
        for peer in &mesh.peers {
            peers.insert(
                safe_name(&peer.name),
                IbgpPeerSpec {
                    name: peer.name.clone(),
                    loopback: peer.loopback.clone(),
                    is_rr_client: false,
                },
            );
        }
        for peer in extra_peers {
            peers.insert(safe_name(&peer.name), peer.clone());
        }

        info!(peers = peers.len(), "iBGP peers");
        let mut changed = false;

        for (name, peer) in &peers {
            let config = render_ibgp_peer(
                peer,
                self.local_asn,
                mesh.loopback.as_deref(),
                mesh.is_rr || peer.is_rr_client,
            );
            let path = self.bird.ibgp_path(name);
            if crate::daemon::sync::text_digest(&config)
                != crate::daemon::sync::file_digest(&path)
            {
                match self.bird.write_ibgp(name, &config) {
                    Ok(()) => {
                        info!(peer = %peer.name, loopback = %peer.loopback, "configured iBGP peer");
                        changed = true;
                    }
                    Err(e) => warn!(peer = %peer.name, error = %e, "iBGP config write failed"),
                }
            }
        }

        changed |= self.cleanup_stale(&peers);

        if changed {
            self.bird.reload();
        } else {
            debug!("iBGP configuration unchanged");
        }
        true
    }

    fn cleanup_stale(&self, active: &BTreeMap<String, IbgpPeerSpec>) -> bool {
        let mut changed = false;
        for name in self.bird.list_ibgp() {
            if active.contains_key(&name) {
                continue;
            }
            info!(peer = %name, "removing stale iBGP config");
            match self.bird.remove_ibgp(&name) {
                Ok(removed) => changed |= removed,
                Err(e) => warn!(peer = %name, error = %e, "failed to remove iBGP config"),
            }
        }
        changed
    }
}
