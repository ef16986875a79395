//! MoeNet DN42 Agent
//!
//! Per-node fabric agent for an overlay network of autonomous routers.
//! The agent pulls a desired configuration from the control plane and
//! continuously reconciles local state against it: WireGuard tunnels,
//! BIRD peer configs, firewall openings, loopback addresses, and a
//! full-mesh iBGP underlay. Health flows back via heartbeats and an
//! authenticated operator API serves diagnostics and manual
//! interventions.

pub mod api;
pub mod client;
pub mod cmd;
pub mod community;
pub mod config;
pub mod daemon;
pub mod executor;
pub mod layout;
pub mod model;
pub mod render;
pub mod state;

use crate::api::ApiState;
use crate::client::ControlPlaneClient;
use crate::community::manager::CommunityManager;
use crate::community::mtu::MtuProber;
use crate::community::probe::LatencyProber;
use crate::config::AgentConfig;
use crate::daemon::ibgp::IbgpSync;
use crate::daemon::mesh::MeshSync;
use crate::daemon::sync::SyncDaemon;
use crate::daemon::PeerLocks;
use crate::executor::bird::{self, BirdExecutor};
use crate::executor::firewall::FirewallExecutor;
use crate::executor::loopback::LoopbackExecutor;
use crate::executor::wireguard::WireguardExecutor;
use crate::model::RegisterRequest;
use crate::state::StateStore;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Agent error taxonomy.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("config error: {0}")]
    Config(String),
    #[error("invalid node id {id}: must be 1-{max}")]
    InvalidNodeId { id: u32, max: u32 },
    #[error("control plane error: {0}")]
    ControlPlane(String),
    #[error("executor error: {0}")]
    Executor(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Top-level supervisor owning every service the agent runs.
pub struct Agent {
    config: Arc<AgentConfig>,
    client: Arc<ControlPlaneClient>,
    state: Arc<StateStore>,
    bird: Arc<BirdExecutor>,
    wg: Arc<WireguardExecutor>,
    firewall: Arc<FirewallExecutor>,
    community: Arc<CommunityManager>,
    prober: Arc<LatencyProber>,
    locks: Arc<PeerLocks>,
    reload: bird::ReloadHandle,
    mesh: Arc<MeshSync>,
    daemon: Arc<SyncDaemon>,
    node_id: u32,
}

impl Agent {
    /// Build every service, establish the node identity, and bring the
    /// local baseline up (loopback, initial mesh and iBGP sync).
    /// Identity failures are fatal by design: proceeding with a guessed
    /// node id would collide overlay addresses.
    pub async fn init(config: AgentConfig) -> Result<Self, AgentError> {
        let config = Arc::new(config);

        let client = Arc::new(ControlPlaneClient::new(
            &config.control_plane_url,
            &config.node_name,
            &config.control_plane_token,
        )?);
        let state = Arc::new(StateStore::new(config.state_path()));

        let reload = bird::spawn_reloader(config.bird_ctl.clone(), bird::COALESCE_DELAY);
        let bird = Arc::new(BirdExecutor::new(
            config.bird_config_dir.clone(),
            config.bird_ctl.clone(),
            reload.clone(),
        ));
        let wg = Arc::new(WireguardExecutor::new(config.wg_config_dir.clone())?);
        let firewall = Arc::new(FirewallExecutor::default());
        let loopback = Arc::new(LoopbackExecutor::new(
            config.dn42_ipv4_prefix,
            config.dn42_ipv6_prefix,
        ));
        let community = Arc::new(CommunityManager::new(
            config.bird_ctl.clone(),
            config.bird_config_dir.clone(),
            reload.clone(),
        ));
        let prober = Arc::new(LatencyProber::new(Duration::from_secs(
            config.probe_interval,
        )));
        let mtu = Arc::new(MtuProber::new());
        let locks = Arc::new(PeerLocks::new());

        // Tier changes flow from the prober into community fragments.
        let community_sink = community.clone();
        prober.set_callback(Arc::new(move |asn, tier, rtt| {
            community_sink.record_latency_tier(asn, tier, rtt);
        }));

        // The mesh key must exist before registration so the control
        // plane learns it on first contact.
        let (_, mesh_public_key) =
            executor::wireguard::load_or_create_key(&config.mesh_key_path())?;

        let node_id = Self::establish_identity(&config, &client, &state, &wg, &mesh_public_key)
            .await?;
        info!(node_id, node = %config.node_name, "node identity established");

        // Local baseline before any peer work.
        loopback.ensure_interface().await?;
        loopback.setup(node_id).await?;
        info!("loopback interface configured");

        let mesh = Arc::new(MeshSync::new(
            client.clone(),
            wg.clone(),
            loopback.clone(),
            firewall.clone(),
            mtu.clone(),
            node_id,
            config.mesh_base_port,
            config.mesh_key_path(),
        )?);
        let ibgp = Arc::new(IbgpSync::new(
            client.clone(),
            bird.clone(),
            config.local_asn,
        ));

        if !mesh.sync_mesh().await {
            warn!("initial mesh sync failed, will retry on the sync interval");
        }
        if !ibgp.sync_ibgp(&[]).await {
            warn!("initial iBGP sync failed, will retry on the sync interval");
        }

        let daemon = Arc::new(SyncDaemon::new(
            client.clone(),
            state.clone(),
            bird.clone(),
            wg.clone(),
            firewall.clone(),
            prober.clone(),
            community.clone(),
            locks.clone(),
            mesh.clone(),
            ibgp,
            config.local_asn,
            Duration::from_secs(config.sync_interval),
            Duration::from_secs(config.heartbeat_interval),
        ));

        Ok(Self {
            config,
            client,
            state,
            bird,
            wg,
            firewall,
            community,
            prober,
            locks,
            reload,
            mesh,
            daemon,
            node_id,
        })
    }

    /// Resolve the node id: registration first, the persisted journal as
    /// fallback when the control plane is unreachable. Never invent one.
    async fn establish_identity(
        config: &AgentConfig,
        client: &ControlPlaneClient,
        state: &StateStore,
        wg: &WireguardExecutor,
        mesh_public_key: &str,
    ) -> Result<u32, AgentError> {
        info!("registering with control plane");
        let request = RegisterRequest {
            hostname: config.node_name.clone(),
            agent_version: AgentConfig::agent_version().to_string(),
            region: config.region.clone(),
            is_rr: config.is_route_reflector(),
            ipv4: config.public_ipv4.clone(),
            ipv6: config.public_ipv6.clone(),
            dn42_ipv4: config.dn42_ipv4.clone(),
            dn42_ipv6: config.dn42_ipv6.clone(),
            node_id: state.node_id(),
            loopback_ipv6: None,
            mesh_public_key: Some(mesh_public_key.to_string()),
            ebgp_public_key: Some(wg.public_key().to_string()),
        };

        let registered = match client.register_node(&request).await {
            Ok(response) => {
                info!(status = %response.status, "node registered");
                response.numeric_node_id
            }
            Err(e) => {
                warn!(error = %e, "registration failed, falling back to persisted identity");
                None
            }
        };

        let node_id = registered.or_else(|| state.node_id()).ok_or_else(|| {
            AgentError::Config(
                "node identity unavailable: registration failed and no persisted node id".into(),
            )
        })?;

        layout::validate_node_id(node_id, &config.dn42_ipv4_prefix)?;
        state.set_identity(node_id, &config.node_name)?;
        Ok(node_id)
    }

    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    /// Run until shutdown: operator API, reconciliation loop, prober.
    /// The final action flushes any queued daemon reconfigure.
    pub async fn run(&self) -> Result<(), AgentError> {
        let api_state = Arc::new(ApiState {
            config: self.config.clone(),
            state: self.state.clone(),
            bird: self.bird.clone(),
            wg: self.wg.clone(),
            firewall: self.firewall.clone(),
            community: self.community.clone(),
            prober: self.prober.clone(),
            locks: self.locks.clone(),
            mesh_public_key: self.mesh.public_key().to_string(),
        });
        let mut api_task = tokio::spawn(api::serve(api_state));

        if self.config.probe_enabled {
            self.prober.start();
        }

        let daemon = self.daemon.clone();
        let mut daemon_task = tokio::spawn(async move { daemon.run().await });

        let result = tokio::select! {
            api = &mut api_task => match api {
                Ok(Err(e)) => Err(e),
                Ok(Ok(())) => Ok(()),
                Err(e) => Err(AgentError::Config(format!("operator API task: {e}"))),
            },
            _ = &mut daemon_task => Ok(()),
            _ = shutdown_signal() => {
                info!("shutdown signal received");
                Ok(())
            }
        };

        self.daemon.stop();
        self.prober.stop();
        api_task.abort();
        daemon_task.abort();

        // Flush any queued reconfigure so files written late still land.
        self.reload.reload_now().await;
        let _ = self.client.report_state(&self.state.snapshot()).await;
        info!("agent stopped");
        result
    }
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}
