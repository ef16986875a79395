//! Operator HTTP surface
//!
//! Token-guarded diagnostics and manual interventions: ping/trace/route
//! lookups, peer management, statistics, blacklist, community settings,
//! probe control, and maintenance mode. All endpoints speak JSON;
//! diagnostic commands run with a bounded timeout and report a
//! `"Timeout"` sentinel instead of hanging.

use crate::cmd;
use crate::community::manager::{CommunityManager, FilterRule, PeerCommunitySettings};
use crate::community::probe::LatencyProber;
use crate::config::AgentConfig;
use crate::daemon::PeerLocks;
use crate::executor::bird::BirdExecutor;
use crate::executor::firewall::FirewallExecutor;
use crate::executor::wireguard::WireguardExecutor;
use crate::layout;
use crate::state::StateStore;
use crate::AgentError;
use axum::extract::{Path, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Shared handler state.
pub struct ApiState {
    pub config: Arc<AgentConfig>,
    pub state: Arc<StateStore>,
    pub bird: Arc<BirdExecutor>,
    pub wg: Arc<WireguardExecutor>,
    pub firewall: Arc<FirewallExecutor>,
    pub community: Arc<CommunityManager>,
    pub prober: Arc<LatencyProber>,
    pub locks: Arc<PeerLocks>,
    pub mesh_public_key: String,
}

/// JSON error response with an HTTP status.
struct ApiError(StatusCode, String);

impl ApiError {
    fn bad_request(msg: impl Into<String>) -> Self {
        Self(StatusCode::BAD_REQUEST, msg.into())
    }

    fn not_found(msg: impl Into<String>) -> Self {
        Self(StatusCode::NOT_FOUND, msg.into())
    }

    fn internal(msg: impl Into<String>) -> Self {
        Self(StatusCode::INTERNAL_SERVER_ERROR, msg.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({ "error": self.1 }))).into_response()
    }
}

impl From<AgentError> for ApiError {
    fn from(e: AgentError) -> Self {
        ApiError::internal(e.to_string())
    }
}

type ApiResult = Result<Json<serde_json::Value>, ApiError>;

/// Build the router and serve until the process shuts down. A bind
/// failure is fatal: the supervisor must notice a node without its
/// operator surface.
pub async fn serve(state: Arc<ApiState>) -> Result<(), AgentError> {
    let addr = format!("{}:{}", state.config.api_host, state.config.api_port);
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| AgentError::Config(format!("cannot bind operator API on {addr}: {e}")))?;
    info!(%addr, "operator API listening");

    axum::serve(listener, app)
        .await
        .map_err(|e| AgentError::Config(format!("operator API: {e}")))
}

fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/info", get(node_info))
        // diagnostics
        .route("/ping", post(cmd_ping))
        .route("/tcping", post(cmd_tcping))
        .route("/trace", post(cmd_trace))
        .route("/route", post(cmd_route))
        .route("/path", post(cmd_path))
        // peer management
        .route("/peers", get(list_peers))
        .route("/peers/:asn/restart", post(restart_peer))
        // statistics
        .route("/stats", get(node_stats))
        .route("/stats/:asn", get(peer_stats))
        // blacklist
        .route("/blacklist", get(get_blacklist).post(add_blacklist))
        .route("/blacklist/:asn", delete(remove_blacklist))
        // communities
        .route("/communities/rules", get(list_rules).post(add_rule))
        .route("/communities/rules/:name", delete(remove_rule))
        .route("/communities/stats", get(community_stats))
        .route("/communities/route", post(route_communities))
        .route(
            "/communities/:asn",
            get(get_peer_communities).put(set_peer_communities),
        )
        // probe control
        .route("/probe", get(probe_stats))
        .route("/probe/peers", post(probe_add))
        .route("/probe/peers/:asn", delete(probe_remove))
        .route("/probe/start", post(probe_start))
        .route("/probe/stop", post(probe_stop))
        .route("/probe/run/:asn", post(probe_run))
        // maintenance
        .route("/maintenance", get(maintenance_status))
        .route("/maintenance/start", post(maintenance_start))
        .route("/maintenance/stop", post(maintenance_stop))
        .layer(middleware::from_fn_with_state(state.clone(), auth))
        .with_state(state)
}

/// Bearer-token gate; exact string equality, 401 otherwise. An empty
/// configured token disables the check.
async fn auth(State(state): State<Arc<ApiState>>, request: Request, next: Next) -> Response {
    if state.config.api_token.is_empty() {
        return next.run(request).await;
    }
    let expected = format!("Bearer {}", state.config.api_token);
    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    match presented {
        Some(token) if token == expected => next.run(request).await,
        _ => ApiError(StatusCode::UNAUTHORIZED, "Unauthorized".into()).into_response(),
    }
}

// ---- health and info ----------------------------------------------------

async fn index(State(state): State<Arc<ApiState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": AgentConfig::agent_version(),
        "node": state.config.node_name,
    }))
}

async fn node_info(State(state): State<Arc<ApiState>>) -> Json<serde_json::Value> {
    Json(json!({
        "version": AgentConfig::agent_version(),
        "node": state.config.node_name,
        "node_id": state.state.node_id(),
        "dn42_ipv4": state.config.dn42_ipv4,
        "dn42_ipv6": state.config.dn42_ipv6,
        "ebgp_public_key": state.wg.public_key(),
        "mesh_public_key": state.mesh_public_key,
    }))
}

// ---- diagnostics --------------------------------------------------------

#[derive(Deserialize)]
struct TargetBody {
    target: Option<String>,
    #[serde(default)]
    count: Option<u32>,
    #[serde(default)]
    port: Option<u16>,
}

fn required_target(body: &TargetBody) -> Result<&str, ApiError> {
    body.target
        .as_deref()
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ApiError::bad_request("Missing target"))
}

async fn cmd_ping(Json(body): Json<TargetBody>) -> ApiResult {
    let target = required_target(&body)?.to_string();
    let count = body.count.unwrap_or(4).min(10).to_string();
    let result = cmd::capture(
        "ping",
        &["-c", &count, "-W", "2", &target],
        Duration::from_secs(15),
    )
    .await;
    Ok(Json(json!({ "result": result.as_deref().unwrap_or("Timeout") })))
}

async fn cmd_tcping(Json(body): Json<TargetBody>) -> ApiResult {
    let target = required_target(&body)?.to_string();
    let port = body.port.unwrap_or(80).to_string();
    let mut result = cmd::capture("tcping", &[&target, &port], Duration::from_secs(12)).await;
    if result.is_none() {
        result = cmd::capture(
            "nc",
            &["-zv", "-w5", &target, &port],
            Duration::from_secs(10),
        )
        .await;
    }
    Ok(Json(json!({ "result": result.as_deref().unwrap_or("Timeout") })))
}

async fn cmd_trace(Json(body): Json<TargetBody>) -> ApiResult {
    let target = required_target(&body)?.to_string();
    let result = cmd::capture(
        "traceroute",
        &["-w", "2", "-q", "1", &target],
        Duration::from_secs(30),
    )
    .await;
    Ok(Json(json!({ "result": result.as_deref().unwrap_or("Timeout") })))
}

async fn cmd_route(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<TargetBody>,
) -> ApiResult {
    let target = required_target(&body)?;
    let result = state
        .bird
        .birdc(&format!("show route for {target} all"))
        .await;
    Ok(Json(json!({ "result": result.as_deref().unwrap_or("Not found") })))
}

async fn cmd_path(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<TargetBody>,
) -> ApiResult {
    let target = required_target(&body)?;
    let output = state
        .bird
        .birdc(&format!("show route for {target} all"))
        .await;
    if let Some(output) = output {
        for line in output.lines() {
            if line.contains("BGP.as_path") {
                return Ok(Json(json!({ "result": line.trim() })));
            }
        }
    }
    Err(ApiError::not_found("Not found"))
}

// ---- peer management ----------------------------------------------------

async fn list_peers(State(state): State<Arc<ApiState>>) -> ApiResult {
    let rows = state.bird.protocol_rows().await;
    let peers: Vec<serde_json::Value> = rows
        .iter()
        .map(|(name, line)| {
            json!({
                "name": name,
                "established": line.contains("Established"),
                "detail": line,
            })
        })
        .collect();
    Ok(Json(json!({ "peers": peers })))
}

/// Restart one peer. Order is load-bearing: BGP down, tunnel down,
/// tunnel up, BGP up — never reversed. The per-peer lock keeps a
/// concurrent reconciler pass off this peer.
async fn restart_peer(
    State(state): State<Arc<ApiState>>,
    Path(asn): Path<u32>,
) -> ApiResult {
    let lock = state.locks.lock_for(asn);
    let _guard = lock.lock().await;

    let ifname = layout::tunnel_ifname(asn);
    if !state.wg.config_path(&ifname).exists() {
        return Err(ApiError::not_found(format!("no such peer: AS{asn}")));
    }
    let protocol = layout::protocol_name(asn);

    state.bird.birdc(&format!("disable {protocol}")).await;
    state.wg.down(&ifname).await;
    state.wg.up(&ifname).await.map_err(ApiError::from)?;
    state.bird.birdc(&format!("enable {protocol}")).await;

    info!(asn, "peer restarted");
    Ok(Json(json!({ "result": "restarted", "asn": asn })))
}

// ---- statistics ---------------------------------------------------------

async fn node_stats(State(state): State<Arc<ApiState>>) -> ApiResult {
    let bird = state.bird.status().await;
    let wg = state.wg.status().await;
    Ok(Json(json!({
        "peer_count": bird.protocols_up + bird.protocols_down,
        "established": bird.protocols_up,
        "interfaces": wg.interfaces,
        "bird_running": bird.running,
    })))
}

async fn peer_stats(State(state): State<Arc<ApiState>>, Path(asn): Path<u32>) -> ApiResult {
    let protocol = layout::protocol_name(asn);
    let detail = state
        .bird
        .birdc(&format!("show protocols all {protocol}"))
        .await;
    Ok(Json(json!({
        "asn": asn,
        "protocol": detail,
        "probe": state.prober.peer_stats(asn),
        "communities": state.community.peer_settings(asn),
    })))
}

// ---- blacklist ----------------------------------------------------------

#[derive(Deserialize)]
struct AsnBody {
    asn: u32,
}

async fn get_blacklist(State(state): State<Arc<ApiState>>) -> ApiResult {
    Ok(Json(json!({ "blacklist": state.community.blacklist() })))
}

async fn add_blacklist(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<AsnBody>,
) -> ApiResult {
    let added = state.community.blacklist_add(body.asn)?;
    Ok(Json(json!({ "result": "added", "asn": body.asn, "changed": added })))
}

async fn remove_blacklist(
    State(state): State<Arc<ApiState>>,
    Path(asn): Path<u32>,
) -> ApiResult {
    let removed = state.community.blacklist_remove(asn)?;
    if !removed {
        return Err(ApiError::not_found(format!("AS{asn} not blacklisted")));
    }
    Ok(Json(json!({ "result": "removed", "asn": asn })))
}

// ---- communities --------------------------------------------------------

async fn get_peer_communities(
    State(state): State<Arc<ApiState>>,
    Path(asn): Path<u32>,
) -> ApiResult {
    Ok(Json(json!({
        "asn": asn,
        "settings": state.community.peer_settings(asn),
    })))
}

async fn set_peer_communities(
    State(state): State<Arc<ApiState>>,
    Path(asn): Path<u32>,
    Json(settings): Json<PeerCommunitySettings>,
) -> ApiResult {
    if let Some(tier) = settings.latency_tier {
        if tier > 8 {
            return Err(ApiError::bad_request("latency_tier must be 0..=8"));
        }
    }
    state.community.set_peer_settings(asn, settings);
    Ok(Json(json!({ "result": "updated", "asn": asn })))
}

async fn list_rules(State(state): State<Arc<ApiState>>) -> ApiResult {
    Ok(Json(json!({ "rules": state.community.list_rules() })))
}

async fn add_rule(
    State(state): State<Arc<ApiState>>,
    Json(rule): Json<FilterRule>,
) -> ApiResult {
    if rule.name.is_empty() {
        return Err(ApiError::bad_request("rule name is required"));
    }
    let name = rule.name.clone();
    state.community.add_rule(rule)?;
    Ok(Json(json!({ "result": "added", "name": name })))
}

async fn remove_rule(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
) -> ApiResult {
    if !state.community.remove_rule(&name)? {
        return Err(ApiError::not_found(format!("no such rule: {name}")));
    }
    Ok(Json(json!({ "result": "removed", "name": name })))
}

async fn community_stats(State(state): State<Arc<ApiState>>) -> ApiResult {
    match state.community.stats().await {
        Some(stats) => Ok(Json(serde_json::to_value(stats).unwrap_or_default())),
        None => Err(ApiError::internal("failed to query routes")),
    }
}

#[derive(Deserialize)]
struct PrefixBody {
    prefix: String,
}

async fn route_communities(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<PrefixBody>,
) -> ApiResult {
    match state.community.route_communities(&body.prefix).await {
        Some(route) => Ok(Json(serde_json::to_value(route).unwrap_or_default())),
        None => Err(ApiError::not_found("route not found")),
    }
}

// ---- probe control ------------------------------------------------------

#[derive(Deserialize)]
struct ProbePeerBody {
    asn: u32,
    endpoint: String,
}

async fn probe_stats(State(state): State<Arc<ApiState>>) -> ApiResult {
    Ok(Json(state.prober.all_stats()))
}

async fn probe_add(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<ProbePeerBody>,
) -> ApiResult {
    state.prober.add_peer(body.asn, &body.endpoint);
    Ok(Json(json!({ "result": "added", "asn": body.asn })))
}

async fn probe_remove(State(state): State<Arc<ApiState>>, Path(asn): Path<u32>) -> ApiResult {
    if !state.prober.remove_peer(asn) {
        return Err(ApiError::not_found(format!("AS{asn} not probed")));
    }
    Ok(Json(json!({ "result": "removed", "asn": asn })))
}

async fn probe_start(State(state): State<Arc<ApiState>>) -> ApiResult {
    state.prober.start();
    Ok(Json(json!({ "result": "started" })))
}

async fn probe_stop(State(state): State<Arc<ApiState>>) -> ApiResult {
    state.prober.stop();
    Ok(Json(json!({ "result": "stopped" })))
}

async fn probe_run(State(state): State<Arc<ApiState>>, Path(asn): Path<u32>) -> ApiResult {
    match state.prober.probe_now(asn).await {
        Some(result) => Ok(Json(serde_json::to_value(result).unwrap_or_default())),
        None => Err(ApiError::not_found(format!("AS{asn} not probed"))),
    }
}

// ---- maintenance mode ---------------------------------------------------

async fn maintenance_status(State(state): State<Arc<ApiState>>) -> ApiResult {
    Ok(Json(json!({ "active": state.community.maintenance_active() })))
}

async fn maintenance_start(State(state): State<Arc<ApiState>>) -> ApiResult {
    state.community.set_maintenance(true)?;
    Ok(Json(json!({ "result": "started" })))
}

async fn maintenance_stop(State(state): State<Arc<ApiState>>) -> ApiResult {
    state.community.set_maintenance(false)?;
    Ok(Json(json!({ "result": "stopped" })))
}
