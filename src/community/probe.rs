//! Latency prober
//!
//! Periodic ICMP echo probing of peer endpoints. Measured RTT is smoothed
//! with an EWMA and classified into latency tiers; the registered callback
//! fires only when a peer's tier changes. Failed probes promote a peer to
//! the worst tier immediately.

use super::latency_to_tier;
use crate::cmd;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info};

/// Callback invoked on tier change: `(asn, new_tier, smoothed_rtt_ms)`.
pub type TierCallback = Arc<dyn Fn(u32, u8, f64) + Send + Sync>;

/// One probe measurement.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    pub target: String,
    pub asn: u32,
    pub rtt_ms: f64,
    pub tier: u8,
    pub success: bool,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ProbeResult {
    fn failure(target: &str, asn: u32, error: impl Into<String>) -> Self {
        Self {
            target: target.to_string(),
            asn,
            rtt_ms: 0.0,
            tier: 8,
            success: false,
            error: Some(error.into()),
            timestamp: Utc::now(),
        }
    }
}

/// Mutable probe state for one peer.
#[derive(Debug, Clone, Serialize)]
pub struct PeerProbe {
    pub asn: u32,
    pub endpoint: String,
    pub last_rtt: Option<f64>,
    pub last_tier: Option<u8>,
    pub last_probe: Option<DateTime<Utc>>,
    pub probe_count: u64,
    pub fail_count: u64,
}

/// Aggregated view returned by the stats endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct PeerProbeStats {
    #[serde(flatten)]
    pub peer: PeerProbe,
    pub min_rtt: Option<f64>,
    pub max_rtt: Option<f64>,
    pub avg_rtt: Option<f64>,
    pub samples: usize,
    pub history: Vec<ProbeResult>,
}

const MAX_HISTORY: usize = 100;
const HISTORY_TAIL: usize = 10;

/// Periodic RTT prober over a set of peer endpoints.
pub struct LatencyProber {
    interval: Duration,
    packet_count: u32,
    timeout: Duration,
    ewma_alpha: f64,
    peers: DashMap<u32, PeerProbe>,
    history: DashMap<u32, Vec<ProbeResult>>,
    callback: parking_lot::RwLock<Option<TierCallback>>,
    running: AtomicBool,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl LatencyProber {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            packet_count: 5,
            timeout: Duration::from_secs(10),
            ewma_alpha: 0.3,
            peers: DashMap::new(),
            history: DashMap::new(),
            callback: parking_lot::RwLock::new(None),
            running: AtomicBool::new(false),
            task: parking_lot::Mutex::new(None),
        }
    }

    pub fn set_callback(&self, callback: TierCallback) {
        *self.callback.write() = Some(callback);
    }

    /// Track a peer; an existing entry just gets its endpoint refreshed.
    pub fn add_peer(&self, asn: u32, endpoint: &str) {
        match self.peers.entry(asn) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                entry.get_mut().endpoint = endpoint.to_string();
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(PeerProbe {
                    asn,
                    endpoint: endpoint.to_string(),
                    last_rtt: None,
                    last_tier: None,
                    last_probe: None,
                    probe_count: 0,
                    fail_count: 0,
                });
                self.history.insert(asn, Vec::new());
                info!(asn, endpoint, "added peer to latency probe");
            }
        }
    }

    pub fn remove_peer(&self, asn: u32) -> bool {
        let removed = self.peers.remove(&asn).is_some();
        self.history.remove(&asn);
        if removed {
            info!(asn, "removed peer from latency probe");
        }
        removed
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Start the probe loop; a second start is a no-op.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let prober = self.clone();
        let handle = tokio::spawn(async move {
            info!("latency probe started");
            while prober.running.load(Ordering::SeqCst) {
                prober.probe_all().await;
                tokio::time::sleep(prober.interval).await;
            }
            info!("latency probe stopped");
        });
        *self.task.lock() = Some(handle);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }

    /// Probe every tracked peer concurrently and fold in the results.
    pub async fn probe_all(&self) {
        if self.peers.is_empty() {
            return;
        }
        debug!(peers = self.peers.len(), "probing peers");

        let mut probes = JoinSet::new();
        for entry in self.peers.iter() {
            let (asn, endpoint) = (entry.asn, entry.endpoint.clone());
            let (count, timeout) = (self.packet_count, self.timeout);
            probes.spawn(async move { probe_endpoint(asn, &endpoint, count, timeout).await });
        }

        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok(result) => self.record(result),
                Err(e) => error!(error = %e, "probe task panicked"),
            }
        }
    }

    /// Probe one peer immediately, outside the normal cadence.
    pub async fn probe_now(&self, asn: u32) -> Option<ProbeResult> {
        let endpoint = self.peers.get(&asn)?.endpoint.clone();
        let result = probe_endpoint(asn, &endpoint, self.packet_count, self.timeout).await;
        self.record(result.clone());
        Some(result)
    }

    /// Fold a probe result into the peer state, firing the tier-change
    /// callback when the smoothed tier moves.
    fn record(&self, result: ProbeResult) {
        let Some(mut peer) = self.peers.get_mut(&result.asn) else {
            return;
        };
        let old_tier = peer.last_tier;

        if result.success {
            let smoothed = match peer.last_rtt {
                Some(prev) => self.ewma_alpha * result.rtt_ms + (1.0 - self.ewma_alpha) * prev,
                None => result.rtt_ms,
            };
            peer.last_rtt = Some(smoothed);
            peer.last_tier = Some(latency_to_tier(smoothed));
            peer.probe_count += 1;
        } else {
            // Failure goes straight to the worst bucket.
            peer.fail_count += 1;
            peer.last_tier = Some(8);
        }
        peer.last_probe = Some(result.timestamp);

        let new_tier = peer.last_tier;
        let rtt = peer.last_rtt.unwrap_or(0.0);
        let asn = peer.asn;
        drop(peer);

        if let Some(mut history) = self.history.get_mut(&result.asn) {
            history.push(result);
            if history.len() > MAX_HISTORY {
                let excess = history.len() - MAX_HISTORY;
                history.drain(..excess);
            }
        }

        if old_tier != new_tier {
            if let (Some(tier), Some(callback)) = (new_tier, self.callback.read().clone()) {
                debug!(asn, tier, "latency tier changed");
                callback(asn, tier, rtt);
            }
        }
    }

    pub fn peer_stats(&self, asn: u32) -> Option<PeerProbeStats> {
        let peer = self.peers.get(&asn)?.clone();
        let history = self.history.get(&asn).map(|h| h.clone()).unwrap_or_default();
        let rtts: Vec<f64> = history
            .iter()
            .filter(|r| r.success)
            .map(|r| r.rtt_ms)
            .collect();
        let tail = history.len().saturating_sub(HISTORY_TAIL);
        Some(PeerProbeStats {
            peer,
            min_rtt: rtts.iter().copied().fold(None, |m, v| Some(m.map_or(v, |m: f64| m.min(v)))),
            max_rtt: rtts.iter().copied().fold(None, |m, v| Some(m.map_or(v, |m: f64| m.max(v)))),
            avg_rtt: (!rtts.is_empty()).then(|| rtts.iter().sum::<f64>() / rtts.len() as f64),
            samples: rtts.len(),
            history: history[tail..].to_vec(),
        })
    }

    pub fn all_stats(&self) -> serde_json::Value {
        let peers: std::collections::BTreeMap<u32, PeerProbeStats> = self
            .peers
            .iter()
            .filter_map(|entry| self.peer_stats(*entry.key()).map(|s| (*entry.key(), s)))
            .collect();
        serde_json::json!({
            "probe_interval": self.interval.as_secs(),
            "peer_count": self.peers.len(),
            "running": self.is_running(),
            "peers": peers,
        })
    }

    #[cfg(test)]
    fn record_for_test(&self, result: ProbeResult) {
        self.record(result);
    }
}

/// Run one ICMP probe against an endpoint and parse the summary line.
async fn probe_endpoint(asn: u32, endpoint: &str, count: u32, timeout: Duration) -> ProbeResult {
    let program = if endpoint.contains(':') { "ping6" } else { "ping" };
    let count_arg = count.to_string();
    let wait_arg = timeout.as_secs().to_string();
    let deadline = timeout.saturating_mul(count) + Duration::from_secs(5);

    let output = match cmd::run(
        program,
        &["-c", &count_arg, "-W", &wait_arg, endpoint],
        deadline,
    )
    .await
    {
        Ok(out) if out.success => out.stdout,
        Ok(_) => return ProbeResult::failure(endpoint, asn, "ping failed"),
        Err(e) => return ProbeResult::failure(endpoint, asn, e.to_string()),
    };

    match parse_avg_rtt(&output) {
        Some(rtt_ms) => ProbeResult {
            target: endpoint.to_string(),
            asn,
            rtt_ms,
            tier: latency_to_tier(rtt_ms),
            success: true,
            error: None,
            timestamp: Utc::now(),
        },
        None => ProbeResult::failure(endpoint, asn, "failed to parse RTT"),
    }
}

/// Extract the mean RTT from a ping summary line. Handles both the
/// `rtt min/avg/max/mdev = a/b/c/d ms` and `min/avg/max = a/b/c ms`
/// variants.
fn parse_avg_rtt(output: &str) -> Option<f64> {
    for line in output.lines() {
        if !line.contains("min/avg/max") {
            continue;
        }
        let (_, values) = line.split_once('=')?;
        let avg = values.trim().trim_end_matches("ms").trim().split('/').nth(1)?;
        return avg.trim().parse().ok();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn success_result(asn: u32, rtt_ms: f64) -> ProbeResult {
        ProbeResult {
            target: "172.22.188.42".into(),
            asn,
            rtt_ms,
            tier: latency_to_tier(rtt_ms),
            success: true,
            error: None,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_parse_avg_rtt_linux_format() {
        let output = "\
5 packets transmitted, 5 received, 0% packet loss, time 4006ms
rtt min/avg/max/mdev = 1.234/2.345/3.456/0.123 ms";
        assert_eq!(parse_avg_rtt(output), Some(2.345));
    }

    #[test]
    fn test_parse_avg_rtt_bsd_format() {
        let output = "round-trip min/avg/max = 1.234/2.345/3.456 ms";
        assert_eq!(parse_avg_rtt(output), Some(2.345));
    }

    #[test]
    fn test_parse_avg_rtt_garbage() {
        assert_eq!(parse_avg_rtt("no summary here"), None);
    }

    #[test]
    fn test_ewma_and_tier_change_callback() {
        let prober = LatencyProber::new(Duration::from_secs(300));
        prober.add_peer(4242420337, "172.22.188.42");

        let fired: Arc<parking_lot::Mutex<Vec<(u32, u8, f64)>>> =
            Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = fired.clone();
        prober.set_callback(Arc::new(move |asn, tier, rtt| {
            sink.lock().push((asn, tier, rtt));
        }));

        // First sample initializes the EWMA at 5 ms -> tier 1.
        prober.record_for_test(success_result(4242420337, 5.0));
        assert_eq!(fired.lock().len(), 1);
        assert_eq!(fired.lock()[0].1, 1);

        // 0.3 * 30 + 0.7 * 5 = 12.5 ms -> tier 2, one callback.
        prober.record_for_test(success_result(4242420337, 30.0));
        {
            let events = fired.lock();
            assert_eq!(events.len(), 2);
            assert_eq!(events[1].0, 4242420337);
            assert_eq!(events[1].1, 2);
            assert!((events[1].2 - 12.5).abs() < 1e-9);
        }

        // 0.3 * 32 + 0.7 * 12.5 = 18.35 ms -> still tier 2, no callback.
        prober.record_for_test(success_result(4242420337, 32.0));
        assert_eq!(fired.lock().len(), 2);
    }

    #[test]
    fn test_failure_promotes_to_worst_tier() {
        let prober = LatencyProber::new(Duration::from_secs(300));
        prober.add_peer(1, "10.0.0.1");

        prober.record_for_test(success_result(1, 5.0));
        prober.record_for_test(ProbeResult::failure("10.0.0.1", 1, "ping failed"));

        let stats = prober.peer_stats(1).unwrap();
        assert_eq!(stats.peer.last_tier, Some(8));
        assert_eq!(stats.peer.fail_count, 1);
    }

    #[test]
    fn test_ewma_is_stable_on_steady_series() {
        let prober = LatencyProber::new(Duration::from_secs(300));
        prober.add_peer(1, "10.0.0.1");
        for _ in 0..50 {
            prober.record_for_test(success_result(1, 42.0));
        }
        let rtt = prober.peer_stats(1).unwrap().peer.last_rtt.unwrap();
        assert!((rtt - 42.0).abs() < 1e-9);
    }

    #[test]
    fn test_history_is_capped() {
        let prober = LatencyProber::new(Duration::from_secs(300));
        prober.add_peer(1, "10.0.0.1");
        for i in 0..150 {
            prober.record_for_test(success_result(1, 10.0 + i as f64 * 0.01));
        }
        let stats = prober.peer_stats(1).unwrap();
        assert_eq!(stats.samples, MAX_HISTORY);
        assert_eq!(stats.history.len(), HISTORY_TAIL);
    }

    #[test]
    fn test_add_existing_peer_updates_endpoint_only() {
        let prober = LatencyProber::new(Duration::from_secs(300));
        prober.add_peer(1, "10.0.0.1");
        prober.record_for_test(success_result(1, 5.0));
        prober.add_peer(1, "10.0.0.2");

        let stats = prober.peer_stats(1).unwrap();
        assert_eq!(stats.peer.endpoint, "10.0.0.2");
        assert_eq!(stats.peer.probe_count, 1);
    }

    #[test]
    fn test_remove_peer_drops_state() {
        let prober = LatencyProber::new(Duration::from_secs(300));
        prober.add_peer(1, "10.0.0.1");
        assert!(prober.remove_peer(1));
        assert!(!prober.remove_peer(1));
        assert!(prober.peer_stats(1).is_none());
    }
}
