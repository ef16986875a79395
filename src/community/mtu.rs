//! Path-MTU prober
//!
//! Detects the largest MTU that survives the path to a mesh peer by
//! pinging with the don't-fragment bit set at descending candidate sizes.
//! Intercontinental links in particular often sit behind tunnels that
//! shave the usable MTU below the WireGuard default.

use crate::cmd;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::info;

/// Candidate MTUs, tested in descending order.
const MTU_TEST_VALUES: [u16; 5] = [1420, 1400, 1380, 1320, 1280];

/// IPv6 minimum; never go below this.
const MIN_MTU: u16 = 1280;

/// IP + ICMP header overhead subtracted from the probe payload.
const ICMP_OVERHEAD: u16 = 28;

const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Cached result of one path-MTU probe.
#[derive(Debug, Clone, Serialize)]
pub struct MtuProbeResult {
    pub target: String,
    pub optimal_mtu: u16,
    pub is_low_mtu: bool,
    pub tested_at: DateTime<Utc>,
}

/// DF-bit path-MTU prober with a per-target cache.
#[derive(Default)]
pub struct MtuProber {
    cache: RwLock<HashMap<String, MtuProbeResult>>,
}

impl MtuProber {
    pub fn new() -> Self {
        Self::default()
    }

    /// Probe the usable MTU toward a target, caching the result.
    pub async fn probe(&self, target: &str) -> MtuProbeResult {
        let mut optimal = MIN_MTU;
        for mtu in MTU_TEST_VALUES {
            if self.ping_with_size(target, mtu - ICMP_OVERHEAD).await {
                optimal = mtu;
                break;
            }
        }

        let result = MtuProbeResult {
            target: target.to_string(),
            optimal_mtu: optimal,
            is_low_mtu: optimal < 1400,
            tested_at: Utc::now(),
        };
        info!(target, mtu = optimal, low = result.is_low_mtu, "path MTU probed");
        self.cache.write().insert(target.to_string(), result.clone());
        result
    }

    /// Cached MTU for a target, when one exists.
    pub fn cached(&self, target: &str) -> Option<MtuProbeResult> {
        self.cache.read().get(target).cloned()
    }

    async fn ping_with_size(&self, target: &str, payload: u16) -> bool {
        let size = payload.to_string();
        let wait = PING_TIMEOUT.as_secs().to_string();
        let out = if target.contains(':') {
            cmd::run(
                "ping6",
                &["-c", "1", "-W", &wait, "-s", &size, target],
                PING_TIMEOUT + Duration::from_secs(1),
            )
            .await
        } else {
            // -M do sets the DF bit so over-sized probes fail loudly.
            cmd::run(
                "ping",
                &["-c", "1", "-W", &wait, "-M", "do", "-s", &size, target],
                PING_TIMEOUT + Duration::from_secs(1),
            )
            .await
        };
        matches!(out, Ok(o) if o.success)
    }
}
