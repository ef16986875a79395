//! BIRD executor
//!
//! Writes per-peer and iBGP configuration files into the directories BIRD
//! includes by glob, introspects protocol status, and owns the debounced
//! reload queue. BIRD 3.2.0 crashes on an assertion when `configure` is
//! issued faster than it can process, so reloads coalesce: many requests
//! within the quiet window collapse into a single `birdc configure`.

use crate::cmd;
use crate::layout;
use crate::AgentError;
use serde::Serialize;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Quiet window before a coalesced reload fires.
pub const COALESCE_DELAY: Duration = Duration::from_secs(2);

const BIRDC_TIMEOUT: Duration = Duration::from_secs(10);

enum ReloadRequest {
    /// Reset the quiet window; one reload fires once it elapses.
    Coalesced,
    /// Cancel any pending window and reload right now.
    Immediate(oneshot::Sender<bool>),
}

/// Cloneable handle to the process-wide reload queue. All executors and
/// services share one underlying task, so bursts from different callers
/// still collapse into a single daemon reconfigure.
#[derive(Clone)]
pub struct ReloadHandle {
    tx: mpsc::UnboundedSender<ReloadRequest>,
}

impl ReloadHandle {
    /// Schedule a coalesced reload.
    pub fn reload(&self) {
        if self.tx.send(ReloadRequest::Coalesced).is_err() {
            warn!("reload task is gone; request dropped");
        }
    }

    /// Cancel any pending window and reload synchronously. Used at
    /// shutdown and by operator-forced reloads.
    pub async fn reload_now(&self) -> bool {
        let (ack, done) = oneshot::channel();
        if self.tx.send(ReloadRequest::Immediate(ack)).is_err() {
            return false;
        }
        done.await.unwrap_or(false)
    }
}

/// Spawn the reload task against a BIRD control socket.
pub fn spawn_reloader(bird_ctl: PathBuf, delay: Duration) -> ReloadHandle {
    spawn_reloader_with(delay, move || {
        let ctl = bird_ctl.clone();
        async move { configure(&ctl).await }
    })
}

/// Spawn the reload task with a custom action; the production path wires
/// in `birdc configure`, tests count invocations.
pub fn spawn_reloader_with<F, Fut>(delay: Duration, mut action: F) -> ReloadHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = bool> + Send,
{
    let (tx, mut rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut deadline: Option<Instant> = None;
        loop {
            tokio::select! {
                request = rx.recv() => match request {
                    Some(ReloadRequest::Coalesced) => {
                        if deadline.is_some() {
                            debug!("reload window reset (coalescing requests)");
                        }
                        deadline = Some(Instant::now() + delay);
                    }
                    Some(ReloadRequest::Immediate(ack)) => {
                        deadline = None;
                        let ok = action().await;
                        let _ = ack.send(ok);
                    }
                    None => break,
                },
                _ = async { tokio::time::sleep_until(deadline.expect("guarded")).await },
                    if deadline.is_some() =>
                {
                    deadline = None;
                    action().await;
                }
            }
        }
        // Flush a still-pending window so queued work is not lost on
        // shutdown.
        if deadline.is_some() {
            action().await;
        }
    });

    ReloadHandle { tx }
}

async fn configure(bird_ctl: &Path) -> bool {
    let ctl = bird_ctl.display().to_string();
    info!("executing BIRD configuration reload");
    match cmd::run("birdc", &["-s", &ctl, "configure"], BIRDC_TIMEOUT).await {
        Ok(out) if out.success && out.stdout.contains("Reconfigured") => {
            info!("BIRD reload successful");
            true
        }
        Ok(out) => {
            warn!(stdout = %out.stdout.trim(), stderr = %out.stderr.trim(), "BIRD reload failed");
            false
        }
        Err(e) => {
            warn!(error = %e, "BIRD reload failed");
            false
        }
    }
}

/// Aggregate protocol status, as reported in heartbeats.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BirdStatus {
    pub running: bool,
    pub protocols_up: usize,
    pub protocols_down: usize,
}

/// BIRD configuration executor.
pub struct BirdExecutor {
    config_dir: PathBuf,
    bird_ctl: PathBuf,
    reload: ReloadHandle,
}

impl BirdExecutor {
    pub fn new(config_dir: impl Into<PathBuf>, bird_ctl: impl Into<PathBuf>, reload: ReloadHandle) -> Self {
        Self {
            config_dir: config_dir.into(),
            bird_ctl: bird_ctl.into(),
            reload,
        }
    }

    pub fn reload_handle(&self) -> ReloadHandle {
        self.reload.clone()
    }

    pub fn peers_dir(&self) -> PathBuf {
        self.config_dir.join("peers.d")
    }

    pub fn ibgp_dir(&self) -> PathBuf {
        self.config_dir.join("ibgp.d")
    }

    pub fn peer_path(&self, asn: u32) -> PathBuf {
        self.peers_dir()
            .join(format!("{}.conf", layout::protocol_name(asn)))
    }

    pub fn write_peer(&self, asn: u32, config: &str) -> Result<(), AgentError> {
        super::write_atomic(&self.peer_path(asn), config, 0o644)
    }

    pub fn remove_peer(&self, asn: u32) -> Result<bool, AgentError> {
        let path = self.peer_path(asn);
        if path.exists() {
            std::fs::remove_file(&path)?;
            return Ok(true);
        }
        Ok(false)
    }

    pub fn ibgp_path(&self, safe_name: &str) -> PathBuf {
        self.ibgp_dir().join(format!("{safe_name}.conf"))
    }

    pub fn write_ibgp(&self, safe_name: &str, config: &str) -> Result<(), AgentError> {
        super::write_atomic(&self.ibgp_path(safe_name), config, 0o644)
    }

    /// Names of the iBGP configs currently on disk.
    pub fn list_ibgp(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(self.ibgp_dir()) else {
            return Vec::new();
        };
        entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let name = e.file_name().into_string().ok()?;
                name.strip_suffix(".conf").map(str::to_string)
            })
            .collect()
    }

    pub fn remove_ibgp(&self, safe_name: &str) -> Result<bool, AgentError> {
        let path = self.ibgp_path(safe_name);
        if path.exists() {
            std::fs::remove_file(&path)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Schedule a coalesced daemon reload.
    pub fn reload(&self) {
        self.reload.reload();
    }

    /// Immediate reload, bypassing the quiet window.
    pub async fn reload_now(&self) -> bool {
        self.reload.reload_now().await
    }

    /// Run an arbitrary birdc command, returning stdout on success.
    pub async fn birdc(&self, command: &str) -> Option<String> {
        let ctl = self.bird_ctl.display().to_string();
        let mut args: Vec<&str> = vec!["-s", ctl.as_str()];
        args.extend(command.split_whitespace());
        match cmd::run("birdc", &args, BIRDC_TIMEOUT).await {
            Ok(out) if out.success => Some(out.stdout),
            _ => None,
        }
    }

    /// Parse `show protocols`, counting overlay sessions by state.
    pub async fn status(&self) -> BirdStatus {
        let Some(output) = self.birdc("show protocols").await else {
            return BirdStatus::default();
        };
        let mut status = BirdStatus {
            running: true,
            ..Default::default()
        };
        for line in output.lines() {
            let Some(name) = line.split_whitespace().next() else {
                continue;
            };
            if !name.starts_with("dn42_") {
                continue;
            }
            if line.contains("Established") {
                status.protocols_up += 1;
            } else {
                status.protocols_down += 1;
            }
        }
        status
    }

    /// Per-protocol rows from `show protocols` for the operator API.
    pub async fn protocol_rows(&self) -> Vec<(String, String)> {
        let Some(output) = self.birdc("show protocols").await else {
            return Vec::new();
        };
        output
            .lines()
            .filter(|l| {
                l.split_whitespace()
                    .next()
                    .is_some_and(|name| name.starts_with("dn42_") || name.starts_with("ibgp_"))
            })
            .map(|l| {
                let name = l.split_whitespace().next().unwrap_or_default().to_string();
                (name, l.trim().to_string())
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting_reloader(delay: Duration) -> (ReloadHandle, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let counted = count.clone();
        let handle = spawn_reloader_with(delay, move || {
            let counted = counted.clone();
            async move {
                counted.fetch_add(1, Ordering::SeqCst);
                true
            }
        });
        (handle, count)
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_coalesces_to_one_reload() {
        let (handle, count) = counting_reloader(Duration::from_secs(2));

        for _ in 0..5 {
            handle.reload();
            tokio::task::yield_now().await;
            tokio::time::advance(Duration::from_millis(100)).await;
        }
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_secs(3)).await;
        tokio::task::yield_now().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_resets_on_each_request() {
        let (handle, count) = counting_reloader(Duration::from_secs(2));

        handle.reload();
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_millis(1900)).await;
        handle.reload();
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_millis(1900)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0, "window should have reset");

        tokio::time::advance(Duration::from_millis(200)).await;
        tokio::task::yield_now().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_separate_quiescent_windows_reload_separately() {
        let (handle, count) = counting_reloader(Duration::from_secs(2));

        handle.reload();
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_secs(3)).await;
        tokio::task::yield_now().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        handle.reload();
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_secs(3)).await;
        tokio::task::yield_now().await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reload_now_cancels_pending_window() {
        let (handle, count) = counting_reloader(Duration::from_secs(2));

        handle.reload();
        assert!(handle.reload_now().await);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // The cancelled window must not fire a second reload.
        tokio::time::advance(Duration::from_secs(5)).await;
        tokio::task::yield_now().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handles_shared_across_clones_coalesce() {
        let (handle, count) = counting_reloader(Duration::from_secs(2));
        let other = handle.clone();

        handle.reload();
        tokio::task::yield_now().await;
        other.reload();
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_secs(3)).await;
        tokio::task::yield_now().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_peer_file_layout() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let bird = BirdExecutor::new("/etc/bird", "/var/run/bird/bird.ctl", ReloadHandle { tx });
        assert_eq!(
            bird.peer_path(4242420337),
            PathBuf::from("/etc/bird/peers.d/dn42_4242420337.conf")
        );
        assert_eq!(
            bird.ibgp_path("sfo_rr1"),
            PathBuf::from("/etc/bird/ibgp.d/sfo_rr1.conf")
        );
    }

    #[tokio::test]
    async fn test_write_remove_peer() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let bird = BirdExecutor::new(dir.path(), "/var/run/bird/bird.ctl", ReloadHandle { tx });

        bird.write_peer(4242420337, "protocol bgp dn42_4242420337 {}\n")
            .unwrap();
        assert!(bird.peer_path(4242420337).exists());

        assert!(bird.remove_peer(4242420337).unwrap());
        assert!(!bird.peer_path(4242420337).exists());
        assert!(!bird.remove_peer(4242420337).unwrap());
    }

    #[tokio::test]
    async fn test_ibgp_listing() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let bird = BirdExecutor::new(dir.path(), "/var/run/bird/bird.ctl", ReloadHandle { tx });

        bird.write_ibgp("sfo_rr1", "# a\n").unwrap();
        bird.write_ibgp("tyo_edge", "# b\n").unwrap();
        let mut names = bird.list_ibgp();
        names.sort();
        assert_eq!(names, vec!["sfo_rr1", "tyo_edge"]);
    }
}
