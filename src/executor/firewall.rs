//! Firewall executor
//!
//! Opens UDP listener ports for tunnel traffic. Every rule carries the
//! comment tag `moenet-dn42-<port>` so the agent can enumerate, diff, and
//! remove its own rules without touching operator rules. Rules are added
//! symmetrically for IPv4 and IPv6 and persisted to the standard save
//! files after every mutation.

use crate::cmd;
use serde::Serialize;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, error, info};

const IPTABLES_TIMEOUT: Duration = Duration::from_secs(10);
const COMMENT_PREFIX: &str = "moenet-dn42";

/// Outcome of a [`FirewallExecutor::sync_ports`] convergence pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PortSyncOutcome {
    pub added: usize,
    pub removed: usize,
}

/// iptables/ip6tables driver for tunnel listener ports.
pub struct FirewallExecutor {
    chain: String,
}

impl Default for FirewallExecutor {
    fn default() -> Self {
        Self::new("INPUT")
    }
}

impl FirewallExecutor {
    pub fn new(chain: impl Into<String>) -> Self {
        Self {
            chain: chain.into(),
        }
    }

    fn comment(port: u16) -> String {
        format!("{COMMENT_PREFIX}-{port}")
    }

    fn rule_args(&self, action: &str, port: u16, comment: &str) -> Vec<String> {
        vec![
            action.to_string(),
            self.chain.clone(),
            "-p".into(),
            "udp".into(),
            "--dport".into(),
            port.to_string(),
            "-m".into(),
            "comment".into(),
            "--comment".into(),
            comment.to_string(),
            "-j".into(),
            "ACCEPT".into(),
        ]
    }

    async fn table(&self, tool: &str, action: &str, port: u16) -> bool {
        let comment = Self::comment(port);
        let args = self.rule_args(action, port, &comment);
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        cmd::run_ok(tool, &refs, IPTABLES_TIMEOUT).await
    }

    async fn port_exists(&self, port: u16) -> bool {
        let comment = Self::comment(port);
        let args = self.rule_args("-C", port, &comment);
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        matches!(cmd::run("iptables", &refs, IPTABLES_TIMEOUT).await, Ok(out) if out.success)
    }

    /// Open a port for both families; already-present rules are success.
    pub async fn allow_port(&self, port: u16) -> bool {
        if self.port_exists(port).await {
            debug!(port, "port already open");
            return true;
        }

        let ok4 = self.table("iptables", "-A", port).await;
        let ok6 = self.table("ip6tables", "-A", port).await;
        let success = ok4 && ok6;
        if success {
            info!(port, "opened firewall port");
            self.save_rules().await;
        } else {
            error!(port, "failed to open firewall port");
        }
        success
    }

    /// Remove the tagged rules for a port in both families.
    pub async fn remove_port(&self, port: u16) -> bool {
        self.table("iptables", "-D", port).await;
        self.table("ip6tables", "-D", port).await;
        info!(port, "removed firewall port");
        self.save_rules().await;
        true
    }

    /// Ports currently opened by this agent (identified by comment tag).
    pub async fn open_ports(&self) -> Vec<u16> {
        let Some(output) = cmd::capture(
            "iptables",
            &["-L", &self.chain, "-n", "--line-numbers"],
            IPTABLES_TIMEOUT,
        )
        .await
        else {
            return Vec::new();
        };
        parse_tagged_ports(&output)
    }

    /// Converge the tagged rule set onto `expected`.
    pub async fn sync_ports(&self, expected: &[u16]) -> PortSyncOutcome {
        let current: BTreeSet<u16> = self.open_ports().await.into_iter().collect();
        let expected: BTreeSet<u16> = expected.iter().copied().collect();

        let mut outcome = PortSyncOutcome::default();
        for port in expected.difference(&current) {
            if self.allow_port(*port).await {
                outcome.added += 1;
            }
        }
        for port in current.difference(&expected) {
            if self.remove_port(*port).await {
                outcome.removed += 1;
            }
        }
        outcome
    }

    async fn save_rules(&self) {
        cmd::run_ok(
            "sh",
            &["-c", "iptables-save > /etc/iptables/rules.v4"],
            IPTABLES_TIMEOUT,
        )
        .await;
        cmd::run_ok(
            "sh",
            &["-c", "ip6tables-save > /etc/iptables/rules.v6"],
            IPTABLES_TIMEOUT,
        )
        .await;
    }
}

/// Extract ports from `iptables -L` lines carrying our comment tag.
fn parse_tagged_ports(listing: &str) -> Vec<u16> {
    let mut ports: BTreeSet<u16> = BTreeSet::new();
    for line in listing.lines() {
        if !line.contains(COMMENT_PREFIX) {
            continue;
        }
        for part in line.split_whitespace() {
            if let Some(value) = part.strip_prefix("dpt:") {
                if let Ok(port) = value.parse() {
                    ports.insert(port);
                }
            }
        }
    }
    ports.into_iter().collect()
}
