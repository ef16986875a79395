//! Loopback executor
//!
//! Maintains the node's overlay addresses on a dummy interface: the /32
//! and /128 host addresses derived from the node id. The covering
//! prefixes are never installed on the interface — a connected route for
//! the whole overlay would make every overlay address appear locally
//! attached and break inter-node forwarding. Stale host addresses from a
//! previous node id are removed so identities do not leak across
//! re-registrations.

use crate::cmd;
use crate::layout;
use crate::AgentError;
use ipnetwork::{Ipv4Network, Ipv6Network};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;
use tracing::{debug, info, warn};

const IP_TIMEOUT: Duration = Duration::from_secs(10);

/// Dummy-interface address manager.
pub struct LoopbackExecutor {
    interface: String,
    ipv4_prefix: Ipv4Network,
    ipv6_prefix: Ipv6Network,
}

impl LoopbackExecutor {
    pub fn new(ipv4_prefix: Ipv4Network, ipv6_prefix: Ipv6Network) -> Self {
        Self {
            interface: "dummy0".into(),
            ipv4_prefix,
            ipv6_prefix,
        }
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Create the dummy interface when missing and bring it up.
    pub async fn ensure_interface(&self) -> Result<(), AgentError> {
        let exists = cmd::run("ip", &["link", "show", &self.interface], IP_TIMEOUT)
            .await
            .map(|out| out.success)
            .unwrap_or(false);
        if !exists {
            let out = cmd::run(
                "ip",
                &["link", "add", &self.interface, "type", "dummy"],
                IP_TIMEOUT,
            )
            .await?;
            if !out.success && !out.stderr.contains("exists") {
                return Err(AgentError::Executor(format!(
                    "create {}: {}",
                    self.interface,
                    out.stderr.trim()
                )));
            }
        }
        let out = cmd::run("ip", &["link", "set", &self.interface, "up"], IP_TIMEOUT).await?;
        if !out.success {
            return Err(AgentError::Executor(format!(
                "bring up {}: {}",
                self.interface,
                out.stderr.trim()
            )));
        }
        Ok(())
    }

    /// Converge the interface onto the node's addresses: remove stale
    /// host addresses from other identities, add the current ones.
    pub async fn setup(&self, node_id: u32) -> Result<(), AgentError> {
        let ipv4 = layout::node_ipv4(node_id, &self.ipv4_prefix)?;
        let ipv6 = layout::node_ipv6(node_id, &self.ipv6_prefix);

        self.cleanup_stale(ipv4, ipv6).await;

        self.add_address(&format!("{ipv4}/32")).await;
        self.add_address(&format!("{ipv6}/128")).await;

        info!(%ipv4, %ipv6, "loopback configured");
        Ok(())
    }

    /// Remove /32 and /128 addresses inside the overlay prefixes whose
    /// host part is not the current identity.
    async fn cleanup_stale(&self, keep_v4: Ipv4Addr, keep_v6: Ipv6Addr) {
        let Some(output) = cmd::capture("ip", &["addr", "show", &self.interface], IP_TIMEOUT).await
        else {
            return;
        };

        for (addr, prefix_len) in parse_addresses(&output) {
            match addr {
                ScopedAddr::V4(v4) => {
                    if prefix_len == 32 && self.ipv4_prefix.contains(v4) && v4 != keep_v4 {
                        info!(addr = %v4, "removing stale IPv4 address");
                        cmd::run_ok(
                            "ip",
                            &["addr", "del", &format!("{v4}/32"), "dev", &self.interface],
                            IP_TIMEOUT,
                        )
                        .await;
                    }
                }
                ScopedAddr::V6(v6) => {
                    if prefix_len == 128 && self.ipv6_prefix.contains(v6) && v6 != keep_v6 {
                        info!(addr = %v6, "removing stale IPv6 address");
                        cmd::run_ok(
                            "ip",
                            &["-6", "addr", "del", &format!("{v6}/128"), "dev", &self.interface],
                            IP_TIMEOUT,
                        )
                        .await;
                    }
                }
            }
        }
    }

    /// Add one address when absent; "already exists" is success.
    pub async fn add_address(&self, address: &str) -> bool {
        let bare = address.split('/').next().unwrap_or(address);
        let shown = cmd::capture("ip", &["addr", "show", &self.interface], IP_TIMEOUT)
            .await
            .unwrap_or_default();
        if shown
            .split_whitespace()
            .any(|tok| tok.split('/').next() == Some(bare))
        {
            debug!(address, "address already configured");
            return true;
        }

        match cmd::run(
            "ip",
            &["addr", "add", address, "dev", &self.interface],
            IP_TIMEOUT,
        )
        .await
        {
            Ok(out) if out.success || out.stderr.to_lowercase().contains("exists") => {
                info!(address, "added address");
                true
            }
            Ok(out) => {
                warn!(address, stderr = %out.stderr.trim(), "failed to add address");
                false
            }
            Err(e) => {
                warn!(address, error = %e, "failed to add address");
                false
            }
        }
    }
}

enum ScopedAddr {
    V4(Ipv4Addr),
    V6(Ipv6Addr),
}

/// Pull `inet`/`inet6` address/prefix pairs out of `ip addr show` output.
fn parse_addresses(output: &str) -> Vec<(ScopedAddr, u8)> {
    let mut found = Vec::new();
    for line in output.lines() {
        let mut tokens = line.split_whitespace();
        match tokens.next() {
            Some("inet") => {
                if let Some((addr, len)) = split_cidr(tokens.next()) {
                    if let Ok(v4) = addr.parse() {
                        found.push((ScopedAddr::V4(v4), len));
                    }
                }
            }
            Some("inet6") => {
                if let Some((addr, len)) = split_cidr(tokens.next()) {
                    if let Ok(v6) = addr.parse() {
                        found.push((ScopedAddr::V6(v6), len));
                    }
                }
            }
            _ => {}
        }
    }
    found
}

fn split_cidr(token: Option<&str>) -> Option<(&str, u8)> {
    let (addr, len) = token?.split_once('/')?;
    Some((addr, len.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_addresses() {
        let output = "\
4: dummy0: <BROADCAST,NOARP,UP,LOWER_UP> mtu 1500 qdisc noqueue state UNKNOWN
    inet 172.22.188.3/32 scope global dummy0
       valid_lft forever preferred_lft forever
    inet 192.168.1.10/24 brd 192.168.1.255 scope global dummy0
    inet6 fd00:4242:7777::3/128 scope global
       valid_lft forever preferred_lft forever
    inet6 fe80::c8f1:beff:fe6a:1/64 scope link
";
        let parsed = parse_addresses(output);
        assert_eq!(parsed.len(), 4);
        assert!(
            matches!(&parsed[0], (ScopedAddr::V4(a), 32) if *a == "172.22.188.3".parse::<Ipv4Addr>().unwrap())
        );
        assert!(
            matches!(&parsed[2], (ScopedAddr::V6(a), 128) if *a == "fd00:4242:7777::3".parse::<Ipv6Addr>().unwrap())
        );
    }

    #[test]
    fn test_stale_detection_logic() {
        // The cleanup predicate: /32 inside the overlay prefix, not the
        // current identity.
        let prefix: Ipv4Network = "172.22.188.0/26".parse().unwrap();
        let keep: Ipv4Addr = "172.22.188.4".parse().unwrap();

        let stale: Ipv4Addr = "172.22.188.3".parse().unwrap();
        assert!(prefix.contains(stale) && stale != keep);

        let outside: Ipv4Addr = "192.168.1.10".parse().unwrap();
        assert!(!prefix.contains(outside));

        assert!(!(prefix.contains(keep) && keep != keep));
    }

    #[test]
    fn test_split_cidr() {
        assert!(matches!(split_cidr(Some("10.0.0.1/32")), Some(("10.0.0.1", 32))));
        assert!(split_cidr(Some("garbage")).is_none());
        assert!(split_cidr(None).is_none());
    }
}
