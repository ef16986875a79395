//! Community manager
//!
//! Classifies observed route communities into the registry taxonomy,
//! maintains per-peer community settings and their routing-policy
//! fragments, owns the community filter rules, the origin-ASN blacklist
//! (serialized as a BIRD policy function), and the maintenance-mode flag
//! file. Mutations that change BIRD inputs request a debounced reload.

use super::{latency_community, tier_from_community, Action, Bandwidth, Crypto, Region};
use crate::cmd;
use crate::executor::bird::ReloadHandle;
use crate::layout;
use crate::AgentError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

const BIRDC_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-peer community settings applied to announced routes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeerCommunitySettings {
    #[serde(default)]
    pub latency_tier: Option<u8>,
    #[serde(default)]
    pub bandwidth: Option<Bandwidth>,
    #[serde(default)]
    pub crypto: Option<Crypto>,
    #[serde(default)]
    pub region: Option<Region>,
    #[serde(default)]
    pub last_rtt_ms: Option<f64>,
}

/// Match selector of a community filter rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Community,
    LargeCommunity,
    AsPath,
}

/// Action taken when a rule matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Accept,
    Reject,
    Modify,
}

/// One community-based filter rule, rendered into BIRD functions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterRule {
    pub name: String,
    pub match_type: MatchType,
    pub match_value: String,
    pub action: RuleAction,
    #[serde(default)]
    pub modify_commands: Vec<String>,
}

/// Communities observed on one route.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RouteCommunities {
    pub prefix: String,
    pub as_path: Vec<u32>,
    pub communities: Vec<(u32, u32)>,
    pub large_communities: Vec<(u32, u32, u32)>,
    pub latency_tier: Option<u8>,
    pub bandwidth: Option<Bandwidth>,
    pub crypto: Option<Crypto>,
    pub region: Option<Region>,
    pub actions: BTreeSet<Action>,
}

/// Route-count histograms per taxonomy dimension.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CommunityStats {
    pub total_routes: usize,
    pub latency_distribution: BTreeMap<u8, usize>,
    pub bandwidth_distribution: BTreeMap<String, usize>,
    pub crypto_distribution: BTreeMap<String, usize>,
    pub region_distribution: BTreeMap<String, usize>,
}

/// Community, filter, blacklist, and maintenance state for this node.
pub struct CommunityManager {
    bird_ctl: PathBuf,
    bird_config_dir: PathBuf,
    peer_settings: RwLock<HashMap<u32, PeerCommunitySettings>>,
    rules: RwLock<Vec<FilterRule>>,
    blacklist: RwLock<BTreeSet<u32>>,
    reload: ReloadHandle,
}

impl CommunityManager {
    pub fn new(
        bird_ctl: impl Into<PathBuf>,
        bird_config_dir: impl Into<PathBuf>,
        reload: ReloadHandle,
    ) -> Self {
        let bird_config_dir = bird_config_dir.into();
        let blacklist = load_blacklist(&bird_config_dir.join("blacklist.conf"));
        Self {
            bird_ctl: bird_ctl.into(),
            bird_config_dir,
            peer_settings: RwLock::new(HashMap::new()),
            rules: RwLock::new(Vec::new()),
            blacklist: RwLock::new(blacklist),
            reload,
        }
    }

    fn filters_dir(&self) -> PathBuf {
        self.bird_config_dir.join("filters.d")
    }

    fn blacklist_path(&self) -> PathBuf {
        self.bird_config_dir.join("blacklist.conf")
    }

    fn maintenance_path(&self) -> PathBuf {
        self.bird_config_dir.join("maintenance.conf")
    }

    async fn birdc(&self, command: &str) -> Option<String> {
        let ctl = self.bird_ctl.display().to_string();
        let mut args: Vec<&str> = vec!["-s", ctl.as_str()];
        args.extend(command.split_whitespace());
        match cmd::run("birdc", &args, BIRDC_TIMEOUT).await {
            Ok(out) if out.success => Some(out.stdout),
            _ => None,
        }
    }

    // ---- route classification ------------------------------------------

    /// Communities on the best route for a prefix.
    pub async fn route_communities(&self, prefix: &str) -> Option<RouteCommunities> {
        let output = self.birdc(&format!("show route for {prefix} all")).await?;
        Some(parse_route_output(&output, prefix))
    }

    /// Communities on routes learned from one peer.
    pub async fn peer_route_communities(&self, asn: u32, limit: usize) -> Vec<RouteCommunities> {
        let protocol = layout::protocol_name(asn);
        let Some(output) = self
            .birdc(&format!("show route protocol {protocol} all"))
            .await
        else {
            return Vec::new();
        };
        split_routes(&output)
            .into_iter()
            .take(limit)
            .map(|(prefix, block)| parse_route_output(&block, &prefix))
            .collect()
    }

    /// Route-count histograms across the whole table.
    pub async fn stats(&self) -> Option<CommunityStats> {
        let output = self.birdc("show route all").await?;
        let mut stats = CommunityStats::default();
        for (prefix, block) in split_routes(&output) {
            let route = parse_route_output(&block, &prefix);
            stats.total_routes += 1;
            if let Some(tier) = route.latency_tier {
                *stats.latency_distribution.entry(tier).or_default() += 1;
            }
            if let Some(bw) = route.bandwidth {
                *stats
                    .bandwidth_distribution
                    .entry(bw.as_str().to_string())
                    .or_default() += 1;
            }
            if let Some(crypto) = route.crypto {
                *stats
                    .crypto_distribution
                    .entry(crypto.as_str().to_string())
                    .or_default() += 1;
            }
            if let Some(region) = route.region {
                *stats
                    .region_distribution
                    .entry(region.as_str().to_string())
                    .or_default() += 1;
            }
        }
        Some(stats)
    }

    // ---- per-peer settings ---------------------------------------------

    pub fn peer_settings(&self, asn: u32) -> PeerCommunitySettings {
        self.peer_settings.read().get(&asn).cloned().unwrap_or_default()
    }

    /// Replace a peer's settings and re-emit its policy fragment.
    pub fn set_peer_settings(&self, asn: u32, settings: PeerCommunitySettings) {
        self.peer_settings.write().insert(asn, settings);
        if let Err(e) = self.write_peer_fragment(asn) {
            warn!(asn, error = %e, "failed to write peer community fragment");
        }
        self.reload.reload();
    }

    /// Tier-change entry point wired to the latency prober.
    pub fn record_latency_tier(&self, asn: u32, tier: u8, rtt_ms: f64) {
        info!(asn, tier, rtt_ms, "updating latency community");
        let mut settings = self.peer_settings(asn);
        settings.latency_tier = Some(tier);
        settings.last_rtt_ms = Some(rtt_ms);
        self.set_peer_settings(asn, settings);
    }

    pub fn drop_peer(&self, asn: u32) {
        self.peer_settings.write().remove(&asn);
        let _ = std::fs::remove_file(self.peer_fragment_path(asn));
    }

    fn peer_fragment_path(&self, asn: u32) -> PathBuf {
        self.filters_dir().join(format!("peer_{asn}.conf"))
    }

    fn write_peer_fragment(&self, asn: u32) -> Result<(), AgentError> {
        let settings = self.peer_settings(asn);
        let text = render_peer_fragment(asn, &settings);
        crate::executor::write_atomic(&self.peer_fragment_path(asn), &text, 0o644)
    }

    // ---- filter rules --------------------------------------------------

    pub fn list_rules(&self) -> Vec<FilterRule> {
        self.rules.read().clone()
    }

    pub fn add_rule(&self, rule: FilterRule) -> Result<(), AgentError> {
        self.rules.write().push(rule);
        self.write_rules()?;
        self.reload.reload();
        Ok(())
    }

    pub fn remove_rule(&self, name: &str) -> Result<bool, AgentError> {
        let mut rules = self.rules.write();
        let before = rules.len();
        rules.retain(|r| r.name != name);
        let removed = rules.len() < before;
        drop(rules);
        if removed {
            self.write_rules()?;
            self.reload.reload();
        }
        Ok(removed)
    }

    fn write_rules(&self) -> Result<(), AgentError> {
        let text = render_rules(&self.rules.read());
        crate::executor::write_atomic(&self.filters_dir().join("community_rules.conf"), &text, 0o644)
    }

    // ---- blacklist -----------------------------------------------------

    pub fn blacklist(&self) -> BTreeSet<u32> {
        self.blacklist.read().clone()
    }

    pub fn blacklist_add(&self, asn: u32) -> Result<bool, AgentError> {
        let added = self.blacklist.write().insert(asn);
        if added {
            self.save_blacklist()?;
        }
        Ok(added)
    }

    pub fn blacklist_remove(&self, asn: u32) -> Result<bool, AgentError> {
        let removed = self.blacklist.write().remove(&asn);
        if removed {
            self.save_blacklist()?;
        }
        Ok(removed)
    }

    fn save_blacklist(&self) -> Result<(), AgentError> {
        let text = render_blacklist(&self.blacklist.read());
        crate::executor::write_atomic(&self.blacklist_path(), &text, 0o644)?;
        info!(entries = self.blacklist.read().len(), "saved origin blacklist");
        self.reload.reload();
        Ok(())
    }

    // ---- maintenance mode ----------------------------------------------

    pub fn maintenance_active(&self) -> bool {
        std::fs::read_to_string(self.maintenance_path())
            .map(|text| text.contains("= true"))
            .unwrap_or(false)
    }

    /// Flip the maintenance flag; the daemon attaches a graceful-shutdown
    /// community to all exported routes while it is set.
    pub fn set_maintenance(&self, active: bool) -> Result<(), AgentError> {
        let line = format!("define MAINTENANCE_MODE = {active};\n");
        crate::executor::write_atomic(&self.maintenance_path(), &line, 0o644)?;
        info!(active, "maintenance mode updated");
        self.reload.reload();
        Ok(())
    }
}

// ---- rendering and parsing ---------------------------------------------

fn render_peer_fragment(asn: u32, settings: &PeerCommunitySettings) -> String {
    let mut out = format!("# Community settings for AS{asn}\n");
    if let Some(tier) = settings.latency_tier {
        let com = latency_community(tier);
        out.push_str(&format!("define PEER_{asn}_LATENCY = ({}, {});\n", com.0, com.1));
    }
    if let Some(bw) = settings.bandwidth {
        let com = bw.community();
        out.push_str(&format!("define PEER_{asn}_BANDWIDTH = ({}, {});\n", com.0, com.1));
    }
    if let Some(crypto) = settings.crypto {
        let com = crypto.community();
        out.push_str(&format!("define PEER_{asn}_CRYPTO = ({}, {});\n", com.0, com.1));
    }
    if let Some(region) = settings.region {
        let com = region.community();
        out.push_str(&format!("define PEER_{asn}_REGION = ({}, {});\n", com.0, com.1));
    }
    out
}

fn render_rules(rules: &[FilterRule]) -> String {
    let mut out = String::from(
        "# Auto-generated community filter rules\n# Managed by moenet-agent; do not edit\n\n",
    );
    for (index, rule) in rules.iter().enumerate() {
        out.push_str(&format!("# Rule: {}\n", rule.name));
        out.push_str(&format!("function community_rule_{index}() {{\n"));
        let condition = match rule.match_type {
            MatchType::Community => format!("({} ~ bgp_community)", rule.match_value),
            MatchType::LargeCommunity => format!("({} ~ bgp_large_community)", rule.match_value),
            MatchType::AsPath => format!("(bgp_path ~ [{}])", rule.match_value),
        };
        out.push_str(&format!("    if {condition} then {{\n"));
        match rule.action {
            RuleAction::Reject => out.push_str("        return false;\n"),
            RuleAction::Accept => out.push_str("        return true;\n"),
            RuleAction::Modify => {
                for command in &rule.modify_commands {
                    out.push_str(&format!("        {command};\n"));
                }
                out.push_str("        return true;\n");
            }
        }
        out.push_str("    }\n    return true;\n}\n\n");
    }
    out
}

/// Render the blacklist as a BIRD policy function the daemon evaluates on
/// every route.
pub fn render_blacklist(asns: &BTreeSet<u32>) -> String {
    let mut out = String::from("# Origin ASN blacklist\n# Managed by moenet-agent; do not edit\n\n");
    if asns.is_empty() {
        out.push_str("function is_blacklisted_origin() {\n    return false;\n}\n");
        return out;
    }
    let list = asns
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    out.push_str(&format!("define BLACKLISTED_ASNS = [{list}];\n\n"));
    out.push_str("function is_blacklisted_origin() {\n");
    out.push_str("    if bgp_path.last ~ BLACKLISTED_ASNS then return true;\n");
    out.push_str("    return false;\n}\n");
    out
}

/// Parse a generated blacklist file back into the ASN set.
pub fn load_blacklist(path: &Path) -> BTreeSet<u32> {
    let Ok(text) = std::fs::read_to_string(path) else {
        return BTreeSet::new();
    };
    parse_blacklist(&text)
}

pub fn parse_blacklist(text: &str) -> BTreeSet<u32> {
    let Some(start) = text.find("define BLACKLISTED_ASNS = [") else {
        return BTreeSet::new();
    };
    let rest = &text[start..];
    let Some(open) = rest.find('[') else {
        return BTreeSet::new();
    };
    let Some(close) = rest.find(']') else {
        return BTreeSet::new();
    };
    rest[open + 1..close]
        .split(',')
        .filter_map(|part| part.trim().parse().ok())
        .collect()
}

/// Split `show route all` output into per-route blocks. A route block
/// starts with an unindented prefix line.
fn split_routes(output: &str) -> Vec<(String, String)> {
    let mut routes: Vec<(String, String)> = Vec::new();
    let mut current: Option<(String, Vec<&str>)> = None;

    for line in output.lines() {
        let is_header = !line.is_empty()
            && !line.starts_with([' ', '\t'])
            && !line.starts_with("BIRD")
            && !line.starts_with("Table");
        if is_header {
            if let Some((prefix, lines)) = current.take() {
                routes.push((prefix, lines.join("\n")));
            }
            let prefix = line.split_whitespace().next().unwrap_or_default().to_string();
            current = Some((prefix, vec![line]));
        } else if let Some((_, lines)) = current.as_mut() {
            lines.push(line);
        }
    }
    if let Some((prefix, lines)) = current.take() {
        routes.push((prefix, lines.join("\n")));
    }
    routes
}

/// Parse one route block, classifying communities into the taxonomy.
fn parse_route_output(output: &str, prefix: &str) -> RouteCommunities {
    let mut route = RouteCommunities {
        prefix: prefix.to_string(),
        ..Default::default()
    };

    for line in output.lines() {
        let line = line.trim();
        if let Some(value) = attr_value(line, "as_path") {
            route.as_path = value
                .split_whitespace()
                .filter_map(|token| token.parse().ok())
                .collect();
        } else if let Some(value) = attr_value(line, "large_community") {
            for triple in parse_tuples(value, 3) {
                route
                    .large_communities
                    .push((triple[0], triple[1], triple[2]));
            }
        } else if let Some(value) = attr_value(line, "community") {
            for pair in parse_tuples(value, 2) {
                let com = (pair[0], pair[1]);
                route.communities.push(com);
                classify(&mut route, com);
            }
        }
    }
    route
}

/// Value of a `BGP.<name>:` or `bgp_<name>:` attribute line.
fn attr_value<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    for prefix in [format!("BGP.{name}:"), format!("bgp_{name}:")] {
        if let Some(rest) = line.strip_prefix(&prefix) {
            return Some(rest.trim());
        }
    }
    None
}

/// Parse `(a, b)` / `(a, b, c)` tuples out of an attribute value.
fn parse_tuples(value: &str, arity: usize) -> Vec<Vec<u32>> {
    let mut tuples = Vec::new();
    for chunk in value.split('(').skip(1) {
        let Some(inner) = chunk.split(')').next() else {
            continue;
        };
        let numbers: Vec<u32> = inner
            .split(',')
            .filter_map(|part| part.trim().parse().ok())
            .collect();
        if numbers.len() == arity {
            tuples.push(numbers);
        }
    }
    tuples
}

fn classify(route: &mut RouteCommunities, com: (u32, u32)) {
    if let Some(tier) = tier_from_community(com) {
        route.latency_tier = Some(tier);
    } else if let Some(bw) = Bandwidth::from_community(com) {
        route.bandwidth = Some(bw);
    } else if let Some(crypto) = Crypto::from_community(com) {
        route.crypto = Some(crypto);
    } else if let Some(region) = Region::from_community(com) {
        route.region = Some(region);
    } else if let Some(action) = Action::from_community(com) {
        route.actions.insert(action);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::bird::spawn_reloader_with;

    fn manager(dir: &Path) -> CommunityManager {
        let reload = spawn_reloader_with(Duration::from_millis(10), || async { true });
        CommunityManager::new("/var/run/bird/bird.ctl", dir, reload)
    }

    #[tokio::test]
    async fn test_blacklist_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());

        manager.blacklist_add(4242421234).unwrap();
        manager.blacklist_add(4242425678).unwrap();
        manager.blacklist_remove(4242425678).unwrap();
        manager.blacklist_add(64512).unwrap();

        let expected = manager.blacklist();
        let loaded = load_blacklist(&dir.path().join("blacklist.conf"));
        assert_eq!(loaded, expected);
        assert_eq!(loaded, BTreeSet::from([64512, 4242421234]));
    }

    #[tokio::test]
    async fn test_blacklist_empty_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        manager.blacklist_add(1).unwrap();
        manager.blacklist_remove(1).unwrap();

        let text = std::fs::read_to_string(dir.path().join("blacklist.conf")).unwrap();
        assert!(text.contains("return false"));
        assert!(parse_blacklist(&text).is_empty());
    }

    #[tokio::test]
    async fn test_blacklist_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let manager = manager(dir.path());
            manager.blacklist_add(4242421234).unwrap();
        }
        let manager = manager(dir.path());
        assert_eq!(manager.blacklist(), BTreeSet::from([4242421234]));
    }

    #[test]
    fn test_render_blacklist_is_valid_function() {
        let set = BTreeSet::from([4242421234u32, 64512]);
        let text = render_blacklist(&set);
        assert!(text.contains("define BLACKLISTED_ASNS = [64512, 4242421234];"));
        assert!(text.contains("function is_blacklisted_origin()"));
        assert!(text.contains("bgp_path.last ~ BLACKLISTED_ASNS"));
    }

    #[tokio::test]
    async fn test_peer_fragment_written_on_settings_change() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());

        manager.record_latency_tier(4242420337, 2, 12.5);
        let fragment = std::fs::read_to_string(
            dir.path().join("filters.d/peer_4242420337.conf"),
        )
        .unwrap();
        assert!(fragment.contains("define PEER_4242420337_LATENCY = (64511, 3);"));

        let settings = manager.peer_settings(4242420337);
        assert_eq!(settings.latency_tier, Some(2));
        assert_eq!(settings.last_rtt_ms, Some(12.5));
    }

    #[tokio::test]
    async fn test_filter_rules_render_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());

        manager
            .add_rule(FilterRule {
                name: "drop-high-latency".into(),
                match_type: MatchType::Community,
                match_value: "(64511, 9)".into(),
                action: RuleAction::Reject,
                modify_commands: Vec::new(),
            })
            .unwrap();

        let rules_path = dir.path().join("filters.d/community_rules.conf");
        let text = std::fs::read_to_string(&rules_path).unwrap();
        assert!(text.contains("function community_rule_0()"));
        assert!(text.contains("if ((64511, 9) ~ bgp_community) then {"));
        assert!(text.contains("return false;"));

        assert!(manager.remove_rule("drop-high-latency").unwrap());
        let text = std::fs::read_to_string(&rules_path).unwrap();
        assert!(!text.contains("community_rule_0"));
        assert!(!manager.remove_rule("drop-high-latency").unwrap());
    }

    #[tokio::test]
    async fn test_maintenance_flag_file() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());

        assert!(!manager.maintenance_active());
        manager.set_maintenance(true).unwrap();
        assert!(manager.maintenance_active());
        let text = std::fs::read_to_string(dir.path().join("maintenance.conf")).unwrap();
        assert_eq!(text, "define MAINTENANCE_MODE = true;\n");

        manager.set_maintenance(false).unwrap();
        assert!(!manager.maintenance_active());
    }

    #[test]
    fn test_parse_route_output_classification() {
        let block = "\
172.20.0.0/24        unicast [dn42_4242420337 2026-07-30] * (100) [AS4242420337i]
\tvia 172.22.188.42 on dn42-4242420337
\tType: BGP univ
\tBGP.as_path: 4242420337 4242423333
\tBGP.community: (64511,3) (64511,24) (64511,33) (64511,50) (64511,65281)
\tBGP.large_community: (4242420337, 1, 1)
";
        let route = parse_route_output(block, "172.20.0.0/24");
        assert_eq!(route.as_path, vec![4242420337, 4242423333]);
        assert_eq!(route.latency_tier, Some(2));
        assert_eq!(route.bandwidth, Some(Bandwidth::K100));
        assert_eq!(route.crypto, Some(Crypto::Encrypted));
        assert_eq!(route.region, Some(Region::AsiaEast));
        assert!(route.actions.contains(&Action::NoExport));
        assert_eq!(route.large_communities, vec![(4242420337, 1, 1)]);
    }

    #[test]
    fn test_split_routes() {
        let output = "\
BIRD 2.15.1 ready.
172.20.0.0/24        unicast [dn42_1] *
\tBGP.community: (64511,1)
172.21.0.0/24        unicast [dn42_2] *
\tBGP.community: (64511,2)
";
        let routes = split_routes(output);
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].0, "172.20.0.0/24");
        assert_eq!(routes[1].0, "172.21.0.0/24");
        assert!(routes[1].1.contains("(64511,2)"));
    }
}
