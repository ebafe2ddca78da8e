use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use nix::unistd::Uid;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::{FilterTable, InstalledRule, PacketFilter, RuleAction, RuleMatch, RuleSpec};
use crate::config::FirewallConfig;
use crate::error::FirewallError;
use crate::session::{HeartbeatStore, Session, Suid};
use crate::tag::{
    make_preserved_tag, make_tag, parse_tag, RuleTag, PURPOSE_ANCHOR, PURPOSE_RETURN,
};

/// How attack traffic is diverted to the packet queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DivertStrategy {
    /// One timed port set per session and queue, one aggregate rule.
    PortSet,
    /// One explicit rule per destination port.
    PerPort,
}

/// UDP destination ports to divert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DivertMatch {
    pub ports: Vec<u16>,
}

impl DivertMatch {
    pub fn udp_ports(ports: impl IntoIterator<Item = u16>) -> Self {
        let unique: BTreeSet<u16> = ports.into_iter().collect();
        Self {
            ports: unique.into_iter().collect(),
        }
    }
}

/// One rule or set change that did not go through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleFailure {
    pub rule: String,
    pub error: String,
}

impl fmt::Display for RuleFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.rule, self.error)
    }
}

/// Outcome of a removal pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub removed: usize,
    pub sets_destroyed: usize,
    pub failures: Vec<RuleFailure>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn merge(&mut self, other: CleanupReport) {
        self.removed += other.removed;
        self.sets_destroyed += other.sets_destroyed;
        self.failures.extend(other.failures);
    }

    fn fail(&mut self, rule: impl Into<String>, error: impl fmt::Display) {
        self.failures.push(RuleFailure {
            rule: rule.into(),
            error: error.to_string(),
        });
    }

    fn log(&self, context: &str) {
        if self.is_clean() {
            info!(
                "{}: removed {} rule(s), destroyed {} set(s)",
                context, self.removed, self.sets_destroyed
            );
            return;
        }
        error!(
            "{}: removed {} rule(s), {} failure(s)",
            context,
            self.removed,
            self.failures.len()
        );
        for failure in &self.failures {
            error!("  {}", failure);
        }
    }
}

/// A rule as shown by `status`.
#[derive(Debug, Clone, Serialize)]
pub struct TaggedRuleView {
    pub table: FilterTable,
    pub chain: String,
    pub rule: String,
    pub tag: Option<RuleTag>,
    /// Heartbeat freshness of the owning session. `None` for untagged rules
    /// and rules of the shared owner.
    pub live: Option<bool>,
}

/// Name of the acceleration set owned by a session and queue.
pub fn port_set_name(suid: &Suid, queue: u16) -> String {
    format!("ss_{}_q{}", suid, queue)
}

fn parse_port_set_name(name: &str) -> Option<(Suid, u16)> {
    let rest = name.strip_prefix("ss_")?;
    let (suid, queue) = rest.rsplit_once("_q")?;
    Some((Suid::parse(suid)?, queue.parse().ok()?))
}

fn unix_now() -> u64 {
    u64::try_from(Utc::now().timestamp()).unwrap_or_default()
}

fn owner_of(rule: &InstalledRule) -> Option<Suid> {
    rule.comment
        .as_deref()
        .and_then(parse_tag)
        .map(|tag| tag.suid)
}

/// Session whose cleanup may remove `rule`. Preserved rules and rules of the
/// shared owner have none.
fn removable_owner(rule: &InstalledRule) -> Option<Suid> {
    rule.comment
        .as_deref()
        .and_then(parse_tag)
        .filter(|tag| !tag.preserve && !tag.suid.is_shared())
        .map(|tag| tag.suid)
}

/// Jump from `anchor_chain` into `chain`, owned by no session.
fn anchor_rule(table: FilterTable, anchor_chain: &str, chain: &str) -> RuleSpec {
    RuleSpec {
        table,
        chain: anchor_chain.to_string(),
        matcher: RuleMatch::All,
        action: RuleAction::Jump(chain.to_string()),
        comment: Some(make_preserved_tag(&Suid::shared(), unix_now(), PURPOSE_ANCHOR)),
    }
}

/// Owns the isolated chains and every tagged rule in them.
pub struct RuleManager {
    backend: Box<dyn PacketFilter>,
    config: FirewallConfig,
    heartbeats: HeartbeatStore,
    stale_after: Duration,
    strategy: Option<DivertStrategy>,
    prepared: bool,
    set_members: BTreeMap<String, BTreeSet<u16>>,
}

impl RuleManager {
    pub fn new(
        backend: Box<dyn PacketFilter>,
        config: FirewallConfig,
        heartbeats: HeartbeatStore,
        stale_after: Duration,
    ) -> Self {
        Self {
            backend,
            config,
            heartbeats,
            stale_after,
            strategy: None,
            prepared: false,
            set_members: BTreeMap::new(),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn strategy(&self) -> Option<DivertStrategy> {
        self.strategy
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    fn set_ttl(&self) -> Duration {
        Duration::from_secs(self.config.set_ttl_secs)
    }

    /// (table, isolated chain, anchor) for filter and nat.
    fn layout(&self) -> [(FilterTable, String, String); 2] {
        [
            (
                FilterTable::Filter,
                self.config.filter_chain.clone(),
                self.config.filter_anchor.clone(),
            ),
            (
                FilterTable::Nat,
                self.config.nat_chain.clone(),
                self.config.nat_anchor.clone(),
            ),
        ]
    }

    fn isolated_chain(&self, table: FilterTable) -> &str {
        match table {
            FilterTable::Filter => &self.config.filter_chain,
            FilterTable::Nat => &self.config.nat_chain,
        }
    }

    /// Rules of an isolated chain; a chain that does not exist yet is empty.
    fn isolated_rules(&self, table: FilterTable) -> anyhow::Result<Vec<InstalledRule>> {
        let chain = self.isolated_chain(table);
        if !self.backend.chain_exists(table, chain)? {
            return Ok(Vec::new());
        }
        self.backend.list_rules(table, chain)
    }

    fn owned_rules(
        &self,
        table: FilterTable,
        suid: &Suid,
    ) -> Result<Vec<InstalledRule>, FirewallError> {
        let rules = self.isolated_rules(table).map_err(|e| {
            FirewallError::backend(format!("listing {}", self.isolated_chain(table)), e)
        })?;
        Ok(rules
            .into_iter()
            .filter(|r| owner_of(r).as_ref() == Some(suid))
            .collect())
    }

    /// Kernel backends need an effective UID of 0.
    pub fn check_privileges(&self) -> Result<(), FirewallError> {
        if !self.backend.requires_root() {
            return Ok(());
        }
        let euid = Uid::effective();
        if euid.is_root() {
            Ok(())
        } else {
            Err(FirewallError::Privilege {
                euid: euid.as_raw(),
            })
        }
    }

    /// Ensure chains, reconcile stale state and pick the divert strategy.
    /// Install calls are refused until this has run.
    pub fn prepare(
        &mut self,
        session: &Session,
        now: DateTime<Utc>,
    ) -> Result<CleanupReport, FirewallError> {
        self.check_privileges()?;
        self.ensure_chains(session)?;
        let report = self.reconcile_startup(now);
        self.select_strategy();
        self.prepared = true;
        Ok(report)
    }

    /// Create the isolated chains and their anchor jumps if missing. Anchor
    /// jumps belong to the shared owner, never to `session`.
    pub fn ensure_chains(&mut self, session: &Session) -> Result<(), FirewallError> {
        debug!("Ensuring isolated chains for session {}", session.suid());
        for (table, chain, anchor) in self.layout() {
            let exists = self
                .backend
                .chain_exists(table, &chain)
                .map_err(|e| FirewallError::backend(format!("checking chain {}", chain), e))?;
            if !exists {
                self.backend
                    .create_chain(table, &chain)
                    .map_err(|e| FirewallError::backend(format!("creating chain {}", chain), e))?;
                info!("Created isolated chain {} ({})", chain, table);
            }

            self.backend
                .ensure_anchor_chain(table, &anchor)
                .map_err(|e| FirewallError::backend(format!("preparing anchor {}", anchor), e))?;
            let anchor_chain = self.backend.anchor_chain_name(table, &anchor);

            let anchored = self
                .backend
                .list_rules(table, &anchor_chain)
                .map_err(|e| FirewallError::backend(format!("listing {}", anchor_chain), e))?
                .iter()
                .any(|r| r.jump_target() == Some(chain.as_str()));
            if anchored {
                debug!("{} already jumps to {}", anchor_chain, chain);
                continue;
            }

            let jump = anchor_rule(table, &anchor_chain, &chain);
            self.backend
                .insert_rule(&jump)
                .map_err(|e| FirewallError::backend(format!("anchoring {}", chain), e))?;
            info!("Anchored {} from {}", chain, anchor_chain);
        }
        Ok(())
    }

    /// Pick the divert strategy once per manager.
    pub fn select_strategy(&mut self) -> DivertStrategy {
        if let Some(strategy) = self.strategy {
            return strategy;
        }
        let strategy = if !self.config.acceleration {
            debug!("Acceleration sets disabled by configuration");
            DivertStrategy::PerPort
        } else if self.backend.probe_sets() {
            DivertStrategy::PortSet
        } else {
            info!(
                "Acceleration set unavailable on {}, using per-port divert rules",
                self.backend.name()
            );
            DivertStrategy::PerPort
        };
        self.strategy = Some(strategy);
        strategy
    }

    /// Divert UDP traffic to `queue`. Returns the number of rules inserted;
    /// ports already diverted by this session are left alone.
    pub fn install_divert_rule(
        &mut self,
        divert: &DivertMatch,
        queue: u16,
        session: &Session,
        purpose: &str,
    ) -> Result<usize, FirewallError> {
        if !self.prepared {
            return Err(FirewallError::NotPrepared);
        }
        if divert.ports.is_empty() {
            return Err(FirewallError::InvalidRule(
                "divert rule needs at least one destination port".to_string(),
            ));
        }

        let existing = self.owned_rules(FilterTable::Filter, session.suid())?;
        let chain = self.config.filter_chain.clone();
        let mut failures = Vec::new();
        let mut installed = 0;

        match self.select_strategy() {
            DivertStrategy::PortSet => {
                let set = port_set_name(session.suid(), queue);
                let ttl = self.set_ttl();
                self.backend
                    .ensure_port_set(&set, ttl)
                    .map_err(|e| FirewallError::backend(format!("creating set {}", set), e))?;

                for &port in &divert.ports {
                    match self.backend.add_set_port(&set, port, ttl) {
                        Ok(()) => {
                            self.set_members.entry(set.clone()).or_default().insert(port);
                        }
                        Err(e) => {
                            warn!("Failed to add port {} to {}: {:#}", port, set, e);
                            failures.push(RuleFailure {
                                rule: format!("{} member {}", set, port),
                                error: format!("{:#}", e),
                            });
                        }
                    }
                }

                if existing.iter().any(|r| r.set_ref() == Some(set.as_str())) {
                    debug!("Aggregate divert rule for {} already present", set);
                } else {
                    let rule = RuleSpec {
                        table: FilterTable::Filter,
                        chain: chain.clone(),
                        matcher: RuleMatch::UdpDstPortInSet(set.clone()),
                        action: RuleAction::Queue(queue),
                        comment: Some(make_tag(session.suid(), unix_now(), purpose)),
                    };
                    self.insert(&rule, &mut installed, &mut failures);
                }
            }
            DivertStrategy::PerPort => {
                for &port in &divert.ports {
                    let diverted = existing
                        .iter()
                        .any(|r| r.matcher == Some(RuleMatch::UdpDstPort(port)));
                    if diverted {
                        debug!("Port {} already diverted by {}", port, session.suid());
                        continue;
                    }
                    let rule = RuleSpec {
                        table: FilterTable::Filter,
                        chain: chain.clone(),
                        matcher: RuleMatch::UdpDstPort(port),
                        action: RuleAction::Queue(queue),
                        comment: Some(make_tag(session.suid(), unix_now(), purpose)),
                    };
                    self.insert(&rule, &mut installed, &mut failures);
                }
            }
        }

        if failures.is_empty() {
            Ok(installed)
        } else {
            Err(FirewallError::Install { failures })
        }
    }

    fn insert(&mut self, rule: &RuleSpec, installed: &mut usize, failures: &mut Vec<RuleFailure>) {
        match self.backend.insert_rule(rule) {
            Ok(()) => {
                info!("Installed {}", rule);
                *installed += 1;
            }
            Err(e) => {
                warn!("Failed to install {}: {:#}", rule, e);
                failures.push(RuleFailure {
                    rule: rule.to_string(),
                    error: format!("{:#}", e),
                });
            }
        }
    }

    /// DNAT UDP replies addressed to the spoofed subnet to a reachable
    /// receiver, optionally only those coming from `source_port`.
    pub fn install_return_rule(
        &mut self,
        spoofed_subnet: IpNetwork,
        return_target: SocketAddr,
        source_port: Option<u16>,
        session: &Session,
    ) -> Result<usize, FirewallError> {
        if !self.prepared {
            return Err(FirewallError::NotPrepared);
        }
        if spoofed_subnet.is_ipv4() != return_target.is_ipv4() {
            return Err(FirewallError::InvalidRule(format!(
                "return target {} and spoofed subnet {} are different address families",
                return_target, spoofed_subnet
            )));
        }

        let matcher = RuleMatch::UdpToNetwork {
            net: spoofed_subnet,
            src_port: source_port,
        };
        let action = RuleAction::Dnat(return_target);
        let existing = self.owned_rules(FilterTable::Nat, session.suid())?;
        if existing
            .iter()
            .any(|r| r.matcher.as_ref() == Some(&matcher) && r.action.as_ref() == Some(&action))
        {
            debug!("Return rule for {} already present", spoofed_subnet);
            return Ok(0);
        }

        let rule = RuleSpec {
            table: FilterTable::Nat,
            chain: self.config.nat_chain.clone(),
            matcher,
            action,
            comment: Some(make_tag(session.suid(), unix_now(), PURPOSE_RETURN)),
        };
        let mut installed = 0;
        let mut failures = Vec::new();
        self.insert(&rule, &mut installed, &mut failures);
        if failures.is_empty() {
            Ok(installed)
        } else {
            Err(FirewallError::Install { failures })
        }
    }

    /// Re-add the session's set members so their TTL never lapses while the
    /// session is alive. Returns the number of members refreshed.
    pub fn refresh_session_sets(&mut self, session: &Session) -> usize {
        let prefix = format!("ss_{}_q", session.suid());
        let ttl = self.set_ttl();
        let mut refreshed = 0;
        for (set, ports) in self
            .set_members
            .iter()
            .filter(|(name, _)| name.starts_with(&prefix))
        {
            for &port in ports {
                match self.backend.add_set_port(set, port, ttl) {
                    Ok(()) => refreshed += 1,
                    Err(e) => warn!("Failed to refresh {} in {}: {:#}", port, set, e),
                }
            }
        }
        debug!("Refreshed {} set member(s) for {}", refreshed, session.suid());
        refreshed
    }

    fn remove_rule(&mut self, rule: &InstalledRule, report: &mut CleanupReport) {
        match self.backend.delete_rule(rule) {
            Ok(()) => {
                debug!("Removed {}", rule.describe());
                report.removed += 1;
            }
            Err(e) => {
                warn!("Failed to remove {}: {:#}", rule.describe(), e);
                report.fail(rule.describe(), format!("{:#}", e));
            }
        }
    }

    /// Sets are optional; a backend without them has nothing to destroy.
    fn destroy_sets_where(&mut self, report: &mut CleanupReport, doomed: impl Fn(&Suid) -> bool) {
        let sets = match self.backend.list_sets() {
            Ok(sets) => sets,
            Err(e) => {
                debug!("Skipping set cleanup: {:#}", e);
                return;
            }
        };
        for name in sets {
            let Some((owner, _queue)) = parse_port_set_name(&name) else {
                continue;
            };
            if !doomed(&owner) {
                continue;
            }
            match self.backend.destroy_set(&name) {
                Ok(()) => {
                    debug!("Destroyed set {}", name);
                    report.sets_destroyed += 1;
                    self.set_members.remove(&name);
                }
                Err(e) => {
                    warn!("Failed to destroy set {}: {:#}", name, e);
                    report.fail(format!("set {}", name), format!("{:#}", e));
                }
            }
        }
    }

    /// Remove every rule and set owned by `suid`. Failures are collected,
    /// never returned early.
    pub fn cleanup_session(&mut self, suid: &Suid) -> CleanupReport {
        let mut report = CleanupReport::default();

        for table in [FilterTable::Filter, FilterTable::Nat] {
            match self.isolated_rules(table) {
                Ok(rules) => {
                    for rule in rules
                        .iter()
                        .filter(|r| removable_owner(r).as_ref() == Some(suid))
                    {
                        self.remove_rule(rule, &mut report);
                    }
                }
                Err(e) => {
                    let chain = self.isolated_chain(table).to_string();
                    report.fail(chain, format!("{:#}", e));
                }
            }
        }
        self.destroy_sets_where(&mut report, |owner| owner == suid);

        report.log(&format!("Cleanup of session {}", suid));
        report
    }

    /// Remove rules and sets of sessions whose heartbeat is stale or gone.
    /// Untagged rules and live sessions are never touched.
    pub fn reconcile_startup(&mut self, now: DateTime<Utc>) -> CleanupReport {
        let swept = self.heartbeats.sweep_stale(now, self.stale_after);
        if swept > 0 {
            debug!("Swept {} stale heartbeat(s)", swept);
        }

        let mut report = CleanupReport::default();
        let mut owned: BTreeMap<Suid, Vec<InstalledRule>> = BTreeMap::new();

        for table in [FilterTable::Filter, FilterTable::Nat] {
            match self.isolated_rules(table) {
                Ok(rules) => {
                    for rule in rules {
                        match rule.comment.as_deref().and_then(parse_tag) {
                            Some(tag) if tag.preserve || tag.suid.is_shared() => {
                                debug!("Keeping preserved rule {}", rule.describe())
                            }
                            Some(tag) => owned.entry(tag.suid).or_default().push(rule),
                            None => debug!("Skipping untagged rule {}", rule.describe()),
                        }
                    }
                }
                Err(e) => {
                    let chain = self.isolated_chain(table).to_string();
                    report.fail(chain, format!("{:#}", e));
                }
            }
        }

        for (suid, rules) in owned {
            if !self.heartbeats.is_stale(&suid, now, self.stale_after) {
                debug!("Session {} is live, keeping {} rule(s)", suid, rules.len());
                continue;
            }
            info!("Removing {} rule(s) of stale session {}", rules.len(), suid);
            for rule in &rules {
                self.remove_rule(rule, &mut report);
            }
        }

        self.adopt_stale_anchors(now, &mut report);

        let heartbeats = self.heartbeats.clone();
        let stale_after = self.stale_after;
        self.destroy_sets_where(&mut report, |owner| {
            heartbeats.is_stale(owner, now, stale_after)
        });

        report.log("Startup reconciliation");
        report
    }

    /// Remove anchor jumps tagged by a session that is now stale. If no other
    /// jump into the isolated chain remains, one of the shared owner takes
    /// its place first.
    fn adopt_stale_anchors(&mut self, now: DateTime<Utc>, report: &mut CleanupReport) {
        for (table, chain, anchor) in self.layout() {
            let anchor_chain = self.backend.anchor_chain_name(table, &anchor);
            let rules = match self.backend.chain_exists(table, &anchor_chain) {
                Ok(true) => self.backend.list_rules(table, &anchor_chain),
                Ok(false) => continue,
                Err(e) => Err(e),
            };
            let rules = match rules {
                Ok(rules) => rules,
                Err(e) => {
                    report.fail(anchor_chain, format!("{:#}", e));
                    continue;
                }
            };

            let (stale, kept): (Vec<_>, Vec<_>) = rules
                .into_iter()
                .filter(|r| r.jump_target() == Some(chain.as_str()))
                .partition(|r| {
                    removable_owner(r)
                        .is_some_and(|owner| self.heartbeats.is_stale(&owner, now, self.stale_after))
                });
            if stale.is_empty() {
                continue;
            }

            if kept.is_empty() {
                let shared = anchor_rule(table, &anchor_chain, &chain);
                if let Err(e) = self.backend.insert_rule(&shared) {
                    warn!("Failed to install {}: {:#}", shared, e);
                    report.fail(shared.to_string(), format!("{:#}", e));
                    continue;
                }
                info!("Anchor {} -> {} handed to the shared owner", anchor_chain, chain);
            }
            for rule in &stale {
                self.remove_rule(rule, report);
            }
        }
    }

    /// Remove the anchors and isolated chains. Refuses while any rule in
    /// them still belongs to a live session; preserved rules of dead
    /// sessions go with the chains.
    pub fn teardown(&mut self, now: DateTime<Utc>) -> Result<CleanupReport, FirewallError> {
        self.check_privileges()?;
        let mut report = self.reconcile_startup(now);

        let mut live = BTreeSet::new();
        let mut leftovers = Vec::new();
        for table in [FilterTable::Filter, FilterTable::Nat] {
            let rules = self.isolated_rules(table).map_err(|e| {
                FirewallError::backend(format!("listing {}", self.isolated_chain(table)), e)
            })?;
            for rule in rules {
                match owner_of(&rule) {
                    Some(owner)
                        if !owner.is_shared()
                            && !self.heartbeats.is_stale(&owner, now, self.stale_after) =>
                    {
                        live.insert(owner.to_string());
                    }
                    Some(_) => leftovers.push(rule),
                    None => {}
                }
            }
        }
        if !live.is_empty() {
            return Err(FirewallError::ChainsInUse {
                sessions: live.into_iter().collect(),
            });
        }
        for rule in &leftovers {
            self.remove_rule(rule, &mut report);
        }

        for (table, chain, anchor) in self.layout() {
            let anchor_chain = self.backend.anchor_chain_name(table, &anchor);
            match self.backend.list_rules(table, &anchor_chain) {
                Ok(rules) => {
                    for rule in rules
                        .iter()
                        .filter(|r| r.jump_target() == Some(chain.as_str()))
                    {
                        self.remove_rule(rule, &mut report);
                    }
                }
                Err(e) => debug!("No anchor chain {}: {:#}", anchor_chain, e),
            }

            match self.backend.chain_exists(table, &chain) {
                Ok(true) => match self.backend.delete_chain(table, &chain) {
                    Ok(()) => info!("Deleted chain {} ({})", chain, table),
                    Err(e) => report.fail(format!("chain {}", chain), format!("{:#}", e)),
                },
                Ok(false) => debug!("Chain {} already gone", chain),
                Err(e) => report.fail(format!("chain {}", chain), format!("{:#}", e)),
            }

            if let Err(e) = self.backend.release_anchor_chain(table, &anchor) {
                report.fail(format!("anchor {}", anchor_chain), format!("{:#}", e));
            }
        }

        self.prepared = false;
        self.strategy = None;
        report.log("Teardown");
        Ok(report)
    }

    /// Every rule in the isolated chains plus the anchor jumps into them.
    pub fn snapshot(&self, now: DateTime<Utc>) -> Result<Vec<TaggedRuleView>, FirewallError> {
        let mut views = Vec::new();

        for (table, chain, anchor) in self.layout() {
            let anchor_chain = self.backend.anchor_chain_name(table, &anchor);
            let anchors = match self.backend.chain_exists(table, &anchor_chain) {
                Ok(true) => self
                    .backend
                    .list_rules(table, &anchor_chain)
                    .map_err(|e| FirewallError::backend(format!("listing {}", anchor_chain), e))?,
                _ => Vec::new(),
            };
            let isolated = self
                .isolated_rules(table)
                .map_err(|e| FirewallError::backend(format!("listing {}", chain), e))?;

            for rule in anchors
                .into_iter()
                .filter(|r| r.jump_target() == Some(chain.as_str()))
                .chain(isolated)
            {
                let tag = rule.comment.as_deref().and_then(parse_tag);
                let live = tag
                    .as_ref()
                    .filter(|t| !t.suid.is_shared())
                    .map(|t| !self.heartbeats.is_stale(&t.suid, now, self.stale_after));
                let rule_text = format!(
                    "{} {}",
                    rule.matcher
                        .as_ref()
                        .map(|m| m.to_string())
                        .unwrap_or_else(|| "?".to_string()),
                    rule.action
                        .as_ref()
                        .map(|a| a.to_string())
                        .unwrap_or_else(|| "?".to_string()),
                );
                views.push(TaggedRuleView {
                    table,
                    chain: rule.chain,
                    rule: rule_text,
                    tag,
                    live,
                });
            }
        }
        Ok(views)
    }
}
