//! In-process packet filter used by dry runs and tests.
//!
//! Keeps chains, rules and timed port sets in memory and can evaluate a
//! simulated UDP packet against them, following jumps the way the kernel
//! would.

use anyhow::{anyhow, bail, Result};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::{FilterTable, InstalledRule, PacketFilter, RuleAction, RuleHandle, RuleMatch, RuleSpec};

const MAX_JUMP_DEPTH: usize = 16;

/// A UDP datagram for [`MemoryBackend::evaluate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimPacket {
    pub src: SocketAddr,
    pub dst: SocketAddr,
}

impl SimPacket {
    pub fn udp(src: SocketAddr, dst: SocketAddr) -> Self {
        Self { src, dst }
    }
}

/// Outcome of evaluating a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimVerdict {
    /// No rule took the packet; the chain policy accepts it.
    Accept,
    Queue(u16),
    Dnat(SocketAddr),
}

#[derive(Debug, Clone)]
struct StoredRule {
    handle: u64,
    spec: RuleSpec,
}

#[derive(Debug, Clone)]
struct MemorySet {
    ttl: Duration,
    members: BTreeMap<u16, Instant>,
}

#[derive(Debug, Default)]
struct MemoryState {
    chains: BTreeMap<(FilterTable, String), Vec<StoredRule>>,
    sets: BTreeMap<String, MemorySet>,
    sets_available: bool,
    next_handle: u64,
    failing_deletes: Vec<String>,
}

/// Cloning shares the underlying ruleset, so a test can keep a handle while
/// the rule manager owns another.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let state = MemoryState {
            sets_available: true,
            ..MemoryState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// A backend whose host lacks timed port sets.
    pub fn without_sets() -> Self {
        let backend = Self::new();
        backend.lock().sets_available = false;
        backend
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make deletion of any rule whose comment contains `needle` fail.
    pub fn fail_deletes_matching(&self, needle: &str) {
        self.lock().failing_deletes.push(needle.to_string());
    }

    pub fn clear_failures(&self) {
        self.lock().failing_deletes.clear();
    }

    /// Rules of a chain, first to last. Empty if the chain is missing.
    pub fn rules(&self, table: FilterTable, chain: &str) -> Vec<RuleSpec> {
        self.lock()
            .chains
            .get(&(table, chain.to_string()))
            .map(|rules| rules.iter().map(|r| r.spec.clone()).collect())
            .unwrap_or_default()
    }

    pub fn has_chain(&self, table: FilterTable, chain: &str) -> bool {
        self.lock().chains.contains_key(&(table, chain.to_string()))
    }

    pub fn set_names(&self) -> Vec<String> {
        self.lock().sets.keys().cloned().collect()
    }

    /// Unexpired members of a set.
    pub fn set_members(&self, name: &str) -> Vec<u16> {
        let now = Instant::now();
        self.lock()
            .sets
            .get(name)
            .map(|set| {
                set.members
                    .iter()
                    .filter(|(_, expiry)| **expiry > now)
                    .map(|(port, _)| *port)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Run `packet` through `chain` of `table`.
    pub fn evaluate(&self, table: FilterTable, chain: &str, packet: &SimPacket) -> SimVerdict {
        let now = Instant::now();
        self.lock()
            .walk(table, chain, packet, now, 0)
            .unwrap_or(SimVerdict::Accept)
    }
}

impl MemoryState {
    fn walk(
        &self,
        table: FilterTable,
        chain: &str,
        packet: &SimPacket,
        now: Instant,
        depth: usize,
    ) -> Option<SimVerdict> {
        if depth > MAX_JUMP_DEPTH {
            return None;
        }
        let rules = self.chains.get(&(table, chain.to_string()))?;
        for rule in rules {
            if !self.matches(&rule.spec.matcher, packet, now) {
                continue;
            }
            match &rule.spec.action {
                RuleAction::Queue(num) => return Some(SimVerdict::Queue(*num)),
                RuleAction::Dnat(addr) => return Some(SimVerdict::Dnat(*addr)),
                RuleAction::Jump(target) => {
                    if let Some(verdict) = self.walk(table, target, packet, now, depth + 1) {
                        return Some(verdict);
                    }
                }
            }
        }
        None
    }

    fn matches(&self, matcher: &RuleMatch, packet: &SimPacket, now: Instant) -> bool {
        match matcher {
            RuleMatch::All => true,
            RuleMatch::UdpDstPort(port) => packet.dst.port() == *port,
            RuleMatch::UdpDstPortInSet(name) => self
                .sets
                .get(name)
                .and_then(|set| set.members.get(&packet.dst.port()))
                .is_some_and(|expiry| *expiry > now),
            RuleMatch::UdpToNetwork { net, src_port } => {
                net.contains(packet.dst.ip())
                    && src_port.map_or(true, |port| packet.src.port() == port)
            }
        }
    }

    fn is_referenced(&self, table: FilterTable, chain: &str) -> bool {
        self.chains
            .iter()
            .filter(|((t, _), _)| *t == table)
            .flat_map(|(_, rules)| rules.iter())
            .any(|r| matches!(&r.spec.action, RuleAction::Jump(target) if target == chain))
    }

    fn set_in_use(&self, name: &str) -> bool {
        self.chains
            .values()
            .flat_map(|rules| rules.iter())
            .any(|r| matches!(&r.spec.matcher, RuleMatch::UdpDstPortInSet(set) if set == name))
    }
}

impl PacketFilter for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn requires_root(&self) -> bool {
        false
    }

    fn chain_exists(&self, table: FilterTable, chain: &str) -> Result<bool> {
        Ok(self.has_chain(table, chain))
    }

    fn create_chain(&mut self, table: FilterTable, chain: &str) -> Result<()> {
        let mut state = self.lock();
        let key = (table, chain.to_string());
        if state.chains.contains_key(&key) {
            bail!("chain {} already exists in {}", chain, table);
        }
        state.chains.insert(key, Vec::new());
        Ok(())
    }

    fn ensure_anchor_chain(&mut self, table: FilterTable, anchor: &str) -> Result<()> {
        self.lock()
            .chains
            .entry((table, anchor.to_string()))
            .or_default();
        Ok(())
    }

    fn delete_chain(&mut self, table: FilterTable, chain: &str) -> Result<()> {
        let mut state = self.lock();
        let key = (table, chain.to_string());
        match state.chains.get(&key) {
            None => bail!("no chain {} in {}", chain, table),
            Some(rules) if !rules.is_empty() => {
                bail!("chain {} is not empty ({} rules)", chain, rules.len())
            }
            Some(_) => {}
        }
        if state.is_referenced(table, chain) {
            bail!("chain {} is still referenced", chain);
        }
        state.chains.remove(&key);
        Ok(())
    }

    fn list_rules(&self, table: FilterTable, chain: &str) -> Result<Vec<InstalledRule>> {
        let state = self.lock();
        let rules = state
            .chains
            .get(&(table, chain.to_string()))
            .ok_or_else(|| anyhow!("no chain {} in {}", chain, table))?;

        Ok(rules
            .iter()
            .map(|r| InstalledRule {
                table,
                chain: chain.to_string(),
                comment: r.spec.comment.clone(),
                matcher: Some(r.spec.matcher.clone()),
                action: Some(r.spec.action.clone()),
                handle: RuleHandle::Memory(r.handle),
            })
            .collect())
    }

    fn insert_rule(&mut self, rule: &RuleSpec) -> Result<()> {
        let mut state = self.lock();

        if let RuleAction::Jump(target) = &rule.action {
            if !state.chains.contains_key(&(rule.table, target.clone())) {
                bail!("jump target {} does not exist", target);
            }
        }
        if let RuleMatch::UdpDstPortInSet(set) = &rule.matcher {
            if !state.sets.contains_key(set) {
                bail!("set {} does not exist", set);
            }
        }

        state.next_handle += 1;
        let handle = state.next_handle;
        let rules = state
            .chains
            .get_mut(&(rule.table, rule.chain.clone()))
            .ok_or_else(|| anyhow!("no chain {} in {}", rule.chain, rule.table))?;
        rules.insert(
            0,
            StoredRule {
                handle,
                spec: rule.clone(),
            },
        );
        Ok(())
    }

    fn delete_rule(&mut self, rule: &InstalledRule) -> Result<()> {
        let RuleHandle::Memory(handle) = rule.handle else {
            bail!("not a memory rule handle: {:?}", rule.handle);
        };

        let mut state = self.lock();
        if let Some(comment) = &rule.comment {
            if state
                .failing_deletes
                .iter()
                .any(|needle| comment.contains(needle.as_str()))
            {
                bail!("simulated delete failure for '{}'", comment);
            }
        }

        let rules = state
            .chains
            .get_mut(&(rule.table, rule.chain.clone()))
            .ok_or_else(|| anyhow!("no chain {} in {}", rule.chain, rule.table))?;
        let pos = rules
            .iter()
            .position(|r| r.handle == handle)
            .ok_or_else(|| anyhow!("rule handle {} not found in {}", handle, rule.chain))?;
        rules.remove(pos);
        Ok(())
    }

    fn probe_sets(&mut self) -> bool {
        self.lock().sets_available
    }

    fn ensure_port_set(&mut self, name: &str, ttl: Duration) -> Result<()> {
        let mut state = self.lock();
        if !state.sets_available {
            bail!("timed sets are not supported");
        }
        state.sets.entry(name.to_string()).or_insert_with(|| MemorySet {
            ttl,
            members: BTreeMap::new(),
        });
        Ok(())
    }

    fn add_set_port(&mut self, name: &str, port: u16, ttl: Duration) -> Result<()> {
        let mut state = self.lock();
        let set = state
            .sets
            .get_mut(name)
            .ok_or_else(|| anyhow!("set {} does not exist", name))?;
        let ttl = if ttl.is_zero() { set.ttl } else { ttl };
        set.members.insert(port, Instant::now() + ttl);
        Ok(())
    }

    fn list_sets(&self) -> Result<Vec<String>> {
        let state = self.lock();
        if !state.sets_available {
            bail!("timed sets are not supported");
        }
        Ok(state.sets.keys().cloned().collect())
    }

    fn destroy_set(&mut self, name: &str) -> Result<()> {
        let mut state = self.lock();
        if state.set_in_use(name) {
            bail!("set {} is still referenced by a rule", name);
        }
        state
            .sets
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| anyhow!("set {} does not exist", name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn udp_to(port: u16) -> SimPacket {
        SimPacket::udp(
            "192.168.1.10:40000".parse().unwrap(),
            format!("192.168.1.20:{}", port).parse().unwrap(),
        )
    }

    fn spec(chain: &str, matcher: RuleMatch, action: RuleAction) -> RuleSpec {
        RuleSpec {
            table: FilterTable::Filter,
            chain: chain.to_string(),
            matcher,
            action,
            comment: None,
        }
    }

    #[test]
    fn test_jump_and_queue() {
        let mut backend = MemoryBackend::new();
        backend.ensure_anchor_chain(FilterTable::Filter, "OUTPUT").unwrap();
        backend.create_chain(FilterTable::Filter, "ISO").unwrap();
        backend
            .insert_rule(&spec("OUTPUT", RuleMatch::All, RuleAction::Jump("ISO".into())))
            .unwrap();
        backend
            .insert_rule(&spec("ISO", RuleMatch::UdpDstPort(5060), RuleAction::Queue(3)))
            .unwrap();

        assert_eq!(
            backend.evaluate(FilterTable::Filter, "OUTPUT", &udp_to(5060)),
            SimVerdict::Queue(3)
        );
        assert_eq!(
            backend.evaluate(FilterTable::Filter, "OUTPUT", &udp_to(5061)),
            SimVerdict::Accept
        );
    }

    #[test]
    fn test_set_membership_drives_match() {
        let mut backend = MemoryBackend::new();
        backend.create_chain(FilterTable::Filter, "ISO").unwrap();
        backend.ensure_port_set("ports", Duration::from_secs(60)).unwrap();
        backend
            .insert_rule(&spec(
                "ISO",
                RuleMatch::UdpDstPortInSet("ports".into()),
                RuleAction::Queue(0),
            ))
            .unwrap();

        assert_eq!(
            backend.evaluate(FilterTable::Filter, "ISO", &udp_to(5060)),
            SimVerdict::Accept
        );
        backend.add_set_port("ports", 5060, Duration::from_secs(60)).unwrap();
        assert_eq!(
            backend.evaluate(FilterTable::Filter, "ISO", &udp_to(5060)),
            SimVerdict::Queue(0)
        );
        assert!(backend.destroy_set("ports").is_err());
    }

    #[test]
    fn test_without_sets() {
        let mut backend = MemoryBackend::without_sets();
        assert!(!backend.probe_sets());
        assert!(backend.ensure_port_set("ports", Duration::from_secs(1)).is_err());
    }

    #[test]
    fn test_delete_chain_guards() {
        let mut backend = MemoryBackend::new();
        backend.ensure_anchor_chain(FilterTable::Filter, "OUTPUT").unwrap();
        backend.create_chain(FilterTable::Filter, "ISO").unwrap();
        backend
            .insert_rule(&spec("OUTPUT", RuleMatch::All, RuleAction::Jump("ISO".into())))
            .unwrap();
        assert!(backend.delete_chain(FilterTable::Filter, "ISO").is_err());

        let jump = backend.list_rules(FilterTable::Filter, "OUTPUT").unwrap();
        backend.delete_rule(&jump[0]).unwrap();
        backend.delete_chain(FilterTable::Filter, "ISO").unwrap();
        assert!(!backend.has_chain(FilterTable::Filter, "ISO"));
    }

    #[test]
    fn test_simulated_delete_failure() {
        let mut backend = MemoryBackend::new();
        backend.create_chain(FilterTable::Filter, "ISO").unwrap();
        let mut rule = spec("ISO", RuleMatch::UdpDstPort(1), RuleAction::Queue(0));
        rule.comment = Some("Stormshadow:abc:1:divert".into());
        backend.insert_rule(&rule).unwrap();
        backend.fail_deletes_matching("abc");

        let installed = backend.list_rules(FilterTable::Filter, "ISO").unwrap();
        assert!(backend.delete_rule(&installed[0]).is_err());
        backend.clear_failures();
        backend.delete_rule(&installed[0]).unwrap();
    }
}
