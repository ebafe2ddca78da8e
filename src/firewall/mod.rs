//! Session-tagged packet filter rules.
//!
//! Rules live in two isolated chains (`STORMSHADOW` in filter,
//! `STORMSHADOW-NAT` in nat) reached through a single jump from an anchor
//! chain. Kernel state sits behind [`PacketFilter`]; [`RuleManager`] holds
//! the ownership and reconciliation logic on top of it.

mod iptables;
mod manager;
mod memory;
mod nftables;

pub use self::iptables::IptablesBackend;
pub use self::manager::{
    port_set_name, CleanupReport, DivertMatch, DivertStrategy, RuleFailure, RuleManager,
    TaggedRuleView,
};
pub use self::memory::{MemoryBackend, SimPacket, SimVerdict};
pub use self::nftables::NftablesBackend;

use anyhow::Result;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use crate::config::{FirewallBackendKind, FirewallConfig};

/// Packet filter table a chain lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterTable {
    Filter,
    Nat,
}

impl FilterTable {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterTable::Filter => "filter",
            FilterTable::Nat => "nat",
        }
    }
}

impl fmt::Display for FilterTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Packet selector of a rule. All traffic this crate touches is UDP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleMatch {
    /// Every packet reaching the chain.
    All,
    /// UDP to one destination port.
    UdpDstPort(u16),
    /// UDP whose destination port is in the named set.
    UdpDstPortInSet(String),
    /// UDP addressed into `net`, optionally only from `src_port`.
    UdpToNetwork { net: IpNetwork, src_port: Option<u16> },
}

impl fmt::Display for RuleMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleMatch::All => f.write_str("all"),
            RuleMatch::UdpDstPort(port) => write!(f, "udp dport {}", port),
            RuleMatch::UdpDstPortInSet(set) => write!(f, "udp dport @{}", set),
            RuleMatch::UdpToNetwork { net, src_port } => {
                write!(f, "udp daddr {}", net)?;
                if let Some(port) = src_port {
                    write!(f, " sport {}", port)?;
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleAction {
    Queue(u16),
    Dnat(SocketAddr),
    Jump(String),
}

impl fmt::Display for RuleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleAction::Queue(num) => write!(f, "queue {}", num),
            RuleAction::Dnat(addr) => write!(f, "dnat to {}", addr),
            RuleAction::Jump(chain) => write!(f, "jump {}", chain),
        }
    }
}

/// A rule to insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSpec {
    pub table: FilterTable,
    pub chain: String,
    pub matcher: RuleMatch,
    pub action: RuleAction,
    pub comment: Option<String>,
}

impl fmt::Display for RuleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}: {} {}",
            self.table, self.chain, self.matcher, self.action
        )?;
        if let Some(comment) = &self.comment {
            write!(f, " [{}]", comment)?;
        }
        Ok(())
    }
}

/// Backend-specific identity of an installed rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleHandle {
    Nft(u32),
    Iptables(Vec<String>),
    Memory(u64),
}

/// A rule as read back from the kernel. Match and action are parsed on a
/// best-effort basis; rules the backend cannot describe keep `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledRule {
    pub table: FilterTable,
    pub chain: String,
    pub comment: Option<String>,
    pub matcher: Option<RuleMatch>,
    pub action: Option<RuleAction>,
    pub handle: RuleHandle,
}

impl InstalledRule {
    pub fn jump_target(&self) -> Option<&str> {
        match &self.action {
            Some(RuleAction::Jump(chain)) => Some(chain),
            _ => None,
        }
    }

    pub fn set_ref(&self) -> Option<&str> {
        match &self.matcher {
            Some(RuleMatch::UdpDstPortInSet(set)) => Some(set),
            _ => None,
        }
    }

    /// Short human-readable identity used in logs and failure reports.
    pub fn describe(&self) -> String {
        let matcher = self
            .matcher
            .as_ref()
            .map(|m| m.to_string())
            .unwrap_or_else(|| "?".to_string());
        let action = self
            .action
            .as_ref()
            .map(|a| a.to_string())
            .unwrap_or_else(|| "?".to_string());
        format!(
            "{}/{}: {} {} [{}]",
            self.table,
            self.chain,
            matcher,
            action,
            self.comment.as_deref().unwrap_or("")
        )
    }
}

/// Narrow interface to the host packet filter.
pub trait PacketFilter: Send {
    fn name(&self) -> &'static str;

    /// Whether changes need an effective UID of 0.
    fn requires_root(&self) -> bool {
        true
    }

    /// Name under which the backend exposes an anchor such as `OUTPUT`.
    fn anchor_chain_name(&self, _table: FilterTable, anchor: &str) -> String {
        anchor.to_string()
    }

    fn chain_exists(&self, table: FilterTable, chain: &str) -> Result<bool>;

    fn create_chain(&mut self, table: FilterTable, chain: &str) -> Result<()>;

    /// Make sure the anchor chain exists (built-ins always do).
    fn ensure_anchor_chain(&mut self, table: FilterTable, anchor: &str) -> Result<()>;

    /// Drop an anchor chain created by [`PacketFilter::ensure_anchor_chain`].
    fn release_anchor_chain(&mut self, _table: FilterTable, _anchor: &str) -> Result<()> {
        Ok(())
    }

    fn delete_chain(&mut self, table: FilterTable, chain: &str) -> Result<()>;

    /// Rules of a chain, first to last.
    fn list_rules(&self, table: FilterTable, chain: &str) -> Result<Vec<InstalledRule>>;

    /// Insert at the head of the chain.
    fn insert_rule(&mut self, rule: &RuleSpec) -> Result<()>;

    fn delete_rule(&mut self, rule: &InstalledRule) -> Result<()>;

    /// Whether timed port sets are usable on this host.
    fn probe_sets(&mut self) -> bool;

    fn ensure_port_set(&mut self, name: &str, ttl: Duration) -> Result<()>;

    /// Add or refresh a member with a fresh TTL.
    fn add_set_port(&mut self, name: &str, port: u16, ttl: Duration) -> Result<()>;

    fn list_sets(&self) -> Result<Vec<String>>;

    fn destroy_set(&mut self, name: &str) -> Result<()>;
}

/// Build the kernel backend selected in the configuration.
pub fn backend_for(config: &FirewallConfig) -> Box<dyn PacketFilter> {
    match config.backend {
        FirewallBackendKind::Nftables => Box::new(NftablesBackend::new(config)),
        FirewallBackendKind::Iptables => Box::new(IptablesBackend::new(config)),
    }
}
