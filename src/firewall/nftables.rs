use anyhow::{bail, Context, Result};
use ipnetwork::IpNetwork;
use nftables::{
    batch::Batch,
    expr::{Elem, Expression, Meta, MetaKey, NamedExpression, Payload, PayloadField, Prefix},
    helper::{apply_ruleset, get_current_ruleset},
    schema::{
        Chain, Element, NfCmd, NfListObject, NfObject, Rule, Set, SetFlag, SetType,
        SetTypeValue, Table,
    },
    stmt::{JumpTarget, Match, NATFamily, Operator, Queue, Statement, NAT},
    types::{NfChainPolicy, NfChainType, NfFamily, NfHook},
};
use std::borrow::Cow;
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tracing::debug;

use super::{FilterTable, InstalledRule, PacketFilter, RuleAction, RuleHandle, RuleMatch, RuleSpec};
use crate::config::FirewallConfig;

const PROBE_SET: &str = "ss_probe";

/// nftables backend. Everything lives in one `inet` table; anchors are base
/// chains of that table hooked where the configured anchor names point.
pub struct NftablesBackend {
    table: String,
    priority: i32,
    nat_priority: i32,
}

impl NftablesBackend {
    pub fn new(config: &FirewallConfig) -> Self {
        Self {
            table: config.table_name.clone(),
            priority: config.priority,
            nat_priority: config.nat_priority,
        }
    }

    fn base_chain_priority(&self, table: FilterTable) -> i32 {
        match table {
            FilterTable::Filter => self.priority,
            FilterTable::Nat => self.nat_priority,
        }
    }

    fn apply(&self, batch: Batch<'_>, what: &str) -> Result<()> {
        let ruleset = batch.to_nftables();
        apply_ruleset(&ruleset).with_context(|| format!("Failed to {}", what))
    }

    fn table_object(&self) -> NfListObject<'static> {
        NfListObject::Table(Table {
            family: NfFamily::INet,
            name: Cow::Owned(self.table.clone()),
            handle: None,
        })
    }

    fn chain_object(&self, name: &str, base: Option<(NfChainType, NfHook, i32)>) -> Chain<'static> {
        Chain {
            family: NfFamily::INet,
            table: Cow::Owned(self.table.clone()),
            name: Cow::Owned(name.to_string()),
            newname: None,
            handle: None,
            _type: base.map(|(kind, _, _)| kind),
            hook: base.map(|(_, hook, _)| hook),
            prio: base.map(|(_, _, prio)| prio),
            dev: None,
            policy: base.map(|_| NfChainPolicy::Accept),
        }
    }

    fn set_object(&self, name: &str, ttl: Option<Duration>) -> Set<'static> {
        let mut flags = HashSet::new();
        flags.insert(SetFlag::Timeout);

        Set {
            family: NfFamily::INet,
            table: Cow::Owned(self.table.clone()),
            name: Cow::Owned(name.to_string()),
            handle: None,
            set_type: SetTypeValue::Single(SetType::InetService),
            policy: None,
            flags: Some(flags),
            elem: None,
            timeout: ttl.map(|t| t.as_secs() as u32),
            gc_interval: None,
            size: None,
            comment: Some(Cow::Borrowed("stormshadow divert ports")),
        }
    }

    fn element(&self, set: &str, port: u16, ttl: Option<Duration>) -> Element<'static> {
        let value = Expression::Number(port as u32);
        let elem = match ttl {
            Some(ttl) => Expression::Named(NamedExpression::Elem(Elem {
                val: Box::new(value),
                timeout: Some(ttl.as_secs() as u32),
                expires: None,
                comment: None,
                counter: None,
            })),
            None => value,
        };
        Element {
            family: NfFamily::INet,
            table: Cow::Owned(self.table.clone()),
            name: Cow::Owned(set.to_string()),
            elem: Cow::Owned(vec![elem]),
        }
    }

    fn chain_names(&self) -> Result<Vec<String>> {
        let ruleset = get_current_ruleset().context("Failed to read nftables ruleset")?;
        Ok(ruleset
            .objects
            .iter()
            .filter_map(|obj| match obj {
                NfObject::ListObject(NfListObject::Chain(chain))
                    if chain.table == self.table && chain.family == NfFamily::INet =>
                {
                    Some(chain.name.to_string())
                }
                _ => None,
            })
            .collect())
    }
}

fn base_chain_name(table: FilterTable, anchor: &str) -> String {
    format!("{}_{}", table.as_str(), anchor.to_ascii_lowercase())
}

fn hook_for(anchor: &str) -> Option<NfHook> {
    match anchor.to_ascii_uppercase().as_str() {
        "PREROUTING" => Some(NfHook::Prerouting),
        "INPUT" => Some(NfHook::Input),
        "FORWARD" => Some(NfHook::Forward),
        "OUTPUT" => Some(NfHook::Output),
        "POSTROUTING" => Some(NfHook::Postrouting),
        _ => None,
    }
}

fn payload(protocol: &'static str, field: &'static str) -> Expression<'static> {
    Expression::Named(NamedExpression::Payload(Payload::PayloadField(PayloadField {
        protocol: Cow::Borrowed(protocol),
        field: Cow::Borrowed(field),
    })))
}

fn udp_only() -> Statement<'static> {
    Statement::Match(Match {
        left: Expression::Named(NamedExpression::Meta(Meta {
            key: MetaKey::L4proto,
        })),
        right: Expression::String(Cow::Borrowed("udp")),
        op: Operator::EQ,
    })
}

/// Translate a rule into nftables statements.
fn rule_statements(spec: &RuleSpec) -> Vec<Statement<'static>> {
    let mut stmts = Vec::new();

    match &spec.matcher {
        RuleMatch::All => {}
        RuleMatch::UdpDstPort(port) => {
            stmts.push(udp_only());
            stmts.push(Statement::Match(Match {
                left: payload("udp", "dport"),
                right: Expression::Number(*port as u32),
                op: Operator::EQ,
            }));
        }
        RuleMatch::UdpDstPortInSet(set) => {
            stmts.push(udp_only());
            stmts.push(Statement::Match(Match {
                left: payload("udp", "dport"),
                right: Expression::String(Cow::Owned(format!("@{}", set))),
                op: Operator::IN,
            }));
        }
        RuleMatch::UdpToNetwork { net, src_port } => {
            stmts.push(udp_only());
            let proto = if net.is_ipv4() { "ip" } else { "ip6" };
            stmts.push(Statement::Match(Match {
                left: payload(proto, "daddr"),
                right: Expression::Named(NamedExpression::Prefix(Prefix {
                    addr: Box::new(Expression::String(Cow::Owned(net.network().to_string()))),
                    len: net.prefix() as u32,
                })),
                op: Operator::EQ,
            }));
            if let Some(port) = src_port {
                stmts.push(Statement::Match(Match {
                    left: payload("udp", "sport"),
                    right: Expression::Number(*port as u32),
                    op: Operator::EQ,
                }));
            }
        }
    }

    stmts.push(match &spec.action {
        RuleAction::Queue(num) => Statement::Queue(Queue {
            num: Expression::Number(*num as u32),
            flags: None,
        }),
        RuleAction::Dnat(addr) => Statement::DNAT(Some(NAT {
            addr: Some(Expression::String(Cow::Owned(addr.ip().to_string()))),
            family: Some(if addr.is_ipv4() {
                NATFamily::IP
            } else {
                NATFamily::IP6
            }),
            port: Some(Expression::Number(addr.port() as u32)),
            flags: None,
        })),
        RuleAction::Jump(chain) => Statement::Jump(JumpTarget {
            target: Cow::Owned(chain.clone()),
        }),
    });

    stmts
}

fn number(expr: &Expression<'_>) -> Option<u16> {
    match expr {
        Expression::Number(n) => u16::try_from(*n).ok(),
        _ => None,
    }
}

fn network(expr: &Expression<'_>) -> Option<IpNetwork> {
    match expr {
        Expression::String(s) => s.parse::<IpAddr>().ok().map(IpNetwork::from),
        Expression::Named(NamedExpression::Prefix(prefix)) => {
            let Expression::String(addr) = prefix.addr.as_ref() else {
                return None;
            };
            let addr: IpAddr = addr.parse().ok()?;
            IpNetwork::new(addr, u8::try_from(prefix.len).ok()?).ok()
        }
        _ => None,
    }
}

/// Best-effort reverse of [`rule_statements`] for rules read back from the
/// kernel.
fn describe_statements(stmts: &[Statement<'_>]) -> (Option<RuleMatch>, Option<RuleAction>) {
    let mut dport = None;
    let mut sport = None;
    let mut set = None;
    let mut daddr = None;
    let mut unknown = false;
    let mut action = None;

    for stmt in stmts {
        match stmt {
            Statement::Match(m) => match &m.left {
                Expression::Named(NamedExpression::Payload(Payload::PayloadField(field))) => {
                    match (field.protocol.as_ref(), field.field.as_ref()) {
                        ("udp", "dport") => match &m.right {
                            Expression::String(s) if s.starts_with('@') => {
                                set = Some(s[1..].to_string())
                            }
                            other => dport = number(other),
                        },
                        ("udp", "sport") => sport = number(&m.right),
                        ("ip", "daddr") | ("ip6", "daddr") => daddr = network(&m.right),
                        _ => unknown = true,
                    }
                }
                Expression::Named(NamedExpression::Meta(meta))
                    if matches!(meta.key, MetaKey::L4proto) => {}
                _ => unknown = true,
            },
            Statement::Queue(q) => action = number(&q.num).map(RuleAction::Queue),
            Statement::Jump(target) => action = Some(RuleAction::Jump(target.target.to_string())),
            Statement::DNAT(Some(nat)) => {
                let ip = match &nat.addr {
                    Some(Expression::String(s)) => s.parse::<IpAddr>().ok(),
                    _ => None,
                };
                let port = nat.port.as_ref().and_then(number);
                action = ip
                    .zip(port)
                    .map(|(ip, port)| RuleAction::Dnat(SocketAddr::new(ip, port)));
            }
            _ => unknown = true,
        }
    }

    let matcher = if unknown {
        None
    } else if let Some(set) = set {
        Some(RuleMatch::UdpDstPortInSet(set))
    } else if let Some(port) = dport {
        Some(RuleMatch::UdpDstPort(port))
    } else if let Some(net) = daddr {
        Some(RuleMatch::UdpToNetwork { net, src_port: sport })
    } else {
        Some(RuleMatch::All)
    };
    (matcher, action)
}

impl PacketFilter for NftablesBackend {
    fn name(&self) -> &'static str {
        "nftables"
    }

    fn anchor_chain_name(&self, table: FilterTable, anchor: &str) -> String {
        base_chain_name(table, anchor)
    }

    fn chain_exists(&self, _table: FilterTable, chain: &str) -> Result<bool> {
        Ok(self.chain_names()?.iter().any(|name| name == chain))
    }

    fn create_chain(&mut self, _table: FilterTable, chain: &str) -> Result<()> {
        let mut batch = Batch::new();
        batch.add(self.table_object());
        batch.add(NfListObject::Chain(self.chain_object(chain, None)));
        self.apply(batch, &format!("create chain {}", chain))
    }

    fn ensure_anchor_chain(&mut self, table: FilterTable, anchor: &str) -> Result<()> {
        let Some(hook) = hook_for(anchor) else {
            bail!("unsupported anchor '{}' for nftables", anchor);
        };
        let kind = match table {
            FilterTable::Filter => NfChainType::Filter,
            FilterTable::Nat => NfChainType::NAT,
        };
        let prio = self.base_chain_priority(table);
        let name = base_chain_name(table, anchor);

        let mut batch = Batch::new();
        batch.add(self.table_object());
        batch.add(NfListObject::Chain(
            self.chain_object(&name, Some((kind, hook, prio))),
        ));
        self.apply(batch, &format!("create base chain {}", name))
    }

    fn release_anchor_chain(&mut self, table: FilterTable, anchor: &str) -> Result<()> {
        let name = base_chain_name(table, anchor);
        if !self.chain_exists(table, &name)? {
            return Ok(());
        }
        let mut batch = Batch::new();
        batch.add_cmd(NfCmd::Delete(NfListObject::Chain(
            self.chain_object(&name, None),
        )));
        self.apply(batch, &format!("delete base chain {}", name))
    }

    fn delete_chain(&mut self, _table: FilterTable, chain: &str) -> Result<()> {
        let mut batch = Batch::new();
        batch.add_cmd(NfCmd::Delete(NfListObject::Chain(
            self.chain_object(chain, None),
        )));
        self.apply(batch, &format!("delete chain {}", chain))
    }

    fn list_rules(&self, table: FilterTable, chain: &str) -> Result<Vec<InstalledRule>> {
        let ruleset = get_current_ruleset().context("Failed to read nftables ruleset")?;
        let mut rules = Vec::new();

        for obj in ruleset.objects.iter() {
            let NfObject::ListObject(NfListObject::Rule(rule)) = obj else {
                continue;
            };
            if rule.table != self.table || rule.chain != chain || rule.family != NfFamily::INet {
                continue;
            }
            let Some(handle) = rule.handle else {
                debug!("Skipping rule without handle in {}", chain);
                continue;
            };
            let (matcher, action) = describe_statements(&rule.expr);
            rules.push(InstalledRule {
                table,
                chain: chain.to_string(),
                comment: rule.comment.as_ref().map(|c| c.to_string()),
                matcher,
                action,
                handle: RuleHandle::Nft(handle),
            });
        }
        Ok(rules)
    }

    fn insert_rule(&mut self, spec: &RuleSpec) -> Result<()> {
        let mut batch = Batch::new();
        batch.add_cmd(NfCmd::Insert(NfListObject::Rule(Rule {
            family: NfFamily::INet,
            table: Cow::Owned(self.table.clone()),
            chain: Cow::Owned(spec.chain.clone()),
            handle: None,
            index: None,
            comment: spec.comment.clone().map(Cow::Owned),
            expr: Cow::Owned(rule_statements(spec)),
        })));
        self.apply(batch, &format!("insert rule {}", spec))
    }

    fn delete_rule(&mut self, rule: &InstalledRule) -> Result<()> {
        let RuleHandle::Nft(handle) = rule.handle else {
            bail!("not an nftables rule handle: {:?}", rule.handle);
        };
        let mut batch = Batch::new();
        batch.add_cmd(NfCmd::Delete(NfListObject::Rule(Rule {
            family: NfFamily::INet,
            table: Cow::Owned(self.table.clone()),
            chain: Cow::Owned(rule.chain.clone()),
            handle: Some(handle),
            index: None,
            comment: None,
            expr: Cow::Owned(vec![]),
        })));
        self.apply(batch, &format!("delete rule {}", rule.describe()))
    }

    fn probe_sets(&mut self) -> bool {
        let mut batch = Batch::new();
        batch.add(self.table_object());
        batch.add(NfListObject::Set(Box::new(
            self.set_object(PROBE_SET, Some(Duration::from_secs(1))),
        )));
        batch.add_cmd(NfCmd::Delete(NfListObject::Set(Box::new(
            self.set_object(PROBE_SET, None),
        ))));
        match self.apply(batch, "probe timed sets") {
            Ok(()) => true,
            Err(e) => {
                debug!("Timed set probe failed: {:#}", e);
                false
            }
        }
    }

    fn ensure_port_set(&mut self, name: &str, ttl: Duration) -> Result<()> {
        let mut batch = Batch::new();
        batch.add(self.table_object());
        batch.add(NfListObject::Set(Box::new(self.set_object(name, Some(ttl)))));
        self.apply(batch, &format!("create set {}", name))
    }

    fn add_set_port(&mut self, name: &str, port: u16, ttl: Duration) -> Result<()> {
        // Adding an existing element keeps its old expiry, so replace it in
        // one transaction. The delete fails when the element already expired.
        let mut batch = Batch::new();
        batch.add_cmd(NfCmd::Delete(NfListObject::Element(
            self.element(name, port, None),
        )));
        batch.add_cmd(NfCmd::Add(NfListObject::Element(
            self.element(name, port, Some(ttl)),
        )));
        if self.apply(batch, "refresh set element").is_ok() {
            return Ok(());
        }

        let mut batch = Batch::new();
        batch.add_cmd(NfCmd::Add(NfListObject::Element(
            self.element(name, port, Some(ttl)),
        )));
        self.apply(batch, &format!("add port {} to set {}", port, name))
    }

    fn list_sets(&self) -> Result<Vec<String>> {
        let ruleset = get_current_ruleset().context("Failed to read nftables ruleset")?;
        Ok(ruleset
            .objects
            .iter()
            .filter_map(|obj| match obj {
                NfObject::ListObject(NfListObject::Set(set)) if set.table == self.table => {
                    Some(set.name.to_string())
                }
                _ => None,
            })
            .collect())
    }

    fn destroy_set(&mut self, name: &str) -> Result<()> {
        let mut batch = Batch::new();
        batch.add_cmd(NfCmd::Delete(NfListObject::Set(Box::new(
            self.set_object(name, None),
        ))));
        self.apply(batch, &format!("delete set {}", name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(matcher: RuleMatch, action: RuleAction) -> RuleSpec {
        RuleSpec {
            table: FilterTable::Filter,
            chain: "STORMSHADOW".to_string(),
            matcher,
            action,
            comment: None,
        }
    }

    #[test]
    fn test_statements_describe_back() {
        let cases = [
            spec(RuleMatch::All, RuleAction::Jump("STORMSHADOW".into())),
            spec(RuleMatch::UdpDstPort(5060), RuleAction::Queue(2)),
            spec(
                RuleMatch::UdpDstPortInSet("ss_abc123_q0".into()),
                RuleAction::Queue(0),
            ),
            spec(
                RuleMatch::UdpToNetwork {
                    net: "10.10.0.0/24".parse().unwrap(),
                    src_port: Some(5060),
                },
                RuleAction::Dnat("192.168.56.1:5070".parse().unwrap()),
            ),
            spec(
                RuleMatch::UdpToNetwork {
                    net: "fd00:10::/64".parse().unwrap(),
                    src_port: None,
                },
                RuleAction::Dnat("[fd00::1]:5070".parse().unwrap()),
            ),
        ];

        for case in cases {
            let (matcher, action) = describe_statements(&rule_statements(&case));
            assert_eq!(matcher.as_ref(), Some(&case.matcher), "{}", case);
            assert_eq!(action.as_ref(), Some(&case.action), "{}", case);
        }
    }

    #[test]
    fn test_unknown_match_is_not_described() {
        let stmts = vec![
            Statement::Match(Match {
                left: payload("tcp", "flags"),
                right: Expression::String(Cow::Borrowed("syn")),
                op: Operator::EQ,
            }),
            Statement::Queue(Queue {
                num: Expression::Number(1),
                flags: None,
            }),
        ];
        let (matcher, action) = describe_statements(&stmts);
        assert_eq!(matcher, None);
        assert_eq!(action, Some(RuleAction::Queue(1)));
    }

    #[test]
    fn test_base_chain_priorities_follow_config() {
        let backend = NftablesBackend::new(&FirewallConfig::default());
        assert_eq!(backend.base_chain_priority(FilterTable::Filter), 0);
        assert_eq!(backend.base_chain_priority(FilterTable::Nat), -100);

        let config: FirewallConfig =
            toml::from_str("priority = 10\nnat_priority = -150\n").unwrap();
        let backend = NftablesBackend::new(&config);
        assert_eq!(backend.base_chain_priority(FilterTable::Filter), 10);
        assert_eq!(backend.base_chain_priority(FilterTable::Nat), -150);
    }

    #[test]
    fn test_anchor_names() {
        assert_eq!(base_chain_name(FilterTable::Filter, "OUTPUT"), "filter_output");
        assert_eq!(base_chain_name(FilterTable::Nat, "OUTPUT"), "nat_output");
        assert!(matches!(hook_for("output"), Some(NfHook::Output)));
        assert!(hook_for("STORMSHADOW").is_none());
    }
}
