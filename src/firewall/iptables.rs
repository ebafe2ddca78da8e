//! Legacy `iptables` + `ipset` command-line backend (IPv4 only).

use anyhow::{bail, Context, Result};
use ipnetwork::IpNetwork;
use std::net::SocketAddr;
use std::process::Command;
use std::time::Duration;
use tracing::debug;

use super::{FilterTable, InstalledRule, PacketFilter, RuleAction, RuleHandle, RuleMatch, RuleSpec};
use crate::config::FirewallConfig;

pub struct IptablesBackend {
    iptables: String,
    ipset: String,
}

impl IptablesBackend {
    pub fn new(config: &FirewallConfig) -> Self {
        Self {
            iptables: config.iptables_path.clone(),
            ipset: config.ipset_path.clone(),
        }
    }

    fn iptables(&self, table: FilterTable, args: &[String]) -> Result<String> {
        let mut full = vec!["-t".to_string(), table.as_str().to_string()];
        full.extend_from_slice(args);
        run(&self.iptables, &full)
    }

    fn ipset(&self, args: &[&str]) -> Result<String> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        run(&self.ipset, &args)
    }
}

fn run(program: &str, args: &[String]) -> Result<String> {
    debug!("Running {} {}", program, args.join(" "));
    let output = Command::new(program)
        .args(args)
        .output()
        .with_context(|| format!("Failed to run {}", program))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("{} {} failed: {}", program, args.join(" "), stderr.trim());
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Arguments after `-I <chain>` for a rule.
fn rule_args(spec: &RuleSpec) -> Result<Vec<String>> {
    let mut args: Vec<String> = Vec::new();

    match &spec.matcher {
        RuleMatch::All => {}
        RuleMatch::UdpDstPort(port) => {
            args.extend(["-p", "udp", "--dport"].map(String::from));
            args.push(port.to_string());
        }
        RuleMatch::UdpDstPortInSet(set) => {
            args.extend(["-p", "udp", "-m", "set", "--match-set"].map(String::from));
            args.push(set.clone());
            args.push("dst".to_string());
        }
        RuleMatch::UdpToNetwork { net, src_port } => {
            if !net.is_ipv4() {
                bail!("iptables backend handles IPv4 only, got {}", net);
            }
            args.extend(["-p", "udp", "-d"].map(String::from));
            args.push(net.to_string());
            if let Some(port) = src_port {
                args.push("--sport".to_string());
                args.push(port.to_string());
            }
        }
    }

    if let Some(comment) = &spec.comment {
        args.extend(["-m", "comment", "--comment"].map(String::from));
        args.push(comment.clone());
    }

    match &spec.action {
        RuleAction::Queue(num) => {
            args.extend(["-j", "NFQUEUE", "--queue-num"].map(String::from));
            args.push(num.to_string());
        }
        RuleAction::Dnat(addr) => {
            if !addr.is_ipv4() {
                bail!("iptables backend handles IPv4 only, got {}", addr);
            }
            args.extend(["-j", "DNAT", "--to-destination"].map(String::from));
            args.push(addr.to_string());
        }
        RuleAction::Jump(chain) => {
            args.push("-j".to_string());
            args.push(chain.clone());
        }
    }

    Ok(args)
}

/// Split an `iptables -S` line, honouring double quotes.
fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut in_token = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '"' => {
                quoted = !quoted;
                in_token = true;
            }
            '\\' if quoted => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            c if c.is_whitespace() && !quoted => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            c => {
                current.push(c);
                in_token = true;
            }
        }
    }
    if in_token {
        tokens.push(current);
    }
    tokens
}

/// Parse one `-A CHAIN ...` line of `iptables -S` output.
fn parse_rule_line(table: FilterTable, line: &str) -> Option<InstalledRule> {
    let tokens = tokenize(line);
    if tokens.first().map(String::as_str) != Some("-A") {
        return None;
    }
    let chain = tokens.get(1)?.clone();

    let mut udp = false;
    let mut dport = None;
    let mut sport = None;
    let mut daddr: Option<IpNetwork> = None;
    let mut set = None;
    let mut comment = None;
    let mut action = None;
    let mut unknown = false;

    let mut i = 2;
    while i < tokens.len() {
        let value = tokens.get(i + 1);
        match tokens[i].as_str() {
            "-p" => udp = value.map(String::as_str) == Some("udp"),
            "-m" => {}
            "--dport" => dport = value.and_then(|v| v.parse::<u16>().ok()),
            "--sport" => sport = value.and_then(|v| v.parse::<u16>().ok()),
            "-d" => daddr = value.and_then(|v| v.parse().ok()),
            "--match-set" => {
                set = value.cloned();
                // skip the direction flag
                i += 1;
            }
            "--comment" => comment = value.cloned(),
            "-j" => {
                action = match value.map(String::as_str) {
                    Some("NFQUEUE") => tokens
                        .iter()
                        .position(|t| t == "--queue-num")
                        .and_then(|p| tokens.get(p + 1))
                        .and_then(|n| n.parse::<u16>().ok())
                        .map(RuleAction::Queue),
                    Some("DNAT") => tokens
                        .iter()
                        .position(|t| t == "--to-destination")
                        .and_then(|p| tokens.get(p + 1))
                        .and_then(|a| a.parse::<SocketAddr>().ok())
                        .map(RuleAction::Dnat),
                    Some(target) => Some(RuleAction::Jump(target.to_string())),
                    None => None,
                };
                break;
            }
            _ => unknown = true,
        }
        i += 2;
    }

    let matcher = if unknown || (!udp && (dport.is_some() || set.is_some() || daddr.is_some())) {
        None
    } else if let Some(set) = set {
        Some(RuleMatch::UdpDstPortInSet(set))
    } else if let Some(port) = dport {
        Some(RuleMatch::UdpDstPort(port))
    } else if let Some(net) = daddr {
        Some(RuleMatch::UdpToNetwork {
            net,
            src_port: sport,
        })
    } else if udp {
        None
    } else {
        Some(RuleMatch::All)
    };

    Some(InstalledRule {
        table,
        chain,
        comment,
        matcher,
        action,
        handle: RuleHandle::Iptables(tokens[1..].to_vec()),
    })
}

impl PacketFilter for IptablesBackend {
    fn name(&self) -> &'static str {
        "iptables"
    }

    fn chain_exists(&self, table: FilterTable, chain: &str) -> Result<bool> {
        Ok(self
            .iptables(table, &["-S".to_string(), chain.to_string()])
            .is_ok())
    }

    fn create_chain(&mut self, table: FilterTable, chain: &str) -> Result<()> {
        self.iptables(table, &["-N".to_string(), chain.to_string()])
            .map(|_| ())
    }

    fn ensure_anchor_chain(&mut self, table: FilterTable, anchor: &str) -> Result<()> {
        if !self.chain_exists(table, anchor)? {
            bail!("anchor chain {} does not exist in {}", anchor, table);
        }
        Ok(())
    }

    fn delete_chain(&mut self, table: FilterTable, chain: &str) -> Result<()> {
        self.iptables(table, &["-X".to_string(), chain.to_string()])
            .map(|_| ())
    }

    fn list_rules(&self, table: FilterTable, chain: &str) -> Result<Vec<InstalledRule>> {
        let output = self.iptables(table, &["-S".to_string(), chain.to_string()])?;
        Ok(output
            .lines()
            .filter_map(|line| parse_rule_line(table, line))
            .collect())
    }

    fn insert_rule(&mut self, spec: &RuleSpec) -> Result<()> {
        let mut args = vec!["-I".to_string(), spec.chain.clone(), "1".to_string()];
        args.extend(rule_args(spec)?);
        self.iptables(spec.table, &args).map(|_| ())
    }

    fn delete_rule(&mut self, rule: &InstalledRule) -> Result<()> {
        let RuleHandle::Iptables(body) = &rule.handle else {
            bail!("not an iptables rule handle: {:?}", rule.handle);
        };
        let mut args = vec!["-D".to_string()];
        args.extend(body.iter().cloned());
        self.iptables(rule.table, &args).map(|_| ())
    }

    fn probe_sets(&mut self) -> bool {
        match self.ipset(&["--version"]) {
            Ok(version) => {
                debug!("Found {}", version.trim());
                true
            }
            Err(e) => {
                debug!("ipset unavailable: {:#}", e);
                false
            }
        }
    }

    fn ensure_port_set(&mut self, name: &str, ttl: Duration) -> Result<()> {
        let ttl = ttl.as_secs().to_string();
        self.ipset(&[
            "create", name, "bitmap:port", "range", "0-65535", "timeout", &ttl, "-exist",
        ])
        .map(|_| ())
    }

    fn add_set_port(&mut self, name: &str, port: u16, ttl: Duration) -> Result<()> {
        let port = port.to_string();
        let ttl = ttl.as_secs().to_string();
        self.ipset(&["add", name, &port, "timeout", &ttl, "-exist"])
            .map(|_| ())
    }

    fn list_sets(&self) -> Result<Vec<String>> {
        let output = self.ipset(&["list", "-n"])?;
        Ok(output
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    fn destroy_set(&mut self, name: &str) -> Result<()> {
        match self.ipset(&["destroy", name]) {
            Ok(_) => Ok(()),
            Err(e) if format!("{:#}", e).contains("does not exist") => Ok(()),
            Err(e) => Err(e),
        }
    }
}
