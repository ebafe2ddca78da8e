use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use ipnetwork::IpNetwork;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tabled::{Table, Tabled};

use stormshadow::attack::{default_payload, flood::load_payload, run_flood, AttackKind, FloodOptions};
use stormshadow::config::{Config, FirewallBackendKind};
use stormshadow::firewall::{backend_for, CleanupReport, PacketFilter, RuleManager, TaggedRuleView};
use stormshadow::orchestrator::{signal_shutdown, wait_for_shutdown, AttackOutcome};
use stormshadow::spoofer::{Spoofer, SpooferOptions};
use stormshadow::{MemoryBackend, Orchestrator, OrchestratorError, Suid};

#[derive(Parser)]
#[command(name = "stormshadow")]
#[command(author, version, about = "Lab SIP flood orchestration with session-tagged firewall rules")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    /// Simulate firewall changes in memory and only log the commands
    #[arg(long, global = true)]
    pub dry_run: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run an attack through the full lifecycle
    Run(RunArgs),

    /// Rewrite source addresses of packets on an NFQUEUE (spawned by `run`)
    Spoof {
        /// Queue number to bind
        #[arg(short, long)]
        queue: u16,

        /// Subnet spoofed sources are drawn from
        #[arg(short, long)]
        subnet: IpNetwork,

        /// Destination ports to rewrite (default: all UDP)
        #[arg(short, long, value_delimiter = ',')]
        ports: Vec<u16>,

        /// Unix datagram socket to report readiness on
        #[arg(long)]
        ready_socket: Option<PathBuf>,

        /// Keep the original source port
        #[arg(long)]
        keep_source_port: bool,
    },

    /// Send a UDP payload flood (spawned by `run` for payload-flood)
    Flood {
        /// Target address
        #[arg(short, long)]
        target: IpAddr,

        /// Target ports, used in turn
        #[arg(short, long, value_delimiter = ',', required = true)]
        ports: Vec<u16>,

        /// Packets to send (0 = until the duration elapses)
        #[arg(long, default_value = "1000")]
        count: u64,

        /// Stop after this many milliseconds
        #[arg(long)]
        duration_ms: Option<u64>,

        /// Delay between packets in microseconds
        #[arg(long, default_value = "0")]
        delay_us: u64,

        /// Local source port (0 = any)
        #[arg(long, default_value = "0")]
        source_port: u16,

        /// SIP user of the generated OPTIONS request
        #[arg(long, default_value = "200")]
        user: String,

        /// Raw datagram to send instead of the generated request
        #[arg(long)]
        payload: Option<PathBuf>,
    },

    /// Remove rules and sets left by sessions with stale heartbeats
    Reconcile,

    /// Remove every rule and set owned by one session
    Cleanup {
        /// Session id
        #[arg(short, long)]
        suid: Suid,
    },

    /// Show tagged rules and known sessions
    Status {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Remove the isolated chains and their anchor jumps
    Teardown,

    /// List available attacks
    ListAttacks,

    /// Generate default configuration file
    GenConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Overrides of the `[attack]`, `[spoofing]` and `[return_path]` sections.
#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Attack name (see list-attacks)
    #[arg(short, long)]
    attack: Option<String>,

    /// Target address
    #[arg(short, long)]
    target: Option<IpAddr>,

    /// Target ports
    #[arg(short, long, value_delimiter = ',')]
    ports: Vec<u16>,

    /// Packets to send
    #[arg(long)]
    count: Option<u64>,

    /// Stop the attack after this many seconds
    #[arg(long)]
    duration: Option<u64>,

    /// Delay between packets in microseconds
    #[arg(long)]
    delay_us: Option<u64>,

    /// Interface for generators that need one
    #[arg(short, long)]
    interface: Option<String>,

    /// Payload file for payload-flood
    #[arg(long)]
    payload: Option<PathBuf>,

    /// Spoof source addresses through NFQUEUE
    #[arg(long)]
    spoof: bool,

    /// Spoofed source subnet (implies --spoof)
    #[arg(long)]
    subnet: Option<IpNetwork>,

    /// Queues for the spoofers (implies --spoof)
    #[arg(long, value_delimiter = ',')]
    queues: Vec<u16>,

    /// Redirect replies to spoofed sources to this receiver
    #[arg(long)]
    return_to: Option<SocketAddr>,

    /// Packet filter backend
    #[arg(long, value_enum)]
    backend: Option<FirewallBackendKind>,

    /// Reuse this session id instead of generating one
    #[arg(long)]
    suid: Option<Suid>,
}

impl RunArgs {
    fn apply(&self, config: &mut Config) {
        if let Some(attack) = &self.attack {
            config.attack.name = attack.clone();
        }
        if let Some(target) = self.target {
            config.attack.target_ip = target;
        }
        if !self.ports.is_empty() {
            config.attack.target_ports = self.ports.clone();
        }
        if let Some(count) = self.count {
            config.attack.max_count = count;
        }
        if let Some(duration) = self.duration {
            config.attack.max_duration_secs = duration;
        }
        if let Some(delay) = self.delay_us {
            config.attack.delay_us = delay;
        }
        if let Some(interface) = &self.interface {
            config.attack.interface = interface.clone();
        }
        if let Some(payload) = &self.payload {
            config.attack.payload_path = Some(payload.clone());
        }
        if self.spoof || self.subnet.is_some() || !self.queues.is_empty() {
            config.spoofing.enabled = true;
        }
        if let Some(subnet) = self.subnet {
            config.spoofing.subnet = subnet;
        }
        if !self.queues.is_empty() {
            config.spoofing.queues = self.queues.clone();
        }
        if let Some(target) = self.return_to {
            config.return_path.enabled = true;
            config.return_path.target = Some(target);
        }
        if let Some(backend) = self.backend {
            config.firewall.backend = backend;
        }
    }
}

/// Table row for tagged rules
#[derive(Tabled)]
struct RuleRow {
    #[tabled(rename = "Table")]
    table: String,
    #[tabled(rename = "Chain")]
    chain: String,
    #[tabled(rename = "Session")]
    session: String,
    #[tabled(rename = "Purpose")]
    purpose: String,
    #[tabled(rename = "Installed")]
    installed: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Rule")]
    rule: String,
}

/// Table row for heartbeat files
#[derive(Tabled)]
struct SessionRow {
    #[tabled(rename = "Session")]
    session: String,
    #[tabled(rename = "Last heartbeat")]
    last_heartbeat: String,
    #[tabled(rename = "State")]
    state: String,
}

/// Table row for the attack registry
#[derive(Tabled)]
struct AttackRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Requires")]
    requires: String,
    #[tabled(rename = "Description")]
    description: String,
}

/// Load the configuration selected on the command line.
pub fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default()?,
    };
    if cli.dry_run {
        config.general.dry_run = true;
    }
    if cli.log_file.is_some() {
        config.general.log_file = cli.log_file.clone();
    }
    Ok(config)
}

pub async fn run_command(cli: Cli, config: Config) -> Result<()> {
    match cli.command {
        Commands::Run(args) => cmd_run(config, args).await,
        Commands::Spoof {
            queue,
            subnet,
            ports,
            ready_socket,
            keep_source_port,
        } => cmd_spoof(SpooferOptions {
            queue,
            subnet,
            ports,
            randomize_source_port: !keep_source_port,
            ready_socket,
        }),
        Commands::Flood {
            target,
            ports,
            count,
            duration_ms,
            delay_us,
            source_port,
            user,
            payload,
        } => {
            let payload = match payload {
                Some(path) => load_payload(&path)
                    .with_context(|| format!("Failed to read payload {}", path.display()))?,
                None => default_payload(target, ports[0], &user),
            };
            cmd_flood(FloodOptions {
                target,
                ports,
                source_port,
                count,
                duration: duration_ms.map(Duration::from_millis),
                delay: Duration::from_micros(delay_us),
                payload,
            })
            .await
        }
        Commands::Reconcile => cmd_reconcile(config),
        Commands::Cleanup { suid } => cmd_cleanup(config, suid),
        Commands::Status { json } => cmd_status(config, json),
        Commands::Teardown => cmd_teardown(config),
        Commands::ListAttacks => cmd_list_attacks(),
        Commands::GenConfig { output } => cmd_gen_config(output),
    }
}

fn rule_manager(config: &Config) -> RuleManager {
    let backend: Box<dyn PacketFilter> = if config.general.dry_run {
        Box::new(MemoryBackend::new())
    } else {
        backend_for(&config.firewall)
    };
    RuleManager::new(
        backend,
        config.firewall.clone(),
        config.heartbeat_store(),
        config.session.stale_threshold(),
    )
}

fn print_cleanup(report: &CleanupReport) {
    println!(
        "Removed {} rule(s), destroyed {} set(s)",
        report.removed, report.sets_destroyed
    );
    for failure in &report.failures {
        println!("  {} {}", "FAILED".red().bold(), failure);
    }
}

async fn cmd_run(mut config: Config, args: RunArgs) -> Result<()> {
    args.apply(&mut config);
    let plan = config.attack_plan()?;
    let filter_chain = config.firewall.filter_chain.clone();
    let nat_chain = config.firewall.nat_chain.clone();

    let mut orchestrator = Orchestrator::from_config(config)?;
    let shutdown = signal_shutdown()?;

    match orchestrator.run(&plan, args.suid.clone(), shutdown).await {
        Ok(report) => {
            let outcome = match report.outcome {
                AttackOutcome::Completed => "completed".green().bold(),
                AttackOutcome::DurationReached => "duration reached".green().bold(),
                AttackOutcome::Simulated => "simulated".yellow().bold(),
            };
            println!("{} {} ({})", "Attack".bold(), report.attack, outcome);
            println!("Session:  {}", report.suid);
            if let Some(strategy) = report.strategy {
                println!("Divert:   {:?}", strategy);
            }
            println!("Rules:    {}", report.rules_installed);
            println!("Spoofers: {}", report.spoofers);
            if report.dry_run {
                println!("\nCommands that would run:");
                for command in &report.commands {
                    println!("  {}", command);
                }
            }
            println!();
            print_cleanup(&report.cleanup);
            if !report.cleanup.is_clean() {
                println!(
                    "{} inspect chains {} and {}",
                    "Leftover rules may remain:".yellow().bold(),
                    filter_chain,
                    nat_chain
                );
            }
            Ok(())
        }
        Err(e) => {
            let OrchestratorError::Stage { stage, cleanup, .. } = &e;
            println!("{} {}", "Failed stage:".red().bold(), stage);
            print_cleanup(cleanup);
            if e.inspection_advised() {
                println!(
                    "{} inspect chains {} and {}",
                    "Leftover rules may remain:".yellow().bold(),
                    filter_chain,
                    nat_chain
                );
            }
            Err(e.into())
        }
    }
}

fn cmd_spoof(options: SpooferOptions) -> Result<()> {
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = running.clone();
    ctrlc::set_handler(move || {
        running_clone.store(false, Ordering::Relaxed);
    })?;

    let stats = Spoofer::new(options).run(running)?;
    tracing::debug!("Spoofer stats: {}", serde_json::to_string(&stats)?);
    Ok(())
}

async fn cmd_flood(options: FloodOptions) -> Result<()> {
    let mut shutdown = signal_shutdown()?;
    let stats = run_flood(options, async move { wait_for_shutdown(&mut shutdown).await }).await?;
    println!(
        "Sent {} packets ({} bytes, {} errors) in {:.1}s",
        stats.sent,
        stats.bytes,
        stats.errors,
        stats.elapsed.as_secs_f64()
    );
    Ok(())
}

fn cmd_reconcile(config: Config) -> Result<()> {
    let mut rules = rule_manager(&config);
    rules.check_privileges()?;
    let report = rules.reconcile_startup(Utc::now());
    print_cleanup(&report);
    Ok(())
}

fn cmd_cleanup(config: Config, suid: Suid) -> Result<()> {
    let mut rules = rule_manager(&config);
    rules.check_privileges()?;
    let report = rules.cleanup_session(&suid);
    config.heartbeat_store().forget(&suid);

    print_cleanup(&report);
    if report.is_clean() {
        println!("{} session {}", "Cleaned up".green().bold(), suid);
        Ok(())
    } else {
        anyhow::bail!("{} removal(s) failed for session {}", report.failures.len(), suid)
    }
}

fn format_timestamp(ts: i64) -> String {
    DateTime::from_timestamp(ts, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ts.to_string())
}

fn rule_row(view: &TaggedRuleView) -> RuleRow {
    let state = match (&view.tag, view.live) {
        (None, _) => "untagged".yellow().to_string(),
        (Some(tag), _) if tag.suid.is_shared() => "shared".cyan().to_string(),
        (Some(_), Some(true)) => "live".green().to_string(),
        (Some(tag), _) if tag.preserve => "preserved".cyan().to_string(),
        (Some(_), _) => "stale".red().to_string(),
    };
    RuleRow {
        table: view.table.to_string(),
        chain: view.chain.clone(),
        session: view
            .tag
            .as_ref()
            .map(|t| t.suid.to_string())
            .unwrap_or_else(|| "-".to_string()),
        purpose: view
            .tag
            .as_ref()
            .map(|t| t.purpose.clone())
            .unwrap_or_else(|| "-".to_string()),
        installed: view
            .tag
            .as_ref()
            .map(|t| format_timestamp(i64::try_from(t.timestamp).unwrap_or(i64::MAX)))
            .unwrap_or_else(|| "-".to_string()),
        state,
        rule: view.rule.clone(),
    }
}

fn cmd_status(config: Config, json: bool) -> Result<()> {
    let now = Utc::now();
    let rules = rule_manager(&config);
    let views = rules.snapshot(now)?;

    let heartbeats = config.heartbeat_store();
    let threshold = config.session.stale_threshold();
    let sessions: Vec<_> = heartbeats
        .known_sessions()
        .into_iter()
        .map(|suid| {
            let last = heartbeats.last_heartbeat(&suid);
            let stale = heartbeats.is_stale(&suid, now, threshold);
            (suid, last, stale)
        })
        .collect();

    if json {
        let sessions_json: Vec<_> = sessions
            .iter()
            .map(|(suid, last, stale)| {
                serde_json::json!({
                    "suid": suid,
                    "last_heartbeat": last.map(|t| t.to_rfc3339()),
                    "stale": stale,
                })
            })
            .collect();
        let output = serde_json::json!({
            "backend": rules.backend_name(),
            "rules": views,
            "sessions": sessions_json,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("{} {}", "Backend:".bold(), rules.backend_name());
    if views.is_empty() {
        println!("No rules in the isolated chains");
    } else {
        let rows: Vec<RuleRow> = views.iter().map(rule_row).collect();
        println!("{}", Table::new(rows));
    }

    if sessions.is_empty() {
        println!("No session heartbeats in {}", heartbeats.dir().display());
    } else {
        let rows: Vec<SessionRow> = sessions
            .iter()
            .map(|(suid, last, stale)| SessionRow {
                session: suid.to_string(),
                last_heartbeat: last
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "-".to_string()),
                state: if *stale {
                    "stale".red().to_string()
                } else {
                    "live".green().to_string()
                },
            })
            .collect();
        println!("{}", Table::new(rows));
    }

    Ok(())
}

fn cmd_teardown(config: Config) -> Result<()> {
    let mut rules = rule_manager(&config);
    let report = rules.teardown(Utc::now())?;
    print_cleanup(&report);
    if report.is_clean() {
        println!("{}", "Isolated chains removed".green().bold());
    }
    Ok(())
}

fn cmd_list_attacks() -> Result<()> {
    let rows: Vec<AttackRow> = AttackKind::ALL
        .iter()
        .map(|kind| AttackRow {
            name: kind.name().to_string(),
            requires: kind.requirement().unwrap_or("-").to_string(),
            description: kind.description().to_string(),
        })
        .collect();
    println!("{}", Table::new(rows));
    Ok(())
}

fn cmd_gen_config(output: Option<PathBuf>) -> Result<()> {
    let config = Config::default();
    let toml_str = toml::to_string_pretty(&config)?;

    match output {
        Some(path) => {
            std::fs::write(&path, &toml_str)?;
            println!("Configuration written to {}", path.display());
        }
        None => {
            println!("{}", toml_str);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_overrides() {
        let cli = Cli::parse_from([
            "stormshadow", "--dry-run", "run", "--attack", "payload-flood", "--target",
            "192.168.56.20", "--ports", "5060,5061", "--queues", "0,1", "--return-to",
            "192.168.56.1:5060", "--suid", "abc123",
        ]);
        assert!(cli.dry_run);
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.suid.as_ref().map(|s| s.as_str()), Some("abc123"));

        let mut config = Config::default();
        args.apply(&mut config);
        assert!(config.spoofing.enabled);
        assert!(config.return_path.enabled);

        let plan = config.attack_plan().unwrap();
        assert_eq!(plan.kind, AttackKind::PayloadFlood);
        assert_eq!(plan.target_ports, vec![5060, 5061]);
        assert_eq!(plan.spoofing.unwrap().queues, vec![0, 1]);
    }

    #[test]
    fn test_spoof_arguments_parse() {
        let cli = Cli::parse_from([
            "stormshadow", "spoof", "--queue", "2", "--subnet", "10.10.123.0/24", "--ports",
            "5060,5062", "--ready-socket", "/run/stormshadow/x.ready", "--keep-source-port",
        ]);
        let Commands::Spoof { queue, subnet, ports, ready_socket, keep_source_port } = cli.command
        else {
            panic!("expected spoof");
        };
        assert_eq!(queue, 2);
        assert_eq!(subnet.to_string(), "10.10.123.0/24");
        assert_eq!(ports, vec![5060, 5062]);
        assert!(ready_socket.is_some());
        assert!(keep_source_port);
    }

    #[test]
    fn test_flood_duration_in_milliseconds() {
        let cli = Cli::parse_from([
            "stormshadow", "flood", "--target", "192.168.56.20", "--ports", "5060",
            "--duration-ms", "500",
        ]);
        let Commands::Flood { duration_ms, .. } = cli.command else {
            panic!("expected flood");
        };
        assert_eq!(duration_ms.map(Duration::from_millis), Some(Duration::from_millis(500)));
    }

    #[test]
    fn test_invalid_suid_rejected() {
        assert!(Cli::try_parse_from(["stormshadow", "cleanup", "--suid", "not a suid"]).is_err());
    }
}
