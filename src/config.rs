use anyhow::{Context, Result};
use ipnetwork::{IpNetwork, Ipv4Network};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::attack::{AttackKind, AttackPlan, ReturnPath, SpoofPlan};
use crate::error::ConfigError;
use crate::session::HeartbeatStore;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub firewall: FirewallConfig,

    #[serde(default)]
    pub attack: AttackConfig,

    #[serde(default)]
    pub spoofing: SpoofingConfig,

    #[serde(default)]
    pub return_path: ReturnPathConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        Ok(config)
    }

    /// Load config from default locations or fall back to defaults
    pub fn load_or_default() -> Result<Self> {
        let paths = [
            PathBuf::from("/etc/stormshadow/config.toml"),
            dirs_next::config_dir()
                .map(|p| p.join("stormshadow/config.toml"))
                .unwrap_or_default(),
            PathBuf::from("config.toml"),
        ];

        for path in &paths {
            if path.is_file() {
                return Self::load(path);
            }
        }

        Ok(Self::default())
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    pub fn heartbeat_store(&self) -> HeartbeatStore {
        HeartbeatStore::new(&self.session.heartbeat_dir)
    }

    /// Check values that serde cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.heartbeat_interval_secs == 0 {
            return Err(ConfigError::Field {
                field: "session.heartbeat_interval_secs",
                reason: "must be positive".to_string(),
            });
        }
        if self.session.heartbeat_interval_secs >= self.session.stale_threshold_secs {
            return Err(ConfigError::Field {
                field: "session.stale_threshold_secs",
                reason: format!(
                    "must exceed the heartbeat interval ({}s)",
                    self.session.heartbeat_interval_secs
                ),
            });
        }
        if self.firewall.set_ttl_secs <= self.session.heartbeat_interval_secs {
            return Err(ConfigError::Field {
                field: "firewall.set_ttl_secs",
                reason: "must exceed the heartbeat interval so live sets never expire"
                    .to_string(),
            });
        }
        if self.firewall.filter_chain == self.firewall.nat_chain {
            return Err(ConfigError::Invalid(
                "filter and nat isolated chains must have different names".to_string(),
            ));
        }
        if self.spoofing.enabled && self.spoofing.queues.is_empty() {
            return Err(ConfigError::Field {
                field: "spoofing.queues",
                reason: "spoofing needs at least one queue".to_string(),
            });
        }
        if self.return_path.enabled && self.return_path.target.is_none() {
            return Err(ConfigError::Field {
                field: "return_path.target",
                reason: "return path enabled without a target".to_string(),
            });
        }
        Ok(())
    }

    /// Resolve the run parameters of an attack.
    pub fn attack_plan(&self) -> Result<AttackPlan, ConfigError> {
        self.validate()?;

        let kind: AttackKind = self.attack.name.parse().map_err(|_| ConfigError::Field {
            field: "attack.name",
            reason: format!("unknown attack '{}'", self.attack.name),
        })?;
        if self.attack.target_ports.is_empty() {
            return Err(ConfigError::Field {
                field: "attack.target_ports",
                reason: "at least one port is required".to_string(),
            });
        }
        if self.attack.max_count == 0 && self.attack.max_duration_secs == 0 {
            return Err(ConfigError::Invalid(
                "attack needs max_count or max_duration_secs".to_string(),
            ));
        }

        let spoofing = if self.spoofing.enabled {
            let subnet = self.spoofing.subnet;
            if subnet.is_ipv4() != self.attack.target_ip.is_ipv4() {
                return Err(ConfigError::Field {
                    field: "spoofing.subnet",
                    reason: format!(
                        "{} and target {} are different address families",
                        subnet, self.attack.target_ip
                    ),
                });
            }
            Some(SpoofPlan {
                subnet,
                queues: self.spoofing.queues.clone(),
                randomize_source_port: self.spoofing.randomize_source_port,
            })
        } else {
            None
        };

        let return_path = match (self.return_path.enabled, self.return_path.target) {
            (true, Some(target)) => {
                if spoofing.is_none() {
                    return Err(ConfigError::Invalid(
                        "return path only makes sense with spoofing enabled".to_string(),
                    ));
                }
                Some(ReturnPath {
                    target,
                    source_port: self.return_path.source_port,
                })
            }
            _ => None,
        };

        Ok(AttackPlan {
            kind,
            target: self.attack.target_ip,
            target_ports: self.attack.target_ports.clone(),
            source_port: self.attack.source_port,
            source_ip: self.attack.source_ip,
            interface: self.attack.interface.clone(),
            sip_user: self.attack.sip_user.clone(),
            max_count: self.attack.max_count,
            max_duration: (self.attack.max_duration_secs > 0)
                .then(|| Duration::from_secs(self.attack.max_duration_secs)),
            delay: Duration::from_micros(self.attack.delay_us),
            payload_path: self.attack.payload_path.clone(),
            inviteflood_path: self.attack.inviteflood_path.clone(),
            spoofing,
            return_path,
            dry_run: self.general.dry_run,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Also write logs to this file
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Simulate firewall changes and skip spawning processes
    #[serde(default)]
    pub dry_run: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_file: None,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Directory holding `<suid>.hb` heartbeat files
    #[serde(default = "default_heartbeat_dir")]
    pub heartbeat_dir: PathBuf,

    /// Seconds between heartbeat refreshes
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// A session whose heartbeat is older than this is considered dead
    #[serde(default = "default_stale_threshold")]
    pub stale_threshold_secs: u64,
}

impl SessionConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn stale_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_threshold_secs)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_dir: default_heartbeat_dir(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            stale_threshold_secs: default_stale_threshold(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum FirewallBackendKind {
    #[default]
    Nftables,
    Iptables,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirewallConfig {
    /// Packet filter backend
    #[serde(default)]
    pub backend: FirewallBackendKind,

    /// nftables table holding the isolated and anchor chains
    #[serde(default = "default_table_name")]
    pub table_name: String,

    /// Isolated chain for divert rules
    #[serde(default = "default_filter_chain")]
    pub filter_chain: String,

    /// Isolated chain for return-path NAT rules
    #[serde(default = "default_nat_chain")]
    pub nat_chain: String,

    /// Main chain that jumps into the filter chain
    #[serde(default = "default_anchor")]
    pub filter_anchor: String,

    /// Main chain that jumps into the nat chain
    #[serde(default = "default_anchor")]
    pub nat_anchor: String,

    /// Priority of the nftables filter base chain
    #[serde(default)]
    pub priority: i32,

    /// Priority of the nftables nat base chain (dstnat is -100)
    #[serde(default = "default_nat_priority")]
    pub nat_priority: i32,

    /// Use a timed port set with one aggregate divert rule when available
    #[serde(default = "default_true")]
    pub acceleration: bool,

    /// TTL of port set members in seconds
    #[serde(default = "default_set_ttl")]
    pub set_ttl_secs: u64,

    #[serde(default = "default_iptables_path")]
    pub iptables_path: String,

    #[serde(default = "default_ipset_path")]
    pub ipset_path: String,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            backend: FirewallBackendKind::default(),
            table_name: default_table_name(),
            filter_chain: default_filter_chain(),
            nat_chain: default_nat_chain(),
            filter_anchor: default_anchor(),
            nat_anchor: default_anchor(),
            priority: 0,
            nat_priority: default_nat_priority(),
            acceleration: true,
            set_ttl_secs: default_set_ttl(),
            iptables_path: default_iptables_path(),
            ipset_path: default_ipset_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttackConfig {
    /// Attack name (see `list-attacks`)
    #[serde(default = "default_attack_name")]
    pub name: String,

    #[serde(default = "default_target_ip")]
    pub target_ip: IpAddr,

    #[serde(default = "default_target_ports")]
    pub target_ports: Vec<u16>,

    /// Source port of generated packets (0 = generator's choice)
    #[serde(default)]
    pub source_port: u16,

    /// Source address handed to the generator, if it takes one
    #[serde(default)]
    pub source_ip: Option<IpAddr>,

    /// Interface for generators that need one
    #[serde(default = "default_interface")]
    pub interface: String,

    /// SIP user part the INVITE flood targets
    #[serde(default = "default_sip_user")]
    pub sip_user: String,

    /// Packets to send (0 = bounded by duration only)
    #[serde(default = "default_max_count")]
    pub max_count: u64,

    /// Seconds before the generator is stopped (0 = bounded by count only)
    #[serde(default)]
    pub max_duration_secs: u64,

    /// Delay between packets in microseconds
    #[serde(default)]
    pub delay_us: u64,

    /// Raw datagram replayed by the payload flood
    #[serde(default)]
    pub payload_path: Option<PathBuf>,

    #[serde(default = "default_inviteflood_path")]
    pub inviteflood_path: PathBuf,
}

impl Default for AttackConfig {
    fn default() -> Self {
        Self {
            name: default_attack_name(),
            target_ip: default_target_ip(),
            target_ports: default_target_ports(),
            source_port: 0,
            source_ip: None,
            interface: default_interface(),
            sip_user: default_sip_user(),
            max_count: default_max_count(),
            max_duration_secs: 0,
            delay_us: 0,
            payload_path: None,
            inviteflood_path: default_inviteflood_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpoofingConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Source addresses are drawn round-robin from this subnet
    #[serde(default = "default_spoofed_subnet")]
    pub subnet: IpNetwork,

    /// Packet queues, one spoofer process each
    #[serde(default = "default_queues")]
    pub queues: Vec<u16>,

    /// Replace the source port with a random ephemeral one
    #[serde(default = "default_true")]
    pub randomize_source_port: bool,

    /// Seconds to wait for a spoofer to report ready
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_secs: u64,

    /// Seconds between SIGTERM and SIGKILL when stopping a spoofer
    #[serde(default = "default_stop_grace")]
    pub stop_grace_secs: u64,

    /// Spoofer executable (default: this binary)
    #[serde(default)]
    pub program: Option<PathBuf>,
}

impl SpoofingConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

impl Default for SpoofingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            subnet: default_spoofed_subnet(),
            queues: default_queues(),
            randomize_source_port: true,
            ready_timeout_secs: default_ready_timeout(),
            stop_grace_secs: default_stop_grace(),
            program: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReturnPathConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Receiver replies to spoofed sources are redirected to
    #[serde(default)]
    pub target: Option<SocketAddr>,

    /// Only redirect replies from this source port
    #[serde(default)]
    pub source_port: Option<u16>,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}
fn default_heartbeat_dir() -> PathBuf {
    PathBuf::from("/run/stormshadow")
}
fn default_heartbeat_interval() -> u64 {
    60
}
fn default_stale_threshold() -> u64 {
    3600
}
fn default_table_name() -> String {
    "stormshadow".to_string()
}
fn default_filter_chain() -> String {
    "STORMSHADOW".to_string()
}
fn default_nat_chain() -> String {
    "STORMSHADOW-NAT".to_string()
}
fn default_anchor() -> String {
    "OUTPUT".to_string()
}
fn default_true() -> bool {
    true
}
fn default_nat_priority() -> i32 {
    -100
}
fn default_set_ttl() -> u64 {
    7200
}
fn default_iptables_path() -> String {
    "iptables".to_string()
}
fn default_ipset_path() -> String {
    "ipset".to_string()
}
fn default_attack_name() -> String {
    "invite-flood".to_string()
}
fn default_target_ip() -> IpAddr {
    IpAddr::from([127, 0, 0, 1])
}
fn default_target_ports() -> Vec<u16> {
    vec![5060]
}
fn default_interface() -> String {
    "eth0".to_string()
}
fn default_sip_user() -> String {
    "200".to_string()
}
fn default_max_count() -> u64 {
    1000
}
fn default_inviteflood_path() -> PathBuf {
    PathBuf::from("inviteflood")
}
fn default_spoofed_subnet() -> IpNetwork {
    let net = Ipv4Addr::new(10, 10, 123, 0);
    IpNetwork::V4(Ipv4Network::new(net, 24).unwrap_or_else(|_| Ipv4Network::from(net)))
}
fn default_queues() -> Vec<u16> {
    vec![0]
}
fn default_ready_timeout() -> u64 {
    5
}
fn default_stop_grace() -> u64 {
    3
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.session.heartbeat_interval_secs, 60);
        assert_eq!(config.session.stale_threshold_secs, 3600);
        assert_eq!(config.firewall.set_ttl_secs, 7200);
        assert_eq!(config.firewall.priority, 0);
        assert_eq!(config.firewall.nat_priority, -100);
        assert_eq!(config.firewall.filter_chain, "STORMSHADOW");
        assert_eq!(config.firewall.nat_chain, "STORMSHADOW-NAT");
        assert_eq!(config.spoofing.subnet.to_string(), "10.10.123.0/24");
        assert_eq!(config.spoofing.ready_timeout(), Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [attack]
            name = "payload-flood"
            target_ip = "192.168.56.20"
            target_ports = [5060, 5061]

            [spoofing]
            enabled = true
            subnet = "10.10.0.0/24"
            queues = [0, 1]

            [firewall]
            backend = "iptables"
            "#,
        )
        .unwrap();

        assert_eq!(config.firewall.backend, FirewallBackendKind::Iptables);
        assert_eq!(config.firewall.set_ttl_secs, 7200);
        assert_eq!(config.session.heartbeat_dir, PathBuf::from("/run/stormshadow"));

        let plan = config.attack_plan().unwrap();
        assert_eq!(plan.kind, AttackKind::PayloadFlood);
        assert_eq!(plan.target_ports, vec![5060, 5061]);
        let spoof = plan.spoofing.unwrap();
        assert_eq!(spoof.queues, vec![0, 1]);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = Config::default();
        config.attack.max_duration_secs = 30;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.attack.max_duration_secs, 30);
        assert_eq!(loaded.firewall.table_name, "stormshadow");
    }

    #[test]
    fn test_validation_errors() {
        let mut config = Config::default();
        config.session.stale_threshold_secs = 30;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.return_path.enabled = true;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.attack.max_count = 0;
        assert!(config.attack_plan().is_err());

        let mut config = Config::default();
        config.attack.name = "smurf".to_string();
        assert!(config.attack_plan().is_err());

        let mut config = Config::default();
        config.spoofing.enabled = true;
        config.spoofing.subnet = "fd00::/64".parse().unwrap();
        assert!(config.attack_plan().is_err());
    }
}
