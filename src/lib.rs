//! StormShadow: lab SIP flood orchestration.
//!
//! Every packet filter rule an attack installs is tagged with the session
//! that owns it, lives in isolated chains, and is removed when the session
//! ends or when a later run finds its heartbeat stale. Attack packets can be
//! diverted to an NFQUEUE spoofer that rewrites their source addresses.

pub mod attack;
pub mod config;
pub mod error;
pub mod firewall;
pub mod orchestrator;
pub mod process;
pub mod session;
pub mod spoofer;
pub mod tag;

pub use attack::{AttackKind, AttackPlan};
pub use config::Config;
pub use error::{AttackError, ConfigError, FirewallError, OrchestratorError, SpooferError, Stage};
pub use firewall::{CleanupReport, MemoryBackend, PacketFilter, RuleManager};
pub use orchestrator::{Orchestrator, RunReport};
pub use session::{HeartbeatStore, Session, Suid};
pub use tag::{make_tag, parse_tag, RuleTag};
