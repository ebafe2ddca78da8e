use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::firewall::{CleanupReport, RuleFailure};
use crate::spoofer::{SpooferEvent, SpooferState};

#[derive(Debug, Error)]
pub enum FirewallError {
    #[error("packet filter changes require root privileges (effective uid {euid})")]
    Privilege { euid: u32 },

    #[error("rule manager not prepared: chains must be ensured and reconciled before installing rules")]
    NotPrepared,

    #[error("{op} failed: {message}")]
    Backend { op: String, message: String },

    #[error("invalid rule: {0}")]
    InvalidRule(String),

    #[error("{} rule change(s) failed: {}", .failures.len(), summarize(.failures))]
    Install { failures: Vec<RuleFailure> },

    #[error("isolated chains still hold rules of live sessions: {}", .sessions.join(", "))]
    ChainsInUse { sessions: Vec<String> },
}

impl FirewallError {
    pub(crate) fn backend(op: impl Into<String>, err: anyhow::Error) -> Self {
        Self::Backend {
            op: op.into(),
            message: format!("{:#}", err),
        }
    }
}

fn summarize(failures: &[RuleFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum SpooferError {
    #[error("cannot bind packet queue {queue}: {reason}")]
    BindConflict { queue: u16, reason: String },

    #[error("invalid spoofer transition {event:?} from {from:?}")]
    InvalidTransition { from: SpooferState, event: SpooferEvent },

    #[error("spoofer for queue {queue} not ready after {timeout:?}")]
    ReadyTimeout { queue: u16, timeout: Duration },

    #[error("spoofer for queue {queue} exited before becoming ready ({status})")]
    ExitedEarly { queue: u16, status: String },

    #[error("failed to start spoofer for queue {queue}: {reason}")]
    Spawn { queue: u16, reason: String },

    #[error("spoofer for queue {queue} died during the attack ({status})")]
    Died { queue: u16, status: String },

    #[error("spoofed subnet {0} does not match the packet address family")]
    FamilyMismatch(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum AttackError {
    #[error("unknown attack '{0}' (see list-attacks)")]
    UnknownAttack(String),

    #[error("attack has no target ports")]
    NoTargetPorts,

    #[error("attack needs a packet count or a duration bound")]
    Unbounded,

    #[error("failed to start {program}: {reason}")]
    Spawn { program: String, reason: String },

    #[error("traffic generator exited with {status}")]
    GeneratorFailed { status: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("invalid value for {field}: {reason}")]
    Field { field: &'static str, reason: String },
}

/// Orchestrator lifecycle stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Session,
    Firewall,
    Spoofer,
    Attack,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Session => "session",
            Stage::Firewall => "firewall",
            Stage::Spoofer => "spoofer",
            Stage::Attack => "attack",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Firewall(#[from] FirewallError),

    #[error(transparent)]
    Spoofer(#[from] SpooferError),

    #[error(transparent)]
    Attack(#[from] AttackError),

    #[error("interrupted by signal")]
    Interrupted,
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("{stage} stage failed: {source}")]
    Stage {
        stage: Stage,
        source: StageError,
        cleanup: CleanupReport,
    },
}

impl OrchestratorError {
    pub fn stage(&self) -> Stage {
        match self {
            OrchestratorError::Stage { stage, .. } => *stage,
        }
    }

    pub fn cleanup(&self) -> &CleanupReport {
        match self {
            OrchestratorError::Stage { cleanup, .. } => cleanup,
        }
    }

    /// Whether leftover rules may remain in the isolated chains.
    pub fn inspection_advised(&self) -> bool {
        !self.cleanup().is_clean()
    }
}
