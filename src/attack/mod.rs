//! Attack registry and traffic generator launching.

pub mod flood;
pub mod invite_flood;

pub use flood::{default_payload, run_flood, FloodOptions, FloodStats};

use ipnetwork::IpNetwork;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::str::FromStr;
use std::time::Duration;

use crate::error::AttackError;
use crate::process::{describe_status, ManagedChild};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttackKind {
    InviteFlood,
    PayloadFlood,
}

impl AttackKind {
    pub const ALL: [AttackKind; 2] = [AttackKind::InviteFlood, AttackKind::PayloadFlood];

    pub fn name(&self) -> &'static str {
        match self {
            AttackKind::InviteFlood => "invite-flood",
            AttackKind::PayloadFlood => "payload-flood",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            AttackKind::InviteFlood => "SIP INVITE flood driven by the external inviteflood tool",
            AttackKind::PayloadFlood => {
                "UDP replay of a payload file or a generated SIP OPTIONS request"
            }
        }
    }

    /// External program the attack depends on, if any.
    pub fn requirement(&self) -> Option<&'static str> {
        match self {
            AttackKind::InviteFlood => Some("inviteflood"),
            AttackKind::PayloadFlood => None,
        }
    }
}

impl fmt::Display for AttackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AttackKind {
    type Err = AttackError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "invite-flood" | "inviteflood" | "invite_flood" => Ok(AttackKind::InviteFlood),
            "payload-flood" | "payload_flood" | "flood" => Ok(AttackKind::PayloadFlood),
            other => Err(AttackError::UnknownAttack(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpoofPlan {
    pub subnet: IpNetwork,
    pub queues: Vec<u16>,
    pub randomize_source_port: bool,
}

impl SpoofPlan {
    /// Spreads the attack ports over the queues round robin. Queues left
    /// without a port are not used.
    pub fn assign_ports(&self, ports: &[u16]) -> Vec<(u16, Vec<u16>)> {
        let mut queues: Vec<u16> = Vec::new();
        for q in &self.queues {
            if !queues.contains(q) {
                queues.push(*q);
            }
        }
        let mut unique_ports: Vec<u16> = ports.to_vec();
        unique_ports.sort_unstable();
        unique_ports.dedup();

        let mut assignment: Vec<(u16, Vec<u16>)> = queues.iter().map(|q| (*q, Vec::new())).collect();
        if assignment.is_empty() {
            return assignment;
        }
        let slots = assignment.len();
        for (i, port) in unique_ports.into_iter().enumerate() {
            assignment[i % slots].1.push(port);
        }
        assignment.retain(|(_, ports)| !ports.is_empty());
        assignment
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReturnPath {
    pub target: SocketAddr,
    pub source_port: Option<u16>,
}

/// Fully resolved parameters of one run.
#[derive(Debug, Clone)]
pub struct AttackPlan {
    pub kind: AttackKind,
    pub target: IpAddr,
    pub target_ports: Vec<u16>,
    pub source_port: u16,
    pub source_ip: Option<IpAddr>,
    pub interface: String,
    pub sip_user: String,
    /// 0 when bounded by duration only.
    pub max_count: u64,
    pub max_duration: Option<Duration>,
    pub delay: Duration,
    pub payload_path: Option<PathBuf>,
    pub inviteflood_path: PathBuf,
    pub spoofing: Option<SpoofPlan>,
    pub return_path: Option<ReturnPath>,
    pub dry_run: bool,
}

impl AttackPlan {
    pub fn validate(&self) -> Result<(), AttackError> {
        if self.target_ports.is_empty() {
            return Err(AttackError::NoTargetPorts);
        }
        if self.max_count == 0 && self.max_duration.is_none() {
            return Err(AttackError::Unbounded);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratorCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl fmt::Display for GeneratorCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Commands that carry out `plan`. `self_exe` runs the built-in payload
/// flood.
pub fn generator_commands(
    plan: &AttackPlan,
    self_exe: &Path,
) -> Result<Vec<GeneratorCommand>, AttackError> {
    plan.validate()?;
    match plan.kind {
        AttackKind::InviteFlood => Ok(invite_flood::commands(plan)),
        AttackKind::PayloadFlood => Ok(vec![flood::command(plan, self_exe)]),
    }
}

/// A running traffic generator.
pub struct GeneratorProcess {
    command: GeneratorCommand,
    child: ManagedChild,
}

impl GeneratorProcess {
    pub fn spawn(command: GeneratorCommand) -> Result<Self, AttackError> {
        let child = ManagedChild::spawn(
            format!("generator {}", command.program.display()),
            &command.program,
            &command.args,
        )
        .map_err(|e| AttackError::Spawn {
            program: command.program.display().to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self { command, child })
    }

    pub fn command(&self) -> &GeneratorCommand {
        &self.command
    }

    pub async fn wait(&mut self) -> Result<ExitStatus, AttackError> {
        Ok(self.child.wait().await?)
    }

    pub fn try_exited(&mut self) -> Option<ExitStatus> {
        self.child.try_exited()
    }

    pub async fn stop(&mut self, grace: Duration) -> Option<ExitStatus> {
        self.child.stop(grace).await
    }
}

/// Non-zero exit of a generator that was not stopped by us.
pub fn check_exit(status: &ExitStatus) -> Result<(), AttackError> {
    if status.success() {
        Ok(())
    } else {
        Err(AttackError::GeneratorFailed {
            status: describe_status(status),
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn plan(kind: AttackKind) -> AttackPlan {
        AttackPlan {
            kind,
            target: "192.168.56.20".parse().unwrap(),
            target_ports: vec![5060],
            source_port: 5070,
            source_ip: None,
            interface: "eth1".to_string(),
            sip_user: "200".to_string(),
            max_count: 500,
            max_duration: None,
            delay: Duration::ZERO,
            payload_path: None,
            inviteflood_path: PathBuf::from("inviteflood"),
            spoofing: None,
            return_path: None,
            dry_run: false,
        }
    }

    #[test]
    fn test_attack_lookup() {
        assert_eq!("invite-flood".parse::<AttackKind>().unwrap(), AttackKind::InviteFlood);
        assert_eq!("InviteFlood".parse::<AttackKind>().unwrap(), AttackKind::InviteFlood);
        assert_eq!("payload-flood".parse::<AttackKind>().unwrap(), AttackKind::PayloadFlood);
        assert!(matches!(
            "smurf".parse::<AttackKind>(),
            Err(AttackError::UnknownAttack(name)) if name == "smurf"
        ));
        for kind in AttackKind::ALL {
            assert_eq!(kind.name().parse::<AttackKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_assign_ports_round_robin() {
        let spoof = SpoofPlan {
            subnet: "10.10.123.0/24".parse().unwrap(),
            queues: vec![0, 1],
            randomize_source_port: true,
        };
        assert_eq!(
            spoof.assign_ports(&[5062, 5060, 5061, 5060]),
            vec![(0, vec![5060, 5062]), (1, vec![5061])]
        );

        // more queues than ports
        let spoof = SpoofPlan { queues: vec![0, 1, 2], ..spoof };
        assert_eq!(spoof.assign_ports(&[5060]), vec![(0, vec![5060])]);

        let spoof = SpoofPlan { queues: vec![], ..spoof };
        assert!(spoof.assign_ports(&[5060]).is_empty());
    }

    #[test]
    fn test_plan_bounds() {
        let mut p = plan(AttackKind::InviteFlood);
        assert!(p.validate().is_ok());

        p.max_count = 0;
        assert!(matches!(p.validate(), Err(AttackError::Unbounded)));
        p.max_duration = Some(Duration::from_secs(10));
        assert!(p.validate().is_ok());

        p.target_ports.clear();
        assert!(matches!(p.validate(), Err(AttackError::NoTargetPorts)));
        assert!(generator_commands(&p, Path::new("/usr/bin/stormshadow")).is_err());
    }

    #[test]
    fn test_command_display() {
        let cmd = GeneratorCommand {
            program: PathBuf::from("/usr/bin/inviteflood"),
            args: vec!["eth0".into(), "200".into()],
        };
        assert_eq!(cmd.to_string(), "/usr/bin/inviteflood eth0 200");
    }

    #[tokio::test]
    async fn test_generator_exit_status() {
        let mut ok = GeneratorProcess::spawn(GeneratorCommand {
            program: PathBuf::from("true"),
            args: vec![],
        })
        .unwrap();
        assert!(check_exit(&ok.wait().await.unwrap()).is_ok());

        let mut failing = GeneratorProcess::spawn(GeneratorCommand {
            program: PathBuf::from("false"),
            args: vec![],
        })
        .unwrap();
        let status = failing.wait().await.unwrap();
        assert!(matches!(
            check_exit(&status),
            Err(AttackError::GeneratorFailed { status }) if status == "exit code 1"
        ));

        let missing = GeneratorProcess::spawn(GeneratorCommand {
            program: PathBuf::from("/nonexistent/stormshadow-generator"),
            args: vec![],
        });
        assert!(matches!(missing, Err(AttackError::Spawn { .. })));
    }
}
