//! Attack lifecycle.
//!
//! A run goes through four stages: session, firewall, spoofer, attack. Each
//! stage that started is unwound in reverse order whatever the outcome, so
//! a failed or interrupted run leaves no rules, sets, heartbeats or child
//! processes behind unless a removal itself fails.

use chrono::Utc;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::attack::{
    check_exit, generator_commands, AttackKind, AttackPlan, GeneratorProcess,
};
use crate::config::Config;
use crate::error::{AttackError, OrchestratorError, Stage, StageError};
use crate::firewall::{
    backend_for, CleanupReport, DivertMatch, DivertStrategy, MemoryBackend, RuleManager,
};
use crate::session::{HeartbeatStore, Session, Suid};
use crate::spoofer::{ready_socket_path, spoofer_args, SpooferOptions, SpooferProcess};
use crate::tag::PURPOSE_DIVERT;

/// Receives `true` once the run should stop.
pub type Shutdown = watch::Receiver<bool>;

/// Shutdown channel fed by Ctrl-C and SIGTERM.
pub fn signal_shutdown() -> std::io::Result<Shutdown> {
    use tokio::signal::unix::{signal, SignalKind};

    let (tx, rx) = watch::channel(false);
    let mut term = signal(SignalKind::terminate())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received Ctrl-C, stopping"),
            _ = term.recv() => info!("Received SIGTERM, stopping"),
        }
        let _ = tx.send(true);
    });
    Ok(rx)
}

fn shutdown_requested(shutdown: &Shutdown) -> bool {
    *shutdown.borrow()
}

/// Resolves when shutdown is requested. A dropped sender never fires.
pub async fn wait_for_shutdown(shutdown: &mut Shutdown) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// How the attack stage ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttackOutcome {
    /// Generators exited successfully.
    Completed,
    /// `max_duration` elapsed and the generators were stopped.
    DurationReached,
    /// Dry run: nothing was spawned.
    Simulated,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub suid: Suid,
    pub attack: AttackKind,
    pub strategy: Option<DivertStrategy>,
    pub rules_installed: usize,
    pub spoofers: usize,
    pub commands: Vec<String>,
    pub outcome: AttackOutcome,
    pub cleanup: CleanupReport,
    pub dry_run: bool,
}

/// Resources started so far, unwound in reverse.
#[derive(Default)]
struct Started {
    firewall: bool,
    spoofers: Vec<SpooferProcess>,
    generators: Vec<GeneratorProcess>,
    rules_installed: usize,
    commands: Vec<String>,
}

type StageResult<T> = Result<T, (Stage, StageError)>;

fn at<E: Into<StageError>>(stage: Stage) -> impl FnOnce(E) -> (Stage, StageError) {
    move |e| (stage, e.into())
}

pub struct Orchestrator {
    config: Config,
    rules: RuleManager,
    heartbeats: HeartbeatStore,
    self_exe: PathBuf,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        rules: RuleManager,
        heartbeats: HeartbeatStore,
        self_exe: PathBuf,
    ) -> Self {
        Self {
            config,
            rules,
            heartbeats,
            self_exe,
        }
    }

    /// Kernel backend, or an in-memory one with a scratch heartbeat
    /// directory for dry runs.
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        let self_exe = std::env::current_exe()?;
        let (heartbeats, backend) = if config.general.dry_run {
            let dir = std::env::temp_dir().join("stormshadow-dry-run");
            (
                HeartbeatStore::new(dir),
                Box::new(MemoryBackend::new()) as Box<dyn crate::firewall::PacketFilter>,
            )
        } else {
            (config.heartbeat_store(), backend_for(&config.firewall))
        };
        let rules = RuleManager::new(
            backend,
            config.firewall.clone(),
            heartbeats.clone(),
            config.session.stale_threshold(),
        );
        Ok(Self::new(config, rules, heartbeats, self_exe))
    }

    pub fn rules(&self) -> &RuleManager {
        &self.rules
    }

    fn spoofer_program(&self) -> PathBuf {
        self.config
            .spoofing
            .program
            .clone()
            .unwrap_or_else(|| self.self_exe.clone())
    }

    /// Run one attack to completion. `suid` reuses a caller chosen session
    /// id instead of generating one.
    pub async fn run(
        &mut self,
        plan: &AttackPlan,
        suid: Option<Suid>,
        mut shutdown: Shutdown,
    ) -> Result<RunReport, OrchestratorError> {
        if let Err(e) = plan.validate() {
            return Err(OrchestratorError::Stage {
                stage: Stage::Attack,
                source: e.into(),
                cleanup: CleanupReport::default(),
            });
        }

        let session = match suid {
            Some(suid) => self.heartbeats.start_session_with(suid),
            None => self.heartbeats.start_session(),
        };
        info!(
            "Starting {} against {} ports {:?} (session {}{})",
            plan.kind,
            plan.target,
            plan.target_ports,
            session.suid(),
            if plan.dry_run { ", dry run" } else { "" }
        );

        let mut started = Started::default();
        let result = self
            .execute(plan, &session, &mut started, &mut shutdown)
            .await;

        let cleanup = self.unwind(&session, &mut started).await;
        let suid = session.suid().clone();
        self.heartbeats.end_session(session);

        match result {
            Ok(outcome) => Ok(RunReport {
                suid,
                attack: plan.kind,
                strategy: self.rules.strategy(),
                rules_installed: started.rules_installed,
                spoofers: started.spoofers.len(),
                commands: started.commands,
                outcome,
                cleanup,
                dry_run: plan.dry_run,
            }),
            Err((stage, source)) => {
                error!("{} stage failed: {}", stage, source);
                Err(OrchestratorError::Stage {
                    stage,
                    source,
                    cleanup,
                })
            }
        }
    }

    async fn execute(
        &mut self,
        plan: &AttackPlan,
        session: &Session,
        started: &mut Started,
        shutdown: &mut Shutdown,
    ) -> StageResult<AttackOutcome> {
        if self.heartbeats.last_heartbeat(session.suid()).is_none() {
            warn!(
                "No heartbeat at {}; session {} counts as stale to other runs",
                session.heartbeat_path().display(),
                session.suid()
            );
        }
        self.interrupted(Stage::Session, shutdown)?;

        self.firewall_stage(plan, session, started)?;
        self.interrupted(Stage::Firewall, shutdown)?;

        self.spoofer_stage(plan, session, started).await?;
        self.interrupted(Stage::Spoofer, shutdown)?;

        self.attack_stage(plan, session, started, shutdown).await
    }

    fn interrupted(&self, stage: Stage, shutdown: &Shutdown) -> StageResult<()> {
        if shutdown_requested(shutdown) {
            warn!("Interrupted after {} stage", stage);
            return Err((stage, StageError::Interrupted));
        }
        Ok(())
    }

    fn firewall_stage(
        &mut self,
        plan: &AttackPlan,
        session: &Session,
        started: &mut Started,
    ) -> StageResult<()> {
        self.rules
            .check_privileges()
            .map_err(at(Stage::Firewall))?;
        started.firewall = true;

        let reconciled = self
            .rules
            .prepare(session, Utc::now())
            .map_err(at(Stage::Firewall))?;
        if reconciled.removed > 0 {
            info!("Removed {} leftover rule(s) of stale sessions", reconciled.removed);
        }

        let Some(spoof) = &plan.spoofing else {
            debug!("Spoofing disabled, no divert rules");
            return Ok(());
        };
        for (queue, ports) in spoof.assign_ports(&plan.target_ports) {
            started.rules_installed += self
                .rules
                .install_divert_rule(&DivertMatch::udp_ports(ports), queue, session, PURPOSE_DIVERT)
                .map_err(at(Stage::Firewall))?;
        }
        if let Some(ret) = &plan.return_path {
            started.rules_installed += self
                .rules
                .install_return_rule(spoof.subnet, ret.target, ret.source_port, session)
                .map_err(at(Stage::Firewall))?;
        }
        Ok(())
    }

    async fn spoofer_stage(
        &mut self,
        plan: &AttackPlan,
        session: &Session,
        started: &mut Started,
    ) -> StageResult<()> {
        let Some(spoof) = &plan.spoofing else {
            return Ok(());
        };
        let program = self.spoofer_program();
        let ready_timeout = self.config.spoofing.ready_timeout();

        for (queue, ports) in spoof.assign_ports(&plan.target_ports) {
            let options = SpooferOptions {
                queue,
                subnet: spoof.subnet,
                ports,
                randomize_source_port: spoof.randomize_source_port,
                ready_socket: Some(ready_socket_path(
                    self.heartbeats.dir(),
                    session.suid().as_str(),
                    queue,
                )),
            };

            if plan.dry_run {
                let line = format!("{} {}", program.display(), spoofer_args(&options).join(" "));
                info!("[dry-run] would start spoofer: {}", line);
                started.commands.push(line);
                continue;
            }

            let process = SpooferProcess::start(&program, &options, ready_timeout)
                .await
                .map_err(at(Stage::Spoofer))?;
            started.spoofers.push(process);
        }
        Ok(())
    }

    async fn attack_stage(
        &mut self,
        plan: &AttackPlan,
        session: &Session,
        started: &mut Started,
        shutdown: &mut Shutdown,
    ) -> StageResult<AttackOutcome> {
        let commands = generator_commands(plan, &self.self_exe).map_err(at(Stage::Attack))?;

        if plan.dry_run {
            for command in commands {
                info!("[dry-run] would run: {}", command);
                started.commands.push(command.to_string());
            }
            return Ok(AttackOutcome::Simulated);
        }

        for command in commands {
            started.commands.push(command.to_string());
            let process = GeneratorProcess::spawn(command).map_err(at(Stage::Attack))?;
            started.generators.push(process);
        }

        let deadline = plan.max_duration.map(|d| Instant::now() + d);
        let mut ticker = tokio::time::interval(self.config.session.heartbeat_interval());
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.heartbeats.refresh_heartbeat(session);
                    let refreshed = self.rules.refresh_session_sets(session);
                    debug!("Refreshed heartbeat and {} set member(s)", refreshed);
                    for spoofer in &mut started.spoofers {
                        spoofer.check_alive().map_err(at(Stage::Spoofer))?;
                    }
                }
                _ = sleep_until_deadline(deadline) => {
                    info!("Attack duration reached, stopping generators");
                    return Ok(AttackOutcome::DurationReached);
                }
                _ = wait_for_shutdown(shutdown) => {
                    return Err((Stage::Attack, StageError::Interrupted));
                }
                result = wait_all(&mut started.generators) => {
                    result.map_err(at(Stage::Attack))?;
                    info!("Traffic generation complete");
                    return Ok(AttackOutcome::Completed);
                }
            }
        }
    }

    /// Reverse-order teardown of whatever `started` holds.
    async fn unwind(&mut self, session: &Session, started: &mut Started) -> CleanupReport {
        let grace = self.config.spoofing.stop_grace();

        for generator in started.generators.iter_mut().rev() {
            generator.stop(grace).await;
        }
        for spoofer in started.spoofers.iter_mut().rev() {
            debug!("Stopping spoofer for queue {}", spoofer.queue());
            spoofer.stop(grace).await;
        }

        if !started.firewall {
            return CleanupReport::default();
        }
        let report = self.rules.cleanup_session(session.suid());
        if !report.is_clean() {
            error!(
                "Leftover rules may remain; inspect chains {} and {}",
                self.config.firewall.filter_chain, self.config.firewall.nat_chain
            );
        }
        report
    }
}

async fn wait_all(generators: &mut [GeneratorProcess]) -> Result<(), AttackError> {
    let mut failure = None;
    for generator in generators.iter_mut() {
        let status = generator.wait().await?;
        if let Err(e) = check_exit(&status) {
            warn!("{} failed: {}", generator.command(), e);
            failure.get_or_insert(e);
        }
    }
    failure.map_or(Ok(()), Err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attack::tests::plan;
    use crate::attack::{ReturnPath, SpoofPlan};
    use crate::firewall::{FilterTable, MemoryBackend};

    fn orchestrator(dir: &std::path::Path, backend: MemoryBackend) -> Orchestrator {
        let mut config = Config::default();
        config.session.heartbeat_dir = dir.to_path_buf();
        let heartbeats = config.heartbeat_store();
        let rules = RuleManager::new(
            Box::new(backend),
            config.firewall.clone(),
            heartbeats.clone(),
            config.session.stale_threshold(),
        );
        Orchestrator::new(config, rules, heartbeats, PathBuf::from("/usr/bin/stormshadow"))
    }

    fn spoofed_plan() -> AttackPlan {
        let mut p = plan(AttackKind::InviteFlood);
        p.target_ports = vec![5060, 5061];
        p.dry_run = true;
        p.spoofing = Some(SpoofPlan {
            subnet: "10.10.123.0/24".parse().unwrap(),
            queues: vec![0, 1],
            randomize_source_port: true,
        });
        p.return_path = Some(ReturnPath {
            target: "192.168.56.1:5060".parse().unwrap(),
            source_port: None,
        });
        p
    }

    #[tokio::test]
    async fn test_dry_run_installs_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MemoryBackend::new();
        let mut orch = orchestrator(dir.path(), backend.clone());
        let (_tx, rx) = watch::channel(false);

        let report = orch
            .run(&spoofed_plan(), Some("abc123".parse().unwrap()), rx)
            .await
            .unwrap();

        assert_eq!(report.suid.as_str(), "abc123");
        assert_eq!(report.outcome, AttackOutcome::Simulated);
        assert_eq!(report.strategy, Some(DivertStrategy::PortSet));
        // two aggregate divert rules and one return rule
        assert_eq!(report.rules_installed, 3);
        assert!(report.cleanup.is_clean());
        assert_eq!(report.cleanup.removed, 3);
        // two spoofers and two inviteflood generators
        assert_eq!(report.commands.len(), 4);
        assert!(report.commands[0].contains("spoof --queue 0"));

        assert!(backend.rules(FilterTable::Filter, "STORMSHADOW").is_empty());
        assert!(backend.rules(FilterTable::Nat, "STORMSHADOW-NAT").is_empty());
        assert!(backend.set_names().is_empty());
        assert!(!dir.path().join("abc123.hb").exists());
    }

    #[tokio::test]
    async fn test_unwritable_heartbeat_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("plainfile");
        std::fs::write(&plain, b"not a directory").unwrap();
        let backend = MemoryBackend::new();
        let mut orch = orchestrator(&plain.join("sub"), backend.clone());
        let (_tx, rx) = watch::channel(false);

        let report = orch
            .run(&spoofed_plan(), Some("abc123".parse().unwrap()), rx)
            .await
            .unwrap();
        assert_eq!(report.outcome, AttackOutcome::Simulated);
        assert_eq!(report.rules_installed, 3);
        assert!(report.cleanup.is_clean());
        assert!(backend.rules(FilterTable::Filter, "STORMSHADOW").is_empty());
    }

    #[tokio::test]
    async fn test_interrupt_before_attack_unwinds() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MemoryBackend::new();
        let mut orch = orchestrator(dir.path(), backend.clone());
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let err = orch.run(&spoofed_plan(), None, rx).await.unwrap_err();
        assert_eq!(err.stage(), Stage::Session);
        assert!(!err.inspection_advised());
        assert!(backend.rules(FilterTable::Filter, "STORMSHADOW").is_empty());
    }

    #[tokio::test]
    async fn test_failed_cleanup_advises_inspection() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MemoryBackend::new();
        backend.fail_deletes_matching("Stormshadow:abc123");
        let mut orch = orchestrator(dir.path(), backend.clone());
        let (_tx, rx) = watch::channel(false);

        let report = orch
            .run(&spoofed_plan(), Some("abc123".parse().unwrap()), rx)
            .await
            .unwrap();
        assert!(!report.cleanup.is_clean());
        // three rules, plus the two sets they still reference
        assert_eq!(report.cleanup.failures.len(), 5);
        assert_eq!(backend.rules(FilterTable::Filter, "STORMSHADOW").len(), 2);
    }

    #[tokio::test]
    async fn test_unbounded_plan_rejected_before_session() {
        let dir = tempfile::tempdir().unwrap();
        let mut orch = orchestrator(dir.path(), MemoryBackend::new());
        let mut p = spoofed_plan();
        p.max_count = 0;
        let (_tx, rx) = watch::channel(false);

        let err = orch.run(&p, None, rx).await.unwrap_err();
        assert_eq!(err.stage(), Stage::Attack);
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn test_generator_failure_reports_attack_stage() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MemoryBackend::new();
        let mut orch = orchestrator(dir.path(), backend.clone());
        let mut p = plan(AttackKind::InviteFlood);
        p.inviteflood_path = PathBuf::from("false");
        let (_tx, rx) = watch::channel(false);

        let err = orch.run(&p, None, rx).await.unwrap_err();
        assert_eq!(err.stage(), Stage::Attack);
        assert!(matches!(
            err,
            OrchestratorError::Stage {
                source: StageError::Attack(AttackError::GeneratorFailed { .. }),
                ..
            }
        ));
        assert!(err.cleanup().is_clean());
    }

    #[tokio::test]
    async fn test_duration_bound_stops_generator() {
        let dir = tempfile::tempdir().unwrap();
        let mut orch = orchestrator(dir.path(), MemoryBackend::new());
        let mut p = plan(AttackKind::InviteFlood);
        // inviteflood's positional arguments turn into `sh -c 'sleep 30' ...`
        p.inviteflood_path = PathBuf::from("sh");
        p.interface = "-c".to_string();
        p.sip_user = "sleep 30".to_string();
        p.max_duration = Some(Duration::from_millis(300));
        let (_tx, rx) = watch::channel(false);

        let started = std::time::Instant::now();
        let report = orch.run(&p, None, rx).await.unwrap();
        assert_eq!(report.outcome, AttackOutcome::DurationReached);
        assert!(report.cleanup.is_clean());
        assert!(started.elapsed() < Duration::from_secs(20));
    }

    #[tokio::test]
    async fn test_shutdown_during_attack() {
        let dir = tempfile::tempdir().unwrap();
        let mut orch = orchestrator(dir.path(), MemoryBackend::new());
        let mut p = plan(AttackKind::InviteFlood);
        p.inviteflood_path = PathBuf::from("sh");
        p.interface = "-c".to_string();
        p.sip_user = "sleep 30".to_string();
        let (tx, rx) = watch::channel(false);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            let _ = tx.send(true);
        });

        let err = orch.run(&p, None, rx).await.unwrap_err();
        assert_eq!(err.stage(), Stage::Attack);
        assert!(matches!(
            err,
            OrchestratorError::Stage { source: StageError::Interrupted, .. }
        ));
    }
}
