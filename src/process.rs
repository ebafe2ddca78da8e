//! Child process supervision shared by the spoofer and traffic generator.

use std::ffi::OsStr;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

/// A spawned child that is asked to stop with SIGTERM and killed when it
/// outlives the grace period.
pub struct ManagedChild {
    label: String,
    child: Child,
    exit: Option<ExitStatus>,
}

impl ManagedChild {
    pub fn spawn<I, S>(label: impl Into<String>, program: impl AsRef<OsStr>, args: I) -> io::Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let label = label.into();
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        info!("Started {} with PID {}", label, child.id().unwrap_or(0));
        Ok(Self {
            label,
            child,
            exit: None,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Exit status if the child has already terminated.
    pub fn try_exited(&mut self) -> Option<ExitStatus> {
        if self.exit.is_some() {
            return self.exit;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                debug!("{} exited with {}", self.label, status);
                self.exit = Some(status);
                self.exit
            }
            Ok(None) => None,
            Err(e) => {
                error!("Failed to check {} status: {}", self.label, e);
                None
            }
        }
    }

    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        if let Some(status) = self.exit {
            return Ok(status);
        }
        let status = self.child.wait().await?;
        self.exit = Some(status);
        Ok(status)
    }

    /// SIGTERM, then SIGKILL after `grace`. Returns the exit status when it
    /// could be collected.
    pub async fn stop(&mut self, grace: Duration) -> Option<ExitStatus> {
        if let Some(status) = self.try_exited() {
            return Some(status);
        }

        info!("Stopping {}", self.label);
        if let Some(pid) = self.child.id() {
            terminate(&self.label, pid);
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                info!("{} stopped: {}", self.label, status);
                self.exit = Some(status);
            }
            Ok(Err(e)) => {
                warn!("Error waiting for {}: {}", self.label, e);
            }
            Err(_) => {
                warn!("{} did not stop within {:?}, killing", self.label, grace);
                if let Err(e) = self.child.kill().await {
                    error!("Failed to kill {}: {}", self.label, e);
                }
                self.exit = self.child.try_wait().ok().flatten();
            }
        }
        self.exit
    }
}

impl Drop for ManagedChild {
    fn drop(&mut self) {
        if self.exit.is_none() {
            if let Some(pid) = self.child.id() {
                terminate(&self.label, pid);
            }
        }
    }
}

/// Send SIGTERM to `pid`. Returns false when the signal was not delivered,
/// usually because the process is already gone.
fn terminate(label: &str, pid: u32) -> bool {
    match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) => true,
        Err(e) => {
            debug!("SIGTERM to {} (PID {}) failed: {}", label, pid, e);
            false
        }
    }
}

/// Human readable exit status, "signal 15" style for killed children.
pub fn describe_status(status: &ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;

    match (status.code(), status.signal()) {
        (Some(code), _) => format!("exit code {}", code),
        (None, Some(signal)) => format!("signal {}", signal),
        (None, None) => status.to_string(),
    }
}
