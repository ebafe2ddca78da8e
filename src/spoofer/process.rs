//! Orchestrator side of a spoofer process.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::net::UnixDatagram;
use tracing::{debug, info};

use super::{ReadySignal, SpooferOptions};
use crate::error::SpooferError;
use crate::process::{describe_status, ManagedChild};

/// Remove a readiness socket path. A missing file is not an error.
fn remove_socket(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => debug!("Could not remove {}: {}", path.display(), e),
    }
}

/// Command line for `stormshadow spoof`.
pub fn spoofer_args(options: &SpooferOptions) -> Vec<String> {
    let mut args = vec![
        "spoof".to_string(),
        "--queue".to_string(),
        options.queue.to_string(),
        "--subnet".to_string(),
        options.subnet.to_string(),
    ];
    if !options.ports.is_empty() {
        let ports: Vec<String> = options.ports.iter().map(|p| p.to_string()).collect();
        args.push("--ports".to_string());
        args.push(ports.join(","));
    }
    if let Some(socket) = &options.ready_socket {
        args.push("--ready-socket".to_string());
        args.push(socket.display().to_string());
    }
    if !options.randomize_source_port {
        args.push("--keep-source-port".to_string());
    }
    args
}

/// Readiness socket location for one queue of one session.
pub fn ready_socket_path(dir: &Path, suid: &str, queue: u16) -> PathBuf {
    dir.join(format!("{}-q{}.ready", suid, queue))
}

pub struct SpooferProcess {
    queue: u16,
    child: ManagedChild,
}

impl SpooferProcess {
    /// Spawns `program spoof ...` and waits until it reports readiness,
    /// exits, or `ready_timeout` passes. `options.ready_socket` must be set.
    pub async fn start(
        program: &Path,
        options: &SpooferOptions,
        ready_timeout: Duration,
    ) -> Result<Self, SpooferError> {
        let queue = options.queue;
        let socket_path = options.ready_socket.clone().ok_or_else(|| SpooferError::Spawn {
            queue,
            reason: "no readiness socket configured".to_string(),
        })?;

        remove_socket(&socket_path);
        let socket = UnixDatagram::bind(&socket_path)?;

        let args = spoofer_args(options);
        debug!("Spawning {} {}", program.display(), args.join(" "));
        let mut child = ManagedChild::spawn(format!("spoofer q{}", queue), program, &args)
            .map_err(|e| SpooferError::Spawn {
                queue,
                reason: e.to_string(),
            })?;

        let mut buf = [0u8; 512];
        let outcome = tokio::select! {
            received = socket.recv(&mut buf) => match received {
                Ok(n) => match ReadySignal::decode(&buf[..n]) {
                    Some(ReadySignal::Ready) => Ok(()),
                    Some(ReadySignal::Failed(reason)) => {
                        Err(SpooferError::BindConflict { queue, reason })
                    }
                    None => Err(SpooferError::Spawn {
                        queue,
                        reason: "malformed readiness message".to_string(),
                    }),
                },
                Err(e) => Err(SpooferError::Io(e)),
            },
            status = child.wait() => Err(SpooferError::ExitedEarly {
                queue,
                status: match status {
                    Ok(status) => describe_status(&status),
                    Err(e) => e.to_string(),
                },
            }),
            _ = tokio::time::sleep(ready_timeout) => Err(SpooferError::ReadyTimeout {
                queue,
                timeout: ready_timeout,
            }),
        };

        drop(socket);
        remove_socket(&socket_path);

        match outcome {
            Ok(()) => {
                info!("Spoofer for queue {} ready (PID {:?})", queue, child.pid());
                Ok(Self { queue, child })
            }
            Err(e) => {
                child.stop(Duration::from_secs(1)).await;
                Err(e)
            }
        }
    }

    pub fn queue(&self) -> u16 {
        self.queue
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.pid()
    }

    /// `SpooferError::Died` once the process has exited on its own.
    pub fn check_alive(&mut self) -> Result<(), SpooferError> {
        match self.child.try_exited() {
            Some(status) => Err(SpooferError::Died {
                queue: self.queue,
                status: describe_status(&status),
            }),
            None => Ok(()),
        }
    }

    pub async fn stop(&mut self, grace: Duration) {
        self.child.stop(grace).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn options(socket: Option<PathBuf>) -> SpooferOptions {
        SpooferOptions {
            queue: 2,
            subnet: "10.10.123.0/24".parse().unwrap(),
            ports: vec![5060, 5062],
            randomize_source_port: true,
            ready_socket: socket,
        }
    }

    #[test]
    fn test_remove_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("q2.ready");
        std::fs::write(&path, b"").unwrap();

        remove_socket(&path);
        assert!(!path.exists());
        // already gone
        remove_socket(&path);
        // a directory cannot be unlinked as a file; the path is left alone
        std::fs::create_dir(&path).unwrap();
        remove_socket(&path);
        assert!(path.is_dir());
    }

    fn script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("fake-spoofer");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn test_spoofer_args() {
        let args = spoofer_args(&options(Some(PathBuf::from("/run/ss/x.ready"))));
        assert_eq!(
            args,
            [
                "spoof", "--queue", "2", "--subnet", "10.10.123.0/24", "--ports", "5060,5062",
                "--ready-socket", "/run/ss/x.ready"
            ]
        );

        let mut opts = options(None);
        opts.ports.clear();
        opts.randomize_source_port = false;
        assert_eq!(
            spoofer_args(&opts),
            ["spoof", "--queue", "2", "--subnet", "10.10.123.0/24", "--keep-source-port"]
        );
    }

    #[test]
    fn test_ready_socket_path() {
        assert_eq!(
            ready_socket_path(Path::new("/run/stormshadow"), "abc123", 4),
            PathBuf::from("/run/stormshadow/abc123-q4.ready")
        );
    }

    #[tokio::test]
    async fn test_start_reports_early_exit() {
        let dir = tempfile::tempdir().unwrap();
        let program = script(dir.path(), "exit 1");
        let socket = dir.path().join("q2.ready");

        let err = SpooferProcess::start(&program, &options(Some(socket.clone())), Duration::from_secs(5))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SpooferError::ExitedEarly { queue: 2, .. }));
        assert!(!socket.exists());
    }

    #[tokio::test]
    async fn test_start_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let program = script(dir.path(), "exec sleep 30");

        let err = SpooferProcess::start(
            &program,
            &options(Some(dir.path().join("q2.ready"))),
            Duration::from_millis(200),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, SpooferError::ReadyTimeout { queue: 2, .. }));
    }

    #[tokio::test]
    async fn test_start_requires_socket() {
        let err = SpooferProcess::start(Path::new("/bin/true"), &options(None), Duration::from_secs(1))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SpooferError::Spawn { .. }));
    }
}
