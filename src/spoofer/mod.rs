//! NFQUEUE source spoofer.
//!
//! One spoofer process serves one queue number. It binds the queue, reports
//! readiness to the orchestrator over a unix datagram socket, then rewrites
//! diverted attack packets until asked to stop. Every packet gets an accept
//! verdict, rewritten or not.

pub mod process;
pub mod rewrite;

pub use process::{ready_socket_path, spoofer_args, SpooferProcess};
pub use rewrite::{AddressPool, Disposition, PacketRewriter, PassReason};

use ipnetwork::IpNetwork;
use nfq::{Queue, Verdict};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use serde::Serialize;
use std::io::ErrorKind;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::error::SpooferError;

/// Longest wait on an idle queue before the stop flag is checked again.
const IDLE_POLL_MS: u16 = 250;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpooferState {
    Unbound,
    Bound,
    Running,
    Stopping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpooferEvent {
    Bind,
    BindFailed,
    Start,
    Stop,
    Unbind,
}

impl SpooferState {
    pub fn transition(self, event: SpooferEvent) -> Result<SpooferState, SpooferError> {
        use SpooferEvent::*;
        use SpooferState::*;

        match (self, event) {
            (Unbound, Bind) => Ok(Bound),
            (Unbound, BindFailed) => Ok(Unbound),
            (Bound, Start) => Ok(Running),
            (Bound, Stop) | (Running, Stop) => Ok(Stopping),
            (Stopping, Unbind) => Ok(Unbound),
            (from, event) => Err(SpooferError::InvalidTransition { from, event }),
        }
    }

    pub fn accepts_packets(self) -> bool {
        self == SpooferState::Running
    }
}

#[derive(Debug, Clone)]
pub struct SpooferOptions {
    pub queue: u16,
    pub subnet: IpNetwork,
    /// Destination ports to rewrite; empty means all UDP.
    pub ports: Vec<u16>,
    pub randomize_source_port: bool,
    pub ready_socket: Option<PathBuf>,
}

/// Readiness datagram sent from the spoofer to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadySignal {
    Ready,
    Failed(String),
}

impl ReadySignal {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            ReadySignal::Ready => b"ready".to_vec(),
            ReadySignal::Failed(reason) => format!("error:{}", reason).into_bytes(),
        }
    }

    pub fn decode(data: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(data).ok()?.trim();
        if text == "ready" {
            return Some(ReadySignal::Ready);
        }
        text.strip_prefix("error:")
            .map(|reason| ReadySignal::Failed(reason.to_string()))
    }
}

/// Best effort: a missing listener is logged, not fatal.
pub fn notify_ready(socket: &Path, signal: &ReadySignal) {
    let sent = UnixDatagram::unbound().and_then(|sock| sock.send_to(&signal.encode(), socket));
    if let Err(e) = sent {
        warn!("Could not send readiness to {}: {}", socket.display(), e);
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SpooferStats {
    pub rewritten: u64,
    pub passed: u64,
    pub errors: u64,
}

impl SpooferStats {
    pub fn record(&mut self, disposition: &Disposition) {
        match disposition {
            Disposition::Rewritten { .. } => self.rewritten += 1,
            Disposition::PassThrough(_) => self.passed += 1,
        }
    }

    pub fn log_summary(&self, queue: u16) {
        info!(
            "Spoofer queue {} stopped: {} rewritten, {} passed through, {} errors",
            queue, self.rewritten, self.passed, self.errors
        );
    }
}

/// Wait until `fd` is readable or `timeout_ms` passes. A signal ends the
/// wait like a timeout.
fn wait_readable(fd: BorrowedFd<'_>, timeout_ms: u16) -> nix::Result<bool> {
    let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
    match poll(&mut fds, timeout_ms) {
        Ok(ready) => Ok(ready > 0),
        Err(Errno::EINTR) => Ok(false),
        Err(e) => Err(e),
    }
}

fn open_queue(queue_num: u16) -> std::io::Result<Queue> {
    let mut queue = Queue::open()?;
    queue.bind(queue_num)?;
    Ok(queue)
}

pub struct Spoofer {
    options: SpooferOptions,
    rewriter: PacketRewriter,
    state: SpooferState,
    stats: SpooferStats,
}

impl Spoofer {
    pub fn new(options: SpooferOptions) -> Self {
        let rewriter = PacketRewriter::new(
            AddressPool::new(options.subnet),
            options.ports.iter().copied(),
            options.randomize_source_port,
        );
        Self {
            options,
            rewriter,
            state: SpooferState::Unbound,
            stats: SpooferStats::default(),
        }
    }

    pub fn state(&self) -> SpooferState {
        self.state
    }

    fn advance(&mut self, event: SpooferEvent) -> Result<(), SpooferError> {
        let next = self.state.transition(event)?;
        debug!("Spoofer queue {}: {:?} -> {:?}", self.options.queue, self.state, next);
        self.state = next;
        Ok(())
    }

    fn report(&self, signal: ReadySignal) {
        if let Some(socket) = &self.options.ready_socket {
            notify_ready(socket, &signal);
        }
    }

    /// Handle one queued payload. Outside `Running` everything passes.
    pub fn handle_payload(&mut self, payload: &[u8]) -> Disposition {
        let disposition = if self.state.accepts_packets() {
            self.rewriter.process(payload)
        } else {
            Disposition::PassThrough(PassReason::Inactive)
        };
        self.stats.record(&disposition);
        disposition
    }

    /// Runs until `running` is cleared. The caller wires `running` to the
    /// process signal handler.
    pub fn run(mut self, running: Arc<AtomicBool>) -> Result<SpooferStats, SpooferError> {
        let queue_num = self.options.queue;

        let mut queue = match open_queue(queue_num) {
            Ok(queue) => queue,
            Err(e) => {
                self.advance(SpooferEvent::BindFailed)?;
                let reason = e.to_string();
                error!("Failed to bind NFQUEUE {}: {}", queue_num, reason);
                self.report(ReadySignal::Failed(reason.clone()));
                return Err(SpooferError::BindConflict {
                    queue: queue_num,
                    reason,
                });
            }
        };
        self.advance(SpooferEvent::Bind)?;
        queue.set_nonblocking(true);

        self.advance(SpooferEvent::Start)?;
        info!(
            "Spoofer bound to queue {} (subnet {}, ports {:?})",
            queue_num, self.options.subnet, self.options.ports
        );
        self.report(ReadySignal::Ready);

        while running.load(Ordering::Relaxed) {
            match queue.recv() {
                Ok(mut msg) => {
                    if let Disposition::Rewritten { packet, .. } =
                        self.handle_payload(msg.get_payload())
                    {
                        msg.set_payload(packet);
                    }
                    msg.set_verdict(Verdict::Accept);
                    if let Err(e) = queue.verdict(msg) {
                        error!("Failed to issue verdict on queue {}: {}", queue_num, e);
                        self.stats.errors += 1;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    // SAFETY: the descriptor belongs to `queue`, which outlives this borrow.
                    let fd = unsafe { BorrowedFd::borrow_raw(queue.as_raw_fd()) };
                    if let Err(e) = wait_readable(fd, IDLE_POLL_MS) {
                        debug!("poll on queue {} failed: {}", queue_num, e);
                        std::thread::sleep(Duration::from_millis(IDLE_POLL_MS.into()));
                    }
                }
                Err(e) => {
                    if !running.load(Ordering::Relaxed) {
                        break;
                    }
                    error!("NFQUEUE {} receive error: {}", queue_num, e);
                    self.stats.errors += 1;
                    std::thread::sleep(Duration::from_millis(100));
                }
            }
        }

        self.advance(SpooferEvent::Stop)?;
        if let Err(e) = queue.unbind(queue_num) {
            warn!("Failed to unbind queue {}: {}", queue_num, e);
        }
        self.advance(SpooferEvent::Unbind)?;

        self.stats.log_summary(queue_num);
        Ok(self.stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use etherparse::PacketBuilder;

    fn options() -> SpooferOptions {
        SpooferOptions {
            queue: 3,
            subnet: "10.10.123.0/24".parse().unwrap(),
            ports: vec![5060],
            randomize_source_port: false,
            ready_socket: None,
        }
    }

    #[test]
    fn test_state_machine() {
        use SpooferEvent::*;
        use SpooferState::*;

        let mut state = Unbound;
        for (event, expected) in [(Bind, Bound), (Start, Running), (Stop, Stopping), (Unbind, Unbound)] {
            state = state.transition(event).unwrap();
            assert_eq!(state, expected);
        }

        assert_eq!(Unbound.transition(BindFailed).unwrap(), Unbound);
        assert_eq!(Bound.transition(Stop).unwrap(), Stopping);
        assert!(matches!(
            Unbound.transition(Start),
            Err(SpooferError::InvalidTransition { from: Unbound, event: Start })
        ));
        assert!(Running.transition(Bind).is_err());
        assert!(Stopping.transition(Start).is_err());
        assert!(Running.accepts_packets());
        assert!(!Bound.accepts_packets());
    }

    #[test]
    fn test_ready_signal_encoding() {
        assert_eq!(ReadySignal::Ready.encode(), b"ready");
        assert_eq!(ReadySignal::decode(b"ready\n"), Some(ReadySignal::Ready));

        let failed = ReadySignal::Failed("Device or resource busy".into());
        assert_eq!(ReadySignal::decode(&failed.encode()), Some(failed));
        assert_eq!(ReadySignal::decode(b"garbage"), None);
        assert_eq!(ReadySignal::decode(&[0xff, 0xfe]), None);
    }

    #[test]
    fn test_notify_ready_reaches_listener() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ready.sock");
        let listener = UnixDatagram::bind(&path).unwrap();

        notify_ready(&path, &ReadySignal::Ready);

        let mut buf = [0u8; 64];
        let n = listener.recv(&mut buf).unwrap();
        assert_eq!(ReadySignal::decode(&buf[..n]), Some(ReadySignal::Ready));
    }

    #[test]
    fn test_wait_readable_wakes_on_data() {
        use std::os::fd::AsFd;
        use std::time::Instant;

        let (tx, rx) = UnixDatagram::pair().unwrap();
        assert!(!wait_readable(rx.as_fd(), 20).unwrap());

        tx.send(b"pkt").unwrap();
        let started = Instant::now();
        assert!(wait_readable(rx.as_fd(), 5_000).unwrap());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_notify_ready_without_listener_is_harmless() {
        let dir = tempfile::tempdir().unwrap();
        notify_ready(&dir.path().join("missing.sock"), &ReadySignal::Ready);
    }

    #[test]
    fn test_packets_pass_until_running() {
        let builder = PacketBuilder::ipv4([192, 168, 1, 1], [192, 168, 1, 2], 64).udp(5060, 5060);
        let mut packet = Vec::new();
        builder.write(&mut packet, b"INVITE").unwrap();

        let mut spoofer = Spoofer::new(options());
        assert!(matches!(spoofer.handle_payload(&packet), Disposition::PassThrough(_)));

        spoofer.advance(SpooferEvent::Bind).unwrap();
        spoofer.advance(SpooferEvent::Start).unwrap();
        let Disposition::Rewritten { source, .. } = spoofer.handle_payload(&packet) else {
            panic!("expected rewrite while running");
        };
        assert_eq!(source, "10.10.123.1:5060".parse().unwrap());

        assert_eq!(spoofer.stats.rewritten, 1);
        assert_eq!(spoofer.stats.passed, 1);
    }
}
