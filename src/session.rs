//! Session identity and heartbeat files.
//!
//! Each orchestrator run owns a short session id (SUID). Liveness is
//! published as `<heartbeat_dir>/<suid>.hb`, whose content is the UNIX
//! timestamp of the last refresh. Reconciliation treats a session whose
//! heartbeat is missing or older than the staleness threshold as dead.

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Length of a generated SUID.
pub const SUID_LEN: usize = 12;

/// Upper bound on externally supplied SUIDs. Set names embed the SUID and
/// ipset caps names at 31 bytes.
pub const SUID_MAX_LEN: usize = 16;

/// Owner recorded on rules every session shares, such as the anchor jumps.
/// It never has a heartbeat and is refused as a caller-chosen SUID.
pub const SHARED_OWNER: &str = "anchor";

const HEARTBEAT_EXT: &str = "hb";

/// Session unique identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Suid(String);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid session id '{0}': expected 1-16 characters of [A-Za-z0-9_-], other than 'anchor'")]
pub struct InvalidSuid(pub String);

impl Suid {
    /// Generate a fresh id from a v4 UUID.
    pub fn generate() -> Self {
        let hex = Uuid::new_v4().simple().to_string();
        Self(hex[..SUID_LEN].to_string())
    }

    /// Validate an externally supplied id.
    pub fn parse(s: &str) -> Option<Self> {
        let valid = !s.is_empty()
            && s.len() <= SUID_MAX_LEN
            && s
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        valid.then(|| Self(s.to_string()))
    }

    /// The owner of shared rules.
    pub fn shared() -> Self {
        Self(SHARED_OWNER.to_string())
    }

    pub fn is_shared(&self) -> bool {
        self.0 == SHARED_OWNER
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Suid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Suid {
    type Err = InvalidSuid;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
            .filter(|suid| !suid.is_shared())
            .ok_or_else(|| InvalidSuid(s.to_string()))
    }
}

/// A live orchestrator session.
#[derive(Debug, Clone)]
pub struct Session {
    suid: Suid,
    created_at: DateTime<Utc>,
    heartbeat_path: PathBuf,
}

impl Session {
    pub fn suid(&self) -> &Suid {
        &self.suid
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn heartbeat_path(&self) -> &Path {
        &self.heartbeat_path
    }
}

/// Directory of heartbeat files shared by every session on the host.
#[derive(Debug, Clone)]
pub struct HeartbeatStore {
    dir: PathBuf,
}

impl HeartbeatStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn heartbeat_path(&self, suid: &Suid) -> PathBuf {
        self.dir.join(format!("{}.{}", suid, HEARTBEAT_EXT))
    }

    /// Issue a new session and write its first heartbeat.
    pub fn start_session(&self) -> Session {
        self.start_session_with(Suid::generate())
    }

    /// Issue a session with a caller-chosen id.
    pub fn start_session_with(&self, suid: Suid) -> Session {
        let session = Session {
            heartbeat_path: self.heartbeat_path(&suid),
            suid,
            created_at: Utc::now(),
        };

        if let Err(e) = std::fs::create_dir_all(&self.dir) {
            warn!(
                "Cannot create heartbeat directory {}: {}",
                self.dir.display(),
                e
            );
        }
        self.refresh_heartbeat(&session);
        info!("Session {} started", session.suid);
        session
    }

    /// Rewrite the heartbeat with the current time. Failures are logged and
    /// reported as `false`; they never abort the caller.
    pub fn refresh_heartbeat(&self, session: &Session) -> bool {
        self.refresh_heartbeat_at(session, Utc::now())
    }

    pub fn refresh_heartbeat_at(&self, session: &Session, at: DateTime<Utc>) -> bool {
        match std::fs::write(&session.heartbeat_path, at.timestamp().to_string()) {
            Ok(()) => {
                debug!("Heartbeat refreshed for {}", session.suid);
                true
            }
            Err(e) => {
                warn!(
                    "Failed to write heartbeat {}: {}",
                    session.heartbeat_path.display(),
                    e
                );
                false
            }
        }
    }

    /// Delete the heartbeat file. A missing file is not an error.
    pub fn end_session(&self, session: Session) -> bool {
        let removed = self.forget(&session.suid);
        if removed {
            info!("Session {} ended", session.suid);
        }
        removed
    }

    /// Drop the heartbeat of any session, live or not.
    pub fn forget(&self, suid: &Suid) -> bool {
        let path = self.heartbeat_path(suid);
        match std::fs::remove_file(&path) {
            Ok(()) => true,
            Err(e) if e.kind() == ErrorKind::NotFound => true,
            Err(e) => {
                warn!("Failed to remove heartbeat {}: {}", path.display(), e);
                false
            }
        }
    }

    /// Time of the last heartbeat: file content, falling back to mtime.
    pub fn last_heartbeat(&self, suid: &Suid) -> Option<DateTime<Utc>> {
        let path = self.heartbeat_path(suid);

        if let Ok(content) = std::fs::read_to_string(&path) {
            if let Some(ts) = content
                .trim()
                .parse::<i64>()
                .ok()
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            {
                return Some(ts);
            }
        }

        std::fs::metadata(&path)
            .and_then(|m| m.modified())
            .ok()
            .map(DateTime::<Utc>::from)
    }

    /// A session is stale iff its heartbeat is missing, unreadable, or
    /// older than `threshold` at `now`.
    pub fn is_stale(&self, suid: &Suid, now: DateTime<Utc>, threshold: Duration) -> bool {
        match self.last_heartbeat(suid) {
            None => true,
            Some(last) => {
                let age = now.timestamp() - last.timestamp();
                let limit = i64::try_from(threshold.as_secs()).unwrap_or(i64::MAX);
                age > limit
            }
        }
    }

    /// Every SUID with a heartbeat file in the store.
    pub fn known_sessions(&self) -> Vec<Suid> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("Cannot read heartbeat dir {}: {}", self.dir.display(), e);
                return Vec::new();
            }
        };

        let mut suids: Vec<Suid> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().and_then(|e| e.to_str()) == Some(HEARTBEAT_EXT))
            .filter_map(|path| {
                path.file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(Suid::parse)
            })
            .collect();
        suids.sort();
        suids
    }

    /// Delete heartbeat files of stale sessions. Returns how many went.
    pub fn sweep_stale(&self, now: DateTime<Utc>, threshold: Duration) -> usize {
        let mut swept = 0;
        for suid in self.known_sessions() {
            if !self.is_stale(&suid, now, threshold) {
                continue;
            }
            match std::fs::remove_file(self.heartbeat_path(&suid)) {
                Ok(()) => {
                    info!("Removed stale heartbeat for session {}", suid);
                    swept += 1;
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove stale heartbeat for {}: {}", suid, e),
            }
        }
        swept
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use tempfile::TempDir;

    fn store() -> (TempDir, HeartbeatStore) {
        let dir = TempDir::new().unwrap();
        let store = HeartbeatStore::new(dir.path());
        (dir, store)
    }

    #[test]
    fn test_generated_suid_shape() {
        let suid = Suid::generate();
        assert_eq!(suid.as_str().len(), SUID_LEN);
        assert!(suid.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(suid, Suid::generate());
    }

    #[test]
    fn test_suid_validation() {
        assert!(Suid::parse("abc123").is_some());
        assert!(Suid::parse("lab_run-2").is_some());
        assert!(Suid::parse("").is_none());
        assert!(Suid::parse("a:b").is_none());
        assert!(Suid::parse("has space").is_none());
        assert!(Suid::parse("x".repeat(SUID_MAX_LEN + 1).as_str()).is_none());
        assert!("bad/id".parse::<Suid>().is_err());
    }

    #[test]
    fn test_shared_owner_is_reserved() {
        assert!(Suid::shared().is_shared());
        assert!(!Suid::parse("abc123").unwrap().is_shared());
        // rule tags still carry it
        assert_eq!(Suid::parse(SHARED_OWNER), Some(Suid::shared()));
        assert!(SHARED_OWNER.parse::<Suid>().is_err());
    }

    #[test]
    fn test_start_and_end_session() {
        let (_dir, store) = store();
        let session = store.start_session_with(Suid::parse("abc123").unwrap());

        assert!(session.heartbeat_path().exists());
        assert_eq!(store.known_sessions(), vec![Suid::parse("abc123").unwrap()]);

        let path = session.heartbeat_path().to_path_buf();
        assert!(store.end_session(session));
        assert!(!path.exists());
    }

    #[test]
    fn test_end_session_missing_file_is_ok() {
        let (_dir, store) = store();
        let session = store.start_session();
        std::fs::remove_file(session.heartbeat_path()).unwrap();
        assert!(store.end_session(session));
    }

    #[test]
    fn test_staleness_threshold_boundary() {
        let (_dir, store) = store();
        let session = store.start_session();
        let t = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        assert!(store.refresh_heartbeat_at(&session, t));

        let delta = Duration::from_secs(3600);
        let just_before = t + ChronoDuration::seconds(3599);
        let just_after = t + ChronoDuration::seconds(3601);

        assert!(!store.is_stale(session.suid(), just_before, delta));
        assert!(store.is_stale(session.suid(), just_after, delta));
    }

    #[test]
    fn test_missing_heartbeat_is_stale() {
        let (_dir, store) = store();
        let ghost = Suid::parse("ghost").unwrap();
        assert!(store.is_stale(&ghost, Utc::now(), Duration::from_secs(3600)));
    }

    #[test]
    fn test_garbage_content_falls_back_to_mtime() {
        let (_dir, store) = store();
        let session = store.start_session();
        std::fs::write(session.heartbeat_path(), "not a timestamp").unwrap();

        // mtime is "now", so the session is fresh
        assert!(!store.is_stale(session.suid(), Utc::now(), Duration::from_secs(60)));
    }

    #[test]
    fn test_sweep_stale_keeps_fresh_sessions() {
        let (_dir, store) = store();
        let now = Utc::now();

        let old = store.start_session_with(Suid::parse("old").unwrap());
        store.refresh_heartbeat_at(&old, now - ChronoDuration::hours(2));
        let live = store.start_session_with(Suid::parse("live").unwrap());
        store.refresh_heartbeat_at(&live, now);

        let swept = store.sweep_stale(now, Duration::from_secs(3600));
        assert_eq!(swept, 1);
        assert!(!old.heartbeat_path().exists());
        assert!(live.heartbeat_path().exists());
        assert_eq!(store.sweep_stale(now, Duration::from_secs(3600)), 0);
    }

    #[test]
    fn test_unwritable_dir_degrades_to_stale() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "x").unwrap();
        let store = HeartbeatStore::new(blocker.join("nested"));

        let session = store.start_session();
        assert!(!store.refresh_heartbeat(&session));
        assert!(store.is_stale(session.suid(), Utc::now(), Duration::from_secs(3600)));
    }
}
