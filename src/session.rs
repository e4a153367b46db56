//! Session state store.
//!
//! One directory per session under the state root, keyed by bus type, model,
//! serial and start timestamp. The directory holds the phase record
//! (`session.json`), the initial/final/rolling snapshots and the audit log.
//! The phase record is rewritten atomically on every transition so a crash
//! leaves the last-written phase as ground truth for resume.

use crate::probe::{DeviceHandle, DeviceSnapshot};
use crate::{TestError, TestResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Default location for persisted sessions.
pub const DEFAULT_STATE_ROOT: &str = "/var/lib/burnin";

const SESSION_FILE: &str = "session.json";

/// Ordered workflow phases. Resuming from phase P re-executes P through
/// `Completed`; the ordering derives let callers assert "never backward".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Init,
    SmartShortTest,
    Badblocks,
    SmartLongTest,
    Compare,
    Completed,
}

impl Phase {
    /// The phase that follows this one, or `None` at the terminal phase.
    pub fn next(self) -> Option<Phase> {
        match self {
            Phase::Init => Some(Phase::SmartShortTest),
            Phase::SmartShortTest => Some(Phase::Badblocks),
            Phase::Badblocks => Some(Phase::SmartLongTest),
            Phase::SmartLongTest => Some(Phase::Compare),
            Phase::Compare => Some(Phase::Completed),
            Phase::Completed => None,
        }
    }

    /// The ordered suffix executed when entering at this phase.
    pub fn suffix(self) -> Vec<Phase> {
        let mut phases = Vec::new();
        let mut cursor = Some(self);
        while let Some(phase) = cursor {
            phases.push(phase);
            cursor = phase.next();
        }
        phases
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Init => "init",
            Phase::SmartShortTest => "smart_short_test",
            Phase::Badblocks => "badblocks",
            Phase::SmartLongTest => "smart_long_test",
            Phase::Compare => "compare",
            Phase::Completed => "completed",
        };
        write!(f, "{}", name)
    }
}

/// Persisted record of a single workflow: device identity, current phase,
/// session start and last-update timestamps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionState {
    pub device: DeviceHandle,
    pub phase: Phase,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionState {
    pub fn new(device: DeviceHandle) -> Self {
        let now = Utc::now();
        Self {
            device,
            phase: Phase::Init,
            started_at: now,
            updated_at: now,
        }
    }

    /// Move to a new phase, refreshing the last-update timestamp.
    pub fn advance(&mut self, phase: Phase) {
        self.phase = phase;
        self.updated_at = Utc::now();
    }
}

/// Which persisted snapshot slot to read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotSlot {
    Initial,
    Final,
    Current,
}

impl SnapshotSlot {
    fn file_name(self) -> &'static str {
        match self {
            SnapshotSlot::Initial => "snapshot-initial.json",
            SnapshotSlot::Final => "snapshot-final.json",
            SnapshotSlot::Current => "snapshot-current.json",
        }
    }
}

/// On-disk store for one session directory.
#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    /// Create a fresh session directory for a device.
    ///
    /// The directory key has second resolution, so a session started within
    /// the same second as a prior one for the same device would land on the
    /// prior directory; a numeric suffix keeps every session in its own.
    pub fn create(state_root: &Path, state: &SessionState) -> TestResult<Self> {
        let base = session_dir_name(state);
        let mut dir = state_root.join(&base);
        let mut suffix = 1u32;
        while dir.join(SESSION_FILE).exists() {
            suffix += 1;
            dir = state_root.join(format!("{}-{}", base, suffix));
        }
        fs::create_dir_all(&dir)?;
        let store = Self { dir };
        store.save(state)?;
        Ok(store)
    }

    /// Open an existing session directory (resume path).
    pub fn open(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn snapshot_path(&self, slot: SnapshotSlot) -> PathBuf {
        self.dir.join(slot.file_name())
    }

    /// Persist the session state record atomically.
    ///
    /// `Completed` is terminal: once the on-disk record says so, any further
    /// write for the same session is a bug and is rejected.
    pub fn save(&self, state: &SessionState) -> TestResult<()> {
        let path = self.dir.join(SESSION_FILE);

        if let Some(existing) = read_state(&path) {
            if existing.phase == Phase::Completed {
                return Err(TestError::State(format!(
                    "session in {} is already completed",
                    self.dir.display()
                )));
            }
        }

        write_json_atomic(&path, state).map_err(TestError::Io)
    }

    /// Load the state record from this directory, silently treating a
    /// missing or corrupt file as absent.
    pub fn load(&self) -> Option<SessionState> {
        read_state(&self.dir.join(SESSION_FILE))
    }

    pub fn write_snapshot(&self, slot: SnapshotSlot, snapshot: &DeviceSnapshot) -> TestResult<()> {
        write_json_atomic(&self.snapshot_path(slot), snapshot).map_err(TestError::Io)
    }

    pub fn read_snapshot(&self, slot: SnapshotSlot) -> TestResult<DeviceSnapshot> {
        let path = self.snapshot_path(slot);
        let data = fs::read_to_string(&path)?;
        serde_json::from_str(&data).map_err(|e| {
            TestError::State(format!("corrupt snapshot {}: {}", path.display(), e))
        })
    }

    /// Scan all session directories under the state root for the most recent
    /// incomplete session targeting the given device path.
    ///
    /// Corruption of historical sessions must never block a new session, so
    /// unreadable entries are skipped without comment.
    pub fn load_incomplete(state_root: &Path, device_path: &str) -> Option<(SessionState, Self)> {
        let entries = fs::read_dir(state_root).ok()?;

        let mut best: Option<(SessionState, Self)> = None;
        for entry in entries.flatten() {
            let dir = entry.path();
            if !dir.is_dir() {
                continue;
            }
            let store = Self::open(dir);
            let Some(state) = store.load() else { continue };
            if state.phase == Phase::Completed || state.device.path != device_path {
                continue;
            }
            match &best {
                Some((current, _)) if current.updated_at >= state.updated_at => {}
                _ => best = Some((state, store)),
            }
        }

        best
    }
}

fn read_state(path: &Path) -> Option<SessionState> {
    let data = fs::read_to_string(path).ok()?;
    serde_json::from_str(&data).ok()
}

fn session_dir_name(state: &SessionState) -> String {
    format!(
        "{}-{}-{}-{}",
        state.device.bus,
        sanitize(&state.device.model),
        sanitize(&state.device.serial),
        state.started_at.format("%Y%m%dT%H%M%SZ")
    )
}

fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Write a JSON value via write-to-temp-then-rename so a concurrent reader
/// never observes a half-written record.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let tmp = path.with_extension("json.tmp");
    let data = serde_json::to_vec_pretty(value)?;
    fs::write(&tmp, data)?;
    fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::BusType;
    use chrono::Duration;

    fn handle(path: &str) -> DeviceHandle {
        DeviceHandle {
            path: path.to_string(),
            bus: BusType::ATA,
            model: "WDC WD40EFRX".to_string(),
            serial: "WD-TEST123".to_string(),
        }
    }

    #[test]
    fn test_phase_order_and_suffix() {
        assert_eq!(Phase::Init.next(), Some(Phase::SmartShortTest));
        assert_eq!(Phase::Completed.next(), None);
        assert!(Phase::Init < Phase::Badblocks);
        assert!(Phase::Compare < Phase::Completed);

        assert_eq!(
            Phase::Badblocks.suffix(),
            vec![
                Phase::Badblocks,
                Phase::SmartLongTest,
                Phase::Compare,
                Phase::Completed,
            ],
            "resume from badblocks must execute exactly the suffix"
        );
        assert_eq!(Phase::Completed.suffix(), vec![Phase::Completed]);
    }

    #[test]
    fn test_phase_serde_snake_case() {
        assert_eq!(
            serde_json::to_string(&Phase::SmartShortTest).unwrap(),
            "\"smart_short_test\""
        );
        let parsed: Phase = serde_json::from_str("\"badblocks\"").unwrap();
        assert_eq!(parsed, Phase::Badblocks);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let root = tempfile::tempdir().unwrap();
        let state = SessionState::new(handle("/dev/sda"));
        let store = SessionStore::create(root.path(), &state).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded, state);
        assert!(store.dir().join(SESSION_FILE).exists());
        assert!(
            !store.dir().join("session.json.tmp").exists(),
            "temp file must be renamed away"
        );
    }

    #[test]
    fn test_advance_updates_phase_and_timestamp() {
        let mut state = SessionState::new(handle("/dev/sda"));
        let before = state.updated_at;
        state.advance(Phase::Badblocks);
        assert_eq!(state.phase, Phase::Badblocks);
        assert!(state.updated_at >= before);
    }

    #[test]
    fn test_completed_is_terminal() {
        let root = tempfile::tempdir().unwrap();
        let mut state = SessionState::new(handle("/dev/sda"));
        let store = SessionStore::create(root.path(), &state).unwrap();

        state.advance(Phase::Completed);
        store.save(&state).unwrap();

        // Any further write for the same session must be rejected.
        state.advance(Phase::Compare);
        let err = store.save(&state).unwrap_err();
        assert!(matches!(err, TestError::State(_)));
    }

    #[test]
    fn test_load_incomplete_picks_most_recent_matching() {
        let root = tempfile::tempdir().unwrap();

        let mut older = SessionState::new(handle("/dev/sda"));
        older.started_at = older.started_at - Duration::hours(4);
        older.updated_at = older.updated_at - Duration::hours(4);
        older.phase = Phase::SmartShortTest;
        SessionStore::create(root.path(), &older).unwrap();

        let mut newer = SessionState::new(handle("/dev/sda"));
        newer.phase = Phase::Badblocks;
        SessionStore::create(root.path(), &newer).unwrap();

        let (found, _) = SessionStore::load_incomplete(root.path(), "/dev/sda").unwrap();
        assert_eq!(found.phase, Phase::Badblocks);
    }

    #[test]
    fn test_load_incomplete_ignores_completed_and_other_devices() {
        let root = tempfile::tempdir().unwrap();

        let mut done = SessionState::new(handle("/dev/sda"));
        let done_store = SessionStore::create(root.path(), &done).unwrap();
        done.advance(Phase::Completed);
        done_store.save(&done).unwrap();

        let mut other = SessionState::new(handle("/dev/sdb"));
        other.phase = Phase::Badblocks;
        SessionStore::create(root.path(), &other).unwrap();

        assert!(
            SessionStore::load_incomplete(root.path(), "/dev/sda").is_none(),
            "completed sessions and other devices are not resume candidates"
        );
    }

    #[test]
    fn test_load_incomplete_skips_corrupt_records() {
        let root = tempfile::tempdir().unwrap();

        let corrupt_dir = root.path().join("ata-BROKEN-XYZ-20250101T000000Z");
        fs::create_dir_all(&corrupt_dir).unwrap();
        fs::write(corrupt_dir.join(SESSION_FILE), "{ not json").unwrap();

        let mut good = SessionState::new(handle("/dev/sda"));
        good.phase = Phase::SmartLongTest;
        SessionStore::create(root.path(), &good).unwrap();

        let (found, _) = SessionStore::load_incomplete(root.path(), "/dev/sda").unwrap();
        assert_eq!(found.phase, Phase::SmartLongTest);
    }

    #[test]
    fn test_load_incomplete_missing_root_is_none() {
        assert!(SessionStore::load_incomplete(
            Path::new("/nonexistent-burnin-state-root"),
            "/dev/sda"
        )
        .is_none());
    }

    #[test]
    fn test_create_within_same_second_gets_its_own_dir() {
        let root = tempfile::tempdir().unwrap();

        let mut first = SessionState::new(handle("/dev/sda"));
        let first_store = SessionStore::create(root.path(), &first).unwrap();
        first.advance(Phase::Completed);
        first_store.save(&first).unwrap();

        // Same device, same start second: must not reuse the completed
        // session's directory (whose record rejects further writes).
        let mut second = SessionState::new(handle("/dev/sda"));
        second.started_at = first.started_at;
        let second_store = SessionStore::create(root.path(), &second).unwrap();

        assert_ne!(second_store.dir(), first_store.dir());
        assert_eq!(second_store.load().unwrap().phase, Phase::Init);
        assert_eq!(first_store.load().unwrap().phase, Phase::Completed);
    }

    #[test]
    fn test_session_dir_name_is_sanitized() {
        let mut state = SessionState::new(handle("/dev/sda"));
        state.device.model = "WDC WD40/EFRX".to_string();
        let name = session_dir_name(&state);
        assert!(name.starts_with("ata-WDC_WD40_EFRX-WD_TEST123-"));
        assert!(!name.contains('/'));
    }
}
