//! Device probe adapter.
//!
//! Wraps the external diagnostic tool (`smartctl`) behind a structured
//! snapshot interface. The adapter always prefers the machine-parseable
//! `--json` output and falls back to textual pattern matching per field when
//! the structured dump is missing something — the two representations are not
//! always in sync on real hardware, so both paths must stay alive.

pub mod parse;

use crate::audit::AuditLog;
use crate::{ProbeError, ProbeResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::process::{Command, Output};
use std::time::Duration;

/// Self-test execution status codes, per the ATA convention smartctl reports.
///
/// 0 is idle, [1, 8] is the defined failure range, [240, 255] means a test is
/// in progress (low nibble encodes tenths remaining). smartctl follows this
/// convention for ATA devices; NVMe status is normalized into the same range
/// by the JSON parser.
pub const STATUS_IDLE: u8 = 0;
pub const STATUS_FAILURE_MIN: u8 = 1;
pub const STATUS_FAILURE_MAX: u8 = 8;
pub const STATUS_IN_PROGRESS_MIN: u8 = 240;

/// Delay between aborting a stale self-test and reissuing the start command.
const RETRY_SETTLE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusType {
    ATA,
    NVMe,
    Unknown,
}

impl fmt::Display for BusType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusType::ATA => write!(f, "ata"),
            BusType::NVMe => write!(f, "nvme"),
            BusType::Unknown => write!(f, "unknown"),
        }
    }
}

/// Identity of the device under test. Immutable once a session starts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceHandle {
    pub path: String,
    pub bus: BusType,
    pub model: String,
    pub serial: String,
}

impl DeviceHandle {
    /// Identify a device by querying the diagnostic tool once.
    ///
    /// Runs before any session directory exists, so the raw output goes to
    /// the diagnostic log rather than a session audit file.
    pub fn identify(device_path: &str) -> ProbeResult<Self> {
        let output = Command::new("smartctl")
            .args(["-i", "--json=c", device_path])
            .output()
            .map_err(|e| ProbeError::Launch(format!("smartctl: {}", e)))?;

        log::debug!(
            "smartctl -i --json=c {} -> {}",
            device_path,
            String::from_utf8_lossy(&output.stdout)
        );

        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.trim().is_empty() {
            return Err(ProbeError::DeviceUnavailable(format!(
                "smartctl produced no output for {}",
                device_path
            )));
        }

        let identity = parse::parse_identity(&stdout)?;
        let bus = match identity.protocol.as_deref() {
            Some(p) if p.eq_ignore_ascii_case("nvme") => BusType::NVMe,
            Some(p) if p.eq_ignore_ascii_case("ata") => BusType::ATA,
            _ if device_path.contains("nvme") => BusType::NVMe,
            Some(_) => BusType::Unknown,
            None => BusType::Unknown,
        };

        Ok(Self {
            path: device_path.to_string(),
            bus,
            model: identity.model.unwrap_or_else(|| "Unknown".to_string()),
            serial: identity.serial.unwrap_or_else(|| "Unknown".to_string()),
        })
    }
}

/// One vendor-reported health attribute.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SmartAttribute {
    pub id: u8,
    pub name: String,
    pub raw: u64,
}

/// Self-test subsystem status extracted from a snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SelfTestStatus {
    /// Raw execution status code (see the range constants above).
    pub status_code: u8,
    /// Device-reported percent remaining; only meaningful while in progress.
    pub percent_remaining: u8,
    /// Number of self-tests recorded in the device's self-test log.
    pub tests_logged: u64,
    /// Declared type of the most recent log entry (1 = short, 2 = extended).
    pub last_kind: Option<u8>,
    /// Pass flag of the most recent log entry.
    pub last_passed: Option<bool>,
    /// Device estimate for a short test, minutes.
    pub short_poll_minutes: Option<u64>,
    /// Device estimate for an extended test, minutes.
    pub extended_poll_minutes: Option<u64>,
}

impl SelfTestStatus {
    pub fn is_idle(&self) -> bool {
        self.status_code == STATUS_IDLE
    }

    pub fn is_in_progress(&self) -> bool {
        self.status_code >= STATUS_IN_PROGRESS_MIN
    }

    pub fn is_failure(&self) -> bool {
        (STATUS_FAILURE_MIN..=STATUS_FAILURE_MAX).contains(&self.status_code)
    }
}

/// Point-in-time structured capture of the device's diagnostic state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub taken_at: DateTime<Utc>,
    pub attributes: BTreeMap<u8, SmartAttribute>,
    pub self_test: SelfTestStatus,
}

impl DeviceSnapshot {
    pub fn attribute_raw(&self, id: u8) -> Option<u64> {
        self.attributes.get(&id).map(|a| a.raw)
    }
}

/// Which self-test routine to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelfTestKind {
    Short,
    Long,
}

impl SelfTestKind {
    /// Type code the device writes into its self-test log.
    pub fn log_code(self) -> u8 {
        match self {
            SelfTestKind::Short => 1,
            SelfTestKind::Long => 2,
        }
    }

    /// Argument accepted by `smartctl -t`.
    pub fn smartctl_arg(self) -> &'static str {
        match self {
            SelfTestKind::Short => "short",
            SelfTestKind::Long => "long",
        }
    }
}

impl fmt::Display for SelfTestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelfTestKind::Short => write!(f, "short"),
            SelfTestKind::Long => write!(f, "extended"),
        }
    }
}

/// Probe adapter bound to one device and one audit log.
pub struct SmartProbe {
    device: DeviceHandle,
    audit: AuditLog,
    /// Where to drop the most recent in-progress snapshot, overwritten on
    /// every probe so an external observer can watch a live run.
    rolling_snapshot: Option<PathBuf>,
}

impl SmartProbe {
    pub fn new(device: DeviceHandle, audit: AuditLog) -> Self {
        Self {
            device,
            audit,
            rolling_snapshot: None,
        }
    }

    pub fn with_rolling_snapshot(mut self, path: PathBuf) -> Self {
        self.rolling_snapshot = Some(path);
        self
    }

    pub fn device(&self) -> &DeviceHandle {
        &self.device
    }

    fn run_smartctl(&self, args: &[&str]) -> ProbeResult<Output> {
        let output = Command::new("smartctl")
            .args(args)
            .arg(&self.device.path)
            .output()
            .map_err(|e| ProbeError::Launch(format!("smartctl: {}", e)))?;

        self.audit.command(
            &format!("smartctl {} {}", args.join(" "), self.device.path),
            &output,
        );

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("Permission denied") {
                return Err(ProbeError::DeviceUnavailable(
                    "insufficient permissions for smartctl".to_string(),
                ));
            }
        }

        Ok(output)
    }

    /// Take a full structured snapshot of the device's diagnostic state.
    ///
    /// Prefers the JSON dump; any required field the JSON does not carry is
    /// filled from textual output of the matching legacy command. Only gives
    /// up when neither representation yields the self-test status.
    pub fn snapshot(&self) -> ProbeResult<DeviceSnapshot> {
        let output = self.run_smartctl(&["-x", "--json=c"])?;
        let stdout = String::from_utf8_lossy(&output.stdout);

        if stdout.trim().is_empty() {
            return Err(ProbeError::DeviceUnavailable(format!(
                "smartctl produced no output for {}",
                self.device.path
            )));
        }

        let structured = parse::parse_json_snapshot(&stdout).unwrap_or_default();

        let attributes = match structured.attributes {
            Some(table) if !table.is_empty() => table,
            _ => {
                let text = self.run_smartctl(&["-A"])?;
                parse::parse_text_attributes(&String::from_utf8_lossy(&text.stdout))
            }
        };

        let mut self_test = structured.self_test;
        if self_test.status_code.is_none() || self_test.percent_remaining.is_none() {
            let text = self.run_smartctl(&["-c"])?;
            let (code, remaining) =
                parse::parse_text_execution_status(&String::from_utf8_lossy(&text.stdout));
            if self_test.status_code.is_none() {
                self_test.status_code = code;
            }
            if self_test.percent_remaining.is_none() {
                self_test.percent_remaining = remaining;
            }
        }
        if self_test.tests_logged.is_none() || self_test.last_kind.is_none() {
            let text = self.run_smartctl(&["-l", "selftest"])?;
            let log = parse::parse_text_selftest_log(&String::from_utf8_lossy(&text.stdout));
            if self_test.tests_logged.is_none() {
                self_test.tests_logged = Some(log.count);
            }
            if self_test.last_kind.is_none() {
                self_test.last_kind = log.last_kind;
                self_test.last_passed = log.last_passed;
            }
        }

        let status_code = self_test.status_code.ok_or_else(|| {
            ProbeError::Unparseable(
                "self-test execution status missing from both JSON and textual output".to_string(),
            )
        })?;

        let snapshot = DeviceSnapshot {
            taken_at: Utc::now(),
            attributes,
            self_test: SelfTestStatus {
                status_code,
                percent_remaining: self_test.percent_remaining.unwrap_or(100),
                tests_logged: self_test.tests_logged.unwrap_or(0),
                last_kind: self_test.last_kind,
                last_passed: self_test.last_passed,
                short_poll_minutes: self_test.short_poll_minutes,
                extended_poll_minutes: self_test.extended_poll_minutes,
            },
        };

        if let Some(path) = &self.rolling_snapshot {
            if let Err(e) = crate::session::write_json_atomic(path, &snapshot) {
                log::warn!("failed to write rolling snapshot: {}", e);
            }
        }

        Ok(snapshot)
    }

    /// Start a device self-test.
    ///
    /// On launch failure retries exactly once: abort whatever the firmware
    /// thinks is running, wait a settle delay, reissue. The abort itself is
    /// best-effort and allowed to fail.
    pub fn initiate_self_test(&self, kind: SelfTestKind) -> ProbeResult<()> {
        match self.try_initiate(kind) {
            Ok(()) => Ok(()),
            Err(first) => {
                self.audit.note(&format!(
                    "{} self-test start failed ({}); aborting stale test and retrying once",
                    kind, first
                ));
                self.abort_self_test();
                std::thread::sleep(RETRY_SETTLE);
                self.try_initiate(kind)
            }
        }
    }

    fn try_initiate(&self, kind: SelfTestKind) -> ProbeResult<()> {
        let output = self.run_smartctl(&["-t", kind.smartctl_arg()])?;
        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            Err(ProbeError::CommandFailed(format!(
                "smartctl -t {} exited with {}: {}",
                kind.smartctl_arg(),
                output.status,
                if stderr.trim().is_empty() {
                    stdout.trim()
                } else {
                    stderr.trim()
                }
            )))
        }
    }

    /// Abort any in-progress self-test. Best-effort cleanup; failures are
    /// logged and swallowed.
    pub fn abort_self_test(&self) {
        match self.run_smartctl(&["-X"]) {
            Ok(output) if !output.status.success() => {
                self.audit
                    .note(&format!("self-test abort exited with {}", output.status));
            }
            Ok(_) => {}
            Err(e) => self.audit.note(&format!("self-test abort failed: {}", e)),
        }
    }
}

impl crate::poller::SelfTestProbe for SmartProbe {
    fn poll_status(&mut self) -> ProbeResult<SelfTestStatus> {
        self.snapshot().map(|snapshot| snapshot.self_test)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_ranges() {
        let mut status = SelfTestStatus::default();
        assert!(status.is_idle());
        assert!(!status.is_failure());
        assert!(!status.is_in_progress());

        for code in 1..=8u8 {
            status.status_code = code;
            assert!(status.is_failure(), "code {} is in the failure range", code);
            assert!(!status.is_in_progress());
        }

        // 9..=239 are reserved/other: neither idle, failure, nor in progress
        status.status_code = 9;
        assert!(!status.is_failure());
        assert!(!status.is_in_progress());

        status.status_code = 240;
        assert!(status.is_in_progress());
        status.status_code = 249;
        assert!(status.is_in_progress());
        status.status_code = 255;
        assert!(status.is_in_progress());
    }

    #[test]
    fn test_self_test_kind_log_codes() {
        assert_eq!(SelfTestKind::Short.log_code(), 1);
        assert_eq!(SelfTestKind::Long.log_code(), 2);
        assert_eq!(SelfTestKind::Short.smartctl_arg(), "short");
        assert_eq!(SelfTestKind::Long.smartctl_arg(), "long");
    }

    #[test]
    fn test_bus_type_display_matches_serde() {
        assert_eq!(BusType::ATA.to_string(), "ata");
        assert_eq!(BusType::NVMe.to_string(), "nvme");
        assert_eq!(BusType::Unknown.to_string(), "unknown");
    }
}
