//! Test orchestrator: drives the ordered phase sequence, decides resume vs.
//! fresh start, and records every transition in the session store before the
//! phase's work begins — a crash mid-phase therefore resumes by re-running
//! that same phase from its start. The external tools are trusted to make
//! each phase idempotent (re-running badblocks on an already-wiped device is
//! safe; re-initiating a self-test replaces any stale one).

use crate::audit::AuditLog;
use crate::compare::{compare_snapshots, ComparisonReport};
use crate::devices;
use crate::poller::{
    await_self_test, PollOutcome, PollPlan, DEFAULT_EXTENDED_ESTIMATE_MIN,
    DEFAULT_SHORT_ESTIMATE_MIN,
};
use crate::probe::{DeviceHandle, SelfTestKind, SmartProbe};
use crate::session::{Phase, SessionState, SessionStore, SnapshotSlot};
use crate::{TestError, TestResult};
use colored::Colorize;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

/// Settle delay after aborting a stale in-progress self-test.
const ABORT_SETTLE: Duration = Duration::from_secs(5);

/// Operator-interaction policy, passed explicitly into the orchestrator
/// rather than checked ad hoc at each decision point.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunPolicy {
    /// Fully unattended mode: auto-confirm the destructive-action gate and
    /// default the resume decision to a fresh start.
    pub auto_confirm: bool,
    /// Explicit opt-in to resuming an incomplete session without prompting.
    pub resume: bool,
}

/// How a run ended from the operator's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed { any_regression: bool },
    Cancelled,
}

/// Resume decision for an existing incomplete session.
///
/// Resuming a destructive workflow must be an explicit choice: unattended
/// runs default to a fresh start rather than continuing a state whose
/// integrity cannot be re-verified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResumeDecision {
    Resume,
    AskOperator,
    StartFresh,
}

pub(crate) fn decide_resume(policy: RunPolicy) -> ResumeDecision {
    if policy.resume {
        ResumeDecision::Resume
    } else if policy.auto_confirm {
        ResumeDecision::StartFresh
    } else {
        ResumeDecision::AskOperator
    }
}

pub(crate) fn is_seagate(model: &str) -> bool {
    let upper = model.to_uppercase();
    upper.contains("SEAGATE") || upper.starts_with("ST")
}

/// One end-to-end acceptance test against one device. All state is carried
/// here; there are no ambient globals.
pub struct AcceptanceTest {
    policy: RunPolicy,
    store: SessionStore,
    state: SessionState,
    probe: SmartProbe,
    audit: AuditLog,
}

impl AcceptanceTest {
    /// Set up a session: resume an incomplete one for this device if the
    /// operator agrees, otherwise create a fresh session directory.
    pub fn begin(state_root: &Path, device: DeviceHandle, policy: RunPolicy) -> TestResult<Self> {
        let (store, state) = match SessionStore::load_incomplete(state_root, &device.path) {
            Some((prev, prev_store)) => match decide_resume(policy) {
                ResumeDecision::Resume => {
                    println!(
                        "Resuming incomplete session at phase '{}' (started {}).",
                        prev.phase, prev.started_at
                    );
                    (prev_store, prev)
                }
                ResumeDecision::StartFresh => {
                    println!(
                        "ℹ️  Incomplete session found (phase '{}', started {}), but unattended \
                         mode starts fresh.",
                        prev.phase, prev.started_at
                    );
                    fresh_session(state_root, &device)?
                }
                ResumeDecision::AskOperator => {
                    println!(
                        "Found an incomplete session for {} at phase '{}' (started {}).",
                        device.path, prev.phase, prev.started_at
                    );
                    if confirm("Resume it")? {
                        (prev_store, prev)
                    } else {
                        fresh_session(state_root, &device)?
                    }
                }
            },
            None => fresh_session(state_root, &device)?,
        };

        let audit = AuditLog::new(store.dir());
        let probe = SmartProbe::new(state.device.clone(), audit.clone())
            .with_rolling_snapshot(store.snapshot_path(SnapshotSlot::Current));

        audit.note(&format!(
            "session ready: device {} ({} {}), phase '{}'",
            state.device.path, state.device.model, state.device.serial, state.phase
        ));

        Ok(Self {
            policy,
            store,
            state,
            probe,
            audit,
        })
    }

    pub fn session_dir(&self) -> &Path {
        self.store.dir()
    }

    /// Phase the run will enter (or re-enter) when executed.
    pub fn phase(&self) -> Phase {
        self.state.phase
    }

    /// Execute the phase sequence from the current phase through `completed`.
    pub async fn run(&mut self) -> TestResult<RunOutcome> {
        let resumed = self.state.phase != Phase::Init;

        println!();
        println!("=== Drive Acceptance Test ===");
        println!("Device:  {}", self.state.device.path);
        println!("Model:   {}", self.state.device.model);
        println!("Serial:  {}", self.state.device.serial);
        println!("Bus:     {}", self.state.device.bus);
        println!("Session: {}", self.store.dir().display());

        if resumed {
            println!(
                "Resuming at phase '{}' — earlier phases are not re-executed.",
                self.state.phase
            );
            self.audit
                .section(&format!("resumed at phase '{}'", self.state.phase));
        } else if !self.fresh_start_preamble()? {
            self.audit.note("operator declined destructive confirmation; cancelled");
            println!("Cancelled. Nothing was written to the device.");
            return Ok(RunOutcome::Cancelled);
        }

        let mut report: Option<ComparisonReport> = None;
        let mut phase = if resumed {
            self.state.phase
        } else {
            Phase::SmartShortTest
        };

        loop {
            self.enter_phase(phase)?;
            match phase {
                Phase::SmartShortTest => self.run_self_test_phase(SelfTestKind::Short).await?,
                Phase::Badblocks => self.run_surface_scan()?,
                Phase::SmartLongTest => self.run_self_test_phase(SelfTestKind::Long).await?,
                Phase::Compare => report = Some(self.run_compare()?),
                Phase::Completed => break,
                Phase::Init => unreachable!("init never enters the execution loop"),
            }
            phase = match phase.next() {
                Some(next) => next,
                None => break,
            };
        }

        let any_regression = report.as_ref().is_some_and(ComparisonReport::any_regression);
        self.audit.note(&format!(
            "session completed (any regression: {})",
            any_regression
        ));
        println!();
        println!("{}", "✅ Acceptance test completed.".green().bold());
        Ok(RunOutcome::Completed { any_regression })
    }

    /// Fresh-start sequencing: counterfeit advisory, initial health read with
    /// advisory warnings, then the destructive-action confirmation gate.
    /// Returns false when the operator declines.
    fn fresh_start_preamble(&mut self) -> TestResult<bool> {
        if is_seagate(&self.state.device.model) {
            println!();
            println!(
                "{}",
                "⚠️  Seagate drive: counterfeits with reset SMART counters circulate widely."
                    .yellow()
            );
            println!("   Cross-check the vendor FARM data against the SMART power-on hours");
            println!("   before trusting a clean result from this test.");
            self.audit.note("seagate counterfeit advisory shown");
        }

        println!();
        println!("Reading initial device health...");
        let initial = self.probe.snapshot()?;
        self.store.write_snapshot(SnapshotSlot::Initial, &initial)?;

        for (id, label) in [
            (5u8, "reallocated sectors"),
            (197u8, "pending sectors"),
            (198u8, "offline uncorrectable sectors"),
        ] {
            if let Some(raw) = initial.attribute_raw(id) {
                if raw > 0 {
                    println!(
                        "{}",
                        format!("⚠️  Pre-existing {}: {}", label, raw).yellow()
                    );
                    self.audit
                        .note(&format!("pre-existing {}: {}", label, raw));
                }
            }
        }
        println!(
            "Initial self-test log: {} tests recorded.",
            initial.self_test.tests_logged
        );

        println!();
        println!(
            "{}",
            "⚠️  DESTRUCTIVE TEST: every sector of the device will be overwritten."
                .red()
                .bold()
        );
        println!("   All data on {} will be irrecoverably lost.", self.state.device.path);

        if self.policy.auto_confirm {
            println!("   Auto-confirmed (--yes).");
            self.audit.note("destructive gate auto-confirmed (--yes)");
            return Ok(true);
        }

        print!("Type YES to proceed: ");
        io::stdout().flush()?;
        let mut input = String::new();
        io::stdin().read_line(&mut input)?;
        let confirmed = input.trim() == "YES";
        if confirmed {
            self.audit.note("destructive gate confirmed by operator");
        }
        Ok(confirmed)
    }

    /// Persist the new phase *before* doing its work, then announce it.
    fn enter_phase(&mut self, phase: Phase) -> TestResult<()> {
        self.state.advance(phase);
        self.store.save(&self.state)?;
        self.audit.section(&format!("phase: {}", phase));
        if phase != Phase::Completed {
            println!();
            println!("{}", format!("▶ phase: {}", phase).bold());
        }
        Ok(())
    }

    async fn run_self_test_phase(&mut self, kind: SelfTestKind) -> TestResult<()> {
        let snapshot = self.probe.snapshot()?;

        // Firmware may refuse to start a new test while one is running.
        if kind == SelfTestKind::Long && snapshot.self_test.is_in_progress() {
            println!("  A self-test is already in progress; aborting it first.");
            self.audit
                .note("stale self-test in progress; aborting before the extended test");
            self.probe.abort_self_test();
            tokio::time::sleep(ABORT_SETTLE).await;
        }

        let baseline = snapshot.self_test.tests_logged;
        let estimate_minutes = match kind {
            SelfTestKind::Short => snapshot
                .self_test
                .short_poll_minutes
                .unwrap_or(DEFAULT_SHORT_ESTIMATE_MIN),
            SelfTestKind::Long => snapshot
                .self_test
                .extended_poll_minutes
                .unwrap_or(DEFAULT_EXTENDED_ESTIMATE_MIN),
        };

        println!(
            "  Starting {} self-test (device estimate: {} min).",
            kind, estimate_minutes
        );
        self.probe.initiate_self_test(kind)?;

        let plan = PollPlan::for_kind(kind, estimate_minutes);
        match await_self_test(&mut self.probe, &self.audit, kind, &plan, baseline).await? {
            PollOutcome::Completed => {
                println!("  {}", format!("✅ {} self-test passed.", kind).green());
                Ok(())
            }
            PollOutcome::Failed(reason) => Err(TestError::SelfTestFailed(reason)),
            PollOutcome::TimedOut => Err(TestError::Timeout(format!(
                "{} self-test did not finish within {}; inspect {} for the raw record",
                kind,
                humantime::format_duration(plan.timeout),
                self.audit.path().display()
            ))),
        }
    }

    /// Destructive full-surface write/verify. The external tool's own
    /// pass/fail reporting is ground truth: its streamed output and exit
    /// status are logged verbatim, and the absence of bad-sector findings is
    /// success.
    fn run_surface_scan(&mut self) -> TestResult<()> {
        let block_size = devices::physical_sector_size(&self.state.device.path);
        println!(
            "  Running destructive surface scan (block size {} bytes). This takes hours.",
            block_size
        );
        self.audit.note(&format!(
            "$ badblocks -wsv -b {} {}",
            block_size, self.state.device.path
        ));

        let mut child = Command::new("badblocks")
            .args(["-w", "-s", "-v", "-b", &block_size.to_string()])
            .arg(&self.state.device.path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                TestError::SurfaceScanFailed(format!("failed to launch badblocks: {}", e))
            })?;

        // badblocks prints each bad block number on stdout; stream those into
        // the audit log as they appear. Progress/diagnostics go to stderr and
        // are drained on a helper thread to avoid pipe deadlock.
        let stderr_handle = child.stderr.take().map(|mut stderr| {
            std::thread::spawn(move || {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf);
                buf
            })
        });

        let mut bad_blocks_reported: u64 = 0;
        if let Some(stdout) = child.stdout.take() {
            for line in BufReader::new(stdout).lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                bad_blocks_reported += 1;
                println!("  {}", format!("bad block: {}", line.trim()).red());
                self.audit.raw_line(&format!("bad block: {}", line.trim()));
            }
        }

        let status = child.wait()?;
        let stderr_text = stderr_handle
            .and_then(|h| h.join().ok())
            .unwrap_or_default();
        for line in stderr_text.lines() {
            self.audit.raw_line(line);
        }
        self.audit
            .note(&format!("badblocks exit status: {}", status));

        let bad_blocks_found = parse_bad_block_count(&stderr_text).unwrap_or(0).max(bad_blocks_reported);

        if !status.success() {
            return Err(TestError::SurfaceScanFailed(format!(
                "badblocks exited with {}",
                status
            )));
        }
        if bad_blocks_found > 0 {
            return Err(TestError::SurfaceScanFailed(format!(
                "{} bad blocks found",
                bad_blocks_found
            )));
        }

        println!("  {}", "✅ Surface scan clean: 0 bad blocks found.".green());
        Ok(())
    }

    fn run_compare(&mut self) -> TestResult<ComparisonReport> {
        println!("  Taking final device snapshot...");
        let final_snapshot = self.probe.snapshot()?;
        self.store
            .write_snapshot(SnapshotSlot::Final, &final_snapshot)?;

        let initial = self.store.read_snapshot(SnapshotSlot::Initial)?;
        let report = compare_snapshots(&initial, &final_snapshot);

        println!();
        print!("{}", report.render());
        for line in report.render().lines() {
            self.audit.raw_line(line);
        }

        if report.any_regression() {
            println!(
                "{}",
                "⚠️  Health attributes regressed under load — do not deploy this drive."
                    .red()
                    .bold()
            );
            self.audit.note("comparison verdict: REGRESSED");
        } else {
            println!(
                "{}",
                "✅ Health attributes stable across the test.".green()
            );
            self.audit.note("comparison verdict: stable");
        }

        Ok(report)
    }
}

fn fresh_session(state_root: &Path, device: &DeviceHandle) -> TestResult<(SessionStore, SessionState)> {
    let state = SessionState::new(device.clone());
    let store = SessionStore::create(state_root, &state)?;
    Ok((store, state))
}

fn confirm(prompt: &str) -> io::Result<bool> {
    print!("{} [y/N]: ", prompt);
    io::stdout().flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case("y"))
}

fn parse_bad_block_count(stderr_text: &str) -> Option<u64> {
    let re = regex::Regex::new(r"(\d+)\s+bad blocks found").ok()?;
    re.captures(stderr_text)?
        .get(1)?
        .as_str()
        .parse::<u64>()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unattended_resume_defaults_to_fresh() {
        // Never silently resume a destructive workflow: --yes alone starts
        // fresh; resuming unattended needs the explicit opt-in.
        let unattended = RunPolicy {
            auto_confirm: true,
            resume: false,
        };
        assert_eq!(decide_resume(unattended), ResumeDecision::StartFresh);

        let interactive = RunPolicy::default();
        assert_eq!(decide_resume(interactive), ResumeDecision::AskOperator);

        let explicit = RunPolicy {
            auto_confirm: true,
            resume: true,
        };
        assert_eq!(decide_resume(explicit), ResumeDecision::Resume);
    }

    #[test]
    fn test_seagate_advisory_detection() {
        assert!(is_seagate("ST4000DM004-2CV104"));
        assert!(is_seagate("Seagate BarraCuda"));
        assert!(!is_seagate("WDC WD40EFRX-68N32N0"));
        assert!(!is_seagate("Samsung SSD 870 EVO"));
    }

    #[test]
    fn test_parse_bad_block_count() {
        let clean = "Pass completed, 0 bad blocks found. (0/0/0 errors)\n";
        assert_eq!(parse_bad_block_count(clean), Some(0));

        let dirty = "Pass completed, 17 bad blocks found. (5/9/3 errors)\n";
        assert_eq!(parse_bad_block_count(dirty), Some(17));

        assert_eq!(parse_bad_block_count("no summary line"), None);
    }
}
