//! Progress poller for asynchronous device self-tests.
//!
//! A fixed-interval poll loop around the probe adapter. Completion is a
//! composite judgment: an idle status code alone is ambiguous (it is also the
//! status before the test starts, or after a raced operation), so the poller
//! additionally requires the self-test count to have grown, the newest log
//! entry to carry the right type code, and its pass flag to be set.

use crate::audit::AuditLog;
use crate::probe::{SelfTestKind, SelfTestStatus, STATUS_IDLE};
use crate::ProbeResult;
use std::time::{Duration, Instant};

/// Short tests poll often; long tests back off so a multi-hour run does not
/// flood the device with queries.
pub const SHORT_POLL_INTERVAL: Duration = Duration::from_secs(10);
pub const LONG_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Floor for the short-test timeout. Device estimates for short tests are
/// small enough that 2x the estimate would cut healthy drives off.
pub const SHORT_TIMEOUT_FLOOR: Duration = Duration::from_secs(600);

/// Fallback duration estimates (minutes) when the device reports none.
pub const DEFAULT_SHORT_ESTIMATE_MIN: u64 = 2;
pub const DEFAULT_EXTENDED_ESTIMATE_MIN: u64 = 120;

/// Seam between the poll loop and the probe adapter so the loop is testable
/// without hardware.
pub trait SelfTestProbe {
    fn poll_status(&mut self) -> ProbeResult<SelfTestStatus>;
}

/// Terminal outcome of one awaited self-test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Completed,
    Failed(String),
    TimedOut,
}

/// Poll cadence, deadline, and the device's own duration estimate for one
/// awaited operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPlan {
    pub interval: Duration,
    pub timeout: Duration,
    pub estimate: Duration,
}

impl PollPlan {
    pub fn for_kind(kind: SelfTestKind, estimate_minutes: u64) -> Self {
        Self {
            interval: poll_interval(kind),
            timeout: timeout_for(kind, estimate_minutes),
            estimate: Duration::from_secs(estimate_minutes.saturating_mul(60)),
        }
    }
}

pub fn poll_interval(kind: SelfTestKind) -> Duration {
    match kind {
        SelfTestKind::Short => SHORT_POLL_INTERVAL,
        SelfTestKind::Long => LONG_POLL_INTERVAL,
    }
}

/// Timeout policy: short operations get `max(10 minutes, 2x estimate)`;
/// long operations get `2x estimate` with no floor (estimates are already
/// large).
pub fn timeout_for(kind: SelfTestKind, estimate_minutes: u64) -> Duration {
    let doubled = Duration::from_secs(estimate_minutes.saturating_mul(120));
    match kind {
        SelfTestKind::Short => doubled.max(SHORT_TIMEOUT_FLOOR),
        SelfTestKind::Long => doubled,
    }
}

/// Displayed progress for one tick: prefer the device-reported percent
/// remaining while a test is in progress, otherwise fall back to the
/// elapsed/estimate ratio clamped to 100%.
pub fn progress_percent(status: &SelfTestStatus, elapsed: Duration, estimate: Duration) -> f64 {
    if status.is_in_progress() {
        f64::from(100u8.saturating_sub(status.percent_remaining.min(100)))
    } else {
        let estimate = estimate.as_secs_f64();
        if estimate <= 0.0 {
            100.0
        } else {
            (elapsed.as_secs_f64() / estimate * 100.0).min(100.0)
        }
    }
}

/// Wait for a device self-test to finish.
///
/// `baseline_count` is the number of logged self-tests observed before the
/// operation was initiated; completion requires the count to have grown past
/// it. All terminal outcomes are recorded in the audit log.
pub async fn await_self_test<P: SelfTestProbe>(
    probe: &mut P,
    audit: &AuditLog,
    kind: SelfTestKind,
    plan: &PollPlan,
    baseline_count: u64,
) -> ProbeResult<PollOutcome> {
    let started = Instant::now();
    audit.note(&format!(
        "awaiting {} self-test: interval {}, timeout {}, baseline count {}",
        kind,
        humantime::format_duration(plan.interval),
        humantime::format_duration(plan.timeout),
        baseline_count
    ));

    loop {
        tokio::time::sleep(plan.interval).await;

        let status = probe.poll_status()?;

        if status.is_failure() {
            let reason = format!(
                "self-test execution status {} is in the failure range",
                status.status_code
            );
            audit.note(&format!("{} self-test FAILED: {}", kind, reason));
            return Ok(PollOutcome::Failed(reason));
        }

        // Composite completion judgment: idle status, count grew, the newest
        // log entry is ours, and its pass flag is set.
        if status.status_code == STATUS_IDLE && status.tests_logged > baseline_count {
            if status.last_kind == Some(kind.log_code()) {
                if status.last_passed == Some(true) {
                    audit.note(&format!(
                        "{} self-test completed ({} logged tests, was {})",
                        kind, status.tests_logged, baseline_count
                    ));
                    return Ok(PollOutcome::Completed);
                }
                let reason = format!(
                    "{} self-test logged with pass flag false (status code {})",
                    kind, status.status_code
                );
                audit.note(&format!("{} self-test FAILED: {}", kind, reason));
                return Ok(PollOutcome::Failed(reason));
            }
            // A different test type's entry is newest: not our completion.
            // Keep polling until our entry appears or the deadline hits.
        }

        let elapsed = started.elapsed();
        let pct = progress_percent(&status, elapsed, plan.estimate);
        println!(
            "  ⏳ {} self-test: {:.0}% ({} elapsed)",
            kind,
            pct,
            humantime::format_duration(Duration::from_secs(elapsed.as_secs()))
        );
        audit.note(&format!(
            "{} self-test tick: status {}, {:.0}%, {} logged tests",
            kind, status.status_code, pct, status.tests_logged
        ));

        if elapsed >= plan.timeout {
            audit.note(&format!(
                "{} self-test TIMED OUT after {}",
                kind,
                humantime::format_duration(plan.timeout)
            ));
            return Ok(PollOutcome::TimedOut);
        }
    }
}
