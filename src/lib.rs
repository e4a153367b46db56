// Allow uppercase acronyms for industry-standard terms like ATA, NVMe, SMART
#![allow(clippy::upper_case_acronyms)]

pub mod audit;
pub mod compare;
pub mod devices;
pub mod orchestrator;
pub mod poller;
pub mod probe;
pub mod session;

// Re-export the main orchestrator entry points for convenience
pub use orchestrator::{AcceptanceTest, RunOutcome, RunPolicy};

use thiserror::Error;

/// Errors from the device probe adapter (external diagnostic tool invocations).
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("failed to launch diagnostic tool: {0}")]
    Launch(String),

    #[error("diagnostic command failed: {0}")]
    CommandFailed(String),

    #[error("unparseable diagnostic output: {0}")]
    Unparseable(String),

    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ProbeResult<T> = Result<T, ProbeError>;

/// Top-level errors for an acceptance-test run.
#[derive(Error, Debug)]
pub enum TestError {
    #[error("precondition not met: {0}")]
    Precondition(String),

    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error("device self-test failed: {0}")]
    SelfTestFailed(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("surface scan failed: {0}")]
    SurfaceScanFailed(String),

    #[error("session state error: {0}")]
    State(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type TestResult<T> = Result<T, TestError>;
