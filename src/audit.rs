//! Append-only audit log for post-hoc review.
//!
//! Every decision, issued command (with its full raw output) and phase
//! transition ends up here. Writes are best-effort: a broken audit file must
//! never take down a run that is hours into a destructive scan, so failures
//! are reported through `log::warn!` and otherwise ignored.

use chrono::Utc;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Output;

/// Handle to the session's audit log file.
///
/// Cloneable; each write opens the file in append mode so concurrent readers
/// (`tail -f` during a multi-hour run) always see complete lines.
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(session_dir: &Path) -> Self {
        Self {
            path: session_dir.join("audit.log"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record a single timestamped line.
    pub fn note(&self, message: &str) {
        self.append(&format!(
            "[{}] {}\n",
            Utc::now().format("%Y-%m-%d %H:%M:%S%.3fZ"),
            message
        ));
    }

    /// Record a section banner (used for phase transitions).
    pub fn section(&self, title: &str) {
        self.append(&format!(
            "\n==================== {} ====================\n",
            title
        ));
        self.note(title);
    }

    /// Record an issued command together with its verbatim output.
    pub fn command(&self, command_line: &str, output: &Output) {
        self.note(&format!("$ {}", command_line));
        self.note(&format!("exit status: {}", output.status));
        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.trim().is_empty() {
            self.append(&indent(&stdout));
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            self.append("  --- stderr ---\n");
            self.append(&indent(&stderr));
        }
    }

    /// Record a raw line (used when streaming surface-scan output verbatim).
    pub fn raw_line(&self, line: &str) {
        self.append(&format!("  {}\n", line));
    }

    fn append(&self, text: &str) {
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| f.write_all(text.as_bytes()));

        if let Err(e) = result {
            log::warn!("audit log write failed ({}): {}", self.path.display(), e);
        }
    }
}

fn indent(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for line in text.lines() {
        out.push_str("  ");
        out.push_str(line);
        out.push('\n');
    }
    out
}
