//! Before/after health-attribute comparison.
//!
//! Diffs a fixed watch-list of attributes between the initial and final
//! snapshots. Attributes that legitimately grow under load (power-on hours,
//! temperature) are excluded from regression judgment unconditionally.

use crate::probe::DeviceSnapshot;
use colored::Colorize;
use std::fmt;

/// Watched ATA attribute ids with their canonical names (used when a
/// snapshot carries the attribute without a name).
pub const WATCHED_ATTRIBUTES: [(u8, &str); 6] = [
    (1, "Raw_Read_Error_Rate"),
    (5, "Reallocated_Sector_Ct"),
    (9, "Power_On_Hours"),
    (194, "Temperature_Celsius"),
    (197, "Current_Pending_Sector"),
    (198, "Offline_Uncorrectable"),
];

/// Attributes expected to increase over the course of a multi-hour test.
pub const EXPECTED_INCREASE_IDS: [u8; 2] = [9, 194];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    StableOk,
    ExpectedIncrease,
    Regressed,
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Classification::StableOk => write!(f, "stable-ok"),
            Classification::ExpectedIncrease => write!(f, "expected-increase"),
            Classification::Regressed => write!(f, "regressed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComparisonRow {
    pub id: u8,
    pub name: String,
    pub before: u64,
    pub after: u64,
    pub classification: Classification,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComparisonReport {
    pub rows: Vec<ComparisonRow>,
}

impl ComparisonReport {
    /// True when any watched, non-expected-increase attribute changed.
    pub fn any_regression(&self) -> bool {
        self.rows
            .iter()
            .any(|row| row.classification == Classification::Regressed)
    }

    /// Render the comparison as an operator-facing table.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "{:>4}  {:<24} {:>12} {:>12}  {}\n",
            "ID", "ATTRIBUTE", "BEFORE", "AFTER", "VERDICT"
        ));
        for row in &self.rows {
            let verdict = match row.classification {
                Classification::StableOk => row.classification.to_string().green(),
                Classification::ExpectedIncrease => row.classification.to_string().yellow(),
                Classification::Regressed => row.classification.to_string().red().bold(),
            };
            out.push_str(&format!(
                "{:>4}  {:<24} {:>12} {:>12}  {}\n",
                row.id, row.name, row.before, row.after, verdict
            ));
        }
        out
    }
}

fn is_expected_increase(id: u8) -> bool {
    EXPECTED_INCREASE_IDS.contains(&id)
}

/// Compare two snapshots over the watch-list.
///
/// Attributes absent from either snapshot are skipped, never reported as
/// regressed: a drive that does not expose an attribute cannot regress on it.
pub fn compare_snapshots(before: &DeviceSnapshot, after: &DeviceSnapshot) -> ComparisonReport {
    let mut rows = Vec::new();

    for (id, canonical_name) in WATCHED_ATTRIBUTES {
        let (Some(before_raw), Some(after_raw)) =
            (before.attribute_raw(id), after.attribute_raw(id))
        else {
            continue;
        };

        let name = after
            .attributes
            .get(&id)
            .map(|a| a.name.clone())
            .unwrap_or_else(|| canonical_name.to_string());

        let classification = if is_expected_increase(id) {
            Classification::ExpectedIncrease
        } else if before_raw == after_raw {
            Classification::StableOk
        } else {
            Classification::Regressed
        };

        rows.push(ComparisonRow {
            id,
            name,
            before: before_raw,
            after: after_raw,
            classification,
        });
    }

    ComparisonReport { rows }
}
