//! Dual-path parsers for diagnostic tool output.
//!
//! The structured (`--json`) representation is always preferred; the textual
//! parsers exist because real drives ship firmware whose JSON dump omits
//! fields that the legacy text output still carries. Fallback order is fixed:
//! JSON first, text second, per required field.

use crate::probe::SmartAttribute;
use crate::{ProbeError, ProbeResult};
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;

/// Device identity fields from `smartctl -i`.
#[derive(Debug, Default)]
pub struct Identity {
    pub model: Option<String>,
    pub serial: Option<String>,
    pub protocol: Option<String>,
}

/// Self-test fields as far as the structured dump provided them. `None`
/// means "fall back to the textual command for this field".
#[derive(Debug, Default, Clone)]
pub struct PartialSelfTest {
    pub status_code: Option<u8>,
    pub percent_remaining: Option<u8>,
    pub tests_logged: Option<u64>,
    pub last_kind: Option<u8>,
    pub last_passed: Option<bool>,
    pub short_poll_minutes: Option<u64>,
    pub extended_poll_minutes: Option<u64>,
}

#[derive(Debug, Default)]
pub struct StructuredSnapshot {
    pub attributes: Option<BTreeMap<u8, SmartAttribute>>,
    pub self_test: PartialSelfTest,
}

/// Most recent entries of the textual self-test log.
#[derive(Debug, Default)]
pub struct TextSelfTestLog {
    pub count: u64,
    pub last_kind: Option<u8>,
    pub last_passed: Option<bool>,
}

/// Parse device identity, preferring JSON, falling back to the legacy
/// `Field: value` text layout.
pub fn parse_identity(output: &str) -> ProbeResult<Identity> {
    if let Ok(root) = serde_json::from_str::<Value>(output) {
        let identity = Identity {
            model: string_at(&root, &["model_name"])
                .or_else(|| string_at(&root, &["scsi_model_name"])),
            serial: string_at(&root, &["serial_number"]),
            protocol: string_at(&root, &["device", "protocol"]),
        };
        if identity.model.is_some() || identity.serial.is_some() {
            return Ok(identity);
        }
    }

    let identity = Identity {
        model: extract_field(output, "Device Model:")
            .or_else(|| extract_field(output, "Model Number:")),
        serial: extract_field(output, "Serial Number:"),
        protocol: None,
    };

    if identity.model.is_none() && identity.serial.is_none() {
        return Err(ProbeError::Unparseable(
            "no device identity in smartctl output".to_string(),
        ));
    }
    Ok(identity)
}

/// Parse the whole-device JSON dump (`smartctl -x --json=c`).
///
/// Returns `None` when the payload is not JSON at all; individual missing
/// fields come back as `None` inside the partial snapshot.
pub fn parse_json_snapshot(output: &str) -> Option<StructuredSnapshot> {
    let root: Value = serde_json::from_str(output).ok()?;
    let mut snapshot = StructuredSnapshot::default();

    if let Some(table) = root
        .pointer("/ata_smart_attributes/table")
        .and_then(Value::as_array)
    {
        let mut attributes = BTreeMap::new();
        for entry in table {
            let id = entry.get("id").and_then(Value::as_u64);
            let name = entry.get("name").and_then(Value::as_str);
            let raw = entry.pointer("/raw/value").and_then(Value::as_u64);
            if let (Some(id), Some(name), Some(raw)) = (id, name, raw) {
                if id <= u64::from(u8::MAX) {
                    attributes.insert(
                        id as u8,
                        SmartAttribute {
                            id: id as u8,
                            name: name.to_string(),
                            raw,
                        },
                    );
                }
            }
        }
        snapshot.attributes = Some(attributes);
    }

    let st = &mut snapshot.self_test;

    st.status_code = root
        .pointer("/ata_smart_data/self_test/status/value")
        .and_then(Value::as_u64)
        .and_then(|v| u8::try_from(v).ok());
    st.percent_remaining = root
        .pointer("/ata_smart_data/self_test/status/remaining_percent")
        .and_then(Value::as_u64)
        .and_then(|v| u8::try_from(v).ok());
    st.short_poll_minutes = root
        .pointer("/ata_smart_data/self_test/polling_minutes/short")
        .and_then(Value::as_u64);
    st.extended_poll_minutes = root
        .pointer("/ata_smart_data/self_test/polling_minutes/extended")
        .and_then(Value::as_u64);

    if let Some(log) = root.pointer("/ata_smart_self_test_log/standard") {
        st.tests_logged = log.get("count").and_then(Value::as_u64);
        // Table is newest-first; the head entry is the most recent run.
        if let Some(head) = log
            .pointer("/table")
            .and_then(Value::as_array)
            .and_then(|t| t.first())
        {
            st.last_kind = head
                .pointer("/type/value")
                .and_then(Value::as_u64)
                .and_then(|v| u8::try_from(v).ok());
            st.last_passed = head.pointer("/status/passed").and_then(Value::as_bool);
        }
    }

    // NVMe devices report through a separate log; normalize into the same
    // status-code convention the poller understands.
    if st.status_code.is_none() {
        if let Some(log) = root.get("nvme_self_test_log") {
            let op = log
                .pointer("/current_self_test_operation/value")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            if op != 0 {
                st.status_code = Some(crate::probe::STATUS_IN_PROGRESS_MIN);
                st.percent_remaining = log
                    .get("current_self_test_completion_percent")
                    .and_then(Value::as_u64)
                    .map(|done| 100u8.saturating_sub(done.min(100) as u8));
            } else {
                st.status_code = Some(crate::probe::STATUS_IDLE);
            }
            if let Some(table) = log.pointer("/table").and_then(Value::as_array) {
                st.tests_logged = Some(table.len() as u64);
                if let Some(head) = table.first() {
                    st.last_kind = head
                        .pointer("/self_test_code/value")
                        .and_then(Value::as_u64)
                        .and_then(|v| u8::try_from(v).ok());
                    st.last_passed = head
                        .pointer("/self_test_result/value")
                        .and_then(Value::as_u64)
                        .map(|v| v == 0);
                }
            }
        }
    }

    Some(snapshot)
}

/// Parse the attribute table from textual `smartctl -A` output.
pub fn parse_text_attributes(output: &str) -> BTreeMap<u8, SmartAttribute> {
    let mut attributes = BTreeMap::new();
    let mut in_table = false;

    for line in output.lines() {
        if line.contains("ID# ATTRIBUTE_NAME") {
            in_table = true;
            continue;
        }
        if !in_table {
            continue;
        }

        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 10 {
            continue;
        }

        if let Ok(id) = parts[0].parse::<u8>() {
            attributes.insert(
                id,
                SmartAttribute {
                    id,
                    name: parts[1].to_string(),
                    raw: parse_raw_value(parts[9]),
                },
            );
        }
    }

    attributes
}

/// Parse the execution status block from textual `smartctl -c` output.
///
/// Returns `(status_code, percent_remaining)`; either may be absent.
pub fn parse_text_execution_status(output: &str) -> (Option<u8>, Option<u8>) {
    let code_re = Regex::new(r"Self-test execution status:\s*\(\s*(\d+)\s*\)")
        .expect("static regex");
    let remaining_re = Regex::new(r"(\d+)%\s+of\s+test\s+remaining").expect("static regex");

    let code = code_re
        .captures(output)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<u8>().ok());
    let remaining = remaining_re
        .captures(output)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<u8>().ok());

    (code, remaining)
}

/// Parse the textual self-test log (`smartctl -l selftest`).
pub fn parse_text_selftest_log(output: &str) -> TextSelfTestLog {
    let mut log = TextSelfTestLog::default();

    for line in output.lines() {
        let trimmed = line.trim_start();
        if !trimmed.starts_with("# ") {
            continue;
        }
        log.count += 1;

        // Entries are newest-first; only the head entry drives completion
        // detection.
        if log.count == 1 {
            if trimmed.contains("Short offline") || trimmed.contains("Short captive") {
                log.last_kind = Some(1);
            } else if trimmed.contains("Extended offline")
                || trimmed.contains("Extended captive")
            {
                log.last_kind = Some(2);
            }

            if trimmed.contains("in progress") {
                log.last_passed = None;
            } else if trimmed.contains("Completed without error") {
                log.last_passed = Some(true);
            } else {
                log.last_passed = Some(false);
            }
        }
    }

    log
}

/// Raw attribute values come in several formats: plain integers, hex, and
/// composites like `36 (Min/Max 24/45)`. Take the leading number.
pub(crate) fn parse_raw_value(raw_str: &str) -> u64 {
    if let Ok(val) = raw_str.parse::<u64>() {
        return val;
    }

    if let Some(hex) = raw_str.strip_prefix("0x") {
        if let Ok(val) = u64::from_str_radix(hex, 16) {
            return val;
        }
    }

    if let Some(space_pos) = raw_str.find(' ') {
        if let Ok(val) = raw_str[..space_pos].parse::<u64>() {
            return val;
        }
    }

    0
}

fn string_at(root: &Value, path: &[&str]) -> Option<String> {
    let mut node = root;
    for key in path {
        node = node.get(key)?;
    }
    node.as_str().map(str::to_string)
}

fn extract_field(output: &str, field_name: &str) -> Option<String> {
    output
        .lines()
        .find(|line| line.contains(field_name))?
        .split(':')
        .nth(1)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    const JSON_SAMPLE: &str = r#"{
        "model_name": "WDC WD40EFRX-68N32N0",
        "serial_number": "WD-WCC7K1234567",
        "device": { "name": "/dev/sda", "protocol": "ATA" },
        "ata_smart_attributes": {
            "table": [
                { "id": 1, "name": "Raw_Read_Error_Rate", "raw": { "value": 0, "string": "0" } },
                { "id": 5, "name": "Reallocated_Sector_Ct", "raw": { "value": 3, "string": "3" } },
                { "id": 9, "name": "Power_On_Hours", "raw": { "value": 16838, "string": "16838" } },
                { "id": 194, "name": "Temperature_Celsius", "raw": { "value": 31, "string": "31 (Min/Max 18/45)" } }
            ]
        },
        "ata_smart_data": {
            "self_test": {
                "status": { "value": 249, "string": "in progress, 90% remaining", "remaining_percent": 90 },
                "polling_minutes": { "short": 2, "extended": 497 }
            }
        },
        "ata_smart_self_test_log": {
            "standard": {
                "revision": 1,
                "table": [
                    { "type": { "value": 2, "string": "Extended offline" },
                      "status": { "value": 0, "string": "Completed without error", "passed": true },
                      "lifetime_hours": 16830 },
                    { "type": { "value": 1, "string": "Short offline" },
                      "status": { "value": 0, "string": "Completed without error", "passed": true },
                      "lifetime_hours": 16802 }
                ],
                "count": 2
            }
        }
    }"#;

    const TEXT_ATTRIBUTES_SAMPLE: &str = "\
=== START OF READ SMART DATA SECTION ===
SMART Attributes Data Structure revision number: 16
Vendor Specific SMART Attributes with Thresholds:
ID# ATTRIBUTE_NAME          FLAG     VALUE WORST THRESH TYPE      UPDATED  WHEN_FAILED RAW_VALUE
  1 Raw_Read_Error_Rate     0x002f   200   200   051    Pre-fail  Always       -       0
  5 Reallocated_Sector_Ct   0x0033   200   200   140    Pre-fail  Always       -       0
  9 Power_On_Hours          0x0032   077   077   000    Old_age   Always       -       16838
194 Temperature_Celsius     0x0022   116   103   000    Old_age   Always       -       31 (Min/Max 18/45)
197 Current_Pending_Sector  0x0032   200   200   000    Old_age   Always       -       0
198 Offline_Uncorrectable   0x0030   100   253   000    Old_age   Offline      -       0
";

    const TEXT_CAPABILITIES_IN_PROGRESS: &str = "\
=== START OF READ SMART DATA SECTION ===
General SMART Values:
Offline data collection status:  (0x84)	Offline data collection activity
Self-test execution status:      ( 249)	Self-test routine in progress...
					90% of test remaining.
Total time to complete Offline
data collection: 		(42840) seconds.
";

    const TEXT_SELFTEST_LOG_SAMPLE: &str = "\
SMART Self-test log structure revision number 1
Num  Test_Description    Status                  Remaining  LifeTime(hours)  LBA_of_first_error
# 1  Short offline       Completed without error       00%     16838         -
# 2  Extended offline    Completed: read failure       90%     16500         12345678
";

    #[test]
    fn test_parse_identity_json() {
        let identity = parse_identity(JSON_SAMPLE).unwrap();
        assert_eq!(identity.model.as_deref(), Some("WDC WD40EFRX-68N32N0"));
        assert_eq!(identity.serial.as_deref(), Some("WD-WCC7K1234567"));
        assert_eq!(identity.protocol.as_deref(), Some("ATA"));
    }

    #[test]
    fn test_parse_identity_text_fallback() {
        let text = "Device Model:     ST4000DM004-2CV104\nSerial Number:    ZFN0ABCD\n";
        let identity = parse_identity(text).unwrap();
        assert_eq!(identity.model.as_deref(), Some("ST4000DM004-2CV104"));
        assert_eq!(identity.serial.as_deref(), Some("ZFN0ABCD"));
    }

    #[test]
    fn test_parse_identity_garbage_is_unparseable() {
        assert!(parse_identity("no identity here").is_err());
    }

    #[test]
    fn test_parse_json_snapshot_full() {
        let snapshot = parse_json_snapshot(JSON_SAMPLE).unwrap();

        let attributes = snapshot.attributes.unwrap();
        assert_eq!(attributes.len(), 4);
        assert_eq!(attributes[&5].raw, 3);
        assert_eq!(attributes[&194].name, "Temperature_Celsius");

        let st = snapshot.self_test;
        assert_eq!(st.status_code, Some(249));
        assert_eq!(st.percent_remaining, Some(90));
        assert_eq!(st.tests_logged, Some(2));
        assert_eq!(st.last_kind, Some(2), "newest entry is the extended test");
        assert_eq!(st.last_passed, Some(true));
        assert_eq!(st.short_poll_minutes, Some(2));
        assert_eq!(st.extended_poll_minutes, Some(497));
    }

    #[test]
    fn test_parse_json_snapshot_missing_fields_stay_none() {
        let snapshot = parse_json_snapshot(r#"{"model_name": "X"}"#).unwrap();
        assert!(snapshot.attributes.is_none());
        assert!(snapshot.self_test.status_code.is_none());
        assert!(snapshot.self_test.tests_logged.is_none());
    }

    #[test]
    fn test_parse_json_snapshot_non_json_is_none() {
        assert!(parse_json_snapshot("smartctl: command line parse error").is_none());
    }

    #[test]
    fn test_parse_text_attributes() {
        let attributes = parse_text_attributes(TEXT_ATTRIBUTES_SAMPLE);
        assert_eq!(attributes.len(), 6);
        assert_eq!(attributes[&9].raw, 16838);
        assert_eq!(attributes[&9].name, "Power_On_Hours");
        // Composite raw value keeps the leading number
        assert_eq!(attributes[&194].raw, 31);
        assert_eq!(attributes[&197].raw, 0);
    }

    #[test]
    fn test_parse_text_execution_status_in_progress() {
        let (code, remaining) = parse_text_execution_status(TEXT_CAPABILITIES_IN_PROGRESS);
        assert_eq!(code, Some(249));
        assert_eq!(remaining, Some(90));
    }

    #[test]
    fn test_parse_text_execution_status_idle() {
        let idle = "Self-test execution status:      (   0)	The previous self-test routine completed\n\t\t\t\t\twithout error or no self-test has ever \n\t\t\t\t\tbeen run.\n";
        let (code, remaining) = parse_text_execution_status(idle);
        assert_eq!(code, Some(0));
        assert_eq!(remaining, None);
    }

    #[test]
    fn test_parse_text_selftest_log() {
        let log = parse_text_selftest_log(TEXT_SELFTEST_LOG_SAMPLE);
        assert_eq!(log.count, 2);
        assert_eq!(log.last_kind, Some(1), "head entry is the short test");
        assert_eq!(log.last_passed, Some(true));
    }

    #[test]
    fn test_parse_text_selftest_log_failed_head_entry() {
        let text = "\
# 1  Extended offline    Completed: read failure       40%     16500         12345678
# 2  Short offline       Completed without error       00%     16400         -
";
        let log = parse_text_selftest_log(text);
        assert_eq!(log.count, 2);
        assert_eq!(log.last_kind, Some(2));
        assert_eq!(log.last_passed, Some(false));
    }

    #[test]
    fn test_parse_text_selftest_log_empty() {
        let log = parse_text_selftest_log("No self-tests have been logged.\n");
        assert_eq!(log.count, 0);
        assert_eq!(log.last_kind, None);
        assert_eq!(log.last_passed, None);
    }

    #[test]
    fn test_parse_raw_value_formats() {
        assert_eq!(parse_raw_value("12345"), 12345);
        assert_eq!(parse_raw_value("0x1a"), 26);
        assert_eq!(parse_raw_value("36 (Min/Max 24/45)"), 36);
        assert_eq!(parse_raw_value("garbage"), 0);
    }
}
