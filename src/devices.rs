//! Peripheral device plumbing: enumeration for the interactive selector,
//! sector-size queries for the surface scan, and the precondition checks that
//! must all pass before any session starts.

use crate::{TestError, TestResult};
use std::fs;
use std::path::Path;
use std::process::Command;

/// External tools the orchestrator shells out to.
pub const REQUIRED_TOOLS: [&str; 4] = ["smartctl", "badblocks", "lsblk", "blockdev"];

/// One row of the interactive device selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSummary {
    pub path: String,
    pub size: String,
    pub model: String,
}

/// Enumerate whole-disk block devices via `lsblk`.
pub fn list_devices() -> TestResult<Vec<DeviceSummary>> {
    let output = Command::new("lsblk")
        .args(["-d", "-n", "-o", "NAME,TYPE,SIZE,MODEL"])
        .output()
        .map_err(|e| TestError::Precondition(format!("failed to run lsblk: {}", e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(parse_lsblk(&stdout))
}

pub(crate) fn parse_lsblk(output: &str) -> Vec<DeviceSummary> {
    let mut devices = Vec::new();
    for line in output.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 3 || parts[1] != "disk" {
            continue;
        }
        if should_skip_device(parts[0]) {
            continue;
        }
        devices.push(DeviceSummary {
            path: format!("/dev/{}", parts[0]),
            size: parts[2].to_string(),
            model: parts[3..].join(" "),
        });
    }
    devices
}

/// Skip virtual/removable-media devices that are never acceptance-test
/// candidates.
pub(crate) fn should_skip_device(device_name: &str) -> bool {
    device_name.starts_with("loop")
        || device_name.starts_with("ram")
        || device_name.starts_with("dm-")
        || device_name.starts_with("sr")
        || device_name.starts_with("zram")
}

/// Physical sector size for the surface scan's block size. Falls back to the
/// logical sector size, then 512, when the queries fail.
pub fn physical_sector_size(device_path: &str) -> u64 {
    for flag in ["--getpbsz", "--getss"] {
        let output = Command::new("blockdev").args([flag, device_path]).output();
        if let Ok(output) = output {
            if output.status.success() {
                if let Ok(size) = String::from_utf8_lossy(&output.stdout).trim().parse::<u64>() {
                    if size > 0 {
                        return size;
                    }
                }
            }
        }
    }
    512
}

/// Check whether the device (or any partition on it) is currently mounted.
pub fn is_mounted(device_path: &str) -> TestResult<bool> {
    let mounts = fs::read_to_string("/proc/mounts")?;
    Ok(mounts.lines().any(|line| {
        line.split_whitespace()
            .next()
            .is_some_and(|dev| is_device_or_partition(dev, device_path))
    }))
}

/// The device itself, or one of its partitions (`sda1`, `nvme0n1p2`). A bare
/// prefix match is not enough: `/dev/sdab` is a different disk than
/// `/dev/sda`.
fn is_device_or_partition(mount_source: &str, device_path: &str) -> bool {
    if mount_source == device_path {
        return true;
    }
    match mount_source.strip_prefix(device_path) {
        Some(rest) => {
            let digits = rest.strip_prefix('p').unwrap_or(rest);
            !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
        }
        None => false,
    }
}

#[cfg(unix)]
fn is_block_device(device_path: &str) -> bool {
    use std::os::unix::fs::FileTypeExt;
    fs::metadata(device_path)
        .map(|m| m.file_type().is_block_device())
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_block_device(_device_path: &str) -> bool {
    false
}

fn tool_available(tool: &str) -> bool {
    Command::new("which")
        .arg(tool)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Detect a session-persistence wrapper (tmux or screen). A dropped SSH
/// connection must not kill a run that is hours into a destructive scan.
pub fn under_session_wrapper() -> bool {
    std::env::var_os("TMUX").is_some() || std::env::var_os("STY").is_some()
}

/// All precondition checks, reported before any session starts.
pub fn preflight(device_path: &str, skip_session_check: bool) -> TestResult<()> {
    if !nix::unistd::geteuid().is_root() {
        return Err(TestError::Precondition(
            "must run as root to issue device diagnostics".to_string(),
        ));
    }

    if !skip_session_check && !under_session_wrapper() {
        return Err(TestError::Precondition(
            "not running under tmux/screen; a disconnect would kill a multi-hour run \
             (use --skip-session-check to override)"
                .to_string(),
        ));
    }

    for tool in REQUIRED_TOOLS {
        if !tool_available(tool) {
            return Err(TestError::Precondition(format!(
                "required external tool '{}' not found in PATH",
                tool
            )));
        }
    }

    if !Path::new(device_path).exists() {
        return Err(TestError::Precondition(format!(
            "device {} not found",
            device_path
        )));
    }
    if !is_block_device(device_path) {
        return Err(TestError::Precondition(format!(
            "{} is not a block device",
            device_path
        )));
    }
    if is_mounted(device_path)? {
        return Err(TestError::Precondition(format!(
            "{} is mounted; unmount it before testing",
            device_path
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_lsblk_filters_disks() {
        let output = "\
sda    disk   3.6T WDC WD40EFRX-68N32N0
sdb    disk 931.5G Samsung SSD 870
sr0    rom   1024M DVD-RW
loop0  loop  63.5M
nvme0n1 disk 476.9G Samsung SSD 980
";
        let devices = parse_lsblk(output);
        assert_eq!(devices.len(), 3);
        assert_eq!(devices[0].path, "/dev/sda");
        assert_eq!(devices[0].model, "WDC WD40EFRX-68N32N0");
        assert_eq!(devices[1].model, "Samsung SSD 870");
        assert_eq!(devices[2].path, "/dev/nvme0n1");
    }

    #[test]
    fn test_parse_lsblk_skips_virtual_devices() {
        let output = "\
zram0  disk    8G
dm-0   disk  100G
sda    disk  3.6T WDC
";
        let devices = parse_lsblk(output);
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].path, "/dev/sda");
    }

    #[test]
    fn test_should_skip_device() {
        assert!(should_skip_device("loop0"));
        assert!(should_skip_device("ram1"));
        assert!(should_skip_device("dm-2"));
        assert!(should_skip_device("sr0"));
        assert!(should_skip_device("zram0"));
        assert!(!should_skip_device("sda"));
        assert!(!should_skip_device("nvme0n1"));
    }

    #[test]
    fn test_device_or_partition_matching() {
        assert!(is_device_or_partition("/dev/sda", "/dev/sda"));
        assert!(is_device_or_partition("/dev/sda1", "/dev/sda"));
        assert!(is_device_or_partition("/dev/sda12", "/dev/sda"));
        assert!(is_device_or_partition("/dev/nvme0n1p2", "/dev/nvme0n1"));

        // A longer device name sharing the prefix is a different disk.
        assert!(!is_device_or_partition("/dev/sdab", "/dev/sda"));
        assert!(!is_device_or_partition("/dev/sdab1", "/dev/sda"));
        assert!(!is_device_or_partition("/dev/sdb1", "/dev/sda"));
    }

    #[test]
    fn test_physical_sector_size_fallback_for_missing_device() {
        // blockdev fails for a path that is not a block device
        assert_eq!(physical_sector_size("/nonexistent-burnin-device"), 512);
    }
}
