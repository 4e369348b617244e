use std::ffi::CString;
use std::path::Path;

use sysinfo::Disks;
use tracing::{debug, info, warn};

use crate::config::ExtraFilesystem;
use crate::types::round2;

/// Indicator files whose presence marks an immutable distribution where the
/// real root device is mounted at /sysroot.
const IMMUTABLE_INDICATORS: &[&str] = &["/run/ostree-booted", "/etc/ostree-release"];

/// One filesystem the agent tracks. Exactly one record is the root.
#[derive(Debug, Clone)]
pub struct FsRecord {
    /// Short device name as it appears in /proc/diskstats (e.g. "sda1").
    pub device: String,
    pub mountpoint: String,
    pub is_root: bool,
    pub custom_name: Option<String>,

    // Refreshed per sampling round.
    pub total: u64,
    pub used: u64,
    pub inodes_used_pct: Option<f64>,
    pub read_bps: u64,
    pub write_bps: u64,
}

impl FsRecord {
    /// The name this filesystem is reported under in the extra-filesystems
    /// map: custom name when configured, device name otherwise.
    pub fn report_name(&self) -> &str {
        self.custom_name.as_deref().unwrap_or(&self.device)
    }
}

/// Usage of one mountpoint as reported by statvfs.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsUsage {
    pub total: u64,
    pub used: u64,
    pub inodes_total: u64,
    pub inodes_used: u64,
}

impl FsUsage {
    pub fn inodes_used_pct(&self) -> Option<f64> {
        if self.inodes_total == 0 {
            return None;
        }
        Some(round2(
            self.inodes_used as f64 / self.inodes_total as f64 * 100.0,
        ))
    }
}

/// statvfs-based usage query; None when the mountpoint is gone.
pub fn fs_usage(mountpoint: &str) -> Option<FsUsage> {
    let path = CString::new(mountpoint).ok()?;
    let mut vfs: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(path.as_ptr(), &mut vfs) };
    if rc != 0 {
        return None;
    }
    let frsize = vfs.f_frsize as u64;
    let total = vfs.f_blocks as u64 * frsize;
    let free = vfs.f_bfree as u64 * frsize;
    Some(FsUsage {
        total,
        used: total.saturating_sub(free),
        inodes_total: vfs.f_files as u64,
        inodes_used: (vfs.f_files as u64).saturating_sub(vfs.f_ffree as u64),
    })
}

/// Enumerate partitions and build the tracked filesystem set: the root
/// record (honoring the FILESYSTEM override and the /sysroot fallback on
/// immutable distributions) plus any EXTRA_FILESYSTEMS entries.
pub fn init_fs_records(
    filesystem_env: Option<&str>,
    extra: &[ExtraFilesystem],
) -> Vec<FsRecord> {
    let disks = Disks::new_with_refreshed_list();
    let partitions: Vec<(String, String)> = disks
        .iter()
        .map(|d| {
            (
                d.name().to_string_lossy().into_owned(),
                d.mount_point().to_string_lossy().into_owned(),
            )
        })
        .collect();

    build_fs_records(&partitions, filesystem_env, extra, root_mountpoint())
}

/// The mountpoint treated as the host root. Immutable distributions mount
/// the writable root at /sysroot while / is a read-only overlay.
fn root_mountpoint() -> &'static str {
    let immutable = IMMUTABLE_INDICATORS
        .iter()
        .any(|p| Path::new(p).exists());
    if immutable && Path::new("/sysroot").exists() {
        "/sysroot"
    } else {
        "/"
    }
}

fn build_fs_records(
    partitions: &[(String, String)],
    filesystem_env: Option<&str>,
    extra: &[ExtraFilesystem],
    root_mount: &str,
) -> Vec<FsRecord> {
    let mut records: Vec<FsRecord> = Vec::new();

    // Root selection: explicit override first, then the root mountpoint.
    let root = filesystem_env
        .and_then(|want| {
            partitions
                .iter()
                .find(|(dev, mount)| device_matches(dev, want) || mount == want)
        })
        .or_else(|| partitions.iter().find(|(_, mount)| mount == root_mount))
        .or_else(|| partitions.iter().find(|(_, mount)| mount == "/"));

    match root {
        Some((dev, mount)) => {
            info!(device = %dev, mountpoint = %mount, "Tracking root filesystem");
            records.push(new_record(dev, mount, true, None));
        }
        None => warn!("No root filesystem found among partitions"),
    }

    for entry in extra {
        let matched = partitions
            .iter()
            .find(|(dev, mount)| device_matches(dev, &entry.device) || mount == &entry.device);
        match matched {
            Some((dev, mount)) => {
                if records.iter().any(|r| r.mountpoint == *mount) {
                    debug!(device = %entry.device, "Extra filesystem already tracked");
                    continue;
                }
                records.push(new_record(dev, mount, false, entry.custom_name.clone()));
            }
            // A bare directory works too: usage comes from statvfs and no
            // I/O counters will match in /proc/diskstats.
            None if Path::new(&entry.device).is_dir() => {
                records.push(new_record(&entry.device, &entry.device, false, entry.custom_name.clone()));
            }
            None => warn!(device = %entry.device, "Extra filesystem not found — skipping"),
        }
    }

    records
}

fn new_record(device: &str, mountpoint: &str, is_root: bool, custom_name: Option<String>) -> FsRecord {
    FsRecord {
        device: short_device_name(device),
        mountpoint: mountpoint.to_string(),
        is_root,
        custom_name,
        total: 0,
        used: 0,
        inodes_used_pct: None,
        read_bps: 0,
        write_bps: 0,
    }
}

/// "/dev/sda1" → "sda1", for matching against /proc/diskstats rows.
pub fn short_device_name(device: &str) -> String {
    device.rsplit('/').next().unwrap_or(device).to_string()
}

fn device_matches(device: &str, wanted: &str) -> bool {
    device == wanted || short_device_name(device) == short_device_name(wanted)
}
