use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use tokio_util::sync::CancellationToken;

use super::{accumulate, GpuDataMap, POLL_INTERVAL};

const DRM_DIR: &str = "/sys/class/drm";
const MIB: f64 = 1024.0 * 1024.0;

pub fn available() -> bool {
    !card_device_dirs().is_empty()
}

/// Sample amdgpu cards through the kernel sysfs interface. No CLI tools
/// needed: VRAM, busy percent, and power all come straight from the driver.
pub async fn run(data: &GpuDataMap, cancel: &CancellationToken) -> Result<()> {
    loop {
        let cards = card_device_dirs();
        if cards.is_empty() {
            bail!("No amdgpu cards under {DRM_DIR}");
        }

        for (index, device_path) in cards.iter().enumerate() {
            let Some(sample) = sample_card(device_path) else {
                continue;
            };
            accumulate(data, &index.to_string(), "AMD GPU", |gpu| {
                gpu.temperature = sample.temperature;
                gpu.mem_used = sample.mem_used;
                gpu.mem_total = sample.mem_total;
                gpu.usage += sample.usage;
                gpu.power += sample.power;
            });
        }

        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }
    }
}

#[derive(Debug, Default, PartialEq)]
struct CardSample {
    temperature: f64,
    mem_used: f64,
    mem_total: f64,
    usage: f64,
    power: f64,
}

/// Enumerate `/sys/class/drm/card<N>/device` dirs that expose amdgpu VRAM
/// counters, sorted by card index. "card0-DP-1" style connector entries
/// don't parse as an index and are skipped.
fn card_device_dirs() -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(DRM_DIR) else {
        return Vec::new();
    };
    let mut cards: Vec<(u32, PathBuf)> = entries
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name();
            let idx: u32 = name.to_string_lossy().strip_prefix("card")?.parse().ok()?;
            let device = entry.path().join("device");
            device
                .join("mem_info_vram_total")
                .exists()
                .then_some((idx, device))
        })
        .collect();
    cards.sort_by_key(|(idx, _)| *idx);
    cards.into_iter().map(|(_, path)| path).collect()
}

fn sample_card(device: &Path) -> Option<CardSample> {
    let vram_total = read_u64(&device.join("mem_info_vram_total"))?;
    let vram_used = read_u64(&device.join("mem_info_vram_used")).unwrap_or(0);
    let busy = read_u64(&device.join("gpu_busy_percent")).unwrap_or(0);

    Some(CardSample {
        temperature: hwmon_temp(device).unwrap_or(0.0),
        mem_used: vram_used as f64 / MIB,
        mem_total: vram_total as f64 / MIB,
        usage: busy as f64,
        power: hwmon_power(device).unwrap_or(0.0),
    })
}

/// First hwmon edge/junction temperature in °C (driver reports m°C).
fn hwmon_temp(device: &Path) -> Option<f64> {
    for hwmon in hwmon_dirs(device) {
        if let Some(raw) = read_u64(&hwmon.join("temp1_input")) {
            return Some(raw as f64 / 1000.0);
        }
    }
    None
}

/// Average (or instantaneous) power draw in watts (driver reports µW).
fn hwmon_power(device: &Path) -> Option<f64> {
    for hwmon in hwmon_dirs(device) {
        for file in ["power1_average", "power1_input"] {
            if let Some(raw) = read_u64(&hwmon.join(file)) {
                return Some(raw as f64 / 1_000_000.0);
            }
        }
    }
    None
}

fn hwmon_dirs(device: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(device.join("hwmon"))
        .map(|entries| entries.flatten().map(|e| e.path()).collect())
        .unwrap_or_default()
}

fn read_u64(path: &Path) -> Option<u64> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}
