pub mod parser;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::config::{lookup_env, AgentConfig};
use crate::types::SmartData;

use self::parser::ParserType;

/// How long cached records are served before the tool is invoked again.
const STALE_AFTER: Duration = Duration::from_secs(120);

/// One device to inspect, with an optional `-d` type hint.
#[derive(Debug, Clone, PartialEq, Eq)]
struct DeviceRef {
    name: String,
    type_hint: Option<String>,
}

/// Periodically inspects disks with smartctl and keeps per-serial health
/// records.
pub struct SmartManager {
    separator: String,
    initial_devices: Option<String>,
    initial_exclude: Vec<String>,
    records: RwLock<HashMap<String, SmartData>>,
    /// Sticky verified parser types, keyed by device name.
    verified_types: Mutex<HashMap<String, ParserType>>,
    last_refresh: Mutex<Option<Instant>>,
}

impl SmartManager {
    pub fn new(config: &AgentConfig) -> Option<Self> {
        if !crate::agent::tool_in_path("smartctl") {
            debug!("smartctl not found — SMART monitoring disabled");
            return None;
        }
        Some(Self {
            separator: config.smart_devices_separator.clone(),
            initial_devices: config.smart_devices.clone(),
            initial_exclude: config.exclude_smart.clone(),
            records: RwLock::new(HashMap::new()),
            verified_types: Mutex::new(HashMap::new()),
            last_refresh: Mutex::new(None),
        })
    }

    /// Current records, refreshing first when the cache has gone stale.
    pub async fn data(&self) -> HashMap<String, SmartData> {
        let stale = {
            let last = self.last_refresh.lock().await;
            last.map(|t| t.elapsed() >= STALE_AFTER).unwrap_or(true)
        };
        if stale {
            self.refresh().await;
            *self.last_refresh.lock().await = Some(Instant::now());
        }
        self.records.read().await.clone()
    }

    /// One inspection cycle: re-read the device and exclusion lists from the
    /// environment, discover devices, run the tool per device, and replace
    /// the record map wholesale (which also prunes unplugged disks).
    async fn refresh(&self) {
        let exclude = self.current_exclusions();
        let devices = match self.current_devices().await {
            Some(devices) => devices,
            None => return,
        };

        let mut fresh: HashMap<String, SmartData> = HashMap::new();
        for device in devices {
            if is_excluded(&device.name, &exclude) {
                continue;
            }
            let Some(json) = run_smartctl(&device).await else {
                continue;
            };
            if parser::is_virtual(&json) {
                debug!(device = %device.name, "Skipping virtual device");
                continue;
            }
            let sticky = {
                let types = self.verified_types.lock().await;
                types.get(&device.name).copied()
            };
            match parser::parse_output(&json, sticky) {
                Ok((data, parser_type)) => {
                    if data.serial_number.is_empty() {
                        debug!(device = %device.name, "No serial number — skipping");
                        continue;
                    }
                    self.verified_types
                        .lock()
                        .await
                        .insert(device.name.clone(), parser_type);
                    fresh.insert(data.serial_number.clone(), data);
                }
                Err(e) => warn!(device = %device.name, error = %e, "Failed to parse smartctl output"),
            }
        }

        *self.records.write().await = fresh;
    }

    /// SMART_DEVICES from the environment (refreshed each cycle) or the
    /// startup configuration; a scan when neither is set.
    async fn current_devices(&self) -> Option<Vec<DeviceRef>> {
        let overrides = lookup_env("SMART_DEVICES").or_else(|| self.initial_devices.clone());
        if let Some(raw) = overrides {
            return Some(parse_overrides(&raw, &self.separator));
        }
        scan_devices().await
    }

    fn current_exclusions(&self) -> Vec<String> {
        lookup_env("EXCLUDE_SMART")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_else(|| self.initial_exclude.clone())
    }
}

#[derive(Debug, Deserialize)]
struct ScanOutput {
    devices: Option<Vec<ScanDevice>>,
}

#[derive(Debug, Deserialize)]
struct ScanDevice {
    name: Option<String>,
    #[serde(rename = "type")]
    device_type: Option<String>,
}

async fn scan_devices() -> Option<Vec<DeviceRef>> {
    let output = tokio::process::Command::new("smartctl")
        .args(["--scan", "-j"])
        .output()
        .await
        .ok()?;
    parse_scan(&String::from_utf8_lossy(&output.stdout))
}

async fn run_smartctl(device: &DeviceRef) -> Option<String> {
    let mut cmd = tokio::process::Command::new("smartctl");
    cmd.arg("-aj");
    if let Some(hint) = &device.type_hint {
        cmd.args(["-d", hint]);
    }
    cmd.arg(&device.name);

    // smartctl exits non-zero for failing disks while still emitting valid
    // JSON, so only an empty stdout counts as a failed run.
    let output = cmd.output().await.ok()?;
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    if stdout.trim().is_empty() {
        warn!(device = %device.name, status = %output.status, "smartctl produced no output");
        return None;
    }
    Some(stdout)
}

fn parse_scan(json: &str) -> Option<Vec<DeviceRef>> {
    let scan: ScanOutput = serde_json::from_str(json).ok()?;
    Some(
        scan.devices?
            .into_iter()
            .filter_map(|d| {
                Some(DeviceRef {
                    name: d.name?,
                    type_hint: d.device_type,
                })
            })
            .collect(),
    )
}

/// `device:type` pairs split on the configured separator; the type half is
/// optional.
fn parse_overrides(raw: &str, separator: &str) -> Vec<DeviceRef> {
    raw.split(separator)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| match entry.split_once(':') {
            Some((name, hint)) if !hint.is_empty() => DeviceRef {
                name: name.to_string(),
                type_hint: Some(hint.to_string()),
            },
            _ => DeviceRef {
                name: entry.to_string(),
                type_hint: None,
            },
        })
        .collect()
}

/// Excluded when the exclusion list names the device path or its short name.
fn is_excluded(name: &str, exclude: &[String]) -> bool {
    let short = name.rsplit('/').next().unwrap_or(name);
    exclude
        .iter()
        .any(|e| e == name || e == short)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCAN_JSON: &str = r#"{
        "devices": [
            {"name": "/dev/sda", "type": "sat", "protocol": "ATA"},
            {"name": "/dev/nvme0", "type": "nvme", "protocol": "NVMe"}
        ]
    }"#;

    #[test]
    fn scan_output_parses() {
        let devices = parse_scan(SCAN_JSON).unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].name, "/dev/sda");
        assert_eq!(devices[0].type_hint.as_deref(), Some("sat"));
    }

    #[test]
    fn scan_without_devices_is_none() {
        assert!(parse_scan("{}").is_none());
        assert!(parse_scan("garbage").is_none());
    }

    #[test]
    fn overrides_with_types() {
        let devices = parse_overrides("/dev/sda:sat,/dev/nvme0:nvme", ",");
        assert_eq!(
            devices,
            vec![
                DeviceRef {
                    name: "/dev/sda".into(),
                    type_hint: Some("sat".into()),
                },
                DeviceRef {
                    name: "/dev/nvme0".into(),
                    type_hint: Some("nvme".into()),
                },
            ]
        );
    }

    #[test]
    fn overrides_without_type_and_custom_separator() {
        let devices = parse_overrides("/dev/sda|/dev/sdb:scsi", "|");
        assert_eq!(devices[0].type_hint, None);
        assert_eq!(devices[1].type_hint.as_deref(), Some("scsi"));
    }

    #[test]
    fn exclusion_matches_path_or_short_name() {
        let exclude = vec!["sda".to_string(), "/dev/nvme1".to_string()];
        assert!(is_excluded("/dev/sda", &exclude));
        assert!(is_excluded("/dev/nvme1", &exclude));
        assert!(!is_excluded("/dev/nvme0", &exclude));
    }
}
