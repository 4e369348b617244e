use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Round to two decimal places — percent and rate fields are reported this way.
pub fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// One atomic sample of the whole host, produced under the agent's host lock
/// for a single polling interval. Callers treat a returned snapshot as
/// immutable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CombinedSnapshot {
    pub stats: HostStats,
    pub info: HostInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub containers: Option<Vec<ContainerStats>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub services: Option<Vec<ServiceStatus>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra_filesystems: Option<HashMap<String, ExtraFsStats>>,
}

/// Fast-changing host metrics for one sampling moment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostStats {
    /// Overall CPU utilization 0–100.
    pub cpu_pct: f64,
    pub cpu_user_pct: f64,
    pub cpu_system_pct: f64,
    pub cpu_iowait_pct: f64,
    pub cpu_steal_pct: f64,
    /// Per-core utilization 0–100, core order as the kernel reports it.
    pub per_core_pct: Vec<f64>,
    /// 1/5/15 minute load averages.
    pub load_avg: [f64; 3],

    pub mem_total: u64,
    pub mem_used: u64,
    pub mem_pct: f64,
    pub mem_buff_cache: u64,
    /// ZFS ARC size, already subtracted from `mem_used`. Zero when no ARC.
    pub mem_zfs_arc: u64,
    pub swap_total: u64,
    pub swap_used: u64,
    pub swap_pct: f64,

    /// Root filesystem usage, lifted from the tracked root record.
    pub disk_total: u64,
    pub disk_used: u64,
    pub disk_pct: f64,
    pub disk_read_bps: u64,
    pub disk_write_bps: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inodes_used_pct: Option<f64>,

    /// Bytes per second summed across non-excluded interfaces.
    pub net_sent_bps: u64,
    pub net_recv_bps: u64,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub nics: HashMap<String, NicStats>,

    /// Sensor name → °C. GPU-reported temperatures are merged in under the
    /// GPU's name.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub temperatures: HashMap<String, f64>,
    /// The configured primary sensor, or the hottest GPU when none is set.
    pub dashboard_temp: f64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery: Option<BatteryStats>,

    pub processes: ProcessCounts,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub gpu: HashMap<String, GpuSample>,
}

/// Per-interface byte counters and rates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NicStats {
    pub rx_total: u64,
    pub tx_total: u64,
    pub rx_bps: u64,
    pub tx_bps: u64,
}

/// Battery charge, best-effort from the platform power supply interface.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatteryStats {
    /// Charge percent 0–100.
    pub percent: f64,
    /// Charging state: 0 unknown, 1 charging, 2 discharging, 3 full.
    pub state: u8,
}

/// Process counts classified by scheduler state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessCounts {
    pub running: u32,
    pub sleeping: u32,
    pub disk_sleep: u32,
    pub zombie: u32,
    pub stopped: u32,
    pub idle: u32,
    pub other: u32,
}

impl ProcessCounts {
    /// Classify a single-letter kernel state code. Verbose status strings
    /// classify through their first letter after normalization.
    pub fn count(&mut self, code: char) {
        match code {
            'R' => self.running += 1,
            'S' => self.sleeping += 1,
            'D' => self.disk_sleep += 1,
            'Z' => self.zombie += 1,
            'T' | 't' => self.stopped += 1,
            'I' => self.idle += 1,
            _ => self.other += 1,
        }
    }
}

/// Slow-changing host identity and platform facts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostInfo {
    pub hostname: String,
    pub kernel_version: String,
    pub cpu_model: String,
    /// Physical core count.
    pub cores: u32,
    /// Logical CPU count; omitted when equal to `cores`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threads: Option<u32>,
    pub os_name: String,
    pub uptime_secs: u64,
    pub agent_version: String,
    /// Count of systemd services in the failed state; absent on platforms
    /// without systemd.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub services_failed: Option<u64>,
}

/// Container health as reported by the engine, normalized from the
/// parenthesized suffix of the status string.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerHealth {
    #[default]
    None,
    Starting,
    Healthy,
    Unhealthy,
}

/// Per-container sample keyed by the stable 12-character short id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerStats {
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: String,
    pub health: ContainerHealth,
    /// CPU utilization 0–100 relative to the whole host.
    pub cpu_pct: f64,
    pub mem_bytes: u64,
    pub net_sent_bps: u64,
    pub net_recv_bps: u64,
}

/// Consumer-facing GPU sample: usage and power averaged over the caller's
/// interval, temperature and memory instantaneous.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GpuSample {
    pub name: String,
    pub temperature: f64,
    pub mem_used: f64,
    pub mem_total: f64,
    /// Average utilization percent since the caller's last visit.
    pub usage: f64,
    /// Average power draw in watts since the caller's last visit.
    pub power: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub power_pkg: Option<f64>,
    /// Per-engine busy percent (Intel only).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub engines: HashMap<String, f64>,
}

/// SMART health for one physical device, keyed by serial number.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SmartData {
    pub device_name: String,
    pub device_type: String,
    pub serial_number: String,
    pub model_name: String,
    pub capacity: u64,
    /// Overall self-assessment: "PASSED", "FAILED", or "" when unknown.
    pub status: String,
    pub temperature: i64,
    pub attributes: Vec<SmartAttribute>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SmartAttribute {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u32>,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worst: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_value: Option<i64>,
}

/// One systemd service unit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub name: String,
    pub load_state: String,
    pub active_state: String,
    pub sub_state: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

/// Aggregate service counters surfaced to the info block.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ServiceSummary {
    pub total: u64,
    pub failed: u64,
}

/// Usage for a filesystem tracked beyond the root.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtraFsStats {
    pub disk_total: u64,
    pub disk_used: u64,
    pub disk_read_bps: u64,
    pub disk_write_bps: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inodes_used_pct: Option<f64>,
}

/// Payload of the fingerprint handshake reply. Hostname and port let the
/// hub fall back to the SSH transport for this host.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FingerprintRecord {
    pub fingerprint: String,
    pub hostname: String,
    pub port: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round2_rounds_half_up() {
        assert_eq!(round2(1.005), 1.01);
        assert_eq!(round2(33.333333), 33.33);
        assert_eq!(round2(0.0), 0.0);
    }

    #[test]
    fn process_counts_classify_state_codes() {
        let mut c = ProcessCounts::default();
        for code in ['R', 'S', 'D', 'Z', 'T', 't', 'I', 'X'] {
            c.count(code);
        }
        assert_eq!(c.running, 1);
        assert_eq!(c.sleeping, 1);
        assert_eq!(c.disk_sleep, 1);
        assert_eq!(c.zombie, 1);
        assert_eq!(c.stopped, 2);
        assert_eq!(c.idle, 1);
        assert_eq!(c.other, 1);
    }

    #[test]
    fn container_health_serializes_lowercase() {
        let json = serde_json::to_string(&ContainerHealth::Healthy).unwrap();
        assert_eq!(json, "\"healthy\"");
    }
}
