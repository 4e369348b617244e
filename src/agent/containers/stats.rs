use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::types::{round2, ContainerHealth};

use super::ContainerError;

/// Memory readings above this are cgroup accounting glitches, not real.
const MAX_MEM_BYTES: u64 = 100 * 1024 * 1024 * 1024 * 1024;

/// Baselines carried between sampling rounds for one container.
#[derive(Debug, Clone, Default)]
pub struct ContainerBaseline {
    pub cpu_total: u64,
    pub cpu_system: u64,
    pub prev_read_time: Option<DateTime<Utc>>,
}

/// The fields we need out of one engine stats response, flattened from the
/// wire JSON so the math stays testable and independent of generated API
/// models.
#[derive(Debug, Clone, Default)]
pub struct RawSample {
    pub cpu_total: u64,
    /// Host-wide cpu time; absent on Windows engines.
    pub cpu_system: Option<u64>,
    pub online_cpus: u64,
    pub read_time: Option<DateTime<Utc>>,
    pub mem_usage: u64,
    pub mem_inactive_file: Option<u64>,
    pub mem_cache: Option<u64>,
    pub private_working_set: Option<u64>,
    pub net_rx: u64,
    pub net_tx: u64,
}

impl RawSample {
    /// Extract from the engine's stats JSON
    /// (`GET /containers/{id}/stats?stream=0&one-shot=1`).
    pub fn from_value(v: &Value) -> Self {
        let u64_at = |v: &Value, path: &[&str]| -> Option<u64> {
            let mut cur = v;
            for key in path {
                cur = cur.get(key)?;
            }
            cur.as_u64()
        };

        let (net_rx, net_tx) = v
            .get("networks")
            .and_then(Value::as_object)
            .map(|nets| {
                nets.values().fold((0u64, 0u64), |(rx, tx), n| {
                    (
                        rx + u64_at(n, &["rx_bytes"]).unwrap_or(0),
                        tx + u64_at(n, &["tx_bytes"]).unwrap_or(0),
                    )
                })
            })
            .unwrap_or((0, 0));

        Self {
            cpu_total: u64_at(v, &["cpu_stats", "cpu_usage", "total_usage"]).unwrap_or(0),
            cpu_system: u64_at(v, &["cpu_stats", "system_cpu_usage"]).filter(|n| *n > 0),
            online_cpus: u64_at(v, &["cpu_stats", "online_cpus"]).unwrap_or(1).max(1),
            read_time: v
                .get("read")
                .and_then(Value::as_str)
                .and_then(|s| s.parse::<DateTime<Utc>>().ok()),
            mem_usage: u64_at(v, &["memory_stats", "usage"]).unwrap_or(0),
            mem_inactive_file: u64_at(v, &["memory_stats", "stats", "inactive_file"]),
            mem_cache: u64_at(v, &["memory_stats", "stats", "cache"]),
            private_working_set: u64_at(v, &["memory_stats", "privateworkingset"]),
            net_rx,
            net_tx,
        }
    }
}

/// CPU percent relative to the whole host, advancing the baseline.
///
/// Linux engines expose host cpu time and the percent is Δcontainer/Δhost.
/// Windows engines don't; there the container's 100 ns tick delta is spread
/// over the wall-clock window times the cpu count.
pub fn cpu_percent(
    baseline: &mut ContainerBaseline,
    raw: &RawSample,
) -> Result<f64, ContainerError> {
    let pct = match raw.cpu_system {
        Some(system) => {
            let d_container = raw.cpu_total.saturating_sub(baseline.cpu_total);
            let d_system = system.saturating_sub(baseline.cpu_system);
            baseline.cpu_total = raw.cpu_total;
            baseline.cpu_system = system;
            if d_system == 0 {
                0.0
            } else {
                d_container as f64 / d_system as f64 * 100.0
            }
        }
        None => {
            let prev_read = baseline.prev_read_time;
            let d_ticks = raw.cpu_total.saturating_sub(baseline.cpu_total) as f64;
            baseline.cpu_total = raw.cpu_total;
            baseline.prev_read_time = raw.read_time;
            match (prev_read, raw.read_time) {
                (Some(prev), Some(now)) if now > prev => {
                    // Window in 100 ns units, scaled by how many cpus could
                    // have been ticking.
                    let window = (now - prev).num_nanoseconds().unwrap_or(0).max(0) as f64
                        / 100.0
                        * raw.online_cpus as f64;
                    if window > 0.0 {
                        d_ticks / window * 100.0
                    } else {
                        0.0
                    }
                }
                _ => 0.0,
            }
        }
    };

    if pct > 100.0 {
        return Err(ContainerError::BadSample("cpu percent above 100"));
    }
    Ok(round2(pct))
}

/// Memory in use. Linux subtracts the reclaimable page cache
/// (`inactive_file`, older engines report it as `cache`); Windows reports
/// the private working set directly.
pub fn memory_usage(raw: &RawSample) -> Result<u64, ContainerError> {
    if let Some(pws) = raw.private_working_set {
        return Ok(pws);
    }
    if raw.mem_usage == 0 {
        return Err(ContainerError::BadSample("zero memory usage"));
    }
    if raw.mem_usage > MAX_MEM_BYTES {
        return Err(ContainerError::BadSample("memory usage above 100 TiB"));
    }
    let reclaimable = raw
        .mem_inactive_file
        .or(raw.mem_cache)
        .unwrap_or(0)
        .min(raw.mem_usage);
    Ok(raw.mem_usage - reclaimable)
}

/// Normalize an engine status string: the parenthesized health suffix is
/// split off (Podman prefixes it with "health:"), and "About " noise is
/// dropped so "Up About an hour" reads "Up an hour".
pub fn parse_status(status: &str) -> (String, ContainerHealth) {
    let (text, health) = match (status.find('('), status.rfind(')')) {
        (Some(open), Some(close)) if close > open => {
            let inner = status[open + 1..close]
                .trim()
                .trim_start_matches("health:")
                .trim();
            let health = match inner {
                "healthy" => ContainerHealth::Healthy,
                "unhealthy" => ContainerHealth::Unhealthy,
                "starting" => ContainerHealth::Starting,
                _ => ContainerHealth::None,
            };
            (status[..open].trim_end(), health)
        }
        _ => (status.trim_end(), ContainerHealth::None),
    };
    (text.replace("About ", ""), health)
}

/// Engine status strings spell sub-minute uptimes with "second"
/// ("Up 30 seconds", "Up Less than a second").
pub fn is_recently_started(status: &str) -> bool {
    status.contains("second")
}
