use anyhow::{bail, Context, Result};
use tokio_util::sync::CancellationToken;

use super::{accumulate, tool_in_path, GpuDataMap, POLL_INTERVAL};

pub fn available() -> bool {
    tool_in_path("nvtop")
}

/// Cross-vendor fallback: poll `nvtop -s` snapshots. Values come back as
/// suffixed strings ("42%", "55C", "220W"), so everything parses leniently.
pub async fn run(data: &GpuDataMap, cancel: &CancellationToken) -> Result<()> {
    loop {
        let output = tokio::process::Command::new("nvtop")
            .arg("-s")
            .output()
            .await
            .context("Failed to run nvtop")?;
        if !output.status.success() {
            bail!("nvtop -s exited with {}", output.status);
        }

        let text = String::from_utf8_lossy(&output.stdout);
        let samples = parse_snapshot(&text);
        if samples.is_empty() {
            bail!("nvtop snapshot contained no devices");
        }
        for (index, sample) in samples.into_iter().enumerate() {
            accumulate(data, &format!("nvtop-{index}"), &sample.name, |gpu| {
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
pub(crate) struct NvtopSample {
    pub name: String,
    pub temperature: f64,
    pub mem_used: f64,
    pub mem_total: f64,
    pub usage: f64,
    pub power: f64,
}

/// Snapshot is a JSON array of device objects.
pub(crate) fn parse_snapshot(text: &str) -> Vec<NvtopSample> {
    let Ok(serde_json::Value::Array(devices)) = serde_json::from_str(text) else {
        return Vec::new();
    };
    devices
        .iter()
        .filter_map(|device| {
            let name = device.get("device_name")?.as_str()?.to_string();
            Some(NvtopSample {
                name,
                temperature: field_number(device, &["temp", "gpu_temp"]),
                mem_used: field_mib(device, "mem_used"),
                mem_total: field_mib(device, "mem_total"),
                usage: field_number(device, &["gpu_util"]),
                power: field_number(device, &["power_draw"]),
            })
        })
        .collect()
}

/// First present key, with trailing unit characters stripped ("55C" → 55).
fn field_number(device: &serde_json::Value, keys: &[&str]) -> f64 {
    keys.iter()
        .find_map(|k| device.get(k))
        .and_then(|v| v.as_str())
        .and_then(parse_leading_number)
        .unwrap_or(0.0)
}

/// Sizes come with binary-unit suffixes ("512MiB", "1.5GiB").
fn field_mib(device: &serde_json::Value, key: &str) -> f64 {
    let Some(raw) = device.get(key).and_then(|v| v.as_str()) else {
        return 0.0;
    };
    let Some(value) = parse_leading_number(raw) else {
        return 0.0;
    };
    if raw.ends_with("GiB") {
        value * 1024.0
    } else if raw.ends_with("KiB") {
        value / 1024.0
    } else {
        value
    }
}

fn parse_leading_number(s: &str) -> Option<f64> {
    let digits: String = s
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SNAPSHOT: &str = r#"[
        {"device_name":"NVIDIA GeForce RTX 3080","gpu_clock":"1710MHz","temp":"55C",
         "power_draw":"220W","gpu_util":"42%","mem_util":"10%",
         "mem_used":"1024MiB","mem_total":"10GiB"},
        {"device_name":"AMD Radeon RX 6800","gpu_temp":"61C","power_draw":"180W","gpu_util":"77%"}
    ]"#;

    #[test]
    fn snapshot_parses_all_devices() {
        let samples = parse_snapshot(SNAPSHOT);
        assert_eq!(samples.len(), 2);

        assert_eq!(samples[0].name, "NVIDIA GeForce RTX 3080");
        assert_eq!(samples[0].temperature, 55.0);
        assert_eq!(samples[0].usage, 42.0);
        assert_eq!(samples[0].power, 220.0);
        assert_eq!(samples[0].mem_used, 1024.0);
        assert_eq!(samples[0].mem_total, 10.0 * 1024.0);

        assert_eq!(samples[1].temperature, 61.0);
        assert_eq!(samples[1].mem_total, 0.0);
    }

    #[test]
    fn non_array_is_empty() {
        assert!(parse_snapshot("{}").is_empty());
        assert!(parse_snapshot("garbage").is_empty());
    }

    #[test]
    fn leading_number_parsing() {
        assert_eq!(parse_leading_number("42%"), Some(42.0));
        assert_eq!(parse_leading_number("1.5GiB"), Some(1.5));
        assert_eq!(parse_leading_number("N/A"), None);
    }
}
