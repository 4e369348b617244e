use std::process::Stdio;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::{accumulate, tool_in_path, GpuDataMap};

pub fn available() -> bool {
    tool_in_path("macmon")
}

/// Stream macmon's JSON pipe for Apple Silicon GPU metrics. Unified memory
/// has no meaningful per-GPU total, so memory fields stay zero.
pub async fn run(data: &GpuDataMap, cancel: &CancellationToken) -> Result<()> {
    let mut child = Command::new("macmon")
        .args(["pipe", "-i", "4000"])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .context("Failed to spawn macmon")?;

    let stdout = child.stdout.take().context("macmon stdout missing")?;
    let mut lines = BufReader::new(stdout).lines();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                child.kill().await.ok();
                return Ok(());
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if let Some(sample) = parse_line(&line) {
                        accumulate(data, "apple", "Apple GPU", |gpu| {
                            gpu.temperature = sample.temperature;
                            gpu.usage += sample.usage;
                            gpu.power += sample.power;
                        });
                    }
                }
                Ok(None) => {
                    child.wait().await.ok();
                    bail!("macmon exited");
                }
                Err(e) => {
                    child.kill().await.ok();
                    child.wait().await.ok();
                    return Err(e).context("Reading macmon output");
                }
            }
        }
    }
}

#[derive(Debug, Default, PartialEq)]
pub(crate) struct AppleSample {
    pub temperature: f64,
    pub usage: f64,
    pub power: f64,
}

/// One JSON document per line: `gpu_usage` is `[freq_mhz, fraction]`,
/// `gpu_power` is watts, temperature sits under `temp.gpu_temp_avg`.
pub(crate) fn parse_line(line: &str) -> Option<AppleSample> {
    let v: serde_json::Value = serde_json::from_str(line).ok()?;
    let usage = v
        .get("gpu_usage")
        .and_then(|u| u.get(1))
        .and_then(|f| f.as_f64())
        .map(|f| f * 100.0)?;
    Some(AppleSample {
        usage,
        power: v.get("gpu_power").and_then(|p| p.as_f64()).unwrap_or(0.0),
        temperature: v
            .get("temp")
            .and_then(|t| t.get("gpu_temp_avg"))
            .and_then(|t| t.as_f64())
            .unwrap_or(0.0),
    })
}
