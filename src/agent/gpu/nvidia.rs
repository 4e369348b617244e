use std::process::Stdio;

use anyhow::{bail, Context, Result};
use nvml_wrapper::enum_wrappers::device::TemperatureSensor;
use nvml_wrapper::Nvml;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{accumulate, tool_in_path, GpuDataMap, POLL_INTERVAL};

const MIB: f64 = 1024.0 * 1024.0;

pub fn available() -> bool {
    tool_in_path("nvidia-smi") || Nvml::init().is_ok()
}

/// Prefer the NVML library (no subprocess, richer errors); fall back to a
/// streaming nvidia-smi subprocess when the library won't load.
pub async fn run(data: &GpuDataMap, cancel: &CancellationToken) -> Result<()> {
    match Nvml::init() {
        Ok(nvml) => {
            info!("Collecting NVIDIA GPUs via NVML");
            run_nvml(nvml, data, cancel).await
        }
        Err(e) => {
            debug!(error = %e, "NVML unavailable — using nvidia-smi");
            run_smi(data, cancel).await
        }
    }
}

async fn run_nvml(nvml: Nvml, data: &GpuDataMap, cancel: &CancellationToken) -> Result<()> {
    loop {
        let count = nvml.device_count().context("NVML device count")?;
        if count == 0 {
            bail!("NVML reports no devices");
        }
        for index in 0..count {
            let Ok(device) = nvml.device_by_index(index) else {
                continue;
            };
            let name = device.name().unwrap_or_else(|_| "NVIDIA GPU".into());
            let temperature = device
                .temperature(TemperatureSensor::Gpu)
                .map(f64::from)
                .unwrap_or(0.0);
            let (mem_used, mem_total) = device
                .memory_info()
                .map(|m| (m.used as f64 / MIB, m.total as f64 / MIB))
                .unwrap_or((0.0, 0.0));
            let usage = device
                .utilization_rates()
                .map(|u| f64::from(u.gpu))
                .unwrap_or(0.0);
            let power = device
                .power_usage()
                .map(|mw| f64::from(mw) / 1000.0)
                .unwrap_or(0.0);

            accumulate(data, &index.to_string(), &name, |gpu| {
                gpu.temperature = temperature;
                gpu.mem_used = mem_used;
                gpu.mem_total = mem_total;
                gpu.usage += usage;
                gpu.power += power;
            });
        }

        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }
    }
}

async fn run_smi(data: &GpuDataMap, cancel: &CancellationToken) -> Result<()> {
    let mut child = Command::new("nvidia-smi")
        .args([
            "-l",
            "4",
            "--query-gpu=index,name,temperature.gpu,memory.used,memory.total,utilization.gpu,power.draw",
            "--format=csv,noheader,nounits",
        ])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .context("Failed to spawn nvidia-smi")?;

    let stdout = child.stdout.take().context("nvidia-smi stdout missing")?;
    let mut lines = BufReader::new(stdout).lines();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                child.kill().await.ok();
                return Ok(());
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if let Some(sample) = parse_smi_line(&line) {
                        accumulate(data, &sample.index, &sample.name, |gpu| {
                            gpu.temperature = sample.temperature;
                            gpu.mem_used = sample.mem_used;
                            gpu.mem_total = sample.mem_total;
                            gpu.usage += sample.usage;
                            gpu.power += sample.power;
                        });
                    }
                }
                Ok(None) => {
                    child.wait().await.ok();
                    bail!("nvidia-smi exited");
                }
                Err(e) => {
                    child.kill().await.ok();
                    child.wait().await.ok();
                    return Err(e).context("Reading nvidia-smi output");
                }
            }
        }
    }
}

#[derive(Debug, PartialEq)]
struct SmiSample {
    index: String,
    name: String,
    temperature: f64,
    mem_used: f64,
    mem_total: f64,
    usage: f64,
    power: f64,
}

/// One CSV row: index, name, temp °C, mem used MiB, mem total MiB,
/// utilization %, power W. Fields that fail to parse (e.g. "[N/A]") read
/// as zero rather than dropping the row.
fn parse_smi_line(line: &str) -> Option<SmiSample> {
    let parts: Vec<&str> = line.split(',').map(str::trim).collect();
    if parts.len() < 7 {
        return None;
    }
    let num = |s: &str| s.parse::<f64>().unwrap_or(0.0);
    Some(SmiSample {
        index: parts[0].to_string(),
        name: parts[1].to_string(),
        temperature: num(parts[2]),
        mem_used: num(parts[3]),
        mem_total: num(parts[4]),
        usage: num(parts[5]),
        power: num(parts[6]),
    })
}
