use std::process::Stdio;

use anyhow::{bail, Context, Result};
use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::{accumulate, tool_in_path, GpuDataMap};

pub fn available() -> bool {
    tool_in_path("tegrastats")
}

/// Stream tegrastats and accumulate the integrated GPU's counters. Jetson
/// boards have no discrete device enumeration — everything reports under a
/// single id.
pub async fn run(data: &GpuDataMap, cancel: &CancellationToken) -> Result<()> {
    let mut child = Command::new("tegrastats")
        .args(["--interval", "4000"])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .context("Failed to spawn tegrastats")?;

    let stdout = child.stdout.take().context("tegrastats stdout missing")?;
    let mut lines = BufReader::new(stdout).lines();
    let parser = LineParser::new();
    let name = board_model();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                child.kill().await.ok();
                return Ok(());
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if let Some(sample) = parser.parse(&line) {
                        accumulate(data, "jetson", &name, |gpu| {
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
                    bail!("tegrastats exited");
                }
                Err(e) => {
                    child.kill().await.ok();
                    child.wait().await.ok();
                    return Err(e).context("Reading tegrastats output");
                }
            }
        }
    }
}

#[derive(Debug, Default, PartialEq)]
pub(crate) struct JetsonSample {
    pub temperature: f64,
    pub mem_used: f64,
    pub mem_total: f64,
    pub usage: f64,
    pub power: f64,
}

pub(crate) struct LineParser {
    ram: Regex,
    gr3d: Regex,
    temp: Regex,
    power: Regex,
}

impl LineParser {
    pub(crate) fn new() -> Self {
        Self {
            ram: Regex::new(r"RAM (\d+)/(\d+)MB").expect("valid pattern"),
            gr3d: Regex::new(r"GR3D_FREQ (\d+)%").expect("valid pattern"),
            // Orin reports tj@, older boards GPU@.
            temp: Regex::new(r"(?:tj|GPU)@([\d.]+)C").expect("valid pattern"),
            // VDD_GPU_SOC on Orin, POM_5V_GPU on Nano; first value is the
            // instantaneous draw in mW.
            power: Regex::new(r"(?:VDD_GPU_SOC|POM_5V_GPU) (\d+)mW").expect("valid pattern"),
        }
    }

    pub(crate) fn parse(&self, line: &str) -> Option<JetsonSample> {
        let ram = self.ram.captures(line)?;
        let num = |m: Option<regex::Match>| {
            m.and_then(|m| m.as_str().parse::<f64>().ok()).unwrap_or(0.0)
        };
        Some(JetsonSample {
            mem_used: num(ram.get(1)),
            mem_total: num(ram.get(2)),
            usage: self
                .gr3d
                .captures(line)
                .map(|c| num(c.get(1)))
                .unwrap_or(0.0),
            temperature: self
                .temp
                .captures(line)
                .map(|c| num(c.get(1)))
                .unwrap_or(0.0),
            power: self
                .power
                .captures(line)
                .map(|c| num(c.get(1)) / 1000.0)
                .unwrap_or(0.0),
        })
    }
}

fn board_model() -> String {
    std::fs::read_to_string("/proc/device-tree/model")
        .map(|s| s.trim_end_matches('\0').trim().to_string())
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "Jetson".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORIN_LINE: &str = "11-14-2024 RAM 3162/7772MB (lfb 2x4MB) SWAP 0/3886MB (cached 0MB) \
CPU [2%@1479,1%@1479,0%@1479,0%@1479] EMC_FREQ 0% GR3D_FREQ 37% cpu@42.5C soc2@41.6C \
soc0@42.3C gpu@41.9C tj@42.5C soc1@41.5C VDD_IN 4987mW/4987mW VDD_CPU_GPU_CV 570mW/570mW \
VDD_GPU_SOC 2000mW/2000mW";

    const NANO_LINE: &str = "RAM 1812/3956MB (lfb 2x1MB) CPU [10%@1428,off,off,5%@1428] \
EMC_FREQ 0% GR3D_FREQ 12% PLL@31C CPU@33.5C PMIC@100C GPU@31.5C AO@39C thermal@32.75C \
POM_5V_IN 2234mW/2234mW POM_5V_GPU 124mW/124mW POM_5V_CPU 457mW/457mW";

    #[test]
    fn orin_line_parses() {
        let s = LineParser::new().parse(ORIN_LINE).unwrap();
        assert_eq!(s.mem_used, 3162.0);
        assert_eq!(s.mem_total, 7772.0);
        assert_eq!(s.usage, 37.0);
        assert_eq!(s.temperature, 42.5);
        assert_eq!(s.power, 2.0);
    }

    #[test]
    fn nano_line_parses_gpu_rail_and_temp() {
        let s = LineParser::new().parse(NANO_LINE).unwrap();
        assert_eq!(s.usage, 12.0);
        assert_eq!(s.temperature, 31.5);
        assert_eq!(s.power, 0.124);
    }

    #[test]
    fn line_without_ram_is_rejected() {
        assert!(LineParser::new().parse("GR3D_FREQ 12%").is_none());
    }
}
