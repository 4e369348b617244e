use std::process::Stdio;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::{accumulate, tool_in_path, GpuDataMap};

pub fn available() -> bool {
    tool_in_path("intel_gpu_top")
}

/// Engine column prefixes in intel_gpu_top's CSV output, mapped to the
/// names consumers see.
const ENGINES: &[(&str, &str)] = &[
    ("RCS", "Render/3D"),
    ("BCS", "Blitter"),
    ("VCS", "Video"),
    ("VECS", "VideoEnhance"),
    ("CCS", "Compute"),
];

/// Stream `intel_gpu_top -c` and accumulate engine busy percentages.
/// `usage` is the busiest engine; package power is tracked separately from
/// GPU power.
pub async fn run(data: &GpuDataMap, cancel: &CancellationToken) -> Result<()> {
    let mut child = Command::new("intel_gpu_top")
        .args(["-c", "-s", "4000"])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .context("Failed to spawn intel_gpu_top")?;

    let stdout = child.stdout.take().context("intel_gpu_top stdout missing")?;
    let mut lines = BufReader::new(stdout).lines();
    let mut parser = CsvParser::default();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                child.kill().await.ok();
                return Ok(());
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if let Some(sample) = parser.feed(&line) {
                        accumulate(data, "intel", "Intel GPU", |gpu| {
                            gpu.usage += sample.usage;
                            gpu.power += sample.power;
                            gpu.power_pkg += sample.power_pkg;
                            for (engine, busy) in &sample.engines {
                                *gpu.engines.entry(engine.clone()).or_insert(0.0) += busy;
                            }
                        });
                    }
                }
                Ok(None) => {
                    child.wait().await.ok();
                    bail!("intel_gpu_top exited");
                }
                Err(e) => {
                    child.kill().await.ok();
                    child.wait().await.ok();
                    return Err(e).context("Reading intel_gpu_top output");
                }
            }
        }
    }
}

#[derive(Debug, Default, PartialEq)]
pub(crate) struct IntelSample {
    pub usage: f64,
    pub power: f64,
    pub power_pkg: f64,
    pub engines: Vec<(String, f64)>,
}

/// Incremental parser for the CSV stream. intel_gpu_top re-emits its header
/// row periodically; any row whose first field isn't numeric refreshes the
/// column map.
#[derive(Debug, Default)]
pub(crate) struct CsvParser {
    power_gpu_col: Option<usize>,
    power_pkg_col: Option<usize>,
    engine_cols: Vec<(String, usize)>,
}

impl CsvParser {
    /// Feed one line; returns a sample for data rows once a header has been
    /// seen.
    pub(crate) fn feed(&mut self, line: &str) -> Option<IntelSample> {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.is_empty() || fields[0].is_empty() {
            return None;
        }
        if fields[0].parse::<f64>().is_err() {
            self.parse_header(&fields);
            return None;
        }
        if self.engine_cols.is_empty() && self.power_gpu_col.is_none() {
            return None; // data before any header — can't map columns
        }

        let value = |col: Option<usize>| {
            col.and_then(|i| fields.get(i))
                .and_then(|s| s.parse::<f64>().ok())
                .unwrap_or(0.0)
        };

        let engines: Vec<(String, f64)> = self
            .engine_cols
            .iter()
            .map(|(name, col)| (name.clone(), value(Some(*col))))
            .collect();
        let usage = engines
            .iter()
            .map(|(_, busy)| *busy)
            .fold(0.0, f64::max);

        Some(IntelSample {
            usage,
            power: value(self.power_gpu_col),
            power_pkg: value(self.power_pkg_col),
            engines,
        })
    }

    fn parse_header(&mut self, fields: &[&str]) {
        self.power_gpu_col = None;
        self.power_pkg_col = None;
        self.engine_cols.clear();

        for (idx, field) in fields.iter().enumerate() {
            match *field {
                "Power W gpu" | "Power gpu" => self.power_gpu_col = Some(idx),
                "Power W pkg" | "Power pkg" => self.power_pkg_col = Some(idx),
                _ => {
                    // Busy columns look like "RCS %"; per-engine "se"/"wa"
                    // columns are ignored.
                    if let Some(prefix) = field.strip_suffix(" %") {
                        if let Some((_, name)) =
                            ENGINES.iter().find(|(p, _)| *p == prefix)
                        {
                            self.engine_cols.push((name.to_string(), idx));
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "Freq MHz req,Freq MHz act,IRQ /s,RC6 %,Power W gpu,Power W pkg,RCS %,RCS se,RCS wa,BCS %,BCS se,BCS wa,VCS %,VCS se,VCS wa,VECS %,VECS se,VECS wa";

    #[test]
    fn header_then_data_row() {
        let mut p = CsvParser::default();
        assert!(p.feed(HEADER).is_none());

        let sample = p
            .feed("300,350,120,85.0,4.25,12.50,61.0,0,0,2.0,0,0,33.0,0,0,5.0,0,0")
            .unwrap();
        assert_eq!(sample.power, 4.25);
        assert_eq!(sample.power_pkg, 12.5);
        // usage is the max engine busy (Render/3D at 61%).
        assert_eq!(sample.usage, 61.0);
        assert!(sample
            .engines
            .contains(&("Render/3D".to_string(), 61.0)));
        assert!(sample.engines.contains(&("Video".to_string(), 33.0)));
        assert_eq!(sample.engines.len(), 4);
    }

    #[test]
    fn data_before_header_is_dropped() {
        let mut p = CsvParser::default();
        assert!(p.feed("300,350,120,85.0,4.25").is_none());
    }

    #[test]
    fn header_reemission_remaps_columns() {
        let mut p = CsvParser::default();
        p.feed(HEADER);
        p.feed("300,350,120,85.0,1.0,2.0,10.0,0,0,0,0,0,0,0,0,0,0,0");

        // New header with fewer engines.
        p.feed("Freq MHz req,Power W gpu,RCS %");
        let sample = p.feed("300,3.5,99.0").unwrap();
        assert_eq!(sample.power, 3.5);
        assert_eq!(sample.usage, 99.0);
        assert_eq!(sample.engines.len(), 1);
    }

    #[test]
    fn idle_engines_zero_usage() {
        let mut p = CsvParser::default();
        p.feed(HEADER);
        let sample = p
            .feed("300,350,0,95.0,0.5,1.2,0.0,0,0,0.0,0,0,0.0,0,0,0.0,0,0")
            .unwrap();
        assert_eq!(sample.usage, 0.0);
    }
}
