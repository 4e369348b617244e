pub mod amd;
pub mod apple;
pub mod intel;
pub mod jetson;
pub mod nvidia;
pub mod nvtop;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub(crate) use super::tool_in_path;

use crate::types::{round2, GpuSample};

/// How long a collector sleeps between subprocess restarts.
const RESTART_DELAY: Duration = Duration::from_secs(5);

/// Sampling cadence for collectors that poll rather than stream.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_secs(4);

/// Accumulating state for one GPU. Collectors add every sample into the
/// accumulators and bump `count`; consumers average over their own window
/// by differencing against a per-interval snapshot. Temperature and memory
/// are instantaneous.
#[derive(Debug, Clone, Default)]
pub struct GpuData {
    pub name: String,
    pub temperature: f64,
    pub mem_used: f64,
    pub mem_total: f64,
    pub usage: f64,
    pub power: f64,
    pub power_pkg: f64,
    pub engines: HashMap<String, f64>,
    pub count: u64,
}

/// Shared map written by collector tasks, read by the sampling engine.
pub type GpuDataMap = Arc<RwLock<HashMap<String, GpuData>>>;

/// Collector sources a priority list can name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Source {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Jetson,
    /// Cross-vendor fallback (nvtop).
    Fallback,
}

impl Source {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "nvidia" | "nvidia-smi" | "nvml" => Some(Self::Nvidia),
            "amd" | "amdgpu" => Some(Self::Amd),
            "intel" | "intel_gpu_top" => Some(Self::Intel),
            "apple" | "macmon" => Some(Self::Apple),
            "jetson" | "tegrastats" => Some(Self::Jetson),
            "nvtop" => Some(Self::Fallback),
            _ => None,
        }
    }

    /// Vendor group within which at most one collector may run. The
    /// fallback has no group — it replaces all of them.
    fn group(&self) -> &'static str {
        match self {
            Self::Nvidia | Self::Jetson => "nvidia",
            Self::Amd => "amd",
            Self::Intel => "intel",
            Self::Apple => "apple",
            Self::Fallback => "fallback",
        }
    }
}

/// Per-interval baseline for one GPU: the accumulator values at the
/// caller's last visit plus the averages computed then (reused when no new
/// sample has landed but the GPU is still active).
#[derive(Debug, Clone, Default)]
struct IntervalBaseline {
    usage: f64,
    power: f64,
    power_pkg: f64,
    engines: HashMap<String, f64>,
    count: u64,
    last_usage_avg: f64,
    last_power_avg: f64,
    last_power_pkg_avg: f64,
    last_engine_avgs: HashMap<String, f64>,
}

/// Supervises vendor collector subprocess tasks and serves interval-scoped
/// averages out of the shared data map.
pub struct GpuSupervisor {
    data: GpuDataMap,
    baselines: Mutex<HashMap<u16, HashMap<String, IntervalBaseline>>>,
    max_retries: u32,
    cancel: CancellationToken,
}

impl GpuSupervisor {
    /// Detect available collectors, apply the priority list, and spawn one
    /// task per winner. Returns None when nothing is detected.
    pub fn start(
        priority: Option<&str>,
        max_retries: u32,
        cancel: CancellationToken,
    ) -> Option<Arc<Self>> {
        let detected = detect();
        if detected.is_empty() {
            info!("No GPU tooling detected");
            return None;
        }
        let selected = select(priority, &detected);
        if selected.is_empty() {
            info!("No GPU collector selected");
            return None;
        }

        let supervisor = Arc::new(Self {
            data: Arc::new(RwLock::new(HashMap::new())),
            baselines: Mutex::new(HashMap::new()),
            max_retries,
            cancel,
        });

        for source in &selected {
            supervisor.spawn_collector(*source, priority.map(str::to_string));
        }
        Some(supervisor)
    }

    #[cfg(test)]
    fn new_for_tests() -> Arc<Self> {
        Arc::new(Self {
            data: Arc::new(RwLock::new(HashMap::new())),
            baselines: Mutex::new(HashMap::new()),
            max_retries: 5,
            cancel: CancellationToken::new(),
        })
    }

    fn spawn_collector(self: &Arc<Self>, source: Source, priority: Option<String>) {
        let supervisor = self.clone();
        info!(source = ?source, "Starting GPU collector");
        tokio::spawn(async move {
            supervisor.run_collector(source, priority).await;
        });
    }

    /// Run one collector with restart-on-failure, capped by `max_retries`.
    /// A permanently failed fallback re-invokes selection over the rest of
    /// the priority list.
    async fn run_collector(self: Arc<Self>, source: Source, priority: Option<String>) {
        let mut failures = 0u32;
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            let result = match source {
                Source::Nvidia => nvidia::run(&self.data, &self.cancel).await,
                Source::Amd => amd::run(&self.data, &self.cancel).await,
                Source::Intel => intel::run(&self.data, &self.cancel).await,
                Source::Apple => apple::run(&self.data, &self.cancel).await,
                Source::Jetson => jetson::run(&self.data, &self.cancel).await,
                Source::Fallback => nvtop::run(&self.data, &self.cancel).await,
            };

            match result {
                // Clean exit: cancellation.
                Ok(()) => return,
                Err(e) => {
                    failures += 1;
                    warn!(
                        source = ?source,
                        error = %e,
                        failures,
                        "GPU collector failed"
                    );
                    if failures > self.max_retries {
                        warn!(source = ?source, "GPU collector giving up");
                        if source == Source::Fallback {
                            self.reselect_after_fallback(priority.as_deref());
                        }
                        return;
                    }
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(RESTART_DELAY) => {}
            }
        }
    }

    /// The fallback died for good: pick vendor collectors from the rest of
    /// the priority list as if the fallback had never been listed.
    fn reselect_after_fallback(self: &Arc<Self>, priority: Option<&str>) {
        let remaining: Option<String> = priority.map(|p| {
            p.split(',')
                .filter(|e| Source::parse(e) != Some(Source::Fallback))
                .collect::<Vec<_>>()
                .join(",")
        });
        let detected: Vec<Source> = detect()
            .into_iter()
            .filter(|s| *s != Source::Fallback)
            .collect();
        let selected = select(remaining.as_deref(), &detected);
        info!(selected = ?selected, "Reselecting GPU collectors after fallback failure");
        for source in selected {
            self.spawn_collector(source, remaining.clone());
        }
    }

    /// Averages since this interval key's last visit.
    ///
    /// When no new sample has landed (Δcount == 0), the previously computed
    /// averages are returned only if the GPU is demonstrably active —
    /// non-zero instantaneous temperature or memory. A silent *and* cold
    /// GPU reads as zeros: "no new data" and "suspended" are distinguished
    /// by the instantaneous fields, not the accumulators.
    pub fn current_data(&self, interval_ms: u16) -> HashMap<String, GpuSample> {
        let data = self.data.read().unwrap_or_else(|e| e.into_inner());
        let mut baselines = self.baselines.lock().unwrap_or_else(|e| e.into_inner());
        let per_key = baselines.entry(interval_ms).or_default();

        let mut out = HashMap::new();
        for (id, gpu) in data.iter() {
            let baseline = per_key.entry(id.clone()).or_default();
            let d_count = gpu.count.saturating_sub(baseline.count);

            let mut sample = GpuSample {
                name: gpu.name.clone(),
                temperature: round2(gpu.temperature),
                mem_used: round2(gpu.mem_used),
                mem_total: round2(gpu.mem_total),
                ..Default::default()
            };

            if d_count == 0 {
                let active = gpu.temperature > 0.0 || gpu.mem_used > 0.0;
                if active {
                    sample.usage = baseline.last_usage_avg;
                    sample.power = baseline.last_power_avg;
                    if baseline.last_power_pkg_avg > 0.0 {
                        sample.power_pkg = Some(baseline.last_power_pkg_avg);
                    }
                    sample.engines = baseline.last_engine_avgs.clone();
                }
            } else {
                let n = d_count as f64;
                sample.usage = round2((gpu.usage - baseline.usage) / n);
                sample.power = round2((gpu.power - baseline.power) / n);
                if gpu.power_pkg > 0.0 {
                    sample.power_pkg =
                        Some(round2((gpu.power_pkg - baseline.power_pkg) / n));
                }
                for (engine, acc) in &gpu.engines {
                    let prev = baseline.engines.get(engine).copied().unwrap_or(0.0);
                    sample
                        .engines
                        .insert(engine.clone(), round2((acc - prev) / n));
                }

                *baseline = IntervalBaseline {
                    usage: gpu.usage,
                    power: gpu.power,
                    power_pkg: gpu.power_pkg,
                    engines: gpu.engines.clone(),
                    count: gpu.count,
                    last_usage_avg: sample.usage,
                    last_power_avg: sample.power,
                    last_power_pkg_avg: sample.power_pkg.unwrap_or(0.0),
                    last_engine_avgs: sample.engines.clone(),
                };
            }

            out.insert(id.clone(), sample);
        }
        out
    }
}

/// Add one sample into the shared map. Collectors call this for every
/// reading they parse.
pub(crate) fn accumulate(
    data: &GpuDataMap,
    id: &str,
    name: &str,
    update: impl FnOnce(&mut GpuData),
) {
    let mut map = data.write().unwrap_or_else(|e| e.into_inner());
    let entry = map.entry(id.to_string()).or_insert_with(|| GpuData {
        name: name.to_string(),
        ..Default::default()
    });
    if entry.name.is_empty() && !name.is_empty() {
        entry.name = name.to_string();
    }
    update(entry);
    entry.count += 1;
}

/// Probe which collector tools exist on this host. Jetson overrides
/// everything: a Tegra board's iGPU is invisible to the regular NVIDIA
/// tooling paths.
fn detect() -> Vec<Source> {
    if jetson::available() {
        return vec![Source::Jetson];
    }
    let mut detected = Vec::new();
    if nvidia::available() {
        detected.push(Source::Nvidia);
    }
    if amd::available() {
        detected.push(Source::Amd);
    }
    if intel::available() {
        detected.push(Source::Intel);
    }
    if apple::available() {
        detected.push(Source::Apple);
    }
    if nvtop::available() {
        detected.push(Source::Fallback);
    }
    detected
}

/// Resolve the priority list against the detected set: one collector per
/// vendor group; the fallback only when listed first and no vendor group
/// was chosen; unknown entries warned and ignored. No list means every
/// detected vendor-specific collector runs.
fn select(priority: Option<&str>, detected: &[Source]) -> Vec<Source> {
    let Some(priority) = priority.filter(|p| !p.trim().is_empty()) else {
        return detected
            .iter()
            .copied()
            .filter(|s| *s != Source::Fallback)
            .collect();
    };

    let mut selected: Vec<Source> = Vec::new();
    let mut taken_groups: Vec<&'static str> = Vec::new();

    for (idx, entry) in priority.split(',').enumerate() {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let Some(source) = Source::parse(entry) else {
            warn!(entry, "Unknown GPU collector source — ignoring");
            continue;
        };
        if !detected.contains(&source) {
            continue;
        }
        if source == Source::Fallback {
            if idx == 0 && selected.is_empty() {
                return vec![Source::Fallback];
            }
            continue;
        }
        if taken_groups.contains(&source.group()) {
            continue;
        }
        taken_groups.push(source.group());
        selected.push(source);
    }
    selected
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_sample(data: &GpuDataMap, id: &str, usage: f64, power: f64, temp: f64) {
        accumulate(data, id, "Test GPU", |gpu| {
            gpu.temperature = temp;
            gpu.usage += usage;
            gpu.power += power;
        });
    }

    // -----------------------------------------------------------------------
    // selection
    // -----------------------------------------------------------------------

    #[test]
    fn no_priority_runs_all_vendor_collectors() {
        let detected = vec![Source::Nvidia, Source::Amd, Source::Fallback];
        assert_eq!(select(None, &detected), vec![Source::Nvidia, Source::Amd]);
    }

    #[test]
    fn one_collector_per_vendor_group() {
        let detected = vec![Source::Nvidia, Source::Jetson];
        // Both are in the "nvidia" group — only the first listed wins.
        assert_eq!(
            select(Some("nvidia,jetson"), &detected),
            vec![Source::Nvidia]
        );
    }

    #[test]
    fn fallback_first_wins_alone() {
        let detected = vec![Source::Nvidia, Source::Fallback];
        assert_eq!(
            select(Some("nvtop,nvidia"), &detected),
            vec![Source::Fallback]
        );
    }

    #[test]
    fn fallback_not_first_is_ignored() {
        let detected = vec![Source::Nvidia, Source::Fallback];
        assert_eq!(
            select(Some("nvidia,nvtop"), &detected),
            vec![Source::Nvidia]
        );
    }

    #[test]
    fn fallback_first_but_undetected_falls_through() {
        let detected = vec![Source::Amd];
        assert_eq!(select(Some("nvtop,amd"), &detected), vec![Source::Amd]);
    }

    #[test]
    fn unknown_entries_ignored() {
        let detected = vec![Source::Intel];
        assert_eq!(
            select(Some("quantum,intel"), &detected),
            vec![Source::Intel]
        );
    }

    #[test]
    fn source_aliases_parse() {
        assert_eq!(Source::parse("NVIDIA"), Some(Source::Nvidia));
        assert_eq!(Source::parse("tegrastats"), Some(Source::Jetson));
        assert_eq!(Source::parse("intel_gpu_top"), Some(Source::Intel));
        assert_eq!(Source::parse("bogus"), None);
    }

    // -----------------------------------------------------------------------
    // interval-scoped averaging
    // -----------------------------------------------------------------------

    #[test]
    fn average_is_delta_accumulator_over_delta_count() {
        let s = GpuSupervisor::new_for_tests();
        push_sample(&s.data, "0", 50.0, 10.5, 40.0);

        let first = s.current_data(60_000);
        assert_eq!(first["0"].power, 10.5);
        assert_eq!(first["0"].usage, 50.0);

        // Two more samples: accumulators 50→150, 10.5→12.5; count 1→3.
        push_sample(&s.data, "0", 40.0, 0.0, 40.0);
        push_sample(&s.data, "0", 60.0, 2.0, 40.0);

        let second = s.current_data(60_000);
        // ΔA/Δn: usage (150−50)/2 = 50, power (12.5−10.5)/2 = 1.0.
        assert_eq!(second["0"].usage, 50.0);
        assert_eq!(second["0"].power, 1.0);
    }

    #[test]
    fn interval_keys_have_independent_baselines() {
        let s = GpuSupervisor::new_for_tests();
        push_sample(&s.data, "0", 100.0, 20.0, 40.0);

        // Key A consumes the first sample.
        assert_eq!(s.current_data(10_000)["0"].usage, 100.0);

        push_sample(&s.data, "0", 0.0, 0.0, 40.0);

        // Key B has never visited: averages over the whole history.
        let b = s.current_data(60_000);
        assert_eq!(b["0"].usage, 50.0);
        assert_eq!(b["0"].power, 10.0);

        // Key A sees only the new sample.
        let a = s.current_data(10_000);
        assert_eq!(a["0"].usage, 0.0);
    }

    #[test]
    fn no_new_data_active_gpu_reuses_last_average() {
        let s = GpuSupervisor::new_for_tests();
        push_sample(&s.data, "0", 80.0, 15.0, 45.0);

        let first = s.current_data(60_000);
        assert_eq!(first["0"].usage, 80.0);

        // No new samples; temperature says the GPU is alive.
        let again = s.current_data(60_000);
        assert_eq!(again["0"].usage, 80.0);
        assert_eq!(again["0"].power, 15.0);
    }

    #[test]
    fn no_new_data_inactive_gpu_reads_zero() {
        let s = GpuSupervisor::new_for_tests();
        push_sample(&s.data, "0", 80.0, 15.0, 45.0);
        let _ = s.current_data(60_000);

        // GPU went cold: zero temperature and memory, no new samples.
        {
            let mut map = s.data.write().unwrap();
            let gpu = map.get_mut("0").unwrap();
            gpu.temperature = 0.0;
            gpu.mem_used = 0.0;
        }
        let sample = s.current_data(60_000);
        assert_eq!(sample["0"].usage, 0.0);
        assert_eq!(sample["0"].power, 0.0);
    }

    #[test]
    fn temperature_and_memory_are_instantaneous() {
        let s = GpuSupervisor::new_for_tests();
        accumulate(&s.data, "0", "Test GPU", |gpu| {
            gpu.temperature = 40.0;
            gpu.mem_used = 1024.0;
            gpu.mem_total = 8192.0;
            gpu.usage += 10.0;
        });
        accumulate(&s.data, "0", "Test GPU", |gpu| {
            gpu.temperature = 62.0;
            gpu.mem_used = 2048.0;
            gpu.usage += 20.0;
        });

        let sample = s.current_data(60_000);
        assert_eq!(sample["0"].temperature, 62.0);
        assert_eq!(sample["0"].mem_used, 2048.0);
        assert_eq!(sample["0"].mem_total, 8192.0);
        // Usage still averaged: 30/2.
        assert_eq!(sample["0"].usage, 15.0);
    }

    #[test]
    fn accumulate_sets_name_once() {
        let data: GpuDataMap = Arc::new(RwLock::new(HashMap::new()));
        accumulate(&data, "0", "GeForce", |_| {});
        accumulate(&data, "0", "Different", |_| {});
        let map = data.read().unwrap();
        assert_eq!(map["0"].name, "GeForce");
        assert_eq!(map["0"].count, 2);
    }
}
