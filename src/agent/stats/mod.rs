pub mod battery;
pub mod cpu;
pub mod disk;
pub mod diskio;
pub mod memory;
pub mod network;
pub mod procs;
pub mod sensors;

use std::collections::HashMap;

use sysinfo::{Components, Networks, System};
use tracing::debug;

use crate::config::{AgentConfig, MemCalc};
use crate::types::{round2, ExtraFsStats, HostInfo, HostStats};

use self::cpu::CpuSampler;
use self::disk::FsRecord;
use self::diskio::DiskIoCollector;
use self::network::NetworkCollector;
use self::sensors::SensorFilter;

/// Samples everything host-local into a `HostStats`. One instance lives
/// inside the agent, guarded by the host lock, so `&mut self` collection
/// never races.
pub struct StatsCollector {
    sys: System,
    networks: Networks,
    components: Components,

    cpu: CpuSampler,
    net: NetworkCollector,
    diskio: DiskIoCollector,
    fs_records: Vec<FsRecord>,
    sensor_filter: SensorFilter,

    mem_calc: MemCalc,

    // Invariant platform facts, read once.
    cpu_model: String,
    cores: u32,
    threads: u32,
}

impl StatsCollector {
    pub fn new(config: &AgentConfig) -> Self {
        let mut sys = System::new();
        sys.refresh_cpu_list(sysinfo::CpuRefreshKind::nothing());
        let cpu_model = sys
            .cpus()
            .first()
            .map(|c| c.brand().trim().to_string())
            .unwrap_or_default();
        let threads = sys.cpus().len() as u32;
        let cores = sys
            .physical_core_count()
            .map(|c| c as u32)
            .unwrap_or(threads);

        let fs_records =
            disk::init_fs_records(config.filesystem.as_deref(), &config.extra_filesystems);

        Self {
            sys,
            networks: Networks::new_with_refreshed_list(),
            components: Components::new_with_refreshed_list(),
            cpu: CpuSampler::new(),
            net: NetworkCollector::new(config.nics.as_deref()),
            diskio: DiskIoCollector::new(),
            fs_records,
            sensor_filter: SensorFilter::parse(config.sensors.as_deref()),
            mem_calc: config.mem_calc,
            cpu_model,
            cores,
            threads,
        }
    }

    /// Collect one round of host stats for the given interval. Individual
    /// sub-collector failures leave their fields zeroed; nothing here aborts
    /// the snapshot.
    pub fn collect(&mut self, interval_ms: u16) -> (HostStats, HashMap<String, ExtraFsStats>) {
        let mut stats = HostStats::default();

        // CPU: /proc/stat deltas, falling back to sysinfo on platforms
        // without /proc (first round is zeros either way).
        match self.cpu.sample() {
            Some(b) => {
                stats.cpu_pct = b.total_pct;
                stats.cpu_user_pct = b.user_pct;
                stats.cpu_system_pct = b.system_pct;
                stats.cpu_iowait_pct = b.iowait_pct;
                stats.cpu_steal_pct = b.steal_pct;
                stats.per_core_pct = b.per_core_pct;
            }
            None => {
                self.sys.refresh_cpu_usage();
                stats.cpu_pct = round2(f64::from(self.sys.global_cpu_usage()));
                stats.per_core_pct = self
                    .sys
                    .cpus()
                    .iter()
                    .map(|c| round2(f64::from(c.cpu_usage())))
                    .collect();
            }
        }

        let load = System::load_average();
        stats.load_avg = [round2(load.one), round2(load.five), round2(load.fifteen)];

        self.sys.refresh_memory();
        memory::collect(&self.sys, self.mem_calc, &mut stats);

        self.networks.refresh(true);
        let net = self.net.sample(interval_ms, &self.networks);
        stats.net_sent_bps = net.sent_bps;
        stats.net_recv_bps = net.recv_bps;
        stats.nics = net.nics;

        let extra = self.collect_filesystems(interval_ms, &mut stats);

        stats.temperatures = sensors::collect(&mut self.components, &self.sensor_filter);
        stats.processes = procs::count_process_states();
        stats.battery = battery::collect();

        (stats, extra)
    }

    fn collect_filesystems(
        &mut self,
        interval_ms: u16,
        stats: &mut HostStats,
    ) -> HashMap<String, ExtraFsStats> {
        let counters = diskio::read_counters();
        let devices: Vec<String> = self.fs_records.iter().map(|r| r.device.clone()).collect();
        let rates = self.diskio.sample(interval_ms, &counters, &devices);

        let mut extra = HashMap::new();
        for record in &mut self.fs_records {
            match disk::fs_usage(&record.mountpoint) {
                Some(usage) => {
                    record.total = usage.total;
                    record.used = usage.used;
                    record.inodes_used_pct = usage.inodes_used_pct();
                }
                None => {
                    debug!(mountpoint = %record.mountpoint, "statvfs failed");
                    record.total = 0;
                    record.used = 0;
                    record.inodes_used_pct = None;
                }
            }
            let (read_bps, write_bps) = rates.get(&record.device).copied().unwrap_or((0, 0));
            record.read_bps = read_bps;
            record.write_bps = write_bps;

            if record.is_root {
                stats.disk_total = record.total;
                stats.disk_used = record.used;
                stats.disk_pct = if record.total > 0 {
                    round2(record.used as f64 / record.total as f64 * 100.0)
                } else {
                    0.0
                };
                stats.disk_read_bps = read_bps;
                stats.disk_write_bps = write_bps;
                stats.inodes_used_pct = record.inodes_used_pct;
            } else {
                extra.insert(
                    record.report_name().to_string(),
                    ExtraFsStats {
                        disk_total: record.total,
                        disk_used: record.used,
                        disk_read_bps: read_bps,
                        disk_write_bps: write_bps,
                        inodes_used_pct: record.inodes_used_pct,
                    },
                );
            }
        }
        extra
    }

    /// Slow-changing platform facts for the info block.
    pub fn collect_info(&self, services_failed: Option<u64>) -> HostInfo {
        HostInfo {
            hostname: System::host_name().unwrap_or_default(),
            kernel_version: System::kernel_version().unwrap_or_default(),
            cpu_model: self.cpu_model.clone(),
            cores: self.cores,
            threads: (self.threads != self.cores).then_some(self.threads),
            os_name: System::long_os_version().unwrap_or_default(),
            uptime_secs: System::uptime(),
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            services_failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::base_config;

    #[test]
    fn collect_never_panics_and_fills_info() {
        let mut collector = StatsCollector::new(&base_config());
        let (stats, _extra) = collector.collect(60_000);
        // First round: deltas are zero but structural fields are sane.
        assert!(stats.mem_total > 0);

        let info = collector.collect_info(None);
        assert_eq!(info.agent_version, env!("CARGO_PKG_VERSION"));
        assert!(info.cores > 0);
        assert!(info.services_failed.is_none());
    }

    #[test]
    fn threads_omitted_when_equal_to_cores() {
        let collector = StatsCollector::new(&base_config());
        let info = collector.collect_info(None);
        if let Some(threads) = info.threads {
            assert_ne!(threads, info.cores);
        }
    }

    #[test]
    fn second_collect_produces_rates_without_panic() {
        let mut collector = StatsCollector::new(&base_config());
        collector.collect(1000);
        std::thread::sleep(std::time::Duration::from_millis(60));
        let (stats, _) = collector.collect(1000);
        assert!(stats.cpu_pct >= 0.0 && stats.cpu_pct <= 100.0);
    }
}
