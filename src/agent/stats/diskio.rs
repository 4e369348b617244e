use std::collections::HashMap;
use std::time::Instant;

use tracing::warn;

use crate::agent::delta::DeltaTracker;

/// Rates above this are treated as counter glitches; the baseline is
/// reseeded and the round reports zero for the device.
pub const MAX_DISK_BPS: u64 = 50 * 1024 * 1024 * 1024;

/// Sector size used by /proc/diskstats regardless of the device's real
/// sector size.
const SECTOR_BYTES: u64 = 512;

/// Cumulative read/write bytes for one block device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoCounters {
    pub read_bytes: u64,
    pub write_bytes: u64,
}

/// Read-tracker pair for one polling interval.
struct IntervalIoTracker {
    read: DeltaTracker<String, u64>,
    write: DeltaTracker<String, u64>,
    last_cycle: Instant,
}

impl IntervalIoTracker {
    fn new() -> Self {
        Self {
            read: DeltaTracker::new(),
            write: DeltaTracker::new(),
            last_cycle: Instant::now(),
        }
    }
}

/// Per-interval disk I/O rates from /proc/diskstats sector counters.
#[derive(Default)]
pub struct DiskIoCollector {
    trackers: HashMap<u16, IntervalIoTracker>,
}

impl DiskIoCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compute (read_bps, write_bps) for the named devices over this
    /// interval's window, then cycle the baseline.
    pub fn sample(
        &mut self,
        interval_ms: u16,
        counters: &HashMap<String, IoCounters>,
        devices: &[String],
    ) -> HashMap<String, (u64, u64)> {
        let tracker = self
            .trackers
            .entry(interval_ms)
            .or_insert_with(IntervalIoTracker::new);

        let elapsed_ms = tracker.last_cycle.elapsed().as_millis() as u64;
        let mut rates = HashMap::new();

        for device in devices {
            let Some(io) = counters.get(device) else {
                rates.insert(device.clone(), (0, 0));
                continue;
            };
            tracker.read.set(device.clone(), io.read_bytes);
            tracker.write.set(device.clone(), io.write_bytes);

            let (mut read_bps, mut write_bps) = if elapsed_ms > 0 {
                (
                    tracker.read.delta(device) * 1000 / elapsed_ms,
                    tracker.write.delta(device) * 1000 / elapsed_ms,
                )
            } else {
                (0, 0)
            };

            if read_bps > MAX_DISK_BPS || write_bps > MAX_DISK_BPS {
                warn!(
                    device = %device,
                    read_bps,
                    write_bps,
                    "Implausible disk I/O rate — resetting baseline"
                );
                read_bps = 0;
                write_bps = 0;
            }
            rates.insert(device.clone(), (read_bps, write_bps));
        }

        tracker.read.cycle();
        tracker.write.cycle();
        tracker.last_cycle = Instant::now();
        rates
    }
}

/// Read current counters for all block devices.
pub fn read_counters() -> HashMap<String, IoCounters> {
    std::fs::read_to_string("/proc/diskstats")
        .map(|s| parse_diskstats(&s))
        .unwrap_or_default()
}

/// /proc/diskstats row: major minor name rd_ios rd_merges rd_sectors
/// rd_ticks wr_ios wr_merges wr_sectors wr_ticks ...
fn parse_diskstats(contents: &str) -> HashMap<String, IoCounters> {
    let mut map = HashMap::new();
    for line in contents.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 {
            continue;
        }
        let name = fields[2].to_string();
        let Ok(rd_sectors) = fields[5].parse::<u64>() else {
            continue;
        };
        let Ok(wr_sectors) = fields[9].parse::<u64>() else {
            continue;
        };
        map.insert(
            name,
            IoCounters {
                read_bytes: rd_sectors * SECTOR_BYTES,
                write_bytes: wr_sectors * SECTOR_BYTES,
            },
        );
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    const DISKSTATS: &str = "\
   8       0 sda 124 0 9690 120 213 0 18368 280 0 310 400 0 0 0 0 0 0
   8       1 sda1 100 0 8000 100 200 0 16000 250 0 300 350 0 0 0 0 0 0
 259       0 nvme0n1 5000 12 400000 900 7000 34 560000 1200 0 800 2100 0 0 0 0 0 0
bogus line
";

    #[test]
    fn diskstats_sectors_converted_to_bytes() {
        let map = parse_diskstats(DISKSTATS);
        assert_eq!(
            map.get("sda1"),
            Some(&IoCounters {
                read_bytes: 8000 * 512,
                write_bytes: 16000 * 512,
            })
        );
        assert_eq!(map.get("nvme0n1").unwrap().read_bytes, 400_000 * 512);
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn first_round_reports_zero() {
        let mut c = DiskIoCollector::new();
        let mut counters = HashMap::new();
        counters.insert("sda1".to_string(), IoCounters { read_bytes: 1000, write_bytes: 2000 });
        let rates = c.sample(1000, &counters, &["sda1".to_string()]);
        assert_eq!(rates["sda1"], (0, 0));
    }

    #[tokio::test]
    async fn second_round_computes_rates() {
        let mut c = DiskIoCollector::new();
        let devices = vec!["sda1".to_string()];

        let mut counters = HashMap::new();
        counters.insert("sda1".to_string(), IoCounters { read_bytes: 0, write_bytes: 0 });
        c.sample(1000, &counters, &devices);

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        counters.insert(
            "sda1".to_string(),
            IoCounters { read_bytes: 100_000, write_bytes: 50_000 },
        );
        let rates = c.sample(1000, &counters, &devices);
        let (read_bps, write_bps) = rates["sda1"];
        // ~100 ms window: 100 kB read ≈ 1 MB/s. Allow generous slack for timing.
        assert!(read_bps > 100_000 && read_bps <= 1_100_000, "read_bps={read_bps}");
        assert!(write_bps > 50_000 && write_bps <= 550_000, "write_bps={write_bps}");
    }

    #[tokio::test]
    async fn absurd_rate_is_zeroed() {
        let mut c = DiskIoCollector::new();
        let devices = vec!["sda1".to_string()];

        let mut counters = HashMap::new();
        counters.insert("sda1".to_string(), IoCounters { read_bytes: 0, write_bytes: 0 });
        c.sample(1000, &counters, &devices);

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        // 100 TB in 20 ms is far beyond the 50 GB/s ceiling.
        counters.insert(
            "sda1".to_string(),
            IoCounters {
                read_bytes: 100 * 1024 * 1024 * 1024 * 1024,
                write_bytes: 0,
            },
        );
        let rates = c.sample(1000, &counters, &devices);
        assert_eq!(rates["sda1"], (0, 0));
    }

    #[test]
    fn missing_device_reports_zero() {
        let mut c = DiskIoCollector::new();
        let rates = c.sample(1000, &HashMap::new(), &["gone".to_string()]);
        assert_eq!(rates["gone"], (0, 0));
    }
}
