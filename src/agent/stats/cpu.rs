use crate::types::round2;

/// Raw jiffy counters for one cpu line of /proc/stat.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct CpuTimes {
    user: u64,
    nice: u64,
    system: u64,
    idle: u64,
    iowait: u64,
    irq: u64,
    softirq: u64,
    steal: u64,
}

impl CpuTimes {
    fn parse(line: &str) -> Option<Self> {
        let fields: Vec<u64> = line
            .split_whitespace()
            .skip(1) // "cpu" / "cpuN"
            .take(8)
            .filter_map(|s| s.parse().ok())
            .collect();
        if fields.len() < 4 {
            return None;
        }
        Some(Self {
            user: fields[0],
            nice: fields[1],
            system: fields[2],
            idle: fields[3],
            iowait: fields.get(4).copied().unwrap_or(0),
            irq: fields.get(5).copied().unwrap_or(0),
            softirq: fields.get(6).copied().unwrap_or(0),
            steal: fields.get(7).copied().unwrap_or(0),
        })
    }

    fn total(&self) -> u64 {
        self.user
            + self.nice
            + self.system
            + self.idle
            + self.iowait
            + self.irq
            + self.softirq
            + self.steal
    }

    fn busy(&self) -> u64 {
        self.total() - self.idle - self.iowait
    }
}

#[derive(Debug, Clone, Default)]
struct ProcStatSample {
    aggregate: CpuTimes,
    cores: Vec<CpuTimes>,
}

/// CPU utilization breakdown for one sampling round.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CpuBreakdown {
    pub total_pct: f64,
    pub user_pct: f64,
    pub system_pct: f64,
    pub iowait_pct: f64,
    pub steal_pct: f64,
    pub per_core_pct: Vec<f64>,
}

/// Computes CPU percentages as deltas between consecutive /proc/stat reads.
///
/// The first sample has no baseline and yields None; callers report zeros
/// for that round. Held under the sampling lock, so reads never race.
#[derive(Debug, Default)]
pub struct CpuSampler {
    prev: Option<ProcStatSample>,
}

impl CpuSampler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read /proc/stat and compute the delta against the previous read.
    /// None on first call or on platforms without /proc.
    pub fn sample(&mut self) -> Option<CpuBreakdown> {
        let contents = std::fs::read_to_string("/proc/stat").ok()?;
        self.sample_from(&contents)
    }

    fn sample_from(&mut self, contents: &str) -> Option<CpuBreakdown> {
        let current = parse_proc_stat(contents)?;
        let result = self.prev.as_ref().and_then(|prev| diff(prev, &current));
        self.prev = Some(current);
        result
    }
}

fn parse_proc_stat(contents: &str) -> Option<ProcStatSample> {
    let mut aggregate = None;
    let mut cores = Vec::new();

    for line in contents.lines() {
        if line.starts_with("cpu ") {
            aggregate = CpuTimes::parse(line);
        } else if line.starts_with("cpu")
            && line.as_bytes().get(3).is_some_and(|b| b.is_ascii_digit())
        {
            if let Some(times) = CpuTimes::parse(line) {
                cores.push(times);
            }
        }
    }

    aggregate.map(|aggregate| ProcStatSample { aggregate, cores })
}

fn diff(prev: &ProcStatSample, current: &ProcStatSample) -> Option<CpuBreakdown> {
    let d_total = current.aggregate.total().saturating_sub(prev.aggregate.total());
    if d_total == 0 {
        return None;
    }

    let pct = |delta: u64| round2(delta as f64 / d_total as f64 * 100.0);

    let per_core_pct = current
        .cores
        .iter()
        .zip(prev.cores.iter())
        .map(|(cur, prev)| {
            let d = cur.total().saturating_sub(prev.total());
            if d == 0 {
                0.0
            } else {
                round2(cur.busy().saturating_sub(prev.busy()) as f64 / d as f64 * 100.0)
            }
        })
        .collect();

    Some(CpuBreakdown {
        total_pct: pct(current.aggregate.busy().saturating_sub(prev.aggregate.busy())),
        user_pct: pct(
            (current.aggregate.user + current.aggregate.nice)
                .saturating_sub(prev.aggregate.user + prev.aggregate.nice),
        ),
        system_pct: pct(current.aggregate.system.saturating_sub(prev.aggregate.system)),
        iowait_pct: pct(current.aggregate.iowait.saturating_sub(prev.aggregate.iowait)),
        steal_pct: pct(current.aggregate.steal.saturating_sub(prev.aggregate.steal)),
        per_core_pct,
    })
}
