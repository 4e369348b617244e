use std::collections::HashMap;
use std::time::Instant;

use globset::{Glob, GlobSet, GlobSetBuilder};
use sysinfo::Networks;
use tracing::warn;

use crate::agent::delta::DeltaTracker;
use crate::types::NicStats;

/// Rates above this are treated as counter glitches, zeroed, and reseeded.
pub const MAX_NET_BPS: u64 = 10 * 1024 * 1024 * 1024;

/// Interface name prefixes that never count toward host bandwidth:
/// loopback, container bridges, virtual ethernet pairs, overlay fabrics.
const EXCLUDED_PREFIXES: &[&str] = &[
    "lo", "docker", "br-", "veth", "virbr", "vnet", "tap", "tun", "flannel", "cali", "cni",
    "podman",
];

/// User allow/deny list from the NICS variable. A leading `-` on the whole
/// value turns it into a deny list; `*` wildcards are supported per entry.
#[derive(Debug, Default)]
pub struct NicFilter {
    set: Option<GlobSet>,
    deny: bool,
}

impl NicFilter {
    pub fn parse(raw: Option<&str>) -> Self {
        let Some(raw) = raw else {
            return Self::default();
        };
        let (deny, list) = match raw.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, raw),
        };

        let mut builder = GlobSetBuilder::new();
        let mut any = false;
        for pattern in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            match Glob::new(pattern) {
                Ok(glob) => {
                    builder.add(glob);
                    any = true;
                }
                Err(e) => warn!(pattern, error = %e, "Ignoring invalid NIC pattern"),
            }
        }
        if !any {
            return Self::default();
        }
        match builder.build() {
            Ok(set) => Self {
                set: Some(set),
                deny,
            },
            Err(e) => {
                warn!(error = %e, "Failed to build NIC filter");
                Self::default()
            }
        }
    }

    /// Whether an interface is excluded from bandwidth accounting.
    pub fn is_excluded(&self, name: &str) -> bool {
        match &self.set {
            // Explicit allow list: everything not matched is excluded and the
            // default prefix rules no longer apply.
            Some(set) if !self.deny => !set.is_match(name),
            // Deny list adds to the default prefix rules.
            Some(set) => set.is_match(name) || has_excluded_prefix(name),
            None => has_excluded_prefix(name),
        }
    }
}

fn has_excluded_prefix(name: &str) -> bool {
    EXCLUDED_PREFIXES.iter().any(|p| name.starts_with(p))
}

/// Byte-counter trackers for one polling interval, so a 10 s poller and a
/// 60 s poller each see rates over their own window.
pub struct IntervalNetTracker {
    sent: DeltaTracker<String, u64>,
    recv: DeltaTracker<String, u64>,
    last_cycle: Instant,
}

impl IntervalNetTracker {
    fn new() -> Self {
        Self {
            sent: DeltaTracker::new(),
            recv: DeltaTracker::new(),
            last_cycle: Instant::now(),
        }
    }
}

/// Per-interval network sampling over sysinfo's interface counters.
#[derive(Default)]
pub struct NetworkCollector {
    filter: NicFilter,
    trackers: HashMap<u16, IntervalNetTracker>,
}

/// One sampling round's result.
#[derive(Debug, Default, PartialEq)]
pub struct NetworkSample {
    pub sent_bps: u64,
    pub recv_bps: u64,
    pub nics: HashMap<String, NicStats>,
}

impl NetworkCollector {
    pub fn new(nics_env: Option<&str>) -> Self {
        Self {
            filter: NicFilter::parse(nics_env),
            trackers: HashMap::new(),
        }
    }

    /// Sample all non-excluded interfaces for one interval key. The tracker
    /// pair cycles at the end of the round, making the current totals the
    /// baseline for the next round at this cadence.
    pub fn sample(&mut self, interval_ms: u16, networks: &Networks) -> NetworkSample {
        let tracker = self
            .trackers
            .entry(interval_ms)
            .or_insert_with(IntervalNetTracker::new);

        let elapsed_ms = tracker.last_cycle.elapsed().as_millis() as u64;
        let mut sample = NetworkSample::default();

        for (name, data) in networks.iter() {
            if self.filter.is_excluded(name) {
                continue;
            }
            let rx_total = data.total_received();
            let tx_total = data.total_transmitted();
            tracker.recv.set(name.clone(), rx_total);
            tracker.sent.set(name.clone(), tx_total);

            let (rx_bps, tx_bps) = if elapsed_ms > 0 {
                (
                    tracker.recv.delta(name) * 1000 / elapsed_ms,
                    tracker.sent.delta(name) * 1000 / elapsed_ms,
                )
            } else {
                (0, 0)
            };

            sample.nics.insert(
                name.clone(),
                NicStats {
                    rx_total,
                    tx_total,
                    rx_bps,
                    tx_bps,
                },
            );
            sample.recv_bps += rx_bps;
            sample.sent_bps += tx_bps;
        }

        if sample.recv_bps > MAX_NET_BPS || sample.sent_bps > MAX_NET_BPS {
            warn!(
                recv_bps = sample.recv_bps,
                sent_bps = sample.sent_bps,
                "Implausible network rate — resetting baseline"
            );
            sample.recv_bps = 0;
            sample.sent_bps = 0;
            for nic in sample.nics.values_mut() {
                nic.rx_bps = 0;
                nic.tx_bps = 0;
            }
        }

        tracker.sent.cycle();
        tracker.recv.cycle();
        tracker.last_cycle = Instant::now();
        sample
    }
}
