use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use crate::types::CombinedSnapshot;

/// Caches the last combined snapshot per polling interval.
///
/// An entry is fresh while less than half its nominal interval has elapsed,
/// so a hub polling every 60 s reuses a snapshot taken for another session
/// at the same cadence instead of re-collecting. Interval 0 is never fresh.
#[derive(Debug, Default)]
pub struct SnapshotCache {
    entries: RwLock<HashMap<u16, CacheEntry>>,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    snapshot: CombinedSnapshot,
    last_update: Instant,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the stored snapshot for this interval plus a freshness flag.
    pub fn get(&self, interval_ms: u16) -> (Option<CombinedSnapshot>, bool) {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        match entries.get(&interval_ms) {
            Some(entry) => {
                let fresh = interval_ms > 0
                    && entry.last_update.elapsed() < Duration::from_millis(u64::from(interval_ms) / 2);
                (Some(entry.snapshot.clone()), fresh)
            }
            None => (None, false),
        }
    }

    /// Store a snapshot for this interval, refreshing its timestamp.
    pub fn set(&self, interval_ms: u16, snapshot: CombinedSnapshot) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            interval_ms,
            CacheEntry {
                snapshot,
                last_update: Instant::now(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap_with_cpu(cpu: f64) -> CombinedSnapshot {
        let mut snap = CombinedSnapshot::default();
        snap.stats.cpu_pct = cpu;
        snap
    }

    #[test]
    fn empty_cache_misses() {
        let cache = SnapshotCache::new();
        let (snap, fresh) = cache.get(1000);
        assert!(snap.is_none());
        assert!(!fresh);
    }

    #[tokio::test]
    async fn fresh_within_half_interval() {
        let cache = SnapshotCache::new();
        cache.set(1000, snap_with_cpu(42.0));
        tokio::time::sleep(Duration::from_millis(200)).await;
        let (snap, fresh) = cache.get(1000);
        assert_eq!(snap.unwrap().stats.cpu_pct, 42.0);
        assert!(fresh);
    }

    #[tokio::test]
    async fn stale_at_half_interval() {
        let cache = SnapshotCache::new();
        cache.set(400, snap_with_cpu(42.0));
        tokio::time::sleep(Duration::from_millis(250)).await;
        let (snap, fresh) = cache.get(400);
        assert!(snap.is_some());
        assert!(!fresh);
    }

    #[test]
    fn zero_interval_never_fresh() {
        let cache = SnapshotCache::new();
        cache.set(0, snap_with_cpu(1.0));
        let (snap, fresh) = cache.get(0);
        assert!(snap.is_some());
        assert!(!fresh);
    }

    #[test]
    fn intervals_do_not_share_entries() {
        let cache = SnapshotCache::new();
        cache.set(10_000, snap_with_cpu(10.0));
        cache.set(60_000, snap_with_cpu(60.0));
        let (a, _) = cache.get(10_000);
        let (b, _) = cache.get(60_000);
        assert_eq!(a.unwrap().stats.cpu_pct, 10.0);
        assert_eq!(b.unwrap().stats.cpu_pct, 60.0);
    }

    #[test]
    fn set_refreshes_timestamp() {
        let cache = SnapshotCache::new();
        cache.set(60_000, snap_with_cpu(1.0));
        cache.set(60_000, snap_with_cpu(2.0));
        let (snap, fresh) = cache.get(60_000);
        assert_eq!(snap.unwrap().stats.cpu_pct, 2.0);
        assert!(fresh);
    }
}
