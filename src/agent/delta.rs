use std::collections::HashMap;
use std::hash::Hash;
use std::sync::RwLock;

/// Value types a tracker can hold. Deltas saturate at zero — a counter
/// reset or wrap-around yields 0, never a negative.
pub trait TrackedValue: Copy + Default {
    fn delta_from(self, previous: Self) -> Self;
}

impl TrackedValue for u64 {
    fn delta_from(self, previous: Self) -> Self {
        self.saturating_sub(previous)
    }
}

impl TrackedValue for i64 {
    fn delta_from(self, previous: Self) -> Self {
        (self - previous).max(0)
    }
}

impl TrackedValue for f64 {
    fn delta_from(self, previous: Self) -> Self {
        let d = self - previous;
        if d < 0.0 {
            0.0
        } else {
            d
        }
    }
}

/// Tracks per-key deltas between two sampling epochs.
///
/// `set` writes into the current epoch; `cycle` rotates current into
/// previous and starts a fresh epoch. A delta is only meaningful for keys
/// present on both sides of one cycle boundary — anything else reads as 0.
///
/// Safe under concurrent readers with serialized writers; the lock is never
/// held across an await point.
#[derive(Debug, Default)]
pub struct DeltaTracker<K, V>
where
    K: Eq + Hash + Clone,
    V: TrackedValue,
{
    inner: RwLock<Epochs<K, V>>,
}

#[derive(Debug, Default)]
struct Epochs<K, V> {
    current: HashMap<K, V>,
    previous: HashMap<K, V>,
}

impl<K, V> DeltaTracker<K, V>
where
    K: Eq + Hash + Clone,
    V: TrackedValue,
{
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Epochs {
                current: HashMap::new(),
                previous: HashMap::new(),
            }),
        }
    }

    /// Overwrite the current-epoch value for a key.
    pub fn set(&self, key: K, value: V) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.current.insert(key, value);
    }

    /// `current[k] − previous[k]`, or 0 when either side is missing or the
    /// counter moved backwards.
    pub fn delta(&self, key: &K) -> V {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        match (inner.current.get(key), inner.previous.get(key)) {
            (Some(cur), Some(prev)) => cur.delta_from(*prev),
            _ => V::default(),
        }
    }

    /// Previous-epoch value for a key, if any. The NIC collector uses this
    /// to derive per-interface rates without double bookkeeping.
    pub fn previous(&self, key: &K) -> Option<V> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.previous.get(key).copied()
    }

    /// Rotate: previous := current, current := empty.
    pub fn cycle(&self) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.previous = std::mem::take(&mut inner.current);
    }

    /// Drop all state for a key from both epochs (used when a container or
    /// device disappears).
    pub fn remove(&self, key: &K) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.current.remove(key);
        inner.previous.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // -----------------------------------------------------------------------
    // delta
    // -----------------------------------------------------------------------

    #[test]
    fn delta_across_one_cycle() {
        let t: DeltaTracker<&str, u64> = DeltaTracker::new();
        t.set("a", 1000);
        t.cycle();
        t.set("a", 1200);
        assert_eq!(t.delta(&"a"), 200);
    }

    #[test]
    fn delta_missing_previous_is_zero() {
        let t: DeltaTracker<&str, u64> = DeltaTracker::new();
        t.set("a", 1000);
        assert_eq!(t.delta(&"a"), 0);
    }

    #[test]
    fn delta_missing_current_is_zero() {
        let t: DeltaTracker<&str, u64> = DeltaTracker::new();
        t.set("a", 1000);
        t.cycle();
        assert_eq!(t.delta(&"a"), 0);
    }

    #[test]
    fn delta_counter_reset_is_zero() {
        let t: DeltaTracker<&str, u64> = DeltaTracker::new();
        t.set("a", 1000);
        t.cycle();
        t.set("a", 400);
        assert_eq!(t.delta(&"a"), 0);
    }

    #[test]
    fn delta_signed_underflow_is_zero() {
        let t: DeltaTracker<&str, i64> = DeltaTracker::new();
        t.set("a", 50);
        t.cycle();
        t.set("a", -10);
        assert_eq!(t.delta(&"a"), 0);
    }

    #[test]
    fn delta_float() {
        let t: DeltaTracker<&str, f64> = DeltaTracker::new();
        t.set("p", 10.5);
        t.cycle();
        t.set("p", 12.5);
        assert!((t.delta(&"p") - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn delta_float_negative_is_zero() {
        let t: DeltaTracker<&str, f64> = DeltaTracker::new();
        t.set("p", 10.0);
        t.cycle();
        t.set("p", 3.5);
        assert_eq!(t.delta(&"p"), 0.0);
    }

    // -----------------------------------------------------------------------
    // cycle / previous
    // -----------------------------------------------------------------------

    #[test]
    fn cycle_twice_without_set_empties_both_epochs() {
        let t: DeltaTracker<&str, u64> = DeltaTracker::new();
        t.set("a", 7);
        t.cycle();
        t.cycle();
        assert_eq!(t.delta(&"a"), 0);
        assert_eq!(t.previous(&"a"), None);
    }

    #[test]
    fn previous_reads_last_epoch() {
        let t: DeltaTracker<String, u64> = DeltaTracker::new();
        t.set("eth0".to_string(), 500_000);
        t.cycle();
        t.set("eth0".to_string(), 1_500_000);
        assert_eq!(t.previous(&"eth0".to_string()), Some(500_000));
        assert_eq!(t.delta(&"eth0".to_string()), 1_000_000);
    }

    #[test]
    fn set_overwrites_within_epoch() {
        let t: DeltaTracker<&str, u64> = DeltaTracker::new();
        t.set("a", 10);
        t.cycle();
        t.set("a", 15);
        t.set("a", 30);
        assert_eq!(t.delta(&"a"), 20);
    }

    #[test]
    fn remove_clears_both_epochs() {
        let t: DeltaTracker<&str, u64> = DeltaTracker::new();
        t.set("a", 10);
        t.cycle();
        t.set("a", 20);
        t.remove(&"a");
        assert_eq!(t.delta(&"a"), 0);
        assert_eq!(t.previous(&"a"), None);
    }
}
