use std::collections::HashMap;

use globset::{Glob, GlobSet, GlobSetBuilder};
use sysinfo::Components;
use tracing::warn;

use crate::types::round2;

/// Sensor allow/deny list from the SENSORS variable, same shape as the NIC
/// filter: leading `-` for deny, `*` wildcards per entry.
#[derive(Debug, Default)]
pub struct SensorFilter {
    set: Option<GlobSet>,
    deny: bool,
}

impl SensorFilter {
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
                Err(e) => warn!(pattern, error = %e, "Ignoring invalid sensor pattern"),
            }
        }
        if !any {
            return Self::default();
        }
        match builder.build() {
            Ok(set) => Self { set: Some(set), deny },
            Err(e) => {
                warn!(error = %e, "Failed to build sensor filter");
                Self::default()
            }
        }
    }

    pub fn is_excluded(&self, name: &str) -> bool {
        match &self.set {
            Some(set) if self.deny => set.is_match(name),
            Some(set) => !set.is_match(name),
            None => false,
        }
    }
}

/// Read all component temperatures through the filter. Duplicate labels get
/// a numeric suffix so multi-sensor chips don't shadow each other.
pub fn collect(components: &mut Components, filter: &SensorFilter) -> HashMap<String, f64> {
    components.refresh(true);
    let mut temps = HashMap::new();
    for component in components.iter() {
        let Some(temp) = component.temperature() else {
            continue;
        };
        if !temp.is_finite() || temp <= 0.0 {
            continue;
        }
        let label = component.label().trim().to_string();
        if label.is_empty() || filter.is_excluded(&label) {
            continue;
        }
        let key = dedupe_key(&temps, label);
        temps.insert(key, round2(f64::from(temp)));
    }
    temps
}

fn dedupe_key(existing: &HashMap<String, f64>, label: String) -> String {
    if !existing.contains_key(&label) {
        return label;
    }
    for n in 2.. {
        let candidate = format!("{label} {n}");
        if !existing.contains_key(&candidate) {
            return candidate;
        }
    }
    unreachable!()
}

/// The temperature shown on the dashboard: the configured primary sensor
/// when present, otherwise the hottest reading.
pub fn dashboard_temp(temps: &HashMap<String, f64>, primary: Option<&str>) -> f64 {
    if let Some(primary) = primary {
        if let Some(t) = temps.get(primary) {
            return *t;
        }
    }
    temps
        .values()
        .copied()
        .fold(0.0, f64::max)
}
