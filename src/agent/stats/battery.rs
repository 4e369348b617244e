use std::path::Path;

use crate::types::BatteryStats;

const POWER_SUPPLY_DIR: &str = "/sys/class/power_supply";

/// Battery charge via the kernel power-supply class. None on hosts without
/// a battery (the common case for servers).
pub fn collect() -> Option<BatteryStats> {
    collect_from(Path::new(POWER_SUPPLY_DIR))
}

fn collect_from(dir: &Path) -> Option<BatteryStats> {
    let entries = std::fs::read_dir(dir).ok()?;
    for entry in entries.flatten() {
        let path = entry.path();
        let kind = std::fs::read_to_string(path.join("type")).unwrap_or_default();
        if kind.trim() != "Battery" {
            continue;
        }
        let Some(percent) = read_trimmed(&path.join("capacity"))
            .and_then(|s| s.parse::<f64>().ok())
        else {
            continue;
        };
        let state = match read_trimmed(&path.join("status")).as_deref() {
            Some("Charging") => 1,
            Some("Discharging") => 2,
            Some("Full") => 3,
            _ => 0,
        };
        return Some(BatteryStats { percent, state });
    }
    None
}

fn read_trimmed(path: &Path) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_supply(dir: &Path, name: &str, kind: &str, capacity: &str, status: &str) {
        let supply = dir.join(name);
        std::fs::create_dir_all(&supply).unwrap();
        std::fs::write(supply.join("type"), format!("{kind}\n")).unwrap();
        std::fs::write(supply.join("capacity"), format!("{capacity}\n")).unwrap();
        std::fs::write(supply.join("status"), format!("{status}\n")).unwrap();
    }

    #[test]
    fn battery_found_and_parsed() {
        let dir = tempfile::tempdir().unwrap();
        write_supply(dir.path(), "AC", "Mains", "0", "Unknown");
        write_supply(dir.path(), "BAT0", "Battery", "87", "Discharging");

        let bat = collect_from(dir.path()).unwrap();
        assert_eq!(bat.percent, 87.0);
        assert_eq!(bat.state, 2);
    }

    #[test]
    fn charging_states_mapped() {
        let dir = tempfile::tempdir().unwrap();
        write_supply(dir.path(), "BAT0", "Battery", "100", "Full");
        assert_eq!(collect_from(dir.path()).unwrap().state, 3);
    }

    #[test]
    fn no_battery_is_none() {
        let dir = tempfile::tempdir().unwrap();
        write_supply(dir.path(), "AC", "Mains", "0", "Unknown");
        assert!(collect_from(dir.path()).is_none());
    }

    #[test]
    fn missing_dir_is_none() {
        assert!(collect_from(Path::new("/does/not/exist")).is_none());
    }
}
