use std::path::Path;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

/// Length of the persisted fingerprint in hex characters.
const FINGERPRINT_LEN: usize = 48;

/// File name under the data directory.
const FINGERPRINT_FILE: &str = "fingerprint";

/// Load the host fingerprint from the data directory, creating and
/// persisting it on first run. The fingerprint is derived once and never
/// rotated, so the hub can keep associating samples with this host across
/// reinstalls of the agent binary.
pub fn load_or_create(data_dir: &Path) -> Result<String> {
    let path = data_dir.join(FINGERPRINT_FILE);

    if let Ok(existing) = std::fs::read_to_string(&path) {
        let existing = existing.trim().to_string();
        if is_valid(&existing) {
            debug!(path = %path.display(), "Loaded existing fingerprint");
            return Ok(existing);
        }
    }

    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;

    let fingerprint = derive();
    std::fs::write(&path, format!("{fingerprint}\n"))
        .with_context(|| format!("Failed to write fingerprint to {}", path.display()))?;
    info!(path = %path.display(), "Created host fingerprint");
    Ok(fingerprint)
}

/// Derive a fingerprint from the stable machine id, falling back to
/// hostname plus CPU model when no machine id is available.
fn derive() -> String {
    let seed = machine_id().unwrap_or_else(|| {
        let hostname = sysinfo::System::host_name().unwrap_or_default();
        let cpu_model = first_cpu_model().unwrap_or_default();
        format!("{hostname}{cpu_model}")
    });
    digest(&seed)
}

fn digest(seed: &str) -> String {
    let hash = Sha256::digest(seed.as_bytes());
    let mut hex = hex::encode(hash);
    hex.truncate(FINGERPRINT_LEN);
    hex
}

fn is_valid(s: &str) -> bool {
    s.len() == FINGERPRINT_LEN && s.bytes().all(|b| b.is_ascii_hexdigit())
}

fn machine_id() -> Option<String> {
    for path in ["/etc/machine-id", "/var/lib/dbus/machine-id"] {
        if let Ok(id) = std::fs::read_to_string(path) {
            let id = id.trim();
            if !id.is_empty() {
                return Some(id.to_string());
            }
        }
    }
    None
}

fn first_cpu_model() -> Option<String> {
    let mut sys = sysinfo::System::new();
    sys.refresh_cpu_list(sysinfo::CpuRefreshKind::nothing());
    sys.cpus().first().map(|c| c.brand().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_48_hex_chars() {
        let fp = digest("some-machine-id");
        assert_eq!(fp.len(), FINGERPRINT_LEN);
        assert!(fp.bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn digest_is_deterministic() {
        assert_eq!(digest("abc"), digest("abc"));
        assert_ne!(digest("abc"), digest("abd"));
    }

    #[test]
    fn load_creates_then_reuses() {
        let dir = tempfile::tempdir().unwrap();
        let first = load_or_create(dir.path()).unwrap();
        let second = load_or_create(dir.path()).unwrap();
        assert_eq!(first, second);

        let on_disk = std::fs::read_to_string(dir.path().join(FINGERPRINT_FILE)).unwrap();
        assert_eq!(on_disk.trim(), first);
    }

    #[test]
    fn corrupt_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(FINGERPRINT_FILE);
        std::fs::write(&path, "not-a-fingerprint\n").unwrap();

        let fp = load_or_create(dir.path()).unwrap();
        assert!(is_valid(&fp));
        let on_disk = std::fs::read_to_string(&path).unwrap();
        assert_eq!(on_disk.trim(), fp);
    }

    #[test]
    fn validity_check() {
        assert!(is_valid(&"a".repeat(48)));
        assert!(!is_valid(&"a".repeat(47)));
        assert!(!is_valid(&"g".repeat(48)));
    }
}
