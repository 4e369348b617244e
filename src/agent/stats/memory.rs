use sysinfo::System;

use crate::config::MemCalc;
use crate::types::{round2, HostStats};

/// Populate memory and swap fields from a refreshed sysinfo System.
///
/// ZFS hosts report the ARC inside "used" memory even though the kernel will
/// shrink it under pressure; the ARC size is subtracted out and reported in
/// its own field so dashboards don't show a full-looking host.
pub fn collect(sys: &System, mode: MemCalc, stats: &mut HostStats) {
    let total = sys.total_memory();
    let free = sys.free_memory();
    let available = sys.available_memory();
    let buff_cache = total
        .saturating_sub(free)
        .saturating_sub(sys.used_memory());

    let mut used = match mode {
        MemCalc::Htop => total.saturating_sub(free).saturating_sub(buff_cache),
        MemCalc::Default => total.saturating_sub(available),
    };

    let arc = zfs_arc_size().unwrap_or(0);
    if arc > 0 {
        used = used.saturating_sub(arc);
    }

    stats.mem_total = total;
    stats.mem_used = used;
    stats.mem_buff_cache = buff_cache;
    stats.mem_zfs_arc = arc;
    stats.mem_pct = if total > 0 {
        round2(used as f64 / total as f64 * 100.0)
    } else {
        0.0
    };

    let swap_total = sys.total_swap();
    let swap_used = sys.used_swap();
    stats.swap_total = swap_total;
    stats.swap_used = swap_used;
    stats.swap_pct = if swap_total > 0 {
        round2(swap_used as f64 / swap_total as f64 * 100.0)
    } else {
        0.0
    };
}

/// ZFS ARC size in bytes, when the ZFS kstat interface is present.
fn zfs_arc_size() -> Option<u64> {
    let contents = std::fs::read_to_string("/proc/spl/kstat/zfs/arcstats").ok()?;
    parse_arc_size(&contents)
}

fn parse_arc_size(contents: &str) -> Option<u64> {
    // Row format: "name  type  data" — we want the row named "size".
    contents.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        if fields.next() == Some("size") {
            fields.nth(1).and_then(|v| v.parse().ok())
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARCSTATS: &str = "\
13 1 0x01 123 33456 8273429382 9382738473829
name                            type data
hits                            4    123456
misses                          4    789
size                            4    2147483648
c_max                           4    8589934592
";

    #[test]
    fn arc_size_parsed_from_kstat_table() {
        assert_eq!(parse_arc_size(ARCSTATS), Some(2_147_483_648));
    }

    #[test]
    fn arc_size_absent_row_is_none() {
        assert_eq!(parse_arc_size("name type data\nhits 4 12\n"), None);
    }

    #[test]
    fn arc_size_garbage_is_none() {
        assert_eq!(parse_arc_size("size\n"), None);
        assert_eq!(parse_arc_size(""), None);
    }
}
