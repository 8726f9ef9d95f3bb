//! Small formatting and sizing helpers shared across the CLI-facing
//! pieces of the core crate.

/// Render a byte count the way the CLI tools report volume/journal
/// sizes: whole units for anything at or above 1 KiB, raw bytes below.
pub fn fmt_bytes_human(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    if bytes == 0 {
        return "0 B".to_string();
    }
    let mut value = bytes as f64;
    let mut unit = 0usize;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

/// Percentage of `used` out of `total`, for progress reporting during a
/// repair pass; returns 0 when `total` is 0 rather than dividing by it.
pub fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        (used as f64 / total as f64) * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn human_bytes_picks_unit() {
        assert_eq!(fmt_bytes_human(0), "0 B");
        assert_eq!(fmt_bytes_human(512), "512 B");
        assert_eq!(fmt_bytes_human(2048), "2.0 KiB");
        assert_eq!(fmt_bytes_human(5 * 1024 * 1024), "5.0 MiB");
    }

    #[test]
    fn percent_handles_zero_total() {
        assert_eq!(percent(5, 0), 0.0);
        assert_eq!(percent(50, 200), 25.0);
    }
}
