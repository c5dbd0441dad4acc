//! Human-readable formatting for the per-connection accounting line.

use std::time::Duration;

/// Byte unit suffixes, smallest first. Each step is a factor of 1000.
pub const BYTE_UNITS: [&str; 5] = ["o", "ko", "mo", "go", "to"];

/// Format a byte count with a metric suffix.
///
/// Values up to and including 1000 stay in the current unit; anything larger
/// is divided by 1000 (integer division) and promoted to the next unit. The
/// last unit absorbs everything beyond it.
pub fn human_bytes(bytes: u64) -> String {
    let mut value = bytes;
    let mut unit = 0;
    while value > 1000 && unit < BYTE_UNITS.len() - 1 {
        value /= 1000;
        unit += 1;
    }
    format!("{value}{}", BYTE_UNITS[unit])
}

/// Format an elapsed duration truncated to whole milliseconds.
///
/// Output looks like `0s`, `15ms`, `1.204s`, `2m3.5s` or `1h0m0s`.
pub fn human_duration(elapsed: Duration) -> String {
    let millis = elapsed.as_millis();
    if millis == 0 {
        return "0s".to_string();
    }
    if millis < 1000 {
        return format!("{millis}ms");
    }

    let total_secs = millis / 1000;
    let frac = millis % 1000;
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let secs = total_secs % 60;

    let mut out = String::new();
    if hours > 0 {
        out.push_str(&format!("{hours}h{minutes}m"));
    } else if minutes > 0 {
        out.push_str(&format!("{minutes}m"));
    }

    if frac == 0 {
        out.push_str(&format!("{secs}s"));
    } else {
        let frac = format!("{frac:03}");
        out.push_str(&format!("{secs}.{}s", frac.trim_end_matches('0')));
    }
    out
}
