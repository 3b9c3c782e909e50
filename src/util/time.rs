//! Timing math and human-readable formatting

use std::time::Duration;

/// Calculate throughput in MiB/s from a payload size and elapsed wall time.
///
/// Zero or negative elapsed times produce 0.0 rather than a division error;
/// a benchmark phase that finished inside the clock's resolution has no
/// meaningful rate.
pub fn throughput_mib(size_mib: u64, elapsed: Duration) -> f64 {
    let seconds = elapsed.as_secs_f64();
    if seconds > 0.0 {
        size_mib as f64 / seconds
    } else {
        0.0
    }
}

/// Format a MiB/s figure for the report
pub fn format_mib_rate(mib_per_sec: f64) -> String {
    if mib_per_sec >= 1024.0 {
        format!("{:.2} GiB/s", mib_per_sec / 1024.0)
    } else {
        format!("{:.2} MiB/s", mib_per_sec)
    }
}

/// Format a Mbit/s figure for the report
pub fn format_mbps(mbps: f64) -> String {
    format!("{:.2} Mbps", mbps)
}

/// Format bytes with binary units
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Format an uptime figure as "Nd NNh NNm"
pub fn format_uptime(seconds: u64) -> String {
    let days = seconds / 86_400;
    let hours = (seconds % 86_400) / 3_600;
    let minutes = (seconds % 3_600) / 60;
    if days > 0 {
        format!("{}d {}h {}m", days, hours, minutes)
    } else if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else {
        format!("{}m", minutes)
    }
}
