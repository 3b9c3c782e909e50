//! Read-only host facts for the report header
//!
//! Everything here degrades gracefully: a field that cannot be read becomes
//! a placeholder rather than a run failure, since the measurements are the
//! point of the program.

use std::fs;

const UNKNOWN: &str = "unknown";

/// Snapshot of the host taken once at startup
#[derive(Debug, Clone, serde::Serialize)]
pub struct SystemInfo {
    pub hostname: String,
    pub kernel: String,
    pub architecture: String,
    pub distro: String,
    pub cpu_model: String,
    pub cpu_cores: usize,
    pub memory_total_bytes: u64,
    pub memory_available_bytes: u64,
    pub uptime_seconds: u64,
}

impl SystemInfo {
    /// Collect every field, substituting placeholders where the host does
    /// not cooperate.
    pub fn collect() -> Self {
        let uts = nix::sys::utsname::uname().ok();
        let (memory_total_bytes, memory_available_bytes) =
            fs::read_to_string("/proc/meminfo")
                .ok()
                .map(|s| parse_meminfo(&s))
                .unwrap_or((0, 0));

        Self {
            hostname: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| UNKNOWN.to_string()),
            kernel: uts
                .as_ref()
                .map(|u| {
                    format!(
                        "{} {}",
                        u.sysname().to_string_lossy(),
                        u.release().to_string_lossy()
                    )
                })
                .unwrap_or_else(|| UNKNOWN.to_string()),
            architecture: uts
                .as_ref()
                .map(|u| u.machine().to_string_lossy().into_owned())
                .unwrap_or_else(|| UNKNOWN.to_string()),
            distro: fs::read_to_string("/etc/os-release")
                .ok()
                .and_then(|s| parse_os_release(&s))
                .unwrap_or_else(|| UNKNOWN.to_string()),
            cpu_model: fs::read_to_string("/proc/cpuinfo")
                .ok()
                .and_then(|s| parse_cpu_model(&s))
                .unwrap_or_else(|| UNKNOWN.to_string()),
            cpu_cores: num_cpus::get(),
            memory_total_bytes,
            memory_available_bytes,
            uptime_seconds: fs::read_to_string("/proc/uptime")
                .ok()
                .and_then(|s| parse_uptime(&s))
                .unwrap_or(0),
        }
    }
}

/// PRETTY_NAME from /etc/os-release, quotes stripped.
fn parse_os_release(content: &str) -> Option<String> {
    for line in content.lines() {
        if let Some(value) = line.strip_prefix("PRETTY_NAME=") {
            return Some(value.trim().trim_matches('"').to_string());
        }
    }
    None
}

/// First "model name" line from /proc/cpuinfo.
fn parse_cpu_model(content: &str) -> Option<String> {
    for line in content.lines() {
        if line.starts_with("model name") {
            if let Some((_, value)) = line.split_once(':') {
                return Some(value.trim().to_string());
            }
        }
    }
    None
}

/// MemTotal and MemAvailable from /proc/meminfo, in bytes.
fn parse_meminfo(content: &str) -> (u64, u64) {
    let mut total = 0;
    let mut available = 0;
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total = parse_kib_field(rest);
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            available = parse_kib_field(rest);
        }
    }
    (total, available)
}

/// "   16384 kB" -> bytes
fn parse_kib_field(rest: &str) -> u64 {
    rest.trim()
        .split_whitespace()
        .next()
        .and_then(|n| n.parse::<u64>().ok())
        .map(|kib| kib * 1024)
        .unwrap_or(0)
}

/// First float of /proc/uptime, truncated to whole seconds.
fn parse_uptime(content: &str) -> Option<u64> {
    content
        .split_whitespace()
        .next()?
        .parse::<f64>()
        .ok()
        .map(|s| s as u64)
}
