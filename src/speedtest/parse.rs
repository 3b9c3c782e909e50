//! Interpretation of the speed-test CLI's JSON output
//!
//! The CLI emits newline-delimited JSON mixed with occasional non-JSON
//! progress noise. Lines that fail to parse are ignored; a `result` object
//! finishes the entry, `error`/`log` objects contribute error text, and
//! rate-limit markers abort the entire run.

use serde_json::Value;

/// Result of one server attempt
#[derive(Debug, Clone, serde::Serialize)]
pub struct SpeedEntry {
    /// Requested server id; empty means automatic selection
    pub server_id: String,
    pub server_label: String,
    /// Mbit/s
    pub download_mbps: f64,
    /// Mbit/s
    pub upload_mbps: f64,
    pub latency_ms: f64,
    /// Formatted percentage, or "-" when the CLI did not report it
    pub packet_loss: String,
    pub ok: bool,
    pub error_text: String,
    /// The peer told us to back off; the whole run stops
    pub rate_limited: bool,
}

impl SpeedEntry {
    pub fn new(server_id: &str, server_label: &str) -> Self {
        Self {
            server_id: server_id.to_string(),
            server_label: server_label.to_string(),
            download_mbps: 0.0,
            upload_mbps: 0.0,
            latency_ms: 0.0,
            packet_loss: "-".to_string(),
            ok: false,
            error_text: String::new(),
            rate_limited: false,
        }
    }
}

const RATE_LIMIT_MARKERS: [&str; 2] = ["Limit reached", "Too many requests"];

/// Interpret the CLI's combined output into `entry`.
pub fn apply_output(entry: &mut SpeedEntry, output: &str) {
    let mut last_raw_line = "";

    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        last_raw_line = line;

        if is_rate_limited(line) {
            entry.rate_limited = true;
            entry.error_text = "Rate limited by speed-test provider".to_string();
            return;
        }

        let value: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            // Non-JSON progress noise is expected.
            Err(_) => continue,
        };

        if let Some(message) = log_error_message(&value) {
            if is_rate_limited(message) {
                entry.rate_limited = true;
                entry.error_text = "Rate limited by speed-test provider".to_string();
                return;
            }
            entry.error_text = terse_log_error(message);
            continue;
        }

        if let Some(error) = value.get("error").and_then(Value::as_str) {
            entry.error_text = sanitize_error(error);
            continue;
        }

        if value.get("type").and_then(Value::as_str) == Some("result") {
            if apply_result(entry, &value) {
                entry.ok = true;
                entry.error_text.clear();
                return;
            }
        }
    }

    if !entry.ok && entry.error_text.is_empty() {
        entry.error_text = synthesize_error(last_raw_line);
    }
}

fn is_rate_limited(text: &str) -> bool {
    RATE_LIMIT_MARKERS.iter().any(|m| text.contains(m))
}

/// The `message` of a `{"type":"log","level":"error",...}` object.
fn log_error_message(value: &Value) -> Option<&str> {
    if value.get("type").and_then(Value::as_str) != Some("log") {
        return None;
    }
    if value.get("level").and_then(Value::as_str) != Some("error") {
        return None;
    }
    value.get("message").and_then(Value::as_str)
}

/// Fill the measurement fields from a `result` object. Both bandwidth
/// numbers are required; anything less leaves the entry unfinished.
fn apply_result(entry: &mut SpeedEntry, value: &Value) -> bool {
    let download = value
        .get("download")
        .and_then(|d| d.get("bandwidth"))
        .and_then(Value::as_f64);
    let upload = value
        .get("upload")
        .and_then(|u| u.get("bandwidth"))
        .and_then(Value::as_f64);

    let (download, upload) = match (download, upload) {
        (Some(d), Some(u)) => (d, u),
        _ => return false,
    };

    // The CLI reports bandwidth in bytes per second.
    entry.download_mbps = download * 8.0 / 1_000_000.0;
    entry.upload_mbps = upload * 8.0 / 1_000_000.0;

    entry.latency_ms = value
        .get("ping")
        .and_then(|p| p.get("latency"))
        .and_then(Value::as_f64)
        .unwrap_or(0.0);

    entry.packet_loss = match value.get("packetLoss").and_then(Value::as_f64) {
        Some(loss) => format!("{:.2} %", loss),
        None => "-".to_string(),
    };

    true
}

/// First line of an `error` field, trimmed, with the CLI's own "Error: "
/// prefix stripped.
fn sanitize_error(error: &str) -> String {
    let first_line = error.lines().next().unwrap_or("").trim();
    first_line
        .strip_prefix("Error: ")
        .unwrap_or(first_line)
        .to_string()
}

/// Condense a log-level-error message into report-sized text.
fn terse_log_error(message: &str) -> String {
    let text = sanitize_error(message);
    if text.contains("No servers defined") {
        return "Server Offline/Changed".to_string();
    }
    text
}

/// No result and no recorded error: blame the last thing the CLI said.
fn synthesize_error(last_raw_line: &str) -> String {
    if last_raw_line.is_empty() {
        return "CLI Error: no output".to_string();
    }
    let mut text: String = last_raw_line.chars().take(50).collect();
    if last_raw_line.chars().count() > 50 {
        text.push_str("...");
    }
    format!("CLI Error: {}", text)
}
