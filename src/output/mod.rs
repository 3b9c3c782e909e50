//! Report assembly and rendering

pub mod json;
pub mod text;

use crate::bench::DiskBenchResult;
use crate::speedtest::SpeedTestRun;
use crate::sysinfo::SystemInfo;
use serde::Serialize;

/// Everything one run produced, for either renderer
#[derive(Debug, Serialize)]
pub struct Report {
    pub generated_at: String,
    pub system: SystemInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk: Option<DiskBenchResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speedtest: Option<SpeedTestRun>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speedtest_error: Option<String>,
}

impl Report {
    pub fn new(system: SystemInfo) -> Self {
        Self {
            generated_at: chrono::Local::now().format("%Y-%m-%d %H:%M:%S %Z").to_string(),
            system,
            disk: None,
            disk_error: None,
            speedtest: None,
            speedtest_error: None,
        }
    }
}
