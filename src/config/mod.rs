//! Run configuration
//!
//! The CLI is the whole configuration surface; this module converts parsed
//! arguments into the plain values the run consumes.

pub mod cli;

use crate::Result;
use anyhow::Context;
use cli::Cli;
use std::path::PathBuf;

/// Resolved configuration for one profiler run
#[derive(Debug, Clone)]
pub struct Config {
    pub disk_size_mib: u64,
    pub disk_block_size: usize,
    pub disk_queue_depth: usize,
    pub disk_timeout_secs: u64,
    pub disk_dir: PathBuf,
    pub run_disk: bool,
    pub run_speedtest: bool,
    pub json: bool,
    pub debug: bool,
}

impl Config {
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let disk_size = parse_size(&cli.disk_size).context("Invalid --disk-size")?;
        let disk_block_size = parse_size(&cli.disk_block_size).context("Invalid --disk-block-size")?;

        let disk_dir = match &cli.disk_dir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir().context("cannot resolve current directory")?,
        };

        Ok(Self {
            disk_size_mib: (disk_size / (1024 * 1024)).max(1),
            disk_block_size: disk_block_size as usize,
            disk_queue_depth: cli.disk_queue_depth,
            disk_timeout_secs: cli.disk_timeout,
            disk_dir,
            run_disk: !cli.skip_disk,
            run_speedtest: !cli.skip_speedtest,
            json: cli.json,
            debug: cli.debug,
        })
    }
}

/// Parse a size string like "4k", "16M", "1G", or plain bytes.
pub fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim().to_lowercase();

    let (num_str, multiplier) = if s.ends_with("k") || s.ends_with("kb") {
        (s.trim_end_matches("kb").trim_end_matches("k"), 1024u64)
    } else if s.ends_with("m") || s.ends_with("mb") {
        (s.trim_end_matches("mb").trim_end_matches("m"), 1024 * 1024)
    } else if s.ends_with("g") || s.ends_with("gb") {
        (s.trim_end_matches("gb").trim_end_matches("g"), 1024 * 1024 * 1024)
    } else {
        (s.as_str(), 1)
    };

    let num: u64 = num_str
        .parse()
        .with_context(|| format!("Invalid size format: {}", s))?;

    Ok(num * multiplier)
}
