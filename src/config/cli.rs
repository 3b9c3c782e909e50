//! CLI argument parsing using clap

use clap::Parser;
use std::path::PathBuf;

/// syspulse - single-binary Linux server profiler
#[derive(Parser, Debug)]
#[command(name = "syspulse")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Disk test payload size (e.g. 256M, 1G)
    #[arg(long, default_value = "1G")]
    pub disk_size: String,

    /// Disk test block size; power of two, multiple of 4096 (e.g. 256k, 1M)
    #[arg(long, default_value = "1M")]
    pub disk_block_size: String,

    /// In-flight requests per benchmark phase (1-128)
    #[arg(long, default_value = "8")]
    pub disk_queue_depth: usize,

    /// Per-phase disk test deadline in seconds
    #[arg(long, default_value = "600")]
    pub disk_timeout: u64,

    /// Directory for the benchmark working file (default: current directory)
    #[arg(long)]
    pub disk_dir: Option<PathBuf>,

    /// Skip the disk throughput test
    #[arg(long)]
    pub skip_disk: bool,

    /// Skip the network speed test
    #[arg(long)]
    pub skip_speedtest: bool,

    /// Emit the report as JSON instead of the terminal layout
    #[arg(long)]
    pub json: bool,

    /// Print debug traces to stderr
    #[arg(long)]
    pub debug: bool,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.disk_queue_depth == 0 || self.disk_queue_depth > 128 {
            anyhow::bail!("disk_queue_depth must be between 1 and 128");
        }
        if self.disk_timeout == 0 {
            anyhow::bail!("disk_timeout must be at least 1 second");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_valid() {
        let cli = Cli::parse_from(["syspulse"]);
        assert!(cli.validate().is_ok());
        assert_eq!(cli.disk_size, "1G");
        assert!(!cli.skip_disk);
    }

    #[test]
    fn test_rejects_zero_queue_depth() {
        let cli = Cli::parse_from(["syspulse", "--disk-queue-depth", "0"]);
        assert!(cli.validate().is_err());
    }

    #[test]
    fn test_rejects_excess_queue_depth() {
        let cli = Cli::parse_from(["syspulse", "--disk-queue-depth", "200"]);
        assert!(cli.validate().is_err());
    }
}
