//! syspulse CLI entry point

use anyhow::{Context, Result};
use std::io::Write;
use syspulse::bench::{self, DiskBenchConfig};
use syspulse::config::{cli::Cli, Config};
use syspulse::output::{self, Report};
use syspulse::speedtest::{self, SpeedTest};
use syspulse::sysinfo::SystemInfo;
use syspulse::util::interrupt;

fn main() -> Result<()> {
    let cli = Cli::parse_args();
    cli.validate()?;
    let config = Config::from_cli(&cli)?;

    interrupt::install_handlers().context("failed to install signal handlers")?;

    if !config.json {
        println!("syspulse v{}", env!("CARGO_PKG_VERSION"));
        println!("Server profile: system facts, disk throughput, network speed");
        println!();
    }

    let mut report = Report::new(SystemInfo::collect());

    if config.run_disk {
        run_disk_section(&config, &mut report);
    }

    if config.run_speedtest && !interrupt::is_set() {
        run_speedtest_section(&config, &mut report);
    }

    if config.json {
        output::json::print_report(&report)?;
    } else {
        output::text::print_report(&report);
    }

    if interrupt::is_set() {
        anyhow::bail!("Operation interrupted by user");
    }
    Ok(())
}

fn run_disk_section(config: &Config, report: &mut Report) {
    let mut bench_config = DiskBenchConfig::new(config.disk_size_mib, "Disk", &config.disk_dir);
    bench_config.write_block_size = config.disk_block_size;
    bench_config.read_block_size = config.disk_block_size;
    bench_config.write_queue_depth = config.disk_queue_depth;
    bench_config.read_queue_depth = config.disk_queue_depth;
    bench_config.max_phase_seconds = config.disk_timeout_secs;
    bench_config.debug = config.debug;

    // Single-line progress; stays off stdout so the JSON report is clean.
    let show_progress = !config.json;
    let progress = |completed: u64, total: u64, label: &str| {
        if !show_progress {
            return;
        }
        let percent = if total > 0 { completed * 100 / total } else { 100 };
        eprint!("\r{} test: {:>3}%", label, percent);
        if completed == total {
            eprint!("\r                    \r");
        }
        let _ = std::io::stderr().flush();
    };

    match bench::run_io_test(&bench_config, Some(&progress), None) {
        Ok(result) => report.disk = Some(result),
        Err(e) => report.disk_error = Some(format!("{:#}", e)),
    }
}

fn run_speedtest_section(config: &Config, report: &mut Report) {
    if !config.json {
        eprintln!("Running network speed test (this takes a few minutes)...");
    }
    let outcome = SpeedTest::prepare(&speedtest::fetch::HttpFetcher, config.debug)
        .map(|test| test.run(speedtest::SERVERS, None));
    match outcome {
        Ok(run) => report.speedtest = Some(run),
        Err(e) => report.speedtest_error = Some(format!("{:#}", e)),
    }
}
