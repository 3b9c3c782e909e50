//! Human-readable terminal report

use super::Report;
use crate::util::time::{format_bytes, format_mib_rate, format_uptime};

const RULE: &str = "═══════════════════════════════════════════════════════════";

/// Print the full report to stdout.
pub fn print_report(report: &Report) {
    println!("{}", RULE);
    println!("                    SERVER PROFILE");
    println!("{}", RULE);
    println!();
    println!("Generated: {}", report.generated_at);
    println!();

    print_system(report);
    print_disk(report);
    print_speedtest(report);

    println!("{}", RULE);
}

fn print_system(report: &Report) {
    let system = &report.system;
    println!("System:");
    println!("  Hostname:  {}", system.hostname);
    println!("  OS:        {}", system.distro);
    println!("  Kernel:    {}", system.kernel);
    println!("  CPU:       {} ({} cores, {})", system.cpu_model, system.cpu_cores, system.architecture);
    println!(
        "  Memory:    {} total, {} available",
        format_bytes(system.memory_total_bytes),
        format_bytes(system.memory_available_bytes)
    );
    println!("  Uptime:    {}", format_uptime(system.uptime_seconds));
    println!();
}

fn print_disk(report: &Report) {
    println!("Disk Throughput:");
    match (&report.disk, &report.disk_error) {
        (Some(disk), _) => {
            println!("  Write: {}", format_mib_rate(disk.write_mbps));
            println!("  Read:  {}", format_mib_rate(disk.read_mbps));
            println!("  Mode:  {} ({} backend)", disk.storage_mode, disk.backend);
        }
        (None, Some(error)) => println!("  Failed: {}", error),
        (None, None) => println!("  Skipped"),
    }
    println!();
}

fn print_speedtest(report: &Report) {
    println!("Network Speed:");
    match (&report.speedtest, &report.speedtest_error) {
        (Some(run), _) => {
            println!(
                "  {:<18} {:>12} {:>12} {:>10} {:>8}",
                "Server", "Download", "Upload", "Latency", "Loss"
            );
            for entry in &run.entries {
                if entry.ok {
                    println!(
                        "  {:<18} {:>9.2} Mbps {:>9.2} Mbps {:>7.1} ms {:>8}",
                        entry.server_label,
                        entry.download_mbps,
                        entry.upload_mbps,
                        entry.latency_ms,
                        entry.packet_loss
                    );
                } else {
                    println!("  {:<18} {}", entry.server_label, entry.error_text);
                }
            }
            if run.rate_limited {
                println!("  Run aborted: provider rate limit; remaining servers skipped");
            }
        }
        (None, Some(error)) => println!("  Failed: {}", error),
        (None, None) => println!("  Skipped"),
    }
    println!();
}
