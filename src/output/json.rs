//! JSON report output

use super::Report;
use crate::Result;
use anyhow::Context;

/// Print the report as pretty JSON to stdout.
pub fn print_report(report: &Report) -> Result<()> {
    let rendered = serde_json::to_string_pretty(report).context("failed to serialize report")?;
    println!("{}", rendered);
    Ok(())
}
