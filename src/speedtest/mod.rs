//! Upstream speed measurement via the external speed-test CLI
//!
//! The driver stages a private working directory (CA bundle + downloaded
//! CLI), then runs the CLI once per configured server and interprets its
//! JSON output. One rate-limited attempt aborts the remaining servers; any
//! other per-server failure is recorded and the run continues.

pub mod fetch;
pub mod parse;

use crate::extract;
use crate::pipe::ShellPipe;
use crate::util::interrupt;
use crate::Result;
use anyhow::Context;
use fetch::Fetcher;
use parse::SpeedEntry;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::time::Duration;
use tempfile::TempDir;

/// Per-server CLI timeout
const SERVER_TIMEOUT: Duration = Duration::from_secs(90);
/// Name of the binary inside the CLI tarball
const CLI_BINARY: &str = "speedtest";

/// One target for a measurement; an empty id lets the CLI pick the nearest
/// server.
#[derive(Debug, Clone, Copy)]
pub struct ServerSpec {
    pub id: &'static str,
    pub label: &'static str,
}

/// Fixed measurement set: automatic selection plus a few region pins.
pub const SERVERS: &[ServerSpec] = &[
    ServerSpec { id: "", label: "Auto (nearest)" },
    ServerSpec { id: "17398", label: "New York, US" },
    ServerSpec { id: "40508", label: "Frankfurt, DE" },
    ServerSpec { id: "13623", label: "Singapore, SG" },
];

/// Outcome of a whole run
#[derive(Debug, serde::Serialize)]
pub struct SpeedTestRun {
    pub entries: Vec<SpeedEntry>,
    /// True when a rate-limit marker cut the run short
    pub rate_limited: bool,
}

/// A prepared speed test: private working directory, staged CA bundle and
/// an executable CLI. The directory (and everything staged in it) is
/// removed when this drops.
#[derive(Debug)]
pub struct SpeedTest {
    workdir: TempDir,
    cli_path: PathBuf,
    ca_path: PathBuf,
    debug: bool,
}

impl SpeedTest {
    /// Stage everything the CLI needs: a 0o700 working directory, the CA
    /// bundle, and the CLI tarball for this machine's architecture,
    /// extracted and marked executable.
    pub fn prepare(fetcher: &dyn Fetcher, debug: bool) -> Result<Self> {
        let workdir = TempDir::new().context("failed to create working directory")?;

        let ca_path = fetch::stage_ca_bundle(workdir.path())?;

        let uts = nix::sys::utsname::uname().context("failed to read uname")?;
        let machine = uts
            .machine()
            .to_str()
            .context("uname machine field is not valid UTF-8")?;
        let arch = fetch::cli_arch(machine)?;
        let url = fetch::tarball_url(arch);
        if debug {
            eprintln!("DEBUG: fetching speed-test CLI from {}", url);
        }

        let tgz_path = workdir.path().join("speedtest.tgz");
        fetcher.fetch(&url, &tgz_path)?;

        let cli_dir = workdir.path().join("cli");
        fs::create_dir(&cli_dir).context("failed to create CLI directory")?;
        extract::extract(&tgz_path, &cli_dir)
            .map_err(|e| anyhow::anyhow!("failed to unpack speed-test CLI: {}", e))?;

        let cli_path = cli_dir.join(CLI_BINARY);
        if !cli_path.is_file() {
            anyhow::bail!("speed-test CLI binary missing from archive");
        }
        fs::set_permissions(&cli_path, fs::Permissions::from_mode(0o755))
            .context("failed to mark CLI executable")?;

        Ok(Self {
            workdir,
            cli_path,
            ca_path,
            debug,
        })
    }

    /// Run the CLI against each server in order. Rate limiting aborts the
    /// loop; cancellation stops before the next server starts.
    pub fn run(&self, servers: &[ServerSpec], cancel: Option<&AtomicBool>) -> SpeedTestRun {
        let mut entries = Vec::with_capacity(servers.len());
        let mut rate_limited = false;

        for server in servers {
            if interrupt::is_set()
                || cancel.map_or(false, |c| c.load(std::sync::atomic::Ordering::Relaxed))
            {
                break;
            }

            let mut entry = SpeedEntry::new(server.id, server.label);
            match self.run_one(server, cancel) {
                Ok(output) => parse::apply_output(&mut entry, &output),
                Err(e) => entry.error_text = e.to_string(),
            }

            let stop = entry.rate_limited;
            if stop {
                rate_limited = true;
            }
            if self.debug {
                eprintln!(
                    "DEBUG: server '{}' ok={} error='{}'",
                    server.label, entry.ok, entry.error_text
                );
            }
            entries.push(entry);
            if stop {
                break;
            }
        }

        SpeedTestRun {
            entries,
            rate_limited,
        }
    }

    fn run_one(&self, server: &ServerSpec, cancel: Option<&AtomicBool>) -> Result<String> {
        let mut argv = vec![
            self.cli_path.display().to_string(),
            "-f".to_string(),
            "json".to_string(),
            "--accept-license".to_string(),
            "--accept-gdpr".to_string(),
            format!("--ca-certificate={}", self.ca_path.display()),
        ];
        if !server.id.is_empty() {
            argv.push(format!("--server-id={}", server.id));
        }

        let mut pipe = ShellPipe::spawn(&argv)?;
        pipe.read_all(SERVER_TIMEOUT, cancel, false)
    }

    /// The staged working directory (tests look inside it).
    pub fn workdir(&self) -> &std::path::Path {
        self.workdir.path()
    }
}
