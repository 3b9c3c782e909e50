//! CLI acquisition: architecture mapping, tarball download seam, and CA
//! bundle staging
//!
//! The HTTP client is deliberately narrow: the driver only ever asks for
//! "this URL into this file", so tests can substitute a local fetcher and
//! the rest of the pipeline runs unchanged.

use crate::Result;
use anyhow::Context;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

/// Version of the speed-test CLI the profiler downloads
const CLI_VERSION: &str = "1.2.0";

/// CA bundle compiled into the binary; the downloaded CLI is pointed at a
/// staged copy so it never depends on host certificate stores.
const CA_BUNDLE: &[u8] = include_bytes!(concat!(env!("CARGO_MANIFEST_DIR"), "/assets/cacert.pem"));

/// Narrow interface to the HTTP collaborator.
pub trait Fetcher {
    /// Download `url` into `dest`, fully, or fail.
    fn fetch(&self, url: &str, dest: &Path) -> Result<()>;
}

/// Production fetcher on a blocking HTTP client.
pub struct HttpFetcher;

impl Fetcher for HttpFetcher {
    fn fetch(&self, url: &str, dest: &Path) -> Result<()> {
        let response = ureq::get(url)
            .call()
            .with_context(|| format!("download failed: {}", url))?;
        let mut reader = response.into_reader();
        let mut file = File::create(dest)
            .with_context(|| format!("failed to create {}", dest.display()))?;
        std::io::copy(&mut reader, &mut file)
            .with_context(|| format!("failed to store {}", dest.display()))?;
        file.sync_all().context("fsync of downloaded file failed")?;
        Ok(())
    }
}

/// Map `uname().machine` onto the CLI tarball architecture tag. Unknown
/// machine names are rejected rather than guessed at.
pub fn cli_arch(machine: &str) -> Result<&'static str> {
    match machine {
        "x86_64" => Ok("x86_64"),
        "i386" | "i486" | "i586" | "i686" => Ok("i386"),
        "aarch64" | "arm64" => Ok("aarch64"),
        "armv7l" | "armhf" => Ok("armhf"),
        "armv6l" | "armel" => Ok("armel"),
        other => anyhow::bail!("Unsupported CPU architecture: {}", other),
    }
}

/// Tarball URL for the given architecture tag
pub fn tarball_url(arch: &str) -> String {
    format!(
        "https://install.speedtest.net/app/cli/ookla-speedtest-{}-linux-{}.tgz",
        CLI_VERSION, arch
    )
}

/// Write the embedded CA bundle into `dir` at mode 0o600 and fsync it.
/// Returns the staged path.
pub fn stage_ca_bundle(dir: &Path) -> Result<PathBuf> {
    let path = dir.join("cacert.pem");
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(&path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    write_fully(&mut file, CA_BUNDLE)
        .with_context(|| format!("failed to write {}", path.display()))?;
    file.sync_all().context("fsync of CA bundle failed")?;
    Ok(path)
}

/// Write every byte, retrying EINTR and partial writes in place.
fn write_fully(file: &mut File, mut data: &[u8]) -> std::io::Result<()> {
    while !data.is_empty() {
        match file.write(data) {
            Ok(0) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "write returned zero bytes",
                ))
            }
            Ok(n) => data = &data[n..],
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
