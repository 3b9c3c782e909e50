//! Disk throughput benchmark
//!
//! Writes a payload file with a bounded window of queued direct writes,
//! syncs, then reads it back the same way, and reports MiB/s for each
//! phase. The file is opened with the strictest storage mode the kernel
//! accepts (O_DIRECT+O_DSYNC down to plain buffered, falling through on
//! EINVAL only) so results measure the device rather than the page cache
//! wherever possible.
//!
//! Per-phase state machine:
//! Idle -> Opened(mode) -> Preallocated -> Draining -> Synced -> Done, with
//! any state able to fail after draining in-flight requests.

use crate::engine::{self, IoOp, IoQueue, IoRequest};
use crate::util::buffer::{AlignedBuffer, BufferPool};
use crate::util::fd::OwnedFd;
use crate::util::interrupt;
use crate::util::time::throughput_mib;
use crate::Result;
use anyhow::Context;
use std::collections::HashMap;
use std::ffi::CString;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Once;
use std::time::{Duration, Instant};

const MIB: u64 = 1024 * 1024;
/// Required buffer/offset alignment for O_DIRECT
const DIRECT_ALIGNMENT: usize = 4096;
/// Working file prefix; the pid suffix keeps concurrent runs apart
const BENCH_FILE_BASE: &str = "syspulse_bench";

static CACHE_MODE_WARNING: Once = Once::new();

/// Progress observer: `(completed_blocks, total_blocks, label)`
pub type ProgressFn<'a> = &'a dyn Fn(u64, u64, &str);

/// Storage modes, in preference order. The benchmark records which one the
/// kernel actually granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum StorageMode {
    DirectAndSync,
    Direct,
    Sync,
    Buffered,
}

impl std::fmt::Display for StorageMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageMode::DirectAndSync => write!(f, "direct+sync"),
            StorageMode::Direct => write!(f, "direct"),
            StorageMode::Sync => write!(f, "sync"),
            StorageMode::Buffered => write!(f, "buffered"),
        }
    }
}

/// Benchmark parameters for one `run_io_test` call
#[derive(Debug, Clone)]
pub struct DiskBenchConfig {
    /// Total payload in MiB
    pub size_mib: u64,
    /// Label carried into progress callbacks and the result
    pub label: String,
    /// Directory holding the working file
    pub dir: PathBuf,
    /// Write granularity; power of two, multiple of 4096
    pub write_block_size: usize,
    /// Read granularity; power of two, multiple of 4096
    pub read_block_size: usize,
    /// Max in-flight write requests
    pub write_queue_depth: usize,
    /// Max in-flight read requests
    pub read_queue_depth: usize,
    /// Per-phase deadline; the clock restarts for the read phase
    pub max_phase_seconds: u64,
    pub debug: bool,
}

impl DiskBenchConfig {
    pub fn new(size_mib: u64, label: &str, dir: &Path) -> Self {
        Self {
            size_mib,
            label: label.to_string(),
            dir: dir.to_path_buf(),
            write_block_size: MIB as usize,
            read_block_size: MIB as usize,
            write_queue_depth: 8,
            read_queue_depth: 8,
            max_phase_seconds: 600,
            debug: false,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.size_mib == 0 {
            anyhow::bail!("Disk test size must be non-zero");
        }
        for (name, bs) in [
            ("write block size", self.write_block_size),
            ("read block size", self.read_block_size),
        ] {
            if !bs.is_power_of_two() || bs % DIRECT_ALIGNMENT != 0 {
                anyhow::bail!("{} must be a power of two multiple of 4096, got {}", name, bs);
            }
        }
        if self.write_queue_depth == 0 || self.read_queue_depth == 0 {
            anyhow::bail!("queue depth must be at least 1");
        }
        Ok(())
    }
}

/// One finished benchmark
#[derive(Debug, Clone, serde::Serialize)]
pub struct DiskBenchResult {
    pub label: String,
    /// MiB/s
    pub write_mbps: f64,
    /// MiB/s
    pub read_mbps: f64,
    pub storage_mode: StorageMode,
    /// Queue backend that carried the requests
    pub backend: &'static str,
}

/// Removes the working file on every exit path.
struct BenchFile {
    path: PathBuf,
}

impl Drop for BenchFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Run the write-then-read disk benchmark.
///
/// `cancel` is a per-call token checked alongside the process-wide
/// interrupt flag at every completion; either aborts the run after the
/// in-flight window drains.
pub fn run_io_test(
    config: &DiskBenchConfig,
    progress: Option<ProgressFn<'_>>,
    cancel: Option<&AtomicBool>,
) -> Result<DiskBenchResult> {
    config.validate()?;

    let size_bytes = config.size_mib * MIB;
    ensure_free_space(&config.dir, size_bytes)?;

    let path = config
        .dir
        .join(format!("{}.{}", BENCH_FILE_BASE, std::process::id()));
    // A leftover from a crashed run with a recycled pid would trip O_EXCL.
    let _ = std::fs::remove_file(&path);
    let bench_file = BenchFile { path: path.clone() };

    let (mut write_fd, storage_mode) = open_for_write(&path)?;
    if storage_mode != StorageMode::DirectAndSync {
        CACHE_MODE_WARNING.call_once(|| {
            eprintln!(
                "Warning: disk test running in {} mode; results may reflect RAM cache",
                storage_mode
            );
        });
    }
    if config.debug {
        eprintln!("DEBUG: disk test file {} mode {}", path.display(), storage_mode);
    }

    preallocate(write_fd.as_raw(), size_bytes)?;

    let (write_elapsed, backend) = write_phase(config, &write_fd, size_bytes, progress, cancel)?;

    // Data must be on stable storage before the read phase measures it.
    if unsafe { libc::fdatasync(write_fd.as_raw()) } < 0 {
        return Err(std::io::Error::last_os_error()).context("fdatasync failed");
    }
    drop_page_cache(write_fd.as_raw());
    write_fd.reset(-1);

    let read_fd = open_for_read(&path)?;
    let read_elapsed = read_phase(config, &read_fd, size_bytes, progress, cancel)?;
    drop(read_fd);
    drop(bench_file);

    Ok(DiskBenchResult {
        label: config.label.clone(),
        write_mbps: throughput_mib(config.size_mib, write_elapsed),
        read_mbps: throughput_mib(config.size_mib, read_elapsed),
        storage_mode,
        backend,
    })
}

/// Confirm the target filesystem has room for the payload.
fn ensure_free_space(dir: &Path, size_bytes: u64) -> Result<()> {
    let stat = nix::sys::statvfs::statvfs(dir)
        .with_context(|| format!("statvfs failed for {}", dir.display()))?;
    let available = stat.blocks_available() as u64 * stat.fragment_size() as u64;
    if available < size_bytes {
        anyhow::bail!(
            "Insufficient free space in {}: need {} MiB, have {} MiB",
            dir.display(),
            size_bytes / MIB,
            available / MIB
        );
    }
    Ok(())
}

/// Open the working file with the strictest accepted flag set.
///
/// The ladder falls through to the next level only on EINVAL (the errno
/// Linux uses for unsupported O_DIRECT); any other failure is reported
/// verbatim.
fn open_for_write(path: &Path) -> Result<(OwnedFd, StorageMode)> {
    const BASE: libc::c_int = libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC | libc::O_EXCL;
    let ladder: [(libc::c_int, StorageMode); 4] = [
        (libc::O_DIRECT | libc::O_DSYNC, StorageMode::DirectAndSync),
        (libc::O_DIRECT, StorageMode::Direct),
        (libc::O_DSYNC, StorageMode::Sync),
        (0, StorageMode::Buffered),
    ];

    let c_path = path_to_cstring(path)?;
    for (extra, mode) in ladder {
        let fd = unsafe { libc::open(c_path.as_ptr(), BASE | extra, 0o600 as libc::c_uint) };
        if fd >= 0 {
            return Ok((OwnedFd::wrap(fd), mode));
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINVAL) {
            return Err(err).with_context(|| format!("open failed for {}", path.display()));
        }
        // EINVAL: this flag combination is unsupported here; try the next.
    }
    anyhow::bail!("open failed for {}: all storage modes rejected", path.display())
}

/// Re-open for the read phase, direct if the kernel allows it.
fn open_for_read(path: &Path) -> Result<OwnedFd> {
    let c_path = path_to_cstring(path)?;
    for extra in [libc::O_DIRECT, 0] {
        let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_RDONLY | extra) };
        if fd >= 0 {
            return Ok(OwnedFd::wrap(fd));
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINVAL) {
            return Err(err).with_context(|| format!("re-open failed for {}", path.display()));
        }
    }
    anyhow::bail!("re-open failed for {}: all read modes rejected", path.display())
}

fn path_to_cstring(path: &Path) -> Result<CString> {
    use std::os::unix::ffi::OsStrExt;
    CString::new(path.as_os_str().as_bytes()).context("path contains NUL byte")
}

/// Reserve the full payload up front so allocation cost stays out of the
/// measurement. Filesystems without fallocate support are tolerated.
fn preallocate(fd: i32, size_bytes: u64) -> Result<()> {
    let rc = unsafe { libc::posix_fallocate(fd, 0, size_bytes as libc::off_t) };
    if rc == 0 || rc == libc::EINVAL || rc == libc::ENOTSUP {
        return Ok(());
    }
    Err(std::io::Error::from_raw_os_error(rc)).context("posix_fallocate failed")
}

/// Best-effort eviction of the file's pages between the phases.
fn drop_page_cache(fd: i32) {
    unsafe {
        libc::posix_fadvise(fd, 0, 0, libc::POSIX_FADV_DONTNEED);
    }
}

fn cancelled(cancel: Option<&AtomicBool>) -> bool {
    interrupt::is_set() || cancel.map_or(false, |c| c.load(Ordering::Relaxed))
}

/// Block count and per-block request length for a payload.
fn block_len(size_bytes: u64, block_size: usize, index: u64) -> usize {
    let offset = index * block_size as u64;
    (size_bytes - offset).min(block_size as u64) as usize
}

fn block_count(size_bytes: u64, block_size: usize) -> u64 {
    (size_bytes + block_size as u64 - 1) / block_size as u64
}

/// Write the payload with a bounded in-flight window; returns the phase's
/// wall-clock duration.
fn write_phase(
    config: &DiskBenchConfig,
    fd: &OwnedFd,
    size_bytes: u64,
    progress: Option<ProgressFn<'_>>,
    cancel: Option<&AtomicBool>,
) -> Result<(Duration, &'static str)> {
    let block_size = config.write_block_size;
    let total_blocks = block_count(size_bytes, block_size);
    let depth = config.write_queue_depth;

    let mut buffer = AlignedBuffer::new(block_size, DIRECT_ALIGNMENT);
    buffer.fill_pattern(0);
    let buffer_ptr = buffer.as_mut_ptr();

    let mut queue = engine::open_queue(depth, config.debug);
    let backend = queue.backend_name();
    let deadline = Instant::now() + Duration::from_secs(config.max_phase_seconds);
    let started = Instant::now();

    let mut next_block: u64 = 0;
    let mut in_flight: usize = 0;
    let mut completed: u64 = 0;

    let result = (|| -> Result<()> {
        while completed < total_blocks {
            while next_block < total_blocks && in_flight < depth {
                let length = block_len(size_bytes, block_size, next_block);
                queue.submit(IoRequest {
                    op: IoOp::Write,
                    fd: fd.as_raw(),
                    offset: next_block * block_size as u64,
                    buffer: buffer_ptr,
                    length,
                    token: next_block,
                })?;
                next_block += 1;
                in_flight += 1;
            }

            let completions = queue.wait_completions()?;
            // Account the whole batch before inspecting it, so the error
            // path drains exactly what is still in the kernel.
            in_flight -= completions.len();
            for completion in completions {
                let expected = block_len(size_bytes, block_size, completion.token);
                let got = completion.result?;
                if got != expected {
                    anyhow::bail!("Partial write (expected {}, got {})", expected, got);
                }
                completed += 1;
                if completed % 2 == 0 {
                    if let Some(cb) = progress {
                        cb(completed, total_blocks, &config.label);
                    }
                }
                if cancelled(cancel) {
                    anyhow::bail!("Operation interrupted by user");
                }
                if Instant::now() >= deadline {
                    anyhow::bail!(
                        "Disk Test timed out (write phase exceeded {} s)",
                        config.max_phase_seconds
                    );
                }
            }
        }
        Ok(())
    })();

    if let Err(e) = result {
        drain_queue(queue.as_mut(), in_flight);
        let _ = queue.shutdown();
        return Err(e);
    }

    // The periodic branch already reported the last completion when the
    // block count is even; fire the final (total, total) exactly once.
    if completed % 2 != 0 {
        if let Some(cb) = progress {
            cb(total_blocks, total_blocks, &config.label);
        }
    }
    queue.shutdown()?;
    Ok((started.elapsed(), backend))
}

/// Read the payload back; buffers are accounted by an explicit free-slot
/// pool because completions may reorder.
fn read_phase(
    config: &DiskBenchConfig,
    fd: &OwnedFd,
    size_bytes: u64,
    progress: Option<ProgressFn<'_>>,
    cancel: Option<&AtomicBool>,
) -> Result<Duration> {
    let block_size = config.read_block_size;
    let total_blocks = block_count(size_bytes, block_size);
    let depth = config.read_queue_depth;

    let mut pool = BufferPool::new(depth, block_size, DIRECT_ALIGNMENT);
    let mut slot_of: HashMap<u64, usize> = HashMap::with_capacity(depth);

    let mut queue = engine::open_queue(depth, config.debug);
    let deadline = Instant::now() + Duration::from_secs(config.max_phase_seconds);
    let started = Instant::now();

    let mut next_block: u64 = 0;
    let mut in_flight: usize = 0;
    let mut completed: u64 = 0;

    let result = (|| -> Result<()> {
        while completed < total_blocks {
            while next_block < total_blocks && in_flight < depth {
                let slot = match pool.get() {
                    Some(slot) => slot,
                    None => break,
                };
                let length = block_len(size_bytes, block_size, next_block);
                queue.submit(IoRequest {
                    op: IoOp::Read,
                    fd: fd.as_raw(),
                    offset: next_block * block_size as u64,
                    buffer: pool.buffer_mut(slot).as_mut_ptr(),
                    length,
                    token: next_block,
                })?;
                slot_of.insert(next_block, slot);
                next_block += 1;
                in_flight += 1;
            }

            let completions = queue.wait_completions()?;
            in_flight -= completions.len();
            for completion in completions {
                let slot = slot_of
                    .remove(&completion.token)
                    .expect("completion for unknown token");
                pool.return_slot(slot);

                let expected = block_len(size_bytes, block_size, completion.token);
                let got = completion.result?;
                if got != expected {
                    anyhow::bail!("Partial read (expected {}, got {})", expected, got);
                }
                completed += 1;
                if completed % 2 == 0 {
                    if let Some(cb) = progress {
                        cb(completed, total_blocks, &config.label);
                    }
                }
                if cancelled(cancel) {
                    anyhow::bail!("Operation interrupted by user");
                }
                if Instant::now() >= deadline {
                    anyhow::bail!(
                        "Disk Test timed out (read phase exceeded {} s)",
                        config.max_phase_seconds
                    );
                }
            }
        }
        Ok(())
    })();

    if let Err(e) = result {
        drain_queue(queue.as_mut(), in_flight);
        let _ = queue.shutdown();
        return Err(e);
    }

    if completed % 2 != 0 {
        if let Some(cb) = progress {
            cb(total_blocks, total_blocks, &config.label);
        }
    }
    queue.shutdown()?;
    Ok(started.elapsed())
}

/// After a failure, collect whatever is still in flight so buffers are no
/// longer referenced by the kernel or the workers before they drop.
fn drain_queue(queue: &mut dyn IoQueue, mut in_flight: usize) {
    while in_flight > 0 {
        match queue.wait_completions() {
            Ok(completions) if !completions.is_empty() => in_flight -= completions.len(),
            _ => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn small_config(dir: &Path) -> DiskBenchConfig {
        let mut config = DiskBenchConfig::new(4, "Disk", dir);
        config.write_block_size = 256 * 1024;
        config.read_block_size = 256 * 1024;
        config.write_queue_depth = 4;
        config.read_queue_depth = 4;
        config.max_phase_seconds = 60;
        config
    }

    fn bench_files(dir: &Path) -> usize {
        std::fs::read_dir(dir)
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .starts_with(BENCH_FILE_BASE)
            })
            .count()
    }

    #[test]
    fn test_happy_path() {
        let tmp = TempDir::new().unwrap();
        let config = small_config(tmp.path());
        let result = run_io_test(&config, None, None).unwrap();

        assert_eq!(result.label, "Disk");
        assert!(result.write_mbps > 0.0);
        assert!(result.read_mbps > 0.0);
        assert_eq!(bench_files(tmp.path()), 0);
    }

    #[test]
    fn test_back_to_back_runs_leave_no_residue() {
        let tmp = TempDir::new().unwrap();
        let config = small_config(tmp.path());
        let first = run_io_test(&config, None, None).unwrap();
        let second = run_io_test(&config, None, None).unwrap();
        assert!(first.write_mbps > 0.0);
        assert!(second.write_mbps > 0.0);
        assert_eq!(bench_files(tmp.path()), 0);
    }

    #[test]
    fn test_progress_reported() {
        let tmp = TempDir::new().unwrap();
        let config = small_config(tmp.path());
        let calls = std::sync::Mutex::new(Vec::new());
        let cb = |done: u64, total: u64, label: &str| {
            calls.lock().unwrap().push((done, total, label.to_string()));
        };
        run_io_test(&config, Some(&cb), None).unwrap();

        let calls = calls.into_inner().unwrap();
        assert!(!calls.is_empty());
        // Each phase reports (total, total) exactly once.
        let total_blocks = 4 * 1024 * 1024 / (256 * 1024) as u64;
        let finals = calls
            .iter()
            .filter(|(done, total, _)| done == total && *total == total_blocks)
            .count();
        assert_eq!(finals, 2);
        assert!(calls.iter().all(|(_, _, label)| label == "Disk"));
    }

    #[test]
    fn test_cancellation() {
        let tmp = TempDir::new().unwrap();
        let config = small_config(tmp.path());
        let cancel = AtomicBool::new(true);
        let err = run_io_test(&config, None, Some(&cancel)).unwrap_err();
        assert!(err.to_string().contains("interrupted"), "{}", err);
        assert_eq!(bench_files(tmp.path()), 0);
    }

    #[test]
    fn test_deadline_expiry() {
        let tmp = TempDir::new().unwrap();
        let mut config = small_config(tmp.path());
        config.max_phase_seconds = 0;
        let err = run_io_test(&config, None, None).unwrap_err();
        assert!(err.to_string().contains("timed out"), "{}", err);
        assert_eq!(bench_files(tmp.path()), 0);
    }

    #[test]
    fn test_rejects_unaligned_block_size() {
        let tmp = TempDir::new().unwrap();
        let mut config = small_config(tmp.path());
        config.write_block_size = 1000;
        assert!(run_io_test(&config, None, None).is_err());
    }

    #[test]
    fn test_sequential_when_depth_one() {
        let tmp = TempDir::new().unwrap();
        let mut config = small_config(tmp.path());
        config.write_queue_depth = 1;
        config.read_queue_depth = 1;
        let result = run_io_test(&config, None, None).unwrap();
        assert!(result.write_mbps > 0.0);
        assert_eq!(bench_files(tmp.path()), 0);
    }

    #[test]
    fn test_free_space_probe_rejects_impossible_size() {
        let tmp = TempDir::new().unwrap();
        // Petabyte payload: no test filesystem has this free.
        let mut config = small_config(tmp.path());
        config.size_mib = 1024 * 1024 * 1024;
        let err = run_io_test(&config, None, None).unwrap_err();
        assert!(err.to_string().contains("free space"), "{}", err);
    }
}
