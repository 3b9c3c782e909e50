//! Child process pipe
//!
//! `ShellPipe` forks and execs a command with stdout and stderr duplicated
//! onto a single pipe, then captures the combined output with a timeout,
//! cancellation, and a hard output cap. Whatever happens, the child is
//! reaped before the pipe is dropped: the destructor escalates
//! SIGTERM → SIGKILL and collects the status, so no run can leave a zombie
//! or a stray descendant behind.

use crate::util::fd::OwnedFd;
use crate::util::interrupt;
use crate::Result;
use anyhow::Context;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{self, fork, ForkResult, Pid};
use std::ffi::CString;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Hard cap on captured combined output
const MAX_OUTPUT: usize = 10 * 1024 * 1024;
/// Appended when the cap is hit
const TRUNCATION_SENTINEL: &str = "\n... [output truncated]";
/// Upper bound on a single poll sleep, so cancellation is observed promptly
const POLL_SLICE: Duration = Duration::from_millis(100);
/// Grace between SIGTERM and SIGKILL on timeout/cancellation
const KILL_GRACE: Duration = Duration::from_millis(100);
/// Grace the destructor allows before SIGKILL
const DROP_GRACE: Duration = Duration::from_millis(30);

/// A forked child with its combined stdout/stderr captured through a pipe.
///
/// The child and the pipe's read end are exclusively owned: no other
/// component may signal, wait on, or read from them.
pub struct ShellPipe {
    /// Kernel pid; `None` once reaped
    pid: Option<Pid>,
    /// Read end of the combined-output pipe
    read_fd: OwnedFd,
}

impl ShellPipe {
    /// Fork and exec `argv` (`argv[0]` is the executable, resolved via
    /// PATH). In the child the pipe's write end becomes stdout and stderr;
    /// exec failure exits with status 127.
    pub fn spawn(argv: &[String]) -> Result<ShellPipe> {
        if argv.is_empty() {
            anyhow::bail!("ShellPipe requires a non-empty argument vector");
        }

        // Allocate everything the child needs before forking; only
        // async-signal-safe calls are allowed on the child side.
        let c_args: Vec<CString> = argv
            .iter()
            .map(|a| CString::new(a.as_str()).context("argument contains NUL byte"))
            .collect::<Result<_>>()?;
        let arg_refs: Vec<&std::ffi::CStr> = c_args.iter().map(|c| c.as_c_str()).collect();

        let (pipe_read, pipe_write) = unistd::pipe().context("failed to create pipe")?;
        let mut read_fd = OwnedFd::wrap(pipe_read);
        let mut write_fd = OwnedFd::wrap(pipe_write);

        match unsafe { fork() }.context("fork failed")? {
            ForkResult::Child => {
                let raw_write = write_fd.release();
                let raw_read = read_fd.release();
                let _ = unistd::dup2(raw_write, libc::STDOUT_FILENO);
                let _ = unistd::dup2(raw_write, libc::STDERR_FILENO);
                let _ = unistd::close(raw_write);
                let _ = unistd::close(raw_read);

                let _ = unistd::execvp(arg_refs[0], &arg_refs);
                unsafe { libc::_exit(127) };
            }
            ForkResult::Parent { child } => {
                // Parent keeps only the read end.
                write_fd.reset(-1);
                Ok(ShellPipe {
                    pid: Some(child),
                    read_fd,
                })
            }
        }
    }

    /// The child's pid while it has not been reaped.
    pub fn pid(&self) -> Option<i32> {
        self.pid.map(Pid::as_raw)
    }

    /// Read the combined output until EOF, timeout, cancellation, or the
    /// 10 MiB cap (in which case the output is truncated with a sentinel
    /// suffix and collection stops cleanly).
    ///
    /// After the read loop the child is always reaped. A child killed by a
    /// signal, a timeout, or a non-zero exit with no output (or with
    /// `raise_on_nonzero_exit`) all surface as errors.
    pub fn read_all(
        &mut self,
        timeout: Duration,
        cancel: Option<&AtomicBool>,
        raise_on_nonzero_exit: bool,
    ) -> Result<String> {
        let deadline = Instant::now() + timeout;
        let mut output: Vec<u8> = Vec::new();
        let mut cancelled = false;

        loop {
            if interrupt::is_set() || cancel.map_or(false, |c| c.load(Ordering::Relaxed)) {
                cancelled = true;
                break;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.read_fd.reset(-1);
                self.terminate_and_reap()?;
                anyhow::bail!("Child process timed out after {:.0?}", timeout);
            }

            let slice = remaining.min(POLL_SLICE);
            let mut fds = [PollFd::new(self.read_fd.as_raw(), PollFlags::POLLIN)];
            match poll(&mut fds, slice.as_millis().max(1) as libc::c_int) {
                Ok(0) => continue,
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e).context("poll on child pipe failed"),
            }

            let mut chunk = [0u8; 8192];
            match unistd::read(self.read_fd.as_raw(), &mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    output.extend_from_slice(&chunk[..n]);
                    if output.len() >= MAX_OUTPUT {
                        output.truncate(MAX_OUTPUT);
                        output.extend_from_slice(TRUNCATION_SENTINEL.as_bytes());
                        break;
                    }
                }
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e).context("read from child pipe failed"),
            }
        }

        // Close our end first: a writer blocked on a full pipe gets EPIPE
        // instead of hanging across the reap.
        self.read_fd.reset(-1);

        if cancelled {
            self.terminate_and_reap()?;
            anyhow::bail!("Operation interrupted by user");
        }

        let status = self.reap_blocking()?;
        let text = String::from_utf8_lossy(&output).into_owned();

        match status {
            WaitStatus::Signaled(_, sig, _) => {
                anyhow::bail!("Child terminated by signal {} ({})", sig as i32, signal_name(sig));
            }
            WaitStatus::Exited(_, code) if code != 0 => {
                if text.is_empty() {
                    anyhow::bail!("Child exited with code {}", code);
                }
                if raise_on_nonzero_exit {
                    anyhow::bail!("Child exited with code {}: {}", code, text.trim_end());
                }
                Ok(text)
            }
            _ => Ok(text),
        }
    }

    /// SIGTERM, a short grace, SIGKILL if still alive, then collect the
    /// status. Used by the timeout and cancellation paths.
    fn terminate_and_reap(&mut self) -> Result<()> {
        let pid = match self.pid {
            Some(pid) => pid,
            None => return Ok(()),
        };
        let _ = kill(pid, Signal::SIGTERM);
        if !self.wait_exit_within(pid, KILL_GRACE) {
            let _ = kill(pid, Signal::SIGKILL);
        }
        match waitpid(pid, None) {
            Ok(_) | Err(Errno::ECHILD) => {}
            Err(e) => return Err(e).context("waitpid after terminate failed"),
        }
        self.pid = None;
        Ok(())
    }

    /// Blocking reap on the normal EOF path.
    fn reap_blocking(&mut self) -> Result<WaitStatus> {
        let pid = self.pid.take().expect("child already reaped");
        waitpid(pid, None).context("waitpid failed")
    }

    /// Poll WNOHANG until the child exits or `grace` elapses. Returns true
    /// if the child is gone (reapable or already reaped).
    fn wait_exit_within(&self, pid: Pid, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        loop {
            match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => {}
                // Status consumed here; the follow-up blocking waitpid sees
                // ECHILD, which callers accept.
                Ok(_) => return true,
                Err(_) => return true,
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

impl Drop for ShellPipe {
    fn drop(&mut self) {
        let pid = match self.pid.take() {
            Some(pid) => pid,
            None => return,
        };
        let _ = kill(pid, Signal::SIGTERM);
        let deadline = Instant::now() + DROP_GRACE;
        loop {
            match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => {}
                Ok(_) | Err(_) => return,
            }
            if Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        let _ = kill(pid, Signal::SIGKILL);
        let _ = waitpid(pid, None);
    }
}

/// Human name for the signals a child realistically dies from.
fn signal_name(sig: Signal) -> &'static str {
    match sig {
        Signal::SIGINT => "SIGINT",
        Signal::SIGTERM => "SIGTERM",
        Signal::SIGKILL => "SIGKILL",
        Signal::SIGPIPE => "SIGPIPE",
        Signal::SIGHUP => "SIGHUP",
        Signal::SIGQUIT => "SIGQUIT",
        Signal::SIGABRT => "SIGABRT",
        Signal::SIGSEGV => "SIGSEGV",
        _ => "unknown signal",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_captures_stdout() {
        let mut pipe = ShellPipe::spawn(&argv(&["/bin/echo", "hello"])).unwrap();
        let out = pipe.read_all(Duration::from_secs(5), None, true).unwrap();
        assert_eq!(out, "hello\n");
    }

    #[test]
    fn test_captures_combined_output() {
        let mut pipe =
            ShellPipe::spawn(&argv(&["/bin/sh", "-c", "echo out; echo err 1>&2"])).unwrap();
        let out = pipe.read_all(Duration::from_secs(5), None, true).unwrap();
        assert!(out.contains("out"));
        assert!(out.contains("err"));
    }

    #[test]
    fn test_empty_argv_rejected() {
        assert!(ShellPipe::spawn(&[]).is_err());
    }

    #[test]
    fn test_exec_failure_exits_127() {
        let mut pipe = ShellPipe::spawn(&argv(&["/nonexistent-syspulse-test-binary"])).unwrap();
        let err = pipe
            .read_all(Duration::from_secs(5), None, false)
            .unwrap_err();
        assert!(err.to_string().contains("exited with code 127"), "{}", err);
    }

    #[test]
    fn test_nonzero_exit_with_output_tolerated() {
        let mut pipe = ShellPipe::spawn(&argv(&["/bin/sh", "-c", "echo partial; exit 3"])).unwrap();
        let out = pipe.read_all(Duration::from_secs(5), None, false).unwrap();
        assert_eq!(out, "partial\n");
    }

    #[test]
    fn test_nonzero_exit_raised_on_request() {
        let mut pipe = ShellPipe::spawn(&argv(&["/bin/sh", "-c", "echo partial; exit 3"])).unwrap();
        let err = pipe
            .read_all(Duration::from_secs(5), None, true)
            .unwrap_err();
        assert!(err.to_string().contains("exited with code 3"), "{}", err);
    }

    #[test]
    fn test_nonzero_exit_empty_output_always_fails() {
        let mut pipe = ShellPipe::spawn(&argv(&["/bin/sh", "-c", "exit 9"])).unwrap();
        let err = pipe
            .read_all(Duration::from_secs(5), None, false)
            .unwrap_err();
        assert!(err.to_string().contains("exited with code 9"), "{}", err);
    }

    #[test]
    fn test_signaled_child_reported_and_reaped() {
        let mut pipe = ShellPipe::spawn(&argv(&["/bin/sh", "-c", "kill -SEGV $$"])).unwrap();
        let raw_pid = pipe.pid().unwrap();
        let err = pipe
            .read_all(Duration::from_secs(5), None, true)
            .unwrap_err();
        assert!(err.to_string().contains("SIGSEGV"), "{}", err);
        // Already reaped: a second waitpid finds nothing.
        let res = waitpid(Pid::from_raw(raw_pid), Some(WaitPidFlag::WNOHANG));
        assert_eq!(res, Err(Errno::ECHILD));
    }

    #[test]
    fn test_timeout_kills_child() {
        let mut pipe = ShellPipe::spawn(&argv(&["/bin/sleep", "30"])).unwrap();
        let raw_pid = pipe.pid().unwrap();
        let start = Instant::now();
        let err = pipe
            .read_all(Duration::from_millis(200), None, true)
            .unwrap_err();
        assert!(err.to_string().contains("timed out"), "{}", err);
        assert!(start.elapsed() < Duration::from_secs(5));
        let res = waitpid(Pid::from_raw(raw_pid), Some(WaitPidFlag::WNOHANG));
        assert_eq!(res, Err(Errno::ECHILD));
    }

    #[test]
    fn test_cancellation_terminates_child() {
        let cancel = AtomicBool::new(true);
        let mut pipe = ShellPipe::spawn(&argv(&["/bin/sleep", "30"])).unwrap();
        let raw_pid = pipe.pid().unwrap();
        let err = pipe
            .read_all(Duration::from_secs(30), Some(&cancel), true)
            .unwrap_err();
        assert!(err.to_string().contains("interrupted"), "{}", err);
        let res = waitpid(Pid::from_raw(raw_pid), Some(WaitPidFlag::WNOHANG));
        assert_eq!(res, Err(Errno::ECHILD));
    }

    #[test]
    fn test_output_cap_truncates_with_sentinel() {
        // Writes the cap plus a little less than one pipe buffer, so the
        // child can finish and exit 0 while we stop reading at the cap.
        let mut pipe = ShellPipe::spawn(&argv(&[
            "/bin/sh",
            "-c",
            "head -c 10520000 /dev/zero",
        ]))
        .unwrap();
        let out = pipe.read_all(Duration::from_secs(30), None, false).unwrap();
        assert!(out.ends_with(TRUNCATION_SENTINEL));
        assert!(out.len() <= MAX_OUTPUT + TRUNCATION_SENTINEL.len());
    }

    #[test]
    fn test_drop_reaps_running_child() {
        let pipe = ShellPipe::spawn(&argv(&["/bin/sleep", "30"])).unwrap();
        let raw_pid = pipe.pid().unwrap();
        drop(pipe);
        let res = waitpid(Pid::from_raw(raw_pid), Some(WaitPidFlag::WNOHANG));
        assert_eq!(res, Err(Errno::ECHILD));
    }
}
