//! Owned file descriptor guard
//!
//! Every kernel descriptor acquired by syspulse is held by exactly one
//! `OwnedFd`. The guard closes the descriptor on drop unless ownership was
//! relinquished with `release`, so no exit path can leak an fd.

use crate::Result;
use anyhow::Context;
use std::os::unix::io::RawFd;

/// Move-only wrapper around a raw kernel file descriptor.
///
/// The wrapped descriptor is closed exactly once: either explicitly via
/// `reset`, or implicitly when the guard drops. `release` hands the raw
/// value back to the caller and disarms the guard.
///
/// # Example
///
/// ```
/// use syspulse::util::fd::OwnedFd;
///
/// let raw = unsafe { libc::open(b"/dev/null\0".as_ptr().cast(), libc::O_RDONLY) };
/// assert!(raw >= 0);
///
/// let guard = OwnedFd::wrap(raw);
/// let dup = guard.duplicate()?;
/// assert_ne!(dup.as_raw(), guard.as_raw());
/// // Both descriptors are closed exactly once when the guards drop.
/// # Ok::<(), anyhow::Error>(())
/// ```
#[derive(Debug)]
pub struct OwnedFd {
    fd: Option<RawFd>,
}

impl OwnedFd {
    /// Take ownership of `fd`. The descriptor must be open and non-negative.
    pub fn wrap(fd: RawFd) -> Self {
        debug_assert!(fd >= 0, "OwnedFd::wrap called with negative fd");
        Self { fd: Some(fd) }
    }

    /// Construct an empty guard holding no descriptor.
    pub fn empty() -> Self {
        Self { fd: None }
    }

    /// Borrow the raw descriptor.
    ///
    /// # Panics
    ///
    /// Panics if ownership was already relinquished via `release`; using a
    /// descriptor after giving it away is a programming error.
    pub fn as_raw(&self) -> RawFd {
        self.fd.expect("OwnedFd used after release")
    }

    /// True while the guard still owns a descriptor.
    pub fn is_open(&self) -> bool {
        self.fd.is_some()
    }

    /// Relinquish ownership and return the raw descriptor. The caller is now
    /// responsible for closing it.
    pub fn release(&mut self) -> RawFd {
        self.fd.take().expect("OwnedFd released twice")
    }

    /// Close the current descriptor (if any) and adopt `fd`. Passing a
    /// negative value leaves the guard empty.
    pub fn reset(&mut self, fd: RawFd) {
        if let Some(old) = self.fd.take() {
            // Close errors are unreportable here; the descriptor is gone
            // either way.
            unsafe { libc::close(old) };
        }
        self.fd = if fd >= 0 { Some(fd) } else { None };
    }

    /// Duplicate the descriptor via `dup`, yielding an independent guard.
    pub fn duplicate(&self) -> Result<OwnedFd> {
        let fd = self.as_raw();
        let dup = unsafe { libc::dup(fd) };
        if dup < 0 {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("dup failed: fd={}", fd));
        }
        Ok(OwnedFd::wrap(dup))
    }
}

impl Drop for OwnedFd {
    fn drop(&mut self) {
        if let Some(fd) = self.fd.take() {
            unsafe { libc::close(fd) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_devnull() -> RawFd {
        let fd = unsafe { libc::open(b"/dev/null\0".as_ptr() as *const libc::c_char, libc::O_RDONLY) };
        assert!(fd >= 0);
        fd
    }

    fn fd_is_open(fd: RawFd) -> bool {
        unsafe { libc::fcntl(fd, libc::F_GETFD) != -1 }
    }

    #[test]
    fn test_drop_closes() {
        let raw = open_devnull();
        {
            let _guard = OwnedFd::wrap(raw);
            assert!(fd_is_open(raw));
        }
        assert!(!fd_is_open(raw));
    }

    #[test]
    fn test_release_disarms() {
        let raw = open_devnull();
        let mut guard = OwnedFd::wrap(raw);
        let returned = guard.release();
        assert_eq!(returned, raw);
        drop(guard);
        // The guard must not have closed it.
        assert!(fd_is_open(raw));
        unsafe { libc::close(raw) };
    }

    #[test]
    fn test_reset_closes_old_and_adopts_new() {
        let a = open_devnull();
        let b = open_devnull();
        let mut guard = OwnedFd::wrap(a);
        guard.reset(b);
        assert!(!fd_is_open(a));
        assert!(fd_is_open(b));
        assert_eq!(guard.as_raw(), b);
    }

    #[test]
    fn test_reset_negative_empties() {
        let raw = open_devnull();
        let mut guard = OwnedFd::wrap(raw);
        guard.reset(-1);
        assert!(!fd_is_open(raw));
        assert!(!guard.is_open());
    }

    #[test]
    fn test_duplicate_is_independent() {
        let raw = open_devnull();
        let guard = OwnedFd::wrap(raw);
        let dup = guard.duplicate().unwrap();
        let dup_raw = dup.as_raw();
        assert_ne!(dup_raw, raw);
        drop(dup);
        assert!(!fd_is_open(dup_raw));
        // Original survives the duplicate's close.
        assert!(fd_is_open(raw));
    }

    #[test]
    #[should_panic(expected = "used after release")]
    fn test_as_raw_after_release_panics() {
        let mut guard = OwnedFd::wrap(open_devnull());
        let raw = guard.release();
        unsafe { libc::close(raw) };
        let _ = guard.as_raw();
    }
}
