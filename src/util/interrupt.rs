//! Process-wide interrupt flag
//!
//! SIGINT and SIGTERM set a single atomic flag; the handlers do nothing
//! else. Every long-running loop in the extractor, the child pipe, the
//! speed-test driver and the disk benchmark polls `is_set()` at block or
//! completion boundaries so the process can unwind within one step of the
//! signal.

use crate::Result;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::sync::atomic::{AtomicBool, Ordering};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(_sig: libc::c_int) {
    // Async-signal context: a relaxed atomic store is the only work allowed.
    INTERRUPTED.store(true, Ordering::Relaxed);
}

/// Install the SIGINT/SIGTERM handlers. Call once at startup.
pub fn install_handlers() -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(handle_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        sigaction(Signal::SIGINT, &action)?;
        sigaction(Signal::SIGTERM, &action)?;
    }
    Ok(())
}

/// Non-blocking poll of the interrupt flag.
#[inline]
pub fn is_set() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

/// Fail with an interruption error when the flag is set.
#[inline]
pub fn check() -> Result<()> {
    if is_set() {
        anyhow::bail!("Operation interrupted by user");
    }
    Ok(())
}

/// Set the flag from regular (non-signal) code. Used by tests and by the
/// top-level error path to make nested loops unwind.
pub fn trigger() {
    INTERRUPTED.store(true, Ordering::Relaxed);
}

/// Clear the flag. Only meaningful in tests; the production process exits
/// once interrupted.
pub fn clear() {
    INTERRUPTED.store(false, Ordering::Relaxed);
}
