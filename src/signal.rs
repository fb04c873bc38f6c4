//! Interrupt plumbing for the scheduler's cancellation path.
//!
//! A run has two interrupt phases.  The first SIGINT flips the process into
//! the draining phase: the scheduler stops dispatching at its next
//! suspension point, lets outstanding work finish, and reports Cancelled.
//! The handler is installed with SA_RESETHAND, so a second SIGINT takes the
//! default action and kills the process outright.

use std::sync::atomic::{AtomicU8, Ordering};

const RUNNING: u8 = 0;
const DRAINING: u8 = 1;

static PHASE: AtomicU8 = AtomicU8::new(RUNNING);

/// What the scheduler should do at its next suspension point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    None,
    /// Stop dispatching, finish outstanding work, report Cancelled.
    Drain,
}

#[cfg(unix)]
extern "C" fn on_sigint(_sig: libc::c_int) {
    PHASE.store(DRAINING, Ordering::Relaxed);
}

#[cfg(unix)]
pub fn install() {
    // Safety: registering a signal handler is libc unsafe code.
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = on_sigint as libc::sighandler_t;
        sa.sa_flags = libc::SA_RESETHAND;
        libc::sigaction(libc::SIGINT, &sa, std::ptr::null_mut());
    }
}

#[cfg(not(unix))]
pub fn install() {}

pub fn pending() -> Interrupt {
    match PHASE.load(Ordering::Relaxed) {
        RUNNING => Interrupt::None,
        _ => Interrupt::Drain,
    }
}

/// Request a drain from inside the process, as the signal handler would.
/// Used by embedders and tests to cancel a run programmatically.
pub fn request_drain() {
    PHASE.store(DRAINING, Ordering::Relaxed);
}

/// Rearm after a drained run, for embedders running several builds in one
/// process.  The CLI never needs this; it exits after draining.
pub fn reset() {
    PHASE.store(RUNNING, Ordering::Relaxed);
}
