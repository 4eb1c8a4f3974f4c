//! Host-staging audit for device programs.
//!
//! Backends whose programs cannot run in device memory stage inputs and
//! outputs through the host. Every such program is counted here. With the
//! `audit-no-host-copies` feature, a strict scope turns staging into an
//! error so tests can prove a path stays device-resident.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::error::{OptimizerError, Result};

static STAGED_PROGRAMS: AtomicU64 = AtomicU64::new(0);
static WARNED_ONCE: AtomicBool = AtomicBool::new(false);
#[cfg(feature = "audit-no-host-copies")]
static STRICT_MODE: AtomicBool = AtomicBool::new(false);

/// Restores the previous strict mode value when dropped.
pub struct StrictModeGuard {
    #[cfg(feature = "audit-no-host-copies")]
    previous: bool,
}

impl Drop for StrictModeGuard {
    fn drop(&mut self) {
        #[cfg(feature = "audit-no-host-copies")]
        STRICT_MODE.store(self.previous, Ordering::Relaxed);
    }
}

/// Enable or disable strict mode for the current scope. Without the
/// `audit-no-host-copies` feature this is a no-op.
#[must_use]
pub fn push_strict_mode(enabled: bool) -> StrictModeGuard {
    #[cfg(feature = "audit-no-host-copies")]
    {
        let previous = STRICT_MODE.swap(enabled, Ordering::Relaxed);
        StrictModeGuard { previous }
    }

    #[cfg(not(feature = "audit-no-host-copies"))]
    {
        let _ = enabled;
        StrictModeGuard {}
    }
}

pub fn is_strict_mode() -> bool {
    #[cfg(feature = "audit-no-host-copies")]
    {
        STRICT_MODE.load(Ordering::Relaxed)
    }

    #[cfg(not(feature = "audit-no-host-copies"))]
    {
        false
    }
}

/// Number of host-staged programs recorded by this process.
pub fn staged_program_count() -> u64 {
    STAGED_PROGRAMS.load(Ordering::Relaxed)
}

/// Record one host-staged program. Fails in strict mode; otherwise warns
/// once per process.
pub fn record_staging(stage: &str, detail: String) -> Result<()> {
    if is_strict_mode() {
        return Err(OptimizerError::Device(format!(
            "host staging forbidden at `{stage}`: {detail}"
        )));
    }
    STAGED_PROGRAMS.fetch_add(1, Ordering::Relaxed);
    if !WARNED_ONCE.swap(true, Ordering::Relaxed) {
        tracing::warn!(stage, detail = %detail, "Device program staged through host memory");
    }
    Ok(())
}
