//! Scoped CPU-affinity pinning for NUMA-local first-touch allocation.
//!
//! An RAII guard: pins the calling thread on construction, restores its
//! previous mask on `Drop`, so the pinning is reverted on every exit path.
//! Built on `nix::sched::{sched_setaffinity, CpuSet}`.

use log::{debug, warn};
use nix::sched::{sched_getaffinity, sched_setaffinity, CpuSet};
use nix::unistd::Pid;

/// Pins the calling thread to a single CPU for the guard's lifetime, then
/// restores whatever affinity the thread held before. NUMA locality is a
/// performance hint, not a correctness requirement: failures to read or set
/// the mask are logged and otherwise ignored, never propagated.
pub struct ScopedAffinity {
    previous: Option<CpuSet>,
}

impl ScopedAffinity {
    /// Pin the calling thread to `cpu`.
    pub fn pin(cpu: usize) -> Self {
        let this_thread = Pid::from_raw(0);
        let previous = match sched_getaffinity(this_thread) {
            Ok(mask) => Some(mask),
            Err(e) => {
                warn!("failed to read current cpu affinity, pinning will not be reverted: {}", e);
                None
            }
        };

        let mut target = CpuSet::new();
        match target.set(cpu) {
            Ok(()) => match sched_setaffinity(this_thread, &target) {
                Ok(()) => debug!("pinned thread to cpu {}", cpu),
                Err(e) => warn!("failed to pin thread to cpu {}: {}", cpu, e),
            },
            Err(e) => warn!("cpu id {} rejected by CpuSet: {}", cpu, e),
        }

        Self { previous }
    }
}

impl Drop for ScopedAffinity {
    fn drop(&mut self) {
        if let Some(previous) = self.previous {
            let this_thread = Pid::from_raw(0);
            if let Err(e) = sched_setaffinity(this_thread, &previous) {
                warn!("failed to restore cpu affinity: {}", e);
            }
        }
    }
}
