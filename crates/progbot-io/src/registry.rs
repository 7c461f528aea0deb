//! Application-scoped registry of live worker processes.
//!
//! Supervisors register the pid of every worker they spawn and unregister it
//! once the escalation ladder has finished. The registry is consulted only by
//! the emergency sweep when the application exits, so a worker leaked by a
//! crashed code path does not outlive the station.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;

/// Cheap to clone; clones share the same set of pids.
#[derive(Clone, Default)]
pub struct ProcessRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    pids: DashMap<u32, String>,
    guard_armed: AtomicBool,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, pid: u32, label: impl Into<String>) {
        let label = label.into();
        tracing::debug!(pid, %label, "Registered worker process");
        self.inner.pids.insert(pid, label);
    }

    pub fn unregister(&self, pid: u32) -> bool {
        let removed = self.inner.pids.remove(&pid).is_some();
        if removed {
            tracing::debug!(pid, "Unregistered worker process");
        }
        removed
    }

    pub fn contains(&self, pid: u32) -> bool {
        self.inner.pids.contains_key(&pid)
    }

    pub fn live_pids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self.inner.pids.iter().map(|entry| *entry.key()).collect();
        pids.sort_unstable();
        pids
    }

    pub fn len(&self) -> usize {
        self.inner.pids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.pids.is_empty()
    }

    /// Force-kill every registered process and clear the registry.
    ///
    /// Returns the number of processes that were signalled.
    pub fn sweep(&self) -> usize {
        let pids = self.live_pids();
        let mut killed = 0;
        for pid in pids {
            if let Some((_, label)) = self.inner.pids.remove(&pid) {
                if kill_process(pid) {
                    tracing::warn!(pid, %label, "Killed leftover worker at exit");
                    killed += 1;
                } else {
                    tracing::debug!(pid, %label, "Leftover worker already gone");
                }
            }
        }
        killed
    }

    /// Arm the exit hook: the returned guard sweeps the registry when dropped.
    ///
    /// Only one guard is handed out per registry; later calls return `None`.
    pub fn exit_guard(&self) -> Option<ExitGuard> {
        self.inner
            .guard_armed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| ExitGuard {
                registry: self.clone(),
            })
    }
}

impl std::fmt::Debug for ProcessRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessRegistry")
            .field("pids", &self.live_pids())
            .finish()
    }
}

/// Sweeps the registry on drop. Hold it for the lifetime of `main`.
#[must_use = "the registry is swept when the guard is dropped"]
pub struct ExitGuard {
    registry: ProcessRegistry,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        let killed = self.registry.sweep();
        if killed > 0 {
            tracing::warn!(killed, "Swept leftover worker processes");
        }
        self.registry
            .inner
            .guard_armed
            .store(false, Ordering::Release);
    }
}

#[cfg(unix)]
fn kill_process(pid: u32) -> bool {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    kill(Pid::from_raw(raw), Signal::SIGKILL).is_ok()
}

#[cfg(not(unix))]
fn kill_process(pid: u32) -> bool {
    tracing::warn!(pid, "Cannot force-kill worker on this platform");
    false
}
