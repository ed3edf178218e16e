//! Depth-bounded cooperative lock.
//!
//! The coordinator counts outstanding holds instead of tracking an owner.
//! Each call site states how many holds it tolerates (`allowable`): a
//! top-level mutation asks for 0, code already running under that hold asks
//! for 1, and so on down the call chain. Asking for too little waits on
//! itself; asking for too much lets a concurrent caller in.

use crate::error::{BlockchainError, Result};
use log::trace;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

pub struct LockCoordinator {
    name: &'static str,
    depth: Mutex<usize>,
    released: Condvar,
    terminated: Arc<AtomicBool>,
}

/// A taken slot; the depth is decremented when it drops.
#[must_use = "the lock is released as soon as the hold is dropped"]
pub struct LockHold<'a> {
    coordinator: &'a LockCoordinator,
}

impl LockCoordinator {
    /// `terminated` is shared with the rest of the node so one signal stops
    /// every coordinator.
    pub fn new(name: &'static str, terminated: Arc<AtomicBool>) -> LockCoordinator {
        LockCoordinator {
            name,
            depth: Mutex::new(0),
            released: Condvar::new(),
            terminated,
        }
    }

    pub fn standalone(name: &'static str) -> LockCoordinator {
        Self::new(name, Arc::new(AtomicBool::new(false)))
    }

    // The counter is a plain integer, a poisoned guard still holds a usable value.
    fn depth_guard(&self) -> MutexGuard<'_, usize> {
        self.depth.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Waits until at most `allowable` holds are outstanding, then takes one.
    pub fn acquire(&self, allowable: usize) -> Result<LockHold<'_>> {
        let mut depth = self.depth_guard();
        loop {
            if self.terminated.load(Ordering::SeqCst) {
                return Err(BlockchainError::Terminated);
            }
            if *depth <= allowable {
                *depth += 1;
                trace!(target: "lock", "{} acquired, depth {}", self.name, *depth);
                return Ok(LockHold { coordinator: self });
            }
            depth = self
                .released
                .wait_timeout(depth, POLL_INTERVAL)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }

    pub fn depth(&self) -> usize {
        *self.depth_guard()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Stops all pending and future acquisitions. Holds already taken stay valid.
    pub fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        self.released.notify_all();
    }

    /// Blocks until no hold is outstanding or `timeout` passes. Returns
    /// whether the coordinator went idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut depth = self.depth_guard();
        while *depth > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let wait = (deadline - now).min(POLL_INTERVAL);
            depth = self
                .released
                .wait_timeout(depth, wait)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
        true
    }

    fn release(&self) {
        let mut depth = self.depth_guard();
        *depth = depth.saturating_sub(1);
        trace!(target: "lock", "{} released, depth {}", self.name, *depth);
        drop(depth);
        self.released.notify_all();
    }
}

impl Drop for LockHold<'_> {
    fn drop(&mut self) {
        self.coordinator.release();
    }
}
