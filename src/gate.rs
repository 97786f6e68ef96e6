// SPDX-License-Identifier: MIT

//! Process wide availability flag for the HTTP layer.
//!
//! The gate is closed while at least one new repository is being parsed or
//! merged. It is advisory: nothing in this crate blocks on it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::debug;

#[derive(Debug, Default, Clone)]
pub struct AvailabilityGate {
    active: Arc<AtomicUsize>,
}

impl AvailabilityGate {
    pub fn new() -> Self {
        AvailabilityGate::default()
    }

    /// True while clients should be told to come back later.
    pub fn is_unavailable(&self) -> bool {
        self.active.load(Ordering::SeqCst) > 0
    }

    /// Closes the gate until the returned guard is dropped.
    pub fn close(&self) -> GateGuard {
        let n = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(active = n, "availability gate closed");
        GateGuard {
            active: Arc::clone(&self.active),
        }
    }

    /// Opens the gate unconditionally. Used once at startup.
    pub fn reset(&self) {
        self.active.store(0, Ordering::SeqCst);
    }
}

/// Keeps the gate closed while alive.
#[derive(Debug)]
#[must_use]
pub struct GateGuard {
    active: Arc<AtomicUsize>,
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        let _ = self
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        debug!(
            active = self.active.load(Ordering::SeqCst),
            "availability gate released"
        );
    }
}
