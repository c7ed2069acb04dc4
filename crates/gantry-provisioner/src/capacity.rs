//! Capacity accounting.
//!
//! The tracker keeps two counters: concurrent agents per backend and per
//! (backend, template) pair. [`CapacityTracker::register`] checks both caps
//! and commits both increments atomically under one lock, or commits
//! neither. The lock is held only for the O(1) check-and-increment, never
//! across network calls.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{ProvisionError, ProvisionResult};

#[derive(Debug, Default)]
struct Counts {
    backends: HashMap<String, u32>,
    templates: HashMap<(String, String), u32>,
    primed: bool,
}

/// Thread-safe counters preventing over-provisioning across concurrent
/// requests.
///
/// The tracker holds no durable state. After a process restart,
/// [`prime`](Self::prime) recomputes both counters from the set of
/// already-active agents; the first call wins and later calls are no-ops.
#[derive(Debug, Default)]
pub struct CapacityTracker {
    counts: Mutex<Counts>,
}

impl CapacityTracker {
    /// Create a tracker with all counters at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// One-time reconciliation from the set of active agents.
    ///
    /// Returns true if this call performed the reconciliation.
    pub fn prime<I>(&self, active: I) -> bool
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut counts = self.counts.lock();
        if counts.primed {
            return false;
        }

        counts.backends.clear();
        counts.templates.clear();
        for (backend, template) in active {
            *counts.backends.entry(backend.clone()).or_insert(0) += 1;
            *counts.templates.entry((backend, template)).or_insert(0) += 1;
        }
        counts.primed = true;

        info!(
            backends = counts.backends.len(),
            "capacity counters reconciled from active agents"
        );
        true
    }

    /// Whether [`prime`](Self::prime) has run.
    #[must_use]
    pub fn is_primed(&self) -> bool {
        self.counts.lock().primed
    }

    /// Atomically reserve `n` units against a (backend, template) pair.
    ///
    /// Both `backend_cap` and `template_cap` must hold for the reservation
    /// to commit; otherwise neither counter changes and
    /// [`ProvisionError::CapacityRejected`] is returned. The returned
    /// [`CapacitySlot`] releases the reservation exactly once, on drop or
    /// explicit release.
    pub fn register(
        self: &Arc<Self>,
        backend: &str,
        template: &str,
        backend_cap: u32,
        template_cap: u32,
        n: u32,
    ) -> ProvisionResult<CapacitySlot> {
        let mut counts = self.counts.lock();

        let backend_count = counts.backends.get(backend).copied().unwrap_or(0);
        let template_count = counts
            .templates
            .get(&(backend.to_owned(), template.to_owned()))
            .copied()
            .unwrap_or(0);

        let backend_ok = backend_count.saturating_add(n) <= backend_cap;
        let template_ok = template_count.saturating_add(n) <= template_cap;
        if !backend_ok || !template_ok {
            debug!(
                backend = %backend,
                template = %template,
                backend_count,
                template_count,
                "capacity rejected"
            );
            return Err(ProvisionError::CapacityRejected {
                backend: backend.to_owned(),
                template: template.to_owned(),
            });
        }

        *counts.backends.entry(backend.to_owned()).or_insert(0) += n;
        *counts
            .templates
            .entry((backend.to_owned(), template.to_owned()))
            .or_insert(0) += n;

        Ok(CapacitySlot {
            tracker: Arc::clone(self),
            backend: backend.to_owned(),
            template: template.to_owned(),
            count: n,
            released: false,
        })
    }

    /// Release `n` units. Counters clamp at zero; an unclamped decrement
    /// going negative signals an accounting bug upstream and is logged
    /// without corrupting state.
    pub fn unregister(&self, backend: &str, template: &str, n: u32) {
        let mut counts = self.counts.lock();

        let backend_count = counts.backends.entry(backend.to_owned()).or_insert(0);
        if *backend_count < n {
            warn!(
                backend = %backend,
                count = *backend_count,
                release = n,
                "backend counter would go negative, clamping to zero"
            );
            *backend_count = 0;
        } else {
            *backend_count -= n;
        }

        let template_count = counts
            .templates
            .entry((backend.to_owned(), template.to_owned()))
            .or_insert(0);
        if *template_count < n {
            warn!(
                backend = %backend,
                template = %template,
                count = *template_count,
                release = n,
                "template counter would go negative, clamping to zero"
            );
            *template_count = 0;
        } else {
            *template_count -= n;
        }
    }

    /// Current count for a backend.
    #[must_use]
    pub fn backend_count(&self, backend: &str) -> u32 {
        self.counts
            .lock()
            .backends
            .get(backend)
            .copied()
            .unwrap_or(0)
    }

    /// Current count for a (backend, template) pair.
    #[must_use]
    pub fn template_count(&self, backend: &str, template: &str) -> u32 {
        self.counts
            .lock()
            .templates
            .get(&(backend.to_owned(), template.to_owned()))
            .copied()
            .unwrap_or(0)
    }
}

/// One reserved unit of concurrent-provisioning allowance.
///
/// Released exactly once: either explicitly via [`release`](Self::release)
/// or implicitly on drop. Successful provisioning moves the slot into the
/// active agent record so the reservation stays held until teardown.
#[derive(Debug)]
pub struct CapacitySlot {
    tracker: Arc<CapacityTracker>,
    backend: String,
    template: String,
    count: u32,
    released: bool,
}

impl CapacitySlot {
    /// Backend this slot counts against.
    #[must_use]
    pub fn backend(&self) -> &str {
        &self.backend
    }

    /// Template this slot counts against.
    #[must_use]
    pub fn template(&self) -> &str {
        &self.template
    }

    /// Release the reservation now.
    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if !self.released {
            self.released = true;
            self.tracker
                .unregister(&self.backend, &self.template, self.count);
        }
    }
}

impl Drop for CapacitySlot {
    fn drop(&mut self) {
        self.release_once();
    }
}
