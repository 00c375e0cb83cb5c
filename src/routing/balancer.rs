//! Concurrent-load arbitration across backend models.
//!
//! Maintains one atomic in-flight counter per registered model. A
//! [`Reservation`] guard ties each increment to exactly one decrement, so
//! counters can never go negative or leak under any interleaving.
//!
//! Saturation policy: when every candidate is busy, `reserve` still picks
//! the least-loaded one — load degrades into added latency instead of a
//! rejection. This is deliberate and documented here because the behaviour
//! is load-bearing for callers: a saturated pool slows down, it does not
//! error.

use crate::RouterError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Per-model in-flight reservation counters.
///
/// Thread-safe: all counter access is atomic; `reserve`/`release` take no
/// locks and never block.
pub struct LoadBalancer {
    counters: Arc<HashMap<String, AtomicU64>>,
}

impl std::fmt::Debug for LoadBalancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadBalancer")
            .field("models", &self.counters.len())
            .finish()
    }
}

impl LoadBalancer {
    /// Create a balancer tracking the given model ids, all counters at zero.
    pub fn new(model_ids: impl IntoIterator<Item = String>) -> Self {
        let counters = model_ids
            .into_iter()
            .map(|id| (id, AtomicU64::new(0)))
            .collect();
        Self {
            counters: Arc::new(counters),
        }
    }

    /// Reserve a slot on the least-loaded of the given candidates.
    ///
    /// Candidates are a priority class: for single-model reservations pass
    /// a one-element slice. Ties go to the earlier candidate in the slice,
    /// keeping arbitration deterministic. Saturated candidates are still
    /// chosen (degrade, not reject).
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::NoEligibleModel`] if `candidates` is empty or
    /// names only untracked models.
    pub fn reserve(&self, candidates: &[&str]) -> Result<Reservation, RouterError> {
        let mut chosen: Option<(&str, u64)> = None;
        for id in candidates {
            let Some(counter) = self.counters.get(*id) else {
                continue;
            };
            let load = counter.load(Ordering::Relaxed);
            match chosen {
                Some((_, best)) if load >= best => {}
                _ => chosen = Some((id, load)),
            }
        }

        let Some((model_id, _)) = chosen else {
            return Err(RouterError::NoEligibleModel {
                user_id: String::new(),
                reason: "no reservable candidates".to_string(),
            });
        };

        // The load read above is advisory; the increment itself is what the
        // release pairs with, so concurrent reservers can both pick the same
        // "least loaded" model without corrupting anything.
        if let Some(counter) = self.counters.get(model_id) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
        tracing::trace!(model_id = model_id, "slot reserved");

        Ok(Reservation {
            counters: Arc::clone(&self.counters),
            model_id: model_id.to_string(),
            released: AtomicBool::new(false),
        })
    }

    /// Current in-flight count for a model, or `None` if untracked.
    pub fn load_of(&self, model_id: &str) -> Option<u64> {
        self.counters
            .get(model_id)
            .map(|c| c.load(Ordering::Relaxed))
    }

    /// Point-in-time snapshot of every counter.
    pub fn snapshot(&self) -> LoadSnapshot {
        LoadSnapshot {
            in_flight: self
                .counters
                .iter()
                .map(|(id, c)| (id.clone(), c.load(Ordering::Relaxed)))
                .collect(),
        }
    }
}

/// A reserved slot on one model.
///
/// The slot is released exactly once: either explicitly via
/// [`Reservation::release`] or implicitly on drop. Double release is
/// impossible; the guard's flag makes the second attempt a no-op.
pub struct Reservation {
    counters: Arc<HashMap<String, AtomicU64>>,
    model_id: String,
    released: AtomicBool,
}

impl std::fmt::Debug for Reservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservation")
            .field("model_id", &self.model_id)
            .field("released", &self.released.load(Ordering::Relaxed))
            .finish()
    }
}

impl Reservation {
    /// The model this reservation is held on.
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Release the slot now instead of at drop.
    pub fn release(self) {
        self.release_once();
    }

    fn release_once(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(counter) = self.counters.get(&self.model_id) {
            // Saturating: a stored zero here would mean a foreign decrement,
            // which the guard structure rules out, but never wrap regardless.
            let mut current = counter.load(Ordering::Relaxed);
            loop {
                let next = current.saturating_sub(1);
                match counter.compare_exchange_weak(
                    current,
                    next,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(observed) => current = observed,
                }
            }
        }
        tracing::trace!(model_id = %self.model_id, "slot released");
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.release_once();
    }
}

/// Point-in-time per-model in-flight counts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadSnapshot {
    /// Model id → reservations currently held.
    pub in_flight: HashMap<String, u64>,
}

// ── Tests ──────────────────────────────────────────────────────────────
