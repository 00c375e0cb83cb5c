//! # Stage: Model Routing Intelligence
//!
//! ## Responsibility
//! Pick the best backend model for each request under competing constraints
//! (cost, latency, capability, caller priority), arbitrate concurrent load
//! across backends, and fall back transparently when a backend fails its
//! health probe.
//!
//! ## Guarantees
//! - Deterministic: identical request + registry state always yields the
//!   same selected model, across repeated calls.
//! - Thread-safe: balancer counters are atomic; the router holds no locks
//!   across awaits on the request path.
//! - Bounded retries: a backend failure triggers exactly one
//!   reselect-and-retry; a second failure surfaces to the caller.
//! - Degrading, not rejecting: reservation under saturation still picks the
//!   least-loaded candidate; callers see added latency, never a rejection.
//!
//! ## NOT Responsible For
//! - Backend wire protocols (that belongs to `provider` adapters)
//! - Fan-out of shared generations (that belongs to `streaming`)
//! - Telemetry aggregation (that belongs to `monitor`)

pub mod balancer;
pub mod router;
pub mod selector;

// Re-exports for convenience
pub use balancer::{LoadBalancer, LoadSnapshot, Reservation};
pub use router::{MetricsSnapshot, ModelFilter, ModelRouter, ModelSwitch};
pub use selector::{ModelScorer, ModelSelector, SelectedModel, WeightedScorer};
