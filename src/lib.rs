//! # tokio-model-router
//!
//! An adaptive request-routing and streaming-dispatch layer between
//! completion endpoints and a heterogeneous pool of language-model backends.
//!
//! ## Architecture
//!
//! ```text
//! caller → ModelRouter.route/stream
//!              → ModelSelector picks a model
//!              → LoadBalancer reserves a slot
//!              → ProviderRegistry executes
//!              → (stream path) StreamCache fans out one generation
//!              → PerformanceMonitor records
//! ```
//!
//! On backend failure the router reselects, excluding the failed model, and
//! retries exactly once.

// ── Lint policy (aerospace-grade) ─────────────────────────────────────────
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(missing_docs)]

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub mod config;
pub mod metrics;
pub mod monitor;
pub mod provider;
pub mod routing;
pub mod streaming;

// Re-exports for convenience
pub use config::RouterConfig;
pub use monitor::{PerformanceMonitor, PerformanceRecord};
pub use provider::{EchoProvider, Model, ModelCapabilities, ProviderAdapter, ProviderRegistry};
pub use routing::{LoadBalancer, ModelRouter, ModelSelector, SelectedModel};
pub use streaming::ChunkStream;

/// Initialise the global tracing subscriber.
///
/// Reads the `LOG_FORMAT` environment variable to choose output format:
/// - `"json"` — structured JSON output for production log aggregators
/// - anything else (including unset) — human-readable pretty output
///
/// Filter level is controlled by `RUST_LOG` (e.g. `RUST_LOG=info`).
///
/// # Errors
///
/// Returns [`RouterError::ConfigurationError`] if the global subscriber has
/// already been set (e.g. by a previous call or a test harness).
pub fn init_tracing() -> Result<(), RouterError> {
    let format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

    let result = match format.as_str() {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_current_span(true)
            .with_span_list(true)
            .try_init(),
        _ => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init(),
    };

    result.map_err(|e| RouterError::ConfigurationError(format!("tracing init failed: {e}")))
}

/// Routing-layer errors.
///
/// Every failure surfaced by the router is mapped to a variant here, each
/// carrying the originating model id and/or request context so callers and
/// log aggregators can attribute the fault without extra lookups.
///
/// The enum is `Clone` because one upstream stream failure is fanned out to
/// every attached subscriber.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RouterError {
    /// An explicitly required model id is not present in the registry.
    #[error("model not found: {model_id}")]
    ModelNotFound {
        /// The id the caller asked for.
        model_id: String,
    },

    /// Every candidate was excluded by hard requirements or budget.
    #[error("no eligible model for user {user_id}: {reason}")]
    NoEligibleModel {
        /// The caller whose request could not be placed.
        user_id: String,
        /// Which hard constraint eliminated the last candidate.
        reason: String,
    },

    /// The selected backend failed its health / first-chunk probe.
    ///
    /// Triggers exactly one reselect-and-retry inside `route`/`stream`; a
    /// second failure is surfaced to the caller as this variant.
    #[error("backend unavailable for model {model_id}: {reason}")]
    BackendUnavailable {
        /// The model whose backend failed.
        model_id: String,
        /// Probe or transport failure detail.
        reason: String,
    },

    /// An already-started stream produced no chunk within the inactivity bound.
    #[error("stream stalled on model {model_id} after {stalled_for_ms}ms of inactivity")]
    StreamStalled {
        /// The model whose generation went quiet.
        model_id: String,
        /// The inactivity interval that was exceeded.
        stalled_for_ms: u64,
    },

    /// The registry is empty or the configuration is semantically invalid.
    #[error("configuration error: {0}")]
    ConfigurationError(String),

    /// The request failed boundary validation (empty message or user id).
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Caller-declared routing preference.
///
/// Shapes the selector's weight table: `Quality` weights model quality up,
/// `Speed` and `Balanced` weight speed up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Prefer the fastest capable model.
    Speed,
    /// Prefer the highest-quality capable model.
    Quality,
    /// Blend of speed and quality.
    #[default]
    Balanced,
}

impl Priority {
    /// Parse a priority from a name string (`"speed"`, `"quality"`, `"balanced"`).
    ///
    /// Returns `None` for unrecognised strings.
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "speed" => Some(Priority::Speed),
            "quality" => Some(Priority::Quality),
            "balanced" => Some(Priority::Balanced),
            _ => None,
        }
    }
}

/// Hard requirements attached to a [`ModelRequest`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Requirements {
    /// Exact model to use. Bypasses scoring entirely; fails
    /// [`RouterError::ModelNotFound`] if the id is unregistered.
    pub model_id: Option<String>,
    /// Require a backend that supports streamed generation.
    #[serde(default)]
    pub needs_streaming: bool,
    /// Minimum context window, on top of the window implied by the
    /// message + context size.
    pub min_context_length: Option<usize>,
}

/// A completion request as seen by the router.
///
/// Conversational memory has already been merged into `context` by the
/// external memory manager; admission control has already happened upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRequest {
    /// The caller this request belongs to.
    pub user_id: String,
    /// The raw user message.
    pub message: String,
    /// Ordered conversational context preceding the message.
    #[serde(default)]
    pub context: Vec<String>,
    /// Optional hard requirements.
    #[serde(default)]
    pub requirements: Option<Requirements>,
    /// Maximum acceptable cost per 1K tokens, in USD. Candidates above this
    /// are excluded outright, never merely penalised.
    #[serde(default)]
    pub budget: Option<f64>,
    /// Caller-declared routing preference.
    #[serde(default)]
    pub priority: Priority,
}

impl ModelRequest {
    /// Create a request with the given caller and message and all optional
    /// fields at their defaults.
    pub fn new(user_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            message: message.into(),
            context: Vec::new(),
            requirements: None,
            budget: None,
            priority: Priority::default(),
        }
    }

    /// Attach conversational context.
    pub fn with_context(mut self, context: Vec<String>) -> Self {
        self.context = context;
        self
    }

    /// Attach hard requirements.
    pub fn with_requirements(mut self, requirements: Requirements) -> Self {
        self.requirements = Some(requirements);
        self
    }

    /// Set a hard cost ceiling (USD per 1K tokens).
    pub fn with_budget(mut self, budget: f64) -> Self {
        self.budget = Some(budget);
        self
    }

    /// Set the routing priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Approximate token count of message + context, as whitespace-delimited
    /// words. Used for context-window filtering, never for billing.
    pub fn approx_tokens(&self) -> usize {
        self.message.split_whitespace().count()
            + self
                .context
                .iter()
                .map(|c| c.split_whitespace().count())
                .sum::<usize>()
    }
}

/// Token accounting for a completed generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens consumed by the prompt.
    pub prompt_tokens: u64,
    /// Tokens produced by the completion.
    pub completion_tokens: u64,
    /// Prompt + completion.
    pub total_tokens: u64,
}

/// A complete (non-streamed) model response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    /// The generated text.
    pub text: String,
    /// The model that actually served the request. Always names a model that
    /// was present in the registry at execution time.
    pub model_id: String,
    /// End-to-end latency of the serving attempt.
    pub latency: Duration,
    /// Estimated cost of the request in USD.
    pub cost: f64,
    /// Token accounting.
    pub usage: TokenUsage,
}

/// One fragment of a streamed generation.
///
/// A stream terminates with exactly one `done = true` chunk; `usage` is
/// present only on that terminal chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    /// Text fragment. May be empty on the terminal chunk.
    pub text: String,
    /// Whether this is the terminal chunk of a clean completion.
    pub done: bool,
    /// Token accounting, present only when `done` is true.
    #[serde(default)]
    pub usage: Option<TokenUsage>,
}

impl StreamChunk {
    /// A non-terminal text fragment.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            done: false,
            usage: None,
        }
    }

    /// The terminal chunk of a clean completion.
    pub fn done(usage: TokenUsage) -> Self {
        Self {
            text: String::new(),
            done: true,
            usage: Some(usage),
        }
    }
}

/// Caller-side conversational state.
///
/// Supplied by an external session store; the router only ever reads it and
/// produces a replacement on
/// [`ModelRouter::switch_model`](routing::ModelRouter::switch_model).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Unique session id.
    pub id: String,
    /// The caller who owns the session.
    pub user_id: String,
    /// The model currently serving this session.
    pub model_id: String,
    /// Accumulated conversational context, transferred verbatim on switch.
    pub context: Vec<String>,
}

/// Compute the normalized fingerprint of a request.
///
/// Two requests with the same fingerprint issued concurrently share one
/// underlying generation. Normalization: the message is case-folded and its
/// whitespace collapsed before hashing, so `"Hello "` and `"hello"`
/// coalesce. Context lines and the streaming requirement participate in the
/// hash; the user id deliberately does not, so identical questions from
/// different callers share work.
pub fn request_fingerprint(request: &ModelRequest) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    normalize(&request.message).hash(&mut hasher);
    for line in &request.context {
        normalize(line).hash(&mut hasher);
    }
    request
        .requirements
        .as_ref()
        .is_some_and(|r| r.needs_streaming)
        .hash(&mut hasher);

    format!("gen:{:016x}", hasher.finish())
}

/// Collapse whitespace and case-fold a message for fingerprinting.
fn normalize(s: &str) -> String {
    s.split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}
