//! Provider adapter abstraction and registry.
//!
//! Provides the [`ProviderAdapter`] trait — the only backend-facing contract
//! in the crate — plus the [`ProviderRegistry`] built once at startup and the
//! [`EchoProvider`] used for demos and pipeline smoke tests.
//!
//! The router, selector, and load balancer depend exclusively on this
//! interface; no concrete wire protocol leaks past it.

use crate::{ModelRequest, ModelResponse, RouterError, StreamChunk, TokenUsage};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Static capabilities of a registered model.
///
/// Immutable after registration; the selector scores against these values
/// and never against live backend state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelCapabilities {
    /// Maximum context window in tokens.
    pub context_length: usize,
    /// Whether the backend supports streamed generation for this model.
    pub streaming: bool,
    /// Cost in USD per 1 000 tokens.
    pub cost_per_1k: f64,
    /// Relative speed score in `[0, 1]`.
    pub speed: f64,
    /// Relative quality score in `[0, 1]`.
    pub quality: f64,
}

/// A model as exposed by a provider adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    /// Unique model id, e.g. `"mistral-7b"`.
    pub id: String,
    /// Id of the provider adapter that serves this model.
    pub provider: String,
    /// Static capability scores.
    pub capabilities: ModelCapabilities,
}

/// A streamed sequence of chunks produced by a provider backend.
///
/// Finite: the backend terminates with exactly one `done = true` chunk, or
/// with an `Err` item on upstream failure.
pub type ProviderStream = BoxStream<'static, Result<StreamChunk, RouterError>>;

/// The backend-facing capability interface.
///
/// Implementations must be thread-safe (`Send + Sync`) for use across tasks;
/// the trait is object-safe so adapters are held as `Arc<dyn ProviderAdapter>`.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Stable id of this adapter, used as [`Model::provider`].
    fn id(&self) -> &str;

    /// The models this adapter serves. Called once at registry construction.
    fn models(&self) -> Vec<Model>;

    /// Perform a complete (non-streamed) generation on the given model.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::BackendUnavailable`] on transport or backend
    /// failure. The router treats any error here as a failed health probe.
    async fn execute(
        &self,
        model_id: &str,
        request: &ModelRequest,
    ) -> Result<ModelResponse, RouterError>;

    /// Start a streamed generation on the given model.
    ///
    /// The returned stream is lazy, finite, and non-restartable.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::BackendUnavailable`] if the generation cannot
    /// be started at all.
    async fn stream_execute(
        &self,
        model_id: &str,
        request: &ModelRequest,
    ) -> Result<ProviderStream, RouterError>;
}

// ============================================================================
// Provider Registry
// ============================================================================

/// The set of backend adapters and the model index built from them.
///
/// Constructed once per process; models are read-only for the remainder of
/// the process lifetime. When two adapters register the same model id, the
/// later registration fully replaces the earlier entry (adapter binding
/// included) while keeping the original registration position, so the
/// selector's registration-order tie-break stays stable.
pub struct ProviderRegistry {
    /// Models in registration order.
    models: Vec<Model>,
    /// Model id → (position in `models`, serving adapter).
    index: HashMap<String, (usize, Arc<dyn ProviderAdapter>)>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("models", &self.models.iter().map(|m| &m.id).collect::<Vec<_>>())
            .finish()
    }
}

impl ProviderRegistry {
    /// Build the registry from a set of adapters.
    ///
    /// Each adapter's catalog is read exactly once, here.
    pub fn new(adapters: Vec<Arc<dyn ProviderAdapter>>) -> Self {
        let mut models: Vec<Model> = Vec::new();
        let mut index: HashMap<String, (usize, Arc<dyn ProviderAdapter>)> = HashMap::new();

        for adapter in adapters {
            for model in adapter.models() {
                match index.get(&model.id) {
                    Some(&(pos, _)) => {
                        tracing::warn!(
                            model_id = %model.id,
                            provider = %adapter.id(),
                            "model re-registered, replacing existing entry"
                        );
                        models[pos] = model.clone();
                        index.insert(model.id, (pos, Arc::clone(&adapter)));
                    }
                    None => {
                        let pos = models.len();
                        index.insert(model.id.clone(), (pos, Arc::clone(&adapter)));
                        models.push(model);
                    }
                }
            }
        }

        tracing::info!(model_count = models.len(), "provider registry built");
        Self { models, index }
    }

    /// All registered models, in registration order.
    pub fn models(&self) -> &[Model] {
        &self.models
    }

    /// Whether the registry holds no models at all.
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Look up a model by id.
    pub fn model(&self, model_id: &str) -> Option<&Model> {
        self.index.get(model_id).map(|&(pos, _)| &self.models[pos])
    }

    /// The adapter serving the given model id.
    pub fn adapter_for(&self, model_id: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.index.get(model_id).map(|(_, a)| Arc::clone(a))
    }

    /// The registration position of a model id, for deterministic tie-breaks.
    pub fn position(&self, model_id: &str) -> Option<usize> {
        self.index.get(model_id).map(|&(pos, _)| pos)
    }
}

// ============================================================================
// Echo Provider (demos / tests)
// ============================================================================

/// In-crate demo provider that echoes the request back as chunks.
///
/// Splits the message into words and streams them with a configurable delay.
/// Useful for router smoke tests and fan-out demos without real backends.
pub struct EchoProvider {
    id: String,
    catalog: Vec<Model>,
    /// Simulated per-chunk delay.
    pub delay: Duration,
}

impl EchoProvider {
    /// Create an echo provider with the given adapter id and no models.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            catalog: Vec::new(),
            delay: Duration::from_millis(1),
        }
    }

    /// Register a model in this provider's catalog.
    pub fn with_model(mut self, model_id: impl Into<String>, capabilities: ModelCapabilities) -> Self {
        let id = model_id.into();
        self.catalog.push(Model {
            id,
            provider: self.id.clone(),
            capabilities,
        });
        self
    }

    /// Set the simulated per-chunk delay.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn usage_for(request: &ModelRequest, completion_tokens: u64) -> TokenUsage {
        let prompt_tokens = request.approx_tokens() as u64;
        TokenUsage {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    fn cost_for(&self, model_id: &str, usage: &TokenUsage) -> f64 {
        self.catalog
            .iter()
            .find(|m| m.id == model_id)
            .map(|m| m.capabilities.cost_per_1k * usage.total_tokens as f64 / 1000.0)
            .unwrap_or(0.0)
    }
}

#[async_trait]
impl ProviderAdapter for EchoProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn models(&self) -> Vec<Model> {
        self.catalog.clone()
    }

    async fn execute(
        &self,
        model_id: &str,
        request: &ModelRequest,
    ) -> Result<ModelResponse, RouterError> {
        if !self.catalog.iter().any(|m| m.id == model_id) {
            return Err(RouterError::BackendUnavailable {
                model_id: model_id.to_string(),
                reason: "model not in echo catalog".to_string(),
            });
        }

        let started = Instant::now();
        tokio::time::sleep(self.delay).await;

        let text = request.message.clone();
        let usage = Self::usage_for(request, text.split_whitespace().count() as u64);
        Ok(ModelResponse {
            cost: self.cost_for(model_id, &usage),
            text,
            model_id: model_id.to_string(),
            latency: started.elapsed(),
            usage,
        })
    }

    async fn stream_execute(
        &self,
        model_id: &str,
        request: &ModelRequest,
    ) -> Result<ProviderStream, RouterError> {
        if !self.catalog.iter().any(|m| m.id == model_id) {
            return Err(RouterError::BackendUnavailable {
                model_id: model_id.to_string(),
                reason: "model not in echo catalog".to_string(),
            });
        }

        let words: Vec<String> = request
            .message
            .split_whitespace()
            .map(|w| w.to_string())
            .collect();
        let usage = Self::usage_for(request, words.len() as u64);
        let delay = self.delay;

        let mut chunks: Vec<Result<StreamChunk, RouterError>> =
            words.into_iter().map(|w| Ok(StreamChunk::text(w))).collect();
        chunks.push(Ok(StreamChunk::done(usage)));

        let stream = futures::stream::iter(chunks).then(move |c| async move {
            tokio::time::sleep(delay).await;
            c
        });

        Ok(stream.boxed())
    }
}
