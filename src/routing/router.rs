//! The router: orchestration of selection, balancing, execution, fan-out,
//! and telemetry.
//!
//! [`ModelRouter`] is explicitly constructed once per process and owns every
//! other component — there are no hidden globals. Requests are validated at
//! this boundary and fail fast; provider calls never see a malformed
//! request.
//!
//! Message content is never logged. Spans and events carry ids, model names,
//! outcomes, and durations only.

use crate::config::{RouterConfig, TimeoutConfig};
use crate::metrics;
use crate::monitor::{PerformanceMonitor, PerformanceRecord, Recommendation};
use crate::provider::{Model, ProviderRegistry};
use crate::routing::balancer::{LoadBalancer, LoadSnapshot, Reservation};
use crate::routing::selector::{ModelScorer, ModelSelector, SelectedModel};
use crate::streaming::{ChunkStream, SharedGeneration, StreamCache, StreamEvent};
use crate::{
    request_fingerprint, ModelRequest, ModelResponse, RouterError, Session, StreamChunk,
};
use futures::StreamExt;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Result of a successful [`ModelRouter::switch_model`].
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSwitch {
    /// The replacement session, bound to the new model. Context is the old
    /// session's context, transferred verbatim.
    pub session: Session,
    /// Number of context entries transferred.
    pub transferred_context: usize,
    /// Non-fatal observations, e.g. the target's context window being
    /// smaller than the accumulated context.
    pub warnings: Vec<String>,
}

/// Filter for [`ModelRouter::available_models`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelFilter {
    /// Only models served by this provider adapter.
    pub provider: Option<String>,
    /// Only models that support streamed generation.
    pub streaming_only: bool,
    /// Only models with at least this context window.
    pub min_context_length: Option<usize>,
    /// Only models at or below this cost per 1K tokens.
    pub max_cost_per_1k: Option<f64>,
}

/// Aggregated telemetry returned by [`ModelRouter::metrics_snapshot`].
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    /// Per-model aggregates from the performance monitor.
    pub per_model: HashMap<String, crate::monitor::ModelAggregates>,
    /// Tokens-per-second across all models over the recent window.
    pub tps: f64,
    /// Current per-model in-flight reservation counts.
    pub load: LoadSnapshot,
    /// Advisory optimization flags. Never auto-applied.
    pub recommendations: Vec<Recommendation>,
    /// Process-level counter summary from the Prometheus registry.
    pub process: metrics::MetricsSummary,
}

/// Everything the router owns, shared with stream driver tasks.
struct RouterInner {
    registry: ProviderRegistry,
    selector: ModelSelector,
    balancer: LoadBalancer,
    cache: StreamCache,
    monitor: PerformanceMonitor,
    timeouts: TimeoutConfig,
}

/// The adaptive request router.
///
/// Cheap to clone-by-reference via `Arc` internally; construct one per
/// process and share it.
pub struct ModelRouter {
    inner: Arc<RouterInner>,
}

impl std::fmt::Debug for ModelRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRouter")
            .field("registry", &self.inner.registry)
            .field("in_flight_streams", &self.inner.cache.in_flight())
            .finish()
    }
}

impl ModelRouter {
    /// Build a router over the given registry with the default weighted
    /// scorer.
    pub fn new(registry: ProviderRegistry, config: RouterConfig) -> Self {
        let selector = ModelSelector::new(config.selection.clone());
        Self::assemble(registry, config, selector)
    }

    /// Build a router with a custom scoring function.
    ///
    /// Control flow is identical to [`new`](Self::new); only the scores
    /// change.
    pub fn with_scorer(
        registry: ProviderRegistry,
        config: RouterConfig,
        scorer: Arc<dyn ModelScorer>,
    ) -> Self {
        Self::assemble(registry, config, ModelSelector::with_scorer(scorer))
    }

    fn assemble(registry: ProviderRegistry, config: RouterConfig, selector: ModelSelector) -> Self {
        let balancer = LoadBalancer::new(registry.models().iter().map(|m| m.id.clone()));
        let monitor = PerformanceMonitor::new(config.monitor, config.recommendations);
        info!(
            target: "router::dispatch",
            model_count = registry.models().len(),
            "router constructed"
        );
        Self {
            inner: Arc::new(RouterInner {
                registry,
                selector,
                balancer,
                cache: StreamCache::new(),
                monitor,
                timeouts: config.timeouts,
            }),
        }
    }

    /// Route a request to the best backend and return its complete response.
    ///
    /// The chosen model's availability is gated by a bounded-time execute;
    /// on failure the router reselects excluding the failed model and
    /// retries exactly once. One [`PerformanceRecord`] is recorded per
    /// attempt.
    ///
    /// # Errors
    ///
    /// - [`RouterError::InvalidRequest`] — empty message or user id.
    /// - [`RouterError::ModelNotFound`] / [`RouterError::NoEligibleModel`] —
    ///   caller-input faults, returned without retry.
    /// - [`RouterError::BackendUnavailable`] — both serving attempts failed.
    /// - [`RouterError::ConfigurationError`] — the registry is empty.
    pub async fn route(&self, request: &ModelRequest) -> Result<ModelResponse, RouterError> {
        let result = self.route_inner(request).await;
        match &result {
            Ok(_) => metrics::inc_request("route", "ok"),
            Err(_) => metrics::inc_request("route", "err"),
        }
        result
    }

    async fn route_inner(&self, request: &ModelRequest) -> Result<ModelResponse, RouterError> {
        validate(request)?;
        let request_id = uuid::Uuid::new_v4().to_string();

        let mut exclude: Vec<String> = Vec::new();
        let mut last_unavailable: Option<RouterError> = None;

        for attempt in 0u32..2 {
            let selected =
                match self
                    .inner
                    .selector
                    .select(request, &self.inner.registry, &exclude)
                {
                    Ok(s) => s,
                    // After a failed attempt the original unavailability is
                    // the caller-relevant error, not the shrunken candidate
                    // pool.
                    Err(e) => return Err(last_unavailable.take().unwrap_or(e)),
                };
            let model_id = selected.model.id.clone();
            let Some(adapter) = self.inner.registry.adapter_for(&model_id) else {
                return Err(RouterError::ModelNotFound { model_id });
            };

            let reservation = self.inner.balancer.reserve(&[model_id.as_str()])?;
            let started = Instant::now();
            let outcome =
                tokio::time::timeout(self.inner.timeouts.request(), adapter.execute(&model_id, request))
                    .await;
            let latency = started.elapsed();

            let reason = match outcome {
                Ok(Ok(mut response)) => {
                    // Tag with the resolved model id regardless of what the
                    // adapter claims.
                    response.model_id = model_id.clone();
                    response.latency = latency;

                    self.inner.monitor.record(PerformanceRecord {
                        model_id: model_id.clone(),
                        user_id: request.user_id.clone(),
                        latency,
                        tokens: response.usage.total_tokens,
                        cost: response.cost,
                        quality: selected.model.capabilities.quality,
                        recorded_at: Instant::now(),
                    });
                    metrics::observe_request_duration(&model_id, latency);

                    info!(
                        target: "router::dispatch",
                        request_id = %request_id,
                        model_id = %model_id,
                        attempt = attempt,
                        duration_ms = latency.as_millis() as u64,
                        outcome = "ok",
                        "request routed"
                    );
                    return Ok(response);
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!(
                    "no response within {}ms",
                    self.inner.timeouts.request_ms
                ),
            };

            // Failed attempt: record it, release the slot, exclude the model.
            self.inner.monitor.record(PerformanceRecord {
                model_id: model_id.clone(),
                user_id: request.user_id.clone(),
                latency,
                tokens: 0,
                cost: 0.0,
                quality: 0.0,
                recorded_at: Instant::now(),
            });
            reservation.release();

            warn!(
                target: "router::dispatch",
                request_id = %request_id,
                model_id = %model_id,
                attempt = attempt,
                error_kind = "backend_unavailable",
                reason = %reason,
                "serving attempt failed"
            );

            exclude.push(model_id.clone());
            last_unavailable = Some(RouterError::BackendUnavailable { model_id, reason });
            if attempt == 0 {
                metrics::inc_fallback("route");
            }
        }

        Err(last_unavailable.unwrap_or_else(|| {
            RouterError::ConfigurationError("routing loop exited without attempts".to_string())
        }))
    }

    /// Open a streamed generation for a request.
    ///
    /// Identical concurrent requests — by normalized-message fingerprint —
    /// are served by one underlying generation fanned out through the
    /// streaming cache; this call may therefore attach to work already in
    /// flight. Dropping the returned stream is cancellation and never
    /// disturbs other subscribers.
    ///
    /// # Errors
    ///
    /// Caller-input faults (`InvalidRequest`, `ModelNotFound`,
    /// `NoEligibleModel`, `ConfigurationError`) are returned immediately.
    /// Backend failures after the stream opens arrive as the stream's
    /// terminal `Err` item.
    pub async fn stream(&self, request: &ModelRequest) -> Result<ChunkStream, RouterError> {
        let result = self.stream_inner(request).await;
        match &result {
            Ok(_) => metrics::inc_request("stream", "ok"),
            Err(_) => metrics::inc_request("stream", "err"),
        }
        result
    }

    async fn stream_inner(&self, request: &ModelRequest) -> Result<ChunkStream, RouterError> {
        validate(request)?;
        // Pre-flight selection surfaces caller-input faults on the call
        // itself rather than as a stream terminal. The driver re-runs the
        // same deterministic selection.
        self.inner
            .selector
            .select(request, &self.inner.registry, &[])?;

        let key = request_fingerprint(request);
        let (stream, claimed) = self.inner.cache.subscribe_or_claim(&key);

        match claimed {
            Some(generation) => {
                metrics::inc_subscriber("started");
                metrics::add_inflight_streams(1);
                let inner = Arc::clone(&self.inner);
                let request = request.clone();
                tokio::spawn(async move {
                    drive_generation(inner, generation, request).await;
                });
            }
            None => {
                metrics::inc_subscriber("joined");
                debug!(
                    target: "router::dispatch",
                    key = %key,
                    "attached to in-flight generation"
                );
            }
        }

        Ok(stream)
    }

    /// Re-bind a session to another registered model.
    ///
    /// Context is transferred verbatim — never truncated. If the target's
    /// context window is smaller than the accumulated context, the switch
    /// still succeeds and a warning is attached.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::ModelNotFound`] if `new_model_id` is not
    /// registered.
    pub fn switch_model(
        &self,
        session: &Session,
        new_model_id: &str,
        reason: &str,
    ) -> Result<ModelSwitch, RouterError> {
        let model = self
            .inner
            .registry
            .model(new_model_id)
            .ok_or_else(|| RouterError::ModelNotFound {
                model_id: new_model_id.to_string(),
            })?;

        let mut warnings = Vec::new();
        let context_tokens: usize = session
            .context
            .iter()
            .map(|c| c.split_whitespace().count())
            .sum();
        if context_tokens > model.capabilities.context_length {
            warnings.push(format!(
                "accumulated context (~{context_tokens} tokens) exceeds {new_model_id}'s window of {}",
                model.capabilities.context_length
            ));
        }

        let new_session = Session {
            id: session.id.clone(),
            user_id: session.user_id.clone(),
            model_id: new_model_id.to_string(),
            context: session.context.clone(),
        };

        info!(
            target: "router::dispatch",
            session_id = %session.id,
            from_model = %session.model_id,
            to_model = %new_model_id,
            reason = %reason,
            transferred = new_session.context.len(),
            "session switched model"
        );

        Ok(ModelSwitch {
            transferred_context: new_session.context.len(),
            session: new_session,
            warnings,
        })
    }

    /// Models visible to a caller, optionally narrowed by a filter.
    ///
    /// An empty result is valid whenever the filter excluded everything; an
    /// empty **registry** is a deployment fault.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::ConfigurationError`] if the registry itself is
    /// empty.
    pub fn available_models(
        &self,
        user_id: &str,
        filter: Option<&ModelFilter>,
    ) -> Result<Vec<Model>, RouterError> {
        if self.inner.registry.is_empty() {
            return Err(RouterError::ConfigurationError(
                "provider registry is empty".to_string(),
            ));
        }

        let matches = |m: &Model| -> bool {
            let Some(f) = filter else { return true };
            if f.provider.as_ref().is_some_and(|p| p != &m.provider) {
                return false;
            }
            if f.streaming_only && !m.capabilities.streaming {
                return false;
            }
            if f.min_context_length
                .is_some_and(|min| m.capabilities.context_length < min)
            {
                return false;
            }
            if f.max_cost_per_1k
                .is_some_and(|max| m.capabilities.cost_per_1k > max)
            {
                return false;
            }
            true
        };

        let models: Vec<Model> = self
            .inner
            .registry
            .models()
            .iter()
            .filter(|m| matches(m))
            .cloned()
            .collect();

        debug!(
            target: "router::dispatch",
            user_id = %user_id,
            matched = models.len(),
            "available models listed"
        );
        Ok(models)
    }

    /// Aggregated telemetry snapshot for the observability endpoint.
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            per_model: self.inner.monitor.all_metrics(),
            tps: self.inner.monitor.tps(None),
            load: self.inner.balancer.snapshot(),
            recommendations: self.inner.monitor.recommendations(),
            process: metrics::get_metrics_summary(),
        }
    }

    /// The performance monitor, for collaborators that record externally
    /// observed quality signals.
    pub fn monitor(&self) -> &PerformanceMonitor {
        &self.inner.monitor
    }

    /// The load balancer's current per-model in-flight counts.
    pub fn load_snapshot(&self) -> LoadSnapshot {
        self.inner.balancer.snapshot()
    }
}

/// Boundary validation: fail fast instead of propagating missing fields
/// into provider calls.
fn validate(request: &ModelRequest) -> Result<(), RouterError> {
    if request.user_id.trim().is_empty() {
        return Err(RouterError::InvalidRequest(
            "user_id must not be empty".to_string(),
        ));
    }
    if request.message.trim().is_empty() {
        return Err(RouterError::InvalidRequest(
            "message must not be empty".to_string(),
        ));
    }
    Ok(())
}

// ── Stream driver ──────────────────────────────────────────────────────────

/// Await `fut`, racing definitive cancellation of the generation.
///
/// Returns `None` once the last subscriber is gone. A stale cancel permit —
/// left by a subscriber that dropped just before a new identical request
/// attached — is consumed and ignored.
async fn or_cancelled<F: Future>(generation: &SharedGeneration, fut: F) -> Option<F::Output> {
    tokio::pin!(fut);
    loop {
        tokio::select! {
            out = &mut fut => return Some(out),
            _ = generation.cancelled() => {
                if generation.subscriber_count() == 0 {
                    return None;
                }
            }
        }
    }
}

/// Publish the terminal failure and retire the generation.
fn fail_generation(inner: &RouterInner, generation: &Arc<SharedGeneration>, err: RouterError) {
    warn!(
        target: "router::stream",
        key = %generation.key(),
        error = %err,
        "generation failed"
    );
    generation.publish(StreamEvent::Failed(err));
    generation.finish();
    inner.cache.retire(generation);
    metrics::add_inflight_streams(-1);
}

/// Retire a cancelled generation.
///
/// The map entry is removed **before** the final subscriber check so no new
/// subscriber can attach in between; any straggler that made it in gets a
/// typed terminal instead of a silently truncated stream.
fn cancel_generation(inner: &RouterInner, generation: &Arc<SharedGeneration>, model_id: &str) {
    inner.cache.retire(generation);
    if generation.subscriber_count() > 0 {
        generation.publish(StreamEvent::Failed(RouterError::BackendUnavailable {
            model_id: model_id.to_string(),
            reason: "generation cancelled before completion".to_string(),
        }));
    }
    generation.finish();
    metrics::add_inflight_streams(-1);
    debug!(
        target: "router::stream",
        key = %generation.key(),
        "generation cancelled by last subscriber"
    );
}

/// Retire a cleanly completed generation.
fn complete_generation(inner: &RouterInner, generation: &Arc<SharedGeneration>) {
    generation.finish();
    inner.cache.retire(generation);
    metrics::add_inflight_streams(-1);
}

/// Drive one shared generation: select, reserve, open, pump, retire.
///
/// Owns the balancer reservation for the generation's lifetime, so the slot
/// is released exactly once no matter how many subscribers come and go.
async fn drive_generation(
    inner: Arc<RouterInner>,
    generation: Arc<SharedGeneration>,
    request: ModelRequest,
) {
    let request_id = uuid::Uuid::new_v4().to_string();
    let mut exclude: Vec<String> = Vec::new();
    let mut last_unavailable: Option<RouterError> = None;

    for attempt in 0u32..2 {
        let selected = match inner.selector.select(&request, &inner.registry, &exclude) {
            Ok(s) => s,
            Err(e) => {
                fail_generation(&inner, &generation, last_unavailable.take().unwrap_or(e));
                return;
            }
        };
        let model_id = selected.model.id.clone();
        let Some(adapter) = inner.registry.adapter_for(&model_id) else {
            fail_generation(&inner, &generation, RouterError::ModelNotFound { model_id });
            return;
        };
        let reservation = match inner.balancer.reserve(&[model_id.as_str()]) {
            Ok(r) => r,
            Err(e) => {
                fail_generation(&inner, &generation, e);
                return;
            }
        };

        let started = Instant::now();

        // Health probe: the stream must open AND produce its first chunk
        // within the first-chunk bound.
        let open = async {
            let mut upstream = adapter.stream_execute(&model_id, &request).await?;
            match upstream.next().await {
                Some(Ok(chunk)) => Ok((chunk, upstream)),
                Some(Err(e)) => Err(e),
                None => Err(RouterError::BackendUnavailable {
                    model_id: model_id.clone(),
                    reason: "stream ended before first chunk".to_string(),
                }),
            }
        };
        let opened = or_cancelled(
            &generation,
            tokio::time::timeout(inner.timeouts.first_chunk(), open),
        )
        .await;

        let reason = match opened {
            None => {
                reservation.release();
                cancel_generation(&inner, &generation, &model_id);
                return;
            }
            Some(Ok(Ok((first, upstream)))) => {
                pump_generation(
                    &inner,
                    &generation,
                    reservation,
                    &selected,
                    &request,
                    &request_id,
                    first,
                    upstream,
                    started,
                )
                .await;
                return;
            }
            Some(Ok(Err(e))) => e.to_string(),
            Some(Err(_)) => format!(
                "no first chunk within {}ms",
                inner.timeouts.first_chunk_ms
            ),
        };

        // Failed probe: record the attempt, release the slot, try once more
        // with the model excluded.
        let latency = started.elapsed();
        inner.monitor.record(PerformanceRecord {
            model_id: model_id.clone(),
            user_id: request.user_id.clone(),
            latency,
            tokens: 0,
            cost: 0.0,
            quality: 0.0,
            recorded_at: Instant::now(),
        });
        reservation.release();

        warn!(
            target: "router::stream",
            request_id = %request_id,
            model_id = %model_id,
            attempt = attempt,
            error_kind = "backend_unavailable",
            reason = %reason,
            "stream attempt failed"
        );

        exclude.push(model_id.clone());
        last_unavailable = Some(RouterError::BackendUnavailable { model_id, reason });
        if attempt == 0 {
            metrics::inc_fallback("stream");
        }
    }

    let err = last_unavailable.unwrap_or_else(|| {
        RouterError::ConfigurationError("stream loop exited without attempts".to_string())
    });
    fail_generation(&inner, &generation, err);
}

/// Pump an opened upstream into the shared generation until it terminates,
/// stalls, fails, or loses its last subscriber.
#[allow(clippy::too_many_arguments)]
async fn pump_generation(
    inner: &RouterInner,
    generation: &Arc<SharedGeneration>,
    reservation: Reservation,
    selected: &SelectedModel,
    request: &ModelRequest,
    request_id: &str,
    first: StreamChunk,
    mut upstream: crate::provider::ProviderStream,
    started: Instant,
) {
    let model_id = selected.model.id.clone();
    let mut counted_tokens: u64 = first.text.split_whitespace().count() as u64;
    let mut terminal_usage = first.usage;
    let mut completed = first.done;

    generation.publish(StreamEvent::Chunk(first));

    while !completed {
        let next = or_cancelled(
            generation,
            tokio::time::timeout(inner.timeouts.stall(), upstream.next()),
        )
        .await;

        match next {
            None => {
                // Dropping the upstream stops the provider generation; this
                // is the only place it happens after a successful open.
                drop(upstream);
                reservation.release();
                cancel_generation(inner, generation, &model_id);
                return;
            }
            Some(Err(_)) => {
                drop(upstream);
                record_failed_stream(inner, request, &model_id, started);
                reservation.release();
                fail_generation(
                    inner,
                    generation,
                    RouterError::StreamStalled {
                        model_id: model_id.clone(),
                        stalled_for_ms: inner.timeouts.stall_ms,
                    },
                );
                return;
            }
            Some(Ok(None)) => {
                record_failed_stream(inner, request, &model_id, started);
                reservation.release();
                fail_generation(
                    inner,
                    generation,
                    RouterError::BackendUnavailable {
                        model_id: model_id.clone(),
                        reason: "stream ended without terminal chunk".to_string(),
                    },
                );
                return;
            }
            Some(Ok(Some(Err(e)))) => {
                drop(upstream);
                record_failed_stream(inner, request, &model_id, started);
                reservation.release();
                fail_generation(inner, generation, e);
                return;
            }
            Some(Ok(Some(Ok(chunk)))) => {
                counted_tokens += chunk.text.split_whitespace().count() as u64;
                completed = chunk.done;
                if chunk.done {
                    terminal_usage = chunk.usage;
                }
                generation.publish(StreamEvent::Chunk(chunk));
            }
        }
    }

    // Clean completion.
    let latency = started.elapsed();
    let tokens = terminal_usage
        .map(|u| u.total_tokens)
        .unwrap_or(counted_tokens);
    let cost = selected.model.capabilities.cost_per_1k * tokens as f64 / 1000.0;

    inner.monitor.record(PerformanceRecord {
        model_id: model_id.clone(),
        user_id: request.user_id.clone(),
        latency,
        tokens,
        cost,
        quality: selected.model.capabilities.quality,
        recorded_at: Instant::now(),
    });
    metrics::observe_request_duration(&model_id, latency);

    reservation.release();
    complete_generation(inner, generation);

    info!(
        target: "router::stream",
        request_id = %request_id,
        model_id = %model_id,
        duration_ms = latency.as_millis() as u64,
        tokens = tokens,
        outcome = "ok",
        "generation completed"
    );
}

/// Record a failed mid-stream attempt for the monitor.
fn record_failed_stream(
    inner: &RouterInner,
    request: &ModelRequest,
    model_id: &str,
    started: Instant,
) {
    inner.monitor.record(PerformanceRecord {
        model_id: model_id.to_string(),
        user_id: request.user_id.clone(),
        latency: started.elapsed(),
        tokens: 0,
        cost: 0.0,
        quality: 0.0,
        recorded_at: Instant::now(),
    });
}

// ── Tests ──────────────────────────────────────────────────────────────
