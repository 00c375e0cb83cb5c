//! Model selection: hard filters, then weighted scoring.
//!
//! Candidates are first narrowed by hard requirements — an explicit model
//! id (selected directly, bypassing scoring), minimum context length for the
//! message + context size, a streaming-capability flag, and an explicit
//! budget (candidates above it are **excluded**, never merely penalised).
//! Survivors are scored by a weighted quality/speed/cost combination shaped
//! by the caller's [`Priority`].
//!
//! Tie-break order is fixed for testability: highest quality, then lowest
//! cost, then registration order.

use crate::config::{ScoreWeights, SelectionConfig};
use crate::provider::{Model, ProviderRegistry};
use crate::{ModelRequest, Priority, RouterError};
use std::sync::Arc;

/// Score comparisons within this epsilon are treated as ties.
const SCORE_EPSILON: f64 = 1e-9;

/// The selector's verdict: a model and the score that won it.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectedModel {
    /// The chosen model.
    pub model: Model,
    /// The weighted score that won, or `1.0` for an explicit-id bypass.
    pub score: f64,
}

/// Pluggable scoring function.
///
/// The router's control flow never depends on how scores are computed, so
/// real heuristics can replace [`WeightedScorer`] without touching it.
/// Implementations must be deterministic: identical model + request inputs
/// must always produce the same score.
pub trait ModelScorer: Send + Sync {
    /// Score a candidate for a request. Higher is better.
    fn score(&self, model: &Model, request: &ModelRequest) -> f64;
}

/// Default scorer: priority-shaped weighted combination.
///
/// `score = quality·w_q + speed·w_s + cost_score·w_c` with
/// `cost_score = 1 / (1 + cost_per_1k)`, so cheaper models score higher on
/// the cost axis without any non-determinism.
#[derive(Debug, Clone)]
pub struct WeightedScorer {
    selection: SelectionConfig,
}

impl WeightedScorer {
    /// Create a scorer from the configured weight tables.
    pub fn new(selection: SelectionConfig) -> Self {
        Self { selection }
    }

    fn weights(&self, priority: Priority) -> &ScoreWeights {
        match priority {
            Priority::Quality => &self.selection.quality,
            Priority::Speed => &self.selection.speed,
            Priority::Balanced => &self.selection.balanced,
        }
    }
}

impl ModelScorer for WeightedScorer {
    fn score(&self, model: &Model, request: &ModelRequest) -> f64 {
        let w = self.weights(request.priority);
        let caps = &model.capabilities;
        let cost_score = 1.0 / (1.0 + caps.cost_per_1k);
        caps.quality * w.quality + caps.speed * w.speed + cost_score * w.cost
    }
}

/// Scores and picks the best model for a request.
pub struct ModelSelector {
    scorer: Arc<dyn ModelScorer>,
}

impl std::fmt::Debug for ModelSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelSelector").finish()
    }
}

impl ModelSelector {
    /// Create a selector with the default weighted scorer.
    pub fn new(selection: SelectionConfig) -> Self {
        Self {
            scorer: Arc::new(WeightedScorer::new(selection)),
        }
    }

    /// Create a selector with a custom scoring function.
    pub fn with_scorer(scorer: Arc<dyn ModelScorer>) -> Self {
        Self { scorer }
    }

    /// Pick the best model for `request`, ignoring any id in `exclude`
    /// (models that already failed a health probe this request).
    ///
    /// # Errors
    ///
    /// - [`RouterError::ConfigurationError`] — the registry is empty.
    /// - [`RouterError::ModelNotFound`] — an explicit model id is not
    ///   registered.
    /// - [`RouterError::BackendUnavailable`] — an explicit model id is in
    ///   `exclude` (it already failed; there is no alternative to retry).
    /// - [`RouterError::NoEligibleModel`] — hard requirements or budget
    ///   eliminated every candidate.
    pub fn select(
        &self,
        request: &ModelRequest,
        registry: &ProviderRegistry,
        exclude: &[String],
    ) -> Result<SelectedModel, RouterError> {
        if registry.is_empty() {
            return Err(RouterError::ConfigurationError(
                "provider registry is empty".to_string(),
            ));
        }

        // Explicit model requirement: direct selection, no scoring.
        if let Some(model_id) = request
            .requirements
            .as_ref()
            .and_then(|r| r.model_id.as_deref())
        {
            return self.select_explicit(model_id, request, registry, exclude);
        }

        let required_context = self.required_context(request);
        let needs_streaming = request
            .requirements
            .as_ref()
            .is_some_and(|r| r.needs_streaming);

        let mut best: Option<SelectedModel> = None;
        let mut last_exclusion = "no models registered";

        for model in registry.models() {
            if exclude.iter().any(|id| id == &model.id) {
                last_exclusion = "candidate already failed this request";
                continue;
            }
            if model.capabilities.context_length < required_context {
                last_exclusion = "context window too small";
                continue;
            }
            if needs_streaming && !model.capabilities.streaming {
                last_exclusion = "streaming not supported";
                continue;
            }
            if let Some(budget) = request.budget {
                if model.capabilities.cost_per_1k > budget {
                    last_exclusion = "cost exceeds budget";
                    continue;
                }
            }

            let score = self.scorer.score(model, request);
            let candidate = SelectedModel {
                model: model.clone(),
                score,
            };

            best = Some(match best {
                None => candidate,
                Some(incumbent) => {
                    if beats(&candidate, &incumbent) {
                        candidate
                    } else {
                        incumbent
                    }
                }
            });
        }

        match best {
            Some(selected) => {
                tracing::debug!(
                    model_id = %selected.model.id,
                    score = selected.score,
                    priority = ?request.priority,
                    "model selected"
                );
                Ok(selected)
            }
            None => Err(RouterError::NoEligibleModel {
                user_id: request.user_id.clone(),
                reason: last_exclusion.to_string(),
            }),
        }
    }

    /// Direct selection of an explicitly required model.
    ///
    /// Scoring is bypassed, but an explicit budget still excludes: a hard
    /// requirement must not silently override an explicit spend cap.
    fn select_explicit(
        &self,
        model_id: &str,
        request: &ModelRequest,
        registry: &ProviderRegistry,
        exclude: &[String],
    ) -> Result<SelectedModel, RouterError> {
        let model = registry
            .model(model_id)
            .ok_or_else(|| RouterError::ModelNotFound {
                model_id: model_id.to_string(),
            })?;

        if exclude.iter().any(|id| id == model_id) {
            return Err(RouterError::BackendUnavailable {
                model_id: model_id.to_string(),
                reason: "explicitly required model already failed".to_string(),
            });
        }

        if let Some(budget) = request.budget {
            if model.capabilities.cost_per_1k > budget {
                return Err(RouterError::NoEligibleModel {
                    user_id: request.user_id.clone(),
                    reason: format!("required model {model_id} exceeds budget"),
                });
            }
        }

        Ok(SelectedModel {
            model: model.clone(),
            score: 1.0,
        })
    }

    /// The context window a candidate must offer for this request.
    fn required_context(&self, request: &ModelRequest) -> usize {
        let implied = request.approx_tokens();
        let declared = request
            .requirements
            .as_ref()
            .and_then(|r| r.min_context_length)
            .unwrap_or(0);
        implied.max(declared)
    }
}

/// Whether `challenger` beats `incumbent` under the fixed tie-break order:
/// score, then quality, then lower cost. Equal on all three keeps the
/// incumbent, which arrived earlier in registration order.
fn beats(challenger: &SelectedModel, incumbent: &SelectedModel) -> bool {
    let score_diff = challenger.score - incumbent.score;
    if score_diff.abs() > SCORE_EPSILON {
        return score_diff > 0.0;
    }

    let quality_diff = challenger.model.capabilities.quality - incumbent.model.capabilities.quality;
    if quality_diff.abs() > SCORE_EPSILON {
        return quality_diff > 0.0;
    }

    let cost_diff = challenger.model.capabilities.cost_per_1k - incumbent.model.capabilities.cost_per_1k;
    if cost_diff.abs() > SCORE_EPSILON {
        return cost_diff < 0.0;
    }

    false
}

// ── Tests ──────────────────────────────────────────────────────────────
