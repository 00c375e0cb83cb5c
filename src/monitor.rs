//! Per-request performance telemetry.
//!
//! Records one [`PerformanceRecord`] per serving attempt into a bounded,
//! time-windowed per-model ring buffer, and aggregates them on demand:
//! tokens-per-second over the recent window, per-model averages, and
//! advisory optimization recommendations.
//!
//! Recommendations are read-only output. They are never fed back into the
//! selector's weights, which keeps selection deterministic.
//!
//! Locking: writes are short, so each model's ring buffer sits behind its
//! own `parking_lot::Mutex` inside a `DashMap` — concurrent recorders for
//! different models never contend.

use crate::config::{MonitorConfig, RecommendationConfig};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// One serving attempt's telemetry.
#[derive(Debug, Clone, PartialEq)]
pub struct PerformanceRecord {
    /// The model that served (or failed to serve) the attempt.
    pub model_id: String,
    /// The caller the attempt belonged to.
    pub user_id: String,
    /// End-to-end latency of the attempt.
    pub latency: Duration,
    /// Tokens processed; zero for failed attempts.
    pub tokens: u64,
    /// Estimated cost in USD.
    pub cost: f64,
    /// Quality score attributed to the attempt, in `[0, 1]`.
    pub quality: f64,
    /// When the attempt finished.
    pub recorded_at: Instant,
}

/// Per-model aggregates over the retained window.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelAggregates {
    /// Number of records in the window.
    pub count: usize,
    /// Mean latency across the window.
    pub avg_latency: Duration,
    /// Mean cost per attempt in USD.
    pub avg_cost: f64,
    /// Mean quality score.
    pub avg_quality: f64,
}

/// What an advisory flag is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecommendationKind {
    /// Rolling average latency crossed the configured ceiling.
    HighLatency,
    /// Rolling average quality fell below the configured floor.
    LowQuality,
}

/// One advisory observation about a model.
#[derive(Debug, Clone, PartialEq)]
pub struct Recommendation {
    /// The model the flag is about.
    pub model_id: String,
    /// What crossed a bound.
    pub kind: RecommendationKind,
    /// Human-readable detail with the observed value.
    pub detail: String,
}

/// Bounded, time-windowed per-model telemetry buffers.
pub struct PerformanceMonitor {
    buffers: DashMap<String, Mutex<VecDeque<PerformanceRecord>>>,
    window: Duration,
    capacity: usize,
    thresholds: RecommendationConfig,
}

impl std::fmt::Debug for PerformanceMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerformanceMonitor")
            .field("models", &self.buffers.len())
            .field("window", &self.window)
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl PerformanceMonitor {
    /// Create a monitor with the given window sizing and advisory thresholds.
    pub fn new(monitor: MonitorConfig, thresholds: RecommendationConfig) -> Self {
        Self {
            buffers: DashMap::new(),
            window: Duration::from_secs(monitor.window_s),
            capacity: monitor.capacity,
            thresholds,
        }
    }

    /// Append a record to its model's ring buffer.
    ///
    /// Eviction happens inline: anything older than the window, or beyond
    /// the capacity bound, falls off the front.
    pub fn record(&self, record: PerformanceRecord) {
        let buffer = self
            .buffers
            .entry(record.model_id.clone())
            .or_insert_with(|| Mutex::new(VecDeque::new()));
        let mut queue = buffer.lock();

        queue.push_back(record);
        while queue.len() > self.capacity {
            queue.pop_front();
        }
        let horizon = Instant::now().checked_sub(self.window);
        if let Some(horizon) = horizon {
            while queue.front().is_some_and(|r| r.recorded_at < horizon) {
                queue.pop_front();
            }
        }
    }

    /// Tokens-per-second over the recent window.
    ///
    /// `model_id = None` computes across every model. The rate divides total
    /// tokens by the observed span between the oldest and newest in-window
    /// record, floored at one second so a single burst cannot report an
    /// absurd rate.
    pub fn tps(&self, model_id: Option<&str>) -> f64 {
        let now = Instant::now();
        let mut total_tokens = 0u64;
        let mut oldest: Option<Instant> = None;

        for entry in self.buffers.iter() {
            if model_id.is_some_and(|id| id != entry.key()) {
                continue;
            }
            let queue = entry.value().lock();
            for record in queue.iter() {
                if now.duration_since(record.recorded_at) > self.window {
                    continue;
                }
                total_tokens += record.tokens;
                oldest = Some(match oldest {
                    Some(o) if o <= record.recorded_at => o,
                    _ => record.recorded_at,
                });
            }
        }

        let Some(oldest) = oldest else {
            return 0.0;
        };
        let span = now.duration_since(oldest).as_secs_f64().max(1.0);
        total_tokens as f64 / span
    }

    /// Per-model aggregates over the retained window.
    pub fn all_metrics(&self) -> HashMap<String, ModelAggregates> {
        let now = Instant::now();
        let mut out = HashMap::new();

        for entry in self.buffers.iter() {
            let queue = entry.value().lock();
            let in_window: Vec<&PerformanceRecord> = queue
                .iter()
                .filter(|r| now.duration_since(r.recorded_at) <= self.window)
                .collect();
            if in_window.is_empty() {
                continue;
            }

            let count = in_window.len();
            let total_latency: Duration = in_window.iter().map(|r| r.latency).sum();
            let total_cost: f64 = in_window.iter().map(|r| r.cost).sum();
            let total_quality: f64 = in_window.iter().map(|r| r.quality).sum();

            out.insert(
                entry.key().clone(),
                ModelAggregates {
                    count,
                    avg_latency: total_latency / count as u32,
                    avg_cost: total_cost / count as f64,
                    avg_quality: total_quality / count as f64,
                },
            );
        }

        out
    }

    /// Advisory threshold checks over the current aggregates.
    ///
    /// A model must have at least `min_samples` in-window records before any
    /// flag fires. Output is deterministic: sorted by model id, latency
    /// flags before quality flags.
    pub fn recommendations(&self) -> Vec<Recommendation> {
        let metrics = self.all_metrics();
        let mut model_ids: Vec<&String> = metrics.keys().collect();
        model_ids.sort();

        let mut out = Vec::new();
        for model_id in model_ids {
            let Some(agg) = metrics.get(model_id) else {
                continue;
            };
            if agg.count < self.thresholds.min_samples {
                continue;
            }

            let avg_latency_ms = agg.avg_latency.as_millis() as u64;
            if avg_latency_ms > self.thresholds.max_avg_latency_ms {
                out.push(Recommendation {
                    model_id: model_id.clone(),
                    kind: RecommendationKind::HighLatency,
                    detail: format!(
                        "average latency {avg_latency_ms}ms exceeds {}ms over {} requests",
                        self.thresholds.max_avg_latency_ms, agg.count
                    ),
                });
            }
            if agg.avg_quality < self.thresholds.min_avg_quality {
                out.push(Recommendation {
                    model_id: model_id.clone(),
                    kind: RecommendationKind::LowQuality,
                    detail: format!(
                        "average quality {:.2} below floor {:.2} over {} requests",
                        agg.avg_quality, self.thresholds.min_avg_quality, agg.count
                    ),
                });
            }
        }

        out
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn record(model: &str, latency_ms: u64, tokens: u64, quality: f64) -> PerformanceRecord {
        PerformanceRecord {
            model_id: model.to_string(),
            user_id: "u1".to_string(),
            latency: Duration::from_millis(latency_ms),
            tokens,
            cost: 0.01,
            quality,
            recorded_at: Instant::now(),
        }
    }

    fn monitor() -> PerformanceMonitor {
        PerformanceMonitor::new(MonitorConfig::default(), RecommendationConfig::default())
    }

    #[test]
    fn test_record_and_aggregate_single_model() {
        let m = monitor();
        m.record(record("a", 100, 50, 0.8));
        m.record(record("a", 300, 150, 0.6));

        let metrics = m.all_metrics();
        let agg = match metrics.get("a") {
            Some(a) => a,
            None => panic!("model a must have aggregates"),
        };
        assert_eq!(agg.count, 2);
        assert_eq!(agg.avg_latency, Duration::from_millis(200));
        assert!((agg.avg_quality - 0.7).abs() < 1e-9);
        assert!((agg.avg_cost - 0.01).abs() < 1e-9);
    }

    #[test]
    fn test_models_are_aggregated_separately() {
        let m = monitor();
        m.record(record("a", 100, 10, 0.9));
        m.record(record("b", 500, 10, 0.3));

        let metrics = m.all_metrics();
        assert_eq!(metrics.len(), 2);
        assert!(metrics["a"].avg_latency < metrics["b"].avg_latency);
    }

    #[test]
    fn test_capacity_bound_evicts_oldest() {
        let m = PerformanceMonitor::new(
            MonitorConfig {
                window_s: 300,
                capacity: 3,
            },
            RecommendationConfig::default(),
        );
        for i in 0..10 {
            m.record(record("a", 100 + i, 10, 0.5));
        }
        let metrics = m.all_metrics();
        assert_eq!(metrics["a"].count, 3, "ring buffer must hold at most capacity");
    }

    #[test]
    fn test_tps_counts_recent_tokens() {
        let m = monitor();
        m.record(record("a", 100, 500, 0.8));
        m.record(record("a", 100, 500, 0.8));

        // 1000 tokens over a sub-second span, floored to 1s → ~1000 tps.
        let tps = m.tps(None);
        assert!(tps > 0.0);
        assert!(tps <= 1000.0 + f64::EPSILON);
    }

    #[test]
    fn test_tps_per_model_filter() {
        let m = monitor();
        m.record(record("a", 100, 900, 0.8));
        m.record(record("b", 100, 100, 0.8));

        let a_tps = m.tps(Some("a"));
        let b_tps = m.tps(Some("b"));
        assert!(a_tps > b_tps);
        assert!(m.tps(Some("ghost")).abs() < f64::EPSILON);
    }

    #[test]
    fn test_tps_empty_monitor_is_zero() {
        assert!(monitor().tps(None).abs() < f64::EPSILON);
    }

    #[test]
    fn test_recommendation_high_latency_fires_above_threshold() {
        let m = PerformanceMonitor::new(
            MonitorConfig::default(),
            RecommendationConfig {
                max_avg_latency_ms: 200,
                min_avg_quality: 0.0,
                min_samples: 5,
            },
        );
        for _ in 0..5 {
            m.record(record("slow", 1000, 10, 0.9));
        }

        let recs = m.recommendations();
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].kind, RecommendationKind::HighLatency);
        assert_eq!(recs[0].model_id, "slow");
        assert!(recs[0].detail.contains("1000ms"));
    }

    #[test]
    fn test_recommendation_low_quality_fires_below_floor() {
        let m = PerformanceMonitor::new(
            MonitorConfig::default(),
            RecommendationConfig {
                max_avg_latency_ms: 60_000,
                min_avg_quality: 0.5,
                min_samples: 3,
            },
        );
        for _ in 0..3 {
            m.record(record("mediocre", 100, 10, 0.2));
        }

        let recs = m.recommendations();
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].kind, RecommendationKind::LowQuality);
    }

    #[test]
    fn test_recommendation_respects_min_samples() {
        let m = PerformanceMonitor::new(
            MonitorConfig::default(),
            RecommendationConfig {
                max_avg_latency_ms: 1,
                min_avg_quality: 0.99,
                min_samples: 100,
            },
        );
        for _ in 0..10 {
            m.record(record("a", 1000, 10, 0.1));
        }
        assert!(
            m.recommendations().is_empty(),
            "flags must not fire below the sample floor"
        );
    }

    #[test]
    fn test_recommendations_sorted_by_model_id() {
        let m = PerformanceMonitor::new(
            MonitorConfig::default(),
            RecommendationConfig {
                max_avg_latency_ms: 1,
                min_avg_quality: 0.0,
                min_samples: 1,
            },
        );
        m.record(record("zeta", 1000, 10, 0.9));
        m.record(record("alpha", 1000, 10, 0.9));

        let recs = m.recommendations();
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].model_id, "alpha");
        assert_eq!(recs[1].model_id, "zeta");
    }

    #[test]
    fn test_concurrent_recording_across_models() {
        use std::sync::Arc;
        use std::thread;

        let m = Arc::new(monitor());
        let mut handles = Vec::new();
        for t in 0..4 {
            let m = Arc::clone(&m);
            handles.push(thread::spawn(move || {
                let model = format!("model-{t}");
                for _ in 0..250 {
                    m.record(record(&model, 100, 10, 0.5));
                }
            }));
        }
        for h in handles {
            if h.join().is_err() {
                std::process::abort();
            }
        }

        let metrics = m.all_metrics();
        assert_eq!(metrics.len(), 4);
        for agg in metrics.values() {
            assert_eq!(agg.count, 250);
        }
    }
}
