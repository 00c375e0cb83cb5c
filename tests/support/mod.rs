//! Scripted providers for integration tests.
//!
//! Stand-ins for real backends with controllable failure modes, so retry,
//! stall, and fan-out behaviour can be exercised deterministically without
//! any network dependency.

use async_trait::async_trait;
use futures::StreamExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_model_router::provider::ProviderStream;
use tokio_model_router::{
    Model, ModelCapabilities, ModelRequest, ModelResponse, ProviderAdapter, RouterError,
    StreamChunk, TokenUsage,
};

/// How a [`ScriptedProvider`] behaves when a stream is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamBehavior {
    /// Emit the message's words as chunks, then a terminal chunk.
    Complete,
    /// `stream_execute` succeeds but the stream never yields a first chunk.
    NeverStart,
    /// Emit this many chunks, then go silent forever.
    StallAfter(usize),
    /// Emit this many chunks, then yield an error item.
    ErrorAfter(usize),
    /// `stream_execute` itself fails.
    FailOpen,
}

/// A fully scripted backend adapter.
pub struct ScriptedProvider {
    id: String,
    catalog: Vec<Model>,
    chunk_delay: Duration,
    behavior: StreamBehavior,
    fail_execute: bool,
    /// Number of `stream_execute` calls that produced a stream.
    pub stream_opens: Arc<AtomicUsize>,
    /// Number of `execute` calls made.
    pub execute_calls: Arc<AtomicUsize>,
}

/// Capability block shared by most scripted models.
pub fn caps(cost: f64, speed: f64, quality: f64) -> ModelCapabilities {
    ModelCapabilities {
        context_length: 8192,
        streaming: true,
        cost_per_1k: cost,
        speed,
        quality,
    }
}

impl ScriptedProvider {
    /// A well-behaved provider serving one model.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            catalog: Vec::new(),
            chunk_delay: Duration::from_millis(5),
            behavior: StreamBehavior::Complete,
            fail_execute: false,
            stream_opens: Arc::new(AtomicUsize::new(0)),
            execute_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Register a model in the catalog.
    pub fn with_model(mut self, model_id: impl Into<String>, capabilities: ModelCapabilities) -> Self {
        self.catalog.push(Model {
            id: model_id.into(),
            provider: self.id.clone(),
            capabilities,
        });
        self
    }

    /// Set the per-chunk emission delay.
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    /// Set the streaming behaviour.
    pub fn with_behavior(mut self, behavior: StreamBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    /// Make every `execute` call fail.
    pub fn failing_execute(mut self) -> Self {
        self.fail_execute = true;
        self
    }

    fn chunks_for(request: &ModelRequest) -> Vec<StreamChunk> {
        let words: Vec<&str> = request.message.split_whitespace().collect();
        let usage = TokenUsage {
            prompt_tokens: words.len() as u64,
            completion_tokens: words.len() as u64,
            total_tokens: 2 * words.len() as u64,
        };
        let mut chunks: Vec<StreamChunk> = words.iter().map(|w| StreamChunk::text(*w)).collect();
        chunks.push(StreamChunk::done(usage));
        chunks
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedProvider {
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
        self.execute_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_execute {
            return Err(RouterError::BackendUnavailable {
                model_id: model_id.to_string(),
                reason: "scripted execute failure".to_string(),
            });
        }

        let started = Instant::now();
        tokio::time::sleep(self.chunk_delay).await;
        let words = request.message.split_whitespace().count() as u64;
        Ok(ModelResponse {
            text: request.message.clone(),
            model_id: model_id.to_string(),
            latency: started.elapsed(),
            cost: 0.001,
            usage: TokenUsage {
                prompt_tokens: words,
                completion_tokens: words,
                total_tokens: 2 * words,
            },
        })
    }

    async fn stream_execute(
        &self,
        model_id: &str,
        request: &ModelRequest,
    ) -> Result<ProviderStream, RouterError> {
        if self.behavior == StreamBehavior::FailOpen {
            return Err(RouterError::BackendUnavailable {
                model_id: model_id.to_string(),
                reason: "scripted open failure".to_string(),
            });
        }
        self.stream_opens.fetch_add(1, Ordering::SeqCst);

        let delay = self.chunk_delay;
        let all: Vec<Result<StreamChunk, RouterError>> =
            Self::chunks_for(request).into_iter().map(Ok).collect();

        let stream: ProviderStream = match self.behavior {
            StreamBehavior::Complete => futures::stream::iter(all)
                .then(move |c| async move {
                    tokio::time::sleep(delay).await;
                    c
                })
                .boxed(),
            StreamBehavior::NeverStart => futures::stream::pending().boxed(),
            StreamBehavior::StallAfter(n) => futures::stream::iter(all.into_iter().take(n))
                .then(move |c| async move {
                    tokio::time::sleep(delay).await;
                    c
                })
                .chain(futures::stream::pending())
                .boxed(),
            StreamBehavior::ErrorAfter(n) => {
                let mut items: Vec<Result<StreamChunk, RouterError>> =
                    all.into_iter().take(n).collect();
                items.push(Err(RouterError::BackendUnavailable {
                    model_id: model_id.to_string(),
                    reason: "scripted mid-stream failure".to_string(),
                }));
                futures::stream::iter(items)
                    .then(move |c| async move {
                        tokio::time::sleep(delay).await;
                        c
                    })
                    .boxed()
            }
            StreamBehavior::FailOpen => unreachable!("handled above"),
        };

        Ok(stream)
    }
}
