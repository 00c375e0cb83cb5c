//! # Stage: Streaming Fan-Out Cache
//!
//! ## Responsibility
//! Share one live generation among every concurrent caller whose request
//! carries the same normalized fingerprint. The first caller claims the
//! entry and a driver task pumps the provider stream; later callers replay
//! the buffered prefix and then follow live chunks.
//!
//! ## Guarantees
//! - Identical sequences: every subscriber observes the exact emission
//!   order, from the first chunk, regardless of when it attached.
//! - One upstream generation per fingerprint while the entry is open; the
//!   entry is retired on the terminal chunk, so a later identical request
//!   starts a brand-new generation (computation sharing, not result
//!   caching).
//! - Subscriber isolation: cancelling one subscriber never disturbs the
//!   others; the upstream generation is only cancelled once the last
//!   subscriber is gone.
//! - One shared failure: an upstream error reaches every subscriber as the
//!   same terminal item.
//!
//! ## NOT Responsible For
//! - Model selection, retries, or slot accounting (the router's driver task
//!   owns those; this module only tracks subscriber lifetime)
//! - Result caching across completed generations

use crate::{RouterError, StreamChunk};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::sync::Notify;

/// One event in a generation's ordered log.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A chunk emitted by the backend (possibly the clean terminal one).
    Chunk(StreamChunk),
    /// The shared terminal failure of this generation.
    Failed(RouterError),
}

/// Mutable per-generation state, guarded by one short lock so that the
/// replay-then-follow handoff can never miss or duplicate a chunk.
struct EntryState {
    /// Every event published so far, in emission order. Bounded by the
    /// natural length of a single response.
    log: Vec<StreamEvent>,
    /// Live subscribers' channels.
    senders: Vec<mpsc::UnboundedSender<StreamEvent>>,
}

/// One in-flight shared generation.
pub struct SharedGeneration {
    key: String,
    state: Mutex<EntryState>,
    finished: AtomicBool,
    subscribers: AtomicUsize,
    /// Signalled by the last subscriber's drop; consumed by the driver task.
    cancel: Notify,
}

impl std::fmt::Debug for SharedGeneration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedGeneration")
            .field("key", &self.key)
            .field("finished", &self.finished.load(Ordering::Relaxed))
            .field("subscribers", &self.subscribers.load(Ordering::Relaxed))
            .finish()
    }
}

impl SharedGeneration {
    fn new(key: String) -> Self {
        Self {
            key,
            state: Mutex::new(EntryState {
                log: Vec::new(),
                senders: Vec::new(),
            }),
            finished: AtomicBool::new(false),
            subscribers: AtomicUsize::new(0),
            cancel: Notify::new(),
        }
    }

    /// The fingerprint this generation serves.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Append an event to the log and deliver it to every live subscriber.
    ///
    /// Publishing after [`finish`](Self::finish) is a no-op.
    pub fn publish(&self, event: StreamEvent) {
        let mut state = self.state.lock();
        if self.finished.load(Ordering::Relaxed) {
            return;
        }
        state.senders.retain(|tx| tx.send(event.clone()).is_ok());
        state.log.push(event);
    }

    /// Mark the generation terminal and close all subscriber channels.
    pub fn finish(&self) {
        let mut state = self.state.lock();
        self.finished.store(true, Ordering::Relaxed);
        state.senders.clear();
    }

    /// Whether the terminal event has been published.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Relaxed)
    }

    /// Number of currently attached subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.load(Ordering::Relaxed)
    }

    /// Wait until the last subscriber cancels.
    ///
    /// A permit is stored if the signal fires while the driver is not
    /// waiting, so the wakeup cannot be lost between loop iterations. The
    /// driver must re-check [`subscriber_count`](Self::subscriber_count)
    /// after waking: a new identical request may have attached in the
    /// window between the last drop and the wakeup.
    pub async fn cancelled(&self) {
        self.cancel.notified().await;
    }

    /// Attach a new subscriber: replay the full log, then follow live.
    fn subscribe(self: &Arc<Self>) -> ChunkStream {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.state.lock();
            for event in &state.log {
                let _ = tx.send(event.clone());
            }
            if !self.finished.load(Ordering::Relaxed) {
                state.senders.push(tx);
            }
        }
        self.subscribers.fetch_add(1, Ordering::AcqRel);
        ChunkStream {
            rx,
            generation: Arc::clone(self),
        }
    }
}

/// A lazy, finite, non-restartable sequence of [`StreamChunk`]s.
///
/// Suspends at "next chunk ready" boundaries; dropping the stream is
/// cancellation. A mid-stream failure arrives as a terminal `Err` item,
/// distinguishable from a clean `done = true` completion.
pub struct ChunkStream {
    rx: mpsc::UnboundedReceiver<StreamEvent>,
    generation: Arc<SharedGeneration>,
}

impl std::fmt::Debug for ChunkStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkStream")
            .field("key", &self.generation.key())
            .finish()
    }
}

impl futures::Stream for ChunkStream {
    type Item = Result<StreamChunk, RouterError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(StreamEvent::Chunk(chunk))) => Poll::Ready(Some(Ok(chunk))),
            Poll::Ready(Some(StreamEvent::Failed(err))) => Poll::Ready(Some(Err(err))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl ChunkStream {
    /// Pull the next chunk, suspending until one is ready.
    ///
    /// Convenience over the [`futures::Stream`] impl for callers that do not
    /// want the combinator machinery.
    pub async fn next_chunk(&mut self) -> Option<Result<StreamChunk, RouterError>> {
        use futures::StreamExt;
        self.next().await
    }
}

impl Drop for ChunkStream {
    fn drop(&mut self) {
        let remaining = self.generation.subscribers.fetch_sub(1, Ordering::AcqRel);
        if remaining == 1 && !self.generation.is_finished() {
            self.generation.cancel.notify_one();
        }
    }
}

/// The map of in-flight shared generations, keyed by request fingerprint.
pub struct StreamCache {
    entries: DashMap<String, Arc<SharedGeneration>>,
}

impl std::fmt::Debug for StreamCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamCache")
            .field("in_flight", &self.entries.len())
            .finish()
    }
}

impl Default for StreamCache {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Attach to the in-flight generation for `key`, claiming a new one if
    /// none is open.
    ///
    /// Returns the subscriber stream plus, for the claiming caller only, the
    /// generation handle it must drive. The claim is atomic on the map
    /// entry, so two racing identical requests can never start two
    /// generations.
    pub fn subscribe_or_claim(&self, key: &str) -> (ChunkStream, Option<Arc<SharedGeneration>>) {
        match self.entries.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(occupied) => {
                let generation = Arc::clone(occupied.get());
                drop(occupied);
                tracing::debug!(key = key, "joined in-flight generation");
                (generation.subscribe(), None)
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let generation = Arc::new(SharedGeneration::new(key.to_string()));
                vacant.insert(Arc::clone(&generation));
                tracing::debug!(key = key, "claimed new generation");
                (generation.subscribe(), Some(generation))
            }
        }
    }

    /// Retire a generation: remove its entry so the next identical request
    /// starts fresh.
    ///
    /// Only removes the exact generation passed in — a newer generation that
    /// already reclaimed the key is left untouched.
    pub fn retire(&self, generation: &Arc<SharedGeneration>) {
        self.entries
            .remove_if(generation.key(), |_, current| Arc::ptr_eq(current, generation));
    }

    /// Number of generations currently in flight.
    pub fn in_flight(&self) -> usize {
        self.entries.len()
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TokenUsage;
    use futures::StreamExt;

    fn chunk(text: &str) -> StreamEvent {
        StreamEvent::Chunk(StreamChunk::text(text))
    }

    fn done() -> StreamEvent {
        StreamEvent::Chunk(StreamChunk::done(TokenUsage::default()))
    }

    async fn collect(mut stream: ChunkStream) -> Vec<Result<StreamChunk, RouterError>> {
        let mut out = Vec::new();
        while let Some(item) = stream.next().await {
            out.push(item);
        }
        out
    }

    #[tokio::test]
    async fn test_single_subscriber_sees_ordered_chunks() {
        let cache = StreamCache::new();
        let (stream, claimed) = cache.subscribe_or_claim("k1");
        let generation = match claimed {
            Some(g) => g,
            None => panic!("first caller must claim"),
        };

        generation.publish(chunk("a"));
        generation.publish(chunk("b"));
        generation.publish(done());
        generation.finish();
        cache.retire(&generation);

        let items = collect(stream).await;
        assert_eq!(items.len(), 3);
        let texts: Vec<_> = items
            .iter()
            .filter_map(|i| i.as_ref().ok().map(|c| c.text.clone()))
            .collect();
        assert_eq!(texts, vec!["a", "b", ""]);
    }

    #[tokio::test]
    async fn test_second_caller_joins_not_claims() {
        let cache = StreamCache::new();
        let (_s1, claimed1) = cache.subscribe_or_claim("k1");
        let (_s2, claimed2) = cache.subscribe_or_claim("k1");
        assert!(claimed1.is_some());
        assert!(claimed2.is_none(), "second caller must join, not claim");
        assert_eq!(cache.in_flight(), 1);
    }

    #[tokio::test]
    async fn test_late_subscriber_replays_prefix_then_follows_live() {
        let cache = StreamCache::new();
        let (s1, claimed) = cache.subscribe_or_claim("k1");
        let generation = match claimed {
            Some(g) => g,
            None => panic!("first caller must claim"),
        };

        // Generation already emitted chunks 1-2 of 5 when the second caller
        // attaches.
        generation.publish(chunk("c1"));
        generation.publish(chunk("c2"));

        let (s2, claimed2) = cache.subscribe_or_claim("k1");
        assert!(claimed2.is_none());

        generation.publish(chunk("c3"));
        generation.publish(chunk("c4"));
        generation.publish(done());
        generation.finish();
        cache.retire(&generation);

        let items1 = collect(s1).await;
        let items2 = collect(s2).await;
        assert_eq!(items1.len(), 5, "first subscriber sees all 5 chunks");
        assert_eq!(
            items2.len(),
            5,
            "late subscriber still receives all 5 chunks in order"
        );

        let texts: Vec<_> = items2
            .iter()
            .filter_map(|i| i.as_ref().ok().map(|c| c.text.clone()))
            .collect();
        assert_eq!(texts, vec!["c1", "c2", "c3", "c4", ""]);
    }

    #[tokio::test]
    async fn test_failure_reaches_every_subscriber() {
        let cache = StreamCache::new();
        let (s1, claimed) = cache.subscribe_or_claim("k1");
        let generation = match claimed {
            Some(g) => g,
            None => panic!("first caller must claim"),
        };
        let (s2, _) = cache.subscribe_or_claim("k1");

        generation.publish(chunk("partial"));
        generation.publish(StreamEvent::Failed(RouterError::StreamStalled {
            model_id: "m".to_string(),
            stalled_for_ms: 10_000,
        }));
        generation.finish();
        cache.retire(&generation);

        for stream in [s1, s2] {
            let items = collect(stream).await;
            assert_eq!(items.len(), 2);
            assert!(items[0].is_ok());
            assert!(matches!(
                items[1],
                Err(RouterError::StreamStalled { .. })
            ));
        }
    }

    #[tokio::test]
    async fn test_retired_key_starts_fresh_generation() {
        let cache = StreamCache::new();
        let (s1, claimed) = cache.subscribe_or_claim("k1");
        let generation = match claimed {
            Some(g) => g,
            None => panic!("first caller must claim"),
        };
        generation.publish(done());
        generation.finish();
        cache.retire(&generation);
        drop(s1);

        let (_s2, claimed2) = cache.subscribe_or_claim("k1");
        assert!(
            claimed2.is_some(),
            "after retirement an identical request claims a brand-new generation"
        );
    }

    #[tokio::test]
    async fn test_retire_leaves_newer_generation_untouched() {
        let cache = StreamCache::new();
        let (_s1, claimed1) = cache.subscribe_or_claim("k1");
        let old = match claimed1 {
            Some(g) => g,
            None => panic!("first caller must claim"),
        };
        old.finish();
        cache.retire(&old);

        let (_s2, claimed2) = cache.subscribe_or_claim("k1");
        let newer = match claimed2 {
            Some(g) => g,
            None => panic!("fresh claim expected"),
        };

        // A stale retire of the old generation must not evict the new one.
        cache.retire(&old);
        assert_eq!(cache.in_flight(), 1);
        cache.retire(&newer);
        assert_eq!(cache.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_cancel_one_subscriber_leaves_other_attached() {
        let cache = StreamCache::new();
        let (s1, claimed) = cache.subscribe_or_claim("k1");
        let generation = match claimed {
            Some(g) => g,
            None => panic!("first caller must claim"),
        };
        let (mut s2, _) = cache.subscribe_or_claim("k1");
        assert_eq!(generation.subscriber_count(), 2);

        drop(s1);
        assert_eq!(generation.subscriber_count(), 1);

        // The remaining subscriber still receives live chunks.
        generation.publish(chunk("still flowing"));
        let item = s2.next_chunk().await;
        match item {
            Some(Ok(c)) => assert_eq!(c.text, "still flowing"),
            other => panic!("expected live chunk, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_last_subscriber_drop_signals_cancel() {
        let cache = StreamCache::new();
        let (s1, claimed) = cache.subscribe_or_claim("k1");
        let generation = match claimed {
            Some(g) => g,
            None => panic!("first caller must claim"),
        };

        drop(s1);
        // The permit is stored, so this resolves immediately even though the
        // drop happened before we started waiting.
        let waited = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            generation.cancelled(),
        )
        .await;
        assert!(waited.is_ok(), "cancel signal never arrived");
        assert_eq!(generation.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_drop_after_finish_does_not_signal_cancel() {
        let cache = StreamCache::new();
        let (s1, claimed) = cache.subscribe_or_claim("k1");
        let generation = match claimed {
            Some(g) => g,
            None => panic!("first caller must claim"),
        };
        generation.publish(done());
        generation.finish();
        drop(s1);

        // No permit should be stored; the wait must time out.
        let waited = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            generation.cancelled(),
        )
        .await;
        assert!(waited.is_err(), "finished generation must not see cancel");
    }

    #[tokio::test]
    async fn test_publish_after_finish_is_dropped() {
        let cache = StreamCache::new();
        let (s1, claimed) = cache.subscribe_or_claim("k1");
        let generation = match claimed {
            Some(g) => g,
            None => panic!("first caller must claim"),
        };
        generation.publish(done());
        generation.finish();
        generation.publish(chunk("late"));

        let items = collect(s1).await;
        assert_eq!(items.len(), 1, "post-finish publish must not be delivered");
    }
}
