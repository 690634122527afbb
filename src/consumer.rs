//! Background loop keeping the vector store in step with content events.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::events::{ContentEvent, EventError, EventSource, RawEvent};
use crate::semantic::{embedding_input, index_snippet, Embedder, EmbeddingError};
use crate::store::{ContentId, StoreError, VectorStore};

const RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Why a single event was not indexed.
#[derive(Debug, thiserror::Error)]
pub enum HandleError {
    #[error(transparent)]
    Malformed(#[from] EventError),

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsumerState {
    Running,
    Terminated,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerStats {
    pub received: u64,
    pub indexed: u64,
    pub skipped: u64,
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    indexed: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
}

struct Shared {
    running: AtomicBool,
    counters: Counters,
}

/// Flips the shared state to terminated however the loop exits.
struct TerminateOnDrop(Arc<Shared>);

impl Drop for TerminateOnDrop {
    fn drop(&mut self) {
        self.0.running.store(false, Ordering::SeqCst);
    }
}

/// Read-only view of a running consumer, cheap to clone into request handlers.
#[derive(Clone)]
pub struct ConsumerStatus {
    shared: Arc<Shared>,
}

impl ConsumerStatus {
    pub fn state(&self) -> ConsumerState {
        if self.shared.running.load(Ordering::SeqCst) {
            ConsumerState::Running
        } else {
            ConsumerState::Terminated
        }
    }

    pub fn stats(&self) -> ConsumerStats {
        let counters = &self.shared.counters;
        ConsumerStats {
            received: counters.received.load(Ordering::Relaxed),
            indexed: counters.indexed.load(Ordering::Relaxed),
            skipped: counters.skipped.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
        }
    }
}

pub struct ConsumerHandle {
    status: ConsumerStatus,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl ConsumerHandle {
    pub fn status(&self) -> ConsumerStatus {
        self.status.clone()
    }

    /// Wait until the loop exits. Cancel safe.
    pub async fn wait(&mut self) {
        if let Some(task) = self.task.as_mut() {
            if let Err(err) = task.await {
                log::error!("consumer task panicked: {err}");
            }
            self.task = None;
        }
    }

    /// Wait for the loop to finish on its own (end of input or fatal error).
    pub async fn join(mut self) -> ConsumerStats {
        self.wait().await;
        self.status.stats()
    }

    /// Signal shutdown and wait for the in-flight event to finish.
    pub async fn stop(self) -> ConsumerStats {
        // A send error only means the loop already exited.
        let _ = self.shutdown.send(true);
        self.join().await
    }
}

#[derive(Clone)]
pub struct Consumer {
    embedder: Arc<Embedder>,
    store: Arc<dyn VectorStore>,
}

impl Consumer {
    pub fn new(embedder: Arc<Embedder>, store: Arc<dyn VectorStore>) -> Self {
        Self { embedder, store }
    }

    /// Parse, embed and upsert one payload.
    pub async fn handle(&self, payload: &[u8]) -> Result<ContentId, HandleError> {
        let event = ContentEvent::parse(payload)?;

        let text = embedding_input(&event.title, &event.content);
        let embedder = self.embedder.clone();
        let vector = tokio::task::block_in_place(move || embedder.embed(&text))?;

        self.store
            .upsert(
                event.content_id,
                &event.title,
                index_snippet(&event.content),
                vector,
            )
            .await?;

        Ok(event.content_id)
    }

    async fn process(&self, event: &RawEvent, counters: &Counters) {
        counters.received.fetch_add(1, Ordering::Relaxed);

        match self.handle(&event.payload).await {
            Ok(content_id) => {
                counters.indexed.fetch_add(1, Ordering::Relaxed);
                log::info!("Indexed post {}", content_id);
            }
            Err(HandleError::Malformed(err)) => {
                counters.skipped.fetch_add(1, Ordering::Relaxed);
                log::warn!("Skipping event at {}: {}", event.position, err);
            }
            Err(err) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                log::error!("Failed to index event at {}: {:#}", event.position, anyhow::Error::new(err));
            }
        }
    }

    async fn run<S: EventSource>(
        self,
        mut source: S,
        shared: Arc<Shared>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let _guard = TerminateOnDrop(shared.clone());
        log::info!("Consumer started ({} store)", self.store.backend_name());

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                next = source.next_event() => next,
            };

            match next {
                Ok(Some(event)) => {
                    self.process(&event, &shared.counters).await;
                    if let Err(err) = source.ack(&event).await {
                        log::error!("Failed to ack event at {}: {}", event.position, err);
                    }
                }
                Ok(None) => {
                    log::info!("Event source exhausted");
                    break;
                }
                Err(err) if err.is_retryable() => {
                    log::warn!("Event transport error, retrying in {:?}: {}", RETRY_BACKOFF, err);
                    tokio::select! {
                        biased;
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(RETRY_BACKOFF) => {}
                    }
                }
                Err(err) => {
                    log::error!("Event source failed: {}", err);
                    break;
                }
            }
        }

        let stats = ConsumerStatus { shared }.stats();
        log::info!(
            "Consumer stopped: {} received, {} indexed, {} skipped, {} failed",
            stats.received,
            stats.indexed,
            stats.skipped,
            stats.failed
        );
    }

    /// Start the loop on its own task.
    pub fn spawn<S>(self, source: S) -> ConsumerHandle
    where
        S: EventSource + 'static,
    {
        let shared = Arc::new(Shared {
            running: AtomicBool::new(true),
            counters: Counters::default(),
        });
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(source, shared.clone(), shutdown_rx));

        ConsumerHandle {
            status: ConsumerStatus { shared },
            shutdown,
            task: Some(task),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::channel::{channel_source, raw};
    use crate::store::LocalVectorStore;
    use crate::tests::hashing_embedder;

    fn consumer() -> (Consumer, Arc<LocalVectorStore>) {
        let store = Arc::new(LocalVectorStore::in_memory(64));
        let consumer = Consumer::new(Arc::new(hashing_embedder(64)), store.clone());
        (consumer, store)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_handle_indexes_with_index_snippet_bound() {
        let (consumer, store) = consumer();
        let long = "x".repeat(3000);
        let payload = format!(r#"{{"postId": 1, "title": "Long", "content": "{long}"}}"#);

        let id = consumer.handle(payload.as_bytes()).await.unwrap();
        assert_eq!(id, ContentId::new(1));

        let record = store.get_record(id).await.unwrap().unwrap();
        assert_eq!(record.title, "Long");
        assert_eq!(record.snippet.chars().count(), 500);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_handle_rejects_missing_id() {
        let (consumer, store) = consumer();
        let result = consumer.handle(br#"{"title": "x"}"#).await;
        assert!(matches!(result, Err(HandleError::Malformed(_))));
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_loop_survives_bad_events_and_acks_everything() {
        let (consumer, store) = consumer();
        let (tx, source) = channel_source();

        tx.send(Ok(raw("0", r#"{"postId": 1, "title": "a", "content": "one"}"#))).unwrap();
        tx.send(Ok(raw("1", r#"{"title": "x"}"#))).unwrap();
        tx.send(Ok(raw("2", "{broken"))).unwrap();
        tx.send(Err(EventError::Transport("rebalance".into()))).unwrap();
        tx.send(Ok(raw("3", r#"{"post_id": 2, "title": "b", "content": "two"}"#))).unwrap();
        drop(tx);

        let acked = source.acked.clone();
        let handle = consumer.spawn(source);
        let stats = handle.join().await;

        assert_eq!(
            stats,
            ConsumerStats {
                received: 4,
                indexed: 2,
                skipped: 2,
                failed: 0
            }
        );
        assert_eq!(store.count().await.unwrap(), 2);
        assert_eq!(*acked.lock().unwrap(), vec!["0", "1", "2", "3"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_store_failure_is_counted_not_fatal() {
        // Embedder dimension differs from the store, so every upsert is rejected.
        let store = Arc::new(LocalVectorStore::in_memory(8));
        let consumer = Consumer::new(Arc::new(hashing_embedder(16)), store.clone());
        let (tx, source) = channel_source();
        tx.send(Ok(raw("0", r#"{"postId": 1, "title": "a"}"#))).unwrap();
        tx.send(Ok(raw("1", r#"{"postId": 2, "title": "b"}"#))).unwrap();
        drop(tx);

        let stats = consumer.spawn(source).join().await;
        assert_eq!(stats.failed, 2);
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stop_terminates_idle_consumer() {
        let (consumer, _store) = consumer();
        let (tx, source) = channel_source();

        let handle = consumer.spawn(source);
        let status = handle.status();
        assert_eq!(status.state(), ConsumerState::Running);

        let stats = handle.stop().await;
        assert_eq!(stats, ConsumerStats::default());
        assert_eq!(status.state(), ConsumerState::Terminated);
        drop(tx);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_fatal_source_error_terminates() {
        let (consumer, _store) = consumer();
        let (tx, source) = channel_source();
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "closed");
        tx.send(Err(EventError::Io(io))).unwrap();

        let handle = consumer.spawn(source);
        let status = handle.status();
        handle.join().await;
        assert_eq!(status.state(), ConsumerState::Terminated);
        drop(tx);
    }
}
