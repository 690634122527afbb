//! End-to-end flows: events through the consumer into a store, read back via
//! the query service.

use std::sync::Arc;

use crate::consumer::Consumer;
use crate::events::JsonlSource;
use crate::query::QueryService;
use crate::semantic::{Embedder, PRESENTED_SNIPPET_CHARS, STORED_SNIPPET_CHARS};
use crate::store::{ContentId, IvfSettings, LocalVectorStore, StoreError, VectorStore};
use crate::tests::hashing_embedder;

const DIMS: usize = 64;

struct Harness {
    store: Arc<LocalVectorStore>,
    consumer: Consumer,
    query: QueryService,
}

fn harness_with(embedder: Embedder, store: LocalVectorStore) -> Harness {
    let embedder = Arc::new(embedder);
    let store = Arc::new(store);
    Harness {
        consumer: Consumer::new(embedder.clone(), store.clone()),
        query: QueryService::new(embedder, store.clone()),
        store,
    }
}

fn harness() -> Harness {
    harness_with(hashing_embedder(DIMS), LocalVectorStore::in_memory(DIMS))
}

fn event(id: i64, title: &str, content: &str) -> Vec<u8> {
    serde_json::json!({ "postId": id, "title": title, "content": content })
        .to_string()
        .into_bytes()
}

/// Scenario A with the production model.
#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires model download"]
async fn test_semantic_match_with_real_model() {
    let models = tempfile::tempdir().unwrap();
    let embedder = Embedder::fastembed("all-MiniLM-L6-v2", models.path().to_path_buf(), 384);
    let h = harness_with(embedder, LocalVectorStore::in_memory(384));

    h.consumer
        .handle(&event(1, "Rust ownership", "borrow checker explained"))
        .await
        .unwrap();
    h.consumer
        .handle(&event(2, "Sourdough starter", "feeding schedule for wild yeast"))
        .await
        .unwrap();

    let response = h.query.search("memory safety", Some(5)).await.unwrap();
    let hit = response.results.iter().find(|hit| hit.post_id == 1).unwrap();
    assert!(hit.score > 0.0);
    assert_eq!(response.results[0].post_id, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_indexed_event_is_searchable() {
    let h = harness();
    h.consumer
        .handle(&event(1, "Rust ownership", "borrow checker explained"))
        .await
        .unwrap();

    let response = h.query.search("how does the borrow checker work", Some(5)).await.unwrap();
    assert!(!response.results.is_empty());
    assert_eq!(response.results[0].post_id, 1);
    assert!(response.results[0].score > 0.0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_related_for_unknown_post_is_empty() {
    let h = harness();
    h.consumer.handle(&event(1, "a", "b")).await.unwrap();

    let response = h.query.related(999, None).await.unwrap();
    let json = serde_json::to_value(&response).unwrap();
    assert_eq!(json, serde_json::json!({"postId": 999, "results": []}));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_snippet_bounds_at_storage_and_presentation() {
    let h = harness();
    let long = "lorem ".repeat(500);
    assert_eq!(long.chars().count(), 3000);

    // Straight to the store to exercise the storage bound.
    let vector = hashing_embedder(DIMS).embed(&long).unwrap();
    h.store
        .upsert(ContentId::new(1), "long", &long, vector)
        .await
        .unwrap();

    let record = h.store.get_record(ContentId::new(1)).await.unwrap().unwrap();
    assert_eq!(record.snippet.chars().count(), STORED_SNIPPET_CHARS);

    let response = h.query.search("lorem", Some(1)).await.unwrap();
    assert_eq!(response.results[0].snippet.chars().count(), PRESENTED_SNIPPET_CHARS);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_malformed_event_is_skipped_and_stream_continues() {
    let h = harness();
    let input = "{\"title\": \"x\"}\n{\"postId\": 2, \"title\": \"after\", \"content\": \"still indexed\"}\n";
    let source = JsonlSource::from_reader(tokio::io::BufReader::new(input.as_bytes()), "mem".into());

    let stats = h.consumer.clone().spawn(source).join().await;
    assert_eq!(stats.skipped, 1);
    assert_eq!(stats.indexed, 1);
    assert_eq!(h.store.count().await.unwrap(), 1);
    assert!(h.store.get_vector(ContentId::new(2)).await.unwrap().is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_non_utf8_line_is_skipped_and_replay_continues() {
    let h = harness();
    let mut input = Vec::new();
    input.extend_from_slice(b"{\"postId\": 1, \"title\": \"first\", \"content\": \"ok\"}\n");
    input.extend_from_slice(b"{\"postId\": 2, \"title\": \"\xff\xfe\", \"content\": \"bad\"}\n");
    input.extend_from_slice(b"{\"postId\": 3, \"title\": \"third\", \"content\": \"ok\"}\n");
    let source = JsonlSource::from_reader(std::io::Cursor::new(input), "mem".into());

    let stats = h.consumer.clone().spawn(source).join().await;
    assert_eq!(stats.received, 3);
    assert_eq!(stats.indexed, 2);
    assert_eq!(stats.skipped, 1);
    assert_eq!(h.store.count().await.unwrap(), 2);
    assert!(h.store.get_vector(ContentId::new(3)).await.unwrap().is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_second_event_replaces_record() {
    let h = harness();
    h.consumer.handle(&event(1, "first title", "old body")).await.unwrap();
    let first = h.store.get_record(ContentId::new(1)).await.unwrap().unwrap();

    h.consumer.handle(&event(1, "second title", "new body")).await.unwrap();
    let second = h.store.get_record(ContentId::new(1)).await.unwrap().unwrap();

    assert_eq!(h.store.count().await.unwrap(), 1);
    assert_eq!(second.title, "second title");
    assert_eq!(second.snippet, "new body");
    assert_eq!(second.created_at, first.created_at);
    assert!(second.updated_at >= first.updated_at);
    assert_ne!(second.embedding, first.embedding);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_related_never_contains_itself() {
    let h = harness();
    let topics = [
        "rust borrow checker",
        "rust async runtime",
        "python asyncio loop",
        "gardening tomatoes",
        "rust borrow checker",
        "sourdough bread",
    ];
    for (i, topic) in topics.iter().enumerate() {
        h.consumer
            .handle(&event(i as i64 + 1, topic, topic))
            .await
            .unwrap();
    }

    for id in 1..=topics.len() as i64 {
        let response = h.query.related(id, Some(20)).await.unwrap();
        assert!(response.results.len() <= 20);
        assert_eq!(response.results.len(), topics.len() - 1);
        assert!(response.results.iter().all(|hit| hit.post_id != id));
        for pair in response.results.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_wrong_dimension_is_rejected() {
    let h = harness();
    let result = h
        .store
        .upsert(ContentId::new(1), "t", "s", vec![1.0; DIMS + 1])
        .await;
    assert!(matches!(
        result,
        Err(StoreError::DimensionMismatch { expected: DIMS, got })  if got == DIMS + 1
    ));
    assert_eq!(h.store.count().await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_local_store_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vectors.bin");

    {
        let store = LocalVectorStore::open(path.clone(), "hashing", DIMS, IvfSettings::default());
        let h = harness_with(hashing_embedder(DIMS), store);
        h.store.init().await.unwrap();
        h.consumer.handle(&event(7, "persisted", "across restarts")).await.unwrap();
    }

    let store = LocalVectorStore::open(path, "hashing", DIMS, IvfSettings::default());
    let h = harness_with(hashing_embedder(DIMS), store);
    h.store.init().await.unwrap();

    let response = h.query.search("persisted across restarts", Some(1)).await.unwrap();
    assert_eq!(response.results[0].post_id, 7);
}
