use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use crate::consumer::Consumer;
use crate::events::JsonlSource;
use crate::query::QueryService;
use crate::semantic::{Embedder, EmbeddingError, TextEmbedder};
use crate::store::{ContentId, LocalVectorStore, VectorStore};
use crate::tests::hashing_embedder;
use crate::web::{router, SharedState};

const DIMS: usize = 32;

async fn app_with(items: &[(i64, &str, &str)]) -> Router {
    let embedder = Arc::new(hashing_embedder(DIMS));
    let store = Arc::new(LocalVectorStore::in_memory(DIMS));
    for (id, title, content) in items {
        let vector = embedder.embed(&format!("{} {}", title, content)).unwrap();
        store.upsert(ContentId::new(*id), title, content, vector).await.unwrap();
    }
    router(SharedState {
        query: QueryService::new(embedder, store),
        consumer: None,
    })
}

async fn get(app: Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_search_endpoint() {
    let app = app_with(&[(1, "rust ownership", "borrow checker"), (2, "bread", "flour water")]).await;

    let (status, body) = get(app, "/api/search?q=rust%20borrow&limit=5").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["query"], "rust borrow");
    let results = body["results"].as_array().unwrap();
    assert!(!results.is_empty() && results.len() <= 5);
    assert_eq!(results[0]["postId"], 1);
    assert!(results[0]["score"].as_f64().unwrap() > 0.0);
    assert!(results[0]["title"].is_string());
    assert!(results[0]["snippet"].is_string());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_search_default_limit_is_ten() {
    let items: Vec<(i64, String)> = (1..=15).map(|i| (i, format!("post number {i}"))).collect();
    let refs: Vec<(i64, &str, &str)> = items.iter().map(|(i, t)| (*i, t.as_str(), "")).collect();
    let app = app_with(&refs).await;

    let (status, body) = get(app, "/api/search?q=post").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["results"].as_array().unwrap().len(), 10);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_search_rejects_bad_params() {
    for uri in [
        "/api/search",
        "/api/search?q=",
        "/api/search?q=rust&limit=0",
        "/api/search?q=rust&limit=51",
        "/api/search?q=rust&limit=ten",
        "/api/search/related",
        "/api/search/related?post_id=0",
        "/api/search/related?post_id=abc",
        "/api/search/related?post_id=1&limit=21",
    ] {
        let (status, body) = get(app_with(&[]).await, uri).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY, "{uri}");
        assert!(body["error"].is_string(), "{uri}");
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_related_endpoint() {
    let app = app_with(&[
        (1, "rust ownership", "borrow checker"),
        (2, "rust lifetimes", "borrow checker"),
        (3, "bread", "flour water"),
    ])
    .await;

    let (status, body) = get(app.clone(), "/api/search/related?post_id=1&limit=1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["postId"], 1);
    let results = body["results"].as_array().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["postId"], 2);

    let (status, body) = get(app, "/api/search/related?post_id=999").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, serde_json::json!({"postId": 999, "results": []}));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_health_reports_model_state() {
    let (status, body) = get(app_with(&[]).await, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, serde_json::json!({"status": "UP"}));

    let broken = Arc::new(Embedder::with_loader("broken", DIMS, || {
        Err(EmbeddingError::ModelUnavailable("no weights".into()))
    }));
    let app = router(SharedState {
        query: QueryService::new(broken, Arc::new(LocalVectorStore::in_memory(DIMS))),
        consumer: None,
    });
    let (status, body) = get(app.clone(), "/health").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "DOWN");

    let (status, _) = get(app, "/api/search?q=anything").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stats_endpoint() {
    let (status, body) = get(app_with(&[(1, "a", "b")]).await, "/api/search/stats").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, serde_json::json!({"indexed": 1, "consumer": "disabled"}));

    let embedder = Arc::new(hashing_embedder(DIMS));
    let store: Arc<dyn VectorStore> = Arc::new(LocalVectorStore::in_memory(DIMS));
    let source = JsonlSource::from_reader(
        tokio::io::BufReader::new(&b"{\"postId\": 4, \"title\": \"x\"}\n"[..]),
        "mem".into(),
    );
    let mut handle = Consumer::new(embedder.clone(), store.clone()).spawn(source);
    handle.wait().await;

    let app = router(SharedState {
        query: QueryService::new(embedder, store),
        consumer: Some(handle.status()),
    });
    let (_, body) = get(app, "/api/search/stats").await;
    assert_eq!(body, serde_json::json!({"indexed": 1, "consumer": "terminated"}));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cors_headers_present() {
    let app = app_with(&[]).await;
    let response = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .header("origin", "http://localhost:3000")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert!(response
        .headers()
        .contains_key("access-control-allow-origin"));
}

/// Backend that always fails after loading, for the 500 path.
struct FailingBackend;

impl TextEmbedder for FailingBackend {
    fn dimensions(&self) -> usize {
        DIMS
    }

    fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Err(EmbeddingError::EmbeddingFailed("inference crashed".into()))
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_embedding_failure_is_500() {
    let app = router(SharedState {
        query: QueryService::new(
            Arc::new(Embedder::with_backend("failing", FailingBackend)),
            Arc::new(LocalVectorStore::in_memory(DIMS)),
        ),
        consumer: None,
    });
    let (status, body) = get(app, "/api/search?q=rust").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"].as_str().unwrap().contains("inference crashed"));
}
