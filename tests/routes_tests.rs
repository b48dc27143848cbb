//! HTTP adapter tests, driven through `tower::ServiceExt::oneshot`.

use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use provenance_ledger::{
    indexer::EventIndexer, integrity::IntegrityFacade, routes, source::MemoryEventSource,
    store::SqliteStore, AppState,
};
use serde_json::{json, Value};
use tower::ServiceExt;

fn app() -> (Router, Arc<MemoryEventSource>) {
    let source = Arc::new(MemoryEventSource::new());
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let state = AppState {
        integrity: Arc::new(IntegrityFacade::in_memory().unwrap()),
        indexer: Arc::new(EventIndexer::new(source.clone(), store)),
    };
    (routes::router(state), source)
}

async fn call(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::post(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn secure_list_verify_validate() {
    let (app, _) = app();

    let (status, body) = call(
        &app,
        post_json("/records", &json!({"type": "producteur", "nom": "Ferme Atlas"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let digest = body["digest"].as_str().unwrap().to_string();
    assert_eq!(digest.len(), 64);

    let (_, list) = call(&app, get("/records")).await;
    assert_eq!(list, json!([{"type": "producteur", "nom": "Ferme Atlas"}]));

    let (_, record) = call(&app, get("/records/1")).await;
    assert_eq!(record["nom"], "Ferme Atlas");

    let (status, _) = call(&app, get("/records/0")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, verify) = call(&app, get(&format!("/verify/{digest}"))).await;
    assert_eq!(verify["exists"], true);

    let (_, validate) = call(&app, get("/validate")).await;
    assert_eq!(validate, json!({"ok": true, "errors": []}));
}

#[tokio::test]
async fn non_object_record_is_bad_request() {
    let (app, _) = app();
    let (status, _) = call(&app, post_json("/records", &json!([1, 2, 3]))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn sync_reports_outcome() {
    let (app, source) = app();
    source.add_producer("P1", "Ferme Atlas", "Marrakech-Safi");

    let (status, body) = call(&app, Request::post("/sync").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["inserted"]["producers"], 1);
    assert_eq!(body["aborted"], false);

    source.set_unreachable(true);
    let (status, body) = call(&app, Request::post("/sync").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["errors"][0]["error"], "connectivity");
}

#[tokio::test]
async fn health_and_version() {
    let (app, _) = app();
    let (status, body) = call(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (_, body) = call(&app, get("/version")).await;
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}
