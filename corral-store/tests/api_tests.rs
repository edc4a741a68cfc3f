use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use corral_store::{Store, create_router};

fn create_test_app() -> Router {
    create_router(Store::in_memory())
}

fn request_body(priority: i64, commit: bool) -> Value {
    json!({
        "priority": priority,
        "runtime_constraints": { "vcpus": 1, "ram_bytes": 1048576 },
        "spec": {
            "command": ["echo", "hello"],
            "container_image": "acbd18db4cc2f85cedef654fccc4a4d8+3",
            "output_path": "/out"
        },
        "commit": commit
    })
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

#[tokio::test]
async fn test_health_endpoint() {
    let app = create_test_app();
    let (status, _) = send(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_create_and_commit_request() {
    let app = create_test_app();

    let (status, created) = send(&app, "POST", "/requests", Some(request_body(3, false))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["state"], "Uncommitted");
    let id = created["id"].as_str().unwrap().to_string();

    let (status, committed) = send(&app, "POST", &format!("/requests/{}/commit", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(committed["state"], "Committed");
    let item_id = committed["work_item_id"].as_str().unwrap().to_string();

    let (status, item) = send(&app, "GET", &format!("/work_items/{}", item_id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(item["state"], "Queued");
    assert_eq!(item["priority"], 3);

    let (status, _) = send(&app, "POST", &format!("/requests/{}/commit", id), None).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_lock_lifecycle_over_http() {
    let app = create_test_app();

    let (_, created) = send(&app, "POST", "/requests", Some(request_body(2, true))).await;
    let item_id = created["work_item_id"].as_str().unwrap().to_string();

    let (status, queued) = send(&app, "GET", "/work_items?states=Queued", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(queued.as_array().unwrap().len(), 1);

    let lock = json!({ "identity": "dispatch-1" });
    let (status, locked) = send(
        &app,
        "POST",
        &format!("/work_items/{}/lock", item_id),
        Some(lock.clone()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(locked["state"], "Locked");
    assert_eq!(locked["locked_by"], "dispatch-1");

    let (status, body) = send(
        &app,
        "POST",
        &format!("/work_items/{}/lock", item_id),
        Some(json!({ "identity": "dispatch-2" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].is_string());

    let (status, running) = send(
        &app,
        "POST",
        &format!("/work_items/{}/state", item_id),
        Some(json!({ "state": "Running", "identity": "dispatch-1" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(running["state"], "Running");

    let (status, done) = send(
        &app,
        "POST",
        &format!("/work_items/{}/state", item_id),
        Some(json!({
            "state": "Complete",
            "identity": "dispatch-1",
            "exit_code": 0,
            "output": "d41d8cd98f00b204e9800998ecf8427e+0"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(done["state"], "Complete");
    assert_eq!(done["exit_code"], 0);
}

#[tokio::test]
async fn test_events_round_trip() {
    let app = create_test_app();

    let (_, created) = send(&app, "POST", "/requests", Some(request_body(1, true))).await;
    let item_id = created["work_item_id"].as_str().unwrap().to_string();
    let uri = format!("/work_items/{}/events", item_id);

    let (status, _) = send(
        &app,
        "POST",
        &uri,
        Some(json!({ "event_type": "dispatch", "text": "sbatch failed" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, events) = send(&app, "GET", &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(events[0]["event_type"], "dispatch");
    assert_eq!(events[0]["text"], "sbatch failed");
}

#[tokio::test]
async fn test_error_statuses() {
    let app = create_test_app();

    let missing = uuid::Uuid::new_v4();
    let (status, body) = send(&app, "GET", &format!("/work_items/{}", missing), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("not found"));

    let (status, _) = send(&app, "POST", "/requests", Some(request_body(-4, true))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&app, "GET", "/work_items?states=Sleeping", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_forced_sweep() {
    let app = create_test_app();
    let (status, body) = send(&app, "POST", "/sweep", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["examined"], 0);
}
