use corral_client::{RetryPolicy, StoreClient};
use corral_core::domain::{ExecutionSpec, ResourceConstraints, SchedulingHints, WorkItemState};
use corral_core::dto::request::CreateRequest;
use corral_core::dto::work_item::{RecordEvent, StateReport};
use corral_core::{StoreError, WorkItemApi};
use corral_store::{Store, create_router};
use std::collections::BTreeMap;
use std::time::Duration;

/// Serves a fresh in-memory store on an ephemeral port
async fn spawn_store() -> StoreClient {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = create_router(Store::in_memory());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    StoreClient::new(format!("http://{}", addr))
        .with_retry(RetryPolicy::new(2, Duration::from_millis(10)))
}

fn create(priority: i64) -> CreateRequest {
    CreateRequest {
        name: Some("client-test".to_string()),
        priority: Some(priority),
        runtime_constraints: ResourceConstraints {
            vcpus: 1,
            ram_bytes: 1 << 20,
            scratch_bytes: 0,
            gpus: None,
        },
        scheduling: SchedulingHints::default(),
        spec: ExecutionSpec {
            command: vec!["true".to_string()],
            container_image: "acbd18db4cc2f85cedef654fccc4a4d8+3".to_string(),
            cwd: "/".to_string(),
            environment: BTreeMap::new(),
            mounts: BTreeMap::new(),
            output_path: "/out".to_string(),
        },
        requesting_work_item_id: None,
        use_existing: true,
        commit: true,
    }
}

#[tokio::test]
async fn test_full_lifecycle_over_http() {
    let client = spawn_store().await;

    let request = client.create_request(create(4)).await.unwrap();
    let item_id = request.work_item_id.unwrap();

    let queued = client
        .list_work_items(&[WorkItemState::Queued])
        .await
        .unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].priority, 4);

    let locked = client.lock(item_id, "runner-1").await.unwrap();
    assert_eq!(locked.locked_by.as_deref(), Some("runner-1"));

    let err = client.lock(item_id, "runner-2").await.unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)));

    client
        .report_state(item_id, StateReport::running("runner-1"))
        .await
        .unwrap();
    client
        .record_event(item_id, RecordEvent::new("node-info", "cpu: 4"))
        .await
        .unwrap();
    let done = client
        .report_state(item_id, StateReport::complete("runner-1", 0, None, None))
        .await
        .unwrap();
    assert_eq!(done.state, WorkItemState::Complete);

    let events = client.list_events(item_id).await.unwrap();
    assert_eq!(events.len(), 1);

    let err = client
        .report_state(item_id, StateReport::cancelled(None))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidState(_)));
}

#[tokio::test]
async fn test_priority_edits_over_http() {
    let client = spawn_store().await;

    let request = client.create_request(create(2)).await.unwrap();
    let updated = client.set_priority(request.id, 8).await.unwrap();
    assert_eq!(updated.priority, Some(8));

    let item = client
        .get_work_item(request.work_item_id.unwrap())
        .await
        .unwrap();
    assert_eq!(item.priority, 8);

    let cancelled = client.cancel_request(request.id).await.unwrap();
    assert_eq!(cancelled.priority, Some(0));
    client.force_sweep().await.unwrap();
}

#[tokio::test]
async fn test_missing_work_item_is_not_found() {
    let client = spawn_store().await;
    let err = client.get_work_item(uuid::Uuid::new_v4()).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_unreachable_store_is_unavailable() {
    let client = StoreClient::new("http://127.0.0.1:1")
        .with_retry(RetryPolicy::new(2, Duration::from_millis(1)));
    let err = client.list_work_items(&[]).await.unwrap_err();
    assert!(err.is_transient());
}
