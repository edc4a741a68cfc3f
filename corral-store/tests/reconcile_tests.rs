use async_trait::async_trait;
use corral_core::WorkItemApi;
use corral_core::domain::{
    Event, ExecutionSpec, Request, RequestState, ResourceConstraints, SchedulingHints, WorkItem,
    WorkItemState,
};
use corral_core::dto::request::CreateRequest;
use corral_core::dto::work_item::StateReport;
use corral_core::error::StoreError;
use corral_store::Store;
use corral_store::repository::{
    MemoryRepository, PriorityChange, Repository, Result as RepoResult, Transition,
};
use corral_store::service::work_item_service;
use corral_store::service::request::RequestError;
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use uuid::Uuid;

fn spec(tag: &str) -> ExecutionSpec {
    ExecutionSpec {
        command: vec!["echo".to_string(), tag.to_string()],
        container_image: "d41d8cd98f00b204e9800998ecf8427e+0".to_string(),
        cwd: "/".to_string(),
        environment: BTreeMap::new(),
        mounts: BTreeMap::new(),
        output_path: "/out".to_string(),
    }
}

fn committed(tag: &str, priority: i64) -> CreateRequest {
    CreateRequest {
        name: Some(tag.to_string()),
        priority: Some(priority),
        runtime_constraints: ResourceConstraints {
            vcpus: 2,
            ram_bytes: 30,
            scratch_bytes: 0,
            gpus: None,
        },
        scheduling: SchedulingHints::default(),
        spec: spec(tag),
        requesting_work_item_id: None,
        use_existing: true,
        commit: true,
    }
}

async fn run_to_running(store: &Store, id: Uuid, identity: &str) {
    store.lock(id, identity).await.unwrap();
    store
        .report_state(id, StateReport::running(identity))
        .await
        .unwrap();
}

// =============================================================================
// Priority derivation
// =============================================================================

#[tokio::test]
async fn test_commit_creates_work_item_and_priority_follows_request() {
    let store = Store::in_memory();

    let request = store.create_request(committed("a", 1)).await.unwrap();
    assert_eq!(request.state, RequestState::Committed);
    let item_id = request.work_item_id.unwrap();

    let item = store.get_work_item(item_id).await.unwrap();
    assert_eq!(item.state, WorkItemState::Queued);
    assert_eq!(item.priority, 1);
    assert_eq!(item.runtime_constraints.vcpus, 2);
    assert_eq!(item.runtime_constraints.ram_bytes, 30);

    store.set_priority(request.id, 0).await.unwrap();
    let item = store.get_work_item(item_id).await.unwrap();
    assert_eq!(item.priority, 0);
    assert_eq!(item.state, WorkItemState::Cancelled);
}

#[tokio::test]
async fn test_reused_work_item_takes_max_priority() {
    let store = Store::in_memory();

    let low = store.create_request(committed("shared", 5)).await.unwrap();
    let high = store.create_request(committed("shared", 10)).await.unwrap();
    assert_eq!(low.work_item_id, high.work_item_id);

    let item_id = low.work_item_id.unwrap();
    assert_eq!(store.get_work_item(item_id).await.unwrap().priority, 10);

    store.set_priority(high.id, 0).await.unwrap();
    let item = store.get_work_item(item_id).await.unwrap();
    assert_eq!(item.priority, 5);
    assert_eq!(item.state, WorkItemState::Queued);
}

#[tokio::test]
async fn test_use_existing_false_creates_separate_item() {
    let store = Store::in_memory();

    let first = store.create_request(committed("dup", 3)).await.unwrap();
    let mut req = committed("dup", 3);
    req.use_existing = false;
    let second = store.create_request(req).await.unwrap();

    assert_ne!(first.work_item_id, second.work_item_id);
}

#[tokio::test]
async fn test_commit_at_priority_zero_stays_queued() {
    let store = Store::in_memory();

    let request = store.create_request(committed("idle", 0)).await.unwrap();
    let item = store
        .get_work_item(request.work_item_id.unwrap())
        .await
        .unwrap();
    assert_eq!(item.state, WorkItemState::Queued);
    assert_eq!(item.priority, 0);
}

#[tokio::test]
async fn test_negative_priority_rejected() {
    let store = Store::in_memory();

    let err = store.create_request(committed("neg", -1)).await.unwrap_err();
    assert!(matches!(err, RequestError::ValidationError(_)));

    let request = store.create_request(committed("pos", 2)).await.unwrap();
    let err = store.set_priority(request.id, -5).await.unwrap_err();
    assert!(matches!(err, RequestError::ValidationError(_)));
}

#[tokio::test]
async fn test_commit_requires_uncommitted_and_priority() {
    let store = Store::in_memory();

    let mut req = committed("draft", 1);
    req.commit = false;
    req.priority = None;
    let draft = store.create_request(req).await.unwrap();
    assert_eq!(draft.state, RequestState::Uncommitted);
    assert!(matches!(
        store.commit(draft.id).await.unwrap_err(),
        RequestError::ValidationError(_)
    ));

    store.set_priority(draft.id, 4).await.unwrap();
    let committed = store.commit(draft.id).await.unwrap();
    assert_eq!(committed.state, RequestState::Committed);
    assert!(matches!(
        store.commit(draft.id).await.unwrap_err(),
        RequestError::InvalidState(_)
    ));
}

// =============================================================================
// Cancellation and cascades
// =============================================================================

#[tokio::test]
async fn test_cancel_request_cancels_sole_work_item() {
    let store = Store::in_memory();

    let request = store.create_request(committed("c", 4)).await.unwrap();
    let cancelled = store.cancel_request(request.id).await.unwrap();
    assert_eq!(cancelled.state, RequestState::Final);
    assert_eq!(cancelled.priority, Some(0));

    let item = store
        .get_work_item(request.work_item_id.unwrap())
        .await
        .unwrap();
    assert_eq!(item.state, WorkItemState::Cancelled);

    // Cancelling again is a no-op
    let again = store.cancel_request(request.id).await.unwrap();
    assert_eq!(again.state, RequestState::Final);
}

#[tokio::test]
async fn test_locked_item_is_cancelled_on_unlock_at_priority_zero() {
    let store = Store::in_memory();

    let request = store.create_request(committed("u", 3)).await.unwrap();
    let item_id = request.work_item_id.unwrap();
    store.lock(item_id, "dispatch-1").await.unwrap();

    store.set_priority(request.id, 0).await.unwrap();
    let item = store.get_work_item(item_id).await.unwrap();
    assert_eq!(item.state, WorkItemState::Locked);
    assert_eq!(item.priority, 0);

    let item = store.unlock(item_id, "dispatch-1").await.unwrap();
    assert_eq!(item.state, WorkItemState::Cancelled);
}

#[tokio::test]
async fn test_completion_finalizes_requests_and_cancels_children() {
    let store = Store::in_memory();

    let parent = store.create_request(committed("parent", 5)).await.unwrap();
    let parent_item = parent.work_item_id.unwrap();
    run_to_running(&store, parent_item, "runner-1").await;

    let mut child_req = committed("child", 5);
    child_req.requesting_work_item_id = Some(parent_item);
    let child = store.create_request(child_req).await.unwrap();
    let child_item = child.work_item_id.unwrap();
    assert_eq!(store.get_work_item(child_item).await.unwrap().priority, 5);

    store
        .report_state(
            parent_item,
            StateReport::complete("runner-1", 0, Some("out+1".to_string()), None),
        )
        .await
        .unwrap();

    let parent = store.get_request(parent.id).await.unwrap();
    assert_eq!(parent.state, RequestState::Final);
    assert_eq!(parent.priority, Some(5));

    let child = store.get_request(child.id).await.unwrap();
    assert_eq!(child.priority, Some(0));
    let child_item = store.get_work_item(child_item).await.unwrap();
    assert_eq!(child_item.state, WorkItemState::Cancelled);
    assert_eq!(child_item.priority, 0);
}

#[tokio::test]
async fn test_cancel_report_finalizes_requests_and_zeroes_children() {
    let store = Store::in_memory();

    let first = store.create_request(committed("cancel-parent", 5)).await.unwrap();
    let second = store.create_request(committed("cancel-parent", 3)).await.unwrap();
    let parent_item = first.work_item_id.unwrap();
    assert_eq!(second.work_item_id, Some(parent_item));
    run_to_running(&store, parent_item, "runner-1").await;

    let mut child_req = committed("cancel-child", 6);
    child_req.requesting_work_item_id = Some(parent_item);
    let child = store.create_request(child_req).await.unwrap();
    let child_item = child.work_item_id.unwrap();

    store
        .report_state(parent_item, StateReport::cancelled(Some("runner-1".to_string())))
        .await
        .unwrap();

    for id in [first.id, second.id] {
        let request = store.get_request(id).await.unwrap();
        assert_eq!(request.state, RequestState::Final);
        assert_eq!(request.priority, Some(0));
    }

    let child = store.get_request(child.id).await.unwrap();
    assert_eq!(child.priority, Some(0));
    assert_eq!(child.state, RequestState::Final);
    let child_item = store.get_work_item(child_item).await.unwrap();
    assert_eq!(child_item.state, WorkItemState::Cancelled);
    assert_eq!(child_item.priority, 0);
}

#[tokio::test]
async fn test_request_from_finished_work_item_gets_priority_zero() {
    let store = Store::in_memory();

    let parent = store.create_request(committed("done", 5)).await.unwrap();
    let parent_item = parent.work_item_id.unwrap();
    store.cancel_request(parent.id).await.unwrap();

    let mut late = committed("late-child", 8);
    late.requesting_work_item_id = Some(parent_item);
    let late = store.create_request(late).await.unwrap();
    assert_eq!(late.priority, Some(0));
}

#[tokio::test]
async fn test_commit_reuses_completed_result() {
    let store = Store::in_memory();

    let first = store.create_request(committed("cached", 2)).await.unwrap();
    let item_id = first.work_item_id.unwrap();
    run_to_running(&store, item_id, "runner-1").await;
    store
        .report_state(
            item_id,
            StateReport::complete("runner-1", 0, Some("abc+3".to_string()), None),
        )
        .await
        .unwrap();

    let second = store.create_request(committed("cached", 9)).await.unwrap();
    assert_eq!(second.work_item_id, Some(item_id));
    assert_eq!(second.state, RequestState::Final);
}

// =============================================================================
// Locking and state reports
// =============================================================================

#[tokio::test]
async fn test_lock_requires_positive_priority() {
    let store = Store::in_memory();

    let request = store.create_request(committed("zero", 0)).await.unwrap();
    let err = store
        .lock(request.work_item_id.unwrap(), "dispatch-1")
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidState(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_lock_has_single_winner() {
    let store = Store::in_memory();
    let request = store.create_request(committed("race", 1)).await.unwrap();
    let item_id = request.work_item_id.unwrap();

    let mut handles = Vec::new();
    for i in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store.lock(item_id, &format!("dispatch-{}", i)).await
        }));
    }

    let mut winners = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => winners += 1,
            Err(err) => assert!(err.is_conflict(), "unexpected error: {:?}", err),
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn test_state_reports_enforce_lock_holder() {
    let store = Store::in_memory();
    let request = store.create_request(committed("holder", 1)).await.unwrap();
    let item_id = request.work_item_id.unwrap();
    store.lock(item_id, "runner-a").await.unwrap();

    let err = store
        .report_state(item_id, StateReport::running("runner-b"))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)));

    let err = store.unlock(item_id, "runner-b").await.unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)));

    store
        .report_state(item_id, StateReport::running("runner-a"))
        .await
        .unwrap();

    let mut no_code = StateReport::complete("runner-a", 0, None, None);
    no_code.exit_code = None;
    let err = store.report_state(item_id, no_code).await.unwrap_err();
    assert!(matches!(err, StoreError::Validation(_)));
}

#[tokio::test]
async fn test_terminal_work_item_rejects_reports() {
    let store = Store::in_memory();
    let request = store.create_request(committed("term", 1)).await.unwrap();
    let item_id = request.work_item_id.unwrap();

    store
        .report_state(item_id, StateReport::cancelled(None))
        .await
        .unwrap();
    let err = store
        .report_state(item_id, StateReport::cancelled(None))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidState(_)));

    let err = store.get_work_item(Uuid::new_v4()).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_list_work_items_by_state_orders_by_priority() {
    let store = Store::in_memory();
    store.create_request(committed("low", 1)).await.unwrap();
    store.create_request(committed("high", 9)).await.unwrap();
    let locked = store.create_request(committed("locked", 5)).await.unwrap();
    store
        .lock(locked.work_item_id.unwrap(), "dispatch-1")
        .await
        .unwrap();

    let queued = store
        .list_work_items(&[WorkItemState::Queued])
        .await
        .unwrap();
    let priorities: Vec<i64> = queued.iter().map(|item| item.priority).collect();
    assert_eq!(priorities, vec![9, 1]);

    let all = store.list_work_items(&[]).await.unwrap();
    assert_eq!(all.len(), 3);
}

// =============================================================================
// Commit racing the priority sweep
// =============================================================================

/// Runs a full priority sweep around every write, the worst interleaving a
/// background sweeper can produce against a single commit
struct SweepingRepository {
    inner: MemoryRepository,
    examined: AtomicUsize,
}

impl SweepingRepository {
    async fn sweep(&self) {
        let count = work_item_service::sweep_priorities(&self.inner).await.unwrap();
        self.examined.fetch_add(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl Repository for SweepingRepository {
    async fn insert_request(&self, request: &Request) -> RepoResult<()> {
        self.inner.insert_request(request).await
    }

    async fn update_request(&self, request: &Request) -> RepoResult<()> {
        self.sweep().await;
        self.inner.update_request(request).await?;
        self.sweep().await;
        Ok(())
    }

    async fn find_request(&self, id: Uuid) -> RepoResult<Option<Request>> {
        self.inner.find_request(id).await
    }

    async fn find_committed_requests_for(&self, work_item_id: Uuid) -> RepoResult<Vec<Request>> {
        self.inner.find_committed_requests_for(work_item_id).await
    }

    async fn find_committed_children_of(&self, work_item_id: Uuid) -> RepoResult<Vec<Request>> {
        self.inner.find_committed_children_of(work_item_id).await
    }

    async fn attach_request(&self, request: &Request, new_item: Option<&WorkItem>) -> RepoResult<()> {
        self.sweep().await;
        self.inner.attach_request(request, new_item).await?;
        self.sweep().await;
        Ok(())
    }

    async fn insert_work_item(&self, item: &WorkItem) -> RepoResult<()> {
        self.sweep().await;
        self.inner.insert_work_item(item).await?;
        self.sweep().await;
        Ok(())
    }

    async fn find_work_item(&self, id: Uuid) -> RepoResult<Option<WorkItem>> {
        self.inner.find_work_item(id).await
    }

    async fn find_reusable_work_item(&self, fingerprint: &str) -> RepoResult<Option<WorkItem>> {
        self.inner.find_reusable_work_item(fingerprint).await
    }

    async fn list_work_items(&self, states: &[WorkItemState]) -> RepoResult<Vec<WorkItem>> {
        self.inner.list_work_items(states).await
    }

    async fn transition_work_item(
        &self,
        id: Uuid,
        expected: WorkItemState,
        transition: &Transition,
    ) -> RepoResult<Option<WorkItem>> {
        self.inner.transition_work_item(id, expected, transition).await
    }

    async fn recompute_priority(&self, id: Uuid) -> RepoResult<Option<PriorityChange>> {
        self.inner.recompute_priority(id).await
    }

    async fn find_priority_mismatches(&self) -> RepoResult<Vec<Uuid>> {
        self.inner.find_priority_mismatches().await
    }

    async fn insert_event(&self, event: &Event) -> RepoResult<()> {
        self.inner.insert_event(event).await
    }

    async fn find_events(&self, work_item_id: Uuid) -> RepoResult<Vec<Event>> {
        self.inner.find_events(work_item_id).await
    }
}

#[tokio::test]
async fn test_commit_survives_concurrent_sweep() {
    let repo = Arc::new(SweepingRepository {
        inner: MemoryRepository::new(),
        examined: AtomicUsize::new(0),
    });
    let store = Store::new(repo.clone());

    let request = store.create_request(committed("swept", 5)).await.unwrap();
    assert!(repo.examined.load(Ordering::SeqCst) > 0);
    assert_eq!(request.state, RequestState::Committed);
    assert_eq!(request.priority, Some(5));

    let item = store
        .get_work_item(request.work_item_id.unwrap())
        .await
        .unwrap();
    assert_eq!(item.state, WorkItemState::Queued);
    assert_eq!(item.priority, 5);
}

// =============================================================================
// Invariant under arbitrary priority edits
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_work_item_priority_is_max_of_committed(
        initial in proptest::collection::vec(1i64..50, 1..4),
        edits in proptest::collection::vec((0usize..4, 0i64..50), 0..12),
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        rt.block_on(async {
            let store = Store::in_memory();
            let mut ids = Vec::new();
            for priority in &initial {
                let request = store.create_request(committed("prop", *priority)).await.unwrap();
                ids.push(request.id);
            }

            for (index, priority) in edits {
                let id = ids[index % ids.len()];
                // Editing a request finalized by an earlier cancellation fails
                let _ = store.set_priority(id, priority).await;

                let mut work_item_id = None;
                let mut expected = 0;
                for id in &ids {
                    let request = store.get_request(*id).await.unwrap();
                    work_item_id = request.work_item_id;
                    if request.state == RequestState::Committed {
                        expected = expected.max(request.priority.unwrap_or(0));
                    }
                }

                let item = store.get_work_item(work_item_id.unwrap()).await.unwrap();
                if item.state.is_terminal() {
                    assert_eq!(item.priority, 0);
                } else {
                    assert_eq!(item.priority, expected);
                }
            }
        });
    }
}
