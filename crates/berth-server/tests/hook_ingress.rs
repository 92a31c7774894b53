use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use berth_core::cache::InMemoryKvCache;
use berth_core::config::CoreConfig;
use berth_core::jobservice::{JobAction, JobDescriptor, JobServiceClient, JobServiceError, JobSpec};
use berth_core::models::{CoreErrorKind, TaskStatus, Trigger};
use berth_core::task::TaskOptions;
use berth_server::{Services, router, status_for};
use serde_json::{Map, Value, json};
use tower::ServiceExt;

struct AcceptingJobService;

#[async_trait]
impl JobServiceClient for AcceptingJobService {
    async fn submit_job(&self, _job: &JobDescriptor) -> Result<String, JobServiceError> {
        Ok("job-1".to_string())
    }

    async fn post_action(&self, _job_id: &str, _action: JobAction) -> Result<(), JobServiceError> {
        Ok(())
    }

    async fn get_job_log(&self, _job_id: &str) -> Result<Vec<u8>, JobServiceError> {
        Ok(Vec::new())
    }
}

fn test_db_path(test_name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_nanos();
    std::env::temp_dir().join(format!("berth-server-{test_name}-{nanos}.sqlite3"))
}

fn services(test_name: &str, refresh_interval_secs: u64) -> Services {
    let config = CoreConfig {
        database_path: test_db_path(test_name),
        execution_status_refresh_interval_secs: refresh_interval_secs,
        ..CoreConfig::default()
    };
    Services::assemble(
        config,
        Arc::new(AcceptingJobService),
        Arc::new(InMemoryKvCache::new()),
    )
    .unwrap()
}

async fn running_task(services: &Services) -> (i64, i64) {
    let execution_id = services
        .executions
        .create("REPLICATION", 1, Trigger::Manual, Map::new())
        .await
        .unwrap();
    let task_id = services
        .executions
        .task_manager()
        .create(execution_id, JobSpec::generic("REPLICATION"), TaskOptions::default())
        .await
        .unwrap();
    (execution_id, task_id)
}

async fn post_hook(app: &Router, task_id: i64, body: Value) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri(format!("/service/notifications/tasks/{task_id}"))
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

#[tokio::test]
async fn health_responds_ok() {
    let services = services("health", 0);
    let response = router(services.app_state())
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn status_hook_updates_task_and_execution() {
    let services = services("hook-inline", 0);
    let app = router(services.app_state());
    let (execution_id, task_id) = running_task(&services).await;

    let (status, _) = post_hook(
        &app,
        task_id,
        json!({"job_id": "job-1", "status": "Running", "metadata": {"revision": 7}}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = post_hook(
        &app,
        task_id,
        json!({"job_id": "job-1", "status": "Success", "metadata": {"revision": 7}}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let task = services.executions.task_manager().get(task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Success);
    assert_eq!(task.status_revision, 7);
    assert_eq!(
        services.executions.get(execution_id).await.unwrap().status,
        TaskStatus::Success
    );
}

#[tokio::test]
async fn unknown_task_asks_for_retransmission() {
    let services = services("hook-unknown", 0);
    let app = router(services.app_state());

    let (status, body) = post_hook(
        &app,
        404040,
        json!({"status": "Success", "metadata": {"revision": 1}}),
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], json!("NOT_FOUND"));
}

#[tokio::test]
async fn malformed_body_is_rejected() {
    let services = services("hook-malformed", 0);
    let app = router(services.app_state());
    let (_, task_id) = running_task(&services).await;

    let (status, _) = post_hook(&app, task_id, json!({"status": "Exploded"})).await;
    assert!(status.is_client_error());
    assert_eq!(
        services
            .executions
            .task_manager()
            .get(task_id)
            .await
            .unwrap()
            .status,
        TaskStatus::Pending
    );
}

#[tokio::test]
async fn deferred_rollup_waits_for_the_refresher() {
    let services = services("hook-deferred", 60);
    let app = router(services.app_state());
    let (execution_id, task_id) = running_task(&services).await;

    let (status, _) = post_hook(
        &app,
        task_id,
        json!({"status": "Error", "metadata": {"revision": 2}}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        services.executions.get(execution_id).await.unwrap().status,
        TaskStatus::Running
    );

    assert_eq!(services.refresher.refresh_outdated().await.unwrap(), 1);
    assert_eq!(
        services.executions.get(execution_id).await.unwrap().status,
        TaskStatus::Error
    );
}

#[tokio::test]
async fn background_loops_stop_with_the_signal() {
    let services = services("background", 0);
    let stop = berth_core::signal::StopSignal::new();
    let handles = services.spawn_background(&stop);
    assert_eq!(handles.len(), 2);

    stop.stop();
    for handle in handles {
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("loop should stop")
            .expect("loop should not panic");
    }
}

#[test]
fn error_kinds_map_to_http_statuses() {
    assert_eq!(status_for(CoreErrorKind::Denied), StatusCode::FORBIDDEN);
    assert_eq!(status_for(CoreErrorKind::BadRequest), StatusCode::BAD_REQUEST);
    assert_eq!(
        status_for(CoreErrorKind::PreconditionFailed),
        StatusCode::PRECONDITION_FAILED
    );
    assert_eq!(status_for(CoreErrorKind::Conflict), StatusCode::CONFLICT);
    assert_eq!(
        status_for(CoreErrorKind::Internal),
        StatusCode::INTERNAL_SERVER_ERROR
    );
}
