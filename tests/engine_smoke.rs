//! Workspace-level smoke test: wires a [`dispatch_engine::DispatchEngine`] up
//! against an in-memory store and queue and a mocked downstream API, the way
//! the teacher's own top-level `tests/` crate exercised full pattern stacks
//! rather than individual layers.

use dispatch_engine::DispatchEngine;
use dispatch_queue::{InMemoryJobQueue, JobQueue, JobQueueOptions, JobStatus};
use dispatch_store::{ContextStore, InMemoryStore};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn engine_drains_a_batch_job_to_completion() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/echo"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
        .mount(&server)
        .await;

    let store: Arc<dyn ContextStore> = Arc::new(InMemoryStore::new());
    store
        .set(
            "session:S1",
            &serde_json::json!({
                "apiUrl": format!("{}/echo", server.uri()),
                "auth": {"userId": "u1", "apiKey": "k1"},
            })
            .to_string(),
        )
        .await
        .unwrap();

    let queue: Arc<dyn JobQueue> = Arc::new(InMemoryJobQueue::new());
    let job_id = queue
        .add(
            "batch",
            serde_json::json!({
                "sessionId": "S1",
                "records": [
                    {"memberId": "M1", "requestId": "R1"},
                    {"memberId": "M2", "requestId": "R2"},
                ],
            }),
            JobQueueOptions::default(),
        )
        .await
        .unwrap();

    let config = dispatch_core::DispatchConfig {
        cooldown: Duration::from_millis(30),
        ..dispatch_core::DispatchConfig::default()
    };
    let engine = DispatchEngine::new(config, Arc::clone(&store), Arc::clone(&queue));
    let handle = engine.spawn();

    let mut completed = false;
    for _ in 0..200 {
        if let Some(job) = queue.get_job(job_id).await.unwrap()
            && job.status == JobStatus::Completed
        {
            completed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(completed, "job should complete within the polling window");
    handle.shutdown().await;
}
