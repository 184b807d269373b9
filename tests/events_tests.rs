//! Event publishing against a local hub receiver.

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::Value;
use stagehand::config::Config;
use stagehand::events::{EventKind, EventPublisher, HttpSink};
use stagehand::orchestrator::{Orchestrator, RunOutcome};
use stagehand::stage::TaskType;
use stagehand::tracker::StaticChanges;
use stagehand::workflow_config::{HubConfig, WorkflowToml};
use std::fs;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

type Received = Arc<Mutex<Vec<Value>>>;

async fn receive(State(received): State<Received>, Json(event): Json<Value>) -> &'static str {
    received.lock().unwrap().push(event);
    "ok"
}

async fn start_hub() -> (String, Received) {
    let received: Received = Arc::new(Mutex::new(Vec::new()));
    let app = Router::new()
        .route("/events", post(receive))
        .with_state(received.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), received)
}

fn kinds(received: &Received) -> Vec<String> {
    received
        .lock()
        .unwrap()
        .iter()
        .map(|e| e["event"].as_str().unwrap_or_default().to_string())
        .collect()
}

fn orchestrator(dir: &TempDir, events: EventPublisher) -> Orchestrator {
    let script = dir.path().join("backend.sh");
    fs::write(&script, "#!/bin/sh\ncat > /dev/null\necho done\n").unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
    }
    let workflow = WorkflowToml::parse(&format!(
        "[ai]\ndefault_backend = \"fake\"\n\n[ai.backends.fake]\ncommand = \"{}\"\n\n\
         [templates]\nchore = [\"PLAN\", \"DEV\"]\n\n\
         [stages.overrides.PLAN]\nrequires_approval = false\n",
        script.display()
    ))
    .unwrap();
    let config = Config::with_workflow(dir.path().to_path_buf(), false, workflow);
    Orchestrator::new(config, events).with_change_source(Arc::new(StaticChanges(Vec::new())))
}

#[tokio::test]
async fn test_publisher_posts_event_json() {
    let (url, received) = start_hub().await;
    let sink = HttpSink::new(&url, Duration::from_secs(2)).unwrap();
    let publisher = EventPublisher::spawn(Arc::new(sink), "ci-agent", 3);
    assert!(publisher.is_enabled());

    publisher.publish(
        EventKind::StageStart,
        "fix login",
        Some("DEV"),
        serde_json::json!({ "attempt": 2 }),
    );
    publisher.shutdown(Duration::from_secs(5)).await;

    let events = received.lock().unwrap().clone();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["event"], "stage_start");
    assert_eq!(events[0]["agent_id"], "ci-agent");
    assert_eq!(events[0]["task_name"], "fix login");
    assert_eq!(events[0]["stage"], "DEV");
    assert_eq!(events[0]["payload"]["attempt"], 2);
    assert!(events[0]["timestamp"].is_string());
}

#[tokio::test]
async fn test_workflow_lifecycle_events_in_order() {
    let (url, received) = start_hub().await;
    let hub = HubConfig {
        url: Some(url),
        agent_id: Some("laptop-1".into()),
        ..Default::default()
    };
    let dir = TempDir::new().unwrap();
    let orch = orchestrator(&dir, EventPublisher::from_config(&hub, "fallback"));

    let task = orch
        .create_task("tidy", TaskType::Chore, "", Vec::new())
        .unwrap();
    let (_handle, rx) = orch.control_channel(&task.id);
    assert_eq!(orch.run(&task.id, rx).await.unwrap(), RunOutcome::Complete);
    orch.shutdown().await;

    let kinds = kinds(&received);
    assert_eq!(kinds.first().map(String::as_str), Some("register"));
    assert_eq!(kinds.last().map(String::as_str), Some("task_complete"));
    let starts: Vec<_> = kinds.iter().filter(|k| *k == "stage_start").collect();
    let completes: Vec<_> = kinds.iter().filter(|k| *k == "stage_complete").collect();
    assert_eq!(starts.len(), 2);
    assert_eq!(completes.len(), 2);

    let events = received.lock().unwrap().clone();
    assert!(events.iter().all(|e| e["agent_id"] == "laptop-1"));
    assert_eq!(events.last().unwrap()["payload"]["status"], "complete");
}

#[tokio::test]
async fn test_unreachable_hub_does_not_block_workflow() {
    let hub = HubConfig {
        url: Some("http://127.0.0.1:9".into()),
        max_attempts: 2,
        timeout_secs: 1,
        ..Default::default()
    };
    let dir = TempDir::new().unwrap();
    let orch = orchestrator(&dir, EventPublisher::from_config(&hub, "agent"));
    let task = orch
        .create_task("tidy", TaskType::Chore, "", Vec::new())
        .unwrap();
    let (_handle, rx) = orch.control_channel(&task.id);

    let outcome = tokio::time::timeout(Duration::from_secs(20), orch.run(&task.id, rx))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome, RunOutcome::Complete);
}
