//! Lifecycle event publishing.
//!
//! Events are fire-and-forget: `publish` pushes onto a bounded channel and returns
//! immediately, dropping the event when the queue is full. A background worker drains
//! the channel into an [`EventSink`], retrying each event a bounded number of times
//! before dropping it. Nothing here can block or fail stage progression.

pub mod http;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::workflow_config::HubConfig;
pub use http::HttpSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Register,
    StateUpdate,
    StageStart,
    StageComplete,
    StageFail,
    ApprovalNeeded,
    Rollback,
    TaskComplete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "event")]
    pub kind: EventKind,
    pub agent_id: String,
    pub task_name: String,
    #[serde(default)]
    pub stage: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Destination for events.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn deliver(&self, event: &Event) -> anyhow::Result<()>;
}

/// Delay between delivery attempts of the same event.
const RETRY_DELAY: Duration = Duration::from_millis(200);
/// Events held while the worker is busy; further events are dropped.
pub const EVENT_QUEUE_CAPACITY: usize = 256;

/// Handle used by the orchestrator to publish events.
pub struct EventPublisher {
    agent_id: String,
    tx: Option<mpsc::Sender<Event>>,
    worker: Option<JoinHandle<()>>,
}

impl EventPublisher {
    /// A publisher that drops everything.
    pub fn disabled() -> Self {
        Self {
            agent_id: String::new(),
            tx: None,
            worker: None,
        }
    }

    /// Start a background worker delivering to `sink`. Must be called inside a runtime.
    pub fn spawn(sink: Arc<dyn EventSink>, agent_id: &str, max_attempts: u32) -> Self {
        Self::spawn_with_capacity(sink, agent_id, max_attempts, EVENT_QUEUE_CAPACITY)
    }

    pub fn spawn_with_capacity(
        sink: Arc<dyn EventSink>,
        agent_id: &str,
        max_attempts: u32,
        capacity: usize,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<Event>(capacity.max(1));
        let max_attempts = max_attempts.max(1);

        let worker = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                for attempt in 1..=max_attempts {
                    match sink.deliver(&event).await {
                        Ok(()) => {
                            debug!(kind = ?event.kind, task = %event.task_name, "Event delivered");
                            break;
                        }
                        Err(e) if attempt == max_attempts => {
                            warn!(
                                kind = ?event.kind,
                                task = %event.task_name,
                                error = %e,
                                "Dropping event after {} attempts",
                                max_attempts
                            );
                        }
                        Err(_) => tokio::time::sleep(RETRY_DELAY * attempt).await,
                    }
                }
            }
        });

        Self {
            agent_id: agent_id.to_string(),
            tx: Some(tx),
            worker: Some(worker),
        }
    }

    /// Publisher for the `[hub]` section; disabled when no URL is configured.
    pub fn from_config(hub: &HubConfig, default_agent_id: &str) -> Self {
        let Some(url) = hub.url() else {
            return Self::disabled();
        };
        match HttpSink::new(&url, Duration::from_secs(hub.timeout_secs)) {
            Ok(sink) => {
                let agent_id = hub.agent_id.as_deref().unwrap_or(default_agent_id);
                Self::spawn(Arc::new(sink), agent_id, hub.max_attempts)
            }
            Err(e) => {
                warn!(error = %e, "Event hub disabled");
                Self::disabled()
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    pub fn publish(
        &self,
        kind: EventKind,
        task_name: &str,
        stage: Option<&str>,
        payload: serde_json::Value,
    ) {
        let Some(ref tx) = self.tx else {
            return;
        };
        let event = Event {
            kind,
            agent_id: self.agent_id.clone(),
            task_name: task_name.to_string(),
            stage: stage.map(str::to_string),
            timestamp: Utc::now(),
            payload,
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(kind = ?event.kind, task = %event.task_name, "Event queue full; event dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Event worker has stopped; event dropped");
            }
        }
    }

    /// Stop accepting events and give queued ones up to `grace` to drain.
    pub async fn shutdown(mut self, grace: Duration) {
        self.tx = None;
        if let Some(worker) = self.worker.take()
            && tokio::time::timeout(grace, worker).await.is_err()
        {
            debug!("Event worker still busy at shutdown; remaining events dropped");
        }
    }
}

impl Drop for EventPublisher {
    fn drop(&mut self) {
        if let Some(ref worker) = self.worker {
            worker.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        events: Mutex<Vec<Event>>,
        failures_left: AtomicU32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl EventSink for Recording {
        async fn deliver(&self, event: &Event) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                anyhow::bail!("hub unavailable");
            }
            self.events.lock().await.push(event.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_events_delivered_in_order() {
        let sink = Arc::new(Recording::default());
        let publisher = EventPublisher::spawn(sink.clone(), "agent-1", 3);
        publisher.publish(EventKind::Register, "fix-login", None, serde_json::json!({}));
        publisher.publish(
            EventKind::StageStart,
            "fix-login",
            Some("PLAN"),
            serde_json::json!({"attempt": 1}),
        );
        publisher.shutdown(Duration::from_secs(5)).await;

        let events = sink.events.lock().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::Register);
        assert_eq!(events[1].stage.as_deref(), Some("PLAN"));
        assert_eq!(events[1].agent_id, "agent-1");
    }

    #[tokio::test]
    async fn test_bounded_retry_then_drop() {
        let sink = Arc::new(Recording::default());
        sink.failures_left.store(10, Ordering::SeqCst);
        let publisher = EventPublisher::spawn(sink.clone(), "agent-1", 2);
        publisher.publish(EventKind::StageFail, "fix-login", Some("QA"), serde_json::json!({}));
        publisher.shutdown(Duration::from_secs(5)).await;

        assert_eq!(sink.calls.load(Ordering::SeqCst), 2);
        assert!(sink.events.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let sink = Arc::new(Recording::default());
        sink.failures_left.store(1, Ordering::SeqCst);
        let publisher = EventPublisher::spawn(sink.clone(), "agent-1", 3);
        publisher.publish(EventKind::Rollback, "fix-login", Some("QA"), serde_json::json!({}));
        publisher.shutdown(Duration::from_secs(5)).await;
        assert_eq!(sink.events.lock().await.len(), 1);
    }

    struct Slow {
        delivered: AtomicU32,
    }

    #[async_trait]
    impl EventSink for Slow {
        async fn deliver(&self, _event: &Event) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.delivered.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_full_queue_drops_instead_of_blocking() {
        let sink = Arc::new(Slow {
            delivered: AtomicU32::new(0),
        });
        let publisher = EventPublisher::spawn_with_capacity(sink.clone(), "agent-1", 1, 2);
        let started = std::time::Instant::now();
        for _ in 0..50 {
            publisher.publish(EventKind::StateUpdate, "fix-login", None, serde_json::json!({}));
        }
        assert!(started.elapsed() < Duration::from_millis(50));
        publisher.shutdown(Duration::from_secs(5)).await;

        let delivered = sink.delivered.load(Ordering::SeqCst);
        assert!(delivered >= 1);
        assert!(delivered <= 3, "delivered {} of 50 with a queue of 2", delivered);
    }

    #[test]
    fn test_disabled_publisher_is_silent() {
        let publisher = EventPublisher::disabled();
        assert!(!publisher.is_enabled());
        publisher.publish(EventKind::TaskComplete, "t", None, serde_json::Value::Null);
    }

    #[test]
    fn test_event_wire_format() {
        let event = Event {
            kind: EventKind::ApprovalNeeded,
            agent_id: "a".into(),
            task_name: "t".into(),
            stage: Some("DESIGN".into()),
            timestamp: Utc::now(),
            payload: serde_json::json!({"attempt": 1}),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "approval_needed");
        assert_eq!(json["stage"], "DESIGN");
    }
}
