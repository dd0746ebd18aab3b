//! Shared helpers for integration tests.

use async_trait::async_trait;
use chime::{EventListener, SchedulerEvent};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Listener recording every event it receives.
pub struct Recorder {
    events: Mutex<Vec<SchedulerEvent>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
        })
    }

    pub async fn events(&self) -> Vec<SchedulerEvent> {
        self.events.lock().await.clone()
    }

    pub async fn codes(&self) -> Vec<u32> {
        self.events.lock().await.iter().map(|e| e.code()).collect()
    }

    pub async fn count(&self, code: u32) -> usize {
        self.events
            .lock()
            .await
            .iter()
            .filter(|e| e.code() == code)
            .count()
    }

    /// Poll until at least `count` events with `code` arrived, or the
    /// timeout elapses. Returns whether the target was reached.
    pub async fn wait_for(&self, code: u32, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.count(code).await >= count {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl EventListener for Recorder {
    async fn on_event(&self, event: &SchedulerEvent) {
        self.events.lock().await.push(event.clone());
    }
}

/// A runner that always succeeds with `null`.
pub fn noop_runner() -> Arc<dyn chime::JobRunner> {
    Arc::new(chime::FnRunner::new(|_inv| async { Ok(Value::Null) }))
}
