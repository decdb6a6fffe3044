//! Generation Attempt Log
//!
//! Per-request diagnostic record of which repair layer ran and how it went.
//! Records accumulate in memory while the pipeline runs and are handed to an
//! `AttemptSink` when the request concludes. Persisting is best-effort: a
//! sink failure is logged and never reaches the caller. A persist cut short
//! by cancellation is handed over again on drop, so sinks treat a repeated
//! request id as a replacement.

use crate::coercion::WrapperKind;
use crate::schema::ValidationIssue;
use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

/// One ordered recovery strategy of the repair pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Layer {
    Direct = 0,
    Coerce = 1,
    Repack = 2,
}

impl From<Layer> for u8 {
    fn from(layer: Layer) -> Self {
        layer as u8
    }
}

impl TryFrom<u8> for Layer {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Layer::Direct),
            1 => Ok(Layer::Coerce),
            2 => Ok(Layer::Repack),
            other => Err(anyhow!("unknown generation layer {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationAttempt {
    pub layer: Layer,
    pub succeeded: bool,
    pub raw_text: Option<String>,
    pub wrapper_detected: Option<WrapperKind>,
    pub issues: Vec<ValidationIssue>,
    pub elapsed_ms: u64,
    /// Model that produced the text this layer worked on.
    pub model: Option<String>,
    pub error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl GenerationAttempt {
    pub fn new(layer: Layer, succeeded: bool, elapsed: Duration) -> Self {
        Self {
            layer,
            succeeded,
            raw_text: None,
            wrapper_detected: None,
            issues: Vec::new(),
            elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            model: None,
            error: None,
            recorded_at: Utc::now(),
        }
    }

    pub fn with_raw_text(mut self, raw_text: Option<String>) -> Self {
        self.raw_text = raw_text;
        self
    }

    pub fn with_wrapper(mut self, wrapper: WrapperKind) -> Self {
        self.wrapper_detected = Some(wrapper);
        self
    }

    pub fn with_issues(mut self, issues: Vec<ValidationIssue>) -> Self {
        self.issues = issues;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_error(mut self, error: impl ToString) -> Self {
        self.error = Some(error.to_string());
        self
    }
}

/// Destination for finalized attempt logs.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AttemptSink: Send + Sync {
    async fn persist(&self, request_id: Uuid, attempts: &[GenerationAttempt]) -> anyhow::Result<()>;
}

#[derive(Default)]
struct StoredLogs {
    by_request: HashMap<Uuid, Vec<GenerationAttempt>>,
    order: VecDeque<Uuid>,
}

/// Keeps the most recent finalized logs in memory for inspection, evicting
/// the oldest request once `capacity` is reached.
pub struct MemoryAttemptSink {
    capacity: usize,
    logs: Mutex<StoredLogs>,
}

impl MemoryAttemptSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            logs: Mutex::new(StoredLogs::default()),
        }
    }

    pub async fn get(&self, request_id: Uuid) -> Option<Vec<GenerationAttempt>> {
        self.logs.lock().await.by_request.get(&request_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.logs.lock().await.by_request.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.logs.lock().await.by_request.is_empty()
    }
}

#[async_trait]
impl AttemptSink for MemoryAttemptSink {
    async fn persist(&self, request_id: Uuid, attempts: &[GenerationAttempt]) -> anyhow::Result<()> {
        let final_layer = attempts.last().map(|a| u8::from(a.layer));
        let succeeded = attempts.iter().any(|a| a.succeeded);
        info!(
            request_id = %request_id,
            attempts = attempts.len(),
            final_layer = ?final_layer,
            succeeded,
            "Generation attempt log finalized"
        );

        let mut logs = self.logs.lock().await;
        if logs
            .by_request
            .insert(request_id, attempts.to_vec())
            .is_none()
        {
            logs.order.push_back(request_id);
        }
        while logs.order.len() > self.capacity {
            if let Some(evicted) = logs.order.pop_front() {
                logs.by_request.remove(&evicted);
            }
        }
        Ok(())
    }
}

/// The attempts of one generation request.
///
/// `finalize` consumes the log, so it can run at most once. A log dropped
/// before `finalize` has finished (panic, cancelled future) still hands its
/// records to the sink on the current runtime.
pub struct GenerationAttemptLog {
    request_id: Uuid,
    attempts: Vec<GenerationAttempt>,
    sink: Arc<dyn AttemptSink>,
    finalized: bool,
}

impl GenerationAttemptLog {
    pub fn new(request_id: Uuid, sink: Arc<dyn AttemptSink>) -> Self {
        Self {
            request_id,
            attempts: Vec::with_capacity(3),
            sink,
            finalized: false,
        }
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    /// Records the outcome of one layer. Recording the same layer twice keeps
    /// only the later record.
    pub fn record(&mut self, attempt: GenerationAttempt) {
        info!(
            request_id = %self.request_id,
            layer = u8::from(attempt.layer),
            succeeded = attempt.succeeded,
            elapsed_ms = attempt.elapsed_ms,
            issues = attempt.issues.len(),
            "Generation layer completed"
        );
        match self.attempts.iter_mut().find(|a| a.layer == attempt.layer) {
            Some(existing) => *existing = attempt,
            None => self.attempts.push(attempt),
        }
    }

    pub fn attempts(&self) -> &[GenerationAttempt] {
        &self.attempts
    }

    pub async fn finalize(mut self) {
        if let Err(e) = self.sink.persist(self.request_id, &self.attempts).await {
            warn!(request_id = %self.request_id, error = %e, "Failed to persist generation attempt log");
        }
        // Only a completed persist call releases `Drop` from its duty.
        self.finalized = true;
    }
}

impl Drop for GenerationAttemptLog {
    fn drop(&mut self) {
        if self.finalized {
            return;
        }
        let attempts = std::mem::take(&mut self.attempts);
        let request_id = self.request_id;
        let sink = Arc::clone(&self.sink);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = sink.persist(request_id, &attempts).await {
                        warn!(request_id = %request_id, error = %e, "Failed to persist generation attempt log");
                    }
                });
            }
            Err(_) => {
                warn!(
                    request_id = %request_id,
                    attempts = attempts.len(),
                    "Attempt log dropped outside a runtime; records discarded"
                );
            }
        }
    }
}
