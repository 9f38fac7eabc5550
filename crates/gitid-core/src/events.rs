//! Structured per-step events emitted while a transition runs.

use crate::planner::StepKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Started,
    Succeeded,
    Failed,
    Skipped,
    RolledBack,
    RollbackFailed,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Started => "started",
            Outcome::Succeeded => "succeeded",
            Outcome::Failed => "failed",
            Outcome::Skipped => "skipped",
            Outcome::RolledBack => "rolled_back",
            Outcome::RollbackFailed => "rollback_failed",
        }
    }

    fn is_failure(self) -> bool {
        matches!(self, Outcome::Failed | Outcome::RollbackFailed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepEvent {
    pub transition_id: Uuid,
    pub alias: String,
    pub operation: StepKind,
    pub description: String,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: &StepEvent);
}

/// Forwards events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, e: &StepEvent) {
        if e.outcome.is_failure() {
            tracing::warn!(
                transition = %e.transition_id,
                alias = %e.alias,
                step = %e.operation,
                outcome = e.outcome.as_str(),
                detail = e.detail.as_deref().unwrap_or(""),
                "{}",
                e.description
            );
        } else {
            tracing::info!(
                transition = %e.transition_id,
                alias = %e.alias,
                step = %e.operation,
                outcome = e.outcome.as_str(),
                "{}",
                e.description
            );
        }
    }
}

/// Keeps every event in memory; used by tests and `--json` output.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<StepEvent>>,
}

impl MemorySink {
    pub fn events(&self) -> Vec<StepEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: &StepEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
    }
}

pub struct Fanout(pub Vec<Arc<dyn EventSink>>);

impl EventSink for Fanout {
    fn emit(&self, event: &StepEvent) {
        for sink in &self.0 {
            sink.emit(event);
        }
    }
}
