// Audit event sink port
//
// Audit persistence is an external collaborator; the core only emits events.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Event types the extraction core emits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    SyncStarted,
    SyncCompleted,
    SyncFailed,
    SyncCancelled,
    ExtractionStarted,
    ExtractionCompleted,
    ExtractionFailed,
    ExtractionCancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_type: AuditEventType,
    pub resource_type: String,
    pub resource_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_source_id: Option<Uuid>,
    /// JSON-encoded detail payload
    pub event_details: String,
}

pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Default sink: forwards events to the tracing feed
#[derive(Debug, Default, Clone)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        tracing::info!(
            event_type = ?event.event_type,
            resource_type = %event.resource_type,
            resource_id = %event.resource_id,
            details = %event.event_details,
            "audit event"
        );
    }
}

/// Collecting sink for tests
#[derive(Debug, Default)]
pub struct RecordingAuditSink {
    events: std::sync::Mutex<Vec<AuditEvent>>,
}

impl RecordingAuditSink {
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().expect("audit mutex poisoned").clone()
    }
}

impl AuditSink for RecordingAuditSink {
    fn record(&self, event: AuditEvent) {
        self.events.lock().expect("audit mutex poisoned").push(event);
    }
}
