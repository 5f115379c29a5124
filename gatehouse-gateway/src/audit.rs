//! Audit event emission.
//!
//! Events are write-once records of who did what through the gateway.
//! Emission must never stall the response path: the default sink hands
//! events to a background task over a channel and drops them if the
//! task is gone. Request and response bodies are never captured.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Derived success classification: 2xx and 3xx count as success.
pub fn is_success(status: u16) -> bool {
    (200..400).contains(&status)
}

/// A single audit record. Append-only; never mutated after emission.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub principal_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub principal_email: Option<String>,
    /// Method and path, e.g. `GET /admin/api/v1/services`.
    pub action: String,
    pub resource: String,
    pub client_ip: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    pub status_code: u16,
    pub latency_ms: u64,
    pub request_bytes: u64,
    pub response_bytes: u64,
    /// Derived from `status_code`, never caller-supplied.
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Fields the middleware supplies; `success` and `timestamp` are
/// derived here so callers cannot mis-set them.
pub struct AuditRecord {
    pub principal_id: Option<String>,
    pub principal_email: Option<String>,
    pub method: String,
    pub path: String,
    pub client_ip: String,
    pub user_agent: Option<String>,
    pub status_code: u16,
    pub latency_ms: u64,
    pub request_bytes: u64,
    pub response_bytes: u64,
    pub error_message: Option<String>,
}

impl AuditEvent {
    pub fn from_record(record: AuditRecord) -> Self {
        Self {
            timestamp: Utc::now(),
            principal_id: record.principal_id,
            principal_email: record.principal_email,
            action: format!("{} {}", record.method, record.path),
            resource: record.path,
            client_ip: record.client_ip,
            user_agent: record.user_agent,
            success: is_success(record.status_code),
            status_code: record.status_code,
            latency_ms: record.latency_ms,
            request_bytes: record.request_bytes,
            response_bytes: record.response_bytes,
            error_message: record.error_message,
        }
    }
}

/// Sink for audit events. Implementations must not block request
/// completion and must not raise to the caller.
pub trait AuditSink: Send + Sync {
    fn emit(&self, event: AuditEvent);
}

/// Default sink: ships events to a background task that writes them as
/// structured tracing events under the `audit` target.
pub struct LogAuditSink {
    tx: mpsc::UnboundedSender<AuditEvent>,
}

impl LogAuditSink {
    pub fn new() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<AuditEvent>();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match serde_json::to_string(&event) {
                    Ok(json) => {
                        tracing::info!(target: "audit", event = %json, "audit event");
                    }
                    Err(e) => {
                        tracing::warn!(target: "audit", error = %e, "Failed to encode audit event");
                    }
                }
            }
        });
        Self { tx }
    }
}

impl Default for LogAuditSink {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditSink for LogAuditSink {
    fn emit(&self, event: AuditEvent) {
        // Dropped silently if the writer task is gone; auditing must
        // not fail the request.
        let _ = self.tx.send(event);
    }
}

/// In-memory sink for tests.
#[derive(Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl AuditSink for MemoryAuditSink {
    fn emit(&self, event: AuditEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
