//! Asynchronous request audit trail.
//!
//! Callers hand an [`AuditRecord`] to an [`AuditSink`] and move on; the
//! [`ChannelAuditSink`] queues it on a bounded channel that a background
//! task drains into an [`AuditWriter`]. A full queue drops the record rather
//! than stalling the request path.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tollgate_common::AuditConfig;
use tracing::{debug, info, warn};

/// Request fields that never reach the audit trail.
pub const SENSITIVE_FIELDS: [&str; 4] = ["password", "oldPassword", "newPassword", "confirmPassword"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub id: String,
    pub trace_id: Option<String>,
    pub client_ip: String,
    pub method: String,
    pub uri: String,
    pub params: Value,
    pub response: Option<String>,
    pub successful: bool,
    pub request_time: DateTime<Utc>,
    pub cost_ms: u64,
}

/// The request half of an audit record, as seen by the caller.
#[derive(Debug, Clone, Default)]
pub struct AuditRequest {
    pub trace_id: Option<String>,
    pub client_ip: String,
    pub method: String,
    pub uri: String,
    pub params: Value,
}

/// Redaction and outcome rules applied when building records.
#[derive(Debug, Clone)]
pub struct AuditPolicy {
    excluded: HashSet<String>,
    success_code: i64,
}

impl AuditPolicy {
    pub fn from_config(config: &AuditConfig) -> Self {
        let excluded = SENSITIVE_FIELDS
            .iter()
            .map(|f| f.to_string())
            .chain(config.exclude_fields.iter().cloned())
            .collect();
        Self {
            excluded,
            success_code: config.success_code,
        }
    }

    pub fn record(
        &self,
        request: AuditRequest,
        response: Option<String>,
        request_time: DateTime<Utc>,
        cost: Duration,
    ) -> AuditRecord {
        let successful = self.is_successful(response.as_deref());
        AuditRecord {
            id: uuid::Uuid::new_v4().to_string(),
            trace_id: request.trace_id,
            client_ip: request.client_ip,
            method: request.method,
            uri: request.uri,
            params: self.redact(request.params),
            response: response.filter(|r| !r.is_empty()),
            successful,
            request_time,
            cost_ms: u64::try_from(cost.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Drop excluded fields at every nesting level.
    pub fn redact(&self, params: Value) -> Value {
        match params {
            Value::Object(map) => Value::Object(
                map.into_iter()
                    .filter(|(name, _)| !self.excluded.contains(name))
                    .map(|(name, value)| (name, self.redact(value)))
                    .collect(),
            ),
            Value::Array(items) => Value::Array(items.into_iter().map(|v| self.redact(v)).collect()),
            other => other,
        }
    }

    /// A JSON object body whose `code` differs from the success code is a
    /// failure. Anything else, including non-JSON bodies, counts as success.
    pub fn is_successful(&self, response: Option<&str>) -> bool {
        let Some(body) = response.filter(|b| !b.trim().is_empty()) else {
            return true;
        };
        match serde_json::from_str::<Value>(body) {
            Ok(Value::Object(map)) => match map.get("code").and_then(Value::as_i64) {
                Some(code) => code == self.success_code,
                None => true,
            },
            _ => true,
        }
    }
}

pub trait AuditSink: Send + Sync {
    /// Queue a record. Must not block.
    fn record(&self, record: AuditRecord);
}

/// Sink used when auditing is switched off.
pub struct NoopAuditSink;

impl AuditSink for NoopAuditSink {
    fn record(&self, _record: AuditRecord) {}
}

/// Final destination of audit records.
#[async_trait]
pub trait AuditWriter: Send + 'static {
    async fn write(&mut self, record: AuditRecord) -> anyhow::Result<()>;
}

/// Writes each record as one JSON line on the `tollgate::audit` target.
pub struct TracingAuditWriter;

#[async_trait]
impl AuditWriter for TracingAuditWriter {
    async fn write(&mut self, record: AuditRecord) -> anyhow::Result<()> {
        let line = serde_json::to_string(&record)?;
        info!(target: "tollgate::audit", audit = %line, "request audited");
        Ok(())
    }
}

pub struct ChannelAuditSink {
    tx: mpsc::Sender<AuditRecord>,
}

impl ChannelAuditSink {
    /// Start the drain task. It ends once every clone of the sink is dropped
    /// and the queue is empty.
    pub fn spawn<W: AuditWriter>(capacity: usize, mut writer: W) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<AuditRecord>(capacity.max(1));

        let task = tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                let id = record.id.clone();
                if let Err(e) = writer.write(record).await {
                    warn!(audit_id = %id, error = %e, "failed to write audit record");
                }
            }
            debug!("audit channel closed");
        });

        info!(capacity, "audit sink started");
        (Self { tx }, task)
    }
}

impl AuditSink for ChannelAuditSink {
    fn record(&self, record: AuditRecord) {
        match self.tx.try_send(record) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(record)) => {
                warn!(audit_id = %record.id, uri = %record.uri, "audit queue full, dropping record");
            }
            Err(mpsc::error::TrySendError::Closed(record)) => {
                warn!(audit_id = %record.id, "audit writer stopped, dropping record");
            }
        }
    }
}
