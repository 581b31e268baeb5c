//! Dead letter queue (spec.md §4.7, data model §3)

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error_class::ErrorClass;

/// Secret field names stripped from `context`/`original_params` before
/// persisting a DLQ entry (spec.md §4.7 "Sanitization").
pub const SECRET_FIELD_NAMES: &[&str] = &[
    "password", "secret", "token", "api_key", "authorization", "credit_card", "ssn",
];

/// Strings longer than this are truncated with a `...[truncated]` marker.
pub const TRUNCATION_LENGTH: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DlqEntryType {
    WorkflowFailed,
    CompensationFailed,
    CriticalFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DlqStatus {
    Pending,
    Retrying,
    Resolved,
    Abandoned,
    Archived,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: uuid::Uuid,
    pub entry_type: DlqEntryType,
    pub status: DlqStatus,
    pub workflow_id: String,
    pub workflow_definition_id: String,
    pub failed_step: Option<String>,
    pub error: String,
    pub error_class: ErrorClass,
    pub context: Value,
    pub original_params: Value,
    pub retry_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub resolution: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    /// `auto_retryable?` — true only for `transient`/`unknown` (spec.md §4.7).
    pub fn auto_retryable(&self) -> bool {
        matches!(self.error_class, ErrorClass::Transient | ErrorClass::Unknown)
    }

    /// `force_retryable?` — true for everything except `terminal`.
    pub fn force_retryable(&self) -> bool {
        !matches!(self.error_class, ErrorClass::Terminal)
    }
}

/// Drop secret fields and truncate long string values. Applies
/// recursively to object/array values; scalars pass through unless they
/// are overlong strings.
pub fn sanitize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                if SECRET_FIELD_NAMES
                    .iter()
                    .any(|s| s.eq_ignore_ascii_case(k))
                {
                    continue;
                }
                out.insert(k.clone(), sanitize(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sanitize).collect()),
        Value::String(s) if s.len() > TRUNCATION_LENGTH => {
            let mut truncated: String = s.chars().take(TRUNCATION_LENGTH).collect();
            truncated.push_str("...[truncated]");
            Value::String(truncated)
        }
        other => other.clone(),
    }
}

/// `next_retry_at` for a freshly classified `transient` entry: exponential
/// backoff `min(5min * 3^retry_count, 720min)` (spec.md §4.7).
pub fn compute_next_retry_at(retry_count: u32, now: DateTime<Utc>) -> DateTime<Utc> {
    let minutes = (5.0 * 3f64.powi(retry_count as i32)).min(720.0);
    now + ChronoDuration::milliseconds((minutes * 60_000.0) as i64)
}

#[derive(Debug, thiserror::Error)]
pub enum DlqError {
    #[error("dlq entry not found: {0}")]
    NotFound(uuid::Uuid),

    #[error("entry {0} has error_class=terminal and cannot be retried")]
    TerminalNeverRetries(uuid::Uuid),
}

/// Storage contract for the DeadLetterEntry table (spec.md §6).
#[async_trait]
pub trait DlqStore: Send + Sync {
    async fn enqueue(&self, entry: DeadLetterEntry) -> Result<(), DlqError>;
    async fn get(&self, id: uuid::Uuid) -> Result<DeadLetterEntry, DlqError>;
    async fn list_due_for_retry(&self, now: DateTime<Utc>) -> Vec<DeadLetterEntry>;
    async fn list_by_status(&self, status: DlqStatus) -> Vec<DeadLetterEntry>;
    async fn force_retry(&self, id: uuid::Uuid) -> Result<DeadLetterEntry, DlqError>;
    async fn resolve(&self, id: uuid::Uuid, resolution: String) -> Result<(), DlqError>;
}

/// In-memory DLQ, keyed by entry id.
#[derive(Default)]
pub struct InMemoryDlqStore {
    entries: RwLock<HashMap<uuid::Uuid, DeadLetterEntry>>,
}

impl InMemoryDlqStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

/// Build a new DLQ entry, applying classification-driven status and
/// retry-scheduling rules (spec.md §3, §4.7):
/// - `terminal` enters as `archived` with no retry schedule;
/// - `transient` enters with `next_retry_at` scheduled;
/// - everything else enters `pending` with no schedule.
pub fn build_entry(
    entry_type: DlqEntryType,
    workflow_id: impl Into<String>,
    workflow_definition_id: impl Into<String>,
    failed_step: Option<String>,
    error: String,
    error_class: ErrorClass,
    context: Value,
    original_params: Value,
) -> DeadLetterEntry {
    let now = Utc::now();
    let status = match error_class {
        ErrorClass::Terminal => DlqStatus::Archived,
        _ => DlqStatus::Pending,
    };
    let next_retry_at = match error_class {
        ErrorClass::Transient => Some(compute_next_retry_at(0, now)),
        _ => None,
    };

    DeadLetterEntry {
        id: uuid::Uuid::now_v7(),
        entry_type,
        status,
        workflow_id: workflow_id.into(),
        workflow_definition_id: workflow_definition_id.into(),
        failed_step,
        error,
        error_class,
        context: sanitize(&context),
        original_params: sanitize(&original_params),
        retry_count: 0,
        next_retry_at,
        resolution: None,
        created_at: now,
        updated_at: now,
    }
}

#[async_trait]
impl DlqStore for InMemoryDlqStore {
    async fn enqueue(&self, entry: DeadLetterEntry) -> Result<(), DlqError> {
        self.entries.write().insert(entry.id, entry);
        Ok(())
    }

    async fn get(&self, id: uuid::Uuid) -> Result<DeadLetterEntry, DlqError> {
        self.entries
            .read()
            .get(&id)
            .cloned()
            .ok_or(DlqError::NotFound(id))
    }

    async fn list_due_for_retry(&self, now: DateTime<Utc>) -> Vec<DeadLetterEntry> {
        self.entries
            .read()
            .values()
            .filter(|e| {
                e.status == DlqStatus::Pending
                    && e.next_retry_at.map(|t| t <= now).unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    async fn list_by_status(&self, status: DlqStatus) -> Vec<DeadLetterEntry> {
        self.entries
            .read()
            .values()
            .filter(|e| e.status == status)
            .cloned()
            .collect()
    }

    async fn force_retry(&self, id: uuid::Uuid) -> Result<DeadLetterEntry, DlqError> {
        let mut entries = self.entries.write();
        let entry = entries.get_mut(&id).ok_or(DlqError::NotFound(id))?;
        if !entry.force_retryable() {
            return Err(DlqError::TerminalNeverRetries(id));
        }
        entry.status = DlqStatus::Retrying;
        entry.retry_count += 1;
        entry.updated_at = Utc::now();
        Ok(entry.clone())
    }

    async fn resolve(&self, id: uuid::Uuid, resolution: String) -> Result<(), DlqError> {
        let mut entries = self.entries.write();
        let entry = entries.get_mut(&id).ok_or(DlqError::NotFound(id))?;
        entry.status = DlqStatus::Resolved;
        entry.resolution = Some(resolution);
        entry.updated_at = Utc::now();
        Ok(())
    }
}
