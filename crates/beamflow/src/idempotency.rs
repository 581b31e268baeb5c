//! Idempotency ledger (spec.md §4.8, data model §3)
//!
//! Keys are `workflow_id:step_id:attempt`. Transitions are
//! `absent → pending → {completed | failed}`; a key never regresses from
//! `completed`/`failed` back to `pending`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Status of an idempotency ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerStatus {
    Pending,
    Completed,
    Failed,
}

/// A single ledger row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub key: String,
    pub status: LedgerStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error: Option<String>,
}

/// Errors from ledger operations.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("idempotency key regression: {key} is already {status:?}")]
    Regression { key: String, status: LedgerStatus },
}

/// Storage contract for the Idempotency table (spec.md §6).
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Fetch the current entry for `key`, if any.
    async fn get(&self, key: &str) -> Option<LedgerEntry>;

    /// Mark `key` as `pending`, creating it if absent. Safe to call again
    /// on an existing `pending` entry (crash-resume re-entry); rejects
    /// transitioning away from `completed`/`failed`.
    async fn mark_pending(&self, key: &str) -> Result<LedgerEntry, LedgerError>;

    /// Mark `key` as `completed`, caching `result`.
    async fn mark_completed(&self, key: &str, result: Value) -> Result<LedgerEntry, LedgerError>;

    /// Mark `key` as `failed`, recording `error`.
    async fn mark_failed(&self, key: &str, error: String) -> Result<LedgerEntry, LedgerError>;
}

/// In-memory `IdempotencyStore`, guarded by a single lock the way
/// `InMemoryWorkflowEventStore` guards its state in the teacher crate.
#[derive(Default)]
pub struct InMemoryIdempotencyStore {
    entries: RwLock<HashMap<String, LedgerEntry>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn get(&self, key: &str) -> Option<LedgerEntry> {
        self.entries.read().get(key).cloned()
    }

    async fn mark_pending(&self, key: &str) -> Result<LedgerEntry, LedgerError> {
        let mut entries = self.entries.write();
        if let Some(existing) = entries.get(key) {
            if existing.status != LedgerStatus::Pending {
                return Err(LedgerError::Regression {
                    key: key.to_string(),
                    status: existing.status,
                });
            }
            return Ok(existing.clone());
        }
        let entry = LedgerEntry {
            key: key.to_string(),
            status: LedgerStatus::Pending,
            started_at: Utc::now(),
            completed_at: None,
            result: None,
            error: None,
        };
        entries.insert(key.to_string(), entry.clone());
        Ok(entry)
    }

    async fn mark_completed(&self, key: &str, result: Value) -> Result<LedgerEntry, LedgerError> {
        let mut entries = self.entries.write();
        let started_at = entries.get(key).map(|e| e.started_at).unwrap_or_else(Utc::now);
        let entry = LedgerEntry {
            key: key.to_string(),
            status: LedgerStatus::Completed,
            started_at,
            completed_at: Some(Utc::now()),
            result: Some(result),
            error: None,
        };
        entries.insert(key.to_string(), entry.clone());
        Ok(entry)
    }

    async fn mark_failed(&self, key: &str, error: String) -> Result<LedgerEntry, LedgerError> {
        let mut entries = self.entries.write();
        let started_at = entries.get(key).map(|e| e.started_at).unwrap_or_else(Utc::now);
        let entry = LedgerEntry {
            key: key.to_string(),
            status: LedgerStatus::Failed,
            started_at,
            completed_at: Some(Utc::now()),
            result: None,
            error: Some(error),
        };
        entries.insert(key.to_string(), entry.clone());
        Ok(entry)
    }
}
