//! Task records: one log-audit job and its lifecycle status.
//!
//! A task is created by the producer in `RECEIVED`, claimed by a worker into
//! `PROCESSING`, and leaves processing as `COMPLETED` (anchored on the ledger),
//! `FAILED`, or back to `RECEIVED` for another attempt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Error;

// ---------------------------------------------------------------------------
// Task Record
// ---------------------------------------------------------------------------

/// The persistent unit of work tracked by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Producer-assigned primary key.
    pub request_id: String,

    /// Hex SHA-256 of the log payload.
    pub log_hash: String,

    /// Organization that submitted the log. Read-path authorization keys on this.
    pub source_org_id: String,

    /// Submission time asserted by the client.
    pub received_timestamp: DateTime<Utc>,

    /// Insertion time assigned by the store.
    pub received_at_db: DateTime<Utc>,

    pub status: Status,

    pub processing_started_at: Option<DateTime<Utc>>,
    pub processing_finished_at: Option<DateTime<Utc>>,

    /// Ledger anchoring result, set only on completion.
    pub tx_hash: Option<String>,
    pub block_height: Option<u64>,
    pub log_hash_on_chain: Option<String>,

    /// Last failure reason. Survives retries, cleared on completion.
    pub error_message: Option<String>,

    /// Number of `PROCESSING -> RECEIVED` cycles so far.
    pub retry_count: u32,
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    /// Enqueued, waiting to be claimed.
    Received,
    /// Held by exactly one worker.
    Processing,
    /// Anchored on the ledger. Terminal.
    Completed,
    /// Permanently failed or retries exhausted. Terminal.
    Failed,
}

impl Status {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: Status) -> bool {
        use Status::*;
        matches!(
            (self, to),
            (Received, Processing)
                | (Received, Failed)    // retry ceiling reached at claim time
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Received) // retry
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Received => "RECEIVED",
            Status::Processing => "PROCESSING",
            Status::Completed => "COMPLETED",
            Status::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RECEIVED" => Ok(Status::Received),
            "PROCESSING" => Ok(Status::Processing),
            "COMPLETED" => Ok(Status::Completed),
            "FAILED" => Ok(Status::Failed),
            other => Err(Error::InvalidStatus(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Batch items
// ---------------------------------------------------------------------------

/// A task as submitted by the producer. Always stored as `RECEIVED` with
/// `retry_count = 0`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTask {
    pub request_id: String,
    pub log_hash: String,
    pub source_org_id: String,
    pub received_timestamp: DateTime<Utc>,
}

impl NewTask {
    pub fn new(
        request_id: impl Into<String>,
        log_hash: impl Into<String>,
        source_org_id: impl Into<String>,
        received_timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            log_hash: log_hash.into(),
            source_org_id: source_org_id.into(),
            received_timestamp,
        }
    }

    /// Build a task from the raw log content, hashing it the same way the
    /// content lookup does.
    pub fn from_content(
        request_id: impl Into<String>,
        source_org_id: impl Into<String>,
        content: &str,
        received_timestamp: DateTime<Utc>,
    ) -> Self {
        Self::new(
            request_id,
            content_hash(content),
            source_org_id,
            received_timestamp,
        )
    }

    /// The record as it looks right after insertion.
    pub(crate) fn into_record(self, received_at_db: DateTime<Utc>) -> TaskRecord {
        TaskRecord {
            request_id: self.request_id,
            log_hash: self.log_hash,
            source_org_id: self.source_org_id,
            received_timestamp: self.received_timestamp,
            received_at_db,
            status: Status::Received,
            processing_started_at: None,
            processing_finished_at: None,
            tx_hash: None,
            block_height: None,
            log_hash_on_chain: None,
            error_message: None,
            retry_count: 0,
        }
    }
}

/// Successful ledger anchoring of one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    pub request_id: String,
    pub tx_hash: String,
    pub log_hash_on_chain: String,
    pub block_height: u64,
}

/// Non-retriable failure of one task discovered during processing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub request_id: String,
    pub error_message: String,
}

impl Failure {
    pub fn new(request_id: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            error_message: error_message.into(),
        }
    }
}

/// Lowercase hex SHA-256 of a log payload.
pub fn content_hash(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}
