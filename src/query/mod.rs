//! Read-only query surface over the task store.
//!
//! Lookups by request id and by log content only return records owned by
//! the caller's organization. The audit lookup reads straight from the
//! ledger and is unrestricted.
//!
//! The caller's organization is taken on trust: an upstream reverse proxy
//! authenticates requests and asserts the organization, and nothing in this
//! crate re-validates it.

pub mod ledger;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::Error;
use crate::model::task::{TaskRecord, content_hash};
use crate::store::TaskStore;
use ledger::{DecodeError, Ledger, LedgerError, NoLedger, OnChainPayload};

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("log not found")]
    NotFound,

    #[error("permission denied")]
    PermissionDenied,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("blockchain client not available")]
    LedgerUnavailable,

    #[error("blockchain query failed")]
    Ledger(#[source] LedgerError),

    #[error("failed to parse on-chain data")]
    Decode(#[from] DecodeError),

    #[error("failed to query database")]
    Internal(#[source] Error),
}

impl From<Error> for QueryError {
    fn from(err: Error) -> Self {
        match err {
            Error::NotFound(_) => QueryError::NotFound,
            Error::Validation(msg) => QueryError::InvalidRequest(msg),
            other => QueryError::Internal(other),
        }
    }
}

impl QueryError {
    /// HTTP status a transport layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            QueryError::NotFound => 404,
            QueryError::PermissionDenied => 403,
            QueryError::InvalidRequest(_) => 400,
            QueryError::LedgerUnavailable
            | QueryError::Ledger(_)
            | QueryError::Decode(_)
            | QueryError::Internal(_) => 500,
        }
    }

    /// Message safe to show the caller. Store and decode details stay in
    /// the logs.
    pub fn public_message(&self) -> String {
        match self {
            QueryError::NotFound | QueryError::PermissionDenied | QueryError::Ledger(_) => {
                self.to_string()
            }
            QueryError::InvalidRequest(msg) => msg.clone(),
            QueryError::LedgerUnavailable | QueryError::Decode(_) | QueryError::Internal(_) => {
                "internal server error".to_string()
            }
        }
    }
}

/// Task status as shown to the owning organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogStatusView {
    pub request_id: String,
    pub log_hash: String,
    pub source_org_id: String,
    pub status: String,
    pub received_timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_height: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_hash_on_chain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl From<TaskRecord> for LogStatusView {
    fn from(record: TaskRecord) -> Self {
        Self {
            request_id: record.request_id,
            log_hash: record.log_hash,
            source_org_id: record.source_org_id,
            status: record.status.to_string(),
            received_timestamp: record.received_timestamp,
            processing_started_at: record.processing_started_at,
            processing_finished_at: record.processing_finished_at,
            tx_hash: record.tx_hash,
            block_height: record.block_height,
            log_hash_on_chain: record.log_hash_on_chain,
            error_message: record.error_message,
        }
    }
}

/// Result of an audit lookup against the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnChainLog {
    pub source: String,
    pub log_hash: String,
    pub log_content: String,
    pub sender_org_id: String,
    pub timestamp: String,
}

/// Lookups over a [`TaskStore`] and, optionally, a [`Ledger`].
pub struct QueryService<S, L = NoLedger> {
    store: Arc<S>,
    ledger: Option<Arc<L>>,
}

impl<S: TaskStore> QueryService<S, NoLedger> {
    /// A query service without ledger access; audit lookups fail.
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            ledger: None,
        }
    }
}

impl<S: TaskStore, L: Ledger> QueryService<S, L> {
    pub fn with_ledger(store: Arc<S>, ledger: Arc<L>) -> Self {
        Self {
            store,
            ledger: Some(ledger),
        }
    }

    /// Status of one task, visible only to its own organization.
    pub async fn status_by_request_id(
        &self,
        request_id: &str,
        caller_org: &str,
    ) -> Result<LogStatusView, QueryError> {
        let request_id = path_segment(request_id, "request_id")?;
        let record = self.store.get_by_id(request_id).await.map_err(|e| {
            log_store_error(&e, "request_id", request_id);
            QueryError::from(e)
        })?;
        authorize(record, caller_org)
    }

    /// Status of the task whose payload hashes to the same digest as
    /// `content`, visible only to its own organization.
    pub async fn status_by_content(
        &self,
        content: &str,
        caller_org: &str,
    ) -> Result<LogStatusView, QueryError> {
        if content.is_empty() {
            return Err(QueryError::InvalidRequest(
                "log_content is required".to_string(),
            ));
        }
        let log_hash = content_hash(content);
        let record = self.store.get_by_hash(&log_hash).await.map_err(|e| {
            log_store_error(&e, "log_hash", &log_hash);
            QueryError::from(e)
        })?;
        authorize(record, caller_org)
    }

    /// The record anchored on the ledger under `log_hash`. Unrestricted:
    /// any consortium member may audit any organization's logs.
    pub async fn audit_by_hash(&self, log_hash: &str) -> Result<OnChainLog, QueryError> {
        let log_hash = path_segment(log_hash, "log_hash")?;
        let ledger = self.ledger.as_ref().ok_or(QueryError::LedgerUnavailable)?;

        let raw = ledger.find_log_by_hash(log_hash).await.map_err(|e| {
            tracing::error!(log_hash, error = %e, "ledger lookup failed");
            QueryError::Ledger(e)
        })?;
        let raw = match raw {
            Some(raw) if !raw.is_empty() => raw,
            _ => return Err(QueryError::NotFound),
        };

        let payload = OnChainPayload::decode(&raw).map_err(|e| {
            tracing::error!(log_hash, error = %e, "undecodable on-chain payload");
            e
        })?;
        Ok(OnChainLog {
            source: "blockchain".to_string(),
            log_hash: log_hash.to_string(),
            log_content: payload.content,
            sender_org_id: payload.org_id,
            timestamp: payload.timestamp,
        })
    }
}

/// Trim an identifier taken from a URL path and refuse traversal sequences.
fn path_segment<'a>(value: &'a str, field: &str) -> Result<&'a str, QueryError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(QueryError::InvalidRequest(format!("missing {field}")));
    }
    if value.contains("..") || value.contains('/') {
        return Err(QueryError::InvalidRequest(format!(
            "invalid {field}: path traversal characters not allowed"
        )));
    }
    Ok(value)
}

fn authorize(record: TaskRecord, caller_org: &str) -> Result<LogStatusView, QueryError> {
    if record.source_org_id != caller_org {
        tracing::warn!(
            caller_org,
            owner_org = %record.source_org_id,
            request_id = %record.request_id,
            "permission denied"
        );
        return Err(QueryError::PermissionDenied);
    }
    Ok(record.into())
}

fn log_store_error(err: &Error, key: &'static str, value: &str) {
    if !matches!(err, Error::NotFound(_)) {
        tracing::error!(key, value, error = %err, "task lookup failed");
    }
}
