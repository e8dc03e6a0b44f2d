//! The task store contract.
//!
//! [`TaskStore`] is the single source of truth that workers claim from and
//! report back to. Workers hold no state between calls; every operation is one
//! atomic batch. Two backends implement it: [`crate::db::Db`] (Postgres, the
//! production engine) and [`memory::MemoryStore`] (in-process).
//!
//! Batch mutations never fail because some rows changed status concurrently.
//! They report what they touched in a [`BatchReport`] and log a warning when
//! that is less than what was asked for.

pub mod memory;

use std::collections::{HashMap, HashSet};
use std::future::Future;

use crate::error::{Error, Result};
use crate::model::task::{Completion, Failure, NewTask, Status, TaskRecord};
use crate::telemetry::metrics;
use opentelemetry::KeyValue;

/// Rows requested versus rows actually changed by one batch mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchReport {
    pub requested: u64,
    pub affected: u64,
}

impl BatchReport {
    pub fn empty() -> Self {
        Self {
            requested: 0,
            affected: 0,
        }
    }

    /// Some rows were skipped (already transitioned, or unknown).
    pub fn is_partial(&self) -> bool {
        self.affected < self.requested
    }

    /// Log and count a mismatch. The caller's view may be stale; nothing is
    /// reconciled here.
    pub(crate) fn warn_if_partial(self, operation: &'static str) -> Self {
        if self.is_partial() {
            tracing::warn!(
                operation,
                requested = self.requested,
                affected = self.affected,
                "batch affected fewer rows than requested"
            );
            metrics::batch_mismatches().add(1, &[KeyValue::new("operation", operation)]);
        }
        self
    }
}

/// Count `count` tasks moving `from -> to`.
pub(crate) fn record_transitions(from: Status, to: Status, count: u64) {
    if count > 0 {
        metrics::task_transitions().add(
            count,
            &[
                KeyValue::new("from", from.as_str()),
                KeyValue::new("to", to.as_str()),
            ],
        );
    }
}

/// Atomic batch claim/commit over task records.
///
/// All trait methods use `impl Future` in their signatures so the trait needs
/// no `async-trait` shim; implementors write plain `async fn`.
pub trait TaskStore: Send + Sync + 'static {
    /// Enqueue new tasks as `RECEIVED`. Ids already present are skipped, first
    /// write wins.
    fn insert(&self, tasks: Vec<NewTask>) -> impl Future<Output = Result<BatchReport>> + Send;

    /// Lock the `RECEIVED` rows among `candidates` without waiting on rows
    /// held by another claim, fail those at the retry ceiling, and return the
    /// rest as `PROCESSING`.
    fn claim(
        &self,
        candidates: &[String],
        max_retries: u32,
    ) -> impl Future<Output = Result<HashMap<String, TaskRecord>>> + Send;

    /// `PROCESSING -> COMPLETED` with ledger anchoring fields.
    fn complete(
        &self,
        outcomes: Vec<Completion>,
    ) -> impl Future<Output = Result<BatchReport>> + Send;

    /// `PROCESSING -> FAILED` with a per-task reason.
    fn fail(&self, failures: Vec<Failure>) -> impl Future<Output = Result<BatchReport>> + Send;

    /// `PROCESSING -> RECEIVED`, incrementing `retry_count` and recording
    /// `last_error`.
    fn retry(
        &self,
        ids: &[String],
        last_error: &str,
    ) -> impl Future<Output = Result<BatchReport>> + Send;

    /// Point lookup by primary key.
    fn get_by_id(&self, request_id: &str) -> impl Future<Output = Result<TaskRecord>> + Send;

    /// Point lookup by content hash. When several tasks share a hash, the
    /// earliest inserted wins.
    fn get_by_hash(&self, log_hash: &str) -> impl Future<Output = Result<TaskRecord>> + Send;
}

// ---------------------------------------------------------------------------
// Input validation (shared by every backend, runs before any transaction)
// ---------------------------------------------------------------------------

fn require_id(id: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(Error::Validation("empty request_id in batch".to_string()));
    }
    Ok(())
}

/// Reject empty ids; collapse repeats, keeping first-seen order.
pub(crate) fn unique_ids(ids: &[String]) -> Result<Vec<String>> {
    let mut seen = HashSet::with_capacity(ids.len());
    let mut out = Vec::with_capacity(ids.len());
    for id in ids {
        require_id(id)?;
        if seen.insert(id.as_str()) {
            out.push(id.clone());
        }
    }
    Ok(out)
}

/// Reject empty ids and empty hashes; drop repeats so the first occurrence of
/// an id within the batch is the one stored.
pub(crate) fn validate_new_tasks(tasks: Vec<NewTask>) -> Result<Vec<NewTask>> {
    let mut seen = HashSet::with_capacity(tasks.len());
    let mut out = Vec::with_capacity(tasks.len());
    for task in tasks {
        require_id(&task.request_id)?;
        if task.log_hash.trim().is_empty() {
            return Err(Error::Validation(format!(
                "empty log_hash for request_id {}",
                task.request_id
            )));
        }
        if seen.insert(task.request_id.clone()) {
            out.push(task);
        }
    }
    Ok(out)
}

/// Reject empty ids, out-of-range block heights, and the same id appearing
/// twice with different outcomes.
pub(crate) fn validate_completions(outcomes: &[Completion]) -> Result<()> {
    let mut seen = HashSet::with_capacity(outcomes.len());
    for c in outcomes {
        require_id(&c.request_id)?;
        if i64::try_from(c.block_height).is_err() {
            return Err(Error::Validation(format!(
                "block_height {} out of range for request_id {}",
                c.block_height, c.request_id
            )));
        }
        if !seen.insert(c.request_id.as_str()) {
            return Err(Error::Validation(format!(
                "request_id {} appears twice in completion batch",
                c.request_id
            )));
        }
    }
    Ok(())
}

pub(crate) fn validate_failures(failures: &[Failure]) -> Result<()> {
    let mut seen = HashSet::with_capacity(failures.len());
    for f in failures {
        require_id(&f.request_id)?;
        if !seen.insert(f.request_id.as_str()) {
            return Err(Error::Validation(format!(
                "request_id {} appears twice in failure batch",
                f.request_id
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn unique_ids_keeps_first_seen_order() {
        let ids = vec!["b".to_string(), "a".to_string(), "b".to_string()];
        assert_eq!(unique_ids(&ids).unwrap(), vec!["b", "a"]);
    }

    #[test]
    fn blank_id_is_rejected() {
        let ids = vec!["a".to_string(), "  ".to_string()];
        assert!(matches!(unique_ids(&ids), Err(Error::Validation(_))));
    }

    #[test]
    fn duplicate_new_tasks_keep_first() {
        let now = Utc::now();
        let tasks = vec![
            NewTask::new("a", "h1", "org", now),
            NewTask::new("a", "h2", "org", now),
        ];
        let kept = validate_new_tasks(tasks).unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].log_hash, "h1");
    }

    #[test]
    fn completion_batch_rejects_conflicts() {
        let c = Completion {
            request_id: "a".into(),
            tx_hash: "0x1".into(),
            log_hash_on_chain: "h".into(),
            block_height: 1,
        };
        assert!(validate_completions(&[c.clone(), c.clone()]).is_err());

        let huge = Completion {
            block_height: u64::MAX,
            ..c
        };
        assert!(validate_completions(&[huge]).is_err());
    }

    #[test]
    fn partial_report() {
        let report = BatchReport {
            requested: 3,
            affected: 2,
        };
        assert!(report.is_partial());
        assert!(!BatchReport::empty().is_partial());
    }
}
