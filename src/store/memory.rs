//! In-process [`TaskStore`] backend.
//!
//! Every batch runs to completion under one mutex, so a claim can never
//! observe a row another claim is half-way through; that gives the same
//! disjoint-claim and all-or-nothing guarantees the Postgres backend gets
//! from `FOR UPDATE SKIP LOCKED` and transactions.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use opentelemetry::KeyValue;

use super::{
    BatchReport, TaskStore, record_transitions, unique_ids, validate_completions,
    validate_failures, validate_new_tasks,
};
use crate::error::{Error, Result};
use crate::model::task::{Completion, Failure, NewTask, Status, TaskRecord};
use crate::model::transition::plan_claim;
use crate::telemetry::metrics;

/// Task store held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tasks: Mutex<HashMap<String, TaskRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, TaskRecord>>> {
        self.tasks
            .lock()
            .map_err(|_| Error::Other("memory store lock poisoned".to_string()))
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.lock()?.is_empty())
    }
}

impl TaskStore for MemoryStore {
    async fn insert(&self, tasks: Vec<NewTask>) -> Result<BatchReport> {
        if tasks.is_empty() {
            return Ok(BatchReport::empty());
        }
        let requested = tasks.len() as u64;
        let tasks = validate_new_tasks(tasks)?;

        let now = Utc::now();
        let mut map = self.lock()?;
        let mut inserted = 0u64;
        for task in tasks {
            if !map.contains_key(&task.request_id) {
                map.insert(task.request_id.clone(), task.into_record(now));
                inserted += 1;
            }
        }
        drop(map);

        metrics::tasks_inserted().add(inserted, &[KeyValue::new("result", "inserted")]);
        metrics::tasks_inserted().add(
            requested - inserted,
            &[KeyValue::new("result", "duplicate")],
        );
        Ok(BatchReport {
            requested,
            affected: inserted,
        })
    }

    async fn claim(
        &self,
        candidates: &[String],
        max_retries: u32,
    ) -> Result<HashMap<String, TaskRecord>> {
        if candidates.is_empty() {
            return Ok(HashMap::new());
        }
        let candidates = unique_ids(candidates)?;

        let now = Utc::now();
        let mut map = self.lock()?;

        let locked = candidates.iter().filter_map(|id| {
            map.get(id)
                .filter(|r| r.status == Status::Received)
                .map(|r| (id.clone(), r.retry_count))
        });
        let plan = plan_claim(locked.collect::<Vec<_>>(), max_retries);

        for id in &plan.exhausted {
            if let Some(record) = map.get_mut(id) {
                record.exhaust_retries(max_retries, now);
            }
        }

        let mut claimed = HashMap::with_capacity(plan.claimable.len());
        for id in plan.claimable {
            if let Some(record) = map.get_mut(&id)
                && record.begin_processing(now)
            {
                claimed.insert(id, record.clone());
            }
        }
        drop(map);

        if !plan.exhausted.is_empty() {
            tracing::info!(
                count = plan.exhausted.len(),
                max_retries,
                "tasks reached retry ceiling, marked FAILED"
            );
        }
        record_transitions(Status::Received, Status::Failed, plan.exhausted.len() as u64);
        record_transitions(Status::Received, Status::Processing, claimed.len() as u64);
        Ok(claimed)
    }

    async fn complete(&self, outcomes: Vec<Completion>) -> Result<BatchReport> {
        if outcomes.is_empty() {
            return Ok(BatchReport::empty());
        }
        validate_completions(&outcomes)?;

        let now = Utc::now();
        let mut map = self.lock()?;
        let affected = outcomes
            .iter()
            .filter(|c| {
                map.get_mut(&c.request_id)
                    .is_some_and(|record| record.complete(c, now))
            })
            .count();
        drop(map);

        record_transitions(Status::Processing, Status::Completed, affected as u64);
        Ok(BatchReport {
            requested: outcomes.len() as u64,
            affected: affected as u64,
        }
        .warn_if_partial("complete"))
    }

    async fn fail(&self, failures: Vec<Failure>) -> Result<BatchReport> {
        if failures.is_empty() {
            return Ok(BatchReport::empty());
        }
        validate_failures(&failures)?;

        let now = Utc::now();
        let mut map = self.lock()?;
        let affected = failures
            .iter()
            .filter(|f| {
                map.get_mut(&f.request_id)
                    .is_some_and(|record| record.fail(&f.error_message, now))
            })
            .count();
        drop(map);

        record_transitions(Status::Processing, Status::Failed, affected as u64);
        Ok(BatchReport {
            requested: failures.len() as u64,
            affected: affected as u64,
        }
        .warn_if_partial("fail"))
    }

    async fn retry(&self, ids: &[String], last_error: &str) -> Result<BatchReport> {
        if ids.is_empty() {
            return Ok(BatchReport::empty());
        }
        let ids = unique_ids(ids)?;

        let mut map = self.lock()?;
        let affected = ids
            .iter()
            .filter(|id| {
                map.get_mut(id.as_str())
                    .is_some_and(|record| record.requeue(last_error))
            })
            .count();
        drop(map);

        record_transitions(Status::Processing, Status::Received, affected as u64);
        Ok(BatchReport {
            requested: ids.len() as u64,
            affected: affected as u64,
        }
        .warn_if_partial("retry"))
    }

    async fn get_by_id(&self, request_id: &str) -> Result<TaskRecord> {
        self.lock()?
            .get(request_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("request_id={request_id}")))
    }

    async fn get_by_hash(&self, log_hash: &str) -> Result<TaskRecord> {
        self.lock()?
            .values()
            .filter(|r| r.log_hash == log_hash)
            .min_by(|a, b| {
                (a.received_at_db, &a.request_id).cmp(&(b.received_at_db, &b.request_id))
            })
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("log_hash={log_hash}")))
    }
}
