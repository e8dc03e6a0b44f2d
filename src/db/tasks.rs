//! Postgres task store: skip-locked claim and bulk status transitions.
//!
//! Every mutation runs in its own transaction with a server-side
//! `statement_timeout` and a client-side [`bounded`] deadline. Batches are
//! bound as a single JSON document and expanded with `jsonb_to_recordset`, so
//! each id travels with its own outcome fields.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use sqlx::types::Json;
use sqlx::{Postgres, Transaction};
use tracing::Instrument;

use super::{Db, bounded};
use crate::error::{Error, Result, db_err};
use crate::model::task::{Completion, Failure, NewTask, Status, TaskRecord};
use crate::model::transition::{plan_claim, retry_exhausted_message};
use crate::store::{
    BatchReport, TaskStore, record_transitions, unique_ids, validate_completions,
    validate_failures, validate_new_tasks,
};
use crate::telemetry::metrics;
use crate::telemetry::task::{record_batch_result, start_batch_span};

macro_rules! task_columns {
    () => {
        "request_id, log_hash, source_org_id, received_timestamp, status, received_at_db, \
         processing_started_at, processing_finished_at, tx_hash, block_height, \
         log_hash_on_chain, error_message, retry_count"
    };
}

impl Db {
    /// Begin a transaction whose statements the server aborts after `limit`.
    async fn begin_bounded(
        &self,
        operation: &'static str,
        limit: Duration,
    ) -> Result<Transaction<'static, Postgres>> {
        let mut tx = self.pool().begin().await.map_err(db_err(operation))?;
        sqlx::query("SELECT set_config('statement_timeout', $1, true)")
            .bind(format!("{}ms", limit.as_millis()))
            .execute(&mut *tx)
            .await
            .map_err(db_err(operation))?;
        Ok(tx)
    }

    async fn claim_tx(
        &self,
        candidates: &[String],
        max_retries: u32,
    ) -> Result<HashMap<String, TaskRecord>> {
        let mut tx = self
            .begin_bounded("claim.begin", self.options().batch_timeout)
            .await?;

        // 1. Lock the claimable rows, skipping any another claim holds.
        let locked: Vec<(String, i32)> = sqlx::query_as(
            "SELECT request_id, retry_count FROM tbl_log_status
             WHERE request_id = ANY($1) AND status = 'RECEIVED'
             FOR UPDATE SKIP LOCKED",
        )
        .bind(candidates)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err("claim.lock"))?;

        // 2. Partition by the retry ceiling.
        let plan = plan_claim(
            locked
                .into_iter()
                .map(|(id, retries)| (id, u32::try_from(retries).unwrap_or(0))),
            max_retries,
        );
        if plan.is_empty() {
            tx.commit().await.map_err(db_err("claim.commit"))?;
            return Ok(HashMap::new());
        }

        let now = Utc::now();

        // 3. Exhausted rows go straight to FAILED and are not returned.
        if !plan.exhausted.is_empty() {
            sqlx::query(
                "UPDATE tbl_log_status
                 SET status = 'FAILED', error_message = $1, processing_finished_at = $2
                 WHERE request_id = ANY($3) AND status = 'RECEIVED'",
            )
            .bind(retry_exhausted_message(max_retries))
            .bind(now)
            .bind(&plan.exhausted)
            .execute(&mut *tx)
            .await
            .map_err(db_err("claim.exhaust"))?;
            tracing::info!(
                count = plan.exhausted.len(),
                max_retries,
                "tasks reached retry ceiling, marked FAILED"
            );
        }

        // 4. The rest become PROCESSING and are handed to the caller.
        let rows: Vec<TaskRow> = if plan.claimable.is_empty() {
            Vec::new()
        } else {
            sqlx::query_as(concat!(
                "UPDATE tbl_log_status
                 SET status = 'PROCESSING', processing_started_at = $1
                 WHERE request_id = ANY($2) AND status = 'RECEIVED'
                 RETURNING ",
                task_columns!()
            ))
            .bind(now)
            .bind(&plan.claimable)
            .fetch_all(&mut *tx)
            .await
            .map_err(db_err("claim.mark_processing"))?
        };

        tx.commit().await.map_err(db_err("claim.commit"))?;

        record_transitions(Status::Received, Status::Failed, plan.exhausted.len() as u64);
        record_transitions(Status::Received, Status::Processing, rows.len() as u64);

        rows.into_iter()
            .map(|row| {
                let record = row.try_into_record()?;
                Ok((record.request_id.clone(), record))
            })
            .collect()
    }

    async fn complete_tx(&self, outcomes: &[Completion]) -> Result<u64> {
        let mut tx = self
            .begin_bounded("complete.begin", self.options().batch_timeout)
            .await?;
        let affected = sqlx::query(
            "UPDATE tbl_log_status AS t
             SET status = 'COMPLETED',
                 tx_hash = d.tx_hash,
                 log_hash_on_chain = d.log_hash_on_chain,
                 block_height = d.block_height,
                 error_message = NULL,
                 processing_finished_at = $2
             FROM jsonb_to_recordset($1) AS d(
                 request_id text, tx_hash text, log_hash_on_chain text, block_height bigint)
             WHERE t.request_id = d.request_id AND t.status = 'PROCESSING'",
        )
        .bind(Json(outcomes))
        .bind(Utc::now())
        .execute(&mut *tx)
        .await
        .map_err(db_err("complete.update"))?
        .rows_affected();
        tx.commit().await.map_err(db_err("complete.commit"))?;
        Ok(affected)
    }

    async fn fail_tx(&self, failures: &[Failure]) -> Result<u64> {
        let mut tx = self
            .begin_bounded("fail.begin", self.options().batch_timeout)
            .await?;
        let affected = sqlx::query(
            "UPDATE tbl_log_status AS t
             SET status = 'FAILED',
                 error_message = d.error_message,
                 processing_finished_at = $2
             FROM jsonb_to_recordset($1) AS d(request_id text, error_message text)
             WHERE t.request_id = d.request_id AND t.status = 'PROCESSING'",
        )
        .bind(Json(failures))
        .bind(Utc::now())
        .execute(&mut *tx)
        .await
        .map_err(db_err("fail.update"))?
        .rows_affected();
        tx.commit().await.map_err(db_err("fail.commit"))?;
        Ok(affected)
    }

    async fn retry_tx(&self, ids: &[String], last_error: &str) -> Result<u64> {
        let mut tx = self
            .begin_bounded("retry.begin", self.options().retry_timeout)
            .await?;
        let affected = sqlx::query(
            "UPDATE tbl_log_status
             SET status = 'RECEIVED',
                 retry_count = retry_count + 1,
                 error_message = $1,
                 processing_started_at = NULL
             WHERE request_id = ANY($2) AND status = 'PROCESSING'",
        )
        .bind(last_error)
        .bind(ids)
        .execute(&mut *tx)
        .await
        .map_err(db_err("retry.update"))?
        .rows_affected();
        tx.commit().await.map_err(db_err("retry.commit"))?;
        Ok(affected)
    }

    async fn insert_tx(&self, tasks: &[NewTask]) -> Result<u64> {
        let mut tx = self
            .begin_bounded("insert.begin", self.options().batch_timeout)
            .await?;
        let inserted = sqlx::query(
            "INSERT INTO tbl_log_status
                 (request_id, log_hash, source_org_id, received_timestamp, status, retry_count)
             SELECT d.request_id, d.log_hash, d.source_org_id, d.received_timestamp, 'RECEIVED', 0
             FROM jsonb_to_recordset($1) AS d(
                 request_id text, log_hash text, source_org_id text, received_timestamp timestamptz)
             ON CONFLICT (request_id) DO NOTHING",
        )
        .bind(Json(tasks))
        .execute(&mut *tx)
        .await
        .map_err(db_err("insert.execute"))?
        .rows_affected();
        tx.commit().await.map_err(db_err("insert.commit"))?;
        Ok(inserted)
    }
}

fn record_duration(operation: &'static str, started: Instant) {
    metrics::batch_duration_ms().record(
        started.elapsed().as_secs_f64() * 1000.0,
        &[KeyValue::new("operation", operation)],
    );
}

impl TaskStore for Db {
    async fn insert(&self, tasks: Vec<NewTask>) -> Result<BatchReport> {
        if tasks.is_empty() {
            return Ok(BatchReport::empty());
        }
        let requested = tasks.len() as u64;
        let tasks = validate_new_tasks(tasks)?;

        let span = start_batch_span("insert", tasks.len());
        let started = Instant::now();
        let inserted = bounded(
            "insert",
            self.options().batch_timeout,
            self.insert_tx(&tasks),
        )
        .instrument(span.clone())
        .await?;
        record_duration("insert", started);
        record_batch_result(&span, inserted);

        metrics::tasks_inserted().add(inserted, &[KeyValue::new("result", "inserted")]);
        metrics::tasks_inserted().add(
            requested - inserted,
            &[KeyValue::new("result", "duplicate")],
        );
        if inserted < requested {
            tracing::debug!(
                requested,
                inserted,
                "skipped tasks whose request_id already exists"
            );
        }
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

        let span = start_batch_span("claim", candidates.len());
        let started = Instant::now();
        let claimed = bounded(
            "claim",
            self.options().batch_timeout,
            self.claim_tx(&candidates, max_retries),
        )
        .instrument(span.clone())
        .await?;
        record_duration("claim", started);
        record_batch_result(&span, claimed.len() as u64);
        Ok(claimed)
    }

    async fn complete(&self, outcomes: Vec<Completion>) -> Result<BatchReport> {
        if outcomes.is_empty() {
            return Ok(BatchReport::empty());
        }
        validate_completions(&outcomes)?;

        let span = start_batch_span("complete", outcomes.len());
        let started = Instant::now();
        let affected = bounded(
            "complete",
            self.options().batch_timeout,
            self.complete_tx(&outcomes),
        )
        .instrument(span.clone())
        .await?;
        record_duration("complete", started);
        record_batch_result(&span, affected);
        record_transitions(Status::Processing, Status::Completed, affected);

        Ok(BatchReport {
            requested: outcomes.len() as u64,
            affected,
        }
        .warn_if_partial("complete"))
    }

    async fn fail(&self, failures: Vec<Failure>) -> Result<BatchReport> {
        if failures.is_empty() {
            return Ok(BatchReport::empty());
        }
        validate_failures(&failures)?;

        let span = start_batch_span("fail", failures.len());
        let started = Instant::now();
        let affected = bounded(
            "fail",
            self.options().batch_timeout,
            self.fail_tx(&failures),
        )
        .instrument(span.clone())
        .await?;
        record_duration("fail", started);
        record_batch_result(&span, affected);
        record_transitions(Status::Processing, Status::Failed, affected);

        Ok(BatchReport {
            requested: failures.len() as u64,
            affected,
        }
        .warn_if_partial("fail"))
    }

    async fn retry(&self, ids: &[String], last_error: &str) -> Result<BatchReport> {
        if ids.is_empty() {
            return Ok(BatchReport::empty());
        }
        let ids = unique_ids(ids)?;

        let span = start_batch_span("retry", ids.len());
        let started = Instant::now();
        let affected = bounded(
            "retry",
            self.options().retry_timeout,
            self.retry_tx(&ids, last_error),
        )
        .instrument(span.clone())
        .await?;
        record_duration("retry", started);
        record_batch_result(&span, affected);
        record_transitions(Status::Processing, Status::Received, affected);

        Ok(BatchReport {
            requested: ids.len() as u64,
            affected,
        }
        .warn_if_partial("retry"))
    }

    async fn get_by_id(&self, request_id: &str) -> Result<TaskRecord> {
        let row: Option<TaskRow> = sqlx::query_as(concat!(
            "SELECT ",
            task_columns!(),
            " FROM tbl_log_status WHERE request_id = $1"
        ))
        .bind(request_id)
        .fetch_optional(self.pool())
        .await
        .map_err(db_err("get_by_id"))?;

        row.ok_or_else(|| Error::NotFound(format!("request_id={request_id}")))?
            .try_into_record()
    }

    async fn get_by_hash(&self, log_hash: &str) -> Result<TaskRecord> {
        let row: Option<TaskRow> = sqlx::query_as(concat!(
            "SELECT ",
            task_columns!(),
            " FROM tbl_log_status WHERE log_hash = $1
              ORDER BY received_at_db ASC, request_id ASC
              LIMIT 1"
        ))
        .bind(log_hash)
        .fetch_optional(self.pool())
        .await
        .map_err(db_err("get_by_hash"))?;

        row.ok_or_else(|| Error::NotFound(format!("log_hash={log_hash}")))?
            .try_into_record()
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct TaskRow {
    request_id: String,
    log_hash: String,
    source_org_id: String,
    received_timestamp: DateTime<Utc>,
    status: String,
    received_at_db: DateTime<Utc>,
    processing_started_at: Option<DateTime<Utc>>,
    processing_finished_at: Option<DateTime<Utc>>,
    tx_hash: Option<String>,
    block_height: Option<i64>,
    log_hash_on_chain: Option<String>,
    error_message: Option<String>,
    retry_count: i32,
}

impl TaskRow {
    fn try_into_record(self) -> Result<TaskRecord> {
        Ok(TaskRecord {
            status: self.status.parse()?,
            request_id: self.request_id,
            log_hash: self.log_hash,
            source_org_id: self.source_org_id,
            received_timestamp: self.received_timestamp,
            received_at_db: self.received_at_db,
            processing_started_at: self.processing_started_at,
            processing_finished_at: self.processing_finished_at,
            tx_hash: self.tx_hash,
            block_height: self.block_height.map(|h| h as u64),
            log_hash_on_chain: self.log_hash_on_chain,
            error_message: self.error_message,
            retry_count: self.retry_count as u32,
        })
    }
}
