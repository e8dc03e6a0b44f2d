//! Task state machine.
//!
//! Every backend runs a batch as: lock the eligible rows, partition them with
//! [`plan_claim`], then apply the per-record transitions below under the same
//! transaction. The functions here hold the rules; backends only hold locks.

use chrono::{DateTime, Utc};

use super::task::{Completion, Status, TaskRecord};

/// Prefix of the error message written when a task hits the retry ceiling.
pub const RETRY_EXHAUSTED_PREFIX: &str = "reached maximum retry count";

/// Error message recorded on tasks failed at claim time.
pub fn retry_exhausted_message(max_retries: u32) -> String {
    format!("{RETRY_EXHAUSTED_PREFIX} ({max_retries})")
}

/// Partition of the locked `RECEIVED` rows of one claim.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ClaimPlan {
    /// `retry_count >= max_retries`: go straight to `FAILED`, not returned.
    pub exhausted: Vec<String>,
    /// Handed to the caller as `PROCESSING`.
    pub claimable: Vec<String>,
}

impl ClaimPlan {
    pub fn is_empty(&self) -> bool {
        self.exhausted.is_empty() && self.claimable.is_empty()
    }
}

/// Split locked `(request_id, retry_count)` rows by the retry ceiling.
pub fn plan_claim<I, S>(locked: I, max_retries: u32) -> ClaimPlan
where
    I: IntoIterator<Item = (S, u32)>,
    S: Into<String>,
{
    let mut plan = ClaimPlan::default();
    for (id, retry_count) in locked {
        if retry_count >= max_retries {
            plan.exhausted.push(id.into());
        } else {
            plan.claimable.push(id.into());
        }
    }
    plan
}

// Each transition returns whether it applied. A `false` is the benign
// "status changed underneath the caller" case and leaves the record untouched.
impl TaskRecord {
    /// Move `from -> to` if the record is in `from` and the edge exists.
    fn advance(&mut self, from: Status, to: Status) -> bool {
        if self.status != from || !from.can_transition_to(to) {
            return false;
        }
        self.status = to;
        true
    }

    /// `RECEIVED -> PROCESSING`.
    pub fn begin_processing(&mut self, now: DateTime<Utc>) -> bool {
        if !self.advance(Status::Received, Status::Processing) {
            return false;
        }
        self.processing_started_at = Some(now);
        true
    }

    /// `RECEIVED -> FAILED` when the retry ceiling has been reached.
    pub fn exhaust_retries(&mut self, max_retries: u32, now: DateTime<Utc>) -> bool {
        if self.retry_count < max_retries || !self.advance(Status::Received, Status::Failed) {
            return false;
        }
        self.error_message = Some(retry_exhausted_message(max_retries));
        self.processing_finished_at = Some(now);
        true
    }

    /// `PROCESSING -> COMPLETED` with the ledger anchoring fields.
    pub fn complete(&mut self, outcome: &Completion, now: DateTime<Utc>) -> bool {
        if !self.advance(Status::Processing, Status::Completed) {
            return false;
        }
        self.tx_hash = Some(outcome.tx_hash.clone());
        self.log_hash_on_chain = Some(outcome.log_hash_on_chain.clone());
        self.block_height = Some(outcome.block_height);
        self.error_message = None;
        self.processing_finished_at = Some(now);
        true
    }

    /// `PROCESSING -> FAILED` for a non-retriable error.
    pub fn fail(&mut self, error_message: &str, now: DateTime<Utc>) -> bool {
        if !self.advance(Status::Processing, Status::Failed) {
            return false;
        }
        self.error_message = Some(error_message.to_string());
        self.processing_finished_at = Some(now);
        true
    }

    /// `PROCESSING -> RECEIVED`, consuming one retry.
    pub fn requeue(&mut self, last_error: &str) -> bool {
        if !self.advance(Status::Processing, Status::Received) {
            return false;
        }
        self.retry_count += 1;
        self.error_message = Some(last_error.to_string());
        self.processing_started_at = None;
        true
    }
}
