//! Core data model.
//!
//! A task is one log to be anchored on the ledger. It has identity
//! (`request_id`), content identity (`log_hash`), an owning organization, and
//! a lifecycle status moved only by the store's batch transitions.

pub mod task;
pub mod transition;
