//! # logaudit
//!
//! Postgres-backed claim/commit engine for log audit tasks.
//!
//! Producers insert tasks; workers claim disjoint batches with a
//! skip-locked claim, anchor them on an external ledger, and report back with
//! complete/fail/retry batches. The [`store::TaskStore`] contract is the single
//! source of truth; [`db::Db`] implements it on Postgres and
//! [`store::memory::MemoryStore`] in process. [`query`] serves org-filtered
//! reads on top of it.

pub mod config;
pub mod db;
pub mod error;
pub mod model;
pub mod query;
pub mod store;
pub mod telemetry;
