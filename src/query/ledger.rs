//! Ledger lookup contract and on-chain payload decoding.
//!
//! The ledger client itself lives outside this crate. The query surface only
//! needs to fetch the raw payload anchored under a log hash.

use std::collections::HashMap;
use std::future::Future;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("ledger query failed: {0}")]
pub struct LedgerError(pub String);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("incomplete on-chain data: missing {0}")]
    MissingField(&'static str),
}

/// Read side of the external ledger.
pub trait Ledger: Send + Sync + 'static {
    /// The raw payload anchored under `log_hash`, `None` if nothing is.
    fn find_log_by_hash(
        &self,
        log_hash: &str,
    ) -> impl Future<Output = Result<Option<String>, LedgerError>> + Send;
}

/// Placeholder for a query service running without a ledger client.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLedger;

impl Ledger for NoLedger {
    async fn find_log_by_hash(&self, _log_hash: &str) -> Result<Option<String>, LedgerError> {
        Ok(None)
    }
}

/// A log record as anchored on the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnChainPayload {
    pub org_id: String,
    pub timestamp: String,
    pub content: String,
}

impl OnChainPayload {
    /// Decode the `org_id=..&ts=..&content=..` form the ledger contract
    /// stores. All three fields are required and must be non-empty.
    pub fn decode(raw: &str) -> Result<Self, DecodeError> {
        let mut fields: HashMap<String, String> = HashMap::new();
        for (key, value) in url::form_urlencoded::parse(raw.as_bytes()) {
            fields.entry(key.into_owned()).or_insert_with(|| value.into_owned());
        }
        let mut take = |key: &'static str| {
            fields
                .remove(key)
                .filter(|v| !v.is_empty())
                .ok_or(DecodeError::MissingField(key))
        };
        Ok(Self {
            org_id: take("org_id")?,
            timestamp: take("ts")?,
            content: take("content")?,
        })
    }
}
