//! Public surface over the ledger: secure records, check digests, read history.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::error::LedgerError;
use crate::model::{ChainFault, Ledger, Record};

/// Wraps the process's single [`Ledger`].
///
/// All appends go through one mutex so the read-tip / hash / push sequence is
/// atomic with respect to concurrent callers.
#[derive(Debug)]
pub struct IntegrityFacade {
    ledger: Mutex<Ledger>,
}

impl IntegrityFacade {
    pub fn new(ledger: Ledger) -> Self {
        Self {
            ledger: Mutex::new(ledger),
        }
    }

    /// Facade over a fresh in-memory ledger.
    pub fn in_memory() -> Result<Self, LedgerError> {
        Ok(Self::new(Ledger::new()?))
    }

    /// Facade over a ledger persisted in `dir`.
    pub fn open(dir: &Path) -> Result<Self, LedgerError> {
        Ok(Self::new(Ledger::open(dir)?))
    }

    // Every mutation finishes before the guard drops, so a poisoned lock
    // still holds a consistent chain.
    fn lock(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append `record` to the ledger and return the new block's digest.
    ///
    /// Fails with [`LedgerError::Encoding`] if `record` is not a JSON object.
    pub fn secure<T: Serialize + ?Sized>(&self, record: &T) -> Result<String, LedgerError> {
        let payload = match serde_json::to_value(record) {
            Ok(Value::Object(map)) => map,
            Ok(other) => {
                return Err(LedgerError::Encoding(format!(
                    "record must be an object, got {}",
                    json_kind(&other)
                )))
            }
            Err(e) => return Err(LedgerError::Encoding(e.to_string())),
        };
        let block = self.lock().append(payload)?;
        info!(index = block.index, hash = %block.hash, "record secured");
        Ok(block.hash)
    }

    /// True if some block's stored hash equals `digest`.
    ///
    /// This is a linear scan over stored hashes; it does not re-hash content.
    pub fn verify_exists(&self, digest: &str) -> bool {
        self.lock().blocks().iter().any(|b| b.hash == digest)
    }

    pub fn history(&self) -> Vec<Record> {
        self.lock().history()
    }

    pub fn get(&self, index: u64) -> Result<Record, LedgerError> {
        self.lock().get(index).cloned()
    }

    pub fn is_valid(&self) -> bool {
        let valid = self.lock().verify();
        if !valid {
            warn!("ledger integrity check failed");
        }
        valid
    }

    pub fn audit(&self) -> Vec<ChainFault> {
        self.lock().audit()
    }

    /// Number of secured records.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
