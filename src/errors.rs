//! Crate error taxonomy
//!
//! Variants follow the behavioral classes of the engine: transient
//! chain trouble retries, stale views reconcile, invariant breaches
//! carry a severity, and configuration problems fail loudly before the
//! worker ever plans an order.

use thiserror::Error;

use crate::asset::{Amount, Side};

/// How bad an invariant breach is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Breach within the recovery band: log, recalculate once, continue.
    Recoverable,
    /// Breach far beyond tolerance: schedule a resync, pause planning.
    Critical,
}

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("asset precision unavailable for '{0}'")]
    MissingPrecision(String),

    #[error("transient chain error: {0}")]
    Transient(String),

    #[error("order not found on chain: {0}")]
    StaleOrder(String),

    #[error("insufficient {side:?} funds: required {required}, available {available}")]
    InsufficientFunds {
        side: Side,
        required: Amount,
        available: Amount,
    },

    #[error("chain rejected batch as structurally invalid: {0}")]
    IllegalState(String),

    #[error("{side:?} ledger invariant {name} off by {magnitude} base units ({severity:?})")]
    Invariant {
        side: Side,
        name: &'static str,
        magnitude: Amount,
        severity: Severity,
    },

    #[error("grid generation advanced: expected {expected}, found {actual}")]
    GenerationConflict { expected: u64, actual: u64 },

    #[error("slot index out of range: {0}")]
    SlotNotFound(usize),

    #[error("timed out acquiring {0} lock")]
    LockTimeout(&'static str),

    #[error("operation cancelled")]
    Cancelled,

    #[error("worker halted after unrecoverable violation")]
    Halted,

    #[error("state persistence error: {0}")]
    Persist(String),

    #[error("credential daemon error: {0}")]
    Keyring(String),

    #[error("unsupported on this platform: {0}")]
    Unsupported(&'static str),
}

impl Error {
    /// True for errors the executor may retry with the same plan.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Persist(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Persist(err.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, Error>;
