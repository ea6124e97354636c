use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Lease store unavailable for key {key:?}: {reason}")]
    StoreUnavailable { key: String, reason: String },

    #[error("Liveness oracle unavailable for session {session:?}: {reason}")]
    OracleUnavailable { session: String, reason: String },

    /// The engine reports corrupt values as `Holder::Corrupt` or
    /// `LeaseView::Corrupt`; this variant is for callers that flatten those
    /// outcomes into errors.
    #[error("Corrupt lease value stored under key {key:?}")]
    Corrupt { key: String },

    /// Counterpart of `RenewOutcome::LostOwnership` for callers that treat
    /// loss as an error
    #[error("Lease ownership lost for key {key:?}")]
    LostOwnership { key: String },

    #[error("Lease for key {key:?} still contended after {attempts} CAS rounds")]
    Contended { key: String, attempts: u32 },

    #[error("Timed out after {waited:?} waiting to acquire lease for key {key:?}")]
    AcquireTimeout { key: String, waited: Duration },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub(crate) fn store(key: &str, reason: impl ToString) -> Self {
        Self::StoreUnavailable {
            key: key.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Transient failures a caller may retry after backing off. Everything
    /// else needs a new acquisition or operator attention.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable { .. }
                | Self::OracleUnavailable { .. }
                | Self::Contended { .. }
                | Self::AcquireTimeout { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
