//! Gas-sponsoring relay submission.

use alloy_primitives::{Address, Bytes};
use async_trait::async_trait;
use thiserror::Error;

pub mod http;
pub mod submitter;

pub use http::SponsoredRelay;
pub use submitter::{RelaySubmitter, SubmitOutcome};

/// A call the relay executes and pays for.
#[derive(Debug, Clone, PartialEq)]
pub struct RelaySubmission {
    pub chain_id: u64,
    pub target: Address,
    pub data: Bytes,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RelayError {
    /// Timeouts, connection failures, 408/429/5xx. Safe to retry.
    #[error("relay temporarily unavailable: {0}")]
    Transient(String),

    /// The relay refused the call. Retrying cannot change the answer.
    #[error("relay rejected submission: {0}")]
    Terminal(String),
}

impl RelayError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RelayError::Transient(_))
    }
}

#[async_trait]
pub trait Relay: Send + Sync + 'static {
    /// Submit `submission`, returning the relay's task reference.
    async fn submit(&self, submission: &RelaySubmission) -> Result<String, RelayError>;
}
