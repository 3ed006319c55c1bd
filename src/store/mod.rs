//! Durable storage for payment-authorization requests.
//!
//! Every status change goes through [`RequestStore::compare_and_update`]; no
//! backend ever read-modify-writes a record without it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::errors::AppError;
use crate::issuer::Issuer;
use crate::models::{NewRequest, PaymentAuthorizationRequest, RequestStatus, Transition};

pub mod memory;
pub mod postgres;

/// Result of a conditional update.
#[derive(Debug, Clone, PartialEq)]
pub enum CasOutcome {
    /// The transition was applied; carries the record as committed.
    Applied(PaymentAuthorizationRequest),
    /// The precondition failed; carries the status currently stored.
    Conflict(RequestStatus),
    NotFound,
}

#[async_trait]
pub trait RequestStore: Send + Sync + 'static {
    /// Insert `record` unless a pending or signed request already holds its pin.
    /// Returns `false` when the pin is taken.
    async fn insert_if_pin_free(&self, record: &PaymentAuthorizationRequest) -> anyhow::Result<bool>;

    async fn get(&self, id: Uuid) -> anyhow::Result<Option<PaymentAuthorizationRequest>>;

    /// The live request holding `pin`, else the most recently created one.
    async fn get_by_pin(&self, pin: &str) -> anyhow::Result<Option<PaymentAuthorizationRequest>>;

    /// Apply `transition` only if the stored status still equals `expected` and
    /// the transition permits the stored record. Linearizable per id.
    async fn compare_and_update(
        &self,
        id: Uuid,
        expected: RequestStatus,
        transition: Transition,
    ) -> anyhow::Result<CasOutcome>;

    /// Pending or signed requests whose `valid_before` lies before `now`, oldest first.
    async fn list_expirable(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> anyhow::Result<Vec<PaymentAuthorizationRequest>>;

    /// Create a pending request, drawing fresh pins until one is free.
    async fn create(
        &self,
        issuer: &dyn Issuer,
        new: &NewRequest,
        now: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<PaymentAuthorizationRequest, AppError> {
        new.validate()?;

        let attempts = max_attempts.max(1);
        for attempt in 1..=attempts {
            let issued = issuer.issue();
            let record = PaymentAuthorizationRequest::new_pending(new, issued.pin, issued.nonce, now);
            if self.insert_if_pin_free(&record).await? {
                return Ok(record);
            }
            tracing::debug!(attempt, "pin already held by a live request, drawing another");
        }

        tracing::warn!(attempts, "pin allocation exhausted");
        Err(AppError::ResourceExhausted { attempts })
    }
}
