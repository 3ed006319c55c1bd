//! Drives a signed request through the relay.
//!
//! A submission lease taken by compare-and-update guarantees one relay call
//! per request at a time; the request is re-read from the store before every
//! decision, never taken from a notification.

use std::sync::Arc;

use chrono::SubsecRound;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Relay, RelayError, RelaySubmission};
use crate::errors::AppError;
use crate::guard::{self, Window};
use crate::lifecycle::Lifecycle;
use crate::models::{AuthorizationPayload, RequestStatus, TokenDomain, Transition};
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::store::CasOutcome;

pub const DEFAULT_LEASE_SECS: i64 = 120;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum SubmitOutcome {
    Completed { reference: String },
    Failed { reason: String },
}

#[derive(Clone)]
pub struct RelaySubmitter {
    lifecycle: Lifecycle,
    relay: Arc<dyn Relay>,
    domain: TokenDomain,
    policy: RetryPolicy,
    lease: chrono::Duration,
}

impl RelaySubmitter {
    pub fn new(lifecycle: Lifecycle, relay: Arc<dyn Relay>, domain: TokenDomain) -> Self {
        Self {
            lifecycle,
            relay,
            domain,
            policy: RetryPolicy::default(),
            lease: chrono::Duration::seconds(DEFAULT_LEASE_SECS),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// How long a claim blocks other submitters and expiry. Must outlast the
    /// full retry schedule.
    pub fn with_lease(mut self, lease: chrono::Duration) -> Self {
        self.lease = lease;
        self
    }

    pub async fn submit(&self, id: Uuid) -> Result<SubmitOutcome, AppError> {
        let record = self.lifecycle.get(id).await?;
        match record.status {
            RequestStatus::Pending => return Err(AppError::NotSigned),
            RequestStatus::Signed => {}
            _ => return Err(AppError::AlreadyResolved),
        }

        let now = self.lifecycle.clock().now();
        if guard::check_window(&record, now) == Window::Passed {
            let expired = guard::expire_if_stale(&self.lifecycle, &record).await?;
            if expired.is_none() && record.submission_attempted_at.is_some() {
                tracing::warn!(
                    request_id = %id,
                    "window closed after a relay attempt, on-chain outcome unknown; left signed"
                );
            }
            return Err(AppError::Expired);
        }

        let (Some(payer), Some(signature)) = (record.payer_address, record.signature) else {
            return Err(AppError::Internal(anyhow::anyhow!(
                "signed request {} carries no signature",
                id
            )));
        };

        // Millisecond precision survives a round trip through every backend
        let lease_until = (now + self.lease).trunc_subsecs(3);
        let claimed = match self
            .lifecycle
            .advance(id, RequestStatus::Signed, Transition::Claim { lease_until, at: now })
            .await?
        {
            CasOutcome::Applied(record) => record,
            CasOutcome::Conflict(current) => {
                tracing::info!(request_id = %id, current = %current, "submission already in flight or resolved");
                return Err(AppError::AlreadyResolved);
            }
            CasOutcome::NotFound => return Err(AppError::NotFound),
        };

        let submission = RelaySubmission {
            chain_id: self.domain.chain_id,
            target: self.domain.verifying_contract,
            data: AuthorizationPayload::for_request(&claimed, payer).calldata(&signature),
        };

        tracing::info!(request_id = %id, chain_id = submission.chain_id, "submitting to relay");
        let relay = &self.relay;
        let result = retry_with_backoff(&self.policy, RelayError::is_transient, |attempt| {
            tracing::debug!(request_id = %id, attempt, "relay attempt");
            relay.submit(&submission)
        })
        .await;

        let at = self.lifecycle.clock().now();
        match result {
            Ok(reference) => {
                self.record(id, Transition::Complete { reference: reference.clone(), at })
                    .await?;
                Ok(SubmitOutcome::Completed { reference })
            }
            Err(RelayError::Terminal(reason)) => {
                self.record(id, Transition::Fail { reason: reason.clone(), at })
                    .await?;
                Ok(SubmitOutcome::Failed { reason })
            }
            Err(RelayError::Transient(reason)) => {
                // Stay signed and hand the lease back so the merchant can retry now
                self.record(id, Transition::Release { held_until: lease_until })
                    .await?;
                Err(AppError::RelayUnavailable(reason))
            }
        }
    }

    /// Commit the relay's verdict. Losing the race is logged, not escalated.
    async fn record(&self, id: Uuid, transition: Transition) -> Result<(), AppError> {
        let target = transition.target();
        match self
            .lifecycle
            .advance(id, RequestStatus::Signed, transition)
            .await?
        {
            CasOutcome::Applied(_) => {}
            CasOutcome::Conflict(current) => {
                tracing::warn!(
                    request_id = %id,
                    target = %target,
                    current = %current,
                    "relay outcome could not be recorded, request moved on"
                );
            }
            CasOutcome::NotFound => {
                tracing::warn!(request_id = %id, "request vanished while relaying");
            }
        }
        Ok(())
    }
}
