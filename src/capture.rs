//! Attaches a payer's signature to the pending request behind a PIN.
//!
//! Signatures are checked for shape only. Whether they recover to the payer is
//! decided on-chain by the token contract when the relay submits.

use alloy_primitives::Address;

use crate::errors::AppError;
use crate::guard::{self, Window};
use crate::lifecycle::Lifecycle;
use crate::models::{AuthorizationSignature, PaymentAuthorizationRequest, RequestStatus, Transition};
use crate::store::CasOutcome;

#[derive(Clone)]
pub struct AuthorizationCapture {
    lifecycle: Lifecycle,
}

impl AuthorizationCapture {
    pub fn new(lifecycle: Lifecycle) -> Self {
        Self { lifecycle }
    }

    pub async fn attach_signature(
        &self,
        pin: &str,
        payer: Address,
        signature: AuthorizationSignature,
    ) -> Result<PaymentAuthorizationRequest, AppError> {
        if payer == Address::ZERO {
            return Err(AppError::InvalidInput("payer address must not be zero".into()));
        }

        let record = self.lifecycle.get_by_pin(pin).await?;
        let now = self.lifecycle.clock().now();

        match guard::check_window(&record, now) {
            Window::Passed => {
                guard::expire_if_stale(&self.lifecycle, &record).await?;
                return Err(AppError::Expired);
            }
            Window::NotYetOpen => return Err(AppError::Expired),
            Window::Open => {}
        }

        if record.status != RequestStatus::Pending {
            return Err(AppError::AlreadyResolved);
        }

        let outcome = self
            .lifecycle
            .advance(
                record.id,
                RequestStatus::Pending,
                Transition::Sign {
                    payer,
                    signature,
                    at: now,
                },
            )
            .await?;

        match outcome {
            CasOutcome::Applied(signed) => {
                tracing::info!(request_id = %signed.id, payer = %payer, "signature captured");
                Ok(signed)
            }
            CasOutcome::Conflict(_) => Err(AppError::AlreadyResolved),
            CasOutcome::NotFound => Err(AppError::NotFound),
        }
    }
}
