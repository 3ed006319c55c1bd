//! Validity-window checks and cooperative expiry.

use chrono::{DateTime, Utc};

use crate::errors::AppError;
use crate::lifecycle::Lifecycle;
use crate::models::{PaymentAuthorizationRequest, Transition};
use crate::store::CasOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Window {
    NotYetOpen,
    Open,
    Passed,
}

/// Where `now` falls relative to `[valid_after, valid_before]`, both inclusive.
pub fn check_window(record: &PaymentAuthorizationRequest, now: DateTime<Utc>) -> Window {
    let now = now.timestamp();
    if now > record.valid_before {
        Window::Passed
    } else if now < record.valid_after {
        Window::NotYetOpen
    } else {
        Window::Open
    }
}

/// Expire `record` if its window has passed. Losing the race to another writer
/// is fine: whoever won decided the outcome. Returns the committed record when
/// this call expired it.
pub async fn expire_if_stale(
    lifecycle: &Lifecycle,
    record: &PaymentAuthorizationRequest,
) -> Result<Option<PaymentAuthorizationRequest>, AppError> {
    let now = lifecycle.clock().now();
    if record.status.is_terminal() || check_window(record, now) != Window::Passed {
        return Ok(None);
    }

    match lifecycle
        .advance(record.id, record.status, Transition::Expire { at: now })
        .await?
    {
        CasOutcome::Applied(expired) => Ok(Some(expired)),
        CasOutcome::Conflict(current) => {
            tracing::debug!(request_id = %record.id, current = %current, "expiry lost the race");
            Ok(None)
        }
        CasOutcome::NotFound => Ok(None),
    }
}

/// Totals from one expiry pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub expired: usize,
}

/// Expire every stale pending/signed request, up to `limit` of them.
pub async fn sweep(lifecycle: &Lifecycle, limit: usize) -> Result<SweepReport, AppError> {
    let now = lifecycle.clock().now();
    let stale = lifecycle.store().list_expirable(now, limit).await?;

    let mut report = SweepReport {
        scanned: stale.len(),
        expired: 0,
    };
    for record in &stale {
        if expire_if_stale(lifecycle, record).await?.is_some() {
            report.expired += 1;
        }
    }

    if report.expired > 0 {
        tracing::info!(scanned = report.scanned, expired = report.expired, "expiry sweep finished");
    }
    Ok(report)
}
