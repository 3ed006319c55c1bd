//! Background job: expire requests that outlived their validity window.
//!
//! Every tick expires stale pending/signed requests through compare-and-update,
//! so subscribers hear about them even if nobody touches the request again.
//! Also prunes notifier channels whose subscribers went away.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time;

use crate::guard;
use crate::lifecycle::Lifecycle;

/// Requests expired per tick at most; the next tick picks up the rest.
pub const BATCH_SIZE: usize = 500;

/// Spawn the background expiry task. Call this once at startup.
pub fn spawn(lifecycle: Lifecycle, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval(every);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            run_once(&lifecycle).await;
        }
    })
}

/// One sweep plus channel pruning. Errors are logged, never fatal.
pub async fn run_once(lifecycle: &Lifecycle) {
    match guard::sweep(lifecycle, BATCH_SIZE).await {
        Ok(report) if report.scanned > 0 => {
            tracing::debug!(
                scanned = report.scanned,
                expired = report.expired,
                "expiry job tick"
            );
        }
        Ok(_) => {}
        Err(e) => tracing::error!("expiry job failed: {}", e),
    }

    let pruned = lifecycle.notifier().prune();
    if pruned > 0 {
        tracing::debug!(pruned, "dropped idle status channels");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::issuer::RandomIssuer;
    use crate::models::{NewRequest, RequestStatus};
    use crate::store::memory::MemoryStore;
    use alloy_primitives::{address, U256};
    use chrono::DateTime;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_spawned_job_expires_and_notifies() {
        let clock = Arc::new(ManualClock::new(DateTime::from_timestamp(1_700_000_000, 0).unwrap()));
        let lifecycle =
            Lifecycle::new(Arc::new(MemoryStore::new()), Arc::new(RandomIssuer), clock.clone());
        let rec = lifecycle
            .create(&NewRequest {
                payee_address: address!("00000000000000000000000000000000000000aa"),
                amount: U256::from(1u8),
                valid_after: 0,
                valid_before: clock.now().timestamp() + 5,
            })
            .await
            .unwrap();
        let mut sub = lifecycle.subscribe(rec.id).await.unwrap();

        clock.advance(chrono::Duration::seconds(10));
        let job = spawn(lifecycle.clone(), Duration::from_millis(10));

        let change = time::timeout(Duration::from_secs(5), sub.next())
            .await
            .expect("expiry job never ran")
            .unwrap();
        assert_eq!(change.status, RequestStatus::Expired);
        job.abort();
    }
}
