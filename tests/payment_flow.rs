//! End-to-end payment flows against the in-memory store.
//!
//! These tests drive the library the way the HTTP layer does: a merchant
//! creates a request, a payer attaches a signature by PIN, and the merchant
//! relays it. Time is controlled with `ManualClock`, the relay is scripted.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{address, Address, B256, U256};
use async_trait::async_trait;
use chrono::DateTime;
use tokio::sync::Notify;
use uuid::Uuid;

use pinpay::capture::AuthorizationCapture;
use pinpay::clock::{Clock, ManualClock};
use pinpay::errors::AppError;
use pinpay::issuer::RandomIssuer;
use pinpay::lifecycle::Lifecycle;
use pinpay::models::{AuthorizationSignature, NewRequest, RequestStatus, TokenDomain};
use pinpay::relay::{Relay, RelayError, RelaySubmission, RelaySubmitter, SubmitOutcome};
use pinpay::retry::RetryPolicy;
use pinpay::store::memory::MemoryStore;

const T0: i64 = 1_700_000_000;
const PAYEE: Address = address!("00000000000000000000000000000000000000aa");

// ── Fixtures ─────────────────────────────────────────────────

/// Relay that succeeds immediately and counts its calls.
#[derive(Default)]
struct CountingRelay {
    calls: AtomicU32,
}

#[async_trait]
impl Relay for CountingRelay {
    async fn submit(&self, _: &RelaySubmission) -> Result<String, RelayError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("0xtask{:04}", n))
    }
}

/// Relay whose every call times out from the client's side.
#[derive(Default)]
struct TimeoutRelay {
    calls: AtomicU32,
}

#[async_trait]
impl Relay for TimeoutRelay {
    async fn submit(&self, _: &RelaySubmission) -> Result<String, RelayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(RelayError::Transient("operation timed out".into()))
    }
}

/// Relay that parks inside `submit` until released.
#[derive(Default)]
struct GatedRelay {
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl Relay for GatedRelay {
    async fn submit(&self, _: &RelaySubmission) -> Result<String, RelayError> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok("0xgated".to_string())
    }
}

struct Harness {
    clock: Arc<ManualClock>,
    lifecycle: Lifecycle,
    capture: AuthorizationCapture,
}

impl Harness {
    fn new() -> Self {
        let clock = Arc::new(ManualClock::new(DateTime::from_timestamp(T0, 0).unwrap()));
        let lifecycle = Lifecycle::new(
            Arc::new(MemoryStore::new()),
            Arc::new(RandomIssuer),
            clock.clone(),
        );
        let capture = AuthorizationCapture::new(lifecycle.clone());
        Self {
            clock,
            lifecycle,
            capture,
        }
    }

    fn now(&self) -> i64 {
        self.clock.now().timestamp()
    }

    fn submitter(&self, relay: Arc<dyn Relay>) -> RelaySubmitter {
        RelaySubmitter::new(self.lifecycle.clone(), relay, domain()).with_policy(RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 2,
            jitter_ms: 0,
        })
    }

    async fn create(&self, amount: U256, valid_before: i64) -> (Uuid, String) {
        let record = self
            .lifecycle
            .create(&NewRequest {
                payee_address: PAYEE,
                amount,
                valid_after: 0,
                valid_before,
            })
            .await
            .unwrap();
        (record.id, record.pin)
    }
}

fn domain() -> TokenDomain {
    TokenDomain {
        name: "USD Coin".into(),
        version: "2".into(),
        chain_id: 84532,
        verifying_contract: address!("036CbD53842c5426634e7929541eC2318f3dCF7e"),
    }
}

fn signature(seed: u8) -> AuthorizationSignature {
    AuthorizationSignature::new(27, B256::repeat_byte(seed), B256::repeat_byte(seed ^ 0x5a)).unwrap()
}

fn payer(n: u8) -> Address {
    Address::repeat_byte(n)
}

fn one_token() -> U256 {
    U256::from(10u64).pow(U256::from(18u64))
}

// ── Happy path ───────────────────────────────────────────────

mod happy_path_tests {
    use super::*;

    #[tokio::test]
    async fn test_sign_then_relay_completes_exactly_once() {
        let h = Harness::new();
        let relay = Arc::new(CountingRelay::default());
        let submitter = h.submitter(relay.clone());
        let (id, pin) = h.create(one_token(), h.now() + 300).await;

        let signed = tokio_test::assert_ok!(h.capture.attach_signature(&pin, payer(0xbb), signature(1)).await);
        assert_eq!(signed.status, RequestStatus::Signed);
        assert_eq!(signed.payer_address, Some(payer(0xbb)));

        let second = tokio_test::assert_err!(
            h.capture.attach_signature(&pin, payer(0xbb), signature(2)).await
        );
        assert!(matches!(second, AppError::AlreadyResolved));
        // The first signature stands
        assert_eq!(h.lifecycle.get(id).await.unwrap().signature, Some(signature(1)));

        let outcome = tokio_test::assert_ok!(submitter.submit(id).await);
        let SubmitOutcome::Completed { reference } = outcome else {
            panic!("expected completion, got {:?}", outcome);
        };
        assert!(!reference.is_empty());

        let record = h.lifecycle.get(id).await.unwrap();
        assert_eq!(record.status, RequestStatus::Completed);
        assert_eq!(record.result_reference.as_deref(), Some(reference.as_str()));
        assert!(record.completed_at.is_some());

        let again = tokio_test::assert_err!(submitter.submit(id).await);
        assert!(matches!(again, AppError::AlreadyResolved));
        assert_eq!(relay.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.lifecycle.get(id).await.unwrap().result_reference, record.result_reference);
    }

    #[tokio::test]
    async fn test_already_expired_request_never_accepts_a_signature() {
        let h = Harness::new();
        let (id, pin) = h.create(one_token(), h.now() - 1).await;

        let err = tokio_test::assert_err!(h.capture.attach_signature(&pin, payer(0xbb), signature(1)).await);
        assert!(matches!(err, AppError::Expired));

        let record = h.lifecycle.get(id).await.unwrap();
        assert_eq!(record.status, RequestStatus::Expired);
        assert!(record.signature.is_none());
    }

    #[tokio::test]
    async fn test_pin_is_reusable_once_request_resolves() {
        let h = Harness::new();
        let relay = Arc::new(CountingRelay::default());
        let (id, pin) = h.create(one_token(), h.now() + 300).await;

        h.capture.attach_signature(&pin, payer(0xbb), signature(1)).await.unwrap();
        h.submitter(relay).submit(id).await.unwrap();

        // Terminal requests stay reachable by PIN for receipts
        let by_pin = h.lifecycle.get_by_pin(&pin).await.unwrap();
        assert_eq!(by_pin.id, id);
        assert_eq!(by_pin.status, RequestStatus::Completed);
    }
}

// ── Races ────────────────────────────────────────────────────

mod concurrency_tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_payers_one_signature_wins() {
        let h = Arc::new(Harness::new());
        let (id, pin) = h.create(one_token(), h.now() + 300).await;

        let mut tasks = Vec::new();
        for n in 1..=8u8 {
            let h = h.clone();
            let pin = pin.clone();
            tasks.push(tokio::spawn(async move {
                h.capture.attach_signature(&pin, payer(n), signature(n)).await
            }));
        }

        let mut winners = Vec::new();
        for task in tasks {
            match task.await.unwrap() {
                Ok(record) => winners.push(record),
                Err(AppError::AlreadyResolved) => {}
                Err(e) => panic!("unexpected error: {}", e),
            }
        }

        assert_eq!(winners.len(), 1);
        let stored = h.lifecycle.get(id).await.unwrap();
        assert_eq!(stored.payer_address, winners[0].payer_address);
        assert_eq!(stored.signature, winners[0].signature);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_submits_reach_the_relay_once() {
        let h = Harness::new();
        let relay = Arc::new(CountingRelay::default());
        let submitter = h.submitter(relay.clone());
        let (id, pin) = h.create(one_token(), h.now() + 300).await;
        h.capture.attach_signature(&pin, payer(0xbb), signature(1)).await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let submitter = submitter.clone();
            tasks.push(tokio::spawn(async move { submitter.submit(id).await }));
        }

        let mut completed = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(SubmitOutcome::Completed { .. }) => completed += 1,
                Ok(other) => panic!("unexpected outcome: {:?}", other),
                Err(AppError::AlreadyResolved) => {}
                Err(e) => panic!("unexpected error: {}", e),
            }
        }

        assert_eq!(completed, 1);
        assert_eq!(relay.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.lifecycle.get(id).await.unwrap().status, RequestStatus::Completed);
    }

    #[tokio::test]
    async fn test_expiry_waits_for_in_flight_submission() {
        let h = Harness::new();
        let relay = Arc::new(GatedRelay::default());
        let submitter = h.submitter(relay.clone());
        let (id, pin) = h.create(one_token(), h.now() + 60).await;
        h.capture.attach_signature(&pin, payer(0xbb), signature(1)).await.unwrap();

        let in_flight = tokio::spawn(async move { submitter.submit(id).await });
        relay.entered.notified().await;

        // Window has passed but the relay already has the authorization
        h.clock.advance(chrono::Duration::seconds(90));
        let report = pinpay::guard::sweep(&h.lifecycle, 100).await.unwrap();
        assert_eq!(report.expired, 0);
        assert_eq!(h.lifecycle.get(id).await.unwrap().status, RequestStatus::Signed);

        relay.release.notify_one();
        let outcome = in_flight.await.unwrap().unwrap();
        assert!(matches!(outcome, SubmitOutcome::Completed { .. }));
        assert_eq!(h.lifecycle.get(id).await.unwrap().status, RequestStatus::Completed);

        // Once terminal, the sweep leaves it alone
        let report = pinpay::guard::sweep(&h.lifecycle, 100).await.unwrap();
        assert_eq!(report.expired, 0);
    }

    #[tokio::test]
    async fn test_timed_out_submission_outlives_its_window() {
        let h = Harness::new();
        let relay = Arc::new(TimeoutRelay::default());
        let submitter = h.submitter(relay.clone());
        let (id, pin) = h.create(one_token(), h.now() + 60).await;
        h.capture.attach_signature(&pin, payer(0xbb), signature(1)).await.unwrap();

        let err = tokio_test::assert_err!(submitter.submit(id).await);
        assert!(matches!(err, AppError::RelayUnavailable(_)));
        assert_eq!(relay.calls.load(Ordering::SeqCst), 3);

        h.clock.advance(chrono::Duration::seconds(61));
        let report = pinpay::guard::sweep(&h.lifecycle, 100).await.unwrap();
        assert_eq!(report.expired, 0);

        let record = h.lifecycle.get(id).await.unwrap();
        assert_eq!(record.status, RequestStatus::Signed);
        assert!(record.submission_attempted_at.is_some());
        assert!(record.submission_lease_until.is_none());
    }

    #[tokio::test]
    async fn test_sweep_expires_abandoned_requests() {
        let h = Harness::new();
        let (pending, _) = h.create(one_token(), h.now() + 30).await;
        let (signed, pin) = h.create(one_token(), h.now() + 30).await;
        let (fresh, _) = h.create(one_token(), h.now() + 600).await;
        h.capture.attach_signature(&pin, payer(0xbb), signature(1)).await.unwrap();

        h.clock.advance(chrono::Duration::seconds(31));
        let report = pinpay::guard::sweep(&h.lifecycle, 100).await.unwrap();

        assert_eq!(report.expired, 2);
        assert_eq!(h.lifecycle.get(pending).await.unwrap().status, RequestStatus::Expired);
        assert_eq!(h.lifecycle.get(signed).await.unwrap().status, RequestStatus::Expired);
        assert_eq!(h.lifecycle.get(fresh).await.unwrap().status, RequestStatus::Pending);
    }
}

// ── Status feed ──────────────────────────────────────────────

mod subscription_tests {
    use super::*;
    use pinpay::notification::StatusChange;

    async fn next(sub: &mut pinpay::notification::Subscription) -> Option<StatusChange> {
        tokio::time::timeout(Duration::from_secs(2), sub.next())
            .await
            .expect("status feed stalled")
    }

    #[tokio::test]
    async fn test_watch_follows_request_to_completion() {
        let h = Harness::new();
        let (id, pin) = h.create(one_token(), h.now() + 300).await;
        let (snapshot, mut sub) = h.lifecycle.watch(id).await.unwrap();
        assert_eq!(snapshot.status, RequestStatus::Pending);

        h.capture.attach_signature(&pin, payer(0xbb), signature(1)).await.unwrap();
        assert_eq!(next(&mut sub).await.unwrap().status, RequestStatus::Signed);

        h.submitter(Arc::new(CountingRelay::default())).submit(id).await.unwrap();
        assert_eq!(next(&mut sub).await.unwrap().status, RequestStatus::Completed);
        assert!(next(&mut sub).await.is_none());
    }

    #[tokio::test]
    async fn test_stale_change_is_not_replayed() {
        let h = Harness::new();
        let (id, pin) = h.create(one_token(), h.now() + 300).await;
        let mut sub = h.lifecycle.subscribe(id).await.unwrap();

        h.capture.attach_signature(&pin, payer(0xbb), signature(1)).await.unwrap();
        assert_eq!(next(&mut sub).await.unwrap().status, RequestStatus::Signed);

        // A delayed "pending" arriving after "signed" goes nowhere
        let delivered = h.lifecycle.notifier().publish(StatusChange {
            id,
            status: RequestStatus::Pending,
            timestamp: h.clock.now(),
        });
        assert_eq!(delivered, 0);

        h.clock.advance(chrono::Duration::seconds(301));
        pinpay::guard::sweep(&h.lifecycle, 10).await.unwrap();
        assert_eq!(next(&mut sub).await.unwrap().status, RequestStatus::Expired);
        assert!(next(&mut sub).await.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_signed_change_does_not_relay_twice() {
        let h = Harness::new();
        let relay = Arc::new(CountingRelay::default());
        let submitter = h.submitter(relay.clone());
        let (id, pin) = h.create(one_token(), h.now() + 300).await;
        let mut sub = h.lifecycle.subscribe(id).await.unwrap();

        // A consumer that relays whenever it hears "signed"
        let on_change = |change: StatusChange| {
            let submitter = submitter.clone();
            async move {
                if change.status == RequestStatus::Signed {
                    Some(submitter.submit(change.id).await)
                } else {
                    None
                }
            }
        };

        h.capture.attach_signature(&pin, payer(0xbb), signature(1)).await.unwrap();
        let signed = next(&mut sub).await.unwrap();
        let first = on_change(signed.clone()).await.unwrap();
        assert!(matches!(first, Ok(SubmitOutcome::Completed { .. })));

        // The same change delivered again, late
        let replay = on_change(signed).await.unwrap();
        assert!(matches!(replay, Err(AppError::AlreadyResolved)));
        assert_eq!(relay.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.lifecycle.get(id).await.unwrap().status, RequestStatus::Completed);
    }

    #[tokio::test]
    async fn test_watching_a_terminal_request_yields_snapshot_only() {
        let h = Harness::new();
        let (id, pin) = h.create(one_token(), h.now() - 1).await;
        let _ = h.capture.attach_signature(&pin, payer(0xbb), signature(1)).await;

        let (snapshot, mut sub) = h.lifecycle.watch(id).await.unwrap();
        assert_eq!(snapshot.status, RequestStatus::Expired);
        assert!(next(&mut sub).await.is_none());
    }

    #[tokio::test]
    async fn test_subscribe_with_delivers_to_callback() {
        let h = Harness::new();
        let (id, pin) = h.create(one_token(), h.now() + 300).await;
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let handle = h
            .lifecycle
            .subscribe_with(id, move |change| {
                let _ = tx.send(change.status);
            })
            .await
            .unwrap();

        h.capture.attach_signature(&pin, payer(0xbb), signature(1)).await.unwrap();
        h.submitter(Arc::new(CountingRelay::default())).submit(id).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();

        let mut seen = Vec::new();
        while let Ok(status) = rx.try_recv() {
            seen.push(status);
        }
        assert_eq!(seen, vec![RequestStatus::Signed, RequestStatus::Completed]);
    }
}

// ── Webhooks ─────────────────────────────────────────────────

mod webhook_tests {
    use super::*;
    use pinpay::notification::{WebhookNotifier, WebhookTargets};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_each_committed_change_is_delivered() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hooks"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let h = Harness::new();
        let lifecycle = h.lifecycle.clone().with_webhooks(
            WebhookNotifier::new(WebhookTargets {
                urls: vec![format!("{}/hooks", server.uri())],
                secret: Some("whsec_test".into()),
            })
            .with_backoff(vec![0]),
        );
        let capture = AuthorizationCapture::new(lifecycle.clone());
        let submitter = RelaySubmitter::new(
            lifecycle.clone(),
            Arc::new(CountingRelay::default()),
            domain(),
        );

        let record = lifecycle
            .create(&NewRequest {
                payee_address: PAYEE,
                amount: one_token(),
                valid_after: 0,
                valid_before: h.now() + 300,
            })
            .await
            .unwrap();
        capture.attach_signature(&record.pin, payer(0xbb), signature(1)).await.unwrap();
        submitter.submit(record.id).await.unwrap();

        // Deliveries run on background tasks
        let mut received = Vec::new();
        for _ in 0..100 {
            received = server.received_requests().await.unwrap_or_default();
            if received.len() >= 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let mut kinds: Vec<String> = received
            .iter()
            .map(|r| {
                let body: serde_json::Value = serde_json::from_slice(&r.body).unwrap();
                body["event_type"].as_str().unwrap().to_string()
            })
            .collect();
        kinds.sort();
        assert_eq!(
            kinds,
            vec!["payment.completed", "payment.created", "payment.signed"]
        );
        assert!(received.iter().all(|r| r.headers.contains_key("x-pinpay-signature")));
    }
}
