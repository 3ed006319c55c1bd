//! Status state machine.
//!
//! Every status change is a compare-and-update against the store; a change is
//! announced to subscribers and webhooks only after it commits.

use std::sync::Arc;

use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::clock::Clock;
use crate::errors::AppError;
use crate::issuer::Issuer;
use crate::models::{NewRequest, PaymentAuthorizationRequest, RequestStatus, Transition};
use crate::notification::{StatusChange, StatusNotifier, Subscription, WebhookEvent, WebhookNotifier};
use crate::store::{CasOutcome, RequestStore};

pub const DEFAULT_PIN_ATTEMPTS: u32 = 10;

#[derive(Clone)]
pub struct Lifecycle {
    store: Arc<dyn RequestStore>,
    issuer: Arc<dyn Issuer>,
    clock: Arc<dyn Clock>,
    notifier: Arc<StatusNotifier>,
    webhooks: WebhookNotifier,
    pin_attempts: u32,
}

impl Lifecycle {
    pub fn new(store: Arc<dyn RequestStore>, issuer: Arc<dyn Issuer>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            issuer,
            clock,
            notifier: Arc::new(StatusNotifier::default()),
            webhooks: WebhookNotifier::default(),
            pin_attempts: DEFAULT_PIN_ATTEMPTS,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<StatusNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_webhooks(mut self, webhooks: WebhookNotifier) -> Self {
        self.webhooks = webhooks;
        self
    }

    pub fn with_pin_attempts(mut self, attempts: u32) -> Self {
        self.pin_attempts = attempts.max(1);
        self
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn store(&self) -> &Arc<dyn RequestStore> {
        &self.store
    }

    pub fn notifier(&self) -> &Arc<StatusNotifier> {
        &self.notifier
    }

    pub async fn create(&self, new: &NewRequest) -> Result<PaymentAuthorizationRequest, AppError> {
        let record = self
            .store
            .create(self.issuer.as_ref(), new, self.clock.now(), self.pin_attempts)
            .await?;

        tracing::info!(
            request_id = %record.id,
            payee = %record.payee_address,
            amount = %record.amount,
            valid_before = record.valid_before,
            "payment request created"
        );
        self.webhooks.dispatch(WebhookEvent::status_changed(&record));
        Ok(record)
    }

    pub async fn get(&self, id: Uuid) -> Result<PaymentAuthorizationRequest, AppError> {
        self.store.get(id).await?.ok_or(AppError::NotFound)
    }

    pub async fn get_by_pin(&self, pin: &str) -> Result<PaymentAuthorizationRequest, AppError> {
        if !crate::issuer::is_valid_pin(pin) {
            return Err(AppError::NotFound);
        }
        self.store.get_by_pin(pin).await?.ok_or(AppError::NotFound)
    }

    /// Compare-and-update, announcing the change when the status moved.
    pub async fn advance(
        &self,
        id: Uuid,
        expected: RequestStatus,
        transition: Transition,
    ) -> Result<CasOutcome, AppError> {
        let target = transition.target();
        let outcome = self.store.compare_and_update(id, expected, transition).await?;

        match &outcome {
            CasOutcome::Applied(record) if record.status != expected => {
                tracing::info!(
                    request_id = %id,
                    from = %expected,
                    to = %record.status,
                    "payment request advanced"
                );
                self.announce(record);
            }
            CasOutcome::Applied(_) => {}
            CasOutcome::Conflict(current) => {
                tracing::debug!(
                    request_id = %id,
                    expected = %expected,
                    current = %current,
                    target = %target,
                    "transition lost compare-and-update"
                );
            }
            CasOutcome::NotFound => {}
        }
        Ok(outcome)
    }

    fn announce(&self, record: &PaymentAuthorizationRequest) {
        self.notifier.publish(StatusChange {
            id: record.id,
            status: record.status,
            timestamp: self.clock.now(),
        });
        self.webhooks.dispatch(WebhookEvent::status_changed(record));
    }

    /// Current snapshot plus a feed of the changes that follow it.
    pub async fn watch(
        &self,
        id: Uuid,
    ) -> Result<(PaymentAuthorizationRequest, Subscription), AppError> {
        // Subscribe before reading so a change racing the read is not lost
        let subscription = self.notifier.subscribe(id);
        let record = match self.get(id).await {
            Ok(record) => record,
            Err(e) => {
                drop(subscription);
                self.notifier.prune();
                return Err(e);
            }
        };

        if record.status.is_terminal() {
            return Ok((record, Subscription::closed(id)));
        }
        let subscription = subscription.after(record.status);
        Ok((record, subscription))
    }

    pub async fn subscribe(&self, id: Uuid) -> Result<Subscription, AppError> {
        let (_, subscription) = self.watch(id).await?;
        Ok(subscription)
    }

    /// Run `callback` on a background task for every change to `id`.
    pub async fn subscribe_with<F>(&self, id: Uuid, mut callback: F) -> Result<JoinHandle<()>, AppError>
    where
        F: FnMut(StatusChange) + Send + 'static,
    {
        let mut subscription = self.subscribe(id).await?;
        Ok(tokio::spawn(async move {
            while let Some(change) = subscription.next().await {
                callback(change);
            }
        }))
    }
}
