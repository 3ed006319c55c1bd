use anyhow::Result;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::models::{PaymentAuthorizationRequest, RequestStatus};

// ── Webhook Event Types ───────────────────────────────────────

/// A structured event payload sent to merchant webhook endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookEvent {
    /// Event type identifier, e.g. "payment.signed", "payment.completed".
    pub event_type: String,
    /// ISO-8601 timestamp of when the event occurred.
    pub timestamp: String,
    pub request_id: String,
    pub status: RequestStatus,
    /// Snapshot of the request as committed.
    pub details: serde_json::Value,
}

impl WebhookEvent {
    pub fn status_changed(record: &PaymentAuthorizationRequest) -> Self {
        Self {
            event_type: event_type_for(record.status).to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            request_id: record.id.to_string(),
            status: record.status,
            details: serde_json::json!({
                "payee_address": record.payee_address.to_string(),
                "payer_address": record.payer_address.map(|a| a.to_string()),
                "amount": record.amount.to_string(),
                "valid_after": record.valid_after,
                "valid_before": record.valid_before,
                "result_reference": record.result_reference,
            }),
        }
    }
}

fn event_type_for(status: RequestStatus) -> &'static str {
    match status {
        RequestStatus::Pending => "payment.created",
        RequestStatus::Signed => "payment.signed",
        RequestStatus::Completed => "payment.completed",
        RequestStatus::Failed => "payment.failed",
        RequestStatus::Expired => "payment.expired",
    }
}

/// Where committed changes are delivered.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WebhookTargets {
    pub urls: Vec<String>,
    /// When set, bodies are signed and the digest sent in `x-pinpay-signature`.
    pub secret: Option<String>,
}

impl WebhookTargets {
    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }
}

// ── HMAC Signing ─────────────────────────────────────────────

/// Compute HMAC-SHA256 of `payload` using `secret`.
/// Returns lowercase hex digest (e.g. "sha256=<hex>").
pub fn hmac_sha256_hex(secret: &str, payload: &[u8]) -> Result<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|e| anyhow::anyhow!("invalid webhook secret: {}", e))?;
    mac.update(payload);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

// ── Webhook Notifier ──────────────────────────────────────────

/// Dispatches webhook events to the configured URLs.
/// Supports:
/// - HMAC-SHA256 signing (x-pinpay-signature header)
/// - Up to 3 retries with back-off (1s → 5s → 25s)
#[derive(Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    targets: WebhookTargets,
    backoff_secs: Vec<u64>,
}

impl WebhookNotifier {
    pub fn new(targets: WebhookTargets) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent("PinPay-Webhook/1.0")
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "falling back to default webhook HTTP client");
                reqwest::Client::new()
            });
        Self {
            client,
            targets,
            backoff_secs: vec![0, 1, 5, 25],
        }
    }

    /// Replace the delay schedule. The first entry is the delay before the first attempt.
    pub fn with_backoff(mut self, backoff_secs: Vec<u64>) -> Self {
        self.backoff_secs = backoff_secs;
        self
    }

    pub fn targets(&self) -> &WebhookTargets {
        &self.targets
    }

    /// Send a webhook event to a single URL with retry.
    ///
    /// Returns `Ok(())` if delivery succeeded on any attempt.
    pub async fn send(&self, url: &str, event: &WebhookEvent) -> Result<()> {
        let payload = serde_json::to_vec(event)
            .map_err(|e| anyhow::anyhow!("webhook serialize error: {}", e))?;
        let delivery_id = uuid::Uuid::new_v4().to_string();
        let timestamp = chrono::Utc::now().timestamp().to_string();
        let signature = self
            .targets
            .secret
            .as_deref()
            .map(|s| hmac_sha256_hex(s, &payload))
            .transpose()?;

        for (attempt, &delay) in self.backoff_secs.iter().enumerate() {
            if delay > 0 {
                debug!(
                    url,
                    attempt,
                    delay_secs = delay,
                    event_type = %event.event_type,
                    "retrying webhook delivery"
                );
                tokio::time::sleep(Duration::from_secs(delay)).await;
            }

            let mut req = self
                .client
                .post(url)
                .header("content-type", "application/json")
                .header("x-pinpay-delivery-id", &delivery_id)
                .header("x-pinpay-timestamp", &timestamp)
                .header("x-pinpay-event", &event.event_type);

            if let Some(ref sig) = signature {
                req = req.header("x-pinpay-signature", sig.as_str());
            }

            match req.body(payload.clone()).send().await {
                Ok(resp) if resp.status().is_success() => {
                    info!(
                        url,
                        event_type = %event.event_type,
                        delivery_id = %delivery_id,
                        attempt,
                        status = %resp.status(),
                        "webhook delivered successfully"
                    );
                    return Ok(());
                }
                Ok(resp) => {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    warn!(
                        url,
                        event_type = %event.event_type,
                        delivery_id = %delivery_id,
                        attempt,
                        status = %status,
                        body = %body,
                        "webhook delivery failed (non-2xx), will retry"
                    );
                }
                Err(e) => {
                    warn!(
                        url,
                        event_type = %event.event_type,
                        delivery_id = %delivery_id,
                        attempt,
                        error = %e,
                        "webhook request error, will retry"
                    );
                }
            }
        }

        warn!(
            url,
            event_type = %event.event_type,
            delivery_id = %delivery_id,
            "webhook delivery failed after all retries"
        );
        Err(anyhow::anyhow!(
            "webhook delivery failed after {} attempts: {}",
            self.backoff_secs.len(),
            url
        ))
    }

    /// Dispatch an event to all configured URLs (fire-and-forget).
    ///
    /// Each URL is attempted independently with retry; failures in one do not block others.
    pub fn dispatch(&self, event: WebhookEvent) {
        if self.targets.is_empty() {
            return;
        }

        let notifier = self.clone();
        tokio::spawn(async move {
            for url in &notifier.targets.urls {
                if let Err(e) = notifier.send(url, &event).await {
                    warn!(url, error = %e, "webhook dispatch ultimately failed");
                }
            }
        });
    }
}

impl Default for WebhookNotifier {
    fn default() -> Self {
        Self::new(WebhookTargets::default())
    }
}

// ── Tests ─────────────────────────────────────────────────────
