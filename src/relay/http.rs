/// HTTP client for a sponsored-call relay.
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{Relay, RelayError, RelaySubmission};

const SPONSORED_CALL_PATH: &str = "/relays/v2/sponsored-call";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SponsoredCallRequest<'a> {
    chain_id: u64,
    target: String,
    data: String,
    sponsor_api_key: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SponsoredCallResponse {
    task_id: String,
}

pub struct SponsoredRelay {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl SponsoredRelay {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .pool_max_idle_per_host(8)
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(5))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}{}", self.base_url, SPONSORED_CALL_PATH)
    }
}

/// 408, 429 and every 5xx may succeed on a later attempt; other failures will not.
fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
}

#[async_trait]
impl Relay for SponsoredRelay {
    async fn submit(&self, submission: &RelaySubmission) -> Result<String, RelayError> {
        let body = SponsoredCallRequest {
            chain_id: submission.chain_id,
            target: submission.target.to_string(),
            data: format!("0x{}", hex::encode(&submission.data)),
            sponsor_api_key: &self.api_key,
        };

        let resp = self
            .client
            .post(self.endpoint())
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                tracing::warn!("Relay request failed: {}", e);
                RelayError::Transient(e.to_string())
            })?;

        let status = resp.status();
        if status.is_success() {
            let parsed: SponsoredCallResponse = resp.json().await.map_err(|e| {
                RelayError::Terminal(format!("relay accepted the call but returned no task id: {}", e))
            })?;
            return Ok(parsed.task_id);
        }

        let detail = resp.text().await.unwrap_or_default();
        let message = if detail.is_empty() {
            format!("relay returned {}", status)
        } else {
            format!("relay returned {}: {}", status, detail)
        };

        if is_retryable_status(status) {
            Err(RelayError::Transient(message))
        } else {
            Err(RelayError::Terminal(message))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{address, Bytes};
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn submission() -> RelaySubmission {
        RelaySubmission {
            chain_id: 8453,
            target: address!("833589fCD6eDb6E08f4c7C32D4f71b54bdA02913"),
            data: Bytes::from(vec![0xe3, 0xee, 0x16, 0x0e]),
        }
    }

    #[test]
    fn test_status_classification() {
        assert!(is_retryable_status(StatusCode::REQUEST_TIMEOUT));
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(StatusCode::BAD_GATEWAY));
        assert!(!is_retryable_status(StatusCode::BAD_REQUEST));
        assert!(!is_retryable_status(StatusCode::UNPROCESSABLE_ENTITY));
    }

    #[tokio::test]
    async fn test_success_returns_task_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(SPONSORED_CALL_PATH))
            .and(body_partial_json(serde_json::json!({
                "chainId": 8453,
                "data": "0xe3ee160e",
                "sponsorApiKey": "sponsor-key",
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "taskId": "0xtask"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let relay = SponsoredRelay::new(server.uri(), "sponsor-key").unwrap();
        assert_eq!(relay.submit(&submission()).await.unwrap(), "0xtask");
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let relay = SponsoredRelay::new(server.uri(), "k").unwrap();
        let err = relay.submit(&submission()).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_client_error_is_terminal_with_detail() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("authorization is used"))
            .mount(&server)
            .await;

        let relay = SponsoredRelay::new(server.uri(), "k").unwrap();
        match relay.submit(&submission()).await.unwrap_err() {
            RelayError::Terminal(msg) => assert!(msg.contains("authorization is used")),
            other => panic!("expected terminal error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unreachable_relay_is_transient() {
        // Nothing listens on port 9 on loopback
        let relay = SponsoredRelay::new("http://127.0.0.1:9", "k").unwrap();
        assert!(relay.submit(&submission()).await.unwrap_err().is_transient());
    }
}
