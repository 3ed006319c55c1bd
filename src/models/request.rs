use alloy_primitives::{Address, B256, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::AppError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Signed,
    Completed,
    Failed,
    Expired,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Signed => "signed",
            RequestStatus::Completed => "completed",
            RequestStatus::Failed => "failed",
            RequestStatus::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::Completed | RequestStatus::Failed | RequestStatus::Expired
        )
    }

    /// Position along the lifecycle. Terminal states share the last rank, so
    /// a committed sequence of statuses always has strictly increasing ranks.
    pub fn rank(&self) -> u8 {
        match self {
            RequestStatus::Pending => 0,
            RequestStatus::Signed => 1,
            _ => 2,
        }
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// ECDSA signature over the authorization's EIP-712 signing hash.
///
/// `v` is always stored in its legacy 27/28 form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationSignature {
    pub v: u8,
    pub r: B256,
    pub s: B256,
}

impl AuthorizationSignature {
    pub fn new(v: u8, r: B256, s: B256) -> Result<Self, AppError> {
        let v = match v {
            0 | 1 => v + 27,
            27 | 28 => v,
            other => {
                return Err(AppError::InvalidInput(format!(
                    "signature v must be 0, 1, 27 or 28 (got {})",
                    other
                )))
            }
        };
        if r.is_zero() || s.is_zero() {
            return Err(AppError::InvalidInput(
                "signature r and s must be non-zero".into(),
            ));
        }
        Ok(Self { v, r, s })
    }

    /// Parse a packed 65-byte `r || s || v` signature, hex encoded with or without `0x`.
    pub fn from_hex(packed: &str) -> Result<Self, AppError> {
        let raw = hex::decode(packed.trim_start_matches("0x"))
            .map_err(|e| AppError::InvalidInput(format!("signature is not hex: {}", e)))?;
        if raw.len() != 65 {
            return Err(AppError::InvalidInput(format!(
                "packed signature must be 65 bytes (got {})",
                raw.len()
            )));
        }
        Self::new(
            raw[64],
            B256::from_slice(&raw[..32]),
            B256::from_slice(&raw[32..64]),
        )
    }
}

/// A payment-authorization request and everything recorded about it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaymentAuthorizationRequest {
    pub id: Uuid,
    pub pin: String,
    pub nonce: B256,
    pub payee_address: Address,
    #[serde(with = "decimal_u256")]
    pub amount: U256,
    pub valid_after: i64,
    pub valid_before: i64,
    pub status: RequestStatus,
    pub payer_address: Option<Address>,
    pub signature: Option<AuthorizationSignature>,
    pub result_reference: Option<String>,
    pub submission_lease_until: Option<DateTime<Utc>>,
    /// First relay claim. Never cleared: once set the outcome may already be on-chain.
    pub submission_attempted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub signed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl PaymentAuthorizationRequest {
    pub fn new_pending(new: &NewRequest, pin: String, nonce: B256, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            pin,
            nonce,
            payee_address: new.payee_address,
            amount: new.amount,
            valid_after: new.valid_after,
            valid_before: new.valid_before,
            status: RequestStatus::Pending,
            payer_address: None,
            signature: None,
            result_reference: None,
            submission_lease_until: None,
            submission_attempted_at: None,
            created_at: now,
            signed_at: None,
            completed_at: None,
        }
    }

    /// True while a submitter holds an unexpired claim on this request.
    pub fn lease_active(&self, now: DateTime<Utc>) -> bool {
        self.submission_lease_until.is_some_and(|until| until >= now)
    }

    /// Pending requests, and signed ones never handed to the relay, may still expire.
    pub fn expirable(&self) -> bool {
        match self.status {
            RequestStatus::Pending => true,
            RequestStatus::Signed => self.submission_attempted_at.is_none(),
            _ => false,
        }
    }
}

/// Caller-supplied fields for a new request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewRequest {
    pub payee_address: Address,
    #[serde(with = "decimal_u256")]
    pub amount: U256,
    pub valid_after: i64,
    pub valid_before: i64,
}

impl NewRequest {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.amount.is_zero() {
            return Err(AppError::InvalidInput("amount must be greater than zero".into()));
        }
        if self.payee_address == Address::ZERO {
            return Err(AppError::InvalidInput("payee address must not be zero".into()));
        }
        if self.valid_after < 0 {
            return Err(AppError::InvalidInput("valid_after must not be negative".into()));
        }
        if self.valid_after > self.valid_before {
            return Err(AppError::InvalidInput(
                "valid_after must not be later than valid_before".into(),
            ));
        }
        Ok(())
    }
}

// ── Transitions ──────────────────────────────────────────────

/// A state-changing mutation, applied only through the store's
/// compare-and-update primitive.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// pending → signed
    Sign {
        payer: Address,
        signature: AuthorizationSignature,
        at: DateTime<Utc>,
    },
    /// signed → signed, taking the submission lease
    Claim {
        lease_until: DateTime<Utc>,
        at: DateTime<Utc>,
    },
    /// signed → signed, giving back a lease still held at `held_until`
    Release { held_until: DateTime<Utc> },
    /// signed → completed
    Complete { reference: String, at: DateTime<Utc> },
    /// signed → failed
    Fail { reason: String, at: DateTime<Utc> },
    /// pending | signed → expired, the latter only before any relay claim
    Expire { at: DateTime<Utc> },
}

impl Transition {
    pub fn target(&self) -> RequestStatus {
        match self {
            Transition::Sign { .. } | Transition::Claim { .. } | Transition::Release { .. } => {
                RequestStatus::Signed
            }
            Transition::Complete { .. } => RequestStatus::Completed,
            Transition::Fail { .. } => RequestStatus::Failed,
            Transition::Expire { .. } => RequestStatus::Expired,
        }
    }

    /// Whether this transition may be applied to `record` as it stands now.
    pub fn permits(&self, record: &PaymentAuthorizationRequest) -> bool {
        match (self, record.status) {
            (Transition::Sign { .. }, RequestStatus::Pending) => true,
            (Transition::Claim { at, .. }, RequestStatus::Signed) => !record.lease_active(*at),
            (Transition::Release { held_until }, RequestStatus::Signed) => {
                record.submission_lease_until == Some(*held_until)
            }
            (Transition::Complete { .. }, RequestStatus::Signed) => true,
            (Transition::Fail { .. }, RequestStatus::Signed) => true,
            (Transition::Expire { .. }, _) => record.expirable(),
            _ => false,
        }
    }

    pub fn apply(self, record: &mut PaymentAuthorizationRequest) {
        record.status = self.target();
        match self {
            Transition::Sign {
                payer,
                signature,
                at,
            } => {
                record.payer_address = Some(payer);
                record.signature = Some(signature);
                record.signed_at = Some(at);
            }
            Transition::Claim { lease_until, at } => {
                record.submission_lease_until = Some(lease_until);
                record.submission_attempted_at.get_or_insert(at);
            }
            Transition::Release { .. } => {
                record.submission_lease_until = None;
            }
            Transition::Complete { reference, at } => {
                record.result_reference = Some(reference);
                record.completed_at = Some(at);
            }
            Transition::Fail { reason, at } => {
                record.result_reference = Some(reason);
                record.completed_at = Some(at);
            }
            Transition::Expire { at } => {
                record.completed_at = Some(at);
            }
        }
    }
}

/// Serde adapter: token amounts travel as decimal strings so JSON clients never
/// lose precision on 18-decimal values.
pub mod decimal_u256 {
    use alloy_primitives::U256;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &U256, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<U256, D::Error> {
        let raw = String::deserialize(deserializer)?;
        U256::from_str_radix(raw.trim(), 10).map_err(serde::de::Error::custom)
    }
}
