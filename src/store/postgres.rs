use alloy_primitives::{Address, B256, U256};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::{CasOutcome, RequestStore};
use crate::models::{AuthorizationSignature, PaymentAuthorizationRequest, RequestStatus, Transition};

const COLUMNS: &str = "id, pin, nonce, payee_address, amount::text AS amount, valid_after, valid_before, \
     status, payer_address, sig_v, sig_r, sig_s, result_reference, submission_lease_until, \
     submission_attempted_at, created_at, signed_at, completed_at";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run pending migrations from the migrations/ directory.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn current_status(&self, id: Uuid) -> anyhow::Result<CasOutcome> {
        let status = sqlx::query_scalar::<_, RequestStatus>(
            "SELECT status FROM payment_requests WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match status {
            Some(s) => CasOutcome::Conflict(s),
            None => CasOutcome::NotFound,
        })
    }
}

#[async_trait]
impl RequestStore for PgStore {
    async fn insert_if_pin_free(&self, record: &PaymentAuthorizationRequest) -> anyhow::Result<bool> {
        // The partial unique index on live pins turns a collision into DO NOTHING
        let inserted = sqlx::query_scalar::<_, Uuid>(
            r#"INSERT INTO payment_requests
                   (id, pin, nonce, payee_address, amount, valid_after, valid_before, status, created_at)
               VALUES ($1, $2, $3, $4, $5::numeric, $6, $7, $8, $9)
               ON CONFLICT DO NOTHING
               RETURNING id"#,
        )
        .bind(record.id)
        .bind(&record.pin)
        .bind(record.nonce.as_slice())
        .bind(record.payee_address.as_slice())
        .bind(record.amount.to_string())
        .bind(record.valid_after)
        .bind(record.valid_before)
        .bind(record.status)
        .bind(record.created_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!("insert_if_pin_free failed: {:?}", e);
            e
        })?;

        Ok(inserted.is_some())
    }

    async fn get(&self, id: Uuid) -> anyhow::Result<Option<PaymentAuthorizationRequest>> {
        let row = sqlx::query_as::<_, PaymentRequestRow>(&format!(
            "SELECT {COLUMNS} FROM payment_requests WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn get_by_pin(&self, pin: &str) -> anyhow::Result<Option<PaymentAuthorizationRequest>> {
        let row = sqlx::query_as::<_, PaymentRequestRow>(&format!(
            r#"SELECT {COLUMNS} FROM payment_requests
               WHERE pin = $1
               ORDER BY (status IN ('pending', 'signed')) DESC, created_at DESC
               LIMIT 1"#
        ))
        .bind(pin)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn compare_and_update(
        &self,
        id: Uuid,
        expected: RequestStatus,
        transition: Transition,
    ) -> anyhow::Result<CasOutcome> {
        // Each statement is a single-row conditional UPDATE: `status = $2` is the
        // compare, the remaining predicate mirrors `Transition::permits`.
        let row = match transition {
            Transition::Sign {
                payer,
                signature,
                at,
            } => {
                sqlx::query_as::<_, PaymentRequestRow>(&format!(
                    r#"UPDATE payment_requests
                       SET status = 'signed', payer_address = $3, sig_v = $4, sig_r = $5, sig_s = $6,
                           signed_at = $7
                       WHERE id = $1 AND status = $2 AND status = 'pending'
                       RETURNING {COLUMNS}"#
                ))
                .bind(id)
                .bind(expected)
                .bind(payer.as_slice())
                .bind(signature.v as i16)
                .bind(signature.r.as_slice())
                .bind(signature.s.as_slice())
                .bind(at)
                .fetch_optional(&self.pool)
                .await?
            }
            Transition::Claim { lease_until, at } => {
                sqlx::query_as::<_, PaymentRequestRow>(&format!(
                    r#"UPDATE payment_requests
                       SET submission_lease_until = $3,
                           submission_attempted_at = COALESCE(submission_attempted_at, $4)
                       WHERE id = $1 AND status = $2 AND status = 'signed'
                         AND (submission_lease_until IS NULL OR submission_lease_until < $4)
                       RETURNING {COLUMNS}"#
                ))
                .bind(id)
                .bind(expected)
                .bind(lease_until)
                .bind(at)
                .fetch_optional(&self.pool)
                .await?
            }
            Transition::Release { held_until } => {
                sqlx::query_as::<_, PaymentRequestRow>(&format!(
                    r#"UPDATE payment_requests
                       SET submission_lease_until = NULL
                       WHERE id = $1 AND status = $2 AND status = 'signed'
                         AND submission_lease_until = $3
                       RETURNING {COLUMNS}"#
                ))
                .bind(id)
                .bind(expected)
                .bind(held_until)
                .fetch_optional(&self.pool)
                .await?
            }
            Transition::Complete { reference, at } => {
                self.finish(id, expected, RequestStatus::Completed, reference, at)
                    .await?
            }
            Transition::Fail { reason, at } => {
                self.finish(id, expected, RequestStatus::Failed, reason, at)
                    .await?
            }
            Transition::Expire { at } => {
                sqlx::query_as::<_, PaymentRequestRow>(&format!(
                    r#"UPDATE payment_requests
                       SET status = 'expired', completed_at = $3
                       WHERE id = $1 AND status = $2
                         AND (status = 'pending'
                              OR (status = 'signed' AND submission_attempted_at IS NULL))
                       RETURNING {COLUMNS}"#
                ))
                .bind(id)
                .bind(expected)
                .bind(at)
                .fetch_optional(&self.pool)
                .await?
            }
        };

        match row {
            Some(row) => Ok(CasOutcome::Applied(row.try_into()?)),
            None => self.current_status(id).await,
        }
    }

    async fn list_expirable(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> anyhow::Result<Vec<PaymentAuthorizationRequest>> {
        let rows = sqlx::query_as::<_, PaymentRequestRow>(&format!(
            r#"SELECT {COLUMNS} FROM payment_requests
               WHERE (status = 'pending' OR (status = 'signed' AND submission_attempted_at IS NULL))
                 AND valid_before < $1
               ORDER BY valid_before ASC
               LIMIT $2"#
        ))
        .bind(now.timestamp())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }
}

impl PgStore {
    async fn finish(
        &self,
        id: Uuid,
        expected: RequestStatus,
        target: RequestStatus,
        reference: String,
        at: DateTime<Utc>,
    ) -> anyhow::Result<Option<PaymentRequestRow>> {
        let row = sqlx::query_as::<_, PaymentRequestRow>(&format!(
            r#"UPDATE payment_requests
               SET status = $3, result_reference = $4, completed_at = $5
               WHERE id = $1 AND status = $2 AND status = 'signed'
               RETURNING {COLUMNS}"#
        ))
        .bind(id)
        .bind(expected)
        .bind(target)
        .bind(reference)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }
}

// -- Row mapping --

#[derive(Debug, sqlx::FromRow)]
struct PaymentRequestRow {
    id: Uuid,
    pin: String,
    nonce: Vec<u8>,
    payee_address: Vec<u8>,
    amount: String,
    valid_after: i64,
    valid_before: i64,
    status: RequestStatus,
    payer_address: Option<Vec<u8>>,
    sig_v: Option<i16>,
    sig_r: Option<Vec<u8>>,
    sig_s: Option<Vec<u8>>,
    result_reference: Option<String>,
    submission_lease_until: Option<DateTime<Utc>>,
    submission_attempted_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    signed_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<PaymentRequestRow> for PaymentAuthorizationRequest {
    type Error = anyhow::Error;

    fn try_from(row: PaymentRequestRow) -> anyhow::Result<Self> {
        let signature = match (row.sig_v, row.sig_r, row.sig_s) {
            (Some(v), Some(r), Some(s)) => Some(AuthorizationSignature {
                v: u8::try_from(v).context("sig_v out of range")?,
                r: B256::try_from(r.as_slice()).context("sig_r is not 32 bytes")?,
                s: B256::try_from(s.as_slice()).context("sig_s is not 32 bytes")?,
            }),
            _ => None,
        };

        Ok(Self {
            id: row.id,
            pin: row.pin,
            nonce: B256::try_from(row.nonce.as_slice()).context("nonce is not 32 bytes")?,
            payee_address: Address::try_from(row.payee_address.as_slice())
                .context("payee_address is not 20 bytes")?,
            amount: U256::from_str_radix(&row.amount, 10)
                .with_context(|| format!("amount {:?} is not a decimal integer", row.amount))?,
            valid_after: row.valid_after,
            valid_before: row.valid_before,
            status: row.status,
            payer_address: row
                .payer_address
                .map(|raw| Address::try_from(raw.as_slice()))
                .transpose()
                .context("payer_address is not 20 bytes")?,
            signature,
            result_reference: row.result_reference,
            submission_lease_until: row.submission_lease_until,
            submission_attempted_at: row.submission_attempted_at,
            created_at: row.created_at,
            signed_at: row.signed_at,
            completed_at: row.completed_at,
        })
    }
}
