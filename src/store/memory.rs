//! In-process request store.
//!
//! Records live in a `DashMap`; its per-shard write lock is what serializes
//! compare-and-update on a single id. Lock order is always
//! `live_pins` → `records`/`history`, and no guard on `records` is held while
//! touching another map.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

use super::{CasOutcome, RequestStore};
use crate::models::{PaymentAuthorizationRequest, RequestStatus, Transition};

#[derive(Default)]
pub struct MemoryStore {
    records: DashMap<Uuid, PaymentAuthorizationRequest>,
    /// pin → id of the pending/signed request holding it
    live_pins: DashMap<String, Uuid>,
    /// pin → every id ever issued with it, in creation order
    history: DashMap<String, Vec<Uuid>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn snapshot(&self, id: &Uuid) -> Option<PaymentAuthorizationRequest> {
        self.records.get(id).map(|r| r.value().clone())
    }
}

#[async_trait]
impl RequestStore for MemoryStore {
    async fn insert_if_pin_free(&self, record: &PaymentAuthorizationRequest) -> anyhow::Result<bool> {
        match self.live_pins.entry(record.pin.clone()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                if self.records.contains_key(&record.id) {
                    anyhow::bail!("duplicate request id {}", record.id);
                }
                self.records.insert(record.id, record.clone());
                self.history
                    .entry(record.pin.clone())
                    .or_default()
                    .push(record.id);
                slot.insert(record.id);
                Ok(true)
            }
        }
    }

    async fn get(&self, id: Uuid) -> anyhow::Result<Option<PaymentAuthorizationRequest>> {
        Ok(self.snapshot(&id))
    }

    async fn get_by_pin(&self, pin: &str) -> anyhow::Result<Option<PaymentAuthorizationRequest>> {
        let live = self.live_pins.get(pin).map(|holder| *holder.value());
        if let Some(record) = live.and_then(|id| self.snapshot(&id)) {
            return Ok(Some(record));
        }

        let latest = self
            .history
            .get(pin)
            .and_then(|ids| ids.value().last().copied());
        Ok(latest.and_then(|id| self.snapshot(&id)))
    }

    async fn compare_and_update(
        &self,
        id: Uuid,
        expected: RequestStatus,
        transition: Transition,
    ) -> anyhow::Result<CasOutcome> {
        let outcome = match self.records.get_mut(&id) {
            None => CasOutcome::NotFound,
            Some(mut record) => {
                if record.status != expected || !transition.permits(&record) {
                    CasOutcome::Conflict(record.status)
                } else {
                    transition.apply(record.value_mut());
                    CasOutcome::Applied(record.value().clone())
                }
            }
        };

        // Terminal requests release their pin for reuse
        if let CasOutcome::Applied(ref record) = outcome {
            if record.status.is_terminal() {
                self.live_pins
                    .remove_if(&record.pin, |_, holder| *holder == record.id);
            }
        }

        Ok(outcome)
    }

    async fn list_expirable(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> anyhow::Result<Vec<PaymentAuthorizationRequest>> {
        let cutoff = now.timestamp();
        let mut stale: Vec<PaymentAuthorizationRequest> = self
            .records
            .iter()
            .filter(|r| r.expirable() && r.valid_before < cutoff)
            .map(|r| r.value().clone())
            .collect();
        stale.sort_by_key(|r| r.valid_before);
        stale.truncate(limit);
        Ok(stale)
    }
}
