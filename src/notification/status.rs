//! In-process status change fan-out.
//!
//! One tokio broadcast channel per request id. A change is forwarded only when
//! its status ranks past the last one forwarded for that id, so a delayed
//! announcement of an older state is dropped rather than replayed. Delivery is
//! at-most-once: a subscriber that lags past the channel capacity skips ahead.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::models::RequestStatus;

const DEFAULT_CAPACITY: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub id: Uuid,
    pub status: RequestStatus,
    pub timestamp: DateTime<Utc>,
}

struct Channel {
    tx: broadcast::Sender<StatusChange>,
    last_rank: Option<u8>,
}

impl Channel {
    fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, last_rank: None }
    }
}

pub struct StatusNotifier {
    channels: DashMap<Uuid, Channel>,
    capacity: usize,
}

impl Default for StatusNotifier {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl StatusNotifier {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self, id: Uuid) -> Subscription {
        let channel = self
            .channels
            .entry(id)
            .or_insert_with(|| Channel::new(self.capacity));
        Subscription {
            id,
            rx: channel.tx.subscribe(),
            floor: None,
        }
    }

    /// Spawn a task that calls `callback` for every change until the request
    /// reaches a terminal status or the notifier drops the channel.
    pub fn subscribe_with<F>(&self, id: Uuid, mut callback: F) -> JoinHandle<()>
    where
        F: FnMut(StatusChange) + Send + 'static,
    {
        let mut subscription = self.subscribe(id);
        tokio::spawn(async move {
            while let Some(change) = subscription.next().await {
                callback(change);
            }
        })
    }

    /// Forward `change` to current subscribers. Returns how many received it.
    pub fn publish(&self, change: StatusChange) -> usize {
        let Some(mut channel) = self.channels.get_mut(&change.id) else {
            return 0;
        };

        let rank = change.status.rank();
        if channel.last_rank.is_some_and(|last| rank <= last) {
            tracing::debug!(
                request_id = %change.id,
                status = %change.status,
                "dropping status change that does not advance the request"
            );
            return 0;
        }
        channel.last_rank = Some(rank);

        let terminal = change.status.is_terminal();
        let id = change.id;
        let delivered = channel.tx.send(change).unwrap_or(0);
        drop(channel);

        // Dropping the sender ends every subscription once it drains
        if terminal {
            self.channels.remove(&id);
        }
        delivered
    }

    /// Drop channels nobody listens to any more. Returns the number removed.
    pub fn prune(&self) -> usize {
        let before = self.channels.len();
        self.channels.retain(|_, channel| channel.tx.receiver_count() > 0);
        before.saturating_sub(self.channels.len())
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

/// A live feed of changes for one request.
pub struct Subscription {
    id: Uuid,
    rx: broadcast::Receiver<StatusChange>,
    floor: Option<u8>,
}

impl Subscription {
    /// A subscription that yields nothing, for requests already terminal.
    pub fn closed(id: Uuid) -> Self {
        let (_, rx) = broadcast::channel(1);
        Self { id, rx, floor: None }
    }

    /// Skip changes at or behind `seen`, typically a snapshot read after subscribing.
    pub fn after(mut self, seen: RequestStatus) -> Self {
        let rank = seen.rank();
        self.floor = Some(self.floor.map_or(rank, |f| f.max(rank)));
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Next change, or `None` once the request is terminal and the feed has drained.
    pub async fn next(&mut self) -> Option<StatusChange> {
        loop {
            match self.rx.recv().await {
                Ok(change) if self.floor.is_some_and(|f| change.status.rank() <= f) => {}
                Ok(change) => return Some(change),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(request_id = %self.id, skipped, "status subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = StatusChange> + Send {
        stream::unfold(self, |mut sub| async move {
            let change = sub.next().await?;
            Some((change, sub))
        })
    }
}
