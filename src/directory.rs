//! Listener directory and per-listener pending-connection queues.
//!
//! The directory maps each public identity to at most one live
//! [`ListenerEntry`]. The map lock is held only to insert, look up or remove
//! entries; every queue operation runs under the entry's own lock, so
//! listeners never contend with each other. Removing an entry and offering
//! to it are serialized by that same lock: once [`ListenerEntry::close`] has
//! run, no offer can land in the queue.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{Duration, Instant};

use crate::channel::{Channel, CloseReason};
use crate::error::RelayError;
use crate::identity::PublicIdentity;

/// A connector waiting for the listener to accept or reject it.
#[derive(Debug)]
pub struct PendingOffer {
    connector: PublicIdentity,
    channel: Channel,
    created_at: Instant,
}

impl PendingOffer {
    pub fn connector(&self) -> &PublicIdentity {
        &self.connector
    }

    pub fn into_channel(self) -> Channel {
        self.channel
    }
}

#[derive(Debug)]
struct EntryState {
    closed: bool,
    pending: VecDeque<PendingOffer>,
}

/// What [`ListenerEntry::expire`] removed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExpiredOffers {
    /// Offers that waited too long and were closed with a timeout.
    pub timed_out: usize,
    /// Offers whose connector had already gone away.
    pub abandoned: usize,
}

/// One registered listener.
#[derive(Debug)]
pub struct ListenerEntry {
    identity: PublicIdentity,
    notifier: mpsc::UnboundedSender<PublicIdentity>,
    state: Mutex<EntryState>,
}

impl ListenerEntry {
    fn new(identity: PublicIdentity, notifier: mpsc::UnboundedSender<PublicIdentity>) -> Self {
        Self {
            identity,
            notifier,
            state: Mutex::new(EntryState {
                closed: false,
                pending: VecDeque::new(),
            }),
        }
    }

    pub fn identity(&self) -> &PublicIdentity {
        &self.identity
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    /// Appends a connector to the queue and notifies the listener session.
    ///
    /// Hands the channel back if the entry is already closed.
    pub async fn enqueue(&self, channel: Channel) -> Result<(), Channel> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(channel);
        }

        let connector = *channel.peer();
        state.pending.push_back(PendingOffer {
            connector,
            channel,
            created_at: Instant::now(),
        });
        // Sent under the lock so notifications follow queue order.
        let _ = self.notifier.send(connector);
        Ok(())
    }

    /// Dequeues the oldest pending offer whose connector is still attached.
    pub async fn take_oldest(&self) -> Option<PendingOffer> {
        let mut state = self.state.lock().await;
        if state.closed {
            return None;
        }
        while let Some(offer) = state.pending.pop_front() {
            if !offer.channel.is_closed() {
                return Some(offer);
            }
            tracing::debug!(
                listener = %self.identity.short(),
                connector = %offer.connector.short(),
                "skipping abandoned pending connection"
            );
        }
        None
    }

    /// Rejects the oldest pending offer from `connector`.
    ///
    /// Returns false if no such offer is queued.
    pub async fn reject(&self, connector: &PublicIdentity) -> bool {
        let mut state = self.state.lock().await;
        let position = state.pending.iter().position(|offer| offer.connector == *connector);
        match position.and_then(|idx| state.pending.remove(idx)) {
            Some(offer) => {
                offer.channel.close(CloseReason::Rejected);
                true
            }
            None => false,
        }
    }

    /// Drops offers older than `max_age` (closing them with a timeout) and
    /// offers whose connector channel has already closed.
    pub async fn expire(&self, now: Instant, max_age: Duration) -> ExpiredOffers {
        let mut state = self.state.lock().await;
        let mut expired = ExpiredOffers::default();
        let mut kept = VecDeque::with_capacity(state.pending.len());

        for offer in state.pending.drain(..) {
            if offer.channel.is_closed() {
                expired.abandoned += 1;
            } else if now.saturating_duration_since(offer.created_at) >= max_age {
                tracing::debug!(
                    listener = %self.identity.short(),
                    connector = %offer.connector.short(),
                    "pending connection timed out"
                );
                offer.channel.close(CloseReason::Timeout);
                expired.timed_out += 1;
            } else {
                kept.push_back(offer);
            }
        }

        state.pending = kept;
        expired
    }

    /// Marks the entry closed and closes every pending connector with
    /// `reason`. Returns how many offers were rejected.
    pub async fn close(&self, reason: CloseReason) -> usize {
        let mut state = self.state.lock().await;
        state.closed = true;
        let count = state.pending.len();
        for offer in state.pending.drain(..) {
            offer.channel.close(reason);
        }
        count
    }

    pub async fn pending_len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    /// Connector identities in queue order.
    pub async fn pending_connectors(&self) -> Vec<PublicIdentity> {
        self.state
            .lock()
            .await
            .pending
            .iter()
            .map(|offer| offer.connector)
            .collect()
    }
}

/// Identity to listener map.
#[derive(Debug, Default)]
pub struct ListenerDirectory {
    listeners: Mutex<HashMap<PublicIdentity, Arc<ListenerEntry>>>,
}

impl ListenerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener for `identity`.
    ///
    /// Fails if a live listener already holds the identity; that listener is
    /// left untouched. An entry that is closed but not yet unmapped counts as
    /// gone and is replaced.
    pub async fn register(
        &self,
        identity: PublicIdentity,
        notifier: mpsc::UnboundedSender<PublicIdentity>,
    ) -> Result<Arc<ListenerEntry>, RelayError> {
        let mut listeners = self.listeners.lock().await;
        if let Some(existing) = listeners.get(&identity) {
            if !existing.is_closed().await {
                return Err(RelayError::AlreadyListening(identity));
            }
        }

        let entry = Arc::new(ListenerEntry::new(identity, notifier));
        listeners.insert(identity, Arc::clone(&entry));
        Ok(entry)
    }

    pub async fn lookup(&self, identity: &PublicIdentity) -> Option<Arc<ListenerEntry>> {
        self.listeners.lock().await.get(identity).cloned()
    }

    /// Removes a listener, closing everything still queued on it with
    /// `reason`.
    ///
    /// Takes the entry rather than the identity so a late removal never
    /// unmaps a newer listener that re-registered the same identity.
    pub async fn remove(&self, entry: &Arc<ListenerEntry>, reason: CloseReason) -> usize {
        let rejected = entry.close(reason).await;

        let mut listeners = self.listeners.lock().await;
        if listeners
            .get(entry.identity())
            .is_some_and(|current| Arc::ptr_eq(current, entry))
        {
            listeners.remove(entry.identity());
        }
        rejected
    }

    pub async fn len(&self) -> usize {
        self.listeners.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
