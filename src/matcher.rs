//! Matching connectors to listeners.

use std::sync::Arc;

use crate::channel::{Channel, CloseReason};
use crate::directory::ListenerDirectory;
use crate::error::RelayError;
use crate::identity::PublicIdentity;
use crate::tunnel::Tunnel;

/// Queues connectors on listeners and pairs them with acceptors.
#[derive(Debug, Clone)]
pub struct MatchEngine {
    directory: Arc<ListenerDirectory>,
}

impl MatchEngine {
    pub fn new(directory: Arc<ListenerDirectory>) -> Self {
        Self { directory }
    }

    /// Queues `channel` as a pending connection to `target`.
    ///
    /// The listener session is notified through the entry. If no live
    /// listener holds `target`, the connector is closed as unreachable.
    pub async fn offer(&self, target: PublicIdentity, channel: Channel) -> Result<(), RelayError> {
        let connector = *channel.peer();

        let channel = match self.directory.lookup(&target).await {
            Some(entry) => match entry.enqueue(channel).await {
                Ok(()) => {
                    tracing::debug!(
                        listener = %target.short(),
                        connector = %connector.short(),
                        "connection pending"
                    );
                    return Ok(());
                }
                Err(channel) => channel,
            },
            None => channel,
        };

        tracing::debug!(
            listener = %target.short(),
            connector = %connector.short(),
            "no listener for connection"
        );
        channel.close(CloseReason::Unreachable);
        Err(RelayError::NoSuchListener(target))
    }

    /// Pairs an acceptor with the oldest pending connection on `claimed`.
    ///
    /// Only the listener itself may accept, so `claimed` must be the
    /// acceptor channel's own identity.
    pub async fn resolve_accept(
        &self,
        channel: Channel,
        claimed: PublicIdentity,
    ) -> Result<Tunnel, RelayError> {
        let acceptor = *channel.peer();
        if acceptor != claimed {
            tracing::warn!(
                acceptor = %acceptor.short(),
                claimed = %claimed.short(),
                "accept for another identity"
            );
            channel.close(CloseReason::ProtocolViolation);
            return Err(RelayError::ProtocolViolation(format!(
                "{} cannot accept for {}",
                acceptor.short(),
                claimed.short()
            )));
        }

        let offer = match self.directory.lookup(&claimed).await {
            Some(entry) => entry.take_oldest().await,
            None => None,
        };

        match offer {
            Some(offer) => Ok(Tunnel::new(offer.into_channel(), channel)),
            None => {
                tracing::debug!(listener = %claimed.short(), "nothing to accept");
                channel.close(CloseReason::NothingToAccept);
                Err(RelayError::NothingToAccept(claimed))
            }
        }
    }
}
