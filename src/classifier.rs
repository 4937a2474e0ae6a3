//! Role classification of freshly authenticated channels.

use tokio::time::{timeout, Duration};

use crate::channel::{Channel, CloseReason};
use crate::error::RelayError;
use crate::identity::PublicIdentity;
use crate::messages::InitConnection;

/// A channel together with the role its first message declared.
///
/// Classification consumes the channel; each variant hands it on to the one
/// stage that owns it next.
#[derive(Debug)]
pub enum Classified {
    /// Wants to listen under its own identity.
    Listener(Channel),
    /// Wants to serve a pending connection of `listener`.
    Acceptor {
        channel: Channel,
        listener: PublicIdentity,
    },
    /// Wants to reach `target`.
    Connector {
        channel: Channel,
        target: PublicIdentity,
    },
}

impl Classified {
    pub fn role_name(&self) -> &'static str {
        match self {
            Classified::Listener(_) => "listener",
            Classified::Acceptor { .. } => "acceptor",
            Classified::Connector { .. } => "connector",
        }
    }
}

/// Reads the one `InitConnection` message a channel may send.
///
/// Silence beyond `grace`, an undecodable message or a closed channel ends
/// the channel; there is no retry.
pub async fn classify(mut channel: Channel, grace: Duration) -> Result<Classified, RelayError> {
    let peer = *channel.peer();

    let first = match timeout(grace, channel.recv()).await {
        Ok(Some(payload)) => payload,
        Ok(None) => {
            tracing::debug!(peer = %peer.short(), "channel closed before init message");
            return Err(RelayError::ChannelClosed);
        }
        Err(_) => {
            tracing::debug!(peer = %peer.short(), "no init message within grace period");
            channel.close(CloseReason::Timeout);
            return Err(RelayError::LivenessTimeout);
        }
    };

    let init = match InitConnection::decode(&first) {
        Ok(init) => init,
        Err(e) => {
            tracing::warn!(peer = %peer.short(), error = %e, "invalid init message");
            channel.close(CloseReason::ProtocolViolation);
            return Err(e.into());
        }
    };

    Ok(match init {
        InitConnection::Listen => Classified::Listener(channel),
        InitConnection::Accept(listener) => Classified::Acceptor { channel, listener },
        InitConnection::Connect(target) => Classified::Connector { channel, target },
    })
}
