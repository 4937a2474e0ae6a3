//! Authenticated message channels as seen by the relay core.
//!
//! A [`Channel`] is the relay's end of one encrypted stream: an ordered
//! queue of inbound message payloads and an ordered queue of outbound
//! frames, tagged with the peer identity the transport authenticated. The
//! transport holds the matching [`ChannelPeer`] and pumps bytes between it
//! and the network.

use bytes::Bytes;
use std::fmt;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Duration;

use crate::error::RelayError;
use crate::identity::PublicIdentity;
use crate::protocol::Frame;

/// Default number of queued messages per direction.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// How long a `CLOSE` frame may wait for room behind queued frames.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Why the relay closed a channel. Sent to the peer in a `CLOSE` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The listener rejected the connection.
    Rejected,
    /// No listener is registered for the requested identity.
    Unreachable,
    /// The listener went away while the connection was pending.
    ListenerGone,
    /// An accept arrived with no pending connection.
    NothingToAccept,
    /// Another channel is already listening for this identity.
    AlreadyListening,
    /// The peer sent something the protocol does not allow.
    ProtocolViolation,
    /// The peer or the pending connection went silent for too long.
    Timeout,
    /// The other side of the tunnel closed.
    PeerClosed,
    /// The relay is shutting down.
    Shutdown,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Rejected => "rejected",
            CloseReason::Unreachable => "unreachable",
            CloseReason::ListenerGone => "listener gone",
            CloseReason::NothingToAccept => "nothing to accept",
            CloseReason::AlreadyListening => "already listening",
            CloseReason::ProtocolViolation => "protocol violation",
            CloseReason::Timeout => "timeout",
            CloseReason::PeerClosed => "peer closed",
            CloseReason::Shutdown => "shutdown",
        }
    }

    /// Parses a reason received in a `CLOSE` frame.
    pub fn parse(s: &str) -> Option<Self> {
        let reason = match s {
            "rejected" => CloseReason::Rejected,
            "unreachable" => CloseReason::Unreachable,
            "listener gone" => CloseReason::ListenerGone,
            "nothing to accept" => CloseReason::NothingToAccept,
            "already listening" => CloseReason::AlreadyListening,
            "protocol violation" => CloseReason::ProtocolViolation,
            "timeout" => CloseReason::Timeout,
            "peer closed" => CloseReason::PeerClosed,
            "shutdown" => CloseReason::Shutdown,
            _ => return None,
        };
        Some(reason)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outbound half of a channel. Clones write to the same stream in order.
#[derive(Debug, Clone)]
pub struct ChannelWriter {
    peer: PublicIdentity,
    tx: mpsc::Sender<Frame>,
}

impl ChannelWriter {
    pub fn peer(&self) -> &PublicIdentity {
        &self.peer
    }

    /// Queues one message payload for the peer.
    pub async fn send(&self, payload: Bytes) -> Result<(), RelayError> {
        self.tx
            .send(Frame::Message(payload))
            .await
            .map_err(|_| RelayError::ChannelClosed)
    }

    /// Waits for room for one message without committing to send it.
    ///
    /// Cancel-safe, so it can sit in a `select!` next to other work.
    pub async fn reserve(&self) -> Result<SendPermit, RelayError> {
        self.tx
            .clone()
            .reserve_owned()
            .await
            .map(|permit| SendPermit { permit })
            .map_err(|_| RelayError::ChannelClosed)
    }

    /// Queues a `CLOSE` frame behind everything already queued.
    ///
    /// Never blocks the caller. If the queue is full, a background task
    /// waits up to `CLOSE_GRACE` for room and then gives up; the stream
    /// finishes once every writer clone is dropped.
    pub fn close(self, reason: CloseReason) {
        let frame = Frame::Close {
            reason: reason.as_str().to_string(),
        };
        let Self { peer, tx } = self;

        match tx.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(frame)) => {
                tokio::spawn(async move {
                    match tokio::time::timeout(CLOSE_GRACE, tx.send(frame)).await {
                        Ok(Ok(())) => {}
                        _ => {
                            tracing::debug!(peer = %peer.short(), %reason, "close frame not delivered")
                        }
                    }
                });
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(peer = %peer.short(), %reason, "close frame not delivered");
            }
        }
    }

    /// True once the transport stopped draining this channel.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Room for one message on a [`ChannelWriter`].
#[derive(Debug)]
pub struct SendPermit {
    permit: mpsc::OwnedPermit<Frame>,
}

impl SendPermit {
    pub fn send(self, payload: Bytes) {
        self.permit.send(Frame::Message(payload));
    }
}

/// Inbound half of a channel.
#[derive(Debug)]
pub struct ChannelReader {
    peer: PublicIdentity,
    rx: mpsc::Receiver<Bytes>,
}

impl ChannelReader {
    pub fn peer(&self) -> &PublicIdentity {
        &self.peer
    }

    /// Next message payload, or `None` once the peer is gone.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// True once the transport will deliver nothing more.
    pub fn is_closed(&self) -> bool {
        self.rx.is_closed()
    }
}

/// The relay's end of one authenticated stream.
///
/// Owned by exactly one stage at a time; moving it is the only way to hand
/// it over. Dropping it detaches the transport.
#[derive(Debug)]
pub struct Channel {
    writer: ChannelWriter,
    reader: ChannelReader,
}

impl Channel {
    /// Identity the transport authenticated for this stream.
    pub fn peer(&self) -> &PublicIdentity {
        &self.writer.peer
    }

    pub async fn send(&self, payload: Bytes) -> Result<(), RelayError> {
        self.writer.send(payload).await
    }

    pub async fn recv(&mut self) -> Option<Bytes> {
        self.reader.recv().await
    }

    pub fn close(self, reason: CloseReason) {
        self.writer.close(reason);
    }

    /// True once either direction has been detached by the transport.
    pub fn is_closed(&self) -> bool {
        self.writer.is_closed() || self.reader.is_closed()
    }

    pub fn into_split(self) -> (ChannelWriter, ChannelReader) {
        (self.writer, self.reader)
    }
}

/// Transport-side end of a [`Channel`].
#[derive(Debug)]
pub struct ChannelPeer {
    identity: PublicIdentity,
    inbound: mpsc::Sender<Bytes>,
    outbound: mpsc::Receiver<Frame>,
}

impl ChannelPeer {
    pub fn identity(&self) -> &PublicIdentity {
        &self.identity
    }

    /// Hands one received message to the relay.
    pub async fn deliver(&self, payload: Bytes) -> Result<(), RelayError> {
        self.inbound
            .send(payload)
            .await
            .map_err(|_| RelayError::ChannelClosed)
    }

    /// Next frame the relay wants written, or `None` once it dropped the channel.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        self.outbound.recv().await
    }

    /// Like [`next_frame`](Self::next_frame) but never waits.
    pub fn try_next_frame(&mut self) -> Option<Frame> {
        self.outbound.try_recv().ok()
    }

    pub fn into_split(self) -> (mpsc::Sender<Bytes>, mpsc::Receiver<Frame>) {
        (self.inbound, self.outbound)
    }
}

/// Creates a connected channel pair for a stream authenticated as `peer`.
pub fn channel_pair(peer: PublicIdentity, capacity: usize) -> (Channel, ChannelPeer) {
    let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
    let (outbound_tx, outbound_rx) = mpsc::channel(capacity);

    let channel = Channel {
        writer: ChannelWriter {
            peer,
            tx: outbound_tx,
        },
        reader: ChannelReader {
            peer,
            rx: inbound_rx,
        },
    };
    let remote = ChannelPeer {
        identity: peer,
        inbound: inbound_tx,
        outbound: outbound_rx,
    };
    (channel, remote)
}
