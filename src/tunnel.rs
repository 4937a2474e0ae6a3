//! Bidirectional forwarding between a matched connector and acceptor.

use tokio::sync::broadcast;
use tokio::time::{Duration, Instant, MissedTickBehavior};

use crate::channel::{Channel, ChannelReader, ChannelWriter, CloseReason};
use crate::common::wait_for_shutdown;
use crate::error::RelayError;
use crate::identity::PublicIdentity;
use crate::liveness::LivenessMonitor;
use crate::messages::TunnelMessage;

/// A connector and an acceptor released together.
#[derive(Debug)]
pub struct Tunnel {
    connector: Channel,
    acceptor: Channel,
}

/// Which side of a tunnel ended it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelSide {
    Connector,
    Acceptor,
}

/// How a tunnel ended.
#[derive(Debug, PartialEq, Eq)]
pub enum TunnelEnd {
    /// One side closed, misbehaved or went silent.
    Side(TunnelSide, RelayError),
    /// The relay is shutting down.
    Shutdown,
}

impl Tunnel {
    pub fn new(connector: Channel, acceptor: Channel) -> Self {
        Self {
            connector,
            acceptor,
        }
    }

    pub fn connector(&self) -> &PublicIdentity {
        self.connector.peer()
    }

    pub fn acceptor(&self) -> &PublicIdentity {
        self.acceptor.peer()
    }

    /// Forwards messages both ways until one side ends, then closes both.
    ///
    /// The side that ended the tunnel is closed with the reason for its
    /// failure, the other side with `peer closed`.
    pub async fn run(
        self,
        keepalive_timeout: Duration,
        tick_interval: Duration,
        mut shutdown: Option<broadcast::Receiver<()>>,
    ) -> TunnelEnd {
        let (connector_writer, connector_reader) = self.connector.into_split();
        let (acceptor_writer, acceptor_reader) = self.acceptor.into_split();

        let forward = tokio::spawn(relay_direction(
            connector_reader,
            acceptor_writer.clone(),
            keepalive_timeout,
            tick_interval,
        ));
        let backward = tokio::spawn(relay_direction(
            acceptor_reader,
            connector_writer.clone(),
            keepalive_timeout,
            tick_interval,
        ));

        // Dropping a JoinHandle does not cancel the task
        let forward_abort = forward.abort_handle();
        let backward_abort = backward.abort_handle();

        let end = tokio::select! {
            result = forward => {
                backward_abort.abort();
                TunnelEnd::Side(TunnelSide::Connector, result.unwrap_or(RelayError::ChannelClosed))
            }
            result = backward => {
                forward_abort.abort();
                TunnelEnd::Side(TunnelSide::Acceptor, result.unwrap_or(RelayError::ChannelClosed))
            }
            _ = wait_for_shutdown(&mut shutdown) => {
                forward_abort.abort();
                backward_abort.abort();
                TunnelEnd::Shutdown
            }
        };

        let (connector_reason, acceptor_reason) = match &end {
            TunnelEnd::Side(TunnelSide::Connector, e) => (e.close_reason(), CloseReason::PeerClosed),
            TunnelEnd::Side(TunnelSide::Acceptor, e) => (CloseReason::PeerClosed, e.close_reason()),
            TunnelEnd::Shutdown => (CloseReason::Shutdown, CloseReason::Shutdown),
        };
        connector_writer.close(connector_reason);
        acceptor_writer.close(acceptor_reason);
        end
    }
}

/// Moves messages from one side to the other.
///
/// The monitor tracks what `from` sent and what was sent to `to`, so the
/// two tasks of a tunnel between them keep both sides alive. Only returns
/// on failure, attributed to `from`.
async fn relay_direction(
    mut from: ChannelReader,
    to: ChannelWriter,
    keepalive_timeout: Duration,
    tick_interval: Duration,
) -> RelayError {
    let mut liveness = LivenessMonitor::new(keepalive_timeout);
    let mut tick = tokio::time::interval(tick_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            msg = from.recv() => {
                let Some(payload) = msg else {
                    tracing::debug!(peer = %from.peer().short(), "tunnel side closed");
                    return RelayError::ChannelClosed;
                };
                liveness.record_inbound();

                match TunnelMessage::decode(&payload) {
                    Ok(TunnelMessage::KeepAlive) => {}
                    Ok(TunnelMessage::Message(_)) => {
                        // Already a well-formed message; forward the bytes as received.
                        if let Err(e) = to.send(payload).await {
                            return e;
                        }
                        liveness.record_outbound();
                    }
                    Err(e) => {
                        tracing::warn!(peer = %from.peer().short(), error = %e, "invalid tunnel message");
                        return e.into();
                    }
                }
            }
            _ = tick.tick() => {
                let now = Instant::now();
                if liveness.is_expired(now) {
                    tracing::debug!(peer = %from.peer().short(), "tunnel side timed out");
                    return RelayError::LivenessTimeout;
                }
                if liveness.keepalive_due(now) {
                    if let Err(e) = to.send(TunnelMessage::KeepAlive.encode()).await {
                        return e;
                    }
                    liveness.record_outbound();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{channel_pair, ChannelPeer};
    use crate::protocol::Frame;
    use bytes::Bytes;

    const TIMEOUT: Duration = Duration::from_secs(30);
    const TICK: Duration = Duration::from_secs(1);

    fn identity(byte: u8) -> PublicIdentity {
        PublicIdentity::from([byte; 32])
    }

    fn message(data: &'static [u8]) -> Bytes {
        TunnelMessage::Message(Bytes::from_static(data)).encode()
    }

    fn close_frame(reason: CloseReason) -> Frame {
        Frame::Close {
            reason: reason.as_str().to_string(),
        }
    }

    /// Next frame that is not a relay keep-alive.
    async fn next_data(remote: &mut ChannelPeer) -> Option<Frame> {
        loop {
            match remote.next_frame().await? {
                Frame::Message(payload)
                    if TunnelMessage::decode(&payload) == Ok(TunnelMessage::KeepAlive) => {}
                frame => return Some(frame),
            }
        }
    }

    fn spawn_tunnel(
        connector: u8,
        acceptor: u8,
        shutdown: Option<broadcast::Receiver<()>>,
    ) -> (ChannelPeer, ChannelPeer, tokio::task::JoinHandle<TunnelEnd>) {
        let (connector_channel, connector_remote) = channel_pair(identity(connector), 16);
        let (acceptor_channel, acceptor_remote) = channel_pair(identity(acceptor), 16);
        let tunnel = Tunnel::new(connector_channel, acceptor_channel);
        let handle = tokio::spawn(tunnel.run(TIMEOUT, TICK, shutdown));
        (connector_remote, acceptor_remote, handle)
    }

    #[tokio::test]
    async fn test_messages_forwarded_in_order_both_ways() {
        let (mut connector, mut acceptor, _handle) = spawn_tunnel(2, 1, None);

        for data in [&b"one"[..], b"two", b"three"] {
            connector
                .deliver(TunnelMessage::Message(Bytes::copy_from_slice(data)).encode())
                .await
                .unwrap();
        }
        acceptor.deliver(message(b"reply")).await.unwrap();

        assert_eq!(next_data(&mut acceptor).await, Some(Frame::Message(message(b"one"))));
        assert_eq!(next_data(&mut acceptor).await, Some(Frame::Message(message(b"two"))));
        assert_eq!(next_data(&mut acceptor).await, Some(Frame::Message(message(b"three"))));
        assert_eq!(next_data(&mut connector).await, Some(Frame::Message(message(b"reply"))));
    }

    #[tokio::test]
    async fn test_keepalives_are_not_forwarded() {
        let (connector, mut acceptor, _handle) = spawn_tunnel(2, 1, None);

        connector.deliver(TunnelMessage::KeepAlive.encode()).await.unwrap();
        connector.deliver(message(b"data")).await.unwrap();

        assert_eq!(
            acceptor.next_frame().await,
            Some(Frame::Message(message(b"data")))
        );
    }

    #[tokio::test]
    async fn test_tunnels_do_not_leak_into_each_other() {
        let (first_connector, mut first_acceptor, _first) = spawn_tunnel(2, 1, None);
        let (second_connector, mut second_acceptor, _second) = spawn_tunnel(3, 1, None);

        first_connector.deliver(message(b"first")).await.unwrap();
        second_connector.deliver(message(b"second")).await.unwrap();
        first_connector.deliver(message(b"first again")).await.unwrap();

        assert_eq!(next_data(&mut first_acceptor).await, Some(Frame::Message(message(b"first"))));
        assert_eq!(
            next_data(&mut first_acceptor).await,
            Some(Frame::Message(message(b"first again")))
        );
        assert_eq!(
            next_data(&mut second_acceptor).await,
            Some(Frame::Message(message(b"second")))
        );
        assert!(second_acceptor.try_next_frame().is_none());
    }

    #[tokio::test]
    async fn test_close_on_one_side_tears_down_both() {
        let (connector, mut acceptor, handle) = spawn_tunnel(2, 1, None);

        connector.deliver(message(b"last words")).await.unwrap();
        drop(connector);

        assert_eq!(
            handle.await.unwrap(),
            TunnelEnd::Side(TunnelSide::Connector, RelayError::ChannelClosed)
        );
        assert_eq!(next_data(&mut acceptor).await, Some(Frame::Message(message(b"last words"))));
        assert_eq!(next_data(&mut acceptor).await, Some(close_frame(CloseReason::PeerClosed)));
        assert_eq!(acceptor.next_frame().await, None);
    }

    #[tokio::test]
    async fn test_invalid_message_is_protocol_violation() {
        let (mut connector, mut acceptor, handle) = spawn_tunnel(2, 1, None);

        acceptor.deliver(Bytes::from_static(&[0x77, 0x00])).await.unwrap();

        assert!(matches!(
            handle.await.unwrap(),
            TunnelEnd::Side(TunnelSide::Acceptor, RelayError::ProtocolViolation(_))
        ));
        assert_eq!(next_data(&mut acceptor).await, Some(close_frame(CloseReason::ProtocolViolation)));
        assert_eq!(next_data(&mut connector).await, Some(close_frame(CloseReason::PeerClosed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_side_times_out() {
        let (connector, mut acceptor, handle) = spawn_tunnel(2, 1, None);

        // Only the connector keeps talking.
        let chatter = tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(10)).await;
                if connector.deliver(TunnelMessage::KeepAlive.encode()).await.is_err() {
                    break connector;
                }
            }
        });

        let started = Instant::now();
        assert_eq!(
            handle.await.unwrap(),
            TunnelEnd::Side(TunnelSide::Acceptor, RelayError::LivenessTimeout)
        );
        assert!(started.elapsed() >= TIMEOUT);
        assert_eq!(next_data(&mut acceptor).await, Some(close_frame(CloseReason::Timeout)));

        chatter.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_sends_keepalives_to_quiet_side() {
        let (_connector, mut acceptor, _handle) = spawn_tunnel(2, 1, None);

        let started = Instant::now();
        assert_eq!(
            acceptor.next_frame().await,
            Some(Frame::Message(TunnelMessage::KeepAlive.encode()))
        );
        assert!(started.elapsed() >= TIMEOUT / 2);
        assert!(started.elapsed() < TIMEOUT);
    }

    #[tokio::test]
    async fn test_shutdown_closes_both_sides() {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let (mut connector, mut acceptor, handle) = spawn_tunnel(2, 1, Some(shutdown_rx));

        shutdown_tx.send(()).unwrap();
        assert_eq!(handle.await.unwrap(), TunnelEnd::Shutdown);
        assert_eq!(next_data(&mut connector).await, Some(close_frame(CloseReason::Shutdown)));
        assert_eq!(next_data(&mut acceptor).await, Some(close_frame(CloseReason::Shutdown)));
    }
}
