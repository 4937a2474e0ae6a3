//! The relay core: one entry point for every authenticated channel.
//!
//! [`Relay::accept`] takes ownership of a channel the transport has just
//! authenticated and spawns a task that classifies it and hands it to the
//! listener directory, the match engine or a tunnel.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::channel::{Channel, DEFAULT_CHANNEL_CAPACITY};
use crate::classifier::{classify, Classified};
use crate::cli::ServerArgs;
use crate::directory::ListenerDirectory;
use crate::listener::ListenerSession;
use crate::matcher::MatchEngine;
use crate::tunnel::TunnelEnd;

/// Timing and sizing of the relay core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Silence after which a listener or tunnel side is considered dead.
    pub keepalive_timeout: Duration,
    /// How often liveness and pending offers are checked.
    pub tick_interval: Duration,
    /// How long a connection may wait for the listener to accept it.
    pub pending_timeout: Duration,
    /// How long a fresh channel may take to send its init message.
    pub init_timeout: Duration,
    /// Queued messages per channel direction.
    pub channel_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            keepalive_timeout: Duration::from_secs(30),
            tick_interval: Duration::from_secs(1),
            pending_timeout: Duration::from_secs(15),
            init_timeout: Duration::from_secs(10),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl From<&ServerArgs> for RelayConfig {
    fn from(args: &ServerArgs) -> Self {
        Self {
            keepalive_timeout: args.keepalive_timeout,
            tick_interval: args.tick_interval,
            pending_timeout: args.pending_timeout,
            init_timeout: args.init_timeout,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

#[derive(Debug)]
struct RelayInner {
    config: RelayConfig,
    directory: Arc<ListenerDirectory>,
    matcher: MatchEngine,
    shutdown_tx: broadcast::Sender<()>,
}

/// Shared handle to the relay core. Clones refer to the same relay.
#[derive(Debug, Clone)]
pub struct Relay {
    inner: Arc<RelayInner>,
}

impl Relay {
    pub fn new(config: RelayConfig) -> Self {
        let directory = Arc::new(ListenerDirectory::new());
        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        Self {
            inner: Arc::new(RelayInner {
                config,
                matcher: MatchEngine::new(Arc::clone(&directory)),
                directory,
                shutdown_tx,
            }),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.inner.config
    }

    pub fn directory(&self) -> &Arc<ListenerDirectory> {
        &self.inner.directory
    }

    /// Takes over a freshly authenticated channel.
    pub fn accept(&self, channel: Channel) -> JoinHandle<()> {
        let relay = self.clone();
        // Subscribe before spawning so a shutdown sent right after is seen.
        let shutdown_rx = self.inner.shutdown_tx.subscribe();
        tokio::spawn(async move { relay.handle_channel(channel, shutdown_rx).await })
    }

    /// Closes every listener and tunnel with reason `shutdown`.
    pub fn shutdown(&self) {
        // No receivers just means nothing is running.
        let _ = self.inner.shutdown_tx.send(());
    }

    async fn handle_channel(&self, channel: Channel, shutdown_rx: broadcast::Receiver<()>) {
        let peer = *channel.peer();
        let config = &self.inner.config;

        let classified = match classify(channel, config.init_timeout).await {
            Ok(classified) => classified,
            Err(e) => {
                tracing::debug!(peer = %peer.short(), error = %e, "channel not classified");
                return;
            }
        };
        tracing::debug!(peer = %peer.short(), role = classified.role_name(), "channel classified");

        match classified {
            Classified::Listener(channel) => {
                let session =
                    match ListenerSession::start(&self.inner.directory, channel, config).await {
                        Ok(session) => session,
                        Err(e) => {
                            tracing::info!(identity = %peer.short(), error = %e, "listen refused");
                            return;
                        }
                    };
                tracing::info!(identity = %peer.short(), "listener registered");
                // The session logs its own removal.
                let _ = session.run(&self.inner.directory, Some(shutdown_rx)).await;
            }
            Classified::Connector { channel, target } => {
                if let Err(e) = self.inner.matcher.offer(target, channel).await {
                    tracing::info!(
                        connector = %peer.short(),
                        listener = %target.short(),
                        error = %e,
                        "connection refused"
                    );
                }
            }
            Classified::Acceptor { channel, listener } => {
                let tunnel = match self.inner.matcher.resolve_accept(channel, listener).await {
                    Ok(tunnel) => tunnel,
                    Err(e) => {
                        tracing::info!(listener = %listener.short(), error = %e, "accept refused");
                        return;
                    }
                };

                let connector = *tunnel.connector();
                tracing::info!(
                    listener = %listener.short(),
                    connector = %connector.short(),
                    "tunnel opened"
                );
                let end = tunnel
                    .run(config.keepalive_timeout, config.tick_interval, Some(shutdown_rx))
                    .await;
                match end {
                    TunnelEnd::Side(side, e) => tracing::info!(
                        listener = %listener.short(),
                        connector = %connector.short(),
                        ?side,
                        reason = %e,
                        "tunnel closed"
                    ),
                    TunnelEnd::Shutdown => tracing::info!(
                        listener = %listener.short(),
                        connector = %connector.short(),
                        "tunnel closed for shutdown"
                    ),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{channel_pair, ChannelPeer, CloseReason};
    use crate::identity::PublicIdentity;
    use crate::messages::{InitConnection, RelayListenIn, RelayListenOut, TunnelMessage};
    use crate::protocol::Frame;
    use bytes::Bytes;

    fn identity(byte: u8) -> PublicIdentity {
        PublicIdentity::from([byte; 32])
    }

    fn close_frame(reason: CloseReason) -> Frame {
        Frame::Close {
            reason: reason.as_str().to_string(),
        }
    }

    /// Opens a channel on the relay and sends its init message.
    async fn open(relay: &Relay, peer: u8, init: InitConnection) -> ChannelPeer {
        let (channel, remote) = channel_pair(identity(peer), 16);
        relay.accept(channel);
        remote.deliver(init.encode()).await.unwrap();
        remote
    }

    /// Next frame that is not a keep-alive of the given schema.
    async fn next_frame_skipping(remote: &mut ChannelPeer, keepalive: &Bytes) -> Option<Frame> {
        loop {
            match remote.next_frame().await? {
                Frame::Message(payload) if &payload == keepalive => {}
                frame => return Some(frame),
            }
        }
    }

    async fn wait_for_listener(relay: &Relay, listener: u8) {
        while relay.directory().lookup(&identity(listener)).await.is_none() {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_listen_connect_accept_message() {
        let relay = Relay::new(RelayConfig::default());
        let listen_keepalive = RelayListenOut::KeepAlive.encode();
        let tunnel_keepalive = TunnelMessage::KeepAlive.encode();

        let mut listener = open(&relay, 1, InitConnection::Listen).await;
        wait_for_listener(&relay, 1).await;

        let mut connector = open(&relay, 2, InitConnection::Connect(identity(1))).await;
        assert_eq!(
            next_frame_skipping(&mut listener, &listen_keepalive).await,
            Some(Frame::Message(
                RelayListenOut::IncomingConnection(identity(2)).encode()
            ))
        );

        let mut acceptor = open(&relay, 1, InitConnection::Accept(identity(1))).await;

        let hello = TunnelMessage::Message(Bytes::from_static(b"hello")).encode();
        connector.deliver(hello.clone()).await.unwrap();
        assert_eq!(
            next_frame_skipping(&mut acceptor, &tunnel_keepalive).await,
            Some(Frame::Message(hello))
        );

        let world = TunnelMessage::Message(Bytes::from_static(b"world")).encode();
        acceptor.deliver(world.clone()).await.unwrap();
        assert_eq!(
            next_frame_skipping(&mut connector, &tunnel_keepalive).await,
            Some(Frame::Message(world))
        );
    }

    #[tokio::test]
    async fn test_two_connectors_reject_oldest() {
        let relay = Relay::new(RelayConfig::default());
        let listen_keepalive = RelayListenOut::KeepAlive.encode();
        let tunnel_keepalive = TunnelMessage::KeepAlive.encode();

        let mut listener = open(&relay, 1, InitConnection::Listen).await;
        wait_for_listener(&relay, 1).await;

        let mut first = open(&relay, 2, InitConnection::Connect(identity(1))).await;
        assert_eq!(
            next_frame_skipping(&mut listener, &listen_keepalive).await,
            Some(Frame::Message(
                RelayListenOut::IncomingConnection(identity(2)).encode()
            ))
        );
        let mut second = open(&relay, 3, InitConnection::Connect(identity(1))).await;
        assert_eq!(
            next_frame_skipping(&mut listener, &listen_keepalive).await,
            Some(Frame::Message(
                RelayListenOut::IncomingConnection(identity(3)).encode()
            ))
        );

        listener
            .deliver(RelayListenIn::RejectConnection(identity(2)).encode())
            .await
            .unwrap();
        assert_eq!(first.next_frame().await, Some(close_frame(CloseReason::Rejected)));

        let mut acceptor = open(&relay, 1, InitConnection::Accept(identity(1))).await;
        let data = TunnelMessage::Message(Bytes::from_static(b"second")).encode();
        second.deliver(data.clone()).await.unwrap();
        assert_eq!(
            next_frame_skipping(&mut acceptor, &tunnel_keepalive).await,
            Some(Frame::Message(data))
        );
    }

    #[tokio::test]
    async fn test_connect_without_listener_is_unreachable() {
        let relay = Relay::new(RelayConfig::default());
        let mut connector = open(&relay, 2, InitConnection::Connect(identity(1))).await;
        assert_eq!(
            connector.next_frame().await,
            Some(close_frame(CloseReason::Unreachable))
        );
    }

    #[tokio::test]
    async fn test_duplicate_listen_is_refused() {
        let relay = Relay::new(RelayConfig::default());
        let _listener = open(&relay, 1, InitConnection::Listen).await;
        wait_for_listener(&relay, 1).await;

        let mut duplicate = open(&relay, 1, InitConnection::Listen).await;
        assert_eq!(
            duplicate.next_frame().await,
            Some(close_frame(CloseReason::AlreadyListening))
        );
        assert_eq!(relay.directory().len().await, 1);
    }

    #[tokio::test]
    async fn test_listener_disconnect_rejects_pending_connector() {
        let relay = Relay::new(RelayConfig::default());
        let listen_keepalive = RelayListenOut::KeepAlive.encode();

        let mut listener = open(&relay, 1, InitConnection::Listen).await;
        wait_for_listener(&relay, 1).await;

        let mut connector = open(&relay, 2, InitConnection::Connect(identity(1))).await;
        assert!(matches!(
            next_frame_skipping(&mut listener, &listen_keepalive).await,
            Some(Frame::Message(_))
        ));
        drop(listener);

        assert_eq!(
            connector.next_frame().await,
            Some(close_frame(CloseReason::ListenerGone))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_channel_is_dropped_after_init_timeout() {
        let relay = Relay::new(RelayConfig::default());
        let (channel, mut remote) = channel_pair(identity(1), 4);
        relay.accept(channel);

        assert_eq!(remote.next_frame().await, Some(close_frame(CloseReason::Timeout)));
    }

    #[tokio::test]
    async fn test_shutdown_closes_listener_and_tunnel() {
        let relay = Relay::new(RelayConfig::default());
        let listen_keepalive = RelayListenOut::KeepAlive.encode();
        let tunnel_keepalive = TunnelMessage::KeepAlive.encode();

        let mut listener = open(&relay, 1, InitConnection::Listen).await;
        wait_for_listener(&relay, 1).await;
        let mut connector = open(&relay, 2, InitConnection::Connect(identity(1))).await;
        assert!(next_frame_skipping(&mut listener, &listen_keepalive).await.is_some());

        let mut acceptor = open(&relay, 1, InitConnection::Accept(identity(1))).await;
        // Prove the tunnel is up before shutting down.
        let ping = TunnelMessage::Message(Bytes::from_static(b"ping")).encode();
        connector.deliver(ping.clone()).await.unwrap();
        assert_eq!(
            next_frame_skipping(&mut acceptor, &tunnel_keepalive).await,
            Some(Frame::Message(ping))
        );

        relay.shutdown();

        assert_eq!(
            next_frame_skipping(&mut listener, &listen_keepalive).await,
            Some(close_frame(CloseReason::Shutdown))
        );
        assert_eq!(
            next_frame_skipping(&mut connector, &tunnel_keepalive).await,
            Some(close_frame(CloseReason::Shutdown))
        );
        assert_eq!(
            next_frame_skipping(&mut acceptor, &tunnel_keepalive).await,
            Some(close_frame(CloseReason::Shutdown))
        );
    }

    #[test]
    fn test_default_config() {
        let config = RelayConfig::default();
        assert_eq!(config.keepalive_timeout, Duration::from_secs(30));
        assert_eq!(config.tick_interval, Duration::from_secs(1));
        assert_eq!(config.pending_timeout, Duration::from_secs(15));
        assert_eq!(config.init_timeout, Duration::from_secs(10));
        assert_eq!(config.channel_capacity, DEFAULT_CHANNEL_CAPACITY);
    }
}
