//! Listener sessions.
//!
//! A session owns the listener's channel from registration until teardown.
//! It relays `IncomingConnection` notifications for new pending offers,
//! handles `RejectConnection`, expires stale offers and keeps both sides of
//! the channel alive. Outbound messages wait in a local queue until the
//! channel has room, so a listener that stops reading never stalls the
//! liveness tick. However the session ends, its directory entry is removed
//! first, which closes every offer still queued on it, and the listener
//! channel is closed after that.

use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Duration, Instant, MissedTickBehavior};

use crate::channel::{Channel, ChannelReader, ChannelWriter, CloseReason};
use crate::common::wait_for_shutdown;
use crate::directory::{ListenerDirectory, ListenerEntry};
use crate::error::RelayError;
use crate::identity::PublicIdentity;
use crate::liveness::LivenessMonitor;
use crate::messages::{RelayListenIn, RelayListenOut};
use crate::relay::RelayConfig;

/// A registered listener and its channel.
#[derive(Debug)]
pub struct ListenerSession {
    entry: Arc<ListenerEntry>,
    writer: ChannelWriter,
    reader: ChannelReader,
    incoming: mpsc::UnboundedReceiver<PublicIdentity>,
    /// Messages not yet handed to the channel, with the time they were queued.
    outbox: VecDeque<(RelayListenOut, Instant)>,
    liveness: LivenessMonitor,
    tick_interval: Duration,
    pending_timeout: Duration,
}

impl ListenerSession {
    /// Registers `channel` as the listener for its own identity.
    ///
    /// On `AlreadyListening` the new channel is closed and the existing
    /// listener is left alone.
    pub async fn start(
        directory: &ListenerDirectory,
        channel: Channel,
        config: &RelayConfig,
    ) -> Result<Self, RelayError> {
        let identity = *channel.peer();
        let (notifier, incoming) = mpsc::unbounded_channel();

        match directory.register(identity, notifier).await {
            Ok(entry) => {
                let (writer, reader) = channel.into_split();
                Ok(Self {
                    entry,
                    writer,
                    reader,
                    incoming,
                    outbox: VecDeque::new(),
                    liveness: LivenessMonitor::new(config.keepalive_timeout),
                    tick_interval: config.tick_interval,
                    pending_timeout: config.pending_timeout,
                })
            }
            Err(e) => {
                channel.close(e.close_reason());
                Err(e)
            }
        }
    }

    pub fn identity(&self) -> &PublicIdentity {
        self.entry.identity()
    }

    pub fn entry(&self) -> &Arc<ListenerEntry> {
        &self.entry
    }

    /// Drives the session until the channel ends, misbehaves, goes silent
    /// or the relay shuts down, then tears it down.
    ///
    /// Returns `Ok(())` only for shutdown.
    pub async fn run(
        mut self,
        directory: &ListenerDirectory,
        mut shutdown: Option<broadcast::Receiver<()>>,
    ) -> Result<(), RelayError> {
        let end = self.serve(&mut shutdown).await;

        // Pending connectors learn why they will never be accepted.
        let (reason, pending_reason) = match &end {
            Ok(()) => (CloseReason::Shutdown, CloseReason::Shutdown),
            Err(e) => (e.close_reason(), CloseReason::ListenerGone),
        };
        let rejected = directory.remove(&self.entry, pending_reason).await;
        tracing::info!(
            identity = %self.identity().short(),
            %reason,
            rejected,
            "listener removed"
        );
        self.writer.close(reason);
        end
    }

    async fn serve(
        &mut self,
        shutdown: &mut Option<broadcast::Receiver<()>>,
    ) -> Result<(), RelayError> {
        let mut tick = tokio::time::interval(self.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                msg = self.reader.recv() => {
                    let Some(payload) = msg else {
                        return Err(RelayError::ChannelClosed);
                    };
                    self.liveness.record_inbound();
                    self.handle_message(&payload).await?;
                }
                Some(connector) = self.incoming.recv() => {
                    tracing::debug!(
                        listener = %self.identity().short(),
                        connector = %connector.short(),
                        "notifying listener of incoming connection"
                    );
                    self.outbox
                        .push_back((RelayListenOut::IncomingConnection(connector), Instant::now()));
                }
                permit = self.writer.reserve(), if !self.outbox.is_empty() => {
                    let permit = permit?;
                    if let Some((msg, _)) = self.outbox.pop_front() {
                        permit.send(msg.encode());
                        self.liveness.record_outbound();
                    }
                }
                _ = tick.tick() => {
                    self.on_tick().await?;
                }
                _ = wait_for_shutdown(shutdown) => {
                    return Ok(());
                }
            }
        }
    }

    async fn handle_message(&mut self, payload: &[u8]) -> Result<(), RelayError> {
        match RelayListenIn::decode(payload) {
            Ok(RelayListenIn::KeepAlive) => Ok(()),
            Ok(RelayListenIn::RejectConnection(connector)) => {
                if self.entry.reject(&connector).await {
                    tracing::debug!(
                        listener = %self.identity().short(),
                        connector = %connector.short(),
                        "connection rejected"
                    );
                } else {
                    tracing::debug!(
                        listener = %self.identity().short(),
                        connector = %connector.short(),
                        "reject for unknown pending connection ignored"
                    );
                }
                Ok(())
            }
            Err(e) => {
                tracing::warn!(
                    listener = %self.identity().short(),
                    error = %e,
                    "invalid listener message"
                );
                Err(e.into())
            }
        }
    }

    async fn on_tick(&mut self) -> Result<(), RelayError> {
        let now = Instant::now();
        if self.liveness.is_expired(now) {
            tracing::debug!(listener = %self.identity().short(), "listener timed out");
            return Err(RelayError::LivenessTimeout);
        }
        if let Some((_, queued_at)) = self.outbox.front() {
            if now.saturating_duration_since(*queued_at) >= self.liveness.timeout() {
                tracing::debug!(
                    listener = %self.identity().short(),
                    queued = self.outbox.len(),
                    "listener stopped reading"
                );
                return Err(RelayError::LivenessTimeout);
            }
        }

        let expired = self.entry.expire(now, self.pending_timeout).await;
        if expired.timed_out > 0 || expired.abandoned > 0 {
            tracing::debug!(
                listener = %self.identity().short(),
                timed_out = expired.timed_out,
                abandoned = expired.abandoned,
                "pending connections expired"
            );
        }

        if self.outbox.is_empty() && self.liveness.keepalive_due(now) {
            self.outbox.push_back((RelayListenOut::KeepAlive, now));
        }
        Ok(())
    }
}
