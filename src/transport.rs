//! Frame I/O over QUIC streams, and the pumps that attach a stream to a
//! relay channel.

use bytes::{Bytes, BytesMut};
use quinn::{RecvStream, SendStream};
use tokio::sync::mpsc;
use tokio::time::Duration;

use crate::channel::ChannelPeer;
use crate::common::READ_BUFFER_SIZE;
use crate::error::{Error, Result};
use crate::identity::PublicIdentity;
use crate::protocol::Frame;

/// How long a finished stream waits for the peer to acknowledge its data.
const FINISH_TIMEOUT: Duration = Duration::from_secs(5);

/// Buffered frame decoder over a QUIC receive stream.
#[derive(Debug)]
pub struct FrameReader {
    recv: RecvStream,
    buffer: BytesMut,
}

impl FrameReader {
    pub fn new(recv: RecvStream) -> Self {
        Self {
            recv,
            buffer: BytesMut::with_capacity(READ_BUFFER_SIZE),
        }
    }

    /// Reads the next complete frame, or `None` once the peer finished the
    /// stream cleanly.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            if let Some((frame, consumed)) = Frame::decode(&self.buffer)
                .map_err(|e| Error::QuicConnectionFailed(format!("invalid frame: {}", e)))?
            {
                let _ = self.buffer.split_to(consumed);
                return Ok(Some(frame));
            }

            let mut read_buf = [0u8; READ_BUFFER_SIZE];
            match self.recv.read(&mut read_buf).await {
                Ok(Some(n)) if n > 0 => self.buffer.extend_from_slice(&read_buf[..n]),
                Ok(_) => {
                    if self.buffer.is_empty() {
                        return Ok(None);
                    }
                    return Err(Error::QuicConnectionFailed(
                        "stream ended inside a frame".to_string(),
                    ));
                }
                Err(e) => {
                    return Err(Error::QuicConnectionFailed(format!(
                        "stream read failed: {}",
                        e
                    )))
                }
            }
        }
    }
}

/// Writes one frame to a QUIC send stream.
pub async fn write_frame(send: &mut SendStream, frame: &Frame) -> Result<()> {
    send.write_all(&frame.to_bytes())
        .await
        .map_err(|e| Error::QuicConnectionFailed(format!("stream write failed: {}", e)))
}

/// Pumps a QUIC stream to and from the relay side of a channel.
///
/// Inbound `MESSAGE` frames are handed to the relay; a `CLOSE` frame or the
/// end of the stream detaches the inbound side. Outbound frames are written
/// in order; after a `CLOSE`, or once the relay dropped the channel, the
/// stream is finished and the inbound side is detached too.
pub async fn pump_stream(mut send: SendStream, recv: RecvStream, peer: ChannelPeer) {
    let identity = *peer.identity();
    let (inbound, mut outbound) = peer.into_split();

    let inbound_task = tokio::spawn(pump_inbound(FrameReader::new(recv), inbound, identity));
    let inbound_abort = inbound_task.abort_handle();

    pump_outbound(&mut send, &mut outbound, identity).await;
    inbound_abort.abort();
}

async fn pump_inbound(mut reader: FrameReader, inbound: mpsc::Sender<Bytes>, identity: PublicIdentity) {
    loop {
        match reader.read_frame().await {
            Ok(Some(Frame::Message(payload))) => {
                if inbound.send(payload).await.is_err() {
                    // Relay side dropped the channel.
                    break;
                }
            }
            Ok(Some(Frame::Close { reason })) => {
                tracing::debug!(peer = %identity.short(), reason, "peer closed stream");
                break;
            }
            Ok(None) => {
                tracing::debug!(peer = %identity.short(), "peer finished stream");
                break;
            }
            Err(e) => {
                tracing::debug!(peer = %identity.short(), error = %e, "stream read ended");
                break;
            }
        }
    }
}

async fn pump_outbound(
    send: &mut SendStream,
    outbound: &mut mpsc::Receiver<Frame>,
    identity: PublicIdentity,
) {
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = write_frame(send, &frame).await {
            tracing::debug!(peer = %identity.short(), error = %e, "stream write ended");
            return;
        }
        if matches!(frame, Frame::Close { .. }) {
            break;
        }
    }
    if send.finish().is_ok() {
        // Hold the stream until the peer has everything, so closing the
        // connection right after cannot drop the tail.
        let _ = tokio::time::timeout(FINISH_TIMEOUT, send.stopped()).await;
    }
}
