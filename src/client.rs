//! Client side of the relay protocol.
//!
//! A [`RelayClient`] is one QUIC connection authenticated with a client
//! identity. Each call to [`RelayClient::open`] starts a new stream and
//! sends its `InitConnection`; the returned [`RelayStream`] then speaks the
//! schema of the chosen role.

use bytes::Bytes;
use quinn::{Connection, Endpoint, SendStream};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::identity::PublicIdentity;
use crate::messages::InitConnection;
use crate::protocol::Frame;
use crate::tls::{build_client_config_fingerprint, build_client_config_insecure, CertKeyPair};
use crate::transport::{write_frame, FrameReader};

/// How the client checks the relay's certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerVerification {
    /// Pin the SHA-256 fingerprint of the relay certificate.
    Fingerprint([u8; 32]),
    /// No verification (insecure, development only).
    Insecure,
}

/// What arrived on a relay stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// One serialized message.
    Message(Bytes),
    /// The relay closed the stream with a reason.
    Closed(String),
    /// The relay finished the stream without a reason.
    Finished,
}

/// A QUIC connection to the relay.
pub struct RelayClient {
    endpoint: Endpoint,
    connection: Connection,
    identity: PublicIdentity,
}

impl RelayClient {
    /// Connects to the relay at `server_addr`, authenticating as `identity`.
    pub async fn connect(
        server_addr: SocketAddr,
        server_name: &str,
        identity: &CertKeyPair,
        verification: &ServerVerification,
        alpn: &str,
        idle_timeout: Duration,
    ) -> Result<Self> {
        let tls_config = match verification {
            ServerVerification::Fingerprint(fingerprint) => {
                build_client_config_fingerprint(fingerprint, identity, alpn)
            }
            ServerVerification::Insecure => build_client_config_insecure(identity, alpn),
        }
        .map_err(|e| Error::TlsVerificationFailed(e.to_string()))?;

        let mut transport = quinn::TransportConfig::default();
        transport.max_idle_timeout(Some(
            idle_timeout
                .try_into()
                .map_err(|_| Error::Config("idle timeout too large".to_string()))?,
        ));

        let mut client_config = quinn::ClientConfig::new(Arc::new(
            quinn::crypto::rustls::QuicClientConfig::try_from(tls_config)
                .map_err(|e| Error::Config(format!("failed to create QUIC config: {}", e)))?,
        ));
        client_config.transport_config(Arc::new(transport));

        let bind_addr = if server_addr.is_ipv6() {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        };

        let mut endpoint = Endpoint::client(bind_addr).map_err(Error::Io)?;
        endpoint.set_default_client_config(client_config);

        let connection = endpoint
            .connect(server_addr, server_name)
            .map_err(|e| Error::QuicConnectionFailed(e.to_string()))?
            .await
            .map_err(|e| match e {
                quinn::ConnectionError::TransportError(_) => {
                    Error::TlsVerificationFailed(e.to_string())
                }
                other => Error::QuicConnectionFailed(other.to_string()),
            })?;

        tracing::debug!(
            remote_addr = ?connection.remote_address(),
            identity = %identity.identity().short(),
            "connected to relay"
        );

        Ok(Self {
            endpoint,
            connection,
            identity: identity.identity(),
        })
    }

    /// The identity the relay knows this client by.
    pub fn identity(&self) -> &PublicIdentity {
        &self.identity
    }

    /// Opens a stream and declares its role.
    pub async fn open(&self, init: InitConnection) -> Result<RelayStream> {
        let (send, recv) = self
            .connection
            .open_bi()
            .await
            .map_err(|e| Error::QuicConnectionFailed(format!("failed to open stream: {}", e)))?;

        let mut stream = RelayStream {
            send,
            reader: FrameReader::new(recv),
        };
        stream.send_message(init.encode()).await?;
        Ok(stream)
    }

    /// Closes the connection and waits for the close to reach the relay.
    pub async fn close(self) {
        self.connection.close(0u32.into(), b"client closed");
        self.endpoint.wait_idle().await;
    }
}

/// One stream to the relay.
pub struct RelayStream {
    send: SendStream,
    reader: FrameReader,
}

impl RelayStream {
    /// Sends one serialized message.
    pub async fn send_message(&mut self, payload: Bytes) -> Result<()> {
        write_frame(&mut self.send, &Frame::Message(payload)).await
    }

    /// Waits for the next message or the end of the stream.
    pub async fn recv(&mut self) -> Result<StreamEvent> {
        Ok(match self.reader.read_frame().await? {
            Some(Frame::Message(payload)) => StreamEvent::Message(payload),
            Some(Frame::Close { reason }) => StreamEvent::Closed(reason),
            None => StreamEvent::Finished,
        })
    }

    /// Finishes the stream, optionally telling the relay why.
    pub async fn close(mut self, reason: Option<&str>) -> Result<()> {
        if let Some(reason) = reason {
            write_frame(
                &mut self.send,
                &Frame::Close {
                    reason: reason.to_string(),
                },
            )
            .await?;
        }
        self.send
            .finish()
            .map_err(|e| Error::QuicConnectionFailed(format!("failed to finish stream: {}", e)))
    }
}
