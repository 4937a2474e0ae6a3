//! Server mode implementation for keyrelay.
//!
//! This module implements the QUIC server that authenticates clients by
//! their certificate and hands every bidirectional stream to the relay
//! core as one channel.

use quinn::{Connection, Endpoint, ServerConfig as QuinnServerConfig};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinSet;

use crate::channel::channel_pair;
use crate::cli::{default_config_dir, ServerArgs};
use crate::common::{format_duration, wait_for_shutdown};
use crate::error::{Error, Result};
use crate::relay::{Relay, RelayConfig};
use crate::tls::{build_server_config, load_cert_key, load_or_generate_cert, peer_identity, CertKeyPair};
use crate::transport::pump_stream;

/// How long a closing connection waits for its streams to flush.
const STREAM_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Runs the keyrelay server until SIGINT.
pub async fn run_server(args: &ServerArgs) -> Result<()> {
    let (cert_key, cert_auto_generated, config_path) = load_tls_config(args)?;
    let listen_addr = parse_listen_address(&args.listen)?;

    let server = RelayServer::bind(
        listen_addr,
        &cert_key,
        &args.alpn,
        args.idle_timeout,
        RelayConfig::from(args),
    )?;

    print_startup_message(args, &cert_key, cert_auto_generated, config_path.as_deref());

    server
        .serve(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for SIGINT");
                std::future::pending::<()>().await;
            }
            tracing::info!("Received SIGINT, initiating graceful shutdown...");
        })
        .await
}

/// A bound QUIC endpoint in front of a [`Relay`].
pub struct RelayServer {
    endpoint: Endpoint,
    relay: Relay,
}

impl RelayServer {
    /// Binds the QUIC endpoint. Clients must present a certificate.
    pub fn bind(
        listen_addr: SocketAddr,
        cert_key: &CertKeyPair,
        alpn: &str,
        idle_timeout: Duration,
        config: RelayConfig,
    ) -> Result<Self> {
        let tls_config = build_server_config(cert_key, alpn)
            .map_err(|e| Error::Config(format!("failed to build TLS config: {}", e)))?;

        let mut quinn_config = QuinnServerConfig::with_crypto(Arc::new(
            quinn::crypto::rustls::QuicServerConfig::try_from(tls_config)
                .map_err(|e| Error::Config(format!("failed to create QUIC config: {}", e)))?,
        ));

        let mut transport_config = quinn::TransportConfig::default();
        transport_config.max_idle_timeout(Some(
            idle_timeout
                .try_into()
                .map_err(|_| Error::Config("idle timeout too large".to_string()))?,
        ));
        quinn_config.transport_config(Arc::new(transport_config));

        let endpoint = Endpoint::server(quinn_config, listen_addr)
            .map_err(|e| Error::ListenFailed(e.to_string()))?;

        Ok(Self {
            endpoint,
            relay: Relay::new(config),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.endpoint.local_addr().map_err(Error::Io)
    }

    pub fn relay(&self) -> &Relay {
        &self.relay
    }

    /// Accepts connections until `shutdown` resolves, then closes every
    /// listener and tunnel and waits for connections to wind down.
    pub async fn serve<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let Self { endpoint, relay } = self;
        let listen_addr = endpoint.local_addr().map_err(Error::Io)?;
        tracing::info!("Server listening on {}", listen_addr);

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                incoming = endpoint.accept() => {
                    let Some(incoming) = incoming else {
                        // Endpoint closed
                        break;
                    };
                    let relay = relay.clone();
                    let conn_shutdown_rx = shutdown_tx.subscribe();

                    connections.spawn(async move {
                        let connection = match incoming.await {
                            Ok(connection) => connection,
                            Err(e) => {
                                tracing::warn!(error = %e, "failed to accept connection");
                                return;
                            }
                        };
                        let remote_addr = connection.remote_address();

                        match handle_connection(connection.clone(), relay, Some(conn_shutdown_rx)).await {
                            Ok(()) => tracing::debug!(?remote_addr, "connection finished"),
                            Err(e) => tracing::info!(?remote_addr, error = %e, "connection ended"),
                        }
                        connection.close(0u32.into(), b"connection ended");
                    });
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = &mut shutdown => {
                    break;
                }
            }
        }

        // Close frames go out on the still-open streams before connections close.
        relay.shutdown();
        let _ = shutdown_tx.send(());

        while connections.join_next().await.is_some() {}

        endpoint.close(0u32.into(), b"server shutting down");
        endpoint.wait_idle().await;
        tracing::info!("Server shutdown complete");

        Ok(())
    }
}

/// Loads TLS configuration from files or generates a new certificate.
fn load_tls_config(args: &ServerArgs) -> Result<(CertKeyPair, bool, Option<String>)> {
    match (&args.tls_cert, &args.tls_key) {
        (Some(cert_path), Some(key_path)) => {
            // When paths are specified, files must exist
            let cert_key = load_cert_key(cert_path, key_path)
                .map_err(|e| Error::Config(format!("failed to load TLS certificate: {}", e)))?;
            Ok((cert_key, false, None))
        }
        (None, None) => {
            let config_dir = args.config_dir.clone().unwrap_or_else(default_config_dir);
            let (cert_key, generated) = load_or_generate_cert(&config_dir)
                .map_err(|e| Error::Config(format!("failed to load or generate certificate: {}", e)))?;
            Ok((cert_key, generated, Some(config_dir.display().to_string())))
        }
        _ => Err(Error::Config(
            "both --tls-cert and --tls-key must be specified together".to_string(),
        )),
    }
}

/// Parses a listen address string into a SocketAddr.
fn parse_listen_address(listen: &str) -> Result<SocketAddr> {
    // ":port" listens on all IPv4 interfaces
    let addr_str = if listen.starts_with(':') {
        format!("0.0.0.0{}", listen)
    } else {
        listen.to_string()
    };

    addr_str
        .parse()
        .map_err(|e| Error::Config(format!("invalid listen address '{}': {}", listen, e)))
}

fn print_startup_message(
    args: &ServerArgs,
    cert_key: &CertKeyPair,
    auto_generated: bool,
    config_path: Option<&str>,
) {
    eprintln!("Starting relay...");
    eprintln!("  Listen: {}", args.listen);
    eprintln!("  ALPN: {}", args.alpn);
    eprintln!("  Idle Timeout: {}", format_duration(args.idle_timeout));
    eprintln!("  Keep-Alive Timeout: {}", format_duration(args.keepalive_timeout));
    eprintln!("  Pending Timeout: {}", format_duration(args.pending_timeout));
    eprintln!("  Init Timeout: {}", format_duration(args.init_timeout));
    eprintln!("  Fingerprint (SHA-256): {}", cert_key.fingerprint);

    if auto_generated {
        if let Some(path) = config_path {
            eprintln!("Certificate auto-generated and saved to {}", path);
        }
    }
}

/// Serves one authenticated client connection.
///
/// Every bidirectional stream the client opens becomes a relay channel
/// carrying the connection's identity.
async fn handle_connection(
    connection: Connection,
    relay: Relay,
    mut shutdown_rx: Option<broadcast::Receiver<()>>,
) -> Result<()> {
    let remote_addr = connection.remote_address();
    let identity = peer_identity(&connection).ok_or_else(|| {
        Error::TlsVerificationFailed("client presented no certificate".to_string())
    })?;
    tracing::info!(?remote_addr, identity = %identity.short(), "client authenticated");

    let mut streams = JoinSet::new();
    let result = loop {
        tokio::select! {
            stream = connection.accept_bi() => {
                match stream {
                    Ok((send, recv)) => {
                        let (channel, peer) = channel_pair(identity, relay.config().channel_capacity);
                        tracing::debug!(?remote_addr, stream = ?send.id(), "stream opened");
                        streams.spawn(pump_stream(send, recv, peer));
                        relay.accept(channel);
                    }
                    Err(quinn::ConnectionError::ApplicationClosed(_))
                    | Err(quinn::ConnectionError::LocallyClosed) => break Ok(()),
                    Err(e) => {
                        break Err(Error::QuicConnectionFailed(format!(
                            "failed to accept stream: {}",
                            e
                        )))
                    }
                }
            }
            Some(_) = streams.join_next(), if !streams.is_empty() => {}
            _ = wait_for_shutdown(&mut shutdown_rx) => break Ok(()),
        }
    };

    let drained = tokio::time::timeout(STREAM_DRAIN_TIMEOUT, async {
        while streams.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        tracing::debug!(?remote_addr, remaining = streams.len(), "aborting undrained streams");
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_listen_address_with_port_only() {
        let addr = parse_listen_address(":9443").unwrap();
        assert_eq!(addr.port(), 9443);
        assert_eq!(addr.ip(), std::net::Ipv4Addr::new(0, 0, 0, 0));
    }

    #[test]
    fn test_parse_listen_address_with_full_addr() {
        let addr = parse_listen_address("127.0.0.1:9443").unwrap();
        assert_eq!(addr.port(), 9443);
        assert_eq!(addr.ip(), std::net::Ipv4Addr::new(127, 0, 0, 1));
    }

    #[test]
    fn test_parse_listen_address_invalid() {
        assert!(parse_listen_address("invalid").is_err());
    }

    #[test]
    fn test_parse_listen_address_ipv6() {
        let addr = parse_listen_address("[::1]:9443").unwrap();
        assert_eq!(addr.port(), 9443);
    }

    #[test]
    fn test_load_tls_config_requires_both_paths() {
        let args = ServerArgs {
            listen: ":9443".to_string(),
            tls_cert: Some("/tmp/cert.pem".into()),
            tls_key: None,
            alpn: crate::cli::DEFAULT_ALPN.to_string(),
            idle_timeout: Duration::from_secs(60),
            keepalive_timeout: Duration::from_secs(30),
            tick_interval: Duration::from_secs(1),
            pending_timeout: Duration::from_secs(15),
            init_timeout: Duration::from_secs(10),
            config_dir: None,
        };
        assert!(matches!(load_tls_config(&args), Err(Error::Config(_))));
    }

    #[test]
    fn test_load_tls_config_generates_into_config_dir() {
        let dir = tempfile::tempdir().unwrap();
        let args = ServerArgs {
            listen: ":9443".to_string(),
            tls_cert: None,
            tls_key: None,
            alpn: crate::cli::DEFAULT_ALPN.to_string(),
            idle_timeout: Duration::from_secs(60),
            keepalive_timeout: Duration::from_secs(30),
            tick_interval: Duration::from_secs(1),
            pending_timeout: Duration::from_secs(15),
            init_timeout: Duration::from_secs(10),
            config_dir: Some(dir.path().to_path_buf()),
        };

        let (first, generated, path) = load_tls_config(&args).unwrap();
        assert!(generated);
        assert_eq!(path, Some(dir.path().display().to_string()));

        let (second, generated, _) = load_tls_config(&args).unwrap();
        assert!(!generated);
        assert_eq!(first.fingerprint, second.fingerprint);
    }
}
