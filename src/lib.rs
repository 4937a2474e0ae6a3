//! keyrelay - relay server for NAT-traversal tunneling.
//!
//! A listener registers under its public identity, a connector asks for
//! that identity, and once the listener accepts, the relay forwards messages
//! between the two until either side closes. Clients are QUIC connections
//! authenticated by a self-signed certificate whose SHA-256 digest is their
//! identity; every bidirectional stream is one relay channel.

pub mod channel;
pub mod classifier;
pub mod cli;
pub mod client;
pub mod common;
pub mod directory;
pub mod error;
pub mod identity;
pub mod listener;
pub mod liveness;
pub mod matcher;
pub mod messages;
pub mod protocol;
pub mod relay;
pub mod server;
pub mod tls;
pub mod transport;
pub mod tunnel;

pub use channel::{channel_pair, Channel, ChannelPeer, CloseReason, DEFAULT_CHANNEL_CAPACITY};
pub use classifier::{classify, Classified};
pub use cli::{BuildInfo, Cli, Command, IdentityArgs, ServerArgs};
pub use client::{RelayClient, RelayStream, ServerVerification, StreamEvent};
pub use common::{format_duration, READ_BUFFER_SIZE};
pub use directory::{ListenerDirectory, ListenerEntry, PendingOffer};
pub use error::{Error, ExitCode, RelayError, Result};
pub use identity::PublicIdentity;
pub use listener::ListenerSession;
pub use liveness::LivenessMonitor;
pub use matcher::MatchEngine;
pub use messages::{InitConnection, RelayListenIn, RelayListenOut, TunnelMessage};
pub use protocol::{decode_varint, encode_varint, Frame, ProtocolError, ProtocolResult};
pub use relay::{Relay, RelayConfig};
pub use server::{run_server, RelayServer};
pub use tls::{
    build_client_config_fingerprint, build_client_config_insecure, build_server_config,
    compute_fingerprint, format_fingerprint, generate_cert_key, load_cert_key,
    load_or_generate_cert, load_or_generate_identity, parse_fingerprint, CertKeyPair, TlsError,
    TlsResult,
};
pub use tunnel::{Tunnel, TunnelEnd, TunnelSide};
