//! Relay protocol messages and their wire encoding.
//!
//! Each message is a tag byte followed by its fields. Identities are written
//! as a varint length and the raw identity bytes; tunneled payloads take the
//! rest of the message verbatim.

use bytes::{BufMut, Bytes, BytesMut};

use crate::identity::PublicIdentity;
use crate::protocol::{decode_varint, encode_varint, ProtocolError, ProtocolResult};

const TAG_INIT_LISTEN: u8 = 0x01;
const TAG_INIT_ACCEPT: u8 = 0x02;
const TAG_INIT_CONNECT: u8 = 0x03;

const TAG_KEEPALIVE: u8 = 0x01;
const TAG_REJECT_CONNECTION: u8 = 0x02;
const TAG_INCOMING_CONNECTION: u8 = 0x02;
const TAG_TUNNEL_MESSAGE: u8 = 0x02;

/// First message on every channel: the role the client takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitConnection {
    /// Register as the listener for the channel's own identity.
    Listen,
    /// Serve the oldest pending connection of the given listener identity.
    Accept(PublicIdentity),
    /// Connect to the listener with the given identity.
    Connect(PublicIdentity),
}

/// Listener to relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayListenIn {
    KeepAlive,
    RejectConnection(PublicIdentity),
}

/// Relay to listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayListenOut {
    KeepAlive,
    IncomingConnection(PublicIdentity),
}

/// Either tunnel side to relay, and relay to either tunnel side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelMessage {
    KeepAlive,
    Message(Bytes),
}

fn put_identity(id: &PublicIdentity, buf: &mut BytesMut) {
    encode_varint(id.len() as u64, buf);
    buf.put_slice(id.as_bytes());
}

fn take_identity(buf: &mut &[u8]) -> ProtocolResult<PublicIdentity> {
    let len = decode_varint(buf)?.ok_or(ProtocolError::IncompleteData)? as usize;
    if buf.len() < len {
        return Err(ProtocolError::IncompleteData);
    }
    let id = PublicIdentity::from_slice(&buf[..len]).ok_or(ProtocolError::InvalidIdentitySize(len))?;
    *buf = &buf[len..];
    Ok(id)
}

/// Splits off the tag byte.
fn take_tag(buf: &[u8]) -> ProtocolResult<(u8, &[u8])> {
    match buf.split_first() {
        Some((tag, rest)) => Ok((*tag, rest)),
        None => Err(ProtocolError::EmptyMessage),
    }
}

fn expect_end(buf: &[u8]) -> ProtocolResult<()> {
    if buf.is_empty() {
        Ok(())
    } else {
        Err(ProtocolError::TrailingBytes)
    }
}

impl InitConnection {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            InitConnection::Listen => buf.put_u8(TAG_INIT_LISTEN),
            InitConnection::Accept(id) => {
                buf.put_u8(TAG_INIT_ACCEPT);
                put_identity(id, &mut buf);
            }
            InitConnection::Connect(id) => {
                buf.put_u8(TAG_INIT_CONNECT);
                put_identity(id, &mut buf);
            }
        }
        buf.freeze()
    }

    pub fn decode(buf: &[u8]) -> ProtocolResult<Self> {
        let (tag, mut rest) = take_tag(buf)?;
        let msg = match tag {
            TAG_INIT_LISTEN => InitConnection::Listen,
            TAG_INIT_ACCEPT => InitConnection::Accept(take_identity(&mut rest)?),
            TAG_INIT_CONNECT => InitConnection::Connect(take_identity(&mut rest)?),
            other => return Err(ProtocolError::InvalidMessageTag(other)),
        };
        expect_end(rest)?;
        Ok(msg)
    }
}

impl RelayListenIn {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            RelayListenIn::KeepAlive => buf.put_u8(TAG_KEEPALIVE),
            RelayListenIn::RejectConnection(id) => {
                buf.put_u8(TAG_REJECT_CONNECTION);
                put_identity(id, &mut buf);
            }
        }
        buf.freeze()
    }

    pub fn decode(buf: &[u8]) -> ProtocolResult<Self> {
        let (tag, mut rest) = take_tag(buf)?;
        let msg = match tag {
            TAG_KEEPALIVE => RelayListenIn::KeepAlive,
            TAG_REJECT_CONNECTION => RelayListenIn::RejectConnection(take_identity(&mut rest)?),
            other => return Err(ProtocolError::InvalidMessageTag(other)),
        };
        expect_end(rest)?;
        Ok(msg)
    }
}

impl RelayListenOut {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            RelayListenOut::KeepAlive => buf.put_u8(TAG_KEEPALIVE),
            RelayListenOut::IncomingConnection(id) => {
                buf.put_u8(TAG_INCOMING_CONNECTION);
                put_identity(id, &mut buf);
            }
        }
        buf.freeze()
    }

    pub fn decode(buf: &[u8]) -> ProtocolResult<Self> {
        let (tag, mut rest) = take_tag(buf)?;
        let msg = match tag {
            TAG_KEEPALIVE => RelayListenOut::KeepAlive,
            TAG_INCOMING_CONNECTION => RelayListenOut::IncomingConnection(take_identity(&mut rest)?),
            other => return Err(ProtocolError::InvalidMessageTag(other)),
        };
        expect_end(rest)?;
        Ok(msg)
    }
}

impl TunnelMessage {
    pub fn encode(&self) -> Bytes {
        match self {
            TunnelMessage::KeepAlive => Bytes::from_static(&[TAG_KEEPALIVE]),
            TunnelMessage::Message(data) => {
                let mut buf = BytesMut::with_capacity(1 + data.len());
                buf.put_u8(TAG_TUNNEL_MESSAGE);
                buf.put_slice(data);
                buf.freeze()
            }
        }
    }

    pub fn decode(buf: &[u8]) -> ProtocolResult<Self> {
        let (tag, rest) = take_tag(buf)?;
        match tag {
            TAG_KEEPALIVE => {
                expect_end(rest)?;
                Ok(TunnelMessage::KeepAlive)
            }
            TAG_TUNNEL_MESSAGE => Ok(TunnelMessage::Message(Bytes::copy_from_slice(rest))),
            other => Err(ProtocolError::InvalidMessageTag(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(byte: u8) -> PublicIdentity {
        PublicIdentity::from([byte; 32])
    }

    #[test]
    fn test_init_connection_roundtrip() {
        for msg in [
            InitConnection::Listen,
            InitConnection::Accept(identity(1)),
            InitConnection::Connect(PublicIdentity::from_slice(&[7u8; 64]).unwrap()),
        ] {
            assert_eq!(InitConnection::decode(&msg.encode()).unwrap(), msg);
        }
    }

    #[test]
    fn test_listen_encodes_to_single_tag() {
        assert_eq!(&InitConnection::Listen.encode()[..], &[TAG_INIT_LISTEN]);
    }

    #[test]
    fn test_init_connection_unknown_tag() {
        assert_eq!(
            InitConnection::decode(&[0x09]),
            Err(ProtocolError::InvalidMessageTag(0x09))
        );
    }

    #[test]
    fn test_init_connection_empty() {
        assert_eq!(InitConnection::decode(&[]), Err(ProtocolError::EmptyMessage));
    }

    #[test]
    fn test_init_connection_trailing_bytes() {
        assert_eq!(
            InitConnection::decode(&[TAG_INIT_LISTEN, 0x00]),
            Err(ProtocolError::TrailingBytes)
        );
    }

    #[test]
    fn test_identity_with_invalid_width() {
        let mut buf = BytesMut::new();
        buf.put_u8(TAG_INIT_CONNECT);
        encode_varint(20, &mut buf);
        buf.put_slice(&[0u8; 20]);
        assert_eq!(
            InitConnection::decode(&buf),
            Err(ProtocolError::InvalidIdentitySize(20))
        );
    }

    #[test]
    fn test_identity_truncated() {
        let encoded = InitConnection::Connect(identity(3)).encode();
        assert_eq!(
            InitConnection::decode(&encoded[..encoded.len() - 1]),
            Err(ProtocolError::IncompleteData)
        );
    }

    #[test]
    fn test_listen_in_and_out() {
        let reject = RelayListenIn::RejectConnection(identity(4));
        assert_eq!(RelayListenIn::decode(&reject.encode()).unwrap(), reject);
        assert_eq!(
            RelayListenIn::decode(&RelayListenIn::KeepAlive.encode()).unwrap(),
            RelayListenIn::KeepAlive
        );

        let incoming = RelayListenOut::IncomingConnection(identity(5));
        assert_eq!(RelayListenOut::decode(&incoming.encode()).unwrap(), incoming);
    }

    #[test]
    fn test_init_message_is_not_a_listener_message() {
        // An InitConnection::Connect sent on a listener channel carries tag 0x03.
        let init = InitConnection::Connect(identity(6)).encode();
        assert_eq!(
            RelayListenIn::decode(&init),
            Err(ProtocolError::InvalidMessageTag(TAG_INIT_CONNECT))
        );
    }

    #[test]
    fn test_tunnel_message_keeps_payload_verbatim() {
        let msg = TunnelMessage::Message(Bytes::from_static(b"\x00\x01hello"));
        let encoded = msg.encode();
        assert_eq!(&encoded[1..], b"\x00\x01hello");
        assert_eq!(TunnelMessage::decode(&encoded).unwrap(), msg);

        let empty = TunnelMessage::Message(Bytes::new());
        assert_eq!(TunnelMessage::decode(&empty.encode()).unwrap(), empty);
    }

    #[test]
    fn test_tunnel_keepalive_with_payload_is_rejected() {
        assert_eq!(
            TunnelMessage::decode(&[TAG_KEEPALIVE, 0x01]),
            Err(ProtocolError::TrailingBytes)
        );
    }
}
