//! Public identities used to address listeners and connectors.

use sha2::{Digest, Sha256};
use std::fmt;

/// Identity widths accepted on the wire, in bytes.
pub const VALID_IDENTITY_SIZES: [usize; 3] = [16, 32, 64];

/// Maximum identity width in bytes.
pub const MAX_IDENTITY_SIZE: usize = 64;

/// A fixed-width opaque public identity.
///
/// The relay never interprets the bytes; it only compares and hashes them.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicIdentity {
    len: u8,
    bytes: [u8; MAX_IDENTITY_SIZE],
}

impl PublicIdentity {
    /// Builds an identity from raw bytes.
    ///
    /// Returns `None` unless the slice has one of the valid widths.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if !VALID_IDENTITY_SIZES.contains(&bytes.len()) {
            return None;
        }
        let mut buf = [0u8; MAX_IDENTITY_SIZE];
        buf[..bytes.len()].copy_from_slice(bytes);
        Some(Self {
            len: bytes.len() as u8,
            bytes: buf,
        })
    }

    /// Derives the 256-bit identity of a DER-encoded certificate.
    pub fn from_certificate(cert_der: &[u8]) -> Self {
        let digest: [u8; 32] = Sha256::digest(cert_der).into();
        Self::from(digest)
    }

    /// Returns the identity bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    /// Returns the identity width in bytes.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Always false; kept for API symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Formats the first bytes of the identity for log lines.
    pub fn short(&self) -> String {
        self.as_bytes()[..8].iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl From<[u8; 32]> for PublicIdentity {
    fn from(bytes: [u8; 32]) -> Self {
        let mut buf = [0u8; MAX_IDENTITY_SIZE];
        buf[..32].copy_from_slice(&bytes);
        Self { len: 32, bytes: buf }
    }
}

impl fmt::Display for PublicIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.as_bytes() {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for PublicIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicIdentity({})", self.short())
    }
}
