//! # Peer Identities and Contacts
//!
//! - [`Identity`]: 32-byte peer identifier, rendered as hex
//! - [`Contact`]: an identity plus the addresses it can be reached at
//!
//! Contacts compare and hash by identity only, so a contact learned through
//! two different paths (for example with a different address order) is still
//! the same member of a result set.

use std::fmt;

/// Domain prefix for identities derived from a label.
const IDENTITY_DERIVE_DOMAIN: &[u8] = b"skipmesh-identity-v1:";

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Identity([u8; 32]);

impl Identity {
    /// Deterministically derive an identity from an arbitrary label.
    ///
    /// Used by the loopback overlay and tests to mint stable peer ids.
    pub fn derive(label: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(IDENTITY_DERIVE_DOMAIN);
        hasher.update(label);
        Self(*hasher.finalize().as_bytes())
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[derive(Clone, Debug)]
pub struct Contact {
    pub identity: Identity,
    pub addrs: Vec<String>,
}

impl Contact {
    pub fn new(identity: Identity, addrs: Vec<String>) -> Self {
        Self { identity, addrs }
    }

    /// Create a contact with a single address.
    pub fn single(identity: Identity, addr: impl Into<String>) -> Self {
        Self::new(identity, vec![addr.into()])
    }

    /// Get the primary address (first in the list).
    pub fn primary_addr(&self) -> Option<&str> {
        self.addrs.first().map(|s| s.as_str())
    }
}

impl PartialEq for Contact {
    fn eq(&self, other: &Self) -> bool {
        self.identity == other.identity
    }
}

impl Eq for Contact {}

impl std::hash::Hash for Contact {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.identity.hash(state);
    }
}
