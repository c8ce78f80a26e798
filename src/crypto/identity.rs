//! Peer identity model and Ed25519 key material.
//!
//! A [`Peer`] is a remote participant as learned from its identity message.
//! Identity is the public key alone: alias, last-seen time and signal strength
//! are observations that may differ between two values describing the same peer.
//! A [`LocalPeer`] adds the private half, which never leaves the process.

use crate::utils::{CryptoError, Result};
use chrono::{DateTime, Utc};
use ed25519_dalek::{SigningKey, VerifyingKey, SECRET_KEY_LENGTH};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Signal strength reported when the transport gives none
pub const UNKNOWN_SIGNAL_STRENGTH: i32 = 0;

/// Ed25519 key pair backing a local identity
#[derive(Clone)]
pub struct IdentityKeyPair {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl IdentityKeyPair {
    /// Generate a new random identity key pair
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();

        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Restore a key pair from its 32-byte secret
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKey` if the secret has the wrong length
    pub fn from_secret_bytes(secret_bytes: &[u8]) -> Result<Self> {
        let secret: [u8; SECRET_KEY_LENGTH] =
            secret_bytes.try_into().map_err(|_| CryptoError::InvalidKey {
                reason: format!(
                    "Invalid secret key length: expected {}, got {}",
                    SECRET_KEY_LENGTH,
                    secret_bytes.len()
                ),
            })?;
        let signing_key = SigningKey::from_bytes(&secret);
        let verifying_key = signing_key.verifying_key();

        Ok(Self {
            signing_key,
            verifying_key,
        })
    }

    /// Public key as raw bytes
    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.verifying_key.to_bytes().to_vec()
    }

    /// Secret key as raw bytes, for persisting the local identity
    pub fn secret_key_bytes(&self) -> [u8; SECRET_KEY_LENGTH] {
        self.signing_key.to_bytes()
    }
}

impl fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("public_key", &hex::encode(self.verifying_key.as_bytes()))
            .field("signing_key", &"[REDACTED]")
            .finish()
    }
}

/// Identity-bearing remote participant, keyed by public key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    public_key: Vec<u8>,
    alias: String,
    last_seen: DateTime<Utc>,
    signal_strength: i32,
}

impl Peer {
    /// Create a peer observed now
    pub fn new(public_key: Vec<u8>, alias: impl Into<String>, signal_strength: i32) -> Self {
        Self {
            public_key,
            alias: alias.into(),
            last_seen: Utc::now(),
            signal_strength,
        }
    }

    /// Public key bytes; the sole identity of the peer
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Human-readable alias announced by the peer
    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// When this observation was made
    pub fn last_seen(&self) -> DateTime<Utc> {
        self.last_seen
    }

    /// Transport-reported signal strength at observation time
    pub fn signal_strength(&self) -> i32 {
        self.signal_strength
    }

    /// Short hex fingerprint of the public key for logs and display
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(&self.public_key);
        hex::encode(&digest[..4])
    }

    /// Same identity, re-observed now with a new signal strength
    pub fn observed(&self, signal_strength: i32) -> Self {
        Self {
            public_key: self.public_key.clone(),
            alias: self.alias.clone(),
            last_seen: Utc::now(),
            signal_strength,
        }
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.public_key == other.public_key
    }
}

impl Eq for Peer {}

impl Hash for Peer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.public_key.hash(state);
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.alias, self.fingerprint())
    }
}

/// The local participant: its public [`Peer`] view plus the private key
#[derive(Debug, Clone)]
pub struct LocalPeer {
    peer: Peer,
    keypair: IdentityKeyPair,
}

impl LocalPeer {
    /// Create a local peer with a freshly generated key pair
    pub fn generate(alias: impl Into<String>) -> Self {
        Self::from_keypair(IdentityKeyPair::generate(), alias)
    }

    /// Create a local peer from existing key material
    pub fn from_keypair(keypair: IdentityKeyPair, alias: impl Into<String>) -> Self {
        let peer = Peer::new(keypair.public_key_bytes(), alias, UNKNOWN_SIGNAL_STRENGTH);
        Self { peer, keypair }
    }

    /// Public view, as announced to remote peers
    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    /// Private key material
    pub fn keypair(&self) -> &IdentityKeyPair {
        &self.keypair
    }

    /// Alias announced to remote peers
    pub fn alias(&self) -> &str {
        self.peer.alias()
    }

    /// Public key bytes
    pub fn public_key(&self) -> &[u8] {
        self.peer.public_key()
    }
}
