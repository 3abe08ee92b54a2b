//! Diffie-Hellman handshake and stream transform
//!
//! Each connection owns a filter. The filter appends its X25519 public key
//! to outgoing negotiation packets, consumes the peer's key from incoming
//! ones, and derives a ChaCha20 session key via HKDF-SHA256. After the
//! exchange, `encrypt`/`decrypt` run the keystream over packet bodies.
//!
//! The only contract the rest of the system relies on: `pre_connect` on one
//! side followed by `receive_connect` on the peer yields matching session
//! keys, and the transform round-trips. Internals are interchangeable.

use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::{PublicKey, ReusableSecret};

use crate::buffer::{BufferReader, BufferWriter};
use crate::{Error, Result};

/// Handshake key material size on the wire (an X25519 public key)
pub const KEY_MATERIAL_LEN: usize = 32;

const SESSION_INFO: &[u8] = b"mg session v1";

struct SessionKey {
    key: [u8; 32],
    nonce: [u8; 12],
}

/// Per-connection handshake state and symmetric transform
pub struct DhChachaFilter {
    secret: ReusableSecret,
    public: PublicKey,
    session: Option<SessionKey>,
}

impl DhChachaFilter {
    /// Create a filter with a fresh ephemeral secret
    pub fn new() -> Self {
        let secret = ReusableSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self {
            secret,
            public,
            session: None,
        }
    }

    /// Append handshake key material to an outgoing negotiation packet.
    ///
    /// Idempotent across retransmits: the same secret backs every call, so
    /// the peer may key off any of them.
    pub fn pre_connect(&self, writer: &mut BufferWriter<'_>) -> Result<()> {
        writer.write_bytes(self.public.as_bytes())
    }

    /// Consume peer key material and derive the session key.
    ///
    /// Rejects non-contributory exchanges (a zero shared secret), leaving
    /// the connection ineligible to progress.
    pub fn receive_connect(&mut self, reader: &mut BufferReader<'_>) -> Result<()> {
        let mut peer = [0u8; KEY_MATERIAL_LEN];
        reader.read_bytes(&mut peer).map_err(|_| Error::KeyRejected)?;

        let shared = self.secret.diffie_hellman(&PublicKey::from(peer));
        if !shared.was_contributory() {
            return Err(Error::KeyRejected);
        }

        let hkdf = Hkdf::<Sha256>::new(None, shared.as_bytes());
        let mut okm = [0u8; 44];
        hkdf.expand(SESSION_INFO, &mut okm)
            .map_err(|_| Error::KeyRejected)?;

        let mut key = [0u8; 32];
        key.copy_from_slice(&okm[..32]);
        let mut nonce = [0u8; 12];
        nonce.copy_from_slice(&okm[32..]);
        self.session = Some(SessionKey { key, nonce });

        Ok(())
    }

    /// Whether the key agreement has completed
    pub fn is_keyed(&self) -> bool {
        self.session.is_some()
    }

    /// Transform a packet body in place for sending
    pub fn encrypt(&self, data: &mut [u8]) -> Result<()> {
        self.apply(data)
    }

    /// Transform a received packet body in place
    pub fn decrypt(&self, data: &mut [u8]) -> Result<()> {
        self.apply(data)
    }

    fn apply(&self, data: &mut [u8]) -> Result<()> {
        let session = self.session.as_ref().ok_or(Error::NotKeyed)?;
        let mut cipher = ChaCha20::new(&session.key.into(), &session.nonce.into());
        cipher.apply_keystream(data);
        Ok(())
    }
}

impl Default for DhChachaFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DhChachaFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhChachaFilter")
            .field("keyed", &self.is_keyed())
            .finish()
    }
}
