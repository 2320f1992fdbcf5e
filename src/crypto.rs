//! End-to-end sealing of signaling payloads.
//!
//! Each client holds one X25519 keypair per process. Public keys ride along
//! with lobby announcements; a shared AEAD key per peer pair is derived via
//! Diffie-Hellman + HKDF-SHA256 and then seals every negotiation payload for
//! that pair with ChaCha20-Poly1305. Encryption is optional per pair: with no
//! derived secret, payloads travel as cleartext JSON and connection
//! establishment proceeds regardless.

use std::collections::HashMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use hkdf::Hkdf;
use parking_lot::Mutex;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::protocol::{PeerId, SealedEnvelope};

pub const SEALING_VERSION: u32 = 1;
const HKDF_INFO_AEAD: &[u8] = b"cove:signaling:aead:v1";
const NONCE_LEN: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("no local keypair has been generated")]
    NoKeypair,
    #[error("malformed remote public key: {0}")]
    KeyImport(String),
    #[error("key agreement produced a non-contributory result")]
    Derivation,
    #[error("a shared secret already exists for peer {0}")]
    SecretExists(PeerId),
    #[error("no shared secret derived for peer {0}")]
    NoSecret(PeerId),
    #[error("authentication failed while opening a sealed payload")]
    Authentication,
    #[error("sealed payload encoding invalid: {0}")]
    Encoding(String),
}

/// Whether `ensure_keypair` created a fresh keypair or found one in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeypairStatus {
    Created,
    AlreadyExists,
}

struct Keypair {
    secret: StaticSecret,
    public: PublicKey,
}

/// Per-process key material and per-peer derived secrets.
pub struct CryptoLayer {
    keypair: Mutex<Option<Keypair>>,
    secrets: Mutex<HashMap<PeerId, [u8; 32]>>,
}

impl Default for CryptoLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl CryptoLayer {
    pub fn new() -> Self {
        Self {
            keypair: Mutex::new(None),
            secrets: Mutex::new(HashMap::new()),
        }
    }

    /// Generate the local keypair. Generating twice is a logged no-op, not an
    /// error: the first keypair stays authoritative for the whole session.
    pub fn ensure_keypair(&self) -> KeypairStatus {
        let mut guard = self.keypair.lock();
        if guard.is_some() {
            tracing::warn!(target = "crypto", "keypair already generated; keeping existing");
            return KeypairStatus::AlreadyExists;
        }
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        *guard = Some(Keypair { secret, public });
        KeypairStatus::Created
    }

    /// Base64 of the 32-byte local public key.
    pub fn export_public_key(&self) -> Result<String, CryptoError> {
        let guard = self.keypair.lock();
        let keypair = guard.as_ref().ok_or(CryptoError::NoKeypair)?;
        Ok(BASE64_STANDARD.encode(keypair.public.as_bytes()))
    }

    /// Import a remote public key and derive the pair's AEAD key.
    ///
    /// The secret is immutable once set: re-derivation for the same peer is a
    /// protocol error. On any failure the peer's slot is left unset so the
    /// caller can fall back to cleartext signaling.
    pub fn derive_shared_secret(
        &self,
        peer_id: &PeerId,
        remote_public_key_b64: &str,
    ) -> Result<(), CryptoError> {
        if self.secrets.lock().contains_key(peer_id) {
            return Err(CryptoError::SecretExists(peer_id.clone()));
        }

        let remote_bytes = BASE64_STANDARD
            .decode(remote_public_key_b64.as_bytes())
            .map_err(|err| CryptoError::KeyImport(err.to_string()))?;
        let remote_bytes: [u8; 32] = remote_bytes
            .try_into()
            .map_err(|_| CryptoError::KeyImport("public key must be 32 bytes".into()))?;
        let remote = PublicKey::from(remote_bytes);

        let shared = {
            let guard = self.keypair.lock();
            let keypair = guard.as_ref().ok_or(CryptoError::NoKeypair)?;
            keypair.secret.diffie_hellman(&remote)
        };
        if !shared.was_contributory() {
            return Err(CryptoError::Derivation);
        }

        let hkdf = Hkdf::<Sha256>::new(None, shared.as_bytes());
        let mut key = [0u8; 32];
        hkdf.expand(HKDF_INFO_AEAD, &mut key)
            .map_err(|_| CryptoError::Derivation)?;

        self.secrets.lock().insert(peer_id.clone(), key);
        tracing::debug!(target = "crypto", peer_id = %peer_id, "shared secret derived");
        Ok(())
    }

    pub fn has_secret(&self, peer_id: &PeerId) -> bool {
        self.secrets.lock().contains_key(peer_id)
    }

    /// Seal a payload for a peer with a fresh random nonce. Nonces are never
    /// reused for a given key.
    pub fn seal(&self, peer_id: &PeerId, plaintext: &[u8]) -> Result<SealedEnvelope, CryptoError> {
        let key = self
            .secrets
            .lock()
            .get(peer_id)
            .copied()
            .ok_or_else(|| CryptoError::NoSecret(peer_id.clone()))?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let cipher = ChaCha20Poly1305::new_from_slice(&key)
            .map_err(|err| CryptoError::Encoding(err.to_string()))?;
        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| CryptoError::Authentication)?;

        Ok(SealedEnvelope {
            version: SEALING_VERSION,
            nonce: BASE64_STANDARD.encode(nonce_bytes),
            ciphertext: BASE64_STANDARD.encode(ciphertext),
        })
    }

    /// Open a sealed payload. A tampered ciphertext or nonce fails with
    /// `Authentication`; a wrong plaintext is never returned.
    pub fn open(
        &self,
        peer_id: &PeerId,
        envelope: &SealedEnvelope,
    ) -> Result<Vec<u8>, CryptoError> {
        if envelope.version != SEALING_VERSION {
            return Err(CryptoError::Encoding(format!(
                "unsupported sealing version {}",
                envelope.version
            )));
        }
        let key = self
            .secrets
            .lock()
            .get(peer_id)
            .copied()
            .ok_or_else(|| CryptoError::NoSecret(peer_id.clone()))?;

        let nonce_bytes = BASE64_STANDARD
            .decode(envelope.nonce.as_bytes())
            .map_err(|err| CryptoError::Encoding(err.to_string()))?;
        if nonce_bytes.len() != NONCE_LEN {
            return Err(CryptoError::Encoding("unexpected nonce length".into()));
        }
        let ciphertext = BASE64_STANDARD
            .decode(envelope.ciphertext.as_bytes())
            .map_err(|err| CryptoError::Encoding(err.to_string()))?;

        let cipher = ChaCha20Poly1305::new_from_slice(&key)
            .map_err(|err| CryptoError::Encoding(err.to_string()))?;
        cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_slice())
            .map_err(|_| CryptoError::Authentication)
    }

    /// Drop a peer's secret. Part of connection teardown.
    pub fn forget(&self, peer_id: &PeerId) {
        if self.secrets.lock().remove(peer_id).is_some() {
            tracing::debug!(target = "crypto", peer_id = %peer_id, "shared secret dropped");
        }
    }

    /// Drop everything. Relay disconnect invalidates the whole session.
    pub fn forget_all(&self) {
        self.secrets.lock().clear();
    }

    pub fn secret_count(&self) -> usize {
        self.secrets.lock().len()
    }
}
