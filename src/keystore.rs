//! # Local Key Material
//!
//! Signing and sealing primitives for node-local key material. The overlay
//! itself runs over an already-authenticated anonymizing transport, so these
//! keys serve the application layer: signing outbound payloads and sealing
//! values before they are handed to the DHT.

use anyhow::{anyhow, bail, Result};
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng as RandOsRng;

const NONCE_LEN: usize = 24;

/// Signing and sealing operations exposed to the application.
pub trait KeyStore: Send + Sync {
    /// Sign a payload with the node's identity key.
    fn sign(&self, payload: &[u8]) -> Vec<u8>;

    /// Verify a signature against an encoded public key.
    fn verify(&self, public_key: &[u8], payload: &[u8], signature: &[u8]) -> Result<()>;

    /// Encrypt a payload for storage. Output embeds the nonce.
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>>;

    /// Decrypt a payload produced by [`KeyStore::seal`].
    fn open(&self, sealed: &[u8]) -> Result<Vec<u8>>;

    /// The node's encoded public signing key.
    fn public_key(&self) -> Vec<u8>;
}

/// Default key store: Ed25519 signatures, XChaCha20-Poly1305 sealing.
pub struct Ed25519KeyStore {
    signing_key: SigningKey,
    cipher: XChaCha20Poly1305,
}

impl Ed25519KeyStore {
    /// Generate fresh key material.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut RandOsRng);
        let cipher = XChaCha20Poly1305::new(&XChaCha20Poly1305::generate_key(&mut OsRng));
        Self {
            signing_key,
            cipher,
        }
    }

    /// Rebuild from previously exported secrets.
    pub fn from_secrets(signing_secret: &[u8; 32], sealing_key: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(signing_secret),
            cipher: XChaCha20Poly1305::new(sealing_key.into()),
        }
    }
}

impl KeyStore for Ed25519KeyStore {
    fn sign(&self, payload: &[u8]) -> Vec<u8> {
        self.signing_key.sign(payload).to_bytes().to_vec()
    }

    fn verify(&self, public_key: &[u8], payload: &[u8], signature: &[u8]) -> Result<()> {
        let key_bytes: [u8; 32] = public_key
            .try_into()
            .map_err(|_| anyhow!("public key must be 32 bytes"))?;
        let key = VerifyingKey::from_bytes(&key_bytes)
            .map_err(|e| anyhow!("invalid public key: {e}"))?;
        let sig_bytes: [u8; 64] = signature
            .try_into()
            .map_err(|_| anyhow!("signature must be 64 bytes"))?;
        let sig = Signature::from_bytes(&sig_bytes);
        key.verify(payload, &sig)
            .map_err(|e| anyhow!("signature verification failed: {e}"))
    }

    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| anyhow!("encryption failed: {e}"))?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_LEN {
            bail!("sealed payload too short");
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|e| anyhow!("decryption failed: {e}"))
    }

    fn public_key(&self) -> Vec<u8> {
        self.signing_key.verifying_key().to_bytes().to_vec()
    }
}
