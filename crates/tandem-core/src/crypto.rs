//! Encryption layer using ChaCha20-Poly1305 AEAD
//!
//! Provides the primitives the packager and the pairing handshake build on:
//!
//! - [`PackageCipher`]: authenticated encryption with associated data
//! - [`derive_package_key`]: HKDF-SHA256 from a pairing secret to a cipher key
//! - [`PairingKeys`]: X25519 key agreement used while pairing

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519StaticSecret};

use crate::error::SyncError;

/// Nonce size for ChaCha20-Poly1305 (12 bytes)
pub const NONCE_SIZE: usize = 12;

/// Authentication tag appended to every ciphertext
pub const TAG_SIZE: usize = 16;

/// Domain separation for package keys
const PACKAGE_KEY_INFO: &[u8] = b"tandem-sync-package-v1";

/// Symmetric cipher for sync packages.
///
/// The caller supplies the nonce and the associated data; neither is
/// prepended to the output.
///
/// # Example
///
/// ```
/// use tandem_core::crypto::{derive_package_key, PackageCipher};
///
/// let key = derive_package_key(b"shared secret from pairing");
/// let cipher = PackageCipher::new(&key);
/// let nonce = PackageCipher::generate_nonce();
///
/// let ciphertext = cipher.encrypt(b"hello", b"header", &nonce).unwrap();
/// let plaintext = cipher.decrypt(&ciphertext, b"header", &nonce).unwrap();
/// assert_eq!(plaintext, b"hello");
/// ```
pub struct PackageCipher {
    cipher: ChaCha20Poly1305,
}

impl PackageCipher {
    /// Create a cipher with the given 32-byte key.
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(key.into()),
        }
    }

    /// Generate a random 12-byte nonce.
    pub fn generate_nonce() -> [u8; NONCE_SIZE] {
        let mut nonce = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce);
        nonce
    }

    /// Encrypt `plaintext`, authenticating `aad` alongside it.
    ///
    /// Returns ciphertext with the 16-byte tag appended.
    pub fn encrypt(
        &self,
        plaintext: &[u8],
        aad: &[u8],
        nonce: &[u8; NONCE_SIZE],
    ) -> Result<Vec<u8>, SyncError> {
        let nonce = Nonce::from_slice(nonce);
        self.cipher
            .encrypt(nonce, Payload { msg: plaintext, aad })
            .map_err(|e| SyncError::Crypto(format!("Encryption failed: {}", e)))
    }

    /// Decrypt `ciphertext` and check it against `aad`.
    ///
    /// Fails on a wrong key, a wrong nonce, tampered ciphertext, or
    /// associated data that differs from what was encrypted.
    pub fn decrypt(
        &self,
        ciphertext: &[u8],
        aad: &[u8],
        nonce: &[u8; NONCE_SIZE],
    ) -> Result<Vec<u8>, SyncError> {
        if ciphertext.len() < TAG_SIZE {
            return Err(SyncError::DecryptionFailed(
                "ciphertext shorter than authentication tag".to_string(),
            ));
        }
        let nonce = Nonce::from_slice(nonce);
        self.cipher
            .decrypt(nonce, Payload { msg: ciphertext, aad })
            .map_err(|e| SyncError::DecryptionFailed(format!("{}", e)))
    }
}

/// Derive the package key for a pairing secret using HKDF-SHA256.
///
/// Deterministic: both sides of a pairing derive the same key.
pub fn derive_package_key(shared_secret: &[u8]) -> [u8; 32] {
    let hkdf = Hkdf::<Sha256>::new(None, shared_secret);
    let mut output = [0u8; 32];
    hkdf.expand(PACKAGE_KEY_INFO, &mut output)
        .expect("HKDF expand should never fail with 32-byte output");
    output
}

/// One side of an X25519 exchange.
///
/// A fresh pair is generated per pairing attempt; the agreed value becomes
/// the pairing's shared secret.
pub struct PairingKeys {
    secret: X25519StaticSecret,
    public: X25519PublicKey,
}

impl PairingKeys {
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::rng().fill_bytes(&mut seed);
        let secret = X25519StaticSecret::from(seed);
        let public = X25519PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Public half, sent to the remote device
    pub fn public_bytes(&self) -> [u8; 32] {
        *self.public.as_bytes()
    }

    /// Combine with the remote public key.
    ///
    /// Rejects all-zero output, which a low-order remote key would produce.
    pub fn agree(&self, remote_public: &[u8; 32]) -> Result<[u8; 32], SyncError> {
        let shared = self
            .secret
            .diffie_hellman(&X25519PublicKey::from(*remote_public));
        if !shared.was_contributory() {
            return Err(SyncError::Crypto(
                "remote pairing key produced a non-contributory secret".to_string(),
            ));
        }
        Ok(*shared.as_bytes())
    }
}
