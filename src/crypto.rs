//! Authenticated encryption for data at rest.
//!
//! Envelope layout:
//!
//! ```text
//! magic (6) | version (1) | alg (1) | nonce (24) | ciphertext | tag (16)
//! ```
//!
//! The caller supplies associated data binding the ciphertext to its owner
//! and purpose; decryption with different associated data fails.

use aead::{AeadInPlace, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use secrecy::{ExposeSecret, Secret};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use zeroize::Zeroize;

const ENVELOPE_MAGIC: [u8; 6] = *b"CRSEAL";
const CURRENT_VERSION: u8 = 1;
const HEADER_SIZE: usize = 32;
const TAG_SIZE: usize = 16;
const NONCE_SIZE: usize = 24;
pub const KEY_SIZE: usize = 32;
const MAX_AAD_LEN: usize = 8 * 1024;
pub const MAX_PLAINTEXT: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecryptFailure {
    MalformedEnvelope,
    UnsupportedVersion { version: u8 },
    UnsupportedAlgorithm { alg: u8 },
    AuthenticationFailed,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("randomness unavailable")]
    RandomUnavailable,

    #[error("plaintext too large: {size} > {max}")]
    PlaintextTooLarge { size: usize, max: usize },

    #[error("encryption failed")]
    EncryptionFailed,

    #[error("decryption failed: {0:?}")]
    DecryptionFailed(DecryptFailure),

    #[error("aad too large: {size} > {max}")]
    AadTooLarge { size: usize, max: usize },

    #[error("aad required but empty")]
    AadRequired,
}

pub trait CryptoProvider: Send + Sync {
    fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError>;
    fn decrypt(&self, envelope: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

pub trait RandomProvider: Send + Sync {
    fn fill(&self, out: &mut [u8]) -> Result<(), CryptoError>;
}

pub struct OsRng;

impl RandomProvider for OsRng {
    fn fill(&self, out: &mut [u8]) -> Result<(), CryptoError> {
        getrandom::getrandom(out).map_err(|_| CryptoError::RandomUnavailable)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum AlgId {
    XChaCha20Poly1305 = 1,
}

impl TryFrom<u8> for AlgId {
    type Error = u8;

    fn try_from(v: u8) -> Result<Self, u8> {
        match v {
            1 => Ok(AlgId::XChaCha20Poly1305),
            other => Err(other),
        }
    }
}

/// Generates a fresh data key. The host keeps it in the platform keychain.
pub fn generate_key<R: RandomProvider + ?Sized>(
    rng: &R,
) -> Result<Secret<[u8; KEY_SIZE]>, CryptoError> {
    let mut key = [0u8; KEY_SIZE];
    rng.fill(&mut key)?;
    let secret = Secret::new(key);
    key.zeroize();
    Ok(secret)
}

/// Single-key XChaCha20-Poly1305 sealer.
pub struct XChaChaCrypto<R: RandomProvider = OsRng> {
    key: Secret<[u8; KEY_SIZE]>,
    rng: R,
    decrypt_failures: AtomicU64,
}

impl XChaChaCrypto<OsRng> {
    pub fn new(key: Secret<[u8; KEY_SIZE]>) -> Self {
        Self::with_rng(key, OsRng)
    }

    pub fn from_slice(key_bytes: &[u8]) -> Result<Self, CryptoError> {
        if key_bytes.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: key_bytes.len(),
            });
        }
        let mut k = [0u8; KEY_SIZE];
        k.copy_from_slice(key_bytes);
        let crypto = Self::new(Secret::new(k));
        k.zeroize();
        Ok(crypto)
    }
}

impl<R: RandomProvider> XChaChaCrypto<R> {
    pub fn with_rng(key: Secret<[u8; KEY_SIZE]>, rng: R) -> Self {
        Self {
            key,
            rng,
            decrypt_failures: AtomicU64::new(0),
        }
    }

    pub fn decrypt_failures(&self) -> u64 {
        self.decrypt_failures.load(Ordering::Relaxed)
    }

    fn cipher(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new(Key::from_slice(self.key.expose_secret()))
    }

    fn check_aad(aad: &[u8]) -> Result<(), CryptoError> {
        if aad.is_empty() {
            return Err(CryptoError::AadRequired);
        }
        if aad.len() > MAX_AAD_LEN {
            return Err(CryptoError::AadTooLarge {
                size: aad.len(),
                max: MAX_AAD_LEN,
            });
        }
        Ok(())
    }

    fn open(&self, envelope: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Self::check_aad(aad)?;

        if envelope.len() < HEADER_SIZE + TAG_SIZE || envelope[0..6] != ENVELOPE_MAGIC {
            return Err(CryptoError::DecryptionFailed(
                DecryptFailure::MalformedEnvelope,
            ));
        }

        let version = envelope[6];
        if version != CURRENT_VERSION {
            return Err(CryptoError::DecryptionFailed(
                DecryptFailure::UnsupportedVersion { version },
            ));
        }

        let alg = envelope[7];
        AlgId::try_from(alg).map_err(|_| {
            CryptoError::DecryptionFailed(DecryptFailure::UnsupportedAlgorithm { alg })
        })?;

        let nonce = XNonce::from_slice(&envelope[8..HEADER_SIZE]);
        let body = &envelope[HEADER_SIZE..];
        let ct_len = body.len() - TAG_SIZE;
        let mut buffer = body[..ct_len].to_vec();

        if self
            .cipher()
            .decrypt_in_place_detached(nonce, aad, &mut buffer, body[ct_len..].into())
            .is_err()
        {
            buffer.zeroize();
            return Err(CryptoError::DecryptionFailed(
                DecryptFailure::AuthenticationFailed,
            ));
        }

        Ok(buffer)
    }
}

impl<R: RandomProvider> CryptoProvider for XChaChaCrypto<R> {
    fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if plaintext.len() > MAX_PLAINTEXT {
            return Err(CryptoError::PlaintextTooLarge {
                size: plaintext.len(),
                max: MAX_PLAINTEXT,
            });
        }
        Self::check_aad(aad)?;

        let mut nonce = [0u8; NONCE_SIZE];
        self.rng.fill(&mut nonce)?;

        let pt_end = HEADER_SIZE + plaintext.len();
        let mut out = vec![0u8; pt_end + TAG_SIZE];
        out[0..6].copy_from_slice(&ENVELOPE_MAGIC);
        out[6] = CURRENT_VERSION;
        out[7] = AlgId::XChaCha20Poly1305 as u8;
        out[8..HEADER_SIZE].copy_from_slice(&nonce);
        out[HEADER_SIZE..pt_end].copy_from_slice(plaintext);

        let tag = self
            .cipher()
            .encrypt_in_place_detached(
                XNonce::from_slice(&nonce),
                aad,
                &mut out[HEADER_SIZE..pt_end],
            )
            .map_err(|_| CryptoError::EncryptionFailed)?;
        out[pt_end..].copy_from_slice(&tag);

        Ok(out)
    }

    fn decrypt(&self, envelope: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let result = self.open(envelope, aad);
        if result.is_err() {
            self.decrypt_failures.fetch_add(1, Ordering::Relaxed);
        }
        result
    }
}
