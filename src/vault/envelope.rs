//! Envelope encryption primitives.
//!
//! Uses:
//! - X25519 for per-recipient ephemeral key agreement
//! - HKDF-SHA256 to turn the shared secret into a wrapping key
//! - ChaCha20-Poly1305 for both the payload and the wrapped content key
//!
//! A secret is encrypted once under a random content key. The content key is
//! then wrapped separately for each recipient, so adding a recipient never
//! requires touching the payload ciphertext.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use keyfleet_types::SealedPayload;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::Zeroizing;

use crate::keystore::{ProjectKeyPair, RecipientKey};

pub const NONCE_LEN: usize = 12;
pub const KEY_LEN: usize = 32;

const WRAP_INFO: &[u8] = b"keyfleet-wrap-v1";
const PAYLOAD_INFO: &[u8] = b"keyfleet-payload-v1";

/// Envelope errors
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("Invalid base64 encoding: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Invalid public key format")]
    InvalidPublicKey,

    #[error("Invalid nonce length")]
    InvalidNonce,

    #[error("Decryption failed - invalid ciphertext or wrong key")]
    DecryptionFailed,

    #[error("Encryption failed")]
    EncryptionFailed,
}

pub type EnvelopeResult<T> = Result<T, EnvelopeError>;

/// Symmetric key protecting one secret's payload.
pub type ContentKey = Zeroizing<[u8; KEY_LEN]>;

/// A content key wrapped for one recipient.
#[derive(Debug, Clone)]
pub struct WrappedKey {
    pub ephemeral_public: [u8; 32],
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
}

/// Generate a fresh random content key.
pub fn generate_content_key() -> ContentKey {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    OsRng.fill_bytes(key.as_mut_slice());
    key
}

fn random_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Encrypt `plaintext` under `key`, authenticating `aad`.
pub fn encrypt(
    key: &[u8; KEY_LEN],
    aad: &[u8],
    plaintext: &[u8],
) -> EnvelopeResult<([u8; NONCE_LEN], Vec<u8>)> {
    let cipher =
        ChaCha20Poly1305::new_from_slice(key).map_err(|_| EnvelopeError::EncryptionFailed)?;
    let nonce = random_nonce();
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| EnvelopeError::EncryptionFailed)?;
    Ok((nonce, ciphertext))
}

/// Decrypt and authenticate a ciphertext produced by [`encrypt`].
pub fn decrypt(
    key: &[u8; KEY_LEN],
    nonce: &[u8],
    aad: &[u8],
    ciphertext: &[u8],
) -> EnvelopeResult<Zeroizing<Vec<u8>>> {
    if nonce.len() != NONCE_LEN {
        return Err(EnvelopeError::InvalidNonce);
    }
    let cipher =
        ChaCha20Poly1305::new_from_slice(key).map_err(|_| EnvelopeError::DecryptionFailed)?;
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map(Zeroizing::new)
        .map_err(|_| EnvelopeError::DecryptionFailed)
}

/// HKDF over the DH output, bound to both public keys of the exchange.
fn derive_key(
    shared: &[u8; 32],
    ephemeral_public: &[u8; 32],
    recipient_public: &[u8; 32],
    info: &[u8],
) -> EnvelopeResult<ContentKey> {
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(ephemeral_public);
    salt[32..].copy_from_slice(recipient_public);

    let hk = Hkdf::<Sha256>::new(Some(&salt), shared);
    let mut okm = Zeroizing::new([0u8; KEY_LEN]);
    hk.expand(info, okm.as_mut_slice())
        .map_err(|_| EnvelopeError::EncryptionFailed)?;
    Ok(okm)
}

/// Ephemeral sender side of a key agreement with `recipient`.
fn agree_as_sender(recipient: &RecipientKey, info: &[u8]) -> EnvelopeResult<([u8; 32], ContentKey)> {
    let secret = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&secret).to_bytes();
    let shared = Zeroizing::new(secret.diffie_hellman(&recipient.to_public_key()).to_bytes());
    let key = derive_key(&shared, &ephemeral_public, recipient.as_bytes(), info)?;
    Ok((ephemeral_public, key))
}

fn agree_as_recipient(
    keypair: &ProjectKeyPair,
    ephemeral_public: &[u8; 32],
    info: &[u8],
) -> EnvelopeResult<ContentKey> {
    let shared = Zeroizing::new(
        keypair
            .diffie_hellman(&PublicKey::from(*ephemeral_public))
            .to_bytes(),
    );
    derive_key(&shared, ephemeral_public, keypair.recipient().as_bytes(), info)
}

/// Wrap `content_key` so that only `recipient` can recover it.
pub fn wrap_for(
    recipient: &RecipientKey,
    content_key: &[u8; KEY_LEN],
    aad: &[u8],
) -> EnvelopeResult<WrappedKey> {
    let (ephemeral_public, wrap_key) = agree_as_sender(recipient, WRAP_INFO)?;
    let (nonce, ciphertext) = encrypt(&wrap_key, aad, content_key)?;
    Ok(WrappedKey {
        ephemeral_public,
        nonce,
        ciphertext,
    })
}

/// Recover a content key wrapped for `keypair`.
pub fn unwrap_with(
    keypair: &ProjectKeyPair,
    wrapped: &WrappedKey,
    aad: &[u8],
) -> EnvelopeResult<ContentKey> {
    let wrap_key = agree_as_recipient(keypair, &wrapped.ephemeral_public, WRAP_INFO)?;
    let plain = decrypt(&wrap_key, &wrapped.nonce, aad, &wrapped.ciphertext)?;
    let key: [u8; KEY_LEN] = plain
        .as_slice()
        .try_into()
        .map_err(|_| EnvelopeError::DecryptionFailed)?;
    Ok(Zeroizing::new(key))
}

/// Seal a small payload directly to one recipient.
pub fn seal_payload(
    recipient: &RecipientKey,
    aad: &[u8],
    plaintext: &[u8],
) -> EnvelopeResult<SealedPayload> {
    let (ephemeral_public, key) = agree_as_sender(recipient, PAYLOAD_INFO)?;
    let (nonce, ciphertext) = encrypt(&key, aad, plaintext)?;
    Ok(SealedPayload {
        ephemeral_public: BASE64.encode(ephemeral_public),
        nonce: BASE64.encode(nonce),
        ciphertext: BASE64.encode(ciphertext),
    })
}

/// Open a payload sealed with [`seal_payload`].
pub fn open_payload(
    keypair: &ProjectKeyPair,
    aad: &[u8],
    sealed: &SealedPayload,
) -> EnvelopeResult<Zeroizing<Vec<u8>>> {
    let ephemeral_public = decode_key(&sealed.ephemeral_public)?;
    let nonce = BASE64.decode(&sealed.nonce)?;
    let ciphertext = BASE64.decode(&sealed.ciphertext)?;
    let key = agree_as_recipient(keypair, &ephemeral_public, PAYLOAD_INFO)?;
    decrypt(&key, &nonce, aad, &ciphertext)
}

/// Parse a raw 32-byte X25519 public key from base64.
pub fn decode_key(base64_key: &str) -> EnvelopeResult<[u8; 32]> {
    let bytes = BASE64.decode(base64_key)?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| EnvelopeError::InvalidPublicKey)
}
