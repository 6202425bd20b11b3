//! Operator root-of-trust keys.
//!
//! The operator key is an Ed25519 key held outside this system. It signs
//! escrow deposits and trust bundle pushes, and seeds the derivation of the
//! project encryption key. It can be handed to us in three ways:
//!
//! - a PKCS#8 PEM file
//! - a passphrase-protected file (Argon2id derived AES-256-GCM key)
//! - a base64 seed in an environment variable, exported by an agent process
//!
//! Any failure to reach the private material is `KeyUnavailable`, which is
//! terminal: a human has to fix the key source.

use std::fs;
use std::path::{Path, PathBuf};

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use argon2::{Algorithm, Argon2, ParamsBuilder, Version};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ed25519_dalek::pkcs8::DecodePrivateKey;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroizing;

use crate::error::{TrustError, TrustResult};
use crate::persist::write_atomic;

/// File layout: magic ‖ salt ‖ KDF params ‖ nonce ‖ ciphertext.
/// Everything before the nonce is authenticated as AAD.
const ENCRYPTED_MAGIC: &[u8] = b"KFOPK2";
const RETIRED_MAGIC: &[u8] = b"KFOPK1";
const SALT_LEN: usize = 16;
const PARAMS_LEN: usize = 12;
const HEADER_LEN: usize = ENCRYPTED_MAGIC.len() + SALT_LEN + PARAMS_LEN;
const NONCE_LEN: usize = 12;
/// Upper bound on the memory cost a key file may ask for (KiB)
const MAX_M_COST: u32 = 1 << 21;
const MAX_T_COST: u32 = 64;

/// Argon2id cost parameters, stored in the key file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    /// Memory cost in KiB
    pub m_cost: u32,
    pub t_cost: u32,
    pub p_cost: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            m_cost: 65536,
            t_cost: 3,
            p_cost: 4,
        }
    }
}

impl KdfParams {
    fn to_bytes(self) -> [u8; PARAMS_LEN] {
        let mut out = [0u8; PARAMS_LEN];
        out[..4].copy_from_slice(&self.m_cost.to_le_bytes());
        out[4..8].copy_from_slice(&self.t_cost.to_le_bytes());
        out[8..].copy_from_slice(&self.p_cost.to_le_bytes());
        out
    }

    fn from_bytes(bytes: &[u8; PARAMS_LEN]) -> Self {
        let word = |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        Self {
            m_cost: word(0),
            t_cost: word(4),
            p_cost: word(8),
        }
    }
}

/// Where the operator's private key comes from.
#[derive(Debug, Clone)]
pub enum KeySource {
    /// Unencrypted PKCS#8 PEM file
    Pem(PathBuf),
    /// Passphrase-protected key file
    Encrypted {
        path: PathBuf,
        passphrase: Zeroizing<String>,
    },
    /// Environment variable holding the base64 seed
    Env(String),
}

/// The operator's Ed25519 key. Zeroized on drop.
pub struct OperatorKey {
    signing: SigningKey,
}

impl OperatorKey {
    /// Generate a fresh operator key (tests and first-time setup).
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(seed),
        }
    }

    /// Load the key from its configured source.
    pub fn load(source: &KeySource) -> TrustResult<Self> {
        match source {
            KeySource::Pem(path) => {
                let pem = read_key_file(path)?;
                Self::from_pkcs8_pem(&pem)
            }
            KeySource::Encrypted { path, passphrase } => {
                let data = fs::read(path).map_err(|e| {
                    TrustError::KeyUnavailable(format!("cannot read {}: {}", path.display(), e))
                })?;
                Self::decrypt(&data, passphrase)
            }
            KeySource::Env(var) => {
                let value = Zeroizing::new(std::env::var(var).map_err(|_| {
                    TrustError::KeyUnavailable(format!("key agent variable {} not set", var))
                })?);
                let bytes = Zeroizing::new(BASE64.decode(value.trim()).map_err(|_| {
                    TrustError::KeyUnavailable(format!("{} does not hold a base64 seed", var))
                })?);
                let seed: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
                    TrustError::KeyUnavailable(format!("{} seed must be 32 bytes", var))
                })?;
                Ok(Self::from_seed(&seed))
            }
        }
    }

    pub fn from_pkcs8_pem(pem: &str) -> TrustResult<Self> {
        let signing = SigningKey::from_pkcs8_pem(pem)
            .map_err(|e| TrustError::KeyUnavailable(format!("invalid operator key: {}", e)))?;
        Ok(Self { signing })
    }

    /// Write the key protected by `passphrase`.
    pub fn save_encrypted(&self, path: &Path, passphrase: &str) -> TrustResult<()> {
        self.save_encrypted_with(path, passphrase, KdfParams::default())
    }

    /// Write the key protected by `passphrase` with explicit Argon2id costs.
    pub fn save_encrypted_with(
        &self,
        path: &Path,
        passphrase: &str,
        params: KdfParams,
    ) -> TrustResult<()> {
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);

        let mut output = Vec::with_capacity(HEADER_LEN + NONCE_LEN + 48);
        output.extend_from_slice(ENCRYPTED_MAGIC);
        output.extend_from_slice(&salt);
        output.extend_from_slice(&params.to_bytes());

        let cipher = derive_cipher(passphrase, &salt, params)?;
        let payload = Payload {
            msg: self.signing.as_bytes().as_slice(),
            aad: &output,
        };
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), payload)
            .map_err(|_| TrustError::internal("operator key encryption failed"))?;

        output.extend_from_slice(&nonce_bytes);
        output.extend_from_slice(&ciphertext);
        write_atomic(path, &output)?;
        Ok(())
    }

    fn decrypt(data: &[u8], passphrase: &str) -> TrustResult<Self> {
        if data.starts_with(RETIRED_MAGIC) {
            return Err(TrustError::KeyUnavailable(
                "operator key file uses the retired HKDF format, re-encrypt it".to_string(),
            ));
        }
        if !data.starts_with(ENCRYPTED_MAGIC) || data.len() <= HEADER_LEN + NONCE_LEN {
            return Err(TrustError::KeyUnavailable(
                "not an encrypted operator key".to_string(),
            ));
        }

        let (header, body) = data.split_at(HEADER_LEN);
        let salt = &header[ENCRYPTED_MAGIC.len()..ENCRYPTED_MAGIC.len() + SALT_LEN];
        let mut params_bytes = [0u8; PARAMS_LEN];
        params_bytes.copy_from_slice(&header[ENCRYPTED_MAGIC.len() + SALT_LEN..]);
        let params = KdfParams::from_bytes(&params_bytes);
        if params.m_cost > MAX_M_COST || params.t_cost > MAX_T_COST {
            return Err(TrustError::KeyUnavailable(
                "key file asks for excessive KDF costs".to_string(),
            ));
        }

        let (nonce_bytes, ciphertext) = body.split_at(NONCE_LEN);
        let cipher = derive_cipher(passphrase, salt, params)?;
        let payload = Payload {
            msg: ciphertext,
            aad: header,
        };
        let seed = Zeroizing::new(
            cipher
                .decrypt(Nonce::from_slice(nonce_bytes), payload)
                .map_err(|_| {
                    TrustError::KeyUnavailable(
                        "wrong passphrase or corrupted key file".to_string(),
                    )
                })?,
        );

        let seed: [u8; 32] = seed
            .as_slice()
            .try_into()
            .map_err(|_| TrustError::KeyUnavailable("malformed key file".to_string()))?;
        Ok(Self::from_seed(&seed))
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    /// Public key as base64, the form used in escrow `admin_public_key` config.
    pub fn public_key_base64(&self) -> String {
        BASE64.encode(self.verifying_key().to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing.sign(message)
    }

    /// Raw seed, input keying material for project key derivation.
    pub(crate) fn seed(&self) -> &[u8; 32] {
        self.signing.as_bytes()
    }
}

impl std::fmt::Debug for OperatorKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperatorKey")
            .field("public_key", &self.public_key_base64())
            .finish_non_exhaustive()
    }
}

fn read_key_file(path: &Path) -> TrustResult<Zeroizing<String>> {
    fs::read_to_string(path)
        .map(Zeroizing::new)
        .map_err(|e| TrustError::KeyUnavailable(format!("cannot read {}: {}", path.display(), e)))
}

/// Derive an AES-256-GCM cipher from a passphrase using Argon2id.
fn derive_cipher(passphrase: &str, salt: &[u8], params: KdfParams) -> TrustResult<Aes256Gcm> {
    let argon2_params = ParamsBuilder::new()
        .m_cost(params.m_cost)
        .t_cost(params.t_cost)
        .p_cost(params.p_cost)
        .build()
        .map_err(|e| TrustError::KeyUnavailable(format!("invalid key file KDF parameters: {}", e)))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params);

    let mut key = Zeroizing::new([0u8; 32]);
    argon2
        .hash_password_into(passphrase.as_bytes(), salt, key.as_mut_slice())
        .map_err(|e| TrustError::internal(format!("passphrase key derivation failed: {}", e)))?;
    Aes256Gcm::new_from_slice(key.as_slice())
        .map_err(|_| TrustError::internal("failed to create AES cipher"))
}
