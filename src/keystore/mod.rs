//! Key Store: root-of-trust material and the project encryption keys derived from it.
//!
//! Project secrets are sealed to X25519 recipient keys. An operator does not
//! keep a separate X25519 key; it is derived deterministically from their
//! Ed25519 operator key and the project name, so the same operator can decrypt
//! the same repository from any machine at any time.
//!
//! The set of recipients allowed to read project secrets lives in a plain-text
//! `authorized_recipients` file committed next to the sealed records:
//!
//! ```text
//! # operators
//! x25519:3q2+7w...  alice
//! x25519:u7Kd1A...  escrow-a
//! ```

pub mod operator;

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::info;
use x25519_dalek::{PublicKey, SharedSecret, StaticSecret};
use zeroize::Zeroizing;

use crate::error::{TrustError, TrustResult};
use crate::persist::write_atomic;

pub use operator::{KdfParams, KeySource, OperatorKey};

const PROJECT_KEY_SALT: &[u8] = b"keyfleet-project-key-v1";
const RECIPIENT_PREFIX: &str = "x25519:";

/// Public half of an X25519 key that secrets can be sealed to.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RecipientKey([u8; 32]);

impl RecipientKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_public_key(&self) -> PublicKey {
        PublicKey::from(self.0)
    }
}

impl From<PublicKey> for RecipientKey {
    fn from(key: PublicKey) -> Self {
        Self(key.to_bytes())
    }
}

impl fmt::Display for RecipientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", RECIPIENT_PREFIX, BASE64.encode(self.0))
    }
}

impl fmt::Debug for RecipientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecipientKey({})", self)
    }
}

impl FromStr for RecipientKey {
    type Err = TrustError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let encoded = s.strip_prefix(RECIPIENT_PREFIX).ok_or_else(|| {
            TrustError::invalid_request(format!("recipient must start with '{}'", RECIPIENT_PREFIX))
        })?;
        let bytes = BASE64
            .decode(encoded)
            .map_err(|e| TrustError::invalid_request(format!("invalid recipient encoding: {}", e)))?;
        let arr: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| TrustError::invalid_request("recipient key must be 32 bytes"))?;
        Ok(Self(arr))
    }
}

impl TryFrom<String> for RecipientKey {
    type Error = TrustError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RecipientKey> for String {
    fn from(key: RecipientKey) -> Self {
        key.to_string()
    }
}

/// X25519 key pair able to open secrets sealed to its recipient key.
pub struct ProjectKeyPair {
    secret: StaticSecret,
    recipient: RecipientKey,
}

impl ProjectKeyPair {
    /// Derive the project key for `project` from an operator key.
    pub fn derive(operator: &OperatorKey, project: &str) -> TrustResult<Self> {
        let hk = Hkdf::<Sha256>::new(Some(PROJECT_KEY_SALT), operator.seed());
        let mut okm = Zeroizing::new([0u8; 32]);
        hk.expand(project.as_bytes(), okm.as_mut_slice())
            .map_err(|_| TrustError::internal("HKDF expand failed"))?;
        Ok(Self::from_secret(StaticSecret::from(*okm)))
    }

    /// Random key pair for machines and escrow endpoints.
    pub fn generate() -> Self {
        Self::from_secret(StaticSecret::random_from_rng(OsRng))
    }

    /// Parse a key pair from its base64 secret, as stored in key files.
    pub fn from_base64(encoded: &str) -> TrustResult<Self> {
        let bytes = Zeroizing::new(
            BASE64
                .decode(encoded.trim())
                .map_err(|_| TrustError::KeyUnavailable("invalid base64 key".to_string()))?,
        );
        let arr: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| TrustError::KeyUnavailable("key must be 32 bytes".to_string()))?;
        Ok(Self::from_secret(StaticSecret::from(arr)))
    }

    /// Read a key pair from a file holding its base64 secret.
    pub fn load(path: &Path) -> TrustResult<Self> {
        let encoded = Zeroizing::new(fs::read_to_string(path).map_err(|e| {
            TrustError::KeyUnavailable(format!("cannot read {}: {}", path.display(), e))
        })?);
        Self::from_base64(&encoded)
    }

    pub fn to_base64(&self) -> Zeroizing<String> {
        Zeroizing::new(BASE64.encode(self.secret.to_bytes()))
    }

    fn from_secret(secret: StaticSecret) -> Self {
        let recipient = RecipientKey::from(PublicKey::from(&secret));
        Self { secret, recipient }
    }

    pub fn recipient(&self) -> &RecipientKey {
        &self.recipient
    }

    pub(crate) fn diffie_hellman(&self, their_public: &PublicKey) -> SharedSecret {
        self.secret.diffie_hellman(their_public)
    }
}

impl fmt::Debug for ProjectKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProjectKeyPair")
            .field("recipient", &self.recipient)
            .finish_non_exhaustive()
    }
}

/// Project-scoped view of the root-of-trust material.
#[derive(Debug, Clone)]
pub struct KeyStore {
    project: String,
    recipients_path: PathBuf,
}

impl KeyStore {
    pub fn new(project: impl Into<String>, recipients_path: impl Into<PathBuf>) -> Self {
        Self {
            project: project.into(),
            recipients_path: recipients_path.into(),
        }
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    /// Deterministically derive this project's encryption key from an operator key.
    pub fn derive_project_key(&self, operator: &OperatorKey) -> TrustResult<ProjectKeyPair> {
        ProjectKeyPair::derive(operator, &self.project)
    }

    /// Enumerate the recipients allowed to decrypt project secrets.
    pub fn list_authorized_recipients(&self) -> TrustResult<BTreeSet<RecipientKey>> {
        let content = fs::read_to_string(&self.recipients_path)?;
        content
            .lines()
            .enumerate()
            .map(|(i, line)| (i, line.trim()))
            .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
            .map(|(i, line)| {
                let key = line.split_whitespace().next().unwrap_or_default();
                key.parse().map_err(|e| {
                    TrustError::invalid_request(format!(
                        "{}:{}: {}",
                        self.recipients_path.display(),
                        i + 1,
                        e
                    ))
                })
            })
            .collect()
    }

    /// Add a recipient to the authorized set.
    ///
    /// Returns false if the recipient was already present.
    pub fn authorize(&self, recipient: &RecipientKey, comment: &str) -> TrustResult<bool> {
        let existing = match fs::read_to_string(&self.recipients_path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };

        if !existing.is_empty() && self.list_authorized_recipients()?.contains(recipient) {
            return Ok(false);
        }

        let mut updated = existing;
        if !updated.is_empty() && !updated.ends_with('\n') {
            updated.push('\n');
        }
        updated.push_str(&format!("{}  {}\n", recipient, comment.trim()));
        write_atomic(&self.recipients_path, updated.as_bytes())?;

        info!(project = %self.project, %recipient, "Authorized new recipient");
        Ok(true)
    }
}
