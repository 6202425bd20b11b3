//! Secret Vault: named secrets sealed to a set of recipient keys.
//!
//! Every secret is a [`SealedSecret`] record: the payload encrypted once under
//! a random content key, plus one stanza per recipient holding that content
//! key wrapped for the recipient's X25519 key. The recipient set is readable
//! without decrypting anything.
//!
//! Records are replaced as a whole, never edited in place. All writes go
//! through the project store's advisory lock; [`SecretVault::lock`] hands the
//! lock to callers that need several writes to happen as one unit.

pub mod envelope;
mod store;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::error::{TrustError, TrustResult};
use crate::keystore::{ProjectKeyPair, RecipientKey};

use envelope::WrappedKey;
use store::{LockGuard, RecordStore};

pub use store::{validate_name, ROTATE_PURPOSE};

const PAYLOAD_AAD: &[u8] = b"keyfleet-secret-v1";

/// The content key wrapped for one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientStanza {
    pub recipient: RecipientKey,
    /// Ephemeral X25519 public key (base64)
    pub ephemeral_public: String,
    /// Wrapping nonce (base64)
    pub nonce: String,
    /// Wrapped content key (base64)
    pub wrapped_key: String,
}

/// A named, versioned ciphertext record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedSecret {
    pub name: String,
    pub version: u64,
    pub recipients: Vec<RecipientStanza>,
    /// Payload nonce (base64)
    pub nonce: String,
    /// Payload ciphertext (base64)
    pub ciphertext: String,
    pub sealed_at: DateTime<Utc>,
}

impl SealedSecret {
    /// Recipients able to decrypt this secret.
    pub fn recipient_set(&self) -> BTreeSet<RecipientKey> {
        self.recipients.iter().map(|s| s.recipient).collect()
    }

    fn stanza_for(&self, recipient: &RecipientKey) -> Option<&RecipientStanza> {
        self.recipients.iter().find(|s| &s.recipient == recipient)
    }
}

/// A versioned public (unencrypted) record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicRecord<T> {
    pub name: String,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
    pub value: T,
}

fn payload_aad(name: &str) -> Vec<u8> {
    let mut aad = Vec::with_capacity(PAYLOAD_AAD.len() + name.len());
    aad.extend_from_slice(PAYLOAD_AAD);
    aad.extend_from_slice(name.as_bytes());
    aad
}

fn wrap_stanzas(
    name: &str,
    content_key: &[u8; envelope::KEY_LEN],
    recipients: &BTreeSet<RecipientKey>,
) -> TrustResult<Vec<RecipientStanza>> {
    if recipients.is_empty() {
        return Err(TrustError::invalid_request(format!(
            "secret '{}' needs at least one recipient",
            name
        )));
    }

    let aad = payload_aad(name);
    recipients
        .iter()
        .map(|recipient| {
            let wrapped = envelope::wrap_for(recipient, content_key, &aad)
                .map_err(|e| TrustError::internal(format!("key wrap failed: {}", e)))?;
            Ok(RecipientStanza {
                recipient: *recipient,
                ephemeral_public: BASE64.encode(wrapped.ephemeral_public),
                nonce: BASE64.encode(wrapped.nonce),
                wrapped_key: BASE64.encode(wrapped.ciphertext),
            })
        })
        .collect()
}

/// Recover the content key of `sealed` with `keypair`.
fn unwrap_content_key(
    sealed: &SealedSecret,
    keypair: &ProjectKeyPair,
) -> TrustResult<envelope::ContentKey> {
    let stanza = sealed
        .stanza_for(keypair.recipient())
        .ok_or_else(|| TrustError::RecipientNotAuthorized(sealed.name.clone()))?;

    let corrupt = |_| TrustError::CorruptSecret(sealed.name.clone());
    let wrapped = WrappedKey {
        ephemeral_public: envelope::decode_key(&stanza.ephemeral_public).map_err(corrupt)?,
        nonce: BASE64
            .decode(&stanza.nonce)
            .ok()
            .and_then(|n| n.try_into().ok())
            .ok_or_else(|| TrustError::CorruptSecret(sealed.name.clone()))?,
        ciphertext: BASE64
            .decode(&stanza.wrapped_key)
            .map_err(|_| TrustError::CorruptSecret(sealed.name.clone()))?,
    };

    envelope::unwrap_with(keypair, &wrapped, &payload_aad(&sealed.name)).map_err(corrupt)
}

/// Encrypted store for one project stack.
#[derive(Debug)]
pub struct SecretVault {
    project: String,
    stack: String,
    store: RecordStore,
}

impl SecretVault {
    /// Open (creating if needed) the store at `<state_dir>/<project>/<stack>`.
    pub fn open(
        state_dir: impl AsRef<Path>,
        project: impl Into<String>,
        stack: impl Into<String>,
    ) -> TrustResult<Self> {
        let project = project.into();
        let stack = stack.into();
        for part in [&project, &stack] {
            if part.contains('/') {
                return Err(TrustError::invalid_request(format!(
                    "'{}' must be a single path segment",
                    part
                )));
            }
            validate_name(part)?;
        }

        let root: PathBuf = state_dir.as_ref().join(&project).join(&stack);
        std::fs::create_dir_all(&root)?;
        debug!(root = %root.display(), "Opened secret vault");

        Ok(Self {
            project,
            stack,
            store: RecordStore::new(root),
        })
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn stack(&self) -> &str {
        &self.stack
    }

    pub fn root(&self) -> &Path {
        self.store.root()
    }

    /// Take the store's writer lock for a multi-step operation.
    pub fn lock(&self, purpose: &str) -> TrustResult<VaultLock<'_>> {
        let guard = self.store.lock(purpose)?;
        Ok(VaultLock {
            vault: self,
            purpose: purpose.to_string(),
            _guard: guard,
        })
    }

    /// Encrypt `plaintext` as `name` for every key in `recipients` and persist it.
    pub fn seal(
        &self,
        name: &str,
        plaintext: &[u8],
        recipients: &BTreeSet<RecipientKey>,
    ) -> TrustResult<SealedSecret> {
        self.lock("seal")?.seal(name, plaintext, recipients, None)
    }

    /// Decrypt a sealed secret.
    ///
    /// Fails with `RecipientNotAuthorized` if `keypair` is not a recipient and
    /// with `CorruptSecret` if any part of the record fails authentication.
    pub fn unseal(
        &self,
        sealed: &SealedSecret,
        keypair: &ProjectKeyPair,
    ) -> TrustResult<Zeroizing<Vec<u8>>> {
        let content_key = unwrap_content_key(sealed, keypair)?;
        let nonce = BASE64
            .decode(&sealed.nonce)
            .map_err(|_| TrustError::CorruptSecret(sealed.name.clone()))?;
        let ciphertext = BASE64
            .decode(&sealed.ciphertext)
            .map_err(|_| TrustError::CorruptSecret(sealed.name.clone()))?;

        envelope::decrypt(&content_key, &nonce, &payload_aad(&sealed.name), &ciphertext)
            .map_err(|_| TrustError::CorruptSecret(sealed.name.clone()))
    }

    /// Load and decrypt the secret stored as `name`.
    pub fn unseal_named(
        &self,
        name: &str,
        keypair: &ProjectKeyPair,
    ) -> TrustResult<Zeroizing<Vec<u8>>> {
        let sealed = self
            .load(name)?
            .ok_or_else(|| TrustError::invalid_request(format!("no secret named '{}'", name)))?;
        self.unseal(&sealed, keypair)
    }

    /// Re-wrap the content key of `sealed` for `new_recipients`.
    ///
    /// `holder` must be a current recipient. Callers without decrypt access
    /// have to `seal` again from the plaintext.
    pub fn reseal(
        &self,
        sealed: &SealedSecret,
        holder: &ProjectKeyPair,
        new_recipients: &BTreeSet<RecipientKey>,
    ) -> TrustResult<SealedSecret> {
        self.lock("reseal")?.reseal(sealed, holder, new_recipients)
    }

    pub fn load(&self, name: &str) -> TrustResult<Option<SealedSecret>> {
        validate_name(name)?;
        let sealed: Option<SealedSecret> = self.store.read_json(&self.store.sealed_path(name))?;
        match sealed {
            Some(sealed) if sealed.name != name => Err(TrustError::CorruptSecret(name.to_string())),
            other => Ok(other),
        }
    }

    /// Names of all sealed secrets, sorted.
    pub fn list(&self) -> TrustResult<Vec<String>> {
        self.store.list_sealed()
    }

    /// Recipient set of `name`, read without decryption.
    pub fn recipients_of(&self, name: &str) -> TrustResult<BTreeSet<RecipientKey>> {
        self.load(name)?
            .map(|sealed| sealed.recipient_set())
            .ok_or_else(|| TrustError::invalid_request(format!("no secret named '{}'", name)))
    }

    pub fn remove(&self, name: &str) -> TrustResult<bool> {
        self.lock("remove")?.remove(name)
    }

    /// Store a public record, returning its new version.
    pub fn put_public<T: Serialize>(&self, name: &str, value: &T) -> TrustResult<u64> {
        self.lock("put-public")?.put_public(name, value, None)
    }

    pub fn get_public<T: DeserializeOwned>(
        &self,
        name: &str,
    ) -> TrustResult<Option<PublicRecord<T>>> {
        validate_name(name)?;
        self.store.read_json(&self.store.public_path(name))
    }

    fn current_sealed_version(&self, name: &str) -> TrustResult<u64> {
        Ok(self.load(name)?.map(|s| s.version).unwrap_or(0))
    }

    fn current_public_version(&self, name: &str) -> TrustResult<u64> {
        let record: Option<PublicRecord<serde_json::Value>> = self.get_public(name)?;
        Ok(record.map(|r| r.version).unwrap_or(0))
    }
}

/// Held writer lock on a vault.
///
/// Writes through the lock accept an expected version: `Some(0)` means the
/// record must not exist yet, `Some(v)` means it must currently be at `v`.
/// A mismatch is a `Conflict`.
#[derive(Debug)]
pub struct VaultLock<'a> {
    vault: &'a SecretVault,
    purpose: String,
    _guard: LockGuard,
}

impl VaultLock<'_> {
    pub fn purpose(&self) -> &str {
        &self.purpose
    }

    pub fn vault(&self) -> &SecretVault {
        self.vault
    }

    fn check_version(name: &str, expected: Option<u64>, found: u64) -> TrustResult<()> {
        match expected {
            Some(expected) if expected != found => Err(TrustError::Conflict {
                name: name.to_string(),
                expected,
                found,
            }),
            _ => Ok(()),
        }
    }

    pub fn seal(
        &self,
        name: &str,
        plaintext: &[u8],
        recipients: &BTreeSet<RecipientKey>,
        expected_version: Option<u64>,
    ) -> TrustResult<SealedSecret> {
        validate_name(name)?;
        let current = self.vault.current_sealed_version(name)?;
        Self::check_version(name, expected_version, current)?;

        let content_key = envelope::generate_content_key();
        let stanzas = wrap_stanzas(name, &content_key, recipients)?;
        let (nonce, ciphertext) =
            envelope::encrypt(&content_key, &payload_aad(name), plaintext)
                .map_err(|e| TrustError::internal(format!("payload encryption failed: {}", e)))?;

        let sealed = SealedSecret {
            name: name.to_string(),
            version: current + 1,
            recipients: stanzas,
            nonce: BASE64.encode(nonce),
            ciphertext: BASE64.encode(ciphertext),
            sealed_at: Utc::now(),
        };

        let store = &self.vault.store;
        store.write_json(&store.sealed_path(name), &sealed)?;
        info!(
            name,
            version = sealed.version,
            recipients = sealed.recipients.len(),
            "Sealed secret"
        );
        Ok(sealed)
    }

    pub fn reseal(
        &self,
        sealed: &SealedSecret,
        holder: &ProjectKeyPair,
        new_recipients: &BTreeSet<RecipientKey>,
    ) -> TrustResult<SealedSecret> {
        let name = sealed.name.as_str();
        validate_name(name)?;
        let current = self.vault.current_sealed_version(name)?;
        Self::check_version(name, Some(sealed.version), current)?;

        let content_key = unwrap_content_key(sealed, holder)?;
        let resealed = SealedSecret {
            name: name.to_string(),
            version: current + 1,
            recipients: wrap_stanzas(name, &content_key, new_recipients)?,
            nonce: sealed.nonce.clone(),
            ciphertext: sealed.ciphertext.clone(),
            sealed_at: Utc::now(),
        };

        let store = &self.vault.store;
        store.write_json(&store.sealed_path(name), &resealed)?;
        info!(
            name,
            version = resealed.version,
            recipients = resealed.recipients.len(),
            "Resealed secret for new recipient set"
        );
        Ok(resealed)
    }

    pub fn put_public<T: Serialize>(
        &self,
        name: &str,
        value: &T,
        expected_version: Option<u64>,
    ) -> TrustResult<u64> {
        validate_name(name)?;
        let current = self.vault.current_public_version(name)?;
        Self::check_version(name, expected_version, current)?;

        let record = PublicRecord {
            name: name.to_string(),
            version: current + 1,
            updated_at: Utc::now(),
            value,
        };
        let store = &self.vault.store;
        store.write_json(&store.public_path(name), &record)?;
        debug!(name, version = record.version, "Stored public record");
        Ok(record.version)
    }

    pub fn remove(&self, name: &str) -> TrustResult<bool> {
        validate_name(name)?;
        let store = &self.vault.store;
        let removed = store.remove(&store.sealed_path(name))?;
        if removed {
            info!(name, "Removed sealed secret");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn vault() -> (tempfile::TempDir, SecretVault) {
        let dir = tempfile::tempdir().unwrap();
        let vault = SecretVault::open(dir.path(), "homelab", "prod").unwrap();
        (dir, vault)
    }

    fn set(keys: &[&ProjectKeyPair]) -> BTreeSet<RecipientKey> {
        keys.iter().map(|k| *k.recipient()).collect()
    }

    #[test]
    fn test_db_password_scenario() {
        let (_dir, vault) = vault();
        let a = ProjectKeyPair::generate();
        let b = ProjectKeyPair::generate();
        let c = ProjectKeyPair::generate();

        let sealed = vault.seal("db_password", b"s3cr3t", &set(&[&a, &b])).unwrap();
        assert_eq!(sealed.version, 1);
        assert_eq!(sealed.recipient_set(), set(&[&a, &b]));

        let plain = vault.unseal(&sealed, &b).unwrap();
        assert_eq!(plain.as_slice(), b"s3cr3t");

        assert!(matches!(
            vault.unseal(&sealed, &c),
            Err(TrustError::RecipientNotAuthorized(name)) if name == "db_password"
        ));
    }

    #[test]
    fn test_persisted_record_is_enumerable_without_keys() {
        let (_dir, vault) = vault();
        let a = ProjectKeyPair::generate();
        vault.seal("api/token", b"t0k3n", &set(&[&a])).unwrap();
        vault.seal("db_password", b"s3cr3t", &set(&[&a])).unwrap();

        assert_eq!(vault.list().unwrap(), vec!["api/token", "db_password"]);
        assert_eq!(vault.recipients_of("api/token").unwrap(), set(&[&a]));

        let loaded = vault.load("api/token").unwrap().unwrap();
        assert_eq!(vault.unseal(&loaded, &a).unwrap().as_slice(), b"t0k3n");
    }

    #[test]
    fn test_tampered_ciphertext_is_corrupt() {
        let (_dir, vault) = vault();
        let a = ProjectKeyPair::generate();
        let mut sealed = vault.seal("db_password", b"s3cr3t", &set(&[&a])).unwrap();

        let mut raw = BASE64.decode(&sealed.ciphertext).unwrap();
        raw[0] ^= 0x01;
        sealed.ciphertext = BASE64.encode(raw);

        assert!(matches!(
            vault.unseal(&sealed, &a),
            Err(TrustError::CorruptSecret(_))
        ));
    }

    #[test]
    fn test_renamed_record_fails_integrity() {
        let (_dir, vault) = vault();
        let a = ProjectKeyPair::generate();
        let mut sealed = vault.seal("db_password", b"s3cr3t", &set(&[&a])).unwrap();
        sealed.name = "other".to_string();

        assert!(matches!(
            vault.unseal(&sealed, &a),
            Err(TrustError::CorruptSecret(_))
        ));
    }

    #[test]
    fn test_reseal_changes_recipients_not_payload() {
        let (_dir, vault) = vault();
        let a = ProjectKeyPair::generate();
        let b = ProjectKeyPair::generate();
        let c = ProjectKeyPair::generate();

        let sealed = vault.seal("db_password", b"s3cr3t", &set(&[&a, &b])).unwrap();
        let resealed = vault.reseal(&sealed, &a, &set(&[&a, &c])).unwrap();

        assert_eq!(resealed.version, 2);
        assert_eq!(resealed.ciphertext, sealed.ciphertext);
        assert_eq!(vault.unseal(&resealed, &c).unwrap().as_slice(), b"s3cr3t");
        assert!(matches!(
            vault.unseal(&resealed, &b),
            Err(TrustError::RecipientNotAuthorized(_))
        ));

        // Non-holders cannot reseal
        assert!(matches!(
            vault.reseal(&resealed, &b, &set(&[&b])),
            Err(TrustError::RecipientNotAuthorized(_))
        ));

        // Stale copy conflicts with the newer record
        assert!(matches!(
            vault.reseal(&sealed, &a, &set(&[&a])),
            Err(TrustError::Conflict {
                expected: 1,
                found: 2,
                ..
            })
        ));
    }

    #[test]
    fn test_writes_rejected_while_locked() {
        let (_dir, vault) = vault();
        let a = ProjectKeyPair::generate();

        let lock = vault.lock(ROTATE_PURPOSE).unwrap();
        assert!(matches!(
            vault.seal("db_password", b"x", &set(&[&a])),
            Err(TrustError::RotationInProgress)
        ));

        // The holder can still write through the lock
        lock.seal("db_password", b"x", &set(&[&a]), Some(0)).unwrap();
        assert!(matches!(
            lock.seal("db_password", b"y", &set(&[&a]), Some(0)),
            Err(TrustError::Conflict { .. })
        ));
        drop(lock);

        assert!(vault.seal("db_password", b"z", &set(&[&a])).is_ok());
    }

    #[test]
    fn test_empty_recipient_set_rejected() {
        let (_dir, vault) = vault();
        assert!(matches!(
            vault.seal("db_password", b"x", &BTreeSet::new()),
            Err(TrustError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_public_records_are_versioned() {
        let (_dir, vault) = vault();
        assert_eq!(vault.put_public("unlock/host1", &vec![1, 2, 3]).unwrap(), 1);
        assert_eq!(vault.put_public("unlock/host1", &vec![4]).unwrap(), 2);

        let record: PublicRecord<Vec<u32>> = vault.get_public("unlock/host1").unwrap().unwrap();
        assert_eq!(record.version, 2);
        assert_eq!(record.value, vec![4]);

        let lock = vault.lock("test").unwrap();
        assert!(matches!(
            lock.put_public("unlock/host1", &vec![5], Some(1)),
            Err(TrustError::Conflict { .. })
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_round_trip_for_every_recipient(
            plaintext in proptest::collection::vec(any::<u8>(), 0..512),
            recipient_count in 1usize..5,
        ) {
            let (_dir, vault) = vault();
            let keys: Vec<ProjectKeyPair> =
                (0..recipient_count).map(|_| ProjectKeyPair::generate()).collect();
            let recipients: BTreeSet<RecipientKey> = keys.iter().map(|k| *k.recipient()).collect();

            let sealed = vault.seal("prop/secret", &plaintext, &recipients).unwrap();
            for key in &keys {
                let opened = vault.unseal(&sealed, key).unwrap();
                prop_assert_eq!(opened.as_slice(), plaintext.as_slice());
            }

            let outsider = ProjectKeyPair::generate();
            prop_assert!(matches!(
                vault.unseal(&sealed, &outsider),
                Err(TrustError::RecipientNotAuthorized(_))
            ));
        }
    }
}
