//! CA Factory: the per-project trust anchor and the leaves it issues.
//!
//! # Lifecycle
//!
//! ```text
//! UNINITIALIZED --bootstrap_root--> ACTIVE(g1) --rotate--> ROTATING --> ACTIVE(g2)
//! ```
//!
//! The anchor is a versioned public record (`ca/anchor`) in the project vault.
//! It names the current generation, the sealed root key secret
//! (`ca/root-key-g<N>`), the serial counter, the tracked leaves and the
//! revocation list. Every change is a compare-and-swap on the record version
//! under the vault lock, so a rotation either replaces the whole record or
//! leaves the previous generation current.
//!
//! # Security Model
//!
//! - The root private key exists in plaintext only for the duration of one
//!   signing operation; at rest it is a sealed vault secret
//! - Leaf private keys are handed to the caller and never retained
//! - Serials come from a counter that never goes backwards, across generations
//! - Verification trusts only the current generation

mod cert;
mod verify;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::error::{TrustError, TrustResult};
use crate::keystore::{ProjectKeyPair, RecipientKey};
use crate::vault::{SecretVault, VaultLock, ROTATE_PURPOSE};

use cert::{whole_seconds, CertificateFacts, LeafKey, LeafSpec};

pub use cert::{parse_pem, validate_subject};
pub use verify::{CertStatus, TrustBundle, VerifiedPeer};

/// Public record holding the current anchor
pub const ANCHOR_RECORD: &str = "ca/anchor";

/// Certificate role. Roles differ only in extended key usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertRole {
    /// TLS server authentication (escrow endpoints, services)
    Server,
    /// TLS client authentication (machines fetching key shares)
    Client,
}

impl CertRole {
    pub(crate) fn extended_key_usage(&self) -> rcgen::ExtendedKeyUsagePurpose {
        match self {
            Self::Server => rcgen::ExtendedKeyUsagePurpose::ServerAuth,
            Self::Client => rcgen::ExtendedKeyUsagePurpose::ClientAuth,
        }
    }

    pub(crate) fn permits(&self, server_auth: bool, client_auth: bool) -> bool {
        match self {
            Self::Server => server_auth,
            Self::Client => client_auth,
        }
    }
}

impl std::fmt::Display for CertRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Server => f.write_str("server"),
            Self::Client => f.write_str("client"),
        }
    }
}

/// An issued leaf certificate. Public material only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafCertificate {
    pub subject: String,
    pub role: CertRole,
    pub serial: u64,
    pub generation: u64,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    /// SubjectPublicKeyInfo DER (base64)
    pub public_key_spki: String,
    pub certificate_pem: String,
}

/// A freshly issued leaf and the private key generated for it.
pub struct IssuedLeaf {
    pub certificate: LeafCertificate,
    pub private_key_pem: Zeroizing<String>,
}

impl std::fmt::Debug for IssuedLeaf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedLeaf")
            .field("certificate", &self.certificate)
            .finish_non_exhaustive()
    }
}

/// Public view of the current trust anchor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustAnchor {
    pub generation: u64,
    pub root_cert_pem: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

/// A leaf the factory re-issues on rotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedLeaf {
    pub subject: String,
    pub role: CertRole,
    pub serial: u64,
    pub public_key_spki: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revocation {
    pub serial: u64,
    pub revoked_at: DateTime<Utc>,
    pub reason: String,
}

/// Persisted anchor state, stored as the `ca/anchor` public record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorRecord {
    pub generation: u64,
    pub root_cert_pem: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    /// Vault secret holding the root private key
    pub root_key_secret: String,
    pub next_serial: u64,
    #[serde(default)]
    pub leaves: Vec<TrackedLeaf>,
    #[serde(default)]
    pub revocations: Vec<Revocation>,
}

impl AnchorRecord {
    fn anchor(&self) -> TrustAnchor {
        TrustAnchor {
            generation: self.generation,
            root_cert_pem: self.root_cert_pem.clone(),
            not_before: self.not_before,
            not_after: self.not_after,
        }
    }

    fn revoked_serials(&self) -> BTreeSet<u64> {
        self.revocations.iter().map(|r| r.serial).collect()
    }
}

/// Result of a successful rotation.
#[derive(Debug, Clone)]
pub struct RotationReport {
    pub previous_generation: u64,
    pub anchor: TrustAnchor,
    pub reissued: Vec<LeafCertificate>,
}

/// Externally visible state of the factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaPhase {
    Uninitialized,
    Active { generation: u64 },
    Rotating { from_generation: u64 },
}

#[derive(Debug, Clone)]
pub struct CaSettings {
    pub common_name: String,
    pub organization: String,
    /// Staleness bound written into exported trust bundles
    pub revocation_max_staleness: Option<Duration>,
}

impl Default for CaSettings {
    fn default() -> Self {
        Self {
            common_name: "keyfleet root".to_string(),
            organization: "keyfleet".to_string(),
            revocation_max_staleness: Some(Duration::hours(24)),
        }
    }
}

/// Clears the rotation flag when rotation ends, however it ends.
struct RotationFlag<'a>(&'a AtomicBool);

impl<'a> RotationFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for RotationFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Current anchor plus the bundle verification runs against.
struct Snapshot {
    record: AnchorRecord,
    bundle: TrustBundle,
}

/// Issues and rotates the project's certificates.
pub struct CaFactory {
    vault: Arc<SecretVault>,
    keypair: Arc<ProjectKeyPair>,
    recipients: BTreeSet<RecipientKey>,
    settings: CaSettings,
    current: RwLock<Option<Arc<Snapshot>>>,
    rotating: AtomicBool,
    writer: Mutex<()>,
}

impl CaFactory {
    /// Open the factory over `vault`.
    ///
    /// `keypair` unseals the root key; root keys are sealed to `recipients`
    /// plus `keypair` itself.
    pub fn open(
        vault: Arc<SecretVault>,
        keypair: Arc<ProjectKeyPair>,
        recipients: BTreeSet<RecipientKey>,
        settings: CaSettings,
    ) -> TrustResult<Self> {
        let mut recipients = recipients;
        recipients.insert(*keypair.recipient());

        let factory = Self {
            vault,
            keypair,
            recipients,
            settings,
            current: RwLock::new(None),
            rotating: AtomicBool::new(false),
            writer: Mutex::new(()),
        };

        if let Some(record) = factory.vault.get_public::<AnchorRecord>(ANCHOR_RECORD)? {
            info!(
                generation = record.value.generation,
                not_after = %record.value.not_after,
                "Loaded trust anchor"
            );
            factory.publish(record.value)?;
        }
        Ok(factory)
    }

    pub fn phase(&self) -> CaPhase {
        let generation = self.snapshot().map(|s| s.record.generation);
        match (generation, self.rotating.load(Ordering::SeqCst)) {
            (None, _) => CaPhase::Uninitialized,
            (Some(g), true) => CaPhase::Rotating { from_generation: g },
            (Some(g), false) => CaPhase::Active { generation: g },
        }
    }

    /// Current trust anchor, if bootstrapped.
    pub fn current(&self) -> Option<TrustAnchor> {
        self.snapshot().map(|s| s.record.anchor())
    }

    /// Leaves that will be re-issued on the next rotation.
    pub fn tracked_leaves(&self) -> Vec<TrackedLeaf> {
        self.snapshot()
            .map(|s| s.record.leaves.clone())
            .unwrap_or_default()
    }

    /// Export verification material for escrow endpoints.
    pub fn trust_bundle(&self) -> TrustResult<TrustBundle> {
        let snapshot = self.snapshot().ok_or_else(Self::not_bootstrapped)?;
        Ok(TrustBundle {
            revocations_issued_at: whole_seconds(Utc::now()),
            max_staleness_secs: self
                .settings
                .revocation_max_staleness
                .map(|d| d.num_seconds()),
            ..snapshot.bundle.clone()
        })
    }

    /// Export verification material for a booting machine.
    ///
    /// Machines only authenticate escrow endpoints with it and have no way to
    /// refresh it, so it carries no revocation staleness bound. Revocation of
    /// machine certificates is enforced by the endpoints' own bundles.
    pub fn machine_bundle(&self) -> TrustResult<TrustBundle> {
        Ok(TrustBundle {
            max_staleness_secs: None,
            ..self.trust_bundle()?
        })
    }

    /// Classify a certificate against the current generation.
    pub fn verify(&self, certificate_pem: &str, at_time: DateTime<Utc>) -> CertStatus {
        match self.snapshot() {
            Some(snapshot) => snapshot.bundle.verify(certificate_pem, at_time),
            None => CertStatus::Untrusted,
        }
    }

    /// Create the first generation root, valid for `validity` from now.
    pub fn bootstrap_root(&self, validity: Duration) -> TrustResult<TrustAnchor> {
        if validity <= Duration::zero() {
            return Err(TrustError::invalid_request("root validity must be positive"));
        }

        let _writer = self.writer()?;
        let lock = self.vault.lock("bootstrap")?;
        if self.vault.get_public::<AnchorRecord>(ANCHOR_RECORD)?.is_some() {
            return Err(TrustError::invalid_request(
                "trust anchor already bootstrapped; use rotate",
            ));
        }

        let now = whole_seconds(Utc::now());
        let record = self.new_generation(&lock, 1, now, now + validity, 1)?;
        if let Err(e) = lock.put_public(ANCHOR_RECORD, &record, Some(0)) {
            Self::discard_root_key(&lock, &record.root_key_secret);
            return Err(e);
        }

        info!(
            generation = record.generation,
            not_after = %record.not_after,
            "Bootstrapped trust anchor"
        );
        let anchor = record.anchor();
        self.publish(record)?;
        Ok(anchor)
    }

    /// Issue a leaf with a freshly generated key, valid from now.
    pub fn issue_leaf(
        &self,
        subject: &str,
        role: CertRole,
        validity: Duration,
    ) -> TrustResult<IssuedLeaf> {
        let (certificate, key) = self.issue(subject, role, validity, Utc::now(), LeafKey::Generate)?;
        let private_key_pem =
            key.ok_or_else(|| TrustError::internal("generated leaf has no private key"))?;
        Ok(IssuedLeaf {
            certificate,
            private_key_pem,
        })
    }

    /// Issue a leaf for the key in a caller-generated CSR.
    ///
    /// The CSR contributes only its public key; subject, role and validity
    /// are ours.
    pub fn sign_request(
        &self,
        csr_pem: &str,
        subject: &str,
        role: CertRole,
        validity: Duration,
    ) -> TrustResult<LeafCertificate> {
        self.issue(subject, role, validity, Utc::now(), LeafKey::Csr(csr_pem))
            .map(|(certificate, _)| certificate)
    }

    /// Revoke a serial of the current generation.
    pub fn revoke(&self, serial: u64, reason: &str) -> TrustResult<()> {
        let _writer = self.writer()?;
        let lock = self.vault.lock("revoke")?;
        let (mut record, version) = self.load_record()?;

        if serial == 0 || serial >= record.next_serial {
            return Err(TrustError::invalid_request(format!(
                "serial {} was never issued",
                serial
            )));
        }
        if record.revocations.iter().any(|r| r.serial == serial) {
            return Ok(());
        }

        record.revocations.push(Revocation {
            serial,
            revoked_at: Utc::now(),
            reason: reason.to_string(),
        });
        record.leaves.retain(|leaf| leaf.serial != serial);
        lock.put_public(ANCHOR_RECORD, &record, Some(version))?;

        warn!(serial, reason, generation = record.generation, "Revoked certificate");
        self.publish(record)
    }

    /// Replace the root with a new generation and re-issue every tracked leaf.
    ///
    /// All or nothing: on any failure the previous generation stays current
    /// and the new root key is discarded.
    pub fn rotate(&self, validity: Duration) -> TrustResult<RotationReport> {
        if validity <= Duration::zero() {
            return Err(TrustError::invalid_request("root validity must be positive"));
        }

        let _writer = self.writer()?;
        let _flag = RotationFlag::raise(&self.rotating);
        let lock = self.vault.lock(ROTATE_PURPOSE)?;
        let (previous, version) = self.load_record()?;

        let now = whole_seconds(Utc::now());
        let generation = previous.generation + 1;
        let mut record =
            self.new_generation(&lock, generation, now, now + validity, previous.next_serial)?;

        let reissued = match self.reissue_all(&lock, &previous, &mut record, now) {
            Ok(reissued) => reissued,
            Err(e) => {
                warn!(generation, error = %e, "Rotation aborted");
                Self::discard_root_key(&lock, &record.root_key_secret);
                return Err(e);
            }
        };

        // The pointer swap: the only write that makes the new generation visible
        if let Err(e) = lock.put_public(ANCHOR_RECORD, &record, Some(version)) {
            warn!(generation, error = %e, "Rotation aborted at anchor swap");
            Self::discard_root_key(&lock, &record.root_key_secret);
            return Err(e);
        }
        Self::discard_root_key(&lock, &previous.root_key_secret);

        info!(
            previous_generation = previous.generation,
            generation,
            reissued = reissued.len(),
            "Rotated trust anchor"
        );
        let anchor = record.anchor();
        self.publish(record)?;
        Ok(RotationReport {
            previous_generation: previous.generation,
            anchor,
            reissued,
        })
    }

    fn issue(
        &self,
        subject: &str,
        role: CertRole,
        validity: Duration,
        now: DateTime<Utc>,
        key: LeafKey<'_>,
    ) -> TrustResult<(LeafCertificate, Option<Zeroizing<String>>)> {
        if validity <= Duration::zero() {
            return Err(TrustError::invalid_request("leaf validity must be positive"));
        }
        validate_subject(subject)?;
        if self.rotating.load(Ordering::SeqCst) {
            return Err(TrustError::RotationInProgress);
        }

        let _writer = self.writer()?;
        let lock = self.vault.lock("issue")?;
        let (mut record, version) = self.load_record()?;

        let now = whole_seconds(now);
        if now >= record.not_after {
            return Err(TrustError::AnchorExpired(record.not_after));
        }
        let not_after = now + validity;
        if not_after > record.not_after {
            return Err(TrustError::invalid_request(format!(
                "requested validity ends {} but the trust anchor expires {}",
                not_after, record.not_after
            )));
        }

        let serial = record.next_serial;
        let spec = LeafSpec {
            subject,
            organization: &self.settings.organization,
            role,
            serial,
            not_before: now,
            not_after,
        };
        let (certificate, private_key) = self.sign(&lock, &record, &spec, key)?;

        record.next_serial += 1;
        // The new leaf supersedes earlier ones for the same subject and role
        record
            .leaves
            .retain(|leaf| !(leaf.subject == subject && leaf.role == role) && leaf.not_after > now);
        record.leaves.push(TrackedLeaf {
            subject: subject.to_string(),
            role,
            serial,
            public_key_spki: certificate.public_key_spki.clone(),
            not_before: certificate.not_before,
            not_after: certificate.not_after,
        });
        lock.put_public(ANCHOR_RECORD, &record, Some(version))?;

        info!(
            subject,
            %role,
            serial,
            generation = record.generation,
            not_after = %certificate.not_after,
            "Issued leaf certificate"
        );
        self.publish(record)?;
        Ok((certificate, private_key))
    }

    fn reissue_all(
        &self,
        lock: &VaultLock<'_>,
        previous: &AnchorRecord,
        record: &mut AnchorRecord,
        now: DateTime<Utc>,
    ) -> TrustResult<Vec<LeafCertificate>> {
        let revoked = previous.revoked_serials();
        let mut reissued = Vec::new();

        for leaf in &previous.leaves {
            if revoked.contains(&leaf.serial) || leaf.not_after <= now {
                continue;
            }

            let not_after = now + (leaf.not_after - leaf.not_before);
            if not_after > record.not_after {
                return Err(TrustError::invalid_request(format!(
                    "leaf '{}' (serial {}) outlives the new trust anchor",
                    leaf.subject, leaf.serial
                )));
            }

            let spki = BASE64
                .decode(&leaf.public_key_spki)
                .map_err(|e| TrustError::internal(format!("tracked key for serial {}: {}", leaf.serial, e)))?;
            let spec = LeafSpec {
                subject: &leaf.subject,
                organization: &self.settings.organization,
                role: leaf.role,
                serial: record.next_serial,
                not_before: now,
                not_after,
            };
            let (certificate, _) = self.sign(lock, record, &spec, LeafKey::Spki(&spki))?;

            record.next_serial += 1;
            record.leaves.push(TrackedLeaf {
                subject: leaf.subject.clone(),
                role: leaf.role,
                serial: certificate.serial,
                public_key_spki: certificate.public_key_spki.clone(),
                not_before: certificate.not_before,
                not_after: certificate.not_after,
            });
            reissued.push(certificate);
        }
        Ok(reissued)
    }

    /// Sign one leaf with the record's root key.
    fn sign(
        &self,
        lock: &VaultLock<'_>,
        record: &AnchorRecord,
        spec: &LeafSpec<'_>,
        key: LeafKey<'_>,
    ) -> TrustResult<(LeafCertificate, Option<Zeroizing<String>>)> {
        let root_key = lock
            .vault()
            .unseal_named(&record.root_key_secret, &self.keypair)?;
        let root_key_pem = std::str::from_utf8(&root_key)
            .map_err(|_| TrustError::CorruptSecret(record.root_key_secret.clone()))?;

        let (pem, private_key) = cert::sign_leaf(spec, key, &record.root_cert_pem, root_key_pem)?;
        drop(root_key);

        let facts = CertificateFacts::from_pem(&pem)?;
        if facts.ed25519_key.is_none() {
            return Err(TrustError::invalid_request("leaf keys must be Ed25519"));
        }

        Ok((
            LeafCertificate {
                subject: spec.subject.to_string(),
                role: spec.role,
                serial: facts.serial,
                generation: record.generation,
                not_before: facts.not_before,
                not_after: facts.not_after,
                public_key_spki: BASE64.encode(&facts.spki_der),
                certificate_pem: pem,
            },
            private_key,
        ))
    }

    /// Build a root for `generation` and seal its key. Nothing is visible
    /// until the caller swaps the anchor record.
    fn new_generation(
        &self,
        lock: &VaultLock<'_>,
        generation: u64,
        not_before: DateTime<Utc>,
        not_after: DateTime<Utc>,
        next_serial: u64,
    ) -> TrustResult<AnchorRecord> {
        let root = cert::build_root(
            &self.settings.common_name,
            &self.settings.organization,
            generation,
            not_before,
            not_after,
        )?;

        let root_key_secret = format!("ca/root-key-g{}", generation);
        lock.seal(
            &root_key_secret,
            root.key_pem.as_bytes(),
            &self.recipients,
            Some(0),
        )?;

        Ok(AnchorRecord {
            generation,
            root_cert_pem: root.cert_pem,
            not_before,
            not_after,
            root_key_secret,
            next_serial,
            leaves: Vec::new(),
            revocations: Vec::new(),
        })
    }

    fn discard_root_key(lock: &VaultLock<'_>, name: &str) {
        if let Err(e) = lock.remove(name) {
            warn!(name, error = %e, "Failed to remove root key secret");
        }
    }

    fn load_record(&self) -> TrustResult<(AnchorRecord, u64)> {
        let record = self
            .vault
            .get_public::<AnchorRecord>(ANCHOR_RECORD)?
            .ok_or_else(Self::not_bootstrapped)?;
        Ok((record.value, record.version))
    }

    fn publish(&self, record: AnchorRecord) -> TrustResult<()> {
        let bundle = TrustBundle {
            project: self.vault.project().to_string(),
            generation: record.generation,
            root_cert_pem: record.root_cert_pem.clone(),
            revoked: record.revoked_serials(),
            revocations_issued_at: whole_seconds(Utc::now()),
            // The authority's own list is never stale
            max_staleness_secs: None,
        };
        let snapshot = Arc::new(Snapshot { record, bundle });
        let mut current = self
            .current
            .write()
            .map_err(|_| TrustError::internal("anchor snapshot lock poisoned"))?;
        *current = Some(snapshot);
        Ok(())
    }

    fn snapshot(&self) -> Option<Arc<Snapshot>> {
        self.current.read().ok().and_then(|guard| guard.clone())
    }

    fn writer(&self) -> TrustResult<MutexGuard<'_, ()>> {
        self.writer
            .lock()
            .map_err(|_| TrustError::internal("issuance lock poisoned"))
    }

    fn not_bootstrapped() -> TrustError {
        TrustError::invalid_request("no trust anchor; run bootstrap_root first")
    }
}

impl std::fmt::Debug for CaFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaFactory")
            .field("project", &self.vault.project())
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        _dir: tempfile::TempDir,
        vault: Arc<SecretVault>,
        keypair: Arc<ProjectKeyPair>,
        ca: CaFactory,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let vault = Arc::new(SecretVault::open(dir.path(), "homelab", "prod").unwrap());
        let keypair = Arc::new(ProjectKeyPair::generate());
        let ca = CaFactory::open(
            vault.clone(),
            keypair.clone(),
            BTreeSet::new(),
            CaSettings::default(),
        )
        .unwrap();
        Fixture {
            _dir: dir,
            vault,
            keypair,
            ca,
        }
    }

    #[test]
    fn test_issue_and_expire_scenario() {
        let f = fixture();
        assert_eq!(f.ca.phase(), CaPhase::Uninitialized);
        f.ca.bootstrap_root(Duration::days(365)).unwrap();
        assert_eq!(f.ca.phase(), CaPhase::Active { generation: 1 });

        let leaf = f
            .ca
            .issue_leaf("host1.example", CertRole::Server, Duration::days(90))
            .unwrap();
        let pem = &leaf.certificate.certificate_pem;
        let today = Utc::now();

        assert_eq!(f.ca.verify(pem, today), CertStatus::Valid);
        assert_eq!(
            f.ca.verify(pem, today + Duration::days(91)),
            CertStatus::Expired
        );
        assert!(leaf.private_key_pem.contains("PRIVATE KEY"));
    }

    #[test]
    fn test_root_key_is_sealed_not_public() {
        let f = fixture();
        f.ca.bootstrap_root(Duration::days(365)).unwrap();

        let sealed = f.vault.load("ca/root-key-g1").unwrap().unwrap();
        assert!(sealed.recipient_set().contains(f.keypair.recipient()));
        assert!(!sealed.ciphertext.contains("PRIVATE KEY"));

        let anchor: crate::vault::PublicRecord<AnchorRecord> =
            f.vault.get_public(ANCHOR_RECORD).unwrap().unwrap();
        assert_eq!(anchor.value.root_key_secret, "ca/root-key-g1");
    }

    #[test]
    fn test_serials_strictly_increase() {
        let f = fixture();
        f.ca.bootstrap_root(Duration::days(365)).unwrap();

        let serials: Vec<u64> = (0..5)
            .map(|i| {
                f.ca.issue_leaf(&format!("host{}.example", i), CertRole::Client, Duration::days(30))
                    .unwrap()
                    .certificate
                    .serial
            })
            .collect();
        assert!(serials.windows(2).all(|w| w[0] < w[1]));

        // Reopening continues the counter
        let reopened = CaFactory::open(
            f.vault.clone(),
            f.keypair.clone(),
            BTreeSet::new(),
            CaSettings::default(),
        )
        .unwrap();
        let next = reopened
            .issue_leaf("host9.example", CertRole::Client, Duration::days(30))
            .unwrap();
        assert!(next.certificate.serial > *serials.last().unwrap());
    }

    #[test]
    fn test_issuance_errors() {
        let f = fixture();
        assert!(matches!(
            f.ca.issue_leaf("host1.example", CertRole::Server, Duration::days(1)),
            Err(TrustError::InvalidRequest(_))
        ));

        f.ca.bootstrap_root(Duration::days(30)).unwrap();
        assert!(matches!(
            f.ca.issue_leaf("host1.example", CertRole::Server, Duration::zero()),
            Err(TrustError::InvalidRequest(_))
        ));
        assert!(matches!(
            f.ca.issue_leaf("Not A Hostname", CertRole::Server, Duration::days(1)),
            Err(TrustError::InvalidRequest(_))
        ));
        assert!(matches!(
            f.ca.issue_leaf("host1.example", CertRole::Server, Duration::days(31)),
            Err(TrustError::InvalidRequest(_))
        ));
        assert!(matches!(
            f.ca.issue(
                "host1.example",
                CertRole::Server,
                Duration::days(1),
                Utc::now() + Duration::days(31),
                LeafKey::Generate
            ),
            Err(TrustError::AnchorExpired(_))
        ));
        assert!(f.ca.bootstrap_root(Duration::days(30)).is_err());
    }

    #[test]
    fn test_revocation() {
        let f = fixture();
        f.ca.bootstrap_root(Duration::days(365)).unwrap();
        let leaf = f
            .ca
            .issue_leaf("host1.example", CertRole::Client, Duration::days(90))
            .unwrap();

        f.ca.revoke(leaf.certificate.serial, "machine decommissioned").unwrap();
        assert_eq!(
            f.ca.verify(&leaf.certificate.certificate_pem, Utc::now()),
            CertStatus::Revoked
        );
        assert!(f.ca.tracked_leaves().is_empty());

        let bundle = f.ca.trust_bundle().unwrap();
        assert!(bundle.revoked.contains(&leaf.certificate.serial));
        assert_eq!(bundle.max_staleness_secs, Some(24 * 3600));

        assert!(f.ca.revoke(999, "unknown").is_err());
    }

    #[test]
    fn test_rotation_reissues_tracked_leaves() {
        let f = fixture();
        f.ca.bootstrap_root(Duration::days(365)).unwrap();
        let server = f
            .ca
            .issue_leaf("escrow-a.example", CertRole::Server, Duration::days(90))
            .unwrap();
        let client = f
            .ca
            .issue_leaf("host1.example", CertRole::Client, Duration::days(30))
            .unwrap();

        let report = f.ca.rotate(Duration::days(365)).unwrap();
        assert_eq!(report.previous_generation, 1);
        assert_eq!(report.anchor.generation, 2);
        assert_eq!(report.reissued.len(), 2);
        assert_eq!(f.ca.phase(), CaPhase::Active { generation: 2 });

        for (old, new) in [&server, &client].iter().zip(&report.reissued) {
            assert_eq!(new.subject, old.certificate.subject);
            assert_eq!(new.role, old.certificate.role);
            assert_eq!(new.public_key_spki, old.certificate.public_key_spki);
            assert!(new.serial > client.certificate.serial);
            assert_eq!(f.ca.verify(&new.certificate_pem, Utc::now()), CertStatus::Valid);
            // Previous generation no longer trusted
            assert_eq!(
                f.ca.verify(&old.certificate.certificate_pem, Utc::now()),
                CertStatus::Untrusted
            );
        }

        // Old root key retired, new one sealed
        assert!(f.vault.load("ca/root-key-g1").unwrap().is_none());
        assert!(f.vault.load("ca/root-key-g2").unwrap().is_some());
    }

    #[test]
    fn test_reissued_subject_is_tracked_once() {
        let f = fixture();
        f.ca.bootstrap_root(Duration::days(365)).unwrap();

        // A leaf that has already run out
        f.ca.issue(
            "old.example",
            CertRole::Client,
            Duration::days(1),
            Utc::now() - Duration::days(10),
            LeafKey::Generate,
        )
        .unwrap();
        f.ca.issue_leaf("host1.example", CertRole::Client, Duration::days(30))
            .unwrap();
        let latest = f
            .ca
            .issue_leaf("host1.example", CertRole::Client, Duration::days(30))
            .unwrap();
        f.ca.issue_leaf("host1.example", CertRole::Server, Duration::days(30))
            .unwrap();

        let tracked = f.ca.tracked_leaves();
        let clients: Vec<_> = tracked.iter().filter(|l| l.role == CertRole::Client).collect();
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].serial, latest.certificate.serial);
        assert_eq!(tracked.len(), 2);

        let report = f.ca.rotate(Duration::days(365)).unwrap();
        assert_eq!(report.reissued.len(), 2);
        let reissued_client = report
            .reissued
            .iter()
            .find(|leaf| leaf.role == CertRole::Client)
            .unwrap();
        assert_eq!(reissued_client.public_key_spki, latest.certificate.public_key_spki);
    }

    #[test]
    fn test_bundles_for_endpoints_and_machines() {
        let f = fixture();
        f.ca.bootstrap_root(Duration::days(365)).unwrap();

        let endpoint_bundle = f.ca.trust_bundle().unwrap();
        let machine_bundle = f.ca.machine_bundle().unwrap();
        assert_eq!(endpoint_bundle.max_staleness_secs, Some(24 * 3600));
        assert_eq!(machine_bundle.max_staleness_secs, None);
        assert_eq!(machine_bundle.root_cert_pem, endpoint_bundle.root_cert_pem);

        // The anchor itself is not a leaf
        assert_eq!(
            f.ca.verify(&endpoint_bundle.root_cert_pem, Utc::now()),
            CertStatus::Untrusted
        );
    }

    #[test]
    fn test_failed_rotation_leaves_previous_generation() {
        let f = fixture();
        let before = f.ca.bootstrap_root(Duration::days(365)).unwrap();
        let leaf = f
            .ca
            .issue_leaf("host1.example", CertRole::Server, Duration::days(90))
            .unwrap();

        // New anchor too short for the tracked leaf
        assert!(f.ca.rotate(Duration::days(30)).is_err());

        assert_eq!(f.ca.current().unwrap(), before);
        assert_eq!(f.ca.phase(), CaPhase::Active { generation: 1 });
        assert_eq!(
            f.ca.verify(&leaf.certificate.certificate_pem, Utc::now()),
            CertStatus::Valid
        );
        assert!(f.vault.load("ca/root-key-g2").unwrap().is_none());
        assert!(f.vault.load("ca/root-key-g1").unwrap().is_some());

        // Still usable afterwards
        assert!(f
            .ca
            .issue_leaf("host2.example", CertRole::Server, Duration::days(10))
            .is_ok());
    }

    #[test]
    fn test_issuance_rejected_while_rotating() {
        let f = fixture();
        f.ca.bootstrap_root(Duration::days(365)).unwrap();

        let flag = RotationFlag::raise(&f.ca.rotating);
        assert!(matches!(f.ca.phase(), CaPhase::Rotating { from_generation: 1 }));
        let err = f
            .ca
            .issue_leaf("host1.example", CertRole::Server, Duration::days(10))
            .unwrap_err();
        assert!(matches!(err, TrustError::RotationInProgress));
        assert!(err.is_retryable());
        drop(flag);

        // Another process rotating holds the vault lock
        let lock = f.vault.lock(ROTATE_PURPOSE).unwrap();
        assert!(matches!(
            f.ca.issue_leaf("host1.example", CertRole::Server, Duration::days(10)),
            Err(TrustError::RotationInProgress)
        ));
        drop(lock);

        assert!(f
            .ca
            .issue_leaf("host1.example", CertRole::Server, Duration::days(10))
            .is_ok());
    }

    #[test]
    fn test_sign_request_uses_csr_key() {
        let f = fixture();
        f.ca.bootstrap_root(Duration::days(365)).unwrap();

        let key = rcgen::KeyPair::generate_for(&rcgen::PKCS_ED25519).unwrap();
        let csr = rcgen::CertificateParams::default()
            .serialize_request(&key)
            .unwrap()
            .pem()
            .unwrap();

        let leaf = f
            .ca
            .sign_request(&csr, "host1.example", CertRole::Client, Duration::days(30))
            .unwrap();
        assert_eq!(leaf.public_key_spki, BASE64.encode(rcgen::PublicKeyData::subject_public_key_info(&key)));
        assert_eq!(f.ca.verify(&leaf.certificate_pem, Utc::now()), CertStatus::Valid);

        assert!(matches!(
            f.ca.sign_request("not a csr", "host1.example", CertRole::Client, Duration::days(30)),
            Err(TrustError::InvalidRequest(_))
        ));
    }
}
