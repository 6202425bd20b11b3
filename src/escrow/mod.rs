//! Escrow endpoint: holds one key share per machine binding and releases it
//! to that machine at boot.
//!
//! Shares arrive sealed to the endpoint's advertised X25519 key inside an
//! operator-signed deposit, and are kept sealed in the endpoint's own vault
//! under `escrow/<machine>/<binding>`. A binding's share is written once, so
//! a later provisioning run never disturbs the shares of an earlier one.
//! A share is released only to a caller presenting a valid client certificate
//! for the machine it belongs to, sealed to a key the caller chose for that
//! single request. Every answer, including a refusal, is signed with the
//! endpoint's server key.

pub mod server;

use std::collections::BTreeSet;
use std::path::PathBuf;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ed25519_dalek::pkcs8::DecodePrivateKey;
use ed25519_dalek::{SigningKey, VerifyingKey};
use keyfleet_types::{
    BundleUpdate, DepositRequest, DepositResponse, EscrowAdvertisement, EscrowStatus,
    ReleaseOutcome, ShareRequest, ShareResponse,
};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::ca::{validate_subject, CertRole, TrustBundle};
use crate::error::{TrustError, TrustResult};
use crate::keystore::{ProjectKeyPair, RecipientKey};
use crate::unlock::handshake::{
    certificate_fingerprint, deposit_aad, release_aad, sign_with_pem, validate_binding_id,
    verify_signature,
};
use crate::unlock::shares::{self, ShareMaterial};
use crate::vault::{envelope, SecretVault};

pub use server::{escrow_router, serve};

/// Default tolerance for `issued_at` timestamps
pub const DEFAULT_CLOCK_SKEW_SECS: i64 = 300;

const HELD_PREFIX: &str = "escrow/";
const DEPOSIT_PURPOSE: &str = "deposit";

/// Material an escrow endpoint runs with.
pub struct EscrowIdentity {
    pub endpoint_id: String,
    pub server_cert_pem: String,
    pub server_key_pem: Zeroizing<String>,
    /// Key deposits are sealed to; also seals the held shares at rest
    pub keypair: ProjectKeyPair,
    /// Operator key (base64 Ed25519) allowed to deposit shares and push bundles
    pub operator_public_key: String,
}

/// One escrow endpoint.
pub struct EscrowService {
    endpoint_id: String,
    server_cert_pem: String,
    server_key_pem: Zeroizing<String>,
    keypair: ProjectKeyPair,
    operator_key: VerifyingKey,
    vault: SecretVault,
    bundle: RwLock<TrustBundle>,
    bundle_path: Option<PathBuf>,
    clock_skew: Duration,
    seen_nonces: DashMap<String, DateTime<Utc>>,
}

impl std::fmt::Debug for EscrowService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EscrowService")
            .field("endpoint_id", &self.endpoint_id)
            .field("clock_skew", &self.clock_skew)
            .finish_non_exhaustive()
    }
}

fn parse_operator_key(encoded: &str) -> TrustResult<VerifyingKey> {
    let bytes: [u8; 32] = BASE64
        .decode(encoded.trim())
        .ok()
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| TrustError::invalid_request("operator public key must be 32 bytes of base64"))?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|e| TrustError::invalid_request(format!("invalid operator public key: {}", e)))
}

impl EscrowService {
    pub fn new(
        identity: EscrowIdentity,
        vault: SecretVault,
        bundle: TrustBundle,
        bundle_path: Option<PathBuf>,
    ) -> TrustResult<Self> {
        let operator_key = parse_operator_key(&identity.operator_public_key)?;
        let server_key = SigningKey::from_pkcs8_pem(&identity.server_key_pem)
            .map_err(|e| TrustError::KeyUnavailable(format!("invalid server key: {}", e)))?;

        match bundle.verify_peer(&identity.server_cert_pem, CertRole::Server, Utc::now()) {
            Ok(peer) if peer.public_key != server_key.verifying_key().to_bytes() => {
                return Err(TrustError::invalid_request(
                    "server key does not match server certificate",
                ));
            }
            Ok(peer) => debug!(subject = %peer.subject, "Server certificate verified"),
            Err(e) => warn!(error = %e, "Server certificate does not verify against the trust bundle"),
        }

        info!(
            endpoint = %identity.endpoint_id,
            recipient = %identity.keypair.recipient(),
            bundle_generation = bundle.generation,
            "Escrow endpoint initialized"
        );

        Ok(Self {
            endpoint_id: identity.endpoint_id,
            server_cert_pem: identity.server_cert_pem,
            server_key_pem: identity.server_key_pem,
            keypair: identity.keypair,
            operator_key,
            vault,
            bundle: RwLock::new(bundle),
            bundle_path,
            clock_skew: Duration::seconds(DEFAULT_CLOCK_SKEW_SECS),
            seen_nonces: DashMap::new(),
        })
    }

    pub fn with_clock_skew(mut self, seconds: i64) -> Self {
        self.clock_skew = Duration::seconds(seconds);
        self
    }

    pub fn endpoint_id(&self) -> &str {
        &self.endpoint_id
    }

    fn held_name(machine_id: &str, binding_id: &str) -> String {
        format!("{}{}/{}", HELD_PREFIX, machine_id, binding_id)
    }

    fn check_fresh(&self, issued_at: i64, now: DateTime<Utc>) -> Result<(), String> {
        let issued = DateTime::from_timestamp(issued_at, 0).ok_or("invalid timestamp")?;
        if (now - issued).abs() > self.clock_skew {
            return Err(format!("request issued at {} is outside the allowed clock skew", issued));
        }
        Ok(())
    }

    fn check_operator(&self, message: &[u8], signature: &str) -> TrustResult<()> {
        verify_signature(&self.operator_key.to_bytes(), message, signature)
            .map_err(|e| TrustError::invalid_request(format!("operator {}", e)))
    }

    /// Signed self-description for operators provisioning machines.
    pub fn advertisement(&self) -> TrustResult<EscrowAdvertisement> {
        let mut adv = EscrowAdvertisement {
            endpoint_id: self.endpoint_id.clone(),
            server_cert_pem: self.server_cert_pem.clone(),
            recipient: self.keypair.recipient().to_string(),
            fingerprint: certificate_fingerprint(&self.server_cert_pem)?,
            signature: String::new(),
        };
        adv.signature = sign_with_pem(&self.server_key_pem, &adv.signing_bytes())?;
        Ok(adv)
    }

    /// Accept an operator deposit for one binding.
    ///
    /// A binding holds at most one share. Replaying the same share answers with
    /// the stored version; a different share for a held binding is refused.
    pub fn deposit(&self, request: &DepositRequest) -> TrustResult<DepositResponse> {
        self.check_operator(&request.signing_bytes(), &request.signature)?;
        self.check_fresh(request.issued_at, Utc::now())
            .map_err(TrustError::invalid_request)?;
        validate_subject(&request.machine_id)?;
        validate_binding_id(&request.binding_id)?;
        shares::validate_policy(request.threshold, request.total)?;

        let bytes = envelope::open_payload(
            &self.keypair,
            &deposit_aad(&request.machine_id, &request.binding_id, request.share_id),
            &request.sealed_share,
        )
        .map_err(|_| TrustError::invalid_request("deposited share does not open for this endpoint"))?;
        let share = ShareMaterial::from_bytes(bytes)?;
        if share.share_id() != request.share_id {
            return Err(TrustError::invalid_request("share id does not match the deposited share"));
        }

        let name = Self::held_name(&request.machine_id, &request.binding_id);
        let lock = self.vault.lock(DEPOSIT_PURPOSE)?;
        if let Some(existing) = self.vault.load(&name)? {
            let held = self.vault.unseal(&existing, &self.keypair)?;
            if held.as_slice() != share.as_bytes() {
                warn!(
                    machine = %request.machine_id,
                    binding = %request.binding_id,
                    "Refused deposit over a held share"
                );
                return Err(TrustError::invalid_request(format!(
                    "binding '{}' already holds a different share",
                    request.binding_id
                )));
            }
            debug!(machine = %request.machine_id, binding = %request.binding_id, "Deposit already held");
            return Ok(self.deposit_response(request, existing.version));
        }

        let recipients: BTreeSet<RecipientKey> = [*self.keypair.recipient()].into_iter().collect();
        let sealed = lock.seal(&name, share.as_bytes(), &recipients, Some(0))?;

        info!(
            machine = %request.machine_id,
            binding = %request.binding_id,
            share_id = request.share_id,
            threshold = request.threshold,
            total = request.total,
            version = sealed.version,
            "Stored key share"
        );
        Ok(self.deposit_response(request, sealed.version))
    }

    fn deposit_response(&self, request: &DepositRequest, version: u64) -> DepositResponse {
        DepositResponse {
            endpoint_id: self.endpoint_id.clone(),
            machine_id: request.machine_id.clone(),
            binding_id: request.binding_id.clone(),
            share_id: request.share_id,
            version,
        }
    }

    /// Answer a share request. Refusals are answered too, signed like grants.
    pub async fn release(&self, request: &ShareRequest) -> TrustResult<ShareResponse> {
        let outcome = match self.authorize_release(request).await {
            Ok(sealed_share) => {
                info!(
                    machine = %request.machine_id,
                    binding = %request.binding_id,
                    share_id = request.share_id,
                    "Released key share"
                );
                ReleaseOutcome::Granted { sealed_share }
            }
            Err(reason) => {
                warn!(machine = %request.machine_id, reason = %reason, "Denied share request");
                ReleaseOutcome::Denied { reason }
            }
        };

        let mut response = ShareResponse {
            endpoint_id: self.endpoint_id.clone(),
            server_cert_pem: self.server_cert_pem.clone(),
            request_nonce: request.nonce.clone(),
            outcome,
            signature: String::new(),
        };
        response.signature = sign_with_pem(&self.server_key_pem, &response.signing_bytes())?;
        Ok(response)
    }

    async fn authorize_release(
        &self,
        request: &ShareRequest,
    ) -> Result<keyfleet_types::SealedPayload, String> {
        let now = Utc::now();
        if request.endpoint_id != self.endpoint_id {
            return Err("request addressed to another endpoint".to_string());
        }
        validate_binding_id(&request.binding_id).map_err(|e| e.to_string())?;
        self.check_fresh(request.issued_at, now)?;

        let peer = {
            let bundle = self.bundle.read().await;
            bundle
                .verify_peer(&request.client_cert_pem, CertRole::Client, now)
                .map_err(|e| e.to_string())?
        };
        if peer.subject != request.machine_id {
            return Err(format!(
                "client certificate is for '{}', not '{}'",
                peer.subject, request.machine_id
            ));
        }
        verify_signature(&peer.public_key, &request.signing_bytes(), &request.signature)?;
        self.remember_nonce(&request.nonce, now)?;

        let response_key = envelope::decode_key(&request.response_key)
            .map(RecipientKey::from_bytes)
            .map_err(|_| "invalid response key".to_string())?;

        let name = Self::held_name(&request.machine_id, &request.binding_id);
        let held = match self.vault.load(&name) {
            Ok(Some(sealed)) => sealed,
            Ok(None) => return Err("no share held for this binding".to_string()),
            Err(e) => return Err(e.to_string()),
        };
        let bytes = self
            .vault
            .unseal(&held, &self.keypair)
            .map_err(|e| e.to_string())?;
        let share = ShareMaterial::from_bytes(bytes).map_err(|e| e.to_string())?;
        if share.share_id() != request.share_id {
            return Err(format!(
                "share {} requested, share {} held",
                request.share_id,
                share.share_id()
            ));
        }

        envelope::seal_payload(&response_key, &release_aad(&request.nonce), share.as_bytes())
            .map_err(|e| e.to_string())
    }

    /// Record a request nonce, rejecting replays within the skew window.
    fn remember_nonce(&self, nonce: &str, now: DateTime<Utc>) -> Result<(), String> {
        let horizon = now - self.clock_skew * 2;
        self.seen_nonces.retain(|_, seen| *seen > horizon);

        match self.seen_nonces.entry(nonce.to_string()) {
            Entry::Occupied(_) => Err("request replayed".to_string()),
            Entry::Vacant(slot) => {
                slot.insert(now);
                Ok(())
            }
        }
    }

    /// Replace the trust bundle with an operator-pushed one.
    ///
    /// The generation may not go backwards, and within a generation the
    /// revocation list may not get older.
    pub async fn update_bundle(&self, update: &BundleUpdate) -> TrustResult<EscrowStatus> {
        self.check_operator(&update.signing_bytes(), &update.signature)?;
        self.check_fresh(update.issued_at, Utc::now())
            .map_err(TrustError::invalid_request)?;
        let incoming: TrustBundle = serde_json::from_str(&update.bundle)?;

        let mut bundle = self.bundle.write().await;
        if incoming.project != bundle.project {
            return Err(TrustError::invalid_request(format!(
                "bundle is for project '{}', not '{}'",
                incoming.project, bundle.project
            )));
        }
        if incoming.generation < bundle.generation
            || (incoming.generation == bundle.generation
                && incoming.revocations_issued_at < bundle.revocations_issued_at)
        {
            return Err(TrustError::invalid_request("trust bundle is older than the current one"));
        }

        if let Some(path) = &self.bundle_path {
            incoming.save(path)?;
        }
        info!(
            generation = incoming.generation,
            revoked = incoming.revoked.len(),
            "Trust bundle updated"
        );
        *bundle = incoming;
        drop(bundle);

        self.status().await
    }

    pub async fn status(&self) -> TrustResult<EscrowStatus> {
        let shares_held = self
            .vault
            .list()?
            .iter()
            .filter(|name| name.starts_with(HELD_PREFIX))
            .count();
        Ok(EscrowStatus {
            endpoint_id: self.endpoint_id.clone(),
            bundle_generation: self.bundle.read().await.generation,
            shares_held,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::{CaFactory, CaSettings};
    use crate::keystore::OperatorKey;
    use crate::unlock::handshake::{build_deposit, prepare_request};
    use crate::unlock::{EscrowEndpoint, MachineIdentity};
    use std::sync::Arc;

    struct Fixture {
        _dir: tempfile::TempDir,
        ca: CaFactory,
        operator: OperatorKey,
        service: EscrowService,
        endpoint: EscrowEndpoint,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let operator = OperatorKey::generate();

        let project_key = ProjectKeyPair::derive(&operator, "fleet").unwrap();
        let recipients: BTreeSet<_> = [*project_key.recipient()].into_iter().collect();
        let ca_vault = Arc::new(SecretVault::open(dir.path().join("operator"), "fleet", "prod").unwrap());
        let ca = CaFactory::open(ca_vault, Arc::new(project_key), recipients, CaSettings::default())
            .unwrap();
        ca.bootstrap_root(Duration::days(365)).unwrap();

        let server = ca
            .issue_leaf("escrow-a.example", CertRole::Server, Duration::days(90))
            .unwrap();
        let identity = EscrowIdentity {
            endpoint_id: "escrow-a".to_string(),
            server_cert_pem: server.certificate.certificate_pem,
            server_key_pem: server.private_key_pem,
            keypair: ProjectKeyPair::generate(),
            operator_public_key: operator.public_key_base64(),
        };
        let vault = SecretVault::open(dir.path().join("escrow"), "fleet", "escrow-a").unwrap();
        let service = EscrowService::new(identity, vault, ca.trust_bundle().unwrap(), None).unwrap();

        Fixture {
            _dir: dir,
            ca,
            operator,
            service,
            endpoint: EscrowEndpoint {
                id: "escrow-a".to_string(),
                url: "http://escrow-a.example".to_string(),
                server_name: "escrow-a.example".to_string(),
            },
        }
    }

    /// Enroll a machine, returning its identity and certificate serial.
    fn enroll(ca: &CaFactory, machine_id: &str) -> (MachineIdentity, u64) {
        let client = ca
            .issue_leaf(machine_id, CertRole::Client, Duration::days(30))
            .unwrap();
        let identity = MachineIdentity {
            machine_id: machine_id.to_string(),
            client_cert_pem: client.certificate.certificate_pem,
            client_key_pem: client.private_key_pem,
        };
        (identity, client.certificate.serial)
    }

    fn machine(ca: &CaFactory, machine_id: &str) -> MachineIdentity {
        enroll(ca, machine_id).0
    }

    const BINDING: &str = "b0";

    fn recipient(f: &Fixture) -> RecipientKey {
        let adv = f.service.advertisement().unwrap();
        crate::unlock::handshake::verify_advertisement(
            &f.endpoint,
            &adv,
            &f.ca.trust_bundle().unwrap(),
            Utc::now(),
        )
        .unwrap()
    }

    /// Deposit share 1 of a 2-of-3 split of `key` for `machine_id`.
    fn deposit_share(f: &Fixture, machine_id: &str, key: &[u8]) -> ShareMaterial {
        let share = shares::split(key, 2, 3).unwrap().remove(0);
        let request = build_deposit(
            &f.operator,
            &recipient(f),
            machine_id,
            BINDING,
            &share,
            2,
            3,
            Utc::now(),
        )
        .unwrap();
        f.service.deposit(&request).unwrap();
        share
    }

    #[tokio::test]
    async fn test_release_to_enrolled_machine() {
        let f = fixture();
        let share = deposit_share(&f, "host1.example", b"disk key");
        let identity = machine(&f.ca, "host1.example");
        let bundle = f.ca.trust_bundle().unwrap();

        let prepared = prepare_request(&identity, &f.endpoint, BINDING, share.share_id(), Utc::now()).unwrap();
        let response = f.service.release(&prepared.request).await.unwrap();
        let released = prepared
            .open_response(&f.endpoint, &response, &bundle, Utc::now())
            .unwrap();
        assert_eq!(released.as_bytes(), share.as_bytes());

        let status = f.service.status().await.unwrap();
        assert_eq!(status.shares_held, 1);
    }

    #[tokio::test]
    async fn test_release_denies_other_machine_certificate() {
        let f = fixture();
        let share = deposit_share(&f, "host1.example", b"disk key");
        let intruder = machine(&f.ca, "host2.example");

        // host2 asks for host1's share with its own valid certificate
        let mut prepared = prepare_request(&intruder, &f.endpoint, BINDING, share.share_id(), Utc::now()).unwrap();
        prepared.request.machine_id = "host1.example".to_string();
        let response = f.service.release(&prepared.request).await.unwrap();
        assert!(matches!(response.outcome, ReleaseOutcome::Denied { .. }));

        let err = prepared
            .open_response(&f.endpoint, &response, &f.ca.trust_bundle().unwrap(), Utc::now())
            .unwrap_err();
        assert!(matches!(err, TrustError::ShareDenied { .. }));
    }

    #[tokio::test]
    async fn test_release_rejects_replay_and_revoked_client() {
        let f = fixture();
        let share = deposit_share(&f, "host1.example", b"disk key");
        let (identity, serial) = enroll(&f.ca, "host1.example");

        let prepared = prepare_request(&identity, &f.endpoint, BINDING, share.share_id(), Utc::now()).unwrap();
        let first = f.service.release(&prepared.request).await.unwrap();
        assert!(matches!(first.outcome, ReleaseOutcome::Granted { .. }));
        let replay = f.service.release(&prepared.request).await.unwrap();
        assert_eq!(
            replay.outcome,
            ReleaseOutcome::Denied {
                reason: "request replayed".to_string()
            }
        );

        // Revoke the client certificate and push the new bundle
        f.ca.revoke(serial, "decommissioned").unwrap();
        let bundle = serde_json::to_string(&f.ca.trust_bundle().unwrap()).unwrap();
        let mut update = BundleUpdate {
            bundle,
            issued_at: Utc::now().timestamp(),
            signature: String::new(),
        };
        update.signature = BASE64.encode(f.operator.sign(&update.signing_bytes()).to_bytes());
        f.service.update_bundle(&update).await.unwrap();

        let prepared = prepare_request(&identity, &f.endpoint, BINDING, share.share_id(), Utc::now()).unwrap();
        let response = f.service.release(&prepared.request).await.unwrap();
        assert!(matches!(response.outcome, ReleaseOutcome::Denied { .. }));
    }

    #[tokio::test]
    async fn test_deposit_requires_operator_signature() {
        let f = fixture();
        let adv = f.service.advertisement().unwrap();
        let recipient: RecipientKey = adv.recipient.parse().unwrap();
        let share = shares::split(b"disk key", 2, 3).unwrap().remove(0);

        let impostor = OperatorKey::generate();
        let request = build_deposit(
            &impostor,
            &recipient,
            "host1.example",
            BINDING,
            &share,
            2,
            3,
            Utc::now(),
        )
        .unwrap();
        assert!(matches!(
            f.service.deposit(&request),
            Err(TrustError::InvalidRequest(_))
        ));

        let stale = build_deposit(
            &f.operator,
            &recipient,
            "host1.example",
            BINDING,
            &share,
            2,
            3,
            Utc::now() - Duration::hours(1),
        )
        .unwrap();
        assert!(f.service.deposit(&stale).is_err());
        assert_eq!(f.service.status().await.unwrap().shares_held, 0);
    }

    #[tokio::test]
    async fn test_bindings_are_write_once() {
        let f = fixture();
        let recipient = recipient(&f);
        let first = shares::split(b"first disk key", 2, 3).unwrap().remove(0);
        let deposit = |binding: &str, share: &ShareMaterial| {
            build_deposit(&f.operator, &recipient, "host1.example", binding, share, 2, 3, Utc::now())
                .unwrap()
        };

        let stored = f.service.deposit(&deposit("run1", &first)).unwrap();
        assert_eq!(stored.binding_id, "run1");

        // Retried delivery of the same share is acknowledged with the stored version
        let again = f.service.deposit(&deposit("run1", &first)).unwrap();
        assert_eq!(again.version, stored.version);

        // A later run cannot overwrite run1, but gets its own slot
        let second = shares::split(b"other disk key", 2, 3).unwrap().remove(0);
        assert!(matches!(
            f.service.deposit(&deposit("run1", &second)),
            Err(TrustError::InvalidRequest(_))
        ));
        f.service.deposit(&deposit("run2", &second)).unwrap();
        assert_eq!(f.service.status().await.unwrap().shares_held, 2);

        // run1 still releases its original share
        let identity = machine(&f.ca, "host1.example");
        let prepared = prepare_request(&identity, &f.endpoint, "run1", first.share_id(), Utc::now()).unwrap();
        let response = f.service.release(&prepared.request).await.unwrap();
        let released = prepared
            .open_response(&f.endpoint, &response, &f.ca.trust_bundle().unwrap(), Utc::now())
            .unwrap();
        assert_eq!(released.as_bytes(), first.as_bytes());

        // An unknown binding is a signed denial
        let prepared = prepare_request(&identity, &f.endpoint, "run3", 1, Utc::now()).unwrap();
        let response = f.service.release(&prepared.request).await.unwrap();
        assert_eq!(
            response.outcome,
            ReleaseOutcome::Denied {
                reason: "no share held for this binding".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_bundle_update_cannot_go_backwards() {
        let f = fixture();
        let mut older = f.ca.trust_bundle().unwrap();
        older.revocations_issued_at = older.revocations_issued_at - Duration::hours(2);

        let mut update = BundleUpdate {
            bundle: serde_json::to_string(&older).unwrap(),
            issued_at: Utc::now().timestamp(),
            signature: String::new(),
        };
        update.signature = BASE64.encode(f.operator.sign(&update.signing_bytes()).to_bytes());
        assert!(f.service.update_bundle(&update).await.is_err());

        // Unsigned push
        let update = BundleUpdate {
            signature: BASE64.encode([0u8; 64]),
            ..update
        };
        assert!(f.service.update_bundle(&update).await.is_err());
    }
}
