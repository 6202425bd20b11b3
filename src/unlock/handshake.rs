//! Signing and checking of escrow protocol messages.
//!
//! Both sides authenticate with CA-issued Ed25519 certificates: the escrow
//! endpoint with a server certificate, the machine with a client certificate.
//! Each signed message is checked against the public key of a certificate that
//! has first been verified against the trust bundle.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use ed25519_dalek::pkcs8::DecodePrivateKey;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use keyfleet_types::{
    DepositRequest, EscrowAdvertisement, ReleaseOutcome, SealedPayload, ShareRequest,
    ShareResponse,
};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

use super::shares::ShareMaterial;
use super::{EscrowEndpoint, MachineIdentity};
use crate::ca::{parse_pem, CertRole, TrustBundle};
use crate::error::{TrustError, TrustResult};
use crate::keystore::{OperatorKey, ProjectKeyPair, RecipientKey};
use crate::vault::envelope;

const DEPOSIT_AAD: &[u8] = b"keyfleet-deposit-v1";
const RELEASE_AAD: &[u8] = b"keyfleet-release-v1";

/// AAD binding a deposited share to its machine, binding and slot.
pub fn deposit_aad(machine_id: &str, binding_id: &str, share_id: u8) -> Vec<u8> {
    let mut aad = DEPOSIT_AAD.to_vec();
    aad.extend_from_slice(machine_id.as_bytes());
    aad.push(0);
    aad.extend_from_slice(binding_id.as_bytes());
    aad.push(0);
    aad.push(share_id);
    aad
}

/// Check a binding id: 1 to 64 characters of `[A-Za-z0-9-]`.
pub fn validate_binding_id(binding_id: &str) -> TrustResult<()> {
    let valid = !binding_id.is_empty()
        && binding_id.len() <= 64
        && binding_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-');
    if !valid {
        return Err(TrustError::invalid_request(format!(
            "invalid binding id '{}'",
            binding_id
        )));
    }
    Ok(())
}

/// AAD binding a released share to the request it answers.
pub fn release_aad(request_nonce: &str) -> Vec<u8> {
    let mut aad = RELEASE_AAD.to_vec();
    aad.extend_from_slice(request_nonce.as_bytes());
    aad
}

/// Sign `message` with a PKCS#8 PEM Ed25519 key.
pub fn sign_with_pem(key_pem: &str, message: &[u8]) -> TrustResult<String> {
    let key = SigningKey::from_pkcs8_pem(key_pem)
        .map_err(|e| TrustError::KeyUnavailable(format!("invalid certificate key: {}", e)))?;
    Ok(BASE64.encode(key.sign(message).to_bytes()))
}

/// Verify a base64 Ed25519 signature.
pub fn verify_signature(public_key: &[u8; 32], message: &[u8], signature: &str) -> Result<(), String> {
    let key = VerifyingKey::from_bytes(public_key).map_err(|_| "invalid public key".to_string())?;
    let bytes = BASE64
        .decode(signature)
        .map_err(|_| "invalid signature encoding".to_string())?;
    let signature = Signature::from_slice(&bytes).map_err(|_| "invalid signature".to_string())?;
    key.verify(message, &signature)
        .map_err(|_| "signature verification failed".to_string())
}

/// SHA-256 of a certificate's DER, lowercase hex.
pub fn certificate_fingerprint(cert_pem: &str) -> TrustResult<String> {
    let der = parse_pem(cert_pem)?;
    Ok(hex::encode(Sha256::digest(&der)))
}

fn untrusted(endpoint: &EscrowEndpoint, reason: impl Into<String>) -> TrustError {
    TrustError::UntrustedEndpoint {
        endpoint: endpoint.id.clone(),
        reason: reason.into(),
    }
}

/// Check an endpoint's certificate and return its verified Ed25519 key.
fn verify_endpoint_cert(
    endpoint: &EscrowEndpoint,
    cert_pem: &str,
    bundle: &TrustBundle,
    now: DateTime<Utc>,
) -> TrustResult<[u8; 32]> {
    let peer = bundle
        .verify_peer(cert_pem, CertRole::Server, now)
        .map_err(|e| untrusted(endpoint, e.to_string()))?;
    if peer.subject != endpoint.server_name {
        return Err(untrusted(
            endpoint,
            format!(
                "certificate names '{}', expected '{}'",
                peer.subject, endpoint.server_name
            ),
        ));
    }
    Ok(peer.public_key)
}

/// Check an endpoint advertisement and return the key deposits are sealed to.
pub fn verify_advertisement(
    endpoint: &EscrowEndpoint,
    adv: &EscrowAdvertisement,
    bundle: &TrustBundle,
    now: DateTime<Utc>,
) -> TrustResult<RecipientKey> {
    if adv.endpoint_id != endpoint.id {
        return Err(untrusted(
            endpoint,
            format!("advertises itself as '{}'", adv.endpoint_id),
        ));
    }
    let server_key = verify_endpoint_cert(endpoint, &adv.server_cert_pem, bundle, now)?;
    if certificate_fingerprint(&adv.server_cert_pem)? != adv.fingerprint {
        return Err(untrusted(endpoint, "fingerprint does not match certificate"));
    }
    verify_signature(&server_key, &adv.signing_bytes(), &adv.signature)
        .map_err(|e| untrusted(endpoint, e))?;

    adv.recipient
        .parse()
        .map_err(|e: TrustError| untrusted(endpoint, e.to_string()))
}

/// Build an operator-signed deposit of one share for `recipient`.
#[allow(clippy::too_many_arguments)]
pub fn build_deposit(
    operator: &OperatorKey,
    recipient: &RecipientKey,
    machine_id: &str,
    binding_id: &str,
    share: &ShareMaterial,
    threshold: u8,
    total: u8,
    now: DateTime<Utc>,
) -> TrustResult<DepositRequest> {
    let sealed_share = envelope::seal_payload(
        recipient,
        &deposit_aad(machine_id, binding_id, share.share_id()),
        share.as_bytes(),
    )
    .map_err(|e| TrustError::internal(format!("failed to seal share: {}", e)))?;

    let mut request = DepositRequest {
        machine_id: machine_id.to_string(),
        binding_id: binding_id.to_string(),
        share_id: share.share_id(),
        threshold,
        total,
        sealed_share,
        issued_at: now.timestamp(),
        signature: String::new(),
    };
    request.signature = BASE64.encode(operator.sign(&request.signing_bytes()).to_bytes());
    Ok(request)
}

/// A signed share request and the ephemeral key its answer is sealed to.
pub struct PreparedRequest {
    pub request: ShareRequest,
    response_key: ProjectKeyPair,
}

/// Build a share request signed with the machine's client key.
pub fn prepare_request(
    identity: &MachineIdentity,
    endpoint: &EscrowEndpoint,
    binding_id: &str,
    share_id: u8,
    now: DateTime<Utc>,
) -> TrustResult<PreparedRequest> {
    let response_key = ProjectKeyPair::generate();
    let mut nonce = [0u8; 16];
    OsRng.fill_bytes(&mut nonce);

    let mut request = ShareRequest {
        machine_id: identity.machine_id.clone(),
        endpoint_id: endpoint.id.clone(),
        binding_id: binding_id.to_string(),
        share_id,
        client_cert_pem: identity.client_cert_pem.clone(),
        response_key: BASE64.encode(response_key.recipient().as_bytes()),
        issued_at: now.timestamp(),
        nonce: BASE64.encode(nonce),
        signature: String::new(),
    };
    request.signature = sign_with_pem(&identity.client_key_pem, &request.signing_bytes())?;

    Ok(PreparedRequest {
        request,
        response_key,
    })
}

impl PreparedRequest {
    /// Authenticate an endpoint's answer and extract the released share.
    pub fn open_response(
        &self,
        endpoint: &EscrowEndpoint,
        response: &ShareResponse,
        bundle: &TrustBundle,
        now: DateTime<Utc>,
    ) -> TrustResult<ShareMaterial> {
        let server_key = verify_endpoint_cert(endpoint, &response.server_cert_pem, bundle, now)?;
        if response.endpoint_id != endpoint.id {
            return Err(untrusted(endpoint, "response from a different endpoint"));
        }
        if response.request_nonce != self.request.nonce {
            return Err(untrusted(endpoint, "response does not answer this request"));
        }
        verify_signature(&server_key, &response.signing_bytes(), &response.signature)
            .map_err(|e| untrusted(endpoint, e))?;

        let sealed: &SealedPayload = match &response.outcome {
            ReleaseOutcome::Granted { sealed_share } => sealed_share,
            ReleaseOutcome::Denied { reason } => {
                return Err(TrustError::ShareDenied {
                    endpoint: endpoint.id.clone(),
                    reason: reason.clone(),
                })
            }
        };

        let bytes = envelope::open_payload(&self.response_key, &release_aad(&self.request.nonce), sealed)
            .map_err(|e| untrusted(endpoint, format!("released share does not open: {}", e)))?;
        let share = ShareMaterial::from_bytes(bytes)?;
        if share.share_id() != self.request.share_id {
            return Err(untrusted(
                endpoint,
                format!("released share {} instead of {}", share.share_id(), self.request.share_id),
            ));
        }
        Ok(share)
    }
}
