//! Wire types for the keyfleet escrow protocol.
//!
//! These messages travel between three parties:
//!
//! - the operator, who deposits key shares with escrow endpoints at provisioning time
//! - the escrow endpoint, which holds one share per machine and releases it on request
//! - the booting machine, which authenticates with its client certificate to fetch shares
//!
//! Every message that carries authority is signed with Ed25519 over a canonical,
//! length-prefixed byte string produced by `signing_bytes()`. Binary fields are
//! base64 (standard alphabet) inside the JSON documents.

use serde::{Deserialize, Serialize};

/// Domain separation for escrow advertisements
pub const ADVERTISEMENT_DOMAIN: &[u8] = b"keyfleet-escrow-adv-v1";
/// Domain separation for operator share deposits
pub const DEPOSIT_DOMAIN: &[u8] = b"keyfleet-escrow-deposit-v1";
/// Domain separation for machine share requests
pub const REQUEST_DOMAIN: &[u8] = b"keyfleet-unlock-request-v1";
/// Domain separation for endpoint share responses
pub const RESPONSE_DOMAIN: &[u8] = b"keyfleet-unlock-response-v1";
/// Domain separation for operator trust bundle pushes
pub const BUNDLE_DOMAIN: &[u8] = b"keyfleet-escrow-bundle-v1";

/// Canonical encoder for signed messages.
///
/// Each field is written as a big-endian u32 length followed by its bytes,
/// so no two distinct field sequences share an encoding.
struct SigningBuffer(Vec<u8>);

impl SigningBuffer {
    fn new(domain: &[u8]) -> Self {
        let mut buf = Self(Vec::with_capacity(256));
        buf.field(domain);
        buf
    }

    fn field(&mut self, bytes: &[u8]) -> &mut Self {
        self.0.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        self.0.extend_from_slice(bytes);
        self
    }

    fn str(&mut self, value: &str) -> &mut Self {
        self.field(value.as_bytes())
    }

    fn int(&mut self, value: i64) -> &mut Self {
        self.field(&value.to_be_bytes())
    }

    fn finish(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.0)
    }
}

/// A payload sealed to a single X25519 recipient.
///
/// The sender generates an ephemeral X25519 key, derives a ChaCha20-Poly1305 key
/// from the Diffie-Hellman output and encrypts the payload with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedPayload {
    /// Sender's ephemeral X25519 public key (base64)
    pub ephemeral_public: String,
    /// ChaCha20-Poly1305 nonce (base64)
    pub nonce: String,
    /// Encrypted payload (base64)
    pub ciphertext: String,
}

impl SealedPayload {
    fn write(&self, buf: &mut SigningBuffer) {
        buf.str(&self.ephemeral_public)
            .str(&self.nonce)
            .str(&self.ciphertext);
    }
}

/// Self-description published by an escrow endpoint at `GET /v1/adv`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowAdvertisement {
    /// Stable identifier of the endpoint
    pub endpoint_id: String,
    /// Endpoint server certificate (PEM), issued by the project CA
    pub server_cert_pem: String,
    /// X25519 key deposits must be sealed to (`x25519:<base64>`)
    pub recipient: String,
    /// SHA-256 of the server certificate DER, lowercase hex
    pub fingerprint: String,
    /// Ed25519 signature by the server certificate key (base64)
    pub signature: String,
}

impl EscrowAdvertisement {
    pub fn signing_bytes(&self) -> Vec<u8> {
        SigningBuffer::new(ADVERTISEMENT_DOMAIN)
            .str(&self.endpoint_id)
            .str(&self.server_cert_pem)
            .str(&self.recipient)
            .str(&self.fingerprint)
            .finish()
    }
}

/// Operator deposit of one key share, `POST /v1/deposit`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositRequest {
    pub machine_id: String,
    /// Provisioning run the share belongs to
    pub binding_id: String,
    /// Share x-coordinate
    pub share_id: u8,
    pub threshold: u8,
    pub total: u8,
    /// The share, sealed to the endpoint's advertised recipient key
    pub sealed_share: SealedPayload,
    /// Unix timestamp (seconds) when the request was signed
    pub issued_at: i64,
    /// Ed25519 signature by the operator key (base64)
    pub signature: String,
}

impl DepositRequest {
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut buf = SigningBuffer::new(DEPOSIT_DOMAIN);
        buf.str(&self.machine_id)
            .str(&self.binding_id)
            .field(&[self.share_id, self.threshold, self.total]);
        self.sealed_share.write(&mut buf);
        buf.int(self.issued_at).finish()
    }
}

/// Acknowledgement of a stored deposit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositResponse {
    pub endpoint_id: String,
    pub machine_id: String,
    pub binding_id: String,
    pub share_id: u8,
    /// Version of the sealed record now holding the share
    pub version: u64,
}

/// Boot-time share request, `POST /v1/release`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareRequest {
    pub machine_id: String,
    /// Endpoint the request is addressed to (prevents cross-endpoint replay)
    pub endpoint_id: String,
    /// Provisioning run whose share is requested
    pub binding_id: String,
    pub share_id: u8,
    /// Machine client certificate (PEM)
    pub client_cert_pem: String,
    /// Ephemeral X25519 key the share must be sealed to (base64)
    pub response_key: String,
    /// Unix timestamp (seconds) when the request was signed
    pub issued_at: i64,
    /// Random request nonce (base64), echoed in the response
    pub nonce: String,
    /// Ed25519 signature by the client certificate key (base64)
    pub signature: String,
}

impl ShareRequest {
    pub fn signing_bytes(&self) -> Vec<u8> {
        SigningBuffer::new(REQUEST_DOMAIN)
            .str(&self.machine_id)
            .str(&self.endpoint_id)
            .str(&self.binding_id)
            .field(&[self.share_id])
            .str(&self.client_cert_pem)
            .str(&self.response_key)
            .int(self.issued_at)
            .str(&self.nonce)
            .finish()
    }
}

/// Result of a share request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReleaseOutcome {
    /// Share released, sealed to the request's `response_key`
    Granted { sealed_share: SealedPayload },
    /// Request refused; the refusal itself is signed
    Denied { reason: String },
}

/// Endpoint answer to a [`ShareRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareResponse {
    pub endpoint_id: String,
    /// Endpoint server certificate (PEM)
    pub server_cert_pem: String,
    /// Nonce of the request being answered
    pub request_nonce: String,
    pub outcome: ReleaseOutcome,
    /// Ed25519 signature by the server certificate key (base64)
    pub signature: String,
}

impl ShareResponse {
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut buf = SigningBuffer::new(RESPONSE_DOMAIN);
        buf.str(&self.endpoint_id)
            .str(&self.server_cert_pem)
            .str(&self.request_nonce);
        match &self.outcome {
            ReleaseOutcome::Granted { sealed_share } => {
                buf.str("granted");
                sealed_share.write(&mut buf);
            }
            ReleaseOutcome::Denied { reason } => {
                buf.str("denied").str(reason);
            }
        }
        buf.finish()
    }
}

/// Operator push of a refreshed trust bundle, `PUT /v1/bundle`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleUpdate {
    /// JSON-encoded trust bundle
    pub bundle: String,
    pub issued_at: i64,
    /// Ed25519 signature by the operator key (base64)
    pub signature: String,
}

impl BundleUpdate {
    pub fn signing_bytes(&self) -> Vec<u8> {
        SigningBuffer::new(BUNDLE_DOMAIN)
            .str(&self.bundle)
            .int(self.issued_at)
            .finish()
    }
}

/// Response for `GET /v1/status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowStatus {
    pub endpoint_id: String,
    pub bundle_generation: u64,
    pub shares_held: usize,
}

/// Error body returned by the escrow API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: u16,
}
