//! Certificate verification against an exported trust bundle.
//!
//! A [`TrustBundle`] is everything a verifier needs and nothing it must not
//! have: the current root certificate and the cached revocation list. It is
//! what escrow endpoints and booting machines carry.

use std::collections::BTreeSet;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::cert::{issued_by, parse_pem, CertificateFacts};
use super::CertRole;
use crate::error::{TrustError, TrustResult};
use crate::persist::write_atomic;

/// Outcome of verifying a certificate at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertStatus {
    Valid,
    Expired,
    Revoked,
    Untrusted,
}

impl std::fmt::Display for CertStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Valid => "valid",
            Self::Expired => "expired",
            Self::Revoked => "revoked",
            Self::Untrusted => "untrusted",
        };
        f.write_str(s)
    }
}

/// Verification material for one trust anchor generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustBundle {
    pub project: String,
    pub generation: u64,
    pub root_cert_pem: String,
    /// Serials revoked within this generation
    #[serde(default)]
    pub revoked: BTreeSet<u64>,
    /// When the revocation list was exported
    pub revocations_issued_at: DateTime<Utc>,
    /// How old the revocation list may get before verification fails closed
    #[serde(default)]
    pub max_staleness_secs: Option<i64>,
}

/// A certificate holder that passed [`TrustBundle::verify_peer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedPeer {
    pub subject: String,
    pub role: CertRole,
    pub serial: u64,
    pub not_after: DateTime<Utc>,
    /// Ed25519 public key of the holder
    pub public_key: [u8; 32],
}

struct Rejection {
    status: CertStatus,
    reason: String,
}

impl Rejection {
    fn new(status: CertStatus, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
        }
    }
}

impl TrustBundle {
    pub fn load(path: &Path) -> TrustResult<Self> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn save(&self, path: &Path) -> TrustResult<()> {
        write_atomic(path, &serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    /// Whether the revocation list is older than allowed at `now`.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        match self.max_staleness_secs {
            Some(max) => now - self.revocations_issued_at > Duration::seconds(max),
            None => false,
        }
    }

    /// Classify `cert_pem` at `at_time`.
    ///
    /// Checks run in order: chain, revocation, validity window, revocation
    /// list freshness. A certificate not yet valid at `at_time` is `Expired`.
    /// Only leaves verify; the anchor and any other CA certificate are
    /// `Untrusted`.
    pub fn verify(&self, cert_pem: &str, at_time: DateTime<Utc>) -> CertStatus {
        match self.examine(cert_pem, at_time, Utc::now()) {
            Ok(_) => CertStatus::Valid,
            Err(rejection) => {
                debug!(status = %rejection.status, reason = %rejection.reason, "Certificate rejected");
                rejection.status
            }
        }
    }

    /// Verify a peer certificate presented for `role` and extract its identity.
    pub fn verify_peer(
        &self,
        cert_pem: &str,
        role: CertRole,
        at_time: DateTime<Utc>,
    ) -> TrustResult<VerifiedPeer> {
        let facts = self
            .examine(cert_pem, at_time, Utc::now())
            .map_err(|r| TrustError::certificate(format!("certificate {}: {}", r.status, r.reason)))?;

        if !role.permits(facts.server_auth, facts.client_auth) {
            return Err(TrustError::certificate(format!(
                "certificate is not valid for {} authentication",
                role
            )));
        }
        let public_key = facts
            .ed25519_key
            .ok_or_else(|| TrustError::certificate("certificate key is not Ed25519"))?;

        Ok(VerifiedPeer {
            subject: facts.subject,
            role,
            serial: facts.serial,
            not_after: facts.not_after,
            public_key,
        })
    }

    fn examine(
        &self,
        cert_pem: &str,
        at_time: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<CertificateFacts, Rejection> {
        let untrusted = |reason: String| Rejection::new(CertStatus::Untrusted, reason);

        let root_der = parse_pem(&self.root_cert_pem).map_err(|e| untrusted(e.to_string()))?;
        let leaf_der = parse_pem(cert_pem).map_err(|e| untrusted(e.to_string()))?;
        issued_by(&leaf_der, &root_der).map_err(untrusted)?;
        let facts = CertificateFacts::from_der(&leaf_der).map_err(|e| untrusted(e.to_string()))?;
        if facts.is_ca || leaf_der == root_der {
            return Err(untrusted("CA certificates are not leaves".to_string()));
        }

        if self.revoked.contains(&facts.serial) {
            return Err(Rejection::new(
                CertStatus::Revoked,
                format!("serial {} revoked", facts.serial),
            ));
        }
        if at_time < facts.not_before {
            return Err(Rejection::new(CertStatus::Expired, "not yet valid"));
        }
        if at_time > facts.not_after {
            return Err(Rejection::new(
                CertStatus::Expired,
                format!("expired at {}", facts.not_after),
            ));
        }
        if self.is_stale(now) {
            return Err(untrusted(format!(
                "revocation list from {} is stale",
                self.revocations_issued_at
            )));
        }
        Ok(facts)
    }
}
