//! Binding a key share to local hardware security state.
//!
//! A hardware-bound share is sealed so that it only opens on this device and
//! only while the device's measured state matches the policy recorded at
//! provisioning time.

use std::path::{Path, PathBuf};

use keyfleet_types::SealedPayload;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::error::{TrustError, TrustResult};
use crate::keystore::ProjectKeyPair;
use crate::vault::envelope;

const POLICY_AAD: &[u8] = b"keyfleet-hw-share-v1";

/// A share sealed by a [`HardwareModule`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundShare {
    pub sealed: SealedPayload,
    /// Measurement policy digest (lowercase hex) the share is bound to
    pub policy: String,
}

/// Local security module able to bind data to device state.
pub trait HardwareModule: Send + Sync {
    /// Digest of the current measured state.
    fn policy(&self) -> TrustResult<String>;

    /// Seal `data` to this device and its current state.
    fn seal(&self, data: &[u8]) -> TrustResult<BoundShare>;

    /// Open a bound share; `AttestationFailed` if the state has drifted.
    fn unseal(&self, bound: &BoundShare) -> TrustResult<Zeroizing<Vec<u8>>>;
}

/// Software reference module.
///
/// The device key is an X25519 key stored on the machine, and the measured
/// state is the SHA-256 of a list of files (kernel, initrd, bootloader
/// configuration). It offers no protection against an attacker with root on
/// the running system, only against a disk moved to another machine or a
/// tampered boot chain.
pub struct SoftwareModule {
    device_key: ProjectKeyPair,
    measured_paths: Vec<PathBuf>,
}

impl SoftwareModule {
    pub fn new(device_key: ProjectKeyPair, measured_paths: Vec<PathBuf>) -> Self {
        Self {
            device_key,
            measured_paths,
        }
    }

    /// Load the device key from `key_path`.
    pub fn load(key_path: &Path, measured_paths: Vec<PathBuf>) -> TrustResult<Self> {
        let device_key = ProjectKeyPair::load(key_path)
            .map_err(|e| TrustError::AttestationFailed(format!("device key unavailable: {}", e)))?;
        Ok(Self::new(device_key, measured_paths))
    }

    fn aad(policy: &str) -> Vec<u8> {
        let mut aad = POLICY_AAD.to_vec();
        aad.extend_from_slice(policy.as_bytes());
        aad
    }
}

impl HardwareModule for SoftwareModule {
    fn policy(&self) -> TrustResult<String> {
        let mut hasher = Sha256::new();
        for path in &self.measured_paths {
            let contents = std::fs::read(path).map_err(|e| {
                TrustError::AttestationFailed(format!("cannot measure {}: {}", path.display(), e))
            })?;
            hasher.update((contents.len() as u64).to_be_bytes());
            hasher.update(&contents);
        }
        Ok(hex::encode(hasher.finalize()))
    }

    fn seal(&self, data: &[u8]) -> TrustResult<BoundShare> {
        let policy = self.policy()?;
        let sealed = envelope::seal_payload(self.device_key.recipient(), &Self::aad(&policy), data)
            .map_err(|e| TrustError::internal(format!("hardware seal failed: {}", e)))?;
        debug!(policy = %policy, "Sealed share to local hardware state");
        Ok(BoundShare { sealed, policy })
    }

    fn unseal(&self, bound: &BoundShare) -> TrustResult<Zeroizing<Vec<u8>>> {
        let current = self.policy()?;
        if current != bound.policy {
            warn!(expected = %bound.policy, measured = %current, "Boot measurements changed");
            return Err(TrustError::AttestationFailed(
                "measured state does not match the bound policy".to_string(),
            ));
        }
        envelope::open_payload(&self.device_key, &Self::aad(&current), &bound.sealed)
            .map_err(|_| TrustError::AttestationFailed("bound share does not open on this device".to_string()))
    }
}

impl std::fmt::Debug for SoftwareModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftwareModule")
            .field("measured_paths", &self.measured_paths)
            .finish_non_exhaustive()
    }
}
