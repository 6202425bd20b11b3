//! Unattended Unlock Coordinator.
//!
//! Provisioning splits a disk key into `n` Shamir shares, deposits each with a
//! distinct escrow endpoint and optionally binds one to local hardware state.
//! The resulting [`UnlockBinding`] records where every share lives, under a
//! fresh binding id that escrow endpoints file the shares by, together with a
//! check value for the reconstructed key.
//!
//! At boot the machine collects shares from the hardware module and, in
//! parallel, from every escrow endpoint it can reach. Each exchange is
//! mutually authenticated with CA-issued certificates. Reconstruction starts
//! as soon as `k` shares are in hand; the remaining requests are cancelled.

pub mod handshake;
pub mod hardware;
pub mod shares;
pub mod transport;
pub mod volume;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use zeroize::Zeroizing;

use crate::ca::{validate_subject, TrustBundle};
use crate::error::{TrustError, TrustResult};
use crate::keystore::OperatorKey;
use crate::persist::write_atomic;
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::vault::{PublicRecord, SecretVault};

pub use hardware::{BoundShare, HardwareModule, SoftwareModule};
pub use shares::{DiskKey, ShareMaterial};
pub use transport::{EscrowTransport, HttpEscrowClient};
pub use volume::{CryptsetupVolume, StorageUnlocker};

/// Default upper bound for one endpoint exchange, retries included
pub const DEFAULT_ENDPOINT_TIMEOUT: Duration = Duration::from_secs(10);

const KEY_CHECK_DOMAIN: &[u8] = b"keyfleet-key-check-v1";

/// A network escrow endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowEndpoint {
    /// Stable identifier, also the endpoint's advertised id
    pub id: String,
    /// Base URL, e.g. `https://escrow-a.example:8443`
    pub url: String,
    /// Subject the endpoint's server certificate must carry
    pub server_name: String,
}

/// A machine's client certificate and key.
#[derive(Clone)]
pub struct MachineIdentity {
    pub machine_id: String,
    pub client_cert_pem: String,
    pub client_key_pem: Zeroizing<String>,
}

impl MachineIdentity {
    pub fn load(machine_id: &str, cert_path: &Path, key_path: &Path) -> TrustResult<Self> {
        let client_cert_pem = std::fs::read_to_string(cert_path)?;
        let client_key_pem = Zeroizing::new(std::fs::read_to_string(key_path).map_err(|e| {
            TrustError::KeyUnavailable(format!("{}: {}", key_path.display(), e))
        })?);
        Ok(Self {
            machine_id: machine_id.to_string(),
            client_cert_pem,
            client_key_pem,
        })
    }
}

impl std::fmt::Debug for MachineIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachineIdentity")
            .field("machine_id", &self.machine_id)
            .finish_non_exhaustive()
    }
}

/// Where a share is kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ShareLocation {
    Escrow { endpoint: EscrowEndpoint },
    Hardware { bound: BoundShare },
}

impl ShareLocation {
    fn describe(&self) -> String {
        match self {
            Self::Escrow { endpoint } => endpoint.id.clone(),
            Self::Hardware { .. } => "hardware".to_string(),
        }
    }
}

/// Binding entry for one share. Holds no share material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareRef {
    pub share_id: u8,
    pub location: ShareLocation,
}

/// One share in memory together with its placement.
#[derive(Debug)]
pub struct KeyShare {
    pub share_id: u8,
    pub threshold: u8,
    pub total: u8,
    pub location: ShareLocation,
    pub material: ShareMaterial,
}

/// Where a machine's shares live and how many are needed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlockBinding {
    pub machine_id: String,
    /// Provisioning run, the key escrow endpoints hold this binding's shares under
    pub binding_id: String,
    pub threshold: u8,
    pub total: u8,
    pub shares: Vec<ShareRef>,
    /// SHA-256 over the binding id and the disk key, lowercase hex
    pub key_check: String,
    pub created_at: DateTime<Utc>,
}

impl UnlockBinding {
    /// Check value recorded for `disk_key` under `binding_id`.
    pub fn key_check_for(binding_id: &str, disk_key: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(KEY_CHECK_DOMAIN);
        hasher.update((binding_id.len() as u32).to_be_bytes());
        hasher.update(binding_id.as_bytes());
        hasher.update(disk_key);
        hex::encode(hasher.finalize())
    }

    /// Whether `disk_key` is the key this binding was provisioned with.
    pub fn matches_key(&self, disk_key: &[u8]) -> bool {
        Self::key_check_for(&self.binding_id, disk_key) == self.key_check
    }

    /// Vault record name of a machine's binding.
    pub fn record_name(machine_id: &str) -> String {
        format!("unlock/{}", machine_id)
    }

    /// Read a binding from the vault.
    pub fn load(vault: &SecretVault, machine_id: &str) -> TrustResult<Option<Self>> {
        Ok(vault
            .get_public::<Self>(&Self::record_name(machine_id))?
            .map(|record| record.value))
    }

    /// Read a binding record exported to a file.
    pub fn load_file(path: &Path) -> TrustResult<Self> {
        let bytes = std::fs::read(path)?;
        let record: PublicRecord<Self> = serde_json::from_slice(&bytes)?;
        record.value.validate()?;
        Ok(record.value)
    }

    pub fn validate(&self) -> TrustResult<()> {
        handshake::validate_binding_id(&self.binding_id)?;
        if !matches!(hex::decode(&self.key_check), Ok(digest) if digest.len() == 32) {
            return Err(TrustError::invalid_request("binding has no valid key check"));
        }
        shares::validate_policy(self.threshold, self.total)?;
        if self.shares.len() != self.total as usize {
            return Err(TrustError::invalid_request(format!(
                "binding lists {} shares for a {}-of-{} policy",
                self.shares.len(),
                self.threshold,
                self.total
            )));
        }
        let ids: BTreeSet<u8> = self.shares.iter().map(|s| s.share_id).collect();
        if ids.len() != self.shares.len() {
            return Err(TrustError::invalid_request("binding repeats a share id"));
        }
        Ok(())
    }

    /// Point escrow entries at relocated endpoints, keyed by endpoint id.
    pub fn apply_escrow_urls(&mut self, urls: &BTreeMap<String, String>) {
        for share in &mut self.shares {
            if let ShareLocation::Escrow { endpoint } = &mut share.location {
                if let Some(url) = urls.get(&endpoint.id) {
                    endpoint.url = url.clone();
                }
            }
        }
    }

    fn escrow_endpoints(&self) -> impl Iterator<Item = (u8, &EscrowEndpoint)> {
        self.shares.iter().filter_map(|s| match &s.location {
            ShareLocation::Escrow { endpoint } => Some((s.share_id, endpoint)),
            ShareLocation::Hardware { .. } => None,
        })
    }
}

/// Everything a machine needs at boot, handed to configuration management.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootReference {
    pub machine_id: String,
    /// Exported binding record
    pub binding_path: PathBuf,
    /// Escrow base URLs by endpoint id
    pub escrow_urls: BTreeMap<String, String>,
    pub client_cert_path: PathBuf,
    pub client_key_path: PathBuf,
    pub trust_bundle_path: PathBuf,
}

impl BootReference {
    pub fn for_binding(
        binding: &UnlockBinding,
        binding_path: PathBuf,
        client_cert_path: PathBuf,
        client_key_path: PathBuf,
        trust_bundle_path: PathBuf,
    ) -> Self {
        Self {
            machine_id: binding.machine_id.clone(),
            binding_path,
            escrow_urls: binding
                .escrow_endpoints()
                .map(|(_, e)| (e.id.clone(), e.url.clone()))
                .collect(),
            client_cert_path,
            client_key_path,
            trust_bundle_path,
        }
    }

    pub fn load(path: &Path) -> TrustResult<Self> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn save(&self, path: &Path) -> TrustResult<()> {
        write_atomic(path, &serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    /// Load the binding this reference points to, with URLs applied.
    pub fn binding(&self) -> TrustResult<UnlockBinding> {
        let mut binding = UnlockBinding::load_file(&self.binding_path)?;
        if binding.machine_id != self.machine_id {
            return Err(TrustError::invalid_request(format!(
                "binding belongs to '{}', not '{}'",
                binding.machine_id, self.machine_id
            )));
        }
        binding.apply_escrow_urls(&self.escrow_urls);
        Ok(binding)
    }

    pub fn identity(&self) -> TrustResult<MachineIdentity> {
        MachineIdentity::load(&self.machine_id, &self.client_cert_path, &self.client_key_path)
    }

    pub fn trust_bundle(&self) -> TrustResult<TrustBundle> {
        TrustBundle::load(&self.trust_bundle_path)
    }
}

/// What to provision for one machine.
#[derive(Debug, Clone)]
pub struct ProvisionPlan {
    pub machine_id: String,
    pub threshold: u8,
    pub escrows: Vec<EscrowEndpoint>,
}

/// Result of one share source during a boot unlock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum ShareOutcome {
    Retrieved,
    Failed(String),
    Skipped(String),
    /// Still outstanding when the threshold was reached
    Cancelled,
}

/// Per-source record of a boot unlock.
#[derive(Debug, Clone, Serialize)]
pub struct UnlockReport {
    pub machine_id: String,
    pub threshold: u8,
    pub retrieved: usize,
    pub target: String,
    pub outcomes: BTreeMap<String, ShareOutcome>,
}

/// Provisions and performs unattended unlocks.
pub struct UnlockCoordinator {
    transport: Arc<dyn EscrowTransport>,
    endpoint_timeout: Duration,
    retry: RetryConfig,
}

impl std::fmt::Debug for UnlockCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnlockCoordinator")
            .field("endpoint_timeout", &self.endpoint_timeout)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl UnlockCoordinator {
    pub fn new(transport: Arc<dyn EscrowTransport>) -> Self {
        Self {
            transport,
            endpoint_timeout: DEFAULT_ENDPOINT_TIMEOUT,
            retry: RetryConfig::default(),
        }
    }

    pub fn with_endpoint_timeout(mut self, timeout: Duration) -> Self {
        self.endpoint_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Split `disk_key` and place the shares.
    ///
    /// Every escrow advertisement is verified before any share leaves this
    /// process, and the binding is written only after all deposits succeed.
    /// Shares are deposited under a new binding id, so a run that fails
    /// part-way leaves the shares of the stored binding untouched.
    pub async fn provision(
        &self,
        vault: &SecretVault,
        operator: &OperatorKey,
        bundle: &TrustBundle,
        plan: &ProvisionPlan,
        disk_key: &[u8],
        hardware: Option<&dyn HardwareModule>,
    ) -> TrustResult<UnlockBinding> {
        validate_subject(&plan.machine_id)?;
        let total = plan.escrows.len() + usize::from(hardware.is_some());
        let total = u8::try_from(total)
            .map_err(|_| TrustError::invalid_request("too many share locations"))?;
        shares::validate_policy(plan.threshold, total)?;

        let ids: BTreeSet<&str> = plan.escrows.iter().map(|e| e.id.as_str()).collect();
        if ids.len() != plan.escrows.len() {
            return Err(TrustError::invalid_request(
                "each share needs a distinct escrow endpoint",
            ));
        }

        let now = Utc::now();
        let binding_id = uuid::Uuid::new_v4().simple().to_string();
        let binding_id = binding_id.as_str();
        let recipients = try_join_all(plan.escrows.iter().map(|endpoint| async move {
            let adv = self
                .bounded(endpoint, "advertisement", move || self.transport.advertisement(endpoint))
                .await?;
            handshake::verify_advertisement(endpoint, &adv, bundle, now)
        }))
        .await?;

        let mut material = shares::split(disk_key, plan.threshold, total)?.into_iter();
        let mut placed: Vec<KeyShare> = plan
            .escrows
            .iter()
            .zip(material.by_ref())
            .map(|(endpoint, share)| KeyShare {
                share_id: share.share_id(),
                threshold: plan.threshold,
                total,
                location: ShareLocation::Escrow {
                    endpoint: endpoint.clone(),
                },
                material: share,
            })
            .collect();

        if let (Some(module), Some(share)) = (hardware, material.next()) {
            let bound = module.seal(share.as_bytes())?;
            placed.push(KeyShare {
                share_id: share.share_id(),
                threshold: plan.threshold,
                total,
                location: ShareLocation::Hardware { bound },
                material: share,
            });
        }

        let deposits = placed
            .iter()
            .filter_map(|share| match &share.location {
                ShareLocation::Escrow { endpoint } => Some((share, endpoint)),
                ShareLocation::Hardware { .. } => None,
            })
            .zip(recipients.iter())
            .map(|((share, endpoint), recipient)| async move {
                let request = handshake::build_deposit(
                    operator,
                    recipient,
                    &plan.machine_id,
                    binding_id,
                    &share.material,
                    share.threshold,
                    share.total,
                    Utc::now(),
                )?;
                let request = &request;
                let ack = self
                    .bounded(endpoint, "deposit", move || self.transport.deposit(endpoint, request))
                    .await?;
                if ack.share_id != share.share_id
                    || ack.machine_id != plan.machine_id
                    || ack.binding_id != binding_id
                {
                    return Err(TrustError::UntrustedEndpoint {
                        endpoint: endpoint.id.clone(),
                        reason: "deposit acknowledgement does not match".to_string(),
                    });
                }
                info!(
                    machine = %plan.machine_id,
                    binding = binding_id,
                    endpoint = %endpoint.id,
                    share_id = share.share_id,
                    "Deposited key share"
                );
                Ok::<_, TrustError>(())
            });
        if let Err(e) = try_join_all(deposits).await {
            error!(
                machine = %plan.machine_id,
                binding = binding_id,
                error = %e,
                "Provisioning aborted, no binding written"
            );
            return Err(e);
        }

        let binding = UnlockBinding {
            machine_id: plan.machine_id.clone(),
            binding_id: binding_id.to_string(),
            threshold: plan.threshold,
            total,
            shares: placed
                .into_iter()
                .map(|share| ShareRef {
                    share_id: share.share_id,
                    location: share.location,
                })
                .collect(),
            key_check: UnlockBinding::key_check_for(binding_id, disk_key),
            created_at: now,
        };
        vault.put_public(&UnlockBinding::record_name(&plan.machine_id), &binding)?;

        info!(
            machine = %binding.machine_id,
            binding = %binding.binding_id,
            threshold = binding.threshold,
            total = binding.total,
            "Provisioned unattended unlock"
        );
        Ok(binding)
    }

    /// Retry `op` within the endpoint timeout.
    async fn bounded<T, F, Fut>(&self, endpoint: &EscrowEndpoint, what: &str, op: F) -> TrustResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = TrustResult<T>>,
    {
        let name = format!("{} {}", endpoint.id, what);
        tokio::time::timeout(self.endpoint_timeout, retry_with_backoff(&self.retry, &name, op))
            .await
            .unwrap_or_else(|_| Err(timed_out(endpoint, self.endpoint_timeout)))
    }

    /// Collect `k` shares, reconstruct the disk key and unlock `volume`.
    ///
    /// The reconstructed key exists only in memory and is wiped once the
    /// volume has been handed it. A key that does not match the binding's
    /// key check is never handed to the volume.
    pub async fn unlock(
        &self,
        binding: &UnlockBinding,
        identity: &MachineIdentity,
        bundle: &TrustBundle,
        hardware: Option<&dyn HardwareModule>,
        volume: &dyn StorageUnlocker,
    ) -> TrustResult<UnlockReport> {
        binding.validate()?;
        if binding.machine_id != identity.machine_id {
            return Err(TrustError::invalid_request(format!(
                "binding belongs to '{}', not '{}'",
                binding.machine_id, identity.machine_id
            )));
        }

        let threshold = binding.threshold as usize;
        let mut collected: Vec<ShareMaterial> = Vec::with_capacity(threshold);
        let mut outcomes = BTreeMap::new();

        for share in &binding.shares {
            if let ShareLocation::Hardware { bound } = &share.location {
                let outcome = match hardware {
                    None => ShareOutcome::Skipped("no hardware module available".to_string()),
                    Some(module) => match open_bound_share(module, bound, share.share_id) {
                        Ok(material) => {
                            collected.push(material);
                            ShareOutcome::Retrieved
                        }
                        Err(e) => {
                            warn!(error = %e, "Hardware-bound share unavailable");
                            ShareOutcome::Failed(e.to_string())
                        }
                    },
                };
                outcomes.insert(share.location.describe(), outcome);
            }
        }

        let identity = Arc::new(identity.clone());
        let bundle = Arc::new(bundle.clone());
        let binding_id: Arc<str> = Arc::from(binding.binding_id.as_str());
        let mut pending = JoinSet::new();
        for (share_id, endpoint) in binding.escrow_endpoints() {
            if collected.len() >= threshold {
                outcomes.insert(
                    endpoint.id.clone(),
                    ShareOutcome::Skipped("threshold already met".to_string()),
                );
                continue;
            }
            outcomes.insert(endpoint.id.clone(), ShareOutcome::Cancelled);
            let transport = Arc::clone(&self.transport);
            let identity = Arc::clone(&identity);
            let bundle = Arc::clone(&bundle);
            let binding_id = Arc::clone(&binding_id);
            let endpoint = endpoint.clone();
            let retry = self.retry.clone();
            let timeout = self.endpoint_timeout;

            pending.spawn(async move {
                let name = format!("{} release", endpoint.id);
                let result = tokio::time::timeout(
                    timeout,
                    retry_with_backoff(&retry, &name, || {
                        fetch_share(
                            Arc::clone(&transport),
                            endpoint.clone(),
                            Arc::clone(&identity),
                            Arc::clone(&bundle),
                            Arc::clone(&binding_id),
                            share_id,
                        )
                    }),
                )
                .await
                .unwrap_or_else(|_| Err(timed_out(&endpoint, timeout)));
                (endpoint.id, result)
            });
        }

        while collected.len() < threshold {
            let Some(joined) = pending.join_next().await else {
                break;
            };
            match joined {
                Ok((endpoint_id, Ok(material))) => {
                    info!(endpoint = %endpoint_id, share_id = material.share_id(), "Retrieved key share");
                    collected.push(material);
                    outcomes.insert(endpoint_id, ShareOutcome::Retrieved);
                }
                Ok((endpoint_id, Err(e))) => {
                    warn!(endpoint = %endpoint_id, error = %e, "Key share unavailable");
                    outcomes.insert(endpoint_id, ShareOutcome::Failed(e.to_string()));
                }
                Err(e) => error!(error = %e, "Share request task failed"),
            }
        }
        pending.abort_all();

        if collected.len() < threshold {
            error!(
                machine = %binding.machine_id,
                needed = threshold,
                retrieved = collected.len(),
                "Not enough key shares to unlock"
            );
            return Err(TrustError::InsufficientShares {
                needed: threshold,
                retrieved: collected.len(),
            });
        }

        let disk_key = shares::combine(binding.threshold, collected.iter())?;
        drop(collected);
        if !binding.matches_key(&disk_key) {
            error!(
                machine = %binding.machine_id,
                binding = %binding.binding_id,
                "Reconstructed key does not match the binding"
            );
            return Err(TrustError::CorruptSecret(format!(
                "disk key of {}",
                binding.machine_id
            )));
        }
        volume.unlock(&disk_key).await?;
        drop(disk_key);

        let report = UnlockReport {
            machine_id: binding.machine_id.clone(),
            threshold: binding.threshold,
            retrieved: outcomes
                .values()
                .filter(|o| **o == ShareOutcome::Retrieved)
                .count(),
            target: volume.describe(),
            outcomes,
        };
        info!(
            machine = %report.machine_id,
            retrieved = report.retrieved,
            target = %report.target,
            "Unattended unlock complete"
        );
        Ok(report)
    }
}

fn timed_out(endpoint: &EscrowEndpoint, timeout: Duration) -> TrustError {
    TrustError::transport(format!("{} timed out after {:?}", endpoint.id, timeout))
}

fn open_bound_share(
    module: &dyn HardwareModule,
    bound: &BoundShare,
    share_id: u8,
) -> TrustResult<ShareMaterial> {
    let material = ShareMaterial::from_bytes(module.unseal(bound)?)?;
    if material.share_id() != share_id {
        return Err(TrustError::AttestationFailed(format!(
            "bound share carries id {}, binding expects {}",
            material.share_id(),
            share_id
        )));
    }
    Ok(material)
}

async fn fetch_share(
    transport: Arc<dyn EscrowTransport>,
    endpoint: EscrowEndpoint,
    identity: Arc<MachineIdentity>,
    bundle: Arc<TrustBundle>,
    binding_id: Arc<str>,
    share_id: u8,
) -> TrustResult<ShareMaterial> {
    let prepared =
        handshake::prepare_request(&identity, &endpoint, &binding_id, share_id, Utc::now())?;
    let response = transport.release(&endpoint, &prepared.request).await?;
    prepared.open_response(&endpoint, &response, &bundle, Utc::now())
}
