//! Shared fixture: an operator with a bootstrapped CA and a set of escrow
//! endpoints running in-process.

#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Duration;
use keyfleet::ca::{CaFactory, CaSettings, CertRole};
use keyfleet::escrow::{EscrowIdentity, EscrowService};
use keyfleet::keystore::{OperatorKey, ProjectKeyPair};
use keyfleet::retry::RetryConfig;
use keyfleet::unlock::{EscrowEndpoint, EscrowTransport, MachineIdentity, StorageUnlocker};
use keyfleet::vault::SecretVault;
use keyfleet::{TrustError, TrustResult};
use keyfleet_types::{
    DepositRequest, DepositResponse, EscrowAdvertisement, ShareRequest, ShareResponse,
};
use tempfile::TempDir;

pub struct Fleet {
    pub dir: TempDir,
    pub operator: OperatorKey,
    pub vault: Arc<SecretVault>,
    pub ca: CaFactory,
    pub escrows: Vec<(EscrowEndpoint, Arc<EscrowService>)>,
}

impl Fleet {
    /// Operator state plus `count` escrow endpoints named escrow-a, escrow-b, ...
    pub fn new(count: usize) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let operator = OperatorKey::generate();
        let project_key = Arc::new(ProjectKeyPair::derive(&operator, "fleet").unwrap());
        let vault = Arc::new(SecretVault::open(dir.path().join("operator"), "fleet", "prod").unwrap());
        let ca = CaFactory::open(
            Arc::clone(&vault),
            project_key,
            BTreeSet::new(),
            CaSettings::default(),
        )
        .unwrap();
        ca.bootstrap_root(Duration::days(365)).unwrap();

        let escrows = (0..count)
            .map(|i| {
                let id = format!("escrow-{}", (b'a' + i as u8) as char);
                let server_name = format!("{}.example", id);
                let server = ca
                    .issue_leaf(&server_name, CertRole::Server, Duration::days(90))
                    .unwrap();
                let identity = EscrowIdentity {
                    endpoint_id: id.clone(),
                    server_cert_pem: server.certificate.certificate_pem,
                    server_key_pem: server.private_key_pem,
                    keypair: ProjectKeyPair::generate(),
                    operator_public_key: operator.public_key_base64(),
                };
                let escrow_vault =
                    SecretVault::open(dir.path().join("escrows"), "fleet", id.clone()).unwrap();
                let service =
                    EscrowService::new(identity, escrow_vault, ca.trust_bundle().unwrap(), None)
                        .unwrap();
                let endpoint = EscrowEndpoint {
                    id,
                    url: format!("http://{}", server_name),
                    server_name,
                };
                (endpoint, Arc::new(service))
            })
            .collect();

        Self {
            dir,
            operator,
            vault,
            ca,
            escrows,
        }
    }

    pub fn endpoints(&self) -> Vec<EscrowEndpoint> {
        self.escrows.iter().map(|(e, _)| e.clone()).collect()
    }

    pub fn transport(&self) -> Arc<InProcessTransport> {
        Arc::new(InProcessTransport {
            services: self
                .escrows
                .iter()
                .map(|(e, s)| (e.id.clone(), Arc::clone(s)))
                .collect(),
            down: Mutex::new(HashSet::new()),
            refusing_deposits: Mutex::new(HashSet::new()),
        })
    }

    /// Issue a client certificate for `machine_id`.
    pub fn enroll(&self, machine_id: &str) -> (MachineIdentity, u64) {
        let client = self
            .ca
            .issue_leaf(machine_id, CertRole::Client, Duration::days(30))
            .unwrap();
        let identity = MachineIdentity {
            machine_id: machine_id.to_string(),
            client_cert_pem: client.certificate.certificate_pem,
            client_key_pem: client.private_key_pem,
        };
        (identity, client.certificate.serial)
    }
}

/// Calls escrow services directly; endpoints marked down refuse connections.
pub struct InProcessTransport {
    services: HashMap<String, Arc<EscrowService>>,
    down: Mutex<HashSet<String>>,
    refusing_deposits: Mutex<HashSet<String>>,
}

impl InProcessTransport {
    pub fn set_down(&self, endpoint_id: &str) {
        self.down.lock().unwrap().insert(endpoint_id.to_string());
    }

    pub fn set_up(&self, endpoint_id: &str) {
        self.down.lock().unwrap().remove(endpoint_id);
    }

    /// Keep answering advertisements and releases but drop deposits.
    pub fn refuse_deposits(&self, endpoint_id: &str) {
        self.refusing_deposits
            .lock()
            .unwrap()
            .insert(endpoint_id.to_string());
    }

    fn service(&self, endpoint: &EscrowEndpoint) -> TrustResult<&EscrowService> {
        if self.down.lock().unwrap().contains(&endpoint.id) {
            return Err(TrustError::transport(format!("{}: connection refused", endpoint.id)));
        }
        self.services
            .get(&endpoint.id)
            .map(|s| s.as_ref())
            .ok_or_else(|| TrustError::transport(format!("{}: no route to host", endpoint.id)))
    }
}

#[async_trait]
impl EscrowTransport for InProcessTransport {
    async fn advertisement(&self, endpoint: &EscrowEndpoint) -> TrustResult<EscrowAdvertisement> {
        self.service(endpoint)?.advertisement()
    }

    async fn deposit(
        &self,
        endpoint: &EscrowEndpoint,
        request: &DepositRequest,
    ) -> TrustResult<DepositResponse> {
        if self.refusing_deposits.lock().unwrap().contains(&endpoint.id) {
            return Err(TrustError::transport(format!("{}: connection reset", endpoint.id)));
        }
        self.service(endpoint)?.deposit(request)
    }

    async fn release(
        &self,
        endpoint: &EscrowEndpoint,
        request: &ShareRequest,
    ) -> TrustResult<ShareResponse> {
        self.service(endpoint)?.release(request).await
    }
}

/// Records the keys it is unlocked with.
#[derive(Default)]
pub struct RecordingVolume {
    pub keys: Mutex<Vec<Vec<u8>>>,
}

#[async_trait]
impl StorageUnlocker for RecordingVolume {
    fn describe(&self) -> String {
        "recording volume".to_string()
    }

    async fn unlock(&self, key: &[u8]) -> TrustResult<()> {
        self.keys.lock().unwrap().push(key.to_vec());
        Ok(())
    }
}

pub fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 2,
        initial_delay_ms: 1,
        max_delay_ms: 5,
        backoff_multiplier: 2.0,
    }
}
