//! Provisioning and boot-time unlock through real escrow services.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::{fast_retry, Fleet, RecordingVolume};
use keyfleet::ca::CertStatus;
use keyfleet::keystore::ProjectKeyPair;
use keyfleet::unlock::{
    BootReference, HardwareModule, HttpEscrowClient, ProvisionPlan, ShareLocation, ShareOutcome,
    SoftwareModule, UnlockBinding, UnlockCoordinator,
};
use keyfleet::TrustError;
use rand::RngCore;

fn disk_key() -> Vec<u8> {
    let mut key = vec![0u8; 64];
    rand::rngs::OsRng.fill_bytes(&mut key);
    key
}

fn plan(fleet: &Fleet, threshold: u8) -> ProvisionPlan {
    ProvisionPlan {
        machine_id: "host1.example".to_string(),
        threshold,
        escrows: fleet.endpoints(),
    }
}

#[tokio::test]
async fn test_two_of_three_survives_one_unreachable_endpoint() {
    let fleet = Fleet::new(3);
    let transport = fleet.transport();
    let coordinator = UnlockCoordinator::new(transport.clone()).with_retry(fast_retry());
    let key = disk_key();

    let binding = coordinator
        .provision(
            &fleet.vault,
            &fleet.operator,
            &fleet.ca.trust_bundle().unwrap(),
            &plan(&fleet, 2),
            &key,
            None,
        )
        .await
        .unwrap();
    assert_eq!((binding.threshold, binding.total), (2, 3));
    for (_, service) in &fleet.escrows {
        assert_eq!(service.status().await.unwrap().shares_held, 1);
    }

    let (identity, _) = fleet.enroll("host1.example");
    let bundle = fleet.ca.trust_bundle().unwrap();

    // All endpoints up
    let volume = RecordingVolume::default();
    let report = coordinator
        .unlock(&binding, &identity, &bundle, None, &volume)
        .await
        .unwrap();
    assert!(report.retrieved >= 2);
    assert_eq!(volume.keys.lock().unwrap().as_slice(), &[key.clone()]);

    // One unreachable
    transport.set_down("escrow-c");
    let volume = RecordingVolume::default();
    let report = coordinator
        .unlock(&binding, &identity, &bundle, None, &volume)
        .await
        .unwrap();
    assert_eq!(report.retrieved, 2);
    assert_eq!(volume.keys.lock().unwrap().as_slice(), &[key.clone()]);

    // Two unreachable
    transport.set_down("escrow-b");
    let volume = RecordingVolume::default();
    let err = coordinator
        .unlock(&binding, &identity, &bundle, None, &volume)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TrustError::InsufficientShares {
            needed: 2,
            retrieved: 1
        }
    ));
    assert!(volume.keys.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_untrusted_endpoint_share_is_unavailable_not_fatal() {
    let fleet = Fleet::new(3);
    let transport = fleet.transport();
    let coordinator = UnlockCoordinator::new(transport.clone()).with_retry(fast_retry());
    let key = disk_key();

    let mut binding = coordinator
        .provision(
            &fleet.vault,
            &fleet.operator,
            &fleet.ca.trust_bundle().unwrap(),
            &plan(&fleet, 2),
            &key,
            None,
        )
        .await
        .unwrap();

    // Expect a different server identity for escrow-a
    for share in &mut binding.shares {
        if let ShareLocation::Escrow { endpoint } = &mut share.location {
            if endpoint.id == "escrow-a" {
                endpoint.server_name = "impostor.example".to_string();
            }
        }
    }

    let (identity, _) = fleet.enroll("host1.example");
    let bundle = fleet.ca.trust_bundle().unwrap();

    transport.set_down("escrow-c");
    let volume = RecordingVolume::default();
    let err = coordinator
        .unlock(&binding, &identity, &bundle, None, &volume)
        .await
        .unwrap_err();
    assert!(matches!(err, TrustError::InsufficientShares { .. }));

    transport.set_up("escrow-c");
    let volume = RecordingVolume::default();
    let report = coordinator
        .unlock(&binding, &identity, &bundle, None, &volume)
        .await
        .unwrap();
    assert_eq!(volume.keys.lock().unwrap().as_slice(), &[key]);
    match &report.outcomes["escrow-a"] {
        ShareOutcome::Failed(reason) => assert!(reason.contains("Untrusted")),
        ShareOutcome::Cancelled => {}
        other => panic!("escrow-a should not have contributed: {:?}", other),
    }
}

#[tokio::test]
async fn test_revoked_machine_cannot_unlock() {
    let fleet = Fleet::new(3);
    let transport = fleet.transport();
    let coordinator = UnlockCoordinator::new(transport).with_retry(fast_retry());

    let binding = coordinator
        .provision(
            &fleet.vault,
            &fleet.operator,
            &fleet.ca.trust_bundle().unwrap(),
            &plan(&fleet, 2),
            &disk_key(),
            None,
        )
        .await
        .unwrap();

    let (identity, serial) = fleet.enroll("host1.example");
    fleet.ca.revoke(serial, "disk stolen").unwrap();
    let bundle = fleet.ca.trust_bundle().unwrap();
    assert_eq!(
        bundle.verify(&identity.client_cert_pem, Utc::now()),
        CertStatus::Revoked
    );

    // Push the new revocation list to every endpoint
    let update = {
        use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
        let mut update = keyfleet_types::BundleUpdate {
            bundle: serde_json::to_string(&bundle).unwrap(),
            issued_at: Utc::now().timestamp(),
            signature: String::new(),
        };
        update.signature = BASE64.encode(fleet.operator.sign(&update.signing_bytes()).to_bytes());
        update
    };
    for (_, service) in &fleet.escrows {
        service.update_bundle(&update).await.unwrap();
    }

    let volume = RecordingVolume::default();
    let err = coordinator
        .unlock(&binding, &identity, &bundle, None, &volume)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TrustError::InsufficientShares {
            needed: 2,
            retrieved: 0
        }
    ));
}

#[tokio::test]
async fn test_hardware_share_counts_toward_threshold() {
    let fleet = Fleet::new(3);
    let transport = fleet.transport();
    let coordinator = UnlockCoordinator::new(transport.clone()).with_retry(fast_retry());
    let key = disk_key();

    let kernel = fleet.dir.path().join("vmlinuz");
    std::fs::write(&kernel, b"kernel 6.1").unwrap();
    let module = SoftwareModule::new(ProjectKeyPair::generate(), vec![kernel.clone()]);

    let binding = coordinator
        .provision(
            &fleet.vault,
            &fleet.operator,
            &fleet.ca.trust_bundle().unwrap(),
            &plan(&fleet, 2),
            &key,
            Some(&module as &dyn HardwareModule),
        )
        .await
        .unwrap();
    assert_eq!(binding.total, 4);

    let (identity, _) = fleet.enroll("host1.example");
    let bundle = fleet.ca.trust_bundle().unwrap();
    transport.set_down("escrow-b");
    transport.set_down("escrow-c");

    let volume = RecordingVolume::default();
    let report = coordinator
        .unlock(&binding, &identity, &bundle, Some(&module as &dyn HardwareModule), &volume)
        .await
        .unwrap();
    assert_eq!(report.outcomes["hardware"], ShareOutcome::Retrieved);
    assert_eq!(volume.keys.lock().unwrap().as_slice(), &[key]);

    // A changed kernel invalidates the hardware share
    std::fs::write(&kernel, b"kernel 6.2").unwrap();
    let volume = RecordingVolume::default();
    let err = coordinator
        .unlock(&binding, &identity, &bundle, Some(&module as &dyn HardwareModule), &volume)
        .await
        .unwrap_err();
    assert!(matches!(err, TrustError::InsufficientShares { .. }));
}

#[tokio::test]
async fn test_failed_provisioning_writes_no_binding() {
    let fleet = Fleet::new(3);
    let transport = fleet.transport();
    transport.set_down("escrow-b");
    let coordinator = UnlockCoordinator::new(transport).with_retry(fast_retry());

    let err = coordinator
        .provision(
            &fleet.vault,
            &fleet.operator,
            &fleet.ca.trust_bundle().unwrap(),
            &plan(&fleet, 2),
            &disk_key(),
            None,
        )
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    assert!(UnlockBinding::load(&fleet.vault, "host1.example")
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_failed_reprovision_keeps_stored_binding_unlockable() {
    let fleet = Fleet::new(3);
    let transport = fleet.transport();
    let coordinator = UnlockCoordinator::new(transport.clone()).with_retry(fast_retry());
    let bundle = fleet.ca.trust_bundle().unwrap();
    let key = vec![7u8; 32];

    let binding = coordinator
        .provision(&fleet.vault, &fleet.operator, &bundle, &plan(&fleet, 2), &key, None)
        .await
        .unwrap();

    // escrow-a takes the new run's share, escrow-b and escrow-c drop their deposits
    transport.refuse_deposits("escrow-b");
    transport.refuse_deposits("escrow-c");
    let err = coordinator
        .provision(&fleet.vault, &fleet.operator, &bundle, &plan(&fleet, 2), &disk_key(), None)
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(
        UnlockBinding::load(&fleet.vault, "host1.example").unwrap(),
        Some(binding.clone())
    );
    assert_eq!(fleet.escrows[0].1.status().await.unwrap().shares_held, 2);

    // The stored binding still gets its own shares back
    transport.set_down("escrow-c");
    let (identity, _) = fleet.enroll("host1.example");
    let volume = RecordingVolume::default();
    let report = coordinator
        .unlock(&binding, &identity, &bundle, None, &volume)
        .await
        .unwrap();
    assert_eq!(report.retrieved, 2);
    assert_eq!(volume.keys.lock().unwrap().as_slice(), &[key]);
}

#[tokio::test]
async fn test_key_from_another_run_never_reaches_the_volume() {
    let fleet = Fleet::new(3);
    let coordinator = UnlockCoordinator::new(fleet.transport()).with_retry(fast_retry());
    let bundle = fleet.ca.trust_bundle().unwrap();

    let first = coordinator
        .provision(&fleet.vault, &fleet.operator, &bundle, &plan(&fleet, 2), &disk_key(), None)
        .await
        .unwrap();
    let second = coordinator
        .provision(&fleet.vault, &fleet.operator, &bundle, &plan(&fleet, 2), &disk_key(), None)
        .await
        .unwrap();
    assert_ne!(first.binding_id, second.binding_id);

    // Shares of the second run under the first run's key check
    let mixed = UnlockBinding {
        binding_id: second.binding_id.clone(),
        ..first
    };
    let (identity, _) = fleet.enroll("host1.example");
    let volume = RecordingVolume::default();
    let err = coordinator
        .unlock(&mixed, &identity, &bundle, None, &volume)
        .await
        .unwrap_err();
    assert!(matches!(err, TrustError::CorruptSecret(_)));
    assert!(volume.keys.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_machine_bundle_outlives_revocation_window() {
    let fleet = Fleet::new(3);
    let coordinator = UnlockCoordinator::new(fleet.transport()).with_retry(fast_retry());
    let key = disk_key();
    let binding = coordinator
        .provision(
            &fleet.vault,
            &fleet.operator,
            &fleet.ca.trust_bundle().unwrap(),
            &plan(&fleet, 2),
            &key,
            None,
        )
        .await
        .unwrap();
    let (identity, _) = fleet.enroll("host1.example");

    // The machine sat powered off for three days after provisioning
    let exported_at = Utc::now() - chrono::Duration::days(3);
    let mut machine_bundle = fleet.ca.machine_bundle().unwrap();
    machine_bundle.revocations_issued_at = exported_at;

    let volume = RecordingVolume::default();
    coordinator
        .unlock(&binding, &identity, &machine_bundle, None, &volume)
        .await
        .unwrap();
    assert_eq!(volume.keys.lock().unwrap().as_slice(), &[key]);

    // The endpoint bundle with the same age trusts no endpoint
    let mut endpoint_bundle = fleet.ca.trust_bundle().unwrap();
    endpoint_bundle.revocations_issued_at = exported_at;
    let err = coordinator
        .unlock(&binding, &identity, &endpoint_bundle, None, &RecordingVolume::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TrustError::InsufficientShares {
            needed: 2,
            retrieved: 0
        }
    ));
}

/// Full boot path over HTTP: exported boot files, real escrow listeners.
#[tokio::test]
async fn test_boot_over_http_with_exported_files() {
    let mut fleet = Fleet::new(3);

    // Serve escrow-a and escrow-b on loopback; escrow-c points at a closed port
    let mut urls = BTreeMap::new();
    for (endpoint, service) in fleet.escrows.iter_mut().take(2) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = keyfleet::escrow::escrow_router(Arc::clone(service));
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        endpoint.url = format!("http://{}", addr);
        urls.insert(endpoint.id.clone(), endpoint.url.clone());
    }
    let closed = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let closed_url = format!("http://{}", closed.local_addr().unwrap());
    drop(closed);

    // Provision while all three are reachable in-process
    let key = disk_key();
    let binding = UnlockCoordinator::new(fleet.transport())
        .with_retry(fast_retry())
        .provision(
            &fleet.vault,
            &fleet.operator,
            &fleet.ca.trust_bundle().unwrap(),
            &plan(&fleet, 2),
            &key,
            None,
        )
        .await
        .unwrap();
    urls.insert("escrow-c".to_string(), closed_url);

    // Export what configuration management would push to the machine
    let machine_dir = fleet.dir.path().join("machine");
    std::fs::create_dir_all(&machine_dir).unwrap();
    let record = fleet
        .vault
        .get_public::<UnlockBinding>(&UnlockBinding::record_name("host1.example"))
        .unwrap()
        .unwrap();
    std::fs::write(
        machine_dir.join("binding.json"),
        serde_json::to_vec(&record).unwrap(),
    )
    .unwrap();
    let (identity, _) = fleet.enroll("host1.example");
    std::fs::write(machine_dir.join("client.pem"), &identity.client_cert_pem).unwrap();
    std::fs::write(machine_dir.join("client.key"), identity.client_key_pem.as_bytes()).unwrap();
    fleet
        .ca
        .machine_bundle()
        .unwrap()
        .save(&machine_dir.join("bundle.json"))
        .unwrap();

    let mut reference = BootReference::for_binding(
        &binding,
        machine_dir.join("binding.json"),
        machine_dir.join("client.pem"),
        machine_dir.join("client.key"),
        machine_dir.join("bundle.json"),
    );
    reference.escrow_urls = urls;
    reference.save(&machine_dir.join("boot.json")).unwrap();

    // Boot
    let reference = BootReference::load(&machine_dir.join("boot.json")).unwrap();
    let client = HttpEscrowClient::new(Duration::from_secs(2)).unwrap();
    let volume = RecordingVolume::default();
    let report = UnlockCoordinator::new(Arc::new(client))
        .with_retry(fast_retry())
        .with_endpoint_timeout(Duration::from_secs(5))
        .unlock(
            &reference.binding().unwrap(),
            &reference.identity().unwrap(),
            &reference.trust_bundle().unwrap(),
            None,
            &volume,
        )
        .await
        .unwrap();

    assert_eq!(report.retrieved, 2);
    assert!(matches!(report.outcomes["escrow-c"], ShareOutcome::Failed(_) | ShareOutcome::Cancelled));
    assert_eq!(volume.keys.lock().unwrap().as_slice(), &[key]);
}
