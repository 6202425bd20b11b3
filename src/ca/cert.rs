//! X.509 building and parsing.
//!
//! All keys are Ed25519. The root is self-signed with a path length of zero;
//! leaves carry the subject as CN and DNS SAN and a single extended key usage
//! chosen by their role.

use chrono::{DateTime, Utc};
use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, CertificateSigningRequestParams,
    DistinguishedName, DnType, DnValue, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
    SerialNumber,
};
use x509_parser::prelude::*;
use zeroize::Zeroizing;

use super::CertRole;
use crate::error::{TrustError, TrustResult};

const ED25519_OID: &str = "1.3.101.112";

/// Parse PEM-encoded data and return the DER bytes
pub fn parse_pem(pem_data: &str) -> TrustResult<Vec<u8>> {
    let pem_obj = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| TrustError::certificate(format!("failed to parse PEM: {}", e)))?;
    Ok(pem_obj.contents().to_vec())
}

pub(crate) fn to_asn1_time(dt: DateTime<Utc>) -> TrustResult<::time::OffsetDateTime> {
    ::time::OffsetDateTime::from_unix_timestamp(dt.timestamp())
        .map_err(|e| TrustError::certificate(format!("timestamp out of range: {}", e)))
}

pub(crate) fn from_unix(ts: i64) -> TrustResult<DateTime<Utc>> {
    DateTime::from_timestamp(ts, 0)
        .ok_or_else(|| TrustError::certificate(format!("timestamp {} out of range", ts)))
}

/// X.509 times have whole-second precision.
pub(crate) fn whole_seconds(dt: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(dt.timestamp(), 0).unwrap_or(dt)
}

fn serial_number(serial: u64) -> SerialNumber {
    let bytes = serial.to_be_bytes();
    let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len() - 1);
    SerialNumber::from_slice(&bytes[first..])
}

fn serial_from_raw(raw: &[u8]) -> Option<u64> {
    let first = raw.iter().position(|b| *b != 0).unwrap_or(raw.len());
    let significant = &raw[first..];
    if significant.len() > 8 {
        return None;
    }
    Some(significant.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
}

fn distinguished_name(common_name: &str, organization: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(common_name.to_string()),
    );
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String(organization.to_string()),
    );
    dn
}

/// Root certificate and its private key.
pub(crate) struct RootMaterial {
    pub cert_pem: String,
    pub key_pem: Zeroizing<String>,
}

/// Generate a self-signed root for `generation`.
pub(crate) fn build_root(
    common_name: &str,
    organization: &str,
    generation: u64,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
) -> TrustResult<RootMaterial> {
    let mut params = CertificateParams::default();
    params.distinguished_name = distinguished_name(common_name, organization);
    params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params.serial_number = Some(serial_number(generation));
    params.not_before = to_asn1_time(not_before)?;
    params.not_after = to_asn1_time(not_after)?;

    let key_pair = KeyPair::generate_for(&rcgen::PKCS_ED25519)
        .map_err(|e| TrustError::certificate(format!("failed to generate root key: {}", e)))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| TrustError::certificate(format!("failed to create root cert: {}", e)))?;

    Ok(RootMaterial {
        cert_pem: cert.pem(),
        key_pem: Zeroizing::new(key_pair.serialize_pem()),
    })
}

/// What a leaf certificate says about its holder.
pub(crate) struct LeafSpec<'a> {
    pub subject: &'a str,
    pub organization: &'a str,
    pub role: CertRole,
    pub serial: u64,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

/// Where the leaf's public key comes from.
pub(crate) enum LeafKey<'a> {
    /// Generate a fresh key pair and hand the private key to the caller
    Generate,
    /// Re-certify an existing public key (SubjectPublicKeyInfo DER)
    Spki(&'a [u8]),
    /// Certify the key of a caller-generated CSR
    Csr(&'a str),
}

fn leaf_params(spec: &LeafSpec<'_>) -> TrustResult<CertificateParams> {
    let mut params = CertificateParams::default();
    params.distinguished_name = distinguished_name(spec.subject, spec.organization);
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = vec![spec.role.extended_key_usage()];
    params.use_authority_key_identifier_extension = true;
    params.serial_number = Some(serial_number(spec.serial));
    params.not_before = to_asn1_time(spec.not_before)?;
    params.not_after = to_asn1_time(spec.not_after)?;
    params.subject_alt_names = vec![SanType::DnsName(
        Ia5String::try_from(spec.subject.to_string()).map_err(|e| {
            TrustError::invalid_request(format!("invalid DNS name '{}': {}", spec.subject, e))
        })?,
    )];
    Ok(params)
}

/// Sign a leaf with the root. Returns the certificate PEM and, for
/// [`LeafKey::Generate`], the new private key.
pub(crate) fn sign_leaf(
    spec: &LeafSpec<'_>,
    key: LeafKey<'_>,
    root_cert_pem: &str,
    root_key_pem: &str,
) -> TrustResult<(String, Option<Zeroizing<String>>)> {
    let params = leaf_params(spec)?;

    let root_key = KeyPair::from_pem(root_key_pem)
        .map_err(|e| TrustError::certificate(format!("failed to load root key: {}", e)))?;
    let issuer = Issuer::from_ca_cert_pem(root_cert_pem, &root_key)
        .map_err(|e| TrustError::certificate(format!("failed to create issuer: {}", e)))?;
    let signing_failed =
        |e: rcgen::Error| TrustError::certificate(format!("failed to sign leaf cert: {}", e));

    match key {
        LeafKey::Generate => {
            let leaf_key = KeyPair::generate_for(&rcgen::PKCS_ED25519).map_err(|e| {
                TrustError::certificate(format!("failed to generate leaf key: {}", e))
            })?;
            let cert = params
                .signed_by(&leaf_key, &issuer)
                .map_err(signing_failed)?;
            Ok((cert.pem(), Some(Zeroizing::new(leaf_key.serialize_pem()))))
        }
        LeafKey::Spki(der) => {
            let public_key = rcgen::SubjectPublicKeyInfo::from_der(der).map_err(|e| {
                TrustError::certificate(format!("invalid stored public key: {}", e))
            })?;
            let cert = params
                .signed_by(&public_key, &issuer)
                .map_err(signing_failed)?;
            Ok((cert.pem(), None))
        }
        LeafKey::Csr(csr_pem) => {
            // Only the key is taken from the CSR; everything else is ours
            let mut csr = CertificateSigningRequestParams::from_pem(csr_pem)
                .map_err(|e| TrustError::invalid_request(format!("failed to parse CSR: {}", e)))?;
            csr.params = params;
            let cert = csr.signed_by(&issuer).map_err(signing_failed)?;
            Ok((cert.pem(), None))
        }
    }
}

/// Fields extracted from a parsed certificate.
#[derive(Debug, Clone)]
pub(crate) struct CertificateFacts {
    pub subject: String,
    pub serial: u64,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub spki_der: Vec<u8>,
    pub ed25519_key: Option<[u8; 32]>,
    pub server_auth: bool,
    pub client_auth: bool,
    /// Basic constraints mark the certificate as a CA
    pub is_ca: bool,
}

impl CertificateFacts {
    pub fn from_der(der: &[u8]) -> TrustResult<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| TrustError::certificate(format!("failed to parse certificate: {}", e)))?;

        let subject = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or("")
            .to_string();

        let serial = serial_from_raw(cert.raw_serial())
            .ok_or_else(|| TrustError::certificate("serial number out of range"))?;

        let (server_auth, client_auth) = match cert.extended_key_usage() {
            Ok(Some(eku)) => (eku.value.server_auth, eku.value.client_auth),
            _ => (false, false),
        };
        let is_ca = matches!(cert.basic_constraints(), Ok(Some(bc)) if bc.value.ca);

        let spki = cert.public_key();
        let key_bytes: &[u8] = &spki.subject_public_key.data;
        let ed25519_key = if spki.algorithm.algorithm.to_id_string() == ED25519_OID {
            key_bytes.try_into().ok()
        } else {
            None
        };

        Ok(Self {
            subject,
            serial,
            not_before: from_unix(cert.validity().not_before.timestamp())?,
            not_after: from_unix(cert.validity().not_after.timestamp())?,
            spki_der: spki.raw.to_vec(),
            ed25519_key,
            server_auth,
            client_auth,
            is_ca,
        })
    }

    pub fn from_pem(pem: &str) -> TrustResult<Self> {
        Self::from_der(&parse_pem(pem)?)
    }
}

/// Check that `leaf_der` was issued and signed by `root_der`.
pub(crate) fn issued_by(leaf_der: &[u8], root_der: &[u8]) -> Result<(), String> {
    let (_, leaf) = X509Certificate::from_der(leaf_der)
        .map_err(|e| format!("failed to parse certificate: {}", e))?;
    let (_, root) = X509Certificate::from_der(root_der)
        .map_err(|e| format!("failed to parse root certificate: {}", e))?;

    if leaf.issuer().as_raw() != root.subject().as_raw() {
        return Err("issuer does not match trust anchor".to_string());
    }
    leaf.verify_signature(Some(root.public_key()))
        .map_err(|_| "signature verification failed".to_string())
}

/// Subject identities are lowercase DNS names.
pub fn validate_subject(subject: &str) -> TrustResult<()> {
    let invalid = |why: &str| {
        Err(TrustError::invalid_request(format!(
            "invalid subject identity '{}': {}",
            subject, why
        )))
    };

    if subject.is_empty() || subject.len() > 253 {
        return invalid("must be 1-253 characters");
    }
    for label in subject.split('.') {
        if label.is_empty() || label.len() > 63 {
            return invalid("labels must be 1-63 characters");
        }
        if !label
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return invalid("labels may only contain a-z, 0-9 and '-'");
        }
        if label.starts_with('-') || label.ends_with('-') {
            return invalid("labels may not start or end with '-'");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn window(days: i64) -> (DateTime<Utc>, DateTime<Utc>) {
        let now = whole_seconds(Utc::now());
        (now, now + Duration::days(days))
    }

    #[test]
    fn test_root_is_self_issued() {
        let (nb, na) = window(365);
        let root = build_root("Test Root", "keyfleet", 1, nb, na).unwrap();
        assert!(root.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(root.key_pem.contains("BEGIN PRIVATE KEY"));

        let der = parse_pem(&root.cert_pem).unwrap();
        assert!(issued_by(&der, &der).is_ok());

        let facts = CertificateFacts::from_der(&der).unwrap();
        assert_eq!(facts.serial, 1);
        assert_eq!(facts.not_before, nb);
        assert_eq!(facts.not_after, na);
        assert!(facts.is_ca);
    }

    #[test]
    fn test_leaf_roles_differ_in_eku() {
        let (nb, na) = window(365);
        let root = build_root("Test Root", "keyfleet", 1, nb, na).unwrap();

        for (role, server, client) in [(CertRole::Server, true, false), (CertRole::Client, false, true)] {
            let spec = LeafSpec {
                subject: "host1.example",
                organization: "keyfleet",
                role,
                serial: 300,
                not_before: nb,
                not_after: nb + Duration::days(90),
            };
            let (pem, key) = sign_leaf(&spec, LeafKey::Generate, &root.cert_pem, &root.key_pem).unwrap();
            assert!(key.is_some());

            let facts = CertificateFacts::from_pem(&pem).unwrap();
            assert_eq!(facts.subject, "host1.example");
            assert_eq!(facts.serial, 300);
            assert_eq!((facts.server_auth, facts.client_auth), (server, client));
            assert!(facts.ed25519_key.is_some());
            assert!(!facts.is_ca);
        }
    }

    #[test]
    fn test_reissue_keeps_public_key() {
        let (nb, na) = window(365);
        let root = build_root("Test Root", "keyfleet", 1, nb, na).unwrap();
        let spec = LeafSpec {
            subject: "escrow-a.example",
            organization: "keyfleet",
            role: CertRole::Server,
            serial: 2,
            not_before: nb,
            not_after: nb + Duration::days(30),
        };
        let (pem, _) = sign_leaf(&spec, LeafKey::Generate, &root.cert_pem, &root.key_pem).unwrap();
        let original = CertificateFacts::from_pem(&pem).unwrap();

        let other_root = build_root("Test Root", "keyfleet", 2, nb, na).unwrap();
        let spec = LeafSpec { serial: 3, ..spec };
        let (reissued, key) = sign_leaf(
            &spec,
            LeafKey::Spki(&original.spki_der),
            &other_root.cert_pem,
            &other_root.key_pem,
        )
        .unwrap();
        assert!(key.is_none());

        let facts = CertificateFacts::from_pem(&reissued).unwrap();
        assert_eq!(facts.spki_der, original.spki_der);
        assert_eq!(facts.ed25519_key, original.ed25519_key);

        // Signed by the new root only
        let leaf_der = parse_pem(&reissued).unwrap();
        assert!(issued_by(&leaf_der, &parse_pem(&other_root.cert_pem).unwrap()).is_ok());
        assert!(issued_by(&leaf_der, &parse_pem(&root.cert_pem).unwrap()).is_err());
    }

    #[test]
    fn test_subject_validation() {
        assert!(validate_subject("host1.example").is_ok());
        assert!(validate_subject("escrow-a").is_ok());
        for bad in ["", "Host1.example", "-host.example", "host..example", "host_1.example", "a b"] {
            assert!(validate_subject(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn test_serial_encoding() {
        assert_eq!(serial_from_raw(&[0x00, 0x80]), Some(128));
        assert_eq!(serial_from_raw(&[0x01, 0x00]), Some(256));
        assert_eq!(serial_from_raw(&[0x01; 9]), None);
    }
}
