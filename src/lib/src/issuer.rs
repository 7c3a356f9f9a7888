//! Self-signed certificate issuance for any [`KeySigner`]
//!
//! The to-be-signed structure is encoded by `rcgen`; the signature comes from
//! the signer through a remote key pair adapter, so a hardware key never has
//! to export its private half.

use crate::error::TpmTlsError;
use crate::signer::KeySigner;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose, RemoteKeyPair, SerialNumber,
};
use rustls_pki_types::CertificateDer;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::{Arc, Mutex};
use time::{Duration, OffsetDateTime};

/// Organization placed in the subject when none is configured
pub const DEFAULT_ORGANIZATION: &str = "Acme Co";

/// Default certificate lifetime
pub const DEFAULT_VALIDITY: Duration = Duration::hours(1);

const SERIAL_LEN: usize = 16;

/// Key usage bits a template can request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyUsage {
    DigitalSignature,
    KeyEncipherment,
}

/// Extended key usage a template can request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtendedKeyUsage {
    ClientAuth,
    ServerAuth,
}

/// What to put in a self-signed certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateTemplate {
    /// Common name; also the issuer name
    pub subject_name: String,
    pub organization: Option<String>,
    /// Lifetime counted from the moment of issuance
    pub validity: Duration,
    pub key_usages: Vec<KeyUsage>,
    pub extended_key_usages: Vec<ExtendedKeyUsage>,
    /// DNS subject alternative names
    pub dns_names: Vec<String>,
}

impl CertificateTemplate {
    pub fn new(subject_name: impl Into<String>) -> Self {
        Self {
            subject_name: subject_name.into(),
            organization: Some(DEFAULT_ORGANIZATION.to_string()),
            validity: DEFAULT_VALIDITY,
            key_usages: vec![KeyUsage::DigitalSignature, KeyUsage::KeyEncipherment],
            extended_key_usages: Vec::new(),
            dns_names: Vec::new(),
        }
    }

    /// TLS client identity
    pub fn client(subject_name: impl Into<String>) -> Self {
        Self::new(subject_name).with_extended_key_usage(ExtendedKeyUsage::ClientAuth)
    }

    /// TLS server identity for `dns_name`
    pub fn server(subject_name: impl Into<String>, dns_name: impl Into<String>) -> Self {
        Self::new(subject_name)
            .with_extended_key_usage(ExtendedKeyUsage::ServerAuth)
            .with_dns_name(dns_name)
    }

    pub fn with_organization(mut self, organization: Option<String>) -> Self {
        self.organization = organization;
        self
    }

    pub fn with_validity(mut self, validity: Duration) -> Self {
        self.validity = validity;
        self
    }

    pub fn with_extended_key_usage(mut self, usage: ExtendedKeyUsage) -> Self {
        if !self.extended_key_usages.contains(&usage) {
            self.extended_key_usages.push(usage);
        }
        self
    }

    pub fn with_dns_name(mut self, name: impl Into<String>) -> Self {
        self.dns_names.push(name.into());
        self
    }

    fn validate(&self) -> Result<(), TpmTlsError> {
        if self.subject_name.trim().is_empty() {
            return Err(TpmTlsError::EncodingFailed(
                "certificate subject must not be empty".to_string(),
            ));
        }
        if self.validity <= Duration::ZERO {
            return Err(TpmTlsError::EncodingFailed(format!(
                "certificate validity must be positive, got {}",
                self.validity
            )));
        }
        Ok(())
    }

    fn to_params(
        &self,
        serial: &[u8],
        now: OffsetDateTime,
    ) -> Result<CertificateParams, TpmTlsError> {
        let mut params = CertificateParams::new(self.dns_names.clone())?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, self.subject_name.as_str());
        if let Some(organization) = &self.organization {
            dn.push(DnType::OrganizationName, organization.as_str());
        }
        params.distinguished_name = dn;

        params.serial_number = Some(SerialNumber::from_slice(serial));
        params.not_before = now;
        params.not_after = now + self.validity;
        params.is_ca = IsCa::ExplicitNoCa;

        params.key_usages = self
            .key_usages
            .iter()
            .map(|usage| match usage {
                KeyUsage::DigitalSignature => KeyUsagePurpose::DigitalSignature,
                KeyUsage::KeyEncipherment => KeyUsagePurpose::KeyEncipherment,
            })
            .collect();
        params.extended_key_usages = self
            .extended_key_usages
            .iter()
            .map(|usage| match usage {
                ExtendedKeyUsage::ClientAuth => ExtendedKeyUsagePurpose::ClientAuth,
                ExtendedKeyUsage::ServerAuth => ExtendedKeyUsagePurpose::ServerAuth,
            })
            .collect();

        Ok(params)
    }
}

/// An issued certificate
#[derive(Clone, PartialEq, Eq)]
pub struct Certificate {
    der: CertificateDer<'static>,
    serial: Vec<u8>,
    subject: String,
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
}

impl Certificate {
    pub fn der(&self) -> &CertificateDer<'static> {
        &self.der
    }

    pub fn serial(&self) -> &[u8] {
        &self.serial
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn not_before(&self) -> OffsetDateTime {
        self.not_before
    }

    pub fn not_after(&self) -> OffsetDateTime {
        self.not_after
    }

    /// PEM armoured form, for display
    pub fn to_pem(&self) -> String {
        pem::encode(&pem::Pem::new("CERTIFICATE", self.der.to_vec()))
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("subject", &self.subject)
            .field("serial", &hex(&self.serial))
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .field("der_len", &self.der.len())
            .finish()
    }
}

/// Bridges a [`KeySigner`] into rcgen's remote key interface.
///
/// rcgen hands over the full to-be-signed encoding; the digest is computed
/// here. Signer errors are parked in `failure` because rcgen can only report
/// an opaque remote key error.
struct RemoteSigner {
    signer: Arc<dyn KeySigner>,
    public_key: Vec<u8>,
    failure: Arc<Mutex<Option<TpmTlsError>>>,
}

impl RemoteKeyPair for RemoteSigner {
    fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    fn sign(&self, msg: &[u8]) -> Result<Vec<u8>, rcgen::Error> {
        let digest = Sha256::digest(msg);
        match self.signer.sign(&digest) {
            Ok(signature) => Ok(signature.into_vec()),
            Err(e) => {
                if let Ok(mut failure) = self.failure.lock() {
                    *failure = Some(e);
                }
                Err(rcgen::Error::RemoteKeyError)
            }
        }
    }

    fn algorithm(&self) -> &'static rcgen::SignatureAlgorithm {
        &rcgen::PKCS_ECDSA_P256_SHA256
    }
}

/// Issue a certificate for `signer`'s public key, signed by `signer` itself.
///
/// # Errors
///
/// - `TpmTlsError::EncodingFailed` for an empty subject, a non-positive
///   validity or an encoding failure
/// - whatever the signer reports if signing fails
pub fn issue_self_signed(
    signer: Arc<dyn KeySigner>,
    template: &CertificateTemplate,
) -> Result<Certificate, TpmTlsError> {
    template.validate()?;

    let mut serial = [0u8; SERIAL_LEN];
    getrandom::fill(&mut serial)
        .map_err(|e| TpmTlsError::InternalError(format!("random serial: {}", e)))?;

    let now = OffsetDateTime::now_utc();
    let params = template.to_params(&serial, now)?;
    let (not_before, not_after) = (params.not_before, params.not_after);

    let failure = Arc::new(Mutex::new(None));
    let remote = RemoteSigner {
        public_key: signer.public_key().to_sec1_bytes(),
        signer,
        failure: failure.clone(),
    };
    let key_pair = KeyPair::from_remote(Box::new(remote))?;

    let cert = match params.self_signed(&key_pair) {
        Ok(cert) => cert,
        Err(e) => {
            let parked = failure.lock().ok().and_then(|mut f| f.take());
            return Err(parked.unwrap_or_else(|| e.into()));
        }
    };

    log::info!(
        "Issued self-signed certificate for '{}' (serial {})",
        template.subject_name,
        hex(&serial)
    );

    Ok(Certificate {
        der: cert.der().clone(),
        serial: serial.to_vec(),
        subject: template.subject_name.clone(),
        not_before,
        not_after,
    })
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer::{PublicKey, Signature, SoftwareKey};
    use x509_parser::extensions::GeneralName;
    use x509_parser::prelude::{FromDer, X509Certificate};

    fn software_signer() -> Arc<dyn KeySigner> {
        Arc::new(SoftwareKey::generate())
    }

    struct FailingSigner {
        public_key: PublicKey,
    }

    impl KeySigner for FailingSigner {
        fn sign(&self, _digest: &[u8]) -> Result<Signature, TpmTlsError> {
            Err(TpmTlsError::CommandFailed("TPM2_Sign returned 0x00000921".to_string()))
        }

        fn public_key(&self) -> &PublicKey {
            &self.public_key
        }
    }

    #[test]
    fn test_issue_client_certificate() {
        let signer = software_signer();
        let cert =
            issue_self_signed(signer.clone(), &CertificateTemplate::client("test-client")).unwrap();
        let (_, parsed) = X509Certificate::from_der(cert.der().as_ref()).unwrap();

        let cn = parsed
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok());
        assert_eq!(cn, Some("test-client"));
        let org = parsed
            .subject()
            .iter_organization()
            .next()
            .and_then(|o| o.as_str().ok());
        assert_eq!(org, Some(DEFAULT_ORGANIZATION));
        assert_eq!(parsed.issuer().as_raw(), parsed.subject().as_raw());
        assert_eq!(cert.subject(), "test-client");
    }

    #[test]
    fn test_embedded_key_and_signature() {
        let signer = software_signer();
        let cert =
            issue_self_signed(signer.clone(), &CertificateTemplate::client("test-client")).unwrap();
        let (_, parsed) = X509Certificate::from_der(cert.der().as_ref()).unwrap();

        assert_eq!(
            parsed.public_key().subject_public_key.data.as_ref(),
            signer.public_key().to_sec1_bytes().as_slice()
        );

        let digest = Sha256::digest(parsed.tbs_certificate.as_ref());
        let signature = Signature::from_bytes(parsed.signature_value.data.to_vec());
        assert!(signer.public_key().verify_digest(&digest, &signature).is_ok());
    }

    #[test]
    fn test_usages_and_constraints() {
        let cert = issue_self_signed(software_signer(), &CertificateTemplate::client("c")).unwrap();
        let (_, parsed) = X509Certificate::from_der(cert.der().as_ref()).unwrap();

        let ku = parsed.key_usage().unwrap().unwrap().value;
        assert!(ku.digital_signature());
        assert!(ku.key_encipherment());
        assert!(!ku.key_cert_sign());

        let eku = parsed.extended_key_usage().unwrap().unwrap().value;
        assert!(eku.client_auth);
        assert!(!eku.server_auth);

        let bc = parsed.basic_constraints().unwrap().unwrap().value;
        assert!(!bc.ca);
    }

    #[test]
    fn test_server_certificate_names() {
        let template = CertificateTemplate::server("tpmtls-server", "localhost");
        let cert = issue_self_signed(software_signer(), &template).unwrap();
        let (_, parsed) = X509Certificate::from_der(cert.der().as_ref()).unwrap();

        let eku = parsed.extended_key_usage().unwrap().unwrap().value;
        assert!(eku.server_auth);

        let san = parsed.subject_alternative_name().unwrap().unwrap().value;
        assert!(san
            .general_names
            .iter()
            .any(|name| matches!(name, GeneralName::DNSName("localhost"))));
    }

    #[test]
    fn test_validity_window() {
        let template = CertificateTemplate::client("c").with_validity(Duration::minutes(5));
        let cert = issue_self_signed(software_signer(), &template).unwrap();
        assert_eq!(cert.not_after() - cert.not_before(), Duration::minutes(5));

        let (_, parsed) = X509Certificate::from_der(cert.der().as_ref()).unwrap();
        let validity = parsed.validity();
        assert_eq!(
            validity.not_after.timestamp() - validity.not_before.timestamp(),
            300
        );
        assert!(validity.is_valid());
    }

    #[test]
    fn test_serials_are_random() {
        let signer = software_signer();
        let a = issue_self_signed(signer.clone(), &CertificateTemplate::client("c")).unwrap();
        let b = issue_self_signed(signer, &CertificateTemplate::client("c")).unwrap();
        assert_eq!(a.serial().len(), 16);
        assert_ne!(a.serial(), b.serial());
    }

    #[test]
    fn test_without_organization() {
        let template = CertificateTemplate::client("bare").with_organization(None);
        let cert = issue_self_signed(software_signer(), &template).unwrap();
        let (_, parsed) = X509Certificate::from_der(cert.der().as_ref()).unwrap();
        assert_eq!(parsed.subject().iter_organization().count(), 0);
    }

    #[test]
    fn test_rejects_empty_subject() {
        let result = issue_self_signed(software_signer(), &CertificateTemplate::client(""));
        assert!(matches!(result, Err(TpmTlsError::EncodingFailed(_))));
    }

    #[test]
    fn test_rejects_zero_validity() {
        let template = CertificateTemplate::client("c").with_validity(Duration::ZERO);
        let result = issue_self_signed(software_signer(), &template);
        assert!(matches!(result, Err(TpmTlsError::EncodingFailed(_))));
    }

    #[test]
    fn test_signer_error_is_surfaced() {
        let signer: Arc<dyn KeySigner> = Arc::new(FailingSigner {
            public_key: SoftwareKey::generate().public_key().clone(),
        });
        let result = issue_self_signed(signer, &CertificateTemplate::client("c"));
        match result {
            Err(TpmTlsError::CommandFailed(msg)) => assert!(msg.contains("0x00000921")),
            other => panic!("expected the signer's error, got {:?}", other),
        }
    }

    #[test]
    fn test_pem_rendering() {
        let cert = issue_self_signed(software_signer(), &CertificateTemplate::client("c")).unwrap();
        let pem = cert.to_pem();
        assert!(pem.starts_with("-----BEGIN CERTIFICATE-----"));
        let parsed = ::pem::parse(&pem).unwrap();
        assert_eq!(parsed.contents(), cert.der().as_ref());
    }
}
