//! rustls glue: hardware-backed identities and accept-any peer verification
//!
//! Both sides of the demo present self-signed certificates, so chain
//! validation is switched off: any well-formed peer certificate is accepted.
//! Handshake signatures are still checked against the presented key, which
//! is what proves the peer holds it.
//!
//! Production deployments must verify the peer chain and hostname instead.

use crate::error::TpmTlsError;
use crate::issuer::Certificate;
use crate::signer::{KeyAlgorithm, KeySigner};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::{ResolvesClientCert, Resumption};
use rustls::crypto::{
    verify_tls12_signature, verify_tls13_signature, CryptoProvider, WebPkiSupportedAlgorithms,
};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::{ClientHello, NoServerSessionStorage, ResolvesServerCert};
use rustls::sign::{CertifiedKey, Signer, SigningKey};
use rustls::{
    ClientConfig, DigitallySignedStruct, DistinguishedName, Error as TlsError, ServerConfig,
    SignatureAlgorithm, SignatureScheme,
};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use x509_parser::prelude::{FromDer, X509Certificate};

/// The only scheme our keys can produce
const SCHEME: SignatureScheme = SignatureScheme::ECDSA_NISTP256_SHA256;

/// Crypto provider shared by both ends
pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// rustls view of a [`KeySigner`]
pub struct TlsSigningKey {
    signer: Arc<dyn KeySigner>,
}

impl TlsSigningKey {
    pub fn new(signer: Arc<dyn KeySigner>) -> Self {
        Self { signer }
    }
}

impl fmt::Debug for TlsSigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsSigningKey")
            .field("public_key", self.signer.public_key())
            .finish()
    }
}

impl SigningKey for TlsSigningKey {
    fn choose_scheme(&self, offered: &[SignatureScheme]) -> Option<Box<dyn Signer>> {
        if offered.contains(&SCHEME) {
            Some(Box::new(TlsDigestSigner {
                signer: self.signer.clone(),
            }))
        } else {
            log::debug!("Peer offered no usable signature scheme: {:?}", offered);
            None
        }
    }

    fn algorithm(&self) -> SignatureAlgorithm {
        match self.signer.public_key().algorithm() {
            KeyAlgorithm::EcdsaP256 => SignatureAlgorithm::ECDSA,
        }
    }
}

/// Hashes the handshake message and asks the key to sign the digest
struct TlsDigestSigner {
    signer: Arc<dyn KeySigner>,
}

impl fmt::Debug for TlsDigestSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsDigestSigner")
            .field("scheme", &SCHEME)
            .finish()
    }
}

impl Signer for TlsDigestSigner {
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, TlsError> {
        let digest = Sha256::digest(message);
        self.signer
            .sign(&digest)
            .map(|signature| signature.into_vec())
            .map_err(|e| {
                log::warn!("Handshake signature failed: {}", e);
                TlsError::General(format!("signing failed: {}", e))
            })
    }

    fn scheme(&self) -> SignatureScheme {
        SCHEME
    }
}

/// A certificate and the key that signs for it
#[derive(Clone)]
pub struct TlsIdentity {
    certificate: Certificate,
    certified_key: Arc<CertifiedKey>,
}

impl TlsIdentity {
    pub fn new(certificate: Certificate, signer: Arc<dyn KeySigner>) -> Self {
        let key: Arc<dyn SigningKey> = Arc::new(TlsSigningKey::new(signer));
        let certified_key = Arc::new(CertifiedKey::new(vec![certificate.der().clone()], key));
        Self {
            certificate,
            certified_key,
        }
    }

    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    pub fn resolver(&self) -> Arc<StaticCertResolver> {
        Arc::new(StaticCertResolver {
            certified_key: self.certified_key.clone(),
        })
    }
}

impl fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsIdentity")
            .field("certificate", &self.certificate)
            .finish_non_exhaustive()
    }
}

/// Presents the same identity for every handshake, on either side
#[derive(Debug)]
pub struct StaticCertResolver {
    certified_key: Arc<CertifiedKey>,
}

impl ResolvesClientCert for StaticCertResolver {
    fn resolve(
        &self,
        _root_hint_subjects: &[&[u8]],
        sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        if !sigschemes.contains(&SCHEME) {
            log::warn!("Server does not accept {:?}, sending no client certificate", SCHEME);
            return None;
        }
        log::debug!("Presenting client certificate");
        Some(self.certified_key.clone())
    }

    fn has_certs(&self) -> bool {
        true
    }
}

impl ResolvesServerCert for StaticCertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.certified_key.clone())
    }
}

fn log_peer(role: &str, end_entity: &CertificateDer<'_>) -> Result<(), TlsError> {
    let (_, cert) = X509Certificate::from_der(end_entity.as_ref())
        .map_err(|_| TlsError::InvalidCertificate(rustls::CertificateError::BadEncoding))?;
    log::debug!("Accepted {} certificate for '{}'", role, cert.subject());
    Ok(())
}

/// Accepts any well-formed server certificate without chain or name checks
pub struct AcceptAnyServerCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl AcceptAnyServerCert {
    pub fn new(provider: &CryptoProvider) -> Self {
        Self {
            algorithms: provider.signature_verification_algorithms,
        }
    }
}

impl fmt::Debug for AcceptAnyServerCert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcceptAnyServerCert").finish()
    }
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, TlsError> {
        log_peer("server", end_entity)?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Requires a client certificate but accepts any well-formed one
pub struct AcceptAnyClientCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl AcceptAnyClientCert {
    pub fn new(provider: &CryptoProvider) -> Self {
        Self {
            algorithms: provider.signature_verification_algorithms,
        }
    }
}

impl fmt::Debug for AcceptAnyClientCert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcceptAnyClientCert").finish()
    }
}

impl ClientCertVerifier for AcceptAnyClientCert {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, TlsError> {
        log_peer("client", end_entity)?;
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Client configuration presenting `identity` and accepting any server
pub fn client_config(identity: &TlsIdentity) -> Result<Arc<ClientConfig>, TpmTlsError> {
    let provider = crypto_provider();
    let verifier = Arc::new(AcceptAnyServerCert::new(&provider));
    let mut config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_client_cert_resolver(identity.resolver());
    // Every handshake must be a full one so the client key signs each time
    config.resumption = Resumption::disabled();
    Ok(Arc::new(config))
}

/// Server configuration presenting `identity` and requiring a client certificate
pub fn server_config(identity: &TlsIdentity) -> Result<Arc<ServerConfig>, TpmTlsError> {
    let provider = crypto_provider();
    let verifier = Arc::new(AcceptAnyClientCert::new(&provider));
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_client_cert_verifier(verifier)
        .with_cert_resolver(identity.resolver());
    config.session_storage = Arc::new(NoServerSessionStorage {});
    config.send_tls13_tickets = 0;
    Ok(Arc::new(config))
}
