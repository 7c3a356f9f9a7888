//! End-to-end mutual-TLS tests
//!
//! The client key lives in the simulated TPM, so these run anywhere. The
//! hardware variant needs a real TPM and is marked `#[ignore]`.
//! Run with: `cargo test --test handshake -- --ignored --nocapture`

#![cfg(feature = "simulator")]

use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use tpmtls::platform::simulator::{CommandLog, SimulatedTpm, SimulatorProbe};
use tpmtls::{
    ConnectionState, EchoServer, Harness, HarnessConfig, HardwareKey, Hierarchy, KeyOptions,
    KeySigner, PublicKey, Signature, SoftwareKey, TpmTlsError,
};
use x509_parser::prelude::{FromDer, X509Certificate};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Create a key under the owner hierarchy in a fresh simulator
fn simulated_key() -> (Arc<HardwareKey>, SimulatorProbe, CommandLog) {
    let tpm = SimulatedTpm::new();
    let probe = tpm.probe();
    let log = tpm.command_log();
    let key = HardwareKey::create_with_channel(Box::new(tpm), &KeyOptions::new(Hierarchy::Owner))
        .expect("create key");
    (Arc::new(key), probe, log)
}

/// Signs the first `allowed` digests, then reports the device as gone
struct FlakySigner {
    inner: SoftwareKey,
    calls: AtomicUsize,
    allowed: usize,
}

impl KeySigner for FlakySigner {
    fn sign(&self, digest: &[u8]) -> Result<Signature, TpmTlsError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) >= self.allowed {
            return Err(TpmTlsError::HardwareUnavailable("device removed".to_string()));
        }
        self.inner.sign(digest)
    }

    fn public_key(&self) -> &PublicKey {
        self.inner.public_key()
    }
}

/// Certifies one key but signs handshakes with another
struct SwappedKeySigner {
    certified: SoftwareKey,
    other: SoftwareKey,
    calls: AtomicUsize,
}

impl KeySigner for SwappedKeySigner {
    fn sign(&self, digest: &[u8]) -> Result<Signature, TpmTlsError> {
        // First call is the certificate signature
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            self.certified.sign(digest)
        } else {
            self.other.sign(digest)
        }
    }

    fn public_key(&self) -> &PublicKey {
        self.certified.public_key()
    }
}

#[test]
fn test_three_iterations_with_simulated_tpm() {
    init_logging();
    let (key, probe, log) = simulated_key();

    let harness = Harness::new(
        HarnessConfig::default()
            .with_iterations(3)
            .with_client_subject("test-client"),
    );
    let report = harness.run(key.clone()).expect("harness setup");

    assert!(report.is_success(), "unexpected failure: {:?}", report.failure);
    assert_eq!(report.completed, 3);

    // One signature for the certificate, one per full handshake
    assert_eq!(log.count("TPM2_Sign"), 4);
    assert!(log.is_serialized());

    let (_, cert) = X509Certificate::from_der(report.client_certificate.der().as_ref()).unwrap();
    let cn = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok());
    assert_eq!(cn, Some("test-client"));
    assert_eq!(
        cert.public_key().subject_public_key.data.as_ref(),
        key.public_key().to_sec1_bytes().as_slice()
    );

    key.release().unwrap();
    assert!(!probe.is_open());
    assert_eq!(probe.flush_count(), 1);
}

#[test]
fn test_echo_message_lengths() {
    init_logging();
    let (key, _, _) = simulated_key();

    for len in [1usize, 2, 17, 512, 1023, 1024] {
        let message: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let harness = Harness::new(
            HarnessConfig::default()
                .with_iterations(1)
                .with_message(message),
        );
        let report = harness.run(key.clone()).expect("harness setup");
        assert!(
            report.is_success(),
            "echo of {} bytes failed: {:?}",
            len,
            report.failure
        );
    }
}

#[test]
fn test_signer_failure_stops_run() {
    init_logging();
    // Enough for the certificate and two handshakes
    let signer = Arc::new(FlakySigner {
        inner: SoftwareKey::generate(),
        calls: AtomicUsize::new(0),
        allowed: 3,
    });

    let harness = Harness::new(HarnessConfig::default().with_iterations(10));
    let report = harness.run(signer.clone()).expect("harness setup");

    assert_eq!(report.completed, 2);
    let failure = report.failure.expect("third handshake should fail");
    assert_eq!(failure.iteration, 2);
    assert_eq!(failure.state, ConnectionState::HandshakeInFlight);
    assert!(matches!(failure.error, TpmTlsError::HandshakeFailed(_)));

    // No further iterations were attempted
    assert_eq!(signer.calls.load(Ordering::SeqCst), 4);
}

#[test]
fn test_server_rejection_of_client_signature() {
    init_logging();
    let signer = Arc::new(SwappedKeySigner {
        certified: SoftwareKey::generate(),
        other: SoftwareKey::generate(),
        calls: AtomicUsize::new(0),
    });

    let harness = Harness::new(HarnessConfig::default().with_iterations(3));
    let report = harness.run(signer.clone()).expect("harness setup");

    assert_eq!(report.completed, 0);
    let failure = report.failure.expect("server must reject the handshake signature");
    assert_eq!(failure.iteration, 0);
    assert_eq!(failure.state, ConnectionState::HandshakeInFlight);
    assert!(
        matches!(failure.error, TpmTlsError::HandshakeFailed(_)),
        "unexpected error: {:?}",
        failure.error
    );
    assert_eq!(signer.calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_module_error_during_issuance() {
    init_logging();
    let (key, probe, _) = simulated_key();
    probe.fail_next_sign(0x0000_0921);

    let harness = Harness::new(HarnessConfig::default().with_iterations(1));
    match harness.run(key.clone()) {
        Err(TpmTlsError::CommandFailed(msg)) => assert!(msg.contains("0x00000921")),
        other => panic!("expected the module error, got {:?}", other.map(|r| r.completed)),
    }

    // The fault was one-shot
    let report = harness.run(key).expect("harness setup");
    assert!(report.is_success());
}

#[test]
fn test_oversized_message_rejected() {
    let (key, _, log) = simulated_key();
    let harness = Harness::new(
        HarnessConfig::default()
            .with_read_buffer_size(1024)
            .with_message(vec![b'x'; 1025]),
    );

    let result = harness.run(key);
    assert!(matches!(result, Err(TpmTlsError::InvalidArgument(_))));
    assert_eq!(log.count("TPM2_Sign"), 0);
}

#[test]
fn test_released_key_cannot_issue() {
    let (key, _, _) = simulated_key();
    key.release().unwrap();

    let harness = Harness::new(HarnessConfig::default().with_iterations(1));
    let result = harness.run(key);
    assert!(matches!(result, Err(TpmTlsError::HardwareUnavailable(_))));
}

#[test]
fn test_concurrent_harnesses_share_one_key() {
    init_logging();
    let tpm = SimulatedTpm::new().with_sign_latency(std::time::Duration::from_millis(1));
    let log = tpm.command_log();
    let key: Arc<HardwareKey> = Arc::new(
        HardwareKey::create_with_channel(Box::new(tpm), &KeyOptions::default()).unwrap(),
    );

    let runs: Vec<_> = (0..4)
        .map(|_| {
            let key = key.clone();
            thread::spawn(move || {
                let harness = Harness::new(HarnessConfig::default().with_iterations(5));
                harness.run(key).expect("harness setup")
            })
        })
        .collect();

    for run in runs {
        let report = run.join().unwrap();
        assert!(report.is_success(), "unexpected failure: {:?}", report.failure);
        assert_eq!(report.completed, 5);
    }

    assert_eq!(log.count("TPM2_Sign"), 4 * (1 + 5));
    assert!(log.is_serialized());
}

#[test]
fn test_server_shutdown_stops_listening() {
    init_logging();
    let server_key: Arc<dyn KeySigner> = Arc::new(SoftwareKey::generate());
    let cert = tpmtls::issue_self_signed(
        server_key.clone(),
        &tpmtls::CertificateTemplate::server("tpmtls-server", "localhost"),
    )
    .unwrap();
    let identity = tpmtls::tls::TlsIdentity::new(cert, server_key);
    let config = tpmtls::tls::server_config(&identity).unwrap();

    let mut server = EchoServer::bind("127.0.0.1:0", config).unwrap();
    let addr = server.local_addr();

    // A client that never speaks TLS only costs its own worker
    drop(TcpStream::connect(addr).unwrap());

    server.shutdown();
    server.shutdown();
    assert!(TcpStream::connect(addr).is_err());
}

#[test]
#[ignore]
fn test_hardware_tpm() {
    // Requires access to a TPM 2.0 device (TPMTLS_DEVICE or /dev/tpm0)
    init_logging();
    let config = tpmtls::ChannelConfig::from_env();
    let key = Arc::new(HardwareKey::create(&config, Hierarchy::Owner).expect("open TPM"));

    let harness = Harness::new(HarnessConfig::default().with_iterations(3));
    let report = harness.run(key.clone()).expect("harness setup");
    assert!(report.is_success(), "unexpected failure: {:?}", report.failure);
    assert_eq!(report.completed, 3);

    key.release().unwrap();
}
