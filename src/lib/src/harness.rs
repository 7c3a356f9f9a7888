//! End-to-end mutual-TLS exercise
//!
//! [`Harness::run`] issues a self-signed client certificate for the given
//! signer and a throwaway software identity for the server, starts an
//! [`EchoServer`], and then dials it `iterations` times in sequence. Each
//! iteration walks the connection state machine:
//!
//! ```text
//! Idle ──► Connecting ──► HandshakeInFlight ──► Connected ──► Closed
//!               │                 │                  │
//!               └─────────────────┴──────────────────┴──► Failed
//! ```
//!
//! The client signer runs during `HandshakeInFlight`, when the server asks
//! for the client certificate. The run stops at the first failed iteration.

use crate::error::TpmTlsError;
use crate::issuer::{
    issue_self_signed, Certificate, CertificateTemplate, DEFAULT_ORGANIZATION, DEFAULT_VALIDITY,
};
use crate::server::EchoServer;
use crate::signer::{KeySigner, SoftwareKey};
use crate::tls::{self, TlsIdentity};
use rustls::{ClientConfig, ClientConnection, StreamOwned};
use rustls_pki_types::ServerName;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use time::Duration;

pub const DEFAULT_ITERATIONS: usize = 1000;
pub const DEFAULT_MESSAGE: &str = "hi";
pub const DEFAULT_READ_BUFFER_SIZE: usize = 1024;
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:0";
pub const DEFAULT_SERVER_NAME: &str = "localhost";
pub const DEFAULT_CLIENT_SUBJECT: &str = "tpmtls-client";
pub const DEFAULT_SERVER_SUBJECT: &str = "tpmtls-server";

/// Harness parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessConfig {
    pub iterations: usize,
    /// Payload each iteration writes and expects back
    pub message: Vec<u8>,
    pub read_buffer_size: usize,
    pub listen_addr: String,
    /// Name the client sends in SNI; also the server certificate's DNS name
    pub server_name: String,
    pub client_subject: String,
    pub server_subject: String,
    pub organization: Option<String>,
    pub validity: Duration,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            iterations: DEFAULT_ITERATIONS,
            message: DEFAULT_MESSAGE.as_bytes().to_vec(),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            server_name: DEFAULT_SERVER_NAME.to_string(),
            client_subject: DEFAULT_CLIENT_SUBJECT.to_string(),
            server_subject: DEFAULT_SERVER_SUBJECT.to_string(),
            organization: Some(DEFAULT_ORGANIZATION.to_string()),
            validity: DEFAULT_VALIDITY,
        }
    }
}

impl HarnessConfig {
    pub fn with_iterations(mut self, iterations: usize) -> Self {
        self.iterations = iterations;
        self
    }

    pub fn with_message(mut self, message: impl Into<Vec<u8>>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    pub fn with_listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.listen_addr = addr.into();
        self
    }

    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = name.into();
        self
    }

    pub fn with_client_subject(mut self, subject: impl Into<String>) -> Self {
        self.client_subject = subject.into();
        self
    }

    pub fn with_organization(mut self, organization: Option<String>) -> Self {
        self.organization = organization;
        self
    }

    pub fn with_validity(mut self, validity: Duration) -> Self {
        self.validity = validity;
        self
    }

    fn validate(&self) -> Result<(), TpmTlsError> {
        if self.message.is_empty() {
            return Err(TpmTlsError::InvalidArgument(
                "echo message must not be empty".to_string(),
            ));
        }
        if self.message.len() > self.read_buffer_size {
            return Err(TpmTlsError::InvalidArgument(format!(
                "message of {} bytes does not fit the {} byte read buffer",
                self.message.len(),
                self.read_buffer_size
            )));
        }
        Ok(())
    }
}

/// Where an iteration is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    HandshakeInFlight,
    Connected,
    Closed,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::HandshakeInFlight => "handshake in flight",
            ConnectionState::Connected => "connected",
            ConnectionState::Closed => "closed",
            ConnectionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// The iteration that ended a run
#[derive(Debug)]
pub struct IterationFailure {
    /// Zero-based iteration index
    pub iteration: usize,
    /// State the connection was in when the error occurred
    pub state: ConnectionState,
    pub error: TpmTlsError,
}

impl fmt::Display for IterationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "iteration {} failed while {}: {}",
            self.iteration, self.state, self.error
        )
    }
}

/// Outcome of a harness run
#[derive(Debug)]
pub struct HarnessReport {
    /// Certificate the client presented
    pub client_certificate: Certificate,
    pub completed: usize,
    pub failure: Option<IterationFailure>,
}

impl HarnessReport {
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }
}

/// One client connection, tracking its state
struct Iteration {
    state: ConnectionState,
}

impl Iteration {
    fn new() -> Self {
        Self {
            state: ConnectionState::Idle,
        }
    }

    fn fail(&mut self, error: TpmTlsError) -> (ConnectionState, TpmTlsError) {
        let at = self.state;
        self.state = ConnectionState::Failed;
        (at, error)
    }

    /// Fail with an I/O error, classified by the current state.
    ///
    /// While the handshake is unconfirmed, TLS alerts and dropped connections
    /// are negotiation failures.
    fn fail_io(&mut self, err: io::Error) -> (ConnectionState, TpmTlsError) {
        let error = if self.state == ConnectionState::HandshakeInFlight {
            match err.get_ref().and_then(|inner| inner.downcast_ref::<rustls::Error>()) {
                Some(tls) => TpmTlsError::HandshakeFailed(tls.to_string()),
                None => TpmTlsError::HandshakeFailed(format!(
                    "connection lost before the handshake was confirmed: {}",
                    err
                )),
            }
        } else {
            err.into()
        };
        self.fail(error)
    }

    fn run(
        &mut self,
        addr: SocketAddr,
        client_config: Arc<ClientConfig>,
        server_name: ServerName<'static>,
        config: &HarnessConfig,
    ) -> Result<(), (ConnectionState, TpmTlsError)> {
        self.state = ConnectionState::Connecting;
        let tcp = TcpStream::connect(addr).map_err(|e| self.fail(e.into()))?;

        self.state = ConnectionState::HandshakeInFlight;
        let conn = ClientConnection::new(client_config, server_name)
            .map_err(|e| self.fail(e.into()))?;
        let mut tls = StreamOwned::new(conn, tcp);
        while tls.conn.is_handshaking() {
            tls.conn
                .complete_io(&mut tls.sock)
                .map_err(|e| self.fail(TpmTlsError::HandshakeFailed(e.to_string())))?;
        }

        // The server verifies the client signature after the client side
        // completes, so the handshake stays in flight until bytes come back
        tls.write_all(&config.message)
            .and_then(|_| tls.flush())
            .map_err(|e| self.fail_io(e))?;

        let mut buf = vec![0u8; config.read_buffer_size];
        let mut received = 0;
        while received < config.message.len() {
            let n = tls.read(&mut buf[received..]).map_err(|e| self.fail_io(e))?;
            if n == 0 {
                let error = if self.state == ConnectionState::HandshakeInFlight {
                    TpmTlsError::HandshakeFailed(
                        "server closed the connection before confirming the handshake"
                            .to_string(),
                    )
                } else {
                    TpmTlsError::IOFailed(format!(
                        "connection closed after {} of {} echoed bytes",
                        received,
                        config.message.len()
                    ))
                };
                return Err(self.fail(error));
            }
            self.state = ConnectionState::Connected;
            received += n;
        }
        if buf[..received] != config.message[..] {
            return Err(self.fail(TpmTlsError::IOFailed(format!(
                "echo mismatch: sent {} bytes, got {} different bytes back",
                config.message.len(),
                received
            ))));
        }

        tls.conn.send_close_notify();
        tls.flush().map_err(|e| self.fail(e.into()))?;
        self.state = ConnectionState::Closed;
        Ok(())
    }
}

/// Drives repeated mutual-TLS echo round-trips
#[derive(Debug, Clone, Default)]
pub struct Harness {
    config: HarnessConfig,
}

impl Harness {
    pub fn new(config: HarnessConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Run the configured iterations with `client_signer` as the client identity.
    ///
    /// Setup failures (bad configuration, certificate issuance, server bind)
    /// are returned as errors. A failed iteration ends the run and is reported
    /// in the returned [`HarnessReport`].
    pub fn run(&self, client_signer: Arc<dyn KeySigner>) -> Result<HarnessReport, TpmTlsError> {
        let config = &self.config;
        config.validate()?;

        let server_name = ServerName::try_from(config.server_name.clone()).map_err(|e| {
            TpmTlsError::InvalidArgument(format!("server name '{}': {}", config.server_name, e))
        })?;

        let client_template = CertificateTemplate::client(config.client_subject.as_str())
            .with_organization(config.organization.clone())
            .with_validity(config.validity);
        let client_cert = issue_self_signed(client_signer.clone(), &client_template)?;
        let client_config =
            tls::client_config(&TlsIdentity::new(client_cert.clone(), client_signer))?;

        let server_signer: Arc<dyn KeySigner> = Arc::new(SoftwareKey::generate());
        let server_template = CertificateTemplate::server(
            config.server_subject.as_str(),
            config.server_name.as_str(),
        )
        .with_organization(config.organization.clone())
        .with_validity(config.validity);
        let server_cert = issue_self_signed(server_signer.clone(), &server_template)?;
        let server_config = tls::server_config(&TlsIdentity::new(server_cert, server_signer))?;

        let mut server = EchoServer::bind(config.listen_addr.as_str(), server_config)?;
        let addr = server.local_addr();
        log::info!("Running {} iterations against {}", config.iterations, addr);

        let mut report = HarnessReport {
            client_certificate: client_cert,
            completed: 0,
            failure: None,
        };
        for iteration in 0..config.iterations {
            let mut conn = Iteration::new();
            match conn.run(addr, client_config.clone(), server_name.clone(), config) {
                Ok(()) => {
                    report.completed += 1;
                    log::debug!("Iteration {} complete", iteration);
                }
                Err((state, error)) => {
                    log::warn!("Iteration {} failed while {}: {}", iteration, state, error);
                    report.failure = Some(IterationFailure {
                        iteration,
                        state,
                        error,
                    });
                    break;
                }
            }
        }

        server.shutdown();
        log::info!(
            "{} of {} iterations completed",
            report.completed,
            config.iterations
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = HarnessConfig::default();
        assert_eq!(config.iterations, 1000);
        assert_eq!(config.message, b"hi");
        assert_eq!(config.read_buffer_size, 1024);
        assert_eq!(config.listen_addr, "127.0.0.1:0");
        assert_eq!(config.server_name, "localhost");
        assert_eq!(config.validity, Duration::hours(1));
    }

    #[test]
    fn test_config_validation() {
        assert!(HarnessConfig::default().validate().is_ok());
        assert!(HarnessConfig::default().with_message("").validate().is_err());
        assert!(HarnessConfig::default()
            .with_message(vec![b'x'; 1025])
            .validate()
            .is_err());
        assert!(HarnessConfig::default()
            .with_message(vec![b'x'; 1024])
            .validate()
            .is_ok());
    }

    #[test]
    fn test_iteration_failure_display() {
        let failure = IterationFailure {
            iteration: 4,
            state: ConnectionState::HandshakeInFlight,
            error: TpmTlsError::HandshakeFailed("peer sent no certificates".to_string()),
        };
        assert_eq!(
            failure.to_string(),
            "iteration 4 failed while handshake in flight: Handshake failed: peer sent no certificates"
        );
    }

    #[test]
    fn test_failed_iteration_records_state() {
        let mut conn = Iteration::new();
        conn.state = ConnectionState::Connected;
        let (at, _) = conn.fail(TpmTlsError::IOFailed("reset".to_string()));
        assert_eq!(at, ConnectionState::Connected);
        assert_eq!(conn.state, ConnectionState::Failed);
    }

    #[test]
    fn test_alert_before_first_byte_is_handshake_failure() {
        let alert = || {
            io::Error::new(
                io::ErrorKind::InvalidData,
                rustls::Error::AlertReceived(rustls::AlertDescription::DecryptError),
            )
        };

        let mut conn = Iteration::new();
        conn.state = ConnectionState::HandshakeInFlight;
        let (at, error) = conn.fail_io(alert());
        assert_eq!(at, ConnectionState::HandshakeInFlight);
        assert!(matches!(error, TpmTlsError::HandshakeFailed(ref m) if m.contains("DecryptError")));

        let mut conn = Iteration::new();
        conn.state = ConnectionState::HandshakeInFlight;
        let (_, error) = conn.fail_io(io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(matches!(error, TpmTlsError::HandshakeFailed(_)));

        let mut conn = Iteration::new();
        conn.state = ConnectionState::Connected;
        let (at, error) = conn.fail_io(alert());
        assert_eq!(at, ConnectionState::Connected);
        assert!(matches!(error, TpmTlsError::IOFailed(_)));
    }

    #[test]
    fn test_run_with_software_client() {
        let harness = Harness::new(HarnessConfig::default().with_iterations(2));
        let report = harness.run(Arc::new(SoftwareKey::generate())).unwrap();
        assert!(report.is_success());
        assert_eq!(report.completed, 2);
    }
}
