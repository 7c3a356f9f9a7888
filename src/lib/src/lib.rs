//! Mutual TLS with a client key that never leaves the TPM.
//!
//! A primary ECDSA P-256 key is created inside a TPM 2.0 module, a
//! self-signed client certificate is issued for it, and that identity is used
//! to complete mutually authenticated TLS handshakes against a local echo
//! server. Every handshake signature is a TPM command round-trip.

#![forbid(unsafe_code)]

mod error;

/// Hardware command channels
///
/// The TPM 2.0 character device channel and, with the `simulator` feature,
/// an in-memory stand-in for machines without a TPM.
pub mod platform;

/// Signing capability shared by hardware and software keys
pub mod signer;

/// Hardware-backed signing key handle
pub mod key;

/// Self-signed X.509 certificate issuance
pub mod issuer;

pub mod tls;

/// Mutual-TLS echo server
pub mod server;

/// Handshake harness
///
/// Runs repeated connect / handshake / echo / close cycles against an
/// [`EchoServer`] and reports the first failure.
pub mod harness;

pub use error::*;
pub use harness::{ConnectionState, Harness, HarnessConfig, HarnessReport, IterationFailure};
pub use issuer::{issue_self_signed, Certificate, CertificateTemplate};
pub use key::{HardwareKey, KeyOptions};
pub use platform::{ChannelConfig, HardwareChannel, Hierarchy};
pub use server::EchoServer;
pub use signer::{KeySigner, PublicKey, Signature, SoftwareKey};

pub mod reexports {
    pub use {log, rcgen, rustls, thiserror};
}
