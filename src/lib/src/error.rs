/// The tpmtls error type.
///
/// Hardware failures are not split into transient and permanent kinds: telling
/// a busy device from an absent one needs device-specific diagnostics, and
/// nothing here retries automatically.
#[derive(Debug, thiserror::Error)]
pub enum TpmTlsError {
    /// The hardware channel could not be opened, or was already released.
    #[error("Hardware unavailable: {0}")]
    HardwareUnavailable(String),

    /// The security module rejected or failed a command.
    #[error("Command failed: {0}")]
    CommandFailed(String),

    /// A certificate template could not be serialized.
    #[error("Encoding failed: {0}")]
    EncodingFailed(String),

    /// TLS negotiation failed, including signer errors surfaced through it.
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// Post-handshake read or write failed.
    #[error("I/O failed: {0}")]
    IOFailed(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unsupported key type")]
    UnsupportedKeyType,

    #[error("Internal error: [{0}]")]
    InternalError(String),
}

impl From<std::io::Error> for TpmTlsError {
    fn from(err: std::io::Error) -> Self {
        TpmTlsError::IOFailed(err.to_string())
    }
}

impl From<rcgen::Error> for TpmTlsError {
    fn from(err: rcgen::Error) -> Self {
        TpmTlsError::EncodingFailed(err.to_string())
    }
}

impl From<rustls::Error> for TpmTlsError {
    fn from(err: rustls::Error) -> Self {
        TpmTlsError::HandshakeFailed(err.to_string())
    }
}
