/// Hardware command channel to a security module
///
/// This module defines the narrow seam between the signing key abstraction and
/// the device that actually holds the private key.
///
/// # Architecture
///
/// ```text
/// ┌─────────────────────┐
/// │    HardwareKey      │  (crate::key)
/// └──────────┬──────────┘
///            │ create_primary / sign / flush_context / close
///            ▼
/// ┌─────────────────────┐
/// │  HardwareChannel    │  ◄─── Trait (this file)
/// │      (trait)        │
/// └──────────┬──────────┘
///            │
///      ┌─────┴──────┐
///      ▼            ▼
///   TPM 2.0     Simulated
/// (tss-esapi)     TPM
/// ```
///
/// Channels speak in the module's native vocabulary: raw public-area
/// coordinates and raw signature integers. Turning those into standard
/// encodings is the key handle's job, via [`RawPublicKey::decode`] and
/// [`RawSignature::normalize`].
use crate::error::TpmTlsError;
use crate::signer::{left_pad, PublicKey, Signature, P256_FIELD_SIZE};
use std::fmt;
use std::path::PathBuf;

#[cfg(feature = "tpm")]
pub mod tpm2;

#[cfg(feature = "simulator")]
pub mod simulator;

/// Default TPM character device
pub const DEFAULT_DEVICE_PATH: &str = "/dev/tpm0";

/// Environment variable overriding the device path
pub const DEVICE_PATH_ENV: &str = "TPMTLS_DEVICE";

/// Handle to an object loaded inside the security module
///
/// The value has no meaning outside the session that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectHandle(u32);

impl ObjectHandle {
    pub fn from_raw(value: u32) -> Self {
        ObjectHandle(value)
    }

    pub fn as_raw(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Root of trust a primary key is created under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Hierarchy {
    #[default]
    Owner,
    Endorsement,
    Platform,
    Null,
}

impl Hierarchy {
    /// TPM permanent handle of the hierarchy
    pub fn handle(&self) -> u32 {
        match self {
            Hierarchy::Owner => 0x4000_0001,
            Hierarchy::Null => 0x4000_0007,
            Hierarchy::Endorsement => 0x4000_000B,
            Hierarchy::Platform => 0x4000_000C,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Hierarchy::Owner => "owner",
            Hierarchy::Endorsement => "endorsement",
            Hierarchy::Platform => "platform",
            Hierarchy::Null => "null",
        }
    }
}

impl fmt::Display for Hierarchy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Hierarchy {
    type Err = TpmTlsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "owner" | "o" => Ok(Hierarchy::Owner),
            "endorsement" | "e" => Ok(Hierarchy::Endorsement),
            "platform" | "p" => Ok(Hierarchy::Platform),
            "null" | "n" => Ok(Hierarchy::Null),
            _ => Err(TpmTlsError::InvalidArgument(format!(
                "unknown hierarchy '{}', expected owner, endorsement, platform or null",
                s
            ))),
        }
    }
}

/// TPMA_OBJECT attribute bits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectAttributes(u32);

impl ObjectAttributes {
    pub const FIXED_TPM: Self = Self(1 << 1);
    pub const FIXED_PARENT: Self = Self(1 << 4);
    pub const SENSITIVE_DATA_ORIGIN: Self = Self(1 << 5);
    pub const USER_WITH_AUTH: Self = Self(1 << 6);
    pub const NO_DA: Self = Self(1 << 10);
    pub const RESTRICTED: Self = Self(1 << 16);
    pub const DECRYPT: Self = Self(1 << 17);
    pub const SIGN: Self = Self(1 << 18);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(&self) -> u32 {
        self.0
    }
}

/// Elliptic curves a key template can name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EccCurve {
    NistP256,
}

impl EccCurve {
    /// TPM_ECC_CURVE identifier
    pub fn id(&self) -> u16 {
        match self {
            EccCurve::NistP256 => 0x0003,
        }
    }
}

/// Parameters of a primary key to create
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyTemplate {
    pub curve: EccCurve,
    pub attributes: ObjectAttributes,
}

impl KeyTemplate {
    /// ECDSA P-256 / SHA-256 signing key.
    ///
    /// No authorization policy; use requires the key's auth value
    /// (`userWithAuth`).
    pub fn ecdsa_p256_signing() -> Self {
        Self {
            curve: EccCurve::NistP256,
            attributes: ObjectAttributes::SIGN
                .union(ObjectAttributes::SENSITIVE_DATA_ORIGIN)
                .union(ObjectAttributes::USER_WITH_AUTH),
        }
    }
}

impl Default for KeyTemplate {
    fn default() -> Self {
        Self::ecdsa_p256_signing()
    }
}

/// Public area of a created key, as the module reports it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawPublicKey {
    Ecc {
        curve_id: u16,
        x: Vec<u8>,
        y: Vec<u8>,
    },
    Rsa {
        modulus: Vec<u8>,
        exponent: u32,
    },
}

impl RawPublicKey {
    /// Decode into a standard public key representation
    pub fn decode(&self) -> Result<PublicKey, TpmTlsError> {
        match self {
            RawPublicKey::Ecc { curve_id, x, y } if *curve_id == EccCurve::NistP256.id() => {
                PublicKey::from_ecc_coordinates(x, y).map_err(|e| {
                    TpmTlsError::CommandFailed(format!(
                        "module returned an unusable EC point: {}",
                        e
                    ))
                })
            }
            RawPublicKey::Ecc { curve_id, .. } => Err(TpmTlsError::CommandFailed(format!(
                "module created a key on unsupported curve {:#06x}",
                curve_id
            ))),
            RawPublicKey::Rsa { .. } => Err(TpmTlsError::CommandFailed(
                "module created an RSA key, only ECC signing keys are supported".to_string(),
            )),
        }
    }
}

/// Signature as produced by the module
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawSignature {
    /// ECDSA (R, S) as big-endian integers
    EllipticCurve { r: Vec<u8>, s: Vec<u8> },
    /// RSASSA / RSAPSS signature bytes
    Integer { bytes: Vec<u8> },
}

impl RawSignature {
    /// Convert into the encoding the verification layer expects.
    ///
    /// EC signatures become a DER `ECDSA-Sig-Value`; integer factorization
    /// signatures are already in their standard form.
    pub fn normalize(self) -> Result<Signature, TpmTlsError> {
        match self {
            RawSignature::EllipticCurve { r, s } => {
                let mut rs = left_pad(&r, P256_FIELD_SIZE)
                    .map_err(|e| TpmTlsError::CommandFailed(format!("signature R: {}", e)))?;
                rs.extend_from_slice(
                    &left_pad(&s, P256_FIELD_SIZE)
                        .map_err(|e| TpmTlsError::CommandFailed(format!("signature S: {}", e)))?,
                );
                let sig = p256::ecdsa::Signature::from_slice(&rs).map_err(|_| {
                    TpmTlsError::CommandFailed("module returned an invalid (R, S) pair".to_string())
                })?;
                Ok(Signature::from_bytes(sig.to_der().as_bytes().to_vec()))
            }
            RawSignature::Integer { bytes } => Ok(Signature::from_bytes(bytes)),
        }
    }
}

/// Where to find the security module
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Character device of the module
    pub device_path: PathBuf,
    /// Authorization value of the hierarchy keys are created under
    pub hierarchy_auth: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            device_path: PathBuf::from(DEFAULT_DEVICE_PATH),
            hierarchy_auth: String::new(),
        }
    }
}

impl ChannelConfig {
    pub fn new(device_path: impl Into<PathBuf>) -> Self {
        Self {
            device_path: device_path.into(),
            ..Default::default()
        }
    }

    /// Default configuration, with the device path taken from `TPMTLS_DEVICE` if set
    pub fn from_env() -> Self {
        match std::env::var(DEVICE_PATH_ENV) {
            Ok(path) if !path.is_empty() => Self::new(path),
            _ => Self::default(),
        }
    }

    pub fn with_hierarchy_auth(mut self, auth: impl Into<String>) -> Self {
        self.hierarchy_auth = auth.into();
        self
    }
}

/// Command/response session with a security module
///
/// A channel is a single-threaded resource: every method takes `&mut self` and
/// callers that share one must serialize access themselves.
///
/// # Errors
///
/// - `TpmTlsError::HardwareUnavailable` if the session is closed or the
///   device cannot be reached
/// - `TpmTlsError::CommandFailed` if the module rejects a command
pub trait HardwareChannel: Send {
    /// Human-readable name, for logs
    fn name(&self) -> &str;

    /// Create a primary key under `hierarchy` with the given template.
    ///
    /// `auth` becomes the key's authorization value.
    fn create_primary(
        &mut self,
        hierarchy: Hierarchy,
        template: &KeyTemplate,
        auth: &str,
    ) -> Result<(ObjectHandle, RawPublicKey), TpmTlsError>;

    /// Sign a digest with a loaded key using the key's default scheme
    fn sign(
        &mut self,
        handle: ObjectHandle,
        auth: &str,
        digest: &[u8],
    ) -> Result<RawSignature, TpmTlsError>;

    /// Unload an object from the module
    fn flush_context(&mut self, handle: ObjectHandle) -> Result<(), TpmTlsError>;

    /// End the session. Further commands fail with `HardwareUnavailable`.
    fn close(&mut self) -> Result<(), TpmTlsError>;
}

/// Open a session to the TPM device named by `config`
#[cfg(feature = "tpm")]
pub fn open_device(config: &ChannelConfig) -> Result<Box<dyn HardwareChannel>, TpmTlsError> {
    let device = tpm2::Tpm2Device::open(config)?;
    log::info!("Opened TPM 2.0 device {}", config.device_path.display());
    Ok(Box::new(device))
}

#[cfg(not(feature = "tpm"))]
pub fn open_device(config: &ChannelConfig) -> Result<Box<dyn HardwareChannel>, TpmTlsError> {
    Err(TpmTlsError::HardwareUnavailable(format!(
        "{}: built without TPM support",
        config.device_path.display()
    )))
}
