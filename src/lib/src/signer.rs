//! The signing capability shared by hardware-backed and software keys.
//!
//! Certificate issuance and the TLS glue only ever see a [`KeySigner`]: they
//! hand it a digest and get back a signature in the standard encoding, and they
//! can ask for the public key. Where the private key lives is not their
//! business.

use crate::error::TpmTlsError;
use ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use p256::ecdsa::{SigningKey, VerifyingKey};
use p256::pkcs8::EncodePublicKey;
use std::fmt;

/// Length of a NIST P-256 field element in bytes.
pub const P256_FIELD_SIZE: usize = 32;

/// Something that can prove possession of a private key.
///
/// `sign` takes an already computed message digest (SHA-256 for every key this
/// crate creates) and returns the signature in the encoding the verification
/// layer expects: a DER `ECDSA-Sig-Value` for EC keys.
pub trait KeySigner: Send + Sync {
    /// Sign a message digest.
    fn sign(&self, digest: &[u8]) -> Result<Signature, TpmTlsError>;

    /// The public half of the signing key.
    fn public_key(&self) -> &PublicKey;
}

/// Algorithm family of a [`PublicKey`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAlgorithm {
    /// ECDSA over NIST P-256
    EcdsaP256,
}

/// Public key of a signer
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey {
    key: VerifyingKey,
}

impl PublicKey {
    /// Build a public key from big-endian affine coordinates.
    ///
    /// Coordinates shorter than a field element are left-padded, as hardware
    /// modules are free to strip leading zero bytes.
    pub fn from_ecc_coordinates(x: &[u8], y: &[u8]) -> Result<Self, TpmTlsError> {
        let mut sec1 = Vec::with_capacity(1 + 2 * P256_FIELD_SIZE);
        sec1.push(0x04);
        sec1.extend_from_slice(&left_pad(x, P256_FIELD_SIZE)?);
        sec1.extend_from_slice(&left_pad(y, P256_FIELD_SIZE)?);
        Self::from_sec1_bytes(&sec1)
    }

    /// Parse a SEC1-encoded point (compressed or uncompressed)
    pub fn from_sec1_bytes(bytes: &[u8]) -> Result<Self, TpmTlsError> {
        let key = VerifyingKey::from_sec1_bytes(bytes).map_err(|_| {
            TpmTlsError::InvalidArgument("not a valid P-256 public point".to_string())
        })?;
        Ok(Self { key })
    }

    pub fn algorithm(&self) -> KeyAlgorithm {
        KeyAlgorithm::EcdsaP256
    }

    /// Uncompressed SEC1 encoding (`04 || X || Y`)
    pub fn to_sec1_bytes(&self) -> Vec<u8> {
        self.key.to_encoded_point(false).as_bytes().to_vec()
    }

    /// DER-encoded SubjectPublicKeyInfo
    pub fn to_spki_der(&self) -> Result<Vec<u8>, TpmTlsError> {
        self.key
            .to_public_key_der()
            .map(|doc| doc.as_bytes().to_vec())
            .map_err(|e| TpmTlsError::EncodingFailed(format!("SubjectPublicKeyInfo: {}", e)))
    }

    /// Verify a DER signature over a message digest.
    pub fn verify_digest(&self, digest: &[u8], signature: &Signature) -> Result<(), TpmTlsError> {
        let sig = p256::ecdsa::Signature::from_der(signature.as_bytes())
            .map_err(|_| TpmTlsError::InvalidArgument("malformed ECDSA signature".to_string()))?;
        self.key
            .verify_prehash(digest, &sig)
            .map_err(|_| TpmTlsError::InvalidArgument("signature does not verify".to_string()))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublicKey")
            .field("algorithm", &self.algorithm())
            .field("point", &hex_prefix(&self.to_sec1_bytes()))
            .finish()
    }
}

/// A signature in its standard wire encoding
#[derive(Clone, PartialEq, Eq)]
pub struct Signature(Vec<u8>);

impl Signature {
    /// Wrap bytes that are already in the standard encoding
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Signature(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.0
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({} bytes, {})", self.0.len(), hex_prefix(&self.0))
    }
}

/// Ephemeral in-memory P-256 key.
///
/// Used for the server identity, which does not need hardware protection.
pub struct SoftwareKey {
    signing_key: SigningKey,
    public_key: PublicKey,
}

impl SoftwareKey {
    /// Generate a fresh key from the OS random number generator
    pub fn generate() -> Self {
        let signing_key = SigningKey::random(&mut rand_core::OsRng);
        let public_key = PublicKey {
            key: *signing_key.verifying_key(),
        };
        Self {
            signing_key,
            public_key,
        }
    }
}

impl KeySigner for SoftwareKey {
    fn sign(&self, digest: &[u8]) -> Result<Signature, TpmTlsError> {
        let sig: p256::ecdsa::Signature = self
            .signing_key
            .sign_prehash(digest)
            .map_err(|e| TpmTlsError::InvalidArgument(format!("cannot sign digest: {}", e)))?;
        Ok(Signature(sig.to_der().as_bytes().to_vec()))
    }

    fn public_key(&self) -> &PublicKey {
        &self.public_key
    }
}

impl fmt::Debug for SoftwareKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftwareKey")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

/// Left-pad a big-endian integer to `len` bytes, dropping redundant leading zeros.
pub(crate) fn left_pad(value: &[u8], len: usize) -> Result<Vec<u8>, TpmTlsError> {
    let first = value.iter().position(|&b| b != 0).unwrap_or(value.len());
    let trimmed = &value[first..];
    if trimmed.len() > len {
        return Err(TpmTlsError::InvalidArgument(format!(
            "integer of {} bytes does not fit in {} bytes",
            trimmed.len(),
            len
        )));
    }
    let mut out = vec![0u8; len - trimmed.len()];
    out.extend_from_slice(trimmed);
    Ok(out)
}

fn hex_prefix(bytes: &[u8]) -> String {
    let mut out: String = bytes.iter().take(8).map(|b| format!("{:02x}", b)).collect();
    if bytes.len() > 8 {
        out.push_str("..");
    }
    out
}

/// Check that flipping any single bit of `digest` or `signature` breaks verification
#[cfg(test)]
pub(crate) fn assert_bit_flips_rejected(
    public_key: &PublicKey,
    digest: &[u8],
    signature: &Signature,
) {
    assert!(public_key.verify_digest(digest, signature).is_ok());

    for bit in 0..digest.len() * 8 {
        let mut flipped = digest.to_vec();
        flipped[bit / 8] ^= 1 << (bit % 8);
        assert!(
            public_key.verify_digest(&flipped, signature).is_err(),
            "digest bit {} flipped still verifies",
            bit
        );
    }

    let bytes = signature.as_bytes();
    for bit in 0..bytes.len() * 8 {
        let mut flipped = bytes.to_vec();
        flipped[bit / 8] ^= 1 << (bit % 8);
        assert!(
            public_key
                .verify_digest(digest, &Signature::from_bytes(flipped))
                .is_err(),
            "signature bit {} flipped still verifies",
            bit
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::{Digest, Sha256};

    #[test]
    fn test_software_sign_and_verify() {
        let key = SoftwareKey::generate();
        let digest = Sha256::digest(b"client hello transcript");

        let signature = key.sign(&digest).expect("sign");
        assert!(key.public_key().verify_digest(&digest, &signature).is_ok());
    }

    #[test]
    fn test_software_bit_flips_fail_verification() {
        let key = SoftwareKey::generate();
        let digest = Sha256::digest(b"client hello transcript");
        let signature = key.sign(&digest).unwrap();
        assert_eq!(digest.len() * 8, 256);
        assert_bit_flips_rejected(key.public_key(), &digest, &signature);
    }

    #[test]
    fn test_signature_is_der() {
        let key = SoftwareKey::generate();
        let digest = Sha256::digest(b"der please");
        let signature = key.sign(&digest).unwrap();

        // SEQUENCE { INTEGER r, INTEGER s }
        assert_eq!(signature.as_bytes()[0], 0x30);
        assert!(p256::ecdsa::Signature::from_der(signature.as_bytes()).is_ok());
    }

    #[test]
    fn test_verify_rejects_other_digest() {
        let key = SoftwareKey::generate();
        let signature = key.sign(&Sha256::digest(b"one")).unwrap();
        assert!(key
            .public_key()
            .verify_digest(&Sha256::digest(b"two"), &signature)
            .is_err());
    }

    #[test]
    fn test_public_key_coordinates_roundtrip() {
        let key = SoftwareKey::generate();
        let sec1 = key.public_key().to_sec1_bytes();
        assert_eq!(sec1.len(), 65);

        let rebuilt = PublicKey::from_ecc_coordinates(&sec1[1..33], &sec1[33..]).unwrap();
        assert_eq!(&rebuilt, key.public_key());
    }

    #[test]
    fn test_public_key_oversized_coordinates_are_trimmed() {
        // Redundant leading zero on X
        let key = SoftwareKey::generate();
        let sec1 = key.public_key().to_sec1_bytes();
        let mut x = vec![0u8];
        x.extend_from_slice(&sec1[1..33]);

        let rebuilt = PublicKey::from_ecc_coordinates(&x, &sec1[33..]).unwrap();
        assert_eq!(&rebuilt, key.public_key());
    }

    #[test]
    fn test_public_key_rejects_off_curve_point() {
        let result = PublicKey::from_ecc_coordinates(&[1u8; 32], &[2u8; 32]);
        assert!(result.is_err());
    }

    #[test]
    fn test_spki_der() {
        let key = SoftwareKey::generate();
        let spki = key.public_key().to_spki_der().unwrap();
        // SEQUENCE, then the uncompressed point at the tail
        assert_eq!(spki[0], 0x30);
        assert!(spki.ends_with(&key.public_key().to_sec1_bytes()));
    }

    #[test]
    fn test_left_pad() {
        assert_eq!(left_pad(&[1, 2], 4).unwrap(), vec![0, 0, 1, 2]);
        assert_eq!(left_pad(&[0, 0, 1], 2).unwrap(), vec![0, 1]);
        assert_eq!(left_pad(&[], 2).unwrap(), vec![0, 0]);
        assert!(left_pad(&[1, 2, 3], 2).is_err());
    }
}
