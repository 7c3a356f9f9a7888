//! TPM 2.0 device channel
//!
//! Commands go through the TSS2 Enhanced System API (`tss-esapi`) with the
//! device TCTI opened on the configured character device (`/dev/tpm0`, or
//! `/dev/tpmrm0` through the kernel resource manager). Authorization uses
//! the plain password session.
//!
//! Only the three commands a signing key needs are issued:
//! `TPM2_CreatePrimary`, `TPM2_Sign` and `TPM2_FlushContext`.

use super::{
    ChannelConfig, EccCurve, HardwareChannel, Hierarchy, KeyTemplate, ObjectAttributes,
    ObjectHandle, RawPublicKey, RawSignature,
};
use crate::error::TpmTlsError;
use std::path::PathBuf;
use std::str::FromStr;
use tss_esapi::attributes::ObjectAttributesBuilder;
use tss_esapi::constants::tss::{TPM2_RH_NULL, TPM2_ST_HASHCHECK};
use tss_esapi::handles::{KeyHandle, ObjectHandle as EsysHandle};
use tss_esapi::interface_types::algorithm::{HashingAlgorithm, PublicAlgorithm};
use tss_esapi::interface_types::ecc::EccCurve as TssEccCurve;
use tss_esapi::interface_types::resource_handles::Hierarchy as TssHierarchy;
use tss_esapi::interface_types::session_handles::AuthSession;
use tss_esapi::structures::{
    Auth, Digest, EccPoint, EccScheme, HashScheme, HashcheckTicket, KeyDerivationFunctionScheme,
    Public, PublicBuilder, PublicEccParametersBuilder, Signature, SignatureScheme,
    SymmetricDefinitionObject,
};
use tss_esapi::tcti_ldr::DeviceConfig;
use tss_esapi::tss2_esys::{ESYS_TR, TPM2_ECC_CURVE, TPMT_TK_HASHCHECK};
use tss_esapi::{Context, TctiNameConf};

/// Largest digest `TPM2B_DIGEST` can carry
const MAX_DIGEST_SIZE: usize = 64;

/// RSA public exponent a zero `exponent` field stands for
const DEFAULT_RSA_EXPONENT: u32 = 65537;

/// TPM 2.0 device session
pub struct Tpm2Device {
    context: Option<Context>,
    path: PathBuf,
    name: String,
}

impl Tpm2Device {
    /// Open the device named by `config` and set up the password session.
    ///
    /// A non-empty `hierarchy_auth` is installed on every hierarchy handle.
    pub fn open(config: &ChannelConfig) -> Result<Self, TpmTlsError> {
        let path = config.device_path.clone();
        let unavailable = |e: &dyn std::fmt::Display| {
            TpmTlsError::HardwareUnavailable(format!("{}: {}", path.display(), e))
        };

        if !path.exists() {
            return Err(unavailable(&"no such device"));
        }
        let device =
            DeviceConfig::from_str(&path.to_string_lossy()).map_err(|e| unavailable(&e))?;
        let mut context = Context::new(TctiNameConf::Device(device)).map_err(|e| unavailable(&e))?;

        if !config.hierarchy_auth.is_empty() {
            let auth = to_auth(&config.hierarchy_auth)?;
            for hierarchy in [Hierarchy::Owner, Hierarchy::Endorsement, Hierarchy::Platform] {
                context
                    .tr_set_auth(EsysHandle::from(tss_hierarchy(hierarchy)), auth.clone())
                    .map_err(|e| command_failed("TPM2_SetAuth", e))?;
            }
        }
        context.set_sessions((Some(AuthSession::Password), None, None));

        log::debug!("Opened {} through the device TCTI", path.display());
        Ok(Self {
            context: Some(context),
            name: format!("TPM 2.0 ({})", path.display()),
            path,
        })
    }

    fn context(&mut self) -> Result<&mut Context, TpmTlsError> {
        match self.context.as_mut() {
            Some(context) => Ok(context),
            None => Err(TpmTlsError::HardwareUnavailable(format!(
                "{}: session closed",
                self.path.display()
            ))),
        }
    }
}

impl HardwareChannel for Tpm2Device {
    fn name(&self) -> &str {
        &self.name
    }

    fn create_primary(
        &mut self,
        hierarchy: Hierarchy,
        template: &KeyTemplate,
        auth: &str,
    ) -> Result<(ObjectHandle, RawPublicKey), TpmTlsError> {
        let public = public_template(template)?;
        let auth = to_auth(auth)?;
        let context = self.context()?;

        let created = context
            .create_primary(tss_hierarchy(hierarchy), public, Some(auth), None, None, None)
            .map_err(|e| command_failed("TPM2_CreatePrimary", e))?;
        let handle = ObjectHandle::from_raw(ESYS_TR::from(created.key_handle));
        log::debug!("TPM2_CreatePrimary under {} -> {}", hierarchy, handle);

        let public = match raw_public_key(&created.out_public) {
            Ok(public) => public,
            Err(e) => {
                if let Err(flush) = context.flush_context(created.key_handle.into()) {
                    log::warn!("Could not flush rejected object {}: {}", handle, flush);
                }
                return Err(e);
            }
        };
        Ok((handle, public))
    }

    fn sign(
        &mut self,
        handle: ObjectHandle,
        auth: &str,
        digest: &[u8],
    ) -> Result<RawSignature, TpmTlsError> {
        if digest.is_empty() || digest.len() > MAX_DIGEST_SIZE {
            return Err(TpmTlsError::CommandFailed(format!(
                "digest of {} bytes cannot be signed",
                digest.len()
            )));
        }
        let digest =
            Digest::try_from(digest.to_vec()).map_err(|e| command_failed("TPM2_Sign", e))?;
        let auth = to_auth(auth)?;
        let validation = null_hashcheck_ticket()?;
        let key = KeyHandle::from(handle.as_raw());
        let context = self.context()?;

        context
            .tr_set_auth(key.into(), auth)
            .map_err(|e| command_failed("TPM2_Sign", e))?;
        let signature = context
            .sign(key, digest, SignatureScheme::Null, validation)
            .map_err(|e| command_failed("TPM2_Sign", e))?;
        raw_signature(signature)
    }

    fn flush_context(&mut self, handle: ObjectHandle) -> Result<(), TpmTlsError> {
        let key = KeyHandle::from(handle.as_raw());
        self.context()?
            .flush_context(key.into())
            .map_err(|e| command_failed("TPM2_FlushContext", e))?;
        log::debug!("TPM2_FlushContext {}", handle);
        Ok(())
    }

    fn close(&mut self) -> Result<(), TpmTlsError> {
        // Finalizes the ESYS context and the TCTI
        if self.context.take().is_some() {
            log::debug!("Closed {}", self.path.display());
        }
        Ok(())
    }
}

fn command_failed(command: &str, err: tss_esapi::Error) -> TpmTlsError {
    TpmTlsError::CommandFailed(format!("{} failed: {}", command, err))
}

fn to_auth(auth: &str) -> Result<Auth, TpmTlsError> {
    Auth::try_from(auth.as_bytes().to_vec()).map_err(|e| {
        TpmTlsError::InvalidArgument(format!("authorization value rejected: {}", e))
    })
}

fn tss_hierarchy(hierarchy: Hierarchy) -> TssHierarchy {
    match hierarchy {
        Hierarchy::Owner => TssHierarchy::Owner,
        Hierarchy::Endorsement => TssHierarchy::Endorsement,
        Hierarchy::Platform => TssHierarchy::Platform,
        Hierarchy::Null => TssHierarchy::Null,
    }
}

/// Ticket for a digest the TPM did not compute itself
fn null_hashcheck_ticket() -> Result<HashcheckTicket, TpmTlsError> {
    let ticket = TPMT_TK_HASHCHECK {
        tag: TPM2_ST_HASHCHECK,
        hierarchy: TPM2_RH_NULL,
        digest: Default::default(),
    };
    HashcheckTicket::try_from(ticket).map_err(|e| command_failed("TPM2_Sign", e))
}

/// `TPMT_PUBLIC` for a key template
pub fn public_template(template: &KeyTemplate) -> Result<Public, TpmTlsError> {
    let encoding =
        |e: tss_esapi::Error| TpmTlsError::InvalidArgument(format!("key template rejected: {}", e));
    let attrs = template.attributes;

    let object_attributes = ObjectAttributesBuilder::new()
        .with_fixed_tpm(attrs.contains(ObjectAttributes::FIXED_TPM))
        .with_fixed_parent(attrs.contains(ObjectAttributes::FIXED_PARENT))
        .with_sensitive_data_origin(attrs.contains(ObjectAttributes::SENSITIVE_DATA_ORIGIN))
        .with_user_with_auth(attrs.contains(ObjectAttributes::USER_WITH_AUTH))
        .with_no_da(attrs.contains(ObjectAttributes::NO_DA))
        .with_restricted(attrs.contains(ObjectAttributes::RESTRICTED))
        .with_decrypt(attrs.contains(ObjectAttributes::DECRYPT))
        .with_sign_encrypt(attrs.contains(ObjectAttributes::SIGN))
        .build()
        .map_err(encoding)?;

    let curve = match template.curve {
        EccCurve::NistP256 => TssEccCurve::NistP256,
    };
    let parameters = PublicEccParametersBuilder::new()
        .with_symmetric(SymmetricDefinitionObject::Null)
        .with_ecc_scheme(EccScheme::EcDsa(HashScheme::new(HashingAlgorithm::Sha256)))
        .with_curve(curve)
        .with_key_derivation_function_scheme(KeyDerivationFunctionScheme::Null)
        .with_is_signing_key(attrs.contains(ObjectAttributes::SIGN))
        .with_is_decryption_key(attrs.contains(ObjectAttributes::DECRYPT))
        .with_restricted(attrs.contains(ObjectAttributes::RESTRICTED))
        .build()
        .map_err(encoding)?;

    PublicBuilder::new()
        .with_public_algorithm(PublicAlgorithm::Ecc)
        .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
        .with_object_attributes(object_attributes)
        .with_ecc_parameters(parameters)
        .with_ecc_unique_identifier(EccPoint::default())
        .build()
        .map_err(encoding)
}

/// Public area of a created object in channel terms
pub fn raw_public_key(public: &Public) -> Result<RawPublicKey, TpmTlsError> {
    match public {
        Public::Ecc {
            parameters, unique, ..
        } => Ok(RawPublicKey::Ecc {
            curve_id: TPM2_ECC_CURVE::from(parameters.ecc_curve()),
            x: unique.x().value().to_vec(),
            y: unique.y().value().to_vec(),
        }),
        Public::Rsa {
            parameters, unique, ..
        } => {
            let exponent = match parameters.exponent().value() {
                0 => DEFAULT_RSA_EXPONENT,
                e => e,
            };
            Ok(RawPublicKey::Rsa {
                modulus: unique.value().to_vec(),
                exponent,
            })
        }
        _ => Err(TpmTlsError::CommandFailed(
            "module returned a public area that is not a signing key".to_string(),
        )),
    }
}

/// Signature in channel terms
pub fn raw_signature(signature: Signature) -> Result<RawSignature, TpmTlsError> {
    match signature {
        Signature::EcDsa(sig)
        | Signature::Sm2(sig)
        | Signature::EcSchnorr(sig)
        | Signature::EcDaa(sig) => Ok(RawSignature::EllipticCurve {
            r: sig.signature_r().value().to_vec(),
            s: sig.signature_s().value().to_vec(),
        }),
        Signature::RsaSsa(sig) | Signature::RsaPss(sig) => Ok(RawSignature::Integer {
            bytes: sig.signature().value().to_vec(),
        }),
        other => Err(TpmTlsError::CommandFailed(format!(
            "unsupported signature {:?}",
            other
        ))),
    }
}
