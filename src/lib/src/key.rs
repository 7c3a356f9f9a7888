//! Hardware-backed signing key handle
//!
//! A [`HardwareKey`] owns one session to a security module and one primary key
//! loaded in it. The private key never leaves the module: signing is a command
//! round-trip, serialized by a lock the handle owns.
//!
//! # Lifecycle
//!
//! ```text
//! open channel ──► CreatePrimary ──► sign* ──► release (FlushContext, close)
//! ```
//!
//! `release` is idempotent and also runs on drop.

use crate::error::TpmTlsError;
use crate::platform::{
    open_device, ChannelConfig, HardwareChannel, Hierarchy, KeyTemplate, ObjectHandle,
};
use crate::signer::{KeySigner, PublicKey, Signature};
use std::fmt;
use std::sync::{Mutex, MutexGuard};

/// Options for creating a [`HardwareKey`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyOptions {
    /// Hierarchy the primary key is created under
    pub hierarchy: Hierarchy,
    /// Authorization value set on the key; empty by default
    pub auth: String,
}

impl KeyOptions {
    pub fn new(hierarchy: Hierarchy) -> Self {
        Self {
            hierarchy,
            ..Default::default()
        }
    }

    pub fn with_auth(mut self, auth: impl Into<String>) -> Self {
        self.auth = auth.into();
        self
    }
}

struct Session {
    channel: Option<Box<dyn HardwareChannel>>,
    handle: Option<ObjectHandle>,
}

/// Signing key held by a security module
pub struct HardwareKey {
    session: Mutex<Session>,
    public_key: PublicKey,
    auth: String,
    channel_name: String,
}

impl HardwareKey {
    /// Open the device in `config` and create a primary signing key under
    /// `hierarchy`.
    pub fn create(config: &ChannelConfig, hierarchy: Hierarchy) -> Result<Self, TpmTlsError> {
        Self::create_with_options(config, &KeyOptions::new(hierarchy))
    }

    pub fn create_with_options(
        config: &ChannelConfig,
        options: &KeyOptions,
    ) -> Result<Self, TpmTlsError> {
        let channel = open_device(config)?;
        Self::create_with_channel(channel, options)
    }

    /// Create a primary signing key on an already opened channel.
    ///
    /// The channel is closed if key creation fails.
    pub fn create_with_channel(
        mut channel: Box<dyn HardwareChannel>,
        options: &KeyOptions,
    ) -> Result<Self, TpmTlsError> {
        let template = KeyTemplate::ecdsa_p256_signing();
        let created = channel
            .create_primary(options.hierarchy, &template, &options.auth)
            .and_then(|(handle, raw)| match raw.decode() {
                Ok(public_key) => Ok((handle, public_key)),
                Err(e) => {
                    if let Err(flush_err) = channel.flush_context(handle) {
                        log::warn!("Failed to flush rejected key {}: {}", handle, flush_err);
                    }
                    Err(e)
                }
            });

        let (handle, public_key) = match created {
            Ok(created) => created,
            Err(e) => {
                if let Err(close_err) = channel.close() {
                    log::warn!("Failed to close {}: {}", channel.name(), close_err);
                }
                return Err(e);
            }
        };

        let channel_name = channel.name().to_string();
        log::info!(
            "Created {} signing key {} under the {} hierarchy",
            channel_name,
            handle,
            options.hierarchy
        );

        Ok(Self {
            session: Mutex::new(Session {
                channel: Some(channel),
                handle: Some(handle),
            }),
            public_key,
            auth: options.auth.clone(),
            channel_name,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Session>, TpmTlsError> {
        self.session
            .lock()
            .map_err(|_| TpmTlsError::InternalError("key session lock poisoned".to_string()))
    }

    /// Sign a digest inside the module.
    ///
    /// Concurrent callers are served one at a time.
    pub fn sign(&self, digest: &[u8]) -> Result<Signature, TpmTlsError> {
        let mut session = self.lock()?;
        let session = &mut *session;
        let (channel, handle) = match (session.channel.as_mut(), session.handle) {
            (Some(channel), Some(handle)) => (channel, handle),
            _ => {
                return Err(TpmTlsError::HardwareUnavailable(
                    "signing key has been released".to_string(),
                ))
            }
        };
        let raw = channel.sign(handle, &self.auth, digest)?;
        raw.normalize()
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// True until [`release`](Self::release) has run
    pub fn is_loaded(&self) -> bool {
        self.lock().map(|s| s.channel.is_some()).unwrap_or(false)
    }

    /// Flush the key from the module and close the session.
    ///
    /// Subsequent calls do nothing. If the flush fails the session is still
    /// closed and the flush error is returned.
    pub fn release(&self) -> Result<(), TpmTlsError> {
        let mut session = self.lock()?;
        let session = &mut *session;
        let flushed = match (session.handle.take(), session.channel.as_mut()) {
            (Some(handle), Some(channel)) => channel.flush_context(handle),
            _ => Ok(()),
        };
        let closed = match session.channel.take() {
            Some(mut channel) => {
                let closed = channel.close();
                log::debug!("Released {} signing key", self.channel_name);
                closed
            }
            None => Ok(()),
        };
        flushed.and(closed)
    }
}

impl KeySigner for HardwareKey {
    fn sign(&self, digest: &[u8]) -> Result<Signature, TpmTlsError> {
        HardwareKey::sign(self, digest)
    }

    fn public_key(&self) -> &PublicKey {
        &self.public_key
    }
}

impl Drop for HardwareKey {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            log::warn!("Failed to release {} signing key: {}", self.channel_name, e);
        }
    }
}

impl fmt::Debug for HardwareKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HardwareKey")
            .field("channel", &self.channel_name)
            .field("public_key", &self.public_key)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}
