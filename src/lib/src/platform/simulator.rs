//! Software stand-in for a TPM
//!
//! Keys are generated in process memory, so this offers no protection at all.
//! It exists for demos on machines without a TPM and for tests, which use the
//! [`SimulatorProbe`] and [`CommandLog`] handles to look inside after the
//! channel has been boxed and handed to a key.

use super::{HardwareChannel, Hierarchy, KeyTemplate, ObjectHandle, RawPublicKey, RawSignature};
use crate::error::TpmTlsError;
use ecdsa::signature::hazmat::PrehashSigner;
use p256::ecdsa::SigningKey;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// First transient object handle, as a real TPM hands them out
const TRANSIENT_HANDLE_BASE: u32 = 0x8000_0000;

/// TPM_RC_HANDLE for parameter 1
const RC_HANDLE: u32 = 0x0000_018B;
/// TPM_RC_AUTH_FAIL for session 1
const RC_AUTH_FAIL: u32 = 0x0000_098E;
/// TPM_RC_SIZE for parameter 1
const RC_SIZE: u32 = 0x0000_01D5;

/// Command boundary recorded by the simulator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandEvent {
    Begin(&'static str),
    End(&'static str),
}

/// Shared, append-only record of command boundaries
#[derive(Debug, Clone, Default)]
pub struct CommandLog {
    events: Arc<Mutex<Vec<CommandEvent>>>,
}

impl CommandLog {
    fn push(&self, event: CommandEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }

    pub fn events(&self) -> Vec<CommandEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Number of completed commands with the given name
    pub fn count(&self, command: &str) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, CommandEvent::End(name) if *name == command))
            .count()
    }

    /// True if every command ended before the next one began
    pub fn is_serialized(&self) -> bool {
        let events = self.events();
        let mut open: Option<&'static str> = None;
        for event in events {
            match (open, event) {
                (None, CommandEvent::Begin(name)) => open = Some(name),
                (Some(current), CommandEvent::End(name)) if current == name => open = None,
                _ => return false,
            }
        }
        open.is_none()
    }
}

struct LoadedObject {
    key: SigningKey,
    auth: String,
}

#[derive(Default)]
struct SimulatorState {
    open: bool,
    objects: HashMap<u32, LoadedObject>,
    next_handle: u32,
    flushes: usize,
    fail_create: Option<u32>,
    fail_next_sign: Option<u32>,
    fail_next_flush: Option<u32>,
}

fn lock(state: &Mutex<SimulatorState>) -> Result<MutexGuard<'_, SimulatorState>, TpmTlsError> {
    state
        .lock()
        .map_err(|_| TpmTlsError::InternalError("simulator state lock poisoned".to_string()))
}

fn rc_error(command: &str, rc: u32) -> TpmTlsError {
    TpmTlsError::CommandFailed(format!("{} returned response code {:#010x}", command, rc))
}

/// Read-only view into a simulator, plus fault injection
#[derive(Clone)]
pub struct SimulatorProbe {
    state: Arc<Mutex<SimulatorState>>,
}

impl SimulatorProbe {
    /// Number of objects currently loaded
    pub fn loaded_objects(&self) -> usize {
        lock(&self.state).map(|s| s.objects.len()).unwrap_or(0)
    }

    /// Number of successful FlushContext commands
    pub fn flush_count(&self) -> usize {
        lock(&self.state).map(|s| s.flushes).unwrap_or(0)
    }

    pub fn is_open(&self) -> bool {
        lock(&self.state).map(|s| s.open).unwrap_or(false)
    }

    /// Make the next Sign fail with the given response code
    pub fn fail_next_sign(&self, rc: u32) {
        if let Ok(mut s) = lock(&self.state) {
            s.fail_next_sign = Some(rc);
        }
    }

    /// Make the next FlushContext fail with the given response code
    pub fn fail_next_flush(&self, rc: u32) {
        if let Ok(mut s) = lock(&self.state) {
            s.fail_next_flush = Some(rc);
        }
    }
}

/// In-memory TPM channel
pub struct SimulatedTpm {
    state: Arc<Mutex<SimulatorState>>,
    log: CommandLog,
    sign_latency: Option<Duration>,
}

impl Default for SimulatedTpm {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedTpm {
    pub fn new() -> Self {
        let state = SimulatorState {
            open: true,
            next_handle: TRANSIENT_HANDLE_BASE,
            ..Default::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            log: CommandLog::default(),
            sign_latency: None,
        }
    }

    /// Hold each Sign command open for `latency`, widening the window in
    /// which unserialized callers would overlap.
    pub fn with_sign_latency(mut self, latency: Duration) -> Self {
        self.sign_latency = Some(latency);
        self
    }

    /// Fail every CreatePrimary with the given response code
    pub fn failing_create(self, rc: u32) -> Self {
        if let Ok(mut s) = lock(&self.state) {
            s.fail_create = Some(rc);
        }
        self
    }

    pub fn probe(&self) -> SimulatorProbe {
        SimulatorProbe {
            state: self.state.clone(),
        }
    }

    pub fn command_log(&self) -> CommandLog {
        self.log.clone()
    }

    fn run<T>(
        &mut self,
        command: &'static str,
        f: impl FnOnce(&mut SimulatorState, Option<Duration>) -> Result<T, TpmTlsError>,
    ) -> Result<T, TpmTlsError> {
        self.log.push(CommandEvent::Begin(command));
        let result = lock(&self.state).and_then(|mut state| {
            if !state.open {
                return Err(TpmTlsError::HardwareUnavailable(
                    "simulated TPM is closed".to_string(),
                ));
            }
            f(&mut *state, self.sign_latency)
        });
        self.log.push(CommandEvent::End(command));
        result
    }
}

impl HardwareChannel for SimulatedTpm {
    fn name(&self) -> &str {
        "simulated TPM"
    }

    fn create_primary(
        &mut self,
        hierarchy: Hierarchy,
        _template: &KeyTemplate,
        auth: &str,
    ) -> Result<(ObjectHandle, RawPublicKey), TpmTlsError> {
        self.run("TPM2_CreatePrimary", |state, _| {
            if let Some(rc) = state.fail_create {
                return Err(rc_error("TPM2_CreatePrimary", rc));
            }
            let key = SigningKey::random(&mut rand_core::OsRng);
            let point = key.verifying_key().to_encoded_point(false);
            let (x, y) = match (point.x(), point.y()) {
                (Some(x), Some(y)) => (trim_leading_zeros(x), trim_leading_zeros(y)),
                _ => {
                    return Err(TpmTlsError::InternalError(
                        "generated key has no affine coordinates".to_string(),
                    ))
                }
            };

            let handle = state.next_handle;
            state.next_handle += 1;
            state.objects.insert(
                handle,
                LoadedObject {
                    key,
                    auth: auth.to_string(),
                },
            );
            log::debug!("Simulator created primary {:#010x} under {}", handle, hierarchy);
            Ok((
                ObjectHandle::from_raw(handle),
                RawPublicKey::Ecc {
                    curve_id: 0x0003,
                    x,
                    y,
                },
            ))
        })
    }

    fn sign(
        &mut self,
        handle: ObjectHandle,
        auth: &str,
        digest: &[u8],
    ) -> Result<RawSignature, TpmTlsError> {
        self.run("TPM2_Sign", |state, latency| {
            if let Some(latency) = latency {
                std::thread::sleep(latency);
            }
            if let Some(rc) = state.fail_next_sign.take() {
                return Err(rc_error("TPM2_Sign", rc));
            }
            let object = state
                .objects
                .get(&handle.as_raw())
                .ok_or_else(|| rc_error("TPM2_Sign", RC_HANDLE))?;
            if object.auth != auth {
                return Err(rc_error("TPM2_Sign", RC_AUTH_FAIL));
            }
            let sig: p256::ecdsa::Signature = object
                .key
                .sign_prehash(digest)
                .map_err(|_| rc_error("TPM2_Sign", RC_SIZE))?;
            let rs = sig.to_bytes();
            Ok(RawSignature::EllipticCurve {
                r: trim_leading_zeros(&rs[..32]),
                s: trim_leading_zeros(&rs[32..]),
            })
        })
    }

    fn flush_context(&mut self, handle: ObjectHandle) -> Result<(), TpmTlsError> {
        self.run("TPM2_FlushContext", |state, _| {
            if let Some(rc) = state.fail_next_flush.take() {
                return Err(rc_error("TPM2_FlushContext", rc));
            }
            state
                .objects
                .remove(&handle.as_raw())
                .ok_or_else(|| rc_error("TPM2_FlushContext", RC_HANDLE))?;
            state.flushes += 1;
            Ok(())
        })
    }

    fn close(&mut self) -> Result<(), TpmTlsError> {
        let mut state = lock(&self.state)?;
        state.open = false;
        // Closing a session drops its transient objects
        state.objects.clear();
        Ok(())
    }
}

/// TPMs return integers in their minimal big-endian form
fn trim_leading_zeros(value: &[u8]) -> Vec<u8> {
    let first = value.iter().position(|&b| b != 0).unwrap_or(value.len());
    value[first..].to_vec()
}
