//! Fuzz target for module output normalization
//!
//! Public areas and signatures come from a device the process does not
//! control. Decoding them must reject malformed values with an error rather
//! than panic:
//! - EC public points of any length or curve
//! - (R, S) pairs of any length, including zero and oversized integers

#![no_main]

use libfuzzer_sys::fuzz_target;
use tpmtls::platform::{RawPublicKey, RawSignature};

fuzz_target!(|data: &[u8]| {
    let Some((&selector, rest)) = data.split_first() else {
        return;
    };
    let (a, b) = rest.split_at(rest.len() / 2);

    let public = RawPublicKey::Ecc {
        curve_id: u16::from(selector & 0x07),
        x: a.to_vec(),
        y: b.to_vec(),
    };
    let _ = public.decode();

    let signature = RawSignature::EllipticCurve {
        r: a.to_vec(),
        s: b.to_vec(),
    };
    let _ = signature.normalize();
});
