#![no_main]

//! Fuzz target for RawAttestation::from_ctap_response()
//!
//! The response bytes come straight from the key, so the parser must reject
//! anything malformed without panicking: truncated authData, credential
//! lengths running past the buffer, wrong member types.
//!
//! Run with: cargo +nightly fuzz run fuzz_ctap_response

use biokey_core::{
    attestation_object_bytes, CredentialAttestation, RawAttestation, RelyingParty, UserEntity,
};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(raw) = RawAttestation::from_ctap_response(data) else {
        return;
    };
    // Anything the parser accepts must also encode.
    let attestation = CredentialAttestation::new(
        raw,
        String::new(),
        UserEntity::new(vec![1], "fuzz"),
        RelyingParty::new("fuzz.example"),
    );
    let _ = attestation_object_bytes(&attestation);
});
