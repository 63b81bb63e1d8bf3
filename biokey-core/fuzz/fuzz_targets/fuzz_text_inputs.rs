#![no_main]

//! Fuzz target for user-supplied identifiers
//!
//! Run with: cargo +nightly fuzz run fuzz_text_inputs

use biokey_core::{Challenge, TemplateId, TemplateSelector};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(id) = TemplateId::parse(text) {
        assert_eq!(id.to_hex(), text.trim().to_lowercase());
    }
    let _ = TemplateSelector::from_parts(None, Some(text));
    let _ = Challenge::from_base64(text);
});
