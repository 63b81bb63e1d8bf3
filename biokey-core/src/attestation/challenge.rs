use std::fmt;

use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
    Engine,
};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{BiokeyError, Result};

/// Random bytes mixed into a generated challenge.
pub const NONCE_LEN: usize = 16;

/// WebAuthn client-data challenge.
#[derive(Clone, PartialEq, Eq)]
pub struct Challenge(Vec<u8>);

impl Challenge {
    /// Generate a fresh 32-byte challenge scoped to a relying party.
    ///
    /// SHA-256 over 16 random bytes followed by the UTF-16LE encoding of
    /// `rp_id`. Two calls never return the same value.
    pub fn from_relying_party(rp_id: &str) -> Self {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let mut hasher = Sha256::new();
        hasher.update(nonce);
        for unit in rp_id.encode_utf16() {
            hasher.update(unit.to_le_bytes());
        }
        Self(hasher.finalize().to_vec())
    }

    /// Wrap caller-supplied bytes as they are.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Decode a standard-alphabet Base64 challenge.
    pub fn from_base64(text: &str) -> Result<Self> {
        STANDARD.decode(text.trim()).map(Self).map_err(|e| {
            BiokeyError::ContractViolation(format!("challenge is not valid Base64: {e}"))
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.0)
    }

    pub fn to_base64url(&self) -> String {
        URL_SAFE_NO_PAD.encode(&self.0)
    }
}

impl fmt::Debug for Challenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Challenge").field(&self.to_hex()).finish()
    }
}
