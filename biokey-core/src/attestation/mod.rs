//! Credential attestation assembly.
//!
//! Turns a raw authenticatorMakeCredential response into the WebAuthn
//! artifacts a relying party verifies:
//!
//! - the attestation object, a CBOR map `{fmt, attStmt, authData}`
//! - the client-data JSON the clientDataHash was computed over
//! - the credential id
//!
//! The encoders here are pure functions of an immutable
//! [`CredentialAttestation`]; none of them touch the key.

mod challenge;

pub use challenge::{Challenge, NONCE_LEN};

use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
    Engine,
};
use ciborium_ll::{Decoder, Encoder, Header};
use rand::RngCore;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::{BiokeyError, Result};

/// authenticatorData flag: user present.
pub const FLAG_UP: u8 = 0x01;
/// authenticatorData flag: user verified.
pub const FLAG_UV: u8 = 0x04;
/// authenticatorData flag: attested credential data included.
pub const FLAG_AT: u8 = 0x40;

const RP_ID_HASH_LEN: usize = 32;
const AAGUID_LEN: usize = 16;
/// rpIdHash, flags, signCount.
const AUTH_DATA_HEADER_LEN: usize = RP_ID_HASH_LEN + 1 + 4;
const CREDENTIAL_ID_OFFSET: usize = AUTH_DATA_HEADER_LEN + AAGUID_LEN + 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelyingParty {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl RelyingParty {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserEntity {
    #[serde(serialize_with = "serialize_base64url")]
    pub id: Vec<u8>,
    pub name: String,
    pub display_name: String,
}

impl UserEntity {
    pub fn new(id: impl Into<Vec<u8>>, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: id.into(),
            display_name: name.clone(),
            name,
        }
    }

    /// A user with a random 32-byte handle.
    pub fn with_random_id(name: impl Into<String>) -> Self {
        let mut id = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut id);
        Self::new(id, name)
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = display_name.into();
        self
    }
}

fn serialize_base64url<S: serde::Serializer>(
    bytes: &[u8],
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&URL_SAFE_NO_PAD.encode(bytes))
}

/// WebAuthn `CollectedClientData` for a registration ceremony.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientData {
    #[serde(rename = "type")]
    pub ceremony: String,
    pub challenge: String,
    pub origin: String,
    pub cross_origin: bool,
}

impl ClientData {
    pub fn create(challenge: &Challenge, origin: &str) -> Self {
        Self {
            ceremony: "webauthn.create".into(),
            challenge: challenge.to_base64url(),
            origin: origin.to_string(),
            cross_origin: false,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| BiokeyError::Serialization(e.to_string()))
    }
}

/// Raw make-credential output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawAttestation {
    fmt: String,
    auth_data: Vec<u8>,
    att_stmt: Vec<u8>,
    credential_id: Vec<u8>,
}

impl RawAttestation {
    /// `att_stmt` must already be one encoded CBOR item; it is embedded as is.
    pub fn new(
        fmt: impl Into<String>,
        auth_data: Vec<u8>,
        att_stmt: Vec<u8>,
        credential_id: Vec<u8>,
    ) -> Self {
        Self {
            fmt: fmt.into(),
            auth_data,
            att_stmt,
            credential_id,
        }
    }

    /// Parse a CTAP2 authenticatorMakeCredential response map.
    ///
    /// The attestation statement (member `0x03`) is kept as the exact bytes
    /// the key sent; it is walked only to find where it ends.
    pub fn from_ctap_response(bytes: &[u8]) -> Result<Self> {
        let mut decoder = Decoder::from(bytes);
        let entries = match decoder.pull().map_err(cbor_error)? {
            Header::Map(Some(entries)) => entries,
            _ => {
                return Err(BiokeyError::MalformedResponse(
                    "response is not a definite-length CBOR map".into(),
                ))
            }
        };

        let mut fmt = None;
        let mut auth_data = None;
        let mut att_stmt = None;
        for _ in 0..entries {
            let key = match decoder.pull().map_err(cbor_error)? {
                Header::Positive(key) => Some(key),
                other => {
                    skip_item(&mut decoder, other, 0)?;
                    None
                }
            };
            let start = decoder.offset();
            let header = decoder.pull().map_err(cbor_error)?;
            match (key, header) {
                (Some(0x01), Header::Text(len)) => fmt = Some(read_text(&mut decoder, len)?),
                (Some(0x02), Header::Bytes(len)) => {
                    auth_data = Some(read_bytes(&mut decoder, len)?)
                }
                (Some(0x03), header @ Header::Map(_)) => {
                    skip_item(&mut decoder, header, 0)?;
                    att_stmt = Some(bytes[start..decoder.offset()].to_vec());
                }
                (Some(key @ 0x01..=0x03), _) => {
                    return Err(BiokeyError::MalformedResponse(format!(
                        "response member {key} has the wrong type"
                    )))
                }
                (_, header) => skip_item(&mut decoder, header, 0)?,
            }
        }

        let missing = |name: &str| BiokeyError::MalformedResponse(format!("missing {name}"));
        let fmt = fmt.ok_or_else(|| missing("fmt"))?;
        let auth_data = auth_data.ok_or_else(|| missing("authData"))?;
        let att_stmt = att_stmt.ok_or_else(|| missing("attStmt"))?;
        let credential_id = credential_id_from_auth_data(&auth_data)?.to_vec();

        Ok(Self {
            fmt,
            auth_data,
            att_stmt,
            credential_id,
        })
    }

    pub fn fmt(&self) -> &str {
        &self.fmt
    }

    pub fn auth_data(&self) -> &[u8] {
        &self.auth_data
    }

    pub fn att_stmt(&self) -> &[u8] {
        &self.att_stmt
    }

    pub fn credential_id(&self) -> &[u8] {
        &self.credential_id
    }
}

/// Nesting limit for items skipped inside a response.
const MAX_CBOR_DEPTH: usize = 16;

type SliceDecoder<'b> = Decoder<&'b [u8]>;

fn cbor_error<E: std::fmt::Debug>(err: ciborium_ll::Error<E>) -> BiokeyError {
    match err {
        ciborium_ll::Error::Io(e) => {
            BiokeyError::MalformedResponse(format!("truncated CBOR: {e:?}"))
        }
        ciborium_ll::Error::Syntax(offset) => {
            BiokeyError::MalformedResponse(format!("invalid CBOR at byte {offset}"))
        }
    }
}

/// Consume the rest of one item whose header was just pulled.
fn skip_item(decoder: &mut SliceDecoder<'_>, header: Header, depth: usize) -> Result<()> {
    if depth > MAX_CBOR_DEPTH {
        return Err(BiokeyError::MalformedResponse("CBOR nested too deeply".into()));
    }
    match header {
        Header::Positive(_) | Header::Negative(_) | Header::Float(_) | Header::Simple(_) => Ok(()),
        Header::Tag(_) => {
            let next = decoder.pull().map_err(cbor_error)?;
            skip_item(decoder, next, depth + 1)
        }
        Header::Bytes(len) => read_bytes(decoder, len).map(drop),
        Header::Text(len) => read_text(decoder, len).map(drop),
        Header::Array(Some(len)) => {
            (0..len).try_for_each(|_| expect_item(skip_next(decoder, depth)?))
        }
        Header::Map(Some(len)) => {
            (0..len.saturating_mul(2)).try_for_each(|_| expect_item(skip_next(decoder, depth)?))
        }
        Header::Array(None) | Header::Map(None) => {
            while skip_next(decoder, depth)? {}
            Ok(())
        }
        Header::Break => expect_item(false),
    }
}

/// Skip the next item; `false` when it is the break of an indefinite container.
fn skip_next(decoder: &mut SliceDecoder<'_>, depth: usize) -> Result<bool> {
    match decoder.pull().map_err(cbor_error)? {
        Header::Break => Ok(false),
        next => skip_item(decoder, next, depth + 1).map(|()| true),
    }
}

fn expect_item(present: bool) -> Result<()> {
    if present {
        Ok(())
    } else {
        Err(BiokeyError::MalformedResponse(
            "unexpected CBOR break".into(),
        ))
    }
}

fn read_bytes(decoder: &mut SliceDecoder<'_>, len: Option<usize>) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(len.unwrap_or(0).min(1024));
    let mut buffer = [0u8; 256];
    let mut segments = decoder.bytes(len);
    while let Some(mut segment) = segments.pull().map_err(cbor_error)? {
        while let Some(chunk) = segment.pull(&mut buffer).map_err(cbor_error)? {
            out.extend_from_slice(chunk);
        }
    }
    Ok(out)
}

fn read_text(decoder: &mut SliceDecoder<'_>, len: Option<usize>) -> Result<String> {
    let mut out = String::new();
    let mut buffer = [0u8; 256];
    let mut segments = decoder.text(len);
    while let Some(mut segment) = segments.pull().map_err(cbor_error)? {
        while let Some(chunk) = segment.pull(&mut buffer).map_err(cbor_error)? {
            out.push_str(chunk);
        }
    }
    Ok(out)
}

/// The credential id from the attested-credential-data section.
fn credential_id_from_auth_data(auth_data: &[u8]) -> Result<&[u8]> {
    if auth_data.len() < AUTH_DATA_HEADER_LEN {
        return Err(BiokeyError::MalformedResponse(format!(
            "authData is {} bytes, shorter than its header",
            auth_data.len()
        )));
    }
    if auth_data[RP_ID_HASH_LEN] & FLAG_AT == 0 {
        return Err(BiokeyError::MalformedResponse(
            "authData carries no attested credential data".into(),
        ));
    }
    let len_bytes = auth_data
        .get(CREDENTIAL_ID_OFFSET - 2..CREDENTIAL_ID_OFFSET)
        .ok_or_else(|| {
            BiokeyError::MalformedResponse("authData truncated before credential id".into())
        })?;
    let len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
    auth_data
        .get(CREDENTIAL_ID_OFFSET..CREDENTIAL_ID_OFFSET + len)
        .ok_or_else(|| BiokeyError::MalformedResponse("credential id runs past authData".into()))
}

/// A created credential together with everything needed to register it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialAttestation {
    raw: RawAttestation,
    client_data_json: String,
    user: UserEntity,
    rp: RelyingParty,
}

impl CredentialAttestation {
    pub fn new(
        raw: RawAttestation,
        client_data_json: String,
        user: UserEntity,
        rp: RelyingParty,
    ) -> Self {
        Self {
            raw,
            client_data_json,
            user,
            rp,
        }
    }

    pub fn raw(&self) -> &RawAttestation {
        &self.raw
    }

    pub fn client_data_json(&self) -> &str {
        &self.client_data_json
    }

    pub fn user(&self) -> &UserEntity {
        &self.user
    }

    pub fn rp(&self) -> &RelyingParty {
        &self.rp
    }

    /// SHA-256 of the client-data JSON, as sent to the key.
    pub fn client_data_hash(&self) -> [u8; 32] {
        Sha256::digest(self.client_data_json.as_bytes()).into()
    }
}

/// The attestation object as raw CBOR.
///
/// Always a 3-entry map with keys in the order `fmt`, `attStmt`, `authData`.
/// The attestation statement bytes are copied in unchanged.
pub fn attestation_object_bytes(attestation: &CredentialAttestation) -> Result<Vec<u8>> {
    let raw = &attestation.raw;
    let cbor_err = |e: std::io::Error| BiokeyError::Serialization(e.to_string());

    let mut out = Vec::with_capacity(raw.att_stmt.len() + raw.auth_data.len() + 32);
    {
        let mut encoder = Encoder::from(&mut out);
        encoder.push(Header::Map(Some(3))).map_err(cbor_err)?;
        encoder.text("fmt", None::<usize>).map_err(cbor_err)?;
        encoder.text(&raw.fmt, None::<usize>).map_err(cbor_err)?;
        encoder.text("attStmt", None::<usize>).map_err(cbor_err)?;
    }
    out.extend_from_slice(&raw.att_stmt);
    {
        let mut encoder = Encoder::from(&mut out);
        encoder.text("authData", None::<usize>).map_err(cbor_err)?;
        encoder.bytes(&raw.auth_data, None::<usize>).map_err(cbor_err)?;
    }
    Ok(out)
}

/// Base64 of [`attestation_object_bytes`].
pub fn encode_attestation_object(attestation: &CredentialAttestation) -> Result<String> {
    Ok(STANDARD.encode(attestation_object_bytes(attestation)?))
}

/// Base64 of the client-data JSON bytes.
pub fn encode_client_data_json(attestation: &CredentialAttestation) -> String {
    STANDARD.encode(attestation.client_data_json.as_bytes())
}

/// Base64URL, unpadded, of the credential id.
pub fn credential_id_base64url(attestation: &CredentialAttestation) -> String {
    URL_SAFE_NO_PAD.encode(&attestation.raw.credential_id)
}

/// Every encoding of a new credential, ready to hand to a relying party.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodedCredential {
    pub rp_id: String,
    pub user: UserEntity,
    pub challenge: String,
    #[serde(rename = "clientDataJSON")]
    pub client_data_json: String,
    pub attestation_object: String,
    pub credential_id: String,
}

impl EncodedCredential {
    pub fn from_attestation(
        attestation: &CredentialAttestation,
        challenge: &Challenge,
    ) -> Result<Self> {
        Ok(Self {
            rp_id: attestation.rp.id.clone(),
            user: attestation.user.clone(),
            challenge: challenge.to_base64url(),
            client_data_json: encode_client_data_json(attestation),
            attestation_object: encode_attestation_object(attestation)?,
            credential_id: credential_id_base64url(attestation),
        })
    }
}
