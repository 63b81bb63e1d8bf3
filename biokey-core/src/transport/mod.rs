//! Key transport seam.
//!
//! Everything below the FIDO2 command level (HID framing, APDUs, PIN
//! protocol key agreement) belongs to a key-transport library. This module
//! only names what the rest of the crate needs from it:
//!
//! - [`KeyTransport`] discovers keys and opens a connection to one of them
//! - [`Fido2Connection`] issues authenticatorGetInfo, authenticatorClientPIN,
//!   authenticatorBioEnrollment and authenticatorMakeCredential commands
//!
//! A simulated authenticator implementing both traits lives in [`mock`].

#[cfg(feature = "mock")]
pub mod mock;

use std::collections::BTreeMap;
use std::fmt;
use std::ops::BitOr;

use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::attestation::{RelyingParty, UserEntity};
use crate::bio::BioModality;
use crate::collector::SecretPin;
use crate::device::{DeviceHandle, FirmwareVersion};

/// CTAP2 status codes a connection can fail with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CtapStatus {
    InvalidParameter,
    FpDatabaseFull,
    OperationDenied,
    UnsupportedOption,
    InvalidOption,
    KeepaliveCancel,
    NoCredentials,
    UserActionTimeout,
    NotAllowed,
    PinInvalid,
    PinBlocked,
    PinAuthInvalid,
    PinAuthBlocked,
    PinNotSet,
    PuatRequired,
    PinPolicyViolation,
    UvBlocked,
    UvInvalid,
    UnauthorizedPermission,
    Other(u8),
}

impl CtapStatus {
    pub fn from_code(code: u8) -> Self {
        match code {
            0x02 => Self::InvalidParameter,
            0x17 => Self::FpDatabaseFull,
            0x27 => Self::OperationDenied,
            0x2B => Self::UnsupportedOption,
            0x2C => Self::InvalidOption,
            0x2D => Self::KeepaliveCancel,
            0x2E => Self::NoCredentials,
            0x2F => Self::UserActionTimeout,
            0x30 => Self::NotAllowed,
            0x31 => Self::PinInvalid,
            0x32 => Self::PinBlocked,
            0x33 => Self::PinAuthInvalid,
            0x34 => Self::PinAuthBlocked,
            0x35 => Self::PinNotSet,
            0x36 => Self::PuatRequired,
            0x37 => Self::PinPolicyViolation,
            0x3C => Self::UvBlocked,
            0x3F => Self::UvInvalid,
            0x40 => Self::UnauthorizedPermission,
            other => Self::Other(other),
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            Self::InvalidParameter => 0x02,
            Self::FpDatabaseFull => 0x17,
            Self::OperationDenied => 0x27,
            Self::UnsupportedOption => 0x2B,
            Self::InvalidOption => 0x2C,
            Self::KeepaliveCancel => 0x2D,
            Self::NoCredentials => 0x2E,
            Self::UserActionTimeout => 0x2F,
            Self::NotAllowed => 0x30,
            Self::PinInvalid => 0x31,
            Self::PinBlocked => 0x32,
            Self::PinAuthInvalid => 0x33,
            Self::PinAuthBlocked => 0x34,
            Self::PinNotSet => 0x35,
            Self::PuatRequired => 0x36,
            Self::PinPolicyViolation => 0x37,
            Self::UvBlocked => 0x3C,
            Self::UvInvalid => 0x3F,
            Self::UnauthorizedPermission => 0x40,
            Self::Other(code) => *code,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::InvalidParameter => "CTAP1_ERR_INVALID_PARAMETER",
            Self::FpDatabaseFull => "CTAP2_ERR_FP_DATABASE_FULL",
            Self::OperationDenied => "CTAP2_ERR_OPERATION_DENIED",
            Self::UnsupportedOption => "CTAP2_ERR_UNSUPPORTED_OPTION",
            Self::InvalidOption => "CTAP2_ERR_INVALID_OPTION",
            Self::KeepaliveCancel => "CTAP2_ERR_KEEPALIVE_CANCEL",
            Self::NoCredentials => "CTAP2_ERR_NO_CREDENTIALS",
            Self::UserActionTimeout => "CTAP2_ERR_USER_ACTION_TIMEOUT",
            Self::NotAllowed => "CTAP2_ERR_NOT_ALLOWED",
            Self::PinInvalid => "CTAP2_ERR_PIN_INVALID",
            Self::PinBlocked => "CTAP2_ERR_PIN_BLOCKED",
            Self::PinAuthInvalid => "CTAP2_ERR_PIN_AUTH_INVALID",
            Self::PinAuthBlocked => "CTAP2_ERR_PIN_AUTH_BLOCKED",
            Self::PinNotSet => "CTAP2_ERR_PIN_NOT_SET",
            Self::PuatRequired => "CTAP2_ERR_PUAT_REQUIRED",
            Self::PinPolicyViolation => "CTAP2_ERR_PIN_POLICY_VIOLATION",
            Self::UvBlocked => "CTAP2_ERR_UV_BLOCKED",
            Self::UvInvalid => "CTAP2_ERR_UV_INVALID",
            Self::UnauthorizedPermission => "CTAP2_ERR_UNAUTHORIZED_PERMISSION",
            Self::Other(_) => "CTAP_ERR_OTHER",
        }
    }
}

impl fmt::Display for CtapStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02X})", self.name(), self.code())
    }
}

/// Errors reported by the key-transport library.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("{0}")]
    Ctap(CtapStatus),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Device disconnected")]
    Disconnected,
}

impl TransportError {
    pub fn ctap_status(&self) -> Option<CtapStatus> {
        match self {
            Self::Ctap(status) => Some(*status),
            _ => None,
        }
    }
}

impl From<CtapStatus> for TransportError {
    fn from(status: CtapStatus) -> Self {
        Self::Ctap(status)
    }
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// pinUvAuthToken permission bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permissions(u8);

impl Permissions {
    pub const MAKE_CREDENTIAL: Self = Self(0x01);
    pub const GET_ASSERTION: Self = Self(0x02);
    pub const CREDENTIAL_MANAGEMENT: Self = Self(0x04);
    pub const BIO_ENROLLMENT: Self = Self(0x08);

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Permissions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// A pinUvAuthToken issued by the key. Wiped from memory on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct PinToken {
    value: Vec<u8>,
    #[zeroize(skip)]
    permissions: Permissions,
}

impl PinToken {
    pub fn new(value: Vec<u8>, permissions: Permissions) -> Self {
        Self { value, permissions }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.value
    }

    pub fn permissions(&self) -> Permissions {
        self.permissions
    }
}

impl fmt::Debug for PinToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinToken")
            .field("value", &"[REDACTED]")
            .field("permissions", &self.permissions)
            .finish()
    }
}

/// authenticatorGetInfo response, reduced to what sessions consult.
#[derive(Debug, Clone, Default)]
pub struct AuthenticatorInfo {
    pub versions: Vec<String>,
    pub aaguid: [u8; 16],
    pub options: BTreeMap<String, bool>,
    pub firmware: Option<FirmwareVersion>,
    pub max_template_friendly_name: Option<usize>,
}

impl AuthenticatorInfo {
    fn option(&self, name: &str) -> Option<bool> {
        self.options.get(name).copied()
    }

    /// `clientPin` option present: the key supports a PIN.
    pub fn supports_pin(&self) -> bool {
        self.option("clientPin").is_some()
    }

    /// `clientPin` option true: a PIN has been set.
    pub fn pin_set(&self) -> bool {
        self.option("clientPin") == Some(true)
    }

    /// `bioEnroll` option present: the key has a biometric sensor.
    pub fn supports_bio_enrollment(&self) -> bool {
        self.option("bioEnroll").is_some()
    }
}

/// One enrollment as returned by enumerateEnrollments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateInfo {
    pub id: Vec<u8>,
    pub friendly_name: Option<String>,
}

/// lastEnrollSampleStatus of a fingerprint capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleStatus {
    Good,
    TooHigh,
    TooLow,
    TooLeft,
    TooRight,
    TooFast,
    TooSlow,
    PoorQuality,
    TooSkewed,
    TooShort,
    MergeFailure,
    AlreadyExists,
    NoUserActivity,
    NoUserPresenceTransition,
    Other(u8),
}

impl SampleStatus {
    pub fn from_code(code: u8) -> Self {
        match code {
            0x00 => Self::Good,
            0x01 => Self::TooHigh,
            0x02 => Self::TooLow,
            0x03 => Self::TooLeft,
            0x04 => Self::TooRight,
            0x05 => Self::TooFast,
            0x06 => Self::TooSlow,
            0x07 => Self::PoorQuality,
            0x08 => Self::TooSkewed,
            0x09 => Self::TooShort,
            0x0A => Self::MergeFailure,
            0x0B => Self::AlreadyExists,
            0x0D => Self::NoUserActivity,
            0x0E => Self::NoUserPresenceTransition,
            other => Self::Other(other),
        }
    }

    pub fn is_good(&self) -> bool {
        matches!(self, Self::Good)
    }
}

impl fmt::Display for SampleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Good => "good sample",
            Self::TooHigh => "finger too high",
            Self::TooLow => "finger too low",
            Self::TooLeft => "finger too far left",
            Self::TooRight => "finger too far right",
            Self::TooFast => "finger moved too fast",
            Self::TooSlow => "finger moved too slow",
            Self::PoorQuality => "poor quality sample",
            Self::TooSkewed => "finger too skewed",
            Self::TooShort => "touch too short",
            Self::MergeFailure => "sample could not be merged",
            Self::AlreadyExists => "fingerprint already enrolled",
            Self::NoUserActivity => "no finger detected",
            Self::NoUserPresenceTransition => "lift and touch again",
            Self::Other(code) => return write!(f, "sample status 0x{code:02X}"),
        };
        f.write_str(text)
    }
}

/// Result of one enrollment capture step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrollSample {
    pub template_id: Vec<u8>,
    pub status: SampleStatus,
    pub remaining_samples: u8,
}

/// COSE algorithm identifier for ES256.
pub const COSE_ES256: i32 = -7;

/// authenticatorMakeCredential parameters.
#[derive(Debug, Clone)]
pub struct MakeCredentialRequest {
    pub client_data_hash: [u8; 32],
    pub rp: RelyingParty,
    pub user: UserEntity,
    pub algorithms: Vec<i32>,
    pub resident_key: bool,
}

/// Discovers keys and opens connections to them.
pub trait KeyTransport: Send {
    fn discover(&self) -> TransportResult<Vec<DeviceHandle>>;

    fn open(&self, device: &DeviceHandle) -> TransportResult<Box<dyn Fido2Connection>>;
}

impl<T: KeyTransport + ?Sized> KeyTransport for Box<T> {
    fn discover(&self) -> TransportResult<Vec<DeviceHandle>> {
        (**self).discover()
    }

    fn open(&self, device: &DeviceHandle) -> TransportResult<Box<dyn Fido2Connection>> {
        (**self).open(device)
    }
}

/// An open FIDO2 connection to one key.
///
/// PIN protocol encryption is the implementation's concern; tokens and PINs
/// cross this boundary in the clear and are zeroized by their owners.
pub trait Fido2Connection: Send {
    fn info(&mut self) -> TransportResult<AuthenticatorInfo>;

    fn pin_retries(&mut self) -> TransportResult<u8>;

    fn pin_token(&mut self, pin: &SecretPin, permissions: Permissions)
        -> TransportResult<PinToken>;

    fn set_pin(&mut self, new_pin: &SecretPin) -> TransportResult<()>;

    fn change_pin(&mut self, current: &SecretPin, new_pin: &SecretPin) -> TransportResult<()>;

    fn bio_modality(&mut self) -> TransportResult<Option<BioModality>>;

    fn enumerate_templates(&mut self, token: &PinToken) -> TransportResult<Vec<TemplateInfo>>;

    /// Starts an enrollment; blocks until the first sample is captured.
    fn enroll_begin(&mut self, token: &PinToken) -> TransportResult<EnrollSample>;

    fn enroll_capture_next(
        &mut self,
        token: &PinToken,
        template_id: &[u8],
    ) -> TransportResult<EnrollSample>;

    fn enroll_cancel(&mut self) -> TransportResult<()>;

    fn set_friendly_name(
        &mut self,
        token: &PinToken,
        template_id: &[u8],
        name: &str,
    ) -> TransportResult<()>;

    fn remove_template(&mut self, token: &PinToken, template_id: &[u8]) -> TransportResult<()>;

    /// Returns the raw CBOR authenticatorMakeCredential response.
    fn make_credential(
        &mut self,
        request: &MakeCredentialRequest,
        token: Option<&PinToken>,
    ) -> TransportResult<Vec<u8>>;

    fn close(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_roundtrip_known_values() {
        for code in [0x02, 0x17, 0x27, 0x2E, 0x31, 0x32, 0x34, 0x35, 0x3F, 0x40] {
            assert_eq!(CtapStatus::from_code(code).code(), code);
        }
        assert_eq!(CtapStatus::from_code(0x99), CtapStatus::Other(0x99));
    }

    #[test]
    fn test_status_display() {
        assert_eq!(
            CtapStatus::PinInvalid.to_string(),
            "CTAP2_ERR_PIN_INVALID (0x31)"
        );
    }

    #[test]
    fn test_permissions() {
        let both = Permissions::BIO_ENROLLMENT | Permissions::MAKE_CREDENTIAL;
        assert!(both.contains(Permissions::BIO_ENROLLMENT));
        assert!(both.contains(Permissions::MAKE_CREDENTIAL));
        assert!(!both.contains(Permissions::CREDENTIAL_MANAGEMENT));
        assert_eq!(both.bits(), 0x09);
    }

    #[test]
    fn test_pin_token_debug_is_redacted() {
        let token = PinToken::new(vec![1, 2, 3], Permissions::BIO_ENROLLMENT);
        let rendered = format!("{token:?}");
        assert!(rendered.contains("REDACTED"));
        assert!(!rendered.contains("[1, 2, 3]"));
    }

    #[test]
    fn test_info_options() {
        let mut info = AuthenticatorInfo::default();
        assert!(!info.supports_pin());
        info.options.insert("clientPin".into(), false);
        info.options.insert("bioEnroll".into(), false);
        assert!(info.supports_pin());
        assert!(!info.pin_set());
        assert!(info.supports_bio_enrollment());
    }
}
