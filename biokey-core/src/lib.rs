//! Biokey Core - biometric security key sessions
//!
//! This crate manages an exclusive session with one connected FIDO2 security
//! key and builds two capabilities on top of it.
//!
//! # Features
//!
//! - Device discovery and selection with at most one open session
//! - PIN verification driven by the key's own retry counter
//! - Fingerprint template enrollment, lookup, rename and removal
//! - WebAuthn attestation objects assembled byte-exact from raw responses
//! - PINs and tokens zeroized on disconnect and drop
//!
//! # Example
//!
//! ```no_run
//! use biokey_core::{
//!     credential_id_base64url, encode_attestation_object, Challenge, DeviceSelector,
//!     DeviceSessionManager, MakeCredentialOptions, MockTransport, RelyingParty,
//!     StaticPinCollector, UserEntity,
//! };
//!
//! # fn example() -> biokey_core::Result<()> {
//! // Use the simulated key for testing (in production, plug in a HID transport)
//! let collector = StaticPinCollector::new(Some("123456".into()));
//! let mut manager = DeviceSessionManager::new(MockTransport::demo(), collector);
//! manager.connect(DeviceSelector::Auto)?;
//!
//! let rp = RelyingParty::new("example.com");
//! let user = UserEntity::with_random_id("alice");
//! let challenge = Challenge::from_relying_party(&rp.id);
//! let attestation = manager.with_session(|session| {
//!     session.make_credential(&rp, &user, &challenge, &MakeCredentialOptions::default())
//! })?;
//!
//! println!("attestationObject: {}", encode_attestation_object(&attestation)?);
//! println!("credentialId: {}", credential_id_base64url(&attestation));
//! # Ok(())
//! # }
//! ```

pub mod attestation;
pub mod bio;
pub mod collector;
pub mod config;
pub mod device;
pub mod error;
pub mod session;
pub mod transport;

// Re-export main types for convenience
pub use attestation::{
    attestation_object_bytes, credential_id_base64url, encode_attestation_object,
    encode_client_data_json, Challenge, ClientData, CredentialAttestation, EncodedCredential,
    RawAttestation, RelyingParty, UserEntity,
};
pub use bio::{
    BioModality, BiometricTemplate, BiometricTemplateRegistry, RemoveOutcome, TemplateId,
    TemplateSelector,
};
pub use collector::{
    CollectorResponse, ScriptedCollector, SecretPin, StaticPinCollector,
    UserVerificationCollector, VerificationRequest,
};
pub use config::Config;
pub use device::{DeviceHandle, DeviceSelector, DeviceTransport, FirmwareVersion};
pub use error::{BiokeyError, ConnectionError, Result};
pub use session::{DeviceSessionManager, MakeCredentialOptions, Session};
pub use transport::{
    AuthenticatorInfo, CtapStatus, Fido2Connection, KeyTransport, Permissions, SampleStatus,
    TransportError,
};

#[cfg(feature = "mock")]
pub use transport::mock::{MockTransport, SimulatedKey};
