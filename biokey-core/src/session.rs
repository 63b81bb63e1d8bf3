//! Device session management.
//!
//! [`DeviceSessionManager`] owns the one active security key and the one open
//! FIDO2 [`Session`] against it. It is a single-owner object: every mutating
//! call takes `&mut self`, so two sessions can never be open at once and
//! callers that share a manager across threads must serialize access
//! themselves.
//!
//! ```no_run
//! use biokey_core::{
//!     BiometricTemplateRegistry, DeviceSelector, DeviceSessionManager, MockTransport,
//!     StaticPinCollector,
//! };
//!
//! # fn example() -> biokey_core::Result<()> {
//! let collector = StaticPinCollector::new(Some("123456".into()));
//! let mut manager = DeviceSessionManager::new(MockTransport::demo(), collector);
//! manager.connect(DeviceSelector::Auto)?;
//!
//! let templates = manager.with_session(|session| {
//!     BiometricTemplateRegistry::new(session).enumerate()
//! })?;
//! for template in templates {
//!     println!("{} {}", template.id, template.display_name());
//! }
//!
//! manager.disconnect();
//! # Ok(())
//! # }
//! ```

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::attestation::{
    Challenge, ClientData, CredentialAttestation, RawAttestation, RelyingParty, UserEntity,
};
use crate::collector::{CollectorResponse, SecretPin, UserVerificationCollector, VerificationRequest};
use crate::device::{DeviceHandle, DeviceSelector};
use crate::error::{BiokeyError, ConnectionError, Result};
use crate::transport::{
    AuthenticatorInfo, CtapStatus, Fido2Connection, KeyTransport, MakeCredentialRequest,
    Permissions, PinToken, TransportError, TransportResult, COSE_ES256,
};

/// Owns the active device, the open session and the cached PIN.
pub struct DeviceSessionManager<C> {
    transport: Box<dyn KeyTransport>,
    collector: C,
    active: Option<DeviceHandle>,
    connection: Option<Box<dyn Fido2Connection>>,
    cached_pin: Option<SecretPin>,
}

impl<C: UserVerificationCollector> DeviceSessionManager<C> {
    pub fn new(transport: impl KeyTransport + 'static, collector: C) -> Self {
        Self {
            transport: Box::new(transport),
            collector,
            active: None,
            connection: None,
            cached_pin: None,
        }
    }

    /// List every key the transport can see. Does not change the active device.
    pub fn discover(&self) -> Result<Vec<DeviceHandle>> {
        self.transport
            .discover()
            .map_err(|e| ConnectionError::Transport(e.to_string()).into())
    }

    /// Make the selected key the active device.
    ///
    /// Any previously active device is disconnected first, including its
    /// open session and cached PIN.
    pub fn connect(&mut self, selector: DeviceSelector) -> Result<DeviceHandle> {
        if self.active.is_some() {
            self.disconnect();
        }

        let mut devices = self.discover()?;
        debug!(count = devices.len(), selector = %selector, "Discovered security keys");

        let device = match selector {
            DeviceSelector::Handle(handle) => devices
                .into_iter()
                .find(|d| *d == handle)
                .ok_or(ConnectionError::NoDevice)?,
            DeviceSelector::Serial(serial) => devices
                .into_iter()
                .find(|d| d.serial == Some(serial))
                .ok_or(ConnectionError::SerialNotFound { serial })?,
            DeviceSelector::Auto => match devices.len() {
                0 => return Err(ConnectionError::NoDevice.into()),
                1 => devices.remove(0),
                count => return Err(ConnectionError::Ambiguous { count }.into()),
            },
        };

        info!(
            device = %device.name,
            serial = ?device.serial,
            firmware = %device.firmware,
            "Connected to security key"
        );
        self.active = Some(device.clone());
        Ok(device)
    }

    /// Close the session, wipe the cached PIN and forget the active device.
    /// Does nothing when no device is active.
    pub fn disconnect(&mut self) {
        self.close_session();
        self.cached_pin = None;
        if let Some(device) = self.active.take() {
            info!(device = %device.name, serial = ?device.serial, "Disconnected security key");
        }
    }

    /// The active device, connecting automatically when there is none.
    pub fn ensure_connected(&mut self) -> Result<DeviceHandle> {
        match &self.active {
            Some(device) => Ok(device.clone()),
            None => self.connect(DeviceSelector::Auto),
        }
    }

    pub fn active_device(&self) -> Option<&DeviceHandle> {
        self.active.as_ref()
    }

    pub fn has_open_session(&self) -> bool {
        self.connection.is_some()
    }

    pub fn has_cached_secret(&self) -> bool {
        self.cached_pin.is_some()
    }

    pub fn collector(&self) -> &C {
        &self.collector
    }

    pub fn collector_mut(&mut self) -> &mut C {
        &mut self.collector
    }

    /// Open a session that stays open across [`with_session`](Self::with_session)
    /// calls until [`close_session`](Self::close_session) or disconnect.
    pub fn open_session(&mut self) -> Result<()> {
        if self.connection.is_none() {
            let device = self.ensure_connected()?;
            self.connection = Some(self.open_connection(&device)?);
        }
        Ok(())
    }

    pub fn close_session(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.close();
            debug!("Closed FIDO2 session");
        }
    }

    /// Run `f` against a session on the active device.
    ///
    /// Connects automatically when no device is active. A session opened by
    /// this call is closed before it returns, whether `f` succeeded or not;
    /// a session that was already open is reused and left open.
    pub fn with_session<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Session<'_>) -> Result<T>,
    {
        let device = self.ensure_connected()?;
        let (mut connection, opened_here) = match self.connection.take() {
            Some(connection) => (connection, false),
            None => (self.open_connection(&device)?, true),
        };

        let result = {
            let mut session = Session {
                device: &device,
                connection: connection.as_mut(),
                collector: &mut self.collector,
                cached_pin: &mut self.cached_pin,
            };
            f(&mut session)
        };

        if opened_here {
            connection.close();
            debug!("Closed FIDO2 session");
        } else {
            self.connection = Some(connection);
        }
        result
    }

    fn open_connection(&self, device: &DeviceHandle) -> Result<Box<dyn Fido2Connection>> {
        let connection = self
            .transport
            .open(device)
            .map_err(|e| ConnectionError::Transport(e.to_string()))?;
        debug!(device = %device, "Opened FIDO2 session");
        Ok(connection)
    }
}

impl<C> Drop for DeviceSessionManager<C> {
    fn drop(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.close();
        }
    }
}

/// Options for [`Session::make_credential`].
#[derive(Debug, Clone, Default)]
pub struct MakeCredentialOptions {
    /// Store the credential on the key (discoverable credential).
    pub resident_key: bool,
    /// Client-data origin; `https://<rp id>` when unset.
    pub origin: Option<String>,
}

/// An open FIDO2 session on the active device.
///
/// Borrowed from [`DeviceSessionManager::with_session`]; it cannot outlive
/// the call that produced it.
pub struct Session<'a> {
    device: &'a DeviceHandle,
    connection: &'a mut dyn Fido2Connection,
    collector: &'a mut dyn UserVerificationCollector,
    cached_pin: &'a mut Option<SecretPin>,
}

impl<'a> Session<'a> {
    pub fn device(&self) -> &DeviceHandle {
        self.device
    }

    pub fn info(&mut self) -> Result<AuthenticatorInfo> {
        Ok(self.connection.info()?)
    }

    pub fn pin_retries(&mut self) -> Result<u8> {
        Ok(self.connection.pin_retries()?)
    }

    /// Obtain a pinUvAuthToken, asking the collector for the PIN if the
    /// cached one is missing or stale.
    pub fn pin_token(&mut self, permissions: Permissions) -> Result<PinToken> {
        let info = self.info()?;
        if !info.supports_pin() {
            return Err(BiokeyError::CapabilityUnsupported { capability: "PIN" });
        }
        if !info.pin_set() {
            return Err(BiokeyError::PinNotSet);
        }
        let (token, pin) = self.verify_pin(|connection, pin| connection.pin_token(pin, permissions))?;
        *self.cached_pin = Some(pin);
        Ok(token)
    }

    /// Set the first PIN on a key that has none. Prompts for it when `new_pin`
    /// is `None`.
    pub fn set_pin(&mut self, new_pin: Option<SecretPin>) -> Result<()> {
        let new_pin = match new_pin {
            Some(pin) => pin,
            None => self.prompt_new_pin()?,
        };
        new_pin.validate()?;

        let info = self.info()?;
        if info.pin_set() {
            return Err(BiokeyError::ContractViolation(
                "a PIN is already set; change it instead".into(),
            ));
        }
        self.connection
            .set_pin(&new_pin)
            .map_err(|e| BiokeyError::rejected("set PIN", self.device.name.clone(), e))?;
        info!(device = %self.device, "PIN set");
        *self.cached_pin = Some(new_pin);
        Ok(())
    }

    /// Change the PIN after verifying the current one through the collector.
    pub fn change_pin(&mut self, new_pin: Option<SecretPin>) -> Result<()> {
        let new_pin = match new_pin {
            Some(pin) => pin,
            None => self.prompt_new_pin()?,
        };
        new_pin.validate()?;

        if !self.info()?.pin_set() {
            return Err(BiokeyError::PinNotSet);
        }
        self.verify_pin(|connection, current| connection.change_pin(current, &new_pin))?;
        info!(device = %self.device, "PIN changed");
        *self.cached_pin = Some(new_pin);
        Ok(())
    }

    /// Ask the collector to confirm presence before a touch-gated command.
    pub fn request_presence(&mut self) -> Result<()> {
        match self.prompt(&VerificationRequest::Touch) {
            CollectorResponse::Proceed => Ok(()),
            CollectorResponse::Cancel => Err(BiokeyError::Cancelled),
            CollectorResponse::Pin(_) => Err(BiokeyError::ContractViolation(
                "collector answered a touch prompt with a PIN".into(),
            )),
        }
    }

    /// Create a credential and assemble its attestation.
    pub fn make_credential(
        &mut self,
        rp: &RelyingParty,
        user: &UserEntity,
        challenge: &Challenge,
        options: &MakeCredentialOptions,
    ) -> Result<CredentialAttestation> {
        if rp.id.is_empty() {
            return Err(BiokeyError::ContractViolation(
                "relying party id must not be empty".into(),
            ));
        }
        if user.id.is_empty() || user.id.len() > 64 {
            return Err(BiokeyError::ContractViolation(
                "user id must be between 1 and 64 bytes".into(),
            ));
        }

        let origin = options
            .origin
            .clone()
            .unwrap_or_else(|| format!("https://{}", rp.id));
        let client_data_json = ClientData::create(challenge, &origin).to_json()?;
        let client_data_hash: [u8; 32] = Sha256::digest(client_data_json.as_bytes()).into();

        let token = if self.info()?.pin_set() {
            Some(self.pin_token(Permissions::MAKE_CREDENTIAL)?)
        } else {
            None
        };
        self.request_presence()?;

        let request = MakeCredentialRequest {
            client_data_hash,
            rp: rp.clone(),
            user: user.clone(),
            algorithms: vec![COSE_ES256],
            resident_key: options.resident_key,
        };
        debug!(rp = %rp.id, resident_key = options.resident_key, "Sending makeCredential");
        let response = self
            .connection
            .make_credential(&request, token.as_ref())
            .map_err(|e| BiokeyError::rejected("make credential", rp.id.clone(), e))?;

        let raw = RawAttestation::from_ctap_response(&response)?;
        info!(rp = %rp.id, fmt = raw.fmt(), "Credential created");
        Ok(CredentialAttestation::new(
            raw,
            client_data_json,
            user.clone(),
            rp.clone(),
        ))
    }

    pub(crate) fn prompt(&mut self, request: &VerificationRequest) -> CollectorResponse {
        self.collector.collect(request)
    }

    pub(crate) fn connection(&mut self) -> &mut dyn Fido2Connection {
        &mut *self.connection
    }

    fn prompt_new_pin(&mut self) -> Result<SecretPin> {
        match self.prompt(&VerificationRequest::NewPin) {
            CollectorResponse::Pin(pin) => Ok(pin),
            CollectorResponse::Cancel => Err(BiokeyError::Cancelled),
            CollectorResponse::Proceed => Err(BiokeyError::ContractViolation(
                "collector answered a new-PIN prompt without a PIN".into(),
            )),
        }
    }

    /// Run `attempt` with a PIN until the key accepts it.
    ///
    /// The cached PIN is tried silently first. After that the collector is
    /// asked, and shown the key's own retry counter before every prompt.
    /// The loop ends when the collector cancels or the key reports the PIN
    /// blocked; attempts are never counted here.
    fn verify_pin<T>(
        &mut self,
        mut attempt: impl FnMut(&mut dyn Fido2Connection, &SecretPin) -> TransportResult<T>,
    ) -> Result<(T, SecretPin)> {
        let mut attempt_failed = false;

        if let Some(pin) = self.cached_pin.take() {
            match attempt(&mut *self.connection, &pin) {
                Ok(value) => return Ok((value, pin)),
                Err(TransportError::Ctap(CtapStatus::PinInvalid)) => {
                    warn!("Cached PIN was rejected; asking again");
                    attempt_failed = true;
                }
                Err(e) => return Err(pin_failure(e)),
            }
        }

        loop {
            let retries = self.connection.pin_retries()?;
            if retries == 0 {
                return Err(pin_failure(CtapStatus::PinBlocked.into()));
            }

            let pin = match self.prompt(&VerificationRequest::Pin {
                retries_remaining: Some(retries),
                attempt_failed,
            }) {
                CollectorResponse::Pin(pin) => pin,
                CollectorResponse::Cancel => return Err(BiokeyError::Cancelled),
                CollectorResponse::Proceed => {
                    return Err(BiokeyError::ContractViolation(
                        "collector answered a PIN prompt without a PIN".into(),
                    ))
                }
            };
            pin.validate()?;

            match attempt(&mut *self.connection, &pin) {
                Ok(value) => return Ok((value, pin)),
                Err(TransportError::Ctap(CtapStatus::PinInvalid)) => {
                    warn!(device = %self.device, "Incorrect PIN");
                    attempt_failed = true;
                }
                Err(e) => return Err(pin_failure(e)),
            }
        }
    }
}

fn pin_failure(error: TransportError) -> BiokeyError {
    match error {
        TransportError::Ctap(CtapStatus::PinBlocked) => BiokeyError::Verification {
            reason: "PIN is blocked; the key must be reset".into(),
            retries_remaining: Some(0),
        },
        TransportError::Ctap(CtapStatus::PinAuthBlocked) => BiokeyError::Verification {
            reason: "too many incorrect PINs; remove and re-insert the key".into(),
            retries_remaining: None,
        },
        TransportError::Ctap(CtapStatus::PinNotSet) => BiokeyError::PinNotSet,
        TransportError::Ctap(CtapStatus::PinPolicyViolation) => BiokeyError::ContractViolation(
            "PIN does not satisfy the key's PIN policy".into(),
        ),
        other => BiokeyError::Transport(other),
    }
}
