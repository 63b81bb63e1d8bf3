//! Simulated security key for testing.
//!
//! WARNING: Not a real authenticator. PIN tokens are not encrypted and the
//! attestation signature is a hash, not an ECDSA signature.
//!
//! A [`SimulatedKey`] is cheap to clone and every clone shares the same
//! device state, so a test can hand one clone to a [`MockTransport`] and keep
//! another to inspect templates, retry counters and open connections.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ciborium::value::Value;
use sha2::{Digest, Sha256};

use super::{
    AuthenticatorInfo, CtapStatus, EnrollSample, Fido2Connection, KeyTransport,
    MakeCredentialRequest, Permissions, PinToken, SampleStatus, TemplateInfo, TransportError,
    TransportResult, COSE_ES256,
};
use crate::attestation::{FLAG_AT, FLAG_UP, FLAG_UV};
use crate::bio::BioModality;
use crate::collector::SecretPin;
use crate::device::{DeviceHandle, DeviceTransport, FirmwareVersion};

/// PIN configured on a fresh [`SimulatedKey::bio`].
pub const DEFAULT_PIN: &str = "123456";
/// PIN retry counter after a successful verification.
pub const DEFAULT_PIN_RETRIES: u8 = 8;
/// Good samples needed to complete an enrollment.
pub const DEFAULT_SAMPLES_REQUIRED: u8 = 3;
/// Fingerprint slots on the sensor.
pub const MAX_TEMPLATES: usize = 5;

const AAGUID: [u8; 16] = [
    0xd8, 0x52, 0x2d, 0x9f, 0x57, 0x5b, 0x48, 0x66, 0x88, 0xa9, 0xba, 0x99, 0xfa, 0x02, 0xf3, 0x5b,
];

struct KeyState {
    pin: Option<Vec<u8>>,
    pin_retries: u8,
    fingerprint: bool,
    templates: Vec<TemplateInfo>,
    next_template: u16,
    samples_required: u8,
    sample_script: VecDeque<SampleStatus>,
    capture_failure: Option<CtapStatus>,
    enrollment: Option<(Vec<u8>, u8)>,
    reject_removal: bool,
    issued_token: Option<(Vec<u8>, Permissions)>,
    tokens_issued: u32,
    sign_count: u32,
    open_connections: usize,
    max_open_connections: usize,
    commands: Vec<&'static str>,
}

impl KeyState {
    fn check_token(&self, token: &PinToken, needed: Permissions) -> TransportResult<()> {
        match &self.issued_token {
            Some((value, granted)) if value.as_slice() == token.as_bytes() => {
                if granted.contains(needed) {
                    Ok(())
                } else {
                    Err(CtapStatus::UnauthorizedPermission.into())
                }
            }
            _ => Err(CtapStatus::PinAuthInvalid.into()),
        }
    }

    fn verify_pin(&mut self, pin: &SecretPin) -> TransportResult<()> {
        let Some(expected) = &self.pin else {
            return Err(CtapStatus::PinNotSet.into());
        };
        if self.pin_retries == 0 {
            return Err(CtapStatus::PinBlocked.into());
        }
        if expected.as_slice() != pin.as_bytes() {
            self.pin_retries -= 1;
            self.issued_token = None;
            return Err(if self.pin_retries == 0 {
                CtapStatus::PinBlocked.into()
            } else {
                CtapStatus::PinInvalid.into()
            });
        }
        self.pin_retries = DEFAULT_PIN_RETRIES;
        Ok(())
    }

    fn capture_sample(&mut self) -> TransportResult<EnrollSample> {
        if let Some(status) = self.capture_failure.take() {
            self.enrollment = None;
            return Err(status.into());
        }
        let Some((template_id, remaining)) = self.enrollment.as_mut() else {
            return Err(CtapStatus::InvalidParameter.into());
        };
        let status = self.sample_script.pop_front().unwrap_or(SampleStatus::Good);
        if status.is_good() {
            *remaining = remaining.saturating_sub(1);
        }
        let sample = EnrollSample {
            template_id: template_id.clone(),
            status,
            remaining_samples: *remaining,
        };
        if sample.remaining_samples == 0 {
            self.templates.push(TemplateInfo {
                id: sample.template_id.clone(),
                friendly_name: None,
            });
            self.enrollment = None;
        }
        Ok(sample)
    }
}

/// One simulated authenticator.
#[derive(Clone)]
pub struct SimulatedKey {
    handle: DeviceHandle,
    state: Arc<Mutex<KeyState>>,
}

impl SimulatedKey {
    /// A plain FIDO2 key without a fingerprint sensor or PIN.
    pub fn new(serial: u32) -> Self {
        let handle = DeviceHandle {
            path: format!("sim:{serial}"),
            name: "Simulated Security Key".into(),
            serial: Some(serial),
            transports: vec![DeviceTransport::Usb, DeviceTransport::Nfc],
            firmware: FirmwareVersion::new(5, 7, 1),
        };
        let state = KeyState {
            pin: None,
            pin_retries: DEFAULT_PIN_RETRIES,
            fingerprint: false,
            templates: Vec::new(),
            next_template: 1,
            samples_required: DEFAULT_SAMPLES_REQUIRED,
            sample_script: VecDeque::new(),
            capture_failure: None,
            enrollment: None,
            reject_removal: false,
            issued_token: None,
            tokens_issued: 0,
            sign_count: 0,
            open_connections: 0,
            max_open_connections: 0,
            commands: Vec::new(),
        };
        Self {
            handle,
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// A biometric key with a fingerprint sensor and [`DEFAULT_PIN`] set.
    pub fn bio(serial: u32) -> Self {
        let mut key = Self::new(serial).with_pin(Some(DEFAULT_PIN));
        key.handle.name = "Simulated Bio Key".into();
        key.handle.transports = vec![DeviceTransport::Usb];
        key.state().fingerprint = true;
        key
    }

    pub fn with_pin(self, pin: Option<&str>) -> Self {
        self.state().pin = pin.map(|p| p.as_bytes().to_vec());
        self
    }

    pub fn with_pin_retries(self, retries: u8) -> Self {
        self.state().pin_retries = retries;
        self
    }

    pub fn without_fingerprint(self) -> Self {
        self.state().fingerprint = false;
        self
    }

    /// Pre-enroll a template with the given 2-byte identifier.
    pub fn with_template(self, id: u16, name: &str) -> Self {
        {
            let mut state = self.state();
            state.templates.push(TemplateInfo {
                id: id.to_be_bytes().to_vec(),
                friendly_name: Some(name.to_string()),
            });
            state.next_template = state.next_template.max(id.wrapping_add(1));
        }
        self
    }

    pub fn with_samples_required(self, samples: u8) -> Self {
        self.state().samples_required = samples.max(1);
        self
    }

    /// Statuses returned by the next captures, in order; good afterwards.
    pub fn with_sample_script(self, statuses: impl IntoIterator<Item = SampleStatus>) -> Self {
        self.state().sample_script.extend(statuses);
        self
    }

    /// Fail the next capture with `status`.
    pub fn with_capture_failure(self, status: CtapStatus) -> Self {
        self.state().capture_failure = Some(status);
        self
    }

    pub fn rejecting_removal(self) -> Self {
        self.state().reject_removal = true;
        self
    }

    pub fn handle(&self) -> &DeviceHandle {
        &self.handle
    }

    pub fn templates(&self) -> Vec<TemplateInfo> {
        self.state().templates.clone()
    }

    pub fn pin_retries(&self) -> u8 {
        self.state().pin_retries
    }

    pub fn pin(&self) -> Option<Vec<u8>> {
        self.state().pin.clone()
    }

    pub fn open_connections(&self) -> usize {
        self.state().open_connections
    }

    /// Highest number of simultaneously open connections seen so far.
    pub fn max_open_connections(&self) -> usize {
        self.state().max_open_connections
    }

    /// Names of the commands received, oldest first.
    pub fn commands(&self) -> Vec<&'static str> {
        self.state().commands.clone()
    }

    fn state(&self) -> MutexGuard<'_, KeyState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Transport over a fixed set of simulated keys.
#[derive(Clone, Default)]
pub struct MockTransport {
    keys: Vec<SimulatedKey>,
}

impl MockTransport {
    pub fn new(keys: impl IntoIterator<Item = SimulatedKey>) -> Self {
        Self {
            keys: keys.into_iter().collect(),
        }
    }

    pub fn single(key: SimulatedKey) -> Self {
        Self::new([key])
    }

    /// A transport with one biometric key holding two templates, used by
    /// `biokey --mock`.
    pub fn demo() -> Self {
        Self::single(
            SimulatedKey::bio(12345678)
                .with_template(0x0001, "RightIndex")
                .with_template(0x0002, "LeftThumb"),
        )
    }
}

impl KeyTransport for MockTransport {
    fn discover(&self) -> TransportResult<Vec<DeviceHandle>> {
        Ok(self.keys.iter().map(|k| k.handle.clone()).collect())
    }

    fn open(&self, device: &DeviceHandle) -> TransportResult<Box<dyn Fido2Connection>> {
        let key = self
            .keys
            .iter()
            .find(|k| &k.handle == device)
            .ok_or(TransportError::Disconnected)?;
        {
            let mut state = key.state();
            state.open_connections += 1;
            state.max_open_connections = state.max_open_connections.max(state.open_connections);
        }
        Ok(Box::new(SimulatedConnection {
            key: key.clone(),
            open: true,
        }))
    }
}

struct SimulatedConnection {
    key: SimulatedKey,
    open: bool,
}

impl SimulatedConnection {
    fn state(&self, command: &'static str) -> TransportResult<MutexGuard<'_, KeyState>> {
        if !self.open {
            return Err(TransportError::Disconnected);
        }
        let mut state = self.key.state();
        state.commands.push(command);
        Ok(state)
    }
}

impl Fido2Connection for SimulatedConnection {
    fn info(&mut self) -> TransportResult<AuthenticatorInfo> {
        let state = self.state("getInfo")?;
        let mut options = BTreeMap::new();
        options.insert("rk".to_string(), true);
        options.insert("up".to_string(), true);
        options.insert("clientPin".to_string(), state.pin.is_some());
        if state.fingerprint {
            options.insert("bioEnroll".to_string(), !state.templates.is_empty());
            options.insert("uv".to_string(), !state.templates.is_empty());
        }
        Ok(AuthenticatorInfo {
            versions: vec!["U2F_V2".into(), "FIDO_2_0".into(), "FIDO_2_1".into()],
            aaguid: AAGUID,
            options,
            firmware: Some(self.key.handle.firmware),
            max_template_friendly_name: Some(15),
        })
    }

    fn pin_retries(&mut self) -> TransportResult<u8> {
        Ok(self.state("getPinRetries")?.pin_retries)
    }

    fn pin_token(
        &mut self,
        pin: &SecretPin,
        permissions: Permissions,
    ) -> TransportResult<PinToken> {
        let mut state = self.state("getPinUvAuthTokenUsingPinWithPermissions")?;
        state.verify_pin(pin)?;
        state.tokens_issued += 1;
        let mut hasher = Sha256::new();
        hasher.update(pin.as_bytes());
        hasher.update(state.tokens_issued.to_be_bytes());
        let value = hasher.finalize().to_vec();
        state.issued_token = Some((value.clone(), permissions));
        Ok(PinToken::new(value, permissions))
    }

    fn set_pin(&mut self, new_pin: &SecretPin) -> TransportResult<()> {
        let mut state = self.state("setPIN")?;
        if state.pin.is_some() {
            return Err(CtapStatus::NotAllowed.into());
        }
        if new_pin.as_bytes().len() < 4 {
            return Err(CtapStatus::PinPolicyViolation.into());
        }
        state.pin = Some(new_pin.as_bytes().to_vec());
        state.pin_retries = DEFAULT_PIN_RETRIES;
        Ok(())
    }

    fn change_pin(&mut self, current: &SecretPin, new_pin: &SecretPin) -> TransportResult<()> {
        let mut state = self.state("changePIN")?;
        state.verify_pin(current)?;
        if new_pin.as_bytes().len() < 4 {
            return Err(CtapStatus::PinPolicyViolation.into());
        }
        state.pin = Some(new_pin.as_bytes().to_vec());
        state.issued_token = None;
        Ok(())
    }

    fn bio_modality(&mut self) -> TransportResult<Option<BioModality>> {
        let state = self.state("getModality")?;
        Ok(state.fingerprint.then_some(BioModality::Fingerprint))
    }

    fn enumerate_templates(&mut self, token: &PinToken) -> TransportResult<Vec<TemplateInfo>> {
        let state = self.state("enumerateEnrollments")?;
        state.check_token(token, Permissions::BIO_ENROLLMENT)?;
        if state.templates.is_empty() {
            return Err(CtapStatus::InvalidOption.into());
        }
        Ok(state.templates.clone())
    }

    fn enroll_begin(&mut self, token: &PinToken) -> TransportResult<EnrollSample> {
        let mut state = self.state("enrollBegin")?;
        state.check_token(token, Permissions::BIO_ENROLLMENT)?;
        if state.templates.len() >= MAX_TEMPLATES {
            return Err(CtapStatus::FpDatabaseFull.into());
        }
        let template_id = state.next_template.to_be_bytes().to_vec();
        state.next_template = state.next_template.wrapping_add(1);
        let samples = state.samples_required;
        state.enrollment = Some((template_id, samples));
        state.capture_sample()
    }

    fn enroll_capture_next(
        &mut self,
        token: &PinToken,
        template_id: &[u8],
    ) -> TransportResult<EnrollSample> {
        let mut state = self.state("enrollCaptureNextSample")?;
        state.check_token(token, Permissions::BIO_ENROLLMENT)?;
        match &state.enrollment {
            Some((pending, _)) if pending.as_slice() == template_id => state.capture_sample(),
            _ => Err(CtapStatus::InvalidParameter.into()),
        }
    }

    fn enroll_cancel(&mut self) -> TransportResult<()> {
        self.state("cancelCurrentEnrollment")?.enrollment = None;
        Ok(())
    }

    fn set_friendly_name(
        &mut self,
        token: &PinToken,
        template_id: &[u8],
        name: &str,
    ) -> TransportResult<()> {
        let mut state = self.state("setFriendlyName")?;
        state.check_token(token, Permissions::BIO_ENROLLMENT)?;
        let template = state
            .templates
            .iter_mut()
            .find(|t| t.id == template_id)
            .ok_or(TransportError::Ctap(CtapStatus::InvalidParameter))?;
        template.friendly_name = Some(name.to_string());
        Ok(())
    }

    fn remove_template(&mut self, token: &PinToken, template_id: &[u8]) -> TransportResult<()> {
        let mut state = self.state("removeEnrollment")?;
        state.check_token(token, Permissions::BIO_ENROLLMENT)?;
        if state.reject_removal {
            return Err(CtapStatus::OperationDenied.into());
        }
        let before = state.templates.len();
        state.templates.retain(|t| t.id != template_id);
        if state.templates.len() == before {
            return Err(CtapStatus::InvalidParameter.into());
        }
        Ok(())
    }

    fn make_credential(
        &mut self,
        request: &MakeCredentialRequest,
        token: Option<&PinToken>,
    ) -> TransportResult<Vec<u8>> {
        let mut state = self.state("makeCredential")?;
        let mut flags = FLAG_UP | FLAG_AT;
        if state.pin.is_some() {
            let token = token.ok_or(TransportError::Ctap(CtapStatus::PuatRequired))?;
            state.check_token(token, Permissions::MAKE_CREDENTIAL)?;
            flags |= FLAG_UV;
        }
        if !request.algorithms.contains(&COSE_ES256) {
            // CTAP2_ERR_UNSUPPORTED_ALGORITHM
            return Err(CtapStatus::Other(0x26).into());
        }
        state.sign_count += 1;

        let mut hasher = Sha256::new();
        hasher.update(request.client_data_hash);
        hasher.update(request.rp.id.as_bytes());
        hasher.update(state.sign_count.to_be_bytes());
        let credential_id = hasher.finalize().to_vec();

        let x = Sha256::digest([credential_id.as_slice(), b"x"].concat());
        let y = Sha256::digest([credential_id.as_slice(), b"y"].concat());
        let cose_key = Value::Map(vec![
            (Value::Integer(1u8.into()), Value::Integer(2u8.into())),
            (Value::Integer(3u8.into()), Value::Integer((-7i64).into())),
            (Value::Integer((-1i64).into()), Value::Integer(1u8.into())),
            (Value::Integer((-2i64).into()), Value::Bytes(x.to_vec())),
            (Value::Integer((-3i64).into()), Value::Bytes(y.to_vec())),
        ]);

        let mut auth_data = Vec::new();
        auth_data.extend_from_slice(&Sha256::digest(request.rp.id.as_bytes()));
        auth_data.push(flags);
        auth_data.extend_from_slice(&state.sign_count.to_be_bytes());
        auth_data.extend_from_slice(&AAGUID);
        auth_data.extend_from_slice(&(credential_id.len() as u16).to_be_bytes());
        auth_data.extend_from_slice(&credential_id);
        ciborium::into_writer(&cose_key, &mut auth_data)
            .map_err(|e| TransportError::Io(e.to_string()))?;

        let signature = Sha256::digest([auth_data.as_slice(), &request.client_data_hash].concat());
        let response = Value::Map(vec![
            (Value::Integer(1u8.into()), Value::Text("packed".into())),
            (Value::Integer(2u8.into()), Value::Bytes(auth_data)),
            (
                Value::Integer(3u8.into()),
                Value::Map(vec![
                    (Value::Text("alg".into()), Value::Integer((-7i64).into())),
                    (Value::Text("sig".into()), Value::Bytes(signature.to_vec())),
                ]),
            ),
        ]);

        let mut bytes = Vec::new();
        ciborium::into_writer(&response, &mut bytes)
            .map_err(|e| TransportError::Io(e.to_string()))?;
        Ok(bytes)
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            self.key.state().open_connections -= 1;
        }
    }
}

impl Drop for SimulatedConnection {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token_for(conn: &mut dyn Fido2Connection) -> PinToken {
        conn.pin_token(&DEFAULT_PIN.into(), Permissions::BIO_ENROLLMENT)
            .unwrap()
    }

    #[test]
    fn test_open_and_close_track_connections() {
        let key = SimulatedKey::bio(1);
        let transport = MockTransport::single(key.clone());
        let mut conn = transport.open(key.handle()).unwrap();
        assert_eq!(key.open_connections(), 1);
        conn.close();
        assert_eq!(key.open_connections(), 0);
        drop(conn);
        assert_eq!(key.open_connections(), 0);
        assert_eq!(key.max_open_connections(), 1);
    }

    #[test]
    fn test_wrong_pin_decrements_retries() {
        let key = SimulatedKey::bio(1);
        let transport = MockTransport::single(key.clone());
        let mut conn = transport.open(key.handle()).unwrap();

        let err = conn
            .pin_token(&"000000".into(), Permissions::BIO_ENROLLMENT)
            .unwrap_err();
        assert_eq!(err, TransportError::Ctap(CtapStatus::PinInvalid));
        assert_eq!(conn.pin_retries().unwrap(), DEFAULT_PIN_RETRIES - 1);

        token_for(conn.as_mut());
        assert_eq!(conn.pin_retries().unwrap(), DEFAULT_PIN_RETRIES);
    }

    #[test]
    fn test_last_retry_blocks_pin() {
        let key = SimulatedKey::bio(1).with_pin_retries(1);
        let transport = MockTransport::single(key.clone());
        let mut conn = transport.open(key.handle()).unwrap();
        let err = conn
            .pin_token(&"000000".into(), Permissions::BIO_ENROLLMENT)
            .unwrap_err();
        assert_eq!(err, TransportError::Ctap(CtapStatus::PinBlocked));
        assert_eq!(key.pin_retries(), 0);
    }

    #[test]
    fn test_enrollment_completes_after_required_samples() {
        let key = SimulatedKey::bio(1)
            .with_samples_required(2)
            .with_sample_script([SampleStatus::TooFast]);
        let transport = MockTransport::single(key.clone());
        let mut conn = transport.open(key.handle()).unwrap();
        let token = token_for(conn.as_mut());

        let first = conn.enroll_begin(&token).unwrap();
        assert_eq!(first.status, SampleStatus::TooFast);
        assert_eq!(first.remaining_samples, 2);

        let second = conn.enroll_capture_next(&token, &first.template_id).unwrap();
        assert_eq!(second.remaining_samples, 1);
        let third = conn.enroll_capture_next(&token, &first.template_id).unwrap();
        assert_eq!(third.remaining_samples, 0);

        assert_eq!(key.templates().len(), 1);
        assert_eq!(key.templates()[0].id, first.template_id);
    }

    #[test]
    fn test_empty_enumeration_reports_invalid_option() {
        let key = SimulatedKey::bio(1);
        let transport = MockTransport::single(key.clone());
        let mut conn = transport.open(key.handle()).unwrap();
        let token = token_for(conn.as_mut());
        assert_eq!(
            conn.enumerate_templates(&token).unwrap_err(),
            TransportError::Ctap(CtapStatus::InvalidOption)
        );
    }

    #[test]
    fn test_token_permissions_are_enforced() {
        let key = SimulatedKey::bio(1).with_template(1, "A");
        let transport = MockTransport::single(key.clone());
        let mut conn = transport.open(key.handle()).unwrap();
        let token = conn
            .pin_token(&DEFAULT_PIN.into(), Permissions::MAKE_CREDENTIAL)
            .unwrap();
        assert_eq!(
            conn.enumerate_templates(&token).unwrap_err(),
            TransportError::Ctap(CtapStatus::UnauthorizedPermission)
        );
    }
}
