//! Biometric template registry.
//!
//! Templates live only on the key. Nothing is cached here: every lookup
//! enumerates the device again, so a template renamed or removed by another
//! tool is seen on the next call.

use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Serializer};
use tracing::{debug, info, warn};

use crate::collector::{CollectorResponse, VerificationRequest};
use crate::error::{BiokeyError, Result};
use crate::session::Session;
use crate::transport::{
    CtapStatus, Permissions, PinToken, SampleStatus, TemplateInfo, TransportError,
};

/// Opaque template identifier, shown as lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TemplateId(Vec<u8>);

impl TemplateId {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Parse a hex identifier. Upper and lower case are both accepted.
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        if text.is_empty() {
            return Err(BiokeyError::ContractViolation(
                "template id must not be empty".into(),
            ));
        }
        if text.len() % 2 != 0 {
            return Err(BiokeyError::ContractViolation(format!(
                "template id '{text}' must have an even number of hex digits"
            )));
        }
        hex::decode(text).map(Self).map_err(|_| {
            BiokeyError::ContractViolation(format!("template id '{text}' is not valid hex"))
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl fmt::Display for TemplateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for TemplateId {
    type Err = BiokeyError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for TemplateId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

/// Picks a template by friendly name or by identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateSelector {
    ByName(String),
    ById(TemplateId),
}

impl TemplateSelector {
    /// Build a selector from two optional inputs, exactly one of which must
    /// be given. The id is parsed here, before any device access.
    pub fn from_parts(name: Option<&str>, id: Option<&str>) -> Result<Self> {
        match (name, id) {
            (Some(name), None) => Ok(Self::ByName(name.to_string())),
            (None, Some(id)) => Ok(Self::ById(TemplateId::parse(id)?)),
            (Some(_), Some(_)) => Err(BiokeyError::ContractViolation(
                "give either a template name or a template id, not both".into(),
            )),
            (None, None) => Err(BiokeyError::ContractViolation(
                "a template name or template id is required".into(),
            )),
        }
    }

    pub fn matches(&self, template: &BiometricTemplate) -> bool {
        match self {
            Self::ByName(name) => template.friendly_name.to_lowercase() == name.to_lowercase(),
            Self::ById(id) => template.id == *id,
        }
    }
}

impl fmt::Display for TemplateSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ByName(name) => write!(f, "name '{name}'"),
            Self::ById(id) => write!(f, "id '{id}'"),
        }
    }
}

/// One enrolled fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BiometricTemplate {
    pub id: TemplateId,
    #[serde(rename = "name")]
    pub friendly_name: String,
}

impl BiometricTemplate {
    /// The friendly name, or `Unnamed` when the key stores none.
    pub fn display_name(&self) -> &str {
        if self.friendly_name.is_empty() {
            "Unnamed"
        } else {
            &self.friendly_name
        }
    }
}

impl From<TemplateInfo> for BiometricTemplate {
    fn from(info: TemplateInfo) -> Self {
        Self {
            id: TemplateId(info.id),
            friendly_name: info.friendly_name.unwrap_or_default(),
        }
    }
}

/// Sensor type reported by the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BioModality {
    Fingerprint,
    Other(u8),
}

impl BioModality {
    pub fn from_code(code: u8) -> Self {
        match code {
            0x01 => Self::Fingerprint,
            other => Self::Other(other),
        }
    }
}

/// Result of [`BiometricTemplateRegistry::remove`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed,
    /// The caller did not confirm; the key was not touched.
    Declined,
}

/// Template operations on an open session.
pub struct BiometricTemplateRegistry<'s, 'a> {
    session: &'s mut Session<'a>,
}

impl<'s, 'a> BiometricTemplateRegistry<'s, 'a> {
    pub fn new(session: &'s mut Session<'a>) -> Self {
        Self { session }
    }

    pub fn modality(&mut self) -> Result<Option<BioModality>> {
        Ok(self.session.connection().bio_modality()?)
    }

    /// Fail with a warning-class error when the key has no fingerprint sensor.
    pub fn require_fingerprint(&mut self) -> Result<()> {
        match self.modality()? {
            Some(BioModality::Fingerprint) => Ok(()),
            other => {
                warn!(device = %self.session.device(), modality = ?other, "No fingerprint sensor");
                Err(BiokeyError::CapabilityUnsupported {
                    capability: "fingerprint enrollment",
                })
            }
        }
    }

    /// All templates on the key, in device order.
    pub fn enumerate(&mut self) -> Result<Vec<BiometricTemplate>> {
        let token = self.token()?;
        self.enumerate_with(&token)
    }

    /// Enroll a new fingerprint and name it.
    ///
    /// Drives the capture loop, prompting the collector before every sample.
    /// On any failure the partial enrollment is cancelled on the key, or the
    /// finished template removed when only naming failed.
    pub fn enroll(&mut self, name: &str) -> Result<BiometricTemplate> {
        if name.trim().is_empty() {
            return Err(BiokeyError::ContractViolation(
                "template name must not be empty".into(),
            ));
        }
        self.check_name_length(name)?;
        self.require_fingerprint()?;
        let token = self.token()?;

        info!(device = %self.session.device(), name, "Starting fingerprint enrollment");
        let template_id = match self.capture(&token) {
            Ok(id) => id,
            Err(e) => {
                self.cancel_enrollment();
                return Err(enroll_failure(name, e));
            }
        };

        if let Err(e) = self
            .session
            .connection()
            .set_friendly_name(&token, &template_id, name)
        {
            warn!(template = %hex::encode(&template_id), error = %e, "Naming failed; removing template");
            if let Err(cleanup) = self.session.connection().remove_template(&token, &template_id) {
                warn!(error = %cleanup, "Could not remove unnamed template");
            }
            return Err(BiokeyError::rejected("enroll", name, e));
        }

        let template = BiometricTemplate {
            id: TemplateId(template_id),
            friendly_name: name.to_string(),
        };
        info!(id = %template.id, name, "Fingerprint enrolled");
        Ok(template)
    }

    /// First template the selector matches, from a fresh enumeration.
    ///
    /// A key without a fingerprint sensor yields the capability warning, not
    /// an empty match.
    pub fn find(&mut self, selector: &TemplateSelector) -> Result<Option<BiometricTemplate>> {
        self.require_fingerprint()?;
        Ok(self
            .enumerate()?
            .into_iter()
            .find(|t| selector.matches(t)))
    }

    pub fn resolve(&mut self, selector: &TemplateSelector) -> Result<BiometricTemplate> {
        self.find(selector)?.ok_or_else(|| BiokeyError::NotFound {
            selector: selector.clone(),
        })
    }

    pub fn rename(
        &mut self,
        template: &BiometricTemplate,
        new_name: &str,
    ) -> Result<BiometricTemplate> {
        if new_name.trim().is_empty() {
            return Err(BiokeyError::ContractViolation(
                "template name must not be empty".into(),
            ));
        }
        self.check_name_length(new_name)?;
        let token = self.token()?;
        self.session
            .connection()
            .set_friendly_name(&token, template.id.as_bytes(), new_name)
            .map_err(|e| BiokeyError::rejected("rename", template.display_name(), e))?;
        info!(id = %template.id, from = template.display_name(), to = new_name, "Template renamed");
        Ok(BiometricTemplate {
            id: template.id.clone(),
            friendly_name: new_name.to_string(),
        })
    }

    /// Delete a template. Nothing is sent to the key unless `proceed` is set.
    pub fn remove(&mut self, template: &BiometricTemplate, proceed: bool) -> Result<RemoveOutcome> {
        if !proceed {
            debug!(id = %template.id, "Removal declined");
            return Ok(RemoveOutcome::Declined);
        }
        let token = self.token()?;
        self.session
            .connection()
            .remove_template(&token, template.id.as_bytes())
            .map_err(|e| BiokeyError::rejected("remove", template.display_name(), e))?;
        info!(id = %template.id, name = template.display_name(), "Template removed");
        Ok(RemoveOutcome::Removed)
    }

    fn token(&mut self) -> Result<PinToken> {
        self.session.pin_token(Permissions::BIO_ENROLLMENT)
    }

    fn enumerate_with(&mut self, token: &PinToken) -> Result<Vec<BiometricTemplate>> {
        match self.session.connection().enumerate_templates(token) {
            Ok(templates) => {
                debug!(count = templates.len(), "Enumerated templates");
                Ok(templates.into_iter().map(BiometricTemplate::from).collect())
            }
            Err(TransportError::Ctap(CtapStatus::InvalidOption)) => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn check_name_length(&mut self, name: &str) -> Result<()> {
        if let Some(max) = self.session.info()?.max_template_friendly_name {
            if name.len() > max {
                return Err(BiokeyError::ContractViolation(format!(
                    "template name is {} bytes; this key allows at most {max}",
                    name.len()
                )));
            }
        }
        Ok(())
    }

    /// Run the capture handshake. Returns the new template id.
    fn capture(&mut self, token: &PinToken) -> Result<Vec<u8>> {
        self.await_finger(None, None)?;
        let mut sample = self.session.connection().enroll_begin(token)?;

        loop {
            if sample.status.is_good() {
                debug!(remaining = sample.remaining_samples, "Good sample");
            } else {
                warn!(status = %sample.status, remaining = sample.remaining_samples, "Sample rejected");
            }
            if sample.remaining_samples == 0 {
                return Ok(sample.template_id);
            }

            self.await_finger(Some(sample.remaining_samples), Some(sample.status))?;
            sample = self
                .session
                .connection()
                .enroll_capture_next(token, &sample.template_id)?;
        }
    }

    fn await_finger(
        &mut self,
        remaining_samples: Option<u8>,
        last_status: Option<SampleStatus>,
    ) -> Result<()> {
        match self.session.prompt(&VerificationRequest::BioSample {
            remaining_samples,
            last_status,
        }) {
            CollectorResponse::Proceed => Ok(()),
            CollectorResponse::Cancel => Err(BiokeyError::Cancelled),
            CollectorResponse::Pin(_) => Err(BiokeyError::ContractViolation(
                "collector answered a fingerprint prompt with a PIN".into(),
            )),
        }
    }

    fn cancel_enrollment(&mut self) {
        if let Err(e) = self.session.connection().enroll_cancel() {
            warn!(error = %e, "Could not cancel enrollment");
        }
    }
}

fn enroll_failure(name: &str, error: BiokeyError) -> BiokeyError {
    match error {
        BiokeyError::Transport(status) => BiokeyError::rejected("enroll", name, status),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::ScriptedCollector;
    use crate::device::DeviceSelector;
    use crate::session::DeviceSessionManager;
    use crate::transport::mock::{MockTransport, SimulatedKey, DEFAULT_PIN};

    fn manager(key: &SimulatedKey) -> DeviceSessionManager<ScriptedCollector> {
        let collector = ScriptedCollector::new([CollectorResponse::Pin(DEFAULT_PIN.into())]);
        let mut manager = DeviceSessionManager::new(MockTransport::single(key.clone()), collector);
        manager.connect(DeviceSelector::Auto).unwrap();
        manager
    }

    fn template(id: &str, name: &str) -> BiometricTemplate {
        BiometricTemplate {
            id: TemplateId::parse(id).unwrap(),
            friendly_name: name.into(),
        }
    }

    #[test]
    fn test_template_id_parse() {
        let id = TemplateId::parse("AB12").unwrap();
        assert_eq!(id.as_bytes(), &[0xab, 0x12]);
        assert_eq!(id.to_string(), "ab12");
        assert_eq!("ab12".parse::<TemplateId>().unwrap(), id);

        for bad in ["", "abc", "zz12"] {
            assert!(matches!(
                TemplateId::parse(bad),
                Err(BiokeyError::ContractViolation(_))
            ));
        }
    }

    #[test]
    fn test_template_id_serializes_as_hex() {
        let json = serde_json::to_string(&template("0001", "RightIndex")).unwrap();
        assert_eq!(json, r#"{"id":"0001","name":"RightIndex"}"#);
    }

    #[test]
    fn test_selector_from_parts() {
        assert_eq!(
            TemplateSelector::from_parts(Some("LeftThumb"), None).unwrap(),
            TemplateSelector::ByName("LeftThumb".into())
        );
        assert!(matches!(
            TemplateSelector::from_parts(None, Some("0001")).unwrap(),
            TemplateSelector::ById(_)
        ));
        assert!(TemplateSelector::from_parts(Some("a"), Some("0001")).is_err());
        assert!(TemplateSelector::from_parts(None, None).is_err());
        assert!(TemplateSelector::from_parts(None, Some("xyz")).is_err());
    }

    #[test]
    fn test_selector_matching_ignores_case() {
        let t = template("ab12", "LeftThumb");
        assert!(TemplateSelector::ByName("leftthumb".into()).matches(&t));
        assert!(TemplateSelector::ById(TemplateId::parse("AB12").unwrap()).matches(&t));
        assert!(!TemplateSelector::ByName("Left".into()).matches(&t));
    }

    #[test]
    fn test_display_name_for_unnamed() {
        assert_eq!(template("0001", "").display_name(), "Unnamed");
        assert_eq!(template("0001", "A").display_name(), "A");
    }

    #[test]
    fn test_enumerate_empty_sensor() {
        let key = SimulatedKey::bio(1);
        let mut manager = manager(&key);
        let templates = manager
            .with_session(|s| BiometricTemplateRegistry::new(s).enumerate())
            .unwrap();
        assert!(templates.is_empty());
    }

    #[test]
    fn test_enroll_prompts_for_every_sample() {
        let key = SimulatedKey::bio(1)
            .with_samples_required(2)
            .with_sample_script([SampleStatus::PoorQuality]);
        let mut manager = manager(&key);
        for _ in 0..3 {
            manager.collector_mut().push(CollectorResponse::Proceed);
        }

        let enrolled = manager
            .with_session(|s| BiometricTemplateRegistry::new(s).enroll("LeftThumb"))
            .unwrap();
        assert_eq!(enrolled.friendly_name, "LeftThumb");

        let samples: Vec<_> = manager
            .collector()
            .requests()
            .iter()
            .filter_map(|r| match r {
                VerificationRequest::BioSample {
                    remaining_samples,
                    last_status,
                } => Some((*remaining_samples, *last_status)),
                _ => None,
            })
            .collect();
        assert_eq!(
            samples,
            vec![
                (None, None),
                (Some(2), Some(SampleStatus::PoorQuality)),
                (Some(1), Some(SampleStatus::Good)),
            ]
        );
        assert_eq!(key.templates().len(), 1);
    }

    #[test]
    fn test_enroll_cancelled_mid_capture_cleans_up() {
        let key = SimulatedKey::bio(1).with_samples_required(3);
        let mut manager = manager(&key);
        manager.collector_mut().push(CollectorResponse::Proceed);

        let err = manager
            .with_session(|s| BiometricTemplateRegistry::new(s).enroll("LeftThumb"))
            .unwrap_err();
        assert!(matches!(err, BiokeyError::Cancelled));
        assert!(key.templates().is_empty());
        assert!(key.commands().contains(&"cancelCurrentEnrollment"));
    }

    #[test]
    fn test_enroll_device_failure_names_template() {
        let key = SimulatedKey::bio(1).with_capture_failure(CtapStatus::UserActionTimeout);
        let mut manager = manager(&key);
        manager.collector_mut().push(CollectorResponse::Proceed);

        let err = manager
            .with_session(|s| BiometricTemplateRegistry::new(s).enroll("LeftThumb"))
            .unwrap_err();
        match err {
            BiokeyError::DeviceRejected {
                operation, context, ..
            } => {
                assert_eq!(operation, "enroll");
                assert_eq!(context, "LeftThumb");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(key.templates().is_empty());
    }

    #[test]
    fn test_enroll_without_sensor_is_warning() {
        let key = SimulatedKey::bio(1).without_fingerprint();
        let mut manager = manager(&key);
        let err = manager
            .with_session(|s| BiometricTemplateRegistry::new(s).enroll("LeftThumb"))
            .unwrap_err();
        assert!(err.is_warning());
        assert!(!key.commands().contains(&"enrollBegin"));
    }

    #[test]
    fn test_resolve_without_sensor_is_warning() {
        let key = SimulatedKey::bio(1).without_fingerprint();
        let mut manager = manager(&key);
        let err = manager
            .with_session(|s| {
                BiometricTemplateRegistry::new(s)
                    .resolve(&TemplateSelector::ById(TemplateId::parse("0001")?))
            })
            .unwrap_err();
        assert!(err.is_warning());
        assert!(!matches!(err, BiokeyError::NotFound { .. }));
        assert!(!key.commands().contains(&"enumerateEnrollments"));
    }

    #[test]
    fn test_name_longer_than_key_allows() {
        let key = SimulatedKey::bio(1);
        let mut manager = manager(&key);
        let err = manager
            .with_session(|s| BiometricTemplateRegistry::new(s).enroll("AVeryLongFingerName"))
            .unwrap_err();
        assert!(matches!(err, BiokeyError::ContractViolation(_)));
    }

    #[test]
    fn test_resolve_first_match_on_duplicate_names() {
        let key = SimulatedKey::bio(1)
            .with_template(0x0001, "Thumb")
            .with_template(0x0002, "thumb");
        let mut manager = manager(&key);
        let found = manager
            .with_session(|s| {
                BiometricTemplateRegistry::new(s).resolve(&TemplateSelector::ByName("THUMB".into()))
            })
            .unwrap();
        assert_eq!(found.id.to_hex(), "0001");
    }

    #[test]
    fn test_remove_declined_leaves_key_untouched() {
        let key = SimulatedKey::bio(1).with_template(0x0001, "Thumb");
        let mut manager = manager(&key);
        let outcome = manager
            .with_session(|s| {
                BiometricTemplateRegistry::new(s).remove(&template("0001", "Thumb"), false)
            })
            .unwrap();
        assert_eq!(outcome, RemoveOutcome::Declined);
        assert_eq!(key.templates().len(), 1);
        assert!(!key.commands().contains(&"removeEnrollment"));
    }

    #[test]
    fn test_remove_rejected_by_device() {
        let key = SimulatedKey::bio(1)
            .with_template(0x0001, "Thumb")
            .rejecting_removal();
        let mut manager = manager(&key);
        let err = manager
            .with_session(|s| {
                BiometricTemplateRegistry::new(s).remove(&template("0001", "Thumb"), true)
            })
            .unwrap_err();
        assert!(matches!(
            err,
            BiokeyError::DeviceRejected {
                operation: "remove",
                ..
            }
        ));
        // The device stays connected after a rejected command.
        assert!(manager.active_device().is_some());
    }
}
