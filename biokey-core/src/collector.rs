//! User verification callbacks.
//!
//! Session operations that need a human (a PIN, a touch, a fingerprint
//! sample) call back into a [`UserVerificationCollector`]. The call is
//! synchronous and may block for as long as the collector likes; the
//! collector answers with the material or cancels.
//!
//! Retry policy does not live here. When the key rejects a PIN the session
//! asks the key for its remaining-attempt counter and passes it along in the
//! next [`VerificationRequest::Pin`]; the collector only chooses between
//! trying again and [`CollectorResponse::Cancel`].

use std::collections::VecDeque;
use std::fmt;

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{BiokeyError, Result};
use crate::transport::SampleStatus;

/// Minimum PIN length in bytes accepted by CTAP2 authenticators.
pub const MIN_PIN_LEN: usize = 4;
/// Maximum PIN length in bytes accepted by CTAP2 authenticators.
pub const MAX_PIN_LEN: usize = 63;

/// A PIN held in memory only as long as needed. Wiped on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SecretPin(Vec<u8>);

impl SecretPin {
    pub fn new(pin: impl Into<Vec<u8>>) -> Self {
        Self(pin.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Check the PIN against the CTAP2 length rules before it is sent anywhere.
    pub fn validate(&self) -> Result<()> {
        if std::str::from_utf8(&self.0).is_err() {
            return Err(BiokeyError::ContractViolation(
                "PIN must be valid UTF-8".into(),
            ));
        }
        if !(MIN_PIN_LEN..=MAX_PIN_LEN).contains(&self.0.len()) {
            return Err(BiokeyError::ContractViolation(format!(
                "PIN must be between {MIN_PIN_LEN} and {MAX_PIN_LEN} bytes"
            )));
        }
        Ok(())
    }
}

impl From<&str> for SecretPin {
    fn from(pin: &str) -> Self {
        Self::new(pin.as_bytes())
    }
}

impl fmt::Debug for SecretPin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretPin([REDACTED])")
    }
}

/// What a session needs from the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationRequest {
    /// Enter the current PIN. `attempt_failed` is set after the key rejected
    /// the previous one.
    Pin {
        retries_remaining: Option<u8>,
        attempt_failed: bool,
    },
    /// Choose a new PIN.
    NewPin,
    /// Touch the key to confirm presence.
    Touch,
    /// Place a finger on the sensor for the next enrollment sample.
    BioSample {
        remaining_samples: Option<u8>,
        last_status: Option<SampleStatus>,
    },
}

/// The collector's answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectorResponse {
    Pin(SecretPin),
    Proceed,
    Cancel,
}

/// Satisfies interactive prompts raised in the middle of a session operation.
pub trait UserVerificationCollector: Send {
    fn collect(&mut self, request: &VerificationRequest) -> CollectorResponse;
}

impl<F> UserVerificationCollector for F
where
    F: FnMut(&VerificationRequest) -> CollectorResponse + Send,
{
    fn collect(&mut self, request: &VerificationRequest) -> CollectorResponse {
        self(request)
    }
}

/// Answers prompts from a prepared queue and records what was asked.
///
/// Once the queue runs dry every further prompt is cancelled.
#[derive(Debug, Default)]
pub struct ScriptedCollector {
    responses: VecDeque<CollectorResponse>,
    requests: Vec<VerificationRequest>,
}

impl ScriptedCollector {
    pub fn new(responses: impl IntoIterator<Item = CollectorResponse>) -> Self {
        Self {
            responses: responses.into_iter().collect(),
            requests: Vec::new(),
        }
    }

    pub fn push(&mut self, response: CollectorResponse) {
        self.responses.push_back(response);
    }

    /// Every request seen so far, oldest first.
    pub fn requests(&self) -> &[VerificationRequest] {
        &self.requests
    }
}

impl UserVerificationCollector for ScriptedCollector {
    fn collect(&mut self, request: &VerificationRequest) -> CollectorResponse {
        self.requests.push(request.clone());
        self.responses.pop_front().unwrap_or(CollectorResponse::Cancel)
    }
}

/// Non-interactive collector for automation: supplies one PIN, proceeds on
/// every touch and sample prompt.
///
/// A rejected PIN is not offered again, so a wrong value costs one retry
/// rather than draining the counter.
#[derive(Debug)]
pub struct StaticPinCollector {
    pin: Option<SecretPin>,
    new_pin: Option<SecretPin>,
}

impl StaticPinCollector {
    pub fn new(pin: Option<SecretPin>) -> Self {
        Self { pin, new_pin: None }
    }

    pub fn with_new_pin(mut self, new_pin: SecretPin) -> Self {
        self.new_pin = Some(new_pin);
        self
    }
}

impl UserVerificationCollector for StaticPinCollector {
    fn collect(&mut self, request: &VerificationRequest) -> CollectorResponse {
        match request {
            VerificationRequest::Pin {
                attempt_failed: false,
                ..
            } => self
                .pin
                .clone()
                .map_or(CollectorResponse::Cancel, CollectorResponse::Pin),
            VerificationRequest::Pin { .. } => CollectorResponse::Cancel,
            VerificationRequest::NewPin => self
                .new_pin
                .clone()
                .map_or(CollectorResponse::Cancel, CollectorResponse::Pin),
            VerificationRequest::Touch | VerificationRequest::BioSample { .. } => {
                CollectorResponse::Proceed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pin_length_rules() {
        assert!(SecretPin::from("1234").validate().is_ok());
        assert!(SecretPin::from("123").validate().is_err());
        assert!(SecretPin::new(vec![b'1'; 64]).validate().is_err());
        assert!(SecretPin::new(vec![0xFF, 0xFE, 0xFD, 0xFC]).validate().is_err());
    }

    #[test]
    fn test_pin_debug_is_redacted() {
        let rendered = format!("{:?}", SecretPin::from("123456"));
        assert!(!rendered.contains("123456"));
    }

    #[test]
    fn test_scripted_collector_records_and_cancels_when_exhausted() {
        let mut collector = ScriptedCollector::new([CollectorResponse::Proceed]);
        assert_eq!(
            collector.collect(&VerificationRequest::Touch),
            CollectorResponse::Proceed
        );
        assert_eq!(
            collector.collect(&VerificationRequest::NewPin),
            CollectorResponse::Cancel
        );
        assert_eq!(
            collector.requests(),
            &[VerificationRequest::Touch, VerificationRequest::NewPin]
        );
    }

    #[test]
    fn test_static_collector_gives_up_after_rejection() {
        let mut collector = StaticPinCollector::new(Some("123456".into()));
        let first = collector.collect(&VerificationRequest::Pin {
            retries_remaining: Some(8),
            attempt_failed: false,
        });
        assert_eq!(first, CollectorResponse::Pin("123456".into()));

        let retry = collector.collect(&VerificationRequest::Pin {
            retries_remaining: Some(7),
            attempt_failed: true,
        });
        assert_eq!(retry, CollectorResponse::Cancel);
        assert_eq!(
            collector.collect(&VerificationRequest::Touch),
            CollectorResponse::Proceed
        );
    }

    #[test]
    fn test_closure_collector() {
        let mut collector = |request: &VerificationRequest| match request {
            VerificationRequest::Touch => CollectorResponse::Proceed,
            _ => CollectorResponse::Cancel,
        };
        assert_eq!(
            UserVerificationCollector::collect(&mut collector, &VerificationRequest::Touch),
            CollectorResponse::Proceed
        );
    }
}
