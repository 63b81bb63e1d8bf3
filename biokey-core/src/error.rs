use thiserror::Error;

use crate::bio::TemplateSelector;
use crate::transport::TransportError;

/// Why a device could not be connected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("No security key found")]
    NoDevice,

    #[error("Found {count} security keys; select one by serial number")]
    Ambiguous { count: usize },

    #[error("No security key with serial number {serial}")]
    SerialNotFound { serial: u32 },

    #[error("Failed to open security key: {0}")]
    Transport(String),
}

#[derive(Error, Debug)]
pub enum BiokeyError {
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Security key does not support {capability}")]
    CapabilityUnsupported { capability: &'static str },

    #[error("No biometric template matches {selector}")]
    NotFound { selector: TemplateSelector },

    #[error("Verification failed: {reason}{}", format_retries(.retries_remaining))]
    Verification {
        reason: String,
        retries_remaining: Option<u8>,
    },

    #[error("Security key rejected {operation} ({context}): {status}")]
    DeviceRejected {
        operation: &'static str,
        context: String,
        #[source]
        status: TransportError,
    },

    #[error("Invalid request: {0}")]
    ContractViolation(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("No PIN is set on the security key")]
    PinNotSet,

    #[error("Malformed response from security key: {0}")]
    MalformedResponse(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

fn format_retries(retries: &Option<u8>) -> String {
    match retries {
        Some(n) => format!(" ({n} retries remaining)"),
        None => String::new(),
    }
}

impl BiokeyError {
    /// Errors that callers report as a warning and skip, rather than abort on.
    pub fn is_warning(&self) -> bool {
        matches!(self, Self::CapabilityUnsupported { .. })
    }

    /// Remaining verification attempts, when the device reported them.
    pub fn retries_remaining(&self) -> Option<u8> {
        match self {
            Self::Verification {
                retries_remaining, ..
            } => *retries_remaining,
            _ => None,
        }
    }

    pub(crate) fn rejected(
        operation: &'static str,
        context: impl Into<String>,
        status: TransportError,
    ) -> Self {
        Self::DeviceRejected {
            operation,
            context: context.into(),
            status,
        }
    }
}

pub type Result<T> = std::result::Result<T, BiokeyError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bio::TemplateId;

    #[test]
    fn test_verification_message_includes_retries() {
        let err = BiokeyError::Verification {
            reason: "incorrect PIN".into(),
            retries_remaining: Some(5),
        };
        assert_eq!(
            err.to_string(),
            "Verification failed: incorrect PIN (5 retries remaining)"
        );
        assert_eq!(err.retries_remaining(), Some(5));
    }

    #[test]
    fn test_not_found_names_selector() {
        let id = TemplateId::parse("ab12").unwrap();
        let err = BiokeyError::NotFound {
            selector: TemplateSelector::ById(id),
        };
        assert!(err.to_string().contains("id 'ab12'"));

        let err = BiokeyError::NotFound {
            selector: TemplateSelector::ByName("LeftThumb".into()),
        };
        assert!(err.to_string().contains("name 'LeftThumb'"));
    }

    #[test]
    fn test_serial_not_found_names_serial() {
        let err: BiokeyError = ConnectionError::SerialNotFound { serial: 99999 }.into();
        assert!(err.to_string().contains("99999"));
        assert!(!err.is_warning());
    }

    #[test]
    fn test_capability_is_warning() {
        let err = BiokeyError::CapabilityUnsupported {
            capability: "fingerprint enrollment",
        };
        assert!(err.is_warning());
    }
}
