//! Exit codes following sysexits.h conventions.
//!
//! These codes provide semantic meaning for different failure modes,
//! enabling scripts and CI systems to handle errors appropriately.

use biokey_core::{BiokeyError, ConnectionError};

use crate::commands::TimedOut;

/// Successful execution, including skipped operations the key cannot do.
pub const SUCCESS: i32 = 0;

/// General error (catch-all, cancelled prompts).
pub const GENERAL_ERROR: i32 = 1;

/// Command line usage error (invalid arguments, ambiguous device).
/// Maps to EX_USAGE from sysexits.h.
pub const USAGE_ERROR: i32 = 64;

/// PIN verification failed or no PIN is set.
/// Maps to EX_DATAERR from sysexits.h.
pub const VERIFICATION_FAILED: i32 = 65;

/// No matching security key or template.
/// Maps to EX_NOINPUT from sysexits.h.
pub const NOT_FOUND: i32 = 66;

/// Key unavailable or it rejected the command.
/// Maps to EX_UNAVAILABLE from sysexits.h.
pub const UNAVAILABLE: i32 = 69;

/// The key did not answer in time.
/// Maps to EX_TEMPFAIL from sysexits.h.
pub const TIMEOUT: i32 = 75;

/// Represents an exit code with optional error context.
pub struct ExitCode {
    pub code: i32,
    pub message: Option<String>,
}

impl ExitCode {
    pub const fn success() -> Self {
        Self {
            code: SUCCESS,
            message: None,
        }
    }

    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        let message = format!("{err:#}");

        // Classify error by inspecting the chain
        let code = if err.chain().any(|e| e.is::<TimedOut>()) {
            TIMEOUT
        } else if let Some(err) = err.chain().find_map(|e| e.downcast_ref::<BiokeyError>()) {
            classify(err)
        } else {
            GENERAL_ERROR
        };

        Self {
            code,
            message: Some(message),
        }
    }

    /// Success that still carries a message to show as a warning.
    pub fn is_warning(&self) -> bool {
        self.code == SUCCESS && self.message.is_some()
    }
}

fn classify(err: &BiokeyError) -> i32 {
    if err.is_warning() {
        return SUCCESS;
    }
    match err {
        BiokeyError::Connection(ConnectionError::NoDevice)
        | BiokeyError::Connection(ConnectionError::SerialNotFound { .. })
        | BiokeyError::NotFound { .. } => NOT_FOUND,
        BiokeyError::Connection(ConnectionError::Ambiguous { .. })
        | BiokeyError::ContractViolation(_) => USAGE_ERROR,
        BiokeyError::Verification { .. } | BiokeyError::PinNotSet => VERIFICATION_FAILED,
        BiokeyError::Connection(ConnectionError::Transport(_))
        | BiokeyError::DeviceRejected { .. }
        | BiokeyError::MalformedResponse(_)
        | BiokeyError::Transport(_) => UNAVAILABLE,
        _ => GENERAL_ERROR,
    }
}
