//! Subcommand implementations and the plumbing they share.

pub mod bio;
pub mod credential;
pub mod info;
pub mod pin;

use std::time::Duration;

use anyhow::{Context as _, Result};
use biokey_core::{
    BiokeyError, ConnectionError, DeviceSelector, DeviceSessionManager, KeyTransport,
    MockTransport, SecretPin,
};
use colored::Colorize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::prompt::ConsoleCollector;

pub type Manager = DeviceSessionManager<ConsoleCollector>;

/// The key did not finish an operation in time.
#[derive(Error, Debug)]
#[error("Timed out after {}s waiting for the security key; remove and re-insert it, then try again", .0.as_secs())]
pub struct TimedOut(pub Duration);

/// Settings shared by every subcommand.
#[derive(Clone)]
pub struct Context {
    pub serial: Option<u32>,
    pub mock: bool,
    pub pin: Option<SecretPin>,
    pub timeout: Duration,
    pub origin: Option<String>,
    pub quiet: bool,
}

impl Context {
    fn transport(&self) -> Result<Box<dyn KeyTransport>> {
        if self.mock {
            warn!("Using the simulated security key");
            if !self.quiet {
                eprintln!("{}", "Using simulated security key (--mock)".yellow());
            }
            return Ok(Box::new(MockTransport::demo()));
        }
        Err(BiokeyError::from(ConnectionError::Transport(
            "no hardware key transport is available in this build; pass --mock to use the simulated key"
                .into(),
        ))
        .into())
    }

    fn manager(&self) -> Result<Manager> {
        let collector = ConsoleCollector::new(self.pin.clone(), self.quiet);
        let mut manager = DeviceSessionManager::new(self.transport()?, collector);
        manager
            .connect(DeviceSelector::from_serial(self.serial))
            .context("Failed to connect to security key")?;
        Ok(manager)
    }

    /// Connect, run `f` on a blocking thread under the configured timeout,
    /// then disconnect.
    pub async fn with_device<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Manager) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let ctx = self.clone();
        run_blocking(self.timeout, move || {
            let mut manager = ctx.manager()?;
            let result = f(&mut manager).map_err(|e| explain_cancel(e, &manager));
            manager.disconnect();
            result
        })
        .await
    }
}

/// A cancelled PIN prompt after a rejected `--pin` is a verification failure.
fn explain_cancel(err: anyhow::Error, manager: &Manager) -> anyhow::Error {
    let cancelled = err
        .chain()
        .any(|e| matches!(e.downcast_ref::<BiokeyError>(), Some(BiokeyError::Cancelled)));
    match manager.collector().preset_rejected() {
        Some(retries_remaining) if cancelled => BiokeyError::Verification {
            reason: "incorrect PIN".into(),
            retries_remaining,
        }
        .into(),
        _ => err,
    }
}

/// Run blocking device work off the async runtime, abandoning it on timeout.
pub async fn run_blocking<T, F>(timeout: Duration, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    debug!(timeout_secs = timeout.as_secs(), "Starting device operation");
    let task = tokio::task::spawn_blocking(f);
    match tokio::time::timeout(timeout, task).await {
        Ok(joined) => joined.context("Device operation panicked")?,
        Err(_) => Err(TimedOut(timeout).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_blocking_returns_value() {
        let value = run_blocking(Duration::from_secs(5), || Ok(42)).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_run_blocking_times_out() {
        let err = run_blocking(Duration::from_millis(20), || {
            std::thread::sleep(Duration::from_millis(500));
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(err.is::<TimedOut>());
        assert!(err.to_string().contains("re-insert"));
    }

    #[tokio::test]
    async fn test_without_mock_there_is_no_transport() {
        let ctx = Context {
            serial: None,
            mock: false,
            pin: None,
            timeout: Duration::from_secs(5),
            origin: None,
            quiet: true,
        };
        let err = ctx.with_device(|_| Ok(())).await.unwrap_err();
        assert!(err.to_string().contains("--mock"));
    }
}
