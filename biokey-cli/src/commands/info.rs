//! Info command implementation.

use anyhow::{Context as _, Result};
use biokey_core::{AuthenticatorInfo, BioModality, BiometricTemplateRegistry, DeviceHandle};
use colored::Colorize;
use tracing::info;

use super::Context;

struct Report {
    device: DeviceHandle,
    info: AuthenticatorInfo,
    pin_retries: Option<u8>,
    modality: Option<BioModality>,
}

/// Execute the info command.
pub async fn execute(ctx: &Context) -> Result<()> {
    let report = ctx
        .with_device(|manager| {
            let device = manager.ensure_connected()?;
            let report = manager
                .with_session(|session| {
                    let info = session.info()?;
                    let pin_retries = if info.pin_set() {
                        Some(session.pin_retries()?)
                    } else {
                        None
                    };
                    let modality = BiometricTemplateRegistry::new(session).modality()?;
                    Ok(Report {
                        device,
                        info,
                        pin_retries,
                        modality,
                    })
                })
                .context("Failed to read authenticator info")?;
            Ok(report)
        })
        .await?;

    info!(device = %report.device, "Read authenticator info");

    let Report {
        device,
        info,
        pin_retries,
        modality,
    } = report;
    let transports: Vec<String> = device.transports.iter().map(ToString::to_string).collect();

    println!();
    println!("{}", device.name.bold());
    println!();
    match device.serial {
        Some(serial) => println!("   {} {}", "Serial:".dimmed(), serial),
        None => println!("   {} {}", "Serial:".dimmed(), "unavailable".dimmed()),
    }
    println!("   {} {}", "Firmware:".dimmed(), device.firmware);
    println!("   {} {}", "Transports:".dimmed(), transports.join(", "));
    println!("   {} {}", "Versions:".dimmed(), info.versions.join(", "));
    println!("   {} {}", "AAGUID:".dimmed(), hex::encode(info.aaguid));
    println!(
        "   {} {}",
        "PIN:".dimmed(),
        match (info.pin_set(), pin_retries) {
            (true, Some(n)) => format!("set ({n} retries remaining)").green(),
            (true, None) => "set".green(),
            (false, _) if info.supports_pin() => "not set".yellow(),
            (false, _) => "unsupported".dimmed(),
        }
    );
    println!(
        "   {} {}",
        "Fingerprint:".dimmed(),
        match modality {
            Some(BioModality::Fingerprint) => "supported".green(),
            Some(BioModality::Other(code)) => format!("unknown modality 0x{code:02x}").yellow(),
            None => "unsupported".dimmed(),
        }
    );
    let options: Vec<String> = info
        .options
        .iter()
        .map(|(name, enabled)| format!("{name}={enabled}"))
        .collect();
    println!("   {} {}", "Options:".dimmed(), options.join(" "));

    Ok(())
}

