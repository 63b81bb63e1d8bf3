//! PIN management commands.

use anyhow::{Context as _, Result};
use biokey_core::SecretPin;
use colored::Colorize;

use super::Context;

/// Show how many PIN attempts remain before the key blocks.
pub async fn retries(ctx: &Context) -> Result<()> {
    let retries = ctx
        .with_device(|manager| {
            let retries = manager
                .with_session(|session| {
                    if !session.info()?.pin_set() {
                        return Ok(None);
                    }
                    session.pin_retries().map(Some)
                })
                .context("Failed to read PIN retries")?;
            Ok(retries)
        })
        .await?;

    match retries {
        Some(0) => println!("{}", "PIN is blocked (0 retries remaining)".red().bold()),
        Some(n) if n <= 3 => println!("{}", format!("{n} PIN retries remaining").yellow()),
        Some(n) => println!("{n} PIN retries remaining"),
        None => println!("{}", "No PIN is set".dimmed()),
    }
    Ok(())
}

/// Set the first PIN on a key that has none.
pub async fn set(ctx: &Context, new_pin: Option<String>) -> Result<()> {
    let new_pin = new_pin.map(|pin| SecretPin::from(pin.as_str()));
    ctx.with_device(move |manager| {
        manager
            .with_session(|session| session.set_pin(new_pin))
            .context("Failed to set PIN")?;
        Ok(())
    })
    .await?;

    println!("{} PIN set", "✓".green().bold());
    Ok(())
}

/// Replace the current PIN.
pub async fn change(ctx: &Context, new_pin: Option<String>) -> Result<()> {
    let new_pin = new_pin.map(|pin| SecretPin::from(pin.as_str()));
    ctx.with_device(move |manager| {
        manager
            .with_session(|session| session.change_pin(new_pin))
            .context("Failed to change PIN")?;
        Ok(())
    })
    .await?;

    println!("{} PIN changed", "✓".green().bold());
    Ok(())
}
