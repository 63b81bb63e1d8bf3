//! Fingerprint template commands.

use anyhow::{Context as _, Result};
use biokey_core::{BiometricTemplateRegistry, RemoveOutcome, TemplateSelector};
use colored::Colorize;

use super::Context;
use crate::prompt;

/// List the fingerprints enrolled on the key.
pub async fn list(ctx: &Context) -> Result<()> {
    let templates = ctx
        .with_device(|manager| {
            let templates = manager
                .with_session(|session| {
                    let mut registry = BiometricTemplateRegistry::new(session);
                    registry.require_fingerprint()?;
                    registry.enumerate()
                })
                .context("Failed to list fingerprints")?;
            Ok(templates)
        })
        .await?;

    if templates.is_empty() {
        println!("{}", "No fingerprints enrolled".dimmed());
        return Ok(());
    }

    println!("{}", format!("{} fingerprint(s) enrolled:", templates.len()).bold());
    for template in &templates {
        let name = if template.friendly_name.is_empty() {
            template.display_name().dimmed()
        } else {
            template.display_name().normal()
        };
        println!("   {}  {}", template.id.to_string().cyan(), name);
    }
    Ok(())
}

/// Enroll a new fingerprint under `name`.
pub async fn enroll(ctx: &Context, name: String) -> Result<()> {
    let template = ctx
        .with_device(move |manager| {
            let template = manager
                .with_session(|session| BiometricTemplateRegistry::new(session).enroll(&name))
                .context("Failed to enroll fingerprint")?;
            Ok(template)
        })
        .await?;

    println!(
        "{} Enrolled '{}' (id {})",
        "✓".green().bold(),
        template.display_name(),
        template.id.to_string().cyan()
    );
    Ok(())
}

/// Give an enrolled fingerprint a new name.
pub async fn rename(
    ctx: &Context,
    name: Option<String>,
    id: Option<String>,
    new_name: String,
) -> Result<()> {
    let selector = TemplateSelector::from_parts(name.as_deref(), id.as_deref())?;

    let (old, renamed) = ctx
        .with_device(move |manager| {
            let renamed = manager
                .with_session(|session| {
                    let mut registry = BiometricTemplateRegistry::new(session);
                    let template = registry.resolve(&selector)?;
                    let renamed = registry.rename(&template, &new_name)?;
                    Ok((template, renamed))
                })
                .context("Failed to rename fingerprint")?;
            Ok(renamed)
        })
        .await?;

    println!(
        "{} Renamed '{}' to '{}' (id {})",
        "✓".green().bold(),
        old.display_name(),
        renamed.display_name(),
        renamed.id.to_string().cyan()
    );
    Ok(())
}

/// Delete an enrolled fingerprint, asking first unless `yes` is set.
pub async fn remove(
    ctx: &Context,
    name: Option<String>,
    id: Option<String>,
    yes: bool,
) -> Result<()> {
    let selector = TemplateSelector::from_parts(name.as_deref(), id.as_deref())?;

    let (template, outcome) = ctx
        .with_device(move |manager| {
            let removed = manager
                .with_session(|session| {
                    let mut registry = BiometricTemplateRegistry::new(session);
                    let template = registry.resolve(&selector)?;
                    let proceed = yes
                        || prompt::confirm(&format!(
                            "Remove fingerprint '{}' (id {})?",
                            template.display_name(),
                            template.id
                        ));
                    let outcome = registry.remove(&template, proceed)?;
                    Ok((template, outcome))
                })
                .context("Failed to remove fingerprint")?;
            Ok(removed)
        })
        .await?;

    match outcome {
        RemoveOutcome::Removed => println!(
            "{} Removed '{}' (id {})",
            "✓".green().bold(),
            template.display_name(),
            template.id.to_string().cyan()
        ),
        RemoveOutcome::Declined => println!("{}", "Removal cancelled".yellow()),
    }
    Ok(())
}
