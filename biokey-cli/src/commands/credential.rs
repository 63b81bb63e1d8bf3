//! Credential creation command.

use anyhow::{Context as _, Result};
use biokey_core::{
    Challenge, EncodedCredential, MakeCredentialOptions, RelyingParty, UserEntity,
};
use colored::Colorize;
use tracing::info;

use super::Context;

/// Arguments for `credential new`.
pub struct NewCredential {
    pub rp_id: String,
    pub rp_name: Option<String>,
    pub user_name: String,
    pub display_name: Option<String>,
    pub challenge: Option<String>,
    pub resident_key: bool,
}

/// Create a credential and print its WebAuthn encodings as JSON.
pub async fn new(ctx: &Context, args: NewCredential) -> Result<()> {
    // Malformed input is reported before the key is touched
    let challenge = match &args.challenge {
        Some(text) => Challenge::from_base64(text)?,
        None => Challenge::from_relying_party(&args.rp_id),
    };

    let mut rp = RelyingParty::new(&args.rp_id);
    if let Some(name) = &args.rp_name {
        rp = rp.with_name(name);
    }
    let mut user = UserEntity::with_random_id(&args.user_name);
    if let Some(display_name) = &args.display_name {
        user = user.with_display_name(display_name);
    }
    let options = MakeCredentialOptions {
        resident_key: args.resident_key,
        origin: ctx.origin.clone(),
    };

    if !ctx.quiet {
        eprintln!(
            "{} {} {}",
            "Creating credential for".dimmed(),
            args.user_name.bold(),
            format!("on {}", args.rp_id).dimmed()
        );
    }

    let encoded = ctx
        .with_device(move |manager| {
            let attestation = manager
                .with_session(|session| {
                    session.make_credential(&rp, &user, &challenge, &options)
                })
                .context("Failed to create credential")?;
            let encoded = EncodedCredential::from_attestation(&attestation, &challenge)
                .context("Failed to encode attestation")?;
            Ok(encoded)
        })
        .await?;

    info!(
        rp_id = %encoded.rp_id,
        credential_id = %encoded.credential_id,
        "Credential created"
    );

    let json = serde_json::to_string_pretty(&encoded).context("Failed to serialize credential")?;
    println!("{json}");
    Ok(())
}
