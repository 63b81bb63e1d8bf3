//! Biokey CLI - Fingerprint, PIN and credential management for FIDO2 security keys.

use std::time::Duration;

use anyhow::Result;
use biokey_core::{Config, SecretPin};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing_subscriber::EnvFilter;

mod commands;
mod exit_codes;
mod prompt;

use commands::credential::NewCredential;
use commands::Context;
use exit_codes::ExitCode;

const EXIT_CODES_HELP: &str = "\
Exit codes:
  0   Success (or skipped: the key has no fingerprint sensor)
  1   General error or cancelled prompt
  64  Invalid arguments or ambiguous device selection
  65  PIN verification failed or no PIN set
  66  No matching security key or fingerprint
  69  Security key unavailable or rejected the command
  75  Timed out waiting for the security key";

#[derive(Parser)]
#[command(name = "biokey")]
#[command(author, version, about = "Manage fingerprints, PINs and credentials on FIDO2 security keys", long_about = None)]
#[command(after_help = EXIT_CODES_HELP)]
struct Cli {
    /// Serial number of the key to use (defaults to $BIOKEY_SERIAL, or the only key attached)
    #[arg(long, global = true)]
    serial: Option<u32>,

    /// Use a simulated security key instead of real hardware
    #[arg(long, global = true)]
    mock: bool,

    /// PIN to verify with instead of prompting (typed PINs are never echoed)
    #[arg(long, global = true, env = "BIOKEY_PIN", hide_env_values = true)]
    pin: Option<String>,

    /// Seconds to wait for the key before giving up (defaults to $BIOKEY_TIMEOUT_SECS, or 60)
    #[arg(long, global = true, value_name = "SECS")]
    timeout: Option<u64>,

    /// Origin recorded in client data (defaults to $BIOKEY_ORIGIN, or https://<rp id>)
    #[arg(long, global = true)]
    origin: Option<String>,

    /// Show debug logs on stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Suppress prompts and hints on stderr
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show details about the connected security key
    Info,

    /// Manage enrolled fingerprints
    Bio {
        #[command(subcommand)]
        command: BioCommands,
    },

    /// Create WebAuthn credentials
    Credential {
        #[command(subcommand)]
        command: CredentialCommands,
    },

    /// Manage the key's PIN
    Pin {
        #[command(subcommand)]
        command: PinCommands,
    },
}

#[derive(Subcommand)]
enum BioCommands {
    /// List enrolled fingerprints
    List,

    /// Enroll a new fingerprint
    Enroll {
        /// Friendly name for the fingerprint
        #[arg(long)]
        name: String,
    },

    /// Rename an enrolled fingerprint
    Rename {
        /// Current name of the fingerprint
        #[arg(long)]
        name: Option<String>,

        /// Template id (hex) of the fingerprint
        #[arg(long)]
        id: Option<String>,

        /// New friendly name
        #[arg(long)]
        new_name: String,
    },

    /// Remove an enrolled fingerprint
    Remove {
        /// Name of the fingerprint
        #[arg(long)]
        name: Option<String>,

        /// Template id (hex) of the fingerprint
        #[arg(long)]
        id: Option<String>,

        /// Remove without asking for confirmation
        #[arg(short, long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
enum CredentialCommands {
    /// Create a credential and print its attestation as JSON
    New {
        /// Relying party id, e.g. example.com
        #[arg(long)]
        rp_id: String,

        /// Relying party display name
        #[arg(long)]
        rp_name: Option<String>,

        /// User account name
        #[arg(long)]
        user_name: String,

        /// User display name (defaults to the account name)
        #[arg(long)]
        display_name: Option<String>,

        /// Base64 challenge from the relying party (generated when omitted)
        #[arg(long)]
        challenge: Option<String>,

        /// Store the credential on the key
        #[arg(long)]
        resident_key: bool,
    },
}

#[derive(Subcommand)]
enum PinCommands {
    /// Show remaining PIN attempts
    Retries,

    /// Set a PIN on a key that has none
    Set {
        /// The new PIN (prompted for when omitted)
        #[arg(long, env = "BIOKEY_NEW_PIN", hide_env_values = true)]
        new_pin: Option<String>,
    },

    /// Change the current PIN
    Change {
        /// The new PIN (prompted for when omitted)
        #[arg(long, env = "BIOKEY_NEW_PIN", hide_env_values = true)]
        new_pin: Option<String>,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "biokey_cli=debug,biokey_core=debug"
    } else {
        "error"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn context(cli: &Cli) -> Context {
    let config = Config::from_env();
    Context {
        serial: cli.serial.or(config.serial),
        mock: cli.mock,
        pin: cli.pin.as_deref().map(SecretPin::from),
        timeout: cli
            .timeout
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(config.timeout),
        origin: cli.origin.clone().or(config.origin),
        quiet: cli.quiet,
    }
}

async fn run(cli: Cli) -> Result<()> {
    let ctx = context(&cli);

    match cli.command {
        Commands::Info => commands::info::execute(&ctx).await,
        Commands::Bio { command } => match command {
            BioCommands::List => commands::bio::list(&ctx).await,
            BioCommands::Enroll { name } => commands::bio::enroll(&ctx, name).await,
            BioCommands::Rename { name, id, new_name } => {
                commands::bio::rename(&ctx, name, id, new_name).await
            }
            BioCommands::Remove { name, id, yes } => {
                commands::bio::remove(&ctx, name, id, yes).await
            }
        },
        Commands::Credential { command } => match command {
            CredentialCommands::New {
                rp_id,
                rp_name,
                user_name,
                display_name,
                challenge,
                resident_key,
            } => {
                let args = NewCredential {
                    rp_id,
                    rp_name,
                    user_name,
                    display_name,
                    challenge,
                    resident_key,
                };
                commands::credential::new(&ctx, args).await
            }
        },
        Commands::Pin { command } => match command {
            PinCommands::Retries => commands::pin::retries(&ctx).await,
            PinCommands::Set { new_pin } => commands::pin::set(&ctx, new_pin).await,
            PinCommands::Change { new_pin } => commands::pin::change(&ctx, new_pin).await,
        },
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let exit = match run(cli).await {
        Ok(()) => ExitCode::success(),
        Err(err) => ExitCode::from_anyhow(&err),
    };

    if let Some(message) = &exit.message {
        if exit.is_warning() {
            eprintln!("{} {}", "warning:".yellow().bold(), message);
        } else {
            eprintln!("{} {}", "error:".red().bold(), message);
        }
    }

    // A prompt abandoned on timeout may still be blocked on stdin; exiting
    // here keeps runtime shutdown from waiting on it.
    std::process::exit(exit.code);
}
