//! Console prompts for PINs, touches and fingerprint samples.

use std::io::{self, BufRead, IsTerminal, Write};

use biokey_core::{CollectorResponse, SecretPin, UserVerificationCollector, VerificationRequest};
use colored::Colorize;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal;
use zeroize::Zeroizing;

/// Answers session prompts on the terminal.
///
/// With a preset PIN (`--pin` / `BIOKEY_PIN`) no PIN is ever read from
/// stdin. The preset is offered once; when the key rejects it the prompt is
/// cancelled and the retry count the key reported is kept for the error.
pub struct ConsoleCollector {
    preset_pin: Option<SecretPin>,
    quiet: bool,
    rejected_with: Option<Option<u8>>,
}

impl ConsoleCollector {
    pub fn new(preset_pin: Option<SecretPin>, quiet: bool) -> Self {
        Self {
            preset_pin,
            quiet,
            rejected_with: None,
        }
    }

    /// Retries reported after the preset PIN was rejected, if it was.
    pub fn preset_rejected(&self) -> Option<Option<u8>> {
        self.rejected_with
    }

    fn hint(&self, message: &str) {
        if !self.quiet {
            eprintln!("{}", message.cyan());
        }
    }

    fn collect_pin(
        &mut self,
        retries_remaining: Option<u8>,
        attempt_failed: bool,
    ) -> CollectorResponse {
        if let Some(pin) = &self.preset_pin {
            if attempt_failed {
                self.rejected_with = Some(retries_remaining);
                return CollectorResponse::Cancel;
            }
            return CollectorResponse::Pin(pin.clone());
        }

        if attempt_failed {
            eprintln!("{}", "Incorrect PIN.".red());
        }
        let label = match retries_remaining {
            Some(n) => format!("Enter PIN ({n} attempts left): "),
            None => "Enter PIN: ".to_string(),
        };
        read_secret(&label).map_or(CollectorResponse::Cancel, |pin| {
            CollectorResponse::Pin(SecretPin::from(pin.as_str()))
        })
    }

    fn collect_new_pin(&mut self) -> CollectorResponse {
        let Some(first) = read_secret("New PIN: ") else {
            return CollectorResponse::Cancel;
        };
        let Some(second) = read_secret("Confirm new PIN: ") else {
            return CollectorResponse::Cancel;
        };
        if first != second {
            eprintln!("{}", "PINs do not match.".red());
            return CollectorResponse::Cancel;
        }
        CollectorResponse::Pin(SecretPin::from(first.as_str()))
    }
}

impl UserVerificationCollector for ConsoleCollector {
    fn collect(&mut self, request: &VerificationRequest) -> CollectorResponse {
        match request {
            VerificationRequest::Pin {
                retries_remaining,
                attempt_failed,
            } => self.collect_pin(*retries_remaining, *attempt_failed),
            VerificationRequest::NewPin => self.collect_new_pin(),
            VerificationRequest::Touch => {
                self.hint("Touch your security key...");
                CollectorResponse::Proceed
            }
            VerificationRequest::BioSample {
                remaining_samples,
                last_status,
            } => {
                if let Some(status) = last_status.filter(|s| !s.is_good()) {
                    eprintln!("  {}", status.to_string().yellow());
                }
                match remaining_samples {
                    Some(n) => self.hint(&format!(
                        "Place your finger on the sensor again ({n} samples left)"
                    )),
                    None => self.hint("Place your finger on the sensor"),
                }
                CollectorResponse::Proceed
            }
        }
    }
}

/// Ask a yes/no question; anything but `y`/`yes` is a no.
pub fn confirm(question: &str) -> bool {
    read_line(&format!("{question} [y/N] "))
        .map(|answer| matches!(answer.to_lowercase().as_str(), "y" | "yes"))
        .unwrap_or(false)
}

/// One line from stdin, without the newline. `None` on EOF or empty input.
fn read_line(label: &str) -> Option<String> {
    show_label(label);
    stdin_line()
}

/// Like [`read_line`], but typed characters are not echoed when stdin is a
/// terminal. Esc or Ctrl-C cancels.
fn read_secret(label: &str) -> Option<Zeroizing<String>> {
    show_label(label);
    if !io::stdin().is_terminal() || terminal::enable_raw_mode().is_err() {
        return stdin_line().map(Zeroizing::new);
    }
    let secret = read_hidden_keys();
    terminal::disable_raw_mode().ok();
    eprintln!();
    secret.filter(|s| !s.is_empty())
}

fn show_label(label: &str) {
    eprint!("{label}");
    io::stderr().flush().ok();
}

fn stdin_line() -> Option<String> {
    let mut line = String::new();
    match io::stdin().lock().read_line(&mut line) {
        Ok(0) | Err(_) => None,
        Ok(_) => {
            let line = line.trim_end_matches(['\r', '\n']).to_string();
            (!line.is_empty()).then_some(line)
        }
    }
}

fn read_hidden_keys() -> Option<Zeroizing<String>> {
    let mut secret = Zeroizing::new(String::new());
    loop {
        // crossterm also reports key release and repeat events on Windows
        let Event::Key(KeyEvent {
            code,
            modifiers,
            kind: KeyEventKind::Press,
            ..
        }) = event::read().ok()?
        else {
            continue;
        };
        match code {
            KeyCode::Enter => return Some(secret),
            KeyCode::Esc => return None,
            KeyCode::Char('c') if modifiers.contains(KeyModifiers::CONTROL) => return None,
            KeyCode::Backspace => {
                secret.pop();
            }
            KeyCode::Char(c) => secret.push(c),
            _ => {}
        }
    }
}
