//! Interactive MFA challenge: device selection and code entry.

use std::{io, process::Command};

use anyhow::{Context, Result};
use dialoguer::{Input, Select, theme::ColorfulTheme};
use log::{info, warn};

use crate::config::OnePassword;

/// User-facing questions asked during a refresh.
///
/// `Ok(None)` means the user cancelled the prompt.
pub trait Prompt {
    fn select_device(&self, devices: &[String]) -> Result<Option<String>>;
    fn mfa_code(&self, device: &str) -> Result<Option<String>>;
}

/// Accepts exactly six ASCII digits.
pub fn validate_mfa_code(code: &str) -> Result<(), &'static str> {
    if code.is_empty() {
        Err("MFA code is required")
    } else if code.len() != 6 {
        Err("MFA code must be exactly 6 characters")
    } else if !code.chars().all(|c| c.is_ascii_digit()) {
        Err("MFA code must contain only digits")
    } else {
        Ok(())
    }
}

/// Terminal prompts, optionally fed by 1Password for the code.
pub struct TerminalPrompt {
    theme: ColorfulTheme,
    one_password: Option<OnePassword>,
}

impl TerminalPrompt {
    pub fn new(one_password: Option<OnePassword>) -> Self {
        Self {
            theme: ColorfulTheme::default(),
            one_password,
        }
    }
}

impl Prompt for TerminalPrompt {
    fn select_device(&self, devices: &[String]) -> Result<Option<String>> {
        let selection = Select::with_theme(&self.theme)
            .with_prompt("Choose an MFA device")
            .items(devices)
            .default(0)
            .interact_opt();

        Ok(cancellable(selection)?
            .flatten()
            .and_then(|index| devices.get(index).cloned()))
    }

    fn mfa_code(&self, device: &str) -> Result<Option<String>> {
        if let Some(code) = self.one_password.as_ref().and_then(OnePassword::otp) {
            info!("Retrieved MFA code from 1Password");
            return Ok(Some(code));
        }

        let code = Input::<String>::with_theme(&self.theme)
            .with_prompt(format!("MFA code for {device}"))
            .validate_with(|input: &String| validate_mfa_code(input))
            .interact_text();

        cancellable(code)
    }
}

impl OnePassword {
    /// Reads the current TOTP from the `op` CLI, `None` if it is unusable.
    fn otp(&self) -> Option<String> {
        let output = Command::new("op")
            .args(["item", "get", "--account", &self.account, &self.item, "--otp"])
            .output();

        match output {
            Ok(output) if output.status.success() => {
                let otp = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if validate_mfa_code(&otp).is_ok() {
                    return Some(otp);
                }
                warn!("1Password returned an invalid MFA code, falling back to manual input");
            }
            Ok(output) => warn!(
                "1Password lookup failed ({}), falling back to manual input",
                output.status
            ),
            Err(e) => warn!("Could not run 1Password CLI ({e}), falling back to manual input"),
        }
        None
    }
}

/// Maps Ctrl-C into a cancelled answer; other terminal errors stay fatal.
fn cancellable<T>(answer: dialoguer::Result<T>) -> Result<Option<T>> {
    match answer {
        Ok(value) => Ok(Some(value)),
        Err(dialoguer::Error::IO(e)) if e.kind() == io::ErrorKind::Interrupted => Ok(None),
        Err(e) => Err(e).context("Failed to read answer from terminal"),
    }
}
