//! Terminal interaction: passwords, pairing PINs, pairing approval.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use pvault_core::{VaultError, VaultResult};
use pvault_sync::{Approver, PairingRequest, PinPrompt};
use secrecy::{ExposeSecret, SecretString};
use std::io::{BufRead, Write};
use uuid::Uuid;

/// Non-interactive password source for service deployments
pub const PASSWORD_ENV: &str = "PVAULT_PASSWORD";

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> std::io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .context("console task failed")?
        .context("reading from terminal")
}

/// Password from `PVAULT_PASSWORD`, else prompted once.
pub async fn password(prompt: &str) -> Result<SecretString> {
    if let Ok(pw) = std::env::var(PASSWORD_ENV) {
        return Ok(SecretString::from(pw));
    }
    let prompt = prompt.to_string();
    let pw = blocking(move || rpassword::prompt_password(prompt)).await?;
    Ok(SecretString::from(pw))
}

/// Password for a new vault: prompted twice and must match.
pub async fn new_password(prompt: &str) -> Result<SecretString> {
    if let Ok(pw) = std::env::var(PASSWORD_ENV) {
        return Ok(SecretString::from(pw));
    }
    let first = password(prompt).await?;
    let second = password("Repeat password: ").await?;
    if first.expose_secret() != second.expose_secret() {
        bail!("passwords do not match");
    }
    if first.expose_secret().is_empty() {
        bail!("password must not be empty");
    }
    Ok(first)
}

fn read_line(prompt: String) -> std::io::Result<String> {
    let mut stdout = std::io::stdout();
    stdout.write_all(prompt.as_bytes())?;
    stdout.flush()?;
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.to_ascii_lowercase().as_str(), "y" | "yes")
}

/// Shows the PIN on the daemon's terminal and asks the operator to confirm.
#[derive(Debug, Default)]
pub struct ConsoleApprover;

#[async_trait]
impl Approver for ConsoleApprover {
    async fn approve(&self, request: &PairingRequest, pin: &str) -> bool {
        let prompt = format!(
            "\n\"{}\" wants to pair with vault {}.\nPIN: {pin}\nApprove? [y/N] ",
            request.name, request.vault
        );
        match blocking(move || read_line(prompt)).await {
            Ok(answer) => is_yes(&answer),
            Err(e) => {
                tracing::warn!(vault = %request.vault, "pairing prompt failed: {e:#}");
                false
            }
        }
    }
}

/// Reads the PIN shown by the responder.
#[derive(Debug, Default)]
pub struct ConsolePin;

#[async_trait]
impl PinPrompt for ConsolePin {
    async fn read_pin(&self, vault: &Uuid, _kxid: &str) -> VaultResult<String> {
        let prompt = format!("PIN displayed by the node serving {vault}: ");
        let pin = tokio::task::spawn_blocking(move || read_line(prompt))
            .await
            .map_err(|e| VaultError::Platform(format!("console task failed: {e}")))??;
        if pin.is_empty() || !pin.chars().all(|c| c.is_ascii_digit()) {
            return Err(VaultError::InvalidArgument("PIN must be digits".into()));
        }
        Ok(pin)
    }
}
