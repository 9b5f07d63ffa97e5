//! Common helpers for CLI binaries.

use log::debug;
use secrecy::{ExposeSecret, SecretString};

use crate::error::Error;
use crate::ops::passphrase::{PassphraseProvider, PassphraseRequest};

/// Reads a secret from the terminal without echoing it.
///
/// Any failure to read, including a missing terminal, is reported as
/// [`Error::NoPassphrase`].
pub fn read_secret(prompt: &str) -> Result<SecretString, Error> {
    rpassword::prompt_password(format!("{}: ", prompt))
        .map(SecretString::new)
        .map_err(|e| {
            debug!("Failed to read passphrase: {}", e);
            Error::NoPassphrase
        })
}

/// A [`PassphraseProvider`] that asks on the controlling terminal.
#[derive(Debug, Default)]
pub struct TerminalPassphrase;

impl PassphraseProvider for TerminalPassphrase {
    fn passphrase(&mut self, request: &PassphraseRequest) -> Result<SecretString, Error> {
        let secret = read_secret(&request.prompt())?;
        match request.max_len {
            Some(max) if secret.expose_secret().len() > max => {
                Err(Error::InvalidValue)
            }
            _ => Ok(secret),
        }
    }
}
