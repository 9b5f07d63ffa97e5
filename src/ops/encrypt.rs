//! Encryption results and flags.

use bitflags::bitflags;

use super::{parse_inv_recp, push_checked, Failure, InvalidKey, KeyConsidered};
use crate::dispatch::{Session, StatusHandler};
use crate::error::Error;
use crate::status::StatusCode;

bitflags! {
    /// Options for an encryption operation.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct EncryptFlags: u32 {
        /// Use recipients' keys without checking their validity.
        const ALWAYS_TRUST = 1;
        /// Ignore `encrypt-to` keys from the engine's configuration.
        const NO_ENCRYPT_TO = 2;
        /// Also encrypt to a passphrase.
        const SYMMETRIC = 4;
        const NO_COMPRESS = 8;
        /// Omit recipient key IDs from the message.
        const THROW_KEYIDS = 16;
    }
}

/// The outcome of an encryption operation.
#[derive(Clone, Debug, Default)]
pub struct EncryptResult {
    /// Rejected recipients, in the order the engine reported them.
    pub invalid_recipients: Vec<InvalidKey>,
    considered: KeyConsidered,
    failure: Option<Failure>,
}

pub(crate) struct EncryptStatus;

impl StatusHandler for EncryptStatus {
    fn handle(&self, session: &mut Session<'_>, code: StatusCode, args: &str) -> Result<(), Error> {
        let result = session.results.get_or_create::<EncryptResult>()?;
        match code {
            StatusCode::KeyConsidered => result.considered = KeyConsidered::parse(args)?,
            StatusCode::InvRecp => {
                let key = parse_inv_recp(args, &result.considered)?;
                push_checked(&mut result.invalid_recipients, key)?;
                result.considered = KeyConsidered::default();
            }
            StatusCode::NoRecp => return Err(Error::General),
            StatusCode::Failure => Failure::record(&mut result.failure, args)?,
            StatusCode::Eof => {
                if !result.invalid_recipients.is_empty() {
                    return Err(Error::UnusablePubkey);
                }
                if let Some(failure) = result.failure.take() {
                    return Err(failure.into_error());
                }
            }
            _ => (),
        }
        Ok(())
    }
}
