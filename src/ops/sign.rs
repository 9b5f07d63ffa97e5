//! Signing results: created signatures and rejected signers.

use log::warn;

use super::{parse_inv_recp, push_checked, Failure, InvalidKey, InvalidKeyReason, KeyConsidered};
use crate::dispatch::{Session, StatusHandler};
use crate::error::Error;
use crate::status::{Args, StatusCode};

/// The kind of signature to create.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SigMode {
    #[default]
    Normal,
    Detach,
    Clear,
}

/// A signature the engine reported as created.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewSignature {
    pub mode: SigMode,
    pub pubkey_algo: u32,
    pub hash_algo: u32,
    pub sig_class: u8,
    pub timestamp: i64,
    pub fpr: String,
}

/// The outcome of a signing operation.
#[derive(Clone, Debug, Default)]
pub struct SignResult {
    pub invalid_signers: Vec<InvalidKey>,
    pub signatures: Vec<NewSignature>,
    considered: KeyConsidered,
    inv_sgnr_seen: bool,
    sig_created_seen: bool,
    failure: Option<Failure>,
}

impl SignResult {
    /// If fewer signatures were made than signers were requested, the output
    /// is unusable: every created signature is moved to the invalid list.
    pub(crate) fn check_signer_count(&mut self, signers: usize) {
        if signers == 0 || self.signatures.len() + self.invalid_signers.len() == signers {
            return;
        }
        warn!(
            "{} signatures and {} invalid signers for {} signers",
            self.signatures.len(),
            self.invalid_signers.len(),
            signers
        );
        let signatures = std::mem::take(&mut self.signatures);
        self.invalid_signers
            .extend(signatures.into_iter().map(|sig| InvalidKey {
                fpr: Some(sig.fpr),
                reason: InvalidKeyReason::General,
            }));
    }
}

/// `SIG_CREATED <mode> <pk-algo> <hash-algo> <class> <timestamp> <fpr>`
fn parse_sig_created(args: &str) -> Result<NewSignature, Error> {
    let mut args = Args::new(args);
    let mode = match args.token()? {
        "S" => SigMode::Normal,
        "D" => SigMode::Detach,
        "C" => SigMode::Clear,
        _ => return Err(Error::InvalidEngine),
    };
    Ok(NewSignature {
        mode,
        pubkey_algo: args.number()?,
        hash_algo: args.number()?,
        sig_class: args.hex_byte()?,
        timestamp: args.timestamp()?,
        fpr: args.token()?.to_owned(),
    })
}

pub(crate) struct SignStatus;

impl StatusHandler for SignStatus {
    fn handle(&self, session: &mut Session<'_>, code: StatusCode, args: &str) -> Result<(), Error> {
        let result = session.results.get_or_create::<SignResult>()?;
        match code {
            StatusCode::SigCreated => {
                result.sig_created_seen = true;
                let sig = parse_sig_created(args)?;
                push_checked(&mut result.signatures, sig)?;
            }
            StatusCode::KeyConsidered => result.considered = KeyConsidered::parse(args)?,
            // The engine repeats an unusable signer as INV_RECP after INV_SGNR.
            StatusCode::InvRecp if result.inv_sgnr_seen => (),
            StatusCode::InvRecp | StatusCode::InvSgnr => {
                if code == StatusCode::InvSgnr {
                    result.inv_sgnr_seen = true;
                }
                let key = parse_inv_recp(args, &result.considered)?;
                push_checked(&mut result.invalid_signers, key)?;
                result.considered = KeyConsidered::default();
            }
            StatusCode::Failure => Failure::record(&mut result.failure, args)?,
            StatusCode::Eof => {
                if !result.invalid_signers.is_empty() {
                    return Err(Error::UnusableSeckey);
                }
                if !result.sig_created_seen {
                    return Err(result
                        .failure
                        .take()
                        .map_or(Error::InvalidEngine, Failure::into_error));
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
