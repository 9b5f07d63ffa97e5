//! Signature verification results.
//!
//! The engine announces each signature with `NEWSIG` (newer engines) or
//! directly with one of the `*SIG` lines, followed by optional `VALIDSIG`,
//! notation and trust lines that refine the current signature.

use super::{parse_plaintext, push_checked, Failure, Validity};
use crate::dispatch::{Session, StatusHandler};
use crate::error::Error;
use crate::status::{decode_percent, parse_number, Args, StatusCode};

/// The per-signature verification outcome.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SigStatus {
    Good,
    /// The signature is valid but expired.
    Expired,
    /// The signature is valid but the key expired.
    KeyExpired,
    Bad,
    KeyRevoked,
    NoPublicKey,
    UnsupportedAlgorithm,
    /// The engine could not check the signature, with its error code.
    Error(u32),
    NoData,
    #[default]
    General,
}

/// A notation or policy URL attached to a signature.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Notation {
    /// `None` for a policy URL.
    pub name: Option<String>,
    pub value: String,
    pub critical: bool,
    pub human_readable: bool,
}

/// One verified signature.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Signature {
    pub status: SigStatus,
    /// Fingerprint, or key ID when only that is known.
    pub fpr: Option<String>,
    pub timestamp: i64,
    pub exp_timestamp: i64,
    pub pubkey_algo: u32,
    pub hash_algo: u32,
    pub validity: Validity,
    pub validity_reason: u32,
    pub chain_model: bool,
    pub notations: Vec<Notation>,
}

/// The outcome of a verification.
#[derive(Clone, Debug, Default)]
pub struct VerifyResult {
    pub signatures: Vec<Signature>,
    /// The file name recorded in the signed message.
    pub file_name: Option<String>,
    only_newsig_seen: bool,
    did_prepare_new_sig: bool,
    notation_pending: bool,
    plaintext_seen: bool,
    failure: Option<Failure>,
}

impl VerifyResult {
    fn prepare_new_sig(&mut self) -> Result<(), Error> {
        match self.signatures.last_mut() {
            // Only NEWSIG was seen for the current one; reuse it.
            Some(sig) if self.only_newsig_seen => *sig = Signature::default(),
            _ => push_checked(&mut self.signatures, Signature::default())?,
        }
        self.did_prepare_new_sig = true;
        self.only_newsig_seen = false;
        self.notation_pending = false;
        Ok(())
    }

    fn current(&mut self) -> Result<&mut Signature, Error> {
        self.signatures.last_mut().ok_or(Error::InvalidEngine)
    }
}

/// `<*SIG> <keyid> <userid>` or
/// `ERRSIG <keyid> <pk-algo> <hash-algo> <class> <timestamp> <rc> [<fpr>]`
fn parse_new_sig(sig: &mut Signature, code: StatusCode, args: &str) -> Result<(), Error> {
    let mut args = Args::new(args);
    sig.fpr = args.next_token().map(String::from);
    sig.status = match code {
        StatusCode::GoodSig => SigStatus::Good,
        StatusCode::ExpSig => SigStatus::Expired,
        StatusCode::ExpKeySig => SigStatus::KeyExpired,
        StatusCode::BadSig => SigStatus::Bad,
        StatusCode::RevKeySig => SigStatus::KeyRevoked,
        StatusCode::ErrSig => {
            sig.pubkey_algo = args.number()?;
            sig.hash_algo = args.number()?;
            args.token()?;
            sig.timestamp = args.timestamp()?;
            let status = match args.number()? {
                4 => SigStatus::UnsupportedAlgorithm,
                9 => SigStatus::NoPublicKey,
                rc => SigStatus::Error(rc),
            };
            match args.next_token() {
                Some("-") | None => (),
                Some(fpr) => sig.fpr = Some(fpr.to_owned()),
            }
            status
        }
        _ => return Err(Error::General),
    };
    Ok(())
}

/// `VALIDSIG <fpr> <date> <timestamp> <expire> <version> <reserved> <pk-algo> <hash-algo> ...`
fn parse_valid_sig(sig: &mut Signature, args: &str) -> Result<(), Error> {
    let mut args = Args::new(args);
    sig.fpr = Some(args.next_token().ok_or(Error::General)?.to_owned());
    args.token()?;
    sig.timestamp = args.timestamp()?;
    sig.exp_timestamp = args.timestamp()?;
    if args.next_token().is_some() && args.next_token().is_some() {
        sig.pubkey_algo = args.number()?;
        if let Some(hash_algo) = args.next_token() {
            sig.hash_algo = parse_number(hash_algo)?;
        }
    }
    Ok(())
}

fn parse_trust(sig: &mut Signature, code: StatusCode, args: &str) -> Result<(), Error> {
    sig.validity = match code {
        StatusCode::TrustNever => Validity::Never,
        StatusCode::TrustMarginal => Validity::Marginal,
        StatusCode::TrustFully | StatusCode::TrustUltimate => Validity::Full,
        _ => Validity::Unknown,
    };
    let mut args = Args::new(args);
    sig.validity_reason = args.next_token().map(parse_number).transpose()?.unwrap_or(0);
    sig.chain_model = args.next_token() == Some("chain");
    Ok(())
}

fn parse_notation(result: &mut VerifyResult, code: StatusCode, args: &str) -> Result<(), Error> {
    let pending = result.notation_pending;
    let sig = result.current()?;
    match code {
        StatusCode::NotationName | StatusCode::PolicyUrl => {
            // The previous name never received its data.
            if pending {
                return Err(Error::InvalidEngine);
            }
            let token = Args::new(args).token()?;
            let notation = if code == StatusCode::NotationName {
                Notation {
                    name: Some(decode_percent(token)?),
                    human_readable: true,
                    ..Notation::default()
                }
            } else {
                Notation {
                    value: decode_percent(token)?,
                    ..Notation::default()
                }
            };
            push_checked(&mut sig.notations, notation)?;
            result.notation_pending = code == StatusCode::NotationName;
        }
        StatusCode::NotationFlags => {
            let notation = sig
                .notations
                .last_mut()
                .filter(|n| n.name.is_some())
                .ok_or(Error::InvalidEngine)?;
            let mut args = Args::new(args);
            notation.critical = args.number::<u32>()? != 0;
            notation.human_readable = args.number::<u32>()? != 0;
        }
        _ => {
            let notation = sig
                .notations
                .last_mut()
                .filter(|n| n.name.is_some())
                .ok_or(Error::InvalidEngine)?;
            notation.value.push_str(&decode_percent(args)?);
            result.notation_pending = false;
        }
    }
    Ok(())
}

pub(crate) struct VerifyStatus;

impl StatusHandler for VerifyStatus {
    fn handle(&self, session: &mut Session<'_>, code: StatusCode, args: &str) -> Result<(), Error> {
        let result = session.results.get_or_create::<VerifyResult>()?;
        if !matches!(code, StatusCode::NewSig | StatusCode::Failure | StatusCode::Eof) {
            result.only_newsig_seen = false;
        }
        match code {
            StatusCode::NewSig => {
                result.prepare_new_sig()?;
                result.only_newsig_seen = true;
            }
            StatusCode::GoodSig
            | StatusCode::ExpSig
            | StatusCode::ExpKeySig
            | StatusCode::BadSig
            | StatusCode::RevKeySig
            | StatusCode::ErrSig => {
                if !result.did_prepare_new_sig {
                    result.prepare_new_sig()?;
                }
                result.did_prepare_new_sig = false;
                parse_new_sig(result.current()?, code, args)?;
            }
            StatusCode::ValidSig => parse_valid_sig(result.current()?, args)?,
            StatusCode::NoData | StatusCode::Unexpected => {
                result.current().map_err(|_| Error::NoData)?.status = SigStatus::NoData;
            }
            StatusCode::NotationName
            | StatusCode::NotationFlags
            | StatusCode::NotationData
            | StatusCode::PolicyUrl => parse_notation(result, code, args)?,
            StatusCode::TrustUndefined
            | StatusCode::TrustNever
            | StatusCode::TrustMarginal
            | StatusCode::TrustFully
            | StatusCode::TrustUltimate => parse_trust(result.current()?, code, args)?,
            StatusCode::Plaintext => {
                if result.plaintext_seen {
                    return Err(Error::General);
                }
                result.plaintext_seen = true;
                result.file_name = parse_plaintext(args)?;
            }
            StatusCode::Failure => Failure::record(&mut result.failure, args)?,
            StatusCode::Eof => {
                if result.only_newsig_seen {
                    result.signatures.pop();
                    result.only_newsig_seen = false;
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
