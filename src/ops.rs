//! Per-operation status handlers and the helpers they share.

use crate::error::Error;
use crate::status::{decode_percent, parse_number, Args};

pub(crate) mod decrypt;
pub(crate) mod delete;
pub(crate) mod encrypt;
pub(crate) mod genkey;
pub(crate) mod import;
pub(crate) mod keylist;
pub(crate) mod passphrase;
pub(crate) mod progress;
pub(crate) mod sign;
pub(crate) mod verify;

/// How far a key or signature is trusted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Validity {
    #[default]
    Unknown,
    Undefined,
    Never,
    Marginal,
    Full,
    Ultimate,
}

impl Validity {
    /// Maps a colon-listing validity letter.
    pub(crate) fn from_letter(c: char) -> Self {
        match c {
            'q' | '-' => Validity::Undefined,
            'n' => Validity::Never,
            'm' => Validity::Marginal,
            'f' => Validity::Full,
            'u' => Validity::Ultimate,
            _ => Validity::Unknown,
        }
    }
}

/// Why the engine rejected a recipient or signer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InvalidKeyReason {
    General,
    NoPubkey,
    AmbiguousName,
    WrongKeyUsage,
    CertRevoked,
    CertExpired,
    NoCrlKnown,
    CrlTooOld,
    NoPolicyMatch,
    NoSeckey,
    PubkeyNotTrusted,
    MissingCert,
    MissingIssuerCert,
    KeyDisabled,
    InvalidUserId,
    SubkeysExpiredOrRevoked,
}

/// A recipient or signer the engine could not use.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InvalidKey {
    pub fpr: Option<String>,
    pub reason: InvalidKeyReason,
}

/// The most recent `KEY_CONSIDERED` line.
#[derive(Clone, Debug, Default)]
pub(crate) struct KeyConsidered {
    fpr: Option<String>,
    flags: u32,
}

impl KeyConsidered {
    /// `KEY_CONSIDERED <fpr> <flags>`
    pub(crate) fn parse(args: &str) -> Result<Self, Error> {
        let mut args = Args::new(args);
        let fpr = args.token()?.to_owned();
        let flags = args.number()?;
        Ok(KeyConsidered {
            fpr: Some(fpr),
            flags,
        })
    }
}

/// Parses `INV_RECP` / `INV_SGNR`: `<reason> [<fpr>]`.
pub(crate) fn parse_inv_recp(args: &str, considered: &KeyConsidered) -> Result<InvalidKey, Error> {
    let mut args = Args::new(args);
    let reason = match args.number::<u32>()? {
        0 if considered.fpr.is_some() && considered.flags & 2 != 0 => {
            InvalidKeyReason::SubkeysExpiredOrRevoked
        }
        1 => InvalidKeyReason::NoPubkey,
        2 => InvalidKeyReason::AmbiguousName,
        3 => InvalidKeyReason::WrongKeyUsage,
        4 => InvalidKeyReason::CertRevoked,
        5 => InvalidKeyReason::CertExpired,
        6 => InvalidKeyReason::NoCrlKnown,
        7 => InvalidKeyReason::CrlTooOld,
        8 => InvalidKeyReason::NoPolicyMatch,
        9 => InvalidKeyReason::NoSeckey,
        10 => InvalidKeyReason::PubkeyNotTrusted,
        11 => InvalidKeyReason::MissingCert,
        12 => InvalidKeyReason::MissingIssuerCert,
        13 => InvalidKeyReason::KeyDisabled,
        14 => InvalidKeyReason::InvalidUserId,
        _ => InvalidKeyReason::General,
    };
    let fpr = args
        .next_token()
        .map(String::from)
        .or_else(|| considered.fpr.clone());
    Ok(InvalidKey { fpr, reason })
}

/// A `FAILURE <location> <code>` line, kept until the operation ends.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Failure {
    location: String,
    code: u32,
}

impl Failure {
    /// `FAILURE` lines from `gpg-exit` only restate the exit code.
    pub(crate) fn parse(args: &str) -> Result<Option<Self>, Error> {
        let mut args = Args::new(args);
        let location = args.token()?;
        let code = args.number()?;
        if location == "gpg-exit" {
            return Ok(None);
        }
        Ok(Some(Failure {
            location: location.to_owned(),
            code,
        }))
    }

    /// Records a failure unless one was already seen.
    pub(crate) fn record(slot: &mut Option<Failure>, args: &str) -> Result<(), Error> {
        if slot.is_none() {
            *slot = Failure::parse(args)?;
        }
        Ok(())
    }

    pub(crate) fn into_error(self) -> Error {
        Error::Failure {
            location: self.location,
            code: self.code,
        }
    }
}

/// Parses `ERROR <location> <code> ...` into its location and error code.
pub(crate) fn parse_error_status(args: &str) -> Result<(&str, u32), Error> {
    let mut args = Args::new(args);
    let location = args.token()?;
    let code = parse_number::<u32>(args.token()?)?;
    Ok((location, code))
}

/// Parses `PLAINTEXT <format> <timestamp> [<filename>]` and returns the file name.
pub(crate) fn parse_plaintext(args: &str) -> Result<Option<String>, Error> {
    let mut args = Args::new(args);
    args.hex_byte()?;
    args.token()?;
    args.next_token().map(decode_percent).transpose()
}

/// Appends to a result list, reporting allocation failure.
pub(crate) fn push_checked<T>(list: &mut Vec<T>, item: T) -> Result<(), Error> {
    list.try_reserve(1).map_err(|_| Error::OutOfCore)?;
    list.push(item);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{
        parse_error_status, parse_inv_recp, parse_plaintext, Failure, InvalidKeyReason,
        KeyConsidered,
    };
    use crate::error::Error;

    #[test]
    fn inv_recp_reasons() {
        let none = KeyConsidered::default();
        let key = parse_inv_recp("1 ABCDEF", &none).unwrap();
        assert_eq!(key.reason, InvalidKeyReason::NoPubkey);
        assert_eq!(key.fpr.as_deref(), Some("ABCDEF"));

        let key = parse_inv_recp("14", &none).unwrap();
        assert_eq!(key.reason, InvalidKeyReason::InvalidUserId);
        assert_eq!(key.fpr, None);

        assert_eq!(
            parse_inv_recp("99 X", &none).unwrap().reason,
            InvalidKeyReason::General
        );
        assert!(matches!(
            parse_inv_recp("x ABCDEF", &none),
            Err(Error::InvalidEngine)
        ));
    }

    #[test]
    fn inv_recp_uses_considered_key() {
        let considered = KeyConsidered::parse("0123ABCD 2").unwrap();
        let key = parse_inv_recp("0", &considered).unwrap();
        assert_eq!(key.reason, InvalidKeyReason::SubkeysExpiredOrRevoked);
        assert_eq!(key.fpr.as_deref(), Some("0123ABCD"));

        let plain = KeyConsidered::parse("0123ABCD 1").unwrap();
        assert_eq!(
            parse_inv_recp("0", &plain).unwrap().reason,
            InvalidKeyReason::General
        );
    }

    #[test]
    fn failure_lines() {
        let mut slot = None;
        Failure::record(&mut slot, "gpg-exit 33554433").unwrap();
        assert!(slot.is_none());
        Failure::record(&mut slot, "sign 67108949").unwrap();
        Failure::record(&mut slot, "encrypt 1").unwrap();
        match slot.map(Failure::into_error) {
            Some(Error::Failure { location, code }) => {
                assert_eq!(location, "sign");
                assert_eq!(code, 67108949);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            Failure::parse("sign oops"),
            Err(Error::InvalidEngine)
        ));
    }

    #[test]
    fn error_and_plaintext_lines() {
        assert_eq!(
            parse_error_status("decrypt.algorithm 228 ?").unwrap(),
            ("decrypt.algorithm", 228)
        );
        assert_eq!(
            parse_plaintext("62 1700000000 report%20final.txt").unwrap(),
            Some("report final.txt".to_owned())
        );
        assert_eq!(parse_plaintext("74 0").unwrap(), None);
    }
}
