//! The engine's status-line vocabulary and argument parsing.
//!
//! A status line is `[GNUPG:] KEYWORD args...`. The prefix is optional;
//! lines that do not start with an upper-case keyword are not status lines
//! and are skipped. Arguments are whitespace-separated tokens interpreted
//! positionally by each handler, strictly: a malformed number or hex field
//! is an engine protocol violation.

use std::str::FromStr;

use crate::error::Error;

macro_rules! status_codes {
    ($($variant:ident => $keyword:literal,)*) => {
        /// A status keyword understood by the handlers.
        #[derive(Clone, Copy, Debug, PartialEq, Eq)]
        pub enum StatusCode {
            $($variant,)*
        }

        impl StatusCode {
            pub fn from_keyword(keyword: &str) -> Option<Self> {
                match keyword {
                    $($keyword => Some(StatusCode::$variant),)*
                    _ => None,
                }
            }

            pub fn keyword(self) -> &'static str {
                match self {
                    $(StatusCode::$variant => $keyword,)*
                }
            }
        }
    };
}

status_codes! {
    Eof => "EOF",
    Enter => "ENTER",
    Leave => "LEAVE",
    Abort => "ABORT",
    NewSig => "NEWSIG",
    GoodSig => "GOODSIG",
    ExpSig => "EXPSIG",
    ExpKeySig => "EXPKEYSIG",
    BadSig => "BADSIG",
    RevKeySig => "REVKEYSIG",
    ErrSig => "ERRSIG",
    ValidSig => "VALIDSIG",
    TrustUndefined => "TRUST_UNDEFINED",
    TrustNever => "TRUST_NEVER",
    TrustMarginal => "TRUST_MARGINAL",
    TrustFully => "TRUST_FULLY",
    TrustUltimate => "TRUST_ULTIMATE",
    NotationName => "NOTATION_NAME",
    NotationFlags => "NOTATION_FLAGS",
    NotationData => "NOTATION_DATA",
    PolicyUrl => "POLICY_URL",
    UseridHint => "USERID_HINT",
    NeedPassphrase => "NEED_PASSPHRASE",
    NeedPassphraseSym => "NEED_PASSPHRASE_SYM",
    NeedPassphrasePin => "NEED_PASSPHRASE_PIN",
    MissingPassphrase => "MISSING_PASSPHRASE",
    BadPassphrase => "BAD_PASSPHRASE",
    GoodPassphrase => "GOOD_PASSPHRASE",
    InquireMaxlen => "INQUIRE_MAXLEN",
    GetBool => "GET_BOOL",
    GetLine => "GET_LINE",
    GetHidden => "GET_HIDDEN",
    GotIt => "GOT_IT",
    Progress => "PROGRESS",
    BeginSigning => "BEGIN_SIGNING",
    SigCreated => "SIG_CREATED",
    BeginEncryption => "BEGIN_ENCRYPTION",
    EndEncryption => "END_ENCRYPTION",
    InvRecp => "INV_RECP",
    InvSgnr => "INV_SGNR",
    NoRecp => "NO_RECP",
    NoSgnr => "NO_SGNR",
    KeyConsidered => "KEY_CONSIDERED",
    BeginDecryption => "BEGIN_DECRYPTION",
    EndDecryption => "END_DECRYPTION",
    DecryptionInfo => "DECRYPTION_INFO",
    DecryptionOkay => "DECRYPTION_OKAY",
    DecryptionFailed => "DECRYPTION_FAILED",
    EncTo => "ENC_TO",
    NoSeckey => "NO_SECKEY",
    NoPubkey => "NO_PUBKEY",
    Plaintext => "PLAINTEXT",
    PlaintextLength => "PLAINTEXT_LENGTH",
    NoData => "NODATA",
    Unexpected => "UNEXPECTED",
    Truncated => "TRUNCATED",
    ImportOk => "IMPORT_OK",
    ImportProblem => "IMPORT_PROBLEM",
    ImportRes => "IMPORT_RES",
    Imported => "IMPORTED",
    DeleteProblem => "DELETE_PROBLEM",
    KeyCreated => "KEY_CREATED",
    KeyNotCreated => "KEY_NOT_CREATED",
    Error => "ERROR",
    Failure => "FAILURE",
    Success => "SUCCESS",
}

impl StatusCode {
    /// Whether the engine waits for an answer on its command descriptor.
    pub fn is_query(self) -> bool {
        matches!(
            self,
            StatusCode::GetBool | StatusCode::GetLine | StatusCode::GetHidden
        )
    }
}

/// Splits a status line into its keyword and raw argument string.
pub(crate) fn parse_line(line: &str) -> Option<(&str, &str)> {
    read::status_line(line).ok().map(|(_, parsed)| parsed)
}

mod read {
    use nom::{
        bytes::complete::{tag, take_while},
        character::complete::{char, satisfy},
        combinator::{all_consuming, opt, recognize, rest},
        sequence::{pair, preceded},
        IResult,
    };

    fn keyword(input: &str) -> IResult<&str, &str> {
        recognize(pair(
            satisfy(|c| c.is_ascii_uppercase()),
            take_while(|c: char| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_'),
        ))(input)
    }

    pub(super) fn status_line(input: &str) -> IResult<&str, (&str, &str)> {
        let (input, _) = opt(tag("[GNUPG:] "))(input)?;
        let (input, keyword) = keyword(input)?;
        let (input, args) = all_consuming(opt(preceded(char(' '), rest)))(input)?;
        Ok((input, (keyword, args.unwrap_or(""))))
    }
}

/// Positional reader over whitespace-separated status arguments.
pub(crate) struct Args<'a> {
    rest: &'a str,
}

impl<'a> Args<'a> {
    pub(crate) fn new(args: &'a str) -> Self {
        Args { rest: args }
    }

    /// The next token, if any.
    pub(crate) fn next_token(&mut self) -> Option<&'a str> {
        let trimmed = self.rest.trim_start_matches(' ');
        if trimmed.is_empty() {
            self.rest = trimmed;
            return None;
        }
        let end = trimmed.find(' ').unwrap_or(trimmed.len());
        let (token, rest) = trimmed.split_at(end);
        self.rest = rest;
        Some(token)
    }

    /// The next token, which the protocol requires to be present.
    pub(crate) fn token(&mut self) -> Result<&'a str, Error> {
        self.next_token().ok_or(Error::InvalidEngine)
    }

    pub(crate) fn number<T: FromStr>(&mut self) -> Result<T, Error> {
        parse_number(self.token()?)
    }

    pub(crate) fn hex_byte(&mut self) -> Result<u8, Error> {
        parse_hex_byte(self.token()?)
    }

    pub(crate) fn timestamp(&mut self) -> Result<i64, Error> {
        parse_timestamp(self.token()?)
    }

    /// Everything after the tokens consumed so far, without leading blanks.
    pub(crate) fn rest(self) -> &'a str {
        self.rest.trim_start_matches(' ')
    }
}

/// Parses an unsigned decimal number made of digits only.
pub(crate) fn parse_number<T: FromStr>(s: &str) -> Result<T, Error> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::InvalidEngine);
    }
    s.parse().map_err(|_| Error::InvalidEngine)
}

/// Parses exactly two hex digits, in either case.
pub(crate) fn parse_hex_byte(s: &str) -> Result<u8, Error> {
    let mut out = [0u8; 1];
    hex::decode_to_slice(s, &mut out).map_err(|_| Error::InvalidEngine)?;
    Ok(out[0])
}

/// Parses seconds since the epoch or an ISO `YYYYMMDDTHHMMSS` time.
pub(crate) fn parse_timestamp(s: &str) -> Result<i64, Error> {
    if s.contains('T') {
        chrono::NaiveDateTime::parse_from_str(s, "%Y%m%dT%H%M%S")
            .map(|t| t.and_utc().timestamp())
            .map_err(|_| Error::InvalidEngine)
    } else {
        parse_number(s)
    }
}

/// Decodes `%XX` escapes.
pub(crate) fn decode_percent(s: &str) -> Result<String, Error> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = s.get(i + 1..i + 3).ok_or(Error::InvalidEngine)?;
            out.push(parse_hex_byte(hex)?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    Ok(String::from_utf8_lossy(&out).into_owned())
}

/// Decodes the `\xHH` escapes used in colon listings.
pub(crate) fn decode_c_string(s: &str) -> Result<String, Error> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && bytes.get(i + 1) == Some(&b'x') {
            let hex = s.get(i + 2..i + 4).ok_or(Error::InvalidEngine)?;
            out.push(parse_hex_byte(hex)?);
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    Ok(String::from_utf8_lossy(&out).into_owned())
}
