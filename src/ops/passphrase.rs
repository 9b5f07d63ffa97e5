//! Passphrase tracking and the command handler that answers passphrase
//! queries.

use std::io::Write;

use log::debug;
use secrecy::{ExposeSecret, SecretString};

use crate::dispatch::{write_response, CommandHandler, Session, StatusHandler};
use crate::error::Error;
use crate::status::{parse_number, StatusCode};

/// What the engine told us about the passphrase it is asking for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PassphraseRequest {
    /// The `USERID_HINT` of the key, if one was announced.
    pub uid_hint: Option<String>,
    /// The most recent `NEED_PASSPHRASE*` arguments.
    pub info: Option<String>,
    /// Whether the previous attempt was rejected.
    pub prev_was_bad: bool,
    /// The longest passphrase the engine accepts, if it said so.
    pub max_len: Option<usize>,
}

impl PassphraseRequest {
    /// A prompt suitable for showing to a user.
    pub fn prompt(&self) -> String {
        let target = self.uid_hint.as_deref().unwrap_or("the secret key");
        if self.prev_was_bad {
            format!("Bad passphrase; retry for {}", target)
        } else {
            format!("Enter passphrase for {}", target)
        }
    }
}

/// Supplies passphrases when the engine asks for one.
///
/// Implementations may block on user input. Returning an error ends the
/// current operation with that error.
pub trait PassphraseProvider: Send {
    fn passphrase(&mut self, request: &PassphraseRequest) -> Result<SecretString, Error>;
}

impl<F> PassphraseProvider for F
where
    F: FnMut(&PassphraseRequest) -> Result<SecretString, Error> + Send,
{
    fn passphrase(&mut self, request: &PassphraseRequest) -> Result<SecretString, Error> {
        self(request)
    }
}

#[derive(Debug, Default)]
pub(crate) struct PassphraseData {
    pub(crate) uid_hint: Option<String>,
    pub(crate) info: Option<String>,
    pub(crate) bad_passphrase: u32,
    pub(crate) no_passphrase: bool,
    pub(crate) max_len: Option<usize>,
}

fn is_passphrase_query(code: StatusCode, keyword: &str) -> bool {
    code == StatusCode::GetHidden
        && (keyword == "passphrase.enter" || keyword == "passphrase.pin.ask")
}

pub(crate) struct PassphraseStatus;

impl StatusHandler for PassphraseStatus {
    fn handle(&self, session: &mut Session<'_>, code: StatusCode, args: &str) -> Result<(), Error> {
        let data = session.results.get_or_create::<PassphraseData>()?;
        match code {
            StatusCode::InquireMaxlen => data.max_len = Some(parse_number(args.trim())?),
            StatusCode::UseridHint => data.uid_hint = Some(args.to_owned()),
            StatusCode::BadPassphrase => {
                data.bad_passphrase += 1;
                data.no_passphrase = false;
            }
            StatusCode::GoodPassphrase => {
                data.bad_passphrase = 0;
                data.no_passphrase = false;
            }
            StatusCode::NeedPassphrase
            | StatusCode::NeedPassphraseSym
            | StatusCode::NeedPassphrasePin => data.info = Some(args.to_owned()),
            StatusCode::MissingPassphrase => data.no_passphrase = true,
            // Only reaches the chain when nobody can answer it.
            code if is_passphrase_query(code, args.trim()) => return Err(Error::NoPassphrase),
            StatusCode::Eof => {
                if data.no_passphrase {
                    return Err(Error::NoPassphrase);
                }
                if data.bad_passphrase > 0 {
                    return Err(Error::BadPassphrase);
                }
            }
            _ => (),
        }
        Ok(())
    }
}

pub(crate) struct PassphraseCommand;

impl CommandHandler for PassphraseCommand {
    fn handle(
        &self,
        session: &mut Session<'_>,
        code: StatusCode,
        keyword: &str,
        out: &mut dyn Write,
    ) -> Result<bool, Error> {
        if !is_passphrase_query(code, keyword) {
            return Ok(false);
        }

        let data = session.results.get_or_create::<PassphraseData>()?;
        let request = PassphraseRequest {
            uid_hint: data.uid_hint.clone(),
            info: data.info.clone(),
            prev_was_bad: data.bad_passphrase > 0,
            max_len: data.max_len,
        };
        // The attempt may succeed this time.
        data.bad_passphrase = 0;

        let provider = session
            .callbacks
            .passphrase
            .as_mut()
            .ok_or(Error::NoPassphrase)?;
        debug!("Requesting passphrase (retry: {})", request.prev_was_bad);
        let passphrase = provider.passphrase(&request)?;
        write_response(out, passphrase.expose_secret().as_bytes())?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;
    use std::sync::{Arc, Mutex};

    use super::{
        PassphraseCommand, PassphraseData, PassphraseProvider, PassphraseRequest,
        PassphraseStatus,
    };
    use crate::dispatch::testing::Harness;
    use crate::dispatch::CommandHandler;
    use crate::error::Error;
    use crate::status::StatusCode;

    fn recording_provider(
        seen: Arc<Mutex<Vec<PassphraseRequest>>>,
    ) -> Box<dyn PassphraseProvider> {
        Box::new(move |request: &PassphraseRequest| {
            seen.lock().unwrap().push(request.clone());
            Ok(SecretString::new("hunter2".to_owned()))
        })
    }

    fn ask(harness: &mut Harness, out: &mut Vec<u8>) -> bool {
        PassphraseCommand
            .handle(
                &mut harness.session(),
                StatusCode::GetHidden,
                "passphrase.enter",
                out,
            )
            .unwrap()
    }

    #[test]
    fn retry_is_flagged_and_cleared() {
        let seen = Arc::new(Mutex::new(vec![]));
        let mut harness = Harness::default();
        harness.callbacks.passphrase = Some(recording_provider(seen.clone()));
        let mut out = vec![];

        harness
            .feed(
                &PassphraseStatus,
                &["USERID_HINT 0123456789ABCDEF Alice", "NEED_PASSPHRASE info1"],
            )
            .unwrap();
        assert!(ask(&mut harness, &mut out));
        harness
            .feed(
                &PassphraseStatus,
                &["BAD_PASSPHRASE 0123456789ABCDEF", "NEED_PASSPHRASE info1"],
            )
            .unwrap();
        assert!(ask(&mut harness, &mut out));
        harness
            .feed(&PassphraseStatus, &["GOOD_PASSPHRASE", "EOF"])
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(!seen[0].prev_was_bad);
        assert!(seen[1].prev_was_bad);
        assert_eq!(seen[1].info.as_deref(), Some("info1"));
        assert_eq!(
            seen[1].prompt(),
            "Bad passphrase; retry for 0123456789ABCDEF Alice"
        );
        assert_eq!(out, b"hunter2\nhunter2\n");
        assert_eq!(
            harness
                .results
                .lookup::<PassphraseData>()
                .map(|d| d.bad_passphrase),
            Some(0)
        );
    }

    #[test]
    fn eof_reports_unresolved_passphrase() {
        let mut harness = Harness::default();
        assert!(matches!(
            harness.feed(&PassphraseStatus, &["MISSING_PASSPHRASE", "EOF"]),
            Err(Error::NoPassphrase)
        ));

        let mut harness = Harness::default();
        assert!(matches!(
            harness.feed(&PassphraseStatus, &["BAD_PASSPHRASE X", "EOF"]),
            Err(Error::BadPassphrase)
        ));
    }

    #[test]
    fn unanswerable_query_fails() {
        let mut harness = Harness::default();
        assert!(matches!(
            harness.feed(&PassphraseStatus, &["GET_HIDDEN passphrase.enter"]),
            Err(Error::NoPassphrase)
        ));

        let mut out = vec![];
        assert!(matches!(
            PassphraseCommand.handle(
                &mut harness.session(),
                StatusCode::GetHidden,
                "passphrase.enter",
                &mut out,
            ),
            Err(Error::NoPassphrase)
        ));
        assert!(!PassphraseCommand
            .handle(
                &mut harness.session(),
                StatusCode::GetBool,
                "keyedit.prompt",
                &mut out,
            )
            .unwrap());
        assert!(out.is_empty());
    }

    #[test]
    fn maxlen_is_forwarded() {
        let seen = Arc::new(Mutex::new(vec![]));
        let mut harness = Harness::default();
        harness.callbacks.passphrase = Some(recording_provider(seen.clone()));
        harness
            .feed(&PassphraseStatus, &["INQUIRE_MAXLEN 255"])
            .unwrap();
        ask(&mut harness, &mut vec![]);
        assert_eq!(seen.lock().unwrap()[0].max_len, Some(255));
    }
}
