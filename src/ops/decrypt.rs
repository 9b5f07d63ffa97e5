//! Decryption results, from `ENC_TO`, `PLAINTEXT` and friends.

use super::{parse_error_status, parse_plaintext, push_checked, Failure};
use crate::dispatch::{Session, StatusHandler};
use crate::error::Error;
use crate::status::{parse_number, Args, StatusCode};

/// Whether we hold the secret key for a recipient.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecipientStatus {
    Available,
    NoSecretKey,
}

/// A key the message was encrypted to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Recipient {
    pub keyid: String,
    pub pubkey_algo: u32,
    pub status: RecipientStatus,
}

/// The outcome of a decryption operation.
#[derive(Clone, Debug, Default)]
pub struct DecryptResult {
    pub recipients: Vec<Recipient>,
    /// The name of the encrypted file, if the message carried one.
    pub file_name: Option<String>,
    pub symmetric_algo: Option<u32>,
    /// The algorithm the engine could not handle, if that was the problem.
    pub unsupported_algorithm: Option<String>,
    pub wrong_key_usage: bool,
    okay: bool,
    failed: bool,
    failure: Option<Failure>,
}

/// `ENC_TO <keyid> [<pk-algo> [<length>]]`
fn parse_enc_to(args: &str) -> Result<Recipient, Error> {
    let mut args = Args::new(args);
    let keyid = args.token()?.to_owned();
    let pubkey_algo = args
        .next_token()
        .map(parse_number)
        .transpose()?
        .unwrap_or(0);
    Ok(Recipient {
        keyid,
        pubkey_algo,
        status: RecipientStatus::Available,
    })
}

pub(crate) struct DecryptStatus;

impl StatusHandler for DecryptStatus {
    fn handle(&self, session: &mut Session<'_>, code: StatusCode, args: &str) -> Result<(), Error> {
        let result = session.results.get_or_create::<DecryptResult>()?;
        match code {
            StatusCode::DecryptionOkay => result.okay = true,
            StatusCode::DecryptionFailed => result.failed = true,
            StatusCode::EncTo => {
                let recipient = parse_enc_to(args)?;
                push_checked(&mut result.recipients, recipient)?;
            }
            StatusCode::NoSeckey => {
                let keyid = args.trim();
                let recipient = result
                    .recipients
                    .iter_mut()
                    .find(|r| r.keyid == keyid)
                    .ok_or(Error::InvalidEngine)?;
                recipient.status = RecipientStatus::NoSecretKey;
            }
            StatusCode::DecryptionInfo => {
                let mut args = Args::new(args);
                args.token()?;
                result.symmetric_algo = Some(args.number()?);
            }
            StatusCode::Plaintext => result.file_name = parse_plaintext(args)?,
            StatusCode::Error => match parse_error_status(args)?.0 {
                "decrypt.algorithm" => {
                    let mut fields = Args::new(args);
                    fields.token()?;
                    fields.token()?;
                    result.unsupported_algorithm = fields.next_token().map(String::from);
                }
                "decrypt.keyusage" => result.wrong_key_usage = true,
                _ => (),
            },
            StatusCode::Failure => Failure::record(&mut result.failure, args)?,
            StatusCode::Eof => {
                if result.failed {
                    return Err(Error::DecryptionFailed);
                }
                if !result.okay {
                    return Err(Error::NoData);
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

#[cfg(test)]
mod tests {
    use super::{DecryptResult, DecryptStatus, RecipientStatus};
    use crate::dispatch::testing::Harness;
    use crate::error::Error;

    #[test]
    fn successful_decryption() {
        let mut harness = Harness::default();
        harness
            .feed(
                &DecryptStatus,
                &[
                    "ENC_TO 1111222233334444 1 0",
                    "ENC_TO AAAABBBBCCCCDDDD 18 0",
                    "NO_SECKEY 1111222233334444",
                    "DECRYPTION_INFO 2 9",
                    "PLAINTEXT 62 1700000000 notes.txt",
                    "DECRYPTION_OKAY",
                    "EOF",
                ],
            )
            .unwrap();
        let result = harness.results.lookup::<DecryptResult>().unwrap();
        assert_eq!(result.recipients.len(), 2);
        assert_eq!(result.recipients[0].status, RecipientStatus::NoSecretKey);
        assert_eq!(result.recipients[1].status, RecipientStatus::Available);
        assert_eq!(result.recipients[1].pubkey_algo, 18);
        assert_eq!(result.symmetric_algo, Some(9));
        assert_eq!(result.file_name.as_deref(), Some("notes.txt"));
    }

    #[test]
    fn failures_at_eof() {
        let mut harness = Harness::default();
        assert!(matches!(
            harness.feed(
                &DecryptStatus,
                &["ERROR decrypt.algorithm 228 TWOFISH", "DECRYPTION_FAILED", "EOF"]
            ),
            Err(Error::DecryptionFailed)
        ));
        assert_eq!(
            harness
                .results
                .lookup::<DecryptResult>()
                .and_then(|r| r.unsupported_algorithm.clone())
                .as_deref(),
            Some("TWOFISH")
        );

        let mut harness = Harness::default();
        assert!(matches!(
            harness.feed(&DecryptStatus, &["EOF"]),
            Err(Error::NoData)
        ));
    }

    #[test]
    fn unknown_recipient_is_an_engine_error() {
        let mut harness = Harness::default();
        assert!(matches!(
            harness.feed(&DecryptStatus, &["NO_SECKEY 1111222233334444"]),
            Err(Error::InvalidEngine)
        ));
    }
}
