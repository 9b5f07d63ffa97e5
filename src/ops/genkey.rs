//! Key generation from an internal parameter block.

use super::{parse_error_status, Failure};
use crate::dispatch::{Session, StatusHandler};
use crate::error::Error;
use crate::status::{Args, StatusCode};

/// What a key generation created.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GenkeyResult {
    pub primary: bool,
    pub sub: bool,
    pub uid: bool,
    /// Fingerprint of the new key, if the engine reported it.
    pub fpr: Option<String>,
    error: Option<(String, u32)>,
    failure: Option<Failure>,
}

/// Extracts the parameter block between the `GnupgKeyParms` tags.
pub(crate) fn extract_params(params: &str) -> Result<&str, Error> {
    const OPEN: &str = "<GnupgKeyParms format=\"internal\">";
    const CLOSE: &str = "</GnupgKeyParms>";

    let start = params.find(OPEN).ok_or(Error::InvalidValue)? + OPEN.len();
    let len = params[start..].find(CLOSE).ok_or(Error::InvalidValue)?;
    Ok(params[start..start + len].trim_start_matches(['\r', '\n']))
}

pub(crate) struct GenkeyStatus;

impl StatusHandler for GenkeyStatus {
    fn handle(&self, session: &mut Session<'_>, code: StatusCode, args: &str) -> Result<(), Error> {
        let result = session.results.get_or_create::<GenkeyResult>()?;
        match code {
            StatusCode::KeyCreated => {
                let mut args = Args::new(args);
                match args.token()? {
                    "B" => {
                        result.primary = true;
                        result.uid = true;
                        result.sub = true;
                    }
                    "P" => {
                        result.primary = true;
                        result.uid = true;
                    }
                    "S" => result.sub = true,
                    _ => return Err(Error::InvalidEngine),
                }
                if let Some(fpr) = args.next_token() {
                    result.fpr = Some(fpr.to_owned());
                }
            }
            StatusCode::Error => {
                let (location, code) = parse_error_status(args)?;
                if result.error.is_none() {
                    result.error = Some((location.to_owned(), code));
                }
            }
            StatusCode::Failure => Failure::record(&mut result.failure, args)?,
            StatusCode::Eof => {
                if let Some((location, code)) = result.error.take() {
                    return Err(Error::Engine { location, code });
                }
                if !result.primary && !result.sub {
                    return Err(Error::General);
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
    use super::{extract_params, GenkeyResult, GenkeyStatus};
    use crate::dispatch::testing::Harness;
    use crate::error::Error;

    #[test]
    fn key_created() {
        let mut harness = Harness::default();
        harness
            .feed(&GenkeyStatus, &["PROGRESS primegen + 1 0", "KEY_CREATED B AAAA", "EOF"])
            .unwrap();
        let result = harness.results.lookup::<GenkeyResult>().unwrap();
        assert!(result.primary && result.sub && result.uid);
        assert_eq!(result.fpr.as_deref(), Some("AAAA"));
    }

    #[test]
    fn failures_at_eof() {
        let mut harness = Harness::default();
        assert!(matches!(
            harness.feed(&GenkeyStatus, &["EOF"]),
            Err(Error::General)
        ));

        let mut harness = Harness::default();
        match harness.feed(
            &GenkeyStatus,
            &["ERROR key_generate 33554509", "KEY_CREATED P", "EOF"],
        ) {
            Err(Error::Engine { location, code }) => {
                assert_eq!(location, "key_generate");
                assert_eq!(code, 33554509);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn params_are_extracted() {
        let params = "<GnupgKeyParms format=\"internal\">\nKey-Type: default\n</GnupgKeyParms>\n";
        assert_eq!(extract_params(params).unwrap(), "Key-Type: default\n");
        assert!(matches!(
            extract_params("Key-Type: default\n"),
            Err(Error::InvalidValue)
        ));
    }
}
