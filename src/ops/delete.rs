//! Key deletion.

use std::fmt;

use super::parse_error_status;
use crate::dispatch::{Session, StatusHandler};
use crate::error::Error;
use crate::status::{parse_number, Args, StatusCode};

/// Why the engine refused to delete a key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeleteProblem {
    NoSuchKey,
    /// The key has a secret part and secret deletion was not allowed.
    MustDeleteSecretKeyFirst,
    AmbiguousSpecification,
}

impl fmt::Display for DeleteProblem {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DeleteProblem::NoSuchKey => write!(f, "no such key"),
            DeleteProblem::MustDeleteSecretKeyFirst => {
                write!(f, "the secret key must be deleted first")
            }
            DeleteProblem::AmbiguousSpecification => write!(f, "ambiguous key specification"),
        }
    }
}

/// Engine error codes for a canceled confirmation.
const CANCELED: u32 = 99;
const FULLY_CANCELED: u32 = 198;

pub(crate) struct DeleteStatus;

impl StatusHandler for DeleteStatus {
    fn handle(&self, _: &mut Session<'_>, code: StatusCode, args: &str) -> Result<(), Error> {
        match code {
            StatusCode::DeleteProblem => {
                let problem = match parse_number::<u32>(Args::new(args).token()?)? {
                    0 => return Ok(()),
                    1 => DeleteProblem::NoSuchKey,
                    2 => DeleteProblem::MustDeleteSecretKeyFirst,
                    3 => DeleteProblem::AmbiguousSpecification,
                    _ => return Err(Error::General),
                };
                Err(Error::DeleteProblem(problem))
            }
            StatusCode::Error => {
                let (location, code) = parse_error_status(args)?;
                if location == "delete_key.secret"
                    && matches!(code & 0xFFFF, CANCELED | FULLY_CANCELED)
                {
                    return Err(Error::Canceled);
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{DeleteProblem, DeleteStatus};
    use crate::dispatch::testing::Harness;
    use crate::error::Error;

    #[test]
    fn problems() {
        for (line, expected) in [
            ("DELETE_PROBLEM 1", Some(DeleteProblem::NoSuchKey)),
            ("DELETE_PROBLEM 2", Some(DeleteProblem::MustDeleteSecretKeyFirst)),
            ("DELETE_PROBLEM 3", Some(DeleteProblem::AmbiguousSpecification)),
        ] {
            let mut harness = Harness::default();
            match harness.feed(&DeleteStatus, &[line]) {
                Err(Error::DeleteProblem(problem)) => assert_eq!(Some(problem), expected),
                other => panic!("unexpected {:?}", other),
            }
        }

        let mut harness = Harness::default();
        harness
            .feed(&DeleteStatus, &["DELETE_PROBLEM 0", "EOF"])
            .unwrap();
        assert!(matches!(
            harness.feed(&DeleteStatus, &["DELETE_PROBLEM 7"]),
            Err(Error::General)
        ));
        assert!(matches!(
            harness.feed(&DeleteStatus, &["DELETE_PROBLEM two"]),
            Err(Error::InvalidEngine)
        ));
    }

    #[test]
    fn canceled_confirmation() {
        let mut harness = Harness::default();
        assert!(matches!(
            harness.feed(&DeleteStatus, &["ERROR delete_key.secret 33554531"]),
            Err(Error::Canceled)
        ));
        harness
            .feed(&DeleteStatus, &["ERROR delete_key.secret 1"])
            .unwrap();
    }
}
