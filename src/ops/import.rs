//! Key import results.

use bitflags::bitflags;

use super::{push_checked, Failure};
use crate::dispatch::{Session, StatusHandler};
use crate::error::Error;
use crate::status::{parse_number, Args, StatusCode};

bitflags! {
    /// What an `IMPORT_OK` line says changed for a key.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct ImportFlags: u32 {
        const NEW = 1;
        const UID = 2;
        const SIG = 4;
        const SUBKEY = 8;
        const SECRET = 16;
    }
}

/// Why a key could not be imported.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImportProblem {
    General,
    BadCertificate,
    MissingIssuerCert,
    BadCertChain,
}

/// The per-key outcome of an import.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImportStatus {
    pub fpr: Option<String>,
    /// `None` if the key was imported.
    pub problem: Option<ImportProblem>,
    pub flags: ImportFlags,
}

/// The outcome of an import, with the engine's summary counters.
#[derive(Clone, Debug, Default)]
pub struct ImportResult {
    pub considered: u32,
    pub no_user_id: u32,
    pub imported: u32,
    pub imported_rsa: u32,
    pub unchanged: u32,
    pub new_user_ids: u32,
    pub new_sub_keys: u32,
    pub new_signatures: u32,
    pub new_revocations: u32,
    pub secret_read: u32,
    pub secret_imported: u32,
    pub secret_unchanged: u32,
    pub skipped_new_keys: u32,
    pub not_imported: u32,
    pub skipped_v3_keys: u32,
    /// One entry per `IMPORT_OK` or `IMPORT_PROBLEM`, in engine order.
    pub imports: Vec<ImportStatus>,
    failure: Option<Failure>,
}

impl ImportResult {
    fn parse_counters(&mut self, args: &str) -> Result<(), Error> {
        let mut args = Args::new(args);
        for counter in [
            &mut self.considered,
            &mut self.no_user_id,
            &mut self.imported,
            &mut self.imported_rsa,
            &mut self.unchanged,
            &mut self.new_user_ids,
            &mut self.new_sub_keys,
            &mut self.new_signatures,
            &mut self.new_revocations,
            &mut self.secret_read,
            &mut self.secret_imported,
            &mut self.secret_unchanged,
            &mut self.skipped_new_keys,
            &mut self.not_imported,
        ] {
            *counter = args.number()?;
        }
        if let Some(skipped) = args.next_token() {
            self.skipped_v3_keys = parse_number(skipped)?;
        }
        Ok(())
    }
}

/// `IMPORT_OK <flags> [<fpr>]` or `IMPORT_PROBLEM <reason> [<fpr>]`
fn parse_import(args: &str, problem: bool) -> Result<ImportStatus, Error> {
    let mut args = Args::new(args);
    let number = args.number::<u32>()?;
    let fpr = args.next_token().map(String::from);
    Ok(if problem {
        ImportStatus {
            fpr,
            problem: Some(match number {
                1 => ImportProblem::BadCertificate,
                2 => ImportProblem::MissingIssuerCert,
                3 => ImportProblem::BadCertChain,
                _ => ImportProblem::General,
            }),
            flags: ImportFlags::empty(),
        }
    } else {
        ImportStatus {
            fpr,
            problem: None,
            flags: ImportFlags::from_bits_truncate(number),
        }
    })
}

pub(crate) struct ImportStatusHandler;

impl StatusHandler for ImportStatusHandler {
    fn handle(&self, session: &mut Session<'_>, code: StatusCode, args: &str) -> Result<(), Error> {
        let result = session.results.get_or_create::<ImportResult>()?;
        match code {
            StatusCode::ImportOk | StatusCode::ImportProblem => {
                let status = parse_import(args, code == StatusCode::ImportProblem)?;
                push_checked(&mut result.imports, status)?;
            }
            StatusCode::ImportRes => result.parse_counters(args)?,
            StatusCode::Failure => Failure::record(&mut result.failure, args)?,
            StatusCode::Eof => {
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
    use super::{ImportFlags, ImportProblem, ImportResult, ImportStatusHandler};
    use crate::dispatch::testing::Harness;
    use crate::error::Error;

    #[test]
    fn imports_and_counters() {
        let mut harness = Harness::default();
        harness
            .feed(
                &ImportStatusHandler,
                &[
                    "IMPORT_OK 17 AAAA",
                    "IMPORT_PROBLEM 2 BBBB",
                    "IMPORT_OK 0",
                    "IMPORT_RES 3 0 1 0 1 0 0 0 0 1 1 0 0 1",
                    "EOF",
                ],
            )
            .unwrap();
        let result = harness.results.lookup::<ImportResult>().unwrap();
        assert_eq!(result.imports.len(), 3);
        assert_eq!(
            result.imports[0].flags,
            ImportFlags::NEW | ImportFlags::SECRET
        );
        assert_eq!(
            result.imports[1].problem,
            Some(ImportProblem::MissingIssuerCert)
        );
        assert_eq!(result.imports[2].fpr, None);
        assert_eq!(result.considered, 3);
        assert_eq!(result.secret_read, 1);
        assert_eq!(result.not_imported, 1);
        assert_eq!(result.skipped_v3_keys, 0);
    }

    #[test]
    fn counters_are_strict() {
        let mut harness = Harness::default();
        harness
            .feed(
                &ImportStatusHandler,
                &["IMPORT_RES 1 0 1 0 0 0 0 0 0 0 0 0 0 0 5"],
            )
            .unwrap();
        assert_eq!(
            harness
                .results
                .lookup::<ImportResult>()
                .map(|r| r.skipped_v3_keys),
            Some(5)
        );

        for line in [
            "IMPORT_RES 1 0 1",
            "IMPORT_RES 1 0 1 0 0 0 0 0 0 0 0 0 0 x",
            "IMPORT_OK new AAAA",
        ] {
            let mut harness = Harness::default();
            assert!(matches!(
                harness.feed(&ImportStatusHandler, &[line]),
                Err(Error::InvalidEngine)
            ));
        }
    }
}
