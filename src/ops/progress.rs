//! `PROGRESS` reports forwarded to the application.

use log::trace;

use crate::dispatch::{Session, StatusHandler};
use crate::error::Error;
use crate::status::{Args, StatusCode};

/// Receives `PROGRESS` reports while an operation runs.
pub trait ProgressObserver: Send {
    /// `kind` is the engine's one-character progress type, `current` and
    /// `total` its counters (`total` is 0 when unknown).
    fn progress(&mut self, what: &str, kind: char, current: u64, total: u64);
}

impl<F> ProgressObserver for F
where
    F: FnMut(&str, char, u64, u64) + Send,
{
    fn progress(&mut self, what: &str, kind: char, current: u64, total: u64) {
        self(what, kind, current, total)
    }
}

pub(crate) struct ProgressHandler;

impl StatusHandler for ProgressHandler {
    fn handle(&self, session: &mut Session<'_>, code: StatusCode, args: &str) -> Result<(), Error> {
        if code != StatusCode::Progress {
            return Ok(());
        }

        let mut args = Args::new(args);
        let what = args.token()?;
        let kind = args.token()?.chars().next().ok_or(Error::InvalidEngine)?;
        let current = args.number()?;
        let total = args.number()?;
        trace!("Progress {} {} {}/{}", what, kind, current, total);

        if let Some(observer) = session.callbacks.progress.as_mut() {
            observer.progress(what, kind, current, total);
        }
        Ok(())
    }
}
