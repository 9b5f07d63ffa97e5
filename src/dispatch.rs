//! Handler interfaces for engine output.
//!
//! Status lines are fed through a [`StatusChain`]: an ordered list of
//! handlers that each see every line and may stop the chain with an error.
//! Handlers are stateless; whatever they accumulate lives in the context's
//! operation-data registry, reached through the [`Session`].

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::engine::info::Protocol;
use crate::error::Error;
use crate::opdata::OpDataRegistry;
use crate::ops::passphrase::PassphraseProvider;
use crate::ops::progress::ProgressObserver;
use crate::status::StatusCode;

/// User callbacks registered on a context.
#[derive(Default)]
pub(crate) struct Callbacks {
    pub(crate) passphrase: Option<Box<dyn PassphraseProvider>>,
    pub(crate) progress: Option<Box<dyn ProgressObserver>>,
}

/// Something a handler wants the event loop to announce.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Notice {
    NextKey,
}

/// The slice of context state handlers may touch.
pub(crate) struct Session<'a> {
    pub(crate) results: &'a mut OpDataRegistry,
    pub(crate) callbacks: &'a mut Callbacks,
    pub(crate) protocol: Protocol,
    pub(crate) notices: &'a mut Vec<Notice>,
    pub(crate) canceled: &'a AtomicBool,
}

impl Session<'_> {
    /// Whether cancellation was requested, possibly from inside a callback.
    pub(crate) fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }
}

/// Consumes status lines relevant to one feature.
pub(crate) trait StatusHandler: Send {
    fn handle(&self, session: &mut Session<'_>, code: StatusCode, args: &str)
        -> Result<(), Error>;
}

#[derive(Default)]
pub(crate) struct StatusChain {
    handlers: Vec<Box<dyn StatusHandler>>,
}

impl StatusChain {
    pub(crate) fn new() -> Self {
        StatusChain::default()
    }

    pub(crate) fn with<H: StatusHandler + 'static>(mut self, handler: H) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }

    pub(crate) fn dispatch(
        &self,
        session: &mut Session<'_>,
        code: StatusCode,
        args: &str,
    ) -> Result<(), Error> {
        self.handlers
            .iter()
            .try_for_each(|handler| handler.handle(session, code, args))
    }
}

/// Consumes colon-delimited listing lines; `None` marks the end of output.
pub(crate) trait ColonHandler: Send {
    fn handle(&self, session: &mut Session<'_>, line: Option<&str>) -> Result<(), Error>;
}

/// Answers engine queries arriving as `GET_BOOL`, `GET_LINE` or `GET_HIDDEN`.
pub(crate) trait CommandHandler: Send {
    /// Writes an answer for `keyword` to `out`. Returns `false` if the
    /// query was not recognised, in which case an empty line is sent.
    fn handle(
        &self,
        session: &mut Session<'_>,
        code: StatusCode,
        keyword: &str,
        out: &mut dyn Write,
    ) -> Result<bool, Error>;
}

/// Writes one response line to the engine's command descriptor.
pub(crate) fn write_response(out: &mut dyn Write, answer: &[u8]) -> io::Result<()> {
    cookie_factory::gen_simple(write::response(answer), out)
        .map_err(|e| match e {
            cookie_factory::GenError::IoError(e) => e,
            e => io::Error::new(
                io::ErrorKind::Other,
                format!("failed to write response: {:?}", e),
            ),
        })?
        .flush()
}

mod write {
    use cookie_factory::{
        combinator::{slice, string},
        sequence::tuple,
        SerializeFn,
    };
    use std::io::Write;

    pub(super) fn response<'a, W: 'a + Write>(answer: &'a [u8]) -> impl SerializeFn<W> + 'a {
        tuple((slice(answer), string("\n")))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::AtomicBool;

    use super::{Callbacks, Notice, Session, StatusHandler};
    use crate::engine::info::Protocol;
    use crate::error::Error;
    use crate::opdata::OpDataRegistry;
    use crate::status::{parse_line, StatusCode};

    /// Owns the state a [`Session`] borrows, for driving handlers directly.
    #[derive(Default)]
    pub(crate) struct Harness {
        pub(crate) results: OpDataRegistry,
        pub(crate) callbacks: Callbacks,
        pub(crate) notices: Vec<Notice>,
        pub(crate) canceled: AtomicBool,
        pub(crate) cms: bool,
    }

    impl Harness {
        pub(crate) fn session(&mut self) -> Session<'_> {
            Session {
                results: &mut self.results,
                callbacks: &mut self.callbacks,
                protocol: if self.cms {
                    Protocol::Cms
                } else {
                    Protocol::OpenPgp
                },
                notices: &mut self.notices,
                canceled: &self.canceled,
            }
        }

        /// Feeds status lines to `handler`, stopping at the first error.
        pub(crate) fn feed<H: StatusHandler>(
            &mut self,
            handler: &H,
            lines: &[&str],
        ) -> Result<(), Error> {
            for line in lines {
                let (keyword, args) = parse_line(line).expect("status line");
                let code = StatusCode::from_keyword(keyword).expect("known keyword");
                handler.handle(&mut self.session(), code, args)?;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{write_response, Callbacks, Session, StatusChain, StatusHandler};
    use crate::engine::info::Protocol;
    use crate::error::Error;
    use crate::opdata::OpDataRegistry;
    use crate::status::StatusCode;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Count(Arc<AtomicUsize>);

    impl StatusHandler for Count {
        fn handle(&self, _: &mut Session<'_>, _: StatusCode, _: &str) -> Result<(), Error> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct RejectEof;

    impl StatusHandler for RejectEof {
        fn handle(&self, _: &mut Session<'_>, code: StatusCode, _: &str) -> Result<(), Error> {
            match code {
                StatusCode::Eof => Err(Error::General),
                _ => Ok(()),
            }
        }
    }

    #[test]
    fn chain_runs_in_order_and_stops_on_error() {
        let before = Arc::new(AtomicUsize::new(0));
        let after = Arc::new(AtomicUsize::new(0));
        let chain = StatusChain::new()
            .with(Count(before.clone()))
            .with(RejectEof)
            .with(Count(after.clone()));

        let mut results = OpDataRegistry::default();
        let mut callbacks = Callbacks::default();
        let mut notices = vec![];
        let canceled = AtomicBool::new(false);
        let mut session = Session {
            results: &mut results,
            callbacks: &mut callbacks,
            protocol: Protocol::OpenPgp,
            notices: &mut notices,
            canceled: &canceled,
        };

        chain
            .dispatch(&mut session, StatusCode::Progress, "x ? 1 2")
            .unwrap();
        assert!(matches!(
            chain.dispatch(&mut session, StatusCode::Eof, ""),
            Err(Error::General)
        ));
        assert_eq!(before.load(Ordering::SeqCst), 2);
        assert_eq!(after.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn response_is_newline_terminated() {
        let mut out = Vec::new();
        write_response(&mut out, b"secret").unwrap();
        write_response(&mut out, b"").unwrap();
        assert_eq!(out, b"secret\n\n");
    }
}
