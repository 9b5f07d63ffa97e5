//! Integration with an event loop owned by the application.
//!
//! A context with [`IoCallbacks`] never polls. It hands every descriptor it
//! wants watched to [`IoCallbacks::add`] together with an [`IoHandle`]; the
//! application polls, and calls [`IoHandle::run`] whenever the descriptor is
//! ready in the registered direction.

use std::os::fd::RawFd;
use std::sync::Weak;

use crate::context::{Context, Shared};
use crate::error::Error;
use crate::fdtable::{Direction, Tag};

/// Lifecycle notifications for an operation driven by [`IoCallbacks`].
#[derive(Debug)]
pub enum IoEvent<'a> {
    /// The engine has been started and its descriptors registered.
    Start,
    /// A key listing has a new key ready for `Context::keylist_next`.
    NextKey,
    /// The operation finished with the given outcome. Every descriptor has
    /// been removed by the time this is delivered.
    Done(&'a Result<(), Error>),
}

/// An application-supplied event loop.
///
/// `add` and `remove` are called while the context is locked and must not
/// call back into it. `event` is called without the lock held.
pub trait IoCallbacks: Send + Sync {
    /// Starts watching `fd` for `dir` readiness. The returned tag is passed
    /// to `remove` later.
    fn add(&self, fd: RawFd, dir: Direction, handle: IoHandle) -> Result<u64, Error>;

    fn remove(&self, tag: u64);

    fn event(&self, event: IoEvent<'_>);
}

/// Runs the handler for one registered descriptor.
#[derive(Clone)]
pub struct IoHandle {
    pub(crate) ctx: Weak<Shared>,
    pub(crate) tag: Tag,
}

impl IoHandle {
    /// Services the descriptor this handle was registered for.
    ///
    /// Does nothing if the registration has since been removed, which
    /// happens when the operation finished or was canceled.
    pub fn run(&self) -> Result<(), Error> {
        let ctx = Context::from_shared(self.ctx.upgrade().ok_or(Error::InvalidValue)?);
        ctx.inner.lock().service(&[self.tag]);
        ctx.deliver_events();
        Ok(())
    }
}

/// An event waiting to be delivered once the context is unlocked.
pub(crate) enum Event {
    Start,
    NextKey,
    Done(Result<(), Error>),
}

impl Event {
    pub(crate) fn as_io_event(&self) -> IoEvent<'_> {
        match self {
            Event::Start => IoEvent::Start,
            Event::NextKey => IoEvent::NextKey,
            Event::Done(outcome) => IoEvent::Done(outcome),
        }
    }
}
