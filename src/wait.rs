//! The multiplexer: polls registered descriptors and runs their handlers.

use log::{trace, warn};
use std::collections::HashMap;
use std::sync::Arc;

use crate::context::{Context, LoopKind};
use crate::error::Error;
use crate::fdtable::Tag;
use crate::io::select;

/// How long one pass waits for a descriptor, in milliseconds. Bounded so
/// that an engine exiting without closing its pipes is still noticed.
const POLL_TIMEOUT: u16 = 100;

/// Pause between passes when no descriptor is registered.
const IDLE_TIMEOUT: u16 = 10;

/// An operation that has run to completion.
#[derive(Debug)]
pub struct Finished {
    pub context: Context,
    /// The operation's outcome. The per-operation result is available from
    /// the context.
    pub status: Result<(), Error>,
}

/// Runs one poll pass over `contexts`.
///
/// A failing poll finishes every running operation among `contexts` with
/// the poll error.
pub(crate) fn run_pass(contexts: &[Context]) {
    let mut fds = vec![];
    let mut owners: Vec<(usize, Tag)> = vec![];
    for (index, ctx) in contexts.iter().enumerate() {
        for (tag, fd, dir) in ctx.inner.lock().poll_set() {
            fds.push((fd, dir));
            owners.push((index, tag));
        }
    }

    let timeout = if fds.is_empty() {
        IDLE_TIMEOUT
    } else {
        POLL_TIMEOUT
    };
    let ready = match select(&fds, timeout) {
        Ok(ready) => ready,
        Err(e) => {
            warn!("Polling {} descriptors failed: {}", fds.len(), e);
            for ctx in contexts {
                let mut inner = ctx.inner.lock();
                if inner.running() {
                    inner.abort(Error::io_like(&e));
                }
            }
            return;
        }
    };

    let mut ready_tags: HashMap<usize, Vec<Tag>> = HashMap::new();
    for (&(index, tag), _) in owners.iter().zip(ready).filter(|(_, ready)| *ready) {
        ready_tags.entry(index).or_default().push(tag);
    }
    trace!(
        "{} of {} descriptors ready",
        ready_tags.values().map(Vec::len).sum::<usize>(),
        fds.len()
    );

    for (index, ctx) in contexts.iter().enumerate() {
        let ready = ready_tags.remove(&index).unwrap_or_default();
        ctx.inner.lock().service(&ready);
    }
}

/// Waits for an operation to finish.
///
/// With `Some(ctx)`, drives only that context's operation. With `None`,
/// drives every operation on the global loop and returns the first one that
/// finishes. If `hang` is false a single pass is made.
///
/// Returns `None` if no operation finished, or if there was nothing to wait
/// for. Contexts driven by [`IoCallbacks`](crate::IoCallbacks) cannot be
/// waited on.
pub fn wait(ctx: Option<&Context>, hang: bool) -> Result<Option<Finished>, Error> {
    match ctx {
        Some(ctx) => wait_one(ctx, hang),
        None => wait_global(hang),
    }
}

fn wait_one(ctx: &Context, hang: bool) -> Result<Option<Finished>, Error> {
    let lp = ctx.inner.lock().loop_kind();
    if lp == Some(LoopKind::User) {
        return Err(Error::InvalidValue);
    }
    let mut passes_left = if hang { None } else { Some(1) };
    loop {
        let (outcome, running) = {
            let mut inner = ctx.inner.lock();
            (inner.take_outcome(), inner.running())
        };
        if let Some(status) = outcome {
            if lp == Some(LoopKind::Global) {
                global::forget(&Arc::downgrade(&ctx.inner));
            }
            return Ok(Some(Finished {
                context: ctx.clone(),
                status,
            }));
        }
        if !running || passes_left == Some(0) {
            return Ok(None);
        }
        run_pass(std::slice::from_ref(ctx));
        passes_left = passes_left.map(|n| n - 1);
    }
}

fn wait_global(hang: bool) -> Result<Option<Finished>, Error> {
    let mut passes_left = if hang { None } else { Some(1) };
    loop {
        while let Some(ctx) = global::pop_done() {
            // A context waited on directly has already given up its outcome.
            let outcome = ctx.inner.lock().take_outcome();
            if let Some(status) = outcome {
                return Ok(Some(Finished {
                    context: ctx,
                    status,
                }));
            }
        }
        let active = global::active();
        if active.is_empty() || passes_left == Some(0) {
            return Ok(None);
        }
        run_pass(&active);
        passes_left = passes_left.map(|n| n - 1);
    }
}

/// The process-wide loop shared by contexts without a loop of their own.
///
/// Lock order: a context's lock may be held while this registry is locked,
/// never the other way round.
pub(crate) mod global {
    use lazy_static::lazy_static;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::Weak;

    use crate::context::{Context, Shared};

    type Handle = Weak<Shared>;

    #[derive(Default)]
    struct Registry {
        active: Vec<Handle>,
        done: VecDeque<Handle>,
    }

    impl Registry {
        fn forget(&mut self, ctx: &Handle) {
            self.active.retain(|other| !other.ptr_eq(ctx));
            self.done.retain(|other| !other.ptr_eq(ctx));
        }
    }

    lazy_static! {
        static ref GLOBAL: Mutex<Registry> = Mutex::new(Registry::default());
    }

    pub(crate) fn activate(ctx: &Handle) {
        let mut global = GLOBAL.lock();
        global.forget(ctx);
        global.active.push(ctx.clone());
    }

    pub(crate) fn done(ctx: &Handle) {
        let mut global = GLOBAL.lock();
        global.forget(ctx);
        global.done.push_back(ctx.clone());
    }

    pub(crate) fn forget(ctx: &Handle) {
        GLOBAL.lock().forget(ctx);
    }

    /// Running contexts on the global loop. Dropped contexts are pruned.
    pub(crate) fn active() -> Vec<Context> {
        let mut global = GLOBAL.lock();
        global.active.retain(|ctx| ctx.strong_count() > 0);
        global
            .active
            .iter()
            .filter_map(Weak::upgrade)
            .map(Context::from_shared)
            .collect()
    }

    pub(crate) fn pop_done() -> Option<Context> {
        let mut global = GLOBAL.lock();
        while let Some(ctx) = global.done.pop_front() {
            if let Some(inner) = ctx.upgrade() {
                return Some(Context::from_shared(inner));
            }
        }
        None
    }
}
