//! Contexts: configuration, the running operation and its results.
//!
//! Every operation has a non-blocking `*_start` form and a blocking form.
//! The blocking form starts the operation on the context's private loop,
//! waits for it with [`wait`](crate::wait()) and returns the result.

use log::{debug, trace};
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::os::fd::RawFd;
use std::path::Path;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::data::Data;
use crate::dispatch::{Callbacks, Notice, Session, StatusChain};
use crate::engine::info::{default_locale, engine_info, EngineInfo, Locale, LocaleCategory, Protocol};
use crate::engine::{Channel, Engine, Registrar};
use crate::error::Error;
use crate::event::{Event, IoCallbacks, IoHandle};
use crate::fdtable::{Direction, FdTable, Tag};
use crate::io::select;
use crate::opdata::OpDataRegistry;
use crate::ops::decrypt::{DecryptResult, DecryptStatus};
use crate::ops::delete::DeleteStatus;
use crate::ops::encrypt::{EncryptFlags, EncryptResult, EncryptStatus};
use crate::ops::genkey::{GenkeyResult, GenkeyStatus};
use crate::ops::import::{ImportResult, ImportStatusHandler};
use crate::ops::keylist::{Key, KeylistColon, KeylistData, KeylistMode, KeylistResult, KeylistStatus};
use crate::ops::passphrase::{PassphraseCommand, PassphraseProvider, PassphraseStatus};
use crate::ops::progress::{ProgressHandler, ProgressObserver};
use crate::ops::sign::{SigMode, SignResult, SignStatus};
use crate::ops::verify::{VerifyResult, VerifyStatus};
use crate::wait::{self, global};

/// Which loop drives an operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum LoopKind {
    /// Polled by `wait` for this context alone.
    Private,
    /// Polled by `wait(None, ..)` together with other contexts.
    Global,
    /// Polled by the application through [`IoCallbacks`].
    User,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Verb {
    Encrypt,
    Sign,
    Decrypt,
    Verify,
    Keylist,
    Import,
    Delete,
    Genkey,
}

/// What the loop knows about one registered descriptor.
pub(crate) struct WaitItem {
    channel: Channel,
    pid: u32,
    /// Set for every descriptor of a process once it has been reaped.
    exit: Option<ExitStatus>,
    user_tag: Option<u64>,
}

/// Records `status` on every descriptor belonging to process `pid`.
fn propagate_exit(fdt: &mut FdTable<WaitItem>, pid: u32, status: ExitStatus) {
    for entry in fdt.iter_mut().filter(|entry| entry.item.pid == pid) {
        entry.item.exit = Some(status);
    }
}

struct Operation {
    verb: Verb,
    lp: LoopKind,
    /// Number of signers a sign operation was started with.
    signers: usize,
    finished: bool,
    outcome: Option<Result<(), Error>>,
}

struct Config {
    info: EngineInfo,
    locale: Locale,
    armor: bool,
    textmode: bool,
    keylist_mode: KeylistMode,
    signers: Vec<String>,
    private_loop: bool,
}

pub(crate) struct Inner {
    config: Config,
    callbacks: Callbacks,
    io_cbs: Option<Arc<dyn IoCallbacks>>,
    engine: Option<Engine>,
    fdt: FdTable<WaitItem>,
    results: OpDataRegistry,
    op: Option<Operation>,
    notices: Vec<Notice>,
    events: Vec<Event>,
    diagnostics: Data,
    canceled: Arc<AtomicBool>,
    this: Weak<Shared>,
}

/// How long an application-driven operation waits for its engine to exit
/// after the last descriptor closed.
const USER_EXIT_GRACE: Duration = Duration::from_millis(500);

/// How long `cancel` waits for a context busy in a callback before leaving
/// the request to the loop.
const CANCEL_LOCK_TIMEOUT: Duration = Duration::from_millis(50);

/// A context's state, plus the cancellation request that can be made
/// without holding its lock.
pub(crate) struct Shared {
    state: Mutex<Inner>,
    canceled: Arc<AtomicBool>,
}

impl Shared {
    pub(crate) fn lock(&self) -> MutexGuard<'_, Inner> {
        self.state.lock()
    }
}

/// Registers descriptors with whichever loop drives the operation.
struct Binding<'a> {
    fdt: &'a mut FdTable<WaitItem>,
    io_cbs: Option<&'a Arc<dyn IoCallbacks>>,
    lp: LoopKind,
    this: &'a Weak<Shared>,
}

impl Binding<'_> {
    fn user_add(&mut self, tag: Tag) -> Result<(), Error> {
        let (cbs, entry) = match (self.io_cbs, self.fdt.get_mut(tag)) {
            (Some(cbs), Some(entry)) if self.lp == LoopKind::User => (cbs, entry),
            _ => return Ok(()),
        };
        let handle = IoHandle {
            ctx: self.this.clone(),
            tag,
        };
        entry.item.user_tag = Some(cbs.add(entry.fd, entry.dir, handle)?);
        Ok(())
    }

    fn user_remove(&mut self, tag: Tag) {
        let user_tag = self
            .fdt
            .get_mut(tag)
            .and_then(|entry| entry.item.user_tag.take());
        if let (Some(cbs), Some(user_tag)) = (self.io_cbs, user_tag) {
            cbs.remove(user_tag);
        }
    }
}

impl Registrar for Binding<'_> {
    fn add(
        &mut self,
        fd: RawFd,
        dir: Direction,
        channel: Channel,
        pid: u32,
    ) -> Result<Tag, Error> {
        let tag = self.fdt.put(
            fd,
            dir,
            WaitItem {
                channel,
                pid,
                exit: None,
                user_tag: None,
            },
        )?;
        if let Err(e) = self.user_add(tag) {
            self.fdt.remove(tag);
            return Err(e);
        }
        trace!("Registered fd {} for {:?} ({:?})", fd, channel, dir);
        Ok(tag)
    }

    fn remove(&mut self, tag: Tag) {
        self.user_remove(tag);
        if let Some(entry) = self.fdt.remove(tag) {
            trace!("Removed fd {} ({:?})", entry.fd, entry.item.channel);
        }
    }

    fn freeze(&mut self, tag: Tag, frozen: bool) {
        // The application's loop cannot skip a ready descriptor, so it
        // stops watching it instead.
        if frozen {
            self.user_remove(tag);
        }
        if let Some(entry) = self.fdt.get_mut(tag) {
            entry.frozen = frozen;
        }
        if !frozen {
            if let Err(e) = self.user_add(tag) {
                debug!("Failed to re-add thawed descriptor: {}", e);
            }
        }
    }
}

impl Inner {
    pub(crate) fn running(&self) -> bool {
        self.op.as_ref().map_or(false, |op| !op.finished)
    }

    pub(crate) fn loop_kind(&self) -> Option<LoopKind> {
        self.op.as_ref().map(|op| op.lp)
    }

    /// The outcome of a finished operation, once.
    pub(crate) fn take_outcome(&mut self) -> Option<Result<(), Error>> {
        self.op
            .as_mut()
            .filter(|op| op.finished)
            .and_then(|op| op.outcome.take())
    }

    /// Descriptors the loop should poll.
    pub(crate) fn poll_set(&self) -> Vec<(Tag, RawFd, Direction)> {
        if !self.running() {
            return vec![];
        }
        self.fdt
            .iter()
            .filter(|(_, entry)| !entry.frozen)
            .map(|(tag, entry)| (tag, entry.fd, entry.dir))
            .collect()
    }

    fn with_engine<R>(
        &mut self,
        f: impl FnOnce(&mut Engine, &mut Session<'_>, &mut Binding<'_>) -> R,
    ) -> Option<R> {
        let Inner {
            engine,
            fdt,
            results,
            callbacks,
            notices,
            io_cbs,
            op,
            canceled,
            this,
            ..
        } = self;
        let engine = engine.as_mut()?;
        let mut session = Session {
            results,
            callbacks,
            protocol: engine.protocol(),
            notices,
            canceled: &**canceled,
        };
        let mut binding = Binding {
            fdt,
            io_cbs: io_cbs.as_ref(),
            lp: op.as_ref().map_or(LoopKind::Private, |op| op.lp),
            this,
        };
        Some(f(engine, &mut session, &mut binding))
    }

    /// Runs the handlers of the `ready` descriptors. If none of them is
    /// still registered, checks whether the engine has exited instead.
    pub(crate) fn service(&mut self, ready: &[Tag]) {
        if self.observe_cancel() {
            return;
        }
        for &tag in ready {
            if let Some(entry) = self.fdt.get_mut(tag) {
                entry.signaled = true;
            }
        }
        let signaled = self.fdt.signaled();
        if signaled.is_empty() {
            self.idle();
            return;
        }
        for tag in signaled {
            self.dispatch(tag, false);
        }
    }

    fn dispatch(&mut self, tag: Tag, hangup: bool) {
        let channel = match self.fdt.get_mut(tag) {
            Some(entry) if !entry.frozen => {
                entry.signaled = false;
                entry.item.channel
            }
            _ => return,
        };
        if !self.running() {
            return;
        }
        let outcome = self.with_engine(|engine, session, reg| {
            if hangup {
                engine.hangup(channel, session, reg)
            } else {
                engine.handle_io(channel, session, reg)
            }
        });
        self.flush_notices();
        // A cancel made from a callback wins over whatever the callback
        // returned.
        if self.observe_cancel() {
            return;
        }
        match outcome {
            Some(Err(e)) => self.abort(e),
            _ => self.check_done(),
        }
    }

    /// Acts on a pending cancellation request. Returns `true` if there was
    /// one.
    fn observe_cancel(&mut self) -> bool {
        if !self.canceled.swap(false, Ordering::SeqCst) {
            return false;
        }
        if self.running() {
            debug!("Canceling operation");
            self.abort(Error::Canceled);
        }
        true
    }

    /// Probes for engine exit when none of its descriptors was ready.
    fn idle(&mut self) {
        if !self.running() {
            return;
        }
        match self.engine.as_mut().map(Engine::try_reap) {
            Some(Ok(Some((pid, status)))) => propagate_exit(&mut self.fdt, pid, status),
            Some(Ok(None)) => return,
            Some(Err(e)) => return self.abort(e),
            None => (),
        }

        // The process is gone. Whatever it wrote before exiting shows up as
        // readiness on the next poll; the rest has nothing left to deliver.
        let orphaned: Vec<(Tag, RawFd, Direction)> = self
            .fdt
            .iter()
            .filter(|(_, entry)| entry.item.exit.is_some() && !entry.frozen)
            .map(|(tag, entry)| (tag, entry.fd, entry.dir))
            .collect();
        let fds: Vec<(RawFd, Direction)> =
            orphaned.iter().map(|&(_, fd, dir)| (fd, dir)).collect();
        let ready = match select(&fds, 0) {
            Ok(ready) => ready,
            Err(e) => return self.abort(Error::io_like(&e)),
        };
        for (&(tag, _, _), ready) in orphaned.iter().zip(ready) {
            if !ready {
                self.dispatch(tag, true);
            }
        }
        self.check_done();
    }

    fn flush_notices(&mut self) {
        let user = self.loop_kind() == Some(LoopKind::User);
        for notice in self.notices.drain(..) {
            match notice {
                Notice::NextKey if user => self.events.push(Event::NextKey),
                Notice::NextKey => (),
            }
        }
    }

    /// Finishes the operation once every descriptor is closed and the
    /// engine has been reaped.
    fn check_done(&mut self) {
        if !self.running() || !self.fdt.is_empty() {
            return;
        }
        let user = self.loop_kind() == Some(LoopKind::User);
        let engine = match self.engine.as_mut() {
            Some(engine) => engine,
            None => return self.finish(Ok(())),
        };
        // Nothing services an application-driven context once its
        // descriptors are gone, so its engine gets a short grace period.
        // One still running after that is killed when the engine is dropped.
        let reaped = if user {
            engine.reap_within(USER_EXIT_GRACE)
        } else {
            engine.try_reap().map(|reaped| reaped.map(|(_, status)| status))
        };
        let outcome = match reaped {
            Ok(Some(status)) => engine.exit_result(status),
            Ok(None) if user => {
                debug!("Engine still running after closing its descriptors");
                Ok(())
            }
            Ok(None) => return,
            Err(e) => Err(e),
        };
        self.finish(outcome);
    }

    /// Closes every descriptor, kills the engine and finishes with `err`.
    pub(crate) fn abort(&mut self, err: Error) {
        debug!("Aborting operation: {}", err);
        self.with_engine(|engine, _, reg| {
            engine.close_all(reg);
            engine.kill();
        });
        self.notices.clear();
        self.finish(Err(err));
    }

    fn finish(&mut self, outcome: Result<(), Error>) {
        let op = match self.op.as_mut() {
            Some(op) if !op.finished => op,
            _ => return,
        };
        op.finished = true;
        match &outcome {
            Ok(()) => debug!("{:?} finished", op.verb),
            Err(e) => debug!("{:?} failed: {}", op.verb, e),
        }

        if op.verb == Verb::Sign {
            if let Some(result) = self.results.lookup_mut::<SignResult>() {
                result.check_signer_count(op.signers);
            }
        }
        match op.lp {
            LoopKind::User => {
                let event = Event::Done(outcome.as_ref().map(|_| ()).map_err(Error::duplicate));
                self.events.push(event);
            }
            LoopKind::Global => global::done(&self.this),
            LoopKind::Private => (),
        }
        op.outcome = Some(outcome);
    }

    /// Discards the previous operation and everything it produced.
    fn reset(&mut self) {
        self.with_engine(|engine, _, reg| engine.close_all(reg));
        self.engine = None;
        for entry in self.fdt.drain() {
            if let (Some(cbs), Some(user_tag)) = (&self.io_cbs, entry.item.user_tag) {
                cbs.remove(user_tag);
            }
        }
        global::forget(&self.this);
        self.canceled.store(false, Ordering::SeqCst);
        self.results.clear();
        self.op = None;
        self.notices.clear();
        self.events.clear();
        self.diagnostics = Data::new();
    }

    fn select_loop(&self, blocking: bool, verb: Verb) -> LoopKind {
        if blocking {
            LoopKind::Private
        } else if self.io_cbs.is_some() {
            LoopKind::User
        } else if self.config.private_loop || verb == Verb::Keylist {
            LoopKind::Private
        } else {
            LoopKind::Global
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.with_engine(|engine, _, reg| engine.close_all(reg));
    }
}

/// A handle to a crypto session.
///
/// A context runs at most one operation at a time. Clones share the same
/// session.
#[derive(Clone)]
pub struct Context {
    pub(crate) inner: Arc<Shared>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context").finish_non_exhaustive()
    }
}

impl Context {
    /// Creates a context for the OpenPGP protocol, using the process-wide
    /// engine configuration and default locale.
    pub fn new() -> Result<Self, Error> {
        let canceled = Arc::new(AtomicBool::new(false));
        let inner = Arc::new_cyclic(|this| Shared {
            state: Mutex::new(Inner {
                config: Config {
                    info: engine_info(Protocol::OpenPgp),
                    locale: default_locale(),
                    armor: false,
                    textmode: false,
                    keylist_mode: KeylistMode::default(),
                    signers: vec![],
                    private_loop: false,
                },
                callbacks: Callbacks::default(),
                io_cbs: None,
                engine: None,
                fdt: FdTable::new(),
                results: OpDataRegistry::default(),
                op: None,
                notices: vec![],
                events: vec![],
                diagnostics: Data::new(),
                canceled: canceled.clone(),
                this: this.clone(),
            }),
            canceled,
        });
        Ok(Context { inner })
    }

    pub(crate) fn from_shared(inner: Arc<Shared>) -> Self {
        Context { inner }
    }

    /// Changes the protocol, taking the engine configured for it.
    pub fn set_protocol(&self, protocol: Protocol) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        if inner.running() {
            return Err(Error::InvalidValue);
        }
        inner.config.info = engine_info(protocol);
        Ok(())
    }

    pub fn protocol(&self) -> Protocol {
        self.inner.lock().config.info.protocol
    }

    /// Overrides the engine binary and home directory for this context only.
    pub fn set_engine_info(&self, file_name: Option<&Path>, home_dir: Option<&Path>) {
        let mut inner = self.inner.lock();
        let protocol = inner.config.info.protocol;
        inner.config.info = EngineInfo {
            protocol,
            file_name: file_name
                .map(Path::to_path_buf)
                .or_else(|| engine_info(protocol).file_name),
            home_dir: home_dir.map(Path::to_path_buf),
        };
    }

    pub fn engine_info(&self) -> EngineInfo {
        self.inner.lock().config.info.clone()
    }

    /// Requests ASCII armored output.
    pub fn set_armor(&self, armor: bool) {
        self.inner.lock().config.armor = armor;
    }

    pub fn armor(&self) -> bool {
        self.inner.lock().config.armor
    }

    pub fn set_textmode(&self, textmode: bool) {
        self.inner.lock().config.textmode = textmode;
    }

    pub fn textmode(&self) -> bool {
        self.inner.lock().config.textmode
    }

    pub fn set_keylist_mode(&self, mode: KeylistMode) {
        self.inner.lock().config.keylist_mode = mode;
    }

    pub fn keylist_mode(&self) -> KeylistMode {
        self.inner.lock().config.keylist_mode
    }

    pub fn set_locale(&self, category: LocaleCategory, value: Option<&str>) {
        self.inner.lock().config.locale.set(category, value);
    }

    /// Adds a key to sign with.
    pub fn add_signer(&self, fpr: &str) {
        self.inner.lock().config.signers.push(fpr.to_owned());
    }

    pub fn clear_signers(&self) {
        self.inner.lock().config.signers.clear();
    }

    pub fn signers(&self) -> Vec<String> {
        self.inner.lock().config.signers.clone()
    }

    /// Answers the engine's passphrase queries. Without a provider the
    /// engine runs in batch mode.
    pub fn set_passphrase_provider<P: PassphraseProvider + 'static>(&self, provider: P) {
        self.inner.lock().callbacks.passphrase = Some(Box::new(provider));
    }

    pub fn clear_passphrase_provider(&self) {
        self.inner.lock().callbacks.passphrase = None;
    }

    pub fn set_progress_observer<O: ProgressObserver + 'static>(&self, observer: O) {
        self.inner.lock().callbacks.progress = Some(Box::new(observer));
    }

    pub fn clear_progress_observer(&self) {
        self.inner.lock().callbacks.progress = None;
    }

    /// Hands descriptor polling to the application. Takes effect for
    /// operations started afterwards.
    pub fn set_io_callbacks(&self, callbacks: Option<Arc<dyn IoCallbacks>>) {
        self.inner.lock().io_cbs = callbacks;
    }

    /// Runs non-blocking operations on a loop of their own, driven by
    /// `wait(Some(ctx), ..)`, instead of the global loop.
    pub fn set_private_loop(&self, private: bool) {
        self.inner.lock().config.private_loop = private;
    }

    /// What the engine wrote to its standard error during the last operation.
    pub fn diagnostics(&self) -> Data {
        self.inner.lock().diagnostics.clone()
    }

    /// Delivers queued events to the application's callbacks.
    pub(crate) fn deliver_events(&self) {
        let (cbs, events) = {
            let mut inner = self.inner.lock();
            (inner.io_cbs.clone(), std::mem::take(&mut inner.events))
        };
        if let Some(cbs) = cbs {
            for event in &events {
                cbs.event(event.as_io_event());
            }
        }
    }

    fn start<F>(&self, verb: Verb, blocking: bool, setup: F) -> Result<(), Error>
    where
        F: FnOnce(&mut Engine, &Config) -> Result<(), Error>,
    {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.running() {
            return Err(Error::InvalidValue);
        }
        inner.reset();

        let config = &inner.config;
        let mut engine = Engine::new(
            config.info.clone(),
            config.locale.clone(),
            config.armor,
            config.textmode,
        );
        setup(&mut engine, config)?;
        engine.set_diagnostics(&inner.diagnostics);
        if inner.callbacks.passphrase.is_some() {
            engine.set_command_handler(PassphraseCommand);
        }

        let lp = inner.select_loop(blocking, verb);
        debug!("Starting {:?} on the {:?} loop", verb, lp);
        inner.op = Some(Operation {
            verb,
            lp,
            signers: if verb == Verb::Sign {
                config.signers.len()
            } else {
                0
            },
            finished: false,
            outcome: None,
        });
        inner.engine = Some(engine);

        if let Some(Err(e)) = inner.with_engine(|engine, _, reg| engine.start(reg)) {
            inner.engine = None;
            inner.op = None;
            return Err(e);
        }
        match lp {
            LoopKind::User => inner.events.push(Event::Start),
            LoopKind::Global => global::activate(&inner.this),
            LoopKind::Private => (),
        }
        drop(guard);
        self.deliver_events();
        Ok(())
    }

    /// Waits on the private loop for an operation started with `blocking`.
    fn finish_blocking(&self) -> Result<(), Error> {
        match wait::wait(Some(self), true)? {
            Some(finished) => finished.status,
            None => Ok(()),
        }
    }

    fn result<R: Clone + Default + crate::opdata::Record>(&self) -> Option<R> {
        self.inner.lock().results.lookup::<R>().cloned()
    }

    /// Cancels the running operation. Its descriptors are closed and it
    /// finishes with [`Error::Canceled`].
    ///
    /// May be called from another thread or from inside a passphrase or
    /// progress callback. While a callback runs the context stays busy, so
    /// the request is recorded and carried out as soon as the callback
    /// returns; no further status line is handled in between.
    pub fn cancel(&self) -> Result<(), Error> {
        self.inner.canceled.store(true, Ordering::SeqCst);
        match self.inner.state.try_lock_for(CANCEL_LOCK_TIMEOUT) {
            Some(mut inner) => {
                inner.observe_cancel();
            }
            None => {
                debug!("Context busy, cancellation deferred");
                return Ok(());
            }
        }
        self.deliver_events();
        Ok(())
    }

    fn encrypt_setup(
        recipients: &[&str],
        flags: EncryptFlags,
        plain: &Data,
        cipher: &Data,
    ) -> impl FnOnce(&mut Engine, &Config) -> Result<(), Error> {
        let recipients: Vec<String> = recipients.iter().map(|r| r.to_string()).collect();
        let (plain, cipher) = (plain.clone(), cipher.clone());
        move |engine, _| {
            engine.set_status_handler(
                StatusChain::new()
                    .with(ProgressHandler)
                    .with(PassphraseStatus)
                    .with(EncryptStatus),
            );
            engine.op_encrypt(&recipients, flags, &plain, &cipher)
        }
    }

    /// Starts encrypting `plain` to `recipients` into `cipher`. Without
    /// recipients the data is encrypted symmetrically.
    pub fn encrypt_start(
        &self,
        recipients: &[&str],
        flags: EncryptFlags,
        plain: &Data,
        cipher: &Data,
    ) -> Result<(), Error> {
        let setup = Self::encrypt_setup(recipients, flags, plain, cipher);
        self.start(Verb::Encrypt, false, setup)
    }

    pub fn encrypt(
        &self,
        recipients: &[&str],
        flags: EncryptFlags,
        plain: &Data,
        cipher: &Data,
    ) -> Result<EncryptResult, Error> {
        let setup = Self::encrypt_setup(recipients, flags, plain, cipher);
        self.start(Verb::Encrypt, true, setup)?;
        self.finish_blocking()?;
        Ok(self.encrypt_result().unwrap_or_default())
    }

    pub fn encrypt_result(&self) -> Option<EncryptResult> {
        self.result()
    }

    fn sign_setup(
        plain: &Data,
        sig: &Data,
        mode: SigMode,
    ) -> impl FnOnce(&mut Engine, &Config) -> Result<(), Error> {
        let (plain, sig) = (plain.clone(), sig.clone());
        move |engine, config| {
            engine.set_status_handler(
                StatusChain::new()
                    .with(ProgressHandler)
                    .with(PassphraseStatus)
                    .with(SignStatus),
            );
            engine.op_sign(&config.signers, mode, &plain, &sig)
        }
    }

    /// Starts signing `plain` with the context's signers into `sig`.
    pub fn sign_start(&self, plain: &Data, sig: &Data, mode: SigMode) -> Result<(), Error> {
        self.start(Verb::Sign, false, Self::sign_setup(plain, sig, mode))
    }

    pub fn sign(&self, plain: &Data, sig: &Data, mode: SigMode) -> Result<SignResult, Error> {
        self.start(Verb::Sign, true, Self::sign_setup(plain, sig, mode))?;
        self.finish_blocking()?;
        Ok(self.sign_result().unwrap_or_default())
    }

    pub fn sign_result(&self) -> Option<SignResult> {
        self.result()
    }

    fn decrypt_setup(
        cipher: &Data,
        plain: &Data,
    ) -> impl FnOnce(&mut Engine, &Config) -> Result<(), Error> {
        let (cipher, plain) = (cipher.clone(), plain.clone());
        move |engine, _| {
            engine.set_status_handler(
                StatusChain::new()
                    .with(ProgressHandler)
                    .with(PassphraseStatus)
                    .with(DecryptStatus),
            );
            engine.op_decrypt(&cipher, &plain);
            Ok(())
        }
    }

    pub fn decrypt_start(&self, cipher: &Data, plain: &Data) -> Result<(), Error> {
        self.start(Verb::Decrypt, false, Self::decrypt_setup(cipher, plain))
    }

    pub fn decrypt(&self, cipher: &Data, plain: &Data) -> Result<DecryptResult, Error> {
        self.start(Verb::Decrypt, true, Self::decrypt_setup(cipher, plain))?;
        self.finish_blocking()?;
        Ok(self.decrypt_result().unwrap_or_default())
    }

    pub fn decrypt_result(&self) -> Option<DecryptResult> {
        self.result()
    }

    fn verify_setup(
        sig: &Data,
        signed_text: Option<&Data>,
        plaintext: Option<&Data>,
    ) -> impl FnOnce(&mut Engine, &Config) -> Result<(), Error> {
        let sig = sig.clone();
        let signed_text = signed_text.cloned();
        let plaintext = plaintext.cloned();
        move |engine, _| {
            engine.set_status_handler(StatusChain::new().with(ProgressHandler).with(VerifyStatus));
            engine.op_verify(&sig, signed_text.as_ref(), plaintext.as_ref())
        }
    }

    /// Starts verifying `sig`. Pass `signed_text` for a detached signature,
    /// or `plaintext` to receive the signed data of an attached one.
    pub fn verify_start(
        &self,
        sig: &Data,
        signed_text: Option<&Data>,
        plaintext: Option<&Data>,
    ) -> Result<(), Error> {
        let setup = Self::verify_setup(sig, signed_text, plaintext);
        self.start(Verb::Verify, false, setup)
    }

    pub fn verify(
        &self,
        sig: &Data,
        signed_text: Option<&Data>,
        plaintext: Option<&Data>,
    ) -> Result<VerifyResult, Error> {
        let setup = Self::verify_setup(sig, signed_text, plaintext);
        self.start(Verb::Verify, true, setup)?;
        self.finish_blocking()?;
        Ok(self.verify_result().unwrap_or_default())
    }

    pub fn verify_result(&self) -> Option<VerifyResult> {
        self.result()
    }

    /// Starts listing keys matching `patterns`. Keys are retrieved with
    /// [`keylist_next`](Context::keylist_next).
    pub fn keylist_start(&self, patterns: &[&str], secret_only: bool) -> Result<(), Error> {
        let patterns: Vec<String> = patterns.iter().map(|p| p.to_string()).collect();
        self.start(Verb::Keylist, false, move |engine, config| {
            engine.set_status_handler(StatusChain::new().with(ProgressHandler).with(KeylistStatus));
            engine.set_colon_handler(KeylistColon);
            engine.op_keylist(&patterns, secret_only, config.keylist_mode);
            Ok(())
        })
    }

    /// Returns the next listed key, or `None` at the end of the listing.
    ///
    /// On the private loop this drives the engine until a key is available.
    /// With [`IoCallbacks`] it returns [`Error::Pending`] until the
    /// application has delivered the next [`IoEvent::NextKey`](crate::IoEvent::NextKey).
    pub fn keylist_next(&self) -> Result<Option<Key>, Error> {
        loop {
            {
                let mut inner = self.inner.lock();
                let key = inner
                    .results
                    .lookup_mut::<KeylistData>()
                    .and_then(|data| data.queue.pop_front());
                if key.is_some() {
                    return Ok(key);
                }
                let op = match inner.op.as_mut() {
                    Some(op) if op.verb == Verb::Keylist => op,
                    _ => return Err(Error::InvalidValue),
                };
                if op.finished {
                    return op.outcome.take().unwrap_or(Ok(())).map(|()| None);
                }
                if op.lp != LoopKind::Private {
                    return Err(Error::Pending);
                }
            }
            wait::run_pass(std::slice::from_ref(self));
        }
    }

    /// Ends a listing early. Keys not yet retrieved are discarded.
    pub fn keylist_end(&self) -> Result<(), Error> {
        {
            let mut inner = self.inner.lock();
            if let Some(data) = inner.results.lookup_mut::<KeylistData>() {
                data.queue.clear();
            }
            if inner.running() {
                inner.abort(Error::Canceled);
            }
        }
        self.deliver_events();
        Ok(())
    }

    pub fn keylist_result(&self) -> Option<KeylistResult> {
        self.inner
            .lock()
            .results
            .lookup::<KeylistData>()
            .map(|data| data.result.clone())
    }

    fn import_setup(keydata: &Data) -> impl FnOnce(&mut Engine, &Config) -> Result<(), Error> {
        let keydata = keydata.clone();
        move |engine, _| {
            engine.set_status_handler(
                StatusChain::new()
                    .with(ProgressHandler)
                    .with(ImportStatusHandler),
            );
            engine.op_import(&keydata);
            Ok(())
        }
    }

    pub fn import_start(&self, keydata: &Data) -> Result<(), Error> {
        self.start(Verb::Import, false, Self::import_setup(keydata))
    }

    pub fn import(&self, keydata: &Data) -> Result<ImportResult, Error> {
        self.start(Verb::Import, true, Self::import_setup(keydata))?;
        self.finish_blocking()?;
        Ok(self.import_result().unwrap_or_default())
    }

    pub fn import_result(&self) -> Option<ImportResult> {
        self.result()
    }

    fn delete_setup(
        fpr: &str,
        allow_secret: bool,
    ) -> impl FnOnce(&mut Engine, &Config) -> Result<(), Error> {
        let fpr = fpr.to_owned();
        move |engine, _| {
            engine.set_status_handler(StatusChain::new().with(DeleteStatus));
            engine.op_delete(&fpr, allow_secret);
            Ok(())
        }
    }

    /// Starts deleting the key `fpr`, including its secret part if
    /// `allow_secret` is set.
    pub fn delete_start(&self, fpr: &str, allow_secret: bool) -> Result<(), Error> {
        self.start(Verb::Delete, false, Self::delete_setup(fpr, allow_secret))
    }

    pub fn delete(&self, fpr: &str, allow_secret: bool) -> Result<(), Error> {
        self.start(Verb::Delete, true, Self::delete_setup(fpr, allow_secret))?;
        self.finish_blocking()
    }

    fn genkey_setup(
        params: &str,
        pubkey: Option<&Data>,
        seckey: Option<&Data>,
    ) -> impl FnOnce(&mut Engine, &Config) -> Result<(), Error> {
        let params = params.to_owned();
        let pubkey = pubkey.cloned();
        let seckey = seckey.cloned();
        move |engine, _| {
            engine.set_status_handler(StatusChain::new().with(ProgressHandler).with(GenkeyStatus));
            engine.op_genkey(&params, pubkey.as_ref(), seckey.as_ref())
        }
    }

    /// Starts generating a key from a `<GnupgKeyParms format="internal">`
    /// parameter block. The OpenPGP engine stores the key in its keyring, so
    /// `pubkey` and `seckey` must be `None`.
    pub fn genkey_start(
        &self,
        params: &str,
        pubkey: Option<&Data>,
        seckey: Option<&Data>,
    ) -> Result<(), Error> {
        let setup = Self::genkey_setup(params, pubkey, seckey);
        self.start(Verb::Genkey, false, setup)
    }

    pub fn genkey(
        &self,
        params: &str,
        pubkey: Option<&Data>,
        seckey: Option<&Data>,
    ) -> Result<GenkeyResult, Error> {
        let setup = Self::genkey_setup(params, pubkey, seckey);
        self.start(Verb::Genkey, true, setup)?;
        self.finish_blocking()?;
        Ok(self.genkey_result().unwrap_or_default())
    }

    pub fn genkey_result(&self) -> Option<GenkeyResult> {
        self.result()
    }
}
