//! The engine process wrapper.
//!
//! An [`Engine`] is configured with one operation (its arguments and the
//! data objects it reads or writes), then started. Starting creates one pipe
//! per channel, spawns the engine binary and registers the parent ends with
//! the context's event loop through a [`Registrar`]. From then on the loop
//! calls [`Engine::handle_io`] for every ready descriptor.

use log::{debug, trace, warn};
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use zeroize::Zeroizing;

use crate::data::Data;
use crate::dispatch::{write_response, ColonHandler, CommandHandler, Session, StatusChain};
use crate::error::Error;
use crate::fdtable::{Direction, Tag};
use crate::io::{pipe, set_cloexec, set_nonblocking};
use crate::ops::encrypt::EncryptFlags;
use crate::ops::genkey::extract_params;
use crate::ops::keylist::KeylistMode;
use crate::ops::sign::SigMode;
use crate::status::{parse_line, StatusCode};

pub(crate) mod info;

use info::{EngineInfo, Locale, Protocol};

const LINE_CHUNK: usize = 1024;
const DATA_CHUNK: usize = 4096;
const REAP_INTERVAL: Duration = Duration::from_millis(5);

/// Which of the engine's descriptors a registration belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Channel {
    Status,
    Colon,
    Command,
    Data(usize),
}

/// The event loop as seen by the engine.
pub(crate) trait Registrar {
    fn add(&mut self, fd: RawFd, dir: Direction, channel: Channel, pid: u32)
        -> Result<Tag, Error>;
    fn remove(&mut self, tag: Tag);
    /// A frozen descriptor stays registered but is not polled.
    fn freeze(&mut self, tag: Tag, frozen: bool);
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Splits a byte stream into lines.
#[derive(Default)]
struct LineReader {
    buf: Vec<u8>,
    eof: bool,
}

impl LineReader {
    fn fill<R: Read>(&mut self, source: &mut R) -> io::Result<()> {
        let mut chunk = [0; LINE_CHUNK];
        match source.read(&mut chunk) {
            Ok(0) => self.eof = true,
            Ok(n) => {
                self.buf
                    .try_reserve(n)
                    .map_err(|_| io::Error::from(io::ErrorKind::OutOfMemory))?;
                self.buf.extend_from_slice(&chunk[..n]);
            }
            Err(e) if is_transient(&e) => (),
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Returns the next complete line. Once the source is exhausted a
    /// trailing unterminated line is returned as well.
    fn next_line(&mut self) -> Option<String> {
        let mut line: Vec<u8> = match self.buf.iter().position(|&b| b == b'\n') {
            Some(end) => {
                let mut line: Vec<u8> = self.buf.drain(..=end).collect();
                line.pop();
                line
            }
            None if self.eof && !self.buf.is_empty() => std::mem::take(&mut self.buf),
            None => return None,
        };
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    fn finished(&self) -> bool {
        self.eof && self.buf.is_empty()
    }
}

struct LineChannel {
    file: File,
    reader: LineReader,
    tag: Option<Tag>,
}

struct CommandChannel {
    file: File,
    /// Registered only while a query waits for its answer.
    tag: Option<Tag>,
    pending: Option<(StatusCode, String)>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Target {
    Stdin,
    Stdout,
    Stderr,
    /// Passed as a `-&N` special file name.
    Arg,
}

/// A data object connected to one of the engine's descriptors.
struct DataLink {
    data: Data,
    /// `true` if the engine writes and we copy into `data`.
    inbound: bool,
    target: Target,
    parent: Option<File>,
    child: Option<OwnedFd>,
    tag: Option<Tag>,
    buf: Zeroizing<Vec<u8>>,
    filled: usize,
    pos: usize,
}

impl DataLink {
    fn close(&mut self, reg: &mut dyn Registrar) {
        if let Some(tag) = self.tag.take() {
            reg.remove(tag);
        }
        self.parent = None;
    }

    fn transfer(&mut self, reg: &mut dyn Registrar) -> Result<(), Error> {
        let file = match self.parent.as_mut() {
            Some(file) => file,
            None => return Ok(()),
        };

        if self.inbound {
            let mut chunk = Zeroizing::new([0; DATA_CHUNK]);
            match file.read(&mut chunk[..]) {
                Ok(0) => self.close(reg),
                Ok(n) => self.data.write_all(&chunk[..n])?,
                Err(e) if is_transient(&e) => (),
                Err(e) => return Err(e.into()),
            }
            return Ok(());
        }

        if self.pos == self.filled {
            if self.buf.is_empty() {
                self.buf.resize(DATA_CHUNK, 0);
            }
            let n = self.data.read(&mut self.buf)?;
            if n == 0 {
                self.close(reg);
                return Ok(());
            }
            self.filled = n;
            self.pos = 0;
        }
        match file.write(&self.buf[self.pos..self.filled]) {
            Ok(n) => self.pos += n,
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                debug!("Engine closed its input early");
                self.close(reg);
            }
            Err(e) if is_transient(&e) => (),
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }
}

enum Arg {
    Plain(String),
    Link(usize),
}

/// A single engine invocation.
pub(crate) struct Engine {
    info: EngineInfo,
    locale: Locale,
    armor: bool,
    textmode: bool,
    args: Vec<Arg>,
    links: Vec<DataLink>,
    status: Option<LineChannel>,
    colon: Option<LineChannel>,
    command: Option<CommandChannel>,
    status_handler: Option<StatusChain>,
    colon_handler: Option<Box<dyn ColonHandler>>,
    command_handler: Option<Box<dyn CommandHandler>>,
    /// An exit code that does not fail the operation.
    tolerated_exit: Option<i32>,
    child: Option<Child>,
    exit: Option<ExitStatus>,
}

impl Engine {
    pub(crate) fn new(info: EngineInfo, locale: Locale, armor: bool, textmode: bool) -> Self {
        Engine {
            info,
            locale,
            armor,
            textmode,
            args: vec![],
            links: vec![],
            status: None,
            colon: None,
            command: None,
            status_handler: None,
            colon_handler: None,
            command_handler: None,
            tolerated_exit: None,
            child: None,
            exit: None,
        }
    }

    pub(crate) fn protocol(&self) -> Protocol {
        self.info.protocol
    }

    pub(crate) fn set_status_handler(&mut self, chain: StatusChain) {
        self.status_handler = Some(chain);
    }

    /// Routes the engine's standard output to `handler` line by line.
    pub(crate) fn set_colon_handler<H: ColonHandler + 'static>(&mut self, handler: H) {
        self.colon_handler = Some(Box::new(handler));
    }

    /// Opens a command descriptor answered by `handler`.
    pub(crate) fn set_command_handler<H: CommandHandler + 'static>(&mut self, handler: H) {
        self.command_handler = Some(Box::new(handler));
    }

    /// Captures whatever the engine writes to its standard error.
    pub(crate) fn set_diagnostics(&mut self, data: &Data) {
        self.link(data, true, Target::Stderr);
    }

    fn arg<S: Into<String>>(&mut self, arg: S) {
        self.args.push(Arg::Plain(arg.into()));
    }

    fn link(&mut self, data: &Data, inbound: bool, target: Target) {
        self.links.push(DataLink {
            data: data.clone(),
            inbound,
            target,
            parent: None,
            child: None,
            tag: None,
            buf: Zeroizing::new(vec![]),
            filled: 0,
            pos: 0,
        });
        if target == Target::Arg {
            self.args.push(Arg::Link(self.links.len() - 1));
        }
    }

    fn require_openpgp(&self) -> Result<(), Error> {
        match self.info.protocol {
            Protocol::OpenPgp => Ok(()),
            Protocol::Cms => Err(Error::UnsupportedProtocol),
        }
    }

    pub(crate) fn op_encrypt(
        &mut self,
        recipients: &[String],
        flags: EncryptFlags,
        plain: &Data,
        cipher: &Data,
    ) -> Result<(), Error> {
        let symmetric = recipients.is_empty() || flags.contains(EncryptFlags::SYMMETRIC);
        if symmetric {
            self.require_openpgp()?;
        }
        if recipients.is_empty() {
            self.arg("--symmetric");
        } else {
            self.arg("--encrypt");
            if flags.contains(EncryptFlags::SYMMETRIC) {
                self.arg("--symmetric");
            }
        }
        if flags.contains(EncryptFlags::ALWAYS_TRUST) {
            self.arg("--always-trust");
        }
        if flags.contains(EncryptFlags::NO_ENCRYPT_TO) {
            self.arg("--no-encrypt-to");
        }
        if flags.contains(EncryptFlags::NO_COMPRESS) {
            self.arg("--compress-algo=none");
        }
        if flags.contains(EncryptFlags::THROW_KEYIDS) {
            self.arg("--throw-keyids");
        }
        for recipient in recipients {
            self.arg("-r");
            self.arg(recipient.as_str());
        }
        self.arg("--output");
        self.arg("-");
        self.link(plain, false, Target::Stdin);
        self.link(cipher, true, Target::Stdout);
        Ok(())
    }

    pub(crate) fn op_sign(
        &mut self,
        signers: &[String],
        mode: SigMode,
        plain: &Data,
        sig: &Data,
    ) -> Result<(), Error> {
        match mode {
            SigMode::Normal => self.arg("--sign"),
            SigMode::Detach => {
                self.arg("--sign");
                self.arg("--detach");
            }
            SigMode::Clear => {
                self.require_openpgp()?;
                self.arg("--clearsign");
            }
        }
        for signer in signers {
            self.arg("-u");
            self.arg(signer.as_str());
        }
        self.arg("--output");
        self.arg("-");
        self.link(plain, false, Target::Stdin);
        self.link(sig, true, Target::Stdout);
        Ok(())
    }

    pub(crate) fn op_decrypt(&mut self, cipher: &Data, plain: &Data) {
        self.arg("--decrypt");
        self.arg("--output");
        self.arg("-");
        self.link(cipher, false, Target::Stdin);
        self.link(plain, true, Target::Stdout);
    }

    /// Verifies `sig`. With `signed_text` the signature is detached and read
    /// through a special file name while the text goes to standard input.
    pub(crate) fn op_verify(
        &mut self,
        sig: &Data,
        signed_text: Option<&Data>,
        plaintext: Option<&Data>,
    ) -> Result<(), Error> {
        self.tolerated_exit = Some(1);
        self.arg("--verify");
        match (signed_text, plaintext) {
            (Some(signed_text), None) => {
                self.arg("--");
                self.link(sig, false, Target::Arg);
                self.arg("-");
                self.link(signed_text, false, Target::Stdin);
            }
            (None, Some(plaintext)) => {
                self.arg("--output");
                self.arg("-");
                self.link(sig, false, Target::Stdin);
                self.link(plaintext, true, Target::Stdout);
            }
            _ => return Err(Error::InvalidValue),
        }
        Ok(())
    }

    pub(crate) fn op_keylist(&mut self, patterns: &[String], secret_only: bool, mode: KeylistMode) {
        self.arg("--with-colons");
        if self.info.protocol == Protocol::OpenPgp {
            self.arg("--fixed-list-mode");
        }
        self.arg("--with-fingerprint");
        self.arg("--with-fingerprint");
        if mode.contains(KeylistMode::SIGS) {
            self.arg("--with-sig-list");
        }
        if secret_only {
            self.arg("--list-secret-keys");
        } else if mode.contains(KeylistMode::EXTERN) && !mode.contains(KeylistMode::LOCAL) {
            self.arg("--locate-external-keys");
        } else {
            self.arg("--list-keys");
        }
        self.arg("--");
        for pattern in patterns {
            self.arg(pattern.as_str());
        }
    }

    pub(crate) fn op_import(&mut self, keydata: &Data) {
        self.arg("--import");
        self.arg("--");
        self.link(keydata, false, Target::Stdin);
    }

    pub(crate) fn op_delete(&mut self, fpr: &str, allow_secret: bool) {
        self.arg(match (self.info.protocol, allow_secret) {
            (Protocol::Cms, _) => "--delete-keys",
            (Protocol::OpenPgp, false) => "--delete-key",
            (Protocol::OpenPgp, true) => "--delete-secret-and-public-key",
        });
        self.arg("--");
        self.arg(fpr);
    }

    /// Generates a key from an `<GnupgKeyParms format="internal">` block.
    pub(crate) fn op_genkey(
        &mut self,
        params: &str,
        pubkey: Option<&Data>,
        seckey: Option<&Data>,
    ) -> Result<(), Error> {
        self.require_openpgp()?;
        if pubkey.is_some() || seckey.is_some() {
            return Err(Error::InvalidValue);
        }
        let params = Data::from_bytes(extract_params(params)?.as_bytes());
        self.arg("--gen-key");
        self.link(&params, false, Target::Stdin);
        Ok(())
    }

    fn build_argv(
        &self,
        status_fd: RawFd,
        command_fd: Option<RawFd>,
        link_fd: impl Fn(usize) -> Option<RawFd>,
    ) -> Vec<String> {
        let mut argv = vec![];
        if let Some(home) = &self.info.home_dir {
            argv.push("--homedir".to_owned());
            argv.push(home.display().to_string());
        }
        argv.push("--status-fd".to_owned());
        argv.push(status_fd.to_string());
        match command_fd {
            Some(fd) => {
                argv.push("--command-fd".to_owned());
                argv.push(fd.to_string());
            }
            None => argv.push("--batch".to_owned()),
        }
        argv.push("--no-tty".to_owned());
        if let Some(ctype) = &self.locale.ctype {
            argv.push(format!("--lc-ctype={}", ctype));
        }
        if let Some(messages) = &self.locale.messages {
            argv.push(format!("--lc-messages={}", messages));
        }
        if self.armor {
            argv.push("--armor".to_owned());
        }
        if self.textmode && self.info.protocol == Protocol::OpenPgp {
            argv.push("--textmode".to_owned());
        }
        if self.args.iter().any(|arg| matches!(arg, Arg::Link(_))) {
            argv.push("--enable-special-filenames".to_owned());
        }
        for arg in &self.args {
            match arg {
                Arg::Plain(arg) => argv.push(arg.clone()),
                Arg::Link(index) => {
                    if let Some(fd) = link_fd(*index) {
                        argv.push(format!("-&{}", fd));
                    }
                }
            }
        }
        argv
    }

    /// Spawns the engine and registers its descriptors.
    ///
    /// On failure every descriptor created so far is closed and the process,
    /// if it was started, is killed.
    pub(crate) fn start(&mut self, reg: &mut dyn Registrar) -> Result<(), Error> {
        let program = self
            .info
            .file_name
            .as_ref()
            .ok_or(Error::InvalidEngine)
            .and_then(|file_name| {
                which::which(file_name).map_err(|e| {
                    debug!("Engine {} is not usable: {}", file_name.display(), e);
                    Error::InvalidEngine
                })
            })?;

        let (status_read, status_write) = pipe().map_err(Error::Pipe)?;
        let command = match self.command_handler {
            Some(_) => Some(pipe().map_err(Error::Pipe)?),
            None => None,
        };
        let colon = match self.colon_handler {
            Some(_) => Some(pipe().map_err(Error::Pipe)?),
            None => None,
        };
        let mut failed = None;
        for link in &mut self.links {
            let (read, write) = match pipe() {
                Ok(ends) => ends,
                Err(e) => {
                    failed = Some(e);
                    break;
                }
            };
            let (parent, child) = if link.inbound {
                (read, write)
            } else {
                (write, read)
            };
            link.parent = Some(File::from(parent));
            link.child = Some(child);
        }
        if let Some(e) = failed {
            self.close_fds();
            return Err(Error::Pipe(e));
        }

        let argv = self.build_argv(
            status_write.as_raw_fd(),
            command.as_ref().map(|(read, _)| read.as_raw_fd()),
            |index| {
                self.links
                    .get(index)
                    .and_then(|link| link.child.as_ref())
                    .map(AsRawFd::as_raw_fd)
            },
        );
        debug!("Spawning {} {:?}", program.display(), argv);

        let mut inherited = vec![status_write.as_raw_fd()];
        let mut cmd = Command::new(&program);
        cmd.args(&argv)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some((read, _)) = &command {
            inherited.push(read.as_raw_fd());
        }
        let mut colon_read = None;
        if let Some((read, write)) = colon {
            cmd.stdout(Stdio::from(write));
            colon_read = Some(read);
        }
        for link in &mut self.links {
            match link.target {
                Target::Stdin => {
                    if let Some(fd) = link.child.take() {
                        cmd.stdin(Stdio::from(fd));
                    }
                }
                Target::Stdout => {
                    if let Some(fd) = link.child.take() {
                        cmd.stdout(Stdio::from(fd));
                    }
                }
                Target::Stderr => {
                    if let Some(fd) = link.child.take() {
                        cmd.stderr(Stdio::from(fd));
                    }
                }
                Target::Arg => inherited.extend(link.child.as_ref().map(AsRawFd::as_raw_fd)),
            }
        }

        // SAFETY: the closure runs in the child between fork and exec and only
        // calls fcntl on descriptors that are open in the parent at spawn time.
        unsafe {
            cmd.pre_exec(move || {
                for &fd in &inherited {
                    set_cloexec(BorrowedFd::borrow_raw(fd), false)?;
                }
                Ok(())
            });
        }

        let spawned = cmd.spawn();
        // The child's ends must be closed here or we never see end of file.
        drop(cmd);
        drop(status_write);
        for link in &mut self.links {
            link.child = None;
        }
        let child = match spawned {
            Ok(child) => child,
            Err(e) => {
                self.close_fds();
                return Err(Error::Exec(e));
            }
        };
        let pid = child.id();
        debug!("Engine running as pid {}", pid);
        self.child = Some(child);

        self.status = Some(LineChannel {
            file: File::from(status_read),
            reader: LineReader::default(),
            tag: None,
        });
        self.colon = colon_read.map(|read| LineChannel {
            file: File::from(read),
            reader: LineReader::default(),
            tag: None,
        });
        self.command = command.map(|(_, write)| CommandChannel {
            file: File::from(write),
            tag: None,
            pending: None,
        });

        if let Err(e) = self.register(reg, pid) {
            self.close_all(reg);
            self.kill();
            return Err(e);
        }
        Ok(())
    }

    fn register(&mut self, reg: &mut dyn Registrar, pid: u32) -> Result<(), Error> {
        for channel in [&mut self.status, &mut self.colon].into_iter().flatten() {
            set_nonblocking(&channel.file)?;
        }
        for link in &self.links {
            if let Some(file) = &link.parent {
                set_nonblocking(file)?;
            }
        }

        if let Some(status) = &mut self.status {
            status.tag = Some(reg.add(
                status.file.as_raw_fd(),
                Direction::Read,
                Channel::Status,
                pid,
            )?);
        }
        if let Some(colon) = &mut self.colon {
            colon.tag = Some(reg.add(
                colon.file.as_raw_fd(),
                Direction::Read,
                Channel::Colon,
                pid,
            )?);
        }
        for (index, link) in self.links.iter_mut().enumerate() {
            if let Some(file) = &link.parent {
                let dir = if link.inbound {
                    Direction::Read
                } else {
                    Direction::Write
                };
                link.tag = Some(reg.add(file.as_raw_fd(), dir, Channel::Data(index), pid)?);
            }
        }
        Ok(())
    }

    fn pid(&self) -> u32 {
        self.child.as_ref().map_or(0, Child::id)
    }

    /// Services one ready descriptor.
    pub(crate) fn handle_io(
        &mut self,
        channel: Channel,
        session: &mut Session<'_>,
        reg: &mut dyn Registrar,
    ) -> Result<(), Error> {
        trace!("Descriptor ready: {:?}", channel);
        match channel {
            Channel::Status => {
                if let Some(status) = &mut self.status {
                    status.reader.fill(&mut status.file)?;
                }
                self.process_status(session, reg)
            }
            Channel::Colon => {
                if let Some(colon) = &mut self.colon {
                    colon.reader.fill(&mut colon.file)?;
                }
                self.process_colon(session, reg)
            }
            Channel::Command => self.answer_query(session, reg),
            Channel::Data(index) => match self.links.get_mut(index) {
                Some(link) => link.transfer(reg),
                None => Ok(()),
            },
        }
    }

    /// Treats `channel` as if the engine had closed it. Used once the engine
    /// has exited and the descriptor has nothing left to read.
    pub(crate) fn hangup(
        &mut self,
        channel: Channel,
        session: &mut Session<'_>,
        reg: &mut dyn Registrar,
    ) -> Result<(), Error> {
        match channel {
            Channel::Status => {
                if let Some(status) = &mut self.status {
                    status.reader.eof = true;
                }
                self.process_status(session, reg)
            }
            Channel::Colon => {
                if let Some(colon) = &mut self.colon {
                    colon.reader.eof = true;
                }
                self.process_colon(session, reg)
            }
            Channel::Command => {
                self.close_command(reg);
                if let Some(tag) = self.status.as_ref().and_then(|s| s.tag) {
                    reg.freeze(tag, false);
                }
                self.process_status(session, reg)
            }
            Channel::Data(index) => {
                if let Some(link) = self.links.get_mut(index) {
                    link.close(reg);
                }
                Ok(())
            }
        }
    }

    fn process_status(
        &mut self,
        session: &mut Session<'_>,
        reg: &mut dyn Registrar,
    ) -> Result<(), Error> {
        loop {
            if session.is_canceled()
                || self
                    .command
                    .as_ref()
                    .map_or(false, |cmd| cmd.pending.is_some())
            {
                return Ok(());
            }
            let status = match &mut self.status {
                Some(status) => status,
                None => return Ok(()),
            };
            match status.reader.next_line() {
                Some(line) => self.status_line(&line, session, reg)?,
                None if status.reader.finished() => return self.finish_status(session, reg),
                None => return Ok(()),
            }
        }
    }

    fn status_line(
        &mut self,
        line: &str,
        session: &mut Session<'_>,
        reg: &mut dyn Registrar,
    ) -> Result<(), Error> {
        let (keyword, args) = match parse_line(line) {
            Some(parsed) => parsed,
            None => {
                trace!("Skipping non-status line {:?}", line);
                return Ok(());
            }
        };
        let code = match StatusCode::from_keyword(keyword) {
            // The synthetic end of stream is sent when the descriptor closes.
            Some(StatusCode::Eof) => return Ok(()),
            Some(code) => code,
            None => {
                trace!("Ignoring unknown status {}", keyword);
                return Ok(());
            }
        };
        trace!("Status {} {}", keyword, args);

        if code.is_query() && self.command_handler.is_some() {
            if let Some(cmd) = &mut self.command {
                let tag = reg.add(
                    cmd.file.as_raw_fd(),
                    Direction::Write,
                    Channel::Command,
                    self.child.as_ref().map_or(0, Child::id),
                )?;
                cmd.tag = Some(tag);
                cmd.pending = Some((code, args.trim().to_owned()));
                if let Some(tag) = self.status.as_ref().and_then(|s| s.tag) {
                    reg.freeze(tag, true);
                }
                return Ok(());
            }
        }

        match &self.status_handler {
            Some(chain) => chain.dispatch(session, code, args),
            None => Ok(()),
        }
    }

    fn finish_status(
        &mut self,
        session: &mut Session<'_>,
        reg: &mut dyn Registrar,
    ) -> Result<(), Error> {
        if let Some(tag) = self.status.take().and_then(|status| status.tag) {
            reg.remove(tag);
        }
        self.close_command(reg);
        trace!("Status descriptor closed");
        match &self.status_handler {
            Some(chain) => chain.dispatch(session, StatusCode::Eof, ""),
            None => Ok(()),
        }
    }

    fn process_colon(
        &mut self,
        session: &mut Session<'_>,
        reg: &mut dyn Registrar,
    ) -> Result<(), Error> {
        let colon = match &mut self.colon {
            Some(colon) => colon,
            None => return Ok(()),
        };
        while let Some(line) = colon.reader.next_line() {
            if session.is_canceled() {
                return Ok(());
            }
            trace!("Colon line {}", line);
            if let Some(handler) = &self.colon_handler {
                handler.handle(session, Some(&line))?;
            }
        }
        if colon.reader.finished() {
            if let Some(tag) = colon.tag.take() {
                reg.remove(tag);
            }
            self.colon = None;
            if let Some(handler) = &self.colon_handler {
                handler.handle(session, None)?;
            }
        }
        Ok(())
    }

    fn answer_query(
        &mut self,
        session: &mut Session<'_>,
        reg: &mut dyn Registrar,
    ) -> Result<(), Error> {
        let (cmd, handler) = match (&mut self.command, &self.command_handler) {
            (Some(cmd), Some(handler)) => (cmd, handler),
            _ => return Ok(()),
        };
        if session.is_canceled() {
            return Ok(());
        }
        let (code, keyword) = match cmd.pending.take() {
            Some(pending) => pending,
            None => return Ok(()),
        };
        if let Some(tag) = cmd.tag.take() {
            reg.remove(tag);
        }

        let answered = match handler.handle(session, code, &keyword, &mut cmd.file) {
            Ok(true) => Ok(()),
            Ok(false) => {
                debug!("No answer for {} {}", code.keyword(), keyword);
                write_response(&mut cmd.file, b"").map_err(Error::from)
            }
            Err(e) => Err(e),
        };
        match answered {
            Ok(()) => (),
            Err(Error::Io(e)) if e.kind() == io::ErrorKind::BrokenPipe => {
                debug!("Engine closed its command descriptor");
                self.command = None;
            }
            Err(e) => return Err(e),
        }

        if let Some(tag) = self.status.as_ref().and_then(|s| s.tag) {
            reg.freeze(tag, false);
        }
        self.process_status(session, reg)
    }

    fn close_command(&mut self, reg: &mut dyn Registrar) {
        if let Some(tag) = self.command.take().and_then(|cmd| cmd.tag) {
            reg.remove(tag);
        }
    }

    /// Deregisters and closes every descriptor without dispatching anything.
    pub(crate) fn close_all(&mut self, reg: &mut dyn Registrar) {
        for channel in [self.status.take(), self.colon.take()].into_iter().flatten() {
            if let Some(tag) = channel.tag {
                reg.remove(tag);
            }
        }
        self.close_command(reg);
        for link in &mut self.links {
            link.close(reg);
        }
    }

    fn close_fds(&mut self) {
        for link in &mut self.links {
            link.parent = None;
            link.child = None;
        }
    }

    /// Checks whether the engine has exited, without blocking.
    pub(crate) fn try_reap(&mut self) -> Result<Option<(u32, ExitStatus)>, Error> {
        if let Some(status) = self.exit {
            return Ok(Some((self.pid(), status)));
        }
        let child = match &mut self.child {
            Some(child) => child,
            None => return Ok(None),
        };
        let status = child.try_wait()?;
        if let Some(status) = status {
            debug!("Engine pid {} exited: {}", child.id(), status);
            self.exit = Some(status);
        }
        Ok(status.map(|status| (child.id(), status)))
    }

    /// Waits up to `grace` for the engine to exit.
    pub(crate) fn reap_within(&mut self, grace: Duration) -> Result<Option<ExitStatus>, Error> {
        let deadline = Instant::now() + grace;
        loop {
            if let Some((_, status)) = self.try_reap()? {
                return Ok(Some(status));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            thread::sleep(REAP_INTERVAL);
        }
    }

    pub(crate) fn kill(&mut self) {
        if self.exit.is_some() {
            return;
        }
        if let Some(child) = &mut self.child {
            debug!("Killing engine pid {}", child.id());
            if let Err(e) = child.kill() {
                warn!("Failed to kill engine pid {}: {}", child.id(), e);
            }
            match child.wait() {
                Ok(status) => self.exit = Some(status),
                Err(e) => warn!("Failed to reap engine pid {}: {}", child.id(), e),
            }
        }
    }

    /// Maps the engine's exit status to the operation outcome.
    pub(crate) fn exit_result(&self, status: ExitStatus) -> Result<(), Error> {
        if status.success() || (status.code().is_some() && status.code() == self.tolerated_exit) {
            return Ok(());
        }
        match (status.code(), status.signal()) {
            (Some(code), _) => debug!("Engine failed with exit code {}", code),
            (None, Some(signal)) => debug!("Engine killed by signal {}", signal),
            (None, None) => (),
        }
        Err(Error::General)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.close_fds();
        self.kill();
    }
}
