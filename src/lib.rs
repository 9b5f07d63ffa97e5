//! *Library for driving OpenPGP and CMS engines through their status protocol.*
//!
//! `pgme` runs an engine process (`gpg` or `gpgsm`) for each cryptographic
//! operation and talks to it over pipes. The engine reports progress and
//! results as status lines on a dedicated descriptor, asks for passphrases
//! over another, and streams the actual data through its standard input and
//! output. This crate multiplexes all of those descriptors, interprets the
//! status lines, and turns them into typed results.
//!
//! # Contexts and operations
//!
//! A [`Context`] holds configuration (protocol, armor, signers, callbacks) and
//! runs at most one operation at a time. Every operation comes in two forms:
//!
//! - A blocking form such as [`Context::decrypt`], which starts the engine,
//!   drives it to completion and returns the result.
//! - A `*_start` form such as [`Context::decrypt_start`], which only starts
//!   the engine. The operation then makes progress whenever its loop runs, and
//!   the result is fetched afterwards with the matching `*_result` method.
//!
//! # Event loops
//!
//! Non-blocking operations are driven by one of three loops:
//!
//! - The **global** loop, shared by every context that has no loop of its own.
//!   [`wait(None, true)`](wait()) drives all of them and returns the first one
//!   that finishes.
//! - A **private** loop, selected with [`Context::set_private_loop`] and always
//!   used for key listings. Only [`wait(Some(&ctx), ..)`](wait()) drives it.
//! - A **user** loop, selected with [`Context::set_io_callbacks`]. The
//!   application watches the descriptors handed to [`IoCallbacks::add`] and
//!   calls [`IoHandle::run`] when they become ready. Completion is announced
//!   with [`IoEvent::Done`].
//!
//! Blocking operations always use a private loop.
//!
//! # Example
//!
//! ```no_run
//! use pgme::{Context, Data};
//!
//! # fn main() -> Result<(), pgme::Error> {
//! let ctx = Context::new()?;
//! ctx.set_passphrase_provider(|_: &pgme::PassphraseRequest| {
//!     Ok(secrecy::SecretString::new("correct horse battery staple".to_owned()))
//! });
//!
//! let cipher = Data::from_bytes(std::fs::read("message.gpg")?);
//! let plain = Data::new();
//! let result = ctx.decrypt(&cipher, &plain)?;
//! for recipient in &result.recipients {
//!     println!("Encrypted to {}", recipient.keyid);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Engine lookup
//!
//! Engines are located on first use, from `$PGME_OPENPGP_ENGINE` and
//! `$PGME_CMS_ENGINE` or else by searching `$PATH`. [`set_engine_info`]
//! overrides this process-wide, [`Context::set_engine_info`] for a single
//! context.

#![cfg(unix)]

mod context;
mod data;
mod dispatch;
mod engine;
mod error;
mod event;
mod fdtable;
mod io;
mod opdata;
mod ops;
mod status;
mod wait;

#[cfg(feature = "cli-common")]
pub mod cli_common;

pub use context::Context;
pub use data::{Data, Stream};
pub use engine::info::{
    engine_info, set_default_locale, set_engine_info, EngineInfo, LocaleCategory, Protocol,
};
pub use error::Error;
pub use event::{IoCallbacks, IoEvent, IoHandle};
pub use fdtable::Direction;
pub use wait::{wait, Finished};

pub use ops::decrypt::{DecryptResult, Recipient, RecipientStatus};
pub use ops::delete::DeleteProblem;
pub use ops::encrypt::{EncryptFlags, EncryptResult};
pub use ops::genkey::GenkeyResult;
pub use ops::import::{ImportFlags, ImportProblem, ImportResult, ImportStatus};
pub use ops::keylist::{Key, KeyFlags, KeySig, KeylistMode, KeylistResult, Subkey, UserId};
pub use ops::passphrase::{PassphraseProvider, PassphraseRequest};
pub use ops::progress::ProgressObserver;
pub use ops::sign::{NewSignature, SigMode, SignResult};
pub use ops::verify::{Notation, SigStatus, Signature, VerifyResult};
pub use ops::{InvalidKey, InvalidKeyReason, Validity};
