//! Error type.

use std::io;

use crate::ops::delete::DeleteProblem;

/// The various errors that can be returned while driving an engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A caller-supplied argument was not acceptable.
    #[error("Invalid value")]
    InvalidValue,
    /// A required data object was absent or empty.
    #[error("No data")]
    NoData,
    /// An allocation failed.
    #[error("Out of core")]
    OutOfCore,
    /// The engine violated its own protocol, or could not be found.
    #[error("Invalid crypto engine")]
    InvalidEngine,
    /// The engine process could not be started.
    #[error("Failed to execute engine: {0}")]
    Exec(#[source] io::Error),
    /// A pipe to the engine could not be created.
    #[error("Failed to create pipe: {0}")]
    Pipe(#[source] io::Error),
    /// Reading, writing or polling a descriptor failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// The engine needed a passphrase but none could be obtained.
    #[error("No passphrase given")]
    NoPassphrase,
    /// The engine rejected the passphrase.
    #[error("Bad passphrase")]
    BadPassphrase,
    /// At least one recipient was rejected.
    #[error("Unusable public key")]
    UnusablePubkey,
    /// At least one signer was rejected.
    #[error("Unusable secret key")]
    UnusableSeckey,
    /// The engine could not decrypt the message.
    #[error("Decryption failed")]
    DecryptionFailed,
    /// The engine failed without a more specific explanation.
    #[error("General error")]
    General,
    /// The operation was canceled.
    #[error("Operation canceled")]
    Canceled,
    /// The engine reported a `FAILURE` status.
    #[error("Engine failure in {location} (code {code})")]
    Failure { location: String, code: u32 },
    /// The engine reported an `ERROR` status that ends the operation.
    #[error("Engine error in {location} (code {code})")]
    Engine { location: String, code: u32 },
    /// The engine refused to delete a key.
    #[error("Cannot delete key: {0}")]
    DeleteProblem(DeleteProblem),
    /// The context's protocol cannot run this operation.
    #[error("Unsupported protocol")]
    UnsupportedProtocol,
    /// The operation is still running on a caller-driven event loop.
    #[error("Operation still pending")]
    Pending,
}

fn copy_io(err: &io::Error) -> io::Error {
    io::Error::new(err.kind(), err.to_string())
}

impl Error {
    /// Rebuilds an I/O error so it can be reported to several contexts.
    pub(crate) fn io_like(err: &io::Error) -> Self {
        Error::Io(copy_io(err))
    }

    /// A copy of this error. I/O errors keep their kind and message.
    pub(crate) fn duplicate(&self) -> Self {
        match self {
            Error::InvalidValue => Error::InvalidValue,
            Error::NoData => Error::NoData,
            Error::OutOfCore => Error::OutOfCore,
            Error::InvalidEngine => Error::InvalidEngine,
            Error::Exec(e) => Error::Exec(copy_io(e)),
            Error::Pipe(e) => Error::Pipe(copy_io(e)),
            Error::Io(e) => Error::Io(copy_io(e)),
            Error::NoPassphrase => Error::NoPassphrase,
            Error::BadPassphrase => Error::BadPassphrase,
            Error::UnusablePubkey => Error::UnusablePubkey,
            Error::UnusableSeckey => Error::UnusableSeckey,
            Error::DecryptionFailed => Error::DecryptionFailed,
            Error::General => Error::General,
            Error::Canceled => Error::Canceled,
            Error::Failure { location, code } => Error::Failure {
                location: location.clone(),
                code: *code,
            },
            Error::Engine { location, code } => Error::Engine {
                location: location.clone(),
                code: *code,
            },
            Error::DeleteProblem(problem) => Error::DeleteProblem(*problem),
            Error::UnsupportedProtocol => Error::UnsupportedProtocol,
            Error::Pending => Error::Pending,
        }
    }
}
