//! Data objects exchanged with the engine.

use parking_lot::Mutex;
use std::fmt;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

/// A seekable byte stream that can back a [`Data`] object.
pub trait Stream: Read + Write + Seek + Send {}

impl<T: Read + Write + Seek + Send> Stream for T {}

/// A shared handle to a byte stream.
///
/// Inputs are read from the current position until end of stream; outputs
/// are appended at the current position. Clones refer to the same stream,
/// so the caller keeps a handle while an operation writes into it.
#[derive(Clone)]
pub struct Data {
    inner: Arc<Mutex<Box<dyn Stream>>>,
}

impl Data {
    /// Creates an empty in-memory data object.
    pub fn new() -> Self {
        Data::from_stream(Cursor::new(Vec::new()))
    }

    /// Creates an in-memory data object holding `bytes`, positioned at the start.
    pub fn from_bytes<B: Into<Vec<u8>>>(bytes: B) -> Self {
        Data::from_stream(Cursor::new(bytes.into()))
    }

    /// Wraps an arbitrary stream, such as a [`std::fs::File`].
    pub fn from_stream<S: Stream + 'static>(stream: S) -> Self {
        Data {
            inner: Arc::new(Mutex::new(Box::new(stream))),
        }
    }

    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.lock().read(buf)
    }

    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.inner.lock().write(buf)
    }

    pub fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        self.inner.lock().write_all(buf)
    }

    pub fn seek(&self, pos: SeekFrom) -> io::Result<u64> {
        self.inner.lock().seek(pos)
    }

    /// Rewinds the stream and returns its whole contents.
    pub fn to_vec(&self) -> io::Result<Vec<u8>> {
        let mut stream = self.inner.lock();
        stream.seek(SeekFrom::Start(0))?;
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf)?;
        Ok(buf)
    }
}

impl Default for Data {
    fn default() -> Self {
        Data::new()
    }
}

impl fmt::Debug for Data {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Data").finish_non_exhaustive()
    }
}
