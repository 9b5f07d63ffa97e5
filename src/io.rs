//! POSIX primitives used by the engine wrapper and the multiplexer.

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd, RawFd};

use crate::fdtable::Direction;

/// Creates a pipe whose ends are closed on exec. Returns `(read, write)`.
pub(crate) fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let (read, write) = nix::unistd::pipe()?;
    set_cloexec(&read, true)?;
    set_cloexec(&write, true)?;
    Ok((read, write))
}

pub(crate) fn set_cloexec<Fd: AsFd>(fd: Fd, on: bool) -> io::Result<()> {
    let flags = if on {
        FdFlag::FD_CLOEXEC
    } else {
        FdFlag::empty()
    };
    fcntl(fd.as_fd(), FcntlArg::F_SETFD(flags))?;
    Ok(())
}

pub(crate) fn set_nonblocking<Fd: AsFd>(fd: Fd) -> io::Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(fd.as_fd(), FcntlArg::F_GETFL)?);
    fcntl(fd.as_fd(), FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

/// Polls `fds` for readiness, waiting at most `timeout_ms`.
///
/// Returns one flag per descriptor. Hang-ups and errors count as ready so
/// the handler gets to observe them. An interrupted poll reports nothing ready.
pub(crate) fn select(fds: &[(RawFd, Direction)], timeout_ms: u16) -> io::Result<Vec<bool>> {
    let mut poll_fds: Vec<PollFd<'_>> = fds
        .iter()
        .map(|&(fd, dir)| {
            // SAFETY: callers only pass descriptors that are registered in a
            // descriptor table, and registered descriptors stay open until
            // their entry is removed.
            let fd = unsafe { BorrowedFd::borrow_raw(fd) };
            let events = match dir {
                Direction::Read => PollFlags::POLLIN,
                Direction::Write => PollFlags::POLLOUT,
            };
            PollFd::new(fd, events)
        })
        .collect();

    match poll(&mut poll_fds, PollTimeout::from(timeout_ms)) {
        Ok(_) => Ok(poll_fds
            .iter()
            .map(|p| p.revents().map_or(false, |r| !r.is_empty()))
            .collect()),
        Err(Errno::EINTR) => Ok(vec![false; fds.len()]),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::io::Write;
    use std::os::fd::AsRawFd;

    use super::{pipe, select, set_nonblocking};
    use crate::fdtable::Direction;

    #[test]
    fn select_reports_readable_pipe() {
        let (read, write) = pipe().unwrap();
        let fds = [(read.as_raw_fd(), Direction::Read)];
        assert_eq!(select(&fds, 0).unwrap(), vec![false]);

        File::from(write).write_all(b"x").unwrap();
        assert_eq!(select(&fds, 100).unwrap(), vec![true]);
    }

    #[test]
    fn nonblocking_read_would_block() {
        let (read, _write) = pipe().unwrap();
        set_nonblocking(&read).unwrap();
        let mut file = File::from(read);
        let err = std::io::Read::read(&mut file, &mut [0; 4]).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);
    }
}
