//! fd/pipe plumbing shared by the queue (C8) and auth (C12) subprocess
//! backends: the `pipe_move` idiom of spec.md §9 "Subprocess pipe moves" --
//! close the unused end of a pipe, `dup2` the kept end onto a fixed target
//! fd in the child, close the original, all under `EINTR` retry.
//!
//! Grounded on `original_source/qsmtpd/child.c`'s fd-juggling before
//! `execve`, reimplemented on top of `nix` the way the pack's other
//! MTA-adjacent repos (`other_examples/` vSMTP/empath manifests) use it for
//! the same purpose -- the teacher itself has no subprocess code to draw
//! from here, since kannader never forks a child.

use std::io;
use std::os::unix::io::RawFd;

use nix::unistd::{close, dup2, pipe};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipeError {
    #[error(transparent)]
    Nix(#[from] nix::Error),
}

/// A pipe whose ends are about to be handed to a child process: `read_end`
/// stays in this process (or the reverse, depending on direction) while
/// `write_end` is moved onto a fixed fd number in the child via
/// [`pipe_move`].
#[derive(Clone, Copy, Debug)]
pub struct RawPipe {
    pub read_end: RawFd,
    pub write_end: RawFd,
}

/// Opens a new pipe, retrying on `EINTR`.
pub fn open_pipe() -> Result<RawPipe, PipeError> {
    loop {
        match pipe() {
            Ok((read_end, write_end)) => return Ok(RawPipe { read_end, write_end }),
            Err(nix::Error::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Child-side half of the `pipe_move` idiom: closes `unused_end`, then
/// `dup2`s `keep_end` onto `target_fd`, then closes the original `keep_end`
/// (unless it already was `target_fd`). Must run after `fork()` and before
/// `execve()`.
pub fn pipe_move(keep_end: RawFd, unused_end: RawFd, target_fd: RawFd) -> Result<(), PipeError> {
    retry_eintr(|| close(unused_end))?;
    if keep_end != target_fd {
        retry_eintr(|| dup2(keep_end, target_fd))?;
        retry_eintr(|| close(keep_end))?;
    }
    Ok(())
}

fn retry_eintr<T>(mut f: impl FnMut() -> nix::Result<T>) -> Result<T, PipeError> {
    loop {
        match f() {
            Ok(v) => return Ok(v),
            Err(nix::Error::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Parent-side cleanup: close an fd, retrying on `EINTR`, mapping failures
/// to `io::Error` for callers that otherwise deal in `std::io`.
pub fn close_retry(fd: RawFd) -> io::Result<()> {
    retry_eintr(|| close(fd)).map_err(|e| io::Error::new(io::ErrorKind::Other, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_pipe_yields_distinct_ends() {
        let p = open_pipe().unwrap();
        assert_ne!(p.read_end, p.write_end);
        close_retry(p.read_end).unwrap();
        close_retry(p.write_end).unwrap();
    }
}
