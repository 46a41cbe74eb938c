//! Spawns the external queue binary and speaks the fd0/fd1 contract of
//! spec.md §4.8, then waits and maps its exit status.

use std::ffi::OsString;
use std::fs::File;
use std::io::{self, Write};
use std::os::unix::io::FromRawFd;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};

use smtp_message::Email;
use smtp_queue_fs::{close_retry, open_pipe, pipe_move};
use smtp_queue_types::{classify_exit_status, QueueOutcome};
use thiserror::Error;

use crate::envelope::write_envelope;
use crate::DEFAULT_QUEUE_PATH;

#[derive(Debug, Error)]
pub enum QueueSpawnError {
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Selects the queue binary per spec.md §4.8: `QMAILQUEUEAUTH` when the
/// client authenticated, else `QMAILQUEUE`, else the default path.
pub fn select_queue_binary(authenticated: bool) -> OsString {
    if authenticated {
        if let Some(p) = std::env::var_os("QMAILQUEUEAUTH") {
            return p;
        }
    }
    std::env::var_os("QMAILQUEUE").unwrap_or_else(|| DEFAULT_QUEUE_PATH.into())
}

/// A forked-and-waiting-for queue child, with the two pipe write ends kept
/// open by the parent (`queuefd_data`, `queuefd_hdr` in the source's
/// naming).
pub struct QueueChild {
    child: Child,
    data_pipe: File,
    hdr_pipe: File,
}

pub struct QueueHandoff;

impl QueueHandoff {
    /// Forks the queue binary, handing it fd 0 (body) and fd 1 (envelope)
    /// as its read ends; the parent keeps the write ends as
    /// `queuefd_data`/`queuefd_hdr`.
    pub fn init(authenticated: bool) -> Result<QueueChild, QueueSpawnError> {
        let binary = select_queue_binary(authenticated);

        let data = open_pipe().map_err(|_| io::Error::new(io::ErrorKind::Other, "pipe"))?;
        let hdr = open_pipe().map_err(|_| io::Error::new(io::ErrorKind::Other, "pipe"))?;

        let mut cmd = Command::new(&binary);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit());

        // SAFETY: pre_exec runs after fork and before exec, in the child,
        // with only async-signal-safe operations (close/dup2), matching
        // the `pipe_move` contract of spec.md §9.
        unsafe {
            let data = data;
            let hdr = hdr;
            cmd.pre_exec(move || {
                pipe_move(data.read_end, data.write_end, 0)
                    .map_err(|_| io::Error::new(io::ErrorKind::Other, "dup2 data"))?;
                pipe_move(hdr.read_end, hdr.write_end, 1)
                    .map_err(|_| io::Error::new(io::ErrorKind::Other, "dup2 hdr"))?;
                Ok(())
            });
        }

        let child = cmd.spawn()?;

        // Parent: close the read ends (owned by the child now), keep the
        // write ends.
        close_retry(data.read_end).ok();
        close_retry(hdr.read_end).ok();

        Ok(QueueChild {
            child,
            data_pipe: unsafe { File::from_raw_fd(data.write_end) },
            hdr_pipe: unsafe { File::from_raw_fd(hdr.write_end) },
        })
    }
}

impl QueueChild {
    /// Writes the message body to `queuefd_data`.
    pub fn write_body(&mut self, body: &[u8]) -> io::Result<()> {
        self.data_pipe.write_all(body)
    }

    /// Writes the envelope to `queuefd_hdr`.
    pub fn write_envelope(
        &mut self,
        sender: Option<&Email>,
        recipients: &[Email],
    ) -> io::Result<()> {
        write_envelope(&mut self.hdr_pipe, sender, recipients)
    }

    /// Closes both fds in the order spec.md §4.8 requires (data first,
    /// then hdr) and waits for the child, mapping its exit status.
    ///
    /// A child that exits before the envelope is fully written (detected
    /// here as a broken-pipe error while writing, or as the child already
    /// having exited when we go to wait) is reported as
    /// [`QueueOutcome::Temporary`] with the early-exit noted by the
    /// caller's logging.
    pub fn finish(self) -> io::Result<QueueOutcome> {
        let QueueChild {
            mut child,
            data_pipe,
            hdr_pipe,
        } = self;
        drop(data_pipe); // closes queuefd_data first
        drop(hdr_pipe); // then queuefd_hdr
        let status = child.wait()?;
        match status.code() {
            Some(code) => Ok(classify_exit_status(code)),
            None => Ok(QueueOutcome::Temporary), // killed by signal
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // `std::env::set_var` races across threads running in parallel within
    // the same test binary; serialize these through a single test.
    #[test]
    fn queue_binary_selection_precedence() {
        std::env::remove_var("QMAILQUEUE");
        std::env::remove_var("QMAILQUEUEAUTH");
        assert_eq!(select_queue_binary(false), OsString::from(DEFAULT_QUEUE_PATH));
        assert_eq!(select_queue_binary(true), OsString::from(DEFAULT_QUEUE_PATH));

        std::env::set_var("QMAILQUEUE", "/bin/plain-queue");
        assert_eq!(select_queue_binary(false), OsString::from("/bin/plain-queue"));
        assert_eq!(select_queue_binary(true), OsString::from("/bin/plain-queue"));

        std::env::set_var("QMAILQUEUEAUTH", "/bin/auth-queue");
        assert_eq!(select_queue_binary(false), OsString::from("/bin/plain-queue"));
        assert_eq!(select_queue_binary(true), OsString::from("/bin/auth-queue"));

        std::env::remove_var("QMAILQUEUE");
        std::env::remove_var("QMAILQUEUEAUTH");
    }

    #[test]
    fn queue_child_roundtrip_with_cat() {
        // `/bin/cat` exits 0 having read (and discarded) both fds, so this
        // exercises the real fork/pipe_move/wait path without depending on
        // an actual qmail-queue binary being present.
        std::env::remove_var("QMAILQUEUE");
        std::env::remove_var("QMAILQUEUEAUTH");
        std::env::set_var("QMAILQUEUE", "/bin/cat");
        let mut child = QueueHandoff::init(false).expect("spawn cat");
        child.write_body(b"body\r\n").expect("write body");
        child
            .write_envelope(None, &[])
            .expect("write envelope");
        let outcome = child.finish().expect("wait");
        assert_eq!(outcome, QueueOutcome::Accepted);
        std::env::remove_var("QMAILQUEUE");
    }
}
