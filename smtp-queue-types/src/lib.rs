//! Shared types for the queue-handoff contract (C8, spec.md §4.8 and §6):
//! Qsmtpd spawns an external `qmail-queue`-compatible binary per accepted
//! message; Qremote reports per-recipient delivery outcomes back to its own
//! spawning daemon on stdout using the one-byte status codes of §6.
//!
//! Grounded on the teacher's `smtp-queue-types/src/lib.rs` (kept the crate
//! as the home for plain shared data, dropped `ScheduleInfo`/`QueueId` which
//! belonged to kannader's own on-disk retry queue -- out of scope per
//! spec.md §1 "queuing or retry semantics ... belong to the external
//! queue/sender").

use std::fmt;

/// Exit-status mapping of spec.md §4.8: `0` succeeds, `11..=40` is a
/// permanent queue-side rejection, anything else is temporary.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum QueueOutcome {
    Accepted,
    Permanent,
    Temporary,
}

pub fn classify_exit_status(code: i32) -> QueueOutcome {
    match code {
        0 => QueueOutcome::Accepted,
        11..=40 => QueueOutcome::Permanent,
        _ => QueueOutcome::Temporary,
    }
}

impl QueueOutcome {
    /// The SMTP reply code family Qsmtpd's `DATA`/`BDAT` handler should use
    /// once the queue child has exited (spec.md §4.8).
    pub fn reply_code(&self) -> u16 {
        match self {
            QueueOutcome::Accepted => 250,
            QueueOutcome::Permanent => 554,
            QueueOutcome::Temporary => 451,
        }
    }
}

/// One-byte status codes Qremote writes to its status stream for the
/// spawning daemon (spec.md §6 "Qremote invocation").
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RecipientStatusCode {
    /// `r` - accepted recipient
    Accepted,
    /// `s` - temporarily failed recipient
    TempFailed,
    /// `h` - permanently failed recipient
    PermFailed,
}

impl RecipientStatusCode {
    pub fn byte(&self) -> u8 {
        match self {
            RecipientStatusCode::Accepted => b'r',
            RecipientStatusCode::TempFailed => b's',
            RecipientStatusCode::PermFailed => b'h',
        }
    }
}

/// Connection/summary-level status codes for the same stream: `Z`
/// connection-level temporary, `D` permanent, `K` success.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SummaryStatusCode {
    ConnTemporary,
    ConnPermanent,
    Success,
}

impl SummaryStatusCode {
    pub fn byte(&self) -> u8 {
        match self {
            SummaryStatusCode::ConnTemporary => b'Z',
            SummaryStatusCode::ConnPermanent => b'D',
            SummaryStatusCode::Success => b'K',
        }
    }
}

/// Writes one status-stream record: a one-byte code, the message text, and
/// a terminating NUL (spec.md §6).
pub fn format_status_record(code: u8, text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len() + 2);
    out.push(code);
    out.extend_from_slice(text.as_bytes());
    out.push(0);
    out
}

#[derive(Debug, thiserror::Error)]
pub enum HandoffError {
    #[error("queue child exited before the envelope could be written")]
    ChildDiedEarly,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl fmt::Display for QueueOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueOutcome::Accepted => write!(f, "accepted"),
            QueueOutcome::Permanent => write!(f, "permanent"),
            QueueOutcome::Temporary => write!(f, "temporary"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_status_mapping() {
        assert_eq!(classify_exit_status(0), QueueOutcome::Accepted);
        assert_eq!(classify_exit_status(11), QueueOutcome::Permanent);
        assert_eq!(classify_exit_status(40), QueueOutcome::Permanent);
        assert_eq!(classify_exit_status(41), QueueOutcome::Temporary);
        assert_eq!(classify_exit_status(1), QueueOutcome::Temporary);
        assert_eq!(classify_exit_status(-1), QueueOutcome::Temporary);
    }

    #[test]
    fn status_record_format() {
        let rec = format_status_record(b'r', "user@example.org");
        assert_eq!(rec, b"ruser@example.org\0");
    }
}
