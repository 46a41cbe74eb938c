//! C8 — queue handoff: after Qsmtpd's C7 state machine decides to accept a
//! message, it calls [`QueueHandoff::init`], which forks the external queue
//! binary chosen per spec.md §4.8 (`QMAILQUEUEAUTH` when the client
//! authenticated, else `QMAILQUEUE`, else [`DEFAULT_QUEUE_PATH`]) with two
//! pipes: fd 0 is the body, fd 1 is the envelope.
//!
//! Grounded on `original_source/qsmtpd/child.c` for the envelope record
//! format and exit-code mapping; fd plumbing is delegated to
//! `smtp-queue-fs`'s `pipe_move` per spec.md §9 "Subprocess pipe moves".

mod envelope;
mod handoff;

pub use envelope::write_envelope;
pub use handoff::{QueueChild, QueueHandoff, QueueSpawnError};

/// Default queue binary invoked when neither `QMAILQUEUE` nor
/// `QMAILQUEUEAUTH` is set (spec.md §4.8).
pub const DEFAULT_QUEUE_PATH: &str = "/var/qmail/bin/qmail-queue";
