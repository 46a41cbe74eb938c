//! Qsmtpd: the inbound SMTP/ESMTP server (C6 + C7, spec.md §4.6-4.7).
//!
//! [`filters`] holds the independently testable per-recipient policy
//! catalog; [`session`] drives the command state machine that calls into
//! it. A Qsmtpd binary builds one [`session::ServerConfig`] at startup and
//! spawns one [`session::Session`] per accepted connection.

pub mod filters;
pub mod session;

pub use session::{box_io, DynIo, Outcome, Session, ServerConfig};
