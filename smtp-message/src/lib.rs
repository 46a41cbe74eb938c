//! Wire-level types shared by Qsmtpd and Qremote: line framing primitives
//! (the strict-CRLF discipline of C1), the `Command`/`Reply` wire grammar,
//! and RFC 5321 mailbox/domain syntax (C3).

mod address;
mod command;
mod data;
mod io;
mod reply;

pub use address::{AddrMode, AddressLiteral, Classification, Email, Hostname, Localpart, Path};
pub use command::{parse_command, BdatCommand, BodyType, Command, MailParams, ParseError, RcptParams};
pub use data::{DotStuffReader, DotStuffWriter};
pub use io::{CrlfLineReader, IoKind, Line, MAX_LINE_LEN};
pub use reply::{EnhancedReplyCode, EnhancedReplyCodeSubject, Reply, ReplyCode, ReplyCodeKind};
