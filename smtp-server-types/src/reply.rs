//! Canned [`Reply`] builders for the handlers in `smtp-server::session`,
//! carrying the exact wording spec.md §7 pins down for user-visible error
//! conditions (bare LF, line too long, too many bad commands, bad bounce).
//!
//! Grounded on the teacher's `smtp-server-types/src/reply.rs` catalog of
//! `okay_*`/`bad_sequence`/`command_unrecognized` helpers, adapted to the
//! non-generic `Reply`/`EnhancedReplyCode` of [`smtp_message`].

use smtp_message::{EnhancedReplyCode, EnhancedReplyCodeSubject as Subj, Reply, ReplyCode};

#[inline]
pub fn welcome_banner(hostname: &str, banner: &str) -> Reply {
    Reply::new(
        ReplyCode::SERVICE_READY,
        None,
        format!("{} {}", hostname, banner),
    )
}

#[inline]
pub fn okay(ecode: EnhancedReplyCode, text: impl Into<String>) -> Reply {
    Reply::new(ReplyCode::OKAY, Some(ecode), text)
}

#[inline]
pub fn okay_mail() -> Reply {
    okay(EnhancedReplyCode::success_undefined(), "Okay")
}

#[inline]
pub fn okay_rcpt() -> Reply {
    okay(EnhancedReplyCode::new(2, Subj::Addressing, 5), "Okay")
}

#[inline]
pub fn okay_rset() -> Reply {
    okay(EnhancedReplyCode::success_undefined(), "Okay")
}

#[inline]
pub fn okay_noop() -> Reply {
    okay(EnhancedReplyCode::success_undefined(), "Okay")
}

#[inline]
pub fn okay_data() -> Reply {
    Reply::new(
        ReplyCode::START_MAIL_INPUT,
        None,
        "Start mail input; end with <CRLF>.<CRLF>",
    )
}

#[inline]
pub fn okay_starttls() -> Reply {
    Reply::new(
        ReplyCode::SERVICE_READY,
        Some(EnhancedReplyCode::success_undefined()),
        "Ready to start TLS",
    )
}

#[inline]
pub fn okay_quit() -> Reply {
    Reply::new(
        ReplyCode::CLOSING_CHANNEL,
        Some(EnhancedReplyCode::success_undefined()),
        "Bye",
    )
}

#[inline]
pub fn bad_sequence() -> Reply {
    Reply::new(
        ReplyCode::BAD_SEQUENCE,
        Some(EnhancedReplyCode::new(5, Subj::MailSystem, 0)),
        "Bad sequence of commands",
    )
}

#[inline]
pub fn command_unrecognized() -> Reply {
    Reply::new(
        ReplyCode::COMMAND_UNRECOGNIZED,
        Some(EnhancedReplyCode::new(5, Subj::MailSystem, 0)),
        "Command not recognized",
    )
}

#[inline]
pub fn line_too_long() -> Reply {
    Reply::new(
        ReplyCode::custom(500),
        Some(EnhancedReplyCode::new(5, Subj::Undefined, 2)),
        "line too long",
    )
}

#[inline]
pub fn bare_linefeed() -> Reply {
    Reply::new(
        ReplyCode::SYNTAX_ERROR,
        Some(EnhancedReplyCode::new(5, Subj::Undefined, 2)),
        "bare <LF> received",
    )
}

#[inline]
pub fn too_many_errors() -> Reply {
    Reply::new(
        ReplyCode::SERVICE_NOT_AVAILABLE,
        Some(EnhancedReplyCode::new(4, Subj::Policy, 0)),
        "too many errors",
    )
}

#[inline]
pub fn bad_bounce() -> Reply {
    Reply::new(
        ReplyCode::POLICY_REASON,
        Some(EnhancedReplyCode::new(5, Subj::MailSystem, 3)),
        "bounce messages must not have more than one recipient",
    )
}

#[inline]
pub fn relay_denied() -> Reply {
    Reply::new(
        ReplyCode::USER_NOT_LOCAL,
        Some(EnhancedReplyCode::new(5, Subj::Addressing, 1)),
        "relaying denied",
    )
}

#[inline]
pub fn no_such_user() -> Reply {
    Reply::new(
        ReplyCode::MAILBOX_UNAVAILABLE,
        Some(EnhancedReplyCode::new(5, Subj::Mailbox, 1)),
        "no such user here",
    )
}

#[inline]
pub fn policy_rejected() -> Reply {
    Reply::new(
        ReplyCode::POLICY_REASON,
        Some(EnhancedReplyCode::new(5, Subj::Policy, 1)),
        "transaction rejected by policy",
    )
}

#[inline]
pub fn temp_rejected() -> Reply {
    Reply::new(
        ReplyCode::LOCAL_ERROR,
        Some(EnhancedReplyCode::new(4, Subj::MailSystem, 0)),
        "temporary failure, please try again later",
    )
}

#[inline]
pub fn size_exceeds_limit() -> Reply {
    Reply::new(
        ReplyCode::INSUFFICIENT_STORAGE,
        Some(EnhancedReplyCode::new(4, Subj::MailSystem, 3)),
        "message size exceeds fixed maximum",
    )
}

#[inline]
pub fn too_many_recipients() -> Reply {
    Reply::new(
        ReplyCode::INSUFFICIENT_STORAGE,
        Some(EnhancedReplyCode::new(4, Subj::MailSystem, 3)),
        "too many recipients",
    )
}

#[inline]
pub fn message_too_big() -> Reply {
    Reply::new(
        ReplyCode::INSUFFICIENT_STORAGE,
        Some(EnhancedReplyCode::new(5, Subj::MailSystem, 3)),
        "message too big",
    )
}

#[inline]
pub fn auth_required() -> Reply {
    Reply::new(
        ReplyCode::AUTH_REQUIRED,
        Some(EnhancedReplyCode::new(5, Subj::Policy, 1)),
        "authentication required",
    )
}

#[inline]
pub fn auth_failed() -> Reply {
    Reply::new(
        ReplyCode::AUTH_FAILED,
        Some(EnhancedReplyCode::new(5, Subj::Policy, 8)),
        "authentication failed",
    )
}

#[inline]
pub fn temp_auth_failure() -> Reply {
    Reply::new(
        ReplyCode::TEMP_AUTH_FAILURE,
        Some(EnhancedReplyCode::new(4, Subj::Policy, 0)),
        "tempnoauth",
    )
}

#[inline]
pub fn internal_server_error() -> Reply {
    Reply::new(
        ReplyCode::LOCAL_ERROR,
        Some(EnhancedReplyCode::new(4, Subj::Undefined, 0)),
        "internal server error",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_lf_wording_matches_spec() {
        assert_eq!(bare_linefeed().to_string(), "501 bare <LF> received");
    }

    #[test]
    fn line_too_long_wording_matches_spec() {
        assert_eq!(line_too_long().to_string(), "500 line too long");
    }

    #[test]
    fn too_many_errors_wording_matches_spec() {
        assert_eq!(too_many_errors().to_string(), "421 too many errors");
    }
}
