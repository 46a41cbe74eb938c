//! SMTP reply codes, RFC 3463 enhanced status codes, and the multi-line
//! writer contract of §4.1 (`write_multi_smtp`).
//!
//! Grounded on `smtp-message/src/reply.rs`'s `ReplyCode`/`ReplyLine` constant
//! table and `smtp-server-types/src/reply.rs`'s reply-builder helpers,
//! merged into a single `Reply` type that also tracks the enhanced status
//! code spec.md requires on every permanent/temporary response.
use std::fmt;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ReplyCode(u16);

#[cfg_attr(test, allow(dead_code))]
impl ReplyCode {
    pub const SYSTEM_STATUS: ReplyCode = ReplyCode(211);
    pub const HELP_MESSAGE: ReplyCode = ReplyCode(214);
    pub const SERVICE_READY: ReplyCode = ReplyCode(220);
    pub const CLOSING_CHANNEL: ReplyCode = ReplyCode(221);
    pub const AUTH_SUCCESS: ReplyCode = ReplyCode(235);
    pub const OKAY: ReplyCode = ReplyCode(250);
    pub const USER_NOT_LOCAL_WILL_FORWARD: ReplyCode = ReplyCode(251);
    pub const START_MAIL_INPUT: ReplyCode = ReplyCode(354);
    pub const AUTH_CONTINUE: ReplyCode = ReplyCode(334);
    pub const SERVICE_NOT_AVAILABLE: ReplyCode = ReplyCode(421);
    pub const MAILBOX_TEMPORARILY_UNAVAILABLE: ReplyCode = ReplyCode(450);
    pub const LOCAL_ERROR: ReplyCode = ReplyCode(451);
    pub const INSUFFICIENT_STORAGE: ReplyCode = ReplyCode(452);
    pub const TEMP_AUTH_FAILURE: ReplyCode = ReplyCode(454);
    pub const COMMAND_UNRECOGNIZED: ReplyCode = ReplyCode(500);
    pub const SYNTAX_ERROR: ReplyCode = ReplyCode(501);
    pub const COMMAND_UNIMPLEMENTED: ReplyCode = ReplyCode(502);
    pub const BAD_SEQUENCE: ReplyCode = ReplyCode(503);
    pub const PARAMETER_UNIMPLEMENTED: ReplyCode = ReplyCode(504);
    pub const AUTH_REQUIRED: ReplyCode = ReplyCode(530);
    pub const AUTH_FAILED: ReplyCode = ReplyCode(535);
    pub const MAILBOX_UNAVAILABLE: ReplyCode = ReplyCode(550);
    pub const POLICY_REASON: ReplyCode = ReplyCode(550);
    pub const USER_NOT_LOCAL: ReplyCode = ReplyCode(551);
    pub const EXCEEDED_STORAGE: ReplyCode = ReplyCode(552);
    pub const MAILBOX_NAME_INCORRECT: ReplyCode = ReplyCode(553);
    pub const TRANSACTION_FAILED: ReplyCode = ReplyCode(554);

    pub fn custom(code: u16) -> ReplyCode {
        assert!(code < 1000);
        ReplyCode(code)
    }

    pub fn code(&self) -> u16 {
        self.0
    }

    pub fn kind(&self) -> ReplyCodeKind {
        match self.0 / 100 {
            2 => ReplyCodeKind::PositiveCompletion,
            3 => ReplyCodeKind::PositiveIntermediate,
            4 => ReplyCodeKind::TransientNegative,
            5 => ReplyCodeKind::PermanentNegative,
            _ => ReplyCodeKind::PositiveCompletion,
        }
    }
}

impl fmt::Display for ReplyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReplyCodeKind {
    PositiveCompletion,
    PositiveIntermediate,
    TransientNegative,
    PermanentNegative,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EnhancedReplyCodeSubject {
    Undefined,
    Addressing,
    Mailbox,
    MailSystem,
    Network,
    Content,
    Policy,
}

impl EnhancedReplyCodeSubject {
    fn digit(self) -> u8 {
        match self {
            EnhancedReplyCodeSubject::Undefined => 0,
            EnhancedReplyCodeSubject::Addressing => 1,
            EnhancedReplyCodeSubject::Mailbox => 2,
            EnhancedReplyCodeSubject::MailSystem => 3,
            EnhancedReplyCodeSubject::Network => 4,
            EnhancedReplyCodeSubject::Content => 6,
            EnhancedReplyCodeSubject::Policy => 7,
        }
    }
}

/// `class.subject.detail`, e.g. `5.5.3` ("bounce has more than one
/// recipient", spec.md §8 scenario 2) or `4.7.0` ("too many errors").
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EnhancedReplyCode {
    pub class: u8, // 2, 4 or 5
    pub subject: EnhancedReplyCodeSubject,
    pub detail: u8,
}

impl EnhancedReplyCode {
    pub const fn new(class: u8, subject: EnhancedReplyCodeSubject, detail: u8) -> Self {
        EnhancedReplyCode {
            class,
            subject,
            detail,
        }
    }

    pub fn success_undefined() -> Self {
        Self::new(2, EnhancedReplyCodeSubject::Undefined, 0)
    }

    pub fn subject(&self) -> EnhancedReplyCodeSubject {
        self.subject
    }
}

impl fmt::Display for EnhancedReplyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.class, self.subject.digit(), self.detail)
    }
}

/// A (possibly multi-line) SMTP reply, bundling the 3-digit code, the
/// optional enhanced status code and the human-readable text lines.
#[derive(Clone, Debug)]
pub struct Reply {
    pub code: ReplyCode,
    pub ecode: Option<EnhancedReplyCode>,
    pub text: Vec<String>,
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.text.join(" "))
    }
}

impl Reply {
    pub fn new(code: ReplyCode, ecode: Option<EnhancedReplyCode>, text: impl Into<String>) -> Self {
        Reply {
            code,
            ecode,
            text: vec![text.into()],
        }
    }

    /// Soft wrap length used by [`to_lines`](Self::to_lines); a single
    /// text entry is never split even if it exceeds this.
    const SOFT_WRAP: usize = 400;

    /// Renders this reply as the wire lines of `write_multi_smtp`: all but
    /// the last line get `code + "-"`, the last gets `code + " "`.
    pub fn to_lines(&self) -> Vec<String> {
        let mut entries = Vec::new();
        for text in &self.text {
            if let Some(ecode) = &self.ecode {
                let prefix = format!("{} ", ecode);
                if text.len() + prefix.len() <= Self::SOFT_WRAP {
                    entries.push(format!("{}{}", prefix, text));
                    continue;
                }
            }
            entries.push(text.clone());
        }
        if entries.is_empty() {
            entries.push(String::new());
        }
        let last = entries.len() - 1;
        entries
            .into_iter()
            .enumerate()
            .map(|(i, line)| {
                let sep = if i == last { ' ' } else { '-' };
                format!("{}{}{}", self.code, sep, line)
            })
            .collect()
    }

    pub fn is_positive(&self) -> bool {
        matches!(
            self.code.kind(),
            ReplyCodeKind::PositiveCompletion | ReplyCodeKind::PositiveIntermediate
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multiline_reply_shares_code() {
        let r = Reply {
            code: ReplyCode::OKAY,
            ecode: None,
            text: vec!["first".into(), "second".into()],
        };
        assert_eq!(r.to_lines(), vec!["250-first".to_string(), "250 second".to_string()]);
    }

    #[test]
    fn enhanced_code_renders() {
        let e = EnhancedReplyCode::new(5, EnhancedReplyCodeSubject::Policy, 3);
        assert_eq!(e.to_string(), "5.7.3");
    }

    #[test]
    fn kind_from_code() {
        assert_eq!(ReplyCode::OKAY.kind(), ReplyCodeKind::PositiveCompletion);
        assert_eq!(ReplyCode::MAILBOX_UNAVAILABLE.kind(), ReplyCodeKind::PermanentNegative);
        assert_eq!(
            ReplyCode::MAILBOX_TEMPORARILY_UNAVAILABLE.kind(),
            ReplyCodeKind::TransientNegative
        );
    }
}
