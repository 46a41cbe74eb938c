//! The `Command` wire grammar: verb dispatch plus the ESMTP parameter
//! grammars for `MAIL FROM`/`RCPT TO`/`BDAT` named in spec.md §4.7.
//!
//! Grounded on the teacher's per-command modules (`src/mail/mod.rs`,
//! `src/rcpt/mod.rs`, `src/data/mod.rs`) collapsed into a single `Command`
//! enum the way `smtp-server/src/interact.rs` already dispatches on a verb
//! string; the ESMTP parameter grammar (`SIZE=`, `BODY=`, `AUTH=`) is new,
//! grounded on `original_source/qsmtpd/mailparse.c` and
//! `original_source/qsmtpd/rcpt.c`. `skip_space_bug` is shared with the
//! mailbox parser in [`crate::address`].

use crate::address::{addrsyntax, skip_space_bug, AddrMode, Classification, Hostname, Path};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("syntax error: {0}")]
    Syntax(String),
    #[error("duplicate ESMTP parameter: {0}")]
    DuplicateParam(&'static str),
    #[error("unknown command verb")]
    UnknownVerb,
}

/// `BODY=` value from `MAIL FROM`, per RFC 6152; governs whether the body
/// needs 7-bit recoding for a downstream hop that doesn't advertise
/// 8BITMIME (C11).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BodyType {
    SevenBit,
    EightBitMime,
}

/// Parsed ESMTP parameters trailing a `MAIL FROM:<path>` command.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MailParams {
    pub size: Option<u64>,
    pub body: Option<BodyType>,
    pub auth: Option<Vec<u8>>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RcptParams {
    // RCPT TO carries no standard ESMTP parameters in this system; kept as
    // its own type so a future extension parallels MailParams without
    // disturbing callers.
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BdatCommand {
    pub size: u64,
    pub last: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Helo(Hostname),
    Ehlo(Hostname),
    MailFrom {
        path: Path,
        params: MailParams,
        spacebug: bool,
    },
    RcptTo {
        path: Path,
        classification: Classification,
        params: RcptParams,
        spacebug: bool,
    },
    Data,
    Bdat(BdatCommand),
    Rset,
    Noop,
    Quit,
    StartTls,
    Auth(Vec<u8>),
    Vrfy(Vec<u8>),
    Expn(Vec<u8>),
    Help,
}

fn split_verb(line: &[u8]) -> (&[u8], &[u8]) {
    match line.iter().position(|&b| b == b' ' || b == b':') {
        Some(i) => (&line[..i], &line[i..]),
        None => (line, &[]),
    }
}

fn parse_esmtp_params(mut tail: &[u8]) -> Result<MailParams, ParseError> {
    let mut params = MailParams::default();
    while !tail.is_empty() {
        tail = tail.trim_ascii_start_compat();
        if tail.is_empty() {
            break;
        }
        let end = tail.iter().position(|&b| b == b' ').unwrap_or(tail.len());
        let (entry, rest) = tail.split_at(end);
        tail = rest;
        let upper = entry.to_ascii_uppercase();
        if let Some(v) = upper.strip_prefix(b"SIZE=") {
            if params.size.is_some() {
                return Err(ParseError::DuplicateParam("SIZE"));
            }
            let s = std::str::from_utf8(v)
                .map_err(|_| ParseError::Syntax("SIZE".into()))?;
            params.size = Some(
                s.parse()
                    .map_err(|_| ParseError::Syntax("SIZE".into()))?,
            );
        } else if let Some(v) = upper.strip_prefix(b"BODY=") {
            if params.body.is_some() {
                return Err(ParseError::DuplicateParam("BODY"));
            }
            params.body = Some(match v {
                b"7BIT" => BodyType::SevenBit,
                b"8BITMIME" => BodyType::EightBitMime,
                _ => return Err(ParseError::Syntax("BODY".into())),
            });
        } else if let Some(v) = entry.strip_prefix(b"AUTH=") {
            if params.auth.is_some() {
                return Err(ParseError::DuplicateParam("AUTH"));
            }
            params.auth = Some(v.to_vec());
        } else {
            return Err(ParseError::Syntax(
                String::from_utf8_lossy(entry).into_owned(),
            ));
        }
    }
    Ok(params)
}

trait TrimAsciiStartCompat {
    fn trim_ascii_start_compat(&self) -> &Self;
}
impl TrimAsciiStartCompat for [u8] {
    fn trim_ascii_start_compat(&self) -> &[u8] {
        let mut i = 0;
        while i < self.len() && self[i] == b' ' {
            i += 1;
        }
        &self[i..]
    }
}

fn parse_hostname_arg(arg: &[u8]) -> Result<Hostname, ParseError> {
    let s = std::str::from_utf8(arg)
        .map_err(|_| ParseError::Syntax("non-UTF8 hostname".into()))?
        .trim();
    if let Some(lit) = s.strip_prefix('[').and_then(|r| r.strip_suffix(']')) {
        if let Some(v6) = lit.strip_prefix("IPv6:") {
            return v6
                .parse()
                .map(|ip| Hostname::Literal(crate::address::AddressLiteral::V6(ip)))
                .map_err(|_| ParseError::Syntax("bad IPv6 literal".into()));
        }
        return lit
            .parse()
            .map(|ip| Hostname::Literal(crate::address::AddressLiteral::V4(ip)))
            .map_err(|_| ParseError::Syntax("bad IPv4 literal".into()));
    }
    Ok(Hostname::Domain(s.to_string()))
}

/// Parses one command line (already stripped of its trailing CRLF by
/// [`crate::CrlfLineReader`]). `is_local` decides RCPT TO's
/// Local/Remote classification (backed by the `rcpthosts` table, C4).
pub fn parse_command(
    line: &[u8],
    is_local: impl Fn(&Hostname) -> bool,
) -> Result<Command, ParseError> {
    let (verb, tail) = split_verb(line);
    let verb_upper = verb.to_ascii_uppercase();
    let arg = tail.strip_prefix(b":").unwrap_or(tail);

    match verb_upper.as_slice() {
        b"HELO" => Ok(Command::Helo(parse_hostname_arg(
            arg.trim_ascii_start_compat(),
        )?)),
        b"EHLO" => Ok(Command::Ehlo(parse_hostname_arg(
            arg.trim_ascii_start_compat(),
        )?)),
        b"MAIL" => {
            let (after, bugged) = skip_space_bug(arg);
            let (path, _class, rest) =
                addrsyntax(after, AddrMode::MailFrom, |_| false).map_err(|e| {
                    ParseError::Syntax(e.to_string())
                })?;
            let params = parse_esmtp_params(rest)?;
            Ok(Command::MailFrom {
                path,
                params,
                spacebug: bugged,
            })
        }
        b"RCPT" => {
            let (after, bugged) = skip_space_bug(arg);
            let (path, classification, rest) =
                addrsyntax(after, AddrMode::RcptTo, &is_local).map_err(|e| {
                    ParseError::Syntax(e.to_string())
                })?;
            if !rest.trim_ascii_start_compat().is_empty() {
                return Err(ParseError::Syntax("trailing data after RCPT TO".into()));
            }
            Ok(Command::RcptTo {
                path,
                classification,
                params: RcptParams::default(),
                spacebug: bugged,
            })
        }
        b"DATA" => Ok(Command::Data),
        b"BDAT" => {
            let mut it = arg.trim_ascii_start_compat().split(|&b| b == b' ');
            let size_s = it.next().ok_or_else(|| ParseError::Syntax("BDAT".into()))?;
            let size = std::str::from_utf8(size_s)
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .ok_or_else(|| ParseError::Syntax("BDAT size".into()))?;
            let last = matches!(it.next(), Some(b"LAST") | Some(b"last"));
            Ok(Command::Bdat(BdatCommand { size, last }))
        }
        b"RSET" => Ok(Command::Rset),
        b"NOOP" => Ok(Command::Noop),
        b"QUIT" => Ok(Command::Quit),
        b"STARTTLS" => Ok(Command::StartTls),
        b"AUTH" => Ok(Command::Auth(arg.trim_ascii_start_compat().to_vec())),
        b"VRFY" => Ok(Command::Vrfy(arg.trim_ascii_start_compat().to_vec())),
        b"EXPN" => Ok(Command::Expn(arg.trim_ascii_start_compat().to_vec())),
        b"HELP" => Ok(Command::Help),
        _ => Err(ParseError::UnknownVerb),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn always_remote(_: &Hostname) -> bool {
        false
    }

    #[test]
    fn mail_from_with_size_and_body() {
        let cmd = parse_command(
            b"MAIL FROM:<a@b> SIZE=1000 BODY=8BITMIME",
            always_remote,
        )
        .unwrap();
        match cmd {
            Command::MailFrom { params, spacebug, .. } => {
                assert_eq!(params.size, Some(1000));
                assert_eq!(params.body, Some(BodyType::EightBitMime));
                assert!(!spacebug);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn mail_from_duplicate_size_is_error() {
        let err = parse_command(b"MAIL FROM:<a@b> SIZE=1 SIZE=2", always_remote).unwrap_err();
        assert_eq!(err, ParseError::DuplicateParam("SIZE"));
    }

    #[test]
    fn rcpt_to_space_bug_is_tolerated() {
        let cmd = parse_command(b"RCPT TO:   <u@d>", always_remote).unwrap();
        match cmd {
            Command::RcptTo { spacebug, .. } => assert!(spacebug),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn bdat_parses_size_and_last() {
        let cmd = parse_command(b"BDAT 100 LAST", always_remote).unwrap();
        assert_eq!(cmd, Command::Bdat(BdatCommand { size: 100, last: true }));
    }

    #[test]
    fn unknown_verb_errors() {
        assert_eq!(
            parse_command(b"FROB", always_remote).unwrap_err(),
            ParseError::UnknownVerb
        );
    }

    #[test]
    fn helo_literal_address() {
        let cmd = parse_command(b"HELO [192.0.2.9]", always_remote).unwrap();
        assert_eq!(
            cmd,
            Command::Helo(Hostname::Literal(crate::address::AddressLiteral::V4(
                "192.0.2.9".parse().unwrap()
            )))
        );
    }
}
