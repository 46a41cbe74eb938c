//! C3 — RFC 5321 mailbox and domain syntax.
//!
//! Grounded on `smtp-message/src/mail/mod.rs` and `smtp-message/src/misc.rs`
//! (`Hostname`/`Email`/`Path`), generalized to return the classification
//! enum spec.md §4.3 requires and to accept source-routed RCPT TO forms.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use nom::{
    branch::alt,
    bytes::complete::{tag, take_while, take_while1, take_while_m1},
    character::complete::char,
    combinator::{map, opt, recognize},
    multi::separated_list1,
    sequence::{delimited, pair, preceded, separated_pair, tuple},
    IResult,
};

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("syntax error in mailbox or domain: {0}")]
    Syntax(String),
}

/// Which of MAIL FROM / RCPT TO is being parsed: only MAIL FROM accepts the
/// empty `<>` null sender, only RCPT TO accepts a non-empty source route.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AddrMode {
    MailFrom,
    RcptTo,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AddressLiteral {
    V4(Ipv4Addr),
    V6(Ipv6Addr),
}

impl fmt::Display for AddressLiteral {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressLiteral::V4(ip) => write!(f, "[{}]", ip),
            AddressLiteral::V6(ip) => write!(f, "[IPv6:{}]", ip),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Hostname {
    Domain(String),
    Literal(AddressLiteral),
}

impl fmt::Display for Hostname {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Hostname::Domain(d) => write!(f, "{}", d),
            Hostname::Literal(l) => write!(f, "{}", l),
        }
    }
}

impl Hostname {
    /// Domain validity per spec.md §4.3: labels 1-63 octets, whole name
    /// <=255 octets, letters/digits/hyphen only, no leading/trailing
    /// hyphen, at least one dot unless `allow_single_label` admits a
    /// configured toplevel exception. Comparisons elsewhere are
    /// case-insensitive.
    pub fn is_valid_domain(s: &str, allow_single_label: bool) -> bool {
        if s.is_empty() || s.len() > 255 {
            return false;
        }
        let labels: Vec<&str> = s.split('.').collect();
        if labels.len() < 2 && !allow_single_label {
            return false;
        }
        labels.iter().all(|label| {
            let len_ok = !label.is_empty() && label.len() <= 63;
            let chars_ok = label
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-');
            let hyphen_ok = !label.starts_with('-') && !label.ends_with('-');
            len_ok && chars_ok && hyphen_ok
        })
    }

    pub fn eq_ignore_case(&self, other: &Hostname) -> bool {
        match (self, other) {
            (Hostname::Domain(a), Hostname::Domain(b)) => a.eq_ignore_ascii_case(b),
            (Hostname::Literal(a), Hostname::Literal(b)) => a == b,
            _ => false,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Localpart(pub String);

impl fmt::Display for Localpart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Email {
    pub localpart: Localpart,
    pub domain: Hostname,
}

impl fmt::Display for Email {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.localpart, self.domain)
    }
}

/// A parsed `MAIL FROM`/`RCPT TO` path: `None` email means the MAIL FROM
/// null sender `<>`; `source_route` holds any `@a,@b:` hosts that were
/// stripped per RFC 5321 §4.1.1.3 (kept for logging, not for routing).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Path {
    pub source_route: Vec<Hostname>,
    pub email: Option<Email>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Classification {
    EmptyNullSender,
    Local,
    Remote,
    AddressLiteral,
    SourceRouted,
}

fn is_atext(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-/=?^_`{|}~".contains(&b)
}

fn dot_string(input: &[u8]) -> IResult<&[u8], &[u8]> {
    recognize(separated_list1(char('.'), take_while1(is_atext)))(input)
}

fn quoted_string(input: &[u8]) -> IResult<&[u8], &[u8]> {
    recognize(delimited(
        char('"'),
        take_while(|b: u8| b != b'"' && b != b'\\' && b != b'\r' && b != b'\n'),
        char('"'),
    ))(input)
}

fn localpart(input: &[u8]) -> IResult<&[u8], &[u8]> {
    alt((quoted_string, dot_string))(input)
}

fn label(input: &[u8]) -> IResult<&[u8], &[u8]> {
    take_while1(|b: u8| b.is_ascii_alphanumeric() || b == b'-')(input)
}

fn domain_name(input: &[u8]) -> IResult<&[u8], &[u8]> {
    recognize(separated_list1(char('.'), label))(input)
}

fn ipv4_literal(input: &[u8]) -> IResult<&[u8], AddressLiteral> {
    let (rest, raw) = delimited(
        char('['),
        take_while1(|b: u8| b.is_ascii_digit() || b == b'.'),
        char(']'),
    )(input)?;
    let s = std::str::from_utf8(raw).map_err(|_| {
        nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Verify))
    })?;
    let ip: Ipv4Addr = s
        .parse()
        .map_err(|_| nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Verify)))?;
    Ok((rest, AddressLiteral::V4(ip)))
}

fn ipv6_literal(input: &[u8]) -> IResult<&[u8], AddressLiteral> {
    let (rest, raw) = delimited(
        tag("[IPv6:"),
        take_while1(|b: u8| b != b']'),
        char(']'),
    )(input)?;
    let s = std::str::from_utf8(raw).map_err(|_| {
        nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Verify))
    })?;
    let ip: Ipv6Addr = s
        .parse()
        .map_err(|_| nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Verify)))?;
    Ok((rest, AddressLiteral::V6(ip)))
}

fn hostname(input: &[u8]) -> IResult<&[u8], Hostname> {
    alt((
        map(alt((ipv6_literal, ipv4_literal)), Hostname::Literal),
        map(domain_name, |d| {
            Hostname::Domain(String::from_utf8_lossy(d).into_owned())
        }),
    ))(input)
}

fn at_domain(input: &[u8]) -> IResult<&[u8], Hostname> {
    preceded(char('@'), hostname)(input)
}

fn source_route(input: &[u8]) -> IResult<&[u8], Vec<Hostname>> {
    map(
        pair(separated_list1(char(','), at_domain), char(':')),
        |(hosts, _)| hosts,
    )(input)
}

fn mailbox(input: &[u8]) -> IResult<&[u8], Email> {
    map(
        separated_pair(localpart, char('@'), hostname),
        |(local, domain)| Email {
            localpart: Localpart(String::from_utf8_lossy(local).into_owned()),
            domain,
        },
    )(input)
}

fn path_contents(input: &[u8]) -> IResult<&[u8], (Vec<Hostname>, Email)> {
    pair(
        map(opt(source_route), |r| r.unwrap_or_default()),
        mailbox,
    )(input)
}

/// Skips the stray spaces a buggy client may put between `:` and `<`
/// (spec.md glossary: "space bug"). Returns whether any were skipped.
pub fn skip_space_bug(input: &[u8]) -> (&[u8], bool) {
    let trimmed = input.trim_ascii_start_compat();
    (trimmed, trimmed.len() != input.len())
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

/// Parses a MAIL FROM / RCPT TO path argument (the bytes between, and
/// including, the angle brackets, with leading space-bug tolerance already
/// handled by the caller via [`skip_space_bug`]), returning the remaining
/// tail (ESMTP parameters) alongside the parsed path and its
/// classification.
///
/// `is_local` decides the `Local`/`Remote` split for a plain (non-literal,
/// non-null-sender) mailbox; it is typically backed by the `rcpthosts`
/// table (C4).
pub fn addrsyntax<'a>(
    input: &'a [u8],
    mode: AddrMode,
    is_local: impl Fn(&Hostname) -> bool,
) -> Result<(Path, Classification, &'a [u8]), ParseError> {
    let bail = || ParseError::Syntax(String::from_utf8_lossy(input).into_owned());

    let (rest, inner) = delimited(
        char::<&[u8], nom::error::Error<&[u8]>>('<'),
        take_while(|b: u8| b != b'>'),
        char('>'),
    )(input)
    .map_err(|_| bail())?;

    if inner.is_empty() {
        if mode == AddrMode::MailFrom {
            return Ok((
                Path {
                    source_route: Vec::new(),
                    email: None,
                },
                Classification::EmptyNullSender,
                rest,
            ));
        } else {
            return Err(bail());
        }
    }

    let parsed = if mode == AddrMode::RcptTo {
        alt((
            map(path_contents, |(route, email)| (route, email)),
            map(mailbox, |email| (Vec::new(), email)),
        ))(inner)
    } else {
        map(mailbox, |email| (Vec::new(), email))(inner)
    };
    let (remaining, (source_route, email)) = parsed.map_err(|_| bail())?;
    if !remaining.is_empty() {
        return Err(bail());
    }

    let classification = if !source_route.is_empty() {
        Classification::SourceRouted
    } else if matches!(email.domain, Hostname::Literal(_)) {
        Classification::AddressLiteral
    } else if is_local(&email.domain) {
        Classification::Local
    } else {
        Classification::Remote
    };

    Ok((
        Path {
            source_route,
            email: Some(email),
        },
        classification,
        rest,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn always_remote(_: &Hostname) -> bool {
        false
    }

    #[test]
    fn null_sender_only_in_mail_from() {
        let (path, class, tail) = addrsyntax(b"<>", AddrMode::MailFrom, always_remote).unwrap();
        assert_eq!(class, Classification::EmptyNullSender);
        assert!(path.email.is_none());
        assert!(tail.is_empty());

        assert!(addrsyntax(b"<>", AddrMode::RcptTo, always_remote).is_err());
    }

    #[test]
    fn plain_mailbox_roundtrips() {
        let (path, class, _) =
            addrsyntax(b"<user@example.org>", AddrMode::RcptTo, always_remote).unwrap();
        assert_eq!(class, Classification::Remote);
        let email = path.email.unwrap();
        assert_eq!(email.to_string(), "user@example.org");
    }

    #[test]
    fn local_classification() {
        let (_, class, _) = addrsyntax(b"<user@l>", AddrMode::RcptTo, |h| {
            matches!(h, Hostname::Domain(d) if d == "l")
        })
        .unwrap();
        assert_eq!(class, Classification::Local);
    }

    #[test]
    fn address_literal() {
        let (path, class, _) =
            addrsyntax(b"<user@[192.0.2.1]>", AddrMode::RcptTo, always_remote).unwrap();
        assert_eq!(class, Classification::AddressLiteral);
        assert_eq!(
            path.email.unwrap().domain,
            Hostname::Literal(AddressLiteral::V4("192.0.2.1".parse().unwrap()))
        );
    }

    #[test]
    fn source_route_is_stripped_but_recorded() {
        let (path, class, _) = addrsyntax(
            b"<@a.example,@b.example:user@c.example>",
            AddrMode::RcptTo,
            always_remote,
        )
        .unwrap();
        assert_eq!(class, Classification::SourceRouted);
        assert_eq!(path.source_route.len(), 2);
        assert_eq!(path.email.unwrap().to_string(), "user@c.example");
    }

    #[test]
    fn domain_validity_rules() {
        assert!(Hostname::is_valid_domain("example.org", false));
        assert!(!Hostname::is_valid_domain("example", false));
        assert!(Hostname::is_valid_domain("example", true));
        assert!(!Hostname::is_valid_domain("-bad.example", false));
        assert!(!Hostname::is_valid_domain("bad-.example", false));
        assert!(!Hostname::is_valid_domain("", false));
    }

    #[test]
    fn space_bug_is_detected() {
        let (rest, bugged) = skip_space_bug(b"   <user@example.org>");
        assert!(bugged);
        assert_eq!(rest, b"<user@example.org>");
        let (_, not_bugged) = skip_space_bug(b"<user@example.org>");
        assert!(!not_bugged);
    }
}
