//! C11 — body scanner/recoder: classifies a message body as needing 7-bit
//! recoding for a downstream hop that didn't announce 8BITMIME, and folds
//! MIME multipart boundaries so recoding a single part never corrupts the
//! boundary delimiters of another.
//!
//! Grounded on `original_source/qremote/mime.c`'s `skipwhitespace`/
//! `mime_token`/`mime_param`/`is_multipart`/`find_boundary`, rewritten as
//! byte-slice-scanning functions in the style of `smtp-message/src/data.rs`'s
//! line-oriented state machines rather than the original's pointer/length
//! pairs.

const MAX_BOUNDARY_LEN: usize = 70;

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub enum MimeError {
    #[error("boundary definition is empty")]
    EmptyBoundary,
    #[error("boundary definition is too long")]
    BoundaryTooLong,
    #[error("quoted boundary definition may not end in space")]
    BoundaryTrailingSpace,
    #[error("boundary definition contains an invalid character")]
    InvalidBoundaryChar,
    #[error("syntax error in Content-Type header")]
    Syntax,
}

fn is_tspecial(b: u8) -> bool {
    b"()<>@,;:\\\"/[]?=".contains(&b)
}

fn is_wspace(b: u8) -> bool {
    b == b' ' || b == b'\t'
}

/// Skips whitespace, folded-line breaks (CR/LF immediately followed by
/// whitespace), and parenthesized RFC 822 comments, mirroring
/// `skipwhitespace` in `mime.c`. Returns `None` on an unterminated
/// comment.
fn skip_whitespace(input: &[u8]) -> Option<usize> {
    let mut i = 0;
    while i < input.len() {
        let start = i;
        while i < input.len() && is_wspace(input[i]) {
            i += 1;
        }
        if i != start {
            continue;
        }
        if input[i] == b'\r' {
            i += 1;
            if i < input.len() && input[i] == b'\n' {
                i += 1;
            }
            continue;
        }
        if input[i] == b'\n' {
            i += 1;
            continue;
        }
        if input[i] != b'(' {
            return Some(i);
        }
        let mut depth = 1i32;
        i += 1;
        while depth > 0 {
            if i >= input.len() {
                return None;
            }
            match input[i] {
                b'(' if input[i - 1] != b'\\' => depth += 1,
                b')' if input[i - 1] != b'\\' => depth -= 1,
                _ => {}
            }
            i += 1;
        }
    }
    Some(i)
}

/// Length of one RFC 2045 §5.1 token starting at `input[0]`, or `0` on a
/// syntax error (mirrors `mime_token`).
fn token_len(input: &[u8]) -> usize {
    for (i, &b) in input.iter().enumerate() {
        if b == b';' || b == b'=' {
            return i;
        }
        if is_wspace(b) || b == b'\r' || b == b'\n' {
            return match skip_whitespace(&input[i..]) {
                Some(rest) if i + rest == input.len() => i,
                _ => 0,
            };
        }
        if b <= 32 || is_tspecial(b) {
            return 0;
        }
    }
    input.len()
}

/// One `token=value` or `token="quoted value"` MIME parameter, with its
/// total consumed length.
struct Param<'a> {
    name_len: usize,
    value: &'a [u8],
    quoted: bool,
    consumed: usize,
}

fn parse_param(input: &[u8]) -> Option<Param<'_>> {
    let name_len = token_len(input);
    if name_len == 0 || name_len == input.len() || input[name_len] != b'=' {
        return None;
    }
    let value_start = name_len + 1;
    if input.get(value_start) == Some(&b'"') {
        let mut i = value_start + 1;
        loop {
            if i >= input.len() {
                return None;
            }
            if input[i] == b'"' && input[i - 1] != b'\\' {
                break;
            }
            i += 1;
        }
        let value = &input[value_start + 1..i];
        let end = i + 1;
        Some(Param {
            name_len,
            value,
            quoted: true,
            consumed: end,
        })
    } else {
        let rest = &input[value_start..];
        let len = token_len(rest);
        if len == 0 {
            return None;
        }
        Some(Param {
            name_len,
            value: &rest[..len],
            quoted: false,
            consumed: value_start + len,
        })
    }
}

fn validate_boundary(value: &[u8], quoted: bool) -> Result<(), MimeError> {
    if value.is_empty() {
        return Err(MimeError::EmptyBoundary);
    }
    if value.len() > MAX_BOUNDARY_LEN {
        return Err(MimeError::BoundaryTooLong);
    }
    if quoted && value.last() == Some(&b' ') {
        return Err(MimeError::BoundaryTrailingSpace);
    }
    for &b in value {
        let ok = b.is_ascii_alphabetic()
            || (quoted && b == b' ')
            || (b'+'..=b':').contains(&b)
            || matches!(b, b'\'' | b'(' | b')' | b'_' | b'=' | b'?');
        if !ok {
            return Err(MimeError::InvalidBoundaryChar);
        }
    }
    Ok(())
}

/// Scans a (possibly folded) `Content-Type` header *value* (the bytes
/// after the `Content-Type:` field name) and, if it declares a
/// `multipart/*` type, returns its boundary delimiter. `Ok(None)` means
/// the header is some other, well-formed content type.
pub fn parse_multipart_boundary(value: &[u8]) -> Result<Option<Vec<u8>>, MimeError> {
    let start = skip_whitespace(value).ok_or(MimeError::Syntax)?;
    if start == value.len() {
        return Err(MimeError::Syntax);
    }
    let rest = &value[start..];
    if rest.len() < 10 || !rest[..10].eq_ignore_ascii_case(b"multipart/") {
        return Ok(None);
    }

    let mut cursor = 10;
    let type_len = token_len(&rest[cursor..]);
    if type_len == 0 || rest.get(cursor + type_len) == Some(&b'=') {
        return Err(MimeError::Syntax);
    }
    cursor += type_len;
    if rest.get(cursor) != Some(&b';') {
        return Err(MimeError::Syntax);
    }
    cursor += 1;

    loop {
        let ws = skip_whitespace(&rest[cursor..]).ok_or(MimeError::Syntax)?;
        cursor += ws;
        if cursor >= rest.len() {
            return Err(MimeError::Syntax);
        }
        let param = parse_param(&rest[cursor..]).ok_or(MimeError::Syntax)?;
        let is_boundary = param.name_len >= 9
            && rest[cursor..cursor + 9].eq_ignore_ascii_case(b"boundary=");
        if is_boundary {
            validate_boundary(param.value, param.quoted)?;
            return Ok(Some(param.value.to_vec()));
        }
        cursor += param.consumed;
        if cursor < rest.len() && rest[cursor] == b';' {
            cursor += 1;
        } else if cursor >= rest.len() {
            return Err(MimeError::Syntax);
        }
    }
}

/// Finds the next boundary delimiter line (`CRLF "--" boundary`, possibly
/// followed by the final `--`) in `buf`. Mirrors `find_boundary`: returns
/// the offset just past the matched delimiter, or `None` if no boundary
/// occurs in `buf`.
pub fn find_boundary(buf: &[u8], boundary: &[u8]) -> Option<usize> {
    if buf.len() < boundary.len() + 3 {
        return None;
    }
    let mut pos = 0;
    while pos + 3 + boundary.len() <= buf.len() {
        if matches!(buf[pos], b'\r' | b'\n')
            && buf[pos + 1] == b'-'
            && buf[pos + 2] == b'-'
            && &buf[pos + 3..pos + 3 + boundary.len()] == boundary
        {
            let mut end = pos + 3 + boundary.len();
            if end == buf.len() || is_wspace(buf[end]) || buf[end] == b'\r' || buf[end] == b'\n' {
                return Some(end);
            }
            if end + 1 < buf.len() && buf[end] == b'-' && buf[end + 1] == b'-' {
                end += 2;
                if end == buf.len() || is_wspace(buf[end]) {
                    return Some(end);
                }
            }
        }
        pos += 1;
    }
    None
}

/// Whether a body needs 7-bit recoding before being sent to a peer whose
/// EHLO didn't announce 8BITMIME: true iff any byte is outside the 7-bit
/// ASCII range (spec.md §4.11).
pub fn needs_7bit_recode(body: &[u8]) -> bool {
    body.iter().any(|&b| b >= 0x80)
}

/// Recodes one non-multipart body part to quoted-printable, the
/// transfer encoding this system always chooses for 8-bit content being
/// forced down a 7-bit-only hop (spec.md §4.11: recoding policy doesn't
/// distinguish base64 vs. quoted-printable for the re-encode case, and
/// quoted-printable keeps plain-text parts close to readable, unlike
/// base64).
pub fn recode_quoted_printable(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + body.len() / 4);
    let mut line_len = 0;
    for &b in body {
        let needs_escape = b == b'=' || b >= 0x80 || (b < 0x20 && b != b'\t') || b == 0x7f;
        if needs_escape {
            if line_len > 73 {
                out.extend_from_slice(b"=\r\n");
                line_len = 0;
            }
            out.extend_from_slice(format!("={:02X}", b).as_bytes());
            line_len += 3;
        } else if b == b'\n' {
            out.push(b'\n');
            line_len = 0;
        } else if b == b'\r' {
            out.push(b'\r');
        } else {
            if line_len > 75 {
                out.extend_from_slice(b"=\r\n");
                line_len = 0;
            }
            out.push(b);
            line_len += 1;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_content_type_has_no_boundary() {
        assert_eq!(
            parse_multipart_boundary(b" text/plain; charset=us-ascii").unwrap(),
            None
        );
    }

    #[test]
    fn multipart_with_quoted_boundary() {
        let boundary =
            parse_multipart_boundary(b" multipart/mixed; boundary=\"abc123\"").unwrap();
        assert_eq!(boundary, Some(b"abc123".to_vec()));
    }

    #[test]
    fn multipart_with_bare_boundary_and_trailing_params() {
        let boundary =
            parse_multipart_boundary(b" multipart/mixed; charset=us-ascii; boundary=xyz")
                .unwrap();
        assert_eq!(boundary, Some(b"xyz".to_vec()));
    }

    #[test]
    fn empty_boundary_is_rejected() {
        let err = parse_multipart_boundary(b" multipart/mixed; boundary=\"\"").unwrap_err();
        assert_eq!(err, MimeError::EmptyBoundary);
    }

    #[test]
    fn invalid_boundary_character_is_rejected() {
        let err = parse_multipart_boundary(b" multipart/mixed; boundary=ab$cd").unwrap_err();
        assert_eq!(err, MimeError::InvalidBoundaryChar);
    }

    #[test]
    fn find_boundary_locates_delimiter_line() {
        let buf = b"preamble\r\n--abc123\r\npart body";
        let pos = find_boundary(buf, b"abc123").unwrap();
        assert_eq!(&buf[pos..], b"\r\npart body");
    }

    #[test]
    fn find_boundary_recognizes_final_delimiter() {
        let buf = b"body\r\n--abc123--\r\n";
        let pos = find_boundary(buf, b"abc123").unwrap();
        assert_eq!(&buf[pos..], b"\r\n");
    }

    #[test]
    fn needs_7bit_recode_detects_high_bit() {
        assert!(!needs_7bit_recode(b"plain ascii"));
        assert!(needs_7bit_recode(b"caf\xe9"));
    }

    #[test]
    fn quoted_printable_escapes_high_bytes() {
        let out = recode_quoted_printable(b"caf\xe9");
        assert_eq!(out, b"caf=E9");
    }
}
