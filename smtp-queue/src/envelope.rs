//! Envelope record format written to the queue child's fd 1 (spec.md
//! §4.8): `"F" + sender + NUL`, then one `"T" + recipient + NUL` per
//! accepted recipient, then a final empty NUL record.

use std::io::{self, Write};

use smtp_message::{Email, Hostname};

/// Renders one recipient the way the envelope wants it: address-literal
/// recipients are rewritten to `local@<liphost>` (spec.md §4.8) so the
/// queue binary never has to parse bracketed literals itself.
fn envelope_recipient(email: &Email) -> String {
    match &email.domain {
        Hostname::Literal(lit) => format!("{}@{}", email.localpart, lit_host(lit)),
        Hostname::Domain(_) => email.to_string(),
    }
}

fn lit_host(lit: &smtp_message::AddressLiteral) -> String {
    match lit {
        smtp_message::AddressLiteral::V4(ip) => ip.to_string(),
        smtp_message::AddressLiteral::V6(ip) => ip.to_string(),
    }
}

/// Writes the full envelope to `w` (the parent's write end of the header
/// pipe). `sender` is `None` for the null sender (`MAIL FROM:<>`).
pub fn write_envelope<W: Write>(
    w: &mut W,
    sender: Option<&Email>,
    recipients: &[Email],
) -> io::Result<()> {
    w.write_all(b"F")?;
    if let Some(sender) = sender {
        w.write_all(sender.to_string().as_bytes())?;
    }
    w.write_all(b"\0")?;

    for rcpt in recipients {
        w.write_all(b"T")?;
        w.write_all(envelope_recipient(rcpt).as_bytes())?;
        w.write_all(b"\0")?;
    }

    w.write_all(b"\0")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use smtp_message::Localpart;

    fn email(local: &str, domain: &str) -> Email {
        Email {
            localpart: Localpart(local.to_string()),
            domain: Hostname::Domain(domain.to_string()),
        }
    }

    #[test]
    fn envelope_with_sender_and_recipients() {
        let mut buf = Vec::new();
        let sender = email("a", "b");
        let rcpts = vec![email("u", "local.example")];
        write_envelope(&mut buf, Some(&sender), &rcpts).unwrap();
        assert_eq!(buf, b"Fa@b\0Tu@local.example\0\0");
    }

    #[test]
    fn null_sender_envelope() {
        let mut buf = Vec::new();
        write_envelope(&mut buf, None, &[]).unwrap();
        assert_eq!(buf, b"F\0\0");
    }

    #[test]
    fn address_literal_recipient_is_rewritten() {
        let rcpt = Email {
            localpart: Localpart("u".into()),
            domain: Hostname::Literal(smtp_message::AddressLiteral::V4(
                "192.0.2.1".parse().unwrap(),
            )),
        };
        let mut buf = Vec::new();
        write_envelope(&mut buf, None, &[rcpt]).unwrap();
        assert_eq!(buf, b"F\0Tu@192.0.2.1\0\0");
    }
}
