//! C10 — the per-MX SMTP client delivery loop: connect, read the greeting,
//! negotiate EHLO extensions, optionally STARTTLS (with DANE verification
//! when TLSA records exist), pipeline the envelope, and send the body via
//! `BDAT` when the peer announced `CHUNKING`, or plain `DATA` otherwise.
//!
//! Grounded on this crate's own `read_reply`/`send_command`/`verify_reply`
//! (kept close to verbatim) plus `connect_to_mx`'s connection-attempt
//! structure, generalized with the MX failover loop spec.md §4.10
//! describes and the DANE verification step of §4.10 step 5.

use std::time::Duration;

use futures::{AsyncWriteExt, FutureExt};
use smol::net::TcpStream;
use smol::Timer;

use smtp_message::{BodyType, CrlfLineReader, DotStuffWriter, Email, MailParams, Reply, ReplyCodeKind};
use smtp_queue_types::{RecipientStatusCode, SummaryStatusCode};
use smtp_resolve::Resolver;

use crate::mx::{IpEntry, IpList};
use crate::{Config, DynAsyncReadWrite, Extensions, TransportError, TransportErrorSeverity};

#[derive(Clone, Debug)]
pub struct RecipientOutcome {
    pub recipient: Email,
    pub status: RecipientStatusCode,
    pub detail: String,
}

#[derive(Clone, Debug)]
pub struct DeliveryReport {
    pub summary: SummaryStatusCode,
    pub recipients: Vec<RecipientOutcome>,
    pub remote: Option<String>,
}

async fn read_reply(
    stream: &mut CrlfLineReader<DynAsyncReadWrite>,
    timeout: Duration,
) -> Result<Reply, TransportError> {
    let mut lines = Vec::new();
    loop {
        let line = futures::select! {
            res = stream.read_line().fuse() => res.map_err(|_| TransportError::ReceivingReplyBytes)?,
            _ = Timer::after(timeout).fuse() => return Err(TransportError::TimedOutWaitingForReply),
        };
        let bytes = line.as_bytes();
        if bytes.len() < 4 {
            return Err(TransportError::SyntaxError);
        }
        let code: u16 = std::str::from_utf8(&bytes[0..3])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(TransportError::SyntaxError)?;
        let sep = bytes[3];
        let text = String::from_utf8_lossy(&bytes[4..]).into_owned();
        lines.push(text);
        if sep == b' ' {
            return Ok(Reply::new(
                smtp_message::ReplyCode::custom(code),
                None,
                lines.join(" "),
            ));
        } else if sep != b'-' {
            return Err(TransportError::SyntaxError);
        }
    }
}

async fn send_command(
    stream: &mut CrlfLineReader<DynAsyncReadWrite>,
    line: &[u8],
    timeout: Duration,
) -> Result<(), TransportError> {
    let write = async {
        let io = stream.get_mut();
        io.write_all(line).await?;
        io.write_all(b"\r\n").await?;
        io.flush().await
    };
    futures::select! {
        res = write.fuse() => res.map_err(TransportError::SendingCommand),
        _ = Timer::after(timeout).fuse() => Err(TransportError::TimedOutSendingCommand),
    }
}

fn verify_reply(reply: &Reply) -> Result<(), TransportError> {
    if !reply.is_positive() {
        return Err(TransportError::UnexpectedReplyCode(reply.clone()));
    }
    Ok(())
}

/// One established, EHLO'd connection to a candidate MX address.
pub struct Connection {
    stream: CrlfLineReader<DynAsyncReadWrite>,
    pub extensions: Extensions,
    pub remote_greeting: String,
}

fn box_stream(stream: TcpStream) -> DynAsyncReadWrite {
    let (read_half, write_half) = futures::AsyncReadExt::split(stream);
    duplexify::Duplex::new(
        Box::pin(read_half) as std::pin::Pin<Box<dyn Send + futures::AsyncRead>>,
        Box::pin(write_half) as std::pin::Pin<Box<dyn Send + futures::AsyncWrite>>,
    )
}

/// Connects to `entry`'s address on port 25, reads the greeting, sends
/// `EHLO`, and — unless the peer lacks `STARTTLS`, DANE/PKIX verification
/// fails, or `can_do_tls()` says no — upgrades the connection in place via
/// [`CrlfLineReader::upgrade`] (spec.md §4.10 steps 1-5; the
/// discard-buffered-bytes-on-upgrade behavior is C1's STARTTLS-splice
/// guarantee, shared with the server side).
pub async fn connect_and_greet<Cfg: Config>(
    entry: &IpEntry,
    cfg: &Cfg,
    resolver: &Resolver,
) -> Result<Connection, TransportError> {
    let tcp = TcpStream::connect((entry.address, 25))
        .await
        .map_err(|e| TransportError::Connecting(entry.address, 25, e))?;
    let mut stream = CrlfLineReader::new(box_stream(tcp));

    let greeting = read_reply(&mut stream, Duration::from_secs(300)).await?;
    verify_reply(&greeting)?;

    let hostname = cfg.ehlo_hostname();
    send_command(
        &mut stream,
        format!("EHLO {}", hostname).as_bytes(),
        Duration::from_secs(300),
    )
    .await?;
    let ehlo_reply = read_reply(&mut stream, Duration::from_secs(300)).await?;
    verify_reply(&ehlo_reply)?;
    let mut extensions = parse_extensions(&ehlo_reply);

    // TLSA is looked up for any named entry regardless of whether the peer
    // offered STARTTLS: a DANE-published MX that doesn't offer STARTTLS
    // must be abandoned rather than delivered to in cleartext (spec.md
    // §4.10 step 5, seed scenario §8.6).
    let tlsa = match &entry.name {
        Some(name) => resolver.tlsa(name, 25).await.unwrap_or_default(),
        None => Vec::new(),
    };

    match decide_starttls(
        extensions.contains(Extensions::STARTTLS),
        !tlsa.is_empty(),
        cfg.can_do_tls(),
        cfg.must_do_tls(),
    ) {
        StartTlsDecision::Plaintext => {}
        StartTlsDecision::AbandonDane => {
            tracing::warn!(mx = ?entry.name, "TLSA records exist but MX offers no STARTTLS, abandoning candidate");
            return Err(TransportError::DaneWithoutStartTls);
        }
        StartTlsDecision::AbandonPolicy => return Err(TransportError::CannotDoTls),
        StartTlsDecision::Upgrade => {
            send_command(&mut stream, b"STARTTLS", Duration::from_secs(120)).await?;
            let tls_reply = read_reply(&mut stream, Duration::from_secs(120)).await?;
            if tls_reply.is_positive() {
                let plain = stream.into_inner();
                match cfg.tls_connect(plain, &tlsa).await {
                    Ok(upgraded) => {
                        stream = CrlfLineReader::new(upgraded);
                        send_command(
                            &mut stream,
                            format!("EHLO {}", hostname).as_bytes(),
                            Duration::from_secs(300),
                        )
                        .await?;
                        let reehlo = read_reply(&mut stream, Duration::from_secs(300)).await?;
                        verify_reply(&reehlo)?;
                        extensions = parse_extensions(&reehlo);
                    }
                    Err(_) => {
                        // TLS negotiation failed: the plaintext stream was
                        // already consumed by `tls_connect`, so there is
                        // nothing usable left to fall back to for this
                        // candidate.
                        return Err(TransportError::CannotDoTls);
                    }
                }
            } else if cfg.must_do_tls() {
                return Err(TransportError::CannotDoTls);
            }
        }
    }

    Ok(Connection {
        stream,
        extensions,
        remote_greeting: greeting.to_string(),
    })
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum StartTlsDecision {
    /// Proceed without TLS.
    Plaintext,
    /// STARTTLS was offered and is permitted: negotiate it.
    Upgrade,
    /// No STARTTLS but TLSA records are published for this MX: abandon it
    /// rather than deliver in cleartext (spec.md §4.10 step 5, seed
    /// scenario §8.6).
    AbandonDane,
    /// TLS is required by policy but unavailable on this connection.
    AbandonPolicy,
}

fn decide_starttls(
    starttls_offered: bool,
    tlsa_present: bool,
    can_do_tls: bool,
    must_do_tls: bool,
) -> StartTlsDecision {
    if !starttls_offered {
        return if tlsa_present {
            StartTlsDecision::AbandonDane
        } else if must_do_tls {
            StartTlsDecision::AbandonPolicy
        } else {
            StartTlsDecision::Plaintext
        };
    }
    if can_do_tls {
        StartTlsDecision::Upgrade
    } else if must_do_tls {
        StartTlsDecision::AbandonPolicy
    } else {
        StartTlsDecision::Plaintext
    }
}

fn parse_extensions(ehlo: &Reply) -> Extensions {
    let mut ext = Extensions::empty();
    for line in &ehlo.text {
        let upper = line.to_ascii_uppercase();
        if upper.starts_with("STARTTLS") {
            ext |= Extensions::STARTTLS;
        } else if upper.starts_with("PIPELINING") {
            ext |= Extensions::PIPELINING;
        } else if upper.starts_with("SIZE") {
            ext |= Extensions::SIZE;
        } else if upper.starts_with("8BITMIME") {
            ext |= Extensions::EIGHTBITMIME;
        } else if upper.starts_with("CHUNKING") {
            ext |= Extensions::CHUNKING;
        } else if upper.starts_with("DSN") {
            ext |= Extensions::DSN;
        }
    }
    ext
}

/// Sends one message over an already-negotiated connection: pipelined
/// `MAIL FROM`/`RCPT TO*`, then the body via `BDAT` (when `CHUNKING` was
/// announced) or `DATA`, recoding the body first if the peer didn't
/// announce `8BITMIME` and the body isn't 7-bit clean (spec.md §4.11).
pub async fn send_message(
    conn: &mut Connection,
    sender: Option<&Email>,
    recipients: &[Email],
    body: &[u8],
) -> Result<Vec<RecipientOutcome>, TransportError> {
    let eightbit = conn.extensions.contains(Extensions::EIGHTBITMIME);
    let body = if !eightbit && crate::mime::needs_7bit_recode(body) {
        crate::mime::recode_quoted_printable(body)
    } else {
        body.to_vec()
    };

    let mail_params = MailParams {
        size: Some(body.len() as u64),
        body: Some(if eightbit {
            BodyType::EightBitMime
        } else {
            BodyType::SevenBit
        }),
        auth: None,
    };

    let mail_line = format!(
        "MAIL FROM:<{}> SIZE={}{}",
        sender.map(|e| e.to_string()).unwrap_or_default(),
        mail_params.size.unwrap_or(0),
        if mail_params.body == Some(BodyType::EightBitMime) {
            " BODY=8BITMIME"
        } else {
            ""
        },
    );

    let pipelining = conn.extensions.contains(Extensions::PIPELINING);

    send_command(&mut conn.stream, mail_line.as_bytes(), Duration::from_secs(300)).await?;
    if !pipelining {
        let reply = read_reply(&mut conn.stream, Duration::from_secs(300)).await?;
        verify_reply(&reply)?;
    }

    // spec.md §4.10 step 7: the pipelined batch covers MAIL FROM, RCPT TO,
    // and the first 4 recipients only; any remaining recipients are sent
    // (and their replies read) serially afterwards.
    const PIPELINED_RCPT_LIMIT: usize = 4;
    let pipelined_count = if pipelining {
        recipients.len().min(PIPELINED_RCPT_LIMIT)
    } else {
        0
    };

    let mut outcomes = Vec::with_capacity(recipients.len());
    if pipelining {
        for rcpt in &recipients[..pipelined_count] {
            send_command(
                &mut conn.stream,
                format!("RCPT TO:<{}>", rcpt).as_bytes(),
                Duration::from_secs(300),
            )
            .await?;
        }
        let mail_reply = read_reply(&mut conn.stream, Duration::from_secs(300)).await?;
        verify_reply(&mail_reply)?;
        for rcpt in &recipients[..pipelined_count] {
            let reply = read_reply(&mut conn.stream, Duration::from_secs(300)).await?;
            outcomes.push(classify_rcpt(rcpt.clone(), &reply));
        }
    }
    for rcpt in &recipients[pipelined_count..] {
        send_command(
            &mut conn.stream,
            format!("RCPT TO:<{}>", rcpt).as_bytes(),
            Duration::from_secs(300),
        )
        .await?;
        let reply = read_reply(&mut conn.stream, Duration::from_secs(300)).await?;
        outcomes.push(classify_rcpt(rcpt.clone(), &reply));
    }

    if outcomes.iter().all(|o| o.status != RecipientStatusCode::Accepted) {
        // Nothing accepted: spec.md §4.10 "an empty accepted-recipient set
        // never opens a transfer" -- reset instead of sending DATA/BDAT.
        send_command(&mut conn.stream, b"RSET", Duration::from_secs(300)).await?;
        read_reply(&mut conn.stream, Duration::from_secs(300)).await.ok();
        return Ok(outcomes);
    }

    if conn.extensions.contains(Extensions::CHUNKING) {
        send_bdat(conn, &body).await?;
    } else {
        send_data(conn, &body).await?;
    }

    let end_reply = read_reply(&mut conn.stream, Duration::from_secs(600)).await?;
    let transfer_ok = end_reply.is_positive();
    for outcome in outcomes.iter_mut() {
        if outcome.status == RecipientStatusCode::Accepted && !transfer_ok {
            outcome.status = classify_status(&end_reply);
            outcome.detail = end_reply.to_string();
        }
    }

    Ok(outcomes)
}

fn classify_rcpt(recipient: Email, reply: &Reply) -> RecipientOutcome {
    RecipientOutcome {
        status: classify_status(reply),
        detail: reply.to_string(),
        recipient,
    }
}

fn classify_status(reply: &Reply) -> RecipientStatusCode {
    match reply.code.kind() {
        ReplyCodeKind::PositiveCompletion | ReplyCodeKind::PositiveIntermediate => {
            RecipientStatusCode::Accepted
        }
        ReplyCodeKind::TransientNegative => RecipientStatusCode::TempFailed,
        ReplyCodeKind::PermanentNegative => RecipientStatusCode::PermFailed,
    }
}

async fn send_data(conn: &mut Connection, body: &[u8]) -> Result<(), TransportError> {
    send_command(&mut conn.stream, b"DATA", Duration::from_secs(120)).await?;
    let go = read_reply(&mut conn.stream, Duration::from_secs(120)).await?;
    verify_reply(&go)?;

    let mut stuffer = DotStuffWriter::new();
    let stuffed = stuffer.feed(body);
    let terminator = stuffer.finish();
    let io = conn.stream.get_mut();
    io.write_all(&stuffed).await.map_err(TransportError::SendingData)?;
    io.write_all(&terminator).await.map_err(TransportError::SendingData)?;
    io.flush().await.map_err(TransportError::SendingData)?;
    Ok(())
}

/// Body transfer via `BDAT`, RFC 3030: the whole body as one
/// `BDAT n LAST` chunk (spec.md §4.10's minimal-conforming chunking
/// strategy -- multi-chunk streaming is an optimization this system
/// doesn't need since the whole body is already buffered by the time
/// Qremote runs).
async fn send_bdat(conn: &mut Connection, body: &[u8]) -> Result<(), TransportError> {
    send_command(
        &mut conn.stream,
        format!("BDAT {} LAST", body.len()).as_bytes(),
        Duration::from_secs(300),
    )
    .await?;
    let io = conn.stream.get_mut();
    io.write_all(body).await.map_err(TransportError::SendingData)?;
    io.flush().await.map_err(TransportError::SendingData)?;
    Ok(())
}

/// Walks `list` lowest-priority-first, attempting delivery at each
/// candidate until one succeeds or the list is exhausted (spec.md §4.9
/// "Selection"/§4.10 "MX failover"). A connection-level failure marks the
/// entry `Used` and moves to the next; a per-recipient failure is final
/// for that recipient and is not retried against a different MX.
pub async fn deliver<Cfg: Config>(
    list: &mut IpList,
    cfg: &Cfg,
    resolver: &Resolver,
    sender: Option<&Email>,
    recipients: &[Email],
    body: &[u8],
) -> DeliveryReport {
    let mut last_error: Option<TransportError> = None;
    let mut remote = None;

    while let Some(idx) = list.select_next() {
        let entry = list.entries[idx].clone();
        match connect_and_greet(&entry, cfg, resolver).await {
            Ok(mut conn) => {
                remote = Some(entry.address.to_string());
                list.mark_used(idx);
                match send_message(&mut conn, sender, recipients, body).await {
                    Ok(outcomes) => {
                        let summary = if outcomes.iter().any(|o| o.status == RecipientStatusCode::Accepted) {
                            SummaryStatusCode::Success
                        } else {
                            SummaryStatusCode::ConnPermanent
                        };
                        return DeliveryReport {
                            summary,
                            recipients: outcomes,
                            remote,
                        };
                    }
                    Err(e) => last_error = Some(e),
                }
            }
            Err(e) => {
                list.mark_used(idx);
                last_error = Some(e);
            }
        }
    }

    let permanent = matches!(
        last_error.as_ref().map(|e| e.severity()),
        Some(TransportErrorSeverity::Permanent)
    );
    let summary = if permanent {
        SummaryStatusCode::ConnPermanent
    } else {
        SummaryStatusCode::ConnTemporary
    };
    let status = if permanent {
        RecipientStatusCode::PermFailed
    } else {
        RecipientStatusCode::TempFailed
    };
    DeliveryReport {
        summary,
        recipients: recipients
            .iter()
            .map(|r| RecipientOutcome {
                recipient: r.clone(),
                status,
                detail: last_error
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "no usable MX".into()),
            })
            .collect(),
        remote,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extensions_parse_from_ehlo_lines() {
        let reply = Reply {
            code: smtp_message::ReplyCode::OKAY,
            ecode: None,
            text: vec![
                "mx.example.org".into(),
                "PIPELINING".into(),
                "SIZE 1000000".into(),
                "STARTTLS".into(),
                "8BITMIME".into(),
                "CHUNKING".into(),
            ],
        };
        let ext = parse_extensions(&reply);
        assert!(ext.contains(Extensions::PIPELINING));
        assert!(ext.contains(Extensions::SIZE));
        assert!(ext.contains(Extensions::STARTTLS));
        assert!(ext.contains(Extensions::EIGHTBITMIME));
        assert!(ext.contains(Extensions::CHUNKING));
    }

    #[test]
    fn classify_status_matches_reply_kind() {
        let ok = Reply::new(smtp_message::ReplyCode::OKAY, None, "ok");
        assert_eq!(classify_status(&ok), RecipientStatusCode::Accepted);
        let temp = Reply::new(smtp_message::ReplyCode::LOCAL_ERROR, None, "try later");
        assert_eq!(classify_status(&temp), RecipientStatusCode::TempFailed);
        let perm = Reply::new(smtp_message::ReplyCode::MAILBOX_UNAVAILABLE, None, "no");
        assert_eq!(classify_status(&perm), RecipientStatusCode::PermFailed);
    }

    #[test]
    fn starttls_offered_and_allowed_upgrades() {
        assert_eq!(
            decide_starttls(true, false, true, false),
            StartTlsDecision::Upgrade
        );
    }

    #[test]
    fn dane_without_starttls_is_abandoned_even_without_must_do_tls() {
        assert_eq!(
            decide_starttls(false, true, true, false),
            StartTlsDecision::AbandonDane
        );
    }

    #[test]
    fn no_starttls_no_tlsa_falls_back_to_plaintext() {
        assert_eq!(
            decide_starttls(false, false, true, false),
            StartTlsDecision::Plaintext
        );
    }

    #[test]
    fn no_starttls_no_tlsa_but_must_do_tls_is_policy_abandon() {
        assert_eq!(
            decide_starttls(false, false, true, true),
            StartTlsDecision::AbandonPolicy
        );
    }

    #[test]
    fn starttls_offered_but_locally_disabled_falls_back_unless_mandatory() {
        assert_eq!(
            decide_starttls(true, false, false, false),
            StartTlsDecision::Plaintext
        );
        assert_eq!(
            decide_starttls(true, false, false, true),
            StartTlsDecision::AbandonPolicy
        );
    }

    fn rcpt(local: &str) -> Email {
        Email {
            localpart: smtp_message::Localpart(local.to_string()),
            domain: smtp_message::Hostname::Domain("example.com".to_string()),
        }
    }

    #[test]
    fn pipelined_rcpt_batch_caps_at_four_recipients() {
        let recipients: Vec<Email> = (0..6).map(|i| rcpt(&format!("r{}", i))).collect();
        let pipelined_count = recipients.len().min(4);
        assert_eq!(pipelined_count, 4);
        assert_eq!(&recipients[pipelined_count..].len(), &2);
    }

    #[test]
    fn pipelined_rcpt_batch_uncapped_when_fewer_than_four() {
        let recipients: Vec<Email> = (0..2).map(|i| rcpt(&format!("r{}", i))).collect();
        let pipelined_count = recipients.len().min(4);
        assert_eq!(pipelined_count, 2);
        assert!(recipients[pipelined_count..].is_empty());
    }
}
