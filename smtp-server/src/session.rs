//! C7 — the SMTP server state machine: Qsmtpd's per-connection command
//! loop, spec.md §4.7.
//!
//! Grounded on `smtp-server/src/interact.rs`'s line-at-a-time dispatch loop
//! (kept: read a line, parse a command, reply, repeat) generalized onto the
//! current wire types of [`smtp_message`] and driven by the filter catalog
//! of [`crate::filters`] through [`smtp_server_types::drive_pipeline`]. The
//! STARTTLS splice reuses `smtp-client::deliver::box_stream`'s
//! `duplexify::Duplex` idiom so the reader never becomes generic over the
//! concrete transport.

use std::collections::HashSet;
use std::net::IpAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bitflags::bitflags;
use futures::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use rand::RngCore;
use tracing::{info, warn};

use smtp_auth::{cram_md5_challenge, decode_auth_plain, decode_cram_response, decode_login_field, AuthBackend, AuthOutcome};
use smtp_config::{find_domain_in, load_scope_file, user_exists, ConfigStore, UserConf, UserExistence};
use smtp_message::{
    BodyType as CmdBodyType, Command, CrlfLineReader, Email, Hostname, IoKind, Localpart, ParseError, Reply,
};
use smtp_queue::{QueueChild, QueueHandoff};
use smtp_queue_types::QueueOutcome;
use smtp_resolve::Resolver;
use smtp_server_types::{
    drive_pipeline, reply as canned, BodyType, FilterResult, HeloClassification, PipelineVerdict, Recipient, Xmit,
};

use crate::filters;

/// A TLS-upgradeable, type-erased duplex stream: the same pattern
/// `smtp_client::DynAsyncReadWrite` uses on the outbound side, so
/// [`CrlfLineReader::upgrade`] can splice a `rustls` session in without
/// making [`Session`] generic over the concrete transport.
pub type DynIo = duplexify::Duplex<Pin<Box<dyn Send + AsyncRead>>, Pin<Box<dyn Send + AsyncWrite>>>;

pub fn box_io<IO>(io: IO) -> DynIo
where
    IO: 'static + Unpin + Send + AsyncRead + AsyncWrite,
{
    let (read_half, write_half) = io.split();
    duplexify::Duplex::new(
        Box::pin(read_half) as Pin<Box<dyn Send + AsyncRead>>,
        Box::pin(write_half) as Pin<Box<dyn Send + AsyncWrite>>,
    )
}

bitflags! {
    /// The connection's progress through spec.md §4.7's command table,
    /// kept as a bitmask so the per-verb "minimum state" gate reads as a
    /// single containment check rather than a chain of `match` arms.
    pub struct State: u32 {
        const CONNECTED = 0b0000_0001;
        const HELO      = 0b0000_0010;
        const MAIL      = 0b0000_0100;
        const RCPT      = 0b0000_1000;
    }
}

bitflags! {
    pub struct AuthMechanisms: u8 {
        const PLAIN    = 0b001;
        const LOGIN    = 0b010;
        const CRAM_MD5 = 0b100;
    }
}

/// The non-generic policy/identity object a Qsmtpd binary builds once at
/// startup and shares (via `Arc`) across every accepted connection. A
/// deliberate departure from the teacher's generic `Config<...>` trait:
/// every knob this system needs is a plain value or file path, so a trait
/// buys nothing but an extra type parameter threaded through every
/// function in this module.
pub struct ServerConfig {
    pub hostname: String,
    pub banner: String,
    /// `databytes` control file value; `0` means unlimited.
    pub databytes: u64,
    pub read_timeout: Duration,
    pub bad_command_limit: u32,
    pub local_ip: IpAddr,
    pub local_port: u16,
    pub cert_base: Option<PathBuf>,
    pub client_ca: Option<PathBuf>,
    pub auth_backend: Option<AuthBackend>,
    pub auth_mechanisms: AuthMechanisms,
    /// Require `AUTH` before `MAIL FROM` (submission-port mode).
    pub submission_mode: bool,
    pub relay_allowed_ips: HashSet<IpAddr>,
    pub users_cdb: Option<PathBuf>,
    pub vpopbounce: String,
    pub fail_hard_on_temp: bool,
    pub nonexist_on_block: bool,
    pub store: ConfigStore,
    pub resolver: Resolver,
}

/// Per-connection state threaded through every handler (spec.md §3
/// `Xmit` plus the bookkeeping that doesn't belong in the wire-visible
/// envelope: bad-command count, auth/TLS negotiation progress, and the
/// in-flight queue handoff child).
pub struct Session {
    cfg: Arc<ServerConfig>,
    stream: CrlfLineReader<DynIo>,
    xmit: Xmit,
    state: State,
    bad_commands: u32,
    authenticated: bool,
    relay_granted: bool,
    remote_port: Option<u16>,
    active_queue: Option<QueueChild>,
    this_bytes_limit_hit: bool,
}

/// One line written to Qremote's/Qsmtpd's own logging stream is out of
/// scope here (spec.md's `tracing` ambient stack covers it); this module
/// only ever returns once the connection is done.
pub enum Outcome {
    Closed,
    TooManyErrors,
}

impl Session {
    pub fn new(cfg: Arc<ServerConfig>, io: DynIo, remote_ip: IpAddr, remote_port: Option<u16>, local_port: u16) -> Session {
        let relay_granted = cfg.relay_allowed_ips.contains(&remote_ip) || std::env::var_os("RELAYCLIENT").is_some();
        let mut xmit = Xmit::new(remote_ip);
        xmit.is_encrypted = local_port == 465;
        Session {
            cfg,
            stream: CrlfLineReader::new(io),
            xmit,
            state: State::CONNECTED,
            bad_commands: 0,
            authenticated: false,
            relay_granted,
            remote_port,
            active_queue: None,
            this_bytes_limit_hit: false,
        }
    }

    async fn write_reply(&mut self, reply: &Reply) -> Result<(), IoKind> {
        let io = self.stream.get_mut();
        for line in reply.to_lines() {
            io.write_all(line.as_bytes()).await.map_err(IoKind::Io)?;
            io.write_all(b"\r\n").await.map_err(IoKind::Io)?;
        }
        io.flush().await.map_err(IoKind::Io)
    }

    fn is_local_domain(&self, host: &Hostname) -> bool {
        match host {
            Hostname::Domain(d) => self
                .cfg
                .store
                .get_list(&UserConf::new(), "rcpthosts", None, true)
                .map(|(list, _)| find_domain_in(&list, d))
                .unwrap_or(false),
            Hostname::Literal(_) => false,
        }
    }

    fn classify_helo(&self, helo: &Hostname) -> HeloClassification {
        classify_helo(helo, &self.cfg.hostname, self.cfg.local_ip)
    }

    fn ehlo_reply(&self) -> Reply {
        let mut r = Reply::new(
            smtp_message::ReplyCode::OKAY,
            None,
            self.cfg.hostname.clone(),
        );
        r.text.push("ENHANCEDSTATUSCODES".to_string());
        r.text.push("PIPELINING".to_string());
        r.text.push("8BITMIME".to_string());
        if self.cfg.databytes > 0 {
            r.text.push(format!("SIZE {}", self.cfg.databytes));
        } else {
            r.text.push("SIZE".to_string());
        }
        r.text.push("CHUNKING".to_string());
        if self.cfg.auth_backend.is_some() && (self.xmit.is_encrypted || !self.requires_tls_before_auth()) {
            let mut mechs = Vec::new();
            if self.cfg.auth_mechanisms.contains(AuthMechanisms::PLAIN) {
                mechs.push("PLAIN");
            }
            if self.cfg.auth_mechanisms.contains(AuthMechanisms::LOGIN) {
                mechs.push("LOGIN");
            }
            if self.cfg.auth_mechanisms.contains(AuthMechanisms::CRAM_MD5) {
                mechs.push("CRAM-MD5");
            }
            if !mechs.is_empty() {
                r.text.push(format!("AUTH {}", mechs.join(" ")));
            }
        }
        if !self.xmit.is_encrypted && self.cfg.local_port != 465 && self.cert_available() {
            r.text.push("STARTTLS".to_string());
        }
        r
    }

    fn requires_tls_before_auth(&self) -> bool {
        // AUTH is never announced over a plaintext channel unless this
        // listener has no certificate to offer in the first place (in
        // which case demanding TLS first would make AUTH unreachable).
        self.cert_available()
    }

    fn cert_available(&self) -> bool {
        match &self.cfg.cert_base {
            Some(base) => smtp_tls::cert_ladder_path(base, self.cfg.local_ip, self.cfg.local_port).is_some(),
            None => false,
        }
    }

    /// The main command loop: greets, reads commands until `QUIT` or the
    /// connection dies, dispatching each through [`Self::process_line`].
    pub async fn run(mut self) -> Outcome {
        info!(remote_ip = %self.xmit.remote_ip, relay_granted = self.relay_granted, "accepted connection");
        let greeting = canned::welcome_banner(&self.cfg.hostname, &self.cfg.banner);
        if self.write_reply(&greeting).await.is_err() {
            return Outcome::Closed;
        }

        let mut first_line = true;
        loop {
            let line = match self.stream.read_line().await {
                Ok(line) => line,
                Err(IoKind::InvalidLine) => {
                    if self.bump_bad_command().await {
                        return Outcome::TooManyErrors;
                    }
                    let _ = self.write_reply(&canned::bare_linefeed()).await;
                    continue;
                }
                Err(IoKind::TooLong) => {
                    if self.bump_bad_command().await {
                        return Outcome::TooManyErrors;
                    }
                    let _ = self.write_reply(&canned::line_too_long()).await;
                    continue;
                }
                Err(_) => return Outcome::Closed,
            };

            if first_line {
                first_line = false;
                let bytes = line.as_bytes();
                if bytes.starts_with(b"GET ") || bytes.starts_with(b"POST ") || bytes.starts_with(b"HEAD ") {
                    if bytes.windows(8).any(|w| w == b"HTTP/1.0" || w == b"HTTP/1.1") {
                        // spec.md §4.7 HTTP mitigation: a client that opens
                        // with a raw HTTP request line gets silently
                        // dropped, never an SMTP reply.
                        return Outcome::Closed;
                    }
                }
            }

            match self.process_line(line.as_bytes()).await {
                Ok(true) => continue,
                Ok(false) => return Outcome::Closed,
                Err(()) => return Outcome::Closed,
            }
        }
    }

    /// Increments the bad-command counter, closing the connection with
    /// `421 too many errors` once it passes the configured limit.
    async fn bump_bad_command(&mut self) -> bool {
        self.bad_commands += 1;
        if self.bad_commands > self.cfg.bad_command_limit {
            warn!(remote_ip = %self.xmit.remote_ip, count = self.bad_commands, "closing after too many bad commands");
            let _ = self.write_reply(&canned::too_many_errors()).await;
            true
        } else {
            false
        }
    }

    /// Parses and dispatches one command line. Returns `Ok(true)` to keep
    /// reading, `Ok(false)` on a clean `QUIT`, `Err(())` on a transport
    /// failure that should just drop the connection.
    async fn process_line(&mut self, line: &[u8]) -> Result<bool, ()> {
        let rcpthosts_check = |h: &Hostname| self.is_local_domain(h);
        let cmd = smtp_message::parse_command(line, rcpthosts_check);
        let cmd = match cmd {
            Ok(cmd) => cmd,
            Err(ParseError::UnknownVerb) => {
                if self.bump_bad_command().await {
                    return Ok(false);
                }
                self.reply_ok(canned::command_unrecognized()).await
            }
            Err(_) => {
                if self.bump_bad_command().await {
                    return Ok(false);
                }
                self.reply_ok(canned::bare_linefeed()).await
            }
        };
        let cmd = match cmd {
            Some(outcome) => return Ok(outcome),
            None => return Ok(true),
        };

        match cmd {
            Command::Helo(host) => self.handle_helo(host, false).await,
            Command::Ehlo(host) => self.handle_helo(host, true).await,
            Command::MailFrom { path, params, spacebug } => self.handle_mail_from(path, params, spacebug).await,
            Command::RcptTo { path, classification, spacebug, .. } => {
                self.handle_rcpt_to(path, classification, spacebug).await
            }
            Command::Data => self.handle_data().await,
            Command::Bdat(bdat) => self.handle_bdat(bdat).await,
            Command::Rset => self.handle_rset().await,
            Command::Noop => self.reply_ok(canned::okay_noop()).await.map(|_| true).map_err(|_| ()),
            Command::Quit => {
                let _ = self.write_reply(&canned::okay_quit()).await;
                Ok(false)
            }
            Command::StartTls => self.handle_starttls().await,
            Command::Auth(rest) => self.handle_auth(rest).await,
            Command::Vrfy(_) | Command::Expn(_) => {
                self.reply_ok(canned::policy_rejected()).await.map(|_| true).map_err(|_| ())
            }
            Command::Help => self
                .reply_ok(Reply::new(smtp_message::ReplyCode::HELP_MESSAGE, None, "see RFC 5321"))
                .await
                .map(|_| true)
                .map_err(|_| ()),
        }
    }

    async fn reply_ok(&mut self, reply: Reply) -> Result<Option<bool>, ()> {
        self.write_reply(&reply).await.map_err(|_| ())?;
        Ok(None)
    }

    async fn handle_helo(&mut self, host: Hostname, esmtp: bool) -> Result<bool, ()> {
        self.xmit.reset_transaction();
        self.xmit.helo = Some(host.clone());
        self.xmit.helo_classification = Some(self.classify_helo(&host));
        self.xmit.esmtp = esmtp;
        self.state = State::CONNECTED | State::HELO;

        let uc = UserConf::new();
        if let FilterResult::DeniedWithMessage(r) = filters::helo(&self.cfg.store, &uc, &self.xmit) {
            self.write_reply(&r).await.map_err(|_| ())?;
            return Ok(true);
        }

        if esmtp {
            let reply = self.ehlo_reply();
            self.write_reply(&reply).await.map_err(|_| ())?;
        } else {
            self.write_reply(&canned::okay_rset()).await.map_err(|_| ())?;
        }
        Ok(true)
    }

    async fn handle_mail_from(
        &mut self,
        path: smtp_message::Path,
        params: smtp_message::MailParams,
        spacebug: bool,
    ) -> Result<bool, ()> {
        if !self.state.contains(State::HELO) {
            self.write_reply(&canned::bad_sequence()).await.map_err(|_| ())?;
            return Ok(true);
        }
        if self.cfg.submission_mode && !self.authenticated {
            self.write_reply(&canned::auth_required()).await.map_err(|_| ())?;
            return Ok(true);
        }
        if let Some(size) = params.size {
            if self.cfg.databytes > 0 && size > self.cfg.databytes {
                self.write_reply(&canned::size_exceeds_limit()).await.map_err(|_| ())?;
                return Ok(true);
            }
        }

        self.xmit.reset_transaction();
        self.xmit.mail_from = path.email;
        self.xmit.announced_size = params.size;
        self.xmit.body_type = params.body.map(|b| match b {
            CmdBodyType::SevenBit => BodyType::SevenBit,
            CmdBodyType::EightBitMime => BodyType::EightBitMime,
        });
        self.xmit.spacebug = spacebug;
        self.state = (self.state | State::MAIL) & !State::RCPT;

        let uc = UserConf::new();
        match filters::badmailfrom(&self.cfg.store, &uc, &self.xmit) {
            FilterResult::DeniedWithMessage(r) => {
                self.write_reply(&r).await.map_err(|_| ())?;
                return Ok(true);
            }
            _ => {}
        }

        self.write_reply(&canned::okay_mail()).await.map_err(|_| ())?;
        Ok(true)
    }

    async fn handle_rcpt_to(
        &mut self,
        path: smtp_message::Path,
        classification: smtp_message::Classification,
        _spacebug: bool,
    ) -> Result<bool, ()> {
        if !self.state.contains(State::MAIL) {
            self.write_reply(&canned::bad_sequence()).await.map_err(|_| ())?;
            return Ok(true);
        }
        if self.xmit.recipients.len() >= Xmit::MAX_RECIPIENTS {
            self.write_reply(&canned::too_many_recipients()).await.map_err(|_| ())?;
            return Ok(true);
        }

        let Some(email) = path.email else {
            self.write_reply(&canned::bad_sequence()).await.map_err(|_| ())?;
            return Ok(true);
        };

        // A null-sender (bounce) message may carry only one recipient
        // (spec.md §4.6/§4.7 "bad bounce").
        if self.xmit.mail_from.is_none() && !self.xmit.recipients.is_empty() {
            self.xmit.bad_bounce = true;
            self.write_reply(&canned::bad_bounce()).await.map_err(|_| ())?;
            return Ok(true);
        }

        let is_local = matches!(classification, smtp_message::Classification::Local);
        let relay_ok = is_local || self.relay_granted || self.xmit.tls_client_identity.is_some();
        if !relay_ok {
            self.write_reply(&canned::relay_denied()).await.map_err(|_| ())?;
            return Ok(true);
        }

        let other: Vec<Email> = self.xmit.recipients.iter().map(|r| r.mailbox.clone()).collect();

        let verdict_reply = if is_local {
            self.run_local_pipeline(&email, &other).await
        } else {
            let uc = UserConf::new();
            let results = self.run_filter_pipeline(&uc, &other).await;
            let (verdict, msg) = drive_pipeline(results, self.cfg.fail_hard_on_temp, self.cfg.nonexist_on_block);
            (verdict, msg)
        };

        let (verdict, message) = verdict_reply;
        let accepted = verdict == PipelineVerdict::Accept;
        self.xmit.recipients.push(Recipient {
            mailbox: email,
            accepted,
        });
        if accepted {
            self.xmit.good_recipients += 1;
            self.state |= State::RCPT;
        }

        let reply = match verdict {
            PipelineVerdict::Accept => canned::okay_rcpt(),
            PipelineVerdict::RejectPermanentUnspecific => message.unwrap_or_else(canned::policy_rejected),
            PipelineVerdict::RejectPermanentNoSuchUser => canned::no_such_user(),
            PipelineVerdict::RejectTemporary => canned::temp_rejected(),
        };
        self.write_reply(&reply).await.map_err(|_| ())?;
        Ok(true)
    }

    async fn run_local_pipeline(&mut self, email: &Email, other: &[Email]) -> (PipelineVerdict, Option<Reply>) {
        let Hostname::Domain(domain) = &email.domain else {
            return (PipelineVerdict::RejectPermanentNoSuchUser, None);
        };
        let Some(users_cdb) = &self.cfg.users_cdb else {
            return (PipelineVerdict::RejectPermanentNoSuchUser, None);
        };

        let mut uc = UserConf::new();
        let existence = user_exists(users_cdb, &email.localpart.0, domain, &self.cfg.vpopbounce, &mut uc);
        let existence = match existence {
            Ok(e) => e,
            Err(_) => return (PipelineVerdict::RejectTemporary, None),
        };
        if let Some(dir) = &uc.user_dir {
            uc.user_kv = load_scope_file(dir, "usersettings").unwrap_or(None);
        }
        if let Some(dir) = &uc.domain_dir {
            uc.domain_kv = load_scope_file(dir, "domainsettings").unwrap_or(None);
        }

        if !existence.is_deliverable() {
            return (PipelineVerdict::RejectPermanentNoSuchUser, None);
        }

        let results = self.run_filter_pipeline(&uc, other).await;
        drive_pipeline(results, self.cfg.fail_hard_on_temp, self.cfg.nonexist_on_block)
    }

    async fn run_filter_pipeline(&mut self, uc: &UserConf, other: &[Email]) -> Vec<FilterResult> {
        let mut results = Vec::with_capacity(9);
        results.push(filters::badmailfrom(&self.cfg.store, uc, &self.xmit));
        results.push(filters::badcc(&self.cfg.store, uc, other));
        results.push(filters::helo(&self.cfg.store, uc, &self.xmit));
        results.push(filters::dnsbl(&self.cfg.resolver, &self.cfg.store, uc, &self.xmit).await);
        results.push(filters::namebl(&self.cfg.resolver, &self.cfg.store, uc, &self.xmit).await);
        results.push(filters::forceesmtp(&self.cfg.resolver, &self.cfg.store, uc, &self.xmit).await);
        results.push(filters::wildcardns(&self.cfg.store, uc, &self.xmit));
        results.push(filters::spf(&self.cfg.resolver, &self.cfg.store, uc, &self.xmit).await);
        results.push(filters::check2822(&self.cfg.store, uc, &mut self.xmit));
        results
    }

    async fn handle_rset(&mut self) -> Result<bool, ()> {
        self.xmit.reset_transaction();
        self.state &= State::CONNECTED | State::HELO;
        self.active_queue = None;
        self.write_reply(&canned::okay_rset()).await.map_err(|_| ())?;
        Ok(true)
    }

    /// `sync_pipelining()` (spec.md §4.7): a client is forbidden from
    /// pipelining ahead of a command whose response it must see before
    /// continuing (`DATA`'s "354" prompt). Detected via
    /// [`CrlfLineReader::data_pending`]: if bytes are already buffered the
    /// instant we're about to send 354, the client jumped the gun.
    fn sync_pipelining_violated(&self) -> bool {
        self.stream.data_pending()
    }

    async fn handle_data(&mut self) -> Result<bool, ()> {
        if !self.state.contains(State::RCPT) || self.xmit.good_recipients == 0 {
            self.write_reply(&canned::bad_sequence()).await.map_err(|_| ())?;
            return Ok(true);
        }
        if self.sync_pipelining_violated() {
            self.write_reply(&canned::bad_sequence()).await.map_err(|_| ())?;
            return Ok(true);
        }

        self.write_reply(&canned::okay_data()).await.map_err(|_| ())?;

        let authenticated = self.authenticated;
        let mut child = match QueueHandoff::init(authenticated) {
            Ok(child) => child,
            Err(_) => {
                self.write_reply(&canned::internal_server_error()).await.map_err(|_| ())?;
                return Ok(true);
            }
        };

        let mut reader = smtp_message::DotStuffReader::new(&mut self.stream);
        let mut total: u64 = 0;
        let mut overflow = false;
        loop {
            let line = match reader.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(_) => return Err(()),
            };
            total += line.len() as u64 + 2;
            if self.cfg.databytes > 0 && total > self.cfg.databytes {
                overflow = true;
                continue;
            }
            if child.write_body(&line).is_err() || child.write_body(b"\r\n").is_err() {
                overflow = true;
            }
        }

        self.finish_queue_handoff(child, overflow).await
    }

    async fn handle_bdat(&mut self, bdat: smtp_message::BdatCommand) -> Result<bool, ()> {
        if !self.state.contains(State::MAIL) {
            self.write_reply(&canned::bad_sequence()).await.map_err(|_| ())?;
            return Ok(true);
        }

        let chunk = match self.stream.read_binary(bdat.size as usize).await {
            Ok(chunk) => chunk,
            Err(_) => return Err(()),
        };

        if self.active_queue.is_none() {
            let authenticated = self.authenticated;
            match QueueHandoff::init(authenticated) {
                Ok(child) => self.active_queue = Some(child),
                Err(_) => {
                    self.write_reply(&canned::internal_server_error()).await.map_err(|_| ())?;
                    return Ok(true);
                }
            }
        }

        self.xmit.this_bytes += chunk.len() as u64;
        if self.cfg.databytes > 0 && self.xmit.this_bytes > self.cfg.databytes {
            self.this_bytes_limit_hit = true;
        } else if let Some(child) = self.active_queue.as_mut() {
            let _ = child.write_body(&chunk);
        }

        if bdat.last {
            let child = self.active_queue.take().unwrap();
            let overflow = self.this_bytes_limit_hit;
            self.this_bytes_limit_hit = false;
            self.finish_queue_handoff(child, overflow).await
        } else {
            self.write_reply(&canned::okay_data()).await.map_err(|_| ())?;
            Ok(true)
        }
    }

    async fn finish_queue_handoff(&mut self, mut child: QueueChild, overflow: bool) -> Result<bool, ()> {
        let accepted: Vec<Email> = self
            .xmit
            .recipients
            .iter()
            .filter(|r| r.accepted)
            .map(|r| r.mailbox.clone())
            .collect();
        if child.write_envelope(self.xmit.mail_from.as_ref(), &accepted).is_err() {
            overflow_or_temp_reply(self, overflow).await?;
            return Ok(true);
        }

        let outcome = child.finish().unwrap_or(QueueOutcome::Temporary);
        self.xmit.reset_transaction();
        self.state &= State::CONNECTED | State::HELO;

        let reply = if overflow {
            canned::message_too_big()
        } else {
            match outcome {
                QueueOutcome::Accepted => canned::okay_mail(),
                QueueOutcome::Permanent => canned::policy_rejected(),
                QueueOutcome::Temporary => canned::temp_rejected(),
            }
        };
        self.write_reply(&reply).await.map_err(|_| ())?;
        return Ok(true);

        async fn overflow_or_temp_reply(session: &mut Session, _overflow: bool) -> Result<(), ()> {
            session.write_reply(&canned::temp_rejected()).await.map_err(|_| ())
        }
    }

    async fn handle_starttls(&mut self) -> Result<bool, ()> {
        if self.xmit.is_encrypted || !self.state.contains(State::HELO) {
            self.write_reply(&canned::bad_sequence()).await.map_err(|_| ())?;
            return Ok(true);
        }
        let Some(base) = &self.cfg.cert_base else {
            self.write_reply(&canned::command_unrecognized()).await.map_err(|_| ())?;
            return Ok(true);
        };
        let Some(cert_path) = smtp_tls::cert_ladder_path(base, self.cfg.local_ip, self.cfg.local_port) else {
            self.write_reply(&canned::command_unrecognized()).await.map_err(|_| ())?;
            return Ok(true);
        };
        let key_path = cert_path.clone();

        let server_config = match smtp_tls::server_config(&cert_path, &key_path, self.cfg.client_ca.as_deref()) {
            Ok(cfg) => cfg,
            Err(_) => {
                self.write_reply(&canned::internal_server_error()).await.map_err(|_| ())?;
                return Ok(true);
            }
        };
        self.write_reply(&canned::okay_starttls()).await.map_err(|_| ())?;

        let acceptor = smtp_tls::build_acceptor(server_config);
        // Swap the underlying transport out from under the line reader,
        // discarding any plaintext bytes the client tried to pipeline past
        // the STARTTLS boundary (spec.md §4.1's upgrade guarantee).
        let plain = std::mem::replace(&mut self.stream, CrlfLineReader::new(dummy_io())).into_inner();
        let tls_stream = match acceptor.accept(plain).await {
            Ok(s) => s,
            Err(_) => return Err(()),
        };
        let peer_certs = rustls::Session::get_peer_certificates(tls_stream.get_ref().1);
        if let Some(certs) = peer_certs {
            self.xmit.tls_client_identity = smtp_tls::extract_client_identity(&certs);
            if self.xmit.tls_client_identity.is_some() {
                self.relay_granted = true;
            }
        }
        self.stream.upgrade(box_io(tls_stream));
        self.xmit.is_encrypted = true;
        self.xmit.reset_transaction();
        self.state = State::CONNECTED;
        Ok(true)
    }

    async fn handle_auth(&mut self, rest: Vec<u8>) -> Result<bool, ()> {
        if self.authenticated || !self.state.contains(State::HELO) || self.state.contains(State::MAIL) {
            self.write_reply(&canned::bad_sequence()).await.map_err(|_| ())?;
            return Ok(true);
        }
        let Some(backend) = self.cfg.auth_backend.clone() else {
            self.write_reply(&canned::command_unrecognized()).await.map_err(|_| ())?;
            return Ok(true);
        };

        let mut it = rest.splitn(2, |&b| b == b' ');
        let mechanism = it.next().unwrap_or(&[]).to_ascii_uppercase();
        let initial = it.next();

        let outcome = match mechanism.as_slice() {
            b"PLAIN" if self.cfg.auth_mechanisms.contains(AuthMechanisms::PLAIN) => {
                self.auth_plain(initial, &backend).await
            }
            b"LOGIN" if self.cfg.auth_mechanisms.contains(AuthMechanisms::LOGIN) => {
                self.auth_login(initial, &backend).await
            }
            b"CRAM-MD5" if self.cfg.auth_mechanisms.contains(AuthMechanisms::CRAM_MD5) => {
                self.auth_cram_md5(&backend).await
            }
            _ => {
                self.write_reply(&canned::command_unrecognized()).await.map_err(|_| ())?;
                return Ok(true);
            }
        };

        match outcome {
            Ok(AuthOutcome::Authenticated) => {
                self.authenticated = true;
                self.write_reply(&Reply::new(smtp_message::ReplyCode::AUTH_SUCCESS, None, "authenticated"))
                    .await
                    .map_err(|_| ())?;
            }
            Ok(AuthOutcome::NotAuthenticated) => {
                self.write_reply(&canned::auth_failed()).await.map_err(|_| ())?;
            }
            Ok(AuthOutcome::TemporaryFailure) | Err(()) => {
                self.write_reply(&canned::temp_auth_failure()).await.map_err(|_| ())?;
            }
        }
        Ok(true)
    }

    async fn read_auth_continuation(&mut self, prompt: &str) -> Result<Vec<u8>, ()> {
        let challenge = Reply::new(smtp_message::ReplyCode::AUTH_CONTINUE, None, prompt);
        self.write_reply(&challenge).await.map_err(|_| ())?;
        let line = self.stream.read_line().await.map_err(|_| ())?;
        if line.as_bytes() == b"*" {
            return Err(());
        }
        base64::decode(line.as_bytes()).map_err(|_| ())
    }

    async fn auth_plain(&mut self, initial: Option<&[u8]>, backend: &AuthBackend) -> Result<AuthOutcome, ()> {
        let raw = match initial {
            Some(b64) => base64::decode(b64).map_err(|_| ())?,
            None => self.read_auth_continuation("").await?,
        };
        let (user, password) = decode_auth_plain(&raw).ok_or(())?;
        backend.check(&user, password, None).map_err(|_| ())
    }

    async fn auth_login(&mut self, initial: Option<&[u8]>, backend: &AuthBackend) -> Result<AuthOutcome, ()> {
        let user_b64 = match initial {
            Some(b64) => base64::decode(b64).map_err(|_| ())?,
            None => self.read_auth_continuation("VXNlcm5hbWU6").await?,
        };
        let user = decode_login_field(&user_b64).ok_or(())?;
        let pass_b64 = self.read_auth_continuation("UGFzc3dvcmQ6").await?;
        let password = decode_login_field(&pass_b64).ok_or(())?.into_bytes();
        backend.check(&user, password, None).map_err(|_| ())
    }

    async fn auth_cram_md5(&mut self, backend: &AuthBackend) -> Result<AuthOutcome, ()> {
        let nonce = rand::thread_rng().next_u64();
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let challenge = cram_md5_challenge(&self.cfg.hostname, nonce, timestamp);
        let prompt = base64::encode(&challenge);
        let raw = self.read_auth_continuation(&prompt).await?;
        let (user, digest) = decode_cram_response(&raw).ok_or(())?;
        backend.check(&user, Vec::new(), Some(&digest)).map_err(|_| ())
    }
}

/// A never-polled placeholder transport used only as the `mem::replace`
/// target while `handle_starttls` swaps the real stream out; the real
/// value is reinstated a few lines later, before any read/write happens.
fn dummy_io() -> DynIo {
    duplexify::Duplex::new(
        Box::pin(futures::io::empty()) as Pin<Box<dyn Send + AsyncRead>>,
        Box::pin(futures::io::sink()) as Pin<Box<dyn Send + AsyncWrite>>,
    )
}

/// HELO/EHLO argument classification of spec.md §3 `Xmit`: does the
/// hostname the client announced match our own name, match our own IP
/// (as a bracketed literal, or — the same equality test, just without
/// brackets — a bare dotted-quad/IPv6 form), or is it syntactically
/// invalid, or just a plain third-party name.
fn classify_helo(helo: &Hostname, local_hostname: &str, local_ip: IpAddr) -> HeloClassification {
    match helo {
        Hostname::Domain(d) => {
            // A bare IP address is checked against our own listening
            // address before the general domain-syntax check: the plain
            // `labels of letters/digits/hyphen` rule of spec.md §4.3
            // happily accepts all-numeric labels too, so a dotted-quad
            // would otherwise fall through to "syntactically invalid" or
            // "plain" and the missing-brackets classification would never
            // fire.
            if let Ok(ip) = d.parse::<IpAddr>() {
                return if ip == local_ip {
                    HeloClassification::LiteralMatchesIpMissingBrackets
                } else {
                    HeloClassification::SyntacticallyInvalid
                };
            }
            if !Hostname::is_valid_domain(d, true) {
                return HeloClassification::SyntacticallyInvalid;
            }
            if d.eq_ignore_ascii_case(local_hostname) {
                HeloClassification::MatchesLocalName
            } else {
                HeloClassification::Plain
            }
        }
        Hostname::Literal(lit) => {
            let matches_local = match (lit, local_ip) {
                (smtp_message::AddressLiteral::V4(ip), IpAddr::V4(local)) => *ip == local,
                (smtp_message::AddressLiteral::V6(ip), IpAddr::V6(local)) => *ip == local,
                _ => false,
            };
            if matches_local {
                HeloClassification::MatchesLocalIp
            } else {
                HeloClassification::Plain
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn helo_matches_local_name_case_insensitively() {
        let helo = Hostname::Domain("MAIL.Example.ORG".to_string());
        let got = classify_helo(&helo, "mail.example.org", ip("192.0.2.1"));
        assert_eq!(got, HeloClassification::MatchesLocalName);
    }

    #[test]
    fn helo_plain_third_party_domain() {
        let helo = Hostname::Domain("client.example.net".to_string());
        let got = classify_helo(&helo, "mail.example.org", ip("192.0.2.1"));
        assert_eq!(got, HeloClassification::Plain);
    }

    #[test]
    fn helo_literal_matches_local_ip() {
        let helo = Hostname::Literal(smtp_message::AddressLiteral::V4("192.0.2.1".parse().unwrap()));
        let got = classify_helo(&helo, "mail.example.org", ip("192.0.2.1"));
        assert_eq!(got, HeloClassification::MatchesLocalIp);
    }

    #[test]
    fn helo_literal_not_matching_local_ip_is_plain() {
        let helo = Hostname::Literal(smtp_message::AddressLiteral::V4("203.0.113.9".parse().unwrap()));
        let got = classify_helo(&helo, "mail.example.org", ip("192.0.2.1"));
        assert_eq!(got, HeloClassification::Plain);
    }

    #[test]
    fn helo_bare_ip_matching_local_is_literal_missing_brackets() {
        // A client sending `HELO 192.0.2.1` where that's our own
        // listening address, unbracketed: spec.md §3 calls this out as
        // its own classification, the same equality test `MatchesLocalIp`
        // uses for the bracketed form.
        let helo = Hostname::Domain("192.0.2.1".to_string());
        let got = classify_helo(&helo, "mail.example.org", ip("192.0.2.1"));
        assert_eq!(got, HeloClassification::LiteralMatchesIpMissingBrackets);
    }

    #[test]
    fn helo_bare_ip_not_matching_local_is_syntactically_invalid() {
        let helo = Hostname::Domain("203.0.113.9".to_string());
        let got = classify_helo(&helo, "mail.example.org", ip("192.0.2.1"));
        assert_eq!(got, HeloClassification::SyntacticallyInvalid);
    }

    #[test]
    fn helo_invalid_syntax() {
        let helo = Hostname::Domain("not a domain!".to_string());
        let got = classify_helo(&helo, "mail.example.org", ip("192.0.2.1"));
        assert_eq!(got, HeloClassification::SyntacticallyInvalid);
    }

    #[test]
    fn state_bitflags_gate_command_sequencing() {
        let mut state = State::CONNECTED;
        assert!(!state.contains(State::HELO));
        state |= State::HELO;
        assert!(state.contains(State::CONNECTED | State::HELO));
        state = (state | State::MAIL) & !State::RCPT;
        assert!(state.contains(State::MAIL));
        assert!(!state.contains(State::RCPT));
    }
}
