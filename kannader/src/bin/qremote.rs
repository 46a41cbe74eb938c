//! Qremote: one process per outbound delivery attempt, invoked as
//! `qremote <target-domain> <envelope-sender> <recipient>...` with the
//! queued message on stdin and a one-byte-code status stream on stdout
//! (spec.md §5/§6).

use std::collections::HashSet;
use std::io::{self, Read, Write};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use async_trait::async_trait;
use futures::{AsyncRead, AsyncReadExt, AsyncWrite};

use smtp_client::{DynAsyncReadWrite, SmartHost};
use smtp_message::{AddressLiteral, Email, Hostname, Localpart};
use smtp_queue_types::{format_status_record, SummaryStatusCode};
use smtp_resolve::TlsaRecord;

/// Parses one `local@domain` argv string into an [`Email`]. The domain half
/// may be a bare IP (the form `smtp-queue::write_envelope` produces for
/// address-literal recipients); anything else is taken as a domain name.
fn parse_email_arg(arg: &str) -> anyhow::Result<Email> {
    let (local, domain) = arg
        .rsplit_once('@')
        .ok_or_else(|| anyhow::anyhow!("not an address: {}", arg))?;
    Ok(Email {
        localpart: Localpart(local.to_string()),
        domain: parse_hostname_arg(domain),
    })
}

/// Parses a bare domain-or-IP argv string (no brackets) into a [`Hostname`].
fn parse_hostname_arg(s: &str) -> Hostname {
    if let Ok(v4) = s.parse::<std::net::Ipv4Addr>() {
        return Hostname::Literal(AddressLiteral::V4(v4));
    }
    if let Ok(v6) = s.parse::<std::net::Ipv6Addr>() {
        return Hostname::Literal(AddressLiteral::V6(v6));
    }
    Hostname::Domain(s.to_string())
}

/// Parses one `smtproutes` control-file line: `target:host[:port]`.
fn parse_smtproutes_line(line: &str) -> Option<(String, SmartHost)> {
    let mut parts = line.splitn(2, ':');
    let target = parts.next()?.to_string();
    let rest = parts.next()?;
    let (host, port) = match rest.rsplit_once(':') {
        Some((h, p)) => (h.to_string(), p.parse().ok()),
        None => (rest.to_string(), None),
    };
    Some((target, SmartHost { host, port }))
}

fn load_smarthost(control_dir: &Path, target: &Hostname) -> Option<SmartHost> {
    let target_name = match target {
        Hostname::Domain(d) => d,
        Hostname::Literal(_) => return None,
    };
    let contents = std::fs::read_to_string(control_dir.join("smtproutes")).ok()?;
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((entry_target, route)) = parse_smtproutes_line(line) {
            if entry_target.is_empty() || entry_target.eq_ignore_ascii_case(target_name) {
                return Some(route);
            }
        }
    }
    None
}

fn box_stream<IO>(io: IO) -> DynAsyncReadWrite
where
    IO: 'static + Unpin + Send + AsyncRead + AsyncWrite,
{
    let (r, w) = io.split();
    duplexify::Duplex::new(
        Box::pin(r) as Pin<Box<dyn Send + AsyncRead>>,
        Box::pin(w) as Pin<Box<dyn Send + AsyncWrite>>,
    )
}

struct QremoteConfig {
    ehlo_hostname: Hostname,
    target_name: String,
    local_ips: HashSet<IpAddr>,
    smarthost: Option<SmartHost>,
}

#[async_trait]
impl smtp_client::Config for QremoteConfig {
    fn ehlo_hostname(&self) -> Hostname {
        self.ehlo_hostname.clone()
    }

    async fn tls_connect<IO>(&self, io: IO, tlsa: &[TlsaRecord]) -> io::Result<DynAsyncReadWrite>
    where
        IO: 'static + Unpin + Send + AsyncRead + AsyncWrite,
    {
        let config = smtp_tls::client_config(tlsa);
        let connector = smtp_tls::build_connector(config);
        let tls = connector.connect(self.target_name.as_str(), io).await?;
        Ok(box_stream(tls))
    }

    fn local_ips(&self) -> HashSet<IpAddr> {
        self.local_ips.clone()
    }

    fn smarthost_for(&self, _target: &Hostname) -> Option<SmartHost> {
        self.smarthost.clone()
    }
}

fn local_interface_ips() -> HashSet<IpAddr> {
    // Best-effort: `getifaddrs`-based enumeration is out of scope for a
    // one-shot delivery process; local addresses configured in
    // `control/outgoingip[6]` (the only ones Qremote actually binds to)
    // are excluded via `local_ips` instead, in `build_config`.
    HashSet::new()
}

fn build_config(control_dir: &Path, target: &Hostname) -> QremoteConfig {
    let ehlo_hostname = kannader::read_line(control_dir, "helohost")
        .or_else(|| kannader::read_line(control_dir, "me"))
        .map(Hostname::Domain)
        .unwrap_or_else(|| Hostname::Domain("localhost".to_string()));

    let mut local_ips = local_interface_ips();
    if let Some(ip) = kannader::read_line(control_dir, "outgoingip").and_then(|s| s.parse().ok()) {
        local_ips.insert(ip);
    }
    if let Some(ip) = kannader::read_line(control_dir, "outgoingip6").and_then(|s| s.parse().ok()) {
        local_ips.insert(ip);
    }

    let smarthost = load_smarthost(control_dir, target);
    let target_name = target.to_string();

    QremoteConfig {
        ehlo_hostname,
        target_name,
        local_ips,
        smarthost,
    }
}

fn write_status_stream(report: &smtp_client::DeliveryReport) -> io::Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    for r in &report.recipients {
        out.write_all(&format_status_record(r.status.byte(), &r.detail))?;
    }
    let summary_text = match &report.remote {
        Some(remote) => remote.clone(),
        None => String::new(),
    };
    out.write_all(&format_status_record(report.summary.byte(), &summary_text))?;
    out.flush()
}

async fn async_main(control_dir: PathBuf, target: Hostname, sender: Option<Email>, recipients: Vec<Email>) -> anyhow::Result<()> {
    let mut body = Vec::new();
    io::stdin().lock().read_to_end(&mut body)?;

    let resolver = smtp_resolve::Resolver::from_system_conf()
        .map_err(|_| anyhow::anyhow!("failed to initialize DNS resolver"))?;
    let cfg = build_config(&control_dir, &target);

    let report = smtp_client::send_to(&cfg, &resolver, &target, sender.as_ref(), &recipients, &body).await;
    let report = match report {
        Ok(r) => r,
        Err(e) => {
            // Planning failed before any MX attempt (DNS/smarthost error);
            // no per-recipient status has been emitted yet, only the
            // connection-level summary (spec.md §6).
            let summary = match e.severity() {
                smtp_client::TransportErrorSeverity::Permanent => SummaryStatusCode::ConnPermanent,
                smtp_client::TransportErrorSeverity::Temporary => SummaryStatusCode::ConnTemporary,
            };
            smtp_client::DeliveryReport {
                summary,
                recipients: Vec::new(),
                remote: Some(e.to_string()),
            }
        }
    };
    write_status_stream(&report)?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    kannader::block_sigpipe()?;
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 4 {
        anyhow::bail!("usage: qremote <target-domain> <envelope-sender> <recipient>...");
    }
    let target = parse_hostname_arg(&args[1]);
    let sender = if args[2].is_empty() {
        None
    } else {
        Some(parse_email_arg(&args[2])?)
    };
    let recipients: Vec<Email> = args[3..]
        .iter()
        .map(|a| parse_email_arg(a))
        .collect::<anyhow::Result<_>>()?;

    let control_dir = std::env::var_os("QREMOTE_CONTROL_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/var/qmail/control"));

    tokio::runtime::Runtime::new()?.block_on(async_main(control_dir, target, sender, recipients))?;
    // Exit code 0 regardless of per-recipient outcome (spec.md §6); only a
    // local abort (the early returns above, via `anyhow::bail!`/`?`) exits
    // non-zero.
    Ok(())
}
