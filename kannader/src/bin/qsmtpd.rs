//! Qsmtpd: one process per accepted connection, invoked by a superserver
//! (tcpserver/xinetd-style) with the connected socket already duplicated
//! onto fd 0/1 and connection metadata in the environment (spec.md §5/§6).

use std::collections::HashSet;
use std::net::IpAddr;
use std::os::unix::io::FromRawFd;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use structopt::StructOpt;

use smtp_auth::AuthBackend;
use smtp_config::ConfigStore;
use smtp_server::session::AuthMechanisms;
use smtp_server::{box_io, ServerConfig, Session};

#[derive(StructOpt)]
#[structopt(name = "qsmtpd", about = "Inbound SMTP/ESMTP server")]
struct Opt {
    /// Control-file directory (`control/`).
    #[structopt(long, parse(from_os_str), default_value = "/var/qmail/control")]
    control_dir: PathBuf,

    /// External checkpassword-family AUTH backend, e.g. `/usr/bin/checkpassword -- /bin/true`.
    #[structopt(long, parse(from_os_str))]
    auth_backend: Vec<std::ffi::OsString>,

    /// Require AUTH before MAIL FROM (submission-port mode).
    #[structopt(long)]
    submission: bool,

    /// Path to the vpopmail-compatible `users/cdb` database.
    #[structopt(long, parse(from_os_str), default_value = "/var/vpopmail/etc/users/cdb")]
    users_cdb: PathBuf,
}

/// Connection metadata a superserver hands down via the environment
/// (spec.md §6's accepted-environment list).
struct Env {
    remote_ip: IpAddr,
    remote_port: Option<u16>,
    local_ip: IpAddr,
    local_port: u16,
}

fn read_env() -> anyhow::Result<Env> {
    let remote_ip = std::env::var("TCPREMOTEIP")
        .map_err(|_| anyhow::anyhow!("TCPREMOTEIP not set"))?
        .parse()?;
    let remote_port = std::env::var("TCPREMOTEPORT").ok().and_then(|p| p.parse().ok());
    let local_ip = std::env::var("TCPLOCALIP").unwrap_or_else(|_| "0.0.0.0".to_string()).parse()?;
    let local_port = std::env::var("TCPLOCALPORT").ok().and_then(|p| p.parse().ok()).unwrap_or(25);
    Ok(Env {
        remote_ip,
        remote_port,
        local_ip,
        local_port,
    })
}

fn build_config(opt: &Opt, env: &Env) -> anyhow::Result<ServerConfig> {
    let control_dir = &opt.control_dir;
    let hostname = kannader::read_line(control_dir, "helohost")
        .or_else(|| kannader::read_line(control_dir, "me"))
        .ok_or_else(|| anyhow::anyhow!("neither control/helohost nor control/me is readable"))?;
    let banner = hostname.clone();
    let databytes = kannader::read_int(control_dir, "databytes", 0);
    let timeout = kannader::read_int(control_dir, "timeoutsmtpd", 1200);

    let mut relay_allowed_ips: HashSet<IpAddr> =
        kannader::read_packed_ip_list(control_dir, "relayclients", false)
            .into_iter()
            .collect();
    relay_allowed_ips.extend(kannader::read_packed_ip_list(control_dir, "relayclients6", true));

    let auth_backend = if opt.auth_backend.is_empty() {
        None
    } else {
        Some(AuthBackend::new(opt.auth_backend.clone()))
    };

    let users_cdb = if opt.users_cdb.exists() {
        Some(opt.users_cdb.clone())
    } else {
        None
    };

    let store = ConfigStore::open(control_dir)?;
    let resolver = smtp_resolve::Resolver::from_system_conf()
        .map_err(|_| anyhow::anyhow!("failed to initialize DNS resolver"))?;

    Ok(ServerConfig {
        hostname,
        banner,
        databytes,
        read_timeout: Duration::from_secs(timeout),
        bad_command_limit: 10,
        local_ip: env.local_ip,
        local_port: env.local_port,
        cert_base: Some(kannader::cert_base_path(control_dir)),
        client_ca: {
            let p = control_dir.join("clientca.pem");
            if p.exists() {
                Some(p)
            } else {
                None
            }
        },
        auth_backend,
        auth_mechanisms: AuthMechanisms::PLAIN | AuthMechanisms::LOGIN | AuthMechanisms::CRAM_MD5,
        submission_mode: opt.submission,
        relay_allowed_ips,
        users_cdb,
        vpopbounce: kannader::read_line(control_dir, "vpopbounce")
            .unwrap_or_else(|| "bounce-no-mailbox".to_string()),
        fail_hard_on_temp: false,
        nonexist_on_block: false,
        store,
        resolver,
    })
}

async fn run(cfg: Arc<ServerConfig>, env: Env) -> anyhow::Result<i32> {
    // The superserver hands us the already-accepted connection as fd 0/1
    // (ucspi-tcp convention); both ends are the same socket.
    let tcp = unsafe { std::net::TcpStream::from_raw_fd(0) };
    let async_tcp = smol::Async::new(tcp)?;
    let io = box_io(async_tcp);

    let session = Session::new(cfg, io, env.remote_ip, env.remote_port, env.local_port);
    match session.run().await {
        smtp_server::Outcome::Closed => Ok(0),
        smtp_server::Outcome::TooManyErrors => Ok(0),
    }
}

fn main() -> anyhow::Result<()> {
    kannader::block_sigpipe()?;
    tracing_subscriber::fmt::init();
    let opt = Opt::from_args();
    let env = read_env()?;
    let cfg = Arc::new(build_config(&opt, &env)?);

    let code = tokio::runtime::Runtime::new()?.block_on(run(cfg, env))?;
    std::process::exit(code);
}
