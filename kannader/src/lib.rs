//! Shared startup plumbing for the `qsmtpd` and `qremote` binaries: reading
//! the scalar `control/` files spec.md §6 lists, the packed-binary IP-list
//! format `relayclients`/`relayclients6` share with the blacklist tools, and
//! blocking `SIGPIPE` before either program touches the network (spec.md §5).
//!
//! Grounded on `kannader/src/server_config.rs`'s control-file reads (kept
//! the "first readable line, trimmed" convention) and on
//! `original_source/lib/ip.c`'s packed `{address, prefix}` record layout for
//! the relay/blacklist files.

use std::fs;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};

/// Reads a one-line control file, trimming trailing newline/whitespace.
/// Absence of the file (rather than any other I/O error) is `None`: most
/// control files have a hardcoded default when unset.
pub fn read_line(dir: &Path, name: &str) -> Option<String> {
    match fs::read_to_string(dir.join(name)) {
        Ok(s) => Some(s.trim_end().to_string()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            tracing::warn!(file = name, error = %e, "failed to read control file");
            None
        }
    }
}

/// Reads an integer control file (`databytes`, `timeoutsmtpd`, ...),
/// defaulting to `default` when absent or unparsable.
pub fn read_int(dir: &Path, name: &str, default: u64) -> u64 {
    read_line(dir, name)
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// One packed `{address, prefix-length}` record (spec.md §6): IPv4 records
/// are 4 address octets plus one prefix byte, IPv6 records 16 plus one.
/// Only exact (`/32`, `/128`) entries are honored as membership tests here;
/// see `DESIGN.md` for why this is the accepted simplification for
/// `relay_allowed_ips`'s plain `HashSet<IpAddr>` shape.
fn parse_packed_ip_records(bytes: &[u8], is_v6: bool) -> Vec<IpAddr> {
    let record_len = if is_v6 { 17 } else { 5 };
    let mut out = Vec::new();
    for chunk in bytes.chunks_exact(record_len) {
        let (addr_bytes, prefix) = chunk.split_at(record_len - 1);
        let full_prefix = if is_v6 { 128 } else { 32 };
        if prefix[0] as usize != full_prefix {
            continue;
        }
        let addr = if is_v6 {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(addr_bytes);
            IpAddr::V6(Ipv6Addr::from(octets))
        } else {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(addr_bytes);
            IpAddr::V4(Ipv4Addr::from(octets))
        };
        out.push(addr);
    }
    out
}

/// Loads `relayclients`/`relayclients6` (or any other packed-binary IP-list
/// control file) into a flat address list.
pub fn read_packed_ip_list(dir: &Path, name: &str, is_v6: bool) -> Vec<IpAddr> {
    match fs::read(dir.join(name)) {
        Ok(bytes) => parse_packed_ip_records(&bytes, is_v6),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => {
            tracing::warn!(file = name, error = %e, "failed to read packed IP list");
            Vec::new()
        }
    }
}

/// The cert-ladder base path (`servercert.pem`); always returned, since
/// `smtp_tls::cert_ladder_path` itself checks every rung of the ladder at
/// STARTTLS time and a totally absent file just makes `ServerConfig`'s
/// `cert_available` check fail closed (no STARTTLS announced).
pub fn cert_base_path(control_dir: &Path) -> PathBuf {
    control_dir.join("servercert.pem")
}

/// Blocks `SIGPIPE` process-wide (spec.md §5): broken peer connections must
/// surface as an `EPIPE` write error, never as a signal killing the process.
pub fn block_sigpipe() -> anyhow::Result<()> {
    unsafe {
        nix::sys::signal::signal(nix::sys::signal::Signal::SIGPIPE, nix::sys::signal::SigHandler::SigIgn)?;
    }
    Ok(())
}
