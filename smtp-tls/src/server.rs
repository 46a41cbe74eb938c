//! Server-side TLS: the certificate selection ladder of spec.md §4.7/§4.13
//! and optional client-certificate relay-grant identity extraction.

use std::fs::File;
use std::io::{self, BufReader};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerTlsError {
    #[error("no readable certificate found on the selection ladder")]
    NoCertificate,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("malformed certificate or key material")]
    Malformed,
    #[error(transparent)]
    Rustls(#[from] rustls::TLSError),
}

/// The three candidate paths of spec.md §4.7's STARTTLS cert-selection
/// rule, most specific first: `<base>.<local-ip>:<local-port>`,
/// `<base>.<local-ip>`, `<base>`.
fn candidates(base: &Path, local_ip: IpAddr, local_port: u16) -> Vec<PathBuf> {
    let base_str = base.to_string_lossy();
    vec![
        PathBuf::from(format!("{}.{}:{}", base_str, local_ip, local_port)),
        PathBuf::from(format!("{}.{}", base_str, local_ip)),
        base.to_path_buf(),
    ]
}

/// Returns the first candidate path that's actually readable, or `None`
/// if none of the three are (in which case STARTTLS must not be
/// announced).
pub fn cert_ladder_path(base: &Path, local_ip: IpAddr, local_port: u16) -> Option<PathBuf> {
    candidates(base, local_ip, local_port)
        .into_iter()
        .find(|p| File::open(p).is_ok())
}

fn load_cert_chain(path: &Path) -> Result<Vec<rustls::Certificate>, ServerTlsError> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader).map_err(|_| ServerTlsError::Malformed)?;
    Ok(certs.into_iter().map(rustls::Certificate).collect())
}

fn load_private_key(path: &Path) -> Result<rustls::PrivateKey, ServerTlsError> {
    let mut reader = BufReader::new(File::open(path)?);
    let keys = rustls_pemfile::pkcs8_private_keys(&mut reader).map_err(|_| ServerTlsError::Malformed)?;
    let key = if !keys.is_empty() {
        keys.into_iter().next().unwrap()
    } else {
        let mut reader = BufReader::new(File::open(path)?);
        rustls_pemfile::rsa_private_keys(&mut reader)
            .map_err(|_| ServerTlsError::Malformed)?
            .into_iter()
            .next()
            .ok_or(ServerTlsError::Malformed)?
    };
    Ok(rustls::PrivateKey(key))
}

/// Builds a server-side `rustls::ServerConfig` from the cert ladder's
/// selected path, optionally requiring (and passing through) a client
/// certificate checked against `client_ca`, for the relay-grant identity
/// of spec.md §4.13.
pub fn server_config(
    cert_path: &Path,
    key_path: &Path,
    client_ca: Option<&Path>,
) -> Result<rustls::ServerConfig, ServerTlsError> {
    let chain = load_cert_chain(cert_path)?;
    let key = load_private_key(key_path)?;

    let mut config = match client_ca {
        Some(ca_path) => {
            let mut roots = rustls::RootCertStore::empty();
            let mut reader = BufReader::new(File::open(ca_path)?);
            let ca_certs = rustls_pemfile::certs(&mut reader).map_err(|_| ServerTlsError::Malformed)?;
            for cert in ca_certs {
                roots
                    .add(&rustls::Certificate(cert))
                    .map_err(|_| ServerTlsError::Malformed)?;
            }
            rustls::ServerConfig::new(rustls::AllowAnyAnonymousOrAuthenticatedClient::new(roots))
        }
        None => rustls::ServerConfig::new(rustls::NoClientAuth::new()),
    };

    config
        .set_single_cert(chain, key)
        .map_err(|_| ServerTlsError::Malformed)?;

    Ok(config)
}

pub fn build_acceptor(config: rustls::ServerConfig) -> async_tls::TlsAcceptor {
    async_tls::TlsAcceptor::from(Arc::new(config))
}

/// Extracts the relay-grant identity of spec.md §4.13 (`tlsclient`) from
/// a verified client certificate chain: the leaf's CN, falling back to
/// its first DNS SAN.
pub fn extract_client_identity(peer_certs: &[rustls::Certificate]) -> Option<String> {
    let leaf = peer_certs.first()?;
    let (_, cert) = x509_parser::parse_x509_certificate(&leaf.0).ok()?;
    if let Some(cn) = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
    {
        return Some(cn.to_string());
    }
    cert.subject_alternative_name()
        .ok()
        .flatten()
        .and_then(|san| {
            san.value.general_names.iter().find_map(|name| match name {
                x509_parser::extensions::GeneralName::DNSName(dns) => Some(dns.to_string()),
                _ => None,
            })
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ladder_order_is_most_specific_first() {
        let base = Path::new("/etc/servercert.pem");
        let ip: IpAddr = "192.0.2.1".parse().unwrap();
        let cands = candidates(base, ip, 465);
        assert_eq!(
            cands,
            vec![
                PathBuf::from("/etc/servercert.pem.192.0.2.1:465"),
                PathBuf::from("/etc/servercert.pem.192.0.2.1"),
                PathBuf::from("/etc/servercert.pem"),
            ]
        );
    }

    #[test]
    fn no_readable_candidate_yields_none() {
        let base = Path::new("/nonexistent/servercert.pem");
        let ip: IpAddr = "192.0.2.1".parse().unwrap();
        assert_eq!(cert_ladder_path(base, ip, 465), None);
    }
}
