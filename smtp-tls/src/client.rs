//! Client-side TLS: the DANE/PKIX verification policy of spec.md §4.10
//! step 5. When TLSA records exist, the presented certificate must match
//! one of them (RFC 7671) and the usual PKIX chain/hostname check is
//! skipped entirely; otherwise the connection falls back to ordinary
//! WebPKI chain verification plus hostname match (handled by `rustls`'s
//! own default verifier, driven by the `webpki::DNSNameRef` passed at
//! connect time).

use std::sync::Arc;

use rustls::{Certificate, RootCertStore, TLSError};
use sha2::{Digest, Sha256, Sha512};
use thiserror::Error;

use smtp_resolve::TlsaRecord;

#[derive(Debug, Error)]
pub enum ClientTlsError {
    #[error("no TLSA record matched the presented certificate chain")]
    DaneMismatch,
}

struct DaneVerifier {
    records: Vec<TlsaRecord>,
}

fn spki_der(cert: &Certificate) -> Option<Vec<u8>> {
    let (_, parsed) = x509_parser::parse_x509_certificate(&cert.0).ok()?;
    Some(parsed.tbs_certificate.subject_pki.raw.to_vec())
}

fn digest_for(matching_type: u8, data: &[u8]) -> Option<Vec<u8>> {
    match matching_type {
        0 => Some(data.to_vec()),
        1 => Some(Sha256::digest(data).to_vec()),
        2 => Some(Sha512::digest(data).to_vec()),
        _ => None,
    }
}

impl rustls::ServerCertVerifier for DaneVerifier {
    fn verify_server_cert(
        &self,
        _roots: &RootCertStore,
        presented_certs: &[Certificate],
        _dns_name: webpki::DNSNameRef<'_>,
        _ocsp_response: &[u8],
    ) -> Result<rustls::ServerCertVerified, TLSError> {
        let leaf = presented_certs
            .first()
            .ok_or_else(|| TLSError::General("no certificate presented".into()))?;

        for record in &self.records {
            if !record.usable_without_pkix() {
                continue;
            }
            let candidate = match record.selector {
                0 => Some(leaf.0.clone()),
                1 => spki_der(leaf),
                _ => None,
            };
            let candidate = match candidate {
                Some(c) => c,
                None => continue,
            };
            if let Some(digest) = digest_for(record.matching_type, &candidate) {
                if digest == record.data {
                    return Ok(rustls::ServerCertVerified::assertion());
                }
            }
        }

        Err(TLSError::General(
            "no TLSA record matched presented certificate".into(),
        ))
    }
}

/// Builds the `rustls::ClientConfig` for one MX connection attempt.
/// `tlsa_records` should already be filtered to the hostname/port pair
/// being dialed (empty when the MX entry is a bare IP literal, per
/// spec.md §4.10 step 1). When non-empty, DANE verification replaces
/// ordinary PKIX+hostname verification entirely; otherwise the default
/// WebPKI root store is used.
pub fn client_config(tlsa_records: &[TlsaRecord]) -> rustls::ClientConfig {
    let mut config = rustls::ClientConfig::new();
    config
        .root_store
        .add_server_trust_anchors(&webpki_roots::TLS_SERVER_ROOTS);

    let usable: Vec<TlsaRecord> = tlsa_records
        .iter()
        .filter(|r| r.usable_without_pkix())
        .cloned()
        .collect();
    if !usable.is_empty() {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(DaneVerifier { records: usable }));
    }
    config
}

pub fn build_connector(config: rustls::ClientConfig) -> async_tls::TlsConnector {
    async_tls::TlsConnector::from(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_lengths_match_matching_type() {
        assert_eq!(digest_for(1, b"hello").unwrap().len(), 32);
        assert_eq!(digest_for(2, b"hello").unwrap().len(), 64);
        assert_eq!(digest_for(0, b"hello").unwrap(), b"hello".to_vec());
    }

    #[test]
    fn no_tlsa_builds_without_dane_verifier() {
        // Building succeeds and the DANE path was not exercised; the
        // default verifier enforces ordinary PKIX + hostname checks.
        let _config = client_config(&[]);
    }
}
