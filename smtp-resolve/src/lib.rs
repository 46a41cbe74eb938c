//! C2 — DNS resolver facade shared by Qsmtpd's filter pipeline (dnsbl,
//! namebl, wildcardns, spf, forceesmtp) and Qremote's MX planner/DANE
//! verification.
//!
//! Grounded on `smtp-client/src/lib.rs::connect_to_mx`'s use of
//! `trust-dns-resolver`'s `AsyncResolver` and its `BTreeMap`-by-preference
//! grouping of MX records (generalized here into the `mx()` query so every
//! caller gets the same `IMPLICIT`-on-no-MX fallback instead of
//! reimplementing it); TLSA usage-mode acceptance is grounded on
//! `original_source/lib/qdns_dane.c`.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use thiserror::Error;
use trust_dns_resolver::{
    config::{ResolverConfig, ResolverOpts},
    error::ResolveErrorKind,
    proto::rr::{rdata::TLSA as ProtoTlsa, RData, RecordType},
    TokioAsyncResolver,
};

/// MX priorities above this live in sentinel space (spec.md §3 `IpList`):
/// `IMPLICIT`/`USED`/`CURRENT` never collide with a DNS-sourced priority.
pub const IMPLICIT: u32 = 65_536;
pub const USED: u32 = 65_537;
pub const CURRENT: u32 = 65_538;

#[derive(Debug, Error)]
pub enum DnsError {
    #[error("local resolver failure")]
    Local,
    #[error("temporary DNS failure")]
    TempFail,
    #[error("DNS query refused or malformed")]
    HardFail,
    #[error("no such name")]
    NoSuchName,
    #[error("out of memory")]
    OutOfMemory,
}

impl DnsError {
    fn from_resolve(e: &trust_dns_resolver::error::ResolveError) -> DnsError {
        match e.kind() {
            ResolveErrorKind::NoRecordsFound { .. } => DnsError::NoSuchName,
            ResolveErrorKind::Timeout => DnsError::TempFail,
            ResolveErrorKind::Io(_) => DnsError::OutOfMemory,
            _ => DnsError::HardFail,
        }
    }
}

/// One entry in an MX lookup result: an exchange name at a given priority.
/// Ties in priority are broken by DNS ordering, never re-sorted (spec.md
/// §4.2 "Ties in priority are broken by DNS ordering").
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MxEntry {
    pub exchange: String,
    pub priority: u32,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TlsaRecord {
    pub cert_usage: u8,
    pub selector: u8,
    pub matching_type: u8,
    pub data: Vec<u8>,
}

impl TlsaRecord {
    /// Only DANE-TA (2) and DANE-EE (3) are acceptable without a full PKIX
    /// chain (spec.md glossary "TLSA usage"; SPEC_FULL.md §1 DANE
    /// usage-mode restriction, grounded on `original_source/lib/qdns_dane.c`).
    pub fn usable_without_pkix(&self) -> bool {
        matches!(self.cert_usage, 2 | 3)
    }

    fn expected_len(matching_type: u8) -> Option<usize> {
        match matching_type {
            1 => Some(32), // SHA-256
            2 => Some(64), // SHA-512
            0 => None,     // full certificate/SPKI, variable length
            _ => None,
        }
    }

    fn parse(rdata: &ProtoTlsa) -> Result<TlsaRecord, DnsError> {
        let data = rdata.cert_data().to_vec();
        if data.len() < 4 {
            return Err(DnsError::HardFail);
        }
        let matching_type = u8::from(rdata.matching());
        if let Some(expected) = Self::expected_len(matching_type) {
            if data.len() != expected {
                return Err(DnsError::HardFail);
            }
        }
        Ok(TlsaRecord {
            cert_usage: u8::from(rdata.cert_usage()),
            selector: u8::from(rdata.selector()),
            matching_type,
            data,
        })
    }
}

impl fmt::Display for MxEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (priority {})", self.exchange, self.priority)
    }
}

/// DNS facade over `trust-dns-resolver`, returning owned result vectors
/// with the typed errors of spec.md §4.2 instead of the library's own
/// error type, so callers in `smtp-server`/`smtp-client` don't need to
/// depend on `trust-dns-resolver` directly.
pub struct Resolver {
    inner: TokioAsyncResolver,
}

impl Resolver {
    pub fn new(config: ResolverConfig, opts: ResolverOpts) -> Result<Resolver, DnsError> {
        let inner = TokioAsyncResolver::tokio(config, opts).map_err(|_| DnsError::Local)?;
        Ok(Resolver { inner })
    }

    pub fn from_system_conf() -> Result<Resolver, DnsError> {
        let inner = TokioAsyncResolver::tokio_from_system_conf().map_err(|_| DnsError::Local)?;
        Ok(Resolver { inner })
    }

    pub async fn a(&self, host: &str) -> Result<Vec<Ipv4Addr>, DnsError> {
        let lookup = self
            .inner
            .ipv4_lookup(host)
            .await
            .map_err(|e| DnsError::from_resolve(&e))?;
        Ok(lookup.iter().map(|r| r.0).collect())
    }

    pub async fn aaaa(&self, host: &str) -> Result<Vec<Ipv6Addr>, DnsError> {
        let lookup = self
            .inner
            .ipv6_lookup(host)
            .await
            .map_err(|e| DnsError::from_resolve(&e))?;
        Ok(lookup.iter().map(|r| r.0).collect())
    }

    /// A/AAAA lookup via `lookup_ip`, returning addresses in DNS order
    /// (used by the MX planner once an exchange name has been selected).
    pub async fn ips(&self, host: &str) -> Result<Vec<IpAddr>, DnsError> {
        let lookup = self
            .inner
            .lookup_ip(host)
            .await
            .map_err(|e| DnsError::from_resolve(&e))?;
        Ok(lookup.iter().collect())
    }

    /// MX lookup with the implicit-entry fallback of spec.md §4.2: if the
    /// name has no MX records but does have A/AAAA, the result is a single
    /// entry with `priority = IMPLICIT`.
    pub async fn mx(&self, host: &str) -> Result<Vec<MxEntry>, DnsError> {
        match self.inner.mx_lookup(host).await {
            Ok(lookup) => {
                let entries: Vec<MxEntry> = lookup
                    .iter()
                    .map(|r| MxEntry {
                        exchange: r.exchange().to_utf8(),
                        priority: u32::from(r.preference()),
                    })
                    .collect();
                if entries.is_empty() {
                    self.implicit_mx(host).await
                } else {
                    Ok(entries)
                }
            }
            Err(e) if matches!(e.kind(), ResolveErrorKind::NoRecordsFound { .. }) => {
                self.implicit_mx(host).await
            }
            Err(e) => Err(DnsError::from_resolve(&e)),
        }
    }

    async fn implicit_mx(&self, host: &str) -> Result<Vec<MxEntry>, DnsError> {
        // Existence of A/AAAA makes the implicit entry; absence propagates
        // NoSuchName.
        self.ips(host).await?;
        Ok(vec![MxEntry {
            exchange: host.to_owned(),
            priority: IMPLICIT,
        }])
    }

    /// Reverse lookup; returns at most one name (spec.md §4.2 "PTR: returns
    /// at most one name; absent name -> count 0").
    pub async fn ptr(&self, ip: IpAddr) -> Result<Option<String>, DnsError> {
        match self.inner.reverse_lookup(ip).await {
            Ok(lookup) => Ok(lookup.iter().next().map(|name| name.to_utf8())),
            Err(e) if matches!(e.kind(), ResolveErrorKind::NoRecordsFound { .. }) => Ok(None),
            Err(e) => Err(DnsError::from_resolve(&e)),
        }
    }

    pub async fn txt(&self, host: &str) -> Result<Vec<String>, DnsError> {
        match self.inner.txt_lookup(host).await {
            Ok(lookup) => Ok(lookup
                .iter()
                .map(|txt| {
                    txt.txt_data()
                        .iter()
                        .flat_map(|d| d.iter().copied())
                        .map(|b| b as char)
                        .collect::<String>()
                })
                .collect()),
            Err(e) if matches!(e.kind(), ResolveErrorKind::NoRecordsFound { .. }) => Ok(Vec::new()),
            Err(e) => Err(DnsError::from_resolve(&e)),
        }
    }

    /// TLSA lookup for `_port._tcp.host`. A zero-length vector distinguishes
    /// "no record" from a lookup error (spec.md §3 "Daneinfo vector").
    pub async fn tlsa(&self, host: &str, port: u16) -> Result<Vec<TlsaRecord>, DnsError> {
        let name = format!("_{}._tcp.{}", port, host.trim_end_matches('.'));
        let lookup = match self
            .inner
            .lookup(name, RecordType::TLSA)
            .await
        {
            Ok(l) => l,
            Err(e) if matches!(e.kind(), ResolveErrorKind::NoRecordsFound { .. }) => {
                return Ok(Vec::new())
            }
            Err(e) => return Err(DnsError::from_resolve(&e)),
        };

        let mut records = Vec::new();
        for record in lookup.record_iter() {
            if let Some(RData::TLSA(tlsa)) = record.data() {
                records.push(TlsaRecord::parse(tlsa)?);
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tlsa_usage_modes() {
        let ta = TlsaRecord {
            cert_usage: 2,
            selector: 0,
            matching_type: 1,
            data: vec![0u8; 32],
        };
        assert!(ta.usable_without_pkix());
        let pkix = TlsaRecord {
            cert_usage: 0,
            selector: 0,
            matching_type: 1,
            data: vec![0u8; 32],
        };
        assert!(!pkix.usable_without_pkix());
    }

    #[test]
    fn sentinel_priorities_above_dns_range() {
        assert!(IMPLICIT > u16::MAX as u32);
        assert!(USED > IMPLICIT);
        assert!(CURRENT > USED);
    }
}
