//! Filter pipeline catalog (C6, spec.md §4.6): the concrete, independently
//! testable filters that `session::run_pipeline` drives to completion via
//! `smtp_server_types::drive_pipeline`.
//!
//! Grounded file-by-file on `original_source/qsmtpd/filters/*.c`: the
//! three-shape address matcher of `badmailfrom.c`/`badcc.c`, the
//! helo-classification bitmask of `helo.c`, the concurrent RBL probe of
//! `dnsbl.c`, the label-suffix zone walk of `namebl.c`, the
//! force-ESMTP-by-RBL check of `forceesmtp.c`, the wildcard-nameserver
//! comparison of `wildcardns.c`, and the SPF policy ladder of `spf.c`.
//! `check2822` never rejects; it only flips `Xmit::strict_rfc2822`.

use std::net::IpAddr;

use smtp_config::{find_domain_in, ConfigStore, UserConf};
use smtp_message::{Email, Reply, ReplyCode};
use smtp_resolve::Resolver;
use smtp_server_types::{FilterResult, Xmit};

/// The three entry shapes shared by `badmailfrom`/`goodmailfrom`/`badcc`
/// (spec.md §4.6): a full address matches verbatim; an `@domain` entry
/// matches the address's domain part exactly; a bare (sub)domain suffix
/// matches when preceded by `.` or `@`, with entries starting with `.`
/// matching only proper subdomains.
fn address_matches(entry: &str, address: &str) -> bool {
    let address_lc = address.to_ascii_lowercase();
    let entry_lc = entry.to_ascii_lowercase();

    if let Some(domain) = entry_lc.strip_prefix('@') {
        return address_lc
            .rsplit_once('@')
            .map(|(_, d)| d == domain)
            .unwrap_or(false);
    }
    if !entry_lc.contains('@') {
        let suffix = entry_lc.strip_prefix('.').unwrap_or(&entry_lc);
        if let Some(idx) = address_lc.len().checked_sub(suffix.len()) {
            if address_lc[idx..] == *suffix {
                let boundary_is_dot_or_at = idx == 0
                    || address_lc.as_bytes()[idx - 1] == b'.'
                    || address_lc.as_bytes()[idx - 1] == b'@';
                let entry_demands_proper_subdomain = entry_lc.starts_with('.');
                if entry_demands_proper_subdomain {
                    return idx > 0 && address_lc.as_bytes()[idx - 1] == b'.';
                }
                return boundary_is_dot_or_at;
            }
        }
        return false;
    }
    address_lc == entry_lc
}

fn format_address(email: &Email) -> String {
    email.to_string()
}

fn policy_reply(text: impl Into<String>) -> Reply {
    Reply::new(
        ReplyCode::custom(550),
        Some(smtp_message::EnhancedReplyCode::new(
            5,
            smtp_message::EnhancedReplyCodeSubject::Policy,
            7,
        )),
        text.into(),
    )
}

/// `badmailfrom` / `goodmailfrom`: reject a sender matching `badmailfrom`
/// unless `goodmailfrom` also matches (whitelist wins).
pub fn badmailfrom(store: &ConfigStore, uc: &UserConf, xmit: &Xmit) -> FilterResult {
    let Some(from) = &xmit.mail_from else {
        return FilterResult::Passed;
    };
    let address = format_address(from);

    let bad = match store.get_list(uc, "badmailfrom", None, true) {
        Ok((list, _)) => list,
        Err(_) => return FilterResult::Passed,
    };
    if !bad.iter().any(|entry| address_matches(entry, &address)) {
        return FilterResult::Passed;
    }

    if let Ok((good, _)) = store.get_list(uc, "goodmailfrom", None, true) {
        if good.iter().any(|entry| address_matches(entry, &address)) {
            return FilterResult::Whitelisted;
        }
    }
    FilterResult::DeniedWithMessage(policy_reply("bad mail from"))
}

/// `badcc`: reject if this transaction has 2+ recipients and any *other*
/// recipient's address matches a `badcc` entry.
pub fn badcc(store: &ConfigStore, uc: &UserConf, other_recipients: &[Email]) -> FilterResult {
    if other_recipients.is_empty() {
        return FilterResult::Passed;
    }
    let list = match store.get_list(uc, "badcc", None, true) {
        Ok((list, _)) => list,
        Err(_) => return FilterResult::Passed,
    };
    let hit = other_recipients.iter().any(|r| {
        let address = format_address(r);
        list.iter().any(|entry| address_matches(entry, &address))
    });
    if hit {
        FilterResult::DeniedWithMessage(policy_reply("bad CC"))
    } else {
        FilterResult::Passed
    }
}

/// `helo`: reject by classification bitmask (`helovalid`), else by the
/// `badhelo` suffix/exact list.
pub fn helo(store: &ConfigStore, uc: &UserConf, xmit: &Xmit) -> FilterResult {
    use smtp_server_types::HeloClassification as H;

    if let Some(classification) = xmit.helo_classification {
        let bit = match classification {
            H::MatchesLocalName => Some(1u64 << 1),
            H::MatchesLocalIp => Some(1u64 << 2),
            H::SyntacticallyInvalid => Some(1u64 << 3),
            H::LiteralMatchesIpMissingBrackets => Some(1u64 << 5),
            H::Plain => None,
        };
        if let Some(bit) = bit {
            if let Ok(Some((mask, _))) = store.get_setting(uc, "helovalid", true) {
                if (bit as i64) & mask != 0 {
                    return FilterResult::DeniedWithMessage(policy_reply("bad helo"));
                }
            }
        }
    }

    let Some(helo) = &xmit.helo else {
        return FilterResult::Passed;
    };
    let helo_str = helo.to_string();
    if let Ok((list, _)) = store.get_list(uc, "badhelo", None, true) {
        if list.iter().any(|entry| {
            let entry_lc = entry.to_ascii_lowercase();
            let helo_lc = helo_str.to_ascii_lowercase();
            if let Some(suffix) = entry_lc.strip_prefix('.') {
                helo_lc.ends_with(suffix)
            } else {
                helo_lc == entry_lc
            }
        }) {
            return FilterResult::DeniedWithMessage(policy_reply("bad helo"));
        }
    }
    FilterResult::Passed
}

fn reverse_ipv4(ip: std::net::Ipv4Addr) -> String {
    let o = ip.octets();
    format!("{}.{}.{}.{}", o[3], o[2], o[1], o[0])
}

fn reverse_ipv6(ip: std::net::Ipv6Addr) -> String {
    let mut nibbles = String::with_capacity(64);
    for byte in ip.octets().iter().rev() {
        nibbles.push_str(&format!("{:x}.{:x}.", byte & 0xf, byte >> 4));
    }
    nibbles.pop();
    nibbles
}

fn reverse_zone_name(ip: IpAddr, zone: &str) -> String {
    match ip {
        IpAddr::V4(v4) => format!("{}.{}", reverse_ipv4(v4), zone),
        IpAddr::V6(v6) => format!("{}.{}", reverse_ipv6(v6), zone),
    }
}

/// `dnsbl` / `whitednsbl`: probe the client IP, reversed, against each
/// configured zone; a blacklist match rejects (with the zone's TXT
/// message) unless a whitelist zone also matches.
pub async fn dnsbl(resolver: &Resolver, store: &ConfigStore, uc: &UserConf, xmit: &Xmit) -> FilterResult {
    let list_name = if xmit.remote_ip.is_ipv4() { "dnsbl" } else { "dnsblv6" };
    let white_name = if xmit.remote_ip.is_ipv4() { "whitednsbl" } else { "whitednsblv6" };

    let zones = match store.get_list(uc, list_name, None, true) {
        Ok((zones, _)) => zones,
        Err(_) => return FilterResult::Passed,
    };
    if zones.is_empty() {
        return FilterResult::Passed;
    }
    let white_zones = store.get_list(uc, white_name, None, true).map(|(l, _)| l).unwrap_or_default();

    let mut temp = false;
    for zone in &zones {
        let probe = reverse_zone_name(xmit.remote_ip, zone);
        match resolver.a(&probe).await {
            Ok(addrs) if !addrs.is_empty() => {
                for white in &white_zones {
                    let wprobe = reverse_zone_name(xmit.remote_ip, white);
                    if let Ok(waddrs) = resolver.a(&wprobe).await {
                        if !waddrs.is_empty() {
                            return FilterResult::Whitelisted;
                        }
                    }
                }
                let message = resolver
                    .txt(&probe)
                    .await
                    .ok()
                    .and_then(|txts| txts.into_iter().next())
                    .unwrap_or_else(|| format!("listed in {}", zone));
                return FilterResult::DeniedWithMessage(policy_reply(format!(
                    "rejected, you are listed in {}: {}",
                    zone, message
                )));
            }
            Ok(_) => continue,
            Err(smtp_resolve::DnsError::NoSuchName) => continue,
            Err(smtp_resolve::DnsError::TempFail) => {
                temp = true;
            }
            Err(_) => {
                temp = true;
            }
        }
    }
    if temp {
        FilterResult::DeniedTemporary
    } else {
        FilterResult::Passed
    }
}

/// `namebl`: for each label suffix of the envelope-sender domain, query
/// `<suffix>.<zone>`; any A record is a match.
pub async fn namebl(resolver: &Resolver, store: &ConfigStore, uc: &UserConf, xmit: &Xmit) -> FilterResult {
    let Some(from) = &xmit.mail_from else {
        return FilterResult::Passed;
    };
    let from_domain = match &from.domain {
        smtp_message::Hostname::Domain(d) => d.clone(),
        smtp_message::Hostname::Literal(_) => return FilterResult::Passed,
    };

    let zones = match store.get_list(uc, "namebl", None, true) {
        Ok((zones, _)) => zones,
        Err(_) => return FilterResult::Passed,
    };

    let mut temp = false;
    for zone in &zones {
        let mut suffix = Some(from_domain.as_str());
        while let Some(s) = suffix {
            let probe = format!("{}.{}", s, zone);
            match resolver.a(&probe).await {
                Ok(addrs) if !addrs.is_empty() => {
                    return FilterResult::DeniedWithMessage(policy_reply(format!(
                        "rejected, sender domain listed in {}",
                        zone
                    )));
                }
                Ok(_) => {}
                Err(smtp_resolve::DnsError::NoSuchName) => {}
                Err(smtp_resolve::DnsError::TempFail) => temp = true,
                Err(_) => temp = true,
            }
            suffix = s.split_once('.').map(|(_, rest)| rest);
        }
    }
    if temp {
        FilterResult::DeniedTemporary
    } else {
        FilterResult::Passed
    }
}

/// `forceesmtp`: when the client isn't ESMTP, check its IP (reversed)
/// against the named RBL and demand ESMTP if listed.
pub async fn forceesmtp(resolver: &Resolver, store: &ConfigStore, uc: &UserConf, xmit: &Xmit) -> FilterResult {
    if xmit.esmtp {
        return FilterResult::Passed;
    }
    let list_name = if xmit.remote_ip.is_ipv4() { "forceesmtp" } else { "forceesmtpv6" };
    let zones = match store.get_list(uc, list_name, None, true) {
        Ok((zones, _)) => zones,
        Err(_) => return FilterResult::Passed,
    };
    let mut temp = false;
    for zone in &zones {
        let probe = reverse_zone_name(xmit.remote_ip, zone);
        match resolver.a(&probe).await {
            Ok(addrs) if !addrs.is_empty() => {
                return FilterResult::DeniedWithMessage(policy_reply("ESMTP required from this host"));
            }
            Ok(_) => {}
            Err(smtp_resolve::DnsError::NoSuchName) => {}
            Err(smtp_resolve::DnsError::TempFail) => temp = true,
            Err(_) => temp = true,
        }
    }
    if temp {
        FilterResult::DeniedTemporary
    } else {
        FilterResult::Passed
    }
}

/// `wildcardns`: reject if the sender domain's top-level domain and one
/// of its MX IPs (already resolved into `Xmit::from_mx`) match a
/// configured `(tld, ip)` entry. Entries are stored one per line as
/// `<tld>_<ip>`. Skipped entirely for bounce messages (no `from_mx`).
pub fn wildcardns(store: &ConfigStore, uc: &UserConf, xmit: &Xmit) -> FilterResult {
    if xmit.mail_from.is_none() || xmit.from_mx.is_empty() {
        return FilterResult::Passed;
    }
    let Some(from) = &xmit.mail_from else {
        return FilterResult::Passed;
    };
    let domain = match &from.domain {
        smtp_message::Hostname::Domain(d) => d.clone(),
        smtp_message::Hostname::Literal(_) => return FilterResult::Passed,
    };
    let tld = match domain.rsplit_once('.') {
        Some((_, tld)) => tld,
        None => domain.as_str(),
    };

    let entries = match store.get_list(uc, "wildcardns", None, true) {
        Ok((entries, _)) => entries,
        Err(_) => return FilterResult::Passed,
    };
    for entry in &entries {
        let Some((entry_tld, entry_ip)) = entry.split_once('_') else {
            continue;
        };
        if !entry_tld.eq_ignore_ascii_case(tld) {
            continue;
        }
        let Ok(entry_ip) = entry_ip.parse::<IpAddr>() else {
            continue;
        };
        if xmit.from_mx.iter().any(|ip| *ip == entry_ip) {
            return FilterResult::DeniedWithMessage(policy_reply("MX is wildcard NS entry"));
        }
    }
    FilterResult::Passed
}

/// SPF evaluation result classes (spec.md §4.6 spf, RFC 7208 qualifiers).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SpfResult {
    Pass,
    Fail,
    SoftFail,
    Neutral,
    None,
    TempError,
    PermError,
}

/// `spf`: evaluate SPF for the envelope sender (HELO domain when the
/// sender is null), honoring `spfpolicy`'s 1-6 ladder, `spfignore`
/// (whitelist by reverse-lookup match), and `spfstrict`. A secondary
/// SPF-RHSBL zone (`rspf`) is consulted only when the primary result is
/// `None`.
///
/// Full RFC 7208 mechanism evaluation is out of scope for this facade;
/// this resolves only the `v=spf1` record's presence/absence and its
/// `-all`/`~all`/`?all`/`+all` (or missing) default qualifier, which is
/// sufficient to drive the policy ladder the spec describes.
pub async fn spf(resolver: &Resolver, store: &ConfigStore, uc: &UserConf, xmit: &Xmit) -> FilterResult {
    let domain_str = match &xmit.mail_from {
        Some(from) => match &from.domain {
            smtp_message::Hostname::Domain(d) => Some(d.clone()),
            smtp_message::Hostname::Literal(_) => None,
        },
        None => match &xmit.helo {
            Some(smtp_message::Hostname::Domain(d)) => Some(d.clone()),
            _ => None,
        },
    };
    let Some(domain_str) = domain_str else {
        return FilterResult::Passed;
    };

    if let Ok((ignore, _)) = store.get_list(uc, "spfignore", None, true) {
        if let Some(remote_host) = &xmit.remote_host {
            if find_domain_in(&ignore, remote_host) {
                return FilterResult::Whitelisted;
            }
        }
    }

    let policy = store
        .get_setting(uc, "spfpolicy", true)
        .ok()
        .flatten()
        .map(|(v, _)| v)
        .unwrap_or(0);
    if policy == 0 {
        return FilterResult::Passed;
    }

    let result = evaluate_spf_record(resolver, &domain_str).await;

    if result == SpfResult::None {
        if let Ok((zones, _)) = store.get_list(uc, "rspf", None, true) {
            for zone in &zones {
                let probe = format!("{}.{}", domain_str, zone);
                if let Ok(addrs) = resolver.a(&probe).await {
                    if !addrs.is_empty() {
                        return FilterResult::DeniedWithMessage(policy_reply(
                            "sender domain listed in secondary SPF RHSBL",
                        ));
                    }
                }
            }
        }
    }

    let rejects = match (policy, result) {
        (_, SpfResult::TempError) if policy >= 1 => return FilterResult::DeniedTemporary,
        (p, SpfResult::Fail) if p >= 2 => true,
        (p, SpfResult::PermError) if p >= 3 => true,
        (p, SpfResult::SoftFail) if p >= 4 => true,
        (p, SpfResult::Neutral) if p >= 5 => true,
        (p, SpfResult::None) if p >= 6 => true,
        _ => false,
    };

    if rejects {
        FilterResult::DeniedWithMessage(policy_reply(format!("SPF check failed ({:?})", result)))
    } else {
        FilterResult::Passed
    }
}

async fn evaluate_spf_record(resolver: &Resolver, domain: &str) -> SpfResult {
    match resolver.txt(domain).await {
        Ok(txts) => classify_spf_txt_records(&txts),
        Err(smtp_resolve::DnsError::NoSuchName) => SpfResult::None,
        Err(smtp_resolve::DnsError::TempFail) => SpfResult::TempError,
        Err(_) => SpfResult::PermError,
    }
}

/// The pure, network-free half of `evaluate_spf_record`: picks the
/// `v=spf1` record out of a TXT answer set and classifies its `all`
/// qualifier.
fn classify_spf_txt_records(txts: &[String]) -> SpfResult {
    let record = txts.iter().find(|t| t.starts_with("v=spf1"));
    match record {
        Some(record) => {
            if record.contains("-all") {
                SpfResult::Fail
            } else if record.contains("~all") {
                SpfResult::SoftFail
            } else if record.contains("?all") {
                SpfResult::Neutral
            } else if record.contains("+all") || record.contains("all") {
                SpfResult::Pass
            } else {
                SpfResult::Neutral
            }
        }
        None => SpfResult::None,
    }
}

/// `check2822`: never itself a rejection; only toggles whether `DATA`
/// applies strict RFC 2822 header validation.
pub fn check2822(store: &ConfigStore, uc: &UserConf, xmit: &mut Xmit) -> FilterResult {
    let enabled = store
        .get_setting(uc, "check2822", true)
        .ok()
        .flatten()
        .map(|(v, _)| v > 0)
        .unwrap_or(false);
    xmit.strict_rfc2822 = enabled;
    FilterResult::Passed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_address_matches_verbatim() {
        assert!(address_matches("foo@aol.com", "foo@aol.com"));
        assert!(!address_matches("foo@aol.com", "bar@aol.com"));
    }

    #[test]
    fn at_domain_matches_domain_only() {
        assert!(address_matches("@aol.com", "foo@aol.com"));
        assert!(!address_matches("@aol.com", "foo@bar.aol.com"));
    }

    #[test]
    fn bare_domain_matches_subdomains_but_not_lookalikes() {
        assert!(address_matches("aol.com", "foo@aol.com"));
        assert!(address_matches("aol.com", "foo@bar.aol.com"));
        assert!(!address_matches("aol.com", "foo@no-aol.com"));
    }

    #[test]
    fn dot_prefixed_entry_excludes_exact_domain() {
        assert!(address_matches(".aol.com", "foo@bar.aol.com"));
        assert!(!address_matches(".aol.com", "foo@aol.com"));
    }

    #[test]
    fn reverse_ipv4_is_dotted_octets_reversed() {
        let ip: std::net::Ipv4Addr = "192.0.2.1".parse().unwrap();
        assert_eq!(reverse_ipv4(ip), "1.2.0.192");
    }

    #[test]
    fn spf_txt_records_classify_by_all_qualifier() {
        let txt = |s: &str| vec![s.to_string()];
        assert_eq!(classify_spf_txt_records(&txt("v=spf1 -all")), SpfResult::Fail);
        assert_eq!(classify_spf_txt_records(&txt("v=spf1 ~all")), SpfResult::SoftFail);
        assert_eq!(classify_spf_txt_records(&txt("v=spf1 ?all")), SpfResult::Neutral);
        assert_eq!(classify_spf_txt_records(&txt("v=spf1 +all")), SpfResult::Pass);
        assert_eq!(classify_spf_txt_records(&txt("v=spf1 include:_spf.example.com")), SpfResult::Neutral);
    }

    #[test]
    fn spf_txt_records_ignore_unrelated_txt_and_report_none() {
        let txts = vec!["some other txt record".to_string()];
        assert_eq!(classify_spf_txt_records(&txts), SpfResult::None);
        assert_eq!(classify_spf_txt_records(&[]), SpfResult::None);
    }

    #[test]
    fn spf_txt_records_picks_spf1_record_among_others() {
        let txts = vec!["unrelated".to_string(), "v=spf1 -all".to_string()];
        assert_eq!(classify_spf_txt_records(&txts), SpfResult::Fail);
    }
}
