//! C9 — MX planner: resolves a target domain (or address literal, or
//! `smtproutes` override) to the ordered [`IpList`] Qremote's delivery loop
//! (`deliver.rs`) iterates over.
//!
//! Grounded on this crate's own `connect_to_mx`, whose `BTreeMap<preference,
//! Vec<exchange>>` grouping-then-iterate-in-order pattern is generalized
//! here into the explicit `IpList`/`IpEntry` data type spec.md §3 and §9
//! ("Pointer graphs -> arenas/handles") call for, rather than re-resolving
//! MX names lazily inside the connect loop.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};

use smtp_message::Hostname;
use smtp_resolve::{DnsError, MxEntry, Resolver, IMPLICIT, USED};

/// One already-resolved candidate address in an [`IpList`] (spec.md §3
/// `IpList` node, flattened to one entry per address so selection can mark
/// addresses `Used`/`Current` individually while same-name addresses stay
/// grouped by construction order).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IpEntry {
    /// Host this address was learned for; absent for a literal target.
    pub name: Option<String>,
    pub address: IpAddr,
    /// DNS priorities are `<= 65535`; [`IMPLICIT`]/[`USED`]/[`CURRENT`]
    /// live above that range and are never DNS-sourced (spec.md §3).
    pub priority: u32,
    pub state: EntryState,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EntryState {
    Pending,
    Current,
    Used,
}

/// Ordered candidate list a delivery attempt walks, lowest priority first
/// (spec.md §3 `IpList`).
#[derive(Clone, Debug, Default)]
pub struct IpList {
    pub entries: Vec<IpEntry>,
}

#[derive(Debug, thiserror::Error)]
pub enum MxPlanError {
    #[error(transparent)]
    Dns(#[from] DnsError),
    #[error("no usable address remained after filtering local addresses")]
    NoUsableAddress,
}

/// A `smtproutes` override entry: `target:host[:port]` (spec.md §6).
#[derive(Clone, Debug)]
pub struct SmartHost {
    pub host: String,
    pub port: Option<u16>,
}

impl IpList {
    /// Sorts by ascending priority; stable, so entries that share a
    /// priority (and in particular, every address belonging to one MX
    /// name) keep their relative insertion order (spec.md §4.9 "Sort
    /// stability").
    pub fn sort_stable(&mut self) {
        self.entries.sort_by_key(|e| e.priority);
    }

    /// Picks the lowest-priority `Pending` entry, marks it `Current`, and
    /// returns its index (spec.md §4.9 "Selection"). Any previously
    /// `Current` entry is left untouched -- callers mark it `Used` via
    /// [`mark_used`](Self::mark_used) once the attempt concludes.
    pub fn select_next(&mut self) -> Option<usize> {
        let idx = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.state == EntryState::Pending)
            .min_by_key(|(_, e)| e.priority)
            .map(|(i, _)| i)?;
        self.entries[idx].state = EntryState::Current;
        Some(idx)
    }

    pub fn mark_used(&mut self, idx: usize) {
        self.entries[idx].state = EntryState::Used;
    }

    pub fn is_exhausted(&self) -> bool {
        self.entries
            .iter()
            .all(|e| e.state != EntryState::Pending)
    }
}

/// Removes local interface addresses, the IPv4 loopback block, `0.0.0.0`,
/// and exact duplicates (spec.md §4.9 step 4). Idempotent: running it twice
/// yields the same result as running it once (spec.md §8).
pub fn filter_my_ips(entries: Vec<IpEntry>, local_ips: &HashSet<IpAddr>) -> Vec<IpEntry> {
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(entries.len());
    for entry in entries {
        if local_ips.contains(&entry.address) {
            continue;
        }
        if let IpAddr::V4(v4) = entry.address {
            if v4.octets()[0] == 127 || v4 == Ipv4Addr::UNSPECIFIED {
                continue;
            }
        }
        if !seen.insert(entry.address) {
            continue;
        }
        out.push(entry);
    }
    out
}

/// Resolves `target` into an [`IpList`], per spec.md §4.9:
///
/// 1. An address literal becomes a single entry (priority `USED` for IPv6,
///    `0` for IPv4 -- the asymmetry is spec.md's own, preserved rather than
///    "fixed" since it encodes that an IPv6 literal is used as-is without
///    further fallback attempts).
/// 2. A `smarthost` override resolves that host's own A/AAAA instead of the
///    original target's MX set.
/// 3. Otherwise, DNS MX is expanded to A/AAAA, attaching the MX priority to
///    every address learned for that name.
/// 4. [`filter_my_ips`] removes local/loopback/duplicate addresses.
/// 5. An empty result after filtering is a temporary error.
pub async fn plan(
    resolver: &Resolver,
    target: &Hostname,
    smarthost: Option<&SmartHost>,
    local_ips: &HashSet<IpAddr>,
) -> Result<IpList, MxPlanError> {
    if let Hostname::Literal(lit) = target {
        let (address, priority) = match lit {
            smtp_message::AddressLiteral::V4(v4) => (IpAddr::V4(*v4), 0),
            smtp_message::AddressLiteral::V6(v6) => (IpAddr::V6(*v6), USED),
        };
        return Ok(IpList {
            entries: vec![IpEntry {
                name: None,
                address,
                priority,
                state: EntryState::Pending,
            }],
        });
    }

    let host = match target {
        Hostname::Domain(d) => d.clone(),
        Hostname::Literal(_) => unreachable!("handled above"),
    };

    if let Some(route) = smarthost {
        let addrs = resolver.ips(&route.host).await?;
        let entries = addrs
            .into_iter()
            .map(|address| IpEntry {
                name: Some(route.host.clone()),
                address,
                priority: 0,
                state: EntryState::Pending,
            })
            .collect();
        let filtered = filter_my_ips(entries, local_ips);
        if filtered.is_empty() {
            return Err(MxPlanError::NoUsableAddress);
        }
        let mut list = IpList { entries: filtered };
        list.sort_stable();
        return Ok(list);
    }

    let mx_entries: Vec<MxEntry> = resolver.mx(&host).await?;
    let mut entries = Vec::new();
    for mx in &mx_entries {
        // `mx.priority == IMPLICIT` means the exchange name *is* the
        // target itself, already verified to have A/AAAA by
        // `Resolver::mx`; it's expanded to addresses the same way any
        // other MX name is.
        let addrs = resolver.ips(&mx.exchange).await?;
        entries.extend(addrs.into_iter().map(|address| IpEntry {
            name: Some(mx.exchange.clone()),
            address,
            priority: mx.priority,
            state: EntryState::Pending,
        }));
    }

    let filtered = filter_my_ips(entries, local_ips);
    if filtered.is_empty() {
        return Err(MxPlanError::NoUsableAddress);
    }
    let mut list = IpList { entries: filtered };
    list.sort_stable();
    Ok(list)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(addr: &str, prio: u32) -> IpEntry {
        IpEntry {
            name: Some("mx".into()),
            address: addr.parse().unwrap(),
            priority: prio,
            state: EntryState::Pending,
        }
    }

    #[test]
    fn filter_my_ips_is_idempotent() {
        let entries = vec![
            entry("192.0.2.1", 10),
            entry("127.0.0.1", 10),
            entry("0.0.0.0", 10),
            entry("192.0.2.1", 10),
        ];
        let local = HashSet::new();
        let once = filter_my_ips(entries.clone(), &local);
        let twice = filter_my_ips(once.clone(), &local);
        assert_eq!(once, twice);
        assert_eq!(once.len(), 1);
    }

    #[test]
    fn filter_my_ips_removes_local_interface_address() {
        let mut local = HashSet::new();
        local.insert("192.0.2.9".parse().unwrap());
        let entries = vec![entry("192.0.2.9", 10), entry("192.0.2.10", 10)];
        let out = filter_my_ips(entries, &local);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].address, "192.0.2.10".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn sort_stable_preserves_dns_order_within_priority() {
        let mut list = IpList {
            entries: vec![entry("192.0.2.2", 20), entry("192.0.2.1", 10), entry("192.0.2.3", 10)],
        };
        list.sort_stable();
        let addrs: Vec<_> = list.entries.iter().map(|e| e.address.to_string()).collect();
        assert_eq!(addrs, vec!["192.0.2.1", "192.0.2.3", "192.0.2.2"]);
    }

    #[test]
    fn selection_marks_current_then_used_and_advances() {
        let mut list = IpList {
            entries: vec![entry("192.0.2.1", 10), entry("192.0.2.2", 20)],
        };
        let first = list.select_next().unwrap();
        assert_eq!(first, 0);
        list.mark_used(first);
        let second = list.select_next().unwrap();
        assert_eq!(second, 1);
        list.mark_used(second);
        assert!(list.select_next().is_none());
        assert!(list.is_exhausted());
    }
}
