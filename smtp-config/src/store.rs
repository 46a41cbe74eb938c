//! Config store (C4, spec.md §4.4): `get_file`/`get_setting`/`get_list`
//! search user scope, then domain scope, then (if allowed) the global
//! `control/` directory, and `find_domain_in` implements the
//! suffix-aware domain-list match shared by `rcpthosts` and the filter
//! catalog's domain lists.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

use openat::Dir;
use thiserror::Error;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Scope {
    User,
    Domain,
    Global,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("not found in any in-scope directory")]
    NotFound,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Per-transaction scope handles and preloaded KV lists (spec.md §3
/// `UserConf`). `None` means that scope doesn't exist for this
/// recipient (e.g. the domain has no per-user directories at all).
#[derive(Default)]
pub struct UserConf {
    pub domain_dir: Option<Dir>,
    pub user_dir: Option<Dir>,
    pub user_kv: Option<Vec<String>>,
    pub domain_kv: Option<Vec<String>>,
}

impl UserConf {
    pub fn new() -> UserConf {
        UserConf::default()
    }
}

/// One KV-scope's raw file content, already split into non-comment,
/// non-blank lines; `lookup_setting`/`get_list` both operate on this
/// shape.
fn strip_comments_and_blanks<R: BufRead>(r: R) -> io::Result<Vec<String>> {
    let mut out = Vec::new();
    for line in r.lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        out.push(trimmed.to_string());
    }
    Ok(out)
}

/// Loads a whole KV/list file given a scope directory, returning `None`
/// if the file doesn't exist in that scope (any other I/O error is
/// propagated). Exposed publicly so callers (e.g. `smtp-server`'s session
/// setup) can preload `UserConf::user_kv`/`domain_kv` from the same
/// per-scope directories `ConfigStore` itself resolved.
pub fn load_scope_file(dir: &Dir, name: &str) -> Result<Option<Vec<String>>, ConfigError> {
    match dir.open_file(name) {
        Ok(f) => Ok(Some(strip_comments_and_blanks(BufReader::new(f))?)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(ConfigError::Io(e)),
    }
}

/// Parses one KV entry against `key`: a bare `KEY` yields `Some(1)`; a
/// `KEY=N` yields `Some(N)` or `Some(-1)` if `N` isn't a strict decimal
/// integer (spec.md §4.4 "any trailing byte is a syntax error returning
/// −1"); anything not matching `key` yields `None`.
fn match_setting_entry(entry: &str, key: &str) -> Option<i64> {
    if entry == key {
        return Some(1);
    }
    let prefix = format!("{}=", key);
    let value = entry.strip_prefix(&prefix)?;
    Some(value.parse::<i64>().unwrap_or(-1))
}

pub struct ConfigStore {
    global: Dir,
}

impl ConfigStore {
    pub fn open(global_dir: impl AsRef<Path>) -> io::Result<ConfigStore> {
        Ok(ConfigStore {
            global: Dir::open(global_dir.as_ref())?,
        })
    }

    /// Opens `name` for reading, searching user dir, then domain dir,
    /// then (if `allow_global`) the global `control/` directory.
    pub fn get_file(
        &self,
        uc: &UserConf,
        name: &str,
        allow_global: bool,
    ) -> Result<(File, Scope), ConfigError> {
        if let Some(dir) = &uc.user_dir {
            match dir.open_file(name) {
                Ok(f) => return Ok((f, Scope::User)),
                Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e.into()),
                _ => {}
            }
        }
        if let Some(dir) = &uc.domain_dir {
            match dir.open_file(name) {
                Ok(f) => return Ok((f, Scope::Domain)),
                Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e.into()),
                _ => {}
            }
        }
        if allow_global {
            match self.global.open_file(name) {
                Ok(f) => return Ok((f, Scope::Global)),
                Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e.into()),
                _ => {}
            }
        }
        Err(ConfigError::NotFound)
    }

    /// Scans user KV, then domain KV, then (if `use_global`) global KV
    /// for `key`. A negative match at user scope, or at domain scope,
    /// is the "hard zero, do not cascade" rule of spec.md §4.4: the
    /// effective value is reported as `0` and no further scope is
    /// consulted (consistent with normal found-stops-scanning
    /// behavior, since a match was in fact found).
    pub fn get_setting(
        &self,
        uc: &UserConf,
        key: &str,
        use_global: bool,
    ) -> Result<Option<(i64, Scope)>, ConfigError> {
        if let Some(kv) = &uc.user_kv {
            if let Some(v) = kv.iter().find_map(|e| match_setting_entry(e, key)) {
                return Ok(Some((v.max(0), Scope::User)));
            }
        }
        if let Some(kv) = &uc.domain_kv {
            if let Some(v) = kv.iter().find_map(|e| match_setting_entry(e, key)) {
                return Ok(Some((v.max(0), Scope::Domain)));
            }
        }
        if use_global {
            let global_kv = load_scope_file(&self.global, "globalsettings")?;
            if let Some(kv) = global_kv {
                if let Some(v) = kv.iter().find_map(|e| match_setting_entry(e, key)) {
                    return Ok(Some((v.max(0), Scope::Global)));
                }
            }
        }
        Ok(None)
    }

    /// Loads `name` as an ordered line list, searching the same scopes
    /// as [`get_file`]; `checkfn` can reject malformed entries (the
    /// whole file is discarded if any entry fails validation, matching
    /// the "load or don't" semantics of the control-file loaders).
    pub fn get_list(
        &self,
        uc: &UserConf,
        name: &str,
        checkfn: Option<&dyn Fn(&str) -> bool>,
        allow_global: bool,
    ) -> Result<(Vec<String>, Scope), ConfigError> {
        for (dir, scope) in [
            (uc.user_dir.as_ref(), Scope::User),
            (uc.domain_dir.as_ref(), Scope::Domain),
        ] {
            if let Some(dir) = dir {
                if let Some(lines) = load_scope_file(dir, name)? {
                    return Self::validated(lines, scope, checkfn);
                }
            }
        }
        if allow_global {
            if let Some(lines) = load_scope_file(&self.global, name)? {
                return Self::validated(lines, Scope::Global, checkfn);
            }
        }
        Err(ConfigError::NotFound)
    }

    fn validated(
        lines: Vec<String>,
        scope: Scope,
        checkfn: Option<&dyn Fn(&str) -> bool>,
    ) -> Result<(Vec<String>, Scope), ConfigError> {
        if let Some(checkfn) = checkfn {
            if !lines.iter().all(|l| checkfn(l)) {
                return Err(ConfigError::NotFound);
            }
        }
        Ok((lines, scope))
    }
}

/// Suffix-aware domain-list match (spec.md §4.4): an entry matches
/// `domain` if it equals it case-insensitively, or if it is a
/// proper-subdomain suffix joined by `.`. Entries beginning with `.`
/// match only proper subdomains (never exact equality).
pub fn find_domain_in(list: &[String], domain: &str) -> bool {
    let domain_lc = domain.to_ascii_lowercase();
    for entry in list {
        let entry_lc = entry.to_ascii_lowercase();
        if let Some(suffix) = entry_lc.strip_prefix('.') {
            if domain_lc.ends_with(&format!(".{}", suffix)) {
                return true;
            }
        } else {
            if domain_lc == entry_lc || domain_lc.ends_with(&format!(".{}", entry_lc)) {
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn tmp_global() -> (tempdir::TempDir, ConfigStore) {
        let dir = tempdir::TempDir::new("smtp-config-test").unwrap();
        let store = ConfigStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn bare_key_is_one() {
        assert_eq!(match_setting_entry("spfpolicy", "spfpolicy"), Some(1));
    }

    #[test]
    fn key_equals_n_parses() {
        assert_eq!(match_setting_entry("spfpolicy=3", "spfpolicy"), Some(3));
    }

    #[test]
    fn key_equals_garbage_is_syntax_error() {
        assert_eq!(match_setting_entry("spfpolicy=abc", "spfpolicy"), Some(-1));
    }

    #[test]
    fn non_matching_key_is_none() {
        assert_eq!(match_setting_entry("other=3", "spfpolicy"), None);
    }

    #[test]
    fn get_setting_hard_zero_stops_cascade() {
        let (_dir, store) = tmp_global();
        let uc = UserConf {
            user_kv: Some(vec!["relayclient=-1".to_string()]),
            domain_kv: Some(vec!["relayclient=7".to_string()]),
            ..UserConf::default()
        };
        let (value, scope) = store.get_setting(&uc, "relayclient", true).unwrap().unwrap();
        assert_eq!(value, 0);
        assert_eq!(scope, Scope::User);
    }

    #[test]
    fn find_domain_in_matches_exact_and_subdomain() {
        let list = vec!["example.com".to_string(), ".example.org".to_string()];
        assert!(find_domain_in(&list, "example.com"));
        assert!(find_domain_in(&list, "mail.example.com"));
        assert!(!find_domain_in(&list, "example.org"));
        assert!(find_domain_in(&list, "mail.example.org"));
        assert!(!find_domain_in(&list, "notexample.com"));
    }

    #[test]
    fn get_file_falls_back_to_global() {
        let (dir, store) = tmp_global();
        let mut f = File::create(dir.path().join("me")).unwrap();
        writeln!(f, "mail.example.com").unwrap();
        let uc = UserConf::new();
        let (_file, scope) = store.get_file(&uc, "me", true).unwrap();
        assert_eq!(scope, Scope::Global);
    }

    #[test]
    fn get_file_not_found_without_global_fallback() {
        let (_dir, store) = tmp_global();
        let uc = UserConf::new();
        assert!(matches!(
            store.get_file(&uc, "nonexistent", false),
            Err(ConfigError::NotFound)
        ));
    }
}
