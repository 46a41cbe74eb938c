//! Virtual-user resolver (C5, spec.md §4.5): drives the vpopmail-compatible
//! `users/cdb` database plus the `.qmail-*` probe files that decide
//! catchall/bounce handling.
//!
//! Grounded on `original_source/qsmtpd/backends/user_vpopm/vpop.c`'s
//! `vget_assign`/`vauth_user` probe order; CDB record parsing uses the
//! `cdb` crate already pinned by the teacher's dependency set, directory
//! probing uses `openat::Dir` for close-on-exec handles (spec.md §5).

use std::io;
use std::path::Path;

use openat::Dir;
use thiserror::Error;

use crate::store::UserConf;

#[derive(Debug, Error)]
pub enum VpopError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("malformed users/cdb record for domain")]
    MalformedRecord,
}

/// Result codes of spec.md §4.5's `user_exists` algorithm. The numeric
/// values are the ones the algorithm's steps are phrased in terms of.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UserExistence {
    /// Step 8: `.qmail-default` content equals `vpopbounce` — reject as
    /// nonexistent.
    Bouncer,
    /// Step 4/5: a real per-user directory exists (or exists but isn't
    /// readable, which degrades gracefully rather than failing).
    Exists,
    /// Step 8: `.qmail-default` exists with different content — pass
    /// through as a catchall.
    CatchallPassthrough,
    /// Step 7: one of the `.qmail-<prefix>-default` forms matched.
    Catchall,
    /// Step 2: no `!<domain>-` record in the CDB.
    NonLocal,
}

impl UserExistence {
    pub fn code(self) -> u8 {
        match self {
            UserExistence::Bouncer => 0,
            UserExistence::Exists => 1,
            UserExistence::CatchallPassthrough => 2,
            UserExistence::Catchall => 4,
            UserExistence::NonLocal => 5,
        }
    }

    pub fn is_deliverable(self) -> bool {
        !matches!(self, UserExistence::Bouncer | UserExistence::NonLocal)
    }
}

struct DomainRecord {
    #[allow(dead_code)]
    realdomain: String,
    #[allow(dead_code)]
    uid: u32,
    #[allow(dead_code)]
    gid: u32,
    dir: String,
}

fn parse_domain_record(raw: &[u8]) -> Result<DomainRecord, VpopError> {
    let mut parts = raw.split(|&b| b == 0);
    let realdomain = parts.next().ok_or(VpopError::MalformedRecord)?;
    let uid = parts.next().ok_or(VpopError::MalformedRecord)?;
    let gid = parts.next().ok_or(VpopError::MalformedRecord)?;
    let dir = parts.next().ok_or(VpopError::MalformedRecord)?;
    let to_str = |b: &[u8]| -> Result<String, VpopError> {
        std::str::from_utf8(b)
            .map(|s| s.to_string())
            .map_err(|_| VpopError::MalformedRecord)
    };
    Ok(DomainRecord {
        realdomain: to_str(realdomain)?,
        uid: to_str(&uid)?.parse().map_err(|_| VpopError::MalformedRecord)?,
        gid: to_str(&gid)?.parse().map_err(|_| VpopError::MalformedRecord)?,
        dir: to_str(dir)?,
    })
}

/// Mail-directory convention: `.` in a localpart is rewritten to `:`
/// before any filesystem access (spec.md §4.5).
fn fs_local(local: &str) -> String {
    local.replace('.', ":")
}

/// Every `-`-delimited prefix of `local`, shortest to longest is not
/// needed — spec.md §4.5 step 6 probes `.qmail-<prefix>-default` for
/// every prefix, which in the reference implementation walks from the
/// full localpart down to its first component, most-specific first.
fn dash_prefixes(local: &str) -> Vec<&str> {
    let mut prefixes = Vec::new();
    let bytes = local.as_bytes();
    for (i, &b) in bytes.iter().enumerate().rev() {
        if b == b'-' {
            prefixes.push(&local[..i]);
        }
    }
    prefixes
}

fn file_exists(dir: &Dir, name: &str) -> Result<bool, VpopError> {
    match dir.metadata(name) {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn read_file(dir: &Dir, name: &str) -> Result<Vec<u8>, VpopError> {
    use std::io::Read;
    let mut f = dir.open_file(name)?;
    let mut buf = Vec::new();
    f.read_to_end(&mut buf)?;
    Ok(buf)
}

/// Implements spec.md §4.5's `user_exists(local, domain, uc_out)`.
/// `users_cdb` is the path to the `users/cdb` database; `vpopbounce` is
/// the configured bouncer marker string compared against
/// `.qmail-default`'s content in step 8.
pub fn user_exists(
    users_cdb: &Path,
    local: &str,
    domain: &str,
    vpopbounce: &str,
    uc_out: &mut UserConf,
) -> Result<UserExistence, VpopError> {
    // Step 1: reject localparts containing a path separator outright.
    if local.contains('/') {
        return Ok(UserExistence::NonLocal);
    }

    // Step 2: look up "!<domain>-" in the CDB.
    let cdb = cdb::CDB::open(users_cdb)?;
    let key = format!("!{}-", domain.to_ascii_lowercase());
    let record = match cdb.find(key.as_bytes()).next() {
        Some(raw) => parse_domain_record(&raw?)?,
        None => return Ok(UserExistence::NonLocal),
    };

    // Step 3: domainpath = dir + "/".
    let domain_dir = Dir::open(&record.dir)?;
    uc_out.domain_dir = Some(Dir::open(&record.dir)?);

    let local_fs = fs_local(local);

    // Step 4/5: probe the per-user directory.
    match domain_dir.sub_dir(&local_fs) {
        Ok(user_dir) => {
            uc_out.user_dir = Some(user_dir);
            return Ok(UserExistence::Exists);
        }
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            return Ok(UserExistence::Exists);
        }
        Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e.into()),
        _ => {}
    }

    // Step 6: probe .qmail-<local>, .qmail-<local>-default, then every
    // .qmail-<prefix>-default, finally .qmail-default.
    if file_exists(&domain_dir, &format!(".qmail-{}", local_fs))? {
        uc_out.user_dir = None;
        return Ok(UserExistence::Exists);
    }
    if file_exists(&domain_dir, &format!(".qmail-{}-default", local_fs))? {
        return Ok(UserExistence::Catchall);
    }
    for prefix in dash_prefixes(&local_fs) {
        if file_exists(&domain_dir, &format!(".qmail-{}-default", prefix))? {
            return Ok(UserExistence::Catchall);
        }
    }
    if file_exists(&domain_dir, ".qmail-default")? {
        let content = read_file(&domain_dir, ".qmail-default")?;
        let content = String::from_utf8_lossy(&content);
        if content.trim_end() == vpopbounce {
            return Ok(UserExistence::Bouncer);
        }
        return Ok(UserExistence::CatchallPassthrough);
    }

    Ok(UserExistence::NonLocal)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slash_in_local_rejects_without_touching_disk() {
        // Step 1 must short-circuit before any CDB/filesystem access, so
        // an obviously-bogus CDB path is fine here.
        let mut uc = UserConf::new();
        let result = user_exists(
            Path::new("/nonexistent/users.cdb"),
            "a/b",
            "example.com",
            "bounce-no-mailbox",
            &mut uc,
        )
        .unwrap();
        assert_eq!(result, UserExistence::NonLocal);
    }

    #[test]
    fn dash_prefixes_walks_from_most_specific() {
        assert_eq!(dash_prefixes("foo-bar-baz"), vec!["foo-bar", "foo"]);
        assert_eq!(dash_prefixes("plain"), Vec::<&str>::new());
    }

    #[test]
    fn fs_local_maps_dot_to_colon() {
        assert_eq!(fs_local("first.last"), "first:last");
    }
}
