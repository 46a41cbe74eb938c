//! C12 — SMTP-AUTH backend invocation: the checkpassword-family subprocess
//! protocol spec.md §4.12 describes.
//!
//! Grounded on `original_source/qsmtpd/backends/auth_chkpw/qsauth_backend_cp.c`
//! for the wire contract (fd 3 password pipe, `user\0password\0[resp]\0`,
//! exit-code mapping); fd plumbing reuses `smtp-queue-fs::pipe_move` per
//! spec.md §9's "use it uniformly for queue and auth children". Per the
//! §9 open issue, the list-argv variant of `qsauth_backend_cp.c` is
//! authoritative: [`AuthBackend::argv`] is `Vec<OsString>`, not a single
//! path.

use std::ffi::OsString;
use std::io::{self, Write};
use std::os::unix::io::FromRawFd;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};

use smtp_queue_fs::{close_retry, open_pipe, pipe_move};
use thiserror::Error;

pub const AUTH_BACKEND_FD: i32 = 3;

/// The checker program and its fixed arguments (`auth_check`/`auth_sub` in
/// spec.md §4.12's naming). Carried as a full argv vector rather than a
/// single path: the source's "list" variant is authoritative (spec.md §9).
#[derive(Clone, Debug)]
pub struct AuthBackend {
    pub argv: Vec<OsString>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AuthOutcome {
    Authenticated,
    NotAuthenticated,
    /// Signal death or otherwise abnormal exit: surfaced to the client as
    /// `454 tempnoauth` (spec.md §4.12).
    TemporaryFailure,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("empty backend argv")]
    EmptyArgv,
}

impl AuthBackend {
    pub fn new(argv: Vec<OsString>) -> AuthBackend {
        AuthBackend { argv }
    }

    /// Invokes the backend: forks, wires the read end of a fresh pipe to
    /// child fd 3, writes `user\0password\0[resp]\0` (the CRAM-MD5
    /// response is present only when that mechanism was used), wipes the
    /// in-process password buffer, closes the pipe, and waits.
    pub fn check(
        &self,
        user: &str,
        mut password: Vec<u8>,
        cram_response: Option<&[u8]>,
    ) -> Result<AuthOutcome, AuthError> {
        let (program, args) = self
            .argv
            .split_first()
            .ok_or(AuthError::EmptyArgv)?;

        let creds = open_pipe().map_err(|_| io::Error::new(io::ErrorKind::Other, "pipe"))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit());

        // SAFETY: async-signal-safe close/dup2 only, matching the
        // `pipe_move` contract.
        unsafe {
            let creds = creds;
            cmd.pre_exec(move || {
                pipe_move(creds.read_end, creds.write_end, AUTH_BACKEND_FD)
                    .map_err(|_| io::Error::new(io::ErrorKind::Other, "dup2 auth pipe"))
            });
        }

        let mut child = cmd.spawn()?;
        close_retry(creds.read_end).ok();

        // Write the credential record, then wipe our copy of the password
        // before anything else can observe it (spec.md §4.12 "the
        // password buffer in the child is wiped before exec" -- done here
        // for the parent's copy too, since Rust owns it on this side of
        // the fork).
        let write_result = (|| -> io::Result<()> {
            let mut pipe = unsafe { std::fs::File::from_raw_fd(creds.write_end) };
            pipe.write_all(user.as_bytes())?;
            pipe.write_all(b"\0")?;
            pipe.write_all(&password)?;
            pipe.write_all(b"\0")?;
            if let Some(resp) = cram_response {
                pipe.write_all(resp)?;
                pipe.write_all(b"\0")?;
            }
            Ok(())
        })();
        for b in password.iter_mut() {
            *b = 0;
        }
        write_result?;

        let status = child.wait()?;
        Ok(match status.code() {
            Some(0) => AuthOutcome::Authenticated,
            Some(_) => AuthOutcome::NotAuthenticated,
            None => AuthOutcome::TemporaryFailure,
        })
    }
}

/// Decodes the `authzid\0authcid\0password` (PLAIN, RFC 4616) triple into
/// a `(user, password)` pair. Returns `None` on malformed input (caller
/// replies 535).
pub fn decode_auth_plain(decoded: &[u8]) -> Option<(String, Vec<u8>)> {
    let mut parts = decoded.splitn(3, |&b| b == 0);
    let _authzid = parts.next()?;
    let authcid = parts.next()?;
    let passwd = parts.next()?;
    Some((
        String::from_utf8(authcid.to_vec()).ok()?,
        passwd.to_vec(),
    ))
}

/// Decodes one base64-wrapped LOGIN prompt response into a UTF-8 string
/// (the username and password are sent as two separate prompts, each
/// just a bare base64 string rather than a NUL-delimited record).
pub fn decode_login_field(decoded: &[u8]) -> Option<String> {
    String::from_utf8(decoded.to_vec()).ok()
}

/// Generates a CRAM-MD5 challenge (RFC 2195): an angle-bracketed
/// `<random-digits.timestamp@hostname>` string, the form the client is
/// expected to HMAC-MD5 against its password and echo back alongside its
/// username.
pub fn cram_md5_challenge(hostname: &str, nonce: u64, timestamp: u64) -> Vec<u8> {
    format!("<{}.{}@{}>", nonce, timestamp, hostname).into_bytes()
}

/// Parses a decoded CRAM-MD5 response line (`user hex-digest`) into the
/// username and the raw response bytes [`AuthBackend::check`] forwards to
/// the backend as `cram_response` (the backend holds the password and
/// re-derives the digest itself; this process never sees the plaintext
/// password in the CRAM-MD5 path).
pub fn decode_cram_response(decoded: &[u8]) -> Option<(String, Vec<u8>)> {
    let text = std::str::from_utf8(decoded).ok()?;
    let mut parts = text.rsplitn(2, ' ');
    let digest = parts.next()?;
    let user = parts.next()?;
    if user.is_empty() || digest.is_empty() {
        return None;
    }
    Some((user.to_string(), digest.as_bytes().to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_decodes_user_and_password() {
        let wire = b"\0alice\0hunter2";
        let (user, pass) = decode_auth_plain(wire).unwrap();
        assert_eq!(user, "alice");
        assert_eq!(pass, b"hunter2");
    }

    #[test]
    fn plain_rejects_missing_fields() {
        assert!(decode_auth_plain(b"\0alice").is_none());
    }

    #[test]
    fn login_field_decodes_plain_utf8() {
        assert_eq!(decode_login_field(b"alice").unwrap(), "alice");
    }

    #[test]
    fn cram_response_splits_user_and_digest() {
        let (user, digest) = decode_cram_response(b"alice 0123456789abcdef").unwrap();
        assert_eq!(user, "alice");
        assert_eq!(digest, b"0123456789abcdef");
    }

    #[test]
    fn cram_response_rejects_missing_space() {
        assert!(decode_cram_response(b"alice").is_none());
    }

    #[test]
    fn cram_challenge_is_angle_bracketed() {
        let c = cram_md5_challenge("mail.example.com", 42, 1000);
        let s = std::str::from_utf8(&c).unwrap();
        assert!(s.starts_with('<') && s.ends_with('>'));
        assert!(s.contains("mail.example.com"));
    }
}
