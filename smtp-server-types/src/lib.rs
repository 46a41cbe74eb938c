//! Shared session/policy types threaded through Qsmtpd's C6 filter pipeline
//! and C7 state machine, so that `smtp-server` doesn't have to own both the
//! wire grammar (`smtp-message`) and the policy vocabulary by itself.
//!
//! Grounded on `smtp-server-types/src/lib.rs`'s `Decision`/`MailMetadata`/
//! `ConnectionMetadata` (kept, generalized from "one config hook's verdict"
//! to the multi-valued `FilterResult` of spec.md §4.6) and on spec.md §3's
//! `Xmit` data model.

use std::net::IpAddr;

use smtp_message::{Email, Hostname, Reply};

pub mod reply;

bitflags::bitflags! {
    /// ESMTP extensions as advertised by Qsmtpd's own EHLO response.
    /// Deliberately numbered independently from `smtp_client::Extension`
    /// (spec.md §9 open issue: the source keeps the two sides' bit
    /// assignments distinct and this port preserves that distinction).
    pub struct Extension: u16 {
        const SIZE         = 0b0000_0001;
        const PIPELINING   = 0b0000_0010;
        const STARTTLS     = 0b0000_0100;
        const EIGHTBITMIME = 0b0000_1000;
        const AUTH         = 0b0001_0000;
        const CHUNKING     = 0b0010_0000;
    }
}

/// How a client's HELO/EHLO argument classifies against the server's own
/// identity (spec.md §3 `Xmit`).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HeloClassification {
    MatchesLocalName,
    MatchesLocalIp,
    LiteralMatchesIpMissingBrackets,
    SyntacticallyInvalid,
    Plain,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BodyType {
    SevenBit,
    EightBitMime,
}

/// One recipient on the in-flight transaction (spec.md §3 `Recipient`).
#[derive(Clone, Debug)]
pub struct Recipient {
    pub mailbox: Email,
    pub accepted: bool,
}

/// Per-connection transmission state (spec.md §3 `Xmit`). Bundled
/// explicitly and threaded through handlers, rather than kept as the
/// process-globals the C ancestor uses (spec.md §9 "Global mutable
/// state").
#[derive(Clone, Debug)]
pub struct Xmit {
    pub esmtp: bool,
    pub remote_ip: IpAddr,
    pub remote_host: Option<String>,
    pub helo: Option<Hostname>,
    pub helo_classification: Option<HeloClassification>,
    pub announced_size: Option<u64>,
    pub body_type: Option<BodyType>,
    pub auth_identity: Option<String>,
    pub tls_client_identity: Option<String>,
    pub spf_result: Option<String>,
    pub from_mx: Vec<IpAddr>,
    pub spacebug: bool,
    pub mail_from: Option<Email>,
    pub recipients: Vec<Recipient>,
    pub good_recipients: usize,
    pub bad_bounce: bool,
    pub this_bytes: u64,
    pub is_encrypted: bool,
    /// Set by the `check2822` filter (spec.md §4.6): never itself a
    /// rejection, it only toggles whether the body scanner applies
    /// strict RFC 2822 header validation during `DATA`.
    pub strict_rfc2822: bool,
}

impl Xmit {
    pub fn new(remote_ip: IpAddr) -> Xmit {
        Xmit {
            esmtp: false,
            remote_ip,
            remote_host: None,
            helo: None,
            helo_classification: None,
            announced_size: None,
            body_type: None,
            auth_identity: None,
            tls_client_identity: None,
            spf_result: None,
            from_mx: Vec::new(),
            spacebug: false,
            mail_from: None,
            recipients: Vec::new(),
            good_recipients: 0,
            bad_bounce: false,
            this_bytes: 0,
            is_encrypted: false,
            strict_rfc2822: false,
        }
    }

    /// Resets the per-transaction envelope fields on `RSET`, successful
    /// `DATA`, or connection end, while keeping HELO/EHLO and
    /// authentication state intact (spec.md §3 lifecycle note, §8
    /// invariant "after any RSET the per-transaction fields ... equal
    /// their post-HELO defaults").
    pub fn reset_transaction(&mut self) {
        self.spf_result = None;
        self.from_mx.clear();
        self.spacebug = false;
        self.mail_from = None;
        self.recipients.clear();
        self.good_recipients = 0;
        self.bad_bounce = false;
        self.this_bytes = 0;
        self.announced_size = None;
        self.body_type = None;
    }

    pub const MAX_RECIPIENTS: usize = 500;
}

/// The outcome of running one filter in the C6 pipeline over one
/// recipient (spec.md §4.6).
#[derive(Debug)]
pub enum FilterResult {
    Passed,
    Whitelisted,
    DeniedWithMessage(Reply),
    DeniedUnspecific,
    DeniedNoUser,
    DeniedTemporary,
    Error,
}

/// Final, driven-to-completion verdict of the filter pipeline for one
/// recipient.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PipelineVerdict {
    Accept,
    RejectPermanentUnspecific,
    RejectPermanentNoSuchUser,
    RejectTemporary,
}

/// Drives the filter pipeline per spec.md §4.6's execution rule: keep
/// going while the running result is `Passed` or `DeniedTemporary`;
/// `Whitelisted` short-circuits to accept; any other denial stops
/// immediately.
pub fn drive_pipeline(
    results: impl IntoIterator<Item = FilterResult>,
    fail_hard_on_temp: bool,
    nonexist_on_block: bool,
) -> (PipelineVerdict, Option<Reply>) {
    let mut temp = false;
    let mut had_error = false;
    let message: Option<Reply> = None;

    for result in results {
        match result {
            FilterResult::Passed => continue,
            FilterResult::Whitelisted => return (PipelineVerdict::Accept, None),
            FilterResult::DeniedWithMessage(reply) => {
                return (PipelineVerdict::RejectPermanentUnspecific, Some(reply))
            }
            FilterResult::DeniedUnspecific => {
                return (PipelineVerdict::RejectPermanentUnspecific, None)
            }
            FilterResult::DeniedNoUser => {
                return (PipelineVerdict::RejectPermanentNoSuchUser, None)
            }
            FilterResult::DeniedTemporary => {
                temp = true;
                continue;
            }
            FilterResult::Error => {
                had_error = true;
                temp = true;
                continue;
            }
        }
    }

    if temp || had_error {
        if fail_hard_on_temp {
            let verdict = if nonexist_on_block {
                PipelineVerdict::RejectPermanentNoSuchUser
            } else {
                PipelineVerdict::RejectPermanentUnspecific
            };
            return (verdict, message);
        }
        return (PipelineVerdict::RejectTemporary, message);
    }

    (PipelineVerdict::Accept, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitelisted_short_circuits() {
        let (verdict, _) = drive_pipeline(
            vec![FilterResult::DeniedTemporary, FilterResult::Whitelisted],
            false,
            false,
        );
        assert_eq!(verdict, PipelineVerdict::Accept);
    }

    #[test]
    fn hard_denial_stops_immediately() {
        let (verdict, _) = drive_pipeline(
            vec![FilterResult::DeniedNoUser, FilterResult::Whitelisted],
            false,
            false,
        );
        assert_eq!(verdict, PipelineVerdict::RejectPermanentNoSuchUser);
    }

    #[test]
    fn temp_denial_upgrades_with_fail_hard_on_temp() {
        let (verdict, _) = drive_pipeline(vec![FilterResult::DeniedTemporary], true, false);
        assert_eq!(verdict, PipelineVerdict::RejectPermanentUnspecific);
    }

    #[test]
    fn temp_upgraded_then_mapped_to_no_user() {
        let (verdict, _) = drive_pipeline(vec![FilterResult::DeniedTemporary], true, true);
        assert_eq!(verdict, PipelineVerdict::RejectPermanentNoSuchUser);
    }

    #[test]
    fn plain_temp_denial_stays_temporary_without_fail_hard() {
        let (verdict, _) = drive_pipeline(vec![FilterResult::DeniedTemporary], false, false);
        assert_eq!(verdict, PipelineVerdict::RejectTemporary);
    }

    #[test]
    fn reset_transaction_clears_envelope_but_keeps_helo() {
        let mut x = Xmit::new("127.0.0.1".parse().unwrap());
        x.helo = Some(Hostname::Domain("client.example".into()));
        x.mail_from = Some(Email {
            localpart: smtp_message::Localpart("a".into()),
            domain: Hostname::Domain("b".into()),
        });
        x.bad_bounce = true;
        x.reset_transaction();
        assert!(x.mail_from.is_none());
        assert!(!x.bad_bounce);
        assert!(x.helo.is_some());
    }
}
