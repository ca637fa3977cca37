//! Article admission control
//!
//! Decides, from a parsed MIME header and the connection's auth state,
//! whether an offered article is taken, rejected, or rejected with a ban.
//! The decision is a pure function of the header, the connection flags and
//! the collaborator predicates: the first matching rule wins, and nothing
//! here mutates any state (the caller bans, discards, or ingests).

use crate::config::{FeedPolicy, ModerationFlags};
use crate::daemon::Daemon;
use crate::headers::Header;
use crate::validation::{valid_message_id, valid_newsgroup};

/// Outcome of an admission check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    /// Rejection reason; `None` means the article is accepted
    pub reason: Option<String>,
    /// The message-id should also go on the ban list
    pub ban: bool,
}

impl Verdict {
    fn accept() -> Self {
        Self {
            reason: None,
            ban: false,
        }
    }

    fn reject(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ban: false,
        }
    }

    fn ban(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ban: true,
        }
    }

    /// Whether the article passed
    pub fn is_accept(&self) -> bool {
        self.reason.is_none()
    }
}

/// Full admission check, including the authentication gate
pub fn check_article(
    header: &Header,
    authenticated: bool,
    policy: Option<&FeedPolicy>,
    flags: &ModerationFlags,
    daemon: &dyn Daemon,
) -> Verdict {
    if !authenticated {
        return Verdict::reject("not authenticated");
    }
    check_article_no_auth(header, policy, flags, daemon)
}

/// Admission check without the authentication gate
///
/// Used on READER-mode fetches, where the article comes from a server we
/// chose to ask rather than a peer pushing at us.
pub fn check_article_no_auth(
    header: &Header,
    policy: Option<&FeedPolicy>,
    flags: &ModerationFlags,
    daemon: &dyn Daemon,
) -> Verdict {
    let store = daemon.store();
    let database = daemon.database();

    let newsgroup = header.value("Newsgroups");
    let reference = header.value("References");
    let msgid = header.message_id();
    let encaddr = header.value("X-Encrypted-Ip");
    let tor_poster = header.value("X-Tor-Poster");
    let i2p_addr = header.value("X-I2p-Desthash");
    let content_type = header.value("Content-Type");
    let has_attachment = content_type.starts_with("multipart/mixed");
    let pubkey = header.value("X-Pubkey-Ed25519");
    let is_signed = !pubkey.is_empty();
    let is_ctl = newsgroup == "ctl" && is_signed;
    // Anonymous means no origin marker of any kind
    let anon_poster = encaddr.is_empty() && tor_poster.is_empty() && i2p_addr.is_empty();

    let frontend_pubkey = header.value("X-Frontend-Pubkey");
    let frontend_sig = header.value("X-Frontend-Signature");

    if daemon.frontend_pubkey_is_valid(frontend_pubkey) {
        if database.pubkey_is_banned(frontend_pubkey) {
            return Verdict::ban("server's pubkey is banned");
        }
        if !daemon.verify_frontend_sig(frontend_pubkey, frontend_sig, msgid) {
            return Verdict::ban("invalid frontend signature");
        }
    } else if !frontend_pubkey.is_empty() {
        return Verdict::ban(format!("invalid server public key: {frontend_pubkey}"));
    }

    if !valid_newsgroup(newsgroup) {
        return Verdict::ban(format!("invalid newsgroup: {newsgroup}"));
    }
    if database.newsgroup_banned(newsgroup) {
        return Verdict::ban("newsgroup banned");
    }
    if is_signed && database.pubkey_is_banned(pubkey) {
        return Verdict::ban("poster's pubkey is banned");
    }
    if let Some(policy) = policy {
        if !policy.allows_newsgroup(newsgroup) {
            return Verdict::ban("newsgroup not allowed by feed policy");
        }
    }
    if bad_msgid_or_reference(msgid, reference, flags.legacy_msgid_rule) {
        return Verdict::ban(format!(
            "invalid reference or message id is '{msgid}' reference is '{reference}'"
        ));
    }
    if store.has_article(msgid) {
        return Verdict::reject("we have this article locally");
    }
    if database.article_banned(msgid) {
        return Verdict::ban("article banned");
    }
    if !reference.is_empty() && database.article_banned(reference) {
        return Verdict::ban("thread banned");
    }
    if database.has_article(msgid) {
        // known but expired row: too old to take again
        return Verdict::reject("we have this article already");
    }
    if is_ctl {
        return Verdict::accept();
    }
    if anon_poster {
        if !flags.allow_anon {
            return Verdict::ban("no anon posts allowed");
        }
        if has_attachment {
            if !flags.allow_anon_attachments {
                return Verdict::ban("no anon attachments");
            }
            if !flags.allow_attachments {
                return Verdict::ban("no attachments allowed");
            }
        }
        return Verdict::accept();
    }
    if !encaddr.is_empty() {
        if let Ok(true) = database.check_encip_banned(encaddr) {
            return Verdict::reject("poster remote address is banned");
        }
    }
    if !flags.allow_attachments && newsgroup != "ctl" {
        if is_signed {
            // a signed post may carry attachments we cannot see yet
            return Verdict::ban("disallow signed posts because no attachments allowed");
        }
        if has_attachment {
            return Verdict::ban("attachments of any kind not allowed");
        }
    }
    Verdict::accept()
}

/// The message-id/reference syntax gate
///
/// The historical predicate is kept verbatim behind `legacy`: it accepts
/// an invalid message-id whenever the References value is itself invalid
/// (the negation covers the disjunction, almost certainly a transcription
/// slip in the original). `legacy = false` selects the repaired predicate
/// that rejects when either side is invalid.
fn bad_msgid_or_reference(msgid: &str, reference: &str, legacy: bool) -> bool {
    if legacy {
        !(valid_message_id(msgid) || (!reference.is_empty() && !valid_message_id(reference)))
    } else {
        !valid_message_id(msgid) || (!reference.is_empty() && !valid_message_id(reference))
    }
}
