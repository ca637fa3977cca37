//! Collaborator interfaces the peering core consumes
//!
//! The article store, the metadata database and the daemon itself live
//! outside this crate; the engine drives them through these narrow,
//! object-safe traits. Both are assumed internally thread-safe.

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_rustls::rustls;

/// A message-id together with the newsgroup it was seen in
///
/// Queued by the daemon when an article references a root we do not hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArticleEntry {
    /// The wanted article
    pub msgid: String,
    /// Newsgroup the want originated from
    pub newsgroup: String,
}

/// One XOVER line worth of overview data
#[derive(Debug, Clone, Default)]
pub struct OverviewLine {
    /// Article number within the group
    pub nntp_id: i64,
    /// Subject header
    pub subject: String,
    /// Poster display name
    pub name: String,
    /// Frontend the poster used
    pub frontend: String,
    /// Date header
    pub date: String,
    /// Message-ID
    pub msgid: String,
    /// First References value, empty for roots
    pub reference: String,
}

/// The on-disk article store
pub trait ArticleStore: Send + Sync {
    /// Whether the raw article file exists
    fn has_article(&self, msgid: &str) -> bool;

    /// Load the raw article (headers and body, LF line endings)
    fn open_message(&self, msgid: &str) -> io::Result<Vec<u8>>;

    /// Open a file to store a new article
    ///
    /// Returns `None` when another connection is already writing the same
    /// message-id; that is the deduplication signal and the caller
    /// discards its copy.
    fn create_file(&self, msgid: &str) -> Option<Box<dyn Write + Send>>;

    /// Unpack attachments and append the body to the opened file
    fn process_message_body(
        &self,
        file: &mut (dyn Write + Send),
        header: &crate::headers::Header,
        body: &[u8],
    ) -> io::Result<()>;

    /// Size in bytes of the stored article
    fn get_message_size(&self, msgid: &str) -> io::Result<u64>;

    /// Parsed header block of the stored article
    fn get_headers(&self, msgid: &str) -> Option<crate::headers::Header>;

    /// Same as [`get_headers`](Self::get_headers), kept separate because
    /// some stores cache the MIME view independently
    fn get_mime_header(&self, msgid: &str) -> Option<crate::headers::Header>;

    /// Path of the article file, for cleanup after a failed ingest
    fn get_filename(&self, msgid: &str) -> PathBuf;
}

/// The metadata database
pub trait Database: Send + Sync {
    /// Article is known, possibly expired
    fn has_article(&self, msgid: &str) -> bool;

    /// Article is known and present locally
    fn has_article_local(&self, msgid: &str) -> bool;

    /// Message-id is on the article ban list
    fn article_banned(&self, msgid: &str) -> bool;

    /// Add a message-id to the article ban list
    fn ban_article(&self, msgid: &str, reason: &str) -> io::Result<()>;

    /// Newsgroup is on the ban list
    fn newsgroup_banned(&self, group: &str) -> bool;

    /// Poster or frontend pubkey is banned
    fn pubkey_is_banned(&self, pubkey: &str) -> bool;

    /// Encrypted poster address is banned
    fn check_encip_banned(&self, encaddr: &str) -> io::Result<bool>;

    /// Encrypted form of a remote IP, creating the mapping if needed
    fn get_enc_address(&self, addr: &str) -> io::Result<String>;

    /// Article row exists but the content has expired
    fn is_expired(&self, msgid: &str) -> bool;

    /// Newsgroup exists locally
    fn has_newsgroup(&self, group: &str) -> bool;

    /// Every newsgroup we carry
    fn get_all_newsgroups(&self) -> Vec<String>;

    /// High and low water marks for a group, `(last, first)`
    fn get_last_and_first_for_group(&self, group: &str) -> io::Result<(i64, i64)>;

    /// Count of all articles in a group
    fn count_all_articles_in_group(&self, group: &str) -> io::Result<i64>;

    /// Count of posts in a group since a timestamp (0 for all)
    fn count_posts_in_group(&self, group: &str, since: i64) -> i64;

    /// Message-id for an article number within a group, empty if unknown
    fn get_message_id_for_nntp_id(&self, group: &str, nntp_id: i64) -> io::Result<String>;

    /// Article number within a group for a message-id
    fn get_nntp_id_for_message_id(&self, group: &str, msgid: &str) -> io::Result<i64>;

    /// Overview data for every post in a group
    fn get_nntp_posts_in_group(&self, group: &str) -> io::Result<Vec<OverviewLine>>;

    /// An NNTP login exists for this user
    fn check_nntp_user_exists(&self, username: &str) -> io::Result<bool>;

    /// The password matches the stored NNTP login
    fn check_nntp_login(&self, username: &str, password: &str) -> io::Result<bool>;
}

/// The daemon that owns this connection
pub trait Daemon: Send + Sync {
    /// The article store
    fn store(&self) -> &dyn ArticleStore;

    /// The metadata database
    fn database(&self) -> &dyn Database;

    /// Register a freshly stored article for processing and federation
    fn load_from_infeed(&self, msgid: &str);

    /// Queue a fetch for an article we learned about but do not hold
    fn ask_for_article(&self, entry: ArticleEntry);

    /// Per-newsgroup article size limit in bytes
    fn message_size_limit_for(&self, group: &str) -> u64;

    /// TLS is configured at all
    fn can_tls(&self) -> bool;

    /// Client-side TLS config for dialing `host`
    fn tls_config_for(&self, host: &str) -> Option<Arc<rustls::ClientConfig>>;

    /// Server-side TLS config for inbound STARTTLS
    fn our_tls_config(&self) -> Option<Arc<rustls::ServerConfig>>;

    /// Accept articles from anonymous posters
    fn allow_anon(&self) -> bool;

    /// Accept attachments from anonymous posters
    fn allow_anon_attachments(&self) -> bool;

    /// Accept attachments at all
    fn allow_attachments(&self) -> bool;

    /// Our instance name, used in Path stamping and synthesized ids
    fn instance_name(&self) -> &str;

    /// An `X-Frontend-Pubkey` value is well-formed and known
    fn frontend_pubkey_is_valid(&self, pubkey: &str) -> bool {
        crate::validation::valid_frontend_pubkey(pubkey)
    }

    /// Verify a frontend signature over a message-id
    fn verify_frontend_sig(&self, pubkey: &str, sig: &str, msgid: &str) -> bool;
}

impl crate::config::ModerationFlags {
    /// Capture the daemon-wide moderation switches for one connection
    ///
    /// Copied once at connection setup so a reconfiguration cannot change
    /// an in-progress admission decision.
    pub fn capture(daemon: &dyn Daemon) -> Self {
        Self {
            allow_anon: daemon.allow_anon(),
            allow_anon_attachments: daemon.allow_anon_attachments(),
            allow_attachments: daemon.allow_attachments(),
            ..Self::default()
        }
    }
}
