#![doc = include_str!("../README.md")]

/// Article admission control
pub mod admission;
mod capabilities;
/// CRLF line framing and dot-stuffed payloads
pub mod codec;
/// Per-feed configuration and federation policy
pub mod config;
/// Connection state and supervisor
pub mod conn;
/// Collaborator interfaces (store, database, daemon)
pub mod daemon;
mod error;
/// MIME header block parsing
pub mod headers;
mod ingest;
/// Per-connection offer bookkeeping
pub mod pending;
/// READER-mode fetching and scraping
pub mod reader;
mod response;
mod server;
/// STREAMING-mode sender and reply handling
pub mod stream;
/// STARTTLS upgrades
pub mod tls;
mod util;
/// Message-id and newsgroup predicates
pub mod validation;

pub use admission::{check_article, check_article_no_auth, Verdict};
pub use capabilities::{Capabilities, RemoteCapabilities};
pub use codec::{framed, BoxConn, NntpReader, NntpWriter, PeerReader, PeerWriter};
pub use config::{FeedConfig, FeedPolicy, ModerationFlags, PolicyRule, PreferredMode};
pub use conn::{
    dial, run_inbound, run_outbound, ConnMode, ConnectionStatus, PeerConnection, SyncEvent,
    OFFER_QUEUE_DEPTH,
};
pub use daemon::{ArticleEntry, ArticleStore, Daemon, Database, OverviewLine};
pub use error::{NntpError, Result};
pub use headers::{read_header, Header};
pub use pending::{OfferRecord, OfferState, PendingTable};
pub use response::{codes, parse_reply_line};
pub use tls::{accept_starttls, initiate_starttls, webpki_client_config, TlsHandshakeInfo};
pub use validation::{valid_message_id, valid_newsgroup, DUMMY_ARTICLE};
