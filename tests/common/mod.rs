//! In-memory collaborators for driving the engine against scripted peers

#![allow(dead_code)]

use newspeer::{ArticleEntry, ArticleStore, Daemon, Database, Header, OverviewLine};
use std::collections::{HashMap, HashSet};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio_rustls::rustls;

/// Article store backed by a shared map
#[derive(Default)]
pub struct MockStore {
    articles: Mutex<HashMap<String, Arc<Mutex<Vec<u8>>>>>,
    headers: Mutex<HashMap<String, Header>>,
}

struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl MockStore {
    /// Pre-load a raw article
    pub fn seed(&self, msgid: &str, raw: &[u8]) {
        self.articles
            .lock()
            .unwrap()
            .insert(msgid.to_string(), Arc::new(Mutex::new(raw.to_vec())));
    }

    /// Pre-load a parsed header for HEAD/XHDR serving
    pub fn seed_headers(&self, msgid: &str, header: Header) {
        self.headers
            .lock()
            .unwrap()
            .insert(msgid.to_string(), header);
    }

    /// Bytes currently stored for an article
    pub fn stored(&self, msgid: &str) -> Option<Vec<u8>> {
        self.articles
            .lock()
            .unwrap()
            .get(msgid)
            .map(|buf| buf.lock().unwrap().clone())
    }
}

impl ArticleStore for MockStore {
    fn has_article(&self, msgid: &str) -> bool {
        self.articles.lock().unwrap().contains_key(msgid)
    }

    fn open_message(&self, msgid: &str) -> io::Result<Vec<u8>> {
        self.stored(msgid)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
    }

    fn create_file(&self, msgid: &str) -> Option<Box<dyn Write + Send>> {
        let mut articles = self.articles.lock().unwrap();
        if articles.contains_key(msgid) {
            return None;
        }
        let buf = Arc::new(Mutex::new(Vec::new()));
        articles.insert(msgid.to_string(), buf.clone());
        Some(Box::new(SharedBuf(buf)))
    }

    fn process_message_body(
        &self,
        file: &mut (dyn Write + Send),
        _header: &Header,
        body: &[u8],
    ) -> io::Result<()> {
        file.write_all(body)
    }

    fn get_message_size(&self, msgid: &str) -> io::Result<u64> {
        self.stored(msgid)
            .map(|raw| raw.len() as u64)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
    }

    fn get_headers(&self, msgid: &str) -> Option<Header> {
        self.headers.lock().unwrap().get(msgid).cloned()
    }

    fn get_mime_header(&self, msgid: &str) -> Option<Header> {
        self.get_headers(msgid)
    }

    fn get_filename(&self, msgid: &str) -> PathBuf {
        PathBuf::from(format!(
            "/nonexistent/newspeer-test/{}",
            msgid.trim_matches(['<', '>'])
        ))
    }
}

/// Metadata database backed by sets and maps
#[derive(Default)]
pub struct MockDb {
    pub known: Mutex<HashSet<String>>,
    pub banned_articles: Mutex<HashMap<String, String>>,
    pub banned_groups: Mutex<HashSet<String>>,
    pub banned_pubkeys: Mutex<HashSet<String>>,
    pub banned_encips: Mutex<HashSet<String>>,
    pub expired: Mutex<HashSet<String>>,
    pub newsgroups: Mutex<HashSet<String>>,
    pub watermarks: Mutex<HashMap<String, (i64, i64)>>,
    pub counts: Mutex<HashMap<String, i64>>,
    pub numbering: Mutex<HashMap<(String, i64), String>>,
    pub overview: Mutex<HashMap<String, Vec<OverviewLine>>>,
    pub users: Mutex<HashMap<String, String>>,
    pub store_view: Mutex<HashSet<String>>,
}

impl MockDb {
    /// Register a newsgroup with water marks and a post count
    pub fn seed_group(&self, group: &str, first: i64, last: i64, count: i64) {
        self.newsgroups.lock().unwrap().insert(group.to_string());
        self.watermarks
            .lock()
            .unwrap()
            .insert(group.to_string(), (last, first));
        self.counts.lock().unwrap().insert(group.to_string(), count);
    }

    /// Map an article number to a message-id within a group
    pub fn seed_number(&self, group: &str, n: i64, msgid: &str) {
        self.numbering
            .lock()
            .unwrap()
            .insert((group.to_string(), n), msgid.to_string());
    }

    /// Reason an article was banned with, if any
    pub fn ban_reason(&self, msgid: &str) -> Option<String> {
        self.banned_articles.lock().unwrap().get(msgid).cloned()
    }
}

impl Database for MockDb {
    fn has_article(&self, msgid: &str) -> bool {
        self.known.lock().unwrap().contains(msgid)
    }
    fn has_article_local(&self, msgid: &str) -> bool {
        self.store_view.lock().unwrap().contains(msgid)
    }
    fn article_banned(&self, msgid: &str) -> bool {
        self.banned_articles.lock().unwrap().contains_key(msgid)
    }
    fn ban_article(&self, msgid: &str, reason: &str) -> io::Result<()> {
        self.banned_articles
            .lock()
            .unwrap()
            .insert(msgid.to_string(), reason.to_string());
        Ok(())
    }
    fn newsgroup_banned(&self, group: &str) -> bool {
        self.banned_groups.lock().unwrap().contains(group)
    }
    fn pubkey_is_banned(&self, pubkey: &str) -> bool {
        self.banned_pubkeys.lock().unwrap().contains(pubkey)
    }
    fn check_encip_banned(&self, encaddr: &str) -> io::Result<bool> {
        Ok(self.banned_encips.lock().unwrap().contains(encaddr))
    }
    fn get_enc_address(&self, addr: &str) -> io::Result<String> {
        Ok(format!("enc:{addr}"))
    }
    fn is_expired(&self, msgid: &str) -> bool {
        self.expired.lock().unwrap().contains(msgid)
    }
    fn has_newsgroup(&self, group: &str) -> bool {
        self.newsgroups.lock().unwrap().contains(group)
    }
    fn get_all_newsgroups(&self) -> Vec<String> {
        let mut groups: Vec<String> = self.newsgroups.lock().unwrap().iter().cloned().collect();
        groups.sort();
        groups
    }
    fn get_last_and_first_for_group(&self, group: &str) -> io::Result<(i64, i64)> {
        self.watermarks
            .lock()
            .unwrap()
            .get(group)
            .copied()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
    }
    fn count_all_articles_in_group(&self, group: &str) -> io::Result<i64> {
        Ok(self.counts.lock().unwrap().get(group).copied().unwrap_or(0))
    }
    fn count_posts_in_group(&self, group: &str, _since: i64) -> i64 {
        self.counts.lock().unwrap().get(group).copied().unwrap_or(0)
    }
    fn get_message_id_for_nntp_id(&self, group: &str, nntp_id: i64) -> io::Result<String> {
        // unknown numbers resolve to an empty id, not an error
        Ok(self
            .numbering
            .lock()
            .unwrap()
            .get(&(group.to_string(), nntp_id))
            .cloned()
            .unwrap_or_default())
    }
    fn get_nntp_id_for_message_id(&self, group: &str, msgid: &str) -> io::Result<i64> {
        let numbering = self.numbering.lock().unwrap();
        numbering
            .iter()
            .find(|((g, _), m)| g == group && m.as_str() == msgid)
            .map(|((_, n), _)| *n)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
    }
    fn get_nntp_posts_in_group(&self, group: &str) -> io::Result<Vec<OverviewLine>> {
        Ok(self
            .overview
            .lock()
            .unwrap()
            .get(group)
            .cloned()
            .unwrap_or_default())
    }
    fn check_nntp_user_exists(&self, username: &str) -> io::Result<bool> {
        Ok(self.users.lock().unwrap().contains_key(username))
    }
    fn check_nntp_login(&self, username: &str, password: &str) -> io::Result<bool> {
        Ok(self
            .users
            .lock()
            .unwrap()
            .get(username)
            .is_some_and(|p| p == password))
    }
}

/// Daemon wiring the mock store and database together
pub struct MockDaemon {
    pub store: MockStore,
    pub db: MockDb,
    pub infeed: Mutex<Vec<String>>,
    pub wanted: Mutex<Vec<ArticleEntry>>,
    pub allow_anon: bool,
    pub allow_anon_attachments: bool,
    pub allow_attachments: bool,
    pub size_limit: u64,
}

impl Default for MockDaemon {
    fn default() -> Self {
        Self {
            store: MockStore::default(),
            db: MockDb::default(),
            infeed: Mutex::new(Vec::new()),
            wanted: Mutex::new(Vec::new()),
            allow_anon: false,
            allow_anon_attachments: false,
            allow_attachments: true,
            size_limit: 1 << 20,
        }
    }
}

impl MockDaemon {
    pub fn new() -> Self {
        Self::default()
    }

    /// Message-ids handed to load_from_infeed, in order
    pub fn infeed_calls(&self) -> Vec<String> {
        self.infeed.lock().unwrap().clone()
    }

    /// Entries handed to ask_for_article, in order
    pub fn wanted_entries(&self) -> Vec<ArticleEntry> {
        self.wanted.lock().unwrap().clone()
    }
}

impl Daemon for MockDaemon {
    fn store(&self) -> &dyn ArticleStore {
        &self.store
    }
    fn database(&self) -> &dyn Database {
        &self.db
    }
    fn load_from_infeed(&self, msgid: &str) {
        self.infeed.lock().unwrap().push(msgid.to_string());
    }
    fn ask_for_article(&self, entry: ArticleEntry) {
        self.wanted.lock().unwrap().push(entry);
    }
    fn message_size_limit_for(&self, _group: &str) -> u64 {
        self.size_limit
    }
    fn can_tls(&self) -> bool {
        false
    }
    fn tls_config_for(&self, _host: &str) -> Option<Arc<rustls::ClientConfig>> {
        None
    }
    fn our_tls_config(&self) -> Option<Arc<rustls::ServerConfig>> {
        None
    }
    fn allow_anon(&self) -> bool {
        self.allow_anon
    }
    fn allow_anon_attachments(&self) -> bool {
        self.allow_anon_attachments
    }
    fn allow_attachments(&self) -> bool {
        self.allow_attachments
    }
    fn instance_name(&self) -> &str {
        "newspeer.test"
    }
    fn verify_frontend_sig(&self, _pubkey: &str, _sig: &str, _msgid: &str) -> bool {
        false
    }
}

/// Wait until `cond` holds or a short deadline passes
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    }
    panic!("condition not reached in time");
}
