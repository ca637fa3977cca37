//! Per-connection state and the connection supervisor
//!
//! A [`PeerConnection`] carries the identity, negotiated mode, auth state,
//! offer channels and pending table for one peer link. The supervisor
//! entry points [`run_outbound`] and [`run_inbound`] own the transport:
//! they run the handshake, pick a mode, and then drive the right engine.
//!
//! Task topology in STREAM mode: one reader task consuming lines off the
//! transport and one sender task (the streaming engine) consuming the
//! offer channels. The writer sits behind a mutex and every logical
//! message is written under a single hold, so the two tasks never
//! interleave bytes.

use crate::capabilities::{Capabilities, RemoteCapabilities};
use crate::codec::{framed, unframe, BoxConn, PeerReader, PeerWriter};
use crate::config::{FeedConfig, FeedPolicy, ModerationFlags, PreferredMode};
use crate::daemon::Daemon;
use crate::error::{NntpError, Result};
use crate::pending::{OfferState, PendingTable};
use crate::reader;
use crate::response::{codes, parse_reply_line, split_coded_line};
use crate::server::{self, LoopAction};
use crate::stream;
use crate::tls::{self, TlsHandshakeInfo};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Depth of the per-connection offer channels
///
/// This is the backpressure surface: once a channel fills, the daemon's
/// feed dispatcher blocks in `offer_stream` until the peer drains.
pub const OFFER_QUEUE_DEPTH: usize = 1024;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(120);
const RECV_BUFFER_SIZE: usize = 1024 * 1024;
const SEND_BUFFER_SIZE: usize = 1024 * 1024;

/// Writer shared between the dispatch loop and a streaming sender
pub type SharedWriter = Arc<Mutex<PeerWriter>>;

/// Negotiated connection mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnMode {
    /// ARTICLE fetching and scraping
    Reader,
    /// CHECK/TAKETHIS streaming
    Stream,
}

impl ConnMode {
    /// Wire name of the mode
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnMode::Reader => "READER",
            ConnMode::Stream => "STREAM",
        }
    }
}

/// An offer travelling down the check/takethis channels
#[derive(Debug, Clone)]
pub struct SyncEvent {
    /// The offered article
    pub msgid: String,
    /// Its stored size in bytes, 0 if unknown
    pub size: u64,
}

#[derive(Default)]
struct ConnState {
    mode: Option<ConnMode>,
    group: Option<String>,
    selected_article: Option<String>,
    authenticated: bool,
    username: String,
    tls: Option<TlsHandshakeInfo>,
}

/// Point-in-time view of a connection, for status reporting
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ConnectionStatus {
    /// Connection name
    pub name: String,
    /// Negotiated mode, if any
    pub mode: Option<&'static str>,
    /// Authenticated flag
    pub authenticated: bool,
    /// Selected newsgroup
    pub group: Option<String>,
    /// Pending backlog in bytes
    pub backlog: u64,
    /// Live offers and their states
    pub pending: Vec<PendingOffer>,
}

/// One live offer in a status snapshot
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PendingOffer {
    /// Offered message-id
    pub msgid: String,
    /// Its lifecycle state
    pub state: OfferState,
}

/// State for one peer connection
pub struct PeerConnection {
    /// Name of the feed this connection belongs to
    pub feedname: String,
    /// Name of this connection, used in logs
    pub name: String,
    /// Hostname used for TLS
    pub hostname: String,
    /// Remote address, if known
    pub addr: Option<SocketAddr>,
    pub(crate) policy: Option<FeedPolicy>,
    pub(crate) flags: ModerationFlags,
    pub(crate) pending: PendingTable,
    state: StdMutex<ConnState>,
    article_tx: mpsc::Sender<String>,
    check_tx: mpsc::Sender<SyncEvent>,
    pub(crate) takethis_tx: mpsc::Sender<SyncEvent>,
    die_tx: mpsc::Sender<oneshot::Sender<()>>,
    pub(crate) article_rx: Mutex<mpsc::Receiver<String>>,
    pub(crate) check_rx: Mutex<mpsc::Receiver<SyncEvent>>,
    pub(crate) takethis_rx: Mutex<mpsc::Receiver<SyncEvent>>,
    pub(crate) die_rx: Mutex<mpsc::Receiver<oneshot::Sender<()>>>,
    abort_tx: watch::Sender<bool>,
}

impl PeerConnection {
    fn new(
        feedname: String,
        name: String,
        hostname: String,
        addr: Option<SocketAddr>,
        policy: Option<FeedPolicy>,
        flags: ModerationFlags,
    ) -> Arc<Self> {
        let (article_tx, article_rx) = mpsc::channel(OFFER_QUEUE_DEPTH);
        let (check_tx, check_rx) = mpsc::channel(OFFER_QUEUE_DEPTH);
        let (takethis_tx, takethis_rx) = mpsc::channel(OFFER_QUEUE_DEPTH);
        let (die_tx, die_rx) = mpsc::channel(1);
        let (abort_tx, _) = watch::channel(false);
        Arc::new(Self {
            feedname,
            name,
            hostname,
            addr,
            policy,
            flags,
            pending: PendingTable::new(),
            state: StdMutex::new(ConnState::default()),
            article_tx,
            check_tx,
            takethis_tx,
            die_tx,
            article_rx: Mutex::new(article_rx),
            check_rx: Mutex::new(check_rx),
            takethis_rx: Mutex::new(takethis_rx),
            die_rx: Mutex::new(die_rx),
            abort_tx,
        })
    }

    /// Connection state for an outbound feed
    pub fn outbound(conf: &FeedConfig, flags: ModerationFlags) -> Arc<Self> {
        let hostname = conf
            .addr
            .rsplit_once(':')
            .map(|(host, _)| host.to_string())
            .unwrap_or_else(|| conf.addr.clone());
        Self::new(
            conf.name.clone(),
            conf.name.clone(),
            hostname,
            None,
            conf.policy.clone(),
            flags,
        )
    }

    /// Connection state for an accepted inbound connection
    pub fn inbound(
        addr: SocketAddr,
        policy: Option<FeedPolicy>,
        flags: ModerationFlags,
    ) -> Arc<Self> {
        let name = addr.to_string();
        Self::new(
            name.clone(),
            name,
            addr.ip().to_string(),
            Some(addr),
            policy,
            flags,
        )
    }

    /// Negotiated mode
    pub fn mode(&self) -> Option<ConnMode> {
        self.state.lock().unwrap().mode
    }

    pub(crate) fn set_mode(&self, mode: Option<ConnMode>) {
        self.state.lock().unwrap().mode = mode;
    }

    /// Currently selected newsgroup
    pub fn group(&self) -> Option<String> {
        self.state.lock().unwrap().group.clone()
    }

    pub(crate) fn set_group(&self, group: Option<String>) {
        self.state.lock().unwrap().group = group;
    }

    /// Currently selected article
    pub fn selected_article(&self) -> Option<String> {
        self.state.lock().unwrap().selected_article.clone()
    }

    pub(crate) fn set_selected_article(&self, msgid: Option<String>) {
        self.state.lock().unwrap().selected_article = msgid;
    }

    /// Whether the peer has authenticated
    pub fn authenticated(&self) -> bool {
        self.state.lock().unwrap().authenticated
    }

    pub(crate) fn set_authenticated(&self, authenticated: bool) {
        self.state.lock().unwrap().authenticated = authenticated;
    }

    /// Username accepted by AUTHINFO USER
    pub fn username(&self) -> String {
        self.state.lock().unwrap().username.clone()
    }

    pub(crate) fn set_username(&self, username: &str) {
        self.state.lock().unwrap().username = username.to_string();
    }

    /// TLS handshake record, if an upgrade happened
    pub fn tls_info(&self) -> Option<TlsHandshakeInfo> {
        self.state.lock().unwrap().tls.clone()
    }

    pub(crate) fn set_tls_info(&self, info: TlsHandshakeInfo) {
        self.state.lock().unwrap().tls = Some(info);
    }

    /// Pending backlog in bytes
    pub fn backlog(&self) -> u64 {
        self.pending.backlog()
    }

    /// Message-ids currently in the given offer state
    pub fn articles_in_state(&self, state: OfferState) -> Vec<String> {
        self.pending.articles_in_state(state)
    }

    /// Number of live pending offers
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Offer an article for streaming push
    ///
    /// A message-id already pending is a no-op. Blocks once the check
    /// channel is full; that is how peer slowness reaches the dispatcher.
    pub async fn offer_stream(&self, msgid: &str, size: u64) {
        if self.pending.is_queued(msgid) {
            return;
        }
        self.pending.set_state(msgid, OfferState::Queued, size);
        let ev = SyncEvent {
            msgid: msgid.to_string(),
            size,
        };
        if self.check_tx.send(ev).await.is_err() {
            // no engine is running; withdraw the offer
            self.pending.set_processed(msgid);
        }
    }

    /// Queue a reader-mode ARTICLE fetch
    pub async fn ask_for_article(&self, msgid: &str) {
        if self.pending.is_queued(msgid) {
            return;
        }
        debug!(conn = %self.name, msgid, "asking for article");
        self.pending.set_state(msgid, OfferState::Queued, 0);
        if self.article_tx.send(msgid.to_string()).await.is_err() {
            self.pending.set_processed(msgid);
        }
    }

    /// Ask the running engine to QUIT gracefully and wait until it has
    pub async fn quit_and_wait(&self) {
        let (tx, rx) = oneshot::channel();
        if self.die_tx.send(tx).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Force-close the connection; both tasks unwind
    pub fn abort(&self) {
        self.abort_tx.send_replace(true);
    }

    pub(crate) async fn wait_aborted(&self) {
        let mut rx = self.abort_tx.subscribe();
        let _ = rx.wait_for(|aborted| *aborted).await;
    }

    /// Snapshot the connection for status reporting
    pub fn status(&self) -> ConnectionStatus {
        let pending = self
            .pending
            .snapshot()
            .into_iter()
            .map(|(msgid, state)| PendingOffer { msgid, state })
            .collect();
        let state = self.state.lock().unwrap();
        ConnectionStatus {
            name: self.name.clone(),
            mode: state.mode.map(|m| m.as_str()),
            authenticated: state.authenticated,
            group: state.group.clone(),
            backlog: self.pending.backlog(),
            pending,
        }
    }
}

/// Dial a peer with tuned socket options
pub async fn dial(addr: &str) -> Result<BoxConn> {
    use socket2::{Domain, Protocol, Socket, Type};
    use std::net::ToSocketAddrs;

    let socket_addr = addr.to_socket_addrs()?.next().ok_or_else(|| {
        NntpError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            "no address resolved",
        ))
    })?;
    let domain = if socket_addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    // low-latency command traffic, large buffers for article pushes
    socket.set_nodelay(true)?;
    if let Err(e) = socket.set_recv_buffer_size(RECV_BUFFER_SIZE) {
        warn!(error = %e, "failed to set receive buffer size");
    }
    if let Err(e) = socket.set_send_buffer_size(SEND_BUFFER_SIZE) {
        warn!(error = %e, "failed to set send buffer size");
    }
    // socket2 connects are blocking; keep them off the runtime threads
    let stream = timeout(
        CONNECT_TIMEOUT,
        tokio::task::spawn_blocking(move || -> io::Result<std::net::TcpStream> {
            socket.connect(&socket_addr.into())?;
            socket.set_nonblocking(true)?;
            Ok(socket.into())
        }),
    )
    .await
    .map_err(|_| NntpError::Io(io::Error::from(io::ErrorKind::TimedOut)))?
    .map_err(|e| NntpError::Io(io::Error::other(format!("task join error: {e}"))))??;
    let stream = TcpStream::from_std(stream)?;
    Ok(Box::new(stream))
}

/// Drive an outbound connection to a configured feed
pub async fn run_outbound(
    conn: Arc<PeerConnection>,
    daemon: Arc<dyn Daemon>,
    conf: &FeedConfig,
    mut transport: BoxConn,
) -> Result<()> {
    if !conf.tls_off && daemon.can_tls() {
        if let Some(config) = daemon.tls_config_for(&conn.hostname) {
            debug!(conn = %conn.name, host = %conn.hostname, "STARTTLS");
            let (upgraded, info) =
                tls::initiate_starttls(transport, config, &conn.hostname).await?;
            transport = upgraded;
            conn.set_tls_info(info);
        }
    }

    let (mut reader, mut writer) = framed(transport);
    let caps = outbound_handshake(&conn, &mut reader, &mut writer, conf).await?;

    if conf.prefer_mode == PreferredMode::Stream && caps.streaming {
        if mode_switch(&conn, &mut reader, &mut writer, ConnMode::Stream).await? {
            let writer: SharedWriter = Arc::new(Mutex::new(writer));
            let sender = tokio::spawn(stream::start_streaming(
                conn.clone(),
                daemon.clone(),
                writer.clone(),
            ));
            let result = read_replies(&conn, &daemon, &mut reader).await;
            conn.abort();
            let _ = sender.await;
            return result;
        }
    }
    if caps.reader {
        if mode_switch(&conn, &mut reader, &mut writer, ConnMode::Reader).await? {
            return reader::run_reader(&conn, daemon.as_ref(), &mut reader, &mut writer).await;
        }
    }
    info!(conn = %conn.name, "peer supports neither streaming nor reading");
    let _ = writer.send_line("QUIT").await;
    Ok(())
}

/// Read the greeting, collect capabilities, optionally authenticate
async fn outbound_handshake(
    conn: &Arc<PeerConnection>,
    reader: &mut PeerReader,
    writer: &mut PeerWriter,
    conf: &FeedConfig,
) -> Result<RemoteCapabilities> {
    debug!(conn = %conn.name, "outbound handshake");
    let mut caps = RemoteCapabilities::default();
    loop {
        let line = reader.read_line().await?;
        let (code, message) = parse_reply_line(&line)?;
        match code {
            codes::READY_POSTING_ALLOWED => {
                writer.send_line("CAPABILITIES").await?;
                let status = reader.read_line().await?;
                let (code, message) = parse_reply_line(&status)?;
                if code != codes::CAPABILITY_LIST {
                    return Err(NntpError::Protocol { code, message });
                }
                let lines = reader.read_dot_lines().await?;
                caps = Capabilities::parse(&lines).peering();
                break;
            }
            codes::READY_NO_POSTING => {
                info!(conn = %conn.name, "feed does not allow posting");
                break;
            }
            _ => {
                debug!(conn = %conn.name, code, message = %message, "skipping banner line");
            }
        }
    }
    if conf.has_credentials() {
        debug!(conn = %conn.name, "authenticating");
        writer
            .send_line(&format!("AUTHINFO USER {}", conf.username))
            .await?;
        let (code, message) = parse_reply_line(&reader.read_line().await?)?;
        if code != codes::AUTH_CONTINUE {
            let _ = writer.send_line("QUIT").await;
            return Err(NntpError::AuthFailed(message));
        }
        writer
            .send_line(&format!("AUTHINFO PASS {}", conf.password))
            .await?;
        let (code, message) = parse_reply_line(&reader.read_line().await?)?;
        if code != codes::AUTH_ACCEPTED {
            warn!(conn = %conn.name, message = %message, "auth incorrect");
            let _ = writer.send_line("QUIT").await;
            return Err(NntpError::AuthFailed(message));
        }
        info!(conn = %conn.name, "auth successful");
        conn.set_authenticated(true);
    }
    Ok(caps)
}

/// MODE negotiation; the transport is still owned by one task here
async fn mode_switch(
    conn: &Arc<PeerConnection>,
    reader: &mut PeerReader,
    writer: &mut PeerWriter,
    mode: ConnMode,
) -> Result<bool> {
    writer.send_line(&format!("MODE {}", mode.as_str())).await?;
    let (code, message) = parse_reply_line(&reader.read_line().await?)?;
    if crate::response::is_success(code) {
        info!(conn = %conn.name, mode = mode.as_str(), "switched mode");
        conn.set_mode(Some(mode));
        Ok(true)
    } else {
        warn!(conn = %conn.name, mode = mode.as_str(), code, message = %message, "mode switch refused");
        Ok(false)
    }
}

/// Reply-reading half of an outbound STREAM connection
async fn read_replies(
    conn: &Arc<PeerConnection>,
    daemon: &Arc<dyn Daemon>,
    reader: &mut PeerReader,
) -> Result<()> {
    loop {
        let line = tokio::select! {
            _ = conn.wait_aborted() => return Ok(()),
            line = reader.read_line() => match line {
                Ok(line) => line,
                Err(NntpError::ConnectionClosed) => return Ok(()),
                Err(e) => return Err(e),
            },
        };
        match split_coded_line(&line) {
            Some((code, rest)) => {
                stream::handle_reply(conn, daemon.as_ref(), code, rest).await;
            }
            None => debug!(conn = %conn.name, line = %line, "unexpected line on stream connection"),
        }
    }
}

/// Drive an accepted inbound connection
pub async fn run_inbound(
    conn: Arc<PeerConnection>,
    daemon: Arc<dyn Daemon>,
    transport: BoxConn,
) -> Result<()> {
    let (mut reader, mut writer) = framed(transport);
    writer.send_line("200 Posting Allowed").await?;

    // Negotiation phase. Until a mode is set only STARTTLS, CAPABILITIES,
    // MODE, AUTHINFO and QUIT are accepted; STARTTLS needs the transport
    // whole, so the split halves are reunited for the upgrade.
    loop {
        let line = tokio::select! {
            _ = conn.wait_aborted() => return Ok(()),
            line = reader.read_line() => match line {
                Ok(line) => line,
                Err(NntpError::ConnectionClosed) => return Ok(()),
                Err(e) => return Err(e),
            },
        };
        if line.is_empty() {
            return Ok(());
        }
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some(cmd) = parts.first().map(|s| s.to_uppercase()) else {
            continue;
        };
        match cmd.as_str() {
            "QUIT" => {
                writer.send_line("205 closing connection").await?;
                return Ok(());
            }
            "STARTTLS" => match daemon.our_tls_config() {
                Some(config) => {
                    let raw = unframe(reader, writer);
                    let (upgraded, info) = tls::accept_starttls(raw, config).await?;
                    info!(conn = %conn.name, "TLS initiated");
                    conn.set_authenticated(info.handshake_complete);
                    conn.set_tls_info(info);
                    let halves = framed(upgraded);
                    reader = halves.0;
                    writer = halves.1;
                    // fresh banner on the encrypted channel
                    writer.send_line("200 Posting Allowed").await?;
                }
                None => writer.send_line("500 STARTTLS not available").await?,
            },
            "CAPABILITIES" => {
                server::send_capabilities(&mut writer, daemon.as_ref()).await?;
            }
            "MODE" if parts.len() == 2 => match parts[1].to_uppercase().as_str() {
                "READER" => {
                    conn.set_mode(Some(ConnMode::Reader));
                    if conn.authenticated() {
                        writer.send_line("200 Posting Permitted").await?;
                    } else {
                        writer.send_line("201 No posting Permitted").await?;
                    }
                    break;
                }
                "STREAM" => {
                    if conn.authenticated() {
                        writer.send_line("203 Streaming permitted").await?;
                        conn.set_mode(Some(ConnMode::Stream));
                        info!(conn = %conn.name, "streaming enabled");
                        break;
                    }
                    writer.send_line("483 Streaming Denied").await?;
                }
                other => {
                    writer
                        .send_line(&format!("501 invalid mode variant: {other}"))
                        .await?;
                }
            },
            "AUTHINFO" => {
                server::handle_authinfo(&conn, daemon.as_ref(), &mut writer, &line).await?;
            }
            _ => {
                writer
                    .send_line(&format!("500 Invalid command: {cmd}"))
                    .await?;
            }
        }
    }

    // Dispatch phase: a mode is set. A STREAM peer gets our sender spawned
    // on the same transport, pushing our own offers back at it.
    let writer: SharedWriter = Arc::new(Mutex::new(writer));
    let sender = if conn.mode() == Some(ConnMode::Stream) {
        Some(tokio::spawn(stream::start_streaming(
            conn.clone(),
            daemon.clone(),
            writer.clone(),
        )))
    } else {
        None
    };
    let result = dispatch_loop(&conn, &daemon, &mut reader, &writer).await;
    conn.abort();
    if let Some(task) = sender {
        let _ = task.await;
    }
    result
}

/// Inbound read loop once a mode is set
///
/// Coded replies to our own streaming offers arrive interleaved with the
/// peer's commands; they go to the stream reply handler, everything else
/// to command dispatch.
async fn dispatch_loop(
    conn: &Arc<PeerConnection>,
    daemon: &Arc<dyn Daemon>,
    reader: &mut PeerReader,
    writer: &SharedWriter,
) -> Result<()> {
    loop {
        let line = tokio::select! {
            _ = conn.wait_aborted() => return Ok(()),
            line = reader.read_line() => match line {
                Ok(line) => line,
                Err(NntpError::ConnectionClosed) => return Ok(()),
                Err(e) => return Err(e),
            },
        };
        if let Some((code, rest)) = split_coded_line(&line) {
            match code {
                codes::CHECK_SEND
                | codes::TAKETHIS_OK
                | codes::CHECK_LATER
                | codes::CHECK_NOT_WANTED
                | codes::TAKETHIS_REJECTED => {
                    stream::handle_reply(conn, daemon.as_ref(), code, rest).await;
                }
                _ => debug!(conn = %conn.name, code, "unhandled coded line"),
            }
            continue;
        }
        match server::dispatch(conn, daemon, reader, writer, &line).await? {
            LoopAction::Continue => {}
            LoopAction::Quit => return Ok(()),
        }
    }
}
