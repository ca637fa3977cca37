//! Inbound command dispatch
//!
//! One function per command family, all driven from the supervisor's read
//! loop. Replies (a line, or a status line plus its complete dot-block)
//! are written under a single writer-lock hold so a concurrently running
//! streaming sender can never interleave.

use crate::admission;
use crate::codec::PeerReader;
use crate::conn::{ConnMode, PeerConnection, SharedWriter};
use crate::daemon::{ArticleEntry, Daemon};
use crate::error::{NntpError, Result};
use crate::headers::{self, Header};
use crate::ingest;
use crate::util;
use crate::validation::{valid_message_id, valid_newsgroup};
use std::sync::Arc;
use tracing::{debug, warn};

/// What the dispatch loop should do after a command
pub(crate) enum LoopAction {
    /// Keep reading commands
    Continue,
    /// The peer said QUIT; close the connection
    Quit,
}

/// Handle one inbound command line
pub(crate) async fn dispatch(
    conn: &Arc<PeerConnection>,
    daemon: &Arc<dyn Daemon>,
    reader: &mut PeerReader,
    writer: &SharedWriter,
    line: &str,
) -> Result<LoopAction> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let Some(cmd) = parts.first().map(|s| s.to_uppercase()) else {
        return Ok(LoopAction::Continue);
    };
    match cmd.as_str() {
        "QUIT" => {
            reply(writer, "205 closing connection").await?;
            return Ok(LoopAction::Quit);
        }
        "CAPABILITIES" => {
            let mut w = writer.lock().await;
            send_capabilities(&mut *w, daemon.as_ref()).await?;
        }
        "MODE" if parts.len() == 2 => handle_mode(conn, writer, parts[1]).await?,
        "AUTHINFO" => {
            let mut w = writer.lock().await;
            handle_authinfo(conn, daemon.as_ref(), &mut *w, line).await?;
        }
        "CHECK" if parts.len() == 2 => {
            handle_check(conn, daemon.as_ref(), writer, parts[1]).await?;
        }
        "TAKETHIS" if parts.len() == 2 => {
            handle_takethis(conn, daemon, reader, writer, parts[1]).await?;
        }
        "IHAVE" if parts.len() == 2 => {
            handle_ihave(conn, daemon, reader, writer, parts[1]).await?;
        }
        "POST" => handle_post(conn, daemon, reader, writer).await?,
        "ARTICLE" => {
            handle_article(conn, daemon.as_ref(), writer, parts.get(1).copied().unwrap_or(""))
                .await?;
        }
        "HEAD" => handle_head(conn, daemon.as_ref(), writer, &parts).await?,
        "STAT" => handle_stat(conn, daemon.as_ref(), writer, &parts).await?,
        "GROUP" if parts.len() == 2 => {
            handle_group(conn, daemon.as_ref(), writer, parts[1]).await?;
        }
        "LISTGROUP" => handle_listgroup(conn, daemon.as_ref(), writer, &parts).await?,
        "NEWSGROUPS" => {
            send_group_list(writer, daemon.as_ref(), "231 list of newsgroups follows").await?;
        }
        "LIST" if parts.len() == 1 || parts[1].eq_ignore_ascii_case("NEWSGROUPS") => {
            send_group_list(writer, daemon.as_ref(), "215 list of newsgroups follows").await?;
        }
        "XOVER" => handle_xover(conn, daemon.as_ref(), writer).await?,
        "XHDR" => handle_xhdr(conn, daemon.as_ref(), writer, &parts).await?,
        _ => {
            debug!(conn = %conn.name, cmd = %cmd, "invalid command received");
            reply(writer, &format!("500 Invalid command: {cmd}")).await?;
        }
    }
    Ok(LoopAction::Continue)
}

async fn reply(writer: &SharedWriter, line: &str) -> Result<()> {
    writer.lock().await.send_line(line).await
}

/// Advertise what we speak
pub(crate) async fn send_capabilities<W>(
    writer: &mut crate::codec::NntpWriter<W>,
    daemon: &dyn Daemon,
) -> Result<()>
where
    W: tokio::io::AsyncWrite + Unpin + Send,
{
    writer.send_line("101 capability list follows").await?;
    let mut caps = vec![
        "VERSION 2",
        "READER",
        "STREAMING",
        "IMPLEMENTATION newspeer",
        "POST",
        "IHAVE",
        "AUTHINFO",
    ];
    if daemon.can_tls() && daemon.our_tls_config().is_some() {
        caps.push("STARTTLS");
    }
    writer.send_dot_lines(caps).await
}

async fn handle_mode(
    conn: &Arc<PeerConnection>,
    writer: &SharedWriter,
    mode: &str,
) -> Result<()> {
    match mode.to_uppercase().as_str() {
        "READER" => {
            conn.set_mode(Some(ConnMode::Reader));
            if conn.authenticated() {
                reply(writer, "200 Posting Permitted").await
            } else {
                reply(writer, "201 No posting Permitted").await
            }
        }
        // the streaming engine was spawned when the mode was negotiated
        "STREAM" if conn.authenticated() => reply(writer, "203 Streaming permitted").await,
        other => reply(writer, &format!("501 invalid mode variant: {other}")).await,
    }
}

/// AUTHINFO USER / AUTHINFO PASS
pub(crate) async fn handle_authinfo<W>(
    conn: &Arc<PeerConnection>,
    daemon: &dyn Daemon,
    writer: &mut crate::codec::NntpWriter<W>,
    line: &str,
) -> Result<()>
where
    W: tokio::io::AsyncWrite + Unpin + Send,
{
    let mut split = line.splitn(3, ' ');
    let _authinfo = split.next();
    let sub = split.next().unwrap_or("").to_uppercase();
    // the password may contain spaces; take the raw remainder
    let arg = split.next().unwrap_or("");
    match sub.as_str() {
        "USER" => {
            conn.set_username(arg);
            writer.send_line("381 Password required").await
        }
        "PASS" => {
            let username = conn.username();
            if username.is_empty() {
                return writer
                    .send_line("482 Authentication commands issued out of sequence")
                    .await;
            }
            let database = daemon.database();
            let valid = database
                .check_nntp_user_exists(&username)
                .and_then(|exists| {
                    if exists {
                        database.check_nntp_login(&username, arg)
                    } else {
                        Ok(false)
                    }
                });
            match valid {
                Ok(true) => {
                    conn.set_authenticated(true);
                    writer.send_line("281 Authentication accepted").await
                }
                Ok(false) => writer.send_line("481 Authentication rejected").await,
                Err(e) => {
                    warn!(conn = %conn.name, username = %username, error = %e, "error while logging in");
                    writer.send_line("501 error while logging in").await
                }
            }
        }
        _ => writer.send_line("501 unknown AUTHINFO subcommand").await,
    }
}

async fn handle_check(
    conn: &Arc<PeerConnection>,
    daemon: &dyn Daemon,
    writer: &SharedWriter,
    msgid: &str,
) -> Result<()> {
    if conn.mode() != Some(ConnMode::Stream) {
        return reply(writer, &format!("431 {msgid}")).await;
    }
    // the keepalive id is never wanted and never stored
    if msgid == crate::validation::DUMMY_ARTICLE
        || daemon.store().has_article(msgid)
        || daemon.database().article_banned(msgid)
    {
        reply(writer, &format!("438 {msgid}")).await
    } else {
        reply(writer, &format!("238 {msgid}")).await
    }
}

/// Read a header block, draining the rest of the dot-block on parse errors
/// so the connection stays framed
async fn read_offered_header(reader: &mut PeerReader) -> Result<Option<(Header, bool)>> {
    match headers::read_header(reader).await {
        Ok(parsed) => Ok(Some(parsed)),
        Err(NntpError::BadHeader(e)) => {
            debug!(error = %e, "error reading mime header");
            reader.read_dot_body(0).await?;
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Queue a fetch for a referenced thread root we do not hold
fn want_reference(daemon: &dyn Daemon, reference: &str, newsgroup: &str) {
    if !reference.is_empty()
        && valid_message_id(reference)
        && !daemon.store().has_article(reference)
        && !daemon.database().is_expired(reference)
    {
        debug!(reference, "got reply to an article we do not have");
        daemon.ask_for_article(ArticleEntry {
            msgid: reference.to_string(),
            newsgroup: newsgroup.to_string(),
        });
    }
}

async fn handle_takethis(
    conn: &Arc<PeerConnection>,
    daemon: &Arc<dyn Daemon>,
    reader: &mut PeerReader,
    writer: &SharedWriter,
    msgid: &str,
) -> Result<()> {
    let Some((mut header, body_follows)) = read_offered_header(reader).await? else {
        return reply(writer, &format!("439 {msgid} error reading mime header")).await;
    };
    let verdict = admission::check_article(
        &header,
        conn.authenticated(),
        conn.policy.as_ref(),
        &conn.flags,
        daemon.as_ref(),
    );
    if let Some(reason) = verdict.reason {
        if body_follows {
            reader.read_dot_body(0).await?;
        }
        warn!(conn = %conn.name, msgid, reason = %reason, "rejected");
        if verdict.ban {
            let _ = daemon.database().ban_article(msgid, &reason);
        }
        return reply(writer, &format!("439 {msgid} {reason}")).await;
    }

    let newsgroup = header.value("Newsgroups").to_string();
    want_reference(daemon.as_ref(), header.value("References"), &newsgroup);
    let limit = daemon.message_size_limit_for(&newsgroup);
    let body = if body_follows {
        reader.read_dot_body(limit).await?
    } else {
        Vec::new()
    };
    match ingest::store_message(daemon.as_ref(), &conn.name, &mut header, &body) {
        Ok(()) => reply(writer, &format!("239 {msgid}")).await,
        Err(e) => reply(writer, &format!("439 {msgid} {e}")).await,
    }
}

async fn handle_ihave(
    conn: &Arc<PeerConnection>,
    daemon: &Arc<dyn Daemon>,
    reader: &mut PeerReader,
    writer: &SharedWriter,
    msgid: &str,
) -> Result<()> {
    if !conn.authenticated() {
        return reply(writer, "483 You have not authenticated").await;
    }
    let database = daemon.database();
    if database.has_article_local(msgid)
        || database.has_article(msgid)
        || database.article_banned(msgid)
    {
        return reply(writer, "435 Article Not Wanted").await;
    }
    reply(writer, "335 Send it; end with <CR-LF>.<CR-LF>").await?;

    let Some((mut header, body_follows)) = read_offered_header(reader).await? else {
        return reply(writer, "436 Transfer failed: error reading mime header").await;
    };
    let verdict = admission::check_article(
        &header,
        conn.authenticated(),
        conn.policy.as_ref(),
        &conn.flags,
        daemon.as_ref(),
    );
    if let Some(reason) = verdict.reason {
        if body_follows {
            reader.read_dot_body(0).await?;
        }
        warn!(conn = %conn.name, msgid, reason = %reason, "rejected");
        if verdict.ban {
            let _ = daemon.database().ban_article(msgid, &reason);
        }
        return reply(writer, "437 Rejected; do not send again").await;
    }

    let newsgroup = header.value("Newsgroups").to_string();
    want_reference(daemon.as_ref(), header.value("References"), &newsgroup);
    let limit = daemon.message_size_limit_for(&newsgroup);
    let body = if body_follows {
        reader.read_dot_body(limit).await?
    } else {
        Vec::new()
    };
    match ingest::store_message(daemon.as_ref(), &conn.name, &mut header, &body) {
        Ok(()) => reply(writer, "235 Article transferred").await,
        Err(e) => reply(writer, &format!("437 Transfer failed: {e}")).await,
    }
}

async fn handle_post(
    conn: &Arc<PeerConnection>,
    daemon: &Arc<dyn Daemon>,
    reader: &mut PeerReader,
    writer: &SharedWriter,
) -> Result<()> {
    if !conn.authenticated() {
        return reply(writer, "440 Posting Not Allowed").await;
    }
    reply(writer, "340 Send article; end with <CR-LF>.<CR-LF>").await?;

    let Some((mut header, body_follows)) = read_offered_header(reader).await? else {
        return reply(writer, "441 Posting Failed error reading mime header").await;
    };
    if header.message_id().is_empty() {
        header.set("Message-ID", util::gen_message_id(daemon.instance_name()));
    }
    header.set("Date", util::date_now_str());
    if let Some(addr) = conn.addr {
        // stamp the poster's encrypted address
        if let Ok(encaddr) = daemon.database().get_enc_address(&addr.ip().to_string()) {
            header.set("X-Encrypted-Ip", encaddr);
        }
    }

    let verdict = admission::check_article(
        &header,
        true,
        conn.policy.as_ref(),
        &conn.flags,
        daemon.as_ref(),
    );
    let mut failure = verdict.reason;
    let newsgroup = header.value("Newsgroups").to_string();

    if failure.is_none() {
        let references: Vec<String> = header
            .value("References")
            .split(' ')
            .filter(|r| !r.is_empty())
            .map(str::to_string)
            .collect();
        for reference in references {
            if !valid_message_id(&reference) {
                failure = Some(
                    "cannot reply with invalid reference, maybe you are replying to a reply?"
                        .to_string(),
                );
                break;
            }
            let store = daemon.store();
            if !store.has_article(&reference) && !daemon.database().is_expired(&reference) {
                daemon.ask_for_article(ArticleEntry {
                    msgid: reference.clone(),
                    newsgroup: newsgroup.clone(),
                });
            } else if let Some(root) = store.get_mime_header(&reference) {
                // replying to a root: normalize References to the root's id
                if root.value("References").trim().is_empty() {
                    header.set("References", root.message_id().to_string());
                }
            }
        }
    }

    let storable = failure.is_none() && daemon.database().has_newsgroup(&newsgroup);
    let limit = if storable {
        daemon.message_size_limit_for(&newsgroup)
    } else {
        0
    };
    let body = if body_follows {
        reader.read_dot_body(limit).await?
    } else {
        Vec::new()
    };
    if storable {
        if let Err(e) = ingest::store_message(daemon.as_ref(), &conn.name, &mut header, &body) {
            failure = Some(e.to_string());
        }
    }

    match failure {
        None => reply(writer, "240 Article posted").await,
        Some(reason) => {
            debug!(conn = %conn.name, reason = %reason, "failed nntp POST");
            reply(writer, &format!("441 Posting Failed {reason}")).await
        }
    }
}

/// Resolve an ARTICLE/HEAD/STAT argument that may be an article number
fn resolve_msgid(conn: &Arc<PeerConnection>, daemon: &dyn Daemon, arg: &str) -> String {
    if valid_message_id(arg) {
        return arg.to_string();
    }
    if let Some(group) = conn.group() {
        if let Ok(n) = arg.parse::<i64>() {
            if let Ok(msgid) = daemon.database().get_message_id_for_nntp_id(&group, n) {
                return msgid;
            }
        }
    }
    arg.to_string()
}

async fn handle_article(
    conn: &Arc<PeerConnection>,
    daemon: &dyn Daemon,
    writer: &SharedWriter,
    arg: &str,
) -> Result<()> {
    let msgid = resolve_msgid(conn, daemon, arg);
    let store = daemon.store();
    if !valid_message_id(&msgid) || !store.has_article(&msgid) {
        return reply(writer, &format!("430 {msgid}")).await;
    }
    match store.open_message(&msgid) {
        Ok(raw) => {
            conn.set_selected_article(Some(msgid.clone()));
            let mut w = writer.lock().await;
            w.send_line(&format!("220 {msgid}")).await?;
            w.send_dot_body(&raw).await
        }
        Err(e) => reply(writer, &format!("503 failed to open article: {e}")).await,
    }
}

async fn serve_head(
    daemon: &dyn Daemon,
    writer: &SharedWriter,
    n: i64,
    msgid: &str,
) -> Result<()> {
    match daemon.store().get_headers(msgid) {
        Some(header) => {
            let mut w = writer.lock().await;
            w.send_line(&format!("221 {n} {msgid}")).await?;
            w.send_dot_lines(header.to_lines()).await
        }
        None => reply(writer, "500 cannot load headers").await,
    }
}

async fn handle_head(
    conn: &Arc<PeerConnection>,
    daemon: &dyn Daemon,
    writer: &SharedWriter,
    parts: &[&str],
) -> Result<()> {
    let Some(group) = conn.group() else {
        return reply(writer, "412 No newsgroup selected").await;
    };
    let database = daemon.database();
    let Some(arg) = parts.get(1) else {
        // no argument: serve the selected article
        return match conn.selected_article() {
            Some(msgid) => {
                let n = database
                    .get_nntp_id_for_message_id(&group, &msgid)
                    .unwrap_or(0);
                serve_head(daemon, writer, n, &msgid).await
            }
            None => reply(writer, "420 current article number is invalid").await,
        };
    };
    if let Ok(n) = arg.parse::<i64>() {
        match database.get_message_id_for_nntp_id(&group, n) {
            Ok(msgid) if !msgid.is_empty() && daemon.store().has_article(&msgid) => {
                conn.set_selected_article(Some(msgid.clone()));
                serve_head(daemon, writer, n, &msgid).await
            }
            _ => reply(writer, "423 no article with that number").await,
        }
    } else if valid_message_id(arg) {
        if daemon.store().has_article(arg) {
            let n = database.get_nntp_id_for_message_id(&group, arg).unwrap_or(0);
            conn.set_selected_article(Some(arg.to_string()));
            serve_head(daemon, writer, n, arg).await
        } else {
            reply(writer, "430 no such article").await
        }
    } else {
        reply(writer, "501 invalid argument").await
    }
}

async fn handle_stat(
    conn: &Arc<PeerConnection>,
    daemon: &dyn Daemon,
    writer: &SharedWriter,
    parts: &[&str],
) -> Result<()> {
    let store = daemon.store();
    let database = daemon.database();
    let Some(group) = conn.group() else {
        // without a group only a message-id argument works
        let Some(arg) = parts.get(1) else {
            return reply(writer, "412 No newsgroup selected").await;
        };
        if valid_message_id(arg) && store.has_article(arg) {
            let n = database.get_nntp_id_for_message_id("", arg).unwrap_or(0);
            return reply(writer, &format!("223 {n} {arg}")).await;
        }
        return reply(writer, "430 No article with that message-id").await;
    };
    if !database.has_newsgroup(&group) {
        return reply(writer, "503 selected group no longer exists").await;
    }
    let Some(arg) = parts.get(1) else {
        return reply(writer, "420 Current article number is invalid").await;
    };
    let (n, msgid) = match arg.parse::<i64>() {
        Ok(n) => match database.get_message_id_for_nntp_id(&group, n) {
            Ok(msgid) => (n, msgid),
            Err(e) => {
                return reply(writer, &format!("503 error getting article id: {e}")).await;
            }
        },
        Err(_) => (0, arg.to_string()),
    };
    if valid_message_id(&msgid) && store.has_article(&msgid) {
        conn.set_selected_article(Some(msgid.clone()));
        reply(writer, &format!("223 {n} {msgid}")).await
    } else if n == 0 {
        reply(writer, "430 no such article").await
    } else {
        reply(writer, "423 no article with that number").await
    }
}

async fn handle_group(
    conn: &Arc<PeerConnection>,
    daemon: &dyn Daemon,
    writer: &SharedWriter,
    group: &str,
) -> Result<()> {
    let database = daemon.database();
    if !database.has_newsgroup(group) {
        return reply(writer, "411 No Such Newsgroup").await;
    }
    conn.set_group(Some(group.to_string()));
    conn.set_selected_article(None);
    let number = database.count_posts_in_group(group, 0);
    match database.get_last_and_first_for_group(group) {
        Ok((last, first)) => {
            reply(writer, &format!("211 {number} {first} {last} {group}")).await
        }
        Err(e) => {
            warn!(conn = %conn.name, group, error = %e, "error getting water marks");
            // still have to answer; bogus marks beat no reply
            reply(writer, &format!("211 {number} 0 1 {group}")).await
        }
    }
}

async fn handle_listgroup(
    conn: &Arc<PeerConnection>,
    daemon: &dyn Daemon,
    writer: &SharedWriter,
    parts: &[&str],
) -> Result<()> {
    let group = match parts.get(1) {
        Some(group) => group.to_string(),
        None => conn.group().unwrap_or_default(),
    };
    if group.is_empty() || !valid_newsgroup(&group) {
        return reply(writer, "412 no newsgroup selected").await;
    }
    let database = daemon.database();
    if !database.has_newsgroup(&group) {
        return reply(writer, "411 no such newsgroup").await;
    }
    let listed = database
        .count_all_articles_in_group(&group)
        .and_then(|count| {
            database
                .get_last_and_first_for_group(&group)
                .map(|(last, first)| (count, last, first))
        });
    match listed {
        Ok((count, last, first)) => {
            let mut w = writer.lock().await;
            w.send_line(&format!("211 {count} {first} {last} {group} list follows"))
                .await?;
            let numbers: Vec<String> = (first..=last).map(|n| n.to_string()).collect();
            w.send_dot_lines(numbers).await
        }
        Err(e) => {
            warn!(conn = %conn.name, group, error = %e, "LISTGROUP failed");
            reply(writer, &format!("500 error in LISTGROUP: {e}")).await
        }
    }
}

async fn send_group_list(
    writer: &SharedWriter,
    daemon: &dyn Daemon,
    status: &str,
) -> Result<()> {
    let database = daemon.database();
    let mut lines = Vec::new();
    for group in database.get_all_newsgroups() {
        match database.get_last_and_first_for_group(&group) {
            Ok((last, first)) => lines.push(format!("{group} {last} {first} y")),
            Err(e) => {
                warn!(group, error = %e, "cannot get water marks for group");
            }
        }
    }
    let mut w = writer.lock().await;
    w.send_line(status).await?;
    w.send_dot_lines(lines).await
}

async fn handle_xover(
    conn: &Arc<PeerConnection>,
    daemon: &dyn Daemon,
    writer: &SharedWriter,
) -> Result<()> {
    let Some(group) = conn.group() else {
        return reply(writer, "412 No newsgroup selected").await;
    };
    match daemon.database().get_nntp_posts_in_group(&group) {
        Ok(models) => {
            let lines: Vec<String> = models
                .iter()
                .map(|m| {
                    format!(
                        "{:06}\t{}\t\"{}\" <{}@{}>\t{}\t{}\t{}",
                        m.nntp_id, m.subject, m.name, m.name, m.frontend, m.date, m.msgid,
                        m.reference
                    )
                })
                .collect();
            let mut w = writer.lock().await;
            w.send_line("224 Overview information follows").await?;
            w.send_dot_lines(lines).await
        }
        Err(e) => {
            warn!(conn = %conn.name, group, error = %e, "error getting posts in group");
            reply(writer, &format!("500 error, {e}")).await
        }
    }
}

async fn handle_xhdr(
    conn: &Arc<PeerConnection>,
    daemon: &dyn Daemon,
    writer: &SharedWriter,
    parts: &[&str],
) -> Result<()> {
    if conn.group().is_none() {
        return reply(writer, "412 no newsgroup selected").await;
    }
    let (name, msgid) = match parts {
        [_, name, msgid] => (*name, *msgid),
        [_, _name] => ("", ""),
        _ => return reply(writer, "502 no permission").await,
    };
    if !valid_message_id(msgid) {
        return reply(writer, "430 no such article").await;
    }
    match daemon.store().get_headers(msgid) {
        Some(header) => {
            let mut w = writer.lock().await;
            w.send_line("221 header follows").await?;
            w.send_dot_lines([header.value(name)]).await
        }
        None => reply(writer, &format!("500 could not fetch headers for {msgid}")).await,
    }
}
