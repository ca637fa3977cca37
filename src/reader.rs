//! READER-mode client: article fetching and peer scraping
//!
//! Two entry points. [`run_reader`] serves the daemon's fetch queue:
//! every message-id dropped onto the article channel is requested with
//! ARTICLE, admission-checked, and ingested. [`scrape_server`] walks a
//! remote peer's NEWSGROUPS / GROUP / XOVER surface and pulls every
//! article (and thread root) we lack.

use crate::admission;
use crate::codec::{PeerReader, PeerWriter};
use crate::conn::PeerConnection;
use crate::daemon::Daemon;
use crate::error::Result;
use crate::headers;
use crate::ingest;
use crate::pending::OfferState;
use crate::response::{codes, parse_reply_line};
use crate::util;
use crate::validation::valid_message_id;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Serve the fetch queue until told to die or the transport drops
pub async fn run_reader(
    conn: &Arc<PeerConnection>,
    daemon: &dyn Daemon,
    reader: &mut PeerReader,
    writer: &mut PeerWriter,
) -> Result<()> {
    debug!(conn = %conn.name, "run reader mode");
    let mut die = conn.die_rx.lock().await;
    let mut article = conn.article_rx.lock().await;
    loop {
        tokio::select! {
            _ = conn.wait_aborted() => return Ok(()),
            Some(ack) = die.recv() => {
                let _ = writer.send_line("QUIT").await;
                conn.abort();
                let _ = ack.send(());
                return Ok(());
            }
            event = article.recv() => {
                let Some(msgid) = event else { return Ok(()) };
                debug!(conn = %conn.name, msgid = %msgid, "obtaining");
                conn.pending.set_state(&msgid, OfferState::Article, 0);
                let fetched = request_article(conn, daemon, reader, writer, &msgid).await;
                conn.pending.set_processed(&msgid);
                fetched?;
            }
        }
    }
}

/// Fetch one article by message-id and feed it to the daemon
///
/// `220` runs the no-auth admission check and ingests through the group's
/// size limiter; `430` means the peer does not have it; anything else is
/// logged and skipped.
pub async fn request_article(
    conn: &Arc<PeerConnection>,
    daemon: &dyn Daemon,
    reader: &mut PeerReader,
    writer: &mut PeerWriter,
    msgid: &str,
) -> Result<()> {
    writer.send_line(&format!("ARTICLE {msgid}")).await?;
    let line = reader.read_line().await?;
    let (code, message) = parse_reply_line(&line)?;
    match code {
        codes::ARTICLE_FOLLOWS => {
            let (mut header, body_follows) = headers::read_header(reader).await?;
            let verdict = admission::check_article_no_auth(
                &header,
                conn.policy.as_ref(),
                &conn.flags,
                daemon,
            );
            let limit = match &verdict.reason {
                // rejected bodies are consumed but never kept
                Some(_) => 0,
                None => daemon.message_size_limit_for(header.value("Newsgroups")),
            };
            let body = if body_follows {
                reader.read_dot_body(limit).await?
            } else {
                Vec::new()
            };
            match verdict.reason {
                Some(reason) => {
                    debug!(conn = %conn.name, msgid, reason = %reason, "discarding");
                    if verdict.ban {
                        let _ = daemon.database().ban_article(msgid, &reason);
                    }
                }
                None => {
                    if let Err(e) =
                        ingest::store_message(daemon, &conn.name, &mut header, &body)
                    {
                        warn!(conn = %conn.name, msgid, error = %e, "failed to obtain article");
                        let _ = daemon.database().ban_article(msgid, &e.to_string());
                    }
                }
            }
        }
        codes::NO_SUCH_ARTICLE_ID => {
            // peer does not have it
        }
        _ => {
            warn!(conn = %conn.name, code, message = %message, "invalid response to ARTICLE");
        }
    }
    Ok(())
}

/// Pull everything a remote peer carries that we lack
pub async fn scrape_server(
    conn: &Arc<PeerConnection>,
    daemon: &dyn Daemon,
    reader: &mut PeerReader,
    writer: &mut PeerWriter,
) -> Result<()> {
    info!(conn = %conn.name, "scrape remote server");
    writer
        .send_line(&format!("NEWSGROUPS {} 000000 GMT", util::time_now()))
        .await?;
    let line = reader.read_line().await?;
    let (code, message) = parse_reply_line(&line)?;
    if code != codes::NEW_NEWSGROUPS_FOLLOW {
        warn!(conn = %conn.name, code, message = %message, "invalid response to NEWSGROUPS");
        return Ok(());
    }
    let mut groups = Vec::new();
    for line in reader.read_dot_lines().await? {
        match line.split_whitespace().next() {
            Some(group) => groups.push(group.to_string()),
            None => warn!(conn = %conn.name, line = %line, "invalid line in newsgroups response"),
        }
    }
    for group in groups {
        if daemon.database().newsgroup_banned(&group) {
            continue;
        }
        scrape_group(conn, daemon, reader, writer, &group).await?;
    }
    Ok(())
}

/// Scrape one newsgroup: GROUP, XOVER, then fetch what is missing
///
/// Thread roots named in the References column are fetched before the
/// articles that point at them.
pub async fn scrape_group(
    conn: &Arc<PeerConnection>,
    daemon: &dyn Daemon,
    reader: &mut PeerReader,
    writer: &mut PeerWriter,
    group: &str,
) -> Result<()> {
    debug!(conn = %conn.name, group, "scrape newsgroup");
    writer.send_line(&format!("GROUP {group}")).await?;
    let (code, _) = parse_reply_line(&reader.read_line().await?)?;
    if code != codes::GROUP_SELECTED {
        warn!(conn = %conn.name, group, code, "peer does not carry the group");
        return Ok(());
    }
    writer.send_line("XOVER 0").await?;
    let (code, _) = parse_reply_line(&reader.read_line().await?)?;
    if code != codes::OVERVIEW_FOLLOWS {
        warn!(conn = %conn.name, group, code, "XOVER refused");
        return Ok(());
    }

    // message-id -> reference
    let mut articles: HashMap<String, String> = HashMap::new();
    for line in reader.read_dot_lines().await? {
        let parts: Vec<&str> = line.split('\t').collect();
        if parts.len() > 5 {
            articles.insert(parts[4].to_string(), parts[5].to_string());
        }
    }

    let database = daemon.database();
    for (msgid, reference) in articles {
        if !reference.is_empty()
            && valid_message_id(&reference)
            && !database.has_article(&reference)
            && !database.article_banned(&reference)
        {
            request_article(conn, daemon, reader, writer, &reference).await?;
        }
        if valid_message_id(&msgid)
            && !database.has_article(&msgid)
            && !database.article_banned(&msgid)
        {
            request_article(conn, daemon, reader, writer, &msgid).await?;
        }
    }
    Ok(())
}
