//! STREAMING-mode sender and reply handling (RFC 4644)
//!
//! The sender half of a STREAM connection: consumes offer events, emits
//! pipelined CHECK and TAKETHIS commands, keeps the link alive with a
//! dummy CHECK once a minute. Coded replies come back interleaved on the
//! read side and are matched to offers by message-id, not by order.

use crate::conn::{PeerConnection, SharedWriter, SyncEvent};
use crate::daemon::Daemon;
use crate::error::Result;
use crate::pending::OfferState;
use crate::response::codes;
use crate::validation::DUMMY_ARTICLE;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Idle cadence for the dummy CHECK keepalive
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);

/// Run the streaming sender until told to die or the transport drops
///
/// Spawn-friendly wrapper that logs the outcome.
pub async fn start_streaming(
    conn: Arc<PeerConnection>,
    daemon: Arc<dyn Daemon>,
    writer: SharedWriter,
) {
    match run_streaming(&conn, daemon.as_ref(), &writer).await {
        Ok(()) => debug!(conn = %conn.name, "done with streaming"),
        Err(e) => warn!(conn = %conn.name, error = %e, "error while streaming"),
    }
}

async fn run_streaming(
    conn: &Arc<PeerConnection>,
    daemon: &dyn Daemon,
    writer: &SharedWriter,
) -> Result<()> {
    let mut keepalive = tokio::time::interval_at(
        Instant::now() + KEEPALIVE_INTERVAL,
        KEEPALIVE_INTERVAL,
    );
    // Holding these locks for the loop's lifetime makes this task the only
    // consumer of die and the offer channels.
    let mut die = conn.die_rx.lock().await;
    let mut check = conn.check_rx.lock().await;
    let mut takethis = conn.takethis_rx.lock().await;

    loop {
        tokio::select! {
            _ = conn.wait_aborted() => return Ok(()),
            Some(ack) = die.recv() => {
                let mut w = writer.lock().await;
                let _ = w.send_line("QUIT").await;
                drop(w);
                conn.abort();
                let _ = ack.send(());
                return Ok(());
            }
            Some(ev) = check.recv() => {
                let mut w = writer.lock().await;
                w.send_line(&format!("CHECK {}", ev.msgid)).await?;
                drop(w);
                conn.pending.set_state(&ev.msgid, OfferState::Check, 0);
            }
            Some(ev) = takethis.recv() => {
                conn.pending.set_state(&ev.msgid, OfferState::Takethis, ev.size);
                send_takethis(conn, daemon, writer, &ev).await?;
            }
            _ = keepalive.tick() => {
                let mut w = writer.lock().await;
                w.send_line(&format!("CHECK {DUMMY_ARTICLE}")).await?;
            }
        }
    }
}

async fn send_takethis(
    conn: &Arc<PeerConnection>,
    daemon: &dyn Daemon,
    writer: &SharedWriter,
    ev: &SyncEvent,
) -> Result<()> {
    let article = match daemon.store().open_message(&ev.msgid) {
        Ok(article) => article,
        Err(e) => {
            // the article went away between the offer and now
            debug!(conn = %conn.name, msgid = %ev.msgid, error = %e, "did not send");
            conn.pending.set_processed(&ev.msgid);
            return Ok(());
        }
    };
    let mut w = writer.lock().await;
    w.send_line(&format!("TAKETHIS {}", ev.msgid)).await?;
    w.send_dot_body(&article).await?;
    Ok(())
}

/// Interpret a coded reply to one of our offers
///
/// Replies naming the dummy keepalive id are acknowledged silently with no
/// pending-table effect.
pub(crate) async fn handle_reply(
    conn: &Arc<PeerConnection>,
    daemon: &dyn Daemon,
    code: u16,
    rest: &str,
) {
    let msgid = rest.split_whitespace().next().unwrap_or("");
    if msgid == DUMMY_ARTICLE {
        return;
    }
    match code {
        codes::CHECK_SEND => {
            // peer wants the article
            conn.pending.set_state(msgid, OfferState::Takethis, 0);
            let size = daemon.store().get_message_size(msgid).unwrap_or(0);
            let ev = SyncEvent {
                msgid: msgid.to_string(),
                size,
            };
            if conn.takethis_tx.send(ev).await.is_err() {
                // sender is gone; resolve the offer so it can be re-offered
                conn.pending.set_processed(msgid);
            }
        }
        codes::TAKETHIS_OK => {
            info!(conn = %conn.name, msgid, "article sent");
            conn.pending.set_processed(msgid);
        }
        codes::CHECK_LATER | codes::CHECK_NOT_WANTED => {
            conn.pending.set_processed(msgid);
        }
        codes::TAKETHIS_REJECTED => {
            warn!(conn = %conn.name, msgid, reply = rest, "article denied");
            conn.pending.set_processed(msgid);
        }
        _ => {
            debug!(conn = %conn.name, code, "unhandled reply code");
        }
    }
}
