//! Accepted-article storage pipeline
//!
//! Shared by TAKETHIS, IHAVE, POST and the reader-mode ARTICLE fetch:
//! stamp the Path, open the store file, write header and body, then hand
//! the article to the daemon for processing and federation. The body the
//! caller passes has already been size-limited by the codec.

use crate::daemon::Daemon;
use crate::error::{NntpError, Result};
use crate::headers::Header;
use crate::validation::valid_message_id;
use tracing::{debug, warn};

/// Store an accepted article and register it with the daemon
///
/// Messages without a usable Message-ID and duplicates already being
/// written by another connection are silently dropped; the body was
/// consumed off the wire either way, so the command still succeeds.
pub fn store_message(
    daemon: &dyn Daemon,
    conn_name: &str,
    header: &mut Header,
    body: &[u8],
) -> Result<()> {
    let msgid = header.message_id().to_string();
    if msgid.is_empty() {
        debug!(conn = conn_name, "dropping message without a message-id");
        return Ok(());
    }
    if !valid_message_id(&msgid) {
        debug!(conn = conn_name, msgid = %msgid, "dropping message with invalid message-id");
        return Ok(());
    }
    let store = daemon.store();
    let Some(mut file) = store.create_file(&msgid) else {
        // another connection is already writing this article
        debug!(conn = conn_name, msgid = %msgid, "discarding duplicate message");
        return Ok(());
    };

    let path = header.value("Path").to_string();
    header.set("Path", format!("{}!{}", daemon.instance_name(), path));

    let stored = header
        .write_wire(&mut *file)
        .and_then(|()| store.process_message_body(&mut *file, header, body));
    drop(file);

    match stored {
        Ok(()) => {
            daemon.load_from_infeed(&msgid);
            Ok(())
        }
        Err(e) => {
            warn!(conn = conn_name, msgid = %msgid, error = %e, "error processing message");
            let _ = std::fs::remove_file(store.get_filename(&msgid));
            Err(NntpError::Storage(e.to_string()))
        }
    }
}
