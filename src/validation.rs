//! Syntactic predicates for message-ids and newsgroup names
//!
//! These are the admission-control predicates: anything that fails here is
//! dropped (or banned) before it touches the store.

/// The reserved keepalive message-id
///
/// Sent as a periodic `CHECK` on idle streaming connections. It must never
/// be stored, forwarded, or entered into the pending table.
pub const DUMMY_ARTICLE: &str = "<keepalive@dummy.tld>";

/// Check a Message-ID for the `<local-part@domain>` shape
///
/// - enclosed in angle brackets
/// - exactly one `@` with non-empty parts on both sides
/// - no whitespace or control characters
///
/// The dummy keepalive id is syntactically valid on purpose: peers answer
/// it with a normal coded reply.
pub fn valid_message_id(message_id: &str) -> bool {
    // <a@b> is the shortest possible id
    if message_id.len() < 5 {
        return false;
    }
    if !message_id.starts_with('<') || !message_id.ends_with('>') {
        return false;
    }
    let content = &message_id[1..message_id.len() - 1];
    if content.matches('@').count() != 1 {
        return false;
    }
    let (local, domain) = match content.split_once('@') {
        Some(pair) => pair,
        None => return false,
    };
    if local.is_empty() || domain.is_empty() {
        return false;
    }
    content
        .chars()
        .all(|ch| !ch.is_whitespace() && !ch.is_control())
}

/// Check a newsgroup name for valid on-wire format
///
/// Dot-separated non-empty components of lowercase letters, digits and
/// `+ - _`; no leading or trailing dot.
pub fn valid_newsgroup(newsgroup: &str) -> bool {
    if newsgroup.is_empty() {
        return false;
    }
    if newsgroup.starts_with('.') || newsgroup.ends_with('.') {
        return false;
    }
    newsgroup.split('.').all(|component| {
        !component.is_empty()
            && component.chars().all(|ch| {
                ch.is_ascii_lowercase() || ch.is_ascii_digit() || matches!(ch, '+' | '-' | '_')
            })
    })
}

/// Check an `X-Frontend-Pubkey` value: 64 hex digits (ed25519, hex-encoded)
pub fn valid_frontend_pubkey(pubkey: &str) -> bool {
    pubkey.len() == 64 && pubkey.chars().all(|ch| ch.is_ascii_hexdigit())
}
