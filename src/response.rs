//! NNTP reply parsing and status codes

use crate::error::{NntpError, Result};

/// Parse an NNTP reply line into code and message
pub fn parse_reply_line(line: &str) -> Result<(u16, String)> {
    // First three bytes must be ASCII digits
    let bytes = line.as_bytes();
    if bytes.len() < 3
        || !bytes[0].is_ascii_digit()
        || !bytes[1].is_ascii_digit()
        || !bytes[2].is_ascii_digit()
    {
        return Err(NntpError::InvalidResponse(line.chars().take(100).collect()));
    }

    let code = line[0..3]
        .parse::<u16>()
        .map_err(|_| NntpError::InvalidResponse(line.chars().take(100).collect()))?;

    let message = if line.len() > 4 {
        line[4..].to_string()
    } else {
        String::new()
    };

    Ok((code, message))
}

/// Split a line into (code, rest) if it begins with a 3-digit reply code
///
/// Lines on a duplex streaming connection interleave peer commands with
/// coded replies to our own offers; this is the dispatch predicate.
pub fn split_coded_line(line: &str) -> Option<(u16, &str)> {
    let bytes = line.as_bytes();
    if bytes.len() < 3
        || !bytes[0].is_ascii_digit()
        || !bytes[1].is_ascii_digit()
        || !bytes[2].is_ascii_digit()
    {
        return None;
    }
    // A command like "600dpi" is not a reply; require end or a space
    match bytes.get(3) {
        None => Some((line[0..3].parse().ok()?, "")),
        Some(b' ') => Some((line[0..3].parse().ok()?, &line[4..])),
        Some(_) => None,
    }
}

/// Whether a reply code signals success (2xx)
pub fn is_success(code: u16) -> bool {
    (200..300).contains(&code)
}

/// NNTP reply codes used by the peering engine (RFC 3977 / 4643 / 4644)
#[allow(dead_code)]
pub mod codes {
    /// Capability list follows
    pub const CAPABILITY_LIST: u16 = 101;
    /// Server ready, posting allowed
    pub const READY_POSTING_ALLOWED: u16 = 200;
    /// Server ready, no posting
    pub const READY_NO_POSTING: u16 = 201;
    /// Streaming accepted (RFC 4644)
    pub const STREAMING_OK: u16 = 203;
    /// Closing connection
    pub const CLOSING_CONNECTION: u16 = 205;
    /// Group selected
    pub const GROUP_SELECTED: u16 = 211;
    /// List of newsgroups follows
    pub const LIST_FOLLOWS: u16 = 215;
    /// Article follows
    pub const ARTICLE_FOLLOWS: u16 = 220;
    /// Head follows
    pub const HEAD_FOLLOWS: u16 = 221;
    /// Article stat line
    pub const ARTICLE_STAT: u16 = 223;
    /// Overview information follows
    pub const OVERVIEW_FOLLOWS: u16 = 224;
    /// List of new newsgroups follows
    pub const NEW_NEWSGROUPS_FOLLOW: u16 = 231;
    /// Article transferred OK (IHAVE)
    pub const ARTICLE_TRANSFERRED: u16 = 235;
    /// Send the article (CHECK accepted)
    pub const CHECK_SEND: u16 = 238;
    /// TAKETHIS accepted
    pub const TAKETHIS_OK: u16 = 239;
    /// Article posted
    pub const ARTICLE_POSTED: u16 = 240;
    /// Authentication accepted
    pub const AUTH_ACCEPTED: u16 = 281;
    /// Send article to be transferred (IHAVE go-ahead)
    pub const SEND_ARTICLE_TRANSFER: u16 = 335;
    /// Send article to be posted
    pub const SEND_ARTICLE: u16 = 340;
    /// Password required
    pub const AUTH_CONTINUE: u16 = 381;
    /// Continue with TLS negotiation
    pub const CONTINUE_TLS: u16 = 382;
    /// No such newsgroup
    pub const NO_SUCH_GROUP: u16 = 411;
    /// No newsgroup selected
    pub const NO_GROUP_SELECTED: u16 = 412;
    /// Current article number is invalid
    pub const NO_CURRENT_ARTICLE: u16 = 420;
    /// No article with that number
    pub const NO_SUCH_ARTICLE_NUMBER: u16 = 423;
    /// No article with that message-id
    pub const NO_SUCH_ARTICLE_ID: u16 = 430;
    /// Try the CHECK again later
    pub const CHECK_LATER: u16 = 431;
    /// Article not wanted (IHAVE)
    pub const ARTICLE_NOT_WANTED: u16 = 435;
    /// Transfer failed, try again later
    pub const TRANSFER_NOT_POSSIBLE: u16 = 436;
    /// Transfer rejected, do not retry
    pub const TRANSFER_REJECTED: u16 = 437;
    /// CHECK: article not wanted
    pub const CHECK_NOT_WANTED: u16 = 438;
    /// TAKETHIS rejected
    pub const TAKETHIS_REJECTED: u16 = 439;
    /// Posting not permitted
    pub const POSTING_NOT_PERMITTED: u16 = 440;
    /// Posting failed
    pub const POSTING_FAILED: u16 = 441;
    /// Authentication rejected
    pub const AUTH_REJECTED: u16 = 481;
    /// Authentication commands out of sequence
    pub const AUTH_OUT_OF_SEQUENCE: u16 = 482;
    /// Encryption or stronger authentication required
    pub const ENCRYPTION_REQUIRED: u16 = 483;
    /// Command not recognized
    pub const COMMAND_NOT_RECOGNIZED: u16 = 500;
    /// Command syntax error
    pub const COMMAND_SYNTAX_ERROR: u16 = 501;
    /// Access denied
    pub const ACCESS_DENIED: u16 = 502;
    /// Feature not supported or internal fault
    pub const FEATURE_NOT_SUPPORTED: u16 = 503;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reply_line() {
        let (code, message) = parse_reply_line("200 Posting Allowed").unwrap();
        assert_eq!(code, 200);
        assert_eq!(message, "Posting Allowed");
    }

    #[test]
    fn test_parse_reply_line_bare_code() {
        let (code, message) = parse_reply_line("205").unwrap();
        assert_eq!(code, 205);
        assert_eq!(message, "");
    }

    #[test]
    fn test_parse_reply_line_rejects_garbage() {
        assert!(parse_reply_line("hello").is_err());
        assert!(parse_reply_line("20").is_err());
        assert!(parse_reply_line("").is_err());
    }

    #[test]
    fn test_split_coded_line() {
        assert_eq!(
            split_coded_line("238 <a@b>"),
            Some((238, "<a@b>"))
        );
        assert_eq!(split_coded_line("205"), Some((205, "")));
        assert_eq!(split_coded_line("CHECK <a@b>"), None);
        // digits glued to a word are a command, not a reply
        assert_eq!(split_coded_line("600dpi"), None);
    }

    #[test]
    fn test_is_success_boundaries() {
        assert!(!is_success(199));
        assert!(is_success(200));
        assert!(is_success(299));
        assert!(!is_success(300));
    }
}
