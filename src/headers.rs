//! MIME header block parsing
//!
//! Headers are read off a dot-block: name/value lines up to the first
//! empty line (the body follows) or the block terminator (header-only
//! article). Keys match case-insensitively, multi-valued headers keep
//! their order, continuation lines fold with a single space.

use crate::codec::NntpReader;
use crate::error::{NntpError, Result};
use std::io::Write;
use tokio::io::AsyncRead;

/// Upper bound on header lines per article; a block that busts it is
/// malformed, not big
const MAX_HEADER_LINES: usize = 512;

/// An ordered, case-insensitive MIME header multi-map
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Header {
    entries: Vec<(String, String)>,
}

impl Header {
    /// Create an empty header map
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from name/value pairs, preserving order
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            entries: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// First value for a header, if present
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// First value for a header, or the empty string
    pub fn value(&self, name: &str) -> &str {
        self.get(name).unwrap_or("")
    }

    /// All values for a header, in insertion order
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.entries
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Append a value without touching existing ones
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replace all values for a header with a single one
    ///
    /// Keeps the position (and spelling) of the first occurrence.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        let mut kept = false;
        self.entries.retain_mut(|(k, v)| {
            if k.eq_ignore_ascii_case(name) {
                if kept {
                    return false;
                }
                *v = value.clone();
                kept = true;
            }
            true
        });
        if !kept {
            self.entries.push((name.to_string(), value));
        }
    }

    /// The Message-ID header value, or the empty string
    pub fn message_id(&self) -> &str {
        self.value("Message-ID")
    }

    /// Number of header lines
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map holds no headers
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate name/value pairs in order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Header lines as served in a HEAD dot-block
    pub fn to_lines(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|(k, v)| format!("{k}: {v}"))
            .collect()
    }

    /// Write the header block (LF-normalized, trailing blank line) to a sink
    pub fn write_wire(&self, out: &mut dyn Write) -> std::io::Result<()> {
        for (k, v) in &self.entries {
            writeln!(out, "{k}: {v}")?;
        }
        writeln!(out)?;
        Ok(())
    }
}

/// Read a MIME header block from the current dot-block
///
/// Returns the header map and whether a body follows (false when the block
/// terminator arrived before any blank line).
pub async fn read_header<R: AsyncRead + Unpin + Send>(
    reader: &mut NntpReader<R>,
) -> Result<(Header, bool)> {
    let mut header = Header::new();
    loop {
        let line = match reader.read_dot_line().await? {
            None => return Ok((header, false)),
            Some(line) => line,
        };
        if line.is_empty() {
            return Ok((header, true));
        }
        if header.len() >= MAX_HEADER_LINES {
            return Err(NntpError::BadHeader("too many header lines".into()));
        }
        let line = String::from_utf8_lossy(&line).into_owned();
        if line.starts_with(' ') || line.starts_with('\t') {
            // continuation of the previous header, folded with one space
            match header.entries.last_mut() {
                Some((_, v)) => {
                    v.push(' ');
                    v.push_str(line.trim());
                }
                None => {
                    return Err(NntpError::BadHeader(
                        "continuation line before any header".into(),
                    ))
                }
            }
            continue;
        }
        match line.split_once(':') {
            Some((name, value)) => {
                header.add(name.trim().to_string(), value.trim().to_string());
            }
            None => {
                return Err(NntpError::BadHeader(format!(
                    "header line without colon: {}",
                    line.chars().take(80).collect::<String>()
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::NntpWriter;

    async fn parse(raw: &str) -> Result<(Header, bool)> {
        let (a, b) = tokio::io::duplex(1 << 16);
        let mut writer = NntpWriter::new(b);
        writer.send_dot_body(raw.as_bytes()).await.unwrap();
        let mut reader = NntpReader::new(a);
        read_header(&mut reader).await
    }

    #[tokio::test]
    async fn test_parse_basic_header() {
        let (hdr, body) = parse("Subject: hello\nMessage-ID: <a@b>\n\nbody\n")
            .await
            .unwrap();
        assert!(body);
        assert_eq!(hdr.get("Subject"), Some("hello"));
        assert_eq!(hdr.message_id(), "<a@b>");
    }

    #[tokio::test]
    async fn test_case_insensitive_lookup() {
        let (hdr, _) = parse("MESSAGE-ID: <a@b>\n\n").await.unwrap();
        assert_eq!(hdr.value("message-id"), "<a@b>");
        assert_eq!(hdr.value("Message-Id"), "<a@b>");
    }

    #[tokio::test]
    async fn test_multi_value_order_preserved() {
        let (hdr, _) = parse("Path: a\nSubject: s\nPath: b\n\n").await.unwrap();
        let paths: Vec<&str> = hdr.get_all("Path").collect();
        assert_eq!(paths, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_continuation_folding() {
        let (hdr, _) = parse("Subject: first\n  second\n\tthird\n\n").await.unwrap();
        assert_eq!(hdr.get("Subject"), Some("first second third"));
    }

    #[tokio::test]
    async fn test_header_only_block() {
        let (hdr, body) = parse("Subject: no body here\n").await.unwrap();
        assert!(!body);
        assert_eq!(hdr.get("Subject"), Some("no body here"));
    }

    #[tokio::test]
    async fn test_missing_colon_is_bad_header() {
        assert!(matches!(
            parse("not a header line\n\n").await,
            Err(NntpError::BadHeader(_))
        ));
    }

    #[tokio::test]
    async fn test_leading_continuation_is_bad_header() {
        assert!(matches!(
            parse("  dangling\n\n").await,
            Err(NntpError::BadHeader(_))
        ));
    }

    #[test]
    fn test_set_replaces_all_occurrences() {
        let mut hdr = Header::from_pairs([("Path", "a"), ("Subject", "s"), ("Path", "b")]);
        hdr.set("path", "news!a");
        let paths: Vec<&str> = hdr.get_all("Path").collect();
        assert_eq!(paths, vec!["news!a"]);
        // position of the first occurrence is kept
        assert_eq!(hdr.iter().next().unwrap().0, "Path");
    }

    #[test]
    fn test_write_wire() {
        let hdr = Header::from_pairs([("Subject", "s"), ("Message-ID", "<a@b>")]);
        let mut out = Vec::new();
        hdr.write_wire(&mut out).unwrap();
        assert_eq!(out, b"Subject: s\nMessage-ID: <a@b>\n\n");
    }
}
