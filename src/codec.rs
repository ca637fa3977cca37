//! CRLF line framing and dot-stuffed payloads
//!
//! Frames a duplex byte stream into CRLF-terminated lines with a length
//! cap, and provides the dot-block reader/writer pair used for multi-line
//! payloads: a leading `.` is doubled on transmit and stripped on receive,
//! and a line containing exactly `.` terminates the block.
//!
//! Received dot-blocks are LF-normalized (CRLF becomes `\n`); the writer
//! converts back. Dot-write followed by dot-read is byte-exact for any
//! LF-terminated payload.

use crate::error::{NntpError, Result};
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter,
    ReadHalf, WriteHalf,
};
use tracing::trace;

/// Length cap for command and reply lines
pub const MAX_COMMAND_LINE: usize = 4096;

/// Length cap for lines inside dot-blocks (headers and bodies)
pub const MAX_PAYLOAD_LINE: usize = 16 * 1024;

/// Read buffer size; articles arrive in dot-blocks so the default 8KB
/// causes excessive syscalls
const READ_BUFFER_CAPACITY: usize = 64 * 1024;

/// Anything that can carry an NNTP session
pub trait AsyncConn: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncConn for T {}

/// Type-erased transport, so a TCP stream and its TLS upgrade interchange
pub type BoxConn = Box<dyn AsyncConn>;

/// Reading half of a framed connection
pub struct NntpReader<R> {
    inner: BufReader<R>,
}

/// Writing half of a framed connection
pub struct NntpWriter<W> {
    inner: BufWriter<W>,
}

/// Framed reading half of a [`BoxConn`]
pub type PeerReader = NntpReader<ReadHalf<BoxConn>>;

/// Framed writing half of a [`BoxConn`]
pub type PeerWriter = NntpWriter<WriteHalf<BoxConn>>;

/// Split a transport into framed halves
pub fn framed(conn: BoxConn) -> (PeerReader, PeerWriter) {
    let (r, w) = tokio::io::split(conn);
    (NntpReader::new(r), NntpWriter::new(w))
}

/// Reunite framed halves into the raw transport (for a STARTTLS upgrade)
///
/// Both halves must come from the same [`framed`] call. Buffered but
/// unprocessed input is dropped, which is fine at the only call sites:
/// the peer is waiting on our TLS handshake and sends nothing.
pub fn unframe(reader: PeerReader, writer: PeerWriter) -> BoxConn {
    reader
        .inner
        .into_inner()
        .unsplit(writer.inner.into_inner())
}

impl<R: AsyncRead + Unpin + Send> NntpReader<R> {
    /// Wrap a reading transport
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::with_capacity(READ_BUFFER_CAPACITY, inner),
        }
    }

    /// Read one line, CRLF stripped, capped at `cap` bytes
    async fn read_raw_line(&mut self, cap: usize) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(512);
        let mut limited = (&mut self.inner).take((cap + 2) as u64);
        let n = limited.read_until(b'\n', &mut buf).await?;
        if n == 0 {
            return Err(NntpError::ConnectionClosed);
        }
        if !buf.ends_with(b"\n") {
            // either the cap was hit or the peer vanished mid-line
            if buf.len() > cap {
                return Err(NntpError::LineTooLong(cap));
            }
            return Err(NntpError::ConnectionClosed);
        }
        buf.pop();
        if buf.ends_with(b"\r") {
            buf.pop();
        }
        Ok(buf)
    }

    /// Read one command or reply line
    pub async fn read_line(&mut self) -> Result<String> {
        let bytes = self.read_raw_line(MAX_COMMAND_LINE).await?;
        let line = String::from_utf8_lossy(&bytes).into_owned();
        trace!("<< {}", line);
        Ok(line)
    }

    /// Read the next line of a dot-block, unstuffed
    ///
    /// Returns `None` at the terminating `.` line.
    pub async fn read_dot_line(&mut self) -> Result<Option<Vec<u8>>> {
        let mut line = self.read_raw_line(MAX_PAYLOAD_LINE).await?;
        if line == b"." {
            return Ok(None);
        }
        if line.starts_with(b"..") {
            line.remove(0);
        }
        Ok(Some(line))
    }

    /// Read a whole dot-block as text lines
    pub async fn read_dot_lines(&mut self) -> Result<Vec<String>> {
        let mut lines = Vec::with_capacity(64);
        while let Some(line) = self.read_dot_line().await? {
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        Ok(lines)
    }

    /// Read the remainder of a dot-block as an LF-normalized payload
    ///
    /// At most `limit` bytes are kept; anything past the limit is still
    /// consumed off the wire (the block must end on the terminator) but
    /// discarded.
    pub async fn read_dot_body(&mut self, limit: u64) -> Result<Vec<u8>> {
        let mut body = Vec::with_capacity(4096);
        while let Some(line) = self.read_dot_line().await? {
            let len = body.len() as u64;
            if len >= limit {
                continue;
            }
            let room = (limit - len) as usize;
            if line.len() >= room {
                body.extend_from_slice(&line[..room]);
            } else {
                body.extend_from_slice(&line);
                body.push(b'\n');
            }
        }
        Ok(body)
    }
}

impl<W: AsyncWrite + Unpin + Send> NntpWriter<W> {
    /// Wrap a writing transport
    pub fn new(inner: W) -> Self {
        Self {
            inner: BufWriter::new(inner),
        }
    }

    /// Send one line with CRLF appended
    pub async fn send_line(&mut self, line: &str) -> Result<()> {
        trace!(">> {}", line);
        self.inner.write_all(line.as_bytes()).await?;
        self.inner.write_all(b"\r\n").await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Send text lines as a dot-block, stuffed and terminated
    pub async fn send_dot_lines<I, S>(&mut self, lines: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for line in lines {
            let line = line.as_ref();
            if line.starts_with('.') {
                self.inner.write_all(b".").await?;
            }
            self.inner.write_all(line.as_bytes()).await?;
            self.inner.write_all(b"\r\n").await?;
        }
        self.inner.write_all(b".\r\n").await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Transmit an LF-normalized payload as a dot-block
    pub async fn send_dot_body(&mut self, body: &[u8]) -> Result<()> {
        let mut lines = body.split(|b| *b == b'\n').peekable();
        while let Some(line) = lines.next() {
            // a trailing newline leaves one empty tail segment, not a line
            if lines.peek().is_none() && line.is_empty() {
                break;
            }
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if line.first() == Some(&b'.') {
                self.inner.write_all(b".").await?;
            }
            self.inner.write_all(line).await?;
            self.inner.write_all(b"\r\n").await?;
        }
        self.inner.write_all(b".\r\n").await?;
        self.inner.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (
        NntpReader<tokio::io::DuplexStream>,
        NntpWriter<tokio::io::DuplexStream>,
    ) {
        let (a, b) = tokio::io::duplex(1 << 20);
        (NntpReader::new(a), NntpWriter::new(b))
    }

    #[tokio::test]
    async fn test_line_round_trip() {
        let (mut r, mut w) = pair();
        w.send_line("CHECK <a@b>").await.unwrap();
        assert_eq!(r.read_line().await.unwrap(), "CHECK <a@b>");
    }

    #[tokio::test]
    async fn test_bare_lf_accepted() {
        let (a, b) = tokio::io::duplex(4096);
        let mut r = NntpReader::new(a);
        let mut raw = b;
        raw.write_all(b"205 closing\n").await.unwrap();
        assert_eq!(r.read_line().await.unwrap(), "205 closing");
    }

    #[tokio::test]
    async fn test_line_cap_enforced() {
        let (a, b) = tokio::io::duplex(1 << 20);
        let mut r = NntpReader::new(a);
        let mut raw = b;
        let long = vec![b'x'; MAX_COMMAND_LINE + 100];
        raw.write_all(&long).await.unwrap();
        raw.write_all(b"\r\n").await.unwrap();
        match r.read_line().await {
            Err(NntpError::LineTooLong(cap)) => assert_eq!(cap, MAX_COMMAND_LINE),
            other => panic!("expected LineTooLong, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_eof_is_connection_closed() {
        let (a, b) = tokio::io::duplex(4096);
        drop(b);
        let mut r = NntpReader::new(a);
        assert!(matches!(
            r.read_line().await,
            Err(NntpError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_dot_body_round_trip() {
        let (mut r, mut w) = pair();
        let body = b"first line\n.starts with dot\n..double\n\nlast\n";
        w.send_dot_body(body).await.unwrap();
        let got = r.read_dot_body(u64::MAX).await.unwrap();
        assert_eq!(got, body);
    }

    #[tokio::test]
    async fn test_dot_body_without_trailing_newline_gains_one() {
        let (mut r, mut w) = pair();
        w.send_dot_body(b"no trailing newline").await.unwrap();
        let got = r.read_dot_body(u64::MAX).await.unwrap();
        assert_eq!(got, b"no trailing newline\n");
    }

    #[tokio::test]
    async fn test_dot_stuffing_on_the_wire() {
        let (a, b) = tokio::io::duplex(4096);
        let mut w = NntpWriter::new(b);
        w.send_dot_body(b".hidden\n").await.unwrap();
        drop(w);
        let mut wire = Vec::new();
        let mut raw = a;
        raw.read_to_end(&mut wire).await.unwrap();
        assert_eq!(wire, b"..hidden\r\n.\r\n");
    }

    #[tokio::test]
    async fn test_dot_lines_unstuffed() {
        let (a, b) = tokio::io::duplex(4096);
        let mut r = NntpReader::new(a);
        let mut raw = b;
        raw.write_all(b"plain\r\n..dotted\r\n...\r\n.\r\n")
            .await
            .unwrap();
        let lines = r.read_dot_lines().await.unwrap();
        assert_eq!(lines, vec!["plain", ".dotted", ".."]);
    }

    #[tokio::test]
    async fn test_dot_body_limit_truncates_and_drains() {
        let (mut r, mut w) = pair();
        w.send_dot_body(b"0123456789\nabcdefghij\n").await.unwrap();
        // the block is fully consumed even though only 4 bytes are kept
        let got = r.read_dot_body(4).await.unwrap();
        assert_eq!(got, b"0123");
        w.send_line("still framed").await.unwrap();
        assert_eq!(r.read_line().await.unwrap(), "still framed");
    }

    #[tokio::test]
    async fn test_send_dot_lines_stuffs_and_terminates() {
        let (a, b) = tokio::io::duplex(4096);
        let mut w = NntpWriter::new(b);
        w.send_dot_lines(["VERSION 2", ".dot"]).await.unwrap();
        drop(w);
        let mut wire = Vec::new();
        let mut raw = a;
        raw.read_to_end(&mut wire).await.unwrap();
        assert_eq!(wire, b"VERSION 2\r\n..dot\r\n.\r\n");
    }
}
