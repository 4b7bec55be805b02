//! Line assembly over a raw byte stream.
//!
//! The client is told to stop echoing locally, so the server echoes typed
//! characters itself and handles backspace, abort and the CR terminator.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::time;

// ── Wire constants ──────────────────────────────────────────────────

pub const IAC: u8 = 255;
pub const DONT: u8 = 254;
pub const ECHO: u8 = 1;
/// "Client: stop echoing locally" - the only option exchange we ever send.
pub const IAC_DONT_ECHO: [u8; 3] = [IAC, DONT, ECHO];

const ABORT: u8 = 3;
const BACKSPACE: u8 = 8;
const LINE_FEED: u8 = 10;
const CARRIAGE_RETURN: u8 = 13;
const DELETE: u8 = 127;
const ERASE_SEQUENCE: &[u8] = b"\x08 \x08";

/// Capacity of a command line buffer, terminator slot included.
pub const CMD_LINE_CAPACITY: usize = 256;
/// Capacity of a user name or password buffer, terminator slot included.
pub const CREDENTIAL_CAPACITY: usize = 33;

// ── Line editor ─────────────────────────────────────────────────────

/// What a single input byte did to the line being edited.
#[derive(Debug, PartialEq, Eq)]
pub enum Edit {
    /// Ctrl-C: the whole read is abandoned.
    Abort,
    Ignored,
    /// The last character was removed.
    Erased,
    Appended(u8),
    /// CR: the trimmed line is ready.
    Complete(String),
}

/// Bounded line buffer. Holds at most `capacity - 1` bytes.
pub struct LineEditor {
    buf: Vec<u8>,
    capacity: usize,
}

impl LineEditor {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn feed(&mut self, byte: u8) -> Edit {
        match byte {
            ABORT => Edit::Abort,
            DELETE | LINE_FEED => Edit::Ignored,
            BACKSPACE => {
                if self.buf.pop().is_some() {
                    Edit::Erased
                } else {
                    Edit::Ignored
                }
            }
            CARRIAGE_RETURN => {
                let line = trim_line(&self.buf);
                self.buf.clear();
                Edit::Complete(line)
            }
            b if b >= b' ' && b < 240 && self.buf.len() < self.capacity - 1 => {
                self.buf.push(b);
                Edit::Appended(b)
            }
            _ => Edit::Ignored,
        }
    }
}

/// Strip leading and trailing spaces and tabs.
fn trim_line(buf: &[u8]) -> String {
    let is_blank = |b: &u8| *b == b' ' || *b == b'\t';
    let start = buf.iter().position(|b| !is_blank(b)).unwrap_or(buf.len());
    let end = buf.iter().rposition(|b| !is_blank(b)).map_or(start, |i| i + 1);
    String::from_utf8_lossy(&buf[start..end]).into_owned()
}

// ── Channel ─────────────────────────────────────────────────────────

/// One side of a console connection: buffered reader, writer and the idle
/// timeout applied to line reads.
pub struct LineChannel<S> {
    reader: BufReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
    idle_timeout: Option<Duration>,
}

impl<S> LineChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, idle_timeout: Option<Duration>) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(reader),
            writer,
            idle_timeout,
        }
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    /// Disable the idle timeout, returning the previous value for restoring.
    pub fn suspend_timeout(&mut self) -> Option<Duration> {
        self.idle_timeout.take()
    }

    pub fn restore_timeout(&mut self, timeout: Option<Duration>) {
        self.idle_timeout = timeout;
    }

    /// Write everything and flush.
    pub async fn send(&mut self, data: impl AsRef<[u8]>) -> io::Result<()> {
        self.writer.write_all(data.as_ref()).await?;
        self.writer.flush().await
    }

    /// Read one byte. `None` on EOF.
    async fn recv_byte(&mut self) -> io::Result<Option<u8>> {
        let mut byte = [0u8; 1];
        let n = self.reader.read(&mut byte).await?;
        Ok((n == 1).then_some(byte[0]))
    }

    async fn recv_byte_with_timeout(&mut self) -> io::Result<Option<u8>> {
        match self.idle_timeout {
            Some(limit) => match time::timeout(limit, self.recv_byte()).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "idle timeout")),
            },
            None => self.recv_byte().await,
        }
    }

    /// Read a line of at most `capacity - 1` bytes. `Ok(None)` when the peer
    /// aborts with Ctrl-C or closes the connection.
    pub async fn read_line(&mut self, capacity: usize, echo: bool) -> io::Result<Option<String>> {
        let mut editor = LineEditor::new(capacity);
        while let Some(byte) = self.recv_byte_with_timeout().await? {
            match editor.feed(byte) {
                Edit::Abort => return Ok(None),
                Edit::Complete(line) => return Ok(Some(line)),
                Edit::Erased if echo => self.send(ERASE_SEQUENCE).await?,
                Edit::Appended(b) if echo => self.send([b]).await?,
                _ => {}
            }
        }
        Ok(None)
    }

    /// Block until the peer presses a key (any printable byte or Ctrl-C) or
    /// the connection closes. Other control bytes are swallowed.
    pub async fn wait_for_key(&mut self) -> io::Result<()> {
        loop {
            match self.recv_byte().await? {
                None => return Ok(()),
                Some(b) if b == ABORT || b >= b' ' => return Ok(()),
                Some(_) => {}
            }
        }
    }

    /// Wait up to `wait` for a key press. `true` means the caller should stop.
    pub async fn poll_cancel(&mut self, wait: Duration) -> io::Result<bool> {
        match time::timeout(wait, self.wait_for_key()).await {
            Ok(result) => result.map(|_| true),
            Err(_) => Ok(false),
        }
    }

    /// Borrow the raw halves, e.g. for relaying bytes untouched.
    pub fn halves(&mut self) -> (&mut BufReader<ReadHalf<S>>, &mut WriteHalf<S>) {
        (&mut self.reader, &mut self.writer)
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.writer.shutdown().await
    }
}

// ── Unit tests ──────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn feed_all(editor: &mut LineEditor, bytes: &[u8]) -> Vec<Edit> {
        bytes.iter().map(|&b| editor.feed(b)).collect()
    }

    #[test]
    fn backspace_edits_line() {
        let mut editor = LineEditor::new(CMD_LINE_CAPACITY);
        let edits = feed_all(&mut editor, b"abc\x08d\r");
        assert_eq!(edits.last(), Some(&Edit::Complete("abd".into())));
        assert_eq!(edits[3], Edit::Erased);
    }

    #[test]
    fn backspace_on_empty_is_ignored() {
        let mut editor = LineEditor::new(CMD_LINE_CAPACITY);
        assert_eq!(editor.feed(BACKSPACE), Edit::Ignored);
    }

    #[test]
    fn abort_anywhere() {
        let mut editor = LineEditor::new(CMD_LINE_CAPACITY);
        feed_all(&mut editor, b"quit");
        assert_eq!(editor.feed(3), Edit::Abort);
    }

    #[test]
    fn delete_and_line_feed_ignored() {
        let mut editor = LineEditor::new(CMD_LINE_CAPACITY);
        let edits = feed_all(&mut editor, b"a\x7f\nb\r");
        assert_eq!(edits[1], Edit::Ignored);
        assert_eq!(edits[2], Edit::Ignored);
        assert_eq!(edits.last(), Some(&Edit::Complete("ab".into())));
    }

    #[test]
    fn trims_spaces_and_tabs() {
        let mut editor = LineEditor::new(CMD_LINE_CAPACITY);
        let edits = feed_all(&mut editor, b" \t ls -a \t\r");
        assert_eq!(edits.last(), Some(&Edit::Complete("ls -a".into())));
    }

    #[test]
    fn blank_line_is_empty() {
        let mut editor = LineEditor::new(CMD_LINE_CAPACITY);
        let edits = feed_all(&mut editor, b"   \r");
        assert_eq!(edits.last(), Some(&Edit::Complete(String::new())));
    }

    #[test]
    fn capacity_and_range_enforced() {
        let mut editor = LineEditor::new(4);
        let edits = feed_all(&mut editor, b"abcdef\r");
        assert_eq!(edits[3], Edit::Ignored);
        assert_eq!(edits.last(), Some(&Edit::Complete("abc".into())));

        let mut editor = LineEditor::new(CMD_LINE_CAPACITY);
        assert_eq!(editor.feed(0x01), Edit::Ignored);
        assert_eq!(editor.feed(0xf5), Edit::Ignored);
    }

    #[tokio::test]
    async fn read_line_echoes_and_erases() {
        let (client, server) = duplex(1024);
        let mut channel = LineChannel::new(server, None);
        let (mut client_r, mut client_w) = tokio::io::split(client);

        client_w.write_all(b"ab\x08c\r").await.unwrap();
        let line = channel.read_line(CMD_LINE_CAPACITY, true).await.unwrap();
        assert_eq!(line.as_deref(), Some("ac"));

        drop(channel);
        let mut echoed = Vec::new();
        client_r.read_to_end(&mut echoed).await.unwrap();
        assert_eq!(echoed, b"ab\x08 \x08c");
    }

    #[tokio::test]
    async fn read_line_without_echo_is_silent() {
        let (client, server) = duplex(1024);
        let mut channel = LineChannel::new(server, None);
        let (mut client_r, mut client_w) = tokio::io::split(client);

        client_w.write_all(b"secret\r").await.unwrap();
        let line = channel.read_line(CREDENTIAL_CAPACITY, false).await.unwrap();
        assert_eq!(line.as_deref(), Some("secret"));

        drop(channel);
        let mut echoed = Vec::new();
        client_r.read_to_end(&mut echoed).await.unwrap();
        assert!(echoed.is_empty());
    }

    #[tokio::test]
    async fn read_line_abort_and_eof_yield_none() {
        let (mut client, server) = duplex(1024);
        let mut channel = LineChannel::new(server, None);
        client.write_all(b"ab\x03cd\r").await.unwrap();
        assert_eq!(channel.read_line(CMD_LINE_CAPACITY, true).await.unwrap(), None);

        let (client, server) = duplex(16);
        drop(client);
        let mut closed = LineChannel::new(server, None);
        assert_eq!(closed.read_line(CMD_LINE_CAPACITY, true).await.unwrap(), None);
    }

    #[tokio::test]
    async fn idle_timeout_fails_read() {
        let (_client, server) = duplex(16);
        let mut channel = LineChannel::new(server, Some(Duration::from_millis(20)));
        let err = channel.read_line(CMD_LINE_CAPACITY, true).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn suspended_timeout_is_restored() {
        let (_client, server) = duplex(16);
        let mut channel = LineChannel::new(server, Some(Duration::from_secs(5)));
        let saved = channel.suspend_timeout();
        assert_eq!(channel.idle_timeout(), None);
        channel.restore_timeout(saved);
        assert_eq!(channel.idle_timeout(), Some(Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn poll_cancel_reacts_to_keys_only() {
        let (mut client, server) = duplex(16);
        let mut channel = LineChannel::new(server, None);
        assert!(!channel.poll_cancel(Duration::from_millis(10)).await.unwrap());

        // control bytes other than Ctrl-C do not cancel
        client.write_all(&[LINE_FEED]).await.unwrap();
        assert!(!channel.poll_cancel(Duration::from_millis(10)).await.unwrap());

        client.write_all(b"q").await.unwrap();
        assert!(channel.poll_cancel(Duration::from_millis(100)).await.unwrap());
    }
}
