//! Process-wide diagnostic log.
//!
//! A fixed-capacity circular queue of timestamped messages. Any part of the
//! process may append with [`dmesg`]; the console reads it back either as a
//! snapshot or in follow mode. The queue is never empty: it is seeded with a
//! startup entry when first touched.

use std::io;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::line::LineChannel;

// ── Constants ────────────────────────────────────────────────────────

pub const DMESG_CAPACITY: usize = 256;
/// How often follow mode re-checks for new entries and for a key press.
pub const FOLLOW_POLL_INTERVAL: Duration = Duration::from_millis(10);

static PROCESS_START: LazyLock<Instant> = LazyLock::new(Instant::now);

static LOG: LazyLock<DiagnosticLog> = LazyLock::new(|| {
    DiagnosticLog::with_capacity(DMESG_CAPACITY, format!("[{}] started.", machine_name()))
});

/// Append a message to the process-wide diagnostic log.
pub fn dmesg(message: impl Into<String>) {
    LOG.append(message);
}

/// The process-wide diagnostic log.
pub fn global() -> &'static DiagnosticLog {
    &LOG
}

/// Milliseconds elapsed since the process first touched the log clock.
pub fn uptime_millis() -> u64 {
    PROCESS_START.elapsed().as_millis() as u64
}

fn machine_name() -> String {
    nix::sys::utsname::uname()
        .map(|u| u.machine().to_string_lossy().into_owned())
        .unwrap_or_else(|_| std::env::consts::ARCH.to_string())
}

// ── Entries ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct DiagnosticEntry {
    pub millis: u64,
    pub message: String,
}

impl DiagnosticEntry {
    fn render(&self) -> String {
        format!("[{:>10}] {}", self.millis, self.message)
    }
}

// ── Ring ────────────────────────────────────────────────────────────

/// Backing storage. `begin` is the oldest slot (inclusive), `end` the next
/// free slot (exclusive). A full ring advances `begin` together with `end`,
/// so at most `capacity - 1` entries are retained.
struct Ring {
    slots: Vec<DiagnosticEntry>,
    begin: usize,
    end: usize,
    /// Entries ever appended, seed included.
    total: u64,
}

impl Ring {
    fn len(&self) -> usize {
        (self.end + self.slots.len() - self.begin) % self.slots.len()
    }

    fn push(&mut self, entry: DiagnosticEntry) {
        let capacity = self.slots.len();
        self.slots[self.end] = entry;
        self.end = (self.end + 1) % capacity;
        if self.end == self.begin {
            self.begin = (self.begin + 1) % capacity;
        }
        self.total += 1;
    }

    /// Render the newest `count` entries, oldest first.
    fn render_tail(&self, count: usize) -> Vec<String> {
        let capacity = self.slots.len();
        let count = count.min(self.len());
        let start = (self.end + capacity - count) % capacity;
        (0..count)
            .map(|i| self.slots[(start + i) % capacity].render())
            .collect()
    }
}

pub struct DiagnosticLog {
    ring: Mutex<Ring>,
}

impl DiagnosticLog {
    /// Create a log with room for `capacity` slots, seeded with one entry.
    pub fn with_capacity(capacity: usize, seed: impl Into<String>) -> Self {
        let capacity = capacity.max(2);
        let mut slots = vec![DiagnosticEntry::default(); capacity];
        slots[0] = DiagnosticEntry {
            millis: uptime_millis(),
            message: seed.into(),
        };
        Self {
            ring: Mutex::new(Ring {
                slots,
                begin: 0,
                end: 1,
                total: 1,
            }),
        }
    }

    pub fn append(&self, message: impl Into<String>) {
        let entry = DiagnosticEntry {
            millis: uptime_millis(),
            message: message.into(),
        };
        tracing::info!(target: "dmesg", "{}", entry.message);
        self.ring.lock().push(entry);
    }

    /// Number of entries currently retained.
    pub fn len(&self) -> usize {
        self.ring.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All retained entries, oldest first, separated by CRLF.
    pub fn snapshot(&self) -> String {
        let ring = self.ring.lock();
        ring.render_tail(ring.len()).join("\r\n")
    }

    /// A cursor positioned before every retained entry.
    pub fn follower(&self) -> Follower<'_> {
        Follower { log: self, seen: 0 }
    }

    /// Send a snapshot, then keep streaming new entries until the peer
    /// presses a key, aborts, or disconnects.
    pub async fn follow<S>(&self, channel: &mut LineChannel<S>) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut follower = self.follower();
        channel.send(follower.snapshot()).await?;
        loop {
            if let Some(batch) = follower.poll() {
                channel.send(batch).await?;
                continue;
            }
            if channel.poll_cancel(FOLLOW_POLL_INTERVAL).await? {
                return Ok(());
            }
        }
    }
}

// ── Follow cursor ───────────────────────────────────────────────────

/// Tracks how much of the log a reader has already seen.
pub struct Follower<'a> {
    log: &'a DiagnosticLog,
    seen: u64,
}

impl Follower<'_> {
    /// Everything retained right now. Marks it all as seen.
    pub fn snapshot(&mut self) -> String {
        let ring = self.log.ring.lock();
        self.seen = ring.total;
        ring.render_tail(ring.len()).join("\r\n")
    }

    /// Entries appended since the last call, each prefixed with CRLF.
    /// Entries overwritten before they could be read are skipped.
    pub fn poll(&mut self) -> Option<String> {
        let ring = self.log.ring.lock();
        let fresh = ring.total.saturating_sub(self.seen) as usize;
        if fresh == 0 {
            return None;
        }
        self.seen = ring.total;
        let mut out = String::new();
        for line in ring.render_tail(fresh) {
            out.push_str("\r\n");
            out.push_str(&line);
        }
        Some(out)
    }
}

// ── Unit tests ──────────────────────────────────────────────────────
