//! ICMP echo probe with incremental round-trip statistics.

use std::io;
use std::mem;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::{Duration, Instant};

use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time;
use tracing::debug;

use crate::error::{ConsoleError, Result};
use crate::line::LineChannel;

// ── Constants ────────────────────────────────────────────────────────

pub const PING_DEFAULT_COUNT: u32 = 4;
pub const PING_DEFAULT_INTERVAL: Duration = Duration::from_secs(1);
pub const PING_DEFAULT_SIZE: usize = 32;
pub const PING_DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

const ICMP_ECHO_REPLY: u8 = 0;
const ICMP_ECHO_REQUEST: u8 = 8;
const ICMP_HEADER_LEN: usize = 8;

#[derive(Debug, Clone)]
pub struct PingOptions {
    pub count: u32,
    pub interval: Duration,
    pub payload_size: usize,
    pub timeout: Duration,
}

impl Default for PingOptions {
    fn default() -> Self {
        Self {
            count: PING_DEFAULT_COUNT,
            interval: PING_DEFAULT_INTERVAL,
            payload_size: PING_DEFAULT_SIZE,
            timeout: PING_DEFAULT_TIMEOUT,
        }
    }
}

// ── Statistics ──────────────────────────────────────────────────────

/// Per-invocation counters. Mean and variance are folded in one sample at a
/// time and never recomputed from history.
#[derive(Debug, Clone)]
pub struct PingStatistics {
    pub identifier: u16,
    pub sequence: u16,
    pub transmitted: u32,
    pub received: u32,
    pub min_ms: f64,
    pub max_ms: f64,
    pub mean_ms: f64,
    /// Running sum of squared deviations.
    variance_acc: f64,
}

impl PingStatistics {
    pub fn new(identifier: u16) -> Self {
        Self {
            identifier,
            sequence: 0,
            transmitted: 0,
            received: 0,
            min_ms: f64::INFINITY,
            max_ms: 0.0,
            mean_ms: 0.0,
            variance_acc: 0.0,
        }
    }

    /// Fold one round-trip sample in.
    pub fn record(&mut self, rtt_ms: f64) {
        self.received += 1;
        self.min_ms = self.min_ms.min(rtt_ms);
        self.max_ms = self.max_ms.max(rtt_ms);
        let mean_before = self.mean_ms;
        let n = self.received as f64;
        self.mean_ms = ((n - 1.0) * self.mean_ms + rtt_ms) / n;
        if self.received > 1 {
            self.variance_acc += (rtt_ms - mean_before) * (rtt_ms - self.mean_ms);
        }
    }

    /// Population variance of the samples seen so far.
    pub fn variance(&self) -> f64 {
        if self.received == 0 {
            0.0
        } else {
            self.variance_acc / self.received as f64
        }
    }

    pub fn stddev(&self) -> f64 {
        self.variance().sqrt()
    }

    /// Zero transmitted reads as no loss.
    pub fn loss_percent(&self) -> f64 {
        if self.transmitted == 0 {
            return 0.0;
        }
        (self.transmitted as f64 - self.received as f64) / self.transmitted as f64 * 100.0
    }

    /// Trailing summary, CRLF separated.
    pub fn summary(&self) -> String {
        let mut out = format!(
            "{} packets transmitted, {} packets received, {:.1}% packet loss\r\n",
            self.transmitted,
            self.received,
            self.loss_percent()
        );
        if self.received > 0 {
            out.push_str(&format!(
                "round-trip min/avg/max/stddev = {:.3}/{:.3}/{:.3}/{:.3} ms",
                self.min_ms,
                self.mean_ms,
                self.max_ms,
                self.stddev()
            ));
        }
        out
    }
}

// ── Packets ─────────────────────────────────────────────────────────

/// RFC 1071 internet checksum.
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        sum += u16::from_be_bytes([pair[0], pair[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Echo request with a `payload_size` byte pattern (index modulo 256).
pub fn build_echo_request(identifier: u16, sequence: u16, payload_size: usize) -> Vec<u8> {
    let mut packet = Vec::with_capacity(ICMP_HEADER_LEN + payload_size);
    packet.push(ICMP_ECHO_REQUEST);
    packet.push(0); // code
    packet.extend_from_slice(&[0, 0]); // checksum placeholder
    packet.extend_from_slice(&identifier.to_be_bytes());
    packet.extend_from_slice(&sequence.to_be_bytes());
    packet.extend((0..payload_size).map(|i| (i % 256) as u8));
    let sum = checksum(&packet);
    packet[2..4].copy_from_slice(&sum.to_be_bytes());
    packet
}

#[derive(Debug, PartialEq, Eq)]
pub struct EchoReply {
    pub identifier: u16,
    pub sequence: u16,
}

/// Pull an echo reply out of a received datagram. Raw sockets deliver the IP
/// header first; datagram ICMP sockets do not.
pub fn parse_echo_reply(buf: &[u8], with_ip_header: bool) -> Option<EchoReply> {
    let offset = if with_ip_header {
        (*buf.first()? & 0x0f) as usize * 4
    } else {
        0
    };
    let icmp = buf.get(offset..offset + ICMP_HEADER_LEN)?;
    if icmp[0] != ICMP_ECHO_REPLY {
        return None;
    }
    Some(EchoReply {
        identifier: u16::from_be_bytes([icmp[4], icmp[5]]),
        sequence: u16::from_be_bytes([icmp[6], icmp[7]]),
    })
}

// ── Socket ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SocketKind {
    Raw,
    /// Linux unprivileged ping socket: the kernel owns the identifier.
    Datagram,
}

struct IcmpSocket {
    fd: AsyncFd<OwnedFd>,
    kind: SocketKind,
}

impl IcmpSocket {
    fn open(receive_timeout: Duration) -> Result<Self> {
        let (raw, kind) = match open_socket(libc::SOCK_RAW) {
            Ok(fd) => (fd, SocketKind::Raw),
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                debug!("raw ICMP socket refused, trying datagram ICMP socket");
                (
                    open_socket(libc::SOCK_DGRAM).map_err(ConsoleError::IcmpSocket)?,
                    SocketKind::Datagram,
                )
            }
            Err(e) => return Err(ConsoleError::IcmpSocket(e)),
        };
        // SAFETY: `raw` was just returned by socket(2) and is owned by nobody else
        let owned = unsafe { OwnedFd::from_raw_fd(raw) };
        set_receive_timeout(owned.as_raw_fd(), receive_timeout).map_err(ConsoleError::SocketOption)?;
        set_nonblocking(owned.as_raw_fd()).map_err(ConsoleError::SocketOption)?;
        let fd = AsyncFd::new(owned).map_err(ConsoleError::SocketOption)?;
        Ok(Self { fd, kind })
    }

    async fn send_to(&self, packet: &[u8], target: Ipv4Addr) -> io::Result<usize> {
        let addr = sockaddr_for(target);
        loop {
            let mut guard = self.fd.writable().await?;
            let result = guard.try_io(|inner| {
                // SAFETY: packet and addr outlive the call; lengths match the buffers
                let n = unsafe {
                    libc::sendto(
                        inner.as_raw_fd(),
                        packet.as_ptr() as *const libc::c_void,
                        packet.len(),
                        0,
                        &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                        mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });
            match result {
                Ok(sent) => return sent,
                Err(_would_block) => continue,
            }
        }
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, Ipv4Addr)> {
        loop {
            let mut guard = self.fd.readable().await?;
            let result = guard.try_io(|inner| {
                // SAFETY: zeroed sockaddr_in is a valid out-parameter
                let mut from: libc::sockaddr_in = unsafe { mem::zeroed() };
                let mut from_len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
                // SAFETY: buf is valid for buf.len() bytes
                let n = unsafe {
                    libc::recvfrom(
                        inner.as_raw_fd(),
                        buf.as_mut_ptr() as *mut libc::c_void,
                        buf.len(),
                        0,
                        &mut from as *mut libc::sockaddr_in as *mut libc::sockaddr,
                        &mut from_len,
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok((n as usize, Ipv4Addr::from(u32::from_be(from.sin_addr.s_addr))))
                }
            });
            match result {
                Ok(received) => return received,
                Err(_would_block) => continue,
            }
        }
    }

    /// Wait for the reply to `sequence`, discarding anything else.
    async fn wait_reply(
        &self,
        identifier: u16,
        sequence: u16,
        timeout: Duration,
    ) -> io::Result<Option<(usize, Ipv4Addr)>> {
        let deadline = time::Instant::now() + timeout;
        let mut buf = [0u8; 1024];
        loop {
            let received = match time::timeout_at(deadline, self.recv_from(&mut buf)).await {
                Err(_) => return Ok(None),
                Ok(result) => result?,
            };
            let (len, from) = received;
            let Some(reply) = parse_echo_reply(&buf[..len], self.kind == SocketKind::Raw) else {
                continue;
            };
            let ours = reply.sequence == sequence
                && (self.kind == SocketKind::Datagram || reply.identifier == identifier);
            if ours {
                return Ok(Some((len, from)));
            }
        }
    }
}

fn open_socket(kind: libc::c_int) -> io::Result<RawFd> {
    // SAFETY: plain socket(2) call
    let fd = unsafe { libc::socket(libc::AF_INET, kind | libc::SOCK_CLOEXEC, libc::IPPROTO_ICMP) };
    if fd < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(fd)
    }
}

fn set_receive_timeout(fd: RawFd, timeout: Duration) -> io::Result<()> {
    let tv = libc::timeval {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_usec: timeout.subsec_micros() as libc::suseconds_t,
    };
    // SAFETY: tv is a valid timeval for the duration of the call
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVTIMEO,
            &tv as *const libc::timeval as *const libc::c_void,
            mem::size_of::<libc::timeval>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on a descriptor we own
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn sockaddr_for(target: Ipv4Addr) -> libc::sockaddr_in {
    // SAFETY: all-zero is a valid sockaddr_in
    let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_addr.s_addr = u32::from(target).to_be();
    addr
}

/// Resolve a dotted quad or host name to its first IPv4 address.
pub async fn resolve_ipv4(target: &str) -> Result<Ipv4Addr> {
    if let Ok(ip) = target.parse::<Ipv4Addr>() {
        return Ok(ip);
    }
    let addrs = tokio::net::lookup_host((target, 0))
        .await
        .map_err(|_| ConsoleError::Resolve(target.to_string()))?;
    for addr in addrs {
        if let std::net::IpAddr::V4(ip) = addr.ip() {
            return Ok(ip);
        }
    }
    Err(ConsoleError::Resolve(target.to_string()))
}

// ── Probe ───────────────────────────────────────────────────────────

/// Ping `target`, writing one line per reply or timeout to `channel`, then
/// the summary. A key press on the channel ends the probe early. Socket
/// errors abort before anything is sent; the socket is closed on every path.
pub async fn probe<S>(
    channel: &mut LineChannel<S>,
    target: &str,
    options: &PingOptions,
) -> Result<PingStatistics>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let ip = resolve_ipv4(target).await?;
    let socket = IcmpSocket::open(options.timeout)?;
    let mut stats = PingStatistics::new(rand::random::<u16>());
    debug!(target = %ip, id = stats.identifier, kind = ?socket.kind, "ping started");

    channel
        .send(format!("ping {}: {} data bytes\r\n", target, options.payload_size))
        .await?;

    let mut cancelled = false;
    while u32::from(stats.sequence) < options.count && !cancelled {
        stats.sequence = stats.sequence.wrapping_add(1);
        let packet = build_echo_request(stats.identifier, stats.sequence, options.payload_size);
        let sent_at = Instant::now();
        let sent = match socket.send_to(&packet, ip).await {
            Ok(_) => {
                stats.transmitted += 1;
                true
            }
            Err(e) => {
                debug!(err = %e, seq = stats.sequence, "echo request not sent");
                false
            }
        };

        if sent {
            tokio::select! {
                reply = socket.wait_reply(stats.identifier, stats.sequence, options.timeout) => {
                    match reply {
                        Ok(Some((len, from))) => {
                            let rtt = sent_at.elapsed().as_secs_f64() * 1000.0;
                            stats.record(rtt);
                            channel
                                .send(format!(
                                    "{} bytes from {}: icmp_seq={} time={:.3} ms\r\n",
                                    len, from, stats.sequence, rtt
                                ))
                                .await?;
                        }
                        Ok(None) => {
                            channel
                                .send(format!("Request timeout for icmp_seq {}\r\n", stats.sequence))
                                .await?;
                        }
                        Err(e) => {
                            debug!(err = %e, seq = stats.sequence, "echo reply receive failed");
                            channel
                                .send(format!("Request timeout for icmp_seq {}\r\n", stats.sequence))
                                .await?;
                        }
                    }
                }
                result = channel.wait_for_key() => {
                    result?;
                    cancelled = true;
                }
            }
        }

        if !cancelled && u32::from(stats.sequence) < options.count {
            tokio::select! {
                _ = time::sleep(options.interval) => {}
                result = channel.wait_for_key() => {
                    result?;
                    cancelled = true;
                }
            }
        }
    }
    drop(socket);

    channel.send(stats.summary()).await?;
    Ok(stats)
}

// ── Unit tests ──────────────────────────────────────────────────────
