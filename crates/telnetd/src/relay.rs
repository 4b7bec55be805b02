//! Transparent byte relay between a console session and another server.
//!
//! Two workers pump bytes, one per direction. Each one owns a liveness flag
//! that only it writes; each keeps running while the other's flag is set.
//! Neither blocks for longer than one polling interval, so when one side
//! goes away the other notices promptly.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time;
use tracing::debug;

use crate::dmesg::dmesg;
use crate::line::{LineChannel, IAC_DONT_ECHO};

// ── Constants ────────────────────────────────────────────────────────

pub const RELAY_CHUNK: usize = 512;
pub const RELAY_POLL_INTERVAL: Duration = Duration::from_millis(10);
pub const DEFAULT_TELNET_PORT: u16 = 23;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// The remote endpoint could not be reached; no workers were started.
    ConnectFailed,
    /// Both workers stopped. `received` tells whether the remote ever sent
    /// us anything.
    Closed { received: bool },
}

/// State shared by the two workers for one relay session.
struct RelayState {
    forward_alive: AtomicBool,
    reverse_alive: AtomicBool,
    received_from_remote: AtomicBool,
}

/// Copy bytes from `from` to `to` until EOF, an error, or `peer_alive` drops.
async fn pump<R, W>(
    from: &mut R,
    to: &mut W,
    own_alive: &AtomicBool,
    peer_alive: &AtomicBool,
    saw_data: Option<&AtomicBool>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; RELAY_CHUNK];
    while peer_alive.load(Ordering::Acquire) {
        let n = match time::timeout(RELAY_POLL_INTERVAL, from.read(&mut buf)).await {
            Err(_) => continue, // nothing available yet
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                debug!(err = %e, "relay read failed");
                break;
            }
        };
        if let Some(flag) = saw_data {
            flag.store(true, Ordering::Release);
        }
        if let Err(e) = to.write_all(&buf[..n]).await {
            debug!(err = %e, "relay write failed");
            break;
        }
        if to.flush().await.is_err() {
            break;
        }
    }
    own_alive.store(false, Ordering::Release);
}

/// Connect to `host:port` and shuttle bytes both ways until either side
/// closes. Only transport errors on the local channel are returned.
pub async fn relay<S>(channel: &mut LineChannel<S>, host: &str, port: u16) -> io::Result<RelayOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let connected = time::timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port))).await;
    let mut remote = match connected {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            debug!(host, port, err = %e, "relay connect failed");
            channel
                .send(format!("Could not connect to {} on port {}.", host, port))
                .await?;
            return Ok(RelayOutcome::ConnectFailed);
        }
        Err(_) => {
            debug!(host, port, "relay connect timed out");
            channel
                .send(format!("Could not connect to {} on port {}.", host, port))
                .await?;
            return Ok(RelayOutcome::ConnectFailed);
        }
    };
    let _ = remote.set_nodelay(true);
    dmesg(format!("[TELNET] relay to {}:{} opened.", host, port));

    let state = RelayState {
        forward_alive: AtomicBool::new(true),
        reverse_alive: AtomicBool::new(true),
        received_from_remote: AtomicBool::new(false),
    };

    {
        let (mut remote_r, mut remote_w) = remote.split();
        let (local_r, local_w) = channel.halves();
        let forward = pump(
            &mut remote_r,
            local_w,
            &state.forward_alive,
            &state.reverse_alive,
            Some(&state.received_from_remote),
        );
        let reverse = pump(
            local_r,
            &mut remote_w,
            &state.reverse_alive,
            &state.forward_alive,
            None,
        );
        tokio::join!(forward, reverse);
    }
    drop(remote);

    let received = state.received_from_remote.load(Ordering::Acquire);
    dmesg(format!("[TELNET] relay to {}:{} closed.", host, port));
    if received {
        // the other server may have changed the client's echo mode
        let mut notice = IAC_DONT_ECHO.to_vec();
        notice.extend_from_slice(format!("\r\nConnection to {} lost.", host).as_bytes());
        channel.send(notice).await?;
    } else {
        channel.send(format!("Could not connect to {}.", host)).await?;
    }
    Ok(RelayOutcome::Closed { received })
}

// ── Unit tests ──────────────────────────────────────────────────────
