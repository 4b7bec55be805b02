//! Reusable test harness for relay-telnetd integration tests.
//!
//! Spawns the real binary on a free loopback port with a temporary storage
//! root, and drives it over a plain TCP connection.

use std::fs;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

pub const IAC_DONT_ECHO: [u8; 3] = [255, 254, 1];
pub const ROOT_PROMPT: &str = "\r\n# ";
pub const USER_PROMPT: &str = "\r\n$ ";

// ── TelnetdHandle ───────────────────────────────────────────────────

/// Handle to a running relay-telnetd process. Kills it on drop.
pub struct TelnetdHandle {
    pub child: Child,
    pub addr: SocketAddr,
    pub root: PathBuf,
    _dir: tempfile::TempDir,
}

impl Drop for TelnetdHandle {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl TelnetdHandle {
    pub fn connect(&self) -> io::Result<ConsoleClient> {
        let stream = TcpStream::connect(self.addr)?;
        Ok(ConsoleClient::new(stream))
    }

    /// Connect and log in, returning the client positioned after the prompt.
    pub fn login(&self, user: &str, password: &str) -> io::Result<ConsoleClient> {
        let mut client = self.connect()?;
        client
            .expect("user: ")
            .ok_or_else(|| io::Error::new(io::ErrorKind::TimedOut, "no user prompt"))?;
        client.send_line(user)?;
        client.expect("password: ");
        client.send_line(password)?;
        let prompt = if user == "root" { ROOT_PROMPT } else { USER_PROMPT };
        client
            .expect(prompt)
            .ok_or_else(|| io::Error::new(io::ErrorKind::PermissionDenied, "login failed"))?;
        Ok(client)
    }

    /// Path of a file under the storage root, by its console path.
    pub fn file(&self, console_path: &str) -> PathBuf {
        self.root.join(console_path.trim_start_matches('/'))
    }
}

// ── ConsoleClient ───────────────────────────────────────────────────

/// Blocking client that accumulates everything the server sends.
pub struct ConsoleClient {
    stream: TcpStream,
    pending: Vec<u8>,
}

impl ConsoleClient {
    pub fn new(stream: TcpStream) -> Self {
        stream.set_read_timeout(Some(Duration::from_millis(100))).ok();
        Self {
            stream,
            pending: Vec::new(),
        }
    }

    pub fn send_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes)
    }

    /// Type a line and press Enter.
    pub fn send_line(&mut self, line: &str) -> io::Result<()> {
        self.send_raw(format!("{}\r", line).as_bytes())
    }

    /// Read more data into the pending buffer. `false` on disconnect.
    fn fill(&mut self) -> bool {
        let mut buf = [0u8; 4096];
        match self.stream.read(&mut buf) {
            Ok(0) => false,
            Ok(n) => {
                self.pending.extend_from_slice(&buf[..n]);
                true
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => true,
            Err(ref e) if e.kind() == io::ErrorKind::TimedOut => true,
            Err(_) => false,
        }
    }

    /// Wait until `needle` arrives. Returns everything up to and including
    /// it, and keeps the rest buffered. `None` on timeout or disconnect.
    pub fn expect(&mut self, needle: &str) -> Option<String> {
        self.expect_bytes(needle.as_bytes())
    }

    pub fn expect_bytes(&mut self, needle: &[u8]) -> Option<String> {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(at) = find(&self.pending, needle) {
                let taken: Vec<u8> = self.pending.drain(..at + needle.len()).collect();
                return Some(String::from_utf8_lossy(&taken).into_owned());
            }
            if Instant::now() > deadline || !self.fill() {
                return None;
            }
        }
    }

    /// Run a command and return its output up to the next prompt.
    pub fn command(&mut self, line: &str, prompt: &str) -> Option<String> {
        self.send_line(line).ok()?;
        self.expect(prompt)
    }

    /// Everything until the server closes the connection.
    pub fn read_to_close(&mut self) -> Option<Vec<u8>> {
        let deadline = Instant::now() + Duration::from_secs(10);
        while self.fill() {
            if Instant::now() > deadline {
                return None;
            }
        }
        Some(std::mem::take(&mut self.pending))
    }

    /// Raw bytes received so far without waiting for anything.
    pub fn drain_for(&mut self, wait: Duration) -> Vec<u8> {
        let deadline = Instant::now() + wait;
        while Instant::now() < deadline && self.fill() {}
        std::mem::take(&mut self.pending)
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

// ── Spawn helpers ───────────────────────────────────────────────────

/// An account written to the users file before the server starts.
pub struct Account<'a> {
    pub name: &'a str,
    pub uid: u32,
    pub home: &'a str,
    pub password: &'a str,
}

pub const ROOT: Account<'static> = Account {
    name: "root",
    uid: 0,
    home: "/",
    password: "rootpassword",
};

pub const ALICE: Account<'static> = Account {
    name: "alice",
    uid: 1000,
    home: "/home/alice/",
    password: "wonderland",
};

fn sha256_hex(s: &str) -> String {
    hex::encode(Sha256::digest(s.as_bytes()))
}

fn write_users(path: &Path, accounts: &[Account<'_>]) -> io::Result<()> {
    let records: Vec<serde_json::Value> = accounts
        .iter()
        .map(|a| {
            serde_json::json!({
                "name": a.name,
                "uid": a.uid,
                "homeDir": a.home,
                "passwordSha256": sha256_hex(a.password),
            })
        })
        .collect();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_string_pretty(&records)?)
}

fn free_port() -> io::Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

/// Spawn with user name and password checks against `accounts`.
pub fn spawn_with_accounts(accounts: &[Account<'_>]) -> io::Result<TelnetdHandle> {
    spawn_telnetd(Some(accounts), &[])
}

/// Spawn with authentication disabled.
pub fn spawn_without_auth() -> io::Result<TelnetdHandle> {
    spawn_telnetd(None, &[])
}

/// Spawn the binary. `accounts: None` runs with `--auth none`.
pub fn spawn_telnetd(accounts: Option<&[Account<'_>]>, extra_args: &[&str]) -> io::Result<TelnetdHandle> {
    let dir = tempfile::tempdir()?;
    let root = dir.path().join("root");
    fs::create_dir_all(&root)?;
    let users = dir.path().join("passwd.json");
    if let Some(accounts) = accounts {
        write_users(&users, accounts)?;
    }

    let port = free_port()?;
    let addr: SocketAddr = format!("127.0.0.1:{}", port)
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let mut cmd = Command::new(env!("CARGO_BIN_EXE_relay-telnetd"));
    cmd.arg("--bind")
        .arg("127.0.0.1")
        .arg("--port")
        .arg(port.to_string())
        .arg("--root")
        .arg(&root)
        .arg("--users")
        .arg(&users)
        .arg("--auth")
        .arg(if accounts.is_some() { "credentials" } else { "none" });
    cmd.args(extra_args);
    cmd.env("RUST_LOG", "warn")
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    let child = cmd.spawn()?;

    // Wait for the listener
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if TcpStream::connect(addr).is_ok() {
            break;
        }
        if Instant::now() > deadline {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "server did not start listening within 10 seconds",
            ));
        }
        std::thread::sleep(Duration::from_millis(20));
    }

    Ok(TelnetdHandle {
        child,
        addr,
        root,
        _dir: dir,
    })
}
