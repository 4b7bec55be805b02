//! Host-backed collaborators: account file, directory storage, network and
//! device reports read from the running Linux system.

use std::collections::BTreeMap;
use std::ffi::CString;
use std::fs;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::unix::ffi::OsStrExt;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use nix::net::if_::InterfaceFlags;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::dmesg::dmesg;
use crate::error::{ConsoleError, Result};
use crate::services::{Accounts, Authenticator, Device, FileEntry, NetworkInfo, Storage};

/// Password given to accounts created with `useradd`.
pub const DEFAULT_PASSWORD: &str = "changeimmediatelly";
const MIN_USER_ID: u32 = 1000;

// ── Account file ────────────────────────────────────────────────────

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
struct UserRecord {
    name: String,
    uid: u32,
    home_dir: String,
    /// Hex SHA-256 of the password. Empty means the account cannot log in.
    #[serde(default)]
    password_sha256: String,
}

pub fn hash_password(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

fn with_trailing_slash(dir: &str) -> String {
    if dir.ends_with('/') {
        dir.to_string()
    } else {
        format!("{}/", dir)
    }
}

/// Users kept in a JSON file, rewritten atomically on every change.
pub struct UserFile {
    path: PathBuf,
    users: Mutex<Vec<UserRecord>>,
}

impl UserFile {
    /// Load `path`, creating it with the default accounts if it is missing.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if path.exists() {
            let content = fs::read_to_string(&path)?;
            let users: Vec<UserRecord> = serde_json::from_str(&content)
                .map_err(|e| ConsoleError::Accounts(format!("{}: {}", path.display(), e)))?;
            return Ok(Self {
                path,
                users: Mutex::new(users),
            });
        }

        let users = vec![
            UserRecord {
                name: "root".into(),
                uid: 0,
                home_dir: "/".into(),
                password_sha256: hash_password("rootpassword"),
            },
            UserRecord {
                name: "telnetserver".into(),
                uid: 1,
                home_dir: "/var/telnet/".into(),
                password_sha256: String::new(),
            },
        ];
        atomic_write_json(&path, &users)?;
        dmesg(format!("[USER_MANAGEMENT] created {} with default accounts.", path.display()));
        Ok(Self {
            path,
            users: Mutex::new(users),
        })
    }

    fn update<F>(&self, change: F) -> Result<()>
    where
        F: FnOnce(&mut Vec<UserRecord>) -> std::result::Result<(), String>,
    {
        let mut users = self.users.lock();
        let mut next = users.clone();
        change(&mut next).map_err(ConsoleError::Accounts)?;
        atomic_write_json(&self.path, &next)?;
        *users = next;
        Ok(())
    }
}

#[async_trait]
impl Authenticator for UserFile {
    async fn verify(&self, user: &str, password: &str) -> bool {
        let hashed = hash_password(password);
        self.users
            .lock()
            .iter()
            .any(|u| u.name == user && !u.password_sha256.is_empty() && u.password_sha256 == hashed)
    }

    async fn home_dir(&self, user: &str) -> Option<String> {
        self.users
            .lock()
            .iter()
            .find(|u| u.name == user)
            .map(|u| with_trailing_slash(&u.home_dir))
    }
}

#[async_trait]
impl Accounts for UserFile {
    async fn set_password(&self, user: &str, password: &str) -> Result<()> {
        self.update(|users| {
            let record = users
                .iter_mut()
                .find(|u| u.name == user)
                .ok_or_else(|| format!("no such user {}", user))?;
            record.password_sha256 = hash_password(password);
            Ok(())
        })?;
        dmesg(format!("[USER_MANAGEMENT] password changed for {}.", user));
        Ok(())
    }

    async fn add_user(&self, name: &str, uid: u32, home_dir: &str) -> Result<()> {
        self.update(|users| {
            if uid < MIN_USER_ID {
                return Err(format!("user id {} is below {}", uid, MIN_USER_ID));
            }
            if name.is_empty() || users.iter().any(|u| u.name == name || u.uid == uid) {
                return Err(format!("user {} or id {} already exists", name, uid));
            }
            users.push(UserRecord {
                name: name.to_string(),
                uid,
                home_dir: with_trailing_slash(home_dir),
                password_sha256: hash_password(DEFAULT_PASSWORD),
            });
            Ok(())
        })?;
        dmesg(format!("[USER_MANAGEMENT] user {} added.", name));
        Ok(())
    }

    async fn remove_user(&self, name: &str) -> Result<()> {
        self.update(|users| {
            if name == "root" {
                return Err("root cannot be removed".into());
            }
            let before = users.len();
            users.retain(|u| u.name != name);
            if users.len() == before {
                return Err(format!("no such user {}", name));
            }
            Ok(())
        })?;
        dmesg(format!("[USER_MANAGEMENT] user {} deleted.", name));
        Ok(())
    }
}

/// Atomic JSON write: write to temp file then rename.
fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, &json)?;
    fs::rename(&tmp_path, path)
}

// ── Directory storage ───────────────────────────────────────────────

/// Storage rooted at a host directory. Virtual `/` maps to the root.
pub struct HostStorage {
    root: PathBuf,
}

impl HostStorage {
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn resolve(&self, path: &str) -> Option<PathBuf> {
        let mut resolved = self.root.clone();
        for component in Path::new(path).components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::RootDir | Component::CurDir => {}
                _ => return None,
            }
        }
        Some(resolved)
    }
}

#[async_trait]
impl Storage for HostStorage {
    async fn list(&self, dir: &str) -> Result<Vec<FileEntry>> {
        let failed = || ConsoleError::Storage("Failed to open directory.".into());
        let path = self.resolve(dir).ok_or_else(failed)?;
        let meta = tokio::fs::metadata(&path).await.map_err(|_| failed())?;
        if !meta.is_dir() {
            return Err(ConsoleError::Storage(format!("{} is a file, not a directory.", dir)));
        }
        let mut entries = Vec::new();
        let mut read_dir = tokio::fs::read_dir(&path).await.map_err(|_| failed())?;
        while let Some(entry) = read_dir.next_entry().await? {
            let meta = entry.metadata().await?;
            if !meta.is_dir() {
                entries.push(FileEntry {
                    name: entry.file_name().to_string_lossy().into_owned(),
                    size: meta.len(),
                });
            }
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let failed = || ConsoleError::Storage(format!("Failed to open {}", path));
        let resolved = self.resolve(path).ok_or_else(failed)?;
        if tokio::fs::metadata(&resolved).await.map_err(|_| failed())?.is_dir() {
            return Err(failed());
        }
        tokio::fs::read(&resolved).await.map_err(|_| failed())
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let failed = || ConsoleError::Storage(format!("Failed to delete {}", path));
        let resolved = self.resolve(path).ok_or_else(failed)?;
        tokio::fs::remove_file(&resolved).await.map_err(|_| failed())
    }

    async fn format(&self) -> Result<()> {
        let mut read_dir = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                tokio::fs::remove_dir_all(entry.path()).await?;
            } else {
                tokio::fs::remove_file(entry.path()).await?;
            }
        }
        dmesg(format!("[STORAGE] {} formatted.", self.root.display()));
        Ok(())
    }
}

// ── Network reports ─────────────────────────────────────────────────

#[derive(Default)]
struct InterfaceSummary {
    up: bool,
    loopback: bool,
    hwaddr: Option<[u8; 6]>,
    inet: Vec<(Ipv4Addr, Option<Ipv4Addr>)>,
}

fn mac_string(mac: &[u8]) -> String {
    mac.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

pub struct HostNetwork;

impl NetworkInfo for HostNetwork {
    fn interfaces(&self) -> String {
        let addrs = match nix::ifaddrs::getifaddrs() {
            Ok(addrs) => addrs,
            Err(e) => return format!("Could not read network interfaces: {}", e),
        };
        let mut interfaces: BTreeMap<String, InterfaceSummary> = BTreeMap::new();
        for ifaddr in addrs {
            let summary = interfaces.entry(ifaddr.interface_name.clone()).or_default();
            summary.up |= ifaddr.flags.contains(InterfaceFlags::IFF_UP);
            summary.loopback |= ifaddr.flags.contains(InterfaceFlags::IFF_LOOPBACK);
            let Some(address) = ifaddr.address else {
                continue;
            };
            if let Some(sin) = address.as_sockaddr_in() {
                let mask = ifaddr
                    .netmask
                    .as_ref()
                    .and_then(|m| m.as_sockaddr_in())
                    .map(|m| *SocketAddrV4::from(*m).ip());
                summary.inet.push((*SocketAddrV4::from(*sin).ip(), mask));
            } else if let Some(link) = address.as_link_addr() {
                summary.hwaddr = link.addr();
            }
        }

        interfaces
            .iter()
            .map(|(name, summary)| {
                let mut s = format!("{:<10}", name);
                match summary.hwaddr {
                    Some(mac) => s.push_str(&format!("hwaddr: {}\r\n", mac_string(&mac))),
                    None => s.push_str("\r\n"),
                }
                for (ip, mask) in &summary.inet {
                    s.push_str(&format!("          inet addr: {}", ip));
                    if let Some(mask) = mask {
                        s.push_str(&format!("  mask: {}", mask));
                    }
                    s.push_str("\r\n");
                }
                let mut flags = vec![if summary.up { "UP" } else { "DOWN" }];
                if summary.loopback {
                    flags.push("LOOPBACK");
                }
                s.push_str(&format!("          {}", flags.join(" ")));
                s
            })
            .collect::<Vec<_>>()
            .join("\r\n")
    }

    fn arp_table(&self) -> String {
        match fs::read_to_string("/proc/net/arp") {
            Ok(content) => format_arp(&content),
            Err(e) => format!("Could not read ARP table: {}", e),
        }
    }

    fn wireless(&self) -> String {
        match fs::read_to_string("/proc/net/wireless") {
            Ok(content) => format_wireless(&content),
            Err(_) => "No wireless interfaces.".into(),
        }
    }
}

/// Render `/proc/net/arp` the way `arp -a` lays it out.
pub fn format_arp(proc_net_arp: &str) -> String {
    let mut out = format!("{:<22}{:<22}{}", "Internet Address", "Physical Address", "Interface");
    for line in proc_net_arp.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if let [ip, _hw_type, _flags, mac, _mask, device] = fields[..] {
            out.push_str(&format!("\r\n{:<22}{:<22}{}", ip, mac, device));
        }
    }
    out
}

pub fn rssi_description(rssi: i32) -> &'static str {
    match rssi {
        0 => "not available",
        r if r >= -30 => "excellent",
        r if r >= -67 => "very good",
        r if r >= -70 => "okay",
        r if r >= -80 => "not good",
        r if r >= -90 => "bad",
        _ => "unusable",
    }
}

/// Render `/proc/net/wireless` as one RSSI line per interface.
pub fn format_wireless(proc_net_wireless: &str) -> String {
    let lines: Vec<String> = proc_net_wireless
        .lines()
        .skip(2)
        .filter_map(|line| {
            let (name, rest) = line.split_once(':')?;
            let level = rest.split_whitespace().nth(2)?;
            let rssi: i32 = level.trim_end_matches('.').parse().ok()?;
            Some(format!(
                "{:<10}RSSI: {} dBm ({})",
                name.trim(),
                rssi,
                rssi_description(rssi)
            ))
        })
        .collect();
    if lines.is_empty() {
        "No wireless interfaces.".into()
    } else {
        lines.join("\r\n")
    }
}

// ── Device ──────────────────────────────────────────────────────────

/// Earliest wall clock we believe; anything before is an unset clock.
const CLOCK_SANITY_EPOCH: u64 = 946_684_800; // 2000-01-01

pub struct HostDevice {
    started: Instant,
    hostname: String,
}

impl HostDevice {
    pub fn new(hostname: Option<String>) -> Self {
        let hostname = hostname.unwrap_or_else(|| {
            nix::unistd::gethostname()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "localhost".into())
        });
        Self {
            started: Instant::now(),
            hostname,
        }
    }
}

impl Device for HostDevice {
    fn uname(&self) -> String {
        match nix::sys::utsname::uname() {
            Ok(u) => format!(
                "{} {} {} {}",
                u.sysname().to_string_lossy(),
                self.hostname,
                u.release().to_string_lossy(),
                u.machine().to_string_lossy()
            ),
            Err(_) => format!("{} {}", std::env::consts::OS, self.hostname),
        }
    }

    fn free_memory(&self) -> Option<u64> {
        fs::read_to_string("/proc/meminfo")
            .ok()
            .and_then(|content| parse_mem_available(&content))
    }

    fn time_of_day(&self) -> Option<(u32, u32, u32)> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).ok()?;
        time_of_day_from(now.as_secs())
    }

    fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    fn restart(&self) -> io::Error {
        let exe = match std::env::current_exe() {
            Ok(exe) => exe,
            Err(e) => return e,
        };
        let path = match CString::new(exe.as_os_str().as_bytes()) {
            Ok(path) => path,
            Err(e) => return io::Error::new(io::ErrorKind::InvalidInput, e),
        };
        let args: Vec<CString> = std::env::args_os()
            .filter_map(|a| CString::new(a.as_bytes()).ok())
            .collect();
        warn!(exe = %exe.display(), "restarting");
        match nix::unistd::execv(&path, &args) {
            Ok(never) => match never {},
            Err(errno) => io::Error::from(errno),
        }
    }
}

/// `MemAvailable` from `/proc/meminfo`, in bytes.
pub fn parse_mem_available(meminfo: &str) -> Option<u64> {
    meminfo
        .lines()
        .find_map(|line| line.strip_prefix("MemAvailable:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb * 1024)
}

/// UTC time of day for a Unix timestamp, `None` if the clock looks unset.
pub fn time_of_day_from(unix_secs: u64) -> Option<(u32, u32, u32)> {
    if unix_secs < CLOCK_SANITY_EPOCH {
        return None;
    }
    let secs = (unix_secs % 86_400) as u32;
    Some((secs / 3600, (secs % 3600) / 60, secs % 60))
}

// ── Unit tests ──────────────────────────────────────────────────────
