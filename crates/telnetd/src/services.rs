//! Collaborators the console depends on but does not implement itself.
//!
//! Everything here is a plain request/response seam. The host-backed
//! implementations live in [`crate::host`]; tests plug in fakes.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// Application-specific commands, consulted before any built-in.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// `None` (or an empty reply) means "not mine", and the built-in table
    /// is tried next.
    async fn handle(&self, argv: &[String], home_dir: &str) -> Option<String>;
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn verify(&self, user: &str, password: &str) -> bool;
    /// Home directory of an existing user, always ending in `/`.
    async fn home_dir(&self, user: &str) -> Option<String>;
}

#[async_trait]
pub trait Accounts: Send + Sync {
    async fn set_password(&self, user: &str, password: &str) -> Result<()>;
    async fn add_user(&self, name: &str, uid: u32, home_dir: &str) -> Result<()>;
    async fn remove_user(&self, name: &str) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub name: String,
    pub size: u64,
}

/// Persistent storage addressed by absolute virtual paths (`/var/telnet/help.txt`).
#[async_trait]
pub trait Storage: Send + Sync {
    /// Non-directory entries of `dir`.
    async fn list(&self, dir: &str) -> Result<Vec<FileEntry>>;
    async fn read(&self, path: &str) -> Result<Vec<u8>>;
    async fn remove(&self, path: &str) -> Result<()>;
    async fn format(&self) -> Result<()>;
}

/// Pre-formatted network reports.
pub trait NetworkInfo: Send + Sync {
    fn interfaces(&self) -> String;
    fn arp_table(&self) -> String;
    fn wireless(&self) -> String;
}

pub trait Device: Send + Sync {
    fn uname(&self) -> String;
    /// Bytes available for allocation, if known.
    fn free_memory(&self) -> Option<u64>;
    /// Wall clock `(hours, minutes, seconds)`, `None` while the clock is unset.
    fn time_of_day(&self) -> Option<(u32, u32, u32)>;
    fn uptime(&self) -> Duration;
    /// Restart the device. Only returns if the restart could not happen.
    fn restart(&self) -> io::Error;
}

/// Everything a session needs from the outside world.
#[derive(Clone)]
pub struct Services {
    pub handler: Option<Arc<dyn CommandHandler>>,
    pub auth: Arc<dyn Authenticator>,
    pub accounts: Arc<dyn Accounts>,
    pub storage: Arc<dyn Storage>,
    pub network: Arc<dyn NetworkInfo>,
    pub device: Arc<dyn Device>,
}
