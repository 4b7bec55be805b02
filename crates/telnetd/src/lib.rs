//! Line-oriented remote administration console served over telnet.
//!
//! Each connection gets a [`session::Session`]: login, then a command loop
//! with built-ins for storage, network diagnostics, the process-wide
//! diagnostic log, ICMP ping and a transparent telnet relay. Everything the
//! console needs from the host goes through the traits in [`services`].

pub mod config;
pub mod dmesg;
pub mod error;
pub mod host;
pub mod line;
pub mod ping;
pub mod relay;
pub mod server;
pub mod services;
pub mod session;
pub mod tokenize;

pub use config::{AuthMode, Cli, Firewall, SessionConfig};
pub use error::{ConsoleError, Result};
pub use server::Server;
pub use services::Services;
