//! Command line options and the per-session settings derived from them.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;
/// Identity used for every session when authentication is off.
pub const NO_AUTH_USER: &str = "root";
pub const HELP_FILE: &str = "/var/telnet/help.txt";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum AuthMode {
    /// Every connection is logged in as root.
    None,
    /// User name and password are checked against the account file.
    Credentials,
}

#[derive(Debug, Clone, Parser)]
#[command(name = "relay-telnetd", version, about = "Line-oriented remote administration console")]
pub struct Cli {
    /// Address to listen on.
    #[arg(long, env = "TELNETD_BIND", default_value = "0.0.0.0")]
    pub bind: IpAddr,

    #[arg(long, env = "TELNETD_PORT", default_value_t = 23)]
    pub port: u16,

    /// Seconds a session may sit idle at a prompt. 0 disables the limit.
    #[arg(long, env = "TELNETD_IDLE_TIMEOUT", default_value_t = DEFAULT_IDLE_TIMEOUT_SECS)]
    pub idle_timeout: u64,

    #[arg(long, env = "TELNETD_AUTH", value_enum, default_value_t = AuthMode::Credentials)]
    pub auth: AuthMode,

    /// Account file. Defaults to `<root>/etc/passwd.json`.
    #[arg(long, env = "TELNETD_USERS")]
    pub users: Option<PathBuf>,

    /// Directory served as the console's `/`.
    #[arg(long, env = "TELNETD_ROOT", default_value = "/var/lib/relay-telnetd")]
    pub root: PathBuf,

    /// Host name reported by `uname`.
    #[arg(long, env = "TELNETD_HOSTNAME")]
    pub hostname: Option<String>,

    /// Accept connections only from these addresses (repeatable).
    #[arg(long = "allow", value_name = "IP")]
    pub allow: Vec<IpAddr>,
}

impl Cli {
    pub fn users_path(&self) -> PathBuf {
        self.users
            .clone()
            .unwrap_or_else(|| self.root.join("etc").join("passwd.json"))
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            auth: self.auth,
            idle_timeout: (self.idle_timeout > 0).then(|| Duration::from_secs(self.idle_timeout)),
            help_file: HELP_FILE.to_string(),
        }
    }

    pub fn firewall(&self) -> Firewall {
        Firewall::new(self.allow.clone())
    }
}

/// Settings copied into every session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub auth: AuthMode,
    pub idle_timeout: Option<Duration>,
    /// Virtual path of the document `help` prints.
    pub help_file: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auth: AuthMode::Credentials,
            idle_timeout: Some(Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS)),
            help_file: HELP_FILE.to_string(),
        }
    }
}

/// Connection allow-list. Empty accepts everyone.
#[derive(Debug, Clone, Default)]
pub struct Firewall {
    allow: Vec<IpAddr>,
}

impl Firewall {
    pub fn new(allow: Vec<IpAddr>) -> Self {
        Self { allow }
    }

    pub fn permits(&self, addr: IpAddr) -> bool {
        if self.allow.is_empty() {
            return true;
        }
        let addr = match addr {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(addr),
            v4 => v4,
        };
        self.allow.contains(&addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cli = Cli::parse_from(["relay-telnetd"]);
        assert_eq!(cli.port, 23);
        assert_eq!(cli.auth, AuthMode::Credentials);
        let config = cli.session_config();
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(300)));
        assert_eq!(cli.users_path(), PathBuf::from("/var/lib/relay-telnetd/etc/passwd.json"));
    }

    #[test]
    fn zero_idle_timeout_disables_it() {
        let cli = Cli::parse_from(["relay-telnetd", "--idle-timeout", "0", "--auth", "none"]);
        assert_eq!(cli.session_config().idle_timeout, None);
        assert_eq!(cli.auth, AuthMode::None);
    }

    #[test]
    fn firewall_allow_list() {
        assert!(Firewall::default().permits("10.0.0.1".parse().unwrap()));

        let cli = Cli::parse_from(["relay-telnetd", "--allow", "127.0.0.1", "--allow", "10.0.0.2"]);
        let fw = cli.firewall();
        assert!(fw.permits("127.0.0.1".parse().unwrap()));
        assert!(fw.permits("::ffff:10.0.0.2".parse().unwrap()));
        assert!(!fw.permits("10.0.0.3".parse().unwrap()));
    }
}
