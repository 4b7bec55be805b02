//! One console session: greeting, login, then the command loop.

use std::io;
use std::net::IpAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::config::{AuthMode, SessionConfig, NO_AUTH_USER};
use crate::dmesg::{self, dmesg};
use crate::error::ConsoleError;
use crate::line::{LineChannel, CMD_LINE_CAPACITY, CREDENTIAL_CAPACITY, IAC_DONT_ECHO};
use crate::ping::{self, PingOptions};
use crate::relay::{self, DEFAULT_TELNET_PORT};
use crate::services::Services;
use crate::tokenize::{tokenize, ArgumentVector};

// ── Constants ────────────────────────────────────────────────────────

pub const ROOT_PROMPT: &str = "\r\n# ";
pub const USER_PROMPT: &str = "\r\n$ ";
/// `cat` sends file contents in chunks of this size.
const CAT_CHUNK: usize = 2048;
const FREE_MAX_INTERVAL: u64 = 300;

const UNKNOWN_OPTION: &str = "Unknown option.";
const ONLY_OPTION_A: &str = "Only option -a is supported.";
const MISSING_FILE_NAME: &str = "Missing fileName.";
const INVALID_COMMAND: &str = "Invalid command, use \"help\" to display available commands.";

/// Whether the command loop keeps going after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

pub struct Session<S> {
    channel: LineChannel<S>,
    peer: IpAddr,
    services: Services,
    config: SessionConfig,
    user: String,
    home_dir: String,
    logged_in: bool,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, peer: IpAddr, services: Services, config: SessionConfig) -> Self {
        let channel = LineChannel::new(stream, config.idle_timeout);
        Self {
            channel,
            peer,
            services,
            config,
            user: String::new(),
            home_dir: String::new(),
            logged_in: false,
        }
    }

    /// Serve the connection until the user quits, login fails, the idle
    /// timeout fires or the transport breaks.
    pub async fn run(mut self) -> io::Result<()> {
        let result = self.serve().await;
        if self.logged_in {
            dmesg(format!("[TELNET] {} logged out.", self.user));
        }
        let _ = self.channel.shutdown().await;
        if let Err(e) = &result {
            debug!(peer = %self.peer, err = %e, "session ended");
        }
        result
    }

    async fn serve(&mut self) -> io::Result<()> {
        if !self.login().await? {
            return Ok(());
        }
        while let Some(line) = self.channel.read_line(CMD_LINE_CAPACITY, true).await? {
            if !line.is_empty() {
                self.channel.send("\r\n").await?;
                let argv = tokenize(&line);
                if self.dispatch(&argv).await? == Flow::Close {
                    return Ok(());
                }
            }
            let prompt = self.prompt();
            self.channel.send(prompt).await?;
        }
        Ok(())
    }

    fn prompt(&self) -> &'static str {
        if self.user == "root" {
            ROOT_PROMPT
        } else {
            USER_PROMPT
        }
    }

    // ── Login ────────────────────────────────────────────────────────

    /// `Ok(false)` means the session must close without a prompt.
    async fn login(&mut self) -> io::Result<bool> {
        let mut hello = format!("Hello {}", self.peer).into_bytes();
        hello.extend_from_slice(&IAC_DONT_ECHO);

        match self.config.auth {
            AuthMode::None => {
                hello.extend_from_slice(b"! ");
                self.channel.send(hello).await?;
                self.user = NO_AUTH_USER.to_string();
                self.home_dir = "/".to_string();
                self.logged_in = true;
                dmesg(format!("[TELNET] {} logged in.", self.user));
                let welcome = format!(
                    "\r\n\nWelcome,\r\nuse \"/\" to refer to your home directory \"{}\",\r\nuse \"help\" to display available commands.\r\n{}",
                    self.home_dir,
                    self.prompt()
                );
                self.channel.send(welcome).await?;
                Ok(true)
            }
            AuthMode::Credentials => {
                hello.extend_from_slice(b",\r\n\nuser: ");
                self.channel.send(hello).await?;
                let Some(user) = self.channel.read_line(CREDENTIAL_CAPACITY, true).await? else {
                    return Ok(false);
                };
                self.channel.send("\r\npassword: ").await?;
                let Some(password) = self.channel.read_line(CREDENTIAL_CAPACITY, false).await? else {
                    return Ok(false);
                };

                let home_dir = if self.services.auth.verify(&user, &password).await {
                    self.services.auth.home_dir(&user).await
                } else {
                    None
                };
                let Some(home_dir) = home_dir else {
                    dmesg(format!("[TELNET] {} login attempt failed.", user));
                    info!(peer = %self.peer, user = %user, "login failed");
                    self.channel.send("\r\n\nUser name or password incorrect.").await?;
                    return Ok(false);
                };

                self.user = user;
                self.home_dir = home_dir;
                self.logged_in = true;
                dmesg(format!("[TELNET] {} logged in.", self.user));
                info!(peer = %self.peer, user = %self.user, "login");
                let welcome = format!(
                    "\r\n\nWelcome {},\r\nuse \"/\" to refer to your home directory \"{}\",\r\nuse \"help\" to display available commands.\r\n{}",
                    self.user,
                    self.home_dir,
                    self.prompt()
                );
                self.channel.send(welcome).await?;
                Ok(true)
            }
        }
    }

    // ── Dispatch ─────────────────────────────────────────────────────

    async fn dispatch(&mut self, argv: &ArgumentVector) -> io::Result<Flow> {
        if let Some(handler) = self.services.handler.clone() {
            // the handler may take as long as it likes
            let saved = self.channel.suspend_timeout();
            let reply = handler.handle(argv.as_slice(), &self.home_dir).await;
            self.channel.restore_timeout(saved);
            if let Some(reply) = reply.filter(|r| !r.is_empty()) {
                self.channel.send(reply).await?;
                return Ok(Flow::Continue);
            }
        }

        let argc = argv.argc();
        let credentials = self.config.auth == AuthMode::Credentials;
        match argv.command() {
            "quit" => {
                if argc == 1 {
                    return Ok(Flow::Close);
                }
                self.say(UNKNOWN_OPTION).await?;
            }
            "uname" => {
                if argc == 1 || (argc == 2 && argv.arg(1) == "-a") {
                    let uname = self.services.device.uname();
                    self.say(uname).await?;
                } else {
                    self.say(ONLY_OPTION_A).await?;
                }
            }
            "ls" | "dir" => {
                if argc <= 2 {
                    let dir = self.storage_path(argv.arg(1));
                    self.ls(&dir).await?;
                } else {
                    self.say(UNKNOWN_OPTION).await?;
                }
            }
            "cat" | "type" => match argc {
                1 => self.say(MISSING_FILE_NAME).await?,
                2 => {
                    let path = self.storage_path(argv.arg(1));
                    self.cat(&path).await?;
                }
                _ => self.say(UNKNOWN_OPTION).await?,
            },
            "rm" | "del" => match argc {
                1 => self.say(MISSING_FILE_NAME).await?,
                2 => {
                    let path = self.storage_path(argv.arg(1));
                    self.rm(&path).await?;
                }
                _ => self.say(UNKNOWN_OPTION).await?,
            },
            "ifconfig" | "ipconfig" => {
                if argc == 1 {
                    let report = self.services.network.interfaces();
                    self.say(report).await?;
                } else {
                    self.say(UNKNOWN_OPTION).await?;
                }
            }
            "arp" => {
                if argc == 1 || (argc == 2 && argv.arg(1) == "-a") {
                    let report = self.services.network.arp_table();
                    self.say(report).await?;
                } else {
                    self.say(ONLY_OPTION_A).await?;
                }
            }
            "iw" => {
                if argc == 1 {
                    let report = self.services.network.wireless();
                    self.say(report).await?;
                } else {
                    self.say(UNKNOWN_OPTION).await?;
                }
            }
            "ping" => match argc {
                1 => self.say("Missing target IP.").await?,
                2 => self.ping(argv.arg(1)).await?,
                _ => self.say(UNKNOWN_OPTION).await?,
            },
            "uptime" => {
                if argc == 1 {
                    let device = &self.services.device;
                    let report = format_uptime(device.time_of_day(), device.uptime());
                    self.say(report).await?;
                } else {
                    self.say(UNKNOWN_OPTION).await?;
                }
            }
            "reboot" => {
                if argc == 1 {
                    return self.reboot().await;
                }
                self.say(UNKNOWN_OPTION).await?;
            }
            "help" => {
                if argc == 1 {
                    self.help().await?;
                } else {
                    self.say(UNKNOWN_OPTION).await?;
                }
            }
            "mkfs" => self.mkfs(argc).await?,
            "passwd" if credentials => return self.passwd(argv).await,
            "useradd" if credentials => self.useradd(argv).await?,
            "userdel" if credentials => self.userdel(argv).await?,
            "free" => {
                if argc == 1 {
                    self.free(None).await?;
                } else if let Some(secs) = parse_free_interval(argv) {
                    self.free(Some(Duration::from_secs(secs))).await?;
                } else {
                    self.say("The only free syntax supported is free (-s <n>   where 0 < n < 300).")
                        .await?;
                }
            }
            "dmesg" => {
                if argc == 1 {
                    let snapshot = dmesg::global().snapshot();
                    self.say(snapshot).await?;
                } else if argc == 2 && argv.arg(1) == "--follow" {
                    dmesg::global().follow(&mut self.channel).await?;
                } else {
                    self.say("The only dmesg syntax supported is dmesg (--follow).").await?;
                }
            }
            "telnet" => {
                let port = match argc {
                    2 => Some(DEFAULT_TELNET_PORT),
                    3 => argv.arg(2).parse::<u16>().ok().filter(|p| *p > 0),
                    _ => None,
                };
                match port {
                    Some(port) => {
                        relay::relay(&mut self.channel, argv.arg(1), port).await?;
                    }
                    None => self.say("Use telnet <server> (<port>).").await?,
                }
            }
            _ => self.say(INVALID_COMMAND).await?,
        }
        Ok(Flow::Continue)
    }

    async fn say(&mut self, text: impl AsRef<[u8]>) -> io::Result<()> {
        self.channel.send(text).await
    }

    /// Map a command argument onto storage: relative to the home directory,
    /// with a leading `/` meaning the home directory itself.
    fn storage_path(&self, arg: &str) -> String {
        format!("{}{}", self.home_dir, arg.strip_prefix('/').unwrap_or(arg))
    }

    // ── Storage commands ─────────────────────────────────────────────

    async fn ls(&mut self, dir: &str) -> io::Result<()> {
        match self.services.storage.list(dir).await {
            Ok(entries) => {
                let listing = entries
                    .iter()
                    .map(|e| format!("  {:>6} {}", e.size, e.name))
                    .collect::<Vec<_>>()
                    .join("\r\n");
                self.say(listing).await
            }
            Err(e) => self.say(storage_message(e)).await,
        }
    }

    async fn cat(&mut self, path: &str) -> io::Result<()> {
        match self.services.storage.read(path).await {
            Ok(content) => self.send_text(&content).await,
            Err(e) => self.say(storage_message(e)).await,
        }
    }

    async fn rm(&mut self, path: &str) -> io::Result<()> {
        match self.services.storage.remove(path).await {
            Ok(()) => self.say(format!("{} deleted.\r\n", path)).await,
            Err(e) => self.say(storage_message(e)).await,
        }
    }

    /// Send file contents with bare LF turned into CRLF.
    async fn send_text(&mut self, content: &[u8]) -> io::Result<()> {
        for chunk in normalize_line_endings(content).chunks(CAT_CHUNK) {
            self.channel.send(chunk).await?;
        }
        Ok(())
    }

    async fn help(&mut self) -> io::Result<()> {
        let help_file = self.config.help_file.clone();
        match self.services.storage.read(&help_file).await {
            Ok(content) => self.send_text(&content).await,
            Err(e) => {
                debug!(err = %e, "help file unavailable");
                let dir = help_file.rsplit_once('/').map_or("/", |(dir, _)| dir);
                self.say(format!(
                    "Please upload the help.txt file into {}/ to display available commands.",
                    dir
                ))
                .await
            }
        }
    }

    async fn mkfs(&mut self, argc: usize) -> io::Result<()> {
        if self.home_dir != "/" {
            return self.say("You don't have root rights to format the disk.").await;
        }
        if argc != 1 {
            return self.say(UNKNOWN_OPTION).await;
        }
        self.say("formatting, please wait ... ").await?;
        match self.services.storage.format().await {
            Ok(()) => self.say("formatted.").await,
            Err(e) => {
                warn!(err = %e, "format failed");
                self.say("\r\nformatting failed.").await
            }
        }
    }

    // ── Device and network commands ──────────────────────────────────

    async fn ping(&mut self, target: &str) -> io::Result<()> {
        match ping::probe(&mut self.channel, target, &PingOptions::default()).await {
            Ok(_) => Ok(()),
            Err(ConsoleError::Io(e)) => Err(e),
            Err(e) => self.say(e.to_string()).await,
        }
    }

    async fn free(&mut self, every: Option<Duration>) -> io::Result<()> {
        let report = self.free_report();
        self.say(report).await?;
        let Some(every) = every else {
            return Ok(());
        };
        while !self.channel.poll_cancel(every).await? {
            let report = format!("\r\n{}", self.free_report());
            self.say(report).await?;
        }
        Ok(())
    }

    fn free_report(&self) -> String {
        match self.services.device.free_memory() {
            Some(bytes) => format!("free memory: {} bytes", bytes),
            None => "free memory: unknown".to_string(),
        }
    }

    async fn reboot(&mut self) -> io::Result<Flow> {
        self.say("rebooting ...").await?;
        let _ = self.channel.shutdown().await;
        dmesg(format!("[TELNET] reboot requested by {}.", self.user));
        let err = self.services.device.restart();
        warn!(err = %err, "restart failed");
        dmesg(format!("[TELNET] reboot failed: {}", err));
        Ok(Flow::Close)
    }

    // ── Account commands ─────────────────────────────────────────────

    async fn read_secret(&mut self) -> io::Result<Option<String>> {
        self.channel.read_line(CREDENTIAL_CAPACITY, false).await
    }

    async fn passwd(&mut self, argv: &ArgumentVector) -> io::Result<Flow> {
        let argc = argv.argc();
        let target = argv.arg(1).to_string();

        if argc == 1 || (argc == 2 && target == self.user) {
            self.say("Enter current password: ").await?;
            let Some(current) = self.read_secret().await? else {
                return Ok(Flow::Close);
            };
            if !self.services.auth.verify(&self.user, &current).await {
                self.say("\r\nWrong password.").await?;
                return Ok(Flow::Continue);
            }
            let user = self.user.clone();
            return self
                .change_password(
                    &user,
                    "\r\nEnter new password: ".to_string(),
                    "\r\nRe-enter new password: ".to_string(),
                    "\r\nPassword not changed.\r\n",
                )
                .await;
        }

        if argc == 2 && target != "root" {
            if self.user != "root" {
                self.say("Only root may change password for another user.").await?;
            } else if self.services.auth.home_dir(&target).await.is_none() {
                self.say(format!("User {} does not exist.", target)).await?;
            } else {
                return self
                    .change_password(
                        &target,
                        format!("Enter new password for {}: ", target),
                        format!("\r\nRe-enter new password for {}: ", target),
                        "\r\nPassword not changed.",
                    )
                    .await;
            }
            return Ok(Flow::Continue);
        }

        if argc == 2 {
            self.say("Only root may change password for another user.").await?;
        } else {
            self.say("The only passwd syntax supported is passwd (<userName>).").await?;
        }
        Ok(Flow::Continue)
    }

    /// Ask for the new password twice and store it. Closing or aborting
    /// mid-dialog ends the session.
    async fn change_password(
        &mut self,
        user: &str,
        first: String,
        second: String,
        not_changed: &'static str,
    ) -> io::Result<Flow> {
        self.say(first).await?;
        let Some(password) = self.read_secret().await? else {
            return Ok(Flow::Close);
        };
        if password.is_empty() {
            self.say(not_changed).await?;
            return Ok(Flow::Continue);
        }
        self.say(second).await?;
        let Some(again) = self.read_secret().await? else {
            return Ok(Flow::Close);
        };
        if password != again {
            self.say("\r\nPasswords do not match.").await?;
            return Ok(Flow::Continue);
        }
        match self.services.accounts.set_password(user, &password).await {
            Ok(()) => self.say("\r\nPassword changed.\r\n").await?,
            Err(e) => {
                warn!(user, err = %e, "password change failed");
                self.say("\r\nError changing password.").await?;
            }
        }
        Ok(Flow::Continue)
    }

    async fn useradd(&mut self, argv: &ArgumentVector) -> io::Result<()> {
        if self.user != "root" {
            return self.say("Only root may add users.").await;
        }
        let uid = argv.arg(2).parse::<u32>().ok().filter(|id| *id >= 1000);
        let (Some(uid), true) = (uid, argv.argc() == 6 && argv.arg(1) == "-u" && argv.arg(3) == "-d") else {
            return self
                .say("The only useradd syntax supported is useradd -u <userId> -d <userHomeDirectory> <userName>.")
                .await;
        };
        match self.services.accounts.add_user(argv.arg(5), uid, argv.arg(4)).await {
            Ok(()) => {
                self.say("User created with default password changeimmediatelly. You may want to change it now.\r\n")
                    .await
            }
            Err(e) => {
                debug!(err = %e, "useradd failed");
                self.say("Error creating user. Maybe userName or userId already exist or userId is lower than 1000.")
                    .await
            }
        }
    }

    async fn userdel(&mut self, argv: &ArgumentVector) -> io::Result<()> {
        if self.user != "root" {
            return self.say("Only root may delete users.").await;
        }
        if argv.argc() != 2 {
            return self.say("The only userdel syntax supported is userdel <userName>.").await;
        }
        if argv.arg(1) == "root" {
            return self.say("A really bad idea.").await;
        }
        match self.services.accounts.remove_user(argv.arg(1)).await {
            Ok(()) => self.say("User deleted.\r\n").await,
            Err(e) => {
                debug!(err = %e, "userdel failed");
                self.say("Error deleting user.").await
            }
        }
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn storage_message(err: ConsoleError) -> String {
    match err {
        ConsoleError::Storage(message) => message,
        other => other.to_string(),
    }
}

/// `free -s <n>` with `0 < n < 300`.
fn parse_free_interval(argv: &ArgumentVector) -> Option<u64> {
    if argv.argc() != 3 || argv.arg(1) != "-s" {
        return None;
    }
    argv.arg(2)
        .parse::<u64>()
        .ok()
        .filter(|n| *n > 0 && *n < FREE_MAX_INTERVAL)
}

/// Drop CRs and expand every LF to CRLF.
pub fn normalize_line_endings(content: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(content.len() + content.len() / 16);
    for &b in content {
        match b {
            b'\r' => {}
            b'\n' => out.extend_from_slice(b"\r\n"),
            b => out.push(b),
        }
    }
    out
}

/// `HH:MM:SS up [D days, ]HH:MM:SS`, or a warning prefix when the wall
/// clock is unknown.
pub fn format_uptime(time_of_day: Option<(u32, u32, u32)>, uptime: Duration) -> String {
    let mut out = match time_of_day {
        Some((h, m, s)) => format!("{:02}:{:02}:{:02} up ", h, m, s),
        None => "Current time is not known, up time may not be accurate: ".to_string(),
    };
    let total = uptime.as_secs();
    let (days, rest) = (total / 86_400, total % 86_400);
    if days > 0 {
        out.push_str(&format!("{} days, ", days));
    }
    out.push_str(&format!(
        "{:02}:{:02}:{:02}",
        rest / 3600,
        (rest % 3600) / 60,
        rest % 60
    ));
    out
}

// ── Unit tests ──────────────────────────────────────────────────────
