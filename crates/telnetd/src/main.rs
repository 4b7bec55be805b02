//! relay-telnetd: serve the administration console on a TCP port.
//!
//! Usage: relay-telnetd [--port 23] [--auth none|credentials] [--root <dir>] ...

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use relay_telnetd::dmesg::dmesg;
use relay_telnetd::host::{HostDevice, HostNetwork, HostStorage, UserFile};
use relay_telnetd::server::{shutdown_signal, Server};
use relay_telnetd::{Cli, Services};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let storage = HostStorage::new(&cli.root)
        .with_context(|| format!("cannot use {} as storage root", cli.root.display()))?;
    let users_path = cli.users_path();
    let users = Arc::new(
        UserFile::open(&users_path)
            .with_context(|| format!("cannot load accounts from {}", users_path.display()))?,
    );
    let services = Services {
        handler: None,
        auth: users.clone(),
        accounts: users,
        storage: Arc::new(storage),
        network: Arc::new(HostNetwork),
        device: Arc::new(HostDevice::new(cli.hostname.clone())),
    };

    let addr = SocketAddr::new(cli.bind, cli.port);
    let server = match Server::bind(addr, services, cli.session_config(), cli.firewall()).await {
        Ok(server) => server,
        Err(e) => {
            dmesg("[TELNET] couldn't start Telnet server.");
            return Err(e).with_context(|| format!("cannot listen on {}", addr));
        }
    };
    info!(addr = %server.local_addr()?, auth = ?cli.auth, root = %cli.root.display(), "listening");

    server.serve(shutdown_signal()).await?;
    Ok(())
}
