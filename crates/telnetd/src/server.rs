//! TCP accept loop. Every admitted connection gets its own session task.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::config::{Firewall, SessionConfig};
use crate::dmesg::dmesg;
use crate::services::Services;
use crate::session::Session;

/// Back-off after a failed accept (e.g. out of file descriptors).
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

pub struct Server {
    listener: TcpListener,
    services: Services,
    config: SessionConfig,
    firewall: Firewall,
}

impl Server {
    pub async fn bind(
        addr: SocketAddr,
        services: Services,
        config: SessionConfig,
        firewall: Firewall,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            services,
            config,
            firewall,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` completes. Sessions already
    /// running are left to finish on their own.
    pub async fn serve<F>(self, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()>,
    {
        let addr = self.local_addr()?;
        dmesg(format!("[TELNET] server started on {}.", addr));
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                result = self.listener.accept() => match result {
                    Ok((stream, peer)) => self.admit(stream, peer),
                    Err(e) => {
                        warn!(err = %e, "accept failed");
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                },
                _ = &mut shutdown => break,
            }
        }

        dmesg("[TELNET] server stopped.");
        Ok(())
    }

    fn admit(&self, stream: TcpStream, peer: SocketAddr) {
        if !self.firewall.permits(peer.ip()) {
            dmesg(format!("[TELNET] firewall rejected connection from {}.", peer.ip()));
            return;
        }
        let _ = stream.set_nodelay(true);
        debug!(peer = %peer, "connection accepted");

        let session = Session::new(stream, peer.ip(), self.services.clone(), self.config.clone());
        tokio::spawn(async move {
            match session.run().await {
                Ok(()) => debug!(peer = %peer, "connection closed"),
                Err(e) => info!(peer = %peer, err = %e, "connection dropped"),
            }
        });
    }
}

/// Resolves on Ctrl-C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(err = %e, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(err = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

// ── Unit tests ──────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthMode;
    use crate::error::Result;
    use crate::services::{Accounts, Authenticator, Device, FileEntry, NetworkInfo, Storage};
    use async_trait::async_trait;
    use std::sync::Arc;
    use tokio::io::AsyncReadExt;
    use tokio::sync::oneshot;

    struct Nothing;

    #[async_trait]
    impl Authenticator for Nothing {
        async fn verify(&self, _: &str, _: &str) -> bool {
            false
        }
        async fn home_dir(&self, _: &str) -> Option<String> {
            None
        }
    }

    #[async_trait]
    impl Accounts for Nothing {
        async fn set_password(&self, _: &str, _: &str) -> Result<()> {
            Ok(())
        }
        async fn add_user(&self, _: &str, _: u32, _: &str) -> Result<()> {
            Ok(())
        }
        async fn remove_user(&self, _: &str) -> Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl Storage for Nothing {
        async fn list(&self, _: &str) -> Result<Vec<FileEntry>> {
            Ok(Vec::new())
        }
        async fn read(&self, path: &str) -> Result<Vec<u8>> {
            Err(crate::error::ConsoleError::Storage(format!("Failed to open {}", path)))
        }
        async fn remove(&self, _: &str) -> Result<()> {
            Ok(())
        }
        async fn format(&self) -> Result<()> {
            Ok(())
        }
    }

    impl NetworkInfo for Nothing {
        fn interfaces(&self) -> String {
            String::new()
        }
        fn arp_table(&self) -> String {
            String::new()
        }
        fn wireless(&self) -> String {
            String::new()
        }
    }

    impl Device for Nothing {
        fn uname(&self) -> String {
            "test".into()
        }
        fn free_memory(&self) -> Option<u64> {
            None
        }
        fn time_of_day(&self) -> Option<(u32, u32, u32)> {
            None
        }
        fn uptime(&self) -> Duration {
            Duration::ZERO
        }
        fn restart(&self) -> io::Error {
            io::Error::new(io::ErrorKind::Unsupported, "test")
        }
    }

    fn services() -> Services {
        let nothing = Arc::new(Nothing);
        Services {
            handler: None,
            auth: nothing.clone(),
            accounts: nothing.clone(),
            storage: nothing.clone(),
            network: nothing.clone(),
            device: nothing,
        }
    }

    async fn start(firewall: Firewall) -> (SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<io::Result<()>>) {
        let config = SessionConfig {
            auth: AuthMode::None,
            idle_timeout: None,
            ..SessionConfig::default()
        };
        let server = Server::bind("127.0.0.1:0".parse().unwrap(), services(), config, firewall)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(server.serve(async {
            let _ = stop_rx.await;
        }));
        (addr, stop_tx, handle)
    }

    #[tokio::test]
    async fn admitted_connection_is_greeted() {
        let (addr, stop, handle) = start(Firewall::default()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut hello = [0u8; 15];
        stream.read_exact(&mut hello).await.unwrap();
        assert_eq!(&hello, b"Hello 127.0.0.1");

        stop.send(()).unwrap();
        handle.await.unwrap().unwrap();
        assert!(crate::dmesg::global().snapshot().contains("[TELNET] server stopped."));
    }

    #[tokio::test]
    async fn firewall_closes_unlisted_peers() {
        let allow = Firewall::new(vec!["192.0.2.1".parse().unwrap()]);
        let (addr, stop, handle) = start(allow).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut buf = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
        assert!(crate::dmesg::global()
            .snapshot()
            .contains("[TELNET] firewall rejected connection from 127.0.0.1."));

        stop.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }
}
