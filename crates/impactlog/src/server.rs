//! TCP accept loop.
//!
//! The server runs on a single-threaded runtime inside a
//! [`tokio::task::LocalSet`]. Every accepted connection becomes its own local
//! task, so a slow client never blocks the others, and the shared state in
//! [`ServerContext`] needs no locking beyond a `RefCell`.

use std::cell::RefCell;
use std::net::{IpAddr, SocketAddr};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::access::AccessControl;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::event_log::EventLog;
use crate::handler::ConnectionHandler;
use crate::render::PageAssets;

/// Pause after a failed `accept` before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// State shared by every connection on the server task.
#[derive(Debug)]
pub struct ServerContext {
    log: Arc<EventLog>,
    access: RefCell<AccessControl>,
    assets: PageAssets,
    flush_threshold: usize,
    idle_timeout: Option<Duration>,
}

impl ServerContext {
    /// Build the context from configuration.
    #[must_use]
    pub fn new(config: &Config, log: Arc<EventLog>) -> Self {
        Self {
            log,
            access: RefCell::new(AccessControl::new(&config.access)),
            assets: PageAssets::from_config(&config.server),
            flush_threshold: config.server.flush_threshold,
            idle_timeout: config.server.idle_timeout(),
        }
    }

    /// The event log being served.
    #[must_use]
    pub fn log(&self) -> &EventLog {
        &self.log
    }

    /// Access control state. Never hold the borrow across an `.await`.
    #[must_use]
    pub fn access(&self) -> &RefCell<AccessControl> {
        &self.access
    }

    /// Page assets.
    #[must_use]
    pub fn assets(&self) -> &PageAssets {
        &self.assets
    }

    /// Buffered bytes that trigger a socket write.
    #[must_use]
    pub fn flush_threshold(&self) -> usize {
        self.flush_threshold
    }

    /// Per-connection deadline, if any.
    #[must_use]
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    /// Clients currently tracked by the rate limiter.
    #[must_use]
    pub fn tracked_clients(&self) -> usize {
        self.access.borrow().tracked_clients()
    }
}

/// A bound listener ready to serve.
#[derive(Debug)]
pub struct Server {
    listener: TcpListener,
    ctx: Rc<ServerContext>,
}

impl Server {
    /// Bind to the configured address and port.
    ///
    /// # Errors
    ///
    /// Returns an error if the bind address is not an IP address or the
    /// socket cannot be bound.
    pub async fn bind(config: &Config, log: Arc<EventLog>) -> Result<Self> {
        let address = &config.server.bind_address;
        let ip: IpAddr = address.parse().map_err(|_| Error::InvalidBindAddress {
            address: address.clone(),
        })?;
        let addr = SocketAddr::new(ip, config.server.port);

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| Error::Bind { addr, source })?;

        Ok(Self {
            listener,
            ctx: Rc::new(ServerContext::new(config, log)),
        })
    }

    /// Address actually bound; useful when the configured port was 0.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot report its address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Shared connection state.
    #[must_use]
    pub fn context(&self) -> &Rc<ServerContext> {
        &self.ctx
    }

    /// Accept connections forever.
    ///
    /// Must be polled inside a [`tokio::task::LocalSet`]. Accept failures are
    /// logged and retried; they never end the loop.
    pub async fn serve(self) {
        if let Ok(addr) = self.listener.local_addr() {
            info!("Serving impact log on http://{addr}/");
        }

        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    if let Err(err) = stream.set_nodelay(true) {
                        debug!(%peer, "Could not set TCP_NODELAY: {err}");
                    }
                    let ctx = Rc::clone(&self.ctx);
                    tokio::task::spawn_local(async move {
                        let outcome = ConnectionHandler::new(stream, Some(peer), ctx).run().await;
                        debug!(%peer, ?outcome, "Connection closed");
                    });
                }
                Err(err) => {
                    warn!("Failed to accept connection: {err}");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::task::LocalSet;

    fn loopback_config() -> Config {
        let mut config = Config::default();
        config.server.bind_address = "127.0.0.1".to_string();
        config.server.port = 0;
        config.access.allowed_prefix = "127.0.0.".to_string();
        config
    }

    fn event_log(dir: &tempfile::TempDir, config: &Config) -> Arc<EventLog> {
        Arc::new(EventLog::create(dir.path().join("impacts.csv"), &config.log.columns).unwrap())
    }

    async fn fetch(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(format!("GET {path} HTTP/1.1\r\nHost: test\r\n\r\n").as_bytes())
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_serves_status_over_tcp() {
        let dir = tempfile::tempdir().unwrap();
        let config = loopback_config();
        let log = event_log(&dir, &config);
        log.append("00:00:500", "2.80g").unwrap();

        let server = Server::bind(&config, Arc::clone(&log)).await.unwrap();
        let addr = server.local_addr().unwrap();

        LocalSet::new()
            .run_until(async move {
                tokio::task::spawn_local(server.serve());

                let response = fetch(addr, "/status").await;
                assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
                assert!(response.ends_with("\r\n\r\n1"));

                log.append("00:01:500", "3.10g").unwrap();
                let response = fetch(addr, "/status").await;
                assert!(response.ends_with("\r\n\r\n2"));
            })
            .await;
    }

    #[tokio::test]
    async fn test_rate_limit_over_tcp() {
        let dir = tempfile::tempdir().unwrap();
        let config = loopback_config();
        let server = Server::bind(&config, event_log(&dir, &config)).await.unwrap();
        let addr = server.local_addr().unwrap();
        let ctx = Rc::clone(server.context());

        LocalSet::new()
            .run_until(async move {
                tokio::task::spawn_local(server.serve());

                for _ in 0..10 {
                    assert!(fetch(addr, "/status").await.starts_with("HTTP/1.1 200"));
                }
                let response = fetch(addr, "/status").await;
                assert!(response.starts_with("HTTP/1.1 429 Too Many Requests\r\n"));
                assert_eq!(ctx.tracked_clients(), 1);
            })
            .await;
    }

    #[tokio::test]
    async fn test_stalled_client_does_not_block_others() {
        let dir = tempfile::tempdir().unwrap();
        let config = loopback_config();
        let server = Server::bind(&config, event_log(&dir, &config)).await.unwrap();
        let addr = server.local_addr().unwrap();

        LocalSet::new()
            .run_until(async move {
                tokio::task::spawn_local(server.serve());

                let mut stalled = TcpStream::connect(addr).await.unwrap();
                stalled.write_all(b"GET /status HTTP/1.1\r\n").await.unwrap();

                let response = tokio::time::timeout(Duration::from_secs(5), fetch(addr, "/"))
                    .await
                    .unwrap();
                assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
                assert!(response.contains("</html>"));
            })
            .await;
    }

    #[tokio::test]
    async fn test_invalid_bind_address() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = loopback_config();
        config.server.bind_address = "not-an-ip".to_string();

        let err = Server::bind(&config, event_log(&dir, &config))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidBindAddress { .. }));
    }

    #[tokio::test]
    async fn test_bind_conflict_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = loopback_config();
        let first = Server::bind(&config, event_log(&dir, &config)).await.unwrap();
        config.server.port = first.local_addr().unwrap().port();

        let err = Server::bind(&config, event_log(&dir, &config))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Bind { .. }));
    }

    #[test]
    fn test_context_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = loopback_config();
        config.server.flush_threshold = 512;
        config.server.idle_timeout_ms = 1500;

        let ctx = ServerContext::new(&config, event_log(&dir, &config));
        assert_eq!(ctx.flush_threshold(), 512);
        assert_eq!(ctx.idle_timeout(), Some(Duration::from_millis(1500)));
        assert_eq!(ctx.tracked_clients(), 0);
        assert_eq!(ctx.log().current_version(), 0);
    }
}
