//! Admin and public listeners
//!
//! The admin listener is a one-shot service on a local Unix socket: it
//! accepts a single connection, serves one session and terminates. The
//! public listener accepts TCP connections until the process stops.

use std::{
    future::Future,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use tokio::{
    net::{TcpListener, TcpSocket, UnixListener},
    sync::{watch, Semaphore},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::config::{Config, Scheduling};
use crate::dispatch::DispatchTable;
use crate::error::{ConfigurationError, RelayError, ResourceError, Result, TransportError};
use crate::scratch::ScratchSpace;
use crate::session::{SessionHandler, SessionReport};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);
const LISTEN_BACKLOG: u32 = 1024;

/// Observable lifecycle of the admin listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminLifecycle {
    Started,
    ServedOneConnection,
    Terminated,
}

/// Removes the socket file when dropped
#[derive(Debug)]
struct SocketFileGuard {
    path: PathBuf,
}

impl Drop for SocketFileGuard {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed socket file {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove socket file {}: {}", self.path.display(), e),
        }
    }
}

/// One-shot listener on a Unix socket
#[derive(Debug)]
pub struct AdminListener {
    listener: UnixListener,
    guard: SocketFileGuard,
    lifecycle: watch::Sender<AdminLifecycle>,
}

impl AdminListener {
    /// Bind at `path`, replacing a stale socket file
    pub fn bind(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        match std::fs::remove_file(&path) {
            Ok(()) => debug!("Removed stale socket file {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => return Err(bind_error("admin", path.display().to_string(), source)),
        }

        let listener = UnixListener::bind(&path)
            .map_err(|source| bind_error("admin", path.display().to_string(), source))?;
        let (lifecycle, _) = watch::channel(AdminLifecycle::Started);

        info!("Admin listener bound at {}", path.display());
        Ok(Self {
            listener,
            guard: SocketFileGuard { path },
            lifecycle,
        })
    }

    pub fn path(&self) -> &Path {
        &self.guard.path
    }

    pub fn lifecycle(&self) -> watch::Receiver<AdminLifecycle> {
        self.lifecycle.subscribe()
    }

    /// Accept one connection, serve it, and stop
    pub async fn run(self, handler: SessionHandler) -> Result<SessionReport> {
        let AdminListener {
            listener,
            guard,
            lifecycle,
        } = self;

        let accepted = listener.accept().await;
        // no second connection, with or without a successful accept
        drop(listener);
        drop(guard);

        let (stream, _) = match accepted {
            Ok(connection) => connection,
            Err(source) => {
                lifecycle.send_replace(AdminLifecycle::Terminated);
                return Err(TransportError::Io {
                    operation: "admin accept",
                    source,
                }
                .into());
            }
        };

        info!("Admin connection accepted");
        let report = handler.handle(stream, "admin").await;
        lifecycle.send_replace(AdminLifecycle::ServedOneConnection);

        info!("Admin listener terminated");
        lifecycle.send_replace(AdminLifecycle::Terminated);
        Ok(report)
    }
}

/// TCP listener that accepts forever
#[derive(Debug)]
pub struct PublicListener {
    listener: TcpListener,
    scheduling: Scheduling,
    max_connections: usize,
}

impl PublicListener {
    /// Bind `address` with address reuse enabled
    pub fn bind(address: SocketAddr, scheduling: Scheduling, max_connections: usize) -> Result<Self> {
        let shown = address.to_string();
        let socket = if address.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(|source| bind_error("public", shown.clone(), source))?;

        socket
            .set_reuseaddr(true)
            .map_err(|source| bind_error("public", shown.clone(), source))?;
        socket
            .bind(address)
            .map_err(|source| bind_error("public", shown.clone(), source))?;
        let listener = socket
            .listen(LISTEN_BACKLOG)
            .map_err(|source| bind_error("public", shown.clone(), source))?;

        info!("Public listener bound at {} ({:?} scheduling)", shown, scheduling);
        Ok(Self {
            listener,
            scheduling,
            max_connections: max_connections.max(1),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the task is cancelled
    pub async fn run(self, handler: SessionHandler) -> Result<()> {
        let limiter = Arc::new(Semaphore::new(self.max_connections));

        loop {
            let permit = match self.scheduling {
                Scheduling::Parallel => match limiter.clone().acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(_) => return Ok(()),
                },
                Scheduling::Serial => None,
            };

            let (stream, peer) = match self.listener.accept().await {
                Ok(connection) => connection,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };
            let peer = peer.to_string();
            debug!("Accepted connection from {}", peer);

            match self.scheduling {
                Scheduling::Serial => {
                    log_report(&handler.handle(stream, &peer).await);
                }
                Scheduling::Parallel => {
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        log_report(&handler.handle(stream, &peer).await);
                    });
                }
            }
        }
    }
}

fn log_report(report: &SessionReport) {
    match &report.error {
        None => debug!("Session {} closed cleanly", report.id),
        Some(e) => debug!("Session {} ended with error: {}", report.id, e),
    }
}

fn bind_error(listener: &'static str, address: String, source: std::io::Error) -> RelayError {
    ResourceError::Bind {
        listener,
        address,
        source,
    }
    .into()
}

/// Both listeners, bound and ready to serve
#[derive(Debug)]
pub struct RelayServer {
    handler: SessionHandler,
    admin: Option<AdminListener>,
    public: Option<PublicListener>,
}

impl RelayServer {
    /// Build the standard dispatch table and bind the enabled listeners
    pub fn from_config(config: &Config) -> Result<Self> {
        let table = DispatchTable::standard(&config.engines)?;
        let scratch = ScratchSpace::new(config.scratch_dir())?;
        let handler = SessionHandler::new(Arc::new(table), scratch, config.limits.session_limits());
        Self::bind(config, handler)
    }

    /// Bind the enabled listeners around an existing handler
    pub fn bind(config: &Config, handler: SessionHandler) -> Result<Self> {
        if !config.server.enable_admin && !config.server.enable_public {
            return Err(ConfigurationError::ValidationFailed {
                section: "server".to_string(),
                reason: "No listener enabled".to_string(),
            }
            .into());
        }

        let public = if config.server.enable_public {
            Some(PublicListener::bind(
                config.server.public_address()?,
                config.server.scheduling,
                config.server.max_connections,
            )?)
        } else {
            None
        };

        let admin = if config.server.enable_admin {
            Some(AdminListener::bind(&config.server.admin_socket)?)
        } else {
            None
        };

        Ok(Self {
            handler,
            admin,
            public,
        })
    }

    pub fn public_addr(&self) -> Option<SocketAddr> {
        self.public.as_ref().and_then(|p| p.local_addr().ok())
    }

    pub fn admin_lifecycle(&self) -> Option<watch::Receiver<AdminLifecycle>> {
        self.admin.as_ref().map(AdminListener::lifecycle)
    }

    /// Serve until `shutdown` resolves, then stop both listeners
    pub async fn serve_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future,
    {
        let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

        if let Some(admin) = self.admin {
            let handler = self.handler.clone();
            tasks.push((
                "admin",
                tokio::spawn(async move {
                    if let Err(e) = admin.run(handler).await {
                        error!("Admin listener failed: {}", e);
                    }
                }),
            ));
        }

        if let Some(public) = self.public {
            let handler = self.handler.clone();
            tasks.push((
                "public",
                tokio::spawn(async move {
                    if let Err(e) = public.run(handler).await {
                        error!("Public listener failed: {}", e);
                    }
                }),
            ));
        }

        info!("Relay server running");
        shutdown.await;
        info!("Shutting down listeners");

        for (name, task) in tasks {
            task.abort();
            match task.await {
                Ok(()) => debug!("{} listener already finished", name),
                Err(e) if e.is_cancelled() => debug!("{} listener stopped", name),
                Err(e) => warn!("{} listener panicked: {}", name, e),
            }
        }

        Ok(())
    }

    /// Serve until Ctrl+C
    pub async fn serve(self) -> Result<()> {
        self.serve_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Received Ctrl+C, initiating shutdown");
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionLimits;
    use crate::wire::{read_token, write_token, MAX_TEXT_LEN};
    use tempfile::TempDir;
    use tokio::io::BufReader;
    use tokio::net::{TcpStream, UnixStream};

    fn handler(dir: &Path) -> SessionHandler {
        let table = DispatchTable::standard(&Default::default()).unwrap();
        SessionHandler::new(
            Arc::new(table),
            ScratchSpace::new(dir.join("scratch")).unwrap(),
            SessionLimits::default(),
        )
    }

    #[tokio::test]
    async fn test_admin_replaces_stale_socket_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("admin.sock");
        std::fs::write(&path, b"stale").unwrap();

        let admin = AdminListener::bind(&path).unwrap();
        assert_eq!(admin.path(), path);
        assert_eq!(*admin.lifecycle().borrow(), AdminLifecycle::Started);

        drop(admin);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_admin_serves_exactly_one_connection() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("admin.sock");

        let admin = AdminListener::bind(&path).unwrap();
        let mut lifecycle = admin.lifecycle();
        let task = tokio::spawn(admin.run(handler(dir.path())));

        let first = UnixStream::connect(&path).await.unwrap();
        drop(first);

        let report = task.await.unwrap().unwrap();
        assert!(!report.is_success());

        lifecycle
            .wait_for(|state| *state == AdminLifecycle::Terminated)
            .await
            .unwrap();
        assert!(UnixStream::connect(&path).await.is_err());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_public_bind_reports_address() {
        let dir = TempDir::new().unwrap();
        let public = PublicListener::bind("127.0.0.1:0".parse().unwrap(), Scheduling::Serial, 4).unwrap();
        let addr = public.local_addr().unwrap();
        assert_ne!(addr.port(), 0);

        let task = tokio::spawn(public.run(handler(dir.path())));
        let stream = TcpStream::connect(addr).await.unwrap();
        drop(stream);
        task.abort();
    }

    #[tokio::test]
    async fn test_serial_scheduling_waits_for_current_session() {
        let dir = TempDir::new().unwrap();
        let public = PublicListener::bind("127.0.0.1:0".parse().unwrap(), Scheduling::Serial, 4).unwrap();
        let addr = public.local_addr().unwrap();
        let task = tokio::spawn(public.run(handler(dir.path())));

        // first session stalls after its menu
        let mut first = BufReader::new(TcpStream::connect(addr).await.unwrap());
        write_token(&mut first, "bmp", "extension").await.unwrap();
        let menu = read_token(&mut first, MAX_TEXT_LEN, "menu").await.unwrap();
        assert_eq!(menu, "7. BMP to JPEG\n8. BMP to PNG\n");

        let mut second = BufReader::new(TcpStream::connect(addr).await.unwrap());
        write_token(&mut second, "png", "extension").await.unwrap();
        let withheld = tokio::time::timeout(
            Duration::from_millis(200),
            read_token(&mut second, MAX_TEXT_LEN, "menu"),
        )
        .await;
        assert!(withheld.is_err());

        drop(first);
        let menu = tokio::time::timeout(
            Duration::from_secs(5),
            read_token(&mut second, MAX_TEXT_LEN, "menu"),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(menu, "11. PNG to BMP\n12. PNG to JPEG\n");

        task.abort();
    }

    #[tokio::test]
    async fn test_bind_conflict_is_resource_error() {
        let first = PublicListener::bind("127.0.0.1:0".parse().unwrap(), Scheduling::Parallel, 4).unwrap();
        let addr = first.local_addr().unwrap();

        let second = PublicListener::bind(addr, Scheduling::Parallel, 4);
        assert!(matches!(
            second,
            Err(RelayError::Resource(ResourceError::Bind { listener: "public", .. }))
        ));
    }

    #[tokio::test]
    async fn test_server_requires_a_listener() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.server.enable_admin = false;
        config.server.enable_public = false;

        let result = RelayServer::bind(&config, handler(dir.path()));
        assert!(matches!(result, Err(RelayError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_shutdown_removes_admin_socket() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.server.admin_socket = dir.path().join("admin.sock");
        config.server.bind_address = "127.0.0.1".to_string();
        config.server.port = 0;

        let server = RelayServer::bind(&config, handler(dir.path())).unwrap();
        assert!(server.public_addr().is_some());
        assert!(config.server.admin_socket.exists());

        server.serve_until(async {}).await.unwrap();
        assert!(!config.server.admin_socket.exists());
    }
}
