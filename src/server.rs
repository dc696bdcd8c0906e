//! TCP server for Stratum clients.
//!
//! Accepts connections, registers a session for each one, spawns its handler
//! and coordinates shutdown: stop accepting, close every live session, then
//! wait for every handler to finish.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{ProxyError, ProxyResult};
use crate::hasher::HashOracle;
use crate::job::JobBook;
use crate::protocols::stratum::{handle_connection, Backend, Session, SessionSettings, StateMachine};
use crate::registry::SessionRegistry;
use crate::upstream::Upstream;

/// Pending connections the kernel may queue.
const LISTEN_BACKLOG: i32 = 1024;

/// Server instance
pub struct Server {
    local_addr: SocketAddr,
    listener: Option<TcpListener>,
    settings: SessionSettings,
    backend: Arc<Backend>,
    registry: Arc<SessionRegistry>,
    connection_limit: Arc<Semaphore>,
    tracker: TaskTracker,
    stop_accepting: CancellationToken,
    accept_task: Option<JoinHandle<()>>,
}

impl Server {
    /// Bind the listen address. Failure here is fatal to startup.
    pub async fn bind(
        config: &Config,
        oracle: Arc<dyn HashOracle>,
        upstream: Arc<dyn Upstream>,
    ) -> ProxyResult<Self> {
        let bind_error = |source: std::io::Error| ProxyError::Bind {
            addr: config.listen_addr.clone(),
            source,
        };

        let addr = tokio::net::lookup_host(&config.listen_addr)
            .await
            .map_err(bind_error)?
            .next()
            .ok_or_else(|| {
                bind_error(std::io::Error::new(
                    std::io::ErrorKind::AddrNotAvailable,
                    "address resolved to nothing",
                ))
            })?;

        let listener = create_listener(addr).map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;

        info!(
            address = %local_addr,
            upstream = %config.upstream_addr,
            oracle = oracle.name(),
            difficulty = config.difficulty,
            "Proxy listening"
        );

        Ok(Server {
            local_addr,
            listener: Some(listener),
            settings: config.session_settings(),
            backend: Arc::new(Backend::new(oracle, upstream)),
            registry: SessionRegistry::with_capacity(config.max_connections.min(1024)),
            connection_limit: Arc::new(Semaphore::new(config.max_connections)),
            tracker: TaskTracker::new(),
            stop_accepting: CancellationToken::new(),
            accept_task: None,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Jobs accepted for submission.
    ///
    /// Hook for a pool relay: nothing in this crate publishes jobs yet, so
    /// until one does every submit is hashed over its canonical fields.
    pub fn jobs(&self) -> &Arc<JobBook> {
        &self.backend.jobs
    }

    /// Number of registered sessions.
    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    /// Start accepting connections on a separate task.
    pub fn start(&mut self) {
        let Some(listener) = self.listener.take() else {
            warn!("Server already started");
            return;
        };

        let acceptor = Acceptor {
            listener,
            settings: self.settings.clone(),
            backend: Arc::clone(&self.backend),
            registry: Arc::clone(&self.registry),
            connection_limit: Arc::clone(&self.connection_limit),
            tracker: self.tracker.clone(),
            stop: self.stop_accepting.clone(),
            next_session: AtomicU64::new(1),
        };
        self.accept_task = Some(tokio::spawn(acceptor.run()));
    }

    /// Stop accepting, close every live session and wait for all handlers.
    ///
    /// Returns the number of sessions that were closed.
    pub async fn shutdown(mut self) -> usize {
        info!("Stopping accept loop");
        self.stop_accepting.cancel();
        if let Some(task) = self.accept_task.take() {
            if let Err(e) = task.await {
                error!(error = %e, "Accept loop ended abnormally");
            }
        }
        // Unstarted servers still hold their listener.
        drop(self.listener.take());

        for (session, peer) in self.registry.peers() {
            debug!(session, peer = %peer, "Closing session");
        }
        let closed = self.registry.close_all();
        info!(sessions = closed, "Closing live sessions");

        self.tracker.close();
        self.tracker.wait().await;

        let leaked = self.registry.len();
        if leaked > 0 {
            error!(leaked, "Sessions still registered after shutdown");
        }
        info!(closed, "All session handlers finished");
        closed
    }
}

/// State owned by the accept loop task.
struct Acceptor {
    listener: TcpListener,
    settings: SessionSettings,
    backend: Arc<Backend>,
    registry: Arc<SessionRegistry>,
    connection_limit: Arc<Semaphore>,
    tracker: TaskTracker,
    stop: CancellationToken,
    next_session: AtomicU64,
}

impl Acceptor {
    async fn run(self) {
        loop {
            // Wait for a connection slot
            let permit = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                permit = Arc::clone(&self.connection_limit).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let accepted = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "New connection");
                    self.spawn_session(stream, peer, permit);
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
        info!("No longer accepting connections");
    }

    fn spawn_session(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        permit: tokio::sync::OwnedSemaphorePermit,
    ) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
        }

        let session_id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let registration = self.registry.register(session_id, peer);
        let machine = StateMachine::new(
            Session::new(session_id, peer, &self.settings),
            Arc::clone(&self.backend),
        );
        let close = registration.close_token();
        let grace = self.settings.shutdown_grace;

        self.tracker.spawn(async move {
            if let Err(e) = handle_connection(stream, machine, close, grace).await {
                debug!(peer = %peer, error = %e, "Connection error");
            }
            drop(registration);
            drop(permit);
        });
    }
}

/// Create a TCP listener with SO_REUSEADDR so restarts can rebind at once.
fn create_listener(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    TcpListener::from_std(socket.into())
}
