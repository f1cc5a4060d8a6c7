//! Proxy instance: one listening socket and its accept loop.
//!
//! Lifecycle: `Unbound` -> `Listening` (after `listen`) -> `Serving`
//! (while `serve` runs) -> `Closed`. `Closed` is terminal; a closed
//! instance never accepts again.
//!
//! Every accepted connection gets its own task running
//! [`handle_connection`](super::connection::handle_connection). The accept
//! loop never waits on those tasks, and `close` does not drain them.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, Instrument};

use super::classify::{classify, ErrorClass, IoOp};
use super::connection::handle_connection;
use crate::config::ProxyConfig;
use crate::error::{PppxyError, Result};

/// Pause after an accept error that is not a shutdown, so a persistent
/// failure (e.g. EMFILE) does not spin the loop.
pub const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(100);

/// Counters for one instance.
#[derive(Debug, Default)]
pub struct InstanceStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connections whose handler is still running.
    pub connections_active: AtomicU64,
    /// Connections whose handler has returned.
    pub connections_closed: AtomicU64,
    /// Backend dial failures.
    pub dial_failures: AtomicU64,
    /// PROXY header write failures.
    pub header_failures: AtomicU64,
    /// Bytes relayed client -> backend.
    pub bytes_to_backend: AtomicU64,
    /// Bytes relayed backend -> client.
    pub bytes_from_backend: AtomicU64,
}

/// Keeps the active/closed counters right even if the handler panics.
struct ConnectionGuard(Arc<InstanceStats>);

impl ConnectionGuard {
    fn new(stats: Arc<InstanceStats>) -> Self {
        stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
        stats.connections_active.fetch_add(1, Ordering::Relaxed);
        Self(stats)
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.connections_active.fetch_sub(1, Ordering::Relaxed);
        self.0.connections_closed.fetch_add(1, Ordering::Relaxed);
    }
}

enum Lifecycle {
    Unbound,
    Listening(TcpListener),
    Serving {
        shutdown: oneshot::Sender<()>,
        stopped: oneshot::Receiver<()>,
    },
    Closed,
}

/// A relay bound to one listen address.
pub struct ProxyInstance {
    config: Arc<ProxyConfig>,
    lifecycle: Mutex<Lifecycle>,
    local_addr: OnceLock<SocketAddr>,
    stats: Arc<InstanceStats>,
}

impl ProxyInstance {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            config: Arc::new(config),
            lifecycle: Mutex::new(Lifecycle::Unbound),
            local_addr: OnceLock::new(),
            stats: Arc::new(InstanceStats::default()),
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn stats(&self) -> &InstanceStats {
        &self.stats
    }

    /// Address the listener is bound to, once `listen` has succeeded.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn addr(&self) -> String {
        self.config.listen_addr.clone()
    }

    /// Bind the configured listen address.
    ///
    /// A bind error is fatal for this instance; do not call `serve` after it.
    pub async fn listen(&self) -> Result<SocketAddr> {
        {
            let lifecycle = self.lifecycle();
            match *lifecycle {
                Lifecycle::Unbound => {}
                Lifecycle::Closed => return Err(PppxyError::InstanceClosed { addr: self.addr() }),
                _ => return Err(PppxyError::AlreadyListening { addr: self.addr() }),
            }
        }

        let bind_addr = self.config.bind_addr();
        let bound = match TcpListener::bind(&*bind_addr).await {
            Err(e) if ipv6_unavailable(&e) => match self.config.ipv4_fallback_addr() {
                Some(fallback) => {
                    debug!(
                        bind_addr = %bind_addr,
                        fallback = %fallback,
                        error = %e,
                        "IPv6 unavailable, binding IPv4 only"
                    );
                    TcpListener::bind(fallback.as_str()).await
                }
                None => Err(e),
            },
            other => other,
        };
        let listener = bound.map_err(|source| PppxyError::Bind {
            addr: self.addr(),
            source,
        })?;
        let local_addr = listener.local_addr().map_err(|source| PppxyError::Bind {
            addr: self.addr(),
            source,
        })?;

        {
            let mut lifecycle = self.lifecycle();
            if matches!(*lifecycle, Lifecycle::Unbound) {
                *lifecycle = Lifecycle::Listening(listener);
            } else if matches!(*lifecycle, Lifecycle::Closed) {
                // Closed while the bind was in flight; the new socket is dropped here
                return Err(PppxyError::InstanceClosed { addr: self.addr() });
            } else {
                return Err(PppxyError::AlreadyListening { addr: self.addr() });
            }
        }
        let _ = self.local_addr.set(local_addr);

        info!(
            listen_addr = %self.config.listen_addr,
            local_addr = %local_addr,
            backend_addr = %self.config.backend_addr,
            proxy_protocol_version = %self.config.proxy_protocol_version,
            "Listening"
        );

        Ok(local_addr)
    }

    /// Run the accept loop until `close` is called.
    pub async fn serve(&self) -> Result<()> {
        let (listener, shutdown_rx, stopped_tx) = {
            let mut lifecycle = self.lifecycle();
            match std::mem::replace(&mut *lifecycle, Lifecycle::Closed) {
                Lifecycle::Listening(listener) => {
                    let (shutdown_tx, shutdown_rx) = oneshot::channel();
                    let (stopped_tx, stopped_rx) = oneshot::channel();
                    *lifecycle = Lifecycle::Serving {
                        shutdown: shutdown_tx,
                        stopped: stopped_rx,
                    };
                    (listener, shutdown_rx, stopped_tx)
                }
                Lifecycle::Closed => {
                    debug!(listen_addr = %self.config.listen_addr, "Instance closed before serving");
                    return Ok(());
                }
                Lifecycle::Unbound => {
                    *lifecycle = Lifecycle::Unbound;
                    return Err(PppxyError::NotListening { addr: self.addr() });
                }
                serving @ Lifecycle::Serving { .. } => {
                    *lifecycle = serving;
                    return Err(PppxyError::AlreadyListening { addr: self.addr() });
                }
            }
        };

        let span = tracing::info_span!("pppxy", listen_addr = %self.config.listen_addr);
        self.accept_loop(listener, shutdown_rx).instrument(span).await;

        // The listener is dropped by now; let `close` return
        let _ = stopped_tx.send(());
        Ok(())
    }

    /// Bind, then run the accept loop on a new task.
    pub async fn start(self: &Arc<Self>) -> Result<JoinHandle<Result<()>>> {
        self.listen().await?;
        let instance = Arc::clone(self);
        Ok(tokio::spawn(async move { instance.serve().await }))
    }

    /// Stop accepting and release the listening socket.
    ///
    /// Idempotent. In-flight connections are left to finish on their own.
    pub async fn close(&self) -> Result<()> {
        let previous = std::mem::replace(&mut *self.lifecycle(), Lifecycle::Closed);

        match previous {
            Lifecycle::Unbound | Lifecycle::Closed => Ok(()),
            Lifecycle::Listening(listener) => {
                drop(listener);
                debug!(listen_addr = %self.config.listen_addr, "Listener closed before serving");
                Ok(())
            }
            Lifecycle::Serving { shutdown, stopped } => {
                let _ = shutdown.send(());
                stopped.await.map_err(|_| PppxyError::AcceptLoopLost { addr: self.addr() })?;
                info!(
                    listen_addr = %self.config.listen_addr,
                    active_connections = self.stats.connections_active.load(Ordering::Relaxed),
                    "Listener closed"
                );
                Ok(())
            }
        }
    }

    async fn accept_loop(&self, listener: TcpListener, mut shutdown: oneshot::Receiver<()>) {
        loop {
            tokio::select! {
                biased;

                // Fires on `close`, or if the sender is dropped without sending
                _ = &mut shutdown => {
                    info!("Listener closed, stopping server");
                    break;
                }

                accepted = listener.accept() => match accepted {
                    Ok((stream, client_addr)) => {
                        debug!(client = %client_addr, "Accepted connection");

                        let guard = ConnectionGuard::new(Arc::clone(&self.stats));
                        let config = Arc::clone(&self.config);
                        let stats = Arc::clone(&self.stats);

                        tokio::spawn(
                            async move {
                                handle_connection(config, stats, stream, client_addr).await;
                                drop(guard);
                            }
                            .instrument(tracing::info_span!("connection", client = %client_addr)),
                        );
                    }
                    Err(e) => match classify(IoOp::Accept, &e) {
                        ErrorClass::BenignShutdown => {
                            info!(error = %e, "Listener closed, stopping server");
                            break;
                        }
                        _ => {
                            error!(error = %e, "Error accepting connection");
                            tokio::select! {
                                _ = &mut shutdown => {
                                    info!("Listener closed, stopping server");
                                    break;
                                }
                                _ = tokio::time::sleep(ACCEPT_ERROR_PAUSE) => {}
                            }
                        }
                    },
                },
            }
        }

        drop(listener);
    }
}

/// The host cannot bind the IPv6 wildcard at all (IPv6 disabled or absent).
fn ipv6_unavailable(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EAFNOSUPPORT) | Some(libc::EADDRNOTAVAIL)
    )
}
