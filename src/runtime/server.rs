//! Server bootstrap, statistics and shutdown control.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mio::Waker;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::ServerError;
use crate::handler::Router;
use crate::runtime::event_loop::NetThread;

/// Server-wide counters, updated by every network thread.
#[derive(Debug, Default)]
pub struct Stats {
    active: AtomicUsize,
    accepted: AtomicU64,
    refused: AtomicU64,
    requests: AtomicU64,
    rejected_jobs: AtomicU64,
}

/// Point-in-time copy of [`Stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub active_connections: usize,
    pub accepted: u64,
    /// Connections dropped at accept because the thread was full.
    pub refused: u64,
    /// Responses fully written.
    pub requests: u64,
    /// Requests answered 503 because a job queue was full.
    pub rejected_jobs: u64,
}

impl Stats {
    pub(crate) fn connection_opened(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn connection_closed(&self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn connection_refused(&self) {
        self.refused.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn request_completed(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn job_rejected(&self) {
        self.rejected_jobs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            active_connections: self.active.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            refused: self.refused.load(Ordering::Relaxed),
            requests: self.requests.load(Ordering::Relaxed),
            rejected_jobs: self.rejected_jobs.load(Ordering::Relaxed),
        }
    }
}

/// State shared by all network threads of one server.
pub(crate) struct Shared {
    pub config: Config,
    pub router: Router,
    pub stats: Stats,
    pub shutdown: AtomicBool,
}

/// A bound, not yet running server.
pub struct Server {
    listener: std::net::TcpListener,
    local_addr: SocketAddr,
    shared: Arc<Shared>,
}

impl Server {
    /// Bind the listening socket described by `config`.
    pub fn bind(config: Config, router: Router) -> Result<Server, ServerError> {
        let addr: SocketAddr = config
            .listen
            .parse()
            .map_err(|_| ServerError::Address(config.listen.clone()))?;
        let listener =
            create_listener(addr).map_err(|e| ServerError::Bind(config.listen.clone(), e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ServerError::Bind(config.listen.clone(), e))?;

        info!(addr = %local_addr, "Listening");

        Ok(Server {
            listener,
            local_addr,
            shared: Arc::new(Shared {
                config,
                router,
                stats: Stats::default(),
                shutdown: AtomicBool::new(false),
            }),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Spawn the network threads (and, through them, the workers).
    pub fn start(self) -> Result<ServerHandle, ServerError> {
        let net_threads = self.shared.config.net_threads;
        info!(
            addr = %self.local_addr,
            net_threads,
            workers_per_thread = self.shared.config.workers_per_thread,
            job_queue_size = self.shared.config.job_queue_size,
            "Starting network threads"
        );

        let mut handle = ServerHandle {
            local_addr: self.local_addr,
            shared: Arc::clone(&self.shared),
            wakers: Vec::with_capacity(net_threads),
            threads: Vec::with_capacity(net_threads),
        };

        for net_id in 0..net_threads {
            if let Err(e) = handle.spawn_net_thread(net_id, &self.listener) {
                handle.shutdown();
                handle.join();
                return Err(e);
            }
        }

        Ok(handle)
    }
}

/// Control handle of a running server.
pub struct ServerHandle {
    local_addr: SocketAddr,
    shared: Arc<Shared>,
    wakers: Vec<Arc<Waker>>,
    threads: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    fn spawn_net_thread(
        &mut self,
        net_id: usize,
        listener: &std::net::TcpListener,
    ) -> Result<(), ServerError> {
        let listener = listener.try_clone().map_err(ServerError::Setup)?;
        let (net, waker) =
            NetThread::new(net_id, listener, Arc::clone(&self.shared)).map_err(ServerError::Setup)?;

        let thread = thread::Builder::new()
            .name(format!("net-{net_id}"))
            .spawn(move || {
                if let Err(e) = net.run() {
                    error!(net = net_id, error = %e, "Network thread failed");
                }
            })
            .map_err(ServerError::Spawn)?;

        self.wakers.push(waker);
        self.threads.push(thread);
        Ok(())
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// How long in-flight requests get to finish after [`shutdown`].
    ///
    /// [`shutdown`]: ServerHandle::shutdown
    pub fn shutdown_grace(&self) -> Duration {
        self.shared.config.timeouts.shutdown_grace
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    /// Stop accepting and drain. Idempotent.
    ///
    /// Idle connections close at once, in-flight requests complete without
    /// keep-alive, and anything left after the grace period is dropped.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Shutdown requested");
        for waker in &self.wakers {
            if let Err(e) = waker.wake() {
                warn!(error = %e, "Failed to wake network thread");
            }
        }
    }

    /// Wait for every network thread (and its workers) to exit.
    pub fn join(self) -> StatsSnapshot {
        for thread in self.threads {
            if thread.join().is_err() {
                error!("Network thread panicked");
            }
        }
        self.shared.stats.snapshot()
    }
}

/// Create the non-blocking listening socket.
fn create_listener(addr: SocketAddr) -> std::io::Result<std::net::TcpListener> {
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
    socket.listen(1024)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_snapshot() {
        let stats = Stats::default();
        stats.connection_opened();
        stats.connection_opened();
        stats.connection_closed();
        stats.request_completed();
        stats.job_rejected();
        stats.connection_refused();

        assert_eq!(
            stats.snapshot(),
            StatsSnapshot {
                active_connections: 1,
                accepted: 2,
                refused: 1,
                requests: 1,
                rejected_jobs: 1,
            }
        );
    }

    #[test]
    fn test_bind_rejects_bad_address() {
        let config = Config {
            listen: "not an address".into(),
            ..Config::default()
        };
        assert!(matches!(
            Server::bind(config, Router::new()),
            Err(ServerError::Address(_))
        ));
    }

    #[test]
    fn test_bind_ephemeral_port() {
        let config = Config {
            listen: "127.0.0.1:0".into(),
            ..Config::default()
        };
        let server = Server::bind(config, Router::new()).unwrap();
        assert_ne!(server.local_addr().port(), 0);
    }
}
