//! Network thread event loop.
//!
//! Readiness-based: sockets are registered once, edge-triggered, for both
//! directions, and each event simply drives the connection's state machine.
//! The loop also fires connection timers, collects finished jobs from the
//! workers and runs the shutdown drain.

use std::io;
use std::mem;
use std::sync::atomic::Ordering;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use socket2::SockRef;
use tracing::{debug, error, info, warn};

use crate::runtime::connection::{ConnectionRegistry, Env};
use crate::runtime::jobs::{Completion, Job, JobQueue};
use crate::runtime::server::Shared;
use crate::runtime::timer::TimerHeap;
use crate::runtime::worker::spawn_workers;

const LISTENER_TOKEN: Token = Token(usize::MAX);
const WAKER_TOKEN: Token = Token(usize::MAX - 1);

/// Longest single poll wait, so a shutdown flag set without a wake-up is
/// still noticed.
const MAX_POLL_WAIT: Duration = Duration::from_millis(500);

/// One network thread: its poller, connections, timers and worker pool.
pub(crate) struct NetThread {
    id: usize,
    poll: Poll,
    events: Events,
    ready: Vec<Token>,
    listener: TcpListener,
    waker: Arc<Waker>,
    shared: Arc<Shared>,
    connections: ConnectionRegistry<TcpStream>,
    timers: TimerHeap,
    jobs: Arc<JobQueue<Job>>,
    completion_tx: Sender<Completion>,
    completions: Receiver<Completion>,
    workers: Vec<JoinHandle<()>>,
}

impl NetThread {
    /// Set up the poller and register the shared listener.
    ///
    /// Returns the waker the server uses to interrupt this thread.
    pub fn new(
        id: usize,
        listener: std::net::TcpListener,
        shared: Arc<Shared>,
    ) -> io::Result<(Self, Arc<Waker>)> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let mut listener = TcpListener::from_std(listener);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        let (completion_tx, completions) = mpsc::channel();
        let config = &shared.config;
        let net = NetThread {
            id,
            poll,
            events: Events::with_capacity(config.events_capacity),
            ready: Vec::with_capacity(config.events_capacity),
            listener,
            waker: Arc::clone(&waker),
            connections: ConnectionRegistry::new(config.max_connections),
            timers: TimerHeap::new(),
            jobs: Arc::new(JobQueue::new(config.job_queue_size)),
            completion_tx,
            completions,
            workers: Vec::new(),
            shared,
        };
        Ok((net, waker))
    }

    /// Serve until shutdown has drained every connection.
    pub fn run(mut self) -> io::Result<()> {
        let shared = Arc::clone(&self.shared);
        let jobs = Arc::clone(&self.jobs);
        let config = &shared.config;

        self.workers = spawn_workers(
            self.id,
            config.workers_per_thread,
            &jobs,
            &self.completion_tx,
            &self.waker,
        )?;

        info!(
            net = self.id,
            workers = config.workers_per_thread,
            max_connections = config.max_connections,
            "Network thread started"
        );

        let mut drain_deadline: Option<Instant> = None;
        let result = loop {
            let now = Instant::now();
            if drain_deadline.is_none() && shared.shutdown.load(Ordering::Acquire) {
                drain_deadline = Some(now + config.timeouts.shutdown_grace);
                self.begin_drain();
            }
            if let Some(deadline) = drain_deadline {
                if now >= deadline && !self.connections.is_empty() {
                    self.force_close_all();
                }
                if self.connections.is_empty() {
                    break Ok(());
                }
            }

            let timeout = self
                .timers
                .next_timeout(now)
                .map_or(MAX_POLL_WAIT, |t| t.min(MAX_POLL_WAIT));
            match self.poll.poll(&mut self.events, Some(timeout)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => break Err(e),
            }

            let now = Instant::now();
            let env = Env {
                router: &shared.router,
                limits: &config.limits,
                timeouts: &config.timeouts,
                jobs: &jobs,
                stats: &shared.stats,
                shutdown: drain_deadline.is_some(),
            };

            let mut ready = mem::take(&mut self.ready);
            ready.extend(self.events.iter().map(|event| event.token()));
            for token in ready.drain(..) {
                match token {
                    LISTENER_TOKEN => self.accept_connections(&env, now),
                    WAKER_TOKEN => {}
                    Token(index) => self.handle_event(index, &env, now),
                }
            }
            self.ready = ready;

            self.collect_completions(&env, now);
            self.fire_timers(now);
        };

        jobs.shut_down();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!(net = self.id, "Worker panicked");
            }
        }
        info!(net = self.id, "Network thread stopped");
        result
    }

    fn accept_connections(&mut self, env: &Env<'_>, now: Instant) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    {
                        let socket = SockRef::from(&stream);
                        if let Err(e) = socket.set_nodelay(true) {
                            debug!(error = %e, "Failed to set TCP_NODELAY");
                        }
                        if let Err(e) = socket.set_keepalive(true) {
                            debug!(error = %e, "Failed to set SO_KEEPALIVE");
                        }
                    }

                    let conn = match self.connections.insert(stream, Some(peer)) {
                        Ok(conn) => conn,
                        Err(_) => {
                            warn!(net = self.id, peer = %peer, "Connection limit reached");
                            env.stats.connection_refused();
                            continue;
                        }
                    };
                    let id = conn.id();
                    if let Err(e) = self.poll.registry().register(
                        &mut conn.stream,
                        Token(id.index),
                        Interest::READABLE | Interest::WRITABLE,
                    ) {
                        warn!(net = self.id, error = %e, "Failed to register connection");
                        self.connections.remove(id.index);
                        continue;
                    }

                    env.stats.connection_opened();
                    debug!(net = self.id, conn_id = id.index, peer = %peer, "Accepted connection");
                    conn.open(env, now);
                    self.settle(id.index);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!(net = self.id, error = %e, "Accept error");
                    break;
                }
            }
        }
    }

    fn handle_event(&mut self, index: usize, env: &Env<'_>, now: Instant) {
        if let Some(conn) = self.connections.get_by_index(index) {
            conn.on_ready(env, now);
            self.settle(index);
        }
    }

    fn collect_completions(&mut self, env: &Env<'_>, now: Instant) {
        while let Ok(completion) = self.completions.try_recv() {
            let id = completion.conn;
            match self.connections.get_mut(id) {
                Some(conn) => {
                    conn.on_job_done(completion, env, now);
                    self.settle(id.index);
                }
                None => debug!(
                    net = self.id,
                    conn_id = id.index,
                    "Completion for a closed connection dropped"
                ),
            }
        }
    }

    fn fire_timers(&mut self, now: Instant) {
        for (id, deadline) in self.timers.pop_expired(now) {
            let Some(conn) = self.connections.get_mut(id) else {
                continue;
            };
            if conn.scheduled != Some(deadline) {
                continue;
            }
            conn.scheduled = None;
            conn.on_timer(now);
            self.settle(id.index);
        }
    }

    /// Close a terminal connection, or make sure its earliest deadline is
    /// in the timer heap.
    fn settle(&mut self, index: usize) {
        let Some(conn) = self.connections.get_by_index(index) else {
            return;
        };
        if conn.state().is_terminal() {
            self.close_connection(index);
            return;
        }
        if let Some(deadline) = conn.timers().earliest() {
            if conn.scheduled.map_or(true, |scheduled| deadline < scheduled) {
                conn.scheduled = Some(deadline);
                let id = conn.id();
                self.timers.schedule(id, deadline);
            }
        }
    }

    fn close_connection(&mut self, index: usize) {
        let Some(mut conn) = self.connections.remove(index) else {
            return;
        };
        let state = conn.state();
        if state.is_bad_close() {
            // Reset instead of an orderly release.
            if let Err(e) = SockRef::from(&conn.stream).set_linger(Some(Duration::ZERO)) {
                debug!(conn_id = index, error = %e, "Failed to set SO_LINGER");
            }
        }
        if let Err(e) = self.poll.registry().deregister(&mut conn.stream) {
            debug!(conn_id = index, error = %e, "Failed to deregister connection");
        }
        self.shared.stats.connection_closed();
        debug!(
            net = self.id,
            conn_id = index,
            peer = ?conn.peer(),
            state = ?state,
            requests = conn.request_count(),
            "Connection closed"
        );
    }

    /// Stop accepting, close idle connections and refuse new jobs.
    fn begin_drain(&mut self) {
        info!(
            net = self.id,
            connections = self.connections.len(),
            "Draining connections"
        );
        if let Err(e) = self.poll.registry().deregister(&mut self.listener) {
            debug!(net = self.id, error = %e, "Failed to deregister listener");
        }
        for index in self.connections.indices() {
            if let Some(conn) = self.connections.get_by_index(index) {
                conn.on_shutdown();
            }
            self.settle(index);
        }
        self.jobs.shut_down();
    }

    fn force_close_all(&mut self) {
        warn!(
            net = self.id,
            connections = self.connections.len(),
            "Grace period over, dropping remaining connections"
        );
        for index in self.connections.indices() {
            if let Some(conn) = self.connections.get_by_index(index) {
                conn.force_timeout();
            }
            self.close_connection(index);
        }
        self.timers.clear();
    }
}
