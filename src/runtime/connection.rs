//! Connection state machine.
//!
//! A connection moves through
//! `WaitingForRequest -> ReceivingHeaders -> [ReceivingBody] -> Handling ->
//! SendingHeaders -> [SendingBody]` and then either back to
//! `WaitingForRequest` (keep-alive) or into one of the terminal states
//! `Closing`, `Timeout` or `Error`. The owning network thread removes a
//! connection once it is terminal.
//!
//! Sockets are registered once for both directions, edge-triggered. The
//! read and write watchers are flags on the connection; whenever one is
//! switched on the connection immediately attempts the operation, so no
//! readiness edge is ever needed to make progress on data already there.

use std::io::{self, Read};
use std::mem;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::{Buf, Bytes, BytesMut};
use slab::Slab;
use tracing::{debug, trace, warn};

use crate::config::{Limits, Timeouts};
use crate::handler::{DispatchCursor, HandlerResult, Router};
use crate::http::chunked::{self, ChunkScanner};
use crate::http::{find_head_end, Body, Request, Response, Version};
use crate::runtime::buffer::{self, Accumulator, Block, FileSource, Progress, Sink, StreamSource};
use crate::runtime::jobs::{Completion, Exchange, Job, JobQueue};
use crate::runtime::server::Stats;
use crate::runtime::timer::{TimerKind, Timers};
use crate::runtime::ConnRef;

const CONTINUE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    WaitingForRequest,
    ReceivingHeaders,
    ReceivingBody,
    Handling,
    SendingHeaders,
    SendingBody,
    Closing,
    Timeout,
    Error,
}

impl ConnState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnState::Closing | ConnState::Timeout | ConnState::Error)
    }

    /// Terminal states that close the socket without lingering.
    pub fn is_bad_close(self) -> bool {
        matches!(self, ConnState::Timeout | ConnState::Error)
    }
}

/// Per-thread context a connection needs to make progress.
pub(crate) struct Env<'a> {
    pub router: &'a Router,
    pub limits: &'a Limits,
    pub timeouts: &'a Timeouts,
    pub jobs: &'a JobQueue<Job>,
    pub stats: &'a Stats,
    pub shutdown: bool,
}

/// Response body being written.
enum Outbound {
    Block(Block),
    File(FileSource),
    Stream(StreamSource),
}

impl Outbound {
    fn pump<K: Sink + ?Sized>(&mut self, sink: &mut K) -> io::Result<Progress> {
        match self {
            Outbound::Block(block) => block.pump(sink),
            Outbound::File(file) => file.pump(sink),
            Outbound::Stream(stream) => stream.pump(sink),
        }
    }
}

enum Stage {
    Continue,
    Head,
    Body,
}

/// A single client connection.
pub(crate) struct Connection<S> {
    pub(crate) stream: S,
    id: ConnRef,
    peer: Option<SocketAddr>,
    state: ConnState,
    keep_alive: bool,
    request_count: u64,
    timers: Timers,
    /// Deadline currently queued in the thread's timer heap.
    pub(crate) scheduled: Option<Instant>,
    want_read: bool,
    want_write: bool,
    /// Received bytes not yet consumed. Request heads and bodies are split
    /// off as frozen chunks; the capacity is reused across requests.
    arena: BytesMut,
    /// Where the head terminator search resumes.
    scanned: usize,
    chunks: Option<ChunkScanner>,
    exchange: Option<Box<Exchange>>,
    cursor: DispatchCursor,
    awaiting_job: bool,
    continue_out: Option<Block>,
    head_out: Option<Block>,
    body_out: Option<Outbound>,
    #[cfg(test)]
    history: Vec<ConnState>,
}

impl<S: Read + Sink> Connection<S> {
    pub fn new(stream: S, id: ConnRef, peer: Option<SocketAddr>) -> Self {
        Self {
            stream,
            id,
            peer,
            state: ConnState::WaitingForRequest,
            keep_alive: false,
            request_count: 0,
            timers: Timers::new(),
            scheduled: None,
            want_read: false,
            want_write: false,
            arena: BytesMut::new(),
            scanned: 0,
            chunks: None,
            exchange: None,
            cursor: DispatchCursor::default(),
            awaiting_job: false,
            continue_out: None,
            head_out: None,
            body_out: None,
            #[cfg(test)]
            history: Vec::new(),
        }
    }

    pub fn id(&self) -> ConnRef {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Completed requests on this connection before the current one.
    pub fn request_count(&self) -> u64 {
        self.request_count
    }

    pub fn timers(&self) -> &Timers {
        &self.timers
    }

    /// Start serving a freshly accepted socket.
    pub fn open(&mut self, env: &Env<'_>, now: Instant) {
        self.set_state(ConnState::WaitingForRequest);
        self.timers
            .arm(TimerKind::KeepAlive, now, env.timeouts.keep_alive);
        self.want_read = true;
        self.drive(env, now);
    }

    /// Socket readiness changed.
    pub fn on_ready(&mut self, env: &Env<'_>, now: Instant) {
        self.drive(env, now);
    }

    /// Fire expired timers. Returns true if the connection timed out.
    pub fn on_timer(&mut self, now: Instant) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        match self.timers.take_expired(now) {
            Some(kind) => {
                debug!(
                    conn_id = self.id.index,
                    peer = ?self.peer,
                    request_count = self.request_count,
                    timer = ?kind,
                    state = ?self.state,
                    "Connection timed out"
                );
                self.timers.disarm_all();
                self.set_state(ConnState::Timeout);
                true
            }
            None => false,
        }
    }

    /// A worker finished the job this connection was waiting on.
    pub fn on_job_done(&mut self, completion: Completion, env: &Env<'_>, now: Instant) {
        if !self.awaiting_job || completion.conn != self.id {
            warn!(conn_id = self.id.index, "Unexpected job completion dropped");
            return;
        }
        self.awaiting_job = false;
        self.exchange = Some(completion.exchange);
        match completion.result {
            HandlerResult::Next => self.dispatch(env, now),
            HandlerResult::Ok => self.start_response(env, now),
            HandlerResult::Error => self.handler_failed(env, now),
        }
        self.drive(env, now);
    }

    /// Shutdown started: idle connections close right away, busy ones
    /// finish their current exchange without keep-alive.
    pub fn on_shutdown(&mut self) {
        if self.state == ConnState::WaitingForRequest {
            self.set_state(ConnState::Closing);
        }
    }

    /// Grace period over.
    pub fn force_timeout(&mut self) {
        if !self.state.is_terminal() {
            self.timers.disarm_all();
            self.set_state(ConnState::Timeout);
        }
    }

    fn set_state(&mut self, state: ConnState) {
        trace!(conn_id = self.id.index, from = ?self.state, to = ?state, "State change");
        self.state = state;
        #[cfg(test)]
        self.history.push(state);
    }

    fn fail(&mut self, error: &io::Error) {
        debug!(
            conn_id = self.id.index,
            peer = ?self.peer,
            state = ?self.state,
            error = %error,
            "Connection error"
        );
        self.set_state(ConnState::Error);
    }

    /// Run the watchers until neither direction can make progress.
    fn drive(&mut self, env: &Env<'_>, now: Instant) {
        while !self.state.is_terminal() {
            let wrote = self.want_write && self.write_step(env, now);
            if self.state.is_terminal() {
                break;
            }
            let read = self.want_read && self.read_step(env, now);
            if !wrote && !read {
                break;
            }
        }
    }

    // --- request side -----------------------------------------------------

    fn read_step(&mut self, env: &Env<'_>, now: Instant) -> bool {
        match self.state {
            ConnState::WaitingForRequest | ConnState::ReceivingHeaders => self.read_head(env, now),
            ConnState::ReceivingBody => self.read_body(env, now),
            _ => {
                self.want_read = false;
                false
            }
        }
    }

    /// Read once into the arena, never holding more than `cap` bytes.
    fn fill_arena(&mut self, cap: usize, env: &Env<'_>, now: Instant) -> bool {
        let mut input = Accumulator::new(mem::take(&mut self.arena), cap);
        let filled = input.fill(&mut self.stream);
        self.arena = input.into_inner();
        match filled {
            Err(e) => {
                self.fail(&e);
                true
            }
            Ok(fill) if fill.completed == Some(buffer::Completion::Eof) => {
                debug!(conn_id = self.id.index, state = ?self.state, "Peer closed connection");
                self.set_state(ConnState::Closing);
                true
            }
            Ok(fill) if fill.bytes == 0 => false,
            Ok(_) => {
                self.timers.again(TimerKind::Read, now, env.timeouts.read);
                true
            }
        }
    }

    fn read_head(&mut self, env: &Env<'_>, now: Instant) -> bool {
        if self.state == ConnState::WaitingForRequest {
            // Stray line breaks between requests are ignored.
            let blank = self
                .arena
                .iter()
                .take_while(|b| **b == b'\r' || **b == b'\n')
                .count();
            self.arena.advance(blank);
            if !self.arena.is_empty() {
                self.begin_request(env, now);
            }
        }

        if self.state == ConnState::ReceivingHeaders {
            if let Some(end) = find_head_end(&self.arena, self.scanned) {
                self.head_received(end, env, now);
                return true;
            }
            self.scanned = self.arena.len().saturating_sub(3);
            if self.arena.len() >= env.limits.max_header_size {
                debug!(
                    conn_id = self.id.index,
                    size = self.arena.len(),
                    "Request head too large"
                );
                self.reject(400, env, now);
                return true;
            }
            trace!(conn_id = self.id.index, buffered = self.arena.len(), "Partial request head");
        }

        self.fill_arena(env.limits.max_header_size, env, now)
    }

    fn begin_request(&mut self, env: &Env<'_>, now: Instant) {
        self.set_state(ConnState::ReceivingHeaders);
        self.scanned = 0;
        self.timers.disarm(TimerKind::KeepAlive);
        self.timers.arm(TimerKind::Read, now, env.timeouts.read);
    }

    fn head_received(&mut self, end: usize, env: &Env<'_>, now: Instant) {
        let head = self.arena.split_to(end).freeze();
        self.scanned = 0;

        let mut request = match Request::parse(head, self.peer) {
            Ok(request) => request,
            Err(e) => {
                debug!(conn_id = self.id.index, error = %e, "Bad request");
                self.reject(400, env, now);
                return;
            }
        };
        request.shutting_down = env.shutdown;

        let mut response = Response::new();
        response.set_keep_alive(request.keep_alive() && !env.shutdown);

        let declared = request.content_length();
        let has_body = request.has_body();
        let send_continue = request.expects_continue() && request.version() == Version::Http11;
        self.exchange = Some(Box::new(Exchange { request, response }));

        if let Some(len) = declared {
            if len > env.limits.max_content_size as u64 {
                debug!(
                    conn_id = self.id.index,
                    content_length = len,
                    limit = env.limits.max_content_size,
                    "Request body too large"
                );
                self.reject(413, env, now);
                return;
            }
        }

        if !has_body {
            self.start_handling(env, now);
            return;
        }

        self.set_state(ConnState::ReceivingBody);
        match declared {
            Some(len) => {
                let missing = (len as usize).saturating_sub(self.arena.len());
                self.arena.reserve(missing);
            }
            None => self.chunks = Some(ChunkScanner::new()),
        }

        if send_continue && self.arena.is_empty() {
            self.continue_out = Some(Block::new(Bytes::from_static(CONTINUE)));
            self.want_write = true;
            self.timers.arm(TimerKind::Write, now, env.timeouts.write);
        }
    }

    fn read_body(&mut self, env: &Env<'_>, now: Instant) -> bool {
        let declared = match self.exchange.as_ref() {
            Some(exchange) => exchange.request.content_length(),
            None => {
                warn!(conn_id = self.id.index, "Receiving body without a request");
                self.set_state(ConnState::Error);
                return true;
            }
        };

        match self.chunks.as_mut() {
            Some(scanner) => match scanner.advance(&self.arena) {
                Ok(Some(end)) => {
                    let raw = self.arena.split_to(end);
                    self.chunks = None;
                    match chunked::decode(&raw) {
                        Ok(body) => self.body_received(body.freeze(), env, now),
                        Err(e) => {
                            debug!(conn_id = self.id.index, error = %e, "Bad chunked body");
                            self.reject(400, env, now);
                        }
                    }
                    true
                }
                Ok(None) if self.arena.len() >= env.limits.max_content_size => {
                    debug!(
                        conn_id = self.id.index,
                        limit = env.limits.max_content_size,
                        "Chunked body too large"
                    );
                    self.reject(413, env, now);
                    true
                }
                Ok(None) => self.fill_arena(env.limits.max_content_size, env, now),
                Err(e) => {
                    debug!(conn_id = self.id.index, error = %e, "Bad chunked body");
                    self.reject(400, env, now);
                    true
                }
            },
            None => {
                let len = declared.unwrap_or(0) as usize;
                if self.arena.len() >= len {
                    let body = self.arena.split_to(len).freeze();
                    self.body_received(body, env, now);
                    return true;
                }
                self.fill_arena(len, env, now)
            }
        }
    }

    fn body_received(&mut self, body: Bytes, env: &Env<'_>, now: Instant) {
        if let Some(exchange) = self.exchange.as_mut() {
            exchange.request.body = body;
        }
        self.start_handling(env, now);
    }

    // --- dispatch ---------------------------------------------------------

    fn start_handling(&mut self, env: &Env<'_>, now: Instant) {
        self.set_state(ConnState::Handling);
        self.want_read = false;
        self.timers.disarm(TimerKind::Read);
        self.cursor = DispatchCursor::default();
        self.dispatch(env, now);
    }

    fn dispatch(&mut self, env: &Env<'_>, now: Instant) {
        loop {
            let Some(exchange) = self.exchange.as_mut() else {
                return self.set_state(ConnState::Error);
            };
            let resolved = env.router.resolve(exchange.request.uri(), &mut self.cursor);
            trace!(
                conn_id = self.id.index,
                module = resolved.module,
                uri = exchange.request.uri(),
                in_process = resolved.options.in_process,
                "Dispatching"
            );

            if !resolved.options.methods.allows(exchange.request.method()) {
                debug!(
                    conn_id = self.id.index,
                    method = exchange.request.method(),
                    uri = exchange.request.uri(),
                    "Method not allowed"
                );
                exchange.response = Response::error(405);
                exchange.response.set_keep_alive(false);
                return self.start_response(env, now);
            }

            exchange.request.set_path_info_offset(resolved.prefix_len);
            if resolved.options.parse_parameters {
                exchange.request.parse_parameters();
            }
            if resolved.options.parse_cookies {
                exchange.request.parse_cookies();
            }

            if resolved.options.in_process {
                let result = resolved
                    .handler
                    .handle(&mut exchange.request, &mut exchange.response);
                match result {
                    HandlerResult::Next => continue,
                    HandlerResult::Ok => return self.start_response(env, now),
                    HandlerResult::Error => return self.handler_failed(env, now),
                }
            }

            let Some(exchange) = self.exchange.take() else {
                return self.set_state(ConnState::Error);
            };
            let job = Job {
                conn: self.id,
                exchange,
                handler: Arc::clone(resolved.handler),
            };
            match env.jobs.push(job) {
                Ok(()) => {
                    trace!(conn_id = self.id.index, "Job queued");
                    self.awaiting_job = true;
                }
                Err(job) => {
                    warn!(conn_id = self.id.index, "Job queue full, answering 503");
                    env.stats.job_rejected();
                    let mut exchange = job.exchange;
                    let keep_alive = exchange.response.keep_alive();
                    exchange.response = Response::error(503);
                    exchange.response.set_keep_alive(keep_alive);
                    self.exchange = Some(exchange);
                    self.start_response(env, now);
                }
            }
            return;
        }
    }

    fn handler_failed(&mut self, env: &Env<'_>, now: Instant) {
        if let Some(exchange) = self.exchange.as_mut() {
            debug!(
                conn_id = self.id.index,
                uri = exchange.request.uri(),
                "Handler failed"
            );
            exchange.response = Response::error(500);
            exchange.response.set_keep_alive(false);
        }
        self.start_response(env, now);
    }

    /// Answer with an error page before any handler ran, then close.
    fn reject(&mut self, code: u16, env: &Env<'_>, now: Instant) {
        let mut exchange = self.exchange.take().unwrap_or_default();
        exchange.response = Response::error(code);
        exchange.response.set_keep_alive(false);
        self.exchange = Some(exchange);
        self.chunks = None;
        self.start_response(env, now);
    }

    // --- response side ----------------------------------------------------

    fn start_response(&mut self, env: &Env<'_>, now: Instant) {
        self.want_read = false;
        self.timers.disarm(TimerKind::Read);
        self.timers.disarm(TimerKind::KeepAlive);

        let Some(exchange) = self.exchange.as_mut() else {
            return self.set_state(ConnState::Error);
        };
        if env.shutdown {
            exchange.response.set_keep_alive(false);
        }
        let head_only = exchange.request.is_head();
        let head = exchange.response.prepare_headers();
        self.keep_alive = exchange.response.keep_alive();
        debug!(
            conn_id = self.id.index,
            method = exchange.request.method(),
            uri = exchange.request.uri(),
            status = exchange.response.status(),
            "Sending response"
        );

        let body = exchange.response.take_body();
        self.head_out = Some(Block::new(head));
        self.body_out = match body {
            _ if head_only => None,
            Body::Empty => None,
            Body::Bytes(buf) => Some(Outbound::Block(Block::new(buf.freeze()))),
            Body::File { file, offset, len } => {
                Some(Outbound::File(FileSource::new(file, offset, offset + len)))
            }
            Body::Stream { reader, len } => Some(Outbound::Stream(StreamSource::new(
                reader,
                len,
                env.limits.stream_buffer_size,
            ))),
        };

        self.set_state(ConnState::SendingHeaders);
        self.timers.arm(TimerKind::Write, now, env.timeouts.write);
        self.want_write = true;
    }

    fn write_step(&mut self, env: &Env<'_>, now: Instant) -> bool {
        const DONE: Progress = Progress {
            bytes: 0,
            eof: true,
        };

        let (stage, pumped) = if let Some(block) = self.continue_out.as_mut() {
            (Stage::Continue, block.pump(&mut self.stream))
        } else {
            match self.state {
                ConnState::SendingHeaders => match self.head_out.as_mut() {
                    Some(block) => (Stage::Head, block.pump(&mut self.stream)),
                    None => (Stage::Head, Ok(DONE)),
                },
                ConnState::SendingBody => match self.body_out.as_mut() {
                    Some(body) => (Stage::Body, body.pump(&mut self.stream)),
                    None => (Stage::Body, Ok(DONE)),
                },
                _ => {
                    self.want_write = false;
                    self.timers.disarm(TimerKind::Write);
                    return false;
                }
            }
        };

        let progress = match pumped {
            Ok(progress) => progress,
            Err(e) => {
                self.fail(&e);
                return true;
            }
        };
        if progress.bytes > 0 {
            self.timers.again(TimerKind::Write, now, env.timeouts.write);
        }
        if !progress.eof {
            return progress.bytes > 0;
        }

        match stage {
            Stage::Continue => {
                self.continue_out = None;
                if !matches!(self.state, ConnState::SendingHeaders | ConnState::SendingBody) {
                    self.want_write = false;
                    self.timers.disarm(TimerKind::Write);
                }
            }
            Stage::Head => {
                self.head_out = None;
                if self.body_out.is_some() {
                    self.set_state(ConnState::SendingBody);
                } else {
                    self.finish_response(env, now);
                }
            }
            Stage::Body => self.finish_response(env, now),
        }
        true
    }

    fn finish_response(&mut self, env: &Env<'_>, now: Instant) {
        self.head_out = None;
        self.body_out = None;
        self.exchange = None;
        self.want_write = false;
        self.timers.disarm(TimerKind::Write);
        env.stats.request_completed();

        if self.keep_alive && !env.shutdown {
            self.rearm(env, now);
        } else {
            self.set_state(ConnState::Closing);
        }
    }

    /// Prepare for the next request on a persistent connection.
    fn rearm(&mut self, env: &Env<'_>, now: Instant) {
        self.request_count += 1;
        self.cursor = DispatchCursor::default();
        self.scanned = 0;
        self.set_state(ConnState::WaitingForRequest);
        self.timers
            .arm(TimerKind::KeepAlive, now, env.timeouts.keep_alive);
        self.want_read = true;
        trace!(
            conn_id = self.id.index,
            request_count = self.request_count,
            pipelined = self.arena.len(),
            "Connection re-armed"
        );
    }
}

/// Registry of active connections using slab allocation.
///
/// Slab indices are reused; a generation counter distinguishes a
/// connection from an earlier one that held the same index, so stale timer
/// entries and job completions can be recognised.
pub(crate) struct ConnectionRegistry<S> {
    connections: Slab<Connection<S>>,
    max_connections: usize,
    next_generation: u64,
}

impl<S: Read + Sink> ConnectionRegistry<S> {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections),
            max_connections,
            next_generation: 0,
        }
    }

    /// Insert a connection built from the identity it will live under.
    ///
    /// Returns the stream back if the registry is at capacity.
    pub fn insert(
        &mut self,
        stream: S,
        peer: Option<SocketAddr>,
    ) -> Result<&mut Connection<S>, S> {
        if self.connections.len() >= self.max_connections {
            return Err(stream);
        }
        self.next_generation += 1;
        let entry = self.connections.vacant_entry();
        let id = ConnRef {
            index: entry.key(),
            generation: self.next_generation,
        };
        Ok(entry.insert(Connection::new(stream, id, peer)))
    }

    /// Look up a connection, ignoring stale references.
    pub fn get_mut(&mut self, id: ConnRef) -> Option<&mut Connection<S>> {
        self.connections
            .get_mut(id.index)
            .filter(|conn| conn.id == id)
    }

    pub fn get_by_index(&mut self, index: usize) -> Option<&mut Connection<S>> {
        self.connections.get_mut(index)
    }

    pub fn remove(&mut self, index: usize) -> Option<Connection<S>> {
        self.connections.try_remove(index)
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn indices(&self) -> Vec<usize> {
        self.connections.iter().map(|(index, _)| index).collect()
    }
}
