//! Event-driven runtime.
//!
//! One listening socket is shared by several network threads. Each network
//! thread owns a `mio::Poll`, a slab of connections, a timer heap and a
//! bounded job queue drained by its own worker threads. Workers hand
//! finished jobs back over a channel and wake the network thread with a
//! `mio::Waker`; a request never leaves the network thread that accepted
//! its connection except while a worker runs its handler.

pub mod buffer;
mod connection;
mod event_loop;
pub mod jobs;
pub mod queue;
pub mod server;
pub mod timer;
mod worker;

pub use connection::ConnState;
pub use server::{Server, ServerHandle, Stats, StatsSnapshot};

/// Identity of a connection within its network thread.
///
/// Slab indices are reused once a connection closes; the generation makes
/// references held by timers and in-flight jobs go stale instead of
/// reaching a newer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnRef {
    pub index: usize,
    pub generation: u64,
}
