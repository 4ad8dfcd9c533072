//! sluice: an event-driven HTTP/1.1 server engine.
//!
//! Network threads multiplex non-blocking connections with `mio` and run
//! quick handlers inline; slow handlers are offloaded to per-thread worker
//! pools through a bounded job queue. See [`runtime`] for the threading
//! model and [`handler`] for the handler contract.

pub mod config;
pub mod error;
pub mod handler;
pub mod http;
pub mod runtime;

pub use config::Config;
pub use error::ServerError;
pub use handler::{Handler, HandlerOptions, HandlerResult, Methods, Module, Router};
pub use http::{Request, Response};
pub use runtime::{Server, ServerHandle};
