//! HTTP/1.x message collaborators: request head parsing, response
//! serialization, chunked bodies and url-encoded parameters.

pub mod chunked;
pub mod params;
pub mod request;
pub mod response;

pub use request::{find_head_end, ParseError, Request, Version};
pub use response::{reason_phrase, Body, Response};
