//! Request handlers and URI-prefix dispatch.
//!
//! Handlers are grouped into [`Module`]s. The [`Router`] scans modules and
//! their handlers in registration order; the first prefix match wins. A
//! handler returning [`HandlerResult::Next`] passes the request on to the
//! next match. When nothing matches, a built-in 404 handler answers.

use crate::http::{Request, Response};
use std::sync::Arc;

/// Outcome of a handler invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerResult {
    /// The response is ready to send.
    Ok,
    /// Decline; try the next matching handler.
    Next,
    /// Failure; the engine replaces the response with a 500.
    Error,
}

/// Request handler.
///
/// Out-of-process handlers run on worker threads, hence `Send + Sync`. A
/// panic inside a handler running on a worker thread terminates that
/// worker; the connection waiting on it is only reclaimed by shutdown.
pub trait Handler: Send + Sync {
    fn handle(&self, request: &mut Request, response: &mut Response) -> HandlerResult;
}

impl<F> Handler for F
where
    F: Fn(&mut Request, &mut Response) -> HandlerResult + Send + Sync,
{
    fn handle(&self, request: &mut Request, response: &mut Response) -> HandlerResult {
        self(request, response)
    }
}

/// Set of accepted request methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Methods(u8);

impl Methods {
    /// GET, and HEAD with it.
    pub const GET: Methods = Methods(0b01);
    pub const POST: Methods = Methods(0b10);
    pub const ANY: Methods = Methods(0xff);

    pub fn allows(self, method: &str) -> bool {
        if self == Methods::ANY {
            return true;
        }
        match method {
            "GET" | "HEAD" => self.0 & Methods::GET.0 != 0,
            "POST" => self.0 & Methods::POST.0 != 0,
            _ => false,
        }
    }
}

impl std::ops::BitOr for Methods {
    type Output = Methods;

    fn bitor(self, rhs: Methods) -> Methods {
        Methods(self.0 | rhs.0)
    }
}

/// Per-handler dispatch options.
#[derive(Debug, Clone, Copy)]
pub struct HandlerOptions {
    pub methods: Methods,
    /// Run inline on the network thread instead of a worker.
    pub in_process: bool,
    pub parse_parameters: bool,
    pub parse_cookies: bool,
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self {
            methods: Methods::ANY,
            in_process: true,
            parse_parameters: false,
            parse_cookies: false,
        }
    }
}

impl HandlerOptions {
    /// Options for a handler offloaded to the worker pool.
    pub fn offloaded() -> Self {
        Self {
            in_process: false,
            ..Self::default()
        }
    }

    pub fn methods(mut self, methods: Methods) -> Self {
        self.methods = methods;
        self
    }

    pub fn with_parameters(mut self) -> Self {
        self.parse_parameters = true;
        self
    }

    pub fn with_cookies(mut self) -> Self {
        self.parse_cookies = true;
        self
    }
}

struct Route {
    prefix: String,
    options: HandlerOptions,
    handler: Arc<dyn Handler>,
}

/// Ordered group of prefix handlers.
pub struct Module {
    name: String,
    routes: Vec<Route>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            routes: Vec::new(),
        }
    }

    /// Register `handler` under `prefix`. A trailing slash is dropped, so
    /// `"/"` and `""` both match every URI.
    pub fn route<H>(mut self, prefix: &str, options: HandlerOptions, handler: H) -> Self
    where
        H: Handler + 'static,
    {
        self.routes.push(Route {
            prefix: prefix.trim_end_matches('/').to_string(),
            options,
            handler: Arc::new(handler),
        });
        self
    }
}

/// True if `prefix` matches `uri`: empty, or a prefix followed by the end
/// of the URI, `?` or `/`.
pub fn prefix_matches(prefix: &str, uri: &str) -> bool {
    if prefix.is_empty() {
        return true;
    }
    uri.starts_with(prefix) && matches!(uri.as_bytes().get(prefix.len()), None | Some(b'?') | Some(b'/'))
}

/// Resume position for dispatch: the next `(module, route)` to examine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchCursor {
    module: usize,
    route: usize,
}

/// A resolved handler.
pub struct Resolved<'a> {
    pub handler: &'a Arc<dyn Handler>,
    /// Name of the module the handler belongs to.
    pub module: &'a str,
    pub options: HandlerOptions,
    /// Length of the matched prefix; the rest of the URI is the path info.
    pub prefix_len: usize,
}

/// All modules of a server.
pub struct Router {
    modules: Vec<Module>,
    not_found: Arc<dyn Handler>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

fn not_found(_request: &mut Request, response: &mut Response) -> HandlerResult {
    response.send_error(404, "The requested URL was not found on this server.");
    HandlerResult::Ok
}

impl Router {
    pub fn new() -> Self {
        Self {
            modules: Vec::new(),
            not_found: Arc::new(not_found),
        }
    }

    pub fn module(mut self, module: Module) -> Self {
        self.modules.push(module);
        self
    }

    /// Find the next handler for `uri`, starting at `cursor`, and move the
    /// cursor past it. Falls back to the 404 handler.
    pub fn resolve<'a>(&'a self, uri: &str, cursor: &mut DispatchCursor) -> Resolved<'a> {
        while cursor.module < self.modules.len() {
            let module = &self.modules[cursor.module];
            let routes = &module.routes;
            while cursor.route < routes.len() {
                let route = &routes[cursor.route];
                cursor.route += 1;
                if prefix_matches(&route.prefix, uri) {
                    return Resolved {
                        handler: &route.handler,
                        module: &module.name,
                        options: route.options,
                        prefix_len: route.prefix.len(),
                    };
                }
            }
            cursor.module += 1;
            cursor.route = 0;
        }
        Resolved {
            handler: &self.not_found,
            module: "builtin",
            options: HandlerOptions::default(),
            prefix_len: 0,
        }
    }
}
