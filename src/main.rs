//! sluice: an event-driven HTTP server
//!
//! Routes:
//! - `/hello`: answered inline on the network thread
//! - `/compute?n=<count>`: CPU work offloaded to a worker
//! - `/static/<path>`: files under the configured root, opened on a worker
//!   and sent with sendfile
//!
//! Configuration via CLI arguments or TOML file. SIGINT/SIGTERM trigger a
//! graceful shutdown.

use std::fmt::Write as _;
use std::fs::File;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::process::ExitCode;
use std::thread;

use sluice::{Config, HandlerOptions, HandlerResult, Methods, Module, Request, Response, Router, Server};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    // Load configuration
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        net_threads = config.net_threads,
        workers_per_thread = config.workers_per_thread,
        static_root = ?config.static_root,
        "Starting sluice server"
    );

    // Worker and network threads inherit the mask, so only `sigwait` below
    // ever sees these signals.
    let signals = match block_shutdown_signals() {
        Ok(signals) => signals,
        Err(e) => {
            error!(error = %e, "Failed to block signals");
            return ExitCode::FAILURE;
        }
    };

    let router = routes(config.static_root.clone());
    let server = match Server::bind(config, router) {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "Failed to start server");
            return ExitCode::FAILURE;
        }
    };
    let handle = match server.start() {
        Ok(handle) => handle,
        Err(e) => {
            error!(error = %e, "Failed to start server");
            return ExitCode::FAILURE;
        }
    };

    match wait_for_signal(&signals) {
        Ok(signal) => info!(signal, "Received signal"),
        Err(e) => warn!(error = %e, "sigwait failed, shutting down"),
    }

    handle.shutdown();

    // Last resort if draining overruns the grace period.
    let grace = handle.shutdown_grace();
    let alarm = thread::Builder::new()
        .name("shutdown-alarm".into())
        .spawn(move || {
            thread::sleep(grace * 2);
            error!("Graceful shutdown timed out, exiting");
            std::process::exit(1);
        });
    if let Err(e) = alarm {
        warn!(error = %e, "Failed to arm shutdown alarm");
    }

    let stats = handle.join();
    info!(
        accepted = stats.accepted,
        requests = stats.requests,
        refused = stats.refused,
        rejected_jobs = stats.rejected_jobs,
        "Server stopped"
    );
    ExitCode::SUCCESS
}

fn routes(static_root: Option<PathBuf>) -> Router {
    let mut module = Module::new("demo")
        .route("/hello", HandlerOptions::default().methods(Methods::GET), hello)
        .route(
            "/compute",
            HandlerOptions::offloaded()
                .methods(Methods::GET)
                .with_parameters(),
            compute,
        );

    if let Some(root) = static_root {
        module = module.route(
            "/static",
            HandlerOptions::offloaded().methods(Methods::GET),
            move |request: &mut Request, response: &mut Response| {
                serve_file(&root, request, response)
            },
        );
    }

    Router::new().module(module)
}

fn hello(_request: &mut Request, response: &mut Response) -> HandlerResult {
    response.set_content_type("text/plain");
    response.append_str("Hello, world!\n");
    HandlerResult::Ok
}

/// Sum of squares up to `n`, slow on purpose.
fn compute(request: &mut Request, response: &mut Response) -> HandlerResult {
    let n: u64 = match request.param("n").map(str::parse) {
        None => 1_000_000,
        Some(Ok(n)) => n,
        Some(Err(_)) => {
            response.send_error(400, "Parameter n must be a non-negative integer.");
            return HandlerResult::Ok;
        }
    };
    let sum = (1..=n).fold(0u64, |acc, i| acc.wrapping_add(i.wrapping_mul(i)));

    response.set_content_type("text/plain");
    if writeln!(response, "sum of squares 1..={n} = {sum}").is_err() {
        return HandlerResult::Error;
    }
    HandlerResult::Ok
}

fn serve_file(root: &Path, request: &mut Request, response: &mut Response) -> HandlerResult {
    let relative = request.path_info().split('?').next().unwrap_or("");
    let relative = Path::new(relative.trim_start_matches('/'));
    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        response.send_error(404, "The requested URL was not found on this server.");
        return HandlerResult::Ok;
    }

    let path = root.join(relative);
    let opened = File::open(&path).and_then(|file| {
        let meta = file.metadata()?;
        Ok((file, meta))
    });
    match opened {
        Ok((file, meta)) if meta.is_file() => {
            response.set_content_type(content_type(&path));
            response.send_file(file, 0, meta.len());
        }
        _ => {
            response.send_error(404, "The requested URL was not found on this server.");
        }
    }
    HandlerResult::Ok
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") | Some("htm") => "text/html",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("txt") => "text/plain",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("svg") => "image/svg+xml",
        _ => "application/octet-stream",
    }
}

fn block_shutdown_signals() -> io::Result<libc::sigset_t> {
    // SAFETY: `set` is a plain C struct initialised by `sigemptyset` before
    // use, and the mask pointer outlives the call.
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGINT);
        libc::sigaddset(&mut set, libc::SIGTERM);
        let rc = libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut());
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
        Ok(set)
    }
}

fn wait_for_signal(set: &libc::sigset_t) -> io::Result<libc::c_int> {
    let mut signal: libc::c_int = 0;
    // SAFETY: `set` was initialised by `block_shutdown_signals`.
    let rc = unsafe { libc::sigwait(set, &mut signal) };
    if rc != 0 {
        return Err(io::Error::from_raw_os_error(rc));
    }
    Ok(signal)
}
