//! Integration tests: a real server on 127.0.0.1 driven over std TCP.
//!
//! Each test starts its own server on an ephemeral port, talks raw HTTP/1.1
//! to it and shuts it down on drop.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use sluice::{
    Config, HandlerOptions, HandlerResult, Methods, Module, Request, Response, Router, Server,
    ServerHandle,
};

// ── Helpers ─────────────────────────────────────────────────────────

fn test_config() -> Config {
    let mut config = Config::default();
    config.listen = "127.0.0.1:0".into();
    config.net_threads = 2;
    config.workers_per_thread = 2;
    config.limits.max_content_size = 1024;
    config.timeouts.write = Duration::from_millis(300);
    config.timeouts.shutdown_grace = Duration::from_secs(2);
    config
}

fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("sluice-{}-{name}", std::process::id()))
}

fn test_router() -> Router {
    let file_path = temp_path("static.txt");
    Router::new().module(
        Module::new("test")
            .route(
                "/hello",
                HandlerOptions::default().methods(Methods::GET),
                |_: &mut Request, response: &mut Response| {
                    response.set_content_type("text/plain");
                    response.append_str("hello");
                    HandlerResult::Ok
                },
            )
            .route(
                "/echo",
                HandlerOptions::default().methods(Methods::POST),
                |request: &mut Request, response: &mut Response| {
                    let body = request.body().to_vec();
                    response.append(&body);
                    HandlerResult::Ok
                },
            )
            .route(
                "/worker",
                HandlerOptions::offloaded().with_parameters(),
                |request: &mut Request, response: &mut Response| {
                    let name = request.param("name").unwrap_or("anonymous").to_owned();
                    let thread = thread::current().name().unwrap_or("").to_owned();
                    response.append_str(&format!("{name} on {thread}"));
                    HandlerResult::Ok
                },
            )
            .route(
                "/big",
                HandlerOptions::default(),
                |_: &mut Request, response: &mut Response| {
                    response.append(&vec![b'x'; 32 << 20]);
                    HandlerResult::Ok
                },
            )
            .route(
                "/file",
                HandlerOptions::default(),
                move |_: &mut Request, response: &mut Response| match File::open(&file_path) {
                    Ok(file) => {
                        response.send_file(file, 6, 5);
                        HandlerResult::Ok
                    }
                    Err(_) => HandlerResult::Error,
                },
            ),
    )
}

/// Server that shuts down when dropped.
struct TestServer {
    handle: Option<ServerHandle>,
    addr: SocketAddr,
}

impl TestServer {
    fn start(config: Config) -> Self {
        let server = Server::bind(config, test_router()).unwrap();
        let handle = server.start().unwrap();
        let addr = handle.local_addr();
        TestServer {
            handle: Some(handle),
            addr,
        }
    }

    fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(self.addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }

    fn handle(&self) -> &ServerHandle {
        self.handle.as_ref().unwrap()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.shutdown();
            handle.join();
        }
    }
}

/// Read one response: the head as text and the body by Content-Length.
fn read_response(stream: &mut TcpStream) -> io::Result<(String, Vec<u8>)> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if stream.read(&mut byte)? == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        head.push(byte[0]);
    }
    let head = String::from_utf8(head).unwrap();
    let len: usize = head
        .lines()
        .find_map(|line| line.strip_prefix("Content-Length: "))
        .map_or(0, |value| value.trim().parse().unwrap());
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body)?;
    Ok((head, body))
}

/// True once the peer has closed (EOF or reset) within the read timeout.
fn is_closed(stream: &mut TcpStream) -> bool {
    let mut buf = [0u8; 64];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => return true,
            Ok(_) => continue,
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => return true,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => return false,
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[test]
fn get_in_process_handler() {
    let server = TestServer::start(test_config());
    let mut stream = server.connect();
    stream
        .write_all(b"GET /hello HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();

    let (head, body) = read_response(&mut stream).unwrap();
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{head}");
    assert!(head.contains("Content-Type: text/plain"));
    assert!(head.contains("Date: "));
    assert_eq!(body, b"hello");
}

#[test]
fn split_request_is_served_once() {
    let server = TestServer::start(test_config());
    let mut stream = server.connect();
    for part in [&b"GET /hel"[..], b"lo HTTP/1.1\r\nHo", b"st: x\r\n\r\n"] {
        stream.write_all(part).unwrap();
        thread::sleep(Duration::from_millis(20));
    }

    let (head, body) = read_response(&mut stream).unwrap();
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert_eq!(body, b"hello");
}

#[test]
fn keep_alive_serves_sequential_requests() {
    let server = TestServer::start(test_config());
    let mut stream = server.connect();

    for _ in 0..3 {
        stream.write_all(b"GET /hello HTTP/1.1\r\n\r\n").unwrap();
        let (head, body) = read_response(&mut stream).unwrap();
        assert!(head.contains("Connection: keep-alive\r\n"), "{head}");
        assert_eq!(body, b"hello");
    }

    stream
        .write_all(b"GET /hello HTTP/1.1\r\nConnection: close\r\n\r\n")
        .unwrap();
    let (head, _) = read_response(&mut stream).unwrap();
    assert!(head.contains("Connection: close\r\n"));
    assert!(is_closed(&mut stream));
}

#[test]
fn post_body_is_delivered() {
    let server = TestServer::start(test_config());
    let mut stream = server.connect();
    stream
        .write_all(b"POST /echo HTTP/1.1\r\nContent-Length: 12\r\n\r\nhello ")
        .unwrap();
    thread::sleep(Duration::from_millis(20));
    stream.write_all(b"world!").unwrap();

    let (_, body) = read_response(&mut stream).unwrap();
    assert_eq!(body, b"hello world!");
}

#[test]
fn chunked_post_is_decoded() {
    let server = TestServer::start(test_config());
    let mut stream = server.connect();
    stream
        .write_all(
            b"POST /echo HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n\
              4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n",
        )
        .unwrap();

    let (head, body) = read_response(&mut stream).unwrap();
    assert!(head.contains("Content-Length: 9\r\n"));
    assert_eq!(body, b"Wikipedia");
}

#[test]
fn oversized_body_is_rejected_with_413() {
    let server = TestServer::start(test_config());
    let mut stream = server.connect();
    stream
        .write_all(b"POST /echo HTTP/1.1\r\nContent-Length: 1048576\r\n\r\n")
        .unwrap();

    let (head, _) = read_response(&mut stream).unwrap();
    assert!(head.starts_with("HTTP/1.1 413 "), "{head}");
    assert!(head.contains("Connection: close\r\n"));
    assert!(is_closed(&mut stream));
}

#[test]
fn offloaded_handler_runs_on_worker() {
    let server = TestServer::start(test_config());
    let mut stream = server.connect();

    for _ in 0..2 {
        stream
            .write_all(b"GET /worker?name=ada HTTP/1.1\r\n\r\n")
            .unwrap();
        let (head, body) = read_response(&mut stream).unwrap();
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        let body = String::from_utf8(body).unwrap();
        assert!(body.starts_with("ada on worker-"), "{body}");
    }
}

#[test]
fn unknown_uri_and_wrong_method() {
    let server = TestServer::start(test_config());

    let mut stream = server.connect();
    stream.write_all(b"GET /nowhere HTTP/1.1\r\n\r\n").unwrap();
    let (head, body) = read_response(&mut stream).unwrap();
    assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));
    assert!(String::from_utf8_lossy(&body).contains("404"));

    // 404 keeps the connection usable.
    stream
        .write_all(b"POST /hello HTTP/1.1\r\nContent-Length: 0\r\n\r\n")
        .unwrap();
    let (head, _) = read_response(&mut stream).unwrap();
    assert!(head.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"));
    assert!(is_closed(&mut stream));
}

#[test]
fn file_body_is_sent() {
    let path = temp_path("static.txt");
    fs::write(&path, b"hello world!").unwrap();

    let server = TestServer::start(test_config());
    let mut stream = server.connect();
    stream.write_all(b"GET /file HTTP/1.1\r\n\r\n").unwrap();
    let (head, body) = read_response(&mut stream).unwrap();
    assert!(head.contains("Content-Length: 5\r\n"));
    assert_eq!(body, b"world");

    drop(server);
    let _ = fs::remove_file(path);
}

#[test]
fn slow_reader_is_dropped_after_write_timeout() {
    let server = TestServer::start(test_config());
    let mut stream = server.connect();
    stream.write_all(b"GET /big HTTP/1.1\r\n\r\n").unwrap();

    // Let the socket buffers fill and the write deadline pass.
    thread::sleep(Duration::from_secs(1));

    let mut received = 0usize;
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => received += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
    assert!(received < 32 << 20, "whole body arrived: {received}");

    let deadline = Instant::now() + Duration::from_secs(5);
    while server.handle().stats().active_connections > 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(server.handle().stats().active_connections, 0);
}

#[test]
fn shutdown_closes_idle_connections() {
    let mut server = TestServer::start(test_config());
    let mut stream = server.connect();
    stream.write_all(b"GET /hello HTTP/1.1\r\n\r\n").unwrap();
    read_response(&mut stream).unwrap();

    let handle = server.handle.take().unwrap();
    let started = Instant::now();
    handle.shutdown();
    assert!(is_closed(&mut stream));
    let stats = handle.join();

    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(stats.requests, 1);
    assert_eq!(stats.accepted, 1);
    assert_eq!(stats.active_connections, 0);
}
