//! End-to-end tests for the relay server on loopback sockets

use bifrost_tunnel::config::TunnelConfig;
use bifrost_tunnel::error::Result;
use bifrost_tunnel::message::{HttpRequest, HttpResponse};
use bifrost_tunnel::tunnel::{RelayHooks, TunnelServer};
use std::io::{BufReader, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, mpsc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

fn start_server(target_port: u16, hooks: Option<Arc<dyn RelayHooks>>) -> (Arc<TunnelServer>, JoinHandle<Result<()>>, SocketAddr) {
    let config = TunnelConfig {
        listen_port: 0,
        worker_pool_size: 4,
        target_host: "127.0.0.1".to_string(),
        target_port,
        ..TunnelConfig::default()
    };

    let mut server = TunnelServer::new(config);
    if let Some(hooks) = hooks {
        server = server.with_hooks(hooks);
    }
    let server = Arc::new(server);

    let runner = Arc::clone(&server);
    let handle = thread::spawn(move || runner.start());

    let port = loop {
        if let Some(addr) = server.local_addr() {
            break addr.port();
        }
        thread::sleep(Duration::from_millis(10));
    };

    (server, handle, SocketAddr::from(([127, 0, 0, 1], port)))
}

/// Upstream stub answering `count` connections with a fixed response
fn stub_upstream(count: usize, response: &'static [u8]) -> (u16, JoinHandle<Vec<HttpRequest>>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let handle = thread::spawn(move || {
        let mut requests = Vec::new();
        for _ in 0..count {
            let (mut stream, _) = listener.accept().unwrap();
            let request = HttpRequest::read_from(&mut BufReader::new(&stream)).unwrap();
            stream.write_all(response).unwrap();
            requests.push(request);
        }
        requests
    });

    (port, handle)
}

fn exchange(addr: SocketAddr, request: &[u8]) -> String {
    let mut client = TcpStream::connect(addr).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    client.write_all(request).unwrap();

    let mut response = String::new();
    client.read_to_string(&mut response).unwrap();
    response
}

/// Host is rewritten to the target and chunked bodies are re-framed
#[test]
fn test_relay_end_to_end() {
    let (upstream_port, upstream) = stub_upstream(
        1,
        b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nContent-Type: text/plain\r\n\r\n3\r\nabc\r\n0\r\n\r\n",
    );
    let (server, handle, addr) = start_server(upstream_port, None);

    let response = exchange(addr, b"GET /x HTTP/1.1\r\nHost: ignored\r\n\r\n");

    let requests = upstream.join().unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].path(), "/x");
    assert_eq!(
        requests[0].header("host"),
        Some(format!("127.0.0.1:{}", upstream_port).as_str())
    );

    let parsed = HttpResponse::read_from(&mut BufReader::new(response.as_bytes())).unwrap();
    assert_eq!(parsed.status(), 200);
    assert!(parsed.header("transfer-encoding").is_none());
    assert_eq!(parsed.header("content-length"), Some("3"));
    assert_eq!(parsed.header("content-type"), Some("text/plain"));
    assert_eq!(parsed.body_raw().unwrap().as_ref(), b"abc");

    server.stop();
    assert!(handle.join().unwrap().is_ok());
}

/// Request bodies are forwarded with their exact length
#[test]
fn test_relay_forwards_request_body() {
    let (upstream_port, upstream) = stub_upstream(1, b"HTTP/1.1 201 Created\r\nContent-Length: 0\r\n\r\n");
    let (server, handle, addr) = start_server(upstream_port, None);

    let response = exchange(
        addr,
        b"POST /items HTTP/1.1\r\nHost: ignored\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n",
    );
    assert!(response.starts_with("HTTP/1.1 201 Created\r\n"));

    let requests = upstream.join().unwrap();
    assert_eq!(requests[0].body_raw().unwrap().as_ref(), b"hello");

    server.stop();
    handle.join().unwrap().unwrap();
}

/// A HEAD response keeps its Content-Length and is relayed without a body
#[test]
fn test_head_response_is_relayed() {
    let (upstream_port, upstream) = stub_upstream(1, b"HTTP/1.1 200 OK\r\nContent-Length: 1234\r\n\r\n");
    let (server, handle, addr) = start_server(upstream_port, None);

    let response = exchange(addr, b"HEAD /big HTTP/1.1\r\nHost: ignored\r\n\r\n");
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.to_ascii_lowercase().contains("content-length: 1234\r\n"));
    assert!(response.ends_with("\r\n\r\n"));

    upstream.join().unwrap();
    server.stop();
    handle.join().unwrap().unwrap();
}

struct TaggingHooks {
    requests: AtomicUsize,
    responses: AtomicUsize,
}

impl RelayHooks for TaggingHooks {
    fn on_request(&self, request: &mut HttpRequest) {
        self.requests.fetch_add(1, Ordering::SeqCst);
        request.header_set("x-relayed-by", "tunnel").unwrap();
    }

    fn on_response(&self, response: &mut HttpResponse) {
        self.responses.fetch_add(1, Ordering::SeqCst);
        response.header_remove("server");
        response.header_set("x-hooked", "1").unwrap();
    }
}

/// Hooks run exactly once per exchange and their edits reach the wire
#[test]
fn test_hooks_rewrite_messages() {
    let (upstream_port, upstream) = stub_upstream(1, b"HTTP/1.1 200 OK\r\nServer: stub\r\nContent-Length: 2\r\n\r\nok");
    let hooks = Arc::new(TaggingHooks {
        requests: AtomicUsize::new(0),
        responses: AtomicUsize::new(0),
    });
    let (server, handle, addr) = start_server(upstream_port, Some(hooks.clone() as Arc<dyn RelayHooks>));

    let response = exchange(addr, b"GET / HTTP/1.1\r\nHost: ignored\r\n\r\n");
    let requests = upstream.join().unwrap();

    assert_eq!(requests[0].header("x-relayed-by"), Some("tunnel"));
    let lower = response.to_ascii_lowercase();
    assert!(lower.contains("x-hooked: 1\r\n"));
    assert!(!lower.contains("server: stub"));
    assert_eq!(hooks.requests.load(Ordering::SeqCst), 1);
    assert_eq!(hooks.responses.load(Ordering::SeqCst), 1);

    server.stop();
    handle.join().unwrap().unwrap();
}

/// A broken exchange does not affect the next one
#[test]
fn test_failed_relay_is_isolated() {
    let (upstream_port, upstream) = stub_upstream(1, b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nfine");
    let (server, handle, addr) = start_server(upstream_port, None);

    let garbage = exchange(addr, b"\x16\x03\x01 definitely not http\r\n\r\n");
    assert!(garbage.is_empty());

    let response = exchange(addr, b"GET /ok HTTP/1.1\r\nHost: ignored\r\n\r\n");
    assert!(response.ends_with("\r\n\r\nfine"));
    assert!(server.is_running());

    upstream.join().unwrap();
    server.stop();
    handle.join().unwrap().unwrap();
}

/// A chunk size far beyond what the client sends fails only that exchange
#[test]
fn test_oversized_chunk_leaves_server_serving() {
    let (upstream_port, upstream) = stub_upstream(1, b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nstill");
    let (server, handle, addr) = start_server(upstream_port, None);

    for size in ["7fffffffffffffff", "ffffffffffffffff", "40000000"] {
        let mut client = TcpStream::connect(addr).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        let request = format!(
            "POST / HTTP/1.1\r\nHost: ignored\r\nTransfer-Encoding: chunked\r\n\r\n{}\r\nab\r\n",
            size
        );
        client.write_all(request.as_bytes()).unwrap();
        client.shutdown(Shutdown::Write).unwrap();

        // the relay may close with unread input, which shows up as a reset
        let mut rest = Vec::new();
        match client.read_to_end(&mut rest) {
            Ok(_) => assert!(rest.is_empty()),
            Err(e) => assert_eq!(e.kind(), std::io::ErrorKind::ConnectionReset),
        }
    }

    let response = exchange(addr, b"GET /after HTTP/1.1\r\nHost: ignored\r\n\r\n");
    assert!(response.ends_with("\r\n\r\nstill"));
    assert_eq!(upstream.join().unwrap()[0].path(), "/after");

    server.stop();
    handle.join().unwrap().unwrap();
}

/// A stop issued immediately after start is spawned is not lost
#[test]
fn test_stop_immediately_after_spawn() {
    let server = Arc::new(TunnelServer::new(TunnelConfig {
        listen_port: 0,
        worker_pool_size: 2,
        ..TunnelConfig::default()
    }));

    let (done_tx, done_rx) = mpsc::channel();
    let runner = Arc::clone(&server);
    thread::spawn(move || done_tx.send(runner.start()).unwrap());
    server.stop();

    let result = done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(result.is_ok());
    assert!(!server.is_running());
}

/// After stop the port refuses connections, but the exchange already in
/// progress still completes
#[test]
fn test_stop_lets_in_flight_relay_finish() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let upstream_port = listener.local_addr().unwrap().port();
    let (received_tx, received_rx) = mpsc::channel();

    let upstream = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        HttpRequest::read_from(&mut BufReader::new(&stream)).unwrap();
        received_tx.send(()).unwrap();
        thread::sleep(Duration::from_millis(300));
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nslow")
            .unwrap();
    });

    let (server, handle, addr) = start_server(upstream_port, None);
    let client = thread::spawn(move || exchange(addr, b"GET /slow HTTP/1.1\r\nHost: ignored\r\n\r\n"));

    received_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    server.stop();
    assert!(!server.is_running());

    let response = client.join().unwrap();
    assert!(response.ends_with("\r\n\r\nslow"));

    upstream.join().unwrap();
    assert!(handle.join().unwrap().is_ok());
    assert!(TcpStream::connect(addr).is_err());
}
