//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use record_proxy::config::RecorderConfig;
use record_proxy::lifecycle::Shutdown;
use record_proxy::net::{FixedDestination, Listener};
use record_proxy::proxy::{ProxyError, RecordingProxy};
use record_proxy::record::{read_record, RequestResponse};

/// Length of the first complete response in `buf`, if there is one.
///
/// Only handles `Content-Length` framing, which is all the mocks produce.
fn complete_response_len(buf: &[u8]) -> Option<usize> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut res = httparse::Response::new(&mut headers);
    let head = match res.parse(buf).ok()? {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => return None,
    };
    let body = res
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("content-length"))
        .and_then(|h| std::str::from_utf8(h.value).ok()?.parse::<usize>().ok())
        .unwrap_or(0);
    (buf.len() >= head + body).then_some(head + body)
}

/// Parse complete requests off the front of `buf`, returning their targets.
fn drain_requests(buf: &mut Vec<u8>) -> Vec<String> {
    let mut targets = Vec::new();
    loop {
        let mut headers = [httparse::EMPTY_HEADER; 32];
        let mut req = httparse::Request::new(&mut headers);
        let head = match req.parse(&buf[..]) {
            Ok(httparse::Status::Complete(n)) => n,
            _ => return targets,
        };
        let body = req
            .headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case("content-length"))
            .and_then(|h| std::str::from_utf8(h.value).ok()?.parse::<usize>().ok())
            .unwrap_or(0);
        if buf.len() < head + body {
            return targets;
        }
        targets.push(req.path.unwrap_or("/").to_string());
        buf.drain(..head + body);
    }
}

/// Start a backend that answers every request with its own target as body.
pub async fn start_echo_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    tokio::spawn(async move {
                        let mut pending = Vec::new();
                        let mut buf = [0u8; 4096];
                        loop {
                            let n = match socket.read(&mut buf).await {
                                Ok(0) | Err(_) => break,
                                Ok(n) => n,
                            };
                            pending.extend_from_slice(&buf[..n]);
                            for target in drain_requests(&mut pending) {
                                let response = format!(
                                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
                                    target.len(),
                                    target
                                );
                                if socket.write_all(response.as_bytes()).await.is_err() {
                                    return;
                                }
                            }
                        }
                    });
                }
                Err(_) => break,
            }
        }
    });

    addr
}

/// Start a backend that sends `response` as soon as a connection opens,
/// before any request.
pub async fn start_unsolicited_backend(response: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let _ = socket.write_all(response.as_bytes()).await;
                let mut sink = [0u8; 1024];
                while let Ok(n) = socket.read(&mut sink).await {
                    if n == 0 {
                        break;
                    }
                }
            });
        }
    });

    addr
}

/// An address nothing listens on.
pub fn closed_port() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

pub struct TestProxy {
    pub addr: SocketAddr,
    pub proxy: Arc<RecordingProxy>,
    pub shutdown: Shutdown,
    pub handle: JoinHandle<Result<(), ProxyError>>,
}

/// Start a proxy on an ephemeral port that sends everything to `upstream`
/// and records into `record_dir`.
pub async fn start_proxy(upstream: SocketAddr, record_dir: &Path) -> TestProxy {
    let mut config = RecorderConfig::default();
    config.listener.bind_address = "127.0.0.1:0".to_string();
    config.recording.output_dir = record_dir.to_path_buf();
    config.timeouts.connect_secs = 2;
    config.timeouts.drain_secs = 2;

    let listener = Listener::bind(&config.listener).await.unwrap();
    let addr = listener.local_addr().unwrap();

    let proxy = Arc::new(RecordingProxy::new(
        config,
        Arc::new(FixedDestination(upstream)),
    ));
    let shutdown = Shutdown::new();
    let receiver = shutdown.subscribe();

    let running = Arc::clone(&proxy);
    let handle = tokio::spawn(async move { running.run(listener, receiver).await });

    TestProxy {
        addr,
        proxy,
        shutdown,
        handle,
    }
}

/// Read until `count` complete responses have arrived.
pub async fn read_responses(stream: &mut TcpStream, count: usize) -> Vec<Vec<u8>> {
    let mut responses = Vec::new();
    let mut pending = Vec::new();
    let mut buf = [0u8; 4096];

    while responses.len() < count {
        while let Some(len) = complete_response_len(&pending) {
            responses.push(pending.drain(..len).collect());
        }
        if responses.len() >= count {
            break;
        }
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .expect("timed out waiting for response")
            .unwrap();
        assert!(n > 0, "connection closed before {count} responses");
        pending.extend_from_slice(&buf[..n]);
    }

    responses
}

/// Read until the peer closes.
pub async fn read_to_close(stream: &mut TcpStream) -> Vec<u8> {
    let mut out = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut out))
        .await
        .expect("timed out waiting for close")
        .unwrap();
    out
}

/// Poll `dir` until it holds `count` records.
pub async fn wait_for_records(dir: &Path, count: usize) -> Vec<RequestResponse> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        // A file still being written may not decode yet.
        let records: Vec<RequestResponse> = std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|entry| read_record(&entry.unwrap().path()).ok())
            .filter(RequestResponse::is_complete)
            .collect();
        if records.len() >= count {
            return records;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "expected {count} records, found {}",
            records.len()
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub fn record_count(dir: &Path) -> usize {
    std::fs::read_dir(dir).unwrap().count()
}
