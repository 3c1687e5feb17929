//! Shared utilities for integration testing.

#![allow(dead_code)]

use futures_util::future::BoxFuture;
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use http_fanout::dispatch::Handle;
use http_fanout::transport::{RegistrationError, TransferCode, Transport};

#[derive(Default)]
struct ScriptState {
    codes: HashMap<String, VecDeque<TransferCode>>,
    statuses: HashMap<String, VecDeque<u16>>,
    delays: HashMap<String, Duration>,
    refuse: HashSet<usize>,
    refuse_all: bool,
    register_calls: usize,
    in_flight: usize,
    max_in_flight: usize,
    performed: Vec<String>,
}

/// In-memory transport answering by URL path.
///
/// Every exchange sleeps for its delay, then either fails with the next
/// scripted code for its path or answers with the next scripted status
/// (200 by default) and the path as body.
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    state: Arc<Mutex<ScriptState>>,
    delay: Duration,
}

struct InFlight(Arc<Mutex<ScriptState>>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.lock().unwrap().in_flight -= 1;
    }
}

impl ScriptedTransport {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn fail(self, path: &str, codes: impl IntoIterator<Item = TransferCode>) -> Self {
        self.state
            .lock()
            .unwrap()
            .codes
            .insert(path.to_string(), codes.into_iter().collect());
        self
    }

    pub fn statuses(self, path: &str, statuses: impl IntoIterator<Item = u16>) -> Self {
        self.state
            .lock()
            .unwrap()
            .statuses
            .insert(path.to_string(), statuses.into_iter().collect());
        self
    }

    pub fn delay_path(self, path: &str, delay: Duration) -> Self {
        self.state
            .lock()
            .unwrap()
            .delays
            .insert(path.to_string(), delay);
        self
    }

    /// Refuse the registration with this zero-based call index.
    pub fn refuse_registration(self, index: usize) -> Self {
        self.state.lock().unwrap().refuse.insert(index);
        self
    }

    pub fn refuse_all(self) -> Self {
        self.state.lock().unwrap().refuse_all = true;
        self
    }

    pub fn max_in_flight(&self) -> usize {
        self.state.lock().unwrap().max_in_flight
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().unwrap().in_flight
    }

    pub fn register_calls(&self) -> usize {
        self.state.lock().unwrap().register_calls
    }

    /// Paths in the order their exchanges started.
    pub fn performed(&self) -> Vec<String> {
        self.state.lock().unwrap().performed.clone()
    }

    pub fn shared(&self) -> Arc<dyn Transport> {
        Arc::new(self.clone())
    }
}

impl Transport for ScriptedTransport {
    fn register(&self, _handle: &Handle) -> Result<(), RegistrationError> {
        let mut state = self.state.lock().unwrap();
        let index = state.register_calls;
        state.register_calls += 1;
        if state.refuse_all || state.refuse.contains(&index) {
            return Err(RegistrationError::Refused(format!("registration {index} refused")));
        }
        Ok(())
    }

    fn perform(&self, mut handle: Handle) -> BoxFuture<'static, (Handle, TransferCode)> {
        let path = handle.request().url().path().to_string();
        let (code, status, delay) = {
            let mut state = self.state.lock().unwrap();
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
            state.performed.push(path.clone());
            let code = state
                .codes
                .get_mut(&path)
                .and_then(VecDeque::pop_front)
                .unwrap_or(TransferCode::Ok);
            let status = state
                .statuses
                .get_mut(&path)
                .and_then(VecDeque::pop_front)
                .unwrap_or(200);
            let delay = state.delays.get(&path).copied().unwrap_or(self.delay);
            (code, status, delay)
        };
        let guard = InFlight(Arc::clone(&self.state));

        Box::pin(async move {
            let _guard = guard;
            tokio::time::sleep(delay).await;
            if code.is_ok() {
                handle.header_line(format!("HTTP/1.1 {status} Scripted\r\n").as_bytes());
                handle.header_line(b"\r\n");
                handle.write_body(path.as_bytes());
            } else {
                handle.set_error_message(format!("scripted failure {code}"));
            }
            (handle, code)
        })
    }
}

/// A raw TCP backend that records every request it receives.
pub struct MockBackend {
    pub addr: SocketAddr,
    requests: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl MockBackend {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Raw requests received so far.
    pub fn requests(&self) -> Vec<Vec<u8>> {
        self.requests.lock().unwrap().clone()
    }

    /// Body bytes of the first request, as sent on the wire.
    pub fn first_body(&self) -> Vec<u8> {
        let requests = self.requests();
        let raw = requests.first().expect("no request received");
        let start = find(raw, b"\r\n\r\n").map(|i| i + 4).unwrap_or(raw.len());
        raw[start..].to_vec()
    }

    /// Head of the first request, lowercased.
    pub fn first_head(&self) -> String {
        let requests = self.requests();
        let raw = requests.first().expect("no request received");
        let end = find(raw, b"\r\n\r\n").map(|i| i + 4).unwrap_or(raw.len());
        String::from_utf8_lossy(&raw[..end]).to_ascii_lowercase()
    }
}

/// Decode a chunked request body, stopping at the last complete chunk.
pub fn dechunk(mut body: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    while let Some(line_end) = find(body, b"\r\n") {
        let size_field = String::from_utf8_lossy(&body[..line_end]);
        let Ok(size) = usize::from_str_radix(size_field.split(';').next().unwrap_or("").trim(), 16)
        else {
            break;
        };
        let start = line_end + 2;
        if size == 0 || body.len() < start + size {
            break;
        }
        out.extend_from_slice(&body[start..start + size]);
        body = &body[(start + size + 2).min(body.len())..];
    }
    out
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

async fn read_request(socket: &mut TcpStream) -> Vec<u8> {
    let mut raw = Vec::new();
    let mut buf = [0u8; 8192];
    let head_end = loop {
        if let Some(i) = find(&raw, b"\r\n\r\n") {
            break i + 4;
        }
        match socket.read(&mut buf).await {
            Ok(0) | Err(_) => return raw,
            Ok(n) => raw.extend_from_slice(&buf[..n]),
        }
    };

    let head = String::from_utf8_lossy(&raw[..head_end]).to_ascii_lowercase();
    if head.contains("\r\ntransfer-encoding: chunked\r\n") {
        while !raw[head_end..].ends_with(b"0\r\n\r\n") {
            match socket.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => raw.extend_from_slice(&buf[..n]),
            }
        }
        return raw;
    }

    let content_length = head
        .lines()
        .find_map(|line| line.strip_prefix("content-length:"))
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(0);

    while raw.len() < head_end + content_length {
        match socket.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => raw.extend_from_slice(&buf[..n]),
        }
    }
    raw
}

/// Start a backend answering every request with the raw `response`.
pub async fn start_capturing_backend(response: &'static str) -> MockBackend {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let requests = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&requests);

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    let seen = Arc::clone(&seen);
                    tokio::spawn(async move {
                        let raw = read_request(&mut socket).await;
                        seen.lock().unwrap().push(raw);
                        let _ = socket.write_all(response.as_bytes()).await;
                        let _ = socket.shutdown().await;
                    });
                }
                Err(_) => break,
            }
        }
    });

    MockBackend { addr, requests }
}

/// Start a backend that reads the request and closes without answering.
pub async fn start_silent_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let _ = read_request(&mut socket).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    addr
}

/// An address nothing listens on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}
