//! Single-request handle.
//!
//! # Responsibilities
//! - Translate one request into transfer options (`init`)
//! - Reassemble the response from transport callbacks
//! - Expose the outbound body as a pull reader
//! - Produce the completion handed to the response handler
//!
//! # Design Decisions
//! - Construction performs no I/O; `init` may read small bodies into memory
//! - One handle performs one exchange; a retry always builds a new handle

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, EXPECT};
use http::{Method, StatusCode, Version};
use std::collections::BTreeMap;
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::config::DispatchConfig;
use crate::dispatch::{Completion, SequenceId, TransferInfo};
use crate::http::{BodySource, PendingRequest, RequestBody, Response};
use crate::transport::options::HttpVersionPref;
use crate::transport::{classify, OptionValue, TransferCode, TransferOption, TransferOptions};

/// Bodies up to this size are loaded into memory; larger ones are streamed.
pub const MEMORY_BODY_LIMIT: u64 = 1024 * 1024;

/// Methods that may carry a request body.
const BODY_METHODS: [&str; 4] = ["DELETE", "PATCH", "POST", "PUT"];

/// Errors raised while preparing a handle.
#[derive(Debug, Error)]
pub enum HandleError {
    /// Reading the request body into memory failed.
    #[error("failed to read request body: {0}")]
    Body(#[from] io::Error),
}

/// Per-dispatcher settings every handle needs.
#[derive(Debug, Clone)]
pub struct HandleConfig {
    pub user_agent: String,
    pub ca_bundle: Option<PathBuf>,
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub passthrough: BTreeMap<TransferOption, OptionValue>,
}

impl Default for HandleConfig {
    fn default() -> Self {
        Self::from(&DispatchConfig::default())
    }
}

impl From<&DispatchConfig> for HandleConfig {
    fn from(config: &DispatchConfig) -> Self {
        Self {
            user_agent: config.user_agent.clone(),
            ca_bundle: config.ca_bundle.clone(),
            timeout: config.timeout(),
            connect_timeout: config.connect_timeout(),
            passthrough: config.transfer_options(),
        }
    }
}

enum PendingUpload {
    Bytes(Bytes),
    Source(Arc<dyn BodySource>),
}

/// Pull side of a streamed request body.
///
/// Reads count towards the owning handle's uploaded byte total.
pub struct UploadReader {
    inner: Box<dyn Read + Send + Sync>,
    uploaded: Arc<AtomicU64>,
}

impl Read for UploadReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.uploaded.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}

/// One exchange's execution context.
pub struct Handle {
    request: PendingRequest,
    response: Response,
    config: Arc<HandleConfig>,
    options: TransferOptions,
    upload: Option<PendingUpload>,
    sequence: SequenceId,
    retries: u32,
    started: Option<Instant>,
    uploaded: Arc<AtomicU64>,
    downloaded: u64,
    effective_url: Option<String>,
    error_message: Option<String>,
    aborted: Option<TransferCode>,
}

impl Handle {
    pub fn new(request: PendingRequest, response: Response, config: Arc<HandleConfig>) -> Self {
        Self {
            request,
            response,
            config,
            options: TransferOptions::new(),
            upload: None,
            sequence: SequenceId::default(),
            retries: 0,
            started: None,
            uploaded: Arc::new(AtomicU64::new(0)),
            downloaded: 0,
            effective_url: None,
            error_message: None,
            aborted: None,
        }
    }

    /// Attach the logical request identity this exchange runs under.
    pub fn bind(&mut self, sequence: SequenceId, retries: u32) {
        self.sequence = sequence;
        self.retries = retries;
    }

    /// Build the transfer options for this exchange.
    pub fn init(&mut self) -> Result<&TransferOptions, HandleError> {
        let request = Arc::clone(&self.request);
        let mut options = TransferOptions::new();
        self.started = Some(Instant::now());

        let mut url = request.url().clone();
        url.set_fragment(None);
        options.set(TransferOption::Url, OptionValue::Text(url.to_string()));
        options.set(
            TransferOption::HttpVersion,
            OptionValue::Text(HttpVersionPref::from(request.version()).as_str().to_string()),
        );
        options.set(
            TransferOption::UserAgent,
            OptionValue::Text(self.config.user_agent.clone()),
        );
        options.set(
            TransferOption::TimeoutMs,
            OptionValue::millis(self.config.timeout),
        );
        options.set(
            TransferOption::ConnectTimeoutMs,
            OptionValue::millis(self.config.connect_timeout),
        );
        if let Some(path) = &self.config.ca_bundle {
            options.set(
                TransferOption::CaInfo,
                OptionValue::Text(path.display().to_string()),
            );
        }

        let method = request.method().as_str().to_ascii_uppercase();
        if method == Method::HEAD.as_str() {
            options.set(TransferOption::NoBody, OptionValue::Bool(true));
        }
        if method != Method::GET.as_str() {
            options.set(TransferOption::CustomRequest, OptionValue::Text(method.clone()));
        }

        let mut content_length = None;
        if BODY_METHODS.contains(&method.as_str()) && !request.body().is_empty() {
            content_length = self.prepare_body(request.body(), &mut options)?;
        }

        let mut header_lines = Vec::with_capacity(request.headers().len() + 3);
        for (name, value) in request.headers() {
            if *name == EXPECT || *name == CONTENT_LENGTH {
                continue;
            }
            header_lines.push(format!(
                "{}: {}",
                name,
                String::from_utf8_lossy(value.as_bytes())
            ));
        }
        header_lines.push("Expect:".to_string());
        if !request.headers().contains_key(CONTENT_TYPE) {
            header_lines.push("Content-Type:".to_string());
        }
        if let Some(len) = content_length {
            header_lines.push(format!("Content-Length: {len}"));
        } else if !options.flag(TransferOption::Upload) {
            header_lines.push("Content-Length: 0".to_string());
        }
        options.set(TransferOption::HttpHeader, OptionValue::List(header_lines));

        options.merge_passthrough(&self.config.passthrough);

        self.options = options;
        Ok(&self.options)
    }

    /// Decide between an in-memory body and a streamed upload.
    ///
    /// Returns the Content-Length to send for in-memory bodies.
    fn prepare_body(
        &mut self,
        body: &RequestBody,
        options: &mut TransferOptions,
    ) -> Result<Option<u64>, HandleError> {
        let size = body.size();
        let in_memory = size.is_some_and(|s| s <= MEMORY_BODY_LIMIT);

        match body {
            RequestBody::Empty => Ok(None),
            RequestBody::Bytes(bytes) if in_memory => {
                options.set(TransferOption::PostFields, OptionValue::Bytes(bytes.clone()));
                Ok(Some(bytes.len() as u64))
            }
            RequestBody::Source(source) if in_memory => {
                let mut buf = Vec::with_capacity(size.unwrap_or(0) as usize);
                source.open()?.read_to_end(&mut buf)?;
                let len = buf.len() as u64;
                options.set(TransferOption::PostFields, OptionValue::Bytes(Bytes::from(buf)));
                Ok(Some(len))
            }
            RequestBody::Bytes(bytes) => {
                self.upload = Some(PendingUpload::Bytes(bytes.clone()));
                self.declare_upload(size, options);
                Ok(None)
            }
            RequestBody::Source(source) => {
                self.upload = Some(PendingUpload::Source(Arc::clone(source)));
                self.declare_upload(size, options);
                Ok(None)
            }
        }
    }

    fn declare_upload(&self, size: Option<u64>, options: &mut TransferOptions) {
        options.set(TransferOption::Upload, OptionValue::Bool(true));
        if let Some(size) = size {
            options.set(TransferOption::InFileSize, OptionValue::count(size));
        }
    }

    /// Mark the handle as failed before any exchange takes place.
    pub fn abort(&mut self, code: TransferCode, message: impl Into<String>) {
        self.aborted = Some(code);
        self.error_message = Some(message.into());
    }

    /// Completion code for a handle that must not reach the transport.
    pub fn aborted(&self) -> Option<TransferCode> {
        self.aborted
    }

    pub fn options(&self) -> &TransferOptions {
        &self.options
    }

    pub fn request(&self) -> &PendingRequest {
        &self.request
    }

    pub fn sequence(&self) -> SequenceId {
        self.sequence
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Take the outbound body reader for a streamed upload.
    ///
    /// Returns `None` when the exchange has no streamed body or the reader was
    /// already taken.
    pub fn take_upload(&mut self) -> Option<io::Result<UploadReader>> {
        let inner: io::Result<Box<dyn Read + Send + Sync>> = match self.upload.take()? {
            PendingUpload::Bytes(bytes) => Ok(Box::new(io::Cursor::new(bytes))),
            PendingUpload::Source(source) => source.open(),
        };
        Some(inner.map(|inner| UploadReader {
            inner,
            uploaded: Arc::clone(&self.uploaded),
        }))
    }

    /// Header-line callback.
    ///
    /// A status line starts a new header block; any other line is split on
    /// the first colon and appended. Returns the number of bytes consumed.
    pub fn header_line(&mut self, line: &[u8]) -> usize {
        let consumed = line.len();
        let text = String::from_utf8_lossy(line);
        let text = text.trim_end_matches(&['\r', '\n'][..]);
        if text.trim().is_empty() {
            return consumed;
        }

        if text.starts_with("HTTP/") {
            self.status_line(text);
            return consumed;
        }

        let Some((name, value)) = text.split_once(':') else {
            tracing::trace!(line = %text, "Ignoring malformed header line");
            return consumed;
        };
        match (
            HeaderName::from_bytes(name.trim().as_bytes()),
            HeaderValue::from_str(value.trim()),
        ) {
            (Ok(name), Ok(value)) => self.response.append_header(name, value),
            _ => tracing::trace!(line = %text, "Ignoring invalid header"),
        }
        consumed
    }

    fn status_line(&mut self, line: &str) {
        let mut parts = line.splitn(3, ' ');
        let version = match parts.next().unwrap_or_default() {
            "HTTP/0.9" => Version::HTTP_09,
            "HTTP/1.0" => Version::HTTP_10,
            "HTTP/2" | "HTTP/2.0" => Version::HTTP_2,
            "HTTP/3" | "HTTP/3.0" => Version::HTTP_3,
            _ => Version::HTTP_11,
        };
        let status = parts
            .next()
            .and_then(|code| code.parse::<u16>().ok())
            .and_then(|code| StatusCode::from_u16(code).ok());
        let Some(status) = status else {
            tracing::trace!(line = %line, "Ignoring malformed status line");
            return;
        };
        let reason = parts.next().map(|r| r.trim().to_string());
        self.response.start(version, status, reason);
    }

    /// Body-chunk callback. Returns the number of bytes accepted.
    pub fn write_body(&mut self, chunk: &[u8]) -> usize {
        self.response.extend_body(chunk);
        self.downloaded += chunk.len() as u64;
        chunk.len()
    }

    pub fn set_effective_url(&mut self, url: impl Into<String>) {
        self.effective_url = Some(url.into());
    }

    pub fn set_error_message(&mut self, message: impl Into<String>) {
        self.error_message = Some(message.into());
    }

    pub fn response(&self) -> &Response {
        &self.response
    }

    /// Finish the handle and package its outcome.
    pub fn into_completion(self, code: TransferCode, retries_remaining: u32) -> Completion {
        // In-memory bodies only count once the peer answered.
        let sent_fields = if code.is_ok() || self.response.status().is_some() {
            self.options
                .bytes(TransferOption::PostFields)
                .map(|b| b.len() as u64)
                .unwrap_or(0)
        } else {
            0
        };
        let info = TransferInfo {
            code,
            error: classify(code, self.error_message.as_deref()),
            effective_url: self
                .effective_url
                .or_else(|| self.options.text(TransferOption::Url).map(str::to_string))
                .or_else(|| Some(self.request.url().to_string())),
            total_time: self.started.map(|s| s.elapsed()).unwrap_or_default(),
            bytes_uploaded: self.uploaded.load(Ordering::Relaxed) + sent_fields,
            bytes_downloaded: self.downloaded,
        };

        Completion {
            response: self.response,
            request: self.request,
            sequence: self.sequence,
            retries: self.retries,
            retries_remaining,
            info,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{ReaderBody, Request};

    fn handle_for(request: Request) -> Handle {
        Handle::new(
            Arc::new(request),
            Response::new(),
            Arc::new(HandleConfig::default()),
        )
    }

    fn headers(handle: &Handle) -> Vec<String> {
        handle.options().list(TransferOption::HttpHeader).to_vec()
    }

    #[test]
    fn get_is_implicit_and_strips_fragment() {
        let mut handle = handle_for(Request::get("http://example.test/a?b=1#frag").unwrap());
        let options = handle.init().unwrap();

        assert_eq!(options.text(TransferOption::Url), Some("http://example.test/a?b=1"));
        assert!(!options.contains(TransferOption::CustomRequest));
        assert!(!options.flag(TransferOption::NoBody));
        assert_eq!(options.text(TransferOption::HttpVersion), Some("1.1"));
        assert!(headers(&handle).contains(&"Content-Length: 0".to_string()));
    }

    #[test]
    fn head_suppresses_body_and_uppercases_method() {
        let request = Request::parse("head", "http://example.test/").unwrap();
        let mut handle = handle_for(request);
        let options = handle.init().unwrap();

        assert!(options.flag(TransferOption::NoBody));
        assert_eq!(options.text(TransferOption::CustomRequest), Some("HEAD"));
    }

    #[test]
    fn get_never_carries_a_body() {
        let request = Request::get("http://example.test/").unwrap().with_body("ignored");
        let mut handle = handle_for(request);
        let options = handle.init().unwrap();

        assert!(options.bytes(TransferOption::PostFields).is_none());
        assert!(!options.flag(TransferOption::Upload));
    }

    #[test]
    fn small_body_is_loaded_into_memory() {
        let request = Request::parse("POST", "http://example.test/")
            .unwrap()
            .with_header("Content-Length", "999")
            .unwrap()
            .with_body("hello world");
        let mut handle = handle_for(request);
        handle.init().unwrap();

        assert_eq!(
            handle.options().bytes(TransferOption::PostFields),
            Some(&Bytes::from_static(b"hello world"))
        );
        let lines = headers(&handle);
        assert!(lines.contains(&"Content-Length: 11".to_string()));
        assert!(!lines.iter().any(|l| l.contains("999")));
    }

    #[test]
    fn large_body_is_streamed_with_declared_size() {
        let big = vec![b'x'; (MEMORY_BODY_LIMIT + 1) as usize];
        let request = Request::parse("PUT", "http://example.test/")
            .unwrap()
            .with_body(big);
        let mut handle = handle_for(request);
        handle.init().unwrap();

        let options = handle.options();
        assert!(options.flag(TransferOption::Upload));
        assert_eq!(
            options.int(TransferOption::InFileSize),
            Some((MEMORY_BODY_LIMIT + 1) as i64)
        );
        assert!(!headers(&handle).iter().any(|l| l.starts_with("Content-Length")));

        let mut reader = handle.take_upload().unwrap().unwrap();
        let mut sent = Vec::new();
        reader.read_to_end(&mut sent).unwrap();
        assert_eq!(sent.len() as u64, MEMORY_BODY_LIMIT + 1);
        assert!(handle.take_upload().is_none());
    }

    #[test]
    fn unknown_size_body_streams_without_size() {
        let body = ReaderBody::new(io::Cursor::new(b"chunked".to_vec()), None);
        let request = Request::parse("POST", "http://example.test/")
            .unwrap()
            .with_body(RequestBody::from_source(body));
        let mut handle = handle_for(request);
        handle.init().unwrap();

        assert!(handle.options().flag(TransferOption::Upload));
        assert!(!handle.options().contains(TransferOption::InFileSize));
    }

    #[test]
    fn expect_and_content_type_are_suppressed() {
        let request = Request::parse("POST", "http://example.test/")
            .unwrap()
            .with_header("Expect", "100-continue")
            .unwrap()
            .with_body("x");
        let mut handle = handle_for(request);
        handle.init().unwrap();

        let lines = headers(&handle);
        assert!(lines.contains(&"Expect:".to_string()));
        assert!(lines.contains(&"Content-Type:".to_string()));
        assert!(!lines.iter().any(|l| l.contains("100-continue")));
    }

    #[test]
    fn explicit_content_type_is_kept() {
        let request = Request::parse("POST", "http://example.test/")
            .unwrap()
            .with_header("Content-Type", "application/json")
            .unwrap()
            .with_body("{}");
        let mut handle = handle_for(request);
        handle.init().unwrap();

        let lines = headers(&handle);
        assert!(lines.contains(&"content-type: application/json".to_string()));
        assert!(!lines.contains(&"Content-Type:".to_string()));
    }

    #[test]
    fn passthrough_cannot_override_protected_options() {
        let mut config = HandleConfig::default();
        config
            .passthrough
            .insert(TransferOption::CustomRequest, OptionValue::Text("DELETE".into()));
        config
            .passthrough
            .insert(TransferOption::TimeoutMs, OptionValue::Int(1));
        let request = Request::parse("PATCH", "http://example.test/").unwrap();
        let mut handle = Handle::new(Arc::new(request), Response::new(), Arc::new(config));
        let options = handle.init().unwrap();

        assert_eq!(options.text(TransferOption::CustomRequest), Some("PATCH"));
        assert_eq!(options.int(TransferOption::TimeoutMs), Some(1));
    }

    #[test]
    fn header_callback_assembles_response() {
        let mut handle = handle_for(Request::get("http://example.test/").unwrap());
        for line in [
            "HTTP/1.1 100 Continue\r\n",
            "\r\n",
            "HTTP/1.1 404 Not Found\r\n",
            "Set-Cookie: a=1\r\n",
            "Set-Cookie: b=2\r\n",
            "X-Odd: value: with colon\r\n",
            "garbage line\r\n",
            "\r\n",
        ] {
            assert_eq!(handle.header_line(line.as_bytes()), line.len());
        }
        assert_eq!(handle.write_body(b"missing"), 7);

        let response = handle.response();
        assert_eq!(response.status(), Some(StatusCode::NOT_FOUND));
        assert_eq!(response.reason(), Some("Not Found"));
        assert_eq!(response.headers().get_all("set-cookie").iter().count(), 2);
        assert_eq!(response.header("x-odd"), Some("value: with colon"));
        assert_eq!(response.body(), b"missing");
    }

    #[test]
    fn http2_status_line_sets_version() {
        let mut handle = handle_for(Request::get("http://example.test/").unwrap());
        handle.header_line(b"HTTP/2 204 \r\n");
        assert_eq!(handle.response().version(), Version::HTTP_2);
        assert_eq!(handle.response().status(), Some(StatusCode::NO_CONTENT));
        assert_eq!(handle.response().reason(), None);
    }

    #[test]
    fn completion_classifies_code() {
        let mut handle = handle_for(Request::get("http://example.test/").unwrap());
        handle.bind(SequenceId(7), 1);
        handle.init().unwrap();
        handle.set_error_message("connection refused");

        let completion = handle.into_completion(TransferCode::CouldntConnect, 0);
        assert_eq!(completion.sequence, SequenceId(7));
        assert_eq!(completion.retries, 1);
        let error = completion.info.error.unwrap();
        assert!(error.is_network());
        assert_eq!(error.message(), "connection refused");
        assert_eq!(
            completion.info.effective_url.as_deref(),
            Some("http://example.test/")
        );
    }

    #[test]
    fn unsent_body_is_not_counted() {
        let post = || Request::parse("POST", "http://example.test/").unwrap().with_body("hello");

        let mut handle = handle_for(post());
        handle.init().unwrap();
        let failed = handle.into_completion(TransferCode::CouldntConnect, 0);
        assert_eq!(failed.info.bytes_uploaded, 0);

        let mut handle = handle_for(post());
        handle.init().unwrap();
        handle.header_line(b"HTTP/1.1 200 OK\r\n");
        let answered = handle.into_completion(TransferCode::RecvError, 0);
        assert_eq!(answered.info.bytes_uploaded, 5);

        let mut handle = handle_for(post());
        handle.init().unwrap();
        let sent = handle.into_completion(TransferCode::Ok, 0);
        assert_eq!(sent.info.bytes_uploaded, 5);
    }

    #[test]
    fn huge_timeouts_saturate() {
        let config = HandleConfig {
            timeout: Duration::from_secs(u64::MAX),
            ..HandleConfig::default()
        };
        let mut handle = Handle::new(
            Arc::new(Request::get("http://example.test/").unwrap()),
            Response::new(),
            Arc::new(config),
        );
        handle.init().unwrap();

        assert_eq!(handle.options().int(TransferOption::TimeoutMs), Some(i64::MAX));
    }
}
