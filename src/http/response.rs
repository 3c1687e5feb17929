//! Response values assembled from transport callbacks.
//!
//! # Responsibilities
//! - Hold status, protocol version, reason phrase, header multimap and body
//! - Stay mutable while a handle assembles it, read-only after delivery
//! - Manufacture empty responses through a factory

use bytes::{Bytes, BytesMut};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{StatusCode, Version};

/// An HTTP response.
///
/// `status` is `None` when the exchange failed before a status line arrived.
#[derive(Debug, Clone, Default)]
pub struct Response {
    version: Version,
    status: Option<StatusCode>,
    reason: Option<String>,
    headers: HeaderMap,
    body: BytesMut,
}

impl Response {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// First value of a header as text, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Body decoded as UTF-8, replacing invalid sequences.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn into_body(self) -> Bytes {
        self.body.freeze()
    }

    /// Begin a new header block. Headers from a previous block are dropped.
    pub fn start(&mut self, version: Version, status: StatusCode, reason: Option<String>) {
        self.version = version;
        self.status = Some(status);
        self.reason = reason.filter(|r| !r.is_empty());
        self.headers.clear();
    }

    /// Add a header value; repeated names accumulate.
    pub fn append_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.headers.append(name, value);
    }

    pub fn extend_body(&mut self, chunk: &[u8]) {
        self.body.extend_from_slice(chunk);
    }
}

/// Manufactures the empty response each handle assembles into.
pub trait ResponseFactory: Send + Sync {
    fn create_response(&self) -> Response;
}

/// Factory producing [`Response::default`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultResponseFactory;

impl ResponseFactory for DefaultResponseFactory {
    fn create_response(&self) -> Response {
        Response::new()
    }
}

impl<F> ResponseFactory for F
where
    F: Fn() -> Response + Send + Sync,
{
    fn create_response(&self) -> Response {
        self()
    }
}
