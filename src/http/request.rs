//! Outbound request values.
//!
//! # Responsibilities
//! - Immutable request description (method, URL, version, headers, body)
//! - Body sources that can be reopened for retries
//!
//! # Design Decisions
//! - Requests are shared read-only once enqueued (`PendingRequest` is an `Arc`)
//! - Bodies are either in memory or a reopenable source; each exchange opens
//!   its own reader so a retried request re-sends the body from the start

use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Method, Version};
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use url::Url;

/// A request shared between the dispatcher queue and its handles.
pub type PendingRequest = Arc<Request>;

/// Errors building a [`Request`].
#[derive(Debug, Error)]
pub enum RequestError {
    /// URL could not be parsed.
    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Method token is not valid.
    #[error("invalid method: {0}")]
    InvalidMethod(#[from] http::method::InvalidMethod),

    /// Header name is not valid.
    #[error("invalid header name: {0}")]
    InvalidHeaderName(#[from] http::header::InvalidHeaderName),

    /// Header value is not valid.
    #[error("invalid header value: {0}")]
    InvalidHeaderValue(#[from] http::header::InvalidHeaderValue),
}

/// A readable body that can be opened once per exchange.
pub trait BodySource: Send + Sync {
    /// Size in bytes, if known up front.
    fn size(&self) -> Option<u64>;

    /// Open a fresh reader positioned at the start of the body.
    fn open(&self) -> io::Result<Box<dyn Read + Send + Sync>>;
}

/// Body read from a file on every exchange.
#[derive(Debug, Clone)]
pub struct FileBody {
    path: PathBuf,
    size: u64,
}

impl FileBody {
    pub fn new(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let size = std::fs::metadata(&path)?.len();
        Ok(Self { path, size })
    }
}

impl BodySource for FileBody {
    fn size(&self) -> Option<u64> {
        Some(self.size)
    }

    fn open(&self) -> io::Result<Box<dyn Read + Send + Sync>> {
        Ok(Box::new(File::open(&self.path)?))
    }
}

/// One-shot body wrapping an arbitrary reader.
///
/// The reader can be opened once; a retried request carrying this body fails
/// with a read error on its second exchange.
pub struct ReaderBody {
    reader: Mutex<Option<Box<dyn Read + Send + Sync>>>,
    size: Option<u64>,
}

impl ReaderBody {
    pub fn new<R>(reader: R, size: Option<u64>) -> Self
    where
        R: Read + Send + Sync + 'static,
    {
        Self {
            reader: Mutex::new(Some(Box::new(reader))),
            size,
        }
    }
}

impl BodySource for ReaderBody {
    fn size(&self) -> Option<u64> {
        self.size
    }

    fn open(&self) -> io::Result<Box<dyn Read + Send + Sync>> {
        self.reader
            .lock()
            .map_err(|_| io::Error::other("body reader lock poisoned"))?
            .take()
            .ok_or_else(|| io::Error::other("body stream already consumed"))
    }
}

impl fmt::Debug for ReaderBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReaderBody").field("size", &self.size).finish()
    }
}

/// Request body.
#[derive(Clone, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Bytes(Bytes),
    Source(Arc<dyn BodySource>),
}

impl RequestBody {
    pub fn from_source<S: BodySource + 'static>(source: S) -> Self {
        RequestBody::Source(Arc::new(source))
    }

    /// Size in bytes, if known.
    pub fn size(&self) -> Option<u64> {
        match self {
            RequestBody::Empty => Some(0),
            RequestBody::Bytes(b) => Some(b.len() as u64),
            RequestBody::Source(s) => s.size(),
        }
    }

    /// True only when the body is known to hold zero bytes.
    pub fn is_empty(&self) -> bool {
        self.size() == Some(0)
    }
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestBody::Empty => f.write_str("Empty"),
            RequestBody::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            RequestBody::Source(s) => f.debug_struct("Source").field("size", &s.size()).finish(),
        }
    }
}

impl From<Bytes> for RequestBody {
    fn from(bytes: Bytes) -> Self {
        RequestBody::Bytes(bytes)
    }
}

impl From<Vec<u8>> for RequestBody {
    fn from(bytes: Vec<u8>) -> Self {
        RequestBody::Bytes(Bytes::from(bytes))
    }
}

impl From<String> for RequestBody {
    fn from(text: String) -> Self {
        RequestBody::Bytes(Bytes::from(text))
    }
}

impl From<&'static str> for RequestBody {
    fn from(text: &'static str) -> Self {
        RequestBody::Bytes(Bytes::from_static(text.as_bytes()))
    }
}

/// An outbound HTTP request.
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    url: Url,
    version: Version,
    headers: HeaderMap,
    body: RequestBody,
}

impl Request {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: RequestBody::Empty,
        }
    }

    /// Parse a method token and URL. The method is uppercased.
    pub fn parse(method: &str, url: &str) -> Result<Self, RequestError> {
        let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())?;
        Ok(Self::new(method, Url::parse(url)?))
    }

    pub fn get(url: &str) -> Result<Self, RequestError> {
        Ok(Self::new(Method::GET, Url::parse(url)?))
    }

    pub fn with_version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    /// Append a header; repeated names accumulate.
    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self, RequestError> {
        let name = HeaderName::from_bytes(name.as_bytes())?;
        let value = HeaderValue::from_str(value)?;
        self.headers.append(name, value);
        Ok(self)
    }

    pub fn with_body(mut self, body: impl Into<RequestBody>) -> Self {
        self.body = body.into();
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn body(&self) -> &RequestBody {
        &self.body
    }
}
