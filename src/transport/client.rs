//! reqwest-backed transport.
//!
//! # Responsibilities
//! - Turn a handle's transfer options into one reqwest request
//! - Stream the response back through the handle callbacks
//! - Map client failures onto transfer codes
//!
//! # Design Decisions
//! - Client-level settings (CA bundle, redirects, connect timeout) select a
//!   cached client; everything else is set per request
//! - Header lines of the form `Name:` suppress that header
//! - Without a `proxy` option the environment's proxy settings apply; an empty
//!   one connects directly
//! - HTTP/2 is only reached through negotiation; 1.0 and 1.1 are pinned

use bytes::Bytes;
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use futures_util::stream;
use http::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT_ENCODING, CONTENT_LENGTH, USER_AGENT};
use http::{Method, Version};
use std::error::Error as StdError;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::config::DispatchConfig;
use crate::dispatch::{Handle, UploadReader};
use crate::transport::error::TransportBuildError;
use crate::transport::options::HttpVersionPref;
use crate::transport::{OptionValue, TransferCode, TransferOption, TransferOptions, Transport};

/// Redirect limit used when following is enabled without `max_redirs`.
const DEFAULT_MAX_REDIRECTS: usize = 10;

/// Size of one streamed upload chunk.
const UPLOAD_CHUNK: usize = 64 * 1024;

/// Settings baked into a `reqwest::Client` rather than a single request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ClientKey {
    ca_info: Option<String>,
    follow_location: bool,
    max_redirs: Option<i64>,
    connect_timeout_ms: Option<i64>,
    proxy: Option<String>,
}

impl ClientKey {
    fn from_options(options: &TransferOptions) -> Self {
        Self {
            ca_info: options.text(TransferOption::CaInfo).map(str::to_string),
            follow_location: options.flag(TransferOption::FollowLocation),
            max_redirs: options.int(TransferOption::MaxRedirs),
            connect_timeout_ms: options.int(TransferOption::ConnectTimeoutMs),
            proxy: options.text(TransferOption::Proxy).map(str::to_string),
        }
    }

    fn build(&self) -> Result<reqwest::Client, TransportBuildError> {
        let redirect = match (self.follow_location, self.max_redirs) {
            (false, _) => reqwest::redirect::Policy::none(),
            (true, Some(n)) if n >= 0 => reqwest::redirect::Policy::limited(n as usize),
            (true, _) => reqwest::redirect::Policy::limited(DEFAULT_MAX_REDIRECTS),
        };

        let mut builder = reqwest::Client::builder().redirect(redirect);
        if let Some(ms) = self.connect_timeout_ms.filter(|ms| *ms > 0) {
            builder = builder.connect_timeout(Duration::from_millis(ms as u64));
        }
        match self.proxy.as_deref() {
            None => {}
            Some("") => builder = builder.no_proxy(),
            Some(url) => builder = builder.proxy(reqwest::Proxy::all(url)?),
        }
        if let Some(path) = &self.ca_info {
            for cert in load_ca_bundle(Path::new(path))? {
                builder = builder.add_root_certificate(cert);
            }
        }
        Ok(builder.build()?)
    }
}

/// Read every PEM certificate from `path`.
pub fn load_ca_bundle(path: &Path) -> Result<Vec<reqwest::Certificate>, TransportBuildError> {
    let bundle_error = |source: io::Error| TransportBuildError::CaBundle {
        path: path.to_path_buf(),
        source,
    };

    let file = File::open(path).map_err(bundle_error)?;
    let mut reader = BufReader::new(file);
    let mut certs = Vec::new();
    for der in rustls_pemfile::certs(&mut reader) {
        let der = der.map_err(bundle_error)?;
        certs.push(reqwest::Certificate::from_der(der.as_ref())?);
    }

    if certs.is_empty() {
        return Err(TransportBuildError::NoCertificates(path.to_path_buf()));
    }
    Ok(certs)
}

/// Transport performing exchanges with reqwest.
#[derive(Debug, Default)]
pub struct ReqwestTransport {
    clients: DashMap<ClientKey, reqwest::Client>,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a transport with the client for `config` ready to use.
    ///
    /// Fails early on an unreadable CA bundle instead of on every exchange.
    pub fn from_config(config: &DispatchConfig) -> Result<Self, TransportBuildError> {
        let mut options = TransferOptions::new();
        if let Some(path) = &config.ca_bundle {
            options.set(
                TransferOption::CaInfo,
                OptionValue::Text(path.display().to_string()),
            );
        }
        options.set(
            TransferOption::ConnectTimeoutMs,
            OptionValue::millis(config.connect_timeout()),
        );
        options.merge_passthrough(&config.transfer_options());

        let transport = Self::new();
        let key = ClientKey::from_options(&options);
        let client = key.build()?;
        transport.clients.insert(key, client);
        Ok(transport)
    }

    fn client_for(&self, options: &TransferOptions) -> Result<reqwest::Client, TransportBuildError> {
        let key = ClientKey::from_options(options);
        if let Some(client) = self.clients.get(&key) {
            return Ok(client.value().clone());
        }

        let client = key.build()?;
        tracing::debug!(?key, "Created HTTP client");
        Ok(self.clients.entry(key).or_insert(client).value().clone())
    }
}

impl Transport for ReqwestTransport {
    fn perform(&self, mut handle: Handle) -> BoxFuture<'static, (Handle, TransferCode)> {
        let client = self.client_for(handle.options());

        Box::pin(async move {
            let result = match client {
                Ok(client) => exchange(&client, &mut handle).await,
                Err(e) => Err(Failure::from(e)),
            };
            match result {
                Ok(()) => (handle, TransferCode::Ok),
                Err(failure) => {
                    tracing::debug!(
                        sequence = %handle.sequence(),
                        code = %failure.code,
                        error = %failure.message,
                        "Exchange failed"
                    );
                    handle.set_error_message(failure.message);
                    (handle, failure.code)
                }
            }
        })
    }
}

/// A failed exchange: native code plus a human-readable message.
#[derive(Debug)]
struct Failure {
    code: TransferCode,
    message: String,
}

impl Failure {
    fn new(code: TransferCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for Failure {
    fn from(err: reqwest::Error) -> Self {
        Self::new(classify_reqwest(&err), error_chain(&err))
    }
}

impl From<TransportBuildError> for Failure {
    fn from(err: TransportBuildError) -> Self {
        match err {
            TransportBuildError::Client(e) => Self::from(e),
            other => Self::new(TransferCode::SslCacertBadfile, other.to_string()),
        }
    }
}

/// Marks a failure of the outbound body reader inside the client's error chain.
#[derive(Debug, Error)]
#[error("failed to read request body: {0}")]
struct UploadError(#[source] io::Error);

async fn exchange(client: &reqwest::Client, handle: &mut Handle) -> Result<(), Failure> {
    let (request, no_body) = build_request(client, handle)?;
    let response = client.execute(request).await?;
    read_response(response, handle, no_body).await
}

fn build_request(
    client: &reqwest::Client,
    handle: &mut Handle,
) -> Result<(reqwest::Request, bool), Failure> {
    let options = handle.options();

    let url = options
        .text(TransferOption::Url)
        .ok_or_else(|| Failure::new(TransferCode::UrlMalformat, "no URL set"))?;
    let url = reqwest::Url::parse(url)
        .map_err(|e| Failure::new(TransferCode::UrlMalformat, format!("{url}: {e}")))?;
    let method = match options.text(TransferOption::CustomRequest) {
        Some(method) => Method::from_bytes(method.as_bytes())
            .map_err(|e| Failure::new(TransferCode::BadFunctionArgument, e.to_string()))?,
        None => Method::GET,
    };

    let mut builder = client.request(method, url);
    let version = options
        .text(TransferOption::HttpVersion)
        .map(HttpVersionPref::parse)
        .unwrap_or(HttpVersionPref::Negotiate);
    match version {
        HttpVersionPref::Http10 => builder = builder.version(Version::HTTP_10),
        HttpVersionPref::Http11 => builder = builder.version(Version::HTTP_11),
        HttpVersionPref::Http2 | HttpVersionPref::Negotiate => {}
    }
    if let Some(ms) = options.int(TransferOption::TimeoutMs).filter(|ms| *ms > 0) {
        builder = builder.timeout(Duration::from_millis(ms as u64));
    }

    let mut headers = header_map(options.list(TransferOption::HttpHeader));
    if !headers.contains_key(USER_AGENT) {
        if let Some(value) = options
            .text(TransferOption::UserAgent)
            .and_then(|ua| HeaderValue::from_str(ua).ok())
        {
            headers.insert(USER_AGENT, value);
        }
    }
    if !headers.contains_key(ACCEPT_ENCODING) {
        if let Some(value) = options
            .text(TransferOption::AcceptEncoding)
            .filter(|enc| !enc.is_empty())
            .and_then(|enc| HeaderValue::from_str(enc).ok())
        {
            headers.insert(ACCEPT_ENCODING, value);
        }
    }

    let no_body = options.flag(TransferOption::NoBody);
    let post_fields = options.bytes(TransferOption::PostFields).cloned();
    let upload = options.flag(TransferOption::Upload);
    let upload_size = options.int(TransferOption::InFileSize).filter(|n| *n >= 0);

    if let Some(bytes) = post_fields {
        builder = builder.body(bytes);
    } else if upload {
        match handle.take_upload() {
            Some(Ok(reader)) => {
                if let Some(size) = upload_size {
                    headers.entry(CONTENT_LENGTH).or_insert(HeaderValue::from(size as u64));
                }
                builder = builder.body(upload_body(reader));
            }
            Some(Err(e)) => return Err(Failure::new(TransferCode::ReadError, e.to_string())),
            None => {}
        }
    }

    let request = builder.headers(headers).build()?;
    Ok((request, no_body))
}

/// Parse `Name: value` header lines; `Name:` alone removes the header.
fn header_map(lines: &[String]) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let Ok(name) = HeaderName::from_bytes(name.trim().as_bytes()) else {
            tracing::trace!(line = %line, "Skipping invalid header name");
            continue;
        };
        let value = value.trim();
        if value.is_empty() {
            headers.remove(&name);
            continue;
        }
        match HeaderValue::from_str(value) {
            Ok(value) => {
                headers.append(name, value);
            }
            Err(_) => tracing::trace!(line = %line, "Skipping invalid header value"),
        }
    }
    headers
}

fn upload_body(reader: UploadReader) -> reqwest::Body {
    let chunks = stream::unfold(Some(reader), |state| async move {
        let mut reader = state?;
        let mut buf = vec![0u8; UPLOAD_CHUNK];
        match reader.read(&mut buf) {
            Ok(0) => None,
            Ok(n) => {
                buf.truncate(n);
                Some((Ok(Bytes::from(buf)), Some(reader)))
            }
            Err(e) => Some((Err(UploadError(e)), None)),
        }
    });
    reqwest::Body::wrap_stream(chunks)
}

async fn read_response(
    mut response: reqwest::Response,
    handle: &mut Handle,
    no_body: bool,
) -> Result<(), Failure> {
    let status = response.status();
    let reason = response
        .extensions()
        .get::<hyper::ext::ReasonPhrase>()
        .and_then(|reason| std::str::from_utf8(reason.as_bytes()).ok())
        .or_else(|| status.canonical_reason())
        .unwrap_or("")
        .to_string();

    let status_line = format!("{:?} {} {}\r\n", response.version(), status.as_u16(), reason);
    handle.header_line(status_line.as_bytes());
    for (name, value) in response.headers() {
        let line = format!("{}: {}\r\n", name, String::from_utf8_lossy(value.as_bytes()));
        handle.header_line(line.as_bytes());
    }
    handle.header_line(b"\r\n");
    handle.set_effective_url(response.url().as_str());

    if no_body {
        return Ok(());
    }
    while let Some(chunk) = response.chunk().await? {
        if handle.write_body(&chunk) != chunk.len() {
            return Err(Failure::new(
                TransferCode::WriteError,
                "response body was not fully accepted",
            ));
        }
    }
    Ok(())
}

fn sources<'a>(err: &'a (dyn StdError + 'static)) -> impl Iterator<Item = &'a (dyn StdError + 'static)> {
    std::iter::successors(Some(err), |&e| e.source())
}

/// Flatten an error and its causes into one message.
fn error_chain(err: &reqwest::Error) -> String {
    let mut parts: Vec<String> = Vec::new();
    for e in sources(err) {
        let text = e.to_string();
        if !parts.last().is_some_and(|last| last.contains(&text)) {
            parts.push(text);
        }
    }
    parts.join(": ")
}

/// Map a reqwest failure onto the closest native transfer code.
pub fn classify_reqwest(err: &reqwest::Error) -> TransferCode {
    if sources(err).any(|e| e.is::<UploadError>()) {
        return TransferCode::ReadError;
    }
    if err.is_timeout() {
        return TransferCode::OperationTimedout;
    }
    if err.is_builder() {
        return TransferCode::UrlMalformat;
    }
    if err.is_redirect() {
        return TransferCode::TooManyRedirects;
    }

    let incomplete = sources(err).any(|e| {
        e.downcast_ref::<hyper::Error>()
            .is_some_and(hyper::Error::is_incomplete_message)
    });
    let text = error_chain(err).to_ascii_lowercase();
    if incomplete || text.contains("connection closed before message completed") {
        return TransferCode::GotNothing;
    }

    if err.is_connect() {
        if text.contains("dns error") || text.contains("failed to lookup") {
            TransferCode::CouldntResolveHost
        } else if ["tls", "ssl", "certificate", "handshake"]
            .iter()
            .any(|needle| text.contains(needle))
        {
            TransferCode::SslConnectError
        } else {
            TransferCode::CouldntConnect
        }
    } else if err.is_body() || err.is_decode() {
        TransferCode::RecvError
    } else if err.is_request() {
        TransferCode::SendError
    } else {
        TransferCode::RecvError
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_header_value_suppresses() {
        let headers = header_map(&[
            "Accept: text/plain".to_string(),
            "X-Multi: a".to_string(),
            "X-Multi: b".to_string(),
            "Expect:".to_string(),
            "Accept:".to_string(),
            "not a header".to_string(),
        ]);

        assert!(!headers.contains_key("accept"));
        assert!(!headers.contains_key("expect"));
        assert_eq!(headers.get_all("x-multi").iter().count(), 2);
    }

    #[test]
    fn builder_errors_are_malformed_urls() {
        let err = reqwest::Client::new()
            .get("http://[::1")
            .build()
            .unwrap_err();
        assert_eq!(classify_reqwest(&err), TransferCode::UrlMalformat);
    }

    #[test]
    fn missing_ca_bundle_is_reported() {
        let err = load_ca_bundle(Path::new("/nonexistent/ca.pem")).unwrap_err();
        assert!(matches!(err, TransportBuildError::CaBundle { .. }));
        assert_eq!(
            Failure::from(err).code,
            TransferCode::SslCacertBadfile
        );
    }

    #[test]
    fn bundle_without_certificates_is_rejected() {
        let path = std::env::temp_dir().join(format!("fanout-ca-{}.pem", uuid::Uuid::new_v4()));
        std::fs::write(&path, "no certificates here\n").unwrap();

        let err = load_ca_bundle(&path).unwrap_err();
        assert!(matches!(err, TransportBuildError::NoCertificates(_)));

        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn client_key_reads_client_level_options() {
        let mut options = TransferOptions::new();
        options.set(TransferOption::FollowLocation, OptionValue::Int(1));
        options.set(TransferOption::MaxRedirs, OptionValue::Int(3));
        options.set(TransferOption::TimeoutMs, OptionValue::Int(5));

        let key = ClientKey::from_options(&options);
        assert!(key.follow_location);
        assert_eq!(key.max_redirs, Some(3));
        assert_eq!(key.connect_timeout_ms, None);
        assert!(key.build().is_ok());
    }

    #[test]
    fn clients_are_cached_per_key() {
        let transport = ReqwestTransport::new();
        let options = TransferOptions::new();
        transport.client_for(&options).unwrap();
        transport.client_for(&options).unwrap();
        assert_eq!(transport.clients.len(), 1);
    }
}
