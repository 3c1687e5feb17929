//! Keyed transfer options.
//!
//! A handle describes its exchange as a map of options rather than a fixed
//! struct, so options computed from the request and passthrough options from
//! configuration share one key space and can be merged by precedence.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Transfer option keys understood by the transport bindings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferOption {
    Url,
    CustomRequest,
    NoBody,
    HttpVersion,
    HttpHeader,
    PostFields,
    Upload,
    InFileSize,
    UserAgent,
    TimeoutMs,
    ConnectTimeoutMs,
    CaInfo,
    FollowLocation,
    MaxRedirs,
    AcceptEncoding,
    Proxy,
}

impl TransferOption {
    pub const ALL: [TransferOption; 16] = [
        TransferOption::Url,
        TransferOption::CustomRequest,
        TransferOption::NoBody,
        TransferOption::HttpVersion,
        TransferOption::HttpHeader,
        TransferOption::PostFields,
        TransferOption::Upload,
        TransferOption::InFileSize,
        TransferOption::UserAgent,
        TransferOption::TimeoutMs,
        TransferOption::ConnectTimeoutMs,
        TransferOption::CaInfo,
        TransferOption::FollowLocation,
        TransferOption::MaxRedirs,
        TransferOption::AcceptEncoding,
        TransferOption::Proxy,
    ];

    /// Options that are always recomputed from the request and never taken
    /// from passthrough configuration.
    pub fn is_protected(self) -> bool {
        matches!(
            self,
            TransferOption::HttpHeader | TransferOption::CustomRequest | TransferOption::NoBody
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransferOption::Url => "url",
            TransferOption::CustomRequest => "custom_request",
            TransferOption::NoBody => "no_body",
            TransferOption::HttpVersion => "http_version",
            TransferOption::HttpHeader => "http_header",
            TransferOption::PostFields => "post_fields",
            TransferOption::Upload => "upload",
            TransferOption::InFileSize => "in_file_size",
            TransferOption::UserAgent => "user_agent",
            TransferOption::TimeoutMs => "timeout_ms",
            TransferOption::ConnectTimeoutMs => "connect_timeout_ms",
            TransferOption::CaInfo => "ca_info",
            TransferOption::FollowLocation => "follow_location",
            TransferOption::MaxRedirs => "max_redirs",
            TransferOption::AcceptEncoding => "accept_encoding",
            TransferOption::Proxy => "proxy",
        }
    }
}

impl fmt::Display for TransferOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown option name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownOption(pub String);

impl FromStr for TransferOption {
    type Err = UnknownOption;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TransferOption::ALL
            .into_iter()
            .find(|opt| opt.as_str() == s)
            .ok_or_else(|| UnknownOption(s.to_string()))
    }
}

/// Value of a transfer option.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
    Text(String),
    List(Vec<String>),
    #[serde(skip)]
    Bytes(Bytes),
}

impl OptionValue {
    /// Integer value, saturating at `i64::MAX`.
    pub fn count(n: u64) -> Self {
        OptionValue::Int(i64::try_from(n).unwrap_or(i64::MAX))
    }

    /// Duration in whole milliseconds, saturating at `i64::MAX`.
    pub fn millis(duration: Duration) -> Self {
        OptionValue::Int(i64::try_from(duration.as_millis()).unwrap_or(i64::MAX))
    }
}

/// HTTP protocol version requested from the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersionPref {
    Http10,
    Http11,
    Http2,
    Negotiate,
}

impl HttpVersionPref {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpVersionPref::Http10 => "1.0",
            HttpVersionPref::Http11 => "1.1",
            HttpVersionPref::Http2 => "2.0",
            HttpVersionPref::Negotiate => "negotiate",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "1.0" => HttpVersionPref::Http10,
            "1.1" => HttpVersionPref::Http11,
            "2" | "2.0" => HttpVersionPref::Http2,
            _ => HttpVersionPref::Negotiate,
        }
    }
}

impl From<http::Version> for HttpVersionPref {
    fn from(version: http::Version) -> Self {
        match version {
            http::Version::HTTP_10 => HttpVersionPref::Http10,
            http::Version::HTTP_11 => HttpVersionPref::Http11,
            http::Version::HTTP_2 => HttpVersionPref::Http2,
            _ => HttpVersionPref::Negotiate,
        }
    }
}

/// The full option set of one exchange.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransferOptions {
    values: BTreeMap<TransferOption, OptionValue>,
}

impl TransferOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, option: TransferOption, value: OptionValue) {
        self.values.insert(option, value);
    }

    pub fn remove(&mut self, option: TransferOption) -> Option<OptionValue> {
        self.values.remove(&option)
    }

    pub fn get(&self, option: TransferOption) -> Option<&OptionValue> {
        self.values.get(&option)
    }

    pub fn contains(&self, option: TransferOption) -> bool {
        self.values.contains_key(&option)
    }

    pub fn text(&self, option: TransferOption) -> Option<&str> {
        match self.get(option) {
            Some(OptionValue::Text(s)) => Some(s),
            _ => None,
        }
    }

    pub fn int(&self, option: TransferOption) -> Option<i64> {
        match self.get(option) {
            Some(OptionValue::Int(n)) => Some(*n),
            _ => None,
        }
    }

    /// Boolean value; integers are accepted with C-style truthiness.
    pub fn flag(&self, option: TransferOption) -> bool {
        match self.get(option) {
            Some(OptionValue::Bool(b)) => *b,
            Some(OptionValue::Int(n)) => *n != 0,
            _ => false,
        }
    }

    pub fn list(&self, option: TransferOption) -> &[String] {
        match self.get(option) {
            Some(OptionValue::List(items)) => items,
            _ => &[],
        }
    }

    pub fn bytes(&self, option: TransferOption) -> Option<&Bytes> {
        match self.get(option) {
            Some(OptionValue::Bytes(b)) => Some(b),
            _ => None,
        }
    }

    /// Merge passthrough options over the computed ones.
    ///
    /// Passthrough values win, except for protected options which keep the
    /// computed value.
    pub fn merge_passthrough<'a, I>(&mut self, passthrough: I)
    where
        I: IntoIterator<Item = (&'a TransferOption, &'a OptionValue)>,
    {
        for (option, value) in passthrough {
            if option.is_protected() {
                tracing::trace!(option = %option, "Ignoring protected passthrough option");
                continue;
            }
            self.values.insert(*option, value.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TransferOption, &OptionValue)> {
        self.values.iter()
    }
}
