//! Transport subsystem.
//!
//! # Data Flow
//! ```text
//! Handle::init()
//!     → options.rs (keyed transfer options, passthrough merge)
//!     → Transport::register (binding may refuse the handle)
//!     → Transport::perform (exactly one exchange)
//!         → pulls outbound bytes from the handle's upload reader
//!         → pushes status/header lines and body chunks into the handle
//!     → TransferCode (native completion code)
//!     → error.rs (Network / Request classification)
//! ```
//!
//! # Design Decisions
//! - A transport performs one exchange per handle and never reuses a finished one
//! - Response reassembly always goes through the handle callbacks, even when
//!   the underlying client already parsed the response
//! - A zero code means the exchange completed; HTTP 4xx/5xx are not errors here

pub mod client;
pub mod error;
pub mod options;

use futures_util::future::BoxFuture;
use std::fmt;

use crate::dispatch::handle::Handle;

pub use client::ReqwestTransport;
pub use error::{classify, RegistrationError, TransferError, TransportBuildError};
pub use options::{OptionValue, TransferOption, TransferOptions};

/// Native completion code reported by a transport at the end of an exchange.
///
/// Numbering follows the classic transfer-library codes so diagnostics stay
/// comparable across bindings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferCode {
    Ok,
    UnsupportedProtocol,
    UrlMalformat,
    CouldntResolveProxy,
    CouldntResolveHost,
    CouldntConnect,
    WriteError,
    ReadError,
    OperationTimedout,
    SslConnectError,
    AbortedByCallback,
    BadFunctionArgument,
    TooManyRedirects,
    GotNothing,
    SendError,
    RecvError,
    SslCacertBadfile,
    Other(i32),
}

impl TransferCode {
    /// Numeric value of the code.
    pub fn as_i32(self) -> i32 {
        match self {
            TransferCode::Ok => 0,
            TransferCode::UnsupportedProtocol => 1,
            TransferCode::UrlMalformat => 3,
            TransferCode::CouldntResolveProxy => 5,
            TransferCode::CouldntResolveHost => 6,
            TransferCode::CouldntConnect => 7,
            TransferCode::WriteError => 23,
            TransferCode::ReadError => 26,
            TransferCode::OperationTimedout => 28,
            TransferCode::SslConnectError => 35,
            TransferCode::AbortedByCallback => 42,
            TransferCode::BadFunctionArgument => 43,
            TransferCode::TooManyRedirects => 47,
            TransferCode::GotNothing => 52,
            TransferCode::SendError => 55,
            TransferCode::RecvError => 56,
            TransferCode::SslCacertBadfile => 77,
            TransferCode::Other(code) => code,
        }
    }

    pub fn is_ok(self) -> bool {
        self == TransferCode::Ok
    }

    fn name(self) -> &'static str {
        match self {
            TransferCode::Ok => "ok",
            TransferCode::UnsupportedProtocol => "unsupported protocol",
            TransferCode::UrlMalformat => "malformed url",
            TransferCode::CouldntResolveProxy => "could not resolve proxy",
            TransferCode::CouldntResolveHost => "could not resolve host",
            TransferCode::CouldntConnect => "could not connect",
            TransferCode::WriteError => "write error",
            TransferCode::ReadError => "read error",
            TransferCode::OperationTimedout => "operation timed out",
            TransferCode::SslConnectError => "tls connect error",
            TransferCode::AbortedByCallback => "aborted by callback",
            TransferCode::BadFunctionArgument => "bad function argument",
            TransferCode::TooManyRedirects => "too many redirects",
            TransferCode::GotNothing => "empty reply from server",
            TransferCode::SendError => "send error",
            TransferCode::RecvError => "receive error",
            TransferCode::SslCacertBadfile => "problem with the CA bundle",
            TransferCode::Other(_) => "transfer failed",
        }
    }
}

impl From<i32> for TransferCode {
    fn from(code: i32) -> Self {
        match code {
            0 => TransferCode::Ok,
            1 => TransferCode::UnsupportedProtocol,
            3 => TransferCode::UrlMalformat,
            5 => TransferCode::CouldntResolveProxy,
            6 => TransferCode::CouldntResolveHost,
            7 => TransferCode::CouldntConnect,
            23 => TransferCode::WriteError,
            26 => TransferCode::ReadError,
            28 => TransferCode::OperationTimedout,
            35 => TransferCode::SslConnectError,
            42 => TransferCode::AbortedByCallback,
            43 => TransferCode::BadFunctionArgument,
            47 => TransferCode::TooManyRedirects,
            52 => TransferCode::GotNothing,
            55 => TransferCode::SendError,
            56 => TransferCode::RecvError,
            77 => TransferCode::SslCacertBadfile,
            other => TransferCode::Other(other),
        }
    }
}

impl fmt::Display for TransferCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.as_i32())
    }
}

/// An opaque engine that performs one HTTP exchange per handle.
///
/// The dispatcher's event loop calls [`Transport::register`] when a handle is
/// admitted and then drives the future returned by [`Transport::perform`]
/// together with every other active exchange.
pub trait Transport: Send + Sync + 'static {
    /// Accept or refuse a configured handle before it joins the event loop.
    fn register(&self, _handle: &Handle) -> Result<(), RegistrationError> {
        Ok(())
    }

    /// Execute the exchange described by `handle.options()`, feeding the
    /// response back through the handle callbacks.
    fn perform(&self, handle: Handle) -> BoxFuture<'static, (Handle, TransferCode)>;
}
