//! Transfer error classification.
//!
//! # Responsibilities
//! - Split non-zero completion codes into network and request failures
//! - Describe event-loop registration refusals
//! - Describe transport construction failures (client build, CA bundle)

use std::path::PathBuf;
use thiserror::Error;

use crate::transport::TransferCode;

/// Codes that indicate the peer could not be reached at all.
const NETWORK_CODES: [TransferCode; 6] = [
    TransferCode::CouldntResolveProxy,
    TransferCode::CouldntResolveHost,
    TransferCode::CouldntConnect,
    TransferCode::OperationTimedout,
    TransferCode::SslConnectError,
    TransferCode::GotNothing,
];

/// Failure of a single exchange, reported as diagnostics and never thrown.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    /// The peer could not be reached or never answered.
    #[error("network error: {code}: {message}")]
    Network { code: TransferCode, message: String },

    /// The exchange started but failed for any other reason.
    #[error("request error: {code}: {message}")]
    Request { code: TransferCode, message: String },
}

impl TransferError {
    pub fn code(&self) -> TransferCode {
        match self {
            TransferError::Network { code, .. } | TransferError::Request { code, .. } => *code,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            TransferError::Network { message, .. } | TransferError::Request { message, .. } => {
                message
            }
        }
    }

    pub fn is_network(&self) -> bool {
        matches!(self, TransferError::Network { .. })
    }
}

/// Classify a completion code.
///
/// Returns `None` for [`TransferCode::Ok`] whatever the HTTP status was.
pub fn classify(code: TransferCode, message: Option<&str>) -> Option<TransferError> {
    if code.is_ok() {
        return None;
    }

    let message = message
        .filter(|m| !m.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| code.to_string());

    if NETWORK_CODES.contains(&code) {
        Some(TransferError::Network { code, message })
    } else {
        Some(TransferError::Request { code, message })
    }
}

/// The event loop refused to take a configured handle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    /// The transport binding rejected the handle.
    #[error("transport refused handle: {0}")]
    Refused(String),

    /// The event loop has been closed.
    #[error("event loop is closed")]
    Closed,
}

/// Errors building a transport client.
#[derive(Debug, Error)]
pub enum TransportBuildError {
    /// CA bundle could not be read.
    #[error("failed to read CA bundle {path}: {source}")]
    CaBundle {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// CA bundle held no PEM certificates.
    #[error("CA bundle {0} contains no certificates")]
    NoCertificates(PathBuf),

    /// The HTTP client rejected its configuration.
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}
