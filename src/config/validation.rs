//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (window and timeouts > 0)
//! - Check referenced files exist (CA bundle)
//! - Reject unknown or protected passthrough options
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: DispatchConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::path::PathBuf;
use thiserror::Error;

use crate::config::schema::DispatchConfig;
use crate::transport::TransferOption;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("window_size must be greater than zero")]
    ZeroWindow,

    #[error("timeout_secs must be greater than zero")]
    ZeroTimeout,

    #[error("select_timeout_ms must be greater than zero")]
    ZeroSelectTimeout,

    #[error("sequence_origin leaves no room for sequence IDs")]
    SequenceOriginExhausted,

    #[error("ca_bundle {0} does not exist")]
    MissingCaBundle(PathBuf),

    #[error("unknown transfer option `{0}`")]
    UnknownOption(String),

    #[error("transfer option `{0}` is computed per request and cannot be set")]
    ProtectedOption(String),
}

/// Validate a configuration, collecting every problem found.
pub fn validate_config(config: &DispatchConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.window_size == 0 {
        errors.push(ValidationError::ZeroWindow);
    }
    if config.timeout_secs == 0 {
        errors.push(ValidationError::ZeroTimeout);
    }
    if config.select_timeout_ms == 0 {
        errors.push(ValidationError::ZeroSelectTimeout);
    }
    if config.sequence_origin == u64::MAX {
        errors.push(ValidationError::SequenceOriginExhausted);
    }
    if let Some(path) = &config.ca_bundle {
        if !path.is_file() {
            errors.push(ValidationError::MissingCaBundle(path.clone()));
        }
    }

    for name in config.options.keys() {
        match name.parse::<TransferOption>() {
            Ok(opt) if opt.is_protected() => {
                errors.push(ValidationError::ProtectedOption(name.clone()))
            }
            Ok(_) => {}
            Err(_) => errors.push(ValidationError::UnknownOption(name.clone())),
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
