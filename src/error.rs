//! Error types shared across the engine.
//!
//! Request failures are classified into a closed [`ErrorKind`] set; the
//! kind decides whether the failure is reported and how the rest of the
//! iteration proceeds. Everything else is a plain `thiserror` enum.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Classification of a failed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Proxy,
    ConnTimeout,
    ReadTimeout,
    ConnRefused,
    Dns,
    ConnReset,
    InvalidRequest,
    Intentional,
    Skipped,
    Unknown,
}

impl ErrorKind {
    /// Stable reason used as the key of the error distribution.
    pub fn reason(self) -> &'static str {
        match self {
            ErrorKind::Proxy => "proxy error",
            ErrorKind::ConnTimeout => "connection timeout",
            ErrorKind::ReadTimeout => "read timeout",
            ErrorKind::ConnRefused => "connection refused",
            ErrorKind::Dns => "dns resolution failed",
            ErrorKind::ConnReset => "connection reset",
            ErrorKind::InvalidRequest => "invalid request",
            ErrorKind::Intentional => "cancelled",
            ErrorKind::Skipped => "skipped",
            ErrorKind::Unknown => "unknown error",
        }
    }

    /// Whether failures of this kind reach the aggregator.
    pub fn is_reported(self) -> bool {
        !matches!(self, ErrorKind::Intentional | ErrorKind::Skipped)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.reason())
    }
}

/// A step-level failure: a kind plus a free-form detail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {detail}")]
pub struct RequestError {
    pub kind: ErrorKind,
    pub detail: String,
}

impl RequestError {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn intentional() -> Self {
        Self::new(ErrorKind::Intentional, "test cancelled")
    }

    pub fn skipped() -> Self {
        Self::new(ErrorKind::Skipped, "previous step aborted the iteration")
    }

    /// Key used in the per-step error distribution.
    pub fn reason(&self) -> &'static str {
        self.kind.reason()
    }
}

/// Failures while loading or validating a plan. These abort the test
/// before any iteration runs.
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse plan: {0}")]
    Parse(String),

    #[error("invalid plan: {0}")]
    Invalid(String),

    #[error("step {step}: {message}")]
    Step { step: u32, message: String },

    #[error("data source '{source_name}': {message}")]
    Data {
        source_name: String,
        message: String,
    },

    #[error("tls material for step {step}: {message}")]
    Tls { step: u32, message: String },
}

impl PlanError {
    pub fn invalid(message: impl Into<String>) -> Self {
        PlanError::Invalid(message.into())
    }

    pub fn step(step: u32, message: impl Into<String>) -> Self {
        PlanError::Step {
            step,
            message: message.into(),
        }
    }
}
