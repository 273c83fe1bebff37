use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error taxonomy shared by every component and carried on the wire.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    #[error("invalid bundle")]
    InvalidBundle,
    #[error("rpc timeout")]
    RpcTimeout,
    #[error("injection blocked")]
    InjectionBlocked,
    #[error("capability unavailable")]
    CapabilityUnavailable,
    #[error("permission denied")]
    PermissionDenied,
    #[error("disconnected")]
    Disconnected,
    #[error("internal error")]
    Internal,
}

impl ErrorCode {
    /// Whether the surrounding preview session survives this error.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, ErrorCode::InvalidBundle)
    }
}

/// Failure reported by a [`crate::HostPlatform`] implementation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HostError {
    pub code: ErrorCode,
    pub message: String,
    pub data: Option<serde_json::Value>,
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for HostError {}

impl HostError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::CapabilityUnavailable, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::PermissionDenied, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}
