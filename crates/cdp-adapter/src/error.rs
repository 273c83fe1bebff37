use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// High-level error categories surfaced by the transport.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error, Serialize, Deserialize)]
pub enum AdapterErrorKind {
    #[error("command timed out")]
    Timeout,
    #[error("cdp i/o failure")]
    CdpIo,
    #[error("target not found")]
    TargetNotFound,
    #[error("internal error")]
    Internal,
}

/// Error metadata passed back to the host layer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AdapterError {
    pub kind: AdapterErrorKind,
    pub hint: Option<String>,
    pub retriable: bool,
}

impl fmt::Display for AdapterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(hint) = &self.hint {
            write!(f, ": {}", hint)?;
        }
        Ok(())
    }
}

impl std::error::Error for AdapterError {}

impl AdapterError {
    pub fn new(kind: AdapterErrorKind) -> Self {
        Self {
            kind,
            hint: None,
            retriable: false,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn retriable(mut self, flag: bool) -> Self {
        self.retriable = flag;
        self
    }

    pub fn io(hint: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::CdpIo).with_hint(hint)
    }

    pub fn internal(hint: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::Internal).with_hint(hint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_hint() {
        let err = AdapterError::io("socket closed").retriable(true);
        assert_eq!(err.to_string(), "cdp i/o failure: socket closed");
        assert!(err.retriable);
        assert_eq!(
            AdapterError::new(AdapterErrorKind::Timeout).to_string(),
            "command timed out"
        );
    }
}
