//! Error type of the preview runtime and its user-facing rendering.

use std::path::PathBuf;

use background_sim::BackgroundError;
use bundle_store::BundleError;
use capability_shim::ShimError;
use preview_core_types::{ErrorCode, HostError};
use privileged_executor::ExecError;
use rpc_broker::RpcError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PreviewError {
    #[error(transparent)]
    Bundle(#[from] BundleError),
    #[error(transparent)]
    Background(#[from] BackgroundError),
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error(transparent)]
    Shim(#[from] ShimError),
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error("{0}")]
    Host(HostError),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no preview is mounted")]
    NotMounted,
}

impl From<HostError> for PreviewError {
    fn from(err: HostError) -> Self {
        PreviewError::Host(err)
    }
}

impl PreviewError {
    pub fn config(message: impl Into<String>) -> Self {
        PreviewError::Config(message.into())
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PreviewError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            PreviewError::Bundle(_) => ErrorCode::InvalidBundle,
            PreviewError::Background(err) => err.code(),
            PreviewError::Exec(err) => err.code(),
            PreviewError::Shim(err) => err.code(),
            PreviewError::Rpc(err) => err.code(),
            PreviewError::Host(err) => err.code,
            PreviewError::Config(_) | PreviewError::Io { .. } => ErrorCode::Internal,
            PreviewError::NotMounted => ErrorCode::CapabilityUnavailable,
        }
    }

    /// Whether the preview can keep running after this error.
    pub fn is_recoverable(&self) -> bool {
        self.code().is_recoverable()
    }

    /// Inline explanation shown next to the preview.
    pub fn user_message(&self) -> String {
        match self {
            PreviewError::Bundle(err) => {
                format!("The generated extension could not be loaded: {err}.")
            }
            PreviewError::Exec(ExecError::InjectionBlocked(blocked)) => blocked.user_message(),
            _ => match self.code() {
                ErrorCode::RpcTimeout => format!(
                    "The preview did not answer in time ({self}). Try the action again."
                ),
                ErrorCode::InjectionBlocked => format!(
                    "This page blocked the extension's script ({self}). Try the installed extension instead."
                ),
                ErrorCode::PermissionDenied => {
                    format!("The page refused the request: {self}.")
                }
                ErrorCode::CapabilityUnavailable => self.to_string(),
                ErrorCode::Disconnected => {
                    "The preview was reloaded while this request was running.".to_string()
                }
                ErrorCode::InvalidBundle => {
                    format!("The generated extension could not be loaded: {self}.")
                }
                ErrorCode::Internal => format!("Something went wrong in the preview: {self}."),
            },
        }
    }
}
