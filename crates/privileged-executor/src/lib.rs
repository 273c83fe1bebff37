//! The privileged executor.
//!
//! Simulated contexts cannot touch pages, tabs or real storage. They forward those calls over
//! the broker and this crate serves them on the privileged side, against a
//! [`HostPlatform`](preview_core_types::HostPlatform). Host failures come back to the caller
//! as typed errors, never as a dead channel.

pub mod cdp_host;
pub mod executor;
pub mod gate;
pub mod link;
pub mod tabs;

pub use cdp_host::CdpPageHost;
pub use executor::PrivilegedExecutor;
pub use gate::{InjectionGates, InjectionState};
pub use link::ContextLink;
pub use tabs::TabDirectory;

use bundle_store::BundleError;
use content_injection::{InjectionBlocked, InjectionPolicy};
use preview_core_types::{ErrorCode, HostError};
use rpc_broker::{BrokerConfig, RemoteError, RpcError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug, Error)]
pub enum ExecError {
    #[error("No active tab to operate on.")]
    NoActiveTarget,
    #[error("No tab with id: {0}.")]
    NoSuchTab(u64),
    #[error("Could not establish connection. Receiving end does not exist.")]
    NoReceiver,
    #[error("{0}")]
    Host(HostError),
    #[error("{}", .0.user_message())]
    InjectionBlocked(Box<InjectionBlocked>),
    #[error("invalid arguments for {call}: {reason}")]
    InvalidArgs { call: String, reason: String },
    #[error("{0} is not available in the preview")]
    Unsupported(String),
    #[error(transparent)]
    Bundle(#[from] BundleError),
    #[error("{0}")]
    Rpc(#[from] RpcError),
    #[error("preview executor stopped")]
    Stopped,
}

impl From<HostError> for ExecError {
    fn from(err: HostError) -> Self {
        ExecError::Host(err)
    }
}

impl ExecError {
    pub fn invalid_args(call: &str, reason: impl Into<String>) -> Self {
        ExecError::InvalidArgs {
            call: call.to_string(),
            reason: reason.into(),
        }
    }

    pub fn unsupported(capability: &str, method: &str) -> Self {
        ExecError::Unsupported(format!("{capability}.{method}"))
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            ExecError::NoActiveTarget
            | ExecError::NoSuchTab(_)
            | ExecError::NoReceiver
            | ExecError::Unsupported(_) => ErrorCode::CapabilityUnavailable,
            ExecError::Host(err) => err.code,
            ExecError::InjectionBlocked(_) => ErrorCode::InjectionBlocked,
            ExecError::InvalidArgs { .. } => ErrorCode::Internal,
            ExecError::Bundle(_) => ErrorCode::InvalidBundle,
            ExecError::Rpc(err) => err.code(),
            ExecError::Stopped => ErrorCode::Disconnected,
        }
    }

    pub fn into_remote(self) -> RemoteError {
        match self {
            ExecError::Rpc(err) => err.into_remote(),
            other => RemoteError::new(other.code(), other.to_string()),
        }
    }
}

/// Where `storage.*` calls served by the executor land.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// The in-memory session storage shared with every simulated context.
    #[default]
    Session,
    /// The host platform's persistent storage.
    Host,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub injection: InjectionPolicy,
    #[serde(default)]
    pub storage: StorageBackend,
}
