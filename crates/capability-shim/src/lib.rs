//! Capability shim installed into every simulated extension context.
//!
//! A context sees extension namespaces (`storage`, `runtime`, `tabs`, ...) through a
//! [`CapabilityShim`]. Each `{capability, method}` pair is tagged in a [`DispatchTable`]: local
//! calls are served in-process against the [`PreviewSession`], forwarded calls become exactly
//! one broker request to the privileged executor.

pub mod alarms;
pub mod builtins;
pub mod context;
pub mod dispatch;
pub mod engine;
pub mod listeners;
pub mod session;
pub mod shim;
pub mod storage;

pub use alarms::{Alarm, AlarmCreateInfo, AlarmScheduler};
pub use context::{ContextInbox, ContextRuntime};
pub use dispatch::{CapabilityKey, Dispatch, DispatchTable, LocalHandler};
pub use engine::{NativeScriptEngine, ScriptEngine, ScriptError, ScriptScope};
pub use listeners::{
    DeliveryEnvelope, EventKind, ListenerCall, ListenerCallback, ListenerId, ListenerRegistry,
    ListenerReply, MessageSender, SendResponse, SimulatedListener,
};
pub use session::PreviewSession;
pub use shim::{CapabilityShim, LastError};
pub use storage::{ChangeSet, ChangeSink, SessionStorage, StorageArea, StorageChange, StorageQuery};

use preview_core_types::ErrorCode;
use rpc_broker::{RemoteError, RpcError};
use thiserror::Error;

#[derive(Clone, Debug, Error)]
pub enum ShimError {
    #[error("{capability}.{method} is not available in the preview")]
    Unsupported { capability: String, method: String },
    #[error("invalid arguments for {call}: {reason}")]
    InvalidArgs { call: String, reason: String },
    #[error("{0}")]
    Rpc(#[from] RpcError),
    #[error("Could not establish connection. Receiving end does not exist.")]
    NoReceiver,
    #[error("Extension context invalidated.")]
    TornDown,
    #[error("{message}")]
    Failed { code: ErrorCode, message: String },
}

impl ShimError {
    pub fn unsupported(capability: &str, method: &str) -> Self {
        ShimError::Unsupported {
            capability: capability.to_string(),
            method: method.to_string(),
        }
    }

    pub fn invalid_args(call: &str, reason: impl Into<String>) -> Self {
        ShimError::InvalidArgs {
            call: call.to_string(),
            reason: reason.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            ShimError::Unsupported { .. } | ShimError::NoReceiver => {
                ErrorCode::CapabilityUnavailable
            }
            ShimError::InvalidArgs { .. } => ErrorCode::Internal,
            ShimError::Rpc(err) => err.code(),
            ShimError::TornDown => ErrorCode::Disconnected,
            ShimError::Failed { code, .. } => *code,
        }
    }

    pub fn into_remote(self) -> RemoteError {
        match self {
            ShimError::Rpc(err) => err.into_remote(),
            other => RemoteError::new(other.code(), other.to_string()),
        }
    }
}
