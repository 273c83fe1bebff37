//! Asynchronous request/response broker between simulated contexts and the privileged side.
//!
//! Every context talks to the privileged executor over its own frame channel. The requesting
//! side owns a [`PendingTable`]; each call is settled exactly once, by its response, by its
//! timeout or by shutdown.

pub mod endpoint;
pub mod frame;
pub mod metrics;
pub mod pending;

pub use endpoint::{FrameHandler, RpcEndpoint};
pub use frame::{
    channel_pair, ChannelEnd, DeliverFrame, DeliverTag, Frame, RemoteError, RpcRequest,
    RpcResponse,
};
pub use pending::{PendingTable, Settlement};

use std::time::Duration;

use preview_core_types::ErrorCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq)]
pub enum RpcError {
    #[error("{label} timed out after {elapsed_ms}ms")]
    Timeout { label: String, elapsed_ms: u64 },
    #[error("{0}")]
    Remote(RemoteError),
    #[error("channel disconnected")]
    Disconnected,
}

impl RpcError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RpcError::Timeout { .. } => ErrorCode::RpcTimeout,
            RpcError::Remote(remote) => remote.code_or_internal(),
            RpcError::Disconnected => ErrorCode::Disconnected,
        }
    }

    pub fn into_remote(self) -> RemoteError {
        match self {
            RpcError::Remote(remote) => remote,
            other => RemoteError::new(other.code(), other.to_string()),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    #[serde(default = "default_delivery_timeout_ms")]
    pub delivery_timeout_ms: u64,
}

fn default_call_timeout_ms() -> u64 {
    10_000
}

fn default_delivery_timeout_ms() -> u64 {
    10_000
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: default_call_timeout_ms(),
            delivery_timeout_ms: default_delivery_timeout_ms(),
        }
    }
}

impl BrokerConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }
}
