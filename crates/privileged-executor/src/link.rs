use std::sync::Weak;

use async_trait::async_trait;
use preview_core_types::{ContextKind, ErrorCode};
use rpc_broker::{FrameHandler, RemoteError, RpcRequest};
use serde_json::Value;
use tracing::debug;

use crate::executor::{ExecInner, PrivilegedExecutor};

/// Privileged end of one context's channel. Holds the executor weakly so a dropped
/// executor ends the link instead of being kept alive by it.
pub struct ContextLink {
    origin: ContextKind,
    executor: Weak<ExecInner>,
}

impl ContextLink {
    pub(crate) fn new(origin: ContextKind, executor: Weak<ExecInner>) -> Self {
        Self { origin, executor }
    }

    pub fn origin(&self) -> ContextKind {
        self.origin
    }
}

#[async_trait]
impl FrameHandler for ContextLink {
    async fn handle_request(&self, request: RpcRequest) -> Result<Value, RemoteError> {
        let Some(inner) = self.executor.upgrade() else {
            return Err(RemoteError::new(
                ErrorCode::Disconnected,
                "preview executor stopped",
            ));
        };
        let executor = PrivilegedExecutor::from_inner(inner);
        let call = request.label();
        debug!(target: "privileged-executor", context = %self.origin, %call, "serving forwarded call");
        executor
            .handle_call(self.origin, request)
            .await
            .map_err(|err| err.into_remote())
    }
}
