//! The privileged host seam.
//!
//! A `HostPlatform` is the only thing in the workspace that can touch real pages. The
//! privileged executor and the content injector hold it; simulated contexts never do.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{ExecutionWorld, HostError, InjectionStrategy, PageTarget};

/// One code-evaluation request against a page.
///
/// `code` is already wrapped for `strategy`; hosts evaluate it as-is in `world` and return the
/// completion value. `strategy` is informational for hosts that want to log or fake it.
#[derive(Clone, Copy, Debug)]
pub struct InjectionRequest<'a> {
    pub target: &'a PageTarget,
    pub world: ExecutionWorld,
    pub strategy: InjectionStrategy,
    pub code: &'a str,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageMessageKind {
    RuntimeMessage,
    StorageGet,
    StorageSet,
}

/// Message originated by injected page-side code.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PageMessage {
    pub target: PageTarget,
    pub world: ExecutionWorld,
    pub reply_id: String,
    pub kind: PageMessageKind,
    pub payload: Value,
}

#[async_trait]
pub trait HostPlatform: Send + Sync {
    /// The page the user is looking at, if any.
    async fn find_active_target(&self) -> Result<Option<PageTarget>, HostError>;

    async fn inject_code(&self, request: InjectionRequest<'_>) -> Result<Value, HostError>;

    /// Hand `payload` to the page-side message shim installed by an earlier injection.
    async fn relay_to_page(
        &self,
        target: &PageTarget,
        world: ExecutionWorld,
        payload: Value,
    ) -> Result<Value, HostError>;

    async fn read_storage(
        &self,
        _keys: Option<Vec<String>>,
    ) -> Result<Map<String, Value>, HostError> {
        Err(HostError::unavailable("host storage is not available"))
    }

    async fn write_storage(&self, _entries: Map<String, Value>) -> Result<(), HostError> {
        Err(HostError::unavailable("host storage is not available"))
    }

    /// Next message sent by page-side code, `None` once the host has no page channel.
    async fn next_page_message(&self) -> Option<PageMessage> {
        None
    }

    async fn reply_to_page(
        &self,
        _message: &PageMessage,
        _reply: Result<Value, String>,
    ) -> Result<(), HostError> {
        Ok(())
    }
}
