//! Requesting-side table of in-flight calls.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use preview_core_types::CorrelationId;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::{metrics, RpcError};

pub type Settlement = Result<Value, RpcError>;

struct PendingRequest {
    created_at: Instant,
    label: String,
    settle: oneshot::Sender<Settlement>,
    timeout: Option<JoinHandle<()>>,
}

/// Every entry leaves the table through `remove`, so a response and a timeout for the same id
/// can never both settle it.
#[derive(Clone, Default)]
pub struct PendingTable {
    inner: Arc<DashMap<CorrelationId, PendingRequest>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the request and arms its timeout.
    pub fn register(
        &self,
        id: CorrelationId,
        label: impl Into<String>,
        timeout: Duration,
    ) -> oneshot::Receiver<Settlement> {
        let (tx, rx) = oneshot::channel();
        self.inner.insert(
            id,
            PendingRequest {
                created_at: Instant::now(),
                label: label.into(),
                settle: tx,
                timeout: None,
            },
        );

        let table = self.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            table.expire(id);
        });
        match self.inner.get_mut(&id) {
            Some(mut entry) => entry.timeout = Some(timer),
            None => timer.abort(),
        }
        rx
    }

    /// Settles `id` with `result`. Returns `false` when the id is unknown (late or duplicate).
    pub fn settle(&self, id: CorrelationId, result: Settlement) -> bool {
        match self.inner.remove(&id) {
            Some((_, entry)) => {
                if let Some(timer) = entry.timeout {
                    timer.abort();
                }
                let _ = entry.settle.send(result);
                metrics::record_settled();
                true
            }
            None => {
                debug!(target: "rpc-broker", %id, "dropping response for settled request");
                metrics::record_late_response();
                false
            }
        }
    }

    fn expire(&self, id: CorrelationId) {
        if let Some((_, entry)) = self.inner.remove(&id) {
            let elapsed_ms = entry.created_at.elapsed().as_millis() as u64;
            debug!(
                target: "rpc-broker",
                %id,
                label = %entry.label,
                elapsed_ms,
                "request timed out"
            );
            metrics::record_timeout(&entry.label);
            let _ = entry.settle.send(Err(RpcError::Timeout {
                label: entry.label,
                elapsed_ms,
            }));
        }
    }

    /// Settles every outstanding entry with `error`. Returns how many were drained.
    pub fn drain(&self, error: RpcError) -> usize {
        let ids: Vec<CorrelationId> = self.inner.iter().map(|entry| *entry.key()).collect();
        let mut drained = 0;
        for id in ids {
            if let Some((_, entry)) = self.inner.remove(&id) {
                if let Some(timer) = entry.timeout {
                    timer.abort();
                }
                let _ = entry.settle.send(Err(error.clone()));
                drained += 1;
            }
        }
        drained
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn contains(&self, id: &CorrelationId) -> bool {
        self.inner.contains_key(id)
    }
}
