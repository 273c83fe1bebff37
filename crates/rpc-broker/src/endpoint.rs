use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use preview_core_types::{CorrelationId, ErrorCode};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::frame::{ChannelEnd, DeliverFrame, Frame, RemoteError, RpcRequest, RpcResponse};
use crate::pending::PendingTable;
use crate::{metrics, BrokerConfig, RpcError};

/// Serves the frames a peer initiates on this endpoint's channel.
#[async_trait]
pub trait FrameHandler: Send + Sync {
    async fn handle_request(&self, request: RpcRequest) -> Result<Value, RemoteError> {
        Err(RemoteError::new(
            ErrorCode::CapabilityUnavailable,
            format!("{} is not served here", request.label()),
        ))
    }

    async fn handle_delivery(&self, _payload: Value) -> Result<Value, RemoteError> {
        Err(RemoteError::new(
            ErrorCode::CapabilityUnavailable,
            "Could not establish connection. Receiving end does not exist.",
        ))
    }
}

struct EndpointInner {
    label: String,
    tx: mpsc::UnboundedSender<Frame>,
    pending: PendingTable,
    config: BrokerConfig,
    shutdown: CancellationToken,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for EndpointInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// One side of a context channel: originates calls and deliveries, serves the peer's.
#[derive(Clone)]
pub struct RpcEndpoint {
    inner: Arc<EndpointInner>,
}

impl RpcEndpoint {
    /// Starts the inbound pump for `end`. Must be called inside a tokio runtime.
    pub fn spawn(
        label: impl Into<String>,
        end: ChannelEnd,
        handler: Arc<dyn FrameHandler>,
        config: BrokerConfig,
    ) -> Self {
        let label = label.into();
        let ChannelEnd { tx, rx } = end;
        let pending = PendingTable::new();
        let shutdown = CancellationToken::new();

        let pump = tokio::spawn(pump(
            label.clone(),
            rx,
            tx.clone(),
            pending.clone(),
            handler,
            shutdown.clone(),
        ));

        Self {
            inner: Arc::new(EndpointInner {
                label,
                tx,
                pending,
                config,
                shutdown,
                pump: Mutex::new(Some(pump)),
            }),
        }
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled() || self.inner.tx.is_closed()
    }

    /// Sends `{id, capability, method, args}` and waits for its settlement.
    pub async fn call(
        &self,
        capability: &str,
        method: &str,
        args: Value,
    ) -> Result<Value, RpcError> {
        self.call_with_timeout(capability, method, args, self.inner.config.call_timeout())
            .await
    }

    pub async fn call_with_timeout(
        &self,
        capability: &str,
        method: &str,
        args: Value,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        let request = RpcRequest::new(capability, method, args);
        metrics::record_call(capability);
        debug!(
            target: "rpc-broker",
            endpoint = %self.inner.label,
            id = %request.id,
            call = %request.label(),
            "sending request"
        );
        let id = request.id;
        let label = request.label();
        self.send_and_wait(id, label, Frame::Request(request), timeout)
            .await
    }

    /// Pushes an unsolicited payload into the peer context and waits for its reply.
    pub async fn deliver(&self, payload: Value) -> Result<Value, RpcError> {
        self.deliver_with_timeout(payload, self.inner.config.delivery_timeout())
            .await
    }

    pub async fn deliver_with_timeout(
        &self,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        let frame = DeliverFrame::new(payload);
        metrics::record_delivery();
        let id = frame.reply_channel_id;
        self.send_and_wait(id, "deliver".to_string(), Frame::Deliver(frame), timeout)
            .await
    }

    async fn send_and_wait(
        &self,
        id: CorrelationId,
        label: String,
        frame: Frame,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(RpcError::Disconnected);
        }
        let settled = self.inner.pending.register(id, label, timeout);
        if self.inner.tx.send(frame).is_err() {
            self.inner.pending.settle(id, Err(RpcError::Disconnected));
        }
        match settled.await {
            Ok(result) => result,
            Err(_) => Err(RpcError::Disconnected),
        }
    }

    /// Stops the pump, abandons in-flight handlers and rejects pending calls with
    /// `Disconnected`. Returns the number of rejected calls.
    pub fn shutdown(&self) -> usize {
        self.inner.shutdown.cancel();
        if let Some(pump) = self.inner.pump.lock().take() {
            pump.abort();
        }
        let drained = self.inner.pending.drain(RpcError::Disconnected);
        if drained > 0 {
            debug!(
                target: "rpc-broker",
                endpoint = %self.inner.label,
                drained,
                "rejected pending calls on shutdown"
            );
        }
        drained
    }
}

async fn pump(
    label: String,
    mut rx: mpsc::UnboundedReceiver<Frame>,
    tx: mpsc::UnboundedSender<Frame>,
    pending: PendingTable,
    handler: Arc<dyn FrameHandler>,
    shutdown: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = rx.recv() => frame,
        };
        let Some(frame) = frame else {
            debug!(target: "rpc-broker", endpoint = %label, "peer channel closed");
            break;
        };
        match frame {
            Frame::Response(response) => {
                let id = response.id;
                pending.settle(id, response.into_result().map_err(RpcError::Remote));
            }
            Frame::Request(request) => {
                let handler = handler.clone();
                let id = request.id;
                let call = request.label();
                spawn_serving(
                    label.clone(),
                    id,
                    call,
                    tx.clone(),
                    shutdown.clone(),
                    async move { handler.handle_request(request).await },
                );
            }
            Frame::Deliver(deliver) => {
                let handler = handler.clone();
                let id = deliver.reply_channel_id;
                spawn_serving(
                    label.clone(),
                    id,
                    "deliver".to_string(),
                    tx.clone(),
                    shutdown.clone(),
                    async move { handler.handle_delivery(deliver.payload).await },
                );
            }
        }
    }
    pending.drain(RpcError::Disconnected);
}

/// Runs one inbound handler in its own task behind a panic boundary.
fn spawn_serving<F>(
    endpoint: String,
    id: CorrelationId,
    call: String,
    tx: mpsc::UnboundedSender<Frame>,
    shutdown: CancellationToken,
    work: F,
) where
    F: std::future::Future<Output = Result<Value, RemoteError>> + Send + 'static,
{
    tokio::spawn(async move {
        let outcome = tokio::select! {
            _ = shutdown.cancelled() => return,
            outcome = AssertUnwindSafe(work).catch_unwind() => outcome,
        };
        let result = match outcome {
            Ok(result) => result,
            Err(_) => {
                metrics::record_handler_panic();
                warn!(target: "rpc-broker", %endpoint, %call, "handler panicked");
                Err(RemoteError::new(
                    ErrorCode::Internal,
                    format!("{call} failed unexpectedly"),
                ))
            }
        };
        if tx.send(Frame::Response(RpcResponse::from_result(id, result))).is_err() {
            debug!(target: "rpc-broker", %endpoint, %call, "peer gone before response");
        }
    });
}
