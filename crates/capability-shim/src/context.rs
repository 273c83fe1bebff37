//! A simulated context: capability shim, listener registry and broker endpoint wired together.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bundle_store::{BundleFile, MountedBundle, PopupDocument};
use futures::FutureExt;
use preview_core_types::{ContextKind, ErrorCode, PreviewEvent};
use rpc_broker::{BrokerConfig, ChannelEnd, FrameHandler, RemoteError, RpcEndpoint};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::engine::{ScriptEngine, ScriptError, ScriptScope};
use crate::listeners::{DeliveryEnvelope, ListenerRegistry, MessageSender};
use crate::session::PreviewSession;
use crate::shim::CapabilityShim;
use crate::ShimError;

/// Serves deliveries pushed into a context by the privileged side.
pub struct ContextInbox {
    listeners: Arc<ListenerRegistry>,
    gate: Option<watch::Receiver<bool>>,
}

impl ContextInbox {
    /// With a gate, deliveries wait until it reads `true`.
    pub fn new(listeners: Arc<ListenerRegistry>, gate: Option<watch::Receiver<bool>>) -> Self {
        Self { listeners, gate }
    }
}

#[async_trait]
impl FrameHandler for ContextInbox {
    async fn handle_delivery(&self, payload: Value) -> Result<Value, RemoteError> {
        if let Some(gate) = &self.gate {
            let mut gate = gate.clone();
            if gate.wait_for(|open| *open).await.is_err() {
                return Err(RemoteError::new(
                    ErrorCode::Disconnected,
                    "context stopped before it was ready",
                ));
            }
        }
        let envelope = match serde_json::from_value::<DeliveryEnvelope>(payload.clone()) {
            Ok(envelope) => envelope,
            Err(_) => DeliveryEnvelope {
                message: payload,
                sender: MessageSender::context(ContextKind::Page),
            },
        };
        self.listeners
            .dispatch_message(envelope.message, envelope.sender)
            .await
            .map_err(ShimError::into_remote)
    }
}

pub struct ContextRuntime {
    kind: ContextKind,
    shim: CapabilityShim,
    endpoint: RpcEndpoint,
    stopped: AtomicBool,
}

impl ContextRuntime {
    /// Builds the context on its side of a channel. Must be called inside a tokio runtime.
    pub fn start(
        kind: ContextKind,
        end: ChannelEnd,
        session: &PreviewSession,
        bundle: MountedBundle,
        config: BrokerConfig,
        gate: Option<watch::Receiver<bool>>,
    ) -> Self {
        let listeners = ListenerRegistry::new(kind);
        let inbox = Arc::new(ContextInbox::new(listeners.clone(), gate));
        let endpoint = RpcEndpoint::spawn(kind.as_str(), end, inbox, config);
        let shim = CapabilityShim::new(
            kind,
            session.clone(),
            bundle,
            listeners,
            Some(endpoint.clone()),
        );
        info!(target: "capability-shim", context = %kind, generation = %session.generation(), "context started");
        session.publish(PreviewEvent::ContextStarted {
            generation: session.generation(),
            context: kind,
        });
        Self {
            kind,
            shim,
            endpoint,
            stopped: AtomicBool::new(false),
        }
    }

    pub fn kind(&self) -> ContextKind {
        self.kind
    }

    pub fn shim(&self) -> &CapabilityShim {
        &self.shim
    }

    pub fn endpoint(&self) -> &RpcEndpoint {
        &self.endpoint
    }

    pub fn scope(&self, document: Option<Arc<PopupDocument>>) -> ScriptScope {
        ScriptScope {
            context: self.kind,
            shim: self.shim.clone(),
            document,
        }
    }

    /// Runs one bundle file. A failing or panicking script is reported as a context error and
    /// does not stop the context.
    pub async fn run_script(
        &self,
        engine: &dyn ScriptEngine,
        file: &BundleFile,
        document: Option<Arc<PopupDocument>>,
    ) -> Result<(), ScriptError> {
        let scope = self.scope(document);
        let outcome = AssertUnwindSafe(engine.execute(scope, file))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(ScriptError::failed(&file.path, "script panicked")));
        match &outcome {
            Ok(()) => {
                debug!(target: "capability-shim", context = %self.kind, path = %file.path, "script finished");
            }
            Err(err) => {
                warn!(target: "capability-shim", context = %self.kind, path = %file.path, %err, "script failed");
                let session = self.shim.session();
                session.publish(PreviewEvent::ContextError {
                    generation: session.generation(),
                    context: self.kind,
                    message: err.to_string(),
                });
            }
        }
        outcome
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Stops the context: listeners, timers, pending calls and the channel. Idempotent.
    pub fn teardown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let listeners = self.shim.teardown();
        let pending = self.endpoint.shutdown();
        let session = self.shim.session();
        info!(
            target: "capability-shim",
            context = %self.kind,
            listeners,
            pending,
            "context stopped"
        );
        session.publish(PreviewEvent::ContextStopped {
            generation: session.generation(),
            context: self.kind,
        });
    }
}

impl Drop for ContextRuntime {
    fn drop(&mut self) {
        self.teardown();
    }
}
