use std::collections::BTreeMap;
use std::sync::Arc;

use bundle_store::MountedBundle;
use parking_lot::{Mutex, RwLock};
use preview_core_types::{ContextKind, ErrorCode, PreviewEvent};
use rpc_broker::RpcEndpoint;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::alarms::{Alarm, AlarmScheduler};
use crate::dispatch::{Dispatch, DispatchTable};
use crate::listeners::{
    EventKind, ListenerCall, ListenerId, ListenerRegistry, ListenerReply, MessageSender,
    SendResponse,
};
use crate::session::PreviewSession;
use crate::storage::{ChangeSet, ChangeSink, StorageArea};
use crate::ShimError;

/// The `lastError` slot of a context.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LastError {
    pub message: String,
    pub code: ErrorCode,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct BadgeState {
    pub text: String,
    pub color: Option<Value>,
}

struct ShimInner {
    context: ContextKind,
    session: PreviewSession,
    bundle: MountedBundle,
    table: Arc<DispatchTable>,
    broker: Option<RpcEndpoint>,
    listeners: Arc<ListenerRegistry>,
    alarms: AlarmScheduler,
    last_error: RwLock<Option<LastError>>,
    alive: CancellationToken,
    badge: Mutex<BadgeState>,
    notifications: Mutex<BTreeMap<String, Value>>,
}

/// Capability namespaces as seen from inside one simulated context.
#[derive(Clone)]
pub struct CapabilityShim {
    inner: Arc<ShimInner>,
}

impl CapabilityShim {
    pub fn new(
        context: ContextKind,
        session: PreviewSession,
        bundle: MountedBundle,
        listeners: Arc<ListenerRegistry>,
        broker: Option<RpcEndpoint>,
    ) -> Self {
        Self::with_table(
            context,
            session,
            bundle,
            listeners,
            broker,
            Arc::new(DispatchTable::with_builtins()),
        )
    }

    pub fn with_table(
        context: ContextKind,
        session: PreviewSession,
        bundle: MountedBundle,
        listeners: Arc<ListenerRegistry>,
        broker: Option<RpcEndpoint>,
        table: Arc<DispatchTable>,
    ) -> Self {
        let sink: Arc<dyn ChangeSink> = listeners.clone();
        session.storage().subscribe(&sink);
        let alive = session.child_token();
        let alarms = AlarmScheduler::new(&listeners, alive.clone());
        Self {
            inner: Arc::new(ShimInner {
                context,
                session,
                bundle,
                table,
                broker,
                listeners,
                alarms,
                last_error: RwLock::new(None),
                alive,
                badge: Mutex::new(BadgeState::default()),
                notifications: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    pub fn context(&self) -> ContextKind {
        self.inner.context
    }

    pub fn session(&self) -> &PreviewSession {
        &self.inner.session
    }

    pub fn bundle(&self) -> &MountedBundle {
        &self.inner.bundle
    }

    pub fn table(&self) -> &DispatchTable {
        &self.inner.table
    }

    pub fn broker(&self) -> Option<&RpcEndpoint> {
        self.inner.broker.as_ref()
    }

    pub fn listeners(&self) -> &Arc<ListenerRegistry> {
        &self.inner.listeners
    }

    pub fn alarms(&self) -> &AlarmScheduler {
        &self.inner.alarms
    }

    pub fn extension_id(&self) -> &str {
        self.inner.session.extension_id()
    }

    pub fn is_alive(&self) -> bool {
        !self.inner.alive.is_cancelled()
    }

    pub fn last_error(&self) -> Option<LastError> {
        self.inner.last_error.read().clone()
    }

    pub(crate) fn badge(&self) -> &Mutex<BadgeState> {
        &self.inner.badge
    }

    pub(crate) fn notifications(&self) -> &Mutex<BTreeMap<String, Value>> {
        &self.inner.notifications
    }

    pub(crate) fn publish(&self, event: PreviewEvent) {
        self.inner.session.publish(event);
    }

    /// Invokes `capability.method` with positional `args` (a JSON array; any other value is
    /// treated as the single argument, `null` as none).
    pub async fn call(
        &self,
        capability: &str,
        method: &str,
        args: Value,
    ) -> Result<Value, ShimError> {
        let outcome = self.dispatch(capability, method, args).await;
        self.record_outcome(capability, method, &outcome);
        outcome
    }

    /// Callback form of [`call`](Self::call). The callback receives `null` on failure and can
    /// read [`last_error`](Self::last_error) while it runs. It is never invoked once the
    /// context has been torn down.
    pub async fn call_with_callback<F>(
        &self,
        capability: &str,
        method: &str,
        args: Value,
        callback: F,
    ) where
        F: FnOnce(Value) + Send,
    {
        let outcome = self.call(capability, method, args).await;
        if !self.is_alive() {
            debug!(
                target: "capability-shim",
                context = %self.inner.context,
                capability,
                method,
                "dropping callback after teardown"
            );
            return;
        }
        callback(outcome.unwrap_or(Value::Null));
    }

    async fn dispatch(
        &self,
        capability: &str,
        method: &str,
        args: Value,
    ) -> Result<Value, ShimError> {
        if !self.is_alive() {
            return Err(ShimError::TornDown);
        }
        match self.inner.table.lookup(capability, method).cloned() {
            Some(Dispatch::Local(handler)) => handler(self.clone(), args).await,
            Some(Dispatch::Forwarded) => match &self.inner.broker {
                Some(broker) => broker
                    .call(capability, method, args)
                    .await
                    .map_err(ShimError::from),
                None => Err(ShimError::unsupported(capability, method)),
            },
            None => Err(ShimError::unsupported(capability, method)),
        }
    }

    fn record_outcome(&self, capability: &str, method: &str, outcome: &Result<Value, ShimError>) {
        match outcome {
            Ok(_) => {
                *self.inner.last_error.write() = None;
            }
            Err(err) => {
                let code = err.code();
                let message = err.to_string();
                warn!(
                    target: "capability-shim",
                    context = %self.inner.context,
                    capability,
                    method,
                    ?code,
                    %message,
                    "capability call failed"
                );
                *self.inner.last_error.write() = Some(LastError {
                    message: message.clone(),
                    code,
                });
                self.publish(PreviewEvent::CapabilityFailed {
                    context: self.inner.context,
                    capability: capability.to_string(),
                    method: method.to_string(),
                    code,
                    message,
                });
            }
        }
    }

    /// `runtime.onMessage.addListener`.
    pub fn on_message<F>(&self, listener: F) -> Option<ListenerId>
    where
        F: Fn(Value, MessageSender, SendResponse) -> ListenerReply + Send + Sync + 'static,
    {
        let context = self.inner.context;
        self.inner.listeners.add(
            EventKind::Message,
            Arc::new(move |call: ListenerCall| {
                let sender = call
                    .sender
                    .unwrap_or_else(|| MessageSender::context(context));
                listener(call.payload, sender, call.respond)
            }),
        )
    }

    /// `runtime.onInstalled.addListener`.
    pub fn on_installed<F>(&self, listener: F) -> Option<ListenerId>
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.inner.listeners.add(
            EventKind::Installed,
            Arc::new(move |call: ListenerCall| {
                listener(call.payload);
                ListenerReply::Undefined
            }),
        )
    }

    /// `storage.onChanged.addListener`.
    pub fn on_storage_changed<F>(&self, listener: F) -> Option<ListenerId>
    where
        F: Fn(ChangeSet, StorageArea) + Send + Sync + 'static,
    {
        self.inner.listeners.add(
            EventKind::StorageChanged,
            Arc::new(move |call: ListenerCall| {
                let changes = serde_json::from_value::<ChangeSet>(call.payload["changes"].clone())
                    .unwrap_or_default();
                let area = call.payload["areaName"]
                    .as_str()
                    .and_then(StorageArea::parse)
                    .unwrap_or(StorageArea::Local);
                listener(changes, area);
                ListenerReply::Undefined
            }),
        )
    }

    /// `alarms.onAlarm.addListener`.
    pub fn on_alarm<F>(&self, listener: F) -> Option<ListenerId>
    where
        F: Fn(Alarm) + Send + Sync + 'static,
    {
        self.inner.listeners.add(
            EventKind::Alarm,
            Arc::new(move |call: ListenerCall| {
                if let Ok(alarm) = serde_json::from_value::<Alarm>(call.payload) {
                    listener(alarm);
                }
                ListenerReply::Undefined
            }),
        )
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(id)
    }

    pub fn has_listeners(&self, kind: EventKind) -> bool {
        self.inner.listeners.has(kind)
    }

    /// Cancels timers, drops listeners and stops future callbacks. Returns the number of
    /// listeners dropped.
    pub fn teardown(&self) -> usize {
        self.inner.alive.cancel();
        self.inner.alarms.clear_all();
        *self.inner.last_error.write() = None;
        let dropped = self.inner.listeners.close();
        debug!(
            target: "capability-shim",
            context = %self.inner.context,
            dropped,
            "capability shim torn down"
        );
        dropped
    }
}
