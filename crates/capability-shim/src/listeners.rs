//! Per-context listener registries and message dispatch.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use preview_core_types::ContextKind;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::storage::{ChangeSet, ChangeSink, StorageArea};
use crate::ShimError;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Message,
    Installed,
    StorageChanged,
    Alarm,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListenerId(pub u64);

/// Who sent a runtime message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageSender {
    pub context: ContextKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tab: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl MessageSender {
    pub fn context(context: ContextKind) -> Self {
        Self {
            context,
            id: None,
            tab: None,
            url: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_tab(mut self, tab: Value) -> Self {
        self.tab = Some(tab);
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }
}

/// Payload of a delivery frame carrying a runtime message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeliveryEnvelope {
    pub message: Value,
    pub sender: MessageSender,
}

/// What a listener returned.
#[derive(Clone, Debug, PartialEq)]
pub enum ListenerReply {
    Undefined,
    Value(Value),
    /// The listener keeps its [`SendResponse`] and answers later.
    WillRespond,
}

/// Response slot shared by every listener of one message. The first answer wins.
#[derive(Clone)]
pub struct SendResponse {
    slot: Arc<Mutex<Option<oneshot::Sender<Value>>>>,
}

impl SendResponse {
    fn new() -> (Self, oneshot::Receiver<Value>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                slot: Arc::new(Mutex::new(Some(tx))),
            },
            rx,
        )
    }

    /// A response slot nobody waits on.
    pub fn detached() -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
        }
    }

    /// Returns `false` if a response was already sent.
    pub fn send(&self, value: Value) -> bool {
        match self.slot.lock().take() {
            Some(tx) => tx.send(value).is_ok(),
            None => false,
        }
    }

    pub fn is_settled(&self) -> bool {
        self.slot.lock().is_none()
    }
}

/// Arguments handed to a listener callback.
#[derive(Clone)]
pub struct ListenerCall {
    pub payload: Value,
    pub sender: Option<MessageSender>,
    pub respond: SendResponse,
}

pub type ListenerCallback = Arc<dyn Fn(ListenerCall) -> ListenerReply + Send + Sync>;

#[derive(Clone)]
pub struct SimulatedListener {
    pub id: ListenerId,
    pub kind: EventKind,
    pub context: ContextKind,
    pub callback: ListenerCallback,
}

/// Listener table owned by one context.
pub struct ListenerRegistry {
    context: ContextKind,
    listeners: RwLock<Vec<SimulatedListener>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl ListenerRegistry {
    pub fn new(context: ContextKind) -> Arc<Self> {
        Arc::new(Self {
            context,
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        })
    }

    pub fn context(&self) -> ContextKind {
        self.context
    }

    /// Registers `callback`; returns `None` once the registry is closed.
    pub fn add(&self, kind: EventKind, callback: ListenerCallback) -> Option<ListenerId> {
        if self.is_closed() {
            return None;
        }
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push(SimulatedListener {
            id,
            kind,
            context: self.context,
            callback,
        });
        Some(id)
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|listener| listener.id != id);
        listeners.len() != before
    }

    pub fn has(&self, kind: EventKind) -> bool {
        self.count(kind) > 0
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.listeners
            .read()
            .iter()
            .filter(|listener| listener.kind == kind)
            .count()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Drops every listener and refuses new ones. Returns how many were dropped.
    pub fn close(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        let mut listeners = self.listeners.write();
        let dropped = listeners.len();
        listeners.clear();
        dropped
    }

    fn snapshot(&self, kind: EventKind) -> Vec<SimulatedListener> {
        if self.is_closed() {
            return Vec::new();
        }
        self.listeners
            .read()
            .iter()
            .filter(|listener| listener.kind == kind)
            .cloned()
            .collect()
    }

    fn invoke(&self, listener: &SimulatedListener, call: ListenerCall) -> ListenerReply {
        match catch_unwind(AssertUnwindSafe(|| (listener.callback)(call))) {
            Ok(reply) => reply,
            Err(_) => {
                warn!(
                    target: "capability-shim",
                    context = %self.context,
                    listener = listener.id.0,
                    kind = ?listener.kind,
                    "listener panicked"
                );
                ListenerReply::Undefined
            }
        }
    }

    /// Calls every listener of `kind` in registration order, ignoring replies.
    /// Returns the number of listeners called.
    pub fn emit(&self, kind: EventKind, payload: Value) -> usize {
        let listeners = self.snapshot(kind);
        for listener in &listeners {
            self.invoke(
                listener,
                ListenerCall {
                    payload: payload.clone(),
                    sender: None,
                    respond: SendResponse::detached(),
                },
            );
        }
        listeners.len()
    }

    /// Delivers a runtime message with extension messaging semantics.
    ///
    /// Every message listener runs in order. The first value returned or sent through the
    /// shared [`SendResponse`] is the reply; if a listener returned
    /// [`ListenerReply::WillRespond`] the reply is awaited. With no listeners the call fails
    /// with [`ShimError::NoReceiver`].
    pub async fn dispatch_message(
        &self,
        message: Value,
        sender: MessageSender,
    ) -> Result<Value, ShimError> {
        let listeners = self.snapshot(EventKind::Message);
        if listeners.is_empty() {
            return Err(ShimError::NoReceiver);
        }
        let (respond, reply) = SendResponse::new();
        let mut waiting = false;
        for listener in &listeners {
            let outcome = self.invoke(
                listener,
                ListenerCall {
                    payload: message.clone(),
                    sender: Some(sender.clone()),
                    respond: respond.clone(),
                },
            );
            match outcome {
                ListenerReply::Undefined => {}
                ListenerReply::Value(value) => {
                    respond.send(value);
                }
                ListenerReply::WillRespond => waiting = true,
            }
        }
        if !waiting && !respond.is_settled() {
            return Ok(Value::Null);
        }
        drop(respond);
        match reply.await {
            Ok(value) => Ok(value),
            Err(_) => {
                debug!(
                    target: "capability-shim",
                    context = %self.context,
                    "message port closed before a response was received"
                );
                Ok(Value::Null)
            }
        }
    }
}

impl ChangeSink for ListenerRegistry {
    fn storage_changed(&self, area: StorageArea, changes: &ChangeSet) {
        self.emit(
            EventKind::StorageChanged,
            json!({"changes": changes.to_value(), "areaName": area.as_str()}),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn callback<F>(f: F) -> ListenerCallback
    where
        F: Fn(ListenerCall) -> ListenerReply + Send + Sync + 'static,
    {
        Arc::new(f)
    }

    #[tokio::test]
    async fn first_value_wins_in_registration_order() {
        let registry = ListenerRegistry::new(ContextKind::Background);
        registry.add(EventKind::Message, callback(|_| ListenerReply::Undefined));
        registry.add(
            EventKind::Message,
            callback(|call| ListenerReply::Value(json!({"echo": call.payload}))),
        );
        registry.add(EventKind::Message, callback(|_| ListenerReply::Value(json!("late"))));

        let reply = registry
            .dispatch_message(json!(1), MessageSender::context(ContextKind::Popup))
            .await
            .unwrap();
        assert_eq!(reply, json!({"echo": 1}));
    }

    #[tokio::test]
    async fn will_respond_waits_for_async_answer() {
        let registry = ListenerRegistry::new(ContextKind::Background);
        registry.add(
            EventKind::Message,
            callback(|call| {
                let respond = call.respond.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    respond.send(json!("later"));
                });
                ListenerReply::WillRespond
            }),
        );
        let reply = registry
            .dispatch_message(Value::Null, MessageSender::context(ContextKind::Popup))
            .await
            .unwrap();
        assert_eq!(reply, json!("later"));
    }

    #[tokio::test]
    async fn no_listeners_means_no_receiver() {
        let registry = ListenerRegistry::new(ContextKind::Popup);
        registry.add(EventKind::Installed, callback(|_| ListenerReply::Undefined));
        let err = registry
            .dispatch_message(json!({}), MessageSender::context(ContextKind::Background))
            .await
            .unwrap_err();
        assert!(matches!(err, ShimError::NoReceiver));
    }

    #[tokio::test]
    async fn panicking_listener_does_not_stop_dispatch() {
        let registry = ListenerRegistry::new(ContextKind::Popup);
        registry.add(EventKind::Message, callback(|_| panic!("listener bug")));
        registry.add(EventKind::Message, callback(|_| ListenerReply::Value(json!(true))));
        let reply = registry
            .dispatch_message(json!({}), MessageSender::context(ContextKind::Background))
            .await
            .unwrap();
        assert_eq!(reply, json!(true));
    }

    #[test]
    fn closed_registry_refuses_listeners() {
        let registry = ListenerRegistry::new(ContextKind::Popup);
        let id = registry
            .add(EventKind::Alarm, callback(|_| ListenerReply::Undefined))
            .unwrap();
        assert!(registry.has(EventKind::Alarm));
        assert_eq!(registry.close(), 1);
        assert!(!registry.remove(id));
        assert!(registry
            .add(EventKind::Alarm, callback(|_| ListenerReply::Undefined))
            .is_none());
        assert_eq!(registry.emit(EventKind::Alarm, Value::Null), 0);
    }
}
