//! [`HostPlatform`] over a Chromium DevTools Protocol transport.
//!
//! Each page target gets one flattened session with `Runtime`/`Page` enabled and the bridge
//! binding installed in both worlds. Page-side `post` calls surface as
//! `Runtime.bindingCalled` events and become [`PageMessage`]s.

use std::sync::Arc;

use async_trait::async_trait;
use cdp_adapter::{AdapterError, AdapterErrorKind, CdpTransport, CommandTarget};
use content_injection::BRIDGE_BINDING;
use dashmap::DashMap;
use preview_core_types::{
    ErrorCode, ExecutionWorld, HostError, HostPlatform, InjectionRequest, PageMessage,
    PageMessageKind, PageTarget, TargetId,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const ISOLATED_WORLD_NAME: &str = "preview-isolated";
const NO_RECEIVER: &str = "Receiving end does not exist";

fn map_adapter_error(err: AdapterError) -> HostError {
    let hint = err.hint.clone().unwrap_or_default();
    let code = match err.kind {
        AdapterErrorKind::Timeout => ErrorCode::RpcTimeout,
        AdapterErrorKind::TargetNotFound => ErrorCode::CapabilityUnavailable,
        AdapterErrorKind::CdpIo => ErrorCode::Disconnected,
        AdapterErrorKind::Internal => ErrorCode::Internal,
    };
    HostError::new(code, format!("cdp error {:?}: {}", err.kind, hint))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BindingPayload {
    reply_id: String,
    kind: PageMessageKind,
    #[serde(default)]
    payload: Value,
}

struct PageSession {
    id: String,
    target: PageTarget,
    isolated_context: OnceCell<i64>,
}

type Sessions = DashMap<TargetId, Arc<PageSession>>;

pub struct CdpPageHost {
    transport: Arc<dyn CdpTransport>,
    sessions: Arc<Sessions>,
    inbox: Mutex<mpsc::Receiver<PageMessage>>,
    pump: JoinHandle<()>,
}

impl Drop for CdpPageHost {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

impl CdpPageHost {
    /// Starts `transport` and begins listening for page-side bridge calls.
    pub async fn connect(transport: Arc<dyn CdpTransport>) -> Result<Self, HostError> {
        transport.start().await.map_err(map_adapter_error)?;
        let sessions: Arc<Sessions> = Arc::new(DashMap::new());
        let (tx, rx) = mpsc::channel(256);
        let pump = tokio::spawn(pump_binding_calls(transport.clone(), sessions.clone(), tx));
        Ok(Self {
            transport,
            sessions,
            inbox: Mutex::new(rx),
            pump,
        })
    }

    async fn command(
        &self,
        target: CommandTarget,
        method: &str,
        params: Value,
    ) -> Result<Value, HostError> {
        self.transport
            .send_command(target, method, params)
            .await
            .map_err(map_adapter_error)
    }

    async fn session(&self, target: &PageTarget) -> Result<Arc<PageSession>, HostError> {
        if let Some(existing) = self.sessions.get(&target.id) {
            return Ok(existing.value().clone());
        }
        let attached = self
            .command(
                CommandTarget::Browser,
                "Target.attachToTarget",
                json!({"targetId": target.id.0, "flatten": true}),
            )
            .await?;
        let id = attached["sessionId"]
            .as_str()
            .ok_or_else(|| HostError::internal("attachToTarget returned no sessionId"))?
            .to_string();
        let on_session = CommandTarget::Session(id.clone());
        self.command(on_session.clone(), "Runtime.enable", json!({})).await?;
        self.command(on_session.clone(), "Page.enable", json!({})).await?;
        self.command(on_session, "Runtime.addBinding", json!({"name": BRIDGE_BINDING}))
            .await?;
        debug!(target: "privileged-executor", page = %target.id, session = %id, "attached to page");

        let session = Arc::new(PageSession {
            id,
            target: target.clone(),
            isolated_context: OnceCell::new(),
        });
        Ok(self
            .sessions
            .entry(target.id.clone())
            .or_insert(session)
            .value()
            .clone())
    }

    async fn isolated_context(&self, session: &PageSession) -> Result<i64, HostError> {
        session
            .isolated_context
            .get_or_try_init(|| async {
                let on_session = CommandTarget::Session(session.id.clone());
                let tree = self
                    .command(on_session.clone(), "Page.getFrameTree", json!({}))
                    .await?;
                let frame_id = tree["frameTree"]["frame"]["id"]
                    .as_str()
                    .ok_or_else(|| HostError::internal("page has no main frame"))?
                    .to_string();
                self.command(
                    on_session.clone(),
                    "Runtime.addBinding",
                    json!({"name": BRIDGE_BINDING, "executionContextName": ISOLATED_WORLD_NAME}),
                )
                .await?;
                let world = self
                    .command(
                        on_session,
                        "Page.createIsolatedWorld",
                        json!({"frameId": frame_id, "worldName": ISOLATED_WORLD_NAME}),
                    )
                    .await?;
                world["executionContextId"].as_i64().ok_or_else(|| {
                    HostError::internal("createIsolatedWorld returned no context id")
                })
            })
            .await
            .copied()
    }

    async fn evaluate(
        &self,
        target: &PageTarget,
        world: ExecutionWorld,
        expression: &str,
    ) -> Result<Value, HostError> {
        let session = self.session(target).await?;
        let mut params = json!({
            "expression": expression,
            "awaitPromise": true,
            "returnByValue": true,
        });
        if world == ExecutionWorld::Isolated {
            params["contextId"] = json!(self.isolated_context(&session).await?);
        }
        let evaluated = self
            .command(CommandTarget::Session(session.id.clone()), "Runtime.evaluate", params)
            .await?;
        if let Some(details) = evaluated.get("exceptionDetails") {
            let text = details["exception"]["description"]
                .as_str()
                .or_else(|| details["text"].as_str())
                .unwrap_or("evaluation threw")
                .to_string();
            return Err(if text.contains(NO_RECEIVER) {
                HostError::unavailable(text)
            } else {
                HostError::permission_denied(text).with_data(details.clone())
            });
        }
        Ok(evaluated["result"]["value"].clone())
    }
}

#[async_trait]
impl HostPlatform for CdpPageHost {
    async fn find_active_target(&self) -> Result<Option<PageTarget>, HostError> {
        let targets = self
            .command(CommandTarget::Browser, "Target.getTargets", json!({}))
            .await?;
        let page = targets["targetInfos"]
            .as_array()
            .into_iter()
            .flatten()
            .find(|info| {
                info["type"] == "page"
                    && !info["url"]
                        .as_str()
                        .unwrap_or_default()
                        .starts_with("devtools://")
            });
        Ok(page.and_then(|info| {
            let id = info["targetId"].as_str()?;
            let mut target = PageTarget::new(id, info["url"].as_str().map(str::to_string));
            target.title = info["title"].as_str().map(str::to_string);
            Some(target)
        }))
    }

    async fn inject_code(&self, request: InjectionRequest<'_>) -> Result<Value, HostError> {
        self.evaluate(request.target, request.world, request.code)
            .await
    }

    async fn relay_to_page(
        &self,
        target: &PageTarget,
        world: ExecutionWorld,
        payload: Value,
    ) -> Result<Value, HostError> {
        let expression = format!(
            "(globalThis.__previewBridge ? globalThis.__previewBridge.dispatch({}, {}) : \
             Promise.reject(new Error(\"Could not establish connection. {NO_RECEIVER}.\")))",
            payload["message"], payload["sender"]
        );
        self.evaluate(target, world, &expression).await
    }

    async fn next_page_message(&self) -> Option<PageMessage> {
        self.inbox.lock().await.recv().await
    }

    async fn reply_to_page(
        &self,
        message: &PageMessage,
        reply: Result<Value, String>,
    ) -> Result<(), HostError> {
        let (ok, value) = match reply {
            Ok(value) => (true, value),
            Err(err) => (false, Value::String(err)),
        };
        let expression = format!(
            "(globalThis.__previewBridge && globalThis.__previewBridge.settle({}, {ok}, {value}))",
            Value::String(message.reply_id.clone())
        );
        self.evaluate(&message.target, message.world, &expression)
            .await
            .map(|_| ())
    }
}

async fn pump_binding_calls(
    transport: Arc<dyn CdpTransport>,
    sessions: Arc<Sessions>,
    tx: mpsc::Sender<PageMessage>,
) {
    while let Some(event) = transport.next_event().await {
        if event.method != "Runtime.bindingCalled" || event.params["name"] != BRIDGE_BINDING {
            continue;
        }
        let Some(session_id) = event.session_id.as_deref() else {
            continue;
        };
        let owner = sessions
            .iter()
            .find(|entry| entry.value().id == session_id)
            .map(|entry| {
                let session = entry.value();
                (session.target.clone(), session.isolated_context.get().copied())
            });
        let Some((target, isolated_context)) = owner else {
            debug!(target: "privileged-executor", session = session_id, "binding call from unknown session");
            continue;
        };
        let raw = event.params["payload"].as_str().unwrap_or_default();
        let parsed = match serde_json::from_str::<BindingPayload>(raw) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(target: "privileged-executor", page = %target.id, %err, "malformed bridge payload");
                continue;
            }
        };
        let world = match (event.params["executionContextId"].as_i64(), isolated_context) {
            (Some(context), Some(isolated)) if context == isolated => ExecutionWorld::Isolated,
            _ => ExecutionWorld::Main,
        };
        let message = PageMessage {
            target,
            world,
            reply_id: parsed.reply_id,
            kind: parsed.kind,
            payload: parsed.payload,
        };
        if tx.send(message).await.is_err() {
            break;
        }
    }
    debug!(target: "privileged-executor", "cdp event stream ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;
    use cdp_adapter::TransportEvent;

    /// Answers commands from a fixed table and replays queued events.
    struct ScriptedTransport {
        calls: SyncMutex<Vec<(CommandTarget, String, Value)>>,
        events: Mutex<mpsc::Receiver<TransportEvent>>,
        evaluate: SyncMutex<Value>,
    }

    impl ScriptedTransport {
        fn new() -> (Arc<Self>, mpsc::Sender<TransportEvent>) {
            let (tx, rx) = mpsc::channel(8);
            (
                Arc::new(Self {
                    calls: SyncMutex::new(Vec::new()),
                    events: Mutex::new(rx),
                    evaluate: SyncMutex::new(json!({"result": {"type": "boolean", "value": true}})),
                }),
                tx,
            )
        }

        fn methods(&self) -> Vec<String> {
            self.calls.lock().iter().map(|(_, m, _)| m.clone()).collect()
        }
    }

    #[async_trait]
    impl CdpTransport for ScriptedTransport {
        async fn start(&self) -> Result<(), AdapterError> {
            Ok(())
        }

        async fn next_event(&self) -> Option<TransportEvent> {
            self.events.lock().await.recv().await
        }

        async fn send_command(
            &self,
            target: CommandTarget,
            method: &str,
            params: Value,
        ) -> Result<Value, AdapterError> {
            self.calls
                .lock()
                .push((target, method.to_string(), params.clone()));
            Ok(match method {
                "Target.getTargets" => json!({"targetInfos": [
                    {"targetId": "DEV", "type": "page", "url": "devtools://devtools/inspector.html", "title": "DevTools"},
                    {"targetId": "SW", "type": "service_worker", "url": "https://a.test/sw.js", "title": ""},
                    {"targetId": "T1", "type": "page", "url": "https://a.test/", "title": "A"}
                ]}),
                "Target.attachToTarget" => json!({"sessionId": "S1"}),
                "Page.getFrameTree" => json!({"frameTree": {"frame": {"id": "F1"}}}),
                "Page.createIsolatedWorld" => json!({"executionContextId": 42}),
                "Runtime.evaluate" => self.evaluate.lock().clone(),
                _ => json!({}),
            })
        }
    }

    #[tokio::test]
    async fn picks_first_regular_page() {
        let (transport, _events) = ScriptedTransport::new();
        let host = CdpPageHost::connect(transport.clone()).await.unwrap();
        let target = host.find_active_target().await.unwrap().unwrap();
        assert_eq!(target.id, TargetId("T1".into()));
        assert_eq!(target.url.as_deref(), Some("https://a.test/"));
        assert_eq!(target.title.as_deref(), Some("A"));
    }

    #[tokio::test]
    async fn isolated_evaluation_creates_world_once() {
        let (transport, _events) = ScriptedTransport::new();
        let host = CdpPageHost::connect(transport.clone()).await.unwrap();
        let target = PageTarget::new("T1", Some("https://a.test/".into()));
        for _ in 0..2 {
            let value = host
                .inject_code(InjectionRequest {
                    target: &target,
                    world: ExecutionWorld::Isolated,
                    strategy: preview_core_types::InjectionStrategy::FunctionEval,
                    code: "true",
                })
                .await
                .unwrap();
            assert_eq!(value, json!(true));
        }
        let methods = transport.methods();
        assert_eq!(methods.iter().filter(|m| *m == "Target.attachToTarget").count(), 1);
        assert_eq!(methods.iter().filter(|m| *m == "Page.createIsolatedWorld").count(), 1);
        let calls = transport.calls.lock();
        let (on, _, params) = calls
            .iter()
            .rev()
            .find(|(_, m, _)| m == "Runtime.evaluate")
            .unwrap();
        assert_eq!(*on, CommandTarget::Session("S1".into()));
        assert_eq!(params["contextId"], json!(42));
    }

    #[tokio::test]
    async fn exceptions_become_permission_denied() {
        let (transport, _events) = ScriptedTransport::new();
        *transport.evaluate.lock() = json!({
            "result": {"type": "object"},
            "exceptionDetails": {"text": "Uncaught", "exception": {"description": "EvalError: Refused to evaluate a string as JavaScript"}}
        });
        let host = CdpPageHost::connect(transport.clone()).await.unwrap();
        let target = PageTarget::new("T1", None);
        let err = host
            .relay_to_page(&target, ExecutionWorld::Main, json!({"message": 1, "sender": {}}))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::PermissionDenied);
        assert!(err.message.contains("Refused"));
    }

    #[tokio::test]
    async fn binding_calls_become_page_messages() {
        let (transport, events) = ScriptedTransport::new();
        let host = CdpPageHost::connect(transport.clone()).await.unwrap();
        let target = PageTarget::new("T1", Some("https://a.test/".into()));
        host.inject_code(InjectionRequest {
            target: &target,
            world: ExecutionWorld::Main,
            strategy: preview_core_types::InjectionStrategy::FunctionEval,
            code: "true",
        })
        .await
        .unwrap();

        events
            .send(TransportEvent {
                method: "Runtime.bindingCalled".into(),
                params: json!({
                    "name": BRIDGE_BINDING,
                    "executionContextId": 7,
                    "payload": r#"{"replyId":"g:1","kind":"runtime_message","payload":{"ping":true}}"#
                }),
                session_id: Some("S1".into()),
            })
            .await
            .unwrap();
        let message = host.next_page_message().await.unwrap();
        assert_eq!(message.target.id, TargetId("T1".into()));
        assert_eq!(message.world, ExecutionWorld::Main);
        assert_eq!(message.kind, PageMessageKind::RuntimeMessage);
        assert_eq!(message.reply_id, "g:1");
        assert_eq!(message.payload, json!({"ping": true}));
    }
}
