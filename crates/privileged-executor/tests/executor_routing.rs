use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bundle_store::{BundleFile, BundleInput, BundleStore, MountedBundle};
use capability_shim::{ContextRuntime, ListenerReply, PreviewSession, StorageArea, StorageQuery};
use parking_lot::Mutex;
use preview_core_types::{
    event_sink, ContextKind, ErrorCode, ExecutionWorld, HostError, HostPlatform,
    InjectionRequest, InjectionStrategy, PageMessage, PageMessageKind, PageTarget,
};
use privileged_executor::{
    ExecError, ExecutorConfig, InjectionState, PrivilegedExecutor, StorageBackend,
};
use rpc_broker::{channel_pair, RpcRequest};
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, Notify};

#[derive(Default)]
struct FakeHost {
    active: Mutex<Option<PageTarget>>,
    block_all: Mutex<bool>,
    injected: Mutex<Vec<(ExecutionWorld, InjectionStrategy, String)>>,
    relayed: Mutex<Vec<(ExecutionWorld, Value)>>,
    storage: Mutex<Map<String, Value>>,
    inbox: tokio::sync::Mutex<Option<mpsc::Receiver<PageMessage>>>,
    replies: Mutex<Vec<(String, Result<Value, String>)>>,
    replied: Notify,
}

impl FakeHost {
    fn with_page(url: &str) -> Arc<Self> {
        let host = Self::default();
        *host.active.lock() = Some(PageTarget::new("T1", Some(url.to_string())));
        Arc::new(host)
    }
}

#[async_trait]
impl HostPlatform for FakeHost {
    async fn find_active_target(&self) -> Result<Option<PageTarget>, HostError> {
        Ok(self.active.lock().clone())
    }

    async fn inject_code(&self, request: InjectionRequest<'_>) -> Result<Value, HostError> {
        self.injected.lock().push((
            request.world,
            request.strategy,
            request.code.to_string(),
        ));
        if *self.block_all.lock() {
            return Err(HostError::permission_denied("Refused to evaluate"));
        }
        Ok(Value::Bool(true))
    }

    async fn relay_to_page(
        &self,
        _target: &PageTarget,
        world: ExecutionWorld,
        payload: Value,
    ) -> Result<Value, HostError> {
        self.relayed.lock().push((world, payload.clone()));
        Ok(json!({"echo": payload["message"]}))
    }

    async fn read_storage(&self, keys: Option<Vec<String>>) -> Result<Map<String, Value>, HostError> {
        let storage = self.storage.lock();
        Ok(match keys {
            None => storage.clone(),
            Some(keys) => keys
                .into_iter()
                .filter_map(|key| storage.get(&key).map(|value| (key, value.clone())))
                .collect(),
        })
    }

    async fn write_storage(&self, entries: Map<String, Value>) -> Result<(), HostError> {
        self.storage.lock().extend(entries);
        Ok(())
    }

    async fn next_page_message(&self) -> Option<PageMessage> {
        let mut guard = self.inbox.lock().await;
        match guard.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    async fn reply_to_page(
        &self,
        message: &PageMessage,
        reply: Result<Value, String>,
    ) -> Result<(), HostError> {
        self.replies.lock().push((message.reply_id.clone(), reply));
        self.replied.notify_one();
        Ok(())
    }
}

fn bundle() -> MountedBundle {
    BundleStore::new()
        .mount(BundleInput {
            manifest: BundleFile::new(
                "manifest.json",
                r#"{
                    "background": {"service_worker": "bg.js"},
                    "contentScript": {"matches": ["https://*/*"], "files": ["c.js"]}
                }"#,
            ),
            files: vec![
                BundleFile::new("bg.js", "// background"),
                BundleFile::new("c.js", "chrome.runtime.onMessage.addListener(() => true);"),
            ],
        })
        .unwrap()
}

fn executor(host: Arc<FakeHost>, config: ExecutorConfig) -> PrivilegedExecutor {
    let bundle = bundle();
    let (events, _rx) = event_sink(64);
    let session = PreviewSession::new(bundle.generation(), events);
    PrivilegedExecutor::new(host, bundle, session, config)
}

fn short_timeouts() -> ExecutorConfig {
    let mut config = ExecutorConfig::default();
    config.broker.call_timeout_ms = 500;
    config.broker.delivery_timeout_ms = 500;
    config.injection.attempt_timeout_ms = 200;
    config
}

fn request(capability: &str, method: &str, args: Value) -> RpcRequest {
    RpcRequest::new(capability, method, args)
}

#[tokio::test]
async fn tabs_query_reports_the_active_page() {
    let host = FakeHost::with_page("https://a.test/");
    let exec = executor(host.clone(), short_timeouts());
    let tabs = exec
        .handle_call(ContextKind::Popup, request("tabs", "query", json!([{"active": true}])))
        .await
        .unwrap();
    assert_eq!(tabs[0]["id"], json!(1));
    assert_eq!(tabs[0]["url"], json!("https://a.test/"));
    assert_eq!(tabs[0]["active"], json!(true));

    *host.active.lock() = None;
    let none = exec
        .handle_call(ContextKind::Popup, request("tabs", "query", json!([{}])))
        .await
        .unwrap();
    assert_eq!(none, json!([]));
    assert!(matches!(
        exec.find_active_target().await,
        Err(ExecError::NoActiveTarget)
    ));
}

#[tokio::test]
async fn send_message_waits_for_content_script_and_relays() {
    let host = FakeHost::with_page("https://a.test/");
    let exec = executor(host.clone(), short_timeouts());
    let target = exec.find_active_target().await.unwrap();

    let before = exec
        .handle_call(ContextKind::Popup, request("tabs", "sendMessage", json!([1, {"n": 1}])))
        .await
        .unwrap_err();
    assert!(matches!(before, ExecError::NoReceiver));

    assert!(exec.spawn_content_injection(target.clone()));
    let reply = exec
        .handle_call(ContextKind::Popup, request("tabs", "sendMessage", json!([1, {"n": 2}])))
        .await
        .unwrap();
    assert_eq!(reply, json!({"echo": {"n": 2}}));
    assert_eq!(
        exec.gates().state(&target.id),
        Some(InjectionState::Ready(ExecutionWorld::Main))
    );

    let relayed = host.relayed.lock().clone();
    assert_eq!(relayed.len(), 1);
    assert_eq!(relayed[0].0, ExecutionWorld::Main);
    assert_eq!(relayed[0].1["sender"]["context"], json!("popup"));
    assert_eq!(
        relayed[0].1["sender"]["id"],
        json!(exec.session().extension_id())
    );

    let missing = exec
        .handle_call(ContextKind::Popup, request("tabs", "sendMessage", json!([9, {}])))
        .await
        .unwrap_err();
    assert_eq!(missing.to_string(), "No tab with id: 9.");
    assert_eq!(missing.code(), ErrorCode::CapabilityUnavailable);
}

#[tokio::test]
async fn non_matching_pages_get_no_content_script() {
    let host = FakeHost::with_page("http://plain.test/");
    let exec = executor(host.clone(), short_timeouts());
    let target = exec.find_active_target().await.unwrap();
    assert!(!exec.spawn_content_injection(target));
    assert!(host.injected.lock().is_empty());
}

#[tokio::test]
async fn finished_injection_tasks_are_not_retained() {
    let host = FakeHost::with_page("https://a.test/");
    let exec = executor(host.clone(), short_timeouts());
    let target = exec.find_active_target().await.unwrap();

    for _ in 0..16 {
        assert!(exec.spawn_content_injection(target.clone()));
        assert_eq!(
            exec.gates().settled(&target.id, Duration::from_secs(2)).await,
            Some(InjectionState::Ready(ExecutionWorld::Main))
        );
    }
    tokio::time::timeout(Duration::from_secs(2), async {
        while exec.running_tasks() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("injection tasks finish");
    assert_eq!(host.injected.lock().len(), 16);

    assert!(exec.spawn_content_injection(target.clone()));
    assert!(exec.running_tasks() <= 1);
}

#[tokio::test]
async fn blocked_page_rejects_messages_with_history() {
    let host = FakeHost::with_page("https://strict.test/");
    *host.block_all.lock() = true;
    let exec = executor(host.clone(), short_timeouts());
    exec.find_active_target().await.unwrap();

    let err = exec
        .handle_call(
            ContextKind::Popup,
            request(
                "scripting",
                "executeScript",
                json!([{"target": {"tabId": 1}, "files": ["c.js"]}]),
            ),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InjectionBlocked);
    let ExecError::InjectionBlocked(blocked) = &err else {
        panic!("expected a blocked injection, got {err:?}");
    };
    assert_eq!(blocked.attempts.len(), 4);
    assert!(!blocked.known_restricted);
    assert_eq!(host.injected.lock().len(), 4);

    let relay = exec
        .handle_call(ContextKind::Popup, request("tabs", "sendMessage", json!([1, "hi"])))
        .await
        .unwrap_err();
    assert_eq!(relay.code(), ErrorCode::InjectionBlocked);
}

#[tokio::test]
async fn execute_script_func_runs_in_requested_world() {
    let host = FakeHost::with_page("https://a.test/");
    let exec = executor(host.clone(), short_timeouts());
    exec.find_active_target().await.unwrap();

    let result = exec
        .handle_call(
            ContextKind::Popup,
            request(
                "scripting",
                "executeScript",
                json!([{"target": {"tabId": 1}, "func": "function (a, b) { return a + b; }", "args": [1, 2]}]),
            ),
        )
        .await
        .unwrap();
    assert_eq!(result, json!([{"frameId": 0, "result": true}]));
    let injected = host.injected.lock().clone();
    assert_eq!(injected.len(), 1);
    assert_eq!(injected[0].0, ExecutionWorld::Isolated);
    assert_eq!(injected[0].2, "(function (a, b) { return a + b; }).apply(null, [1,2])");

    exec.handle_call(
        ContextKind::Popup,
        request(
            "scripting",
            "executeScript",
            json!([{"target": {"tabId": 1}, "func": "() => 1", "world": "MAIN"}]),
        ),
    )
    .await
    .unwrap();
    assert_eq!(host.injected.lock()[1].0, ExecutionWorld::Main);

    let invalid = exec
        .handle_call(
            ContextKind::Popup,
            request("scripting", "executeScript", json!([{"target": {"tabId": 1}}])),
        )
        .await
        .unwrap_err();
    assert!(matches!(invalid, ExecError::InvalidArgs { .. }));
}

#[tokio::test]
async fn runtime_messages_reach_other_contexts() {
    let host = FakeHost::with_page("https://a.test/");
    let exec = executor(host.clone(), short_timeouts());

    let unanswered = exec
        .handle_call(ContextKind::Popup, request("runtime", "sendMessage", json!([{"q": 1}])))
        .await
        .unwrap_err();
    assert!(matches!(unanswered, ExecError::NoReceiver));

    let (privileged, context) = channel_pair();
    exec.attach_context(ContextKind::Background, privileged);
    let background = ContextRuntime::start(
        ContextKind::Background,
        context,
        exec.session(),
        exec.bundle().clone(),
        exec.config().broker.clone(),
        None,
    );

    let no_listener = exec
        .handle_call(ContextKind::Popup, request("runtime", "sendMessage", json!([{"q": 1}])))
        .await
        .unwrap_err();
    assert!(matches!(no_listener, ExecError::NoReceiver));

    background.shim().on_message(|message, sender, _respond| {
        ListenerReply::Value(json!({"got": message, "from": sender.context}))
    });
    let reply = exec
        .handle_call(ContextKind::Popup, request("runtime", "sendMessage", json!([{"q": 2}])))
        .await
        .unwrap();
    assert_eq!(reply, json!({"got": {"q": 2}, "from": "popup"}));

    let own = exec
        .handle_call(
            ContextKind::Background,
            request("runtime", "sendMessage", json!([{"q": 3}])),
        )
        .await
        .unwrap_err();
    assert!(matches!(own, ExecError::NoReceiver));

    let with_id = exec
        .handle_call(
            ContextKind::Popup,
            request(
                "runtime",
                "sendMessage",
                json!([exec.session().extension_id(), {"q": 4}]),
            ),
        )
        .await
        .unwrap();
    assert_eq!(with_id["got"], json!({"q": 4}));

    background.teardown();
    exec.shutdown();
}

#[tokio::test]
async fn page_inbox_serves_messages_and_storage() {
    let host = FakeHost::with_page("https://a.test/");
    let (tx, rx) = mpsc::channel(8);
    *host.inbox.lock().await = Some(rx);
    let exec = executor(host.clone(), short_timeouts());

    let (privileged, context) = channel_pair();
    exec.attach_context(ContextKind::Background, privileged);
    let background = ContextRuntime::start(
        ContextKind::Background,
        context,
        exec.session(),
        exec.bundle().clone(),
        exec.config().broker.clone(),
        None,
    );
    background.shim().on_message(|message, sender, _respond| {
        ListenerReply::Value(json!({"pong": message, "tab": sender.tab.map(|tab| tab["id"].clone())}))
    });
    exec.start_page_inbox();

    let target = PageTarget::new("T1", Some("https://a.test/".into()));
    let page_message = |reply_id: &str, kind: PageMessageKind, payload: Value| PageMessage {
        target: target.clone(),
        world: ExecutionWorld::Main,
        reply_id: reply_id.to_string(),
        kind,
        payload,
    };

    tx.send(page_message("r1", PageMessageKind::RuntimeMessage, json!("ping")))
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(2), host.replied.notified())
        .await
        .unwrap();
    tx.send(page_message("r2", PageMessageKind::StorageSet, json!({"color": "red"})))
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(2), host.replied.notified())
        .await
        .unwrap();
    tx.send(page_message("r3", PageMessageKind::StorageGet, json!(["color"])))
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(2), host.replied.notified())
        .await
        .unwrap();

    let replies = host.replies.lock().clone();
    assert_eq!(replies[0].0, "r1");
    assert_eq!(replies[0].1, Ok(json!({"pong": "ping", "tab": 1})));
    assert_eq!(replies[1], ("r2".to_string(), Ok(Value::Null)));
    assert_eq!(replies[2], ("r3".to_string(), Ok(json!({"color": "red"}))));
    assert_eq!(
        exec.session()
            .storage()
            .get(StorageArea::Local, &StorageQuery::All)
            .get("color"),
        Some(&json!("red"))
    );

    background.teardown();
    exec.shutdown();
}

#[tokio::test]
async fn host_storage_backend_merges_defaults() {
    let host = FakeHost::with_page("https://a.test/");
    host.storage.lock().insert("seen".into(), json!(3));
    let mut config = short_timeouts();
    config.storage = StorageBackend::Host;
    let exec = executor(host.clone(), config);

    let read = exec
        .handle_call(
            ContextKind::Popup,
            request("storage.local", "get", json!([{"seen": 0, "theme": "dark"}])),
        )
        .await
        .unwrap();
    assert_eq!(read, json!({"seen": 3, "theme": "dark"}));

    exec.handle_call(
        ContextKind::Popup,
        request("storage.sync", "set", json!([{"theme": "light"}])),
    )
    .await
    .unwrap();
    assert_eq!(host.storage.lock().get("theme"), Some(&json!("light")));

    let clear = exec
        .handle_call(ContextKind::Popup, request("storage.local", "clear", json!([])))
        .await
        .unwrap_err();
    assert!(matches!(clear, ExecError::Unsupported(_)));

    exec.handle_call(
        ContextKind::Popup,
        request("storage.session", "set", json!([{"k": 1}])),
    )
    .await
    .unwrap();
    assert!(host.storage.lock().get("k").is_none());

    let unknown = exec
        .handle_call(ContextKind::Popup, request("cookies", "getAll", json!([])))
        .await
        .unwrap_err();
    assert_eq!(unknown.to_string(), "cookies.getAll is not available in the preview");
}

#[tokio::test]
async fn shutdown_stops_serving() {
    let host = FakeHost::with_page("https://a.test/");
    let exec = executor(host, short_timeouts());
    exec.shutdown();
    assert!(!exec.is_alive());
    let err = exec
        .handle_call(ContextKind::Popup, request("tabs", "query", json!([])))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Disconnected);
}
