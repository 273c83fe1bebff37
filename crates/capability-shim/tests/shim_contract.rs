use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bundle_store::{BundleFile, BundleInput, BundleStore, MountedBundle};
use capability_shim::{
    CapabilityShim, ContextRuntime, DeliveryEnvelope, ListenerRegistry, ListenerReply,
    MessageSender, NativeScriptEngine, PreviewSession, ScriptError, ShimError, StorageArea,
};
use parking_lot::Mutex;
use preview_core_types::{event_sink, ContextKind, ErrorCode, PreviewEvent};
use rpc_broker::{
    channel_pair, BrokerConfig, Frame, FrameHandler, RpcEndpoint, RpcResponse,
};
use serde_json::{json, Value};
use tokio::sync::watch;

fn mount() -> (BundleStore, MountedBundle) {
    let store = BundleStore::new();
    let mounted = store
        .mount(BundleInput {
            manifest: BundleFile::new(
                "manifest.json",
                r#"{"name":"demo","popup":"popup.html","background":{"file":"bg.js"}}"#,
            ),
            files: vec![
                BundleFile::new("popup.html", "<script src=\"popup.js\"></script>"),
                BundleFile::new("popup.js", ""),
                BundleFile::new("bg.js", ""),
            ],
        })
        .unwrap();
    (store, mounted)
}

fn local_shim(kind: ContextKind, session: &PreviewSession, bundle: &MountedBundle) -> CapabilityShim {
    CapabilityShim::new(
        kind,
        session.clone(),
        bundle.clone(),
        ListenerRegistry::new(kind),
        None,
    )
}

struct Quiet;

#[async_trait]
impl FrameHandler for Quiet {}

#[tokio::test]
async fn storage_change_reaches_other_context_before_write_settles() {
    let (_store, bundle) = mount();
    let (events, _rx) = event_sink(16);
    let session = PreviewSession::new(bundle.generation(), events);
    let popup = local_shim(ContextKind::Popup, &session, &bundle);
    let background = local_shim(ContextKind::Background, &session, &bundle);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    background.on_storage_changed(move |changes, area| {
        sink.lock().push((area, changes.to_value()));
    });

    popup
        .call("storage.local", "set", json!([{"theme": "dark"}]))
        .await
        .unwrap();
    {
        let seen = seen.lock();
        assert_eq!(seen.len(), 1, "listener ran before set returned");
        assert_eq!(seen[0].0, StorageArea::Local);
        assert_eq!(seen[0].1, json!({"theme": {"newValue": "dark"}}));
    }

    let read = background
        .call("storage.local", "get", json!([["theme", "missing"]]))
        .await
        .unwrap();
    assert_eq!(read, json!({"theme": "dark"}));
    let defaults = background
        .call("storage.local", "get", json!([{"theme": "light", "size": 12}]))
        .await
        .unwrap();
    assert_eq!(defaults, json!({"theme": "dark", "size": 12}));

    popup
        .call("storage.local", "set", json!([{"theme": "dark"}]))
        .await
        .unwrap();
    assert_eq!(seen.lock().len(), 1, "unchanged value produces no change event");
}

#[tokio::test]
async fn last_error_follows_call_outcomes() {
    let (_store, bundle) = mount();
    let (events, mut rx) = event_sink(16);
    let session = PreviewSession::new(bundle.generation(), events);
    let popup = local_shim(ContextKind::Popup, &session, &bundle);

    let err = popup.call("cookies", "getAll", Value::Null).await.unwrap_err();
    assert!(matches!(err, ShimError::Unsupported { .. }));
    let last = popup.last_error().expect("last error set");
    assert_eq!(last.code, ErrorCode::CapabilityUnavailable);
    match rx.recv().await.unwrap() {
        PreviewEvent::CapabilityFailed { capability, method, .. } => {
            assert_eq!((capability.as_str(), method.as_str()), ("cookies", "getAll"));
        }
        other => panic!("unexpected event {other:?}"),
    }

    let observed = Arc::new(Mutex::new(None));
    let slot = observed.clone();
    let reader = popup.clone();
    popup
        .call_with_callback("tabs", "query", json!([{}]), move |value| {
            *slot.lock() = Some((value, reader.last_error()));
        })
        .await;
    let (value, last) = observed.lock().take().expect("callback ran");
    assert_eq!(value, Value::Null);
    assert!(last.is_some(), "forwarded call without broker fails");

    let id = popup.call("runtime", "id", Value::Null).await.unwrap();
    assert_eq!(id, json!(session.extension_id()));
    assert!(popup.last_error().is_none());

    let url = popup.call("runtime", "getURL", json!(["popup.js"])).await.unwrap();
    assert_eq!(url, json!(bundle.handle("popup.js").unwrap().url));
}

#[tokio::test]
async fn forwarded_call_is_one_request() {
    let (_store, bundle) = mount();
    let (events, _rx) = event_sink(16);
    let session = PreviewSession::new(bundle.generation(), events);
    let (ctx_end, mut raw) = channel_pair();
    let runtime = ContextRuntime::start(
        ContextKind::Popup,
        ctx_end,
        &session,
        bundle.clone(),
        BrokerConfig::default(),
        None,
    );

    let shim = runtime.shim().clone();
    let call = tokio::spawn(async move { shim.call("tabs", "query", json!([{"active": true}])).await });

    let request = match raw.rx.recv().await.unwrap() {
        Frame::Request(request) => request,
        other => panic!("unexpected frame {other:?}"),
    };
    assert_eq!(request.label(), "tabs.query");
    assert_eq!(request.args, json!([{"active": true}]));
    raw.tx
        .send(Frame::Response(RpcResponse::ok(request.id, json!([{"id": 1}]))))
        .unwrap();

    assert_eq!(call.await.unwrap().unwrap(), json!([{"id": 1}]));
    assert!(raw.rx.try_recv().is_err(), "exactly one frame per call");
}

#[tokio::test]
async fn callbacks_never_fire_after_teardown() {
    let (_store, bundle) = mount();
    let (events, _rx) = event_sink(16);
    let session = PreviewSession::new(bundle.generation(), events);
    let (ctx_end, mut raw) = channel_pair();
    let runtime = ContextRuntime::start(
        ContextKind::Popup,
        ctx_end,
        &session,
        bundle,
        BrokerConfig::default(),
        None,
    );

    let fired = Arc::new(AtomicBool::new(false));
    let flag = fired.clone();
    let shim = runtime.shim().clone();
    let pending = tokio::spawn(async move {
        shim.call_with_callback("tabs", "query", json!([{}]), move |_| {
            flag.store(true, Ordering::SeqCst);
        })
        .await;
    });
    assert!(matches!(raw.rx.recv().await, Some(Frame::Request(_))));

    runtime.teardown();
    pending.await.unwrap();
    assert!(!fired.load(Ordering::SeqCst));
    assert!(matches!(
        runtime.shim().call("runtime", "id", Value::Null).await,
        Err(ShimError::TornDown)
    ));
}

#[tokio::test]
async fn deliveries_wait_for_the_gate() {
    let (_store, bundle) = mount();
    let (events, _rx) = event_sink(16);
    let session = PreviewSession::new(bundle.generation(), events);
    let (ctx_end, priv_end) = channel_pair();
    let (gate_tx, gate_rx) = watch::channel(false);
    let runtime = ContextRuntime::start(
        ContextKind::Background,
        ctx_end,
        &session,
        bundle,
        BrokerConfig::default(),
        Some(gate_rx),
    );
    let privileged = RpcEndpoint::spawn("privileged", priv_end, Arc::new(Quiet), BrokerConfig::default());

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    runtime.shim().on_message(move |message, sender, _respond| {
        counter.fetch_add(1, Ordering::SeqCst);
        ListenerReply::Value(json!({"got": message, "from": sender.context}))
    });

    let envelope = serde_json::to_value(DeliveryEnvelope {
        message: json!("ping"),
        sender: MessageSender::context(ContextKind::Popup),
    })
    .unwrap();
    let delivery = {
        let privileged = privileged.clone();
        tokio::spawn(async move { privileged.deliver(envelope).await })
    };

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0, "gate is still closed");

    gate_tx.send(true).unwrap();
    let reply = delivery.await.unwrap().unwrap();
    assert_eq!(reply, json!({"got": "ping", "from": "popup"}));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn scripts_run_with_their_context_in_scope() {
    let (_store, bundle) = mount();
    let (events, mut rx) = event_sink(32);
    let session = PreviewSession::new(bundle.generation(), events);
    let (ctx_end, _priv_end) = channel_pair();
    let runtime = ContextRuntime::start(
        ContextKind::Background,
        ctx_end,
        &session,
        bundle.clone(),
        BrokerConfig::default(),
        None,
    );

    let engine = NativeScriptEngine::new();
    engine.register("bg.js", |scope| async move {
        scope
            .shim
            .call("action", "setBadgeText", json!([{"text": "on"}]))
            .await
            .map_err(|err| ScriptError::failed("bg.js", err.to_string()))?;
        Ok(())
    });

    let bg = bundle.file("bg.js").unwrap().clone();
    runtime.run_script(&engine, &bg, None).await.unwrap();
    let badge = runtime
        .shim()
        .call("action", "getBadgeText", json!([{}]))
        .await
        .unwrap();
    assert_eq!(badge, json!("on"));

    let popup_js = bundle.file("popup.js").unwrap().clone();
    let err = runtime.run_script(&engine, &popup_js, None).await.unwrap_err();
    assert_eq!(err, ScriptError::NoProgram("popup.js".into()));

    let mut saw_badge = false;
    let mut saw_error = false;
    while let Ok(event) = rx.try_recv() {
        match event {
            PreviewEvent::BadgeUpdated { text, .. } => saw_badge = text == "on",
            PreviewEvent::ContextError { context, .. } => {
                saw_error = context == ContextKind::Background
            }
            _ => {}
        }
    }
    assert!(saw_badge && saw_error);
}
