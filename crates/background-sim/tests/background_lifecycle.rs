use std::sync::Arc;
use std::time::Duration;

use background_sim::{BackgroundContext, BackgroundError};
use bundle_store::{BundleFile, BundleInput, BundleStore, MountedBundle};
use capability_shim::{ListenerReply, NativeScriptEngine, PreviewSession, ScriptError};
use parking_lot::Mutex;
use preview_core_types::{event_sink, ContextKind, ErrorCode, PreviewEvent};
use rpc_broker::{channel_pair, BrokerConfig, FrameHandler, RpcEndpoint, RpcError};
use serde_json::{json, Value};
use tokio::sync::{broadcast, Notify};

struct Privileged;

impl FrameHandler for Privileged {}

fn mount(manifest: &str, files: Vec<BundleFile>) -> MountedBundle {
    BundleStore::new()
        .mount(BundleInput {
            manifest: BundleFile::new("manifest.json", manifest),
            files,
        })
        .unwrap()
}

fn with_background() -> MountedBundle {
    mount(
        r#"{"background": {"service_worker": "bg.js"}}"#,
        vec![BundleFile::new("bg.js", "// background")],
    )
}

fn session(bundle: &MountedBundle) -> (PreviewSession, broadcast::Receiver<PreviewEvent>) {
    let (events, rx) = event_sink(64);
    (PreviewSession::new(bundle.generation(), events), rx)
}

fn drain(rx: &mut broadcast::Receiver<PreviewEvent>) -> Vec<PreviewEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = rx.try_recv() {
        seen.push(event);
    }
    seen
}

#[tokio::test]
async fn bundles_without_background_start_nothing() {
    let bundle = mount(r#"{"popup": "p.html"}"#, vec![BundleFile::new("p.html", "")]);
    let (session, _rx) = session(&bundle);
    let (_privileged, context) = channel_pair();
    let engine = NativeScriptEngine::new();
    let started = BackgroundContext::start(
        context,
        &session,
        bundle,
        BrokerConfig::default(),
        &engine,
    )
    .await
    .unwrap();
    assert!(started.is_none());
}

#[tokio::test]
async fn declared_but_missing_script_is_rejected() {
    let bundle = mount(r#"{"background": {"scripts": ["missing.js", "other.js"]}}"#, vec![]);
    let (session, _rx) = session(&bundle);
    let (_privileged, context) = channel_pair();
    let engine = NativeScriptEngine::new();
    let err = BackgroundContext::start(
        context,
        &session,
        bundle,
        BrokerConfig::default(),
        &engine,
    )
    .await
    .err()
    .unwrap();
    assert_eq!(err, BackgroundError::MissingScript("missing.js".into()));
    assert_eq!(err.code(), ErrorCode::InvalidBundle);
}

#[tokio::test]
async fn installed_fires_once_before_any_message() {
    let bundle = with_background();
    let (session, mut rx) = session(&bundle);
    let (privileged_end, context_end) = channel_pair();
    let privileged = RpcEndpoint::spawn(
        "executor:background",
        privileged_end,
        Arc::new(Privileged),
        BrokerConfig::default(),
    );

    let log: Arc<Mutex<Vec<String>>> = Arc::default();
    let release = Arc::new(Notify::new());
    let engine = Arc::new(NativeScriptEngine::new());
    {
        let log = log.clone();
        let release = release.clone();
        engine.register("bg.js", move |scope| {
            let log = log.clone();
            let release = release.clone();
            async move {
                let installed_log = log.clone();
                scope.shim.on_installed(move |details| {
                    installed_log
                        .lock()
                        .push(format!("installed:{}", details["reason"].as_str().unwrap_or("")));
                });
                let message_log = log.clone();
                scope.shim.on_message(move |message, sender, _respond| {
                    message_log.lock().push(format!("message:{message}"));
                    assert_eq!(sender.context, ContextKind::Popup);
                    ListenerReply::Value(json!("pong"))
                });
                release.notified().await;
                Ok(())
            }
        });
    }

    let starting = {
        let session = session.clone();
        let engine = engine.clone();
        tokio::spawn(async move {
            BackgroundContext::start(
                context_end,
                &session,
                bundle,
                BrokerConfig::default(),
                &*engine,
            )
            .await
        })
    };

    let delivery = {
        let privileged = privileged.clone();
        tokio::spawn(async move {
            privileged
                .deliver(json!({"message": "ping", "sender": {"context": "popup"}}))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!delivery.is_finished());
    assert!(log.lock().iter().all(|entry| !entry.starts_with("message")));

    release.notify_one();
    let background = starting.await.unwrap().unwrap().unwrap();
    assert!(background.installed());
    assert!(background.is_ready());
    assert!(background.script_error().is_none());
    assert_eq!(background.path(), "bg.js");

    let reply = delivery.await.unwrap().unwrap();
    assert_eq!(reply, json!("pong"));
    assert_eq!(
        log.lock().clone(),
        vec!["installed:install".to_string(), "message:\"ping\"".to_string()]
    );

    let installed_events = drain(&mut rx)
        .into_iter()
        .filter(|event| matches!(event, PreviewEvent::InstalledFired { .. }))
        .count();
    assert_eq!(installed_events, 1);

    background.teardown();
    privileged.shutdown();
}

#[tokio::test]
async fn failing_script_still_brings_the_context_up() {
    let bundle = with_background();
    let (session, mut rx) = session(&bundle);
    let (_privileged, context_end) = channel_pair();
    let engine = NativeScriptEngine::new();
    engine.register("bg.js", |_scope| async {
        Err(ScriptError::failed("bg.js", "ReferenceError: chrome is not defined"))
    });

    let background = BackgroundContext::start(
        context_end,
        &session,
        bundle,
        BrokerConfig::default(),
        &engine,
    )
    .await
    .unwrap()
    .unwrap();
    assert!(background.installed());
    assert!(matches!(
        background.script_error(),
        Some(ScriptError::Failed { .. })
    ));

    let events = drain(&mut rx);
    let error_at = events
        .iter()
        .position(|event| matches!(event, PreviewEvent::ContextError { context: ContextKind::Background, .. }))
        .unwrap();
    let installed_at = events
        .iter()
        .position(|event| matches!(event, PreviewEvent::InstalledFired { .. }))
        .unwrap();
    assert!(error_at < installed_at);
}

#[tokio::test]
async fn teardown_rejects_later_deliveries() {
    let bundle = with_background();
    let (session, mut rx) = session(&bundle);
    let (privileged_end, context_end) = channel_pair();
    let privileged = RpcEndpoint::spawn(
        "executor:background",
        privileged_end,
        Arc::new(Privileged),
        BrokerConfig {
            call_timeout_ms: 200,
            delivery_timeout_ms: 200,
        },
    );
    let engine = NativeScriptEngine::new();
    engine.register("bg.js", |scope| async move {
        scope
            .shim
            .on_message(|_message, _sender, _respond| ListenerReply::Value(Value::Bool(true)));
        Ok(())
    });

    let background = BackgroundContext::start(
        context_end,
        &session,
        bundle,
        BrokerConfig::default(),
        &engine,
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(privileged.deliver(json!("hi")).await.unwrap(), json!(true));

    background.teardown();
    background.teardown();
    assert!(!background.is_ready());
    assert!(background.runtime().is_stopped());
    let err = privileged.deliver(json!("again")).await.unwrap_err();
    assert!(matches!(err, RpcError::Disconnected | RpcError::Timeout { .. }));

    let stopped = drain(&mut rx)
        .into_iter()
        .filter(|event| matches!(event, PreviewEvent::ContextStopped { .. }))
        .count();
    assert_eq!(stopped, 1);
}
