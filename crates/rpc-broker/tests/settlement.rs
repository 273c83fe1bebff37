use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use preview_core_types::ErrorCode;
use rpc_broker::{
    channel_pair, metrics, BrokerConfig, Frame, FrameHandler, RemoteError, RpcEndpoint,
    RpcError, RpcRequest, RpcResponse,
};
use serde_json::{json, Value};

struct Echo {
    served: AtomicUsize,
}

#[async_trait]
impl FrameHandler for Echo {
    async fn handle_request(&self, request: RpcRequest) -> Result<Value, RemoteError> {
        self.served.fetch_add(1, Ordering::SeqCst);
        match request.method.as_str() {
            "echo" => Ok(request.args),
            "boom" => panic!("handler exploded"),
            "slow" => {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(Value::Null)
            }
            other => Err(RemoteError::new(
                ErrorCode::CapabilityUnavailable,
                format!("no method {other}"),
            )),
        }
    }

    async fn handle_delivery(&self, payload: Value) -> Result<Value, RemoteError> {
        Ok(json!({"seen": payload}))
    }
}

struct Silent;

#[async_trait]
impl FrameHandler for Silent {}

fn config(call_ms: u64) -> BrokerConfig {
    BrokerConfig {
        call_timeout_ms: call_ms,
        delivery_timeout_ms: call_ms,
    }
}

fn pair() -> (RpcEndpoint, RpcEndpoint, Arc<Echo>) {
    let (a, b) = channel_pair();
    let echo = Arc::new(Echo {
        served: AtomicUsize::new(0),
    });
    let caller = RpcEndpoint::spawn("popup", a, Arc::new(Silent), config(1_000));
    let server = RpcEndpoint::spawn("privileged", b, echo.clone(), config(1_000));
    (caller, server, echo)
}

#[tokio::test]
async fn request_and_delivery_round_trip() {
    let (caller, server, echo) = pair();

    let value = caller.call("tabs", "echo", json!([1, 2])).await.unwrap();
    assert_eq!(value, json!([1, 2]));
    assert_eq!(echo.served.load(Ordering::SeqCst), 1);

    let err = caller.call("tabs", "nope", Value::Null).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::CapabilityUnavailable);
    assert_eq!(caller.pending_count(), 0);

    // the popup side has no delivery listeners
    let err = server.deliver(json!({"hello": 1})).await.unwrap_err();
    assert!(err.to_string().contains("Receiving end does not exist"));

    let reply = caller.deliver(json!("ping")).await.unwrap();
    assert_eq!(reply, json!({"seen": "ping"}));
}

#[tokio::test]
async fn panicking_handler_becomes_error_response() {
    let (caller, _server, _echo) = pair();

    let err = caller.call("tabs", "boom", Value::Null).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::Internal);

    let value = caller.call("tabs", "echo", json!("still alive")).await.unwrap();
    assert_eq!(value, json!("still alive"));
}

#[tokio::test(start_paused = true)]
#[serial_test::serial(broker_metrics)]
async fn timeout_settles_once_and_late_response_is_dropped() {
    let (a, mut raw) = channel_pair();
    let caller = RpcEndpoint::spawn("popup", a, Arc::new(Silent), config(100));

    let pending = {
        let caller = caller.clone();
        tokio::spawn(async move { caller.call("storage", "get", Value::Null).await })
    };

    let request = match raw.rx.recv().await.unwrap() {
        Frame::Request(request) => request,
        other => panic!("unexpected frame {other:?}"),
    };
    assert_eq!(request.label(), "storage.get");

    let outcome = pending.await.unwrap();
    assert!(matches!(outcome, Err(RpcError::Timeout { .. })));
    assert_eq!(outcome.unwrap_err().code(), ErrorCode::RpcTimeout);
    assert_eq!(caller.pending_count(), 0);

    raw.tx
        .send(Frame::Response(RpcResponse::ok(request.id, json!("late"))))
        .unwrap();
    raw.tx
        .send(Frame::Response(RpcResponse::ok(request.id, json!("later"))))
        .unwrap();
    tokio::task::yield_now().await;
    assert_eq!(caller.pending_count(), 0);

    let next = {
        let caller = caller.clone();
        tokio::spawn(async move { caller.call("storage", "get", Value::Null).await })
    };
    let second = match raw.rx.recv().await.unwrap() {
        Frame::Request(request) => request,
        other => panic!("unexpected frame {other:?}"),
    };
    raw.tx
        .send(Frame::Response(RpcResponse::ok(second.id, json!({"a": 1}))))
        .unwrap();
    assert_eq!(next.await.unwrap().unwrap(), json!({"a": 1}));
}

#[tokio::test]
async fn shutdown_rejects_pending_calls() {
    let (caller, _server, _echo) = pair();

    let slow = {
        let caller = caller.clone();
        tokio::spawn(async move { caller.call("tabs", "slow", Value::Null).await })
    };
    while caller.pending_count() == 0 {
        tokio::task::yield_now().await;
    }

    assert_eq!(caller.shutdown(), 1);
    assert_eq!(slow.await.unwrap(), Err(RpcError::Disconnected));
    assert_eq!(
        caller.call("tabs", "echo", Value::Null).await,
        Err(RpcError::Disconnected)
    );
    assert!(caller.is_closed());
}

#[tokio::test]
async fn peer_drop_disconnects_caller() {
    let (a, b) = channel_pair();
    let caller = RpcEndpoint::spawn("background", a, Arc::new(Silent), config(5_000));

    let call = {
        let caller = caller.clone();
        tokio::spawn(async move { caller.call("runtime", "sendMessage", json!({})).await })
    };
    while caller.pending_count() == 0 {
        tokio::task::yield_now().await;
    }
    drop(b);

    assert_eq!(call.await.unwrap(), Err(RpcError::Disconnected));
}

#[tokio::test]
#[serial_test::serial(broker_metrics)]
async fn late_responses_are_counted() {
    metrics::reset();
    let (a, raw) = channel_pair();
    let _caller = RpcEndpoint::spawn("popup", a, Arc::new(Silent), config(1_000));

    raw.tx
        .send(Frame::Response(RpcResponse::ok(
            preview_core_types::CorrelationId::new(),
            Value::Null,
        )))
        .unwrap();
    for _ in 0..50 {
        if metrics::snapshot().late_responses > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(metrics::snapshot().late_responses >= 1);
}
