//! Wire frames exchanged over a context channel.

use std::fmt;

use preview_core_types::{CorrelationId, ErrorCode};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: CorrelationId,
    pub capability: String,
    pub method: String,
    #[serde(default)]
    pub args: Value,
}

impl RpcRequest {
    pub fn new(capability: impl Into<String>, method: impl Into<String>, args: Value) -> Self {
        Self {
            id: CorrelationId::new(),
            capability: capability.into(),
            method: method.into(),
            args,
        }
    }

    pub fn label(&self) -> String {
        format!("{}.{}", self.capability, self.method)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RemoteError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
}

impl RemoteError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: Some(code),
        }
    }

    pub fn code_or_internal(&self) -> ErrorCode {
        self.code.unwrap_or(ErrorCode::Internal)
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// `{id, result}` or `{id, error}`. A present `null` result is a successful `null`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: CorrelationId,
    #[serde(
        default,
        deserialize_with = "present_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteError>,
}

fn present_value<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl RpcResponse {
    pub fn ok(id: CorrelationId, value: Value) -> Self {
        Self {
            id,
            result: Some(value),
            error: None,
        }
    }

    pub fn err(id: CorrelationId, error: RemoteError) -> Self {
        Self {
            id,
            result: None,
            error: Some(error),
        }
    }

    pub fn from_result(id: CorrelationId, result: Result<Value, RemoteError>) -> Self {
        match result {
            Ok(value) => Self::ok(id, value),
            Err(error) => Self::err(id, error),
        }
    }

    pub fn into_result(self) -> Result<Value, RemoteError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliverTag {
    Deliver,
}

/// Unsolicited push from the privileged side into a context.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeliverFrame {
    #[serde(rename = "type")]
    pub kind: DeliverTag,
    pub payload: Value,
    #[serde(rename = "replyChannelId")]
    pub reply_channel_id: CorrelationId,
}

impl DeliverFrame {
    pub fn new(payload: Value) -> Self {
        Self {
            kind: DeliverTag::Deliver,
            payload,
            reply_channel_id: CorrelationId::new(),
        }
    }
}

/// Variant order matters: a delivery carries `type`, a request carries `capability`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Frame {
    Deliver(DeliverFrame),
    Request(RpcRequest),
    Response(RpcResponse),
}

impl Frame {
    pub fn id(&self) -> CorrelationId {
        match self {
            Frame::Deliver(frame) => frame.reply_channel_id,
            Frame::Request(frame) => frame.id,
            Frame::Response(frame) => frame.id,
        }
    }
}

/// One side of a bidirectional frame channel.
pub struct ChannelEnd {
    pub tx: mpsc::UnboundedSender<Frame>,
    pub rx: mpsc::UnboundedReceiver<Frame>,
}

/// Two connected ends; frames sent on one arrive on the other.
pub fn channel_pair() -> (ChannelEnd, ChannelEnd) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    (
        ChannelEnd { tx: a_tx, rx: a_rx },
        ChannelEnd { tx: b_tx, rx: b_rx },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn frames_decode_by_shape() {
        let id = CorrelationId::new();
        let deliver: Frame = serde_json::from_value(json!({
            "type": "deliver",
            "payload": {"greeting": "hi"},
            "replyChannelId": id,
        }))
        .unwrap();
        assert!(matches!(deliver, Frame::Deliver(ref d) if d.reply_channel_id == id));

        let request: Frame = serde_json::from_value(json!({
            "id": id,
            "capability": "tabs",
            "method": "query",
            "args": [{"active": true}],
        }))
        .unwrap();
        assert!(matches!(request, Frame::Request(ref r) if r.label() == "tabs.query"));

        let response: Frame = serde_json::from_value(json!({"id": id, "result": null})).unwrap();
        match response {
            Frame::Response(resp) => assert_eq!(resp.into_result().unwrap(), Value::Null),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn error_response_keeps_code() {
        let id = CorrelationId::new();
        let frame = Frame::Response(RpcResponse::err(
            id,
            RemoteError::new(ErrorCode::CapabilityUnavailable, "No tab with id: 7"),
        ));
        let wire = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            wire,
            json!({"id": id, "error": {"message": "No tab with id: 7", "code": "capability_unavailable"}})
        );
        let back: Frame = serde_json::from_value(wire).unwrap();
        assert_eq!(back, frame);
    }
}
