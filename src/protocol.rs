//! Wire protocol for worker communication.
//!
//! Messages are JSON-serialized and newline-delimited. The controller sends
//! request envelopes plus one bare control string (the terminate signal);
//! workers answer with result/error/event envelopes, cleanup acknowledgements,
//! and the bare `"ready"` string emitted once registration completes.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// Reserved method identifier instructing a worker to shut down.
///
/// Also sent bare (a JSON string, no envelope) as the terminate signal.
pub const TERMINATE_METHOD_ID: &str = "__workerpool-terminate__";

/// Reserved method identifier asking a worker to run its abort listeners.
pub const CLEANUP_METHOD_ID: &str = "__workerpool-cleanup__";

/// Literal signal a worker emits once its registration step has completed.
pub const READY_SIGNAL: &str = "ready";

/// Request from controller to worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Per-worker monotonic request id, starting at 1.
    pub id: u32,
    /// User-registered method name or a reserved control id.
    pub method: String,
    #[serde(default)]
    pub params: Vec<Value>,
    /// Transferable handles for endpoints that support ownership transfer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer: Option<Vec<Value>>,
}

impl Request {
    /// Build a cleanup request for the given in-flight id.
    pub fn cleanup(id: u32) -> Self {
        Self {
            id,
            method: CLEANUP_METHOD_ID.to_string(),
            params: Vec::new(),
            transfer: None,
        }
    }

    /// Serialize to a JSON line (with newline).
    pub fn to_line(&self) -> String {
        let mut line =
            serde_json::to_string(self).expect("request serialization failed");
        line.push('\n');
        line
    }
}

/// The bare terminate signal as a JSON line.
pub fn terminate_line() -> String {
    let mut line = serde_json::to_string(TERMINATE_METHOD_ID)
        .expect("terminate signal serialization failed");
    line.push('\n');
    line
}

/// Error value ferried across the worker boundary.
///
/// Serialization copies `name`, `message`, `stack`, and every remaining own
/// property into a flat object; deserialization reattaches them, so a caller
/// sees the same error the worker method raised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteError {
    #[serde(default = "default_error_name")]
    pub name: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(flatten)]
    pub properties: Map<String, Value>,
}

fn default_error_name() -> String {
    "Error".to_string()
}

impl RemoteError {
    /// Create an error with the default name.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            name: default_error_name(),
            message: message.into(),
            stack: None,
            properties: Map::new(),
        }
    }

    /// Override the error name (`"TimeoutError"`, `"Panic"`, ...).
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Attach an extra own property, preserved across the wire.
    pub fn with_property(mut self, key: impl Into<String>, value: Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    /// Build an error from a panic payload.
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "worker method panicked".to_string()
        };
        Self::new(message).with_name("Panic")
    }
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.name.is_empty() || self.name == "Error" {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.name, self.message)
        }
    }
}

impl std::error::Error for RemoteError {}

impl From<String> for RemoteError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for RemoteError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Wrapper signaling ownership-transfer semantics for the wrapped payload.
///
/// Endpoint adapters decide whether to honor the transfer list; process
/// endpoints ignore it, and in-process endpoints already share an address
/// space. Both worker-side `emit` and terminal results accept this wrapper.
#[derive(Debug, Clone, PartialEq)]
pub struct Transfer {
    pub message: Value,
    pub transfer: Vec<Value>,
}

/// Value returned by a worker method: plain, or transfer-wrapped.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Value(Value),
    Transfer(Transfer),
}

impl Reply {
    pub(crate) fn into_parts(self) -> (Value, Option<Vec<Value>>) {
        match self {
            Reply::Value(value) => (value, None),
            Reply::Transfer(t) => (t.message, Some(t.transfer)),
        }
    }
}

impl From<Value> for Reply {
    fn from(value: Value) -> Self {
        Reply::Value(value)
    }
}

impl From<Transfer> for Reply {
    fn from(t: Transfer) -> Self {
        Reply::Transfer(t)
    }
}

/// Message from worker to controller, classified from a raw JSON value.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerMessage {
    /// The literal `"ready"` string.
    Ready,
    /// Progress event for an in-flight request; zero or more per request.
    Event {
        id: u32,
        payload: Value,
        transfer: Option<Vec<Value>>,
    },
    /// Acknowledgement of a cleanup request.
    CleanupAck { id: u32, error: Option<RemoteError> },
    /// Terminal success.
    Result {
        id: u32,
        result: Value,
        transfer: Option<Vec<Value>>,
    },
    /// Terminal failure.
    Failure { id: u32, error: RemoteError },
}

impl WorkerMessage {
    /// Serialize to the wire shape.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Ready => json!(READY_SIGNAL),
            Self::Event {
                id,
                payload,
                transfer,
            } => {
                let mut obj = json!({ "id": id, "isEvent": true, "payload": payload });
                if let Some(list) = transfer {
                    obj["transfer"] = json!(list);
                }
                obj
            }
            Self::CleanupAck { id, error } => {
                json!({ "id": id, "method": CLEANUP_METHOD_ID, "error": error })
            }
            Self::Result {
                id,
                result,
                transfer,
            } => {
                let mut obj = json!({ "id": id, "result": result, "error": null });
                if let Some(list) = transfer {
                    obj["transfer"] = json!(list);
                }
                obj
            }
            Self::Failure { id, error } => {
                json!({ "id": id, "result": null, "error": error })
            }
        }
    }

    /// Serialize to a JSON line (with newline).
    pub fn to_line(&self) -> String {
        let mut line = self.to_value().to_string();
        line.push('\n');
        line
    }

    /// Classify a raw value from the wire. Returns `None` for shapes that
    /// are not part of the protocol.
    pub fn from_value(value: &Value) -> Option<Self> {
        if value.as_str() == Some(READY_SIGNAL) {
            return Some(Self::Ready);
        }
        let obj = value.as_object()?;
        let id = obj.get("id")?.as_u64()? as u32;

        if obj.get("method").and_then(Value::as_str) == Some(CLEANUP_METHOD_ID) {
            let error = match obj.get("error") {
                None | Some(Value::Null) => None,
                Some(e) => Some(serde_json::from_value(e.clone()).ok()?),
            };
            return Some(Self::CleanupAck { id, error });
        }

        if obj.get("isEvent").and_then(Value::as_bool) == Some(true) {
            return Some(Self::Event {
                id,
                payload: obj.get("payload").cloned().unwrap_or(Value::Null),
                transfer: parse_transfer(obj.get("transfer")),
            });
        }

        match obj.get("error") {
            None | Some(Value::Null) => Some(Self::Result {
                id,
                result: obj.get("result").cloned().unwrap_or(Value::Null),
                transfer: parse_transfer(obj.get("transfer")),
            }),
            Some(e) => Some(Self::Failure {
                id,
                error: serde_json::from_value(e.clone()).ok()?,
            }),
        }
    }
}

fn parse_transfer(value: Option<&Value>) -> Option<Vec<Value>> {
    value.and_then(Value::as_array).map(|list| list.to_vec())
}

/// Message from controller to worker, classified on the worker side.
#[derive(Debug)]
pub enum ControllerMessage {
    /// The bare terminate signal.
    Terminate,
    /// A request envelope.
    Request(Request),
}

impl ControllerMessage {
    /// Classify a raw value read from the inbound stream.
    pub fn from_value(value: Value) -> Option<Self> {
        if value.as_str() == Some(TERMINATE_METHOD_ID) {
            return Some(Self::Terminate);
        }
        serde_json::from_value(value).ok().map(Self::Request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_line_roundtrip() {
        let req = Request {
            id: 3,
            method: "add".to_string(),
            params: vec![json!(2), json!(3)],
            transfer: None,
        };
        let line = req.to_line();
        assert!(line.ends_with('\n'));
        let parsed: Request = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(parsed, req);
        // The transfer field stays off the wire when absent.
        assert!(!line.contains("transfer"));
    }

    #[test]
    fn test_terminate_signal_is_bare_string() {
        let value: Value = serde_json::from_str(terminate_line().trim()).unwrap();
        assert_eq!(value, json!(TERMINATE_METHOD_ID));
        assert!(matches!(
            ControllerMessage::from_value(value),
            Some(ControllerMessage::Terminate)
        ));
    }

    #[test]
    fn test_cleanup_request_classified_as_request() {
        let req = Request::cleanup(9);
        let value: Value = serde_json::from_str(req.to_line().trim()).unwrap();
        match ControllerMessage::from_value(value) {
            Some(ControllerMessage::Request(r)) => {
                assert_eq!(r.id, 9);
                assert_eq!(r.method, CLEANUP_METHOD_ID);
            }
            other => panic!("expected request, got {:?}", other),
        }
    }

    #[test]
    fn test_ready_signal() {
        let msg = WorkerMessage::Ready;
        assert_eq!(msg.to_value(), json!("ready"));
        assert_eq!(
            WorkerMessage::from_value(&json!("ready")),
            Some(WorkerMessage::Ready)
        );
    }

    #[test]
    fn test_result_envelope_shape() {
        let msg = WorkerMessage::Result {
            id: 1,
            result: json!(5),
            transfer: None,
        };
        assert_eq!(
            msg.to_value(),
            json!({ "id": 1, "result": 5, "error": null })
        );
        assert_eq!(WorkerMessage::from_value(&msg.to_value()), Some(msg));
    }

    #[test]
    fn test_failure_envelope_shape() {
        let msg = WorkerMessage::Failure {
            id: 2,
            error: RemoteError::new("x"),
        };
        let value = msg.to_value();
        assert_eq!(value["result"], Value::Null);
        assert_eq!(value["error"]["message"], json!("x"));
        assert_eq!(WorkerMessage::from_value(&value), Some(msg));
    }

    #[test]
    fn test_event_envelope_shape() {
        let msg = WorkerMessage::Event {
            id: 4,
            payload: json!({"progress": 0.5}),
            transfer: None,
        };
        let value = msg.to_value();
        assert_eq!(value["isEvent"], json!(true));
        assert_eq!(WorkerMessage::from_value(&value), Some(msg));
    }

    #[test]
    fn test_cleanup_ack_shapes() {
        let ok = WorkerMessage::CleanupAck { id: 7, error: None };
        assert_eq!(
            ok.to_value(),
            json!({ "id": 7, "method": CLEANUP_METHOD_ID, "error": null })
        );
        assert_eq!(WorkerMessage::from_value(&ok.to_value()), Some(ok));

        let failed = WorkerMessage::CleanupAck {
            id: 7,
            error: Some(RemoteError::new("Worker terminating")),
        };
        assert_eq!(WorkerMessage::from_value(&failed.to_value()), Some(failed));
    }

    #[test]
    fn test_remote_error_preserves_properties() {
        let err = RemoteError::new("disk full")
            .with_name("IoError")
            .with_property("code", json!("ENOSPC"))
            .with_property("path", json!("/tmp/x"));
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["name"], json!("IoError"));
        assert_eq!(value["code"], json!("ENOSPC"));

        let back: RemoteError = serde_json::from_value(value).unwrap();
        assert_eq!(back, err);
        assert_eq!(back.properties["path"], json!("/tmp/x"));
    }

    #[test]
    fn test_remote_error_defaults() {
        let back: RemoteError = serde_json::from_value(json!({"message": "m"})).unwrap();
        assert_eq!(back.name, "Error");
        assert_eq!(back.to_string(), "m");
    }

    #[test]
    fn test_transfer_reply_parts() {
        let reply = Reply::from(Transfer {
            message: json!(42),
            transfer: vec![json!("handle-1")],
        });
        let (value, transfer) = reply.into_parts();
        assert_eq!(value, json!(42));
        assert_eq!(transfer, Some(vec![json!("handle-1")]));
    }

    #[test]
    fn test_malformed_messages_rejected() {
        assert_eq!(WorkerMessage::from_value(&json!("nonsense")), None);
        assert_eq!(WorkerMessage::from_value(&json!({"noId": true})), None);
        assert_eq!(WorkerMessage::from_value(&json!(17)), None);
    }

    #[test]
    fn test_late_message_for_same_id_still_parses() {
        // Duplicate-terminal discarding happens in the handle, not the codec.
        let msg = WorkerMessage::Result {
            id: 1,
            result: json!("late"),
            transfer: None,
        };
        assert!(WorkerMessage::from_value(&msg.to_value()).is_some());
    }
}
