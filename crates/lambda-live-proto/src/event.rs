use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::envelope::Envelope;
use crate::error::ProtoError;

/// Every event that flows over the local bus or the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "properties")]
pub enum Event {
    #[serde(rename = "function.invoked")]
    FunctionInvoked(Invocation),
    #[serde(rename = "function.ack")]
    FunctionAck(FunctionAck),
    #[serde(rename = "function.success")]
    FunctionSuccess(FunctionSuccess),
    #[serde(rename = "function.error")]
    FunctionError(FunctionError),
    #[serde(rename = "function.timeout")]
    FunctionTimeout(FunctionTimeout),
    #[serde(rename = "function.build.started")]
    BuildStarted(FunctionRef),
    #[serde(rename = "function.build.success")]
    BuildSucceeded(FunctionRef),
    #[serde(rename = "function.build.failed")]
    BuildFailed(BuildFailed),
    #[serde(rename = "worker.started")]
    WorkerStarted(WorkerRef),
    #[serde(rename = "worker.stopped")]
    WorkerStopped(WorkerRef),
    #[serde(rename = "worker.exited")]
    WorkerExited(WorkerRef),
    #[serde(rename = "worker.stdout")]
    WorkerStdout(WorkerOutput),
    #[serde(rename = "file.changed")]
    FileChanged(FileChanged),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    FunctionInvoked,
    FunctionAck,
    FunctionSuccess,
    FunctionError,
    FunctionTimeout,
    BuildStarted,
    BuildSucceeded,
    BuildFailed,
    WorkerStarted,
    WorkerStopped,
    WorkerExited,
    WorkerStdout,
    FileChanged,
}

impl EventKind {
    pub const ALL: [EventKind; 13] = [
        EventKind::FunctionInvoked,
        EventKind::FunctionAck,
        EventKind::FunctionSuccess,
        EventKind::FunctionError,
        EventKind::FunctionTimeout,
        EventKind::BuildStarted,
        EventKind::BuildSucceeded,
        EventKind::BuildFailed,
        EventKind::WorkerStarted,
        EventKind::WorkerStopped,
        EventKind::WorkerExited,
        EventKind::WorkerStdout,
        EventKind::FileChanged,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::FunctionInvoked => "function.invoked",
            EventKind::FunctionAck => "function.ack",
            EventKind::FunctionSuccess => "function.success",
            EventKind::FunctionError => "function.error",
            EventKind::FunctionTimeout => "function.timeout",
            EventKind::BuildStarted => "function.build.started",
            EventKind::BuildSucceeded => "function.build.success",
            EventKind::BuildFailed => "function.build.failed",
            EventKind::WorkerStarted => "worker.started",
            EventKind::WorkerStopped => "worker.stopped",
            EventKind::WorkerExited => "worker.exited",
            EventKind::WorkerStdout => "worker.stdout",
            EventKind::FileChanged => "file.changed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ProtoError::UnknownEventType(s.to_string()))
    }
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::FunctionInvoked(_) => EventKind::FunctionInvoked,
            Event::FunctionAck(_) => EventKind::FunctionAck,
            Event::FunctionSuccess(_) => EventKind::FunctionSuccess,
            Event::FunctionError(_) => EventKind::FunctionError,
            Event::FunctionTimeout(_) => EventKind::FunctionTimeout,
            Event::BuildStarted(_) => EventKind::BuildStarted,
            Event::BuildSucceeded(_) => EventKind::BuildSucceeded,
            Event::BuildFailed(_) => EventKind::BuildFailed,
            Event::WorkerStarted(_) => EventKind::WorkerStarted,
            Event::WorkerStopped(_) => EventKind::WorkerStopped,
            Event::WorkerExited(_) => EventKind::WorkerExited,
            Event::WorkerStdout(_) => EventKind::WorkerStdout,
            Event::FileChanged(_) => EventKind::FileChanged,
        }
    }

    /// The worker this event is addressed to, if it concerns a single worker.
    pub fn worker_id(&self) -> Option<&str> {
        match self {
            Event::FunctionInvoked(e) => Some(&e.worker_id),
            Event::FunctionAck(e) => Some(&e.worker_id),
            Event::FunctionSuccess(e) => Some(&e.worker_id),
            Event::FunctionError(e) => Some(&e.worker_id),
            Event::FunctionTimeout(e) => Some(&e.worker_id),
            Event::WorkerStarted(e) | Event::WorkerStopped(e) | Event::WorkerExited(e) => {
                Some(&e.worker_id)
            }
            Event::WorkerStdout(e) => Some(&e.worker_id),
            Event::BuildStarted(_)
            | Event::BuildSucceeded(_)
            | Event::BuildFailed(_)
            | Event::FileChanged(_) => None,
        }
    }

    pub fn to_envelope(&self, source_id: &str) -> Result<Envelope, ProtoError> {
        let kind = self.kind();
        let properties = match serde_json::to_value(self)? {
            Value::Object(mut map) => match map.remove("properties") {
                Some(Value::Object(props)) => props,
                _ => return Err(ProtoError::PropertiesNotObject(kind.to_string())),
            },
            _ => return Err(ProtoError::PropertiesNotObject(kind.to_string())),
        };
        Ok(Envelope::new(kind.as_str(), source_id, properties))
    }

    pub fn from_envelope(envelope: &Envelope) -> Result<Self, ProtoError> {
        // Unknown types are reported by name.
        EventKind::from_str(&envelope.kind)?;
        let mut tagged = Map::new();
        tagged.insert("type".to_string(), Value::String(envelope.kind.clone()));
        tagged.insert(
            "properties".to_string(),
            Value::Object(envelope.properties.clone()),
        );
        Ok(serde_json::from_value(Value::Object(tagged))?)
    }
}

/// A single remote invocation forwarded to the developer machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invocation {
    pub worker_id: String,
    pub function_id: String,
    pub request_id: String,
    /// Milliseconds the remote invocation had left when it was forwarded.
    pub deadline: u64,
    #[serde(default)]
    pub event: Value,
    #[serde(default)]
    pub context: InvocationContext,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Subset of the remote invocation context the runtime API exposes as headers.
/// Unrecognised fields are preserved untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationContext {
    #[serde(
        default,
        alias = "AwsRequestID",
        skip_serializing_if = "Option::is_none"
    )]
    pub aws_request_id: Option<String>,
    #[serde(
        default,
        alias = "InvokedFunctionArn",
        skip_serializing_if = "Option::is_none"
    )]
    pub invoked_function_arn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,
    #[serde(
        default,
        alias = "ClientContext",
        skip_serializing_if = "Option::is_none"
    )]
    pub client_context: Option<Value>,
    #[serde(default, alias = "Identity", skip_serializing_if = "Option::is_none")]
    pub identity: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_group_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_stream_name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionAck {
    pub worker_id: String,
    pub function_id: String,
    #[serde(default)]
    pub request_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionSuccess {
    pub worker_id: String,
    pub function_id: String,
    pub request_id: String,
    #[serde(default)]
    pub body: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionError {
    pub worker_id: String,
    pub function_id: String,
    pub request_id: String,
    #[serde(default)]
    pub error_type: String,
    #[serde(default)]
    pub error_message: String,
    #[serde(default)]
    pub trace: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionTimeout {
    pub worker_id: String,
    pub function_id: String,
    pub request_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionRef {
    pub function_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildFailed {
    pub function_id: String,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerRef {
    pub worker_id: String,
    pub function_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerOutput {
    pub worker_id: String,
    pub function_id: String,
    #[serde(default)]
    pub request_id: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChanged {
    pub file: PathBuf,
    pub relative: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    fn invocation() -> Invocation {
        Invocation {
            worker_id: "w1".to_string(),
            function_id: "hello".to_string(),
            request_id: "r1".to_string(),
            deadline: 3000,
            event: json!({"path": "/"}),
            context: InvocationContext {
                aws_request_id: Some("r1".to_string()),
                ..InvocationContext::default()
            },
            env: HashMap::from([("TABLE".to_string(), "todos".to_string())]),
        }
    }

    #[test]
    fn invocation_envelope_uses_camel_case_properties() {
        let envelope = Event::FunctionInvoked(invocation())
            .to_envelope("src")
            .unwrap();

        assert_eq!(envelope.kind, "function.invoked");
        assert_eq!(envelope.source_id, "src");
        assert_eq!(envelope.properties["workerId"], json!("w1"));
        assert_eq!(envelope.properties["requestId"], json!("r1"));
        assert_eq!(envelope.properties["env"]["TABLE"], json!("todos"));
    }

    #[test]
    fn event_survives_envelope_conversion() {
        let event = Event::FunctionError(FunctionError {
            worker_id: "w1".to_string(),
            function_id: "hello".to_string(),
            request_id: "r1".to_string(),
            error_type: "TypeError".to_string(),
            error_message: "boom".to_string(),
            trace: vec!["at handler".to_string()],
        });
        let envelope = event.to_envelope("src").unwrap();
        assert_eq!(Event::from_envelope(&envelope).unwrap(), event);
    }

    #[test]
    fn unknown_type_is_rejected_by_name() {
        let envelope = Envelope::new("greet", "", Map::new());
        let err = Event::from_envelope(&envelope).unwrap_err();
        assert!(matches!(err, ProtoError::UnknownEventType(t) if t == "greet"));
    }

    #[test]
    fn context_accepts_go_field_names() {
        let context: InvocationContext = serde_json::from_value(json!({
            "AwsRequestID": "abc",
            "InvokedFunctionArn": "arn:aws:lambda:us-east-1:1:function:hello",
            "Identity": {"CognitoIdentityID": "", "CognitoIdentityPoolID": ""},
            "ClientContext": null
        }))
        .unwrap();

        assert_eq!(context.aws_request_id.as_deref(), Some("abc"));
        assert!(context.invoked_function_arn.is_some());
        assert!(context.identity.is_some());
    }

    #[test]
    fn context_keeps_unrecognised_fields() {
        let context: InvocationContext = serde_json::from_value(json!({
            "awsRequestId": "abc",
            "memoryLimitInMB": "128"
        }))
        .unwrap();
        assert_eq!(context.extra["memoryLimitInMB"], json!("128"));
    }

    #[rstest]
    #[case(EventKind::FunctionInvoked)]
    #[case(EventKind::BuildFailed)]
    #[case(EventKind::WorkerStdout)]
    #[case(EventKind::FileChanged)]
    fn kind_names_parse_back(#[case] kind: EventKind) {
        assert_eq!(kind.as_str().parse::<EventKind>().unwrap(), kind);
    }

    #[test]
    fn build_failed_parses_from_wire() {
        let envelope = Envelope::from_json(
            r#"{"type":"function.build.failed","properties":{"functionId":"api","errors":["go.mod not found"]}}"#,
        )
        .unwrap();
        let event = Event::from_envelope(&envelope).unwrap();
        assert_eq!(event.kind(), EventKind::BuildFailed);
        assert_eq!(event.worker_id(), None);
    }
}
