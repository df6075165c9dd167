use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Severity carried by procedure results. A peer reports application level
/// problems through this payload, not through a JSON-RPC error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageType {
    Ok,
    Warning,
    Error,
}

/// `{ "type": "OK" | "WARNING" | "ERROR", "content": ... }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct MessageResult {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
}

impl MessageResult {
    pub fn ok(content: Option<Value>) -> Self {
        Self { kind: MessageType::Ok, content }
    }

    pub fn warning(content: impl Into<Value>) -> Self {
        Self { kind: MessageType::Warning, content: Some(content.into()) }
    }

    pub fn error(content: impl Into<Value>) -> Self {
        Self { kind: MessageType::Error, content: Some(content.into()) }
    }

    pub fn is_ok(&self) -> bool {
        self.kind == MessageType::Ok
    }

    /// Human readable rendering of `content` for notifications.
    pub fn describe(&self) -> Option<String> {
        match &self.content {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) => Some(other.to_string()),
        }
    }
}

/// Answer to `app_capabilities_get`. Unknown fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AppCapabilities {
    #[serde(default)]
    pub stoppable_methods: Vec<String>,
    #[serde(default)]
    pub interactive_mode: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify_on_change: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ConnectionStatus {
    pub connected: bool,
}

/// Answer to `status_get`, in both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StatusResult {
    pub status: ConnectionStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DataflowParams {
    pub dataflow: Value,
}

/// Params of `custom_procedure`: the dataflow plus the name the editor used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CustomProcedureParams {
    pub procedure_name: String,
    pub dataflow: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StopParams {
    pub method: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ImportParams {
    pub external_application_dataflow: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
    #[serde(default)]
    pub base64: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SpecificationChangeParams {
    pub specification: Value,
}

/// `progress` is a percentage, `-1` means indeterminate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ProgressChangeParams {
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RunFinishedParams {
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<MessageResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct NotificationSendParams {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}
