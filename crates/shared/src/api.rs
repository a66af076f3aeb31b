//! HTTP request/response bodies of the inference server API.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Body of `POST /prompt`.
#[derive(Debug, Clone, Serialize)]
pub struct QueuePromptRequest {
    /// The workflow graph, passed through untouched.
    pub prompt: Value,
    /// Push-connection client id; frames for this job are routed to it.
    pub client_id: String,
    /// Caller-chosen correlation id. Servers that ignore it return their own.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_id: Option<String>,
}

/// Successful `POST /prompt` response.
#[derive(Debug, Clone, Deserialize)]
pub struct QueuePromptResponse {
    pub prompt_id: String,
    #[serde(default)]
    pub number: Option<u64>,
    #[serde(default)]
    pub node_errors: Option<Value>,
}

/// Error body returned with a 4xx from `POST /prompt`.
#[derive(Debug, Clone, Deserialize)]
pub struct PromptErrorResponse {
    pub error: PromptErrorDetail,
    #[serde(default)]
    pub node_errors: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PromptErrorDetail {
    #[serde(rename = "type", default)]
    pub error_type: String,
    #[serde(default)]
    pub message: String,
}

impl PromptErrorResponse {
    /// One-line summary for logs and error messages.
    pub fn summary(&self) -> String {
        if self.error.message.is_empty() {
            self.error.error_type.clone()
        } else {
            format!("{}: {}", self.error.error_type, self.error.message)
        }
    }
}
