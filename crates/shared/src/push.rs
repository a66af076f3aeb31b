//! Push frames streamed by an inference server over its WebSocket.
//!
//! Every text frame is `{"type": <kind>, "data": {...}}`. Parsing is two-step
//! (envelope first, then the typed payload for known kinds) so that new kinds
//! added by the server land in [`PushFrame::Unknown`] instead of failing.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use comfyrelay_domain::ArtifactRef;

use crate::ProtocolError;

/// Per-node execution state reported in `progress_state` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Pending,
    Running,
    Finished,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NodeProgress {
    pub state: NodeState,
    #[serde(default)]
    pub value: u32,
    #[serde(default)]
    pub max: u32,
}

/// Decoded push frame.
#[derive(Debug, Clone, PartialEq)]
pub enum PushFrame {
    /// Global queue status. Not tied to a job.
    Status { queue_remaining: Option<u32> },
    ExecutionStart { prompt_id: String },
    /// Nodes whose outputs were reused from cache (count as completed).
    ExecutionCached { prompt_id: String, nodes: Vec<String> },
    /// `node: None` is the server's legacy "job finished" marker.
    Executing {
        prompt_id: String,
        node: Option<String>,
    },
    /// Step progress of the currently running node.
    Progress {
        prompt_id: String,
        node: Option<String>,
        value: u32,
        max: u32,
    },
    /// Completion flags for every node of the job.
    ProgressState {
        prompt_id: String,
        nodes: HashMap<String, NodeProgress>,
    },
    /// Outputs of one node are available.
    ///
    /// Workflows are assumed to have a single output node: the first
    /// `executed` frame completes the task and later ones are dropped.
    Executed {
        prompt_id: String,
        node: String,
        artifacts: Vec<ArtifactRef>,
    },
    ExecutionSuccess { prompt_id: String },
    ExecutionError {
        prompt_id: String,
        message: String,
        node_id: Option<String>,
        node_type: Option<String>,
    },
    ExecutionInterrupted {
        prompt_id: String,
        node_id: Option<String>,
    },
    /// Forward-compatibility fallback for kinds this client does not know.
    Unknown { kind: String },
}

impl PushFrame {
    /// Correlation id, if the frame belongs to a job.
    pub fn prompt_id(&self) -> Option<&str> {
        match self {
            PushFrame::Status { .. } | PushFrame::Unknown { .. } => None,
            PushFrame::ExecutionStart { prompt_id }
            | PushFrame::ExecutionCached { prompt_id, .. }
            | PushFrame::Executing { prompt_id, .. }
            | PushFrame::Progress { prompt_id, .. }
            | PushFrame::ProgressState { prompt_id, .. }
            | PushFrame::Executed { prompt_id, .. }
            | PushFrame::ExecutionSuccess { prompt_id }
            | PushFrame::ExecutionError { prompt_id, .. }
            | PushFrame::ExecutionInterrupted { prompt_id, .. } => Some(prompt_id),
        }
    }

    /// Short kind name for logging.
    pub fn kind(&self) -> &str {
        match self {
            PushFrame::Status { .. } => "status",
            PushFrame::ExecutionStart { .. } => "execution_start",
            PushFrame::ExecutionCached { .. } => "execution_cached",
            PushFrame::Executing { .. } => "executing",
            PushFrame::Progress { .. } => "progress",
            PushFrame::ProgressState { .. } => "progress_state",
            PushFrame::Executed { .. } => "executed",
            PushFrame::ExecutionSuccess { .. } => "execution_success",
            PushFrame::ExecutionError { .. } => "execution_error",
            PushFrame::ExecutionInterrupted { .. } => "execution_interrupted",
            PushFrame::Unknown { kind } => kind,
        }
    }
}

// =============================================================================
// Raw payloads
// =============================================================================

#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
struct StatusData {
    #[serde(default)]
    status: Option<StatusInner>,
}

#[derive(Debug, Deserialize)]
struct StatusInner {
    #[serde(default)]
    exec_info: Option<ExecInfo>,
}

#[derive(Debug, Deserialize)]
struct ExecInfo {
    #[serde(default)]
    queue_remaining: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct PromptOnly {
    prompt_id: String,
}

#[derive(Debug, Deserialize)]
struct CachedData {
    prompt_id: String,
    #[serde(default)]
    nodes: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ExecutingData {
    prompt_id: String,
    #[serde(default)]
    node: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProgressData {
    prompt_id: String,
    #[serde(default)]
    node: Option<String>,
    value: u32,
    max: u32,
}

#[derive(Debug, Deserialize)]
struct ProgressStateData {
    prompt_id: String,
    #[serde(default)]
    nodes: HashMap<String, NodeProgress>,
}

#[derive(Debug, Deserialize)]
struct ExecutedData {
    prompt_id: String,
    node: String,
    #[serde(default)]
    output: HashMap<String, Value>,
}

#[derive(Debug, Deserialize)]
struct ErrorData {
    prompt_id: String,
    #[serde(default)]
    exception_message: Option<String>,
    #[serde(default)]
    exception_type: Option<String>,
    #[serde(default)]
    node_id: Option<String>,
    #[serde(default)]
    node_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InterruptedData {
    prompt_id: String,
    #[serde(default)]
    node_id: Option<String>,
}

fn payload<T: DeserializeOwned>(kind: &str, data: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(data).map_err(|source| ProtocolError::InvalidFrame {
        kind: kind.to_string(),
        source,
    })
}

/// Collect every file-like entry from a node's output map.
///
/// Image nodes report under `images`, video nodes under `gifs`/`videos`; any
/// array of objects carrying a `filename` counts.
fn collect_artifacts(output: HashMap<String, Value>) -> Vec<ArtifactRef> {
    let mut entries: Vec<(String, Value)> = output.into_iter().collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    entries
        .into_iter()
        .filter_map(|(_, value)| match value {
            Value::Array(items) => Some(items),
            _ => None,
        })
        .flatten()
        .filter_map(|item| serde_json::from_value::<ArtifactRef>(item).ok())
        .collect()
}

/// Decode one text frame.
pub fn parse_push_frame(text: &str) -> Result<PushFrame, ProtocolError> {
    let raw: RawFrame = serde_json::from_str(text)?;
    let kind = raw.kind.as_str();

    let frame = match kind {
        "status" => {
            let data: StatusData = payload(kind, raw.data)?;
            PushFrame::Status {
                queue_remaining: data
                    .status
                    .and_then(|s| s.exec_info)
                    .and_then(|e| e.queue_remaining),
            }
        }
        "execution_start" => {
            let data: PromptOnly = payload(kind, raw.data)?;
            PushFrame::ExecutionStart {
                prompt_id: data.prompt_id,
            }
        }
        "execution_cached" => {
            let data: CachedData = payload(kind, raw.data)?;
            PushFrame::ExecutionCached {
                prompt_id: data.prompt_id,
                nodes: data.nodes,
            }
        }
        "executing" => {
            let data: ExecutingData = payload(kind, raw.data)?;
            PushFrame::Executing {
                prompt_id: data.prompt_id,
                node: data.node,
            }
        }
        "progress" => {
            let data: ProgressData = payload(kind, raw.data)?;
            PushFrame::Progress {
                prompt_id: data.prompt_id,
                node: data.node,
                value: data.value,
                max: data.max,
            }
        }
        "progress_state" => {
            let data: ProgressStateData = payload(kind, raw.data)?;
            PushFrame::ProgressState {
                prompt_id: data.prompt_id,
                nodes: data.nodes,
            }
        }
        "executed" => {
            let data: ExecutedData = payload(kind, raw.data)?;
            PushFrame::Executed {
                prompt_id: data.prompt_id,
                node: data.node,
                artifacts: collect_artifacts(data.output),
            }
        }
        "execution_success" => {
            let data: PromptOnly = payload(kind, raw.data)?;
            PushFrame::ExecutionSuccess {
                prompt_id: data.prompt_id,
            }
        }
        "execution_error" => {
            let data: ErrorData = payload(kind, raw.data)?;
            let message = match (data.exception_type, data.exception_message) {
                (_, Some(msg)) if !msg.trim().is_empty() => msg.trim().to_string(),
                (Some(ty), _) => ty,
                _ => "execution failed".to_string(),
            };
            PushFrame::ExecutionError {
                prompt_id: data.prompt_id,
                message,
                node_id: data.node_id,
                node_type: data.node_type,
            }
        }
        "execution_interrupted" => {
            let data: InterruptedData = payload(kind, raw.data)?;
            PushFrame::ExecutionInterrupted {
                prompt_id: data.prompt_id,
                node_id: data.node_id,
            }
        }
        other => {
            tracing::trace!(kind = other, "Unrecognized push frame kind");
            PushFrame::Unknown {
                kind: other.to_string(),
            }
        }
    };

    Ok(frame)
}
