use thiserror::Error;

/// Wire decoding failures.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Invalid '{kind}' frame: {source}")]
    InvalidFrame {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}
