//! ComfyRelay Shared - wire types
//!
//! This crate contains every type that crosses a process boundary:
//! - HTTP bodies of the inference server API
//! - Push frames streamed over the server's WebSocket
//! - Window-to-window broadcast messages
//!
//! # Design Principles
//!
//! 1. **Minimal dependencies** - serde, serde_json, uuid, thiserror, tracing
//! 2. **No business logic** - pure data types and decoding
//! 3. **Forward compatible** - unknown kinds decode to an `Unknown` variant

pub mod api;
pub mod broadcast;
pub mod error;
pub mod push;

pub use api::{PromptErrorDetail, PromptErrorResponse, QueuePromptRequest, QueuePromptResponse};
pub use broadcast::WindowMessage;
pub use error::ProtocolError;
pub use push::{parse_push_frame, NodeProgress, NodeState, PushFrame};
