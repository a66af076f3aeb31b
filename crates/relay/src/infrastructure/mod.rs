//! Infrastructure layer - ports and the adapters behind them

pub mod broadcast;
pub mod clock;
pub mod comfyui;
pub mod connection;
pub mod ports;
pub mod websocket;

pub use broadcast::{LocalBroadcast, NoopBroadcast};
pub use clock::SystemClock;
pub use comfyui::ComfyUIClient;
pub use connection::{ConnectionEvent, ConnectionHandle, ConnectionState};
pub use ports::{BroadcastPort, ClockPort, ConnectError, InferenceServerPort, PushConnector, SubmitError};
pub use websocket::WebSocketConnector;
