//! Push connection over the inference server's WebSocket using tokio-tungstenite

use std::sync::atomic::AtomicU8;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use comfyrelay_domain::ServerUrl;
use comfyrelay_shared::parse_push_frame;

use super::connection::{set_connection_state, ConnectionEvent, ConnectionHandle, ConnectionState};
use super::ports::{ConnectError, PushConnector};

/// Opens `ws(s)://{server}/ws?clientId=...` connections.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    connect_timeout: Duration,
}

impl WebSocketConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl PushConnector for WebSocketConnector {
    async fn connect(
        &self,
        server: &ServerUrl,
        client_id: &str,
        connection_id: u64,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<ConnectionHandle, ConnectError> {
        let url = server.push_url(client_id);
        let state = Arc::new(AtomicU8::new(ConnectionState::Connecting.to_u8()));

        let ws_stream = match tokio::time::timeout(self.connect_timeout, connect_async(url.as_str())).await {
            Ok(Ok((ws_stream, _))) => ws_stream,
            Ok(Err(e)) => {
                set_connection_state(&state, ConnectionState::Failed);
                return Err(ConnectError::Failed {
                    url,
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                set_connection_state(&state, ConnectionState::Failed);
                return Err(ConnectError::Timeout { url });
            }
        };

        tracing::info!("Push connection #{} open to {}", connection_id, server);
        set_connection_state(&state, ConnectionState::Connected);

        let (mut write, mut read) = ws_stream.split();
        let (disconnect_tx, mut disconnect_rx) = oneshot::channel::<()>();
        let reader_state = Arc::clone(&state);
        let reader_server = server.clone();

        tokio::spawn(async move {
            let unexpected = loop {
                tokio::select! {
                    _ = &mut disconnect_rx => {
                        if let Err(e) = write.send(Message::Close(None)).await {
                            tracing::debug!("Close frame not sent to {}: {}", reader_server, e);
                        }
                        break false;
                    }
                    msg = read.next() => match msg {
                        Some(Ok(Message::Text(text))) => match parse_push_frame(&text) {
                            Ok(frame) => {
                                if events.send(ConnectionEvent::Frame { connection_id, frame }).is_err() {
                                    // Coordinator is gone
                                    break false;
                                }
                            }
                            Err(e) => {
                                tracing::warn!("Dropping malformed push frame from {}: {}", reader_server, e);
                            }
                        },
                        // Binary frames carry live previews
                        Some(Ok(Message::Binary(_))) => {}
                        Some(Ok(Message::Close(_))) => {
                            tracing::info!("Server {} closed push connection #{}", reader_server, connection_id);
                            break true;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            tracing::error!("Push connection #{} error: {}", connection_id, e);
                            break true;
                        }
                        None => break true,
                    }
                }
            };

            set_connection_state(&reader_state, ConnectionState::Disconnected);
            let _ = events.send(ConnectionEvent::Closed {
                connection_id,
                server: reader_server,
                unexpected,
            });
        });

        Ok(ConnectionHandle::new(
            connection_id,
            server.clone(),
            state,
            disconnect_tx,
        ))
    }
}
