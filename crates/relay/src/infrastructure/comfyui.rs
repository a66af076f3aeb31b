//! ComfyUI HTTP client
//!
//! Implements [`InferenceServerPort`] against ComfyUI's API. The client is not
//! bound to one server: every call names the server it targets, so tasks can
//! keep talking to the server they were submitted to after the lock moves.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use comfyrelay_domain::{ProbeOutcome, ServerUrl, UnhealthyReason};
use comfyrelay_shared::{PromptErrorResponse, QueuePromptRequest, QueuePromptResponse};

use super::ports::{InferenceServerPort, SubmitError};

/// Client for the ComfyUI API
#[derive(Clone)]
pub struct ComfyUIClient {
    client: Client,
}

impl ComfyUIClient {
    pub fn new(request_timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .unwrap_or_else(|_| Client::new());

        Self { client }
    }
}

fn transport_error(e: reqwest::Error) -> SubmitError {
    if e.is_timeout() {
        SubmitError::Timeout
    } else {
        SubmitError::Transport(e.to_string())
    }
}

#[async_trait]
impl InferenceServerPort for ComfyUIClient {
    async fn check_status(&self, server: &ServerUrl, timeout: Duration) -> ProbeOutcome {
        let result = self
            .client
            .get(server.endpoint("system_stats"))
            .timeout(timeout)
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => ProbeOutcome::Healthy,
            Ok(response) => {
                ProbeOutcome::Unhealthy(UnhealthyReason::Http(response.status().as_u16()))
            }
            Err(e) if e.is_timeout() => ProbeOutcome::Unhealthy(UnhealthyReason::Timeout),
            Err(e) => {
                tracing::debug!("Status check against {} failed: {}", server, e);
                ProbeOutcome::Unhealthy(UnhealthyReason::ConnectionError)
            }
        }
    }

    async fn queue_prompt(
        &self,
        server: &ServerUrl,
        request: QueuePromptRequest,
    ) -> Result<QueuePromptResponse, SubmitError> {
        let response = self
            .client
            .post(server.endpoint("prompt"))
            .json(&request)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            let reason = serde_json::from_str::<PromptErrorResponse>(&body)
                .map(|e| e.summary())
                .unwrap_or(body);
            return Err(SubmitError::Rejected(reason));
        }
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(SubmitError::Http {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json()
            .await
            .map_err(|e| SubmitError::InvalidResponse(e.to_string()))
    }

    async fn fetch_artifact(&self, url: &str) -> Result<Vec<u8>, SubmitError> {
        let response = self.client.get(url).send().await.map_err(transport_error)?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(SubmitError::Http { status, body });
        }

        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(transport_error)
    }
}
