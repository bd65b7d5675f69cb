use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use tracing::debug;

use weft_core::error::{Result, WeftError};
use weft_core::types::{ExecutionOutcome, ExecutorBinding, NodeContext, StreamChunk};

use crate::broker::Completion;
use crate::transport::{ChunkStream, Transport, TransportRequest};

/// Remote executors reached over HTTP.
///
/// Binding config keys: `url` (required), `tenant_id`, `credential`
/// (sent as a bearer token) and `timeout_ms`.
pub struct RestTransport {
    http: Client,
}

impl RestTransport {
    pub fn new() -> Self {
        Self {
            http: Client::new(),
        }
    }

    pub fn with_client(http: Client) -> Self {
        Self { http }
    }

    fn build(
        &self,
        request: &TransportRequest,
        correlation_id: Option<&str>,
    ) -> Result<reqwest::RequestBuilder> {
        let binding = &request.binding;
        let url = binding.config_str("url").ok_or_else(|| {
            WeftError::validation(format!(
                "REST executor '{}' has no url in its binding config",
                binding.executor_id
            ))
        })?;

        let body = RestBody {
            context: &request.context,
            correlation_id,
        };
        let mut req = self.http.post(url).json(&body);

        if let Some(tenant) = binding.config_str("tenant_id") {
            req = req.header("X-Tenant-Id", tenant);
        }
        if let Some(credential) = binding.config_str("credential") {
            req = req.header("Authorization", format!("Bearer {}", credential));
        }
        if let Some(ms) = binding.config_u64("timeout_ms") {
            req = req.timeout(Duration::from_millis(ms));
        }
        if let Some(id) = correlation_id {
            req = req.header("X-Correlation-Id", id);
        }
        Ok(req)
    }

    async fn send(
        &self,
        request: &TransportRequest,
        correlation_id: Option<&str>,
    ) -> Result<reqwest::Response> {
        let executor = request.executor_id();
        let response = self
            .build(request, correlation_id)?
            .send()
            .await
            .map_err(|e| classify_send_error(&request.binding, e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown".to_string());
        let message = format!("HTTP {}: {}", status, body);
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            Err(WeftError::unavailable(executor, message))
        } else {
            Err(WeftError::execution(executor, message))
        }
    }
}

impl Default for RestTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Serialize)]
struct RestBody<'a> {
    #[serde(flatten)]
    context: &'a NodeContext,
    #[serde(skip_serializing_if = "Option::is_none")]
    correlation_id: Option<&'a str>,
}

fn classify_send_error(binding: &ExecutorBinding, e: reqwest::Error) -> WeftError {
    if e.is_timeout() {
        WeftError::Timeout {
            executor: binding.executor_id.clone(),
            timeout_ms: binding.config_u64("timeout_ms").unwrap_or_default(),
            retryable: true,
        }
    } else {
        WeftError::unavailable(&binding.executor_id, e.to_string())
    }
}

/// Interpret a response body. A tagged outcome (`{"type": "completed", ...}`
/// or `{"type": "suspend", ...}`) is taken as is; any other body is the output.
pub fn parse_outcome(body: serde_json::Value) -> ExecutionOutcome {
    let tagged = body
        .get("type")
        .and_then(|t| t.as_str())
        .map(|t| t == "completed" || t == "suspend")
        .unwrap_or(false);
    if tagged {
        if let Ok(outcome) = serde_json::from_value::<ExecutionOutcome>(body.clone()) {
            return outcome;
        }
    }
    ExecutionOutcome::completed(body)
}

impl Transport for RestTransport {
    fn name(&self) -> &str {
        "rest"
    }

    fn is_available(&self, binding: &ExecutorBinding) -> bool {
        binding.config_str("url").is_some()
    }

    fn call(&self, request: TransportRequest) -> BoxFuture<'_, Result<ExecutionOutcome>> {
        Box::pin(async move {
            let response = self.send(&request, None).await?;
            let body: serde_json::Value = response.json().await.map_err(|e| {
                WeftError::execution(request.executor_id(), format!("invalid response body: {}", e))
            })?;
            Ok(parse_outcome(body))
        })
    }

    // No streaming wire format is defined for REST; the response is
    // surfaced as a single final chunk.
    fn open_stream(&self, request: TransportRequest) -> BoxFuture<'_, Result<ChunkStream>> {
        Box::pin(async move {
            let node = request.context.node_id.clone();
            let chunk = match self.call(request).await? {
                ExecutionOutcome::Completed { output } => StreamChunk::Final(output),
                ExecutionOutcome::Suspend { .. } => {
                    return Err(WeftError::validation(format!(
                        "node {} cannot suspend from a stream",
                        node
                    )))
                }
            };
            Ok(stream::once(async move { Ok(chunk) }).boxed())
        })
    }

    fn submit(
        &self,
        request: TransportRequest,
        completion: Completion,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.send(&request, Some(completion.id())).await?;
            debug!(
                executor = %request.executor_id(),
                correlation_id = %completion.id(),
                "Async execution accepted by remote executor"
            );
            Ok(())
        })
    }
}
