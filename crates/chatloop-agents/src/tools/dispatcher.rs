use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chatloop_common::{Error, FunctionCall, Result, ToolExecutionResult};
use chatloop_config::ToolBackendConfig;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{Value, json};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::deadline::IdleDeadline;
use super::rpc::{self, JsonRpcRequest, JsonRpcResponse};
use super::stream_protocol::{ToolStreamFrame, interpret_frame};
use super::{ToolExecutor, ToolStreamEvent, ToolStreamOutcome};
use crate::providers::ToolDefinition;
use crate::sse::SseFrameParser;

/// Idle window for tool event-streams, measured from the last received bytes.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Joins a backend namespace and a tool name. Chat-completion function names only allow
/// `[a-zA-Z0-9_-]`, so a dot is not an option.
pub const NAMESPACE_SEPARATOR: &str = "__";

/// One tool backend: a namespace plus its RPC and event-stream endpoints.
#[derive(Debug, Clone)]
pub struct ToolBackend {
    pub namespace: String,
    pub endpoint: String,
    pub stream_endpoint: String,
    pub timeout: Duration,
}

impl From<&ToolBackendConfig> for ToolBackend {
    fn from(config: &ToolBackendConfig) -> Self {
        Self {
            namespace: config.namespace.clone(),
            endpoint: config.endpoint.clone(),
            stream_endpoint: config.resolved_stream_endpoint(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }
}

/// Side-table entry for a prefixed tool name. Never sent to the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolRoute {
    pub namespace: String,
    pub original_name: String,
    pub endpoint: String,
    pub stream_endpoint: String,
    pub timeout: Duration,
    pub streaming: bool,
}

/// Routes tool calls to namespaced JSON-RPC backends.
pub struct ToolDispatcher {
    client: Client,
    backends: Vec<ToolBackend>,
    routes: Arc<RwLock<HashMap<String, ToolRoute>>>,
    idle_timeout: Duration,
    next_request_id: AtomicU64,
}

impl ToolDispatcher {
    pub fn new(backends: Vec<ToolBackend>) -> Self {
        Self {
            client: Client::new(),
            backends,
            routes: Arc::new(RwLock::new(HashMap::new())),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            next_request_id: AtomicU64::new(1),
        }
    }

    pub fn from_config(backends: &[ToolBackendConfig]) -> Self {
        Self::new(backends.iter().map(ToolBackend::from).collect())
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn backends(&self) -> &[ToolBackend] {
        &self.backends
    }

    pub fn prefixed_name(namespace: &str, tool: &str) -> String {
        format!("{namespace}{NAMESPACE_SEPARATOR}{tool}")
    }

    /// Query every backend's `tools/list` and rebuild the routing table.
    ///
    /// A backend that fails to answer is skipped with a warning so one broken backend
    /// does not hide the others.
    pub async fn list_combined_catalog(&self) -> Result<Vec<ToolDefinition>> {
        let mut definitions = Vec::new();
        let mut routes = HashMap::new();

        for backend in &self.backends {
            let result = match self
                .rpc(&backend.endpoint, backend.timeout, "tools/list", None)
                .await
            {
                Ok(result) => result,
                Err(e) => {
                    warn!(namespace = %backend.namespace, "skipping tool backend: {e}");
                    continue;
                }
            };

            let tools = rpc::parse_tool_list(&result);
            info!(
                "tool backend '{}' listed {} tool(s)",
                backend.namespace,
                tools.len()
            );

            for tool in tools {
                let prefixed = Self::prefixed_name(&backend.namespace, &tool.name);
                debug!("  -> {prefixed} (streaming: {})", tool.streaming);
                definitions.push(ToolDefinition {
                    name: prefixed.clone(),
                    description: tool.description,
                    input_schema: tool.input_schema,
                });
                routes.insert(
                    prefixed,
                    ToolRoute {
                        namespace: backend.namespace.clone(),
                        original_name: tool.name,
                        endpoint: backend.endpoint.clone(),
                        stream_endpoint: backend.stream_endpoint.clone(),
                        timeout: backend.timeout,
                        streaming: tool.streaming,
                    },
                );
            }
        }

        *self.routes.write().await = routes;
        Ok(definitions)
    }

    /// Look up a prefixed tool name, listing the catalog first if it was never loaded.
    pub async fn route(&self, name: &str) -> Option<ToolRoute> {
        {
            let routes = self.routes.read().await;
            if let Some(route) = routes.get(name) {
                return Some(route.clone());
            }
            if !routes.is_empty() || self.backends.is_empty() {
                return None;
            }
        }

        if let Err(e) = self.list_combined_catalog().await {
            warn!("failed to load tool catalog: {e}");
            return None;
        }
        self.routes.read().await.get(name).cloned()
    }

    async fn rpc(
        &self,
        endpoint: &str,
        timeout: Duration,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value> {
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(id, method, params);

        let response = self
            .client
            .post(endpoint)
            .timeout(timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Tool(format!("{method} request to {endpoint} failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Tool(format!(
                "{method} returned status {}: {body}",
                status.as_u16()
            )));
        }

        let response: JsonRpcResponse = response
            .json()
            .await
            .map_err(|e| Error::Tool(format!("invalid {method} response: {e}")))?;

        response
            .into_result()
            .map_err(|e| Error::Tool(format!("{method} failed: {e}")))
    }
}

/// Parse tool arguments, falling back to an empty object.
fn parse_arguments(call: &FunctionCall) -> Value {
    let text = call.arguments.trim();
    if text.is_empty() {
        return json!({});
    }
    match serde_json::from_str::<Value>(text) {
        Ok(value) => value,
        Err(e) => {
            warn!(
                tool = %call.name,
                "tool arguments are not valid JSON ({e}), using an empty object"
            );
            json!({})
        }
    }
}

fn fail(on_event: &mut (dyn FnMut(ToolStreamEvent) + Send), message: String) -> ToolStreamOutcome {
    warn!("streaming tool call failed: {message}");
    on_event(ToolStreamEvent::Error(message.clone()));
    ToolStreamOutcome::Failed(message)
}

#[async_trait]
impl ToolExecutor for ToolDispatcher {
    async fn definitions(&self) -> Result<Vec<ToolDefinition>> {
        self.list_combined_catalog().await
    }

    async fn supports_streaming(&self, name: &str) -> bool {
        self.route(name).await.is_some_and(|route| route.streaming)
    }

    async fn execute_single(
        &self,
        call: &FunctionCall,
        cancel: &CancellationToken,
    ) -> ToolExecutionResult {
        let Some(route) = self.route(&call.name).await else {
            return ToolExecutionResult::failure(
                &call.id,
                &call.name,
                format!("unknown tool: {}", call.name),
            );
        };

        let params = json!({
            "name": route.original_name,
            "arguments": parse_arguments(call),
        });

        let call_token = cancel.child_token();
        let outcome = tokio::select! {
            biased;
            _ = call_token.cancelled() => {
                info!(tool = %call.name, "tool call cancelled");
                return ToolExecutionResult::failure(&call.id, &call.name, "cancelled");
            }
            outcome = self.rpc(&route.endpoint, route.timeout, "tools/call", Some(params)) => outcome,
        };

        match outcome.map(rpc::call_result_text) {
            Ok(Ok(text)) => ToolExecutionResult::success(&call.id, &call.name, text),
            Ok(Err(tool_error)) => ToolExecutionResult::failure(&call.id, &call.name, tool_error),
            Err(e) => {
                warn!(tool = %call.name, "tool call failed: {e}");
                ToolExecutionResult::failure(&call.id, &call.name, e.to_string())
            }
        }
    }

    async fn execute_streaming(
        &self,
        call: &FunctionCall,
        cancel: &CancellationToken,
        on_event: &mut (dyn FnMut(ToolStreamEvent) + Send),
    ) -> ToolStreamOutcome {
        let Some(route) = self.route(&call.name).await else {
            return fail(on_event, format!("unknown tool: {}", call.name));
        };

        let body = json!({
            "tool_name": route.original_name,
            "arguments": parse_arguments(call),
        });

        let call_token = cancel.child_token();
        let mut deadline = IdleDeadline::new(self.idle_timeout);
        let idle_message = format!(
            "tool stream idle for more than {}s",
            deadline.window().as_secs_f64()
        );

        let request = self
            .client
            .post(&route.stream_endpoint)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&body)
            .send();

        let response = tokio::select! {
            biased;
            _ = call_token.cancelled() => return ToolStreamOutcome::Cancelled,
            _ = deadline.expired() => return fail(on_event, idle_message.clone()),
            response = request => response,
        };

        let response = match response {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                let status = response.status().as_u16();
                let text = response.text().await.unwrap_or_default();
                return fail(
                    on_event,
                    format!("tool stream returned status {status}: {text}"),
                );
            }
            Err(e) => return fail(on_event, format!("tool stream request failed: {e}")),
        };

        let mut bytes = response.bytes_stream();
        let mut parser = SseFrameParser::new();
        let mut started = false;
        let mut eof = false;
        deadline.reset();

        loop {
            while let Some(raw) = parser.next_frame() {
                let Some(frame) = interpret_frame(&raw) else {
                    continue;
                };

                if frame.is_terminal() {
                    // Whatever is still buffered is never read.
                    if parser.has_buffered() {
                        debug!(tool = %call.name, "discarding bytes after terminal event");
                    }
                    return match frame {
                        ToolStreamFrame::Error(message) => fail(on_event, message),
                        _ => {
                            on_event(ToolStreamEvent::Complete);
                            ToolStreamOutcome::Completed
                        }
                    };
                }

                match frame {
                    ToolStreamFrame::Start => {
                        debug!(tool = %call.name, "tool stream started");
                        started = true;
                    }
                    ToolStreamFrame::Data(text) => {
                        if !started {
                            debug!(tool = %call.name, "data before start event");
                            started = true;
                        }
                        on_event(ToolStreamEvent::Chunk(text));
                    }
                    ToolStreamFrame::End | ToolStreamFrame::Error(_) => {}
                }
            }

            if eof {
                warn!(tool = %call.name, "tool stream closed without an end event");
                on_event(ToolStreamEvent::Complete);
                return ToolStreamOutcome::Completed;
            }

            let next = tokio::select! {
                biased;
                _ = call_token.cancelled() => {
                    info!(tool = %call.name, "streaming tool call cancelled");
                    return ToolStreamOutcome::Cancelled;
                }
                _ = deadline.expired() => return fail(on_event, idle_message.clone()),
                next = bytes.next() => next,
            };

            match next {
                Some(Ok(chunk)) => {
                    deadline.reset();
                    parser.push(&chunk);
                }
                Some(Err(e)) => return fail(on_event, format!("tool stream error: {e}")),
                None => {
                    parser.close();
                    eof = true;
                }
            }
        }
    }
}
