#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use futures::StreamExt;
use polymcp::error::{ErrorData, codes};
use polymcp::model::{
    CallToolResult, Content, CreateElicitationRequestParam, CreateMessageRequestParam,
    GetPromptResult, JsonObject, LoggingLevel, Prompt, PromptMessage, ReadResourceResult,
    Resource, ResourceContents, Role, SamplingMessage, Tool,
};
use polymcp::server::McpServerBuilder;
use polymcp::{McpServer, Registry, RunningServer, ServerConfig};
use serde_json::{Value, json};

pub fn test_config() -> ServerConfig {
    init_tracing();
    ServerConfig::new("test-server", "0.1.0").heartbeat_interval(Duration::from_millis(100))
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

pub fn object_schema(schema: Value) -> JsonObject {
    schema.as_object().cloned().unwrap_or_default()
}

#[derive(schemars::JsonSchema)]
struct EchoArgs {
    /// Text to echo back.
    message: String,
}

fn echo_schema() -> JsonObject {
    serde_json::to_value(schemars::schema_for!(EchoArgs))
        .ok()
        .and_then(|value| value.as_object().cloned())
        .unwrap_or_default()
}

fn open_schema() -> JsonObject {
    object_schema(json!({ "type": "object" }))
}

/// The registry every integration suite serves: an echo tool plus tools
/// exercising sampling, elicitation, cancellation, progress, user context
/// and failure containment, one resource and one prompt.
pub fn fixture_registry() -> Registry {
    Registry::builder()
        .tool(
            Tool::new("echo", "Echo a message", echo_schema()),
            |_ctx, args| async move {
                let message = args
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                Ok(CallToolResult::success(vec![Content::text(format!(
                    "Echo: {message}"
                ))]))
            },
        )
        .tool(
            Tool::new("sampler", "Ask the client for a completion", open_schema()),
            |ctx, _args| async move {
                let params = CreateMessageRequestParam {
                    messages: vec![SamplingMessage {
                        role: Role::User,
                        content: Content::text("say hi"),
                    }],
                    model_preferences: None,
                    system_prompt: None,
                    temperature: None,
                    max_tokens: 16,
                    stop_sequences: None,
                };
                match ctx.sample(params).await {
                    Ok(result) => Ok(CallToolResult::success(vec![Content::text(format!(
                        "sampled: {}",
                        result.content.as_text().unwrap_or_default()
                    ))])),
                    Err(e) if e.code == codes::CAPABILITY_UNAVAILABLE => Ok(
                        CallToolResult::success(vec![Content::text("sampling unavailable")]),
                    ),
                    Err(e) => Err(e),
                }
            },
        )
        .tool(
            Tool::new("asker", "Ask the user to confirm", open_schema()),
            |ctx, _args| async move {
                let params = CreateElicitationRequestParam {
                    message: "continue?".to_string(),
                    requested_schema: object_schema(json!({
                        "type": "object",
                        "properties": { "confirmation": { "type": "boolean" } }
                    })),
                };
                match ctx.elicit(params).await {
                    Ok(result) => {
                        let action = serde_json::to_string(&result.action).unwrap_or_default();
                        Ok(CallToolResult::success(vec![Content::text(format!(
                            "action: {action}"
                        ))]))
                    }
                    Err(e) if e.code == codes::CAPABILITY_UNAVAILABLE => Ok(
                        CallToolResult::success(vec![Content::text("elicitation unavailable")]),
                    ),
                    Err(e) => Err(e),
                }
            },
        )
        .tool(
            Tool::new("rooter", "List the client's roots", open_schema()),
            |ctx, _args| async move {
                match ctx.list_roots().await {
                    Ok(result) => {
                        let uris: Vec<&str> =
                            result.roots.iter().map(|root| root.uri.as_str()).collect();
                        Ok(CallToolResult::success(vec![Content::text(format!(
                            "roots: {}",
                            uris.join(",")
                        ))]))
                    }
                    Err(e) if e.code == codes::CAPABILITY_UNAVAILABLE => {
                        Ok(CallToolResult::success(vec![Content::text(
                            "roots unavailable",
                        )]))
                    }
                    Err(e) => Err(e),
                }
            },
        )
        .tool(
            Tool::new("waiter", "Wait until cancelled", open_schema()),
            |ctx, _args| async move {
                for _ in 0..500 {
                    if ctx.is_cancelled() {
                        return Err(ErrorData::request_cancelled(None));
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                Ok(CallToolResult::success(vec![Content::text("done")]))
            },
        )
        .tool(
            Tool::new("stepper", "Report progress and log", open_schema()),
            |ctx, _args| async move {
                ctx.report_progress(0.5, Some(1.0)).await?;
                ctx.log(LoggingLevel::Info, json!({"step": "halfway"}), None)
                    .await?;
                Ok(CallToolResult::success(vec![Content::text("progressed")]))
            },
        )
        .tool(
            Tool::new("whoami", "Report the authenticated principal", open_schema()),
            |ctx, _args| async move {
                let who = ctx
                    .user_context("principal")
                    .await?
                    .and_then(|value| value.as_str().map(str::to_string))
                    .unwrap_or_else(|| "anonymous".to_string());
                Ok(CallToolResult::success(vec![Content::text(who)]))
            },
        )
        .tool(
            Tool::new("boom", "Panic inside the handler", open_schema()),
            |_ctx, _args| async move { panic!("boom") },
        )
        .resource(
            Resource {
                uri: "memo://greeting".to_string(),
                name: "greeting".to_string(),
                description: None,
                mime_type: Some("text/plain".to_string()),
            },
            |_ctx, uri| async move {
                Ok(ReadResourceResult {
                    contents: vec![ResourceContents::text(uri, "hello from resource")],
                })
            },
        )
        .prompt(
            Prompt {
                name: "greet".to_string(),
                description: Some("A greeting prompt".to_string()),
                arguments: None,
            },
            |_ctx, _args| async move {
                Ok(GetPromptResult {
                    description: None,
                    messages: vec![PromptMessage::user_text("Say hello")],
                })
            },
        )
        .build()
        .expect("fixture registry builds")
}

pub struct TestServer {
    pub server: McpServer,
    pub running: RunningServer,
    pub base: String,
}

pub async fn spawn(config: ServerConfig) -> TestServer {
    spawn_with(config, fixture_registry(), |builder| builder).await
}

pub async fn spawn_with(
    config: ServerConfig,
    registry: Registry,
    customize: impl FnOnce(McpServerBuilder) -> McpServerBuilder,
) -> TestServer {
    let mount = config.mount_path.clone();
    let builder = McpServer::builder(config).registry(registry);
    let server = customize(builder).build();
    let running = server
        .clone()
        .serve(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .expect("bind test server");
    let base = format!("http://{}{}", running.local_addr(), mount);
    TestServer {
        server,
        running,
        base,
    }
}

pub struct TestClient {
    pub http: reqwest::Client,
    pub base: String,
    pub session: Option<String>,
}

impl TestClient {
    pub fn new(base: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: base.to_string(),
            session: None,
        }
    }

    pub async fn post(&self, body: Value) -> reqwest::Response {
        let mut request = self
            .http
            .post(&self.base)
            .header("content-type", "application/json")
            .header("accept", "application/json, text/event-stream");
        if let Some(session) = &self.session {
            request = request.header("Mcp-Session-Id", session);
        }
        request
            .body(body.to_string())
            .send()
            .await
            .expect("POST succeeds")
    }

    pub fn initialize_body(capabilities: Value) -> Value {
        json!({
            "jsonrpc": "2.0",
            "method": "initialize",
            "id": 1,
            "params": {
                "protocolVersion": "2025-11-25",
                "clientInfo": { "name": "t", "version": "1" },
                "capabilities": capabilities,
            }
        })
    }

    /// Full handshake: initialize, capture the session header, send the
    /// `initialized` notification. Returns the initialize response body.
    pub async fn initialize(&mut self) -> Value {
        self.initialize_with_capabilities(json!({})).await
    }

    pub async fn initialize_with_capabilities(&mut self, capabilities: Value) -> Value {
        let response = self.post(Self::initialize_body(capabilities)).await;
        assert_eq!(response.status(), 200);
        let session = response
            .headers()
            .get("Mcp-Session-Id")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .expect("session header on initialize");
        self.session = Some(session);
        let body: Value = response.json().await.expect("initialize body");
        let initialized = self
            .post(json!({
                "jsonrpc": "2.0",
                "method": "notifications/initialized",
            }))
            .await;
        assert_eq!(initialized.status(), 202);
        body
    }

    /// POST a request frame and return the JSON-RPC body.
    pub async fn request(&self, id: i64, method: &str, params: Value) -> Value {
        let response = self
            .post(json!({
                "jsonrpc": "2.0",
                "id": id,
                "method": method,
                "params": params,
            }))
            .await;
        assert_eq!(response.status(), 200);
        response.json().await.expect("response body")
    }

    pub async fn notify(&self, method: &str, params: Value) -> reqwest::Response {
        self.post(json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        }))
        .await
    }

    /// POST a response frame answering a server-initiated request.
    pub async fn respond(&self, id: Value, result: Value) -> reqwest::Response {
        self.post(json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": result,
        }))
        .await
    }

    pub async fn open_stream(&self, last_event_id: Option<u64>) -> reqwest::Response {
        let mut request = self
            .http
            .get(&self.base)
            .header("accept", "text/event-stream");
        if let Some(session) = &self.session {
            request = request.header("Mcp-Session-Id", session);
        }
        if let Some(last) = last_event_id {
            request = request.header("Last-Event-ID", last.to_string());
        }
        request.send().await.expect("GET succeeds")
    }

    pub async fn delete(&self) -> reqwest::Response {
        let mut request = self.http.delete(&self.base);
        if let Some(session) = &self.session {
            request = request.header("Mcp-Session-Id", session);
        }
        request.send().await.expect("DELETE succeeds")
    }
}

#[derive(Debug, Clone)]
pub struct SseEvent {
    pub id: Option<u64>,
    pub data: Value,
}

/// Incremental SSE frame reader over a streaming response body. Comment
/// frames (heartbeats) are skipped.
pub struct SseReader {
    stream: std::pin::Pin<Box<dyn futures::Stream<Item = reqwest::Result<bytes::Bytes>> + Send>>,
    buffer: String,
}

impl SseReader {
    pub fn new(response: reqwest::Response) -> Self {
        assert!(
            response
                .headers()
                .get("content-type")
                .and_then(|value| value.to_str().ok())
                .is_some_and(|value| value.contains("text/event-stream")),
            "expected an SSE response"
        );
        Self {
            stream: Box::pin(response.bytes_stream()),
            buffer: String::new(),
        }
    }

    pub async fn next_event(&mut self) -> Option<SseEvent> {
        loop {
            if let Some(pos) = self.buffer.find("\n\n") {
                let frame: String = self.buffer.drain(..pos + 2).collect();
                if let Some(event) = Self::parse_frame(&frame) {
                    return Some(event);
                }
                continue;
            }
            let chunk = self.stream.next().await?.ok()?;
            self.buffer.push_str(&String::from_utf8_lossy(&chunk));
        }
    }

    /// Next event within the deadline, panicking on silence.
    pub async fn expect_event(&mut self, deadline: Duration) -> SseEvent {
        tokio::time::timeout(deadline, self.next_event())
            .await
            .expect("event before deadline")
            .expect("stream still open")
    }

    fn parse_frame(frame: &str) -> Option<SseEvent> {
        let mut id = None;
        let mut data_lines = Vec::new();
        for line in frame.lines() {
            if let Some(rest) = line.strip_prefix("id:") {
                id = rest.trim().parse().ok();
            } else if let Some(rest) = line.strip_prefix("data:") {
                data_lines.push(rest.trim_start());
            }
        }
        if data_lines.is_empty() {
            return None;
        }
        let data = serde_json::from_str(&data_lines.join("")).ok()?;
        Some(SseEvent { id, data })
    }
}
