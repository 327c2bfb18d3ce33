use crate::tools::{self, Dispatcher};
use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub const PROTOCOL_VERSION: &str = "2024-11-05";

const PARSE_ERROR: i64 = -32700;
const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;
const INTERNAL_ERROR: i64 = -32603;

#[derive(Serialize, Deserialize, Debug)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    pub params: Option<Value>,
    pub id: Option<Value>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

impl JsonRpcResponse {
    fn reply(id: Option<Value>, outcome: std::result::Result<Value, JsonRpcError>) -> Self {
        let (result, error) = match outcome {
            Ok(v) => (Some(v), None),
            Err(e) => (None, Some(e)),
        };
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result,
            error,
        }
    }
}

#[derive(Clone)]
pub struct McpServer {
    dispatcher: Dispatcher,
}

impl McpServer {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }

    pub async fn handle_request(&self, req: JsonRpcRequest) -> std::result::Result<Value, JsonRpcError> {
        match req.method.as_str() {
            "initialize" => Ok(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "serverInfo": {
                    "name": env!("CARGO_PKG_NAME"),
                    "version": env!("CARGO_PKG_VERSION")
                },
                "capabilities": {
                    "tools": {}
                }
            })),
            "notifications/initialized" => {
                info!("Client initialized");
                Ok(Value::Null)
            }
            "ping" => Ok(json!({})),
            "tools/list" => Ok(json!({
                "tools": tools::definitions()
            })),
            "tools/call" => {
                let params = req
                    .params
                    .ok_or_else(|| JsonRpcError::new(INVALID_PARAMS, "Missing params for tools/call"))?;
                let name = params
                    .get("name")
                    .and_then(|n| n.as_str())
                    .ok_or_else(|| JsonRpcError::new(INVALID_PARAMS, "Missing tool name"))?;
                let args = params.get("arguments").unwrap_or(&Value::Null);
                self.call_tool(name, args).await
            }
            _ => Err(JsonRpcError::new(
                METHOD_NOT_FOUND,
                format!("Method not found: {}", req.method),
            )),
        }
    }

    pub async fn call_tool(&self, name: &str, args: &Value) -> std::result::Result<Value, JsonRpcError> {
        let output = self.dispatcher.call(name, args).await;
        let text = serde_json::to_string_pretty(&output)
            .map_err(|e| JsonRpcError::new(INTERNAL_ERROR, e.to_string()))?;
        Ok(json!({
            "content": [{ "type": "text", "text": text }],
            "isError": !output.ok
        }))
    }

    /// One framed request in, at most one response out. Notifications get no reply.
    pub async fn handle_message(&self, input: &str) -> Option<JsonRpcResponse> {
        let req = match serde_json::from_str::<JsonRpcRequest>(input) {
            Ok(req) => req,
            Err(e) => {
                error!("Failed to parse JSON-RPC: {}", e);
                return Some(JsonRpcResponse::reply(
                    None,
                    Err(JsonRpcError::new(PARSE_ERROR, format!("Parse error: {}", e))),
                ));
            }
        };

        let id = req.id.clone();
        let method = req.method.clone();
        let outcome = self.handle_request(req).await;
        match id {
            Some(id) => Some(JsonRpcResponse::reply(Some(id), outcome)),
            None => {
                if let Err(e) = outcome {
                    warn!("Error handling notification {}: {}", method, e.message);
                }
                None
            }
        }
    }

    /// Requests are read in order; each `tools/call` runs on its own task and
    /// all replies go through one writer so lines never interleave.
    pub async fn run_stdio(&self) -> Result<()> {
        let (tx, mut rx) = mpsc::channel::<String>(64);

        let writer = tokio::spawn(async move {
            let mut stdout = tokio::io::stdout();
            while let Some(line) = rx.recv().await {
                stdout.write_all(line.as_bytes()).await?;
                stdout.write_all(b"\n").await?;
                stdout.flush().await?;
            }
            Ok::<(), std::io::Error>(())
        });

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
            let input = line.trim().to_string();
            if input.is_empty() {
                continue;
            }
            debug!("Received: {}", input);

            let server = self.clone();
            let tx = tx.clone();
            let work = async move {
                if let Some(resp) = server.handle_message(&input).await {
                    match serde_json::to_string(&resp) {
                        Ok(out) => {
                            if tx.send(out).await.is_err() {
                                error!("Response writer closed");
                            }
                        }
                        Err(e) => error!("Failed to encode response: {}", e),
                    }
                }
            };

            if is_tool_call(&line) {
                tokio::spawn(work);
            } else {
                work.await;
            }
        }

        // EOF: let in-flight calls finish, then drain the writer.
        drop(tx);
        writer.await.context("Response writer panicked")??;
        Ok(())
    }

    pub fn router(self, auth_token: Option<String>) -> Router {
        let state = Arc::new(HttpState {
            server: self,
            auth_token,
        });
        Router::new()
            .route("/mcp", post(handle_mcp))
            .route("/health", get(|| async { "ok" }))
            .with_state(state)
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(CorsLayer::permissive()),
            )
    }

    pub async fn run_http(self, host: &str, port: u16, auth_token: Option<String>) -> Result<()> {
        let addr = format!("{}:{}", host, port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;
        if auth_token.is_none() {
            warn!("HTTP server running without an auth token");
        }
        info!("Listening on http://{}/mcp", addr);
        axum::serve(listener, self.router(auth_token))
            .await
            .context("HTTP server failed")
    }
}

fn is_tool_call(line: &str) -> bool {
    serde_json::from_str::<Value>(line)
        .ok()
        .and_then(|v| v.get("method").and_then(|m| m.as_str()).map(|m| m == "tools/call"))
        .unwrap_or(false)
}

struct HttpState {
    server: McpServer,
    auth_token: Option<String>,
}

fn authorized(headers: &HeaderMap, expected: &str) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| token == expected)
}

async fn handle_mcp(
    State(state): State<Arc<HttpState>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    if let Some(expected) = &state.auth_token {
        if !authorized(&headers, expected) {
            return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
        }
    }

    match state.server.handle_message(&body).await {
        Some(resp) => Json(resp).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::{Orchestrator, PreconditionPolicy};
    use crate::proxmox::mock::MockTransport;
    use crate::proxmox::ProxmoxClient;
    use crate::task::PollBudget;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    fn server() -> McpServer {
        let client = ProxmoxClient::new(Arc::new(MockTransport::new()));
        let orchestrator = Orchestrator::new(client, PreconditionPolicy::default(), PollBudget::default(), 4);
        McpServer::new(Dispatcher::new(orchestrator))
    }

    #[tokio::test]
    async fn test_initialize_and_list() {
        let s = server();
        let resp = s
            .handle_message(r#"{"jsonrpc":"2.0","id":1,"method":"initialize"}"#)
            .await
            .unwrap();
        assert_eq!(resp.result.unwrap()["protocolVersion"], PROTOCOL_VERSION);

        let resp = s
            .handle_message(r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#)
            .await
            .unwrap();
        let tools = resp.result.unwrap()["tools"].as_array().cloned().unwrap();
        assert!(tools.iter().any(|t| t["name"] == "wait_for_task"));
    }

    #[tokio::test]
    async fn test_errors_and_notifications() {
        let s = server();
        let resp = s.handle_message("{not json").await.unwrap();
        assert_eq!(resp.error.unwrap().code, PARSE_ERROR);

        let resp = s
            .handle_message(r#"{"jsonrpc":"2.0","id":3,"method":"resources/list"}"#)
            .await
            .unwrap();
        assert_eq!(resp.error.unwrap().code, METHOD_NOT_FOUND);

        assert!(s
            .handle_message(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_tool_error_is_flagged() {
        let s = server();
        let resp = s
            .handle_message(
                r#"{"jsonrpc":"2.0","id":4,"method":"tools/call","params":{"name":"create_container","arguments":{"node":"pve1"}}}"#,
            )
            .await
            .unwrap();
        let result = resp.result.unwrap();
        assert_eq!(result["isError"], true);
        let text = result["content"][0]["text"].as_str().unwrap();
        let body: Value = serde_json::from_str(text).unwrap();
        assert_eq!(body["error"]["field"], "template");
    }

    #[test]
    fn test_is_tool_call() {
        assert!(is_tool_call(r#"{"jsonrpc":"2.0","id":1,"method":"tools/call"}"#));
        assert!(!is_tool_call(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#));
        assert!(!is_tool_call("garbage"));
    }

    #[tokio::test]
    async fn test_http_requires_bearer_token() {
        let app = server().router(Some("secret".into()));
        let ping = r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#;

        let resp = app
            .clone()
            .oneshot(Request::post("/mcp").body(Body::from(ping)).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = app
            .clone()
            .oneshot(
                Request::post("/mcp")
                    .header("Authorization", "Bearer secret")
                    .body(Body::from(ping))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let v: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(v["id"], 1);

        let resp = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
