//! [`ToolServer`] over the Model Context Protocol.

use super::{ToolDescriptor, ToolServer};
use crate::error::{Collaborator, SessionError};
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use rmcp::{
    ServiceExt,
    model::CallToolRequestParam,
    service::{RoleClient, RunningService},
    transport::{
        StreamableHttpClientTransport, streamable_http_client::StreamableHttpClientTransportConfig,
    },
};
use serde_json::Value;
use tracing::{debug, info};

pub struct McpToolServer {
    client: RunningService<RoleClient, ()>,
}

impl McpToolServer {
    /// Wraps an already-initialized client, e.g. one served over an in-process duplex.
    pub fn new(client: RunningService<RoleClient, ()>) -> Self {
        Self { client }
    }

    /// Connects to a streamable-HTTP MCP endpoint, authenticating with a bearer token.
    pub async fn connect_http(url: &str, bearer_token: Option<&str>) -> Result<Self, SessionError> {
        let err = |e: String| SessionError::transport(Collaborator::ToolServer, e);
        let mut headers = HeaderMap::new();
        if let Some(token) = bearer_token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| err(format!("invalid bearer token: {}", e)))?;
            headers.insert(AUTHORIZATION, value);
        }
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| err(e.to_string()))?;
        let transport = StreamableHttpClientTransport::with_client(
            http,
            StreamableHttpClientTransportConfig::with_uri(url.to_string()),
        );
        let client = ()
            .serve(transport)
            .await
            .map_err(|e| err(format!("MCP handshake failed: {}", e)))?;
        info!(url, "Connected to remote tool server.");
        Ok(Self { client })
    }
}

#[async_trait]
impl ToolServer for McpToolServer {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, SessionError> {
        let tools = self
            .client
            .list_all_tools()
            .await
            .map_err(|e| SessionError::transport(Collaborator::ToolServer, e.to_string()))?;
        Ok(tools
            .into_iter()
            .map(|t| {
                ToolDescriptor::remote(
                    t.name.to_string(),
                    t.description.map(|d| d.to_string()).unwrap_or_default(),
                    Value::Object((*t.input_schema).clone()),
                )
            })
            .collect())
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, SessionError> {
        debug!(tool = name, "Calling remote tool");
        let result = self
            .client
            .peer()
            .call_tool(CallToolRequestParam {
                name: name.to_string().into(),
                arguments: arguments.as_object().cloned(),
            })
            .await
            .map_err(|e| SessionError::transport(Collaborator::ToolServer, e.to_string()))?;
        let raw = serde_json::to_value(&result)
            .map_err(|e| SessionError::tool(name, format!("unreadable tool result: {}", e)))?;
        interpret_call_result(name, &raw)
    }
}

/// Reduces a serialized `CallToolResult` to a single JSON value. Text content
/// that is itself JSON is parsed; an `isError` result becomes a tool error.
fn interpret_call_result(name: &str, raw: &Value) -> Result<Value, SessionError> {
    let texts: Vec<&str> = raw
        .get("content")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter(|c| c.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|c| c.get("text").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default();
    let text = texts.join("\n");

    if raw.get("isError").and_then(Value::as_bool).unwrap_or(false) {
        let message = if text.is_empty() {
            "remote tool reported an error".to_string()
        } else {
            text
        };
        return Err(SessionError::tool(name, message));
    }
    if let Some(structured) = raw.get("structuredContent").filter(|v| !v.is_null()) {
        return Ok(structured.clone());
    }
    Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
}
