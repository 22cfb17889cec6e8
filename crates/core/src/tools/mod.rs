//! Callable tools: local builtins, the remote tool server seam, and the
//! per-session registry that validates and dispatches calls.

mod registry;
mod remote;
pub mod schema;

pub use registry::{ToolRegistry, ToolRegistryBuilder};
pub use remote::McpToolServer;

use crate::error::SessionError;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolTransportKind {
    Local,
    Remote,
}

/// A tool as the model sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    /// JSON schema for the arguments object.
    pub parameters: Value,
    pub transport: ToolTransportKind,
}

impl ToolDescriptor {
    pub fn local(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            transport: ToolTransportKind::Local,
        }
    }

    pub fn remote(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            transport: ToolTransportKind::Remote,
        }
    }
}

/// A builtin tool executed in-process.
#[async_trait]
pub trait LocalTool: Send + Sync {
    fn descriptor(&self) -> ToolDescriptor;

    /// Runs the tool; an `Err` message is handed back to the model as a tool error.
    async fn call(&self, arguments: Value) -> Result<Value, String>;
}

type ToolFn = dyn Fn(Value) -> BoxFuture<'static, Result<Value, String>> + Send + Sync;

/// [`LocalTool`] backed by an async closure.
pub struct FnTool {
    descriptor: ToolDescriptor,
    handler: Arc<ToolFn>,
}

impl FnTool {
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        handler: F,
    ) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        Self {
            descriptor: ToolDescriptor::local(name, description, parameters),
            handler: Arc::new(move |args| Box::pin(handler(args))),
        }
    }
}

#[async_trait]
impl LocalTool for FnTool {
    fn descriptor(&self) -> ToolDescriptor {
        self.descriptor.clone()
    }

    async fn call(&self, arguments: Value) -> Result<Value, String> {
        (self.handler)(arguments).await
    }
}

/// A remote tool endpoint: one discovery operation and per-tool invocation.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ToolServer: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, SessionError>;

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, SessionError>;
}
