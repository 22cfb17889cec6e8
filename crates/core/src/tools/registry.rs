use super::schema::validate_arguments;
use super::{LocalTool, ToolDescriptor, ToolServer};
use crate::error::{SessionError, ToolOutcome};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

enum Route {
    Local(Arc<dyn LocalTool>),
    Remote,
}

/// Name → callable mapping for one session. Read-only once built, so a
/// shared reference can serve any number of concurrent dispatches.
pub struct ToolRegistry {
    routes: HashMap<String, Route>,
    descriptors: Vec<ToolDescriptor>,
    remote: Option<Arc<dyn ToolServer>>,
    call_timeout: Duration,
    degraded: Option<SessionError>,
}

pub struct ToolRegistryBuilder {
    local: Vec<Arc<dyn LocalTool>>,
    remote: Option<Arc<dyn ToolServer>>,
    unavailable: Option<String>,
    call_timeout: Duration,
    discovery_timeout: Duration,
}

impl ToolRegistryBuilder {
    pub fn local(mut self, tool: impl LocalTool + 'static) -> Self {
        self.local.push(Arc::new(tool));
        self
    }

    pub fn remote(mut self, server: Arc<dyn ToolServer>) -> Self {
        self.remote = Some(server);
        self
    }

    /// Records that the remote server could not even be reached (for example
    /// the connection handshake failed); the registry comes up degraded.
    pub fn remote_unavailable(mut self, reason: impl Into<String>) -> Self {
        self.unavailable = Some(reason.into());
        self
    }

    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    /// Runs remote discovery once and freezes the descriptor table.
    /// Discovery failure never fails the build.
    pub async fn build(self) -> ToolRegistry {
        let mut routes = HashMap::new();
        let mut descriptors = Vec::new();
        for tool in self.local {
            let descriptor = tool.descriptor();
            routes.insert(descriptor.name.clone(), Route::Local(tool));
            descriptors.push(descriptor);
        }

        let mut degraded = self.unavailable.map(SessionError::DiscoveryUnavailable);
        let mut remote = None;
        if let Some(server) = self.remote {
            match tokio::time::timeout(self.discovery_timeout, server.list_tools()).await {
                Ok(Ok(listed)) => {
                    info!(count = listed.len(), "Discovered remote tools.");
                    for descriptor in listed {
                        if routes.contains_key(&descriptor.name) {
                            info!(tool = %descriptor.name, "Remote tool shadowed by a local tool of the same name.");
                            continue;
                        }
                        routes.insert(descriptor.name.clone(), Route::Remote);
                        descriptors.push(descriptor);
                    }
                    remote = Some(server);
                }
                Ok(Err(e)) => {
                    degraded = Some(SessionError::DiscoveryUnavailable(e.to_string()));
                }
                Err(_) => {
                    degraded = Some(SessionError::DiscoveryUnavailable(format!(
                        "discovery timed out after {}ms",
                        self.discovery_timeout.as_millis()
                    )));
                }
            }
        }
        if let Some(err) = &degraded {
            warn!(error = %err, "Continuing with local tools only.");
        }

        ToolRegistry {
            routes,
            descriptors,
            remote,
            call_timeout: self.call_timeout,
            degraded,
        }
    }
}

impl ToolRegistry {
    pub fn builder() -> ToolRegistryBuilder {
        ToolRegistryBuilder {
            local: Vec::new(),
            remote: None,
            unavailable: None,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
        }
    }

    /// Local tools first, then discovered remote tools, in registration order.
    pub fn descriptors(&self) -> &[ToolDescriptor] {
        &self.descriptors
    }

    pub fn descriptor(&self, name: &str) -> Option<&ToolDescriptor> {
        self.descriptors.iter().find(|d| d.name == name)
    }

    /// The discovery failure this registry was built with, if any.
    pub fn degraded(&self) -> Option<&SessionError> {
        self.degraded.as_ref()
    }

    /// Validates and dispatches one call. Every failure comes back as data so
    /// it can be folded into the model's input.
    pub async fn invoke(&self, name: &str, arguments: Value) -> ToolOutcome {
        let (Some(route), Some(descriptor)) = (self.routes.get(name), self.descriptor(name)) else {
            return Err(SessionError::tool(name, format!("unknown tool '{}'", name)));
        };
        validate_arguments(&descriptor.parameters, &arguments)
            .map_err(|message| SessionError::invalid_arguments(name, message))?;

        debug!(tool = %name, "Dispatching tool call");
        let dispatch = async {
            match route {
                Route::Local(tool) => tool
                    .call(arguments)
                    .await
                    .map_err(|message| SessionError::tool(name, message)),
                Route::Remote => match &self.remote {
                    Some(server) => server.call_tool(name, arguments).await.map_err(|e| match e {
                        SessionError::Tool { .. } | SessionError::InvalidArguments { .. } => e,
                        other => SessionError::tool(name, other.to_string()),
                    }),
                    None => Err(SessionError::tool(name, "remote tool server unavailable")),
                },
            }
        };
        match tokio::time::timeout(self.call_timeout, dispatch).await {
            Ok(outcome) => outcome,
            Err(_) => Err(SessionError::tool(
                name,
                format!("timed out after {}ms", self.call_timeout.as_millis()),
            )),
        }
    }
}
