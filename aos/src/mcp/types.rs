//! Shared types for the connector runtime.
//!
//! The tool invocation contract: a request carries `server`, `tool`,
//! `params` and an optional `dry_run`; the response is either a result
//! object with artifacts or an error carrying `error_kind`, `message` and
//! `retryable`. Transports implement [`ToolTransport`] over that contract.

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::errors::{ErrorKind, KernelError, KernelResult};
use crate::types::ArtifactRef;

/// Catalog entry for one external tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub server: String,
    pub tool: String,
    /// Vocabulary for the router's intent match.
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Relative invocation cost in `[0, 1]`.
    #[serde(default)]
    pub cost: f64,
    /// Command line for stdio transport; in-process when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
}

impl ToolDescriptor {
    pub fn id(&self) -> String {
        format!("{}/{}", self.server, self.tool)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRequest {
    pub server: String,
    pub tool: String,
    pub params: serde_json::Value,
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolResponse {
    pub value: serde_json::Value,
    #[serde(default)]
    pub artifacts: Vec<ArtifactRef>,
    /// Set when the tool could only produce part of the requested result.
    #[serde(default)]
    pub partial: bool,
}

/// Error object on the tool wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolErrorBody {
    pub error_kind: String,
    pub message: String,
    pub retryable: bool,
}

impl ToolErrorBody {
    pub fn into_error(self) -> KernelError {
        let kind = ErrorKind::from_str_loose(&self.error_kind);
        KernelError::Attempt {
            kind,
            message: self.message,
            retryable: self.retryable && kind.is_transient(),
        }
    }
}

#[async_trait]
pub trait ToolTransport: Send + Sync {
    async fn call(&self, request: &ToolRequest) -> KernelResult<ToolResponse>;
}

/// Handler type for in-process tools (used by the built-in catalog and tests).
pub type ToolHandler =
    Arc<dyn Fn(ToolRequest) -> BoxFuture<'static, KernelResult<ToolResponse>> + Send + Sync>;

/// Transport dispatching to registered in-process handlers.
#[derive(Default)]
pub struct InProcessTransport {
    handlers: std::sync::RwLock<HashMap<String, ToolHandler>>,
}

impl std::fmt::Debug for InProcessTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let n = self.handlers.read().map(|h| h.len()).unwrap_or(0);
        f.debug_struct("InProcessTransport").field("handlers", &n).finish()
    }
}

impl InProcessTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, server: &str, tool: &str, handler: ToolHandler) {
        if let Ok(mut handlers) = self.handlers.write() {
            handlers.insert(format!("{}/{}", server, tool), handler);
        }
    }
}

#[async_trait]
impl ToolTransport for InProcessTransport {
    async fn call(&self, request: &ToolRequest) -> KernelResult<ToolResponse> {
        let handler = {
            let handlers = self
                .handlers
                .read()
                .map_err(|_| KernelError::Store("transport lock poisoned".into()))?;
            handlers
                .get(&format!("{}/{}", request.server, request.tool))
                .cloned()
        };
        match handler {
            Some(handler) => handler(request.clone()).await,
            None => Err(KernelError::transient(
                ErrorKind::ServiceUnavailable,
                format!("no handler for tool {}/{}", request.server, request.tool),
            )),
        }
    }
}
