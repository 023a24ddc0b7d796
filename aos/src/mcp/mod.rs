//! Connector runtime: smart routing over the tool catalog, bounded retry
//! chains with fallback, per-tool circuit breaking with persisted state,
//! replayable call records, and declarative pipelines.

pub mod breaker;
pub mod pipeline;
pub mod retry;
pub mod router;
pub mod runtime;
pub mod stdio;
pub mod types;

pub use breaker::{Admission, BreakerState, CircuitBreakerMap, ToolBreaker};
pub use pipeline::{execute_pipeline, OnError, PipelineFile, PipelineReport, PipelineStep};
pub use retry::RetryPolicy;
pub use runtime::{ChainOutcome, ChainRequest, McpRuntime};
pub use types::{
    InProcessTransport, ToolDescriptor, ToolErrorBody, ToolHandler, ToolRequest, ToolResponse,
    ToolTransport,
};
