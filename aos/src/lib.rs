//! AOS - a single-operator agent operating system.
//!
//! A local runtime that accepts a natural-language task, classifies it,
//! ranks strategy candidates with memory-weighted scoring, executes them
//! under governance with per-strategy fallback, records structured evidence
//! for every attempt, and closes the loop with a feedback-driven policy
//! tuner. External tools are reached through a connector runtime with smart
//! routing, bounded retry chains and per-tool circuit breakers.
//!
//! Component map:
//! - [`kernel`] - task ingress, classification, profile binding, submit/status
//! - [`ranker`] - candidate generation and deterministic ordering
//! - [`engine`] - the autonomy loop and the bounded worker pool
//! - [`registry`] - capability contracts and uniform service invocation
//! - [`mcp`] - connector runtime (router, retries, breaker, pipelines)
//! - [`governance`] - layer/risk gates, approvals, safety scans
//! - [`store`] - append-only evidence logs, artifacts, snapshots, index
//! - [`feedback`] - ratings ingestion and the policy tuner
//! - [`observability`] - telemetry events, aggregates, diagnostics

pub mod cli;
pub mod config;
pub mod engine;
pub mod errors;
pub mod feedback;
pub mod governance;
pub mod kernel;
pub mod mcp;
pub mod observability;
pub mod ranker;
pub mod registry;
pub mod store;
pub mod types;

pub use errors::{ErrorKind, KernelError, KernelResult};
pub use kernel::{Kernel, SubmitRequest};
