//! Configuration module for the agent kernel runtime.
//!
//! Declarative TOML covering profiles, score weights, governance rules,
//! breaker parameters, tool catalog entries and store paths. Environment
//! variables may override secrets and endpoints; they never override risk or
//! approval settings.

pub mod types;

pub use types::*;
