//! Declarative pipelines: an ordered list of service steps loaded from a
//! JSON, TOML or YAML file and executed sequentially through the registry.
//! `on_error` decides per step whether a failure aborts what remains.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Instant;
use tracing::info;

use crate::errors::{KernelError, KernelResult};
use crate::governance::GovernanceKernel;
use crate::registry::ServiceRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    #[default]
    Abort,
    Continue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStep {
    pub service: String,
    #[serde(default)]
    pub params: IndexMap<String, serde_json::Value>,
    #[serde(default)]
    pub on_error: OnError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineFile {
    pub steps: Vec<PipelineStep>,
}

impl PipelineFile {
    /// Parse by extension: `.json`, `.toml`, `.yaml` / `.yml`.
    pub fn load(path: &Path) -> KernelResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_lowercase();
        let file: PipelineFile = match ext.as_str() {
            "json" => serde_json::from_str(&raw)?,
            "toml" => toml::from_str(&raw)
                .map_err(|e| KernelError::Config(format!("{}: {}", path.display(), e)))?,
            "yaml" | "yml" => serde_yaml::from_str(&raw)
                .map_err(|e| KernelError::Config(format!("{}: {}", path.display(), e)))?,
            other => {
                return Err(KernelError::Config(format!(
                    "unsupported pipeline format '.{}' (json, toml, yaml)",
                    other
                )))
            }
        };
        if file.steps.is_empty() {
            return Err(KernelError::Config("pipeline has no steps".into()));
        }
        Ok(file)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step: usize,
    pub service: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineReport {
    pub pipeline_id: String,
    pub steps: Vec<StepResult>,
    pub aborted: bool,
}

/// Execute the steps in order. Each step goes through the shared governed
/// invocation sequence (binding, safety scan, decision gates, approval,
/// acceptance), exactly like an engine attempt would.
pub async fn execute_pipeline(
    file: &PipelineFile,
    registry: &ServiceRegistry,
    governance: &GovernanceKernel,
    dry_run: bool,
) -> KernelResult<PipelineReport> {
    let pipeline_id = format!("pipe-{}", uuid::Uuid::new_v4());
    let mut report = PipelineReport {
        pipeline_id: pipeline_id.clone(),
        steps: Vec::new(),
        aborted: false,
    };

    for (step_index, step) in file.steps.iter().enumerate() {
        let started = Instant::now();
        let result = run_step(step, &pipeline_id, step_index, registry, governance, dry_run).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(()) => {
                info!(pipeline = %pipeline_id, step = step_index, service = %step.service, "step succeeded");
                report.steps.push(StepResult {
                    step: step_index,
                    service: step.service.clone(),
                    status: "succeeded".into(),
                    error: None,
                    latency_ms,
                });
            }
            Err(error) => {
                let status = if error.error_kind().map(|k| k.is_skip()).unwrap_or(false) {
                    "skipped"
                } else {
                    "failed"
                };
                report.steps.push(StepResult {
                    step: step_index,
                    service: step.service.clone(),
                    status: status.into(),
                    error: Some(error.to_string()),
                    latency_ms,
                });
                if step.on_error == OnError::Abort {
                    report.aborted = true;
                    break;
                }
            }
        }
    }
    Ok(report)
}

async fn run_step(
    step: &PipelineStep,
    pipeline_id: &str,
    step_index: usize,
    registry: &ServiceRegistry,
    governance: &GovernanceKernel,
    dry_run: bool,
) -> KernelResult<()> {
    governance
        .governed_call(
            registry,
            &step.service,
            &step.params,
            pipeline_id.to_string(),
            format!("{}.{}", pipeline_id, step_index),
            dry_run,
        )
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_all_three_serializations() {
        let dir = tempfile::tempdir().unwrap();

        let json_path = dir.path().join("p.json");
        std::fs::write(
            &json_path,
            r#"{"steps":[{"service":"a","params":{"x":1}},{"service":"b","on_error":"continue"}]}"#,
        )
        .unwrap();
        let file = PipelineFile::load(&json_path).unwrap();
        assert_eq!(file.steps.len(), 2);
        assert_eq!(file.steps[1].on_error, OnError::Continue);

        let toml_path = dir.path().join("p.toml");
        std::fs::write(
            &toml_path,
            "[[steps]]\nservice = \"a\"\n\n[[steps]]\nservice = \"b\"\non_error = \"continue\"\n",
        )
        .unwrap();
        assert_eq!(PipelineFile::load(&toml_path).unwrap().steps.len(), 2);

        let yaml_path = dir.path().join("p.yaml");
        std::fs::write(&yaml_path, "steps:\n  - service: a\n  - service: b\n").unwrap();
        assert_eq!(PipelineFile::load(&yaml_path).unwrap().steps.len(), 2);
    }

    #[test]
    fn rejects_empty_and_unknown_formats() {
        let dir = tempfile::tempdir().unwrap();
        let empty = dir.path().join("empty.json");
        std::fs::write(&empty, r#"{"steps":[]}"#).unwrap();
        assert!(PipelineFile::load(&empty).is_err());

        let odd = dir.path().join("p.ini");
        std::fs::write(&odd, "steps=1").unwrap();
        assert!(PipelineFile::load(&odd).is_err());
    }
}
