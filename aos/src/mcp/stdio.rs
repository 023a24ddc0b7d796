//! One-shot stdio transport for command-backed tools.
//!
//! Speaks line-delimited JSON-RPC 2.0: the request goes to the child's stdin
//! as a single `tools/call` line, stdout is read line by line until the
//! response with the matching id appears. The caller bounds the whole
//! exchange with a deadline and the child is killed on drop.

use serde_json::{json, Value};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

use crate::errors::{ErrorKind, KernelError, KernelResult};
use crate::mcp::types::{ToolErrorBody, ToolRequest, ToolResponse};

pub async fn call_command(command: &[String], request: &ToolRequest) -> KernelResult<ToolResponse> {
    let program = command.first().ok_or_else(|| {
        KernelError::Config(format!(
            "tool {}/{} has an empty command line",
            request.server, request.tool
        ))
    })?;

    let mut child = Command::new(program)
        .args(&command[1..])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            KernelError::transient(
                ErrorKind::ServiceUnavailable,
                format!("failed to spawn tool process {}: {}", program, e),
            )
        })?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| KernelError::Store("tool child has no stdin".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| KernelError::Store("tool child has no stdout".into()))?;

    let id = uuid::Uuid::new_v4().to_string();
    let rpc = json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "tools/call",
        "params": {
            "name": request.tool,
            "arguments": request.params,
            "dry_run": request.dry_run,
        }
    });
    let mut line = serde_json::to_string(&rpc)?;
    line.push('\n');
    stdin.write_all(line.as_bytes()).await?;
    stdin.flush().await?;
    drop(stdin);

    let mut reader = BufReader::new(stdout);
    let mut buf = String::new();
    loop {
        buf.clear();
        let n = reader.read_line(&mut buf).await?;
        if n == 0 {
            return Err(KernelError::transient(
                ErrorKind::ServiceUnavailable,
                format!(
                    "tool process {} closed stdout before answering",
                    program
                ),
            ));
        }
        let value: Value = match serde_json::from_str(buf.trim()) {
            Ok(v) => v,
            Err(_) => continue, // non-protocol noise on stdout
        };
        if value.get("id").and_then(|v| v.as_str()) != Some(id.as_str()) {
            continue;
        }

        if let Some(error) = value.get("error") {
            let body: ToolErrorBody = serde_json::from_value(error.clone()).unwrap_or_else(|_| {
                ToolErrorBody {
                    error_kind: "service_unavailable".into(),
                    message: error
                        .get("message")
                        .and_then(|m| m.as_str())
                        .unwrap_or("tool error")
                        .to_string(),
                    retryable: true,
                }
            });
            return Err(body.into_error());
        }

        let result = value.get("result").cloned().unwrap_or(Value::Null);
        let response: ToolResponse =
            serde_json::from_value(result.clone()).unwrap_or(ToolResponse {
                value: result,
                artifacts: vec![],
                partial: false,
            });
        return Ok(response);
    }
}
