//! Built-in workers registered by the `labour-queue` binary

use async_trait::async_trait;
use serde::Deserialize;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

use super::types::{ExecutionContext, Outcome, ResolvedOptions};
use super::worker_registry::{Worker, WorkerRegistry};
use crate::errors::QueueResult;

pub const LOG_WORKER: &str = "log";
pub const COMMAND_WORKER: &str = "command";

/// Logs every payload of its bundle
pub struct LogWorker;

#[async_trait]
impl Worker for LogWorker {
    async fn execute(&self, ctx: &ExecutionContext) -> Outcome {
        let labour = ctx.labour();
        for payload in ctx.bundle.payloads() {
            info!(
                "Labour {} ({}-{}): {}",
                labour.id, labour.worker, labour.identity, payload
            );
        }
        Outcome::Finished
    }
}

#[derive(Debug, Deserialize)]
struct CommandPayload {
    program: String,
    #[serde(default)]
    args: Vec<String>,
}

/// Runs `payload.program` with `payload.args`.
///
/// A non-zero exit is retried, a program that cannot be started is not.
pub struct CommandWorker;

#[async_trait]
impl Worker for CommandWorker {
    async fn execute(&self, ctx: &ExecutionContext) -> Outcome {
        let payload: CommandPayload = match serde_json::from_value(ctx.payload().clone()) {
            Ok(payload) => payload,
            Err(e) => return Outcome::failed(format!("invalid command payload: {e}")),
        };

        debug!("Running {} {:?}", payload.program, payload.args);
        let status = Command::new(&payload.program)
            .args(&payload.args)
            .stdin(Stdio::null())
            .status()
            .await;

        match status {
            Ok(status) if status.success() => Outcome::Finished,
            Ok(status) => Outcome::reschedule(format!("{} exited with {status}", payload.program)),
            Err(e) => Outcome::failed(format!("failed to start {}: {e}", payload.program)),
        }
    }

    fn validate_options(
        &self,
        _options: &ResolvedOptions,
        payload: &serde_json::Value,
    ) -> Result<(), String> {
        match payload.get("program").and_then(|p| p.as_str()) {
            Some(program) if !program.is_empty() => Ok(()),
            _ => Err("payload must name a 'program'".to_string()),
        }
    }
}

/// Register the workers shipped with the binary
pub fn register_builtin(registry: &mut WorkerRegistry) -> QueueResult<()> {
    registry.register(LOG_WORKER, LogWorker)?;
    registry.register(COMMAND_WORKER, CommandWorker)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::models::{Labour, LabourStatus};
    use crate::repositories::Bundle;
    use chrono::Utc;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn context(payload: serde_json::Value) -> ExecutionContext {
        let now = Utc::now();
        ExecutionContext {
            bundle: Bundle {
                representative: Labour {
                    id: 1,
                    parent_id: None,
                    worker: COMMAND_WORKER.to_string(),
                    identity: String::new(),
                    payload,
                    status: LabourStatus::Running,
                    priority: 100,
                    attempts: 1,
                    pid: None,
                    by_recurring: false,
                    last_error: None,
                    created_at: now,
                    updated_at: now,
                    execute_at: now,
                    started_at: Some(now),
                    finished_at: None,
                },
                members: Vec::new(),
            },
            params: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_command_outcomes() {
        let worker = CommandWorker;
        assert_eq!(
            worker.execute(&context(json!({ "program": "true" }))).await,
            Outcome::Finished
        );
        assert!(matches!(
            worker.execute(&context(json!({ "program": "false" }))).await,
            Outcome::Reschedule(_)
        ));
        assert!(matches!(
            worker
                .execute(&context(json!({ "program": "/nonexistent/labour-queue-test" })))
                .await,
            Outcome::Failed(_)
        ));
        assert!(matches!(
            worker.execute(&context(json!({ "args": [] }))).await,
            Outcome::Failed(_)
        ));
    }

    #[test]
    fn test_register_builtin() {
        let mut registry = WorkerRegistry::new(&Config::default());
        register_builtin(&mut registry).unwrap();
        assert!(registry.resolve(LOG_WORKER).is_some());
        assert!(registry.resolve(COMMAND_WORKER).is_some());
        assert!(register_builtin(&mut registry).is_err());
    }
}
