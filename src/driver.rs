//! SubprocessDriver: executes one node attempt as a child process. Built
//! on `tokio::process::Command` with piped stdout/stderr consumed line by
//! line via `tokio::io::BufReader::lines()`.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::time::timeout;

use crate::error::DriverError;
use crate::event::{event_type, EventLevel};
use crate::store::RunStore;

/// Lines longer than this are truncated with an explicit warning event.
const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Grace period after a graceful terminate/timeout before a force-kill.
const KILL_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Succeeded,
    Failed { exit_code: i32 },
    TimedOut,
    Cancelled,
}

pub struct SubprocessDriver {
    store: Arc<dyn RunStore>,
    /// Environment passed through to every child in addition to the
    /// caller-supplied overrides.
    env_passthrough: HashMap<String, String>,
    cwd: Option<String>,
}

impl SubprocessDriver {
    pub fn new(store: Arc<dyn RunStore>) -> Self {
        Self {
            store,
            env_passthrough: HashMap::new(),
            cwd: None,
        }
    }

    #[must_use]
    pub fn with_env_passthrough(mut self, env: HashMap<String, String>) -> Self {
        self.env_passthrough = env;
        self
    }

    #[must_use]
    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    async fn emit(
        &self,
        run_id: &str,
        node_id: &str,
        event_type: &str,
        data: Value,
        level: Option<EventLevel>,
    ) -> Result<(), DriverError> {
        self.store
            .append_event(run_id, event_type, data, Some(node_id.to_string()), level)
            .await?;
        Ok(())
    }

    /// Execute `argv` as node `node_id`'s attempt. Returns the exit code on
    /// normal completion, or `DriverError::Cancelled` if `cancel` resolves
    /// before the child exits.
    pub async fn run_node(
        &self,
        run_id: &str,
        node_id: &str,
        argv: &[String],
        extra_env: &HashMap<String, String>,
        timeout_secs: Option<f64>,
        cancel: impl std::future::Future<Output = ()> + Send,
    ) -> Result<i32, DriverError> {
        self.emit(run_id, node_id, event_type::NODE_STATUS, serde_json::json!({"status": "running"}), None)
            .await?;

        let (program, rest) = argv
            .split_first()
            .ok_or_else(|| DriverError::SpawnFailed { message: "empty argv".to_string() })?;

        let mut command = Command::new(program);
        command
            .args(rest)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .envs(&self.env_passthrough)
            .envs(extra_env);
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().map_err(|e| DriverError::SpawnFailed { message: e.to_string() })?;
        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");

        let stdout_task = tokio::spawn(read_stdout(
            Arc::clone(&self.store),
            run_id.to_string(),
            node_id.to_string(),
            stdout,
        ));
        let stderr_task = tokio::spawn(read_stderr(
            Arc::clone(&self.store),
            run_id.to_string(),
            node_id.to_string(),
            stderr,
        ));

        tokio::pin!(cancel);

        let outcome = tokio::select! {
            biased;
            _ = &mut cancel => {
                let _ = child.start_kill();
                let _ = timeout(KILL_GRACE, child.wait()).await;
                AttemptOutcome::Cancelled
            }
            wait_result = wait_with_timeout(&mut child, timeout_secs) => {
                wait_result
            }
        };

        // Drain stdout/stderr readers before emitting the terminal
        // node_status, so late child output never appears after it.
        let _ = stdout_task.await;
        let _ = stderr_task.await;

        match outcome {
            AttemptOutcome::Cancelled => {
                self.emit(run_id, node_id, event_type::NODE_STATUS, serde_json::json!({"status": "failed", "reason": "cancelled"}), None)
                    .await?;
                Err(DriverError::Cancelled)
            }
            AttemptOutcome::TimedOut => {
                let message = format!("node {node_id} timed out after {}s", timeout_secs.unwrap_or_default());
                self.emit(run_id, node_id, event_type::LOG, serde_json::json!({"message": message}), Some(EventLevel::Error))
                    .await?;
                self.emit(run_id, node_id, event_type::NODE_STATUS, serde_json::json!({"status": "failed", "reason": "timeout"}), None)
                    .await?;
                Ok(1)
            }
            AttemptOutcome::Succeeded => {
                self.emit(run_id, node_id, event_type::NODE_STATUS, serde_json::json!({"status": "succeeded"}), None)
                    .await?;
                Ok(0)
            }
            AttemptOutcome::Failed { exit_code } => {
                self.emit(run_id, node_id, event_type::NODE_STATUS, serde_json::json!({"status": "failed", "exitCode": exit_code}), None)
                    .await?;
                Ok(exit_code)
            }
        }
    }

}

async fn wait_with_timeout(child: &mut tokio::process::Child, timeout_secs: Option<f64>) -> AttemptOutcome {
    let wait_future = child.wait();
    let result = match timeout_secs.filter(|t| *t > 0.0) {
        Some(secs) => timeout(Duration::from_secs_f64(secs), wait_future).await,
        None => Ok(wait_future.await),
    };

    match result {
        Ok(Ok(status)) => match status.code() {
            Some(0) => AttemptOutcome::Succeeded,
            Some(code) => AttemptOutcome::Failed { exit_code: code },
            None => AttemptOutcome::Failed { exit_code: 1 },
        },
        Ok(Err(_)) => AttemptOutcome::Failed { exit_code: 1 },
        Err(_) => {
            let _ = child.start_kill();
            let _ = timeout(KILL_GRACE, child.wait()).await;
            AttemptOutcome::TimedOut
        }
    }
}

async fn read_stdout(
    store: Arc<dyn RunStore>,
    run_id: String,
    node_id: String,
    stdout: tokio::process::ChildStdout,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(_) => break,
        };
        let line = truncate_and_warn(&store, &run_id, &node_id, line).await;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(obj) if obj.is_object() => {
                let event_type = obj.get("type").and_then(Value::as_str).unwrap_or(event_type::LOG).to_string();
                let level = obj
                    .get("level")
                    .and_then(Value::as_str)
                    .and_then(|s| serde_json::from_value::<EventLevel>(Value::String(s.to_string())).ok());
                let _ = store
                    .append_event(&run_id, &event_type, obj, Some(node_id.clone()), level)
                    .await;
            }
            _ => {
                let _ = store
                    .append_event(
                        &run_id,
                        event_type::LOG,
                        serde_json::json!({"message": line, "level": "info"}),
                        Some(node_id.clone()),
                        Some(EventLevel::Info),
                    )
                    .await;
            }
        }
    }
}

async fn read_stderr(
    store: Arc<dyn RunStore>,
    run_id: String,
    node_id: String,
    stderr: tokio::process::ChildStderr,
) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(_) => break,
        };
        let line = truncate_and_warn(&store, &run_id, &node_id, line).await;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let _ = store
            .append_event(
                &run_id,
                event_type::LOG,
                serde_json::json!({"message": line, "level": "error"}),
                Some(node_id.clone()),
                Some(EventLevel::Error),
            )
            .await;
    }
}

async fn truncate_and_warn(store: &Arc<dyn RunStore>, run_id: &str, node_id: &str, line: String) -> String {
    if line.len() <= MAX_LINE_BYTES {
        return line;
    }
    let _ = store
        .append_event(
            run_id,
            event_type::LOG,
            serde_json::json!({"message": format!("line from node {node_id} exceeded {MAX_LINE_BYTES} bytes and was truncated")}),
            Some(node_id.to_string()),
            Some(EventLevel::Warning),
        )
        .await;
    line.chars().take(MAX_LINE_BYTES).collect()
}
