//! Executor backed by an external program.
//!
//! The task goes to the program's stdin as JSON; the program prints a JSON
//! array of mutations on stdout. Exit status other than 0 is a failure with
//! code `exit-N` and stderr as the message.

use std::process::Stdio;

use async_trait::async_trait;
use braid_core::domain::{ArtifactMutation, ExecutorFailure, Task, WorkerId};
use braid_core::Executor;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct CommandExecutor {
    program: String,
    args: Vec<String>,
}

#[derive(Serialize)]
struct Request<'a> {
    task: &'a Task,
    worker: &'a WorkerId,
}

impl CommandExecutor {
    /// `None` for an empty command line.
    pub fn new(command: &[String]) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

#[async_trait]
impl Executor for CommandExecutor {
    async fn execute(
        &self,
        task: &Task,
        worker: &WorkerId,
    ) -> Result<Vec<ArtifactMutation>, ExecutorFailure> {
        let input = serde_json::to_vec(&Request { task, worker })
            .map_err(|e| ExecutorFailure::new("invalid-input", e.to_string()))?;

        // timeout で future が drop されたら子プロセスも止める
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecutorFailure::new("spawn", format!("{}: {e}", self.program)))?;

        if let Some(mut stdin) = child.stdin.take() {
            // 入力を読まないプログラムもあるので broken pipe は無視
            let _ = stdin.write_all(&input).await;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ExecutorFailure::new("wait", e.to_string()))?;
        debug!(task = %task.id, status = %output.status, "command finished");

        if !output.status.success() {
            let code = output
                .status
                .code()
                .map_or_else(|| "exit-signal".to_string(), |c| format!("exit-{c}"));
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(ExecutorFailure::new(code, stderr));
        }

        serde_json::from_slice(&output.stdout)
            .map_err(|e| ExecutorFailure::new("invalid-output", e.to_string()))
    }
}
