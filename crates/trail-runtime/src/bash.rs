//! Shell command tool
//!
//! Runs `bash -c <command>` in the run's working directory. Stdout and
//! stderr are merged; a nonzero exit is a failed result, not an error.
//! The child is killed if the engine's tool deadline drops the future.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use trail_core::{ParameterSchema, Result, Tool, ToolCall, ToolContext, ToolResult, ToolSchema};

/// Output beyond this many characters is cut
pub const MAX_OUTPUT_CHARS: usize = 16_000;

const TRUNCATED_NOTICE: &str = "\n<response clipped: output exceeded the size limit>";

/// `bash` tool
#[derive(Clone, Debug, Default)]
pub struct BashTool;

impl BashTool {
    pub const fn new() -> Self {
        Self
    }
}

fn truncate(text: String) -> String {
    match text.char_indices().nth(MAX_OUTPUT_CHARS) {
        Some((cut, _)) => format!("{}{TRUNCATED_NOTICE}", &text[..cut]),
        None => text,
    }
}

#[async_trait]
impl Tool for BashTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "bash".into(),
            description: "Run a command in a bash shell inside the project directory. \
                          Output from stdout and stderr is returned together. Avoid \
                          commands that produce very large output or never exit."
                .into(),
            parameters: vec![ParameterSchema::required(
                "command",
                "string",
                "The bash command to run",
            )],
        }
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> Result<ToolResult> {
        let Some(command) = call.str_arg("command") else {
            return Ok(ToolResult::failure("bash", &call.id, "`command` must be a string"));
        };

        tracing::debug!(command, cwd = %ctx.working_dir.display(), "running bash command");

        let output = Command::new("bash")
            .arg("-c")
            .arg(command)
            .current_dir(&ctx.working_dir)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await;

        let output = match output {
            Ok(output) => output,
            Err(e) => {
                return Ok(ToolResult::failure(
                    "bash",
                    &call.id,
                    format!("failed to start bash: {e}"),
                ));
            }
        };

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&stderr);
        }
        let text = truncate(text);
        let exit_code = output.status.code();
        let data = serde_json::json!({ "exit_code": exit_code });

        if output.status.success() {
            Ok(ToolResult::success("bash", &call.id, text).with_data(data))
        } else {
            let status = exit_code.map_or_else(
                || "terminated by signal".to_string(),
                |code| format!("exit status {code}"),
            );
            Ok(ToolResult::failure("bash", &call.id, status)
                .with_output(text)
                .with_data(data))
        }
    }
}
