use anyhow::{anyhow, Context, Result};
use std::process::{Command, Output};

pub(crate) fn run_command(command: &mut Command, context_message: &str) -> Result<()> {
    command_output(command, context_message).map(|_| ())
}

/// Runs the command and returns its captured output when it exits successfully.
pub(crate) fn command_output(command: &mut Command, context_message: &str) -> Result<Output> {
    let output = command
        .output()
        .with_context(|| format!("{context_message}: command failed to start"))?;
    if output.status.success() {
        return Ok(output);
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    Err(anyhow!(
        "{context_message}: status={} stdout='{}' stderr='{}'",
        output.status,
        stdout.trim(),
        stderr.trim()
    ))
}
