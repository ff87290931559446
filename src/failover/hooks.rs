// ABOUTME: Runs operator-supplied scripts for failure checks and post-failover hooks
// ABOUTME: Scripts receive the old master's host/port and, after promotion, the new one's

use crate::mysql::ServerAddress;
use anyhow::{Context, Result};
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

/// Run `script args...` and return its exit code.
///
/// A script killed by a signal reports `-1`. The child is killed if the
/// returned future is dropped, so a shutdown can abandon the wait.
pub async fn run_script(script: &Path, args: &[String]) -> Result<i32> {
    tracing::debug!("Running {} {}", script.display(), args.join(" "));

    let output = Command::new(script)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .with_context(|| format!("Failed to run script {}", script.display()))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    if !stdout.trim().is_empty() {
        tracing::debug!("{} stdout: {}", script.display(), stdout.trim());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.trim().is_empty() {
        tracing::debug!("{} stderr: {}", script.display(), stderr.trim());
    }

    Ok(output.status.code().unwrap_or(-1))
}

/// Arguments passed to hook scripts: old host/port, then new host/port if any
pub fn hook_args(old_master: &ServerAddress, new_master: Option<&ServerAddress>) -> Vec<String> {
    let mut args = vec![old_master.host.clone(), old_master.port.to_string()];
    if let Some(new_master) = new_master {
        args.push(new_master.host.clone());
        args.push(new_master.port.to_string());
    }
    args
}

/// Run the post-failover hook; failures are logged, never propagated
pub async fn run_post_failover(
    script: &Path,
    old_master: &ServerAddress,
    new_master: Option<&ServerAddress>,
) {
    tracing::info!("Running post-failover script {}", script.display());
    match run_script(script, &hook_args(old_master, new_master)).await {
        Ok(0) => tracing::info!("Post-failover script completed"),
        Ok(code) => tracing::warn!("Post-failover script exited with code {}", code),
        Err(e) => tracing::warn!("{:#}", e),
    }
}
