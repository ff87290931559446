// ABOUTME: Utility functions for retries and external executable resolution
// ABOUTME: Shared by the failover console, daemon control and command handlers

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use which::which;

/// Retry a function with exponential backoff
///
/// Executes an async operation with automatic retry on failure. Each retry doubles
/// the delay (exponential backoff) to handle transient failures gracefully.
///
/// # Arguments
///
/// * `operation` - Async function to retry (FnMut returning Future\<Output = Result\<T\>\>)
/// * `max_retries` - Maximum number of retry attempts (0 = no retries, just initial attempt)
/// * `initial_delay` - Delay before first retry (doubles each subsequent retry)
///
/// # Returns
///
/// Returns the successful result or the last error after all retries exhausted.
///
/// # Examples
///
/// ```no_run
/// # use anyhow::Result;
/// # use std::time::Duration;
/// # use mysql_rpl_failover::utils::retry_with_backoff;
/// # async fn example() -> Result<()> {
/// let result = retry_with_backoff(
///     || async { Ok("success") },
///     3,  // Try up to 3 times
///     Duration::from_secs(1)  // Start with 1s delay
/// ).await?;
/// # Ok(())
/// # }
/// ```
pub async fn retry_with_backoff<F, Fut, T>(
    mut operation: F,
    max_retries: u32,
    initial_delay: Duration,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut delay = initial_delay;
    let mut last_error = None;

    for attempt in 0..=max_retries {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                last_error = Some(e);

                if attempt < max_retries {
                    tracing::debug!(
                        "Operation failed (attempt {}/{}), retrying in {:?}...",
                        attempt + 1,
                        max_retries + 1,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }

    Err(last_error.unwrap_or_else(|| anyhow::anyhow!("Operation failed after retries")))
}

/// Resolve a script to an absolute, executable path
///
/// Bare names (no path separator) are looked up on `PATH`; anything else must
/// exist and carry an execute bit.
///
/// # Errors
///
/// Returns an error if the script cannot be found or is not executable.
///
/// # Examples
///
/// ```
/// # use mysql_rpl_failover::utils::resolve_executable;
/// # use std::path::Path;
/// assert!(resolve_executable(Path::new("/nonexistent/check.sh")).is_err());
/// ```
pub fn resolve_executable(script: &Path) -> Result<PathBuf> {
    if script.as_os_str().is_empty() {
        bail!("Script path cannot be empty");
    }

    if script.components().count() == 1 && !script.is_absolute() {
        return which(script)
            .with_context(|| format!("Script '{}' not found on PATH", script.display()));
    }

    let metadata = std::fs::metadata(script)
        .with_context(|| format!("Script '{}' does not exist", script.display()))?;
    if !metadata.is_file() {
        bail!("Script '{}' is not a regular file", script.display());
    }
    if !is_executable(&metadata) {
        bail!("Script '{}' is not executable", script.display());
    }

    Ok(script.to_path_buf())
}

#[cfg(unix)]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &std::fs::Metadata) -> bool {
    true
}
