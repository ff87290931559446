// ABOUTME: Background process control for the failover daemon
// ABOUTME: Pidfile singleton, detached re-spawn, and SIGTERM-based stop

use crate::utils::retry_with_backoff;
use anyhow::{bail, Context, Result};
use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

pub const DEFAULT_PIDFILE: &str = "failover_daemon.pid";
pub const DEFAULT_LOG: &str = "failover_daemon.log";

/// Polls made while waiting for the daemon to write or remove its pidfile
const CONTROL_RETRIES: u32 = 6;
const CONTROL_DELAY: Duration = Duration::from_millis(250);

/// Pidfile held by a running daemon; removed again on drop
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    pid: u32,
}

impl PidFile {
    /// Claim `path` for the current process.
    ///
    /// Fails if the file names a process that is still alive. A pidfile left
    /// by a dead process is replaced. The pid is written to a temporary file
    /// in the same directory and renamed into place.
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(pid) = running_pid(path)? {
            bail!(
                "Failover daemon is already running with pid {} (pidfile {})",
                pid,
                path.display()
            );
        }

        let pid = std::process::id();
        let parent = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create pidfile directory {}", parent.display()))?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent)
            .with_context(|| format!("Failed to create temp pidfile in {}", parent.display()))?;
        writeln!(tmp, "{}", pid)
            .with_context(|| format!("Failed to write pidfile {}", path.display()))?;
        tmp.persist(path)
            .with_context(|| format!("Failed to persist pidfile {}", path.display()))?;

        tracing::debug!("Wrote pid {} to {}", pid, path.display());
        Ok(Self {
            path: path.to_path_buf(),
            pid,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the pidfile if it still names this process
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        match read_pid(&self.path) {
            Ok(Some(pid)) if pid == self.pid => {
                if let Err(e) = fs::remove_file(&self.path) {
                    tracing::warn!("Cannot remove pidfile {}: {}", self.path.display(), e);
                }
            }
            _ => {}
        }
    }
}

/// Pid stored in `path`, if the file exists
pub fn read_pid(path: &Path) -> Result<Option<u32>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read pidfile {}", path.display()))
        }
    };
    let pid = content
        .trim()
        .parse::<u32>()
        .with_context(|| format!("Pidfile {} does not contain a pid", path.display()))?;
    Ok(Some(pid))
}

/// Pid in `path` if that process is still alive
pub fn running_pid(path: &Path) -> Result<Option<u32>> {
    Ok(read_pid(path)?.filter(|pid| process_alive(*pid)))
}

#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 performs the existence and permission check only
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
    false
}

/// Arguments for the detached child: the current command line with the
/// `start`/`restart` action after `daemon` replaced by `nodetach`
pub fn nodetach_args(args: &[OsString]) -> Result<Vec<OsString>> {
    let daemon = args
        .iter()
        .position(|a| a == "daemon")
        .context("Command line has no daemon subcommand")?;
    let action = args[daemon + 1..]
        .iter()
        .position(|a| a == "start" || a == "restart")
        .map(|offset| daemon + 1 + offset)
        .context("Command line has no start or restart action")?;

    let mut child = args.to_vec();
    child[action] = OsString::from("nodetach");
    Ok(child)
}

/// Launch the daemon in the background.
///
/// The child is this executable with `args`, in its own process group with
/// stdin closed and stdout/stderr appended to `log`. Returns once the child
/// has written its pidfile.
pub async fn start(pidfile: &Path, log: &Path, args: &[OsString]) -> Result<u32> {
    if let Some(pid) = running_pid(pidfile)? {
        bail!("Failover daemon is already running with pid {}", pid);
    }

    let exe = std::env::current_exe().context("Cannot locate the current executable")?;
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log)
        .with_context(|| format!("Failed to open daemon log {}", log.display()))?;
    let stderr = log_file
        .try_clone()
        .with_context(|| format!("Failed to open daemon log {}", log.display()))?;

    let mut command = Command::new(&exe);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log_file))
        .stderr(Stdio::from(stderr));
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    let mut child = command
        .spawn()
        .with_context(|| format!("Failed to spawn {}", exe.display()))?;
    tracing::info!("Spawned failover daemon process {}", child.id());

    let pid = retry_with_backoff(
        || {
            let exited = child.try_wait();
            async move {
                if let Ok(Some(status)) = exited {
                    bail!("Daemon exited during startup with {}", status);
                }
                running_pid(pidfile)?.context("Daemon has not written its pidfile yet")
            }
        },
        CONTROL_RETRIES,
        CONTROL_DELAY,
    )
    .await
    .with_context(|| format!("Failover daemon did not start, see {}", log.display()))?;

    Ok(pid)
}

/// Ask the running daemon to stop and wait for it to remove its pidfile
pub async fn stop(pidfile: &Path) -> Result<u32> {
    let Some(pid) = running_pid(pidfile)? else {
        bail!(
            "Failover daemon is not running (no live pid in {})",
            pidfile.display()
        );
    };

    send_terminate(pid)?;
    tracing::info!("Sent SIGTERM to failover daemon {}", pid);

    retry_with_backoff(
        || async move {
            match running_pid(pidfile)? {
                Some(_) => bail!("Daemon {} is still running", pid),
                None => Ok(()),
            }
        },
        CONTROL_RETRIES,
        CONTROL_DELAY,
    )
    .await
    .with_context(|| format!("Failover daemon {} did not stop", pid))?;

    Ok(pid)
}

#[cfg(unix)]
fn send_terminate(pid: u32) -> Result<()> {
    let target = libc::pid_t::try_from(pid).context("Pid out of range")?;
    // SAFETY: plain kill(2) on a pid read from our own pidfile
    if unsafe { libc::kill(target, libc::SIGTERM) } != 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("Failed to signal process {}", pid));
    }
    Ok(())
}

#[cfg(not(unix))]
fn send_terminate(_pid: u32) -> Result<()> {
    bail!("Stopping the daemon is only supported on Unix")
}
