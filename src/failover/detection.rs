// ABOUTME: Master failure detection: built-in reconnect probing or an external check script
// ABOUTME: Transient failures stay local; only the final verdict is reported

use super::hooks;
use super::shutdown::Shutdown;
use crate::config::{FailoverConfig, RECONNECT_ATTEMPTS};
use crate::mysql::ServerAddress;
use crate::topology::Server;
use anyhow::Result;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Verdict of one liveness check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    Alive,
    Failed,
    /// Shutdown was requested while probing
    Cancelled,
}

/// How the console decides the master is down
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Detection {
    BuiltIn(ProbePolicy),
    /// Exit code 0 means healthy, anything else triggers failover
    Script(PathBuf),
}

impl Detection {
    pub fn from_config(config: &FailoverConfig) -> Self {
        match &config.exec_fail_check {
            Some(script) => Detection::Script(script.clone()),
            None => Detection::BuiltIn(ProbePolicy {
                attempts: RECONNECT_ATTEMPTS,
                pingtime: config.pingtime,
                fail_retry: config.fail_retry,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbePolicy {
    pub attempts: u32,
    pub pingtime: Duration,
    pub fail_retry: Option<Duration>,
}

/// Try to reconnect to a master whose liveness probe just failed.
///
/// Makes `attempts` reconnects spaced by `pingtime`, then, if `fail_retry`
/// is set, waits that long and probes one last time.
pub async fn confirm_failure(
    master: &mut dyn Server,
    policy: &ProbePolicy,
    shutdown: &mut Shutdown,
) -> Probe {
    for attempt in 1..=policy.attempts {
        if shutdown.sleep(policy.pingtime).await {
            return Probe::Cancelled;
        }
        tracing::debug!(
            "Reconnect attempt {}/{} to master {}",
            attempt,
            policy.attempts,
            master.address()
        );
        if reconnect(master).await {
            return Probe::Alive;
        }
    }

    if let Some(fail_retry) = policy.fail_retry {
        tracing::info!(
            "Master {} still unreachable, final check in {} seconds",
            master.address(),
            fail_retry.as_secs()
        );
        if shutdown.sleep(fail_retry).await {
            return Probe::Cancelled;
        }
        if reconnect(master).await {
            return Probe::Alive;
        }
    }

    Probe::Failed
}

async fn reconnect(master: &mut dyn Server) -> bool {
    match master.reconnect().await {
        Ok(()) => master.is_alive().await,
        Err(e) => {
            tracing::debug!("Reconnect to {} failed: {:#}", master.address(), e);
            false
        }
    }
}

/// Run the external failure check script against the master
pub async fn check_with_script(
    script: &Path,
    master: &ServerAddress,
    shutdown: &mut Shutdown,
) -> Result<Probe> {
    let args = hooks::hook_args(master, None);
    match shutdown.run(hooks::run_script(script, &args)).await {
        None => Ok(Probe::Cancelled),
        Some(result) => {
            let code = result?;
            if code == 0 {
                Ok(Probe::Alive)
            } else {
                tracing::warn!(
                    "Failure check script {} reported exit code {} for master {}",
                    script.display(),
                    code,
                    master
                );
                Ok(Probe::Failed)
            }
        }
    }
}
