// ABOUTME: Failover daemon command: start, stop, restart or run without detaching
// ABOUTME: The detached daemon is this binary re-run with the nodetach action

use super::failover::connect_console;
use crate::config::FailoverConfig;
use crate::daemon::{self, PidFile, DEFAULT_LOG, DEFAULT_PIDFILE};
use crate::failover::{LogSink, Shutdown};
use anyhow::Result;
use clap::ValueEnum;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DaemonAction {
    /// Detach and monitor in the background
    Start,
    /// Stop a running daemon
    Stop,
    /// Stop the running daemon, then start a new one
    Restart,
    /// Monitor in the foreground with daemon logging and pidfile
    Nodetach,
}

pub async fn daemon(
    action: DaemonAction,
    mut config: FailoverConfig,
    shutdown: Shutdown,
) -> Result<()> {
    let pidfile = config
        .pidfile
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_PIDFILE));

    match action {
        DaemonAction::Start => start(&mut config, &pidfile).await,
        DaemonAction::Stop => {
            let pid = daemon::stop(&pidfile).await?;
            println!("Failover daemon {} stopped", pid);
            Ok(())
        }
        DaemonAction::Restart => {
            if daemon::running_pid(&pidfile)?.is_some() {
                let pid = daemon::stop(&pidfile).await?;
                println!("Failover daemon {} stopped", pid);
            }
            start(&mut config, &pidfile).await
        }
        DaemonAction::Nodetach => nodetach(config, &pidfile, shutdown).await,
    }
}

async fn start(config: &mut FailoverConfig, pidfile: &std::path::Path) -> Result<()> {
    // Report option mistakes here rather than in the detached log
    config.validate()?;
    let log = config
        .log
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG));

    let args: Vec<_> = std::env::args_os().skip(1).collect();
    let child_args = daemon::nodetach_args(&args)?;
    let pid = daemon::start(pidfile, &log, &child_args).await?;

    println!(
        "Failover daemon started with pid {} (log {}, pidfile {})",
        pid,
        log.display(),
        pidfile.display()
    );
    Ok(())
}

async fn nodetach(
    config: FailoverConfig,
    pidfile: &std::path::Path,
    shutdown: Shutdown,
) -> Result<()> {
    let pidfile = PidFile::acquire(pidfile)?;
    tracing::info!(
        "Failover daemon running with pid {} (pidfile {})",
        std::process::id(),
        pidfile.path().display()
    );

    let result = match connect_console(config, Box::new(LogSink), shutdown).await {
        Ok(mut console) => console.run().await,
        Err(e) => Err(e),
    };

    pidfile.release();
    tracing::info!("Failover daemon stopped");
    result?;
    Ok(())
}
