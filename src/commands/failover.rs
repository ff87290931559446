// ABOUTME: Failover console command: monitor a master in the foreground
// ABOUTME: Connects the topology, then runs the console until shutdown or a fatal error

use crate::config::FailoverConfig;
use crate::errors::{ReplicationError, ReplicationResult};
use crate::failover::{ConsoleSink, FailoverConsole, OutputSink, Shutdown};
use crate::mysql::MySqlConnector;
use crate::topology::Topology;
use anyhow::Result;
use std::sync::Arc;

/// Run the interactive failover console, printing status to stdout
pub async fn failover(config: FailoverConfig, shutdown: Shutdown) -> Result<()> {
    let mut console = connect_console(config, Box::new(ConsoleSink::stdout()), shutdown).await?;
    console.run().await?;
    Ok(())
}

/// Validate `config`, connect its topology and build a console over it
pub async fn connect_console(
    mut config: FailoverConfig,
    sink: Box<dyn OutputSink>,
    shutdown: Shutdown,
) -> ReplicationResult<FailoverConsole> {
    config.validate()?;
    let master = config
        .master
        .clone()
        .ok_or_else(|| ReplicationError::config("a master server is required"))?;

    tracing::info!("Connecting to master {}", master);
    let topology = Topology::connect(
        Arc::new(MySqlConnector),
        &master,
        &config.slaves,
        config.discover_slaves,
    )
    .await?;

    FailoverConsole::new(config, topology, sink, shutdown)
}
