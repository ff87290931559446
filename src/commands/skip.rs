// ABOUTME: Skip transactions on slaves by committing empty transactions for their GTIDs
// ABOUTME: Replication is stopped around the injection; already executed GTIDs are left alone

use crate::gtid::{self, Gtid, GtidSet};
use crate::mysql::{MySqlConnector, ServerAddress};
use crate::topology::{Connector, Server};
use anyhow::{Context, Result};

/// Inject one empty transaction per GTID of `gtid_set` on every slave.
///
/// With `dry_run` the GTIDs that would be injected are only printed.
pub async fn skip_transactions(
    slaves: &[ServerAddress],
    gtid_set: &str,
    dry_run: bool,
) -> Result<()> {
    if slaves.is_empty() {
        anyhow::bail!("At least one slave is required");
    }
    let requested = gtid::parse(gtid_set)?;

    let connector = MySqlConnector;
    for address in slaves {
        let mut server = connector.connect(address).await?;
        let skipped = skip_on_server(server.as_mut(), &requested, dry_run).await?;
        if skipped.is_empty() {
            println!("{}: nothing to skip", address);
            continue;
        }
        let verb = if dry_run { "would skip" } else { "skipped" };
        println!("{}: {} {} transaction(s)", address, verb, skipped.len());
        for gtid in &skipped {
            println!("  {}", gtid);
        }
    }
    Ok(())
}

/// GTIDs of `requested` the server has not executed, in set order
pub async fn pending_on_server(server: &mut dyn Server, requested: &GtidSet) -> Result<Vec<Gtid>> {
    let executed = server.gtid_executed().await?;
    let pending = requested.subtract(&gtid::parse(&executed)?);

    let mut gtids = Vec::new();
    for (uuid, sequences) in gtid::itemize(&pending.to_string())? {
        for sequence in sequences {
            gtids.push(Gtid::new(&uuid, sequence)?);
        }
    }
    Ok(gtids)
}

/// Skip `requested` on one server and return the GTIDs injected
pub async fn skip_on_server(
    server: &mut dyn Server,
    requested: &GtidSet,
    dry_run: bool,
) -> Result<Vec<Gtid>> {
    let address = server.address().clone();
    let gtids = pending_on_server(server, requested).await?;
    if gtids.is_empty() || dry_run {
        return Ok(gtids);
    }

    server
        .stop_slave()
        .await
        .with_context(|| format!("Failed to stop replication on {}", address))?;

    let mut injected = Ok(());
    for gtid in &gtids {
        tracing::debug!("Injecting empty transaction {} on {}", gtid, address);
        if let Err(e) = server.inject_empty_transaction(gtid).await {
            injected = Err(e).with_context(|| format!("Failed to skip {} on {}", gtid, address));
            break;
        }
    }

    // Replication is restarted even when an injection failed
    server
        .start_slave()
        .await
        .with_context(|| format!("Failed to start replication on {}", address))?;
    injected?;

    tracing::info!("Skipped {} transaction(s) on {}", gtids.len(), address);
    Ok(gtids)
}
