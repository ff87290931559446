// ABOUTME: Clear a failover console registration left behind on a master
// ABOUTME: Asks for confirmation unless --yes is given

use crate::failover::registration;
use crate::mysql::{MySqlConnector, ServerAddress};
use crate::topology::Topology;
use anyhow::{Context, Result};
use dialoguer::{theme::ColorfulTheme, Confirm};
use std::sync::Arc;

/// Delete the registration row for `master` on the master and its slaves
pub async fn unregister(master: &ServerAddress, slaves: &[ServerAddress], yes: bool) -> Result<()> {
    if !yes {
        let confirmed = Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt(format!(
                "Remove the failover console registration for {}? A running console may be left unprotected",
                master
            ))
            .default(false)
            .interact()
            .context("Failed to get confirmation")?;
        if !confirmed {
            tracing::warn!("⚠ Unregister cancelled by user");
            return Ok(());
        }
    }

    let mut topology = Topology::connect(Arc::new(MySqlConnector), master, slaves, false).await?;
    registration::unregister_slaves(&mut topology, master).await;
    if registration::clear(&mut topology).await? {
        println!("Removed failover console registration for {}", master);
    } else {
        println!("No failover console is registered for {}", master);
    }
    Ok(())
}
