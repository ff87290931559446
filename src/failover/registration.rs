// ABOUTME: Console registration in the sentinel table on the watched master
// ABOUTME: Keeps two consoles from acting on the same master at once

use crate::errors::{ReplicationError, ReplicationResult};
use crate::mysql::ServerAddress;
use crate::topology::Topology;

/// Outcome of trying to register against a master
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    Registered,
    /// Another console already holds the registration row
    Conflict(ServerAddress),
}

/// Remove stale rows for `master` from every slave, skipping unreachable ones
pub async fn unregister_slaves(topology: &mut Topology, master: &ServerAddress) {
    for slave in topology.slaves_mut().iter_mut() {
        if let Err(e) = slave.unregister_console(&master.host, master.port).await {
            tracing::debug!(
                "Cannot clear registration on slave {}: {:#}",
                slave.address(),
                e
            );
        }
    }
}

/// Register this console against the current master.
///
/// Stale rows on the slaves are cleared first. The insert is conditional on
/// the `(host, port)` primary key, so of two consoles racing only one gets
/// `Registered`. With `force` an existing row is replaced.
pub async fn register(topology: &mut Topology, force: bool) -> ReplicationResult<Registration> {
    let address = topology
        .master_address()
        .ok_or_else(|| ReplicationError::config("topology has no master"))?;

    unregister_slaves(topology, &address).await;

    let master = topology
        .master_mut()
        .ok_or_else(|| ReplicationError::config("topology has no master"))?;
    let inserted = master
        .register_console(&address.host, address.port, force)
        .await
        .map_err(|e| ReplicationError::connectivity(&address.host, address.port, e))?;

    if inserted {
        tracing::info!("Registered failover console for master {}", address);
        Ok(Registration::Registered)
    } else {
        Ok(Registration::Conflict(address))
    }
}

/// Drop this console's registration from the master, if reachable
pub async fn unregister(topology: &mut Topology) {
    let Some(master) = topology.master_mut() else {
        return;
    };
    let address = master.address().clone();
    match master.unregister_console(&address.host, address.port).await {
        Ok(()) => tracing::info!("Unregistered failover console for master {}", address),
        Err(e) => tracing::debug!("Cannot unregister from {}: {:#}", address, e),
    }
}

/// Move the registration from the failed master to the newly promoted one.
///
/// The old row is removed wherever it can still be reached (the new master
/// and the slaves, which may have replicated it), then the new master's row
/// is inserted.
pub async fn reregister(
    topology: &mut Topology,
    old_master: &ServerAddress,
) -> ReplicationResult<Registration> {
    if let Some(master) = topology.master_mut() {
        if let Err(e) = master
            .unregister_console(&old_master.host, old_master.port)
            .await
        {
            tracing::debug!("Cannot clear old registration on new master: {:#}", e);
        }
    }
    unregister_slaves(topology, old_master).await;
    register(topology, false).await
}

/// Delete a registration row directly, e.g. one left by a crashed console
pub async fn clear(topology: &mut Topology) -> ReplicationResult<bool> {
    let master = topology
        .master_mut()
        .ok_or_else(|| ReplicationError::config("topology has no master"))?;
    let address = master.address().clone();
    let connectivity = |e| ReplicationError::connectivity(&address.host, address.port, e);

    let registered = master
        .console_registered(&address.host, address.port)
        .await
        .map_err(connectivity)?;
    if registered {
        master
            .unregister_console(&address.host, address.port)
            .await
            .map_err(connectivity)?;
    }
    Ok(registered)
}
