// ABOUTME: Promotes an elected slave to master and repoints the remaining slaves
// ABOUTME: Drains the candidate's relay log first so no retrieved transaction is lost

use crate::config::ReplicationUser;
use crate::errors::{ReplicationError, ReplicationResult};
use crate::gtid;
use crate::mysql::ServerAddress;
use crate::topology::{ChangeMasterTarget, Server, Topology, REQUIRED_PRIVILEGES};
use std::time::Duration;

/// Make `candidate` the topology's master.
///
/// Order: privilege check, relay log drain, stop every other slave, stop and
/// reset the candidate, repoint and restart the other slaves, swap the
/// topology's master reference. Slaves that cannot be stopped or repointed
/// are dropped from the topology with a warning. A failure on the candidate
/// aborts the promotion after restarting replication everywhere it was
/// stopped.
pub async fn promote(
    topology: &mut Topology,
    mut candidate: Box<dyn Server>,
    rpl_user: Option<&ReplicationUser>,
    timeout: Duration,
    failed_master: &ServerAddress,
) -> ReplicationResult<()> {
    let fail = |reason: String| {
        ReplicationError::promotion(&failed_master.host, failed_master.port, reason)
    };
    let new_master = candidate.address().clone();

    let target = change_master_target(&new_master, rpl_user).ok_or_else(|| {
        fail(format!(
            "no replication user given and {} has no credentials to reuse",
            new_master
        ))
    })?;

    let missing = candidate
        .missing_privileges(REQUIRED_PRIVILEGES)
        .await
        .map_err(|e| fail(format!("cannot check privileges on {}: {:#}", new_master, e)))?;
    if !missing.is_empty() {
        return Err(fail(format!(
            "{} is missing privileges: {}",
            new_master,
            missing.join(", ")
        )));
    }

    drain_relay_log(candidate.as_mut(), timeout).await;

    let mut unreachable = Vec::new();
    for slave in topology.slaves_mut().iter_mut() {
        if let Err(e) = slave.stop_slave().await {
            tracing::warn!("Cannot stop slave {}: {:#}", slave.address(), e);
            unreachable.push(slave.address().clone());
        }
    }
    for address in &unreachable {
        topology.remove_slave(address);
    }

    if let Err(e) = candidate.stop_slave().await {
        restart_slaves(topology, candidate.as_mut()).await;
        return Err(fail(format!(
            "cannot stop replication on {}: {:#}",
            new_master, e
        )));
    }
    if let Err(e) = candidate.reset_slave_all().await {
        restart_slaves(topology, candidate.as_mut()).await;
        return Err(fail(format!(
            "cannot reset replication on {}: {:#}",
            new_master, e
        )));
    }

    let mut lost = Vec::new();
    for slave in topology.slaves_mut().iter_mut() {
        let repointed = match slave.change_master(&target).await {
            Ok(()) => slave.start_slave().await,
            Err(e) => Err(e),
        };
        match repointed {
            Ok(()) => tracing::info!("Slave {} now replicates from {}", slave.address(), new_master),
            Err(e) => {
                tracing::warn!("Cannot repoint slave {}: {:#}", slave.address(), e);
                lost.push(slave.address().clone());
            }
        }
    }
    for address in &lost {
        topology.remove_slave(address);
    }

    topology.replace_master(candidate);
    tracing::info!("Promoted {} to master", new_master);
    Ok(())
}

/// Resume replication on every server stopped for an aborted promotion
async fn restart_slaves(topology: &mut Topology, candidate: &mut dyn Server) {
    for slave in topology.slaves_mut().iter_mut() {
        restart_slave(slave.as_mut()).await;
    }
    restart_slave(candidate).await;
}

async fn restart_slave(server: &mut dyn Server) {
    match server.start_slave().await {
        Ok(()) => tracing::info!("Restarted replication on {}", server.address()),
        Err(e) => tracing::warn!("Cannot restart replication on {}: {:#}", server.address(), e),
    }
}

/// Wait for the candidate to apply everything it already retrieved
async fn drain_relay_log(candidate: &mut dyn Server, timeout: Duration) {
    let status = match candidate.slave_status().await {
        Ok(Some(status)) => status,
        Ok(None) => return,
        Err(e) => {
            tracing::warn!("Cannot read slave status of {}: {:#}", candidate.address(), e);
            return;
        }
    };

    let pending = if status.executed_gtid_set.is_empty() {
        status.retrieved_gtid_set.clone()
    } else {
        gtid::subtract(&status.retrieved_gtid_set, &status.executed_gtid_set)
            .unwrap_or_else(|_| status.retrieved_gtid_set.clone())
    };
    if pending.is_empty() {
        return;
    }

    tracing::info!(
        "Waiting for {} to apply relay log transactions {}",
        candidate.address(),
        pending
    );
    match candidate
        .wait_for_executed(&status.retrieved_gtid_set, timeout)
        .await
    {
        Ok(true) => {}
        Ok(false) => tracing::warn!(
            "{} did not apply its relay log within {} seconds",
            candidate.address(),
            timeout.as_secs()
        ),
        Err(e) => tracing::warn!("{:#}", e),
    }
}

fn change_master_target(
    new_master: &ServerAddress,
    rpl_user: Option<&ReplicationUser>,
) -> Option<ChangeMasterTarget> {
    let (user, password) = match rpl_user {
        Some(rpl) => (rpl.user.clone(), rpl.password.clone()),
        None => (
            new_master.user.clone()?,
            new_master.password.clone().unwrap_or_default(),
        ),
    };
    Some(ChangeMasterTarget {
        host: new_master.host.clone(),
        port: new_master.port,
        user,
        password,
    })
}
