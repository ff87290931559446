// ABOUTME: Elects the replacement master from operator candidates or the slave list
// ABOUTME: A server qualifies only if it has applied every transaction its peers have

use crate::errors::{ReplicationError, ReplicationResult};
use crate::gtid::{self, GtidSet};
use crate::mysql::ServerAddress;
use crate::topology::{reachable, Server, Topology};

/// Why a server was passed over
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ineligible {
    Unreachable,
    GtidModeOff,
    Unreadable(String),
    /// Transactions other slaves applied that this one lacks
    Missing(String),
}

/// GTID standing of an eligible server
#[derive(Debug, Clone)]
struct Standing {
    executed: GtidSet,
    errant: u128,
}

/// Pick the server to promote and detach it from the topology's slave list.
///
/// Candidates are tried in order and the first eligible one wins. When no
/// candidate qualifies, every slave is scanned and the one with the fewest
/// errant transactions (relative to `reference`, the master's last known
/// executed set) and then the most applied transactions is chosen; ties go
/// to the earlier slave.
pub async fn elect(
    topology: &mut Topology,
    candidates: &[ServerAddress],
    reference: Option<&GtidSet>,
    failed_master: &ServerAddress,
) -> ReplicationResult<Box<dyn Server>> {
    let peers = applied_by_slaves(topology).await;

    for address in candidates {
        if topology.slave_addresses().contains(address) {
            let slave = topology
                .slaves_mut()
                .iter_mut()
                .find(|s| s.address() == address);
            if let Some(slave) = slave {
                match assess(slave.as_mut(), &peers, reference).await {
                    Ok(_) => {
                        tracing::info!("Candidate {} selected as new master", address);
                        return topology.remove_slave(address).ok_or_else(|| {
                            ReplicationError::promotion(
                                &failed_master.host,
                                failed_master.port,
                                format!("candidate {} vanished from topology", address),
                            )
                        });
                    }
                    Err(reason) => log_ineligible(address, &reason),
                }
            }
            continue;
        }

        let mut server = match topology.connector().connect(address).await {
            Ok(server) => server,
            Err(e) => {
                tracing::warn!("Candidate {} is not reachable: {:#}", address, e);
                continue;
            }
        };
        match assess(server.as_mut(), &peers, reference).await {
            Ok(_) => {
                tracing::info!("Candidate {} selected as new master", address);
                return Ok(server);
            }
            Err(reason) => log_ineligible(address, &reason),
        }
    }

    if !candidates.is_empty() {
        tracing::warn!("No candidate is eligible, searching slaves for a new master");
    }

    let mut best: Option<(ServerAddress, Standing)> = None;
    for slave in topology.slaves_mut().iter_mut() {
        let address = slave.address().clone();
        match assess(slave.as_mut(), &peers, reference).await {
            Ok(standing) => {
                let better = match &best {
                    None => true,
                    Some((_, current)) => ranks_above(&standing, current),
                };
                if better {
                    best = Some((address, standing));
                }
            }
            Err(reason) => log_ineligible(&address, &reason),
        }
    }

    let Some((address, standing)) = best else {
        return Err(ReplicationError::promotion(
            &failed_master.host,
            failed_master.port,
            "no eligible candidate or slave found",
        ));
    };
    tracing::info!(
        "Slave {} selected as new master ({} transactions, {} errant)",
        address,
        standing.executed.cardinality(),
        standing.errant
    );
    topology.remove_slave(&address).ok_or_else(|| {
        ReplicationError::promotion(
            &failed_master.host,
            failed_master.port,
            format!("slave {} vanished from topology", address),
        )
    })
}

/// Union of what every reachable slave has executed
async fn applied_by_slaves(topology: &mut Topology) -> GtidSet {
    let mut applied = GtidSet::new();
    for slave in topology.slaves_mut().iter_mut() {
        if !reachable(slave.as_mut()).await {
            continue;
        }
        match slave.gtid_executed().await {
            Ok(text) => match gtid::parse(&text) {
                Ok(set) => applied = applied.union(&set),
                Err(e) => tracing::warn!("Ignoring GTID set of {}: {}", slave.address(), e),
            },
            Err(e) => tracing::warn!("Cannot read GTID_EXECUTED on {}: {:#}", slave.address(), e),
        }
    }
    applied
}

async fn assess(
    server: &mut dyn Server,
    peers: &GtidSet,
    reference: Option<&GtidSet>,
) -> Result<Standing, Ineligible> {
    if !reachable(server).await {
        return Err(Ineligible::Unreachable);
    }
    match server.gtid_mode_enabled().await {
        Ok(true) => {}
        Ok(false) => return Err(Ineligible::GtidModeOff),
        Err(e) => return Err(Ineligible::Unreadable(format!("{:#}", e))),
    }
    let executed = server
        .gtid_executed()
        .await
        .map_err(|e| Ineligible::Unreadable(format!("{:#}", e)))?;
    let executed = gtid::parse(&executed).map_err(|e| Ineligible::Unreadable(e.to_string()))?;

    let missing = peers.subtract(&executed);
    if !missing.is_empty() {
        return Err(Ineligible::Missing(missing.to_string()));
    }

    let errant = reference
        .map(|master| executed.subtract(master).cardinality())
        .unwrap_or(0);
    Ok(Standing { executed, errant })
}

fn ranks_above(challenger: &Standing, current: &Standing) -> bool {
    (challenger.errant, std::cmp::Reverse(challenger.executed.cardinality()))
        < (current.errant, std::cmp::Reverse(current.executed.cardinality()))
}

fn log_ineligible(address: &ServerAddress, reason: &Ineligible) {
    match reason {
        Ineligible::Unreachable => tracing::warn!("{} is not reachable", address),
        Ineligible::GtidModeOff => tracing::warn!("{} does not have GTID_MODE=ON", address),
        Ineligible::Unreadable(e) => tracing::warn!("Cannot read GTIDs of {}: {}", address, e),
        Ineligible::Missing(gtids) => {
            tracing::warn!("{} is missing transactions {}", address, gtids)
        }
    }
}
