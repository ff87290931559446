// ABOUTME: Replication topology: one master plus ordered slaves behind a Server trait
// ABOUTME: Discovers slaves, checks GTID mode and privileges, finds errant transactions

pub mod report;

pub use report::{GtidRow, HealthRow, UuidRow};

use crate::errors::{ErrantReplica, ReplicationError, ReplicationResult};
use crate::gtid::{self, Gtid, GtidSet};
use crate::mysql::ServerAddress;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Privileges the console account needs on every server it may promote or repoint
pub const REQUIRED_PRIVILEGES: &[&str] = &[
    "SUPER",
    "REPLICATION SLAVE",
    "GRANT OPTION",
    "SELECT",
    "RELOAD",
    "DROP",
    "CREATE",
    "INSERT",
];

/// Row of `SHOW MASTER STATUS`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MasterStatus {
    pub binlog_file: String,
    pub position: u64,
    pub executed_gtid_set: String,
}

/// Row of `SHOW SLAVE STATUS`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlaveStatus {
    pub master_host: String,
    pub master_port: u16,
    pub io_running: bool,
    pub sql_running: bool,
    pub seconds_behind: Option<u64>,
    pub retrieved_gtid_set: String,
    pub executed_gtid_set: String,
    pub last_io_error: String,
    pub last_sql_error: String,
}

/// Arguments of `CHANGE MASTER TO` for repointing a slave
#[derive(Debug, Clone)]
pub struct ChangeMasterTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

/// One live server connection.
///
/// Implemented over `mysql_async` for real servers and by in-memory fakes in
/// tests. Every query method fails when the server is unreachable.
#[async_trait]
pub trait Server: Send {
    fn address(&self) -> &ServerAddress;

    /// Ping plus a lightweight query; never errors. A failed probe drops the
    /// connection until `reconnect`, see [`reachable`].
    async fn is_alive(&mut self) -> bool;

    /// Drop the current connection and open a new one
    async fn reconnect(&mut self) -> Result<()>;

    async fn server_uuid(&mut self) -> Result<String>;
    async fn gtid_mode_enabled(&mut self) -> Result<bool>;
    async fn gtid_executed(&mut self) -> Result<String>;
    async fn gtid_purged(&mut self) -> Result<String>;
    async fn gtid_owned(&mut self) -> Result<String>;

    async fn master_status(&mut self) -> Result<Option<MasterStatus>>;
    async fn slave_status(&mut self) -> Result<Option<SlaveStatus>>;

    /// Slaves registered with this server as `(host, port)`
    async fn slave_hosts(&mut self) -> Result<Vec<(String, u16)>>;

    /// Subset of `required` the connected account lacks
    async fn missing_privileges(&mut self, required: &[&str]) -> Result<Vec<String>>;

    async fn stop_slave(&mut self) -> Result<()>;
    async fn start_slave(&mut self) -> Result<()>;
    async fn reset_slave_all(&mut self) -> Result<()>;
    async fn change_master(&mut self, target: &ChangeMasterTarget) -> Result<()>;

    /// Block until `gtid_set` is executed; `false` on timeout
    async fn wait_for_executed(&mut self, gtid_set: &str, timeout: Duration) -> Result<bool>;

    /// Commit an empty transaction under `gtid`
    async fn inject_empty_transaction(&mut self, gtid: &Gtid) -> Result<()>;

    /// Insert the console registration row for `(host, port)` with binary
    /// logging suspended. Returns `false` when a row already exists.
    async fn register_console(&mut self, host: &str, port: u16, force: bool) -> Result<bool>;

    async fn unregister_console(&mut self, host: &str, port: u16) -> Result<()>;

    async fn console_registered(&mut self, host: &str, port: u16) -> Result<bool>;
}

/// Liveness probe that reopens a dropped connection once before giving up.
///
/// Slaves are probed through this so a single network blip does not take
/// them out of elections and reports for the rest of the run. Master
/// failure detection keeps its own spaced reconnect schedule.
pub async fn reachable(server: &mut dyn Server) -> bool {
    if server.is_alive().await {
        return true;
    }
    match server.reconnect().await {
        Ok(()) => {
            tracing::debug!("Reconnected to {}", server.address());
            server.is_alive().await
        }
        Err(e) => {
            tracing::debug!("Cannot reconnect to {}: {:#}", server.address(), e);
            false
        }
    }
}

/// Opens servers by address
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, address: &ServerAddress) -> Result<Box<dyn Server>>;
}

/// Master plus slaves as seen by one console
pub struct Topology {
    master: Option<Box<dyn Server>>,
    slaves: Vec<Box<dyn Server>>,
    connector: Arc<dyn Connector>,
    /// Slaves named by the operator, reconnected on every rediscovery
    configured_slaves: Vec<ServerAddress>,
    discover: bool,
}

impl Topology {
    pub fn new(
        master: Option<Box<dyn Server>>,
        slaves: Vec<Box<dyn Server>>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            master,
            slaves,
            connector,
            configured_slaves: Vec::new(),
            discover: false,
        }
    }

    /// Connect to the master and the listed slaves.
    ///
    /// With `discover` set, slaves reported by `SHOW SLAVE HOSTS` on the
    /// master are added too. Unreachable slaves are skipped with a warning;
    /// an unreachable master is a connectivity error.
    pub async fn connect(
        connector: Arc<dyn Connector>,
        master: &ServerAddress,
        slaves: &[ServerAddress],
        discover: bool,
    ) -> ReplicationResult<Self> {
        let master_server = connector
            .connect(master)
            .await
            .map_err(|e| ReplicationError::connectivity(&master.host, master.port, e))?;

        let mut topology = Self::new(Some(master_server), Vec::new(), connector);
        topology.configured_slaves = slaves.to_vec();
        topology.discover = discover;
        topology.discover_slaves().await;
        Ok(topology)
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::clone(&self.connector)
    }

    pub fn master(&self) -> Option<&dyn Server> {
        self.master.as_deref()
    }

    pub fn master_mut(&mut self) -> Option<&mut Box<dyn Server>> {
        self.master.as_mut()
    }

    pub fn master_address(&self) -> Option<ServerAddress> {
        self.master.as_ref().map(|m| m.address().clone())
    }

    pub fn slaves(&self) -> &[Box<dyn Server>] {
        &self.slaves
    }

    pub fn slaves_mut(&mut self) -> &mut Vec<Box<dyn Server>> {
        &mut self.slaves
    }

    pub fn slave_addresses(&self) -> Vec<ServerAddress> {
        self.slaves.iter().map(|s| s.address().clone()).collect()
    }

    /// Swap in a new master, returning the old one
    pub fn replace_master(&mut self, master: Box<dyn Server>) -> Option<Box<dyn Server>> {
        let new_address = master.address().clone();
        self.slaves.retain(|s| s.address() != &new_address);
        self.configured_slaves.retain(|a| a != &new_address);
        self.master.replace(master)
    }

    /// Take a slave out of the topology by address
    pub fn remove_slave(&mut self, address: &ServerAddress) -> Option<Box<dyn Server>> {
        let index = self.slaves.iter().position(|s| s.address() == address)?;
        Some(self.slaves.remove(index))
    }

    /// Rebuild the slave list from the configured slaves and, when enabled,
    /// the master's `SHOW SLAVE HOSTS`. Existing connections are reused.
    pub async fn discover_slaves(&mut self) {
        let mut wanted = self.configured_slaves.clone();
        for slave in &self.slaves {
            if !wanted.contains(slave.address()) {
                wanted.push(slave.address().clone());
            }
        }

        if self.discover {
            if let Some(master) = self.master.as_mut() {
                match master.slave_hosts().await {
                    Ok(hosts) => {
                        for (host, port) in hosts {
                            let address = master.address().with_endpoint(&host, port);
                            if !wanted.contains(&address) {
                                wanted.push(address);
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(
                            "Cannot list slaves of {}: {:#}",
                            master.address(),
                            e
                        );
                    }
                }
            }
        }

        let master_address = self.master_address();
        let mut existing = std::mem::take(&mut self.slaves);
        for address in wanted {
            if master_address.as_ref() == Some(&address) {
                continue;
            }
            if let Some(index) = existing.iter().position(|s| s.address() == &address) {
                self.slaves.push(existing.remove(index));
                continue;
            }
            match self.connector.connect(&address).await {
                Ok(server) => {
                    tracing::debug!("Added slave {}", address);
                    self.slaves.push(server);
                }
                Err(e) => {
                    tracing::warn!("Skipping unreachable slave {}: {:#}", address, e);
                }
            }
        }
    }

    /// Every reachable server must run with GTID_MODE=ON
    pub async fn check_gtid_mode(&mut self) -> ReplicationResult<()> {
        let mut disabled = Vec::new();
        for server in self.servers_mut() {
            match server.gtid_mode_enabled().await {
                Ok(true) => {}
                Ok(false) => disabled.push(server.address().to_string()),
                Err(e) => {
                    tracing::warn!(
                        "Cannot read GTID_MODE on {}: {:#}",
                        server.address(),
                        e
                    );
                }
            }
        }

        if !disabled.is_empty() {
            return Err(ReplicationError::config(format!(
                "GTID_MODE must be ON on all servers, but is off on: {}",
                disabled.join(", ")
            )));
        }
        Ok(())
    }

    /// The master account must hold every privilege in `required`
    pub async fn check_master_privileges(&mut self, required: &[&str]) -> ReplicationResult<()> {
        let master = self
            .master
            .as_mut()
            .ok_or_else(|| ReplicationError::config("topology has no master"))?;
        let address = master.address().clone();
        let missing = master
            .missing_privileges(required)
            .await
            .map_err(|e| ReplicationError::connectivity(&address.host, address.port, e))?;

        if !missing.is_empty() {
            return Err(ReplicationError::config(format!(
                "user {} on {} is missing privileges: {}",
                address.user.as_deref().unwrap_or("(default)"),
                address,
                missing.join(", ")
            )));
        }
        Ok(())
    }

    /// Slaves whose executed set holds transactions absent from the master
    pub async fn find_errant_transactions(&mut self) -> ReplicationResult<Vec<ErrantReplica>> {
        let master = self
            .master
            .as_mut()
            .ok_or_else(|| ReplicationError::config("topology has no master"))?;
        let address = master.address().clone();
        let master_set = master
            .gtid_executed()
            .await
            .map_err(|e| ReplicationError::connectivity(&address.host, address.port, e))?;
        let master_set = gtid::parse(&master_set)?;

        let mut errant = Vec::new();
        for slave in self.slaves.iter_mut() {
            if !reachable(slave.as_mut()).await {
                tracing::warn!("Slave {} is not reachable, skipping errant check", slave.address());
                continue;
            }
            let executed = match slave.gtid_executed().await {
                Ok(executed) => executed,
                Err(e) => {
                    tracing::warn!(
                        "Cannot read GTID_EXECUTED on {}: {:#}",
                        slave.address(),
                        e
                    );
                    continue;
                }
            };
            let extra: GtidSet = gtid::parse(&executed)?.subtract(&master_set);
            if !extra.is_empty() {
                errant.push(ErrantReplica {
                    host: slave.address().host.clone(),
                    port: slave.address().port,
                    gtids: extra.to_string(),
                });
            }
        }
        Ok(errant)
    }

    fn servers_mut(&mut self) -> impl Iterator<Item = &mut Box<dyn Server>> {
        self.master.iter_mut().chain(self.slaves.iter_mut())
    }
}
