// ABOUTME: Health, GTID and UUID reports over a replication topology
// ABOUTME: Produces serializable rows consumed by the console sinks and health command

use super::{reachable, Server, SlaveStatus, Topology};
use crate::mysql::ServerAddress;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthRow {
    pub host: String,
    pub port: u16,
    pub role: String,
    pub state: String,
    pub gtid_mode: String,
    pub health: String,
}

impl HealthRow {
    pub const HEADERS: [&'static str; 6] = ["host", "port", "role", "state", "gtid_mode", "health"];

    pub fn is_ok(&self) -> bool {
        self.health == "OK"
    }

    pub fn cells(&self) -> Vec<String> {
        vec![
            self.host.clone(),
            self.port.to_string(),
            self.role.clone(),
            self.state.clone(),
            self.gtid_mode.clone(),
            self.health.clone(),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GtidRow {
    pub host: String,
    pub port: u16,
    pub role: String,
    pub executed: String,
    pub purged: String,
    pub owned: String,
}

impl GtidRow {
    pub const HEADERS: [&'static str; 6] = ["host", "port", "role", "executed", "purged", "owned"];

    pub fn cells(&self) -> Vec<String> {
        vec![
            self.host.clone(),
            self.port.to_string(),
            self.role.clone(),
            self.executed.clone(),
            self.purged.clone(),
            self.owned.clone(),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UuidRow {
    pub host: String,
    pub port: u16,
    pub role: String,
    pub uuid: String,
}

impl UuidRow {
    pub const HEADERS: [&'static str; 4] = ["host", "port", "role", "uuid"];

    pub fn cells(&self) -> Vec<String> {
        vec![
            self.host.clone(),
            self.port.to_string(),
            self.role.clone(),
            self.uuid.clone(),
        ]
    }
}

const MASTER: &str = "MASTER";
const SLAVE: &str = "SLAVE";

impl Topology {
    /// One health row per server, master first.
    ///
    /// A slave is healthy when both replication threads run, it replicates
    /// from the current master, and (with `max_delay > 0`) it lags no more
    /// than `max_delay` seconds.
    pub async fn health(&mut self, max_delay: u64) -> Vec<HealthRow> {
        let master_address = self.master_address();
        let mut rows = Vec::new();

        if let Some(master) = self.master.as_mut() {
            let alive = reachable(master.as_mut()).await;
            let issues = if alive {
                Vec::new()
            } else {
                vec!["Cannot connect to server".to_string()]
            };
            rows.push(health_row(master.as_mut(), MASTER, alive, issues).await);
        }

        for slave in self.slaves.iter_mut() {
            let alive = reachable(slave.as_mut()).await;
            let issues = if alive {
                match slave.slave_status().await {
                    Ok(Some(status)) => {
                        slave_issues(&status, master_address.as_ref(), max_delay)
                    }
                    Ok(None) => vec!["Not configured as a slave".to_string()],
                    Err(e) => vec![format!("Cannot read slave status: {:#}", e)],
                }
            } else {
                vec!["Cannot connect to server".to_string()]
            };
            rows.push(health_row(slave.as_mut(), SLAVE, alive, issues).await);
        }

        rows
    }

    /// Executed, purged and owned GTID sets per reachable server
    pub async fn gtid_report(&mut self) -> Vec<GtidRow> {
        let mut rows = Vec::new();
        for (server, role) in self.servers_with_roles() {
            if !reachable(server.as_mut()).await {
                continue;
            }
            rows.push(GtidRow {
                host: server.address().host.clone(),
                port: server.address().port,
                role: role.to_string(),
                executed: server.gtid_executed().await.unwrap_or_default(),
                purged: server.gtid_purged().await.unwrap_or_default(),
                owned: server.gtid_owned().await.unwrap_or_default(),
            });
        }
        rows
    }

    /// Server UUID per reachable server
    pub async fn uuid_report(&mut self) -> Vec<UuidRow> {
        let mut rows = Vec::new();
        for (server, role) in self.servers_with_roles() {
            if !reachable(server.as_mut()).await {
                continue;
            }
            match server.server_uuid().await {
                Ok(uuid) => rows.push(UuidRow {
                    host: server.address().host.clone(),
                    port: server.address().port,
                    role: role.to_string(),
                    uuid,
                }),
                Err(e) => {
                    tracing::warn!("Cannot read server UUID of {}: {:#}", server.address(), e)
                }
            }
        }
        rows
    }

    fn servers_with_roles(&mut self) -> Vec<(&mut Box<dyn Server>, &'static str)> {
        self.master
            .iter_mut()
            .map(|m| (m, MASTER))
            .chain(self.slaves.iter_mut().map(|s| (s, SLAVE)))
            .collect()
    }
}

async fn health_row(
    server: &mut dyn Server,
    role: &str,
    alive: bool,
    issues: Vec<String>,
) -> HealthRow {
    let gtid_mode = if alive {
        match server.gtid_mode_enabled().await {
            Ok(true) => "ON",
            Ok(false) => "OFF",
            Err(_) => "UNKNOWN",
        }
    } else {
        "UNKNOWN"
    };

    HealthRow {
        host: server.address().host.clone(),
        port: server.address().port,
        role: role.to_string(),
        state: if alive { "UP" } else { "DOWN" }.to_string(),
        gtid_mode: gtid_mode.to_string(),
        health: if issues.is_empty() {
            "OK".to_string()
        } else {
            issues.join("; ")
        },
    }
}

fn slave_issues(status: &SlaveStatus, master: Option<&ServerAddress>, max_delay: u64) -> Vec<String> {
    let mut issues = Vec::new();
    if !status.io_running {
        let mut issue = "IO thread is not running".to_string();
        if !status.last_io_error.is_empty() {
            issue.push_str(&format!(" ({})", status.last_io_error));
        }
        issues.push(issue);
    }
    if !status.sql_running {
        let mut issue = "SQL thread is not running".to_string();
        if !status.last_sql_error.is_empty() {
            issue.push_str(&format!(" ({})", status.last_sql_error));
        }
        issues.push(issue);
    }
    if let Some(master) = master {
        if !master.same_endpoint(&status.master_host, status.master_port) {
            issues.push(format!(
                "Replicating from {}:{} instead of {}",
                status.master_host, status.master_port, master
            ));
        }
    }
    if max_delay > 0 {
        if let Some(lag) = status.seconds_behind {
            if lag > max_delay {
                issues.push(format!("Slave delay is {} seconds behind master", lag));
            }
        }
    }
    issues
}
