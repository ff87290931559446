// ABOUTME: In-memory replication cluster implementing the Server and Connector traits
// ABOUTME: Lets scenario tests drive the failover console without live MySQL servers

#![allow(dead_code)]

use anyhow::{bail, Result};
use async_trait::async_trait;
use mysql_rpl_failover::failover::OutputSink;
use mysql_rpl_failover::gtid::{self, Gtid};
use mysql_rpl_failover::mysql::ServerAddress;
use mysql_rpl_failover::topology::{
    ChangeMasterTarget, Connector, MasterStatus, Server, SlaveStatus, Topology,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const M_UUID: &str = "aaaaaaaa-0000-0000-0000-000000000001";
pub const S1_UUID: &str = "aaaaaaaa-0000-0000-0000-000000000002";
pub const S2_UUID: &str = "aaaaaaaa-0000-0000-0000-000000000003";

/// Mutable state of one fake server
#[derive(Debug, Clone)]
pub struct NodeState {
    pub alive: bool,
    pub gtid_mode: bool,
    pub uuid: String,
    pub executed: String,
    pub slave_status: Option<SlaveStatus>,
    pub slave_hosts: Vec<(String, u16)>,
    pub missing_privileges: Vec<String>,
    pub console_rows: BTreeSet<(String, u16)>,
    /// Bumped to break every open connection; each handle must reconnect
    pub connection_epoch: u64,
    /// Statements that fail on this server instead of being applied
    pub failing_ops: Vec<String>,
    /// Statements applied, in order
    pub ops: Vec<String>,
}

impl NodeState {
    fn new(uuid: &str, executed: &str) -> Self {
        Self {
            alive: true,
            gtid_mode: true,
            uuid: uuid.to_string(),
            executed: executed.to_string(),
            slave_status: None,
            slave_hosts: Vec::new(),
            missing_privileges: Vec::new(),
            console_rows: BTreeSet::new(),
            connection_epoch: 0,
            failing_ops: Vec::new(),
            ops: Vec::new(),
        }
    }
}

#[derive(Clone, Default)]
pub struct FakeCluster {
    nodes: Arc<Mutex<HashMap<String, NodeState>>>,
}

fn key(host: &str, port: u16) -> String {
    format!("{}:{}", host.to_lowercase(), port)
}

pub fn address(host: &str, port: u16) -> ServerAddress {
    ServerAddress::new(host, port).with_credentials(Some("root".into()), Some("secret".into()))
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_master(&self, host: &str, port: u16, uuid: &str, executed: &str) -> ServerAddress {
        self.nodes
            .lock()
            .unwrap()
            .insert(key(host, port), NodeState::new(uuid, executed));
        address(host, port)
    }

    pub fn add_slave(
        &self,
        host: &str,
        port: u16,
        uuid: &str,
        executed: &str,
        master: &ServerAddress,
    ) -> ServerAddress {
        let mut node = NodeState::new(uuid, executed);
        node.slave_status = Some(SlaveStatus {
            master_host: master.host.clone(),
            master_port: master.port,
            io_running: true,
            sql_running: true,
            seconds_behind: Some(0),
            retrieved_gtid_set: executed.to_string(),
            executed_gtid_set: executed.to_string(),
            ..Default::default()
        });
        let mut nodes = self.nodes.lock().unwrap();
        nodes.insert(key(host, port), node);
        if let Some(master_node) = nodes.get_mut(&key(&master.host, master.port)) {
            master_node.slave_hosts.push((host.to_string(), port));
        }
        address(host, port)
    }

    pub fn with_node<R>(&self, address: &ServerAddress, f: impl FnOnce(&mut NodeState) -> R) -> R {
        let mut nodes = self.nodes.lock().unwrap();
        let node = nodes
            .get_mut(&key(&address.host, address.port))
            .expect("unknown fake server");
        f(node)
    }

    pub fn set_alive(&self, address: &ServerAddress, alive: bool) {
        self.with_node(address, |node| node.alive = alive);
    }

    /// Break every open connection to `address` until it is reopened
    pub fn drop_connections(&self, address: &ServerAddress) {
        self.with_node(address, |node| node.connection_epoch += 1);
    }

    pub fn ops(&self, address: &ServerAddress) -> Vec<String> {
        self.with_node(address, |node| node.ops.clone())
    }

    pub fn console_rows(&self, address: &ServerAddress) -> Vec<(String, u16)> {
        self.with_node(address, |node| node.console_rows.iter().cloned().collect())
    }

    pub fn slave_status(&self, address: &ServerAddress) -> Option<SlaveStatus> {
        self.with_node(address, |node| node.slave_status.clone())
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(FakeConnector {
            cluster: self.clone(),
        })
    }

    pub async fn topology(&self, master: &ServerAddress, slaves: &[ServerAddress]) -> Topology {
        Topology::connect(self.connector(), master, slaves, false)
            .await
            .expect("fake master reachable")
    }

    pub fn server(&self, address: &ServerAddress) -> Box<dyn Server> {
        let epoch = self.with_node(address, |node| node.connection_epoch);
        Box::new(FakeServer {
            address: address.clone(),
            cluster: self.clone(),
            epoch,
        })
    }
}

pub struct FakeConnector {
    cluster: FakeCluster,
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, address: &ServerAddress) -> Result<Box<dyn Server>> {
        let alive = {
            let nodes = self.cluster.nodes.lock().unwrap();
            nodes
                .get(&key(&address.host, address.port))
                .map(|node| node.alive)
        };
        match alive {
            Some(true) => Ok(self.cluster.server(address)),
            Some(false) => bail!("Can't connect to MySQL server on '{}'", address),
            None => bail!("Unknown MySQL server host '{}'", address.host),
        }
    }
}

pub struct FakeServer {
    address: ServerAddress,
    cluster: FakeCluster,
    epoch: u64,
}

impl FakeServer {
    /// Run `f` against this server's state, failing if it is down or this
    /// handle's connection was dropped
    fn live<R>(&self, f: impl FnOnce(&mut NodeState) -> R) -> Result<R> {
        let mut nodes = self.cluster.nodes.lock().unwrap();
        match nodes.get_mut(&key(&self.address.host, self.address.port)) {
            Some(node) if node.alive && node.connection_epoch == self.epoch => Ok(f(node)),
            _ => bail!("Lost connection to MySQL server at '{}'", self.address),
        }
    }

    fn apply(&self, op: String, f: impl FnOnce(&mut NodeState)) -> Result<()> {
        self.live(|node| {
            if node.failing_ops.contains(&op) {
                bail!("'{}' failed on {}", op, self.address);
            }
            f(node);
            node.ops.push(op);
            Ok(())
        })?
    }
}

#[async_trait]
impl Server for FakeServer {
    fn address(&self) -> &ServerAddress {
        &self.address
    }

    async fn is_alive(&mut self) -> bool {
        self.live(|_| ()).is_ok()
    }

    async fn reconnect(&mut self) -> Result<()> {
        let nodes = self.cluster.nodes.lock().unwrap();
        match nodes.get(&key(&self.address.host, self.address.port)) {
            Some(node) if node.alive => {
                self.epoch = node.connection_epoch;
                Ok(())
            }
            _ => bail!("Can't connect to MySQL server on '{}'", self.address),
        }
    }

    async fn server_uuid(&mut self) -> Result<String> {
        self.live(|node| node.uuid.clone())
    }

    async fn gtid_mode_enabled(&mut self) -> Result<bool> {
        self.live(|node| node.gtid_mode)
    }

    async fn gtid_executed(&mut self) -> Result<String> {
        self.live(|node| node.executed.clone())
    }

    async fn gtid_purged(&mut self) -> Result<String> {
        self.live(|_| String::new())
    }

    async fn gtid_owned(&mut self) -> Result<String> {
        self.live(|_| String::new())
    }

    async fn master_status(&mut self) -> Result<Option<MasterStatus>> {
        self.live(|node| {
            Some(MasterStatus {
                binlog_file: "mysql-bin.000003".to_string(),
                position: 1547,
                executed_gtid_set: node.executed.clone(),
            })
        })
    }

    async fn slave_status(&mut self) -> Result<Option<SlaveStatus>> {
        self.live(|node| node.slave_status.clone())
    }

    async fn slave_hosts(&mut self) -> Result<Vec<(String, u16)>> {
        self.live(|node| node.slave_hosts.clone())
    }

    async fn missing_privileges(&mut self, _required: &[&str]) -> Result<Vec<String>> {
        self.live(|node| node.missing_privileges.clone())
    }

    async fn stop_slave(&mut self) -> Result<()> {
        self.apply("STOP SLAVE".to_string(), |node| {
            if let Some(status) = node.slave_status.as_mut() {
                status.io_running = false;
                status.sql_running = false;
            }
        })
    }

    async fn start_slave(&mut self) -> Result<()> {
        self.apply("START SLAVE".to_string(), |node| {
            if let Some(status) = node.slave_status.as_mut() {
                status.io_running = true;
                status.sql_running = true;
            }
        })
    }

    async fn reset_slave_all(&mut self) -> Result<()> {
        self.apply("RESET SLAVE ALL".to_string(), |node| node.slave_status = None)
    }

    async fn change_master(&mut self, target: &ChangeMasterTarget) -> Result<()> {
        let op = format!("CHANGE MASTER TO {}:{}", target.host, target.port);
        self.apply(op, |node| {
            let status = node.slave_status.get_or_insert_with(SlaveStatus::default);
            status.master_host = target.host.clone();
            status.master_port = target.port;
        })
    }

    async fn wait_for_executed(&mut self, gtid_set: &str, _timeout: Duration) -> Result<bool> {
        let merged = self.live(|node| gtid::union(&node.executed, gtid_set))??;
        self.live(|node| node.executed = merged)?;
        Ok(true)
    }

    async fn inject_empty_transaction(&mut self, gtid: &Gtid) -> Result<()> {
        let merged = self.live(|node| gtid::union(&node.executed, &gtid.to_string()))??;
        self.apply(format!("SET GTID_NEXT {}", gtid), |node| node.executed = merged)
    }

    async fn register_console(&mut self, host: &str, port: u16, force: bool) -> Result<bool> {
        let row = (host.to_string(), port);
        self.live(|node| {
            if force && node.console_rows.remove(&row) {
                node.ops.push(format!("DELETE console {}:{}", host, port));
            }
            node.ops.push(format!("INSERT console {}:{}", host, port));
            node.console_rows.insert(row)
        })
    }

    async fn unregister_console(&mut self, host: &str, port: u16) -> Result<()> {
        self.apply(format!("DELETE console {}:{}", host, port), |node| {
            node.console_rows.remove(&(host.to_string(), port));
        })
    }

    async fn console_registered(&mut self, host: &str, port: u16) -> Result<bool> {
        self.live(|node| node.console_rows.contains(&(host.to_string(), port)))
    }
}

/// Sink capturing console output for assertions
#[derive(Clone, Default)]
pub struct RecordingSink {
    lines: Arc<Mutex<Vec<String>>>,
    closed: Arc<Mutex<bool>>,
}

impl RecordingSink {
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines().iter().any(|line| line.contains(needle))
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock().unwrap()
    }
}

impl OutputSink for RecordingSink {
    fn line(&mut self, text: &str) {
        self.lines.lock().unwrap().push(text.to_string());
    }

    fn close(&mut self) {
        *self.closed.lock().unwrap() = true;
    }
}

/// Write an executable shell script into `dir`
#[cfg(unix)]
pub fn write_script(dir: &std::path::Path, name: &str, body: &str) -> std::path::PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}
