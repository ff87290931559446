// ABOUTME: Failover console state machine: monitor the master, detect failure, fail over
// ABOUTME: Drives registration, errant transaction checks, election, promotion and hooks

use super::detection::{self, Detection, Probe};
use super::election;
use super::hooks;
use super::promotion;
use super::registration::{self, Registration};
use super::report::OutputSink;
use super::shutdown::Shutdown;
use crate::config::{FailoverConfig, FailoverMode, ReportValue};
use crate::errors::{ErrantReplica, ReplicationError, ReplicationResult};
use crate::gtid::{self, GtidSet};
use crate::mysql::ServerAddress;
use crate::topology::{GtidRow, HealthRow, Topology, UuidRow, REQUIRED_PRIVILEGES};

/// Liveness state of one console instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleState {
    Monitoring,
    /// Liveness probe failed, reconnect attempts under way
    MasterSuspect,
    FailoverInProgress,
    Stopped,
}

/// Result of a single monitoring pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Healthy,
    FailedOver {
        old_master: ServerAddress,
        new_master: ServerAddress,
    },
    Shutdown,
}

pub struct FailoverConsole {
    config: FailoverConfig,
    topology: Topology,
    sink: Box<dyn OutputSink>,
    shutdown: Shutdown,
    detection: Detection,
    state: ConsoleState,
    /// Effective mode; drops to `Fail` when another console holds the registration
    mode: FailoverMode,
    registered: bool,
    conflict: Option<ServerAddress>,
    /// Master's executed set as of the last healthy tick
    master_gtids: Option<GtidSet>,
    errant: Vec<ErrantReplica>,
    failovers: u32,
}

impl FailoverConsole {
    /// Validates the configuration; a bad option or script path fails here,
    /// before any monitoring starts.
    pub fn new(
        mut config: FailoverConfig,
        topology: Topology,
        sink: Box<dyn OutputSink>,
        shutdown: Shutdown,
    ) -> ReplicationResult<Self> {
        config.validate()?;
        let detection = Detection::from_config(&config);
        let mode = config.failover_mode;
        Ok(Self {
            config,
            topology,
            sink,
            shutdown,
            detection,
            state: ConsoleState::Monitoring,
            mode,
            registered: false,
            conflict: None,
            master_gtids: None,
            errant: Vec::new(),
            failovers: 0,
        })
    }

    pub fn state(&self) -> ConsoleState {
        self.state
    }

    pub fn mode(&self) -> FailoverMode {
        self.mode
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    /// Master whose registration row was already taken, if any
    pub fn registration_conflict(&self) -> Option<&ServerAddress> {
        self.conflict.as_ref()
    }

    pub fn master_address(&self) -> Option<ServerAddress> {
        self.topology.master_address()
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Errant transactions found on the last check
    pub fn errant_transactions(&self) -> &[ErrantReplica] {
        &self.errant
    }

    pub fn failover_count(&self) -> u32 {
        self.failovers
    }

    /// Start-up checks and registration.
    ///
    /// Fails on an unreachable master, GTID mode off anywhere, missing
    /// privileges, or (in pedantic mode) errant transactions.
    pub async fn start(&mut self) -> ReplicationResult<()> {
        let result = self.prepare().await;
        if result.is_err() {
            self.state = ConsoleState::Stopped;
        }
        result
    }

    async fn prepare(&mut self) -> ReplicationResult<()> {
        let address = self
            .topology
            .master_address()
            .ok_or_else(|| ReplicationError::config("topology has no master"))?;
        let alive = match self.topology.master_mut() {
            Some(master) => master.is_alive().await,
            None => false,
        };
        if !alive {
            return Err(ReplicationError::connectivity(
                &address.host,
                address.port,
                "master is not reachable",
            ));
        }

        self.topology.discover_slaves().await;
        self.topology.check_gtid_mode().await?;
        self.topology
            .check_master_privileges(REQUIRED_PRIVILEGES)
            .await?;
        self.check_errant_transactions().await?;
        self.refresh_master_gtids().await;

        match registration::register(&mut self.topology, self.config.force).await? {
            Registration::Registered => self.registered = true,
            Registration::Conflict(master) => self.on_registration_conflict(master),
        }

        self.state = ConsoleState::Monitoring;
        self.sink.line(&format!(
            "Failover console started: master {}, {} slave(s), failover mode {}, interval {} seconds",
            address,
            self.topology.slaves().len(),
            self.mode,
            self.config.interval.as_secs()
        ));
        Ok(())
    }

    /// One monitoring pass: check the master, then either report or fail over
    pub async fn tick(&mut self) -> ReplicationResult<TickOutcome> {
        if self.shutdown.is_requested() {
            return Ok(TickOutcome::Shutdown);
        }
        let address = self
            .topology
            .master_address()
            .ok_or_else(|| ReplicationError::config("topology has no master"))?;
        self.state = ConsoleState::Monitoring;

        let probe = match self.detection.clone() {
            Detection::Script(script) => {
                detection::check_with_script(&script, &address, &mut self.shutdown)
                    .await
                    .map_err(|e| {
                        ReplicationError::config(format!("failure check script: {:#}", e))
                    })?
            }
            Detection::BuiltIn(policy) => {
                let Some(master) = self.topology.master_mut() else {
                    return Err(ReplicationError::config("topology has no master"));
                };
                if master.is_alive().await {
                    Probe::Alive
                } else {
                    self.state = ConsoleState::MasterSuspect;
                    tracing::warn!("Master {} is not responding, trying to reconnect", address);
                    detection::confirm_failure(master.as_mut(), &policy, &mut self.shutdown).await
                }
            }
        };

        match probe {
            Probe::Cancelled => Ok(TickOutcome::Shutdown),
            Probe::Alive => {
                self.state = ConsoleState::Monitoring;
                self.report_healthy(&address).await?;
                Ok(TickOutcome::Healthy)
            }
            Probe::Failed => self.fail_over(address).await,
        }
    }

    /// Start, then tick every `interval` until shutdown or a fatal error
    pub async fn run(&mut self) -> ReplicationResult<()> {
        if let Err(e) = self.start().await {
            self.stop().await;
            return Err(e);
        }

        loop {
            match self.tick().await {
                Ok(TickOutcome::Shutdown) => break,
                Ok(_) => {}
                Err(e) => {
                    self.stop().await;
                    return Err(e);
                }
            }
            if self.shutdown.sleep(self.config.interval).await {
                break;
            }
        }

        tracing::info!("Shutdown requested, stopping failover console");
        self.stop().await;
        Ok(())
    }

    /// Unregister (best effort) and close the sink
    pub async fn stop(&mut self) {
        if self.registered {
            registration::unregister(&mut self.topology).await;
            self.registered = false;
        }
        self.sink.close();
        self.state = ConsoleState::Stopped;
    }

    async fn fail_over(&mut self, old_master: ServerAddress) -> ReplicationResult<TickOutcome> {
        self.state = ConsoleState::FailoverInProgress;
        tracing::error!("CRITICAL: master {} has failed", old_master);
        self.sink
            .warning(&format!("Master {} has failed", old_master));

        if self.mode == FailoverMode::Fail {
            self.run_post_failover(&old_master, None).await;
            self.state = ConsoleState::Stopped;
            return Err(ReplicationError::MasterFailed {
                host: old_master.host.clone(),
                port: old_master.port,
            });
        }

        if !self.errant.is_empty() {
            tracing::warn!(
                "Failing over with errant transactions on {} slave(s)",
                self.errant.len()
            );
        }

        let promoted = self.elect_and_promote(&old_master).await;
        if let Err(e) = promoted {
            tracing::error!("Failover failed: {}", e);
            self.run_post_failover(&old_master, None).await;
            self.state = ConsoleState::Stopped;
            return Err(e);
        }

        self.failovers += 1;
        self.registered = false;
        self.topology.discover_slaves().await;
        match registration::reregister(&mut self.topology, &old_master).await {
            Ok(Registration::Registered) => self.registered = true,
            Ok(Registration::Conflict(master)) => self.on_registration_conflict(master),
            Err(e) => tracing::warn!("Cannot register on the new master: {}", e),
        }
        self.refresh_master_gtids().await;
        self.errant.clear();

        let new_master = self
            .topology
            .master_address()
            .ok_or_else(|| ReplicationError::config("topology has no master"))?;
        self.sink.line(&format!(
            "Failover complete: {} replaced {} as master",
            new_master, old_master
        ));
        self.run_post_failover(&old_master, Some(&new_master)).await;

        self.state = ConsoleState::Monitoring;
        Ok(TickOutcome::FailedOver {
            old_master,
            new_master,
        })
    }

    async fn elect_and_promote(&mut self, old_master: &ServerAddress) -> ReplicationResult<()> {
        let reference = self.master_gtids.clone();
        let elected = election::elect(
            &mut self.topology,
            &self.config.candidates,
            reference.as_ref(),
            old_master,
        )
        .await?;
        promotion::promote(
            &mut self.topology,
            elected,
            self.config.rpl_user.as_ref(),
            self.config.timeout,
            old_master,
        )
        .await
    }

    async fn run_post_failover(
        &mut self,
        old_master: &ServerAddress,
        new_master: Option<&ServerAddress>,
    ) {
        let Some(script) = self.config.exec_post_failover.clone() else {
            return;
        };
        let hook = hooks::run_post_failover(&script, old_master, new_master);
        if self.shutdown.run(hook).await.is_none() {
            tracing::warn!("Post-failover script interrupted by shutdown");
        }
    }

    fn on_registration_conflict(&mut self, master: ServerAddress) {
        if self.mode != FailoverMode::Fail {
            tracing::warn!(
                "Another failover console is registered for master {}; switching to fail mode",
                master
            );
            self.sink.warning(&format!(
                "Another failover console is registered for master {}. \
                 Failover mode changed to 'fail' for this console.",
                master
            ));
            self.mode = FailoverMode::Fail;
        }
        self.conflict = Some(master);
    }

    async fn check_errant_transactions(&mut self) -> ReplicationResult<()> {
        let errant = self.topology.find_errant_transactions().await?;
        if !errant.is_empty() && self.config.pedantic {
            self.state = ConsoleState::Stopped;
            return Err(ReplicationError::ErrantTransaction { replicas: errant });
        }
        for replica in &errant {
            self.sink.warning(&format!(
                "Errant transactions on slave {}:{}: {}",
                replica.host, replica.port, replica.gtids
            ));
        }
        self.errant = errant;
        Ok(())
    }

    async fn refresh_master_gtids(&mut self) {
        let Some(master) = self.topology.master_mut() else {
            return;
        };
        match master.gtid_executed().await {
            Ok(text) => match gtid::parse(&text) {
                Ok(set) => self.master_gtids = Some(set),
                Err(e) => tracing::warn!("{}", e),
            },
            Err(e) => tracing::warn!("Cannot read master GTID_EXECUTED: {:#}", e),
        }
    }

    async fn report_healthy(&mut self, address: &ServerAddress) -> ReplicationResult<()> {
        self.check_errant_transactions().await?;
        self.refresh_master_gtids().await;

        let position = match self.topology.master_mut() {
            Some(master) => match master.master_status().await {
                Ok(Some(status)) => format!(", binlog {}:{}", status.binlog_file, status.position),
                _ => String::new(),
            },
            None => String::new(),
        };
        self.sink.line(&format!(
            "Master {} is UP{}, failover mode {}",
            address, position, self.mode
        ));

        if self.config.reports(ReportValue::Health) {
            let rows = self.topology.health(self.config.max_delay).await;
            let cells: Vec<Vec<String>> = rows.iter().map(HealthRow::cells).collect();
            self.sink
                .table("Replication Health Status", &HealthRow::HEADERS, &cells);
        }
        if self.config.reports(ReportValue::Gtid) {
            let rows = self.topology.gtid_report().await;
            let cells: Vec<Vec<String>> = rows.iter().map(GtidRow::cells).collect();
            self.sink.table("Transactions", &GtidRow::HEADERS, &cells);
        }
        if self.config.reports(ReportValue::Uuid) {
            let rows = self.topology.uuid_report().await;
            let cells: Vec<Vec<String>> = rows.iter().map(UuidRow::cells).collect();
            self.sink.table("UUIDs", &UuidRow::HEADERS, &cells);
        }

        if let Some(master) = &self.conflict {
            self.sink.warning(&format!(
                "Another console is registered for master {}; this console will not fail over",
                master
            ));
        }
        Ok(())
    }
}
