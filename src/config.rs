// ABOUTME: Failover console configuration with defaults, TOML loading and validation
// ABOUTME: Enumerates every option the console and daemon recognise

use crate::errors::{ReplicationError, ReplicationResult};
use crate::mysql::ServerAddress;
use crate::utils;
use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

pub const MIN_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(15);
pub const DEFAULT_PINGTIME: Duration = Duration::from_secs(3);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);
/// Reconnect attempts made against a suspect master
pub const RECONNECT_ATTEMPTS: u32 = 3;

/// What the console does once the master is confirmed down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum FailoverMode {
    /// Promote a candidate, falling back to the best slave
    Auto,
    /// Like auto, but a candidate list is mandatory
    Elect,
    /// Report the failure and stop
    Fail,
}

impl fmt::Display for FailoverMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailoverMode::Auto => "auto",
            FailoverMode::Elect => "elect",
            FailoverMode::Fail => "fail",
        };
        f.write_str(name)
    }
}

/// Extra tables printed on every tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ReportValue {
    Health,
    Gtid,
    Uuid,
}

/// Account slaves use to connect to a newly promoted master
#[derive(Clone, PartialEq, Eq)]
pub struct ReplicationUser {
    pub user: String,
    pub password: String,
}

impl ReplicationUser {
    /// Parse `user[:password]`
    pub fn parse(value: &str) -> Result<Self> {
        let (user, password) = value.split_once(':').unwrap_or((value, ""));
        if user.is_empty() {
            anyhow::bail!("Replication user cannot be empty (expected user[:password])");
        }
        Ok(Self {
            user: user.to_string(),
            password: password.to_string(),
        })
    }
}

impl fmt::Debug for ReplicationUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicationUser")
            .field("user", &self.user)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct FailoverConfig {
    pub master: Option<ServerAddress>,
    pub slaves: Vec<ServerAddress>,
    pub discover_slaves: bool,
    pub candidates: Vec<ServerAddress>,
    pub failover_mode: FailoverMode,
    pub interval: Duration,
    pub pingtime: Duration,
    /// Extra wait before the final probe of a suspect master
    pub fail_retry: Option<Duration>,
    /// Bound on waiting for a candidate to apply its relay log
    pub timeout: Duration,
    pub force: bool,
    pub pedantic: bool,
    pub report_values: Vec<ReportValue>,
    /// Lag in seconds above which a slave is unhealthy; 0 disables the check
    pub max_delay: u64,
    pub rpl_user: Option<ReplicationUser>,
    pub exec_fail_check: Option<PathBuf>,
    pub exec_post_failover: Option<PathBuf>,
    pub pidfile: Option<PathBuf>,
    pub log: Option<PathBuf>,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            master: None,
            slaves: Vec::new(),
            discover_slaves: false,
            candidates: Vec::new(),
            failover_mode: FailoverMode::Auto,
            interval: DEFAULT_INTERVAL,
            pingtime: DEFAULT_PINGTIME,
            fail_retry: None,
            timeout: DEFAULT_TIMEOUT,
            force: false,
            pedantic: false,
            report_values: vec![ReportValue::Health],
            max_delay: 0,
            rpl_user: None,
            exec_fail_check: None,
            exec_post_failover: None,
            pidfile: None,
            log: None,
        }
    }
}

impl FailoverConfig {
    /// Check option combinations and resolve script paths.
    ///
    /// Runs once before any connection is opened, so every configuration
    /// mistake is reported ahead of monitoring.
    pub fn validate(&mut self) -> ReplicationResult<()> {
        if self.master.is_none() {
            return Err(ReplicationError::config("a master server is required"));
        }

        if self.interval < MIN_INTERVAL {
            return Err(ReplicationError::config(format!(
                "interval must be at least {} seconds, got {} seconds",
                MIN_INTERVAL.as_secs(),
                self.interval.as_secs()
            )));
        }

        if self.failover_mode == FailoverMode::Elect && self.candidates.is_empty() {
            return Err(ReplicationError::config(
                "failover mode 'elect' requires at least one candidate",
            ));
        }

        if let Some(master) = &self.master {
            if self.candidates.contains(master) || self.slaves.contains(master) {
                return Err(ReplicationError::config(format!(
                    "master {} cannot also be listed as a slave or candidate",
                    master
                )));
            }
        }

        let mut seen = Vec::new();
        self.report_values.retain(|value| {
            let first = !seen.contains(value);
            seen.push(*value);
            first
        });

        if let Some(script) = &self.exec_fail_check {
            self.exec_fail_check = Some(resolve_script(script, "failure check")?);
        }
        if let Some(script) = &self.exec_post_failover {
            self.exec_post_failover = Some(resolve_script(script, "post-failover")?);
        }

        Ok(())
    }

    pub fn reports(&self, value: ReportValue) -> bool {
        self.report_values.contains(&value)
    }
}

fn resolve_script(script: &std::path::Path, purpose: &str) -> ReplicationResult<PathBuf> {
    utils::resolve_executable(script).map_err(|e| {
        ReplicationError::config(format!("invalid {} script: {:#}", purpose, e))
    })
}

/// On-disk form of the configuration, every field optional
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub master: Option<String>,
    #[serde(default)]
    pub slaves: Vec<String>,
    pub discover_slaves: Option<bool>,
    #[serde(default)]
    pub candidates: Vec<String>,
    pub failover_mode: Option<FailoverMode>,
    pub interval: Option<u64>,
    pub pingtime: Option<u64>,
    pub fail_retry: Option<u64>,
    pub timeout: Option<u64>,
    pub force: Option<bool>,
    pub pedantic: Option<bool>,
    pub report_values: Option<Vec<ReportValue>>,
    pub max_delay: Option<u64>,
    pub rpl_user: Option<String>,
    pub exec_fail_check: Option<PathBuf>,
    pub exec_post_failover: Option<PathBuf>,
    pub pidfile: Option<PathBuf>,
    pub log: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct ConfigDocument {
    #[serde(default)]
    failover: FileConfig,
}

/// Read the `[failover]` table of a TOML configuration file
pub fn load_file_config(path: &str) -> Result<FileConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {}", path))?;
    let parsed: ConfigDocument =
        toml::from_str(&raw).with_context(|| format!("Failed to parse TOML config at {}", path))?;
    Ok(parsed.failover)
}

impl FailoverConfig {
    /// Build a configuration from file values on top of the defaults
    pub fn from_file_config(file: FileConfig) -> Result<Self> {
        let defaults = FailoverConfig::default();
        Ok(Self {
            master: file
                .master
                .as_deref()
                .map(crate::mysql::parse_server_address)
                .transpose()?,
            slaves: crate::mysql::parse_server_addresses(&file.slaves)?,
            discover_slaves: file.discover_slaves.unwrap_or(defaults.discover_slaves),
            candidates: crate::mysql::parse_server_addresses(&file.candidates)?,
            failover_mode: file.failover_mode.unwrap_or(defaults.failover_mode),
            interval: file
                .interval
                .map(Duration::from_secs)
                .unwrap_or(defaults.interval),
            pingtime: file
                .pingtime
                .map(Duration::from_secs)
                .unwrap_or(defaults.pingtime),
            fail_retry: file.fail_retry.map(Duration::from_secs),
            timeout: file
                .timeout
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            force: file.force.unwrap_or(defaults.force),
            pedantic: file.pedantic.unwrap_or(defaults.pedantic),
            report_values: file.report_values.unwrap_or(defaults.report_values),
            max_delay: file.max_delay.unwrap_or(defaults.max_delay),
            rpl_user: file
                .rpl_user
                .as_deref()
                .map(ReplicationUser::parse)
                .transpose()?,
            exec_fail_check: file.exec_fail_check,
            exec_post_failover: file.exec_post_failover,
            pidfile: file.pidfile,
            log: file.log,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn base_config() -> FailoverConfig {
        FailoverConfig {
            master: Some(ServerAddress::new("db1", 3306)),
            ..Default::default()
        }
    }

    #[test]
    fn parse_sample_config() {
        let mut tmp = NamedTempFile::new().unwrap();
        let contents = r#"
            [failover]
            master = "mysql://root:pw@db1:3306"
            slaves = ["mysql://root:pw@db2:3306", "mysql://root:pw@db3:3306"]
            candidates = ["mysql://root:pw@db3:3306"]
            failover_mode = "elect"
            interval = 20
            report_values = ["health", "gtid"]
            rpl_user = "rpl:secret"
        "#;
        write!(tmp, "{}", contents).unwrap();

        let file = load_file_config(tmp.path().to_str().unwrap()).unwrap();
        let mut config = FailoverConfig::from_file_config(file).unwrap();
        config.validate().unwrap();

        assert_eq!(config.master.as_ref().unwrap().host, "db1");
        assert_eq!(config.slaves.len(), 2);
        assert_eq!(config.candidates[0].host, "db3");
        assert_eq!(config.failover_mode, FailoverMode::Elect);
        assert_eq!(config.interval, Duration::from_secs(20));
        assert!(config.reports(ReportValue::Gtid));
        assert!(!config.reports(ReportValue::Uuid));
        assert_eq!(config.rpl_user.unwrap().password, "secret");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let mut tmp = NamedTempFile::new().unwrap();
        write!(tmp, "[failover]\nintervall = 20\n").unwrap();
        assert!(load_file_config(tmp.path().to_str().unwrap()).is_err());
    }

    #[test]
    fn interval_below_minimum_is_rejected() {
        let mut config = FailoverConfig {
            interval: Duration::from_secs(4),
            ..base_config()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ReplicationError::Config { .. }));
        assert!(err.to_string().contains("at least 5 seconds"));
    }

    #[test]
    fn elect_requires_candidates() {
        let mut config = FailoverConfig {
            failover_mode: FailoverMode::Elect,
            ..base_config()
        };
        assert!(config.validate().is_err());

        config.candidates = vec![ServerAddress::new("db2", 3306)];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn master_is_required() {
        let mut config = FailoverConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn master_cannot_be_a_candidate() {
        let mut config = FailoverConfig {
            candidates: vec![ServerAddress::new("db1", 3306)],
            ..base_config()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_script_is_a_config_error() {
        let mut config = FailoverConfig {
            exec_fail_check: Some(PathBuf::from("/nonexistent/check.sh")),
            ..base_config()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("failure check"));
    }

    #[test]
    fn replication_user_parsing() {
        let user = ReplicationUser::parse("rpl:pw").unwrap();
        assert_eq!(user.user, "rpl");
        assert_eq!(user.password, "pw");
        assert_eq!(ReplicationUser::parse("rpl").unwrap().password, "");
        assert!(ReplicationUser::parse(":pw").is_err());
        assert!(!format!("{:?}", user).contains("password"));
    }
}
