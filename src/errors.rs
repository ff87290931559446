// ABOUTME: Typed error conditions raised by the failover console and daemon
// ABOUTME: Carries structured host/port fields so callers render messages themselves

use crate::gtid::GtidError;
use thiserror::Error;

/// Exit status reserved for "master confirmed failed, no automatic action configured"
pub const MASTER_FAILED_EXIT_CODE: i32 = 911;

pub type ReplicationResult<T> = Result<T, ReplicationError>;

/// Replica holding transactions the master never executed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrantReplica {
    pub host: String,
    pub port: u16,
    pub gtids: String,
}

#[derive(Debug, Clone, Error)]
pub enum ReplicationError {
    /// Invalid options or a topology that cannot be monitored safely
    #[error("configuration error: {reason}")]
    Config { reason: String },

    /// A server could not be reached or queried
    #[error("cannot reach server {host}:{port}: {cause}")]
    Connectivity {
        host: String,
        port: u16,
        cause: String,
    },

    /// Master is down and the console is not allowed to act on it
    #[error("master {host}:{port} has failed and no automatic failover is configured")]
    MasterFailed { host: String, port: u16 },

    /// Election or promotion could not complete
    #[error("failover from {host}:{port} failed: {reason}")]
    Promotion {
        host: String,
        port: u16,
        reason: String,
    },

    /// Another console already registered against this master
    #[error("another failover console is registered for master {host}:{port}")]
    RegistrationConflict { host: String, port: u16 },

    #[error("errant transactions found on {}", describe_errant(.replicas))]
    ErrantTransaction { replicas: Vec<ErrantReplica> },

    #[error(transparent)]
    Gtid(#[from] GtidError),
}

impl ReplicationError {
    pub fn config(reason: impl Into<String>) -> Self {
        ReplicationError::Config {
            reason: reason.into(),
        }
    }

    pub fn connectivity(host: &str, port: u16, cause: impl std::fmt::Display) -> Self {
        ReplicationError::Connectivity {
            host: host.to_string(),
            port,
            cause: format!("{:#}", cause),
        }
    }

    pub fn promotion(host: &str, port: u16, reason: impl Into<String>) -> Self {
        ReplicationError::Promotion {
            host: host.to_string(),
            port,
            reason: reason.into(),
        }
    }

    /// Process exit status the CLI layer should use for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            ReplicationError::MasterFailed { .. } => MASTER_FAILED_EXIT_CODE,
            _ => 1,
        }
    }
}

fn describe_errant(replicas: &[ErrantReplica]) -> String {
    replicas
        .iter()
        .map(|r| format!("{}:{} ({})", r.host, r.port, r.gtids))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn master_failed_uses_distinguished_exit_code() {
        let err = ReplicationError::MasterFailed {
            host: "db1".to_string(),
            port: 3306,
        };
        assert_eq!(err.exit_code(), 911);
        assert!(err.to_string().contains("db1:3306"));
    }

    #[test]
    fn other_errors_exit_with_one() {
        assert_eq!(ReplicationError::config("bad interval").exit_code(), 1);
        assert_eq!(
            ReplicationError::promotion("db1", 3306, "no candidate").exit_code(),
            1
        );
    }

    #[test]
    fn errant_message_lists_replicas() {
        let err = ReplicationError::ErrantTransaction {
            replicas: vec![ErrantReplica {
                host: "db2".to_string(),
                port: 3307,
                gtids: "u:5".to_string(),
            }],
        };
        assert_eq!(err.to_string(), "errant transactions found on db2:3307 (u:5)");
    }

    #[test]
    fn connectivity_keeps_cause_chain() {
        let cause = anyhow::anyhow!("connection refused").context("ping failed");
        let err = ReplicationError::connectivity("db1", 3306, cause);
        assert!(err.to_string().contains("ping failed: connection refused"));
    }
}
