// ABOUTME: Live Server implementation over mysql_async connections
// ABOUTME: Issues the administrative statements used by monitoring, promotion and registration

use super::{connect_mysql, ServerAddress};
use crate::gtid::Gtid;
use crate::topology::{ChangeMasterTarget, Connector, MasterStatus, Server, SlaveStatus};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use mysql_async::prelude::*;
use mysql_async::{Conn, Row};
use std::time::Duration;

/// Sentinel table holding one row per master watched by a failover console
pub const FAILOVER_CONSOLE_TABLE: &str = "mysql.failover_console";

const CREATE_CONSOLE_TABLE: &str = "CREATE TABLE IF NOT EXISTS mysql.failover_console \
     (host CHAR(255), port CHAR(10), PRIMARY KEY (host, port))";

/// Opens `MySqlServer`s; the connection is established eagerly
#[derive(Debug, Clone, Default)]
pub struct MySqlConnector;

#[async_trait]
impl Connector for MySqlConnector {
    async fn connect(&self, address: &ServerAddress) -> Result<Box<dyn Server>> {
        let server = MySqlServer::connect(address.clone()).await?;
        Ok(Box::new(server))
    }
}

pub struct MySqlServer {
    address: ServerAddress,
    conn: Option<Conn>,
}

impl MySqlServer {
    pub async fn connect(address: ServerAddress) -> Result<Self> {
        let conn = connect_mysql(&address).await?;
        Ok(Self {
            address,
            conn: Some(conn),
        })
    }

    fn conn(&mut self) -> Result<&mut Conn> {
        match self.conn.as_mut() {
            Some(conn) => Ok(conn),
            None => bail!("Not connected to {}", self.address),
        }
    }

    async fn variable(&mut self, name: &str) -> Result<String> {
        let address = self.address.clone();
        let query = format!("SELECT @@GLOBAL.{}", name);
        let value: Option<String> = self
            .conn()?
            .query_first(query)
            .await
            .with_context(|| format!("Failed to read {} on {}", name, address))?;
        Ok(value.unwrap_or_default())
    }

    async fn query_drop(&mut self, statement: &str) -> Result<()> {
        let address = self.address.clone();
        self.conn()?
            .query_drop(statement)
            .await
            .with_context(|| format!("'{}' failed on {}", statement, address))
    }

    async fn insert_registration(&mut self, host: &str, port: u16, force: bool) -> Result<bool> {
        self.query_drop(CREATE_CONSOLE_TABLE).await?;
        let conn = self.conn()?;
        if force {
            conn.exec_drop(
                "DELETE FROM mysql.failover_console WHERE host = ? AND port = ?",
                (host, port.to_string()),
            )
            .await?;
        }
        conn.exec_drop(
            "INSERT IGNORE INTO mysql.failover_console VALUES (?, ?)",
            (host, port.to_string()),
        )
        .await?;
        Ok(conn.affected_rows() == 1)
    }
}

#[async_trait]
impl Server for MySqlServer {
    fn address(&self) -> &ServerAddress {
        &self.address
    }

    /// A dropped connection stays dropped until `reconnect`
    async fn is_alive(&mut self) -> bool {
        let Some(conn) = self.conn.as_mut() else {
            return false;
        };
        let ok = match conn.ping().await {
            Ok(()) => conn.query_drop("SELECT 1").await.is_ok(),
            Err(_) => false,
        };
        if !ok {
            tracing::debug!("Liveness probe failed on {}", self.address);
            self.conn = None;
        }
        ok
    }

    async fn reconnect(&mut self) -> Result<()> {
        if let Some(conn) = self.conn.take() {
            let _ = conn.disconnect().await;
        }
        self.conn = Some(connect_mysql(&self.address).await?);
        Ok(())
    }

    async fn server_uuid(&mut self) -> Result<String> {
        self.variable("SERVER_UUID").await
    }

    async fn gtid_mode_enabled(&mut self) -> Result<bool> {
        Ok(self.variable("GTID_MODE").await?.eq_ignore_ascii_case("ON"))
    }

    async fn gtid_executed(&mut self) -> Result<String> {
        self.variable("GTID_EXECUTED").await
    }

    async fn gtid_purged(&mut self) -> Result<String> {
        self.variable("GTID_PURGED").await
    }

    async fn gtid_owned(&mut self) -> Result<String> {
        self.variable("GTID_OWNED").await
    }

    async fn master_status(&mut self) -> Result<Option<MasterStatus>> {
        let address = self.address.clone();
        let row: Option<Row> = self
            .conn()?
            .query_first("SHOW MASTER STATUS")
            .await
            .with_context(|| format!("SHOW MASTER STATUS failed on {}", address))?;

        Ok(row.map(|row| MasterStatus {
            binlog_file: column(&row, "File").unwrap_or_default(),
            position: column(&row, "Position").unwrap_or_default(),
            executed_gtid_set: column(&row, "Executed_Gtid_Set").unwrap_or_default(),
        }))
    }

    async fn slave_status(&mut self) -> Result<Option<SlaveStatus>> {
        let address = self.address.clone();
        let row: Option<Row> = self
            .conn()?
            .query_first("SHOW SLAVE STATUS")
            .await
            .with_context(|| format!("SHOW SLAVE STATUS failed on {}", address))?;

        Ok(row.map(|row| SlaveStatus {
            master_host: column(&row, "Master_Host").unwrap_or_default(),
            master_port: column(&row, "Master_Port").unwrap_or_default(),
            io_running: column::<String>(&row, "Slave_IO_Running")
                .is_some_and(|v| v.eq_ignore_ascii_case("Yes")),
            sql_running: column::<String>(&row, "Slave_SQL_Running")
                .is_some_and(|v| v.eq_ignore_ascii_case("Yes")),
            seconds_behind: column::<Option<u64>>(&row, "Seconds_Behind_Master").flatten(),
            retrieved_gtid_set: column(&row, "Retrieved_Gtid_Set").unwrap_or_default(),
            executed_gtid_set: column(&row, "Executed_Gtid_Set").unwrap_or_default(),
            last_io_error: column(&row, "Last_IO_Error").unwrap_or_default(),
            last_sql_error: column(&row, "Last_SQL_Error").unwrap_or_default(),
        }))
    }

    async fn slave_hosts(&mut self) -> Result<Vec<(String, u16)>> {
        let address = self.address.clone();
        let rows: Vec<Row> = self
            .conn()?
            .query("SHOW SLAVE HOSTS")
            .await
            .with_context(|| format!("SHOW SLAVE HOSTS failed on {}", address))?;

        Ok(rows
            .iter()
            .filter_map(|row| Some((column(row, "Host")?, column(row, "Port")?)))
            .collect())
    }

    async fn missing_privileges(&mut self, required: &[&str]) -> Result<Vec<String>> {
        let address = self.address.clone();
        let grants: Vec<String> = self
            .conn()?
            .query("SHOW GRANTS FOR CURRENT_USER()")
            .await
            .with_context(|| format!("SHOW GRANTS failed on {}", address))?;

        Ok(missing_from_grants(&grants, required))
    }

    async fn stop_slave(&mut self) -> Result<()> {
        self.query_drop("STOP SLAVE").await
    }

    async fn start_slave(&mut self) -> Result<()> {
        self.query_drop("START SLAVE").await
    }

    async fn reset_slave_all(&mut self) -> Result<()> {
        self.query_drop("RESET SLAVE ALL").await
    }

    async fn change_master(&mut self, target: &ChangeMasterTarget) -> Result<()> {
        let statement = change_master_statement(target);
        let address = self.address.clone();
        self.conn()?
            .query_drop(statement)
            .await
            .with_context(|| {
                format!(
                    "CHANGE MASTER TO {}:{} failed on {}",
                    target.host, target.port, address
                )
            })
    }

    async fn wait_for_executed(&mut self, gtid_set: &str, timeout: Duration) -> Result<bool> {
        let address = self.address.clone();
        let result: Option<i64> = self
            .conn()?
            .exec_first(
                "SELECT WAIT_FOR_EXECUTED_GTID_SET(?, ?)",
                (gtid_set, timeout.as_secs()),
            )
            .await
            .with_context(|| format!("Waiting for GTIDs failed on {}", address))?;
        Ok(result == Some(0))
    }

    async fn inject_empty_transaction(&mut self, gtid: &Gtid) -> Result<()> {
        // Gtid only admits alphanumerics, '-' and digits, so inlining is safe
        self.query_drop(&format!("SET GTID_NEXT = '{}'", gtid)).await?;
        let committed = async {
            self.query_drop("BEGIN").await?;
            self.query_drop("COMMIT").await
        }
        .await;
        self.query_drop("SET GTID_NEXT = 'AUTOMATIC'").await?;
        committed
    }

    async fn register_console(&mut self, host: &str, port: u16, force: bool) -> Result<bool> {
        self.query_drop("SET SQL_LOG_BIN = 0").await?;
        let inserted = self.insert_registration(host, port, force).await;
        self.query_drop("SET SQL_LOG_BIN = 1").await?;
        inserted
    }

    async fn unregister_console(&mut self, host: &str, port: u16) -> Result<()> {
        self.query_drop("SET SQL_LOG_BIN = 0").await?;
        let deleted = async {
            self.query_drop(CREATE_CONSOLE_TABLE).await?;
            self.conn()?
                .exec_drop(
                    "DELETE FROM mysql.failover_console WHERE host = ? AND port = ?",
                    (host, port.to_string()),
                )
                .await?;
            Ok::<(), anyhow::Error>(())
        }
        .await;
        self.query_drop("SET SQL_LOG_BIN = 1").await?;
        deleted
    }

    async fn console_registered(&mut self, host: &str, port: u16) -> Result<bool> {
        self.query_drop(CREATE_CONSOLE_TABLE).await?;
        let count: Option<u64> = self
            .conn()?
            .exec_first(
                "SELECT COUNT(*) FROM mysql.failover_console WHERE host = ? AND port = ?",
                (host, port.to_string()),
            )
            .await?;
        Ok(count.unwrap_or(0) > 0)
    }
}

fn column<T: FromValue>(row: &Row, name: &str) -> Option<T> {
    row.get_opt(name).and_then(|value| value.ok())
}

/// Escape a string for use inside a single-quoted SQL literal
fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

fn change_master_statement(target: &ChangeMasterTarget) -> String {
    format!(
        "CHANGE MASTER TO MASTER_HOST = {}, MASTER_PORT = {}, MASTER_USER = {}, \
         MASTER_PASSWORD = {}, MASTER_AUTO_POSITION = 1",
        quote_literal(&target.host),
        target.port,
        quote_literal(&target.user),
        quote_literal(&target.password)
    )
}

fn missing_from_grants(grants: &[String], required: &[&str]) -> Vec<String> {
    let global: Vec<String> = grants
        .iter()
        .map(|g| g.to_uppercase())
        .filter(|g| g.contains(" ON *.* "))
        .collect();
    let has_grant_option = global.iter().any(|g| g.contains("WITH GRANT OPTION"));
    let held: Vec<&str> = global.iter().flat_map(|g| granted_privileges(g)).collect();
    // GRANT OPTION is not implied by ALL PRIVILEGES
    let has_all = held.iter().any(|p| *p == "ALL PRIVILEGES" || *p == "ALL");

    required
        .iter()
        .filter(|privilege| {
            let privilege = privilege.to_uppercase();
            if privilege == "GRANT OPTION" {
                !has_grant_option
            } else {
                !has_all && !held.contains(&privilege.as_str())
            }
        })
        .map(|p| p.to_string())
        .collect()
}

/// Privilege names of one upper-cased `GRANT ... ON` line, e.g.
/// `["SELECT", "CREATE USER"]`
fn granted_privileges(grant: &str) -> Vec<&str> {
    let Some(list) = grant.strip_prefix("GRANT ") else {
        return Vec::new();
    };
    let list = list.split(" ON ").next().unwrap_or_default();
    list.split(',').map(str::trim).filter(|p| !p.is_empty()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_master_escapes_credentials() {
        let statement = change_master_statement(&ChangeMasterTarget {
            host: "db2".to_string(),
            port: 3307,
            user: "rpl".to_string(),
            password: "it's".to_string(),
        });
        assert_eq!(
            statement,
            "CHANGE MASTER TO MASTER_HOST = 'db2', MASTER_PORT = 3307, MASTER_USER = 'rpl', \
             MASTER_PASSWORD = 'it\\'s', MASTER_AUTO_POSITION = 1"
        );
    }

    #[test]
    fn all_privileges_with_grant_option_covers_everything() {
        let grants = vec![
            "GRANT ALL PRIVILEGES ON *.* TO 'root'@'%' WITH GRANT OPTION".to_string(),
        ];
        assert!(missing_from_grants(&grants, crate::topology::REQUIRED_PRIVILEGES).is_empty());
    }

    #[test]
    fn all_privileges_without_grant_option() {
        let grants = vec!["GRANT ALL PRIVILEGES ON *.* TO 'admin'@'%'".to_string()];
        assert_eq!(
            missing_from_grants(&grants, crate::topology::REQUIRED_PRIVILEGES),
            vec!["GRANT OPTION"]
        );
    }

    #[test]
    fn reports_missing_individual_privileges() {
        let grants = vec![
            "GRANT SELECT, INSERT, REPLICATION SLAVE ON *.* TO 'rpl'@'%'".to_string(),
            "GRANT SUPER ON `app`.* TO 'rpl'@'%'".to_string(),
        ];
        let missing = missing_from_grants(&grants, &["SELECT", "SUPER", "REPLICATION SLAVE"]);
        assert_eq!(missing, vec!["SUPER"]);
    }

    #[test]
    fn privileges_sharing_a_prefix_do_not_count() {
        let grants = vec![
            "GRANT CREATE USER, CREATE TEMPORARY TABLES, DROP ROLE ON *.* TO 'ops'@'%'"
                .to_string(),
        ];
        let missing = missing_from_grants(&grants, &["CREATE", "DROP", "CREATE USER"]);
        assert_eq!(missing, vec!["CREATE", "DROP"]);
    }
}
