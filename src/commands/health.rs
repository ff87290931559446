// ABOUTME: One-shot replication health report for a master and its slaves
// ABOUTME: Prints health, GTID and UUID tables, or the same data as JSON

use crate::config::ReportValue;
use crate::failover::report::format_grid;
use crate::mysql::{MySqlConnector, ServerAddress};
use crate::topology::{GtidRow, HealthRow, Topology, UuidRow};
use anyhow::Result;
use clap::ValueEnum;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum HealthFormat {
    Table,
    Json,
}

/// Rows collected for one report run; absent sections were not requested
#[derive(Debug, Default, Serialize)]
pub struct HealthReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<Vec<HealthRow>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gtid: Option<Vec<GtidRow>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<Vec<UuidRow>>,
}

impl HealthReport {
    pub async fn collect(topology: &mut Topology, values: &[ReportValue], max_delay: u64) -> Self {
        let mut report = HealthReport::default();
        for value in values {
            match value {
                ReportValue::Health => report.health = Some(topology.health(max_delay).await),
                ReportValue::Gtid => report.gtid = Some(topology.gtid_report().await),
                ReportValue::Uuid => report.uuid = Some(topology.uuid_report().await),
            }
        }
        report
    }

    /// True unless a health section was collected with a failing row
    pub fn is_healthy(&self) -> bool {
        self.health
            .as_ref()
            .map_or(true, |rows| rows.iter().all(HealthRow::is_ok))
    }

    pub fn render_table(&self) -> Vec<String> {
        let mut lines = Vec::new();
        if let Some(rows) = &self.health {
            section(
                &mut lines,
                "Replication Health Status",
                &HealthRow::HEADERS,
                rows.iter().map(HealthRow::cells),
            );
        }
        if let Some(rows) = &self.gtid {
            section(
                &mut lines,
                "Transactions",
                &GtidRow::HEADERS,
                rows.iter().map(GtidRow::cells),
            );
        }
        if let Some(rows) = &self.uuid {
            section(&mut lines, "UUIDs", &UuidRow::HEADERS, rows.iter().map(UuidRow::cells));
        }
        lines
    }
}

fn section(
    lines: &mut Vec<String>,
    title: &str,
    headers: &[&str],
    rows: impl Iterator<Item = Vec<String>>,
) {
    let rows: Vec<Vec<String>> = rows.collect();
    lines.push(format!("# {}:", title));
    lines.extend(format_grid(headers, &rows));
    lines.push(String::new());
}

/// Connect to the topology and print the requested reports
pub async fn health(
    master: &ServerAddress,
    slaves: &[ServerAddress],
    discover: bool,
    values: &[ReportValue],
    max_delay: u64,
    format: HealthFormat,
) -> Result<()> {
    let mut topology =
        Topology::connect(Arc::new(MySqlConnector), master, slaves, discover).await?;
    let report = HealthReport::collect(&mut topology, values, max_delay).await;

    match format {
        HealthFormat::Table => {
            for line in report.render_table() {
                println!("{}", line);
            }
        }
        HealthFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
    }

    if !report.is_healthy() {
        tracing::warn!("⚠ One or more servers are unhealthy");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(health: &str) -> HealthRow {
        HealthRow {
            host: "db2".to_string(),
            port: 3306,
            role: "SLAVE".to_string(),
            state: "UP".to_string(),
            gtid_mode: "ON".to_string(),
            health: health.to_string(),
        }
    }

    #[test]
    fn empty_report_is_healthy_and_renders_nothing() {
        let report = HealthReport::default();
        assert!(report.is_healthy());
        assert!(report.render_table().is_empty());
    }

    #[test]
    fn json_omits_sections_not_requested() {
        let report = HealthReport {
            health: Some(vec![row("OK")]),
            ..Default::default()
        };
        let json = serde_json::to_value(&report).unwrap();
        assert!(json.get("health").is_some());
        assert!(json.get("gtid").is_none());
        assert_eq!(json["health"][0]["host"], "db2");
    }

    #[test]
    fn failing_row_marks_report_unhealthy() {
        let report = HealthReport {
            health: Some(vec![row("OK"), row("SQL thread is not running")]),
            ..Default::default()
        };
        assert!(!report.is_healthy());
        let lines = report.render_table();
        assert_eq!(lines[0], "# Replication Health Status:");
        assert!(lines.iter().any(|l| l.contains("SQL thread is not running")));
    }
}
