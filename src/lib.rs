// ABOUTME: Library module for mysql-rpl-failover
// ABOUTME: Exports GTID algebra, topology access and the failover console for the binary and tests

pub mod commands;
pub mod config;
pub mod daemon;
pub mod errors;
pub mod failover;
pub mod gtid;
pub mod mysql;
pub mod topology;
pub mod utils;
