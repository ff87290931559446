// ABOUTME: Command implementations behind each CLI subcommand
// ABOUTME: Exports failover, daemon, health, gtid, skip_transactions and unregister

pub mod daemon;
pub mod failover;
pub mod gtid;
pub mod health;
pub mod skip;
pub mod unregister;

pub use daemon::{daemon, DaemonAction};
pub use failover::failover;
pub use gtid::{gtid, GtidOperation};
pub use health::{health, HealthFormat};
pub use skip::skip_transactions;
pub use unregister::unregister;
