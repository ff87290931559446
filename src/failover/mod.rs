// ABOUTME: Automatic failover: the console state machine and the protocols it drives
// ABOUTME: Detection, election, promotion, registration, hooks and report output

pub mod console;
pub mod detection;
pub mod election;
pub mod hooks;
pub mod promotion;
pub mod registration;
pub mod report;
pub mod shutdown;

pub use console::{ConsoleState, FailoverConsole, TickOutcome};
pub use registration::Registration;
pub use report::{ConsoleSink, LogSink, OutputSink};
pub use shutdown::Shutdown;
