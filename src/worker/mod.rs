//! Node agent.
//!
//! A node connects to a driver, answers its handshake and runs the task
//! units it is given:
//! - **Execution**: every task payload is a shell command, run with `sh -c`
//!   or inside a Docker sandbox ([`TaskExecutor`])
//! - **Results**: one JSON [`TaskOutcome`](executor::TaskOutcome) per task;
//!   exit code 75 asks the driver to resubmit the task
//! - **Throttling**: the node tells the driver when it stops or resumes
//!   accepting units
//! - **Control**: `Cancel` kills a running unit, `Reconfigure` merges new
//!   properties and optionally reconnects with them
//!
//! An offline node drops the connection after receiving a unit and delivers
//! the results in the handshake of its next connection.

pub mod agent;
pub mod executor;

pub use agent::NodeAgent;
pub use executor::TaskExecutor;
