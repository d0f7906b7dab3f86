//! gridlite: a job-execution grid.
//!
//! A driver accepts jobs, splits them into task units and dispatches them to
//! node agents connected over persistent TCP channels.

pub mod balancer;
pub mod channel;
pub mod config;
pub mod dashboard;
pub mod driver;
pub mod error;
pub mod handler;
pub mod policy;
pub mod scheduler;
pub mod shutdown;
pub mod stats;
pub mod transport;
pub mod worker;

pub use driver::{Driver, DriverContext};
pub use error::{GridError, Result};
