pub mod dispatch_loop;
pub mod idle_pool;
pub mod job;
pub mod matcher;
pub mod queue;
pub mod reservation;
pub mod sla;

pub use job::{Job, JobSpec, JobStatus};
pub use queue::JobQueue;
pub use sla::JobSla;
