//! Load-balancer strategies.
//!
//! Every node channel owns one [`Bundler`], created from the driver's
//! [`BalancerConfig`] when the channel becomes active. The matcher asks it for
//! a bundle size before each dispatch and the result handler feeds back the
//! measured round trip.
//!
//! Two algorithms are built in:
//! - `manual`: a fixed bundle size
//! - `adaptive`: sizes bundles so one round trip lasts about `target_bundle_ms`

pub mod adaptive;
pub mod manual;

use std::fmt;
use std::time::Duration;

use crate::config::BalancerConfig;
use crate::error::Result;

pub use adaptive::AdaptiveBundler;
pub use manual::ManualBundler;

/// Computes bundle sizes for one channel.
pub trait Bundler: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Suggested number of tasks for the next dispatch unit.
    fn bundle_size(&self) -> Result<usize>;

    /// Round-trip feedback for a unit of `nb_tasks` tasks.
    fn feedback(&mut self, nb_tasks: usize, elapsed: Duration);

    /// Extended accounting interface, when the algorithm supports it.
    fn extended(&mut self) -> Option<&mut dyn BundlerEx> {
        None
    }
}

/// Feedback split into node-side execution time and transport overhead.
pub trait BundlerEx {
    fn feedback_ex(&mut self, nb_tasks: usize, round_trip: Duration, node_elapsed: Duration);
}

/// Creates bundlers from configuration.
#[derive(Debug, Clone)]
pub struct BundlerFactory {
    config: BalancerConfig,
}

impl BundlerFactory {
    pub fn new(config: BalancerConfig) -> Self {
        Self { config }
    }

    pub fn create(&self) -> Box<dyn Bundler> {
        match self.config.algorithm.as_str() {
            "manual" => Box::new(ManualBundler::new(self.config.size)),
            "adaptive" => Box::new(AdaptiveBundler::new(
                self.config.size,
                Duration::from_millis(self.config.target_bundle_ms),
            )),
            other => {
                tracing::warn!(algorithm = other, "Unknown load-balancing algorithm, using manual");
                Box::new(ManualBundler::new(self.config.size))
            }
        }
    }

    /// Strategy used when a channel's own bundler fails.
    pub fn fallback() -> Box<dyn Bundler> {
        Box::new(ManualBundler::new(1))
    }
}
