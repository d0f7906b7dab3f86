use std::time::Duration;

use super::{Bundler, BundlerEx};
use crate::error::{GridError, Result};

/// Weight of the newest sample in the moving average.
const SMOOTHING: f64 = 0.3;
const MAX_SIZE: usize = 10_000;

/// Sizes bundles so that one round trip takes about `target`.
///
/// Keeps an exponential moving average of the time per task. Plain feedback
/// uses the whole round trip; extended feedback uses the node-side elapsed
/// time and tracks transport overhead separately, so slow links do not shrink
/// bundles.
#[derive(Debug, Clone)]
pub struct AdaptiveBundler {
    initial: usize,
    target: Duration,
    per_task_ms: Option<f64>,
    overhead_ms: f64,
}

impl AdaptiveBundler {
    pub fn new(initial: usize, target: Duration) -> Self {
        Self {
            initial: initial.max(1),
            target,
            per_task_ms: None,
            overhead_ms: 0.0,
        }
    }

    fn record(&mut self, nb_tasks: usize, elapsed_ms: f64) {
        if nb_tasks == 0 {
            return;
        }
        let sample = elapsed_ms / nb_tasks as f64;
        self.per_task_ms = Some(match self.per_task_ms {
            Some(avg) => avg + SMOOTHING * (sample - avg),
            None => sample,
        });
    }
}

impl Bundler for AdaptiveBundler {
    fn name(&self) -> &'static str {
        "adaptive"
    }

    fn bundle_size(&self) -> Result<usize> {
        if self.target.is_zero() {
            return Err(GridError::LoadBalancer(
                "adaptive target duration must be positive".to_string(),
            ));
        }
        let Some(per_task) = self.per_task_ms else {
            return Ok(self.initial);
        };
        let budget = millis(self.target) - self.overhead_ms;
        if per_task <= f64::EPSILON {
            return Ok(MAX_SIZE);
        }
        let size = (budget / per_task).floor();
        Ok((size.max(1.0) as usize).min(MAX_SIZE))
    }

    fn feedback(&mut self, nb_tasks: usize, elapsed: Duration) {
        self.record(nb_tasks, millis(elapsed));
    }

    fn extended(&mut self) -> Option<&mut dyn BundlerEx> {
        Some(self)
    }
}

impl BundlerEx for AdaptiveBundler {
    fn feedback_ex(&mut self, nb_tasks: usize, round_trip: Duration, node_elapsed: Duration) {
        let overhead = millis(round_trip.saturating_sub(node_elapsed));
        self.overhead_ms += SMOOTHING * (overhead - self.overhead_ms);
        self.record(nb_tasks, millis(node_elapsed));
    }
}

fn millis(d: Duration) -> f64 {
    d.as_micros() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_with_initial_size() {
        let b = AdaptiveBundler::new(5, Duration::from_millis(100));
        assert_eq!(b.bundle_size().unwrap(), 5);
    }

    #[test]
    fn converges_toward_target() {
        let mut b = AdaptiveBundler::new(5, Duration::from_millis(100));
        for _ in 0..20 {
            b.feedback(5, Duration::from_millis(50));
        }
        // 10ms per task, 100ms target
        assert_eq!(b.bundle_size().unwrap(), 10);
    }

    #[test]
    fn slow_tasks_shrink_to_one() {
        let mut b = AdaptiveBundler::new(5, Duration::from_millis(100));
        b.feedback(1, Duration::from_secs(2));
        assert_eq!(b.bundle_size().unwrap(), 1);
    }

    #[test]
    fn extended_feedback_ignores_transport_time() {
        let mut plain = AdaptiveBundler::new(1, Duration::from_millis(200));
        let mut ext = AdaptiveBundler::new(1, Duration::from_millis(200));
        plain.feedback(4, Duration::from_millis(100));
        ext.extended()
            .unwrap()
            .feedback_ex(4, Duration::from_millis(100), Duration::from_millis(40));
        assert!(ext.bundle_size().unwrap() > plain.bundle_size().unwrap());
    }

    #[test]
    fn zero_target_is_an_error() {
        assert!(AdaptiveBundler::new(1, Duration::ZERO).bundle_size().is_err());
    }
}
