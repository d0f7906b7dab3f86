use std::time::Duration;

use super::Bundler;
use crate::error::{GridError, Result};

/// Always suggests the same bundle size.
#[derive(Debug, Clone)]
pub struct ManualBundler {
    size: usize,
}

impl ManualBundler {
    pub fn new(size: usize) -> Self {
        Self { size }
    }
}

impl Bundler for ManualBundler {
    fn name(&self) -> &'static str {
        "manual"
    }

    fn bundle_size(&self) -> Result<usize> {
        if self.size == 0 {
            return Err(GridError::LoadBalancer(
                "manual bundle size must be at least 1".to_string(),
            ));
        }
        Ok(self.size)
    }

    fn feedback(&mut self, _nb_tasks: usize, _elapsed: Duration) {}
}
