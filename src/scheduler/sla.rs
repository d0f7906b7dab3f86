use serde::{Deserialize, Serialize};

use crate::policy::{ExecutionPolicy, SystemInfo};

/// Node configuration a job wants to run on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesiredConfiguration {
    pub properties: SystemInfo,
    /// Restart reserved nodes even when they already match
    #[serde(default)]
    pub force_restart: bool,
}

/// Service-level agreement of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobSla {
    /// Higher runs first
    pub priority: i32,
    pub max_nodes: usize,
    /// Maximum number of peer drivers a job may traverse
    pub max_driver_depth: usize,
    /// Upper bound on the load-balancer-suggested bundle size
    pub max_dispatch_size: usize,
    pub execution_policy: Option<ExecutionPolicy>,
    pub grid_policy: Option<ExecutionPolicy>,
    /// Ordered sub-policies; the first one matching any idle node wins
    pub preference_policy: Option<Vec<ExecutionPolicy>>,
    pub desired_configuration: Option<DesiredConfiguration>,
    /// Abandon a dispatched unit after this many milliseconds
    pub dispatch_expiration_ms: Option<u64>,
    pub max_dispatch_expirations: u32,
    pub allow_multiple_dispatches_to_same_channel: bool,
    /// How many distinct provisioning master/slave groups the job may span
    pub max_node_provisioning_groups: usize,
    pub max_task_resubmits: u32,
    /// Count channel-failure resubmits against `max_task_resubmits`
    pub apply_max_resubmits_upon_node_error: bool,
    pub suspended: bool,
    /// Run every task on every connected node
    pub broadcast: bool,
    /// Keep the job pending for this long after submission
    pub start_delay_ms: Option<u64>,
    /// Cancel the job if it has not completed after this long
    pub expiration_ms: Option<u64>,
}

impl Default for JobSla {
    fn default() -> Self {
        Self {
            priority: 0,
            max_nodes: usize::MAX,
            max_driver_depth: usize::MAX,
            max_dispatch_size: usize::MAX,
            execution_policy: None,
            grid_policy: None,
            preference_policy: None,
            desired_configuration: None,
            dispatch_expiration_ms: None,
            max_dispatch_expirations: 0,
            allow_multiple_dispatches_to_same_channel: false,
            max_node_provisioning_groups: usize::MAX,
            max_task_resubmits: 1,
            apply_max_resubmits_upon_node_error: false,
            suspended: false,
            broadcast: false,
            start_delay_ms: None,
            expiration_ms: None,
        }
    }
}

impl JobSla {
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_nodes(mut self, max_nodes: usize) -> Self {
        self.max_nodes = max_nodes;
        self
    }

    pub fn with_execution_policy(mut self, policy: ExecutionPolicy) -> Self {
        self.execution_policy = Some(policy);
        self
    }

    pub fn with_desired_configuration(mut self, properties: SystemInfo) -> Self {
        self.desired_configuration = Some(DesiredConfiguration {
            properties,
            force_restart: false,
        });
        self
    }

    pub fn with_dispatch_expiration_ms(mut self, ms: u64) -> Self {
        self.dispatch_expiration_ms = Some(ms);
        self
    }

    pub fn with_max_task_resubmits(mut self, max: u32) -> Self {
        self.max_task_resubmits = max;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_unbounded() {
        let sla = JobSla::default();
        assert_eq!(sla.max_nodes, usize::MAX);
        assert_eq!(sla.max_dispatch_size, usize::MAX);
        assert_eq!(sla.max_node_provisioning_groups, usize::MAX);
        assert!(!sla.allow_multiple_dispatches_to_same_channel);
        assert!(!sla.broadcast);
    }

    #[test]
    fn partial_json_uses_defaults() {
        let sla: JobSla = serde_json::from_str(r#"{"priority":5,"max_nodes":2}"#).unwrap();
        assert_eq!(sla.priority, 5);
        assert_eq!(sla.max_nodes, 2);
        assert_eq!(sla.max_task_resubmits, 1);
        assert!(sla.execution_policy.is_none());
    }
}
