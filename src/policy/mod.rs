//! Placement predicates.
//!
//! Execution, grid and preference policies share one expression tree,
//! [`ExecutionPolicy`], evaluated against a [`SystemInfo`] property bag:
//! - execution policies are evaluated against each candidate node's info
//! - grid policies are evaluated against the driver's own info
//! - preference policies are an ordered list of execution policies
//!
//! Job-scoped values are bound explicitly through a [`PolicyContext`] rather
//! than ambient state. Property names prefixed with `job.` resolve from the
//! context, `driver.` names resolve from the driver snapshot, everything else
//! from the evaluated bag:
//!
//! | name | value |
//! |---|---|
//! | `job.name` | job name |
//! | `job.priority` | SLA priority |
//! | `job.max.nodes` | SLA max nodes |
//! | `job.channels` | nodes the job currently runs on |
//! | `job.metadata.<key>` | job metadata entry |

pub mod distance;
pub mod system_info;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub use distance::configuration_distance;
pub use system_info::SystemInfo;

/// Job-scoped values bound into a policy evaluation.
#[derive(Debug, Clone, Copy)]
pub struct PolicyContext<'a> {
    pub job_name: &'a str,
    pub priority: i32,
    pub max_nodes: usize,
    pub job_channels: usize,
    pub metadata: &'a BTreeMap<String, String>,
    pub driver: &'a SystemInfo,
}

impl<'a> PolicyContext<'a> {
    fn lookup(&self, props: &'a SystemInfo, name: &str) -> Option<String> {
        if let Some(key) = name.strip_prefix("job.metadata.") {
            return self.metadata.get(key).cloned();
        }
        match name {
            "job.name" => return Some(self.job_name.to_string()),
            "job.priority" => return Some(self.priority.to_string()),
            "job.max.nodes" => return Some(self.max_nodes.to_string()),
            "job.channels" => return Some(self.job_channels.to_string()),
            _ => {}
        }
        if name.starts_with("driver.") {
            return self.driver.get(name).map(str::to_string);
        }
        props.get(name).map(str::to_string)
    }
}

/// Predicate tree over node or driver properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionPolicy {
    AcceptAll,
    RejectAll,
    And {
        rules: Vec<ExecutionPolicy>,
    },
    Or {
        rules: Vec<ExecutionPolicy>,
    },
    Xor {
        rules: Vec<ExecutionPolicy>,
    },
    Not {
        rule: Box<ExecutionPolicy>,
    },
    Equal {
        property: String,
        value: String,
        #[serde(default)]
        ignore_case: bool,
    },
    Contains {
        property: String,
        value: String,
        #[serde(default)]
        ignore_case: bool,
    },
    OneOf {
        property: String,
        values: Vec<String>,
    },
    AtLeast {
        property: String,
        value: f64,
    },
    AtMost {
        property: String,
        value: f64,
    },
    MoreThan {
        property: String,
        value: f64,
    },
    LessThan {
        property: String,
        value: f64,
    },
    Between {
        property: String,
        min: f64,
        max: f64,
    },
    IsTrue {
        property: String,
    },
    Defined {
        property: String,
    },
}

impl ExecutionPolicy {
    pub fn equal(property: &str, value: impl ToString) -> Self {
        Self::Equal {
            property: property.to_string(),
            value: value.to_string(),
            ignore_case: false,
        }
    }

    pub fn at_least(property: &str, value: f64) -> Self {
        Self::AtLeast {
            property: property.to_string(),
            value,
        }
    }

    pub fn at_most(property: &str, value: f64) -> Self {
        Self::AtMost {
            property: property.to_string(),
            value,
        }
    }

    pub fn is_true(property: &str) -> Self {
        Self::IsTrue {
            property: property.to_string(),
        }
    }

    pub fn and(self, other: ExecutionPolicy) -> Self {
        match self {
            Self::And { mut rules } => {
                rules.push(other);
                Self::And { rules }
            }
            first => Self::And {
                rules: vec![first, other],
            },
        }
    }

    pub fn or(self, other: ExecutionPolicy) -> Self {
        match self {
            Self::Or { mut rules } => {
                rules.push(other);
                Self::Or { rules }
            }
            first => Self::Or {
                rules: vec![first, other],
            },
        }
    }

    pub fn negate(self) -> Self {
        Self::Not {
            rule: Box::new(self),
        }
    }

    /// Evaluate against `props`, resolving job-scoped names through `ctx`.
    ///
    /// A missing or unparsable property never matches a comparison.
    pub fn evaluate(&self, props: &SystemInfo, ctx: &PolicyContext<'_>) -> bool {
        match self {
            Self::AcceptAll => true,
            Self::RejectAll => false,
            Self::And { rules } => rules.iter().all(|r| r.evaluate(props, ctx)),
            Self::Or { rules } => rules.iter().any(|r| r.evaluate(props, ctx)),
            Self::Xor { rules } => {
                rules.iter().filter(|r| r.evaluate(props, ctx)).count() == 1
            }
            Self::Not { rule } => !rule.evaluate(props, ctx),
            Self::Equal {
                property,
                value,
                ignore_case,
            } => ctx
                .lookup(props, property)
                .map(|have| text_equal(&have, value, *ignore_case))
                .unwrap_or(false),
            Self::Contains {
                property,
                value,
                ignore_case,
            } => ctx
                .lookup(props, property)
                .map(|have| {
                    if *ignore_case {
                        have.to_lowercase().contains(&value.to_lowercase())
                    } else {
                        have.contains(value.as_str())
                    }
                })
                .unwrap_or(false),
            Self::OneOf { property, values } => ctx
                .lookup(props, property)
                .map(|have| values.iter().any(|v| text_equal(&have, v, false)))
                .unwrap_or(false),
            Self::AtLeast { property, value } => {
                numeric(ctx, props, property).is_some_and(|n| n >= *value)
            }
            Self::AtMost { property, value } => {
                numeric(ctx, props, property).is_some_and(|n| n <= *value)
            }
            Self::MoreThan { property, value } => {
                numeric(ctx, props, property).is_some_and(|n| n > *value)
            }
            Self::LessThan { property, value } => {
                numeric(ctx, props, property).is_some_and(|n| n < *value)
            }
            Self::Between { property, min, max } => {
                numeric(ctx, props, property).is_some_and(|n| n >= *min && n <= *max)
            }
            Self::IsTrue { property } => ctx
                .lookup(props, property)
                .map(|v| v.trim().eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            Self::Defined { property } => ctx.lookup(props, property).is_some(),
        }
    }
}

fn numeric(ctx: &PolicyContext<'_>, props: &SystemInfo, property: &str) -> Option<f64> {
    ctx.lookup(props, property)
        .and_then(|v| v.trim().parse::<f64>().ok())
}

fn text_equal(have: &str, want: &str, ignore_case: bool) -> bool {
    if let (Ok(a), Ok(b)) = (have.trim().parse::<f64>(), want.trim().parse::<f64>()) {
        return (a - b).abs() < f64::EPSILON;
    }
    if ignore_case {
        have.eq_ignore_ascii_case(want)
    } else {
        have == want
    }
}
