use std::process::Stdio;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::config::SandboxConfig;

/// Exit code a task uses to ask the driver for a resubmission (EX_TEMPFAIL).
pub const EXIT_RESUBMIT: i32 = 75;

/// Outcome of one task, returned to the driver as a JSON result segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub exit_code: Option<i32>,
    pub output: Option<String>,
    pub error: Option<String>,
    #[serde(default)]
    pub cancelled: bool,
    pub elapsed_ms: u64,
}

impl TaskOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn wants_resubmit(&self) -> bool {
        self.exit_code == Some(EXIT_RESUBMIT)
    }
}

/// Runs task commands with `sh -c`, or inside a Docker container when the
/// sandbox is enabled.
///
/// Sandboxed tasks run with:
/// - Network isolation (disabled by default)
/// - Dropped capabilities
/// - Read-only root filesystem
/// - Memory and CPU limits
#[derive(Debug, Clone)]
pub struct TaskExecutor {
    config: SandboxConfig,
}

impl TaskExecutor {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    pub fn sandboxed(&self) -> bool {
        self.config.enabled
    }

    /// Run one task command. The process is killed if `cancel` fires first.
    pub async fn execute(&self, command: &str, cancel: &CancellationToken) -> TaskOutcome {
        tracing::debug!(command, sandboxed = self.config.enabled, "Executing task");
        let started = Instant::now();

        let mut cmd = if self.config.enabled {
            let mut cmd = Command::new("docker");
            cmd.args(self.docker_args(command));
            cmd
        } else {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(command);
            cmd
        };
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(command, error = %e, "Failed to start task");
                return TaskOutcome {
                    exit_code: None,
                    output: None,
                    error: Some(e.to_string()),
                    cancelled: false,
                    elapsed_ms: elapsed_ms(started),
                };
            }
        };

        tokio::select! {
            result = child.wait_with_output() => Self::process_output(command, result, started),
            _ = cancel.cancelled() => {
                tracing::info!(command, "Task cancelled");
                TaskOutcome {
                    exit_code: None,
                    output: None,
                    error: Some("cancelled".to_string()),
                    cancelled: true,
                    elapsed_ms: elapsed_ms(started),
                }
            }
        }
    }

    fn docker_args(&self, command: &str) -> Vec<String> {
        let mut args = vec!["run".to_string(), "--rm".to_string()];

        if self.config.network_disabled {
            args.push("--network=none".to_string());
        }
        if let Some(ref limit) = self.config.memory_limit {
            args.push(format!("--memory={}", limit));
        }
        if let Some(ref limit) = self.config.cpu_limit {
            args.push(format!("--cpus={}", limit));
        }

        args.push("--cap-drop=ALL".to_string());
        args.push("--security-opt=no-new-privileges".to_string());
        args.push("--read-only".to_string());

        args.push(self.config.image.clone());
        args.push("sh".to_string());
        args.push("-c".to_string());
        args.push(command.to_string());
        args
    }

    fn process_output(
        command: &str,
        result: Result<std::process::Output, std::io::Error>,
        started: Instant,
    ) -> TaskOutcome {
        let elapsed_ms = elapsed_ms(started);
        match result {
            Ok(output) => {
                let stdout = String::from_utf8_lossy(&output.stdout).to_string();
                let stderr = String::from_utf8_lossy(&output.stderr).to_string();
                let exit_code = output.status.code();

                let error = if output.status.success() {
                    None
                } else if stderr.is_empty() {
                    Some(format!("Exit code: {:?}", exit_code))
                } else {
                    Some(stderr)
                };

                tracing::debug!(command, exit_code = ?exit_code, elapsed_ms, "Task finished");

                TaskOutcome {
                    exit_code,
                    output: if stdout.is_empty() { None } else { Some(stdout) },
                    error,
                    cancelled: false,
                    elapsed_ms,
                }
            }
            Err(e) => {
                tracing::error!(command, error = %e, "Task execution failed");
                TaskOutcome {
                    exit_code: None,
                    output: None,
                    error: Some(e.to_string()),
                    cancelled: false,
                    elapsed_ms,
                }
            }
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn docker_args_apply_limits() {
        let executor = TaskExecutor::new(SandboxConfig {
            enabled: true,
            ..Default::default()
        });
        let args = executor.docker_args("echo hi");
        assert!(args.contains(&"--network=none".to_string()));
        assert!(args.contains(&"--memory=256m".to_string()));
        assert!(args.contains(&"--cpus=0.5".to_string()));
        assert_eq!(&args[args.len() - 3..], ["sh", "-c", "echo hi"]);
    }

    #[test]
    fn docker_args_without_limits() {
        let executor = TaskExecutor::new(SandboxConfig {
            enabled: true,
            network_disabled: false,
            memory_limit: None,
            cpu_limit: None,
            ..Default::default()
        });
        let args = executor.docker_args("true");
        assert!(!args.iter().any(|a| a.starts_with("--network")));
        assert!(!args.iter().any(|a| a.starts_with("--memory")));
        assert!(!args.iter().any(|a| a.starts_with("--cpus")));
    }

    #[test]
    fn resubmit_exit_code() {
        let outcome = TaskOutcome {
            exit_code: Some(EXIT_RESUBMIT),
            output: None,
            error: None,
            cancelled: false,
            elapsed_ms: 0,
        };
        assert!(outcome.wants_resubmit());
        assert!(!outcome.success());
    }
}
