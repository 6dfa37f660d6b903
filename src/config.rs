use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Environment variable holding the maximum execution time in seconds
pub const MAX_EXECUTION_ENV: &str = "SANDBOX_MAX_EXECUTION_SECONDS";

pub const DEFAULT_MAX_EXECUTION_SECONDS: u64 = 30;

/// Resource limits applied to the worker process
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Maximum address space in MB
    pub memory_mb: usize,
    /// Maximum number of threads for scientific libraries
    pub max_threads: u32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: 2048,
            max_threads: 4,
        }
    }
}

/// Sandbox configuration.
///
/// Only the execution ceiling is read from the environment; dataset path and
/// code are per-call parameters.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Upper bound for any single execution
    pub max_execution: Duration,
    /// Interpreter to run; discovered in PATH when unset
    pub python_path: Option<PathBuf>,
    /// Base directory for per-execution workspaces
    pub workspace_base: PathBuf,
    /// Resource limits
    pub limits: ResourceLimits,
    /// Rows kept in each captured table preview
    pub max_table_rows: usize,
    /// Captured stdout beyond this many bytes is truncated
    pub max_output_bytes: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_execution: Duration::from_secs(DEFAULT_MAX_EXECUTION_SECONDS),
            python_path: None,
            workspace_base: std::env::temp_dir().join("analyst-sandbox-workspaces"),
            limits: ResourceLimits::default(),
            max_table_rows: 20,
            max_output_bytes: 1024 * 1024,
        }
    }
}

impl SandboxConfig {
    /// Defaults, with the execution ceiling taken from `SANDBOX_MAX_EXECUTION_SECONDS`
    pub fn from_env() -> Self {
        let raw = std::env::var(MAX_EXECUTION_ENV).ok();
        Self {
            max_execution: Duration::from_secs(parse_max_seconds(raw.as_deref())),
            ..Default::default()
        }
    }

    /// Use an explicit interpreter (for bundled Python)
    pub fn with_python_path(mut self, python_path: PathBuf) -> Self {
        self.python_path = Some(python_path);
        self
    }

    /// Set custom resource limits
    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_max_execution(mut self, max_execution: Duration) -> Self {
        self.max_execution = max_execution;
        self
    }

    pub fn with_workspace_base(mut self, workspace_base: PathBuf) -> Self {
        self.workspace_base = workspace_base;
        self
    }

    /// Deadline for a call asking for `requested_seconds`.
    ///
    /// Clamped to `[1s, max_execution]`; zero asks for the maximum.
    pub fn deadline_for(&self, requested_seconds: u64) -> Duration {
        let max_seconds = self.max_execution.as_secs().max(1);
        let seconds = match requested_seconds {
            0 => max_seconds,
            n => n.clamp(1, max_seconds),
        };
        Duration::from_secs(seconds)
    }
}

fn parse_max_seconds(raw: Option<&str>) -> u64 {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return DEFAULT_MAX_EXECUTION_SECONDS;
    };
    match raw.parse::<u64>() {
        Ok(0) | Err(_) => {
            warn!(
                "Ignoring invalid {}={:?}, using {}s",
                MAX_EXECUTION_ENV, raw, DEFAULT_MAX_EXECUTION_SECONDS
            );
            DEFAULT_MAX_EXECUTION_SECONDS
        }
        Ok(seconds) => seconds,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_max_seconds() {
        assert_eq!(parse_max_seconds(None), 30);
        assert_eq!(parse_max_seconds(Some("")), 30);
        assert_eq!(parse_max_seconds(Some(" 45 ")), 45);
        assert_eq!(parse_max_seconds(Some("0")), 30);
        assert_eq!(parse_max_seconds(Some("-3")), 30);
        assert_eq!(parse_max_seconds(Some("ten")), 30);
    }

    #[test]
    fn test_deadline_is_clamped_to_ceiling() {
        let config = SandboxConfig::default().with_max_execution(Duration::from_secs(10));
        assert_eq!(config.deadline_for(0), Duration::from_secs(10));
        assert_eq!(config.deadline_for(1), Duration::from_secs(1));
        assert_eq!(config.deadline_for(7), Duration::from_secs(7));
        assert_eq!(config.deadline_for(600), Duration::from_secs(10));
    }

    #[test]
    fn test_defaults() {
        let config = SandboxConfig::default();
        assert_eq!(config.max_execution, Duration::from_secs(30));
        assert!(config.python_path.is_none());
        assert_eq!(config.limits, ResourceLimits::default());
    }
}
