use crate::analyzer::{ValidationVerdict, Violation};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How an execution ended
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    RuntimeError,
    Timeout,
    ValidationRejected,
    /// The import hook refused a module the validator let through
    CapabilityDenied,
}

/// Immutable snapshot of a table-shaped value the script left in its namespace
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TableSnapshot {
    /// Variable the value was bound to
    pub name: String,
    pub columns: Vec<String>,
    /// Leading rows, one JSON value per column
    pub rows: Vec<Vec<serde_json::Value>>,
    /// Row count of the full value, before the preview cut
    pub total_rows: usize,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ErrorDetail {
    pub message: String,
    pub violations: Vec<Violation>,
}

/// Everything one execution produced
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    pub status: ExecutionStatus,
    pub stdout: String,
    pub tables: Vec<TableSnapshot>,
    /// PNG-encoded figures
    pub images: Vec<Vec<u8>>,
    pub error: Option<ErrorDetail>,
}

impl ExecutionOutcome {
    pub fn success(stdout: String, tables: Vec<TableSnapshot>, images: Vec<Vec<u8>>) -> Self {
        Self {
            status: ExecutionStatus::Success,
            stdout,
            tables,
            images,
            error: None,
        }
    }

    pub fn rejected(verdict: ValidationVerdict) -> Self {
        let violations = verdict.into_violations();
        let message = std::iter::once("Security validation failed:".to_string())
            .chain(violations.iter().map(|v| {
                format!(
                    "line {}, column {}: {}",
                    v.location.line, v.location.column, v.message
                )
            }))
            .collect::<Vec<_>>()
            .join("\n");
        Self::failed(
            ExecutionStatus::ValidationRejected,
            String::new(),
            ErrorDetail {
                message,
                violations,
            },
        )
    }

    pub fn runtime_error(stdout: String, message: impl Into<String>) -> Self {
        Self::failed(
            ExecutionStatus::RuntimeError,
            stdout,
            ErrorDetail {
                message: message.into(),
                violations: Vec::new(),
            },
        )
    }

    pub fn capability_denied(stdout: String, message: impl Into<String>) -> Self {
        Self::failed(
            ExecutionStatus::CapabilityDenied,
            stdout,
            ErrorDetail {
                message: message.into(),
                violations: Vec::new(),
            },
        )
    }

    pub fn timeout(deadline: Duration) -> Self {
        Self::failed(
            ExecutionStatus::Timeout,
            String::new(),
            ErrorDetail {
                message: format!(
                    "Execution timeout: code took longer than {} seconds",
                    deadline.as_secs_f64()
                ),
                violations: Vec::new(),
            },
        )
    }

    fn failed(status: ExecutionStatus, stdout: String, error: ErrorDetail) -> Self {
        Self {
            status,
            stdout,
            tables: Vec::new(),
            images: Vec::new(),
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::validate;

    #[test]
    fn test_rejected_lists_every_violation() {
        let outcome = ExecutionOutcome::rejected(validate("import os\neval('1')"));
        assert_eq!(outcome.status, ExecutionStatus::ValidationRejected);

        let error = outcome.error.unwrap();
        assert_eq!(error.violations.len(), 2);
        assert!(error.message.starts_with("Security validation failed:"));
        assert!(error.message.contains("line 1, column 8"));
        assert!(error.message.contains("line 2, column 1"));
    }

    #[test]
    fn test_timeout_message_names_deadline() {
        let outcome = ExecutionOutcome::timeout(Duration::from_secs(3));
        assert!(!outcome.is_success());
        assert!(outcome.error.unwrap().message.contains("3 seconds"));
    }
}
