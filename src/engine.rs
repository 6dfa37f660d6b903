use crate::analyzer::ValidatedScript;
use crate::namespace::CapabilityNamespace;
use crate::outcome::ExecutionOutcome;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Capabilities of a script execution engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineCapabilities {
    /// Engine name
    pub name: String,
    /// Interpreter the engine drives
    pub interpreter: Option<String>,
    /// Libraries scripts may import
    pub libraries: Vec<String>,
    /// Maximum address space in MB
    pub max_memory_mb: usize,
    /// Whether the worker runs in a separate process
    pub process_isolation: bool,
}

/// Trait for script execution engines.
///
/// Engines never re-validate: a [`ValidatedScript`] can only come from a
/// passing validation. Script-level failures are reported in the outcome, so
/// `execute` has no error path.
#[async_trait]
pub trait ScriptEngine: Send + Sync {
    /// Run `script` against `namespace`, giving up after `deadline`.
    ///
    /// The namespace is consumed and released before the outcome is returned.
    async fn execute(
        &self,
        script: &ValidatedScript,
        namespace: CapabilityNamespace,
        deadline: Duration,
    ) -> ExecutionOutcome;

    /// Get engine capabilities
    fn capabilities(&self) -> EngineCapabilities;
}
