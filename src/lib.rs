//! Validated, deadline-bounded execution of AI-generated Python analysis
//! scripts.
//!
//! A script goes through four stages: static validation against the
//! violation catalog, construction of a fresh capability namespace, execution
//! in a worker process under a deadline, and assembly of a response envelope.
//!
//! ```no_run
//! use analyst_sandbox::{Sandbox, SandboxConfig};
//! use std::path::Path;
//!
//! # async fn demo() -> analyst_sandbox::Result<()> {
//! let sandbox = Sandbox::new(SandboxConfig::from_env())?;
//! let envelope = sandbox
//!     .run_sandboxed(
//!         "df = pd.read_csv(file_path)\nprint(df.describe())",
//!         Some(Path::new("orders.csv")),
//!         10,
//!     )
//!     .await;
//! println!("{}", envelope.summary());
//! # Ok(())
//! # }
//! ```

pub mod analyzer;
pub mod catalog;
pub mod config;
pub mod engine;
pub mod envelope;
pub mod errors;
pub mod executor;
pub mod namespace;
pub mod outcome;
pub mod workspace;

pub use analyzer::{check, validate, Location, ValidatedScript, ValidationVerdict, Violation};
pub use config::{ResourceLimits, SandboxConfig};
pub use engine::{EngineCapabilities, ScriptEngine};
pub use envelope::{assemble, EnvelopeError, ErrorKind, ResponseEnvelope};
pub use errors::{Result, SandboxError};
pub use executor::PythonProcessEngine;
pub use namespace::{CapabilityNamespace, NamespaceBuilder};
pub use outcome::{ExecutionOutcome, ExecutionStatus, TableSnapshot};

use std::path::Path;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

/// Where a request is in its lifecycle; logged on every transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Received,
    Validating,
    Rejected,
    Ready,
    Executing,
    Completed,
    Failed,
    TimedOut,
    Assembled,
}

/// Entry point tying validation, namespace construction, execution and
/// envelope assembly together
pub struct Sandbox {
    config: SandboxConfig,
    engine: Box<dyn ScriptEngine>,
    namespaces: NamespaceBuilder,
}

impl Sandbox {
    /// Create a sandbox backed by a Python worker process
    pub fn new(config: SandboxConfig) -> Result<Self> {
        let engine = PythonProcessEngine::from_config(&config)?;
        Ok(Self::with_engine(config, Box::new(engine)))
    }

    /// Create a sandbox with a custom engine
    pub fn with_engine(config: SandboxConfig, engine: Box<dyn ScriptEngine>) -> Self {
        let namespaces = NamespaceBuilder::new(&config);
        Self {
            config,
            engine,
            namespaces,
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn capabilities(&self) -> EngineCapabilities {
        self.engine.capabilities()
    }

    /// Validate and run `code` against the dataset at `dataset_path`.
    ///
    /// `timeout_seconds` is clamped to the configured ceiling; zero asks for
    /// the ceiling itself. Rejected scripts never reach the engine. Every
    /// failure is reported inside the envelope.
    pub async fn run_sandboxed(
        &self,
        code: &str,
        dataset_path: Option<&Path>,
        timeout_seconds: u64,
    ) -> ResponseEnvelope {
        let request_id = Uuid::new_v4();
        let span = info_span!("sandbox_run", %request_id);
        self.run_pipeline(code, dataset_path, timeout_seconds)
            .instrument(span)
            .await
    }

    async fn run_pipeline(
        &self,
        code: &str,
        dataset_path: Option<&Path>,
        timeout_seconds: u64,
    ) -> ResponseEnvelope {
        info!(
            stage = ?PipelineStage::Received,
            code_bytes = code.len(),
            dataset = ?dataset_path,
            timeout_seconds
        );

        info!(stage = ?PipelineStage::Validating);
        let script = match analyzer::check(code) {
            Ok(script) => script,
            Err(verdict) => {
                info!(
                    stage = ?PipelineStage::Rejected,
                    violations = verdict.violations().len()
                );
                return finish(ExecutionOutcome::rejected(verdict));
            }
        };
        info!(stage = ?PipelineStage::Ready);

        let namespace = match self.namespaces.build(dataset_path) {
            Ok(namespace) => namespace,
            Err(e) => {
                warn!(stage = ?PipelineStage::Failed, "Could not prepare namespace: {}", e);
                return finish(ExecutionOutcome::runtime_error(
                    String::new(),
                    format!("could not prepare the sandbox: {}", e),
                ));
            }
        };

        let deadline = self.config.deadline_for(timeout_seconds);
        info!(stage = ?PipelineStage::Executing, ?deadline);
        let outcome = self.engine.execute(&script, namespace, deadline).await;

        let stage = match outcome.status {
            ExecutionStatus::Success => PipelineStage::Completed,
            ExecutionStatus::Timeout => PipelineStage::TimedOut,
            _ => PipelineStage::Failed,
        };
        info!(stage = ?stage, status = ?outcome.status);
        finish(outcome)
    }
}

fn finish(outcome: ExecutionOutcome) -> ResponseEnvelope {
    let envelope = envelope::assemble(outcome);
    info!(stage = ?PipelineStage::Assembled, ok = envelope.ok);
    envelope
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    struct CountingEngine {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ScriptEngine for CountingEngine {
        async fn execute(
            &self,
            script: &ValidatedScript,
            namespace: CapabilityNamespace,
            deadline: Duration,
        ) -> ExecutionOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert!(namespace.workspace().path().exists());
            ExecutionOutcome::success(
                format!("{} bytes within {:?}\n", script.source().len(), deadline),
                Vec::new(),
                Vec::new(),
            )
        }

        fn capabilities(&self) -> EngineCapabilities {
            EngineCapabilities {
                name: "counting".to_string(),
                interpreter: None,
                libraries: Vec::new(),
                max_memory_mb: 0,
                process_isolation: false,
            }
        }
    }

    fn counting_sandbox(base: &Path) -> (Sandbox, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let config = SandboxConfig::default()
            .with_workspace_base(base.to_path_buf())
            .with_max_execution(Duration::from_secs(5));
        let engine = CountingEngine {
            calls: calls.clone(),
        };
        (Sandbox::with_engine(config, Box::new(engine)), calls)
    }

    #[test]
    fn test_rejected_code_never_executes() {
        let base = tempfile::tempdir().unwrap();
        let (sandbox, calls) = counting_sandbox(base.path());

        for code in [
            "import os",
            "open('/etc/passwd').read()",
            "x = ().__class__.__bases__",
            "def broken(:\n    pass",
        ] {
            let envelope = tokio_test::block_on(sandbox.run_sandboxed(code, None, 5));
            assert!(!envelope.ok, "{code}");
            let error = envelope.error.unwrap();
            assert_eq!(error.kind, ErrorKind::ValidationRejected);
            assert!(!error.violations.unwrap().is_empty());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_library_reachable_escapes_never_execute() {
        let base = tempfile::tempdir().unwrap();
        let (sandbox, calls) = counting_sandbox(base.path());

        for code in [
            "def g():\n    yield 1\nx = g()\nf = x.gi_frame.f_back.f_globals",
            "matplotlib.subprocess.run(['id'])",
            "from matplotlib import subprocess as sp\nsp.run(['id'])",
            "import matplotlib.subprocess",
            "label = '{0.__class__}'\nprint(label.format(1))",
            "from pandas import *",
        ] {
            let envelope = tokio_test::block_on(sandbox.run_sandboxed(code, None, 5));
            assert!(!envelope.ok, "{code}");
            let error = envelope.error.unwrap();
            assert_eq!(error.kind, ErrorKind::ValidationRejected, "{code}");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_accepted_code_runs_with_clamped_deadline() {
        let base = tempfile::tempdir().unwrap();
        let (sandbox, calls) = counting_sandbox(base.path());

        let envelope = tokio_test::block_on(sandbox.run_sandboxed("print(1)", None, 600));
        assert!(envelope.ok);
        assert_eq!(envelope.stdout, "8 bytes within 5s\n");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_missing_dataset_is_reported_in_envelope() {
        let base = tempfile::tempdir().unwrap();
        let (sandbox, calls) = counting_sandbox(base.path());

        let envelope = tokio_test::block_on(sandbox.run_sandboxed(
            "print(file_path)",
            Some(Path::new("/no/such/dataset.csv")),
            5,
        ));
        assert!(!envelope.ok);
        assert_eq!(envelope.error.unwrap().kind, ErrorKind::RuntimeError);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    // Tests below need a python3 on PATH and skip quietly otherwise

    fn python_sandbox(base: &Path) -> Option<Sandbox> {
        let config = SandboxConfig::default().with_workspace_base(base.to_path_buf());
        match Sandbox::new(config) {
            Ok(sandbox) => Some(sandbox),
            Err(e) => {
                eprintln!("skipping: {}", e);
                None
            }
        }
    }

    fn has_python_modules(modules: &str) -> bool {
        let Ok(python) = which::which("python3") else {
            return false;
        };
        std::process::Command::new(python)
            .arg("-c")
            .arg(format!("import {}", modules))
            .output()
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn test_print_round_trip() {
        let base = tempfile::tempdir().unwrap();
        let Some(sandbox) = python_sandbox(base.path()) else {
            return;
        };

        let envelope = sandbox.run_sandboxed("print(\"hi\")", None, 0).await;
        assert!(envelope.ok, "{:?}", envelope.error);
        assert_eq!(envelope.stdout, "hi\n");
        assert!(envelope.tables.is_empty());
        assert!(envelope.images.is_empty());
    }

    #[tokio::test]
    async fn test_printed_payload_markers_reach_stdout() {
        let base = tempfile::tempdir().unwrap();
        let Some(sandbox) = python_sandbox(base.path()) else {
            return;
        };

        let code = "print('@@SANDBOX_PAYLOAD_END@@')\nprint('@@SANDBOX_PAYLOAD_START@@')";
        let envelope = sandbox.run_sandboxed(code, None, 0).await;
        assert!(envelope.ok, "{:?}", envelope.error);
        assert_eq!(
            envelope.stdout,
            "@@SANDBOX_PAYLOAD_END@@\n@@SANDBOX_PAYLOAD_START@@\n"
        );
    }

    #[tokio::test]
    async fn test_infinite_loop_times_out() {
        let base = tempfile::tempdir().unwrap();
        let Some(sandbox) = python_sandbox(base.path()) else {
            return;
        };

        let started = Instant::now();
        let envelope = sandbox.run_sandboxed("while True:\n    pass", None, 1).await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!envelope.ok);
        let error = envelope.error.unwrap();
        assert_eq!(error.kind, ErrorKind::Timeout);
        assert!(error.message.contains("1 seconds"));
    }

    #[tokio::test]
    async fn test_runtime_error_hides_harness_frames() {
        let base = tempfile::tempdir().unwrap();
        let Some(sandbox) = python_sandbox(base.path()) else {
            return;
        };

        let envelope = sandbox
            .run_sandboxed("print('before')\nx = 1 + 'a'", None, 0)
            .await;
        assert!(!envelope.ok);
        assert_eq!(envelope.stdout, "before\n");
        let error = envelope.error.unwrap();
        assert_eq!(error.kind, ErrorKind::RuntimeError);
        assert!(error.message.contains("TypeError"));
        assert!(error.message.contains("line 2"));
        assert!(!error.message.contains("<string>"));
    }

    #[tokio::test]
    async fn test_blocked_builtin_is_absent_at_runtime() {
        let base = tempfile::tempdir().unwrap();
        let Some(sandbox) = python_sandbox(base.path()) else {
            return;
        };

        // Passes validation; the reduced builtins still lack it
        let envelope = sandbox.run_sandboxed("hash('x')", None, 0).await;
        assert!(!envelope.ok);
        assert!(envelope.error.unwrap().message.contains("NameError"));
    }

    #[tokio::test]
    async fn test_no_state_leaks_between_runs() {
        let base = tempfile::tempdir().unwrap();
        let Some(sandbox) = python_sandbox(base.path()) else {
            return;
        };

        let first = sandbox.run_sandboxed("leaked = 41", None, 0).await;
        assert!(first.ok, "{:?}", first.error);

        let second = sandbox.run_sandboxed("print(leaked + 1)", None, 0).await;
        assert!(!second.ok);
        assert!(second.error.unwrap().message.contains("NameError"));
    }

    #[tokio::test]
    async fn test_pandas_reads_dataset_and_captures_table() {
        if !has_python_modules("pandas") {
            eprintln!("skipping: pandas not installed");
            return;
        }
        let base = tempfile::tempdir().unwrap();
        let Some(sandbox) = python_sandbox(base.path()) else {
            return;
        };

        let data = tempfile::tempdir().unwrap();
        let csv = data.path().join("sales.csv");
        let mut body = String::from("region,amount\n");
        for i in 0..25 {
            body.push_str(&format!("r{},{}\n", i % 3, i));
        }
        std::fs::write(&csv, body).unwrap();

        let code = "df = pd.read_csv(file_path)\nprint(df['amount'].mean())";
        let envelope = sandbox.run_sandboxed(code, Some(&csv), 0).await;
        assert!(envelope.ok, "{:?}", envelope.error);
        assert_eq!(envelope.stdout.trim(), "12.0");

        let table = &envelope.tables[0];
        assert_eq!(table.name, "df");
        assert_eq!(table.columns, vec!["region", "amount"]);
        assert_eq!(table.rows.len(), 20);
        assert_eq!(table.total_rows, 25);
        assert_eq!(table.rows[1][0], serde_json::json!("r1"));
        assert_eq!(table.rows[1][1], serde_json::json!(1));
    }

    #[tokio::test]
    async fn test_unresolvable_submodule_is_capability_denied() {
        if !has_python_modules("pandas") {
            eprintln!("skipping: pandas not installed");
            return;
        }
        let base = tempfile::tempdir().unwrap();
        let Some(sandbox) = python_sandbox(base.path()) else {
            return;
        };

        let envelope = sandbox
            .run_sandboxed("import pandas.definitely_missing", None, 0)
            .await;
        assert!(!envelope.ok);
        let error = envelope.error.unwrap();
        assert_eq!(error.kind, ErrorKind::CapabilityDenied);
        assert!(error.message.contains("pandas.definitely_missing"));
    }

    #[tokio::test]
    async fn test_figure_is_captured_as_png() {
        if !has_python_modules("matplotlib") {
            eprintln!("skipping: matplotlib not installed");
            return;
        }
        let base = tempfile::tempdir().unwrap();
        let Some(sandbox) = python_sandbox(base.path()) else {
            return;
        };

        let envelope = sandbox
            .run_sandboxed("plt.plot([1, 2, 3], [3, 1, 2])\nplt.title('trend')", None, 0)
            .await;
        assert!(envelope.ok, "{:?}", envelope.error);
        assert_eq!(envelope.images.len(), 1);
        assert_eq!(envelope.images[0][..4], b"\x89PNG"[..]);

        // Figures from one run never show up in the next
        let envelope = sandbox.run_sandboxed("print('next')", None, 0).await;
        assert!(envelope.images.is_empty());
    }
}
