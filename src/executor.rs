//! Execution Supervisor
//!
//! Runs a validated script in a Python worker process. The worker executes a
//! fixed harness that materializes the [`CapabilityNamespace`], runs the
//! script with output redirected to memory, snapshots tables and figures, and
//! prints one marker-delimited JSON payload. The supervisor enforces the
//! deadline by killing the worker's process group.

use crate::{
    analyzer::ValidatedScript,
    catalog,
    config::{ResourceLimits, SandboxConfig},
    engine::{EngineCapabilities, ScriptEngine},
    errors::{Result, SandboxError},
    namespace::{CapabilityNamespace, NamespaceSpec},
    outcome::{ExecutionOutcome, TableSnapshot},
};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as b64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const PAYLOAD_START: &str = "@@SANDBOX_PAYLOAD_START@@";
const PAYLOAD_END: &str = "@@SANDBOX_PAYLOAD_END@@";

/// Worker-side program. Reads `{code, namespace}` as JSON on stdin.
const HARNESS: &str = r#"
def _main():
    # Everything lives in this frame so the module globals hold nothing but _main
    import base64
    import builtins
    import importlib
    import io
    import json
    import math
    import sys
    import traceback
    import types
    from contextlib import redirect_stderr, redirect_stdout

    payload_start = "@@SANDBOX_PAYLOAD_START@@"
    payload_end = "@@SANDBOX_PAYLOAD_END@@"
    user_file = "<user_code>"

    request = json.loads(sys.stdin.read())
    wire = request["namespace"]
    resolutions = wire["resolutions"]
    library_roots = {library["module"].split(".")[0] for library in wire["libraries"]}

    # Preload whitelisted libraries; a missing library is recorded, not fatal
    modules = {}
    unavailable = {}
    for library in wire["libraries"]:
        name = library["module"]
        try:
            if name.split(".")[0] == "matplotlib":
                import matplotlib
                matplotlib.use("Agg")
            modules[name] = importlib.import_module(name)
        except Exception as exc:
            unavailable[name] = f"{type(exc).__name__}: {exc}"

    pd = modules.get("pandas")
    np = modules.get("numpy")
    plt = modules.get("matplotlib.pyplot")

    if pd is not None:
        for option, value in (
            ("display.max_columns", None),
            ("display.width", 2000),
            ("display.max_colwidth", None),
            ("display.expand_frame_repr", False),
        ):
            try:
                pd.set_option(option, value)
            except Exception:
                pass

    try:
        import socket
    except Exception:
        socket = None
    if socket is not None:
        def blocked(*args, **kwargs):
            raise PermissionError("network access is not available in the sandbox")

        socket.getaddrinfo = blocked
        socket.create_connection = blocked
        socket.socket.connect = blocked
        socket.socket.connect_ex = blocked

    class CapabilityDenied(ImportError):
        pass

    denied = []

    def deny(name, reason):
        denied.append(name)
        raise CapabilityDenied(f"capability denied: module '{name}' {reason}")

    def check_module(name, value):
        # Libraries hold the modules they import themselves as attributes
        if isinstance(value, types.ModuleType):
            if value.__name__.split(".")[0] not in library_roots:
                deny(name, f"reaches module '{value.__name__}'")

    def resolve(name, globals=None, locals=None, fromlist=(), level=0):
        if level:
            deny("." * level + (name or ""), "is a relative import")
        entry = resolutions.get(name)
        if entry is None:
            deny(name, "cannot be resolved in the sandbox")
        library = entry["library"]
        if library not in modules:
            raise ModuleNotFoundError(f"module '{library}' is not installed on the sandbox host")
        target = modules[library]
        walked = library
        for part in entry["attribute_path"]:
            walked = walked + "." + part
            try:
                target = getattr(target, part)
            except AttributeError:
                deny(name, "cannot be resolved in the sandbox")
            check_module(walked, target)
        if not fromlist:
            return modules.get(name.split(".")[0], target)
        for item in fromlist:
            if item == "*":
                deny(name + ".*", "is a wildcard import")
            check_module(name + "." + item, getattr(target, item, None))
        return target

    safe_builtins = {
        name: getattr(builtins, name)
        for name in wire["builtins"]
        if hasattr(builtins, name)
    }
    safe_builtins["__import__"] = resolve

    namespace = {"__builtins__": safe_builtins, "__name__": "sandbox"}
    for library in wire["libraries"]:
        module = modules.get(library["module"])
        if module is not None:
            for alias in library["aliases"]:
                namespace[alias] = module
    if wire["dataset_path"] is not None:
        namespace[wire["dataset_binding"]] = wire["dataset_path"]
    reserved = set(namespace)

    def sanitize(exc):
        frames = [
            frame
            for frame in traceback.extract_tb(exc.__traceback__)
            if frame.filename == user_file
        ]
        head = "".join(traceback.format_exception_only(type(exc), exc)).strip()
        if not frames:
            return head
        lines = [f"  line {frame.lineno}, in {frame.name}" for frame in frames]
        return "Traceback (most recent call last):\n" + "\n".join(lines) + "\n" + head

    stdout = io.StringIO()
    stderr = io.StringIO()
    error = None

    try:
        code = compile(request["code"], user_file, "exec")
    except SyntaxError as exc:
        error = {"kind": "runtime", "message": sanitize(exc)}
    else:
        try:
            with redirect_stdout(stdout), redirect_stderr(stderr):
                exec(code, namespace)
        except CapabilityDenied as exc:
            error = {"kind": "capability_denied", "message": str(exc)}
        except BaseException as exc:
            error = {"kind": "runtime", "message": sanitize(exc)}

    def cell(value):
        if value is None or isinstance(value, (bool, int, str)):
            return value
        if isinstance(value, float):
            return value if math.isfinite(value) else None
        if np is not None and isinstance(value, np.generic):
            return cell(value.item())
        if pd is not None:
            try:
                if pd.isna(value):
                    return None
            except (TypeError, ValueError):
                pass
        isoformat = getattr(value, "isoformat", None)
        if callable(isoformat):
            return isoformat()
        return str(value)

    tables = []
    images = []
    if error is None and not denied:
        if pd is not None:
            for name, value in list(namespace.items()):
                if name in reserved or not isinstance(value, pd.DataFrame):
                    continue
                try:
                    preview = value.head(wire["max_table_rows"])
                    tables.append({
                        "name": name,
                        "columns": [str(column) for column in preview.columns],
                        "rows": [
                            [cell(item) for item in row]
                            for row in preview.itertuples(index=False, name=None)
                        ],
                        "total_rows": int(len(value)),
                    })
                except Exception as exc:
                    print(f"table capture failed for {name}: {exc}", file=stderr)
        if plt is not None:
            for number in plt.get_fignums():
                buffer = io.BytesIO()
                try:
                    plt.figure(number).savefig(buffer, format="png", bbox_inches="tight", dpi=100)
                    images.append(base64.b64encode(buffer.getvalue()).decode("ascii"))
                except Exception as exc:
                    print(f"figure capture failed for {number}: {exc}", file=stderr)
    if plt is not None:
        plt.close("all")

    text = stdout.getvalue()
    limit = wire["max_output_bytes"]
    encoded = text.encode("utf-8")
    if len(encoded) > limit:
        text = encoded[:limit].decode("utf-8", "ignore") + f"\n[output truncated at {limit} bytes]\n"

    payload = {
        "stdout": text,
        "stderr": stderr.getvalue()[-4096:],
        "tables": tables,
        "images": images,
        "error": error,
        "denied": denied,
        "unavailable": unavailable,
    }
    try:
        serialized = json.dumps(payload, allow_nan=False)
    except (TypeError, ValueError) as exc:
        payload["tables"] = []
        payload["error"] = payload["error"] or {
            "kind": "runtime",
            "message": f"captured values could not be serialized: {exc}",
        }
        serialized = json.dumps(payload, allow_nan=False, default=str)

    # Script output may contain the markers; '@' never appears unescaped in the body
    serialized = serialized.replace("@", "\\u0040")
    sys.__stdout__.write("\n" + payload_start + "\n" + serialized + "\n" + payload_end + "\n")
    sys.__stdout__.flush()


_main()
"#;

#[derive(Debug, Serialize)]
struct HarnessRequest<'a> {
    code: &'a str,
    namespace: NamespaceSpec<'a>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum HarnessErrorKind {
    Runtime,
    CapabilityDenied,
}

#[derive(Debug, Deserialize)]
struct HarnessError {
    kind: HarnessErrorKind,
    message: String,
}

#[derive(Debug, Deserialize)]
struct HarnessPayload {
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
    #[serde(default)]
    tables: Vec<TableSnapshot>,
    #[serde(default)]
    images: Vec<String>,
    #[serde(default)]
    error: Option<HarnessError>,
    #[serde(default)]
    denied: Vec<String>,
    #[serde(default)]
    unavailable: BTreeMap<String, String>,
}

/// Python engine running each script in its own worker process
pub struct PythonProcessEngine {
    python_path: PathBuf,
    limits: ResourceLimits,
}

impl PythonProcessEngine {
    /// Create a new engine (finds Python in PATH)
    pub fn new() -> Result<Self> {
        let python_path = which::which("python3")
            .or_else(|_| which::which("python"))
            .map_err(|_| SandboxError::PythonNotFound)?;

        Ok(Self {
            python_path,
            limits: ResourceLimits::default(),
        })
    }

    /// Create with explicit Python path (for bundled Python)
    pub fn with_python_path(python_path: PathBuf) -> Result<Self> {
        if !python_path.exists() {
            return Err(SandboxError::PythonNotFound);
        }

        Ok(Self {
            python_path,
            limits: ResourceLimits::default(),
        })
    }

    pub fn from_config(config: &SandboxConfig) -> Result<Self> {
        let mut engine = match &config.python_path {
            Some(path) => Self::with_python_path(path.clone())?,
            None => Self::new()?,
        };
        engine.limits = config.limits.clone();
        Ok(engine)
    }

    /// Get the Python executable path being used
    pub fn python_path(&self) -> &Path {
        &self.python_path
    }

    fn build_command(&self, namespace: &CapabilityNamespace, deadline: Duration) -> Command {
        let workspace = namespace.workspace();
        let threads = self.limits.max_threads.to_string();

        let mut cmd = Command::new(&self.python_path);
        cmd.arg("-B")
            .arg("-c")
            .arg(HARNESS)
            .current_dir(workspace.path())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .env("PYTHONIOENCODING", "utf-8")
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .env("MPLBACKEND", "Agg")
            .env("MPLCONFIGDIR", workspace.config_dir())
            .env("OMP_NUM_THREADS", &threads)
            .env("OPENBLAS_NUM_THREADS", &threads)
            .env("MKL_NUM_THREADS", &threads);

        self.apply_resource_limits(&mut cmd, deadline);
        cmd
    }

    /// Apply resource limits to the command
    #[cfg(unix)]
    fn apply_resource_limits(&self, cmd: &mut Command, deadline: Duration) {
        // CPU backstop in case the watchdog itself is starved
        let cpu_seconds = deadline.as_secs() + 1;
        #[cfg(not(target_os = "macos"))]
        let memory_bytes = self.limits.memory_mb * 1024 * 1024;

        unsafe {
            cmd.pre_exec(move || {
                // Own process group so the watchdog can kill the whole tree
                libc::setpgid(0, 0);

                // macOS doesn't support RLIMIT_AS properly, skip it
                #[cfg(not(target_os = "macos"))]
                {
                    if memory_bytes > 0 {
                        let rlimit = libc::rlimit {
                            rlim_cur: memory_bytes as libc::rlim_t,
                            rlim_max: memory_bytes as libc::rlim_t,
                        };
                        if libc::setrlimit(libc::RLIMIT_AS, &rlimit) != 0 {
                            return Err(std::io::Error::last_os_error());
                        }
                    }
                }

                let rlimit = libc::rlimit {
                    rlim_cur: cpu_seconds as libc::rlim_t,
                    rlim_max: cpu_seconds as libc::rlim_t,
                };
                if libc::setrlimit(libc::RLIMIT_CPU, &rlimit) != 0 {
                    return Err(std::io::Error::last_os_error());
                }

                Ok(())
            });
        }
    }

    #[cfg(not(unix))]
    fn apply_resource_limits(&self, _cmd: &mut Command, _deadline: Duration) {
        // Only the wall-clock deadline applies here
    }

    async fn run(
        &self,
        script: &ValidatedScript,
        namespace: CapabilityNamespace,
        deadline: Duration,
    ) -> Result<ExecutionOutcome> {
        let request = serde_json::to_vec(&HarnessRequest {
            code: script.source(),
            namespace: namespace.harness_spec(script),
        })?;

        let mut cmd = self.build_command(&namespace, deadline);
        let started = Instant::now();
        let mut child = cmd.spawn()?;
        let pid = child.id();
        debug!("[SANDBOX] Spawned worker {:?}", pid);

        let (Some(mut stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(SandboxError::InternalError(
                "worker stdio was not captured".to_string(),
            ));
        };
        let stdout_task = tokio::spawn(read_all(stdout));
        let stderr_task = tokio::spawn(read_all(stderr));

        let child_ref = &mut child;
        let run = async move {
            if let Err(e) = stdin.write_all(&request).await {
                warn!("[SANDBOX] Failed to send script to worker: {}", e);
            }
            drop(stdin);
            child_ref.wait().await
        };
        let waited = tokio::time::timeout(deadline, run).await;

        let status = match waited {
            Ok(status) => status?,
            Err(_) => {
                terminate(&mut child, pid).await;
                stdout_task.abort();
                stderr_task.abort();
                info!(
                    "[SANDBOX] Worker {:?} exceeded deadline of {:?}, killed",
                    pid, deadline
                );
                return Ok(ExecutionOutcome::timeout(deadline));
            }
        };

        let stdout = join_output(stdout_task).await?;
        let stderr = join_output(stderr_task).await?;
        info!(
            "[SANDBOX] Worker {:?} finished in {:?} ({})",
            pid,
            started.elapsed(),
            status
        );

        // Workspace and staged dataset go away before the outcome is handed back
        drop(namespace);

        match extract_payload(&stdout) {
            Ok(payload) => outcome_from_payload(payload),
            Err(e) => {
                warn!("[SANDBOX] No payload from worker ({}); stderr: {}", e, tail(&stderr));
                if stderr.contains("MemoryError") {
                    return Ok(ExecutionOutcome::runtime_error(
                        String::new(),
                        "MemoryError: memory limit exceeded",
                    ));
                }
                Ok(ExecutionOutcome::runtime_error(
                    String::new(),
                    format!("sandbox worker ended without a result ({})", status),
                ))
            }
        }
    }
}

#[async_trait]
impl ScriptEngine for PythonProcessEngine {
    async fn execute(
        &self,
        script: &ValidatedScript,
        namespace: CapabilityNamespace,
        deadline: Duration,
    ) -> ExecutionOutcome {
        match self.run(script, namespace, deadline).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("[SANDBOX] Worker failure: {}", e);
                ExecutionOutcome::runtime_error(String::new(), format!("sandbox worker failed: {}", e))
            }
        }
    }

    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities {
            name: "Python worker process".to_string(),
            interpreter: Some(self.python_path.display().to_string()),
            libraries: catalog::WHITELISTED_MODULES
                .iter()
                .map(|entry| entry.module.to_string())
                .collect(),
            max_memory_mb: self.limits.memory_mb,
            process_isolation: true,
        }
    }
}

async fn read_all<R: AsyncRead + Unpin>(mut reader: R) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).await?;
    Ok(buf)
}

async fn join_output(task: JoinHandle<std::io::Result<Vec<u8>>>) -> Result<String> {
    let bytes = task
        .await
        .map_err(|e| SandboxError::InternalError(format!("output reader failed: {}", e)))??;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Kill the worker's process group, then reap the worker itself
async fn terminate(child: &mut Child, pid: Option<u32>) {
    #[cfg(unix)]
    {
        if let Some(pid) = pid {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;
            if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                debug!("[SANDBOX] killpg({}) failed: {}", pid, e);
            }
        }
    }
    #[cfg(not(unix))]
    let _ = pid;

    if let Err(e) = child.kill().await {
        debug!("[SANDBOX] kill after timeout failed: {}", e);
    }
}

fn tail(text: &str) -> &str {
    const MAX: usize = 2048;
    if text.len() <= MAX {
        return text;
    }
    let mut start = text.len() - MAX;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

fn extract_payload(stdout: &str) -> Result<HarnessPayload> {
    let start = stdout
        .rfind(PAYLOAD_START)
        .ok_or_else(|| SandboxError::Protocol("payload start marker missing".to_string()))?;
    let body = &stdout[start + PAYLOAD_START.len()..];
    let end = body
        .find(PAYLOAD_END)
        .ok_or_else(|| SandboxError::Protocol("payload end marker missing".to_string()))?;
    Ok(serde_json::from_str(body[..end].trim())?)
}

fn outcome_from_payload(payload: HarnessPayload) -> Result<ExecutionOutcome> {
    if !payload.unavailable.is_empty() {
        debug!("[SANDBOX] Libraries unavailable in worker: {:?}", payload.unavailable);
    }
    if !payload.stderr.is_empty() {
        debug!("[SANDBOX] Script stderr: {}", tail(&payload.stderr));
    }

    if !payload.denied.is_empty() {
        error!(
            modules = ?payload.denied,
            "[SANDBOX] Import hook denied modules that passed static validation; the validator has a gap"
        );
        let message = match payload.error {
            Some(HarnessError {
                kind: HarnessErrorKind::CapabilityDenied,
                message,
            }) => message,
            _ => format!(
                "capability denied: module(s) {} cannot be resolved in the sandbox",
                payload.denied.join(", ")
            ),
        };
        return Ok(ExecutionOutcome::capability_denied(payload.stdout, message));
    }

    match payload.error {
        Some(HarnessError { kind, message }) => {
            // capability_denied without a recorded denial would be a harness bug
            if matches!(kind, HarnessErrorKind::CapabilityDenied) {
                warn!("[SANDBOX] Capability error reported without a denied module");
            }
            Ok(ExecutionOutcome::runtime_error(payload.stdout, message))
        }
        None => {
            let images = payload
                .images
                .iter()
                .map(|encoded| b64.decode(encoded))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| SandboxError::Protocol(format!("invalid image encoding: {}", e)))?;
            Ok(ExecutionOutcome::success(payload.stdout, payload.tables, images))
        }
    }
}
