use analyst_sandbox::{catalog, Sandbox, SandboxConfig};
use serde_json::{json, Value};
use std::path::PathBuf;
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader};

#[derive(Debug, Clone)]
struct WorkerConfig {
    python_path_override: Option<PathBuf>,
    workspace_base: Option<PathBuf>,
}

impl WorkerConfig {
    fn from_env_and_args() -> Self {
        let args: Vec<String> = std::env::args().collect();

        let mut python_path_override = std::env::var("SANDBOX_PYTHON_PATH").ok().map(PathBuf::from);
        let mut workspace_base = std::env::var("SANDBOX_WORKSPACE_DIR").ok().map(PathBuf::from);

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--python-path" => {
                    if let Some(v) = args.get(i + 1) {
                        python_path_override = Some(PathBuf::from(v));
                    }
                    i += 2;
                }
                "--workspace-dir" => {
                    if let Some(v) = args.get(i + 1) {
                        workspace_base = Some(PathBuf::from(v));
                    }
                    i += 2;
                }
                _ => i += 1,
            }
        }

        Self {
            python_path_override,
            workspace_base,
        }
    }

    fn sandbox_config(&self) -> SandboxConfig {
        let mut config = SandboxConfig::from_env();
        if let Some(path) = &self.python_path_override {
            config = config.with_python_path(path.clone());
        }
        if let Some(base) = &self.workspace_base {
            config = config.with_workspace_base(base.clone());
        }
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries JSON-RPC; logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "sandbox_worker=info,analyst_sandbox=info".to_string()),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cfg = WorkerConfig::from_env_and_args();
    let sandbox = Sandbox::new(cfg.sandbox_config())?;
    tracing::info!(
        "sandbox-worker starting (python={:?}, max_execution={:?})",
        sandbox.capabilities().interpreter,
        sandbox.config().max_execution
    );

    let stdin = BufReader::new(io::stdin());
    let mut lines = stdin.lines();
    let mut stdout = io::stdout();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let parsed: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("invalid json-rpc line: {} | err={}", line, e);
                continue;
            }
        };

        let response = handle_message(&sandbox, parsed).await;
        if let Some(resp) = response {
            let s = serde_json::to_string(&resp)?;
            stdout.write_all(s.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
        }
    }

    Ok(())
}

async fn handle_message(sandbox: &Sandbox, msg: Value) -> Option<Value> {
    let method = msg.get("method").and_then(|m| m.as_str()).unwrap_or("");
    let id = msg.get("id").cloned();
    let params = msg.get("params").cloned().unwrap_or_else(|| json!({}));

    // Notifications have no id: ignore most, but allow "exit" to terminate.
    if id.is_none() {
        if method == "exit" {
            std::process::exit(0);
        }
        return None;
    }

    let result = match method {
        "initialize" => Ok(json!({
            "protocolVersion": "2025-06-18",
            "serverInfo": {
                "name": "Analyst Sandbox Worker",
                "version": env!("CARGO_PKG_VERSION")
            },
            "capabilities": {
                "tools": { "listChanged": false }
            }
        })),
        "tools/list" => Ok(json!({ "tools": tools_list(sandbox) })),
        "tools/call" => call_tool(sandbox, &params).await,
        "shutdown" => {
            std::process::exit(0);
        }
        _ => Err(json!({
            "code": -32601,
            "message": format!("Method not found: {}", method)
        })),
    };

    Some(match result {
        Ok(v) => json!({ "jsonrpc": "2.0", "result": v, "id": id }),
        Err(err_obj) => json!({ "jsonrpc": "2.0", "error": err_obj, "id": id }),
    })
}

fn tools_list(sandbox: &Sandbox) -> Vec<Value> {
    let aliases: Vec<String> = catalog::WHITELISTED_MODULES
        .iter()
        .map(|m| format!("{} ({})", m.module, m.aliases.join(", ")))
        .collect();

    vec![
        json!({
            "name": "sandbox.health",
            "description": "Health check for the sandbox worker.",
            "inputSchema": {
                "type": "object",
                "properties": {},
                "additionalProperties": false
            }
        }),
        json!({
            "name": "execute_python_code",
            "description": format!(
                "Run a Python analysis script against a dataset. Preloaded: {}. \
                 The dataset path is bound to `file_path`. Print results; \
                 DataFrames left in variables and open matplotlib figures are returned.",
                aliases.join("; ")
            ),
            "inputSchema": {
                "type": "object",
                "properties": {
                    "code": { "type": "string", "description": "Python code to execute." },
                    "file_path": { "type": "string", "description": "Dataset to expose to the script as `file_path`." },
                    "timeout_seconds": {
                        "type": "integer",
                        "minimum": 0,
                        "maximum": sandbox.config().max_execution.as_secs(),
                        "description": "Wall-clock timeout for the run; 0 uses the maximum."
                    }
                },
                "required": ["code"],
                "additionalProperties": false
            }
        }),
    ]
}

async fn call_tool(sandbox: &Sandbox, params: &Value) -> std::result::Result<Value, Value> {
    let name = params.get("name").and_then(|v| v.as_str()).unwrap_or("");
    let args = params
        .get("arguments")
        .cloned()
        .unwrap_or_else(|| json!({}));

    match normalize_tool_name(name).as_str() {
        "sandbox_health" => Ok(json!({
            "content": [{ "type": "text", "text": "ok" }],
            "structuredContent": {
                "ok": true,
                "worker": "sandbox-worker",
                "version": env!("CARGO_PKG_VERSION"),
                "engine": sandbox.capabilities(),
            },
            "isError": false
        })),
        "execute_python_code" => execute_python_code(sandbox, &args).await,
        other => Ok(json!({
            "content": [{ "type": "text", "text": format!("Unknown tool: {}", other) }],
            "isError": true
        })),
    }
}

fn normalize_tool_name(name: &str) -> String {
    name.replace('.', "_").replace('/', "_")
}

async fn execute_python_code(
    sandbox: &Sandbox,
    args: &Value,
) -> std::result::Result<Value, Value> {
    let code = args
        .get("code")
        .and_then(|v| v.as_str())
        .ok_or_else(|| json!({ "code": -32602, "message": "Missing required argument: code" }))?;
    let file_path = args
        .get("file_path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from);
    let timeout_seconds = args
        .get("timeout_seconds")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);

    let envelope = sandbox
        .run_sandboxed(code, file_path.as_deref(), timeout_seconds)
        .await;
    let structured = serde_json::to_value(&envelope)
        .map_err(|e| json!({ "code": -32603, "message": e.to_string() }))?;

    Ok(json!({
        "content": [{ "type": "text", "text": envelope.summary() }],
        "structuredContent": structured,
        "isError": !envelope.ok
    }))
}
