//! Backend C — Gemini CLI child-process normalizer.
//!
//! Spawns the gemini binary with `--output-format stream-json --prompt …`,
//! consumes NDJSON from stdout through [`LineFramer`], and maps process exit
//! codes to terminal statuses when the CLI never emitted its own `result`.
//! Capability policies translate to tool allow/deny sets; deny entries are
//! materialized as a temporary settings override passed via
//! [`SETTINGS_ENV`].

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;

use harness_events::{
    new_session_id, AgentEvent, DonePayload, ErrorPayload, EventPayload, InitPayload, LineFramer,
    SessionStatus, TextPayload, ToolOutcome, ToolResultPayload, ToolUsePayload,
};
use serde_json::{json, Map, Value};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};

use crate::adapter::{binary_available, production_channel, Adapter, AdapterStream};
use crate::backends::wire::{extract_str, extract_str_from_keys, map_stop_reason, usage_from_value};
use crate::error::AdapterError;
use crate::options::{CapabilityDecision, CapabilityPolicy, RunOptions};
use crate::process;

pub const BACKEND_ID: &str = "gemini";
/// Recoverable; emitted for each malformed NDJSON line.
pub const CODE_NDJSON_PARSE_ERROR: &str = "NDJSON_PARSE_ERROR";
/// Emitted when reading stdout fails mid-stream.
pub const CODE_GEMINI_STREAM_ERROR: &str = "GEMINI_STREAM_ERROR";
/// Environment variable carrying the path of the settings override file.
pub const SETTINGS_ENV: &str = "GEMINI_CLI_SETTINGS_PATH";

// ─── Capability → tool-name translation ───────────────────────────────────

const FILE_WRITE_TOOLS: &[&str] = &["edit"];
const SHELL_TOOLS: &[&str] = &["ShellTool"];
const NETWORK_TOOLS: &[&str] = &["webfetch"];

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ToolSets {
    pub allow: Vec<String>,
    pub deny: Vec<String>,
}

/// Computes the allow/deny tool sets for a policy plus user-provided lists.
/// Deny overrides allow; both sets are deduplicated preserving order.
pub fn tool_sets(
    policy: &CapabilityPolicy,
    user_allowed: &[String],
    user_disallowed: &[String],
) -> ToolSets {
    let mut allow: Vec<String> = Vec::new();
    let mut deny: Vec<String> = Vec::new();

    for (tools, decision) in [
        (FILE_WRITE_TOOLS, policy.file_write),
        (SHELL_TOOLS, policy.shell_execute),
        (NETWORK_TOOLS, policy.network_access),
    ] {
        match decision {
            CapabilityDecision::Allow => allow.extend(tools.iter().map(|t| (*t).to_string())),
            CapabilityDecision::Deny => deny.extend(tools.iter().map(|t| (*t).to_string())),
            CapabilityDecision::Ask => {}
        }
    }

    allow.extend(user_allowed.iter().cloned());
    deny.extend(user_disallowed.iter().cloned());

    dedupe(&mut deny);
    allow.retain(|tool| !deny.contains(tool));
    dedupe(&mut allow);

    ToolSets { allow, deny }
}

fn dedupe(list: &mut Vec<String>) {
    let mut seen = std::collections::HashSet::new();
    list.retain(|item| seen.insert(item.clone()));
}

/// Exit-code contract of the CLI: 0 success, 53 max-turns, 1/42/other error.
/// A tripped token or a signal death (no exit code) reads as interrupted.
pub fn status_for_exit(code: Option<i32>, interrupted: bool) -> SessionStatus {
    if interrupted {
        return SessionStatus::Interrupted;
    }
    match code {
        Some(0) => SessionStatus::Success,
        Some(53) => SessionStatus::MaxTurns,
        Some(1) => SessionStatus::Error,
        // Documented as "input error" upstream; terminal status is error.
        Some(42) => SessionStatus::Error,
        Some(_) => SessionStatus::Error,
        None => SessionStatus::Interrupted,
    }
}

// ─── Adapter ──────────────────────────────────────────────────────────────

pub struct GeminiAdapter {
    binary: PathBuf,
}

impl Default for GeminiAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl GeminiAdapter {
    pub fn new() -> Self {
        Self {
            binary: PathBuf::from("gemini"),
        }
    }

    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Adapter for GeminiAdapter {
    fn id(&self) -> &str {
        BACKEND_ID
    }

    fn available(&self) -> bool {
        binary_available(&self.binary)
    }

    fn run(&self, prompt: &str, options: &RunOptions) -> AdapterStream {
        let (tx, stream) = production_channel();
        let binary = self.binary.clone();
        let prompt = prompt.to_string();
        let options = options.clone();
        tokio::spawn(async move {
            run_cli(binary, prompt, options, tx).await;
        });
        stream
    }
}

fn build_command(
    binary: &Path,
    prompt: &str,
    options: &RunOptions,
    tools: &ToolSets,
    settings_path: Option<&Path>,
) -> Command {
    let mut cmd = Command::new(binary);
    cmd.arg("--output-format")
        .arg("stream-json")
        .arg("--prompt")
        .arg(prompt);

    if let Some(model) = &options.model {
        cmd.arg("--model").arg(model);
    }
    if let Some(max_turns) = options.max_turns {
        cmd.arg("--max-session-turns").arg(max_turns.to_string());
    }
    if !tools.allow.is_empty() {
        cmd.arg("--allowed-tools").arg(tools.allow.join(","));
    }
    if let Some(path) = settings_path {
        cmd.env(SETTINGS_ENV, path);
    }
    if let Some(cwd) = &options.cwd {
        cmd.current_dir(cwd);
    }

    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    cmd
}

async fn write_settings(tools: &ToolSets) -> Result<Option<tempfile::TempDir>, std::io::Error> {
    if tools.deny.is_empty() {
        return Ok(None);
    }
    let dir = tempfile::TempDir::new()?;
    let settings = json!({
        "tools": {
            "core": tools.allow,
            "exclude": tools.deny,
        }
    });
    tokio::fs::write(dir.path().join("settings.json"), settings.to_string()).await?;
    Ok(Some(dir))
}

async fn run_cli(
    binary: PathBuf,
    prompt: String,
    options: RunOptions,
    tx: tokio::sync::mpsc::Sender<Result<AgentEvent, AdapterError>>,
) {
    let cancel = options.cancel.clone();
    let started = Instant::now();
    let mut translator = GeminiTranslator::new(new_session_id());

    let tools = tool_sets(
        &options.permissions,
        &options.allowed_tools,
        &options.disallowed_tools,
    );

    // The settings override lives until this task returns; dropping the
    // TempDir deletes it on every exit path.
    let settings_dir = match write_settings(&tools).await {
        Ok(dir) => dir,
        Err(err) => {
            let _ = tx.send(Err(AdapterError::Io(err))).await;
            return;
        }
    };
    let settings_path = settings_dir.as_ref().map(|d| d.path().join("settings.json"));

    let mut cmd = build_command(&binary, &prompt, &options, &tools, settings_path.as_deref());
    let mut child: Child = match cmd.spawn() {
        Ok(child) => child,
        Err(source) => {
            let _ = tx.send(Err(AdapterError::Spawn { binary, source })).await;
            return;
        }
    };
    tracing::debug!(binary = %binary.display(), "spawned gemini subprocess");

    let Some(mut stdout) = child.stdout.take() else {
        let _ = tx
            .send(Err(AdapterError::Message("stdout not captured".into())))
            .await;
        return;
    };

    let mut framer = LineFramer::new();
    let mut buf = [0u8; 4096];
    let mut interrupted = false;
    let mut failed = false;

    'read: loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                interrupted = true;
                process::send_sigterm(&mut child);
                break 'read;
            }
            read = stdout.read(&mut buf) => match read {
                Ok(0) => {
                    if !translator.finished() {
                        if let Some(framed) = framer.finish() {
                            if forward_line(&mut translator, framed, &tx).await.is_err() {
                                process::shutdown_child(&mut child).await;
                                return;
                            }
                        }
                    }
                    break 'read;
                }
                Ok(n) => {
                    for framed in framer.push(&buf[..n]) {
                        // Nothing may follow the wire `result`.
                        if translator.finished() {
                            break;
                        }
                        if forward_line(&mut translator, framed, &tx).await.is_err() {
                            process::shutdown_child(&mut child).await;
                            return;
                        }
                    }
                    if translator.finished() {
                        break 'read;
                    }
                }
                Err(err) => {
                    let message = format!("failed to read stdout: {err}");
                    for event in translator.stream_failure(&message) {
                        let _ = tx.send(Ok(event)).await;
                    }
                    failed = true;
                    break 'read;
                }
            }
        }
    }

    // Exit-code mapping applies only when the CLI never emitted `result`.
    let exit_code = match tokio::time::timeout(process::SHUTDOWN_GRACE, child.wait()).await {
        Ok(Ok(status)) => status.code(),
        Ok(Err(_)) | Err(_) => None,
    };

    if !translator.finished() && !failed {
        let interrupted = interrupted || cancel.is_cancelled();
        let done = translator.exit_done(
            status_for_exit(exit_code, interrupted),
            started.elapsed().as_millis() as u64,
        );
        let _ = tx.send(Ok(done)).await;
    }

    process::shutdown_child(&mut child).await;
    drop(settings_dir);
}

async fn forward_line(
    translator: &mut GeminiTranslator,
    framed: harness_events::FramedLine,
    tx: &tokio::sync::mpsc::Sender<Result<AgentEvent, AdapterError>>,
) -> Result<(), ()> {
    match framed.outcome {
        Ok(value) => {
            for event in translator.translate(&value) {
                tx.send(Ok(event)).await.map_err(|_| ())?;
            }
        }
        Err(frame_err) => {
            let event = translator.parse_failure(&frame_err.raw, framed.line_number);
            tx.send(Ok(event)).await.map_err(|_| ())?;
        }
    }
    Ok(())
}

// ─── Translation ──────────────────────────────────────────────────────────

pub(crate) struct GeminiTranslator {
    session_id: String,
    finished: bool,
}

impl GeminiTranslator {
    pub(crate) fn new(seed_session: String) -> Self {
        Self {
            session_id: seed_session,
            finished: false,
        }
    }

    pub(crate) fn finished(&self) -> bool {
        self.finished
    }

    fn emit(&self, payload: EventPayload) -> AgentEvent {
        AgentEvent::new(BACKEND_ID, &self.session_id, payload)
    }

    pub(crate) fn translate(&mut self, value: &Value) -> Vec<AgentEvent> {
        let Some(kind) = extract_str(value, "type") else {
            return Vec::new();
        };
        if let Some(id) = extract_str_from_keys(value, &["session_id", "sessionId"]) {
            self.session_id = id.to_string();
        }

        match kind {
            "init" => {
                let tools = value
                    .get("tools")
                    .and_then(Value::as_array)
                    .map(|tools| {
                        tools
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                vec![self.emit(EventPayload::Init(InitPayload {
                    model: extract_str(value, "model").map(str::to_string),
                    cwd: extract_str(value, "cwd").map(str::to_string),
                    tools,
                    capabilities: None,
                }))]
            }
            "message" => {
                match extract_str_from_keys(value, &["content", "text", "message"]) {
                    Some(text) => vec![self.emit(EventPayload::Text(TextPayload {
                        text: text.to_string(),
                    }))],
                    None => Vec::new(),
                }
            }
            "tool_use" => vec![self.emit(EventPayload::ToolUse(ToolUsePayload {
                tool_name: extract_str_from_keys(value, &["name", "tool"])
                    .unwrap_or_default()
                    .to_string(),
                tool_use_id: extract_str_from_keys(value, &["id", "tool_use_id"])
                    .unwrap_or_default()
                    .to_string(),
                input: value
                    .get("input")
                    .or_else(|| value.get("args"))
                    .cloned()
                    .unwrap_or(Value::Null),
                description: extract_str(value, "description").map(str::to_string),
            }))],
            "tool_result" => vec![self.emit(EventPayload::ToolResult(ToolResultPayload {
                tool_use_id: extract_str_from_keys(value, &["tool_use_id", "id"])
                    .unwrap_or_default()
                    .to_string(),
                tool_name: extract_str_from_keys(value, &["name", "tool"])
                    .unwrap_or_default()
                    .to_string(),
                status: tool_result_status(value),
                output: value
                    .get("output")
                    .or_else(|| value.get("content"))
                    .or_else(|| value.get("result"))
                    .cloned()
                    .unwrap_or(Value::Null),
                duration_ms: value.get("duration_ms").and_then(Value::as_u64),
            }))],
            "error" => {
                let scope = value.get("error").unwrap_or(value);
                vec![self.emit(EventPayload::Error(ErrorPayload {
                    code: extract_str(scope, "code").map(str::to_string),
                    message: extract_str_from_keys(scope, &["message", "error"])
                        .unwrap_or("unknown error")
                        .to_string(),
                    recoverable: scope
                        .get("recoverable")
                        .and_then(Value::as_bool)
                        .unwrap_or(false),
                }))]
            }
            "result" => {
                self.finished = true;
                vec![self.emit(EventPayload::Done(DonePayload {
                    status: map_stop_reason(extract_str_from_keys(
                        value,
                        &["status", "stop_reason"],
                    )),
                    final_text: extract_str_from_keys(value, &["result", "text"])
                        .map(str::to_string),
                    usage: usage_from_value(value),
                    duration_ms: value
                        .get("duration_ms")
                        .and_then(Value::as_u64)
                        .unwrap_or(0),
                }))]
            }
            _ => Vec::new(),
        }
    }

    /// Recoverable error for one malformed NDJSON line; the stream continues.
    pub(crate) fn parse_failure(&self, raw: &str, line_number: usize) -> AgentEvent {
        let mut metadata = Map::new();
        metadata.insert("lineNumber".into(), json!(line_number));
        self.emit(EventPayload::Error(ErrorPayload {
            code: Some(CODE_NDJSON_PARSE_ERROR.to_string()),
            message: format!("malformed NDJSON line: `{raw}`"),
            recoverable: true,
        }))
        .with_metadata(metadata)
    }

    pub(crate) fn stream_failure(&mut self, message: &str) -> Vec<AgentEvent> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        vec![
            self.emit(EventPayload::Error(ErrorPayload {
                code: Some(CODE_GEMINI_STREAM_ERROR.to_string()),
                message: message.to_string(),
                recoverable: false,
            })),
            self.emit(EventPayload::Done(DonePayload {
                status: SessionStatus::Error,
                final_text: None,
                usage: Default::default(),
                duration_ms: 0,
            })),
        ]
    }

    /// Terminal synthesized from the process exit code.
    pub(crate) fn exit_done(&mut self, status: SessionStatus, duration_ms: u64) -> AgentEvent {
        self.finished = true;
        self.emit(EventPayload::Done(DonePayload {
            status,
            final_text: None,
            usage: Default::default(),
            duration_ms,
        }))
    }
}

fn tool_result_status(value: &Value) -> ToolOutcome {
    match extract_str(value, "status") {
        Some("denied") => return ToolOutcome::Denied,
        Some("error") | Some("failed") => return ToolOutcome::Error,
        Some(_) => return ToolOutcome::Success,
        None => {}
    }
    if value
        .get("is_error")
        .and_then(Value::as_bool)
        .unwrap_or(false)
    {
        ToolOutcome::Error
    } else {
        ToolOutcome::Success
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────
