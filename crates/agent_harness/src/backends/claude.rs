//! Backend A — Claude Code stream-json normalizer.
//!
//! Drives `claude --print … --output-format stream-json` and translates its
//! typed messages (system/init, assistant content blocks, stream_event
//! deltas, result, error) into the canonical event model. The capability
//! policy maps onto the CLI's permission mode plus a per-tool classifier;
//! the classifier's allow/deny halves also materialize as
//! `--allowed-tools` / `--disallowed-tools`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use harness_events::{
    new_session_id, AgentEvent, DonePayload, ErrorPayload, EventPayload, InitPayload,
    SessionStatus, TextDeltaPayload, TextPayload, ThinkingPayload, ToolOutcome, ToolResultPayload,
    ToolUsePayload,
};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

use crate::adapter::{binary_available, production_channel, Adapter, AdapterStream};
use crate::backends::wire::{extract_str, extract_str_from_keys, map_stop_reason, usage_from_value};
use crate::backends::CODE_SDK_STREAM_ERROR;
use crate::error::AdapterError;
use crate::options::{CapabilityDecision, CapabilityPolicy, RunOptions};
use crate::process;

pub const BACKEND_ID: &str = "claude";
/// Emitted when the stream ends without a `result` message.
pub const CODE_MISSING_RESULT: &str = "MISSING_RESULT";

// ─── Permission mapping ───────────────────────────────────────────────────

/// Claude CLI permission mode derived from the capability triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionMode {
    Default,
    AcceptEdits,
    Bypass,
}

impl PermissionMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            PermissionMode::Default => "default",
            PermissionMode::AcceptEdits => "acceptEdits",
            PermissionMode::Bypass => "bypassPermissions",
        }
    }
}

/// All three allow → bypass; exactly {fileWrite=allow, rest=ask} →
/// accept-edits; anything else falls back to default plus per-tool
/// decisions.
pub fn permission_mode(policy: &CapabilityPolicy) -> PermissionMode {
    use CapabilityDecision::{Allow, Ask};
    if policy.all_allow() {
        return PermissionMode::Bypass;
    }
    if policy.file_write == Allow && policy.shell_execute == Ask && policy.network_access == Ask {
        return PermissionMode::AcceptEdits;
    }
    PermissionMode::Default
}

const FILE_WRITE_TOOLS: &[&str] = &["Write", "Edit", "MultiEdit", "NotebookEdit"];
const SHELL_TOOLS: &[&str] = &["Bash"];
const NETWORK_TOOLS: &[&str] = &["WebFetch"];

/// Per-tool decision: `Some(true)` auto-approves, `Some(false)` denies,
/// `None` defers (ask, or a tool the classifier does not know).
pub fn decide(policy: &CapabilityPolicy, tool: &str) -> Option<bool> {
    let decision = if FILE_WRITE_TOOLS.contains(&tool) {
        policy.file_write
    } else if SHELL_TOOLS.contains(&tool) {
        policy.shell_execute
    } else if NETWORK_TOOLS.contains(&tool) {
        policy.network_access
    } else {
        return None;
    };
    match decision {
        CapabilityDecision::Allow => Some(true),
        CapabilityDecision::Deny => Some(false),
        CapabilityDecision::Ask => None,
    }
}

fn classified_tools(policy: &CapabilityPolicy, wanted: CapabilityDecision) -> Vec<String> {
    let mut out = Vec::new();
    for (tools, decision) in [
        (FILE_WRITE_TOOLS, policy.file_write),
        (SHELL_TOOLS, policy.shell_execute),
        (NETWORK_TOOLS, policy.network_access),
    ] {
        if decision == wanted {
            out.extend(tools.iter().map(|t| (*t).to_string()));
        }
    }
    out
}

// ─── Adapter ──────────────────────────────────────────────────────────────

pub struct ClaudeAdapter {
    binary: PathBuf,
}

impl Default for ClaudeAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl ClaudeAdapter {
    pub fn new() -> Self {
        Self {
            binary: PathBuf::from("claude"),
        }
    }

    /// Overrides the CLI binary (default: `claude` on `PATH`).
    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Adapter for ClaudeAdapter {
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
            run_query(binary, prompt, options, tx).await;
        });
        stream
    }
}

fn build_command(binary: &Path, prompt: &str, options: &RunOptions) -> Command {
    let mut cmd = Command::new(binary);
    cmd.arg("--print")
        .arg(prompt)
        .arg("--output-format")
        .arg("stream-json")
        .arg("--verbose");

    if let Some(model) = &options.model {
        cmd.arg("--model").arg(model);
    }
    if let Some(max_turns) = options.max_turns {
        cmd.arg("--max-turns").arg(max_turns.to_string());
    }
    if let Some(budget) = options.max_budget_usd {
        cmd.arg("--max-budget-usd").arg(budget.to_string());
    }
    if let Some(resume) = &options.resume {
        cmd.arg("--resume").arg(resume);
    }

    let mode = permission_mode(&options.permissions);
    if mode != PermissionMode::Default {
        cmd.arg("--permission-mode").arg(mode.as_str());
    }

    let mut allowed = options.allowed_tools.clone();
    let mut disallowed = options.disallowed_tools.clone();
    if mode == PermissionMode::Default {
        allowed.extend(classified_tools(
            &options.permissions,
            CapabilityDecision::Allow,
        ));
        disallowed.extend(classified_tools(
            &options.permissions,
            CapabilityDecision::Deny,
        ));
    }
    allowed.retain(|tool| !disallowed.contains(tool));
    if !allowed.is_empty() {
        cmd.arg("--allowed-tools").args(&allowed);
    }
    if !disallowed.is_empty() {
        cmd.arg("--disallowed-tools").args(&disallowed);
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

async fn run_query(
    binary: PathBuf,
    prompt: String,
    options: RunOptions,
    tx: tokio::sync::mpsc::Sender<Result<AgentEvent, AdapterError>>,
) {
    let cancel = options.cancel.clone();
    let mut translator = ClaudeTranslator::new(new_session_id());

    let mut cmd = build_command(&binary, &prompt, &options);
    let mut child: Child = match cmd.spawn() {
        Ok(child) => child,
        Err(source) => {
            let _ = tx.send(Err(AdapterError::Spawn { binary, source })).await;
            return;
        }
    };
    tracing::debug!(binary = %binary.display(), "spawned claude subprocess");

    let Some(stdout) = child.stdout.take() else {
        let _ = tx
            .send(Err(AdapterError::Message("stdout not captured".into())))
            .await;
        return;
    };
    let mut lines = BufReader::new(stdout).lines();

    let mut failed = false;
    'read: loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                process::send_sigterm(&mut child);
                break 'read;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Value>(trimmed) {
                        Ok(value) => {
                            for event in translator.translate(&value) {
                                if tx.send(Ok(event)).await.is_err() {
                                    process::shutdown_child(&mut child).await;
                                    return;
                                }
                            }
                            if translator.finished() {
                                break 'read;
                            }
                        }
                        Err(err) => {
                            let message = format!("invalid stream-json line: {err}");
                            for event in translator.stream_failure(&message) {
                                let _ = tx.send(Ok(event)).await;
                            }
                            failed = true;
                            break 'read;
                        }
                    }
                }
                Ok(None) => break 'read,
                Err(err) => {
                    let message = format!("failed to read stream-json: {err}");
                    for event in translator.stream_failure(&message) {
                        let _ = tx.send(Ok(event)).await;
                    }
                    failed = true;
                    break 'read;
                }
            }
        }
    }

    if !translator.finished() && !failed && !cancel.is_cancelled() {
        for event in translator.missing_result() {
            let _ = tx.send(Ok(event)).await;
        }
    }
    process::shutdown_child(&mut child).await;
}

// ─── Translation ──────────────────────────────────────────────────────────

/// Stateful per-session translator: tracks the adapter session id, the
/// tool-use names seen so far (for result correlation), and whether the
/// terminal `result` has arrived.
pub(crate) struct ClaudeTranslator {
    session_id: String,
    tool_names: HashMap<String, String>,
    generated_ids: u32,
    finished: bool,
}

impl ClaudeTranslator {
    pub(crate) fn new(seed_session: String) -> Self {
        Self {
            session_id: seed_session,
            tool_names: HashMap::new(),
            generated_ids: 0,
            finished: false,
        }
    }

    pub(crate) fn finished(&self) -> bool {
        self.finished
    }

    fn emit(&self, payload: EventPayload) -> AgentEvent {
        AgentEvent::new(BACKEND_ID, &self.session_id, payload)
    }

    fn adopt_session(&mut self, value: &Value) {
        if let Some(id) = extract_str_from_keys(value, &["session_id", "sessionId"]) {
            self.session_id = id.to_string();
        }
    }

    /// Translates one wire message. Unknown `type`s yield nothing.
    pub(crate) fn translate(&mut self, value: &Value) -> Vec<AgentEvent> {
        let Some(kind) = extract_str(value, "type") else {
            return Vec::new();
        };
        self.adopt_session(value);

        match kind {
            "system" => self.translate_system(value),
            "assistant" | "user" => self.translate_content(value),
            "stream_event" => self.translate_stream_event(value),
            "result" => self.translate_result(value),
            "error" => vec![self.translate_error(value)],
            _ => Vec::new(),
        }
    }

    fn translate_system(&mut self, value: &Value) -> Vec<AgentEvent> {
        if extract_str(value, "subtype") != Some("init") {
            return Vec::new();
        }
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

    fn translate_content(&mut self, value: &Value) -> Vec<AgentEvent> {
        let Some(blocks) = value
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(Value::as_array)
        else {
            return Vec::new();
        };

        let mut out = Vec::new();
        for block in blocks {
            match extract_str(block, "type") {
                Some("text") => {
                    if let Some(text) = extract_str(block, "text") {
                        out.push(self.emit(EventPayload::Text(TextPayload {
                            text: text.to_string(),
                        })));
                    }
                }
                Some("thinking") => {
                    if let Some(summary) = extract_str_from_keys(block, &["thinking", "text"]) {
                        out.push(self.emit(EventPayload::Thinking(ThinkingPayload {
                            summary: summary.to_string(),
                        })));
                    }
                }
                Some("tool_use") => {
                    let tool_use_id = extract_str(block, "id")
                        .map(str::to_string)
                        .unwrap_or_else(|| self.generate_tool_id());
                    let tool_name = extract_str(block, "name").unwrap_or_default().to_string();
                    self.tool_names
                        .insert(tool_use_id.clone(), tool_name.clone());
                    out.push(self.emit(EventPayload::ToolUse(ToolUsePayload {
                        tool_name,
                        tool_use_id,
                        input: block.get("input").cloned().unwrap_or(Value::Null),
                        description: None,
                    })));
                }
                Some("tool_result") => {
                    let tool_use_id = extract_str_from_keys(block, &["tool_use_id", "toolUseId"])
                        .unwrap_or_default()
                        .to_string();
                    let tool_name = self
                        .tool_names
                        .get(&tool_use_id)
                        .cloned()
                        .unwrap_or_default();
                    out.push(self.emit(EventPayload::ToolResult(ToolResultPayload {
                        tool_use_id,
                        tool_name,
                        status: tool_result_status(block),
                        output: block.get("content").cloned().unwrap_or(Value::Null),
                        duration_ms: None,
                    })));
                }
                _ => {}
            }
        }
        out
    }

    fn translate_stream_event(&mut self, value: &Value) -> Vec<AgentEvent> {
        let Some(event) = value.get("event") else {
            return Vec::new();
        };
        let delta = event
            .get("delta")
            .and_then(|d| extract_str(d, "text").or_else(|| d.as_str()))
            .or_else(|| extract_str(event, "text"));
        match delta {
            Some(delta) => vec![self.emit(EventPayload::TextDelta(TextDeltaPayload {
                delta: delta.to_string(),
            }))],
            None => Vec::new(),
        }
    }

    fn translate_result(&mut self, value: &Value) -> Vec<AgentEvent> {
        self.finished = true;
        let duration_ms = value
            .get("duration_ms")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        vec![self.emit(EventPayload::Done(DonePayload {
            status: result_status(value),
            final_text: extract_str(value, "result").map(str::to_string),
            usage: usage_from_value(value),
            duration_ms,
        }))]
    }

    fn translate_error(&mut self, value: &Value) -> AgentEvent {
        let scope = value.get("error").unwrap_or(value);
        let recoverable = scope
            .get("recoverable")
            .or_else(|| scope.get("retryable"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        self.emit(EventPayload::Error(ErrorPayload {
            code: extract_str(scope, "code").map(str::to_string),
            message: extract_str_from_keys(scope, &["message", "error"])
                .unwrap_or("unknown error")
                .to_string(),
            recoverable,
        }))
    }

    /// `error{SDK_STREAM_ERROR}` + `done{error}` for a transport failure.
    pub(crate) fn stream_failure(&mut self, message: &str) -> Vec<AgentEvent> {
        self.failure_pair(CODE_SDK_STREAM_ERROR, message)
    }

    /// `error{MISSING_RESULT}` + `done{error}` for an exhausted stream.
    pub(crate) fn missing_result(&mut self) -> Vec<AgentEvent> {
        self.failure_pair(CODE_MISSING_RESULT, "stream ended without a result message")
    }

    fn failure_pair(&mut self, code: &str, message: &str) -> Vec<AgentEvent> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        vec![
            self.emit(EventPayload::Error(ErrorPayload {
                code: Some(code.to_string()),
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

    fn generate_tool_id(&mut self) -> String {
        self.generated_ids += 1;
        format!("toolu-synth-{}", self.generated_ids)
    }
}

/// Status precedence: explicit `denied` > explicit/flagged error > success.
fn tool_result_status(block: &Value) -> ToolOutcome {
    match extract_str(block, "status") {
        Some("denied") => return ToolOutcome::Denied,
        Some("error") => return ToolOutcome::Error,
        Some("success") => return ToolOutcome::Success,
        _ => {}
    }
    if block
        .get("is_error")
        .and_then(Value::as_bool)
        .unwrap_or(false)
    {
        ToolOutcome::Error
    } else {
        ToolOutcome::Success
    }
}

fn result_status(value: &Value) -> SessionStatus {
    if let Some(subtype) = extract_str(value, "subtype") {
        let subtype = subtype.to_ascii_lowercase();
        if subtype == "success" {
            return SessionStatus::Success;
        }
        if subtype.contains("max_turn") {
            return SessionStatus::MaxTurns;
        }
        if subtype.contains("budget") {
            return SessionStatus::MaxBudget;
        }
        if subtype.contains("error") || subtype.contains("fail") {
            return SessionStatus::Error;
        }
    }
    map_stop_reason(extract_str_from_keys(
        value,
        &["stop_reason", "stopReason", "status"],
    ))
}

// ─── Tests ────────────────────────────────────────────────────────────────
