//! Backend B — Codex thread normalizer.
//!
//! Drives `codex exec --json` (prompt over stdin) and translates thread/turn/
//! item events into the canonical model. The capability policy maps onto the
//! CLI's sandbox mode, approval policy, and workspace network flag; thread
//! resume runs `codex exec resume <id> --json`.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use harness_events::{
    new_session_id, AgentEvent, DonePayload, ErrorPayload, EventPayload, InitPayload,
    SessionStatus, TextPayload, ToolOutcome, ToolResultPayload, ToolUsePayload,
};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};

use crate::adapter::{binary_available, production_channel, Adapter, AdapterStream};
use crate::backends::wire::{extract_str, extract_str_from_keys, map_stop_reason, usage_from_value};
use crate::backends::CODE_SDK_STREAM_ERROR;
use crate::error::AdapterError;
use crate::options::{CapabilityDecision, CapabilityPolicy, RunOptions};
use crate::process;

pub const BACKEND_ID: &str = "codex";
/// Emitted when the stream ends without a `turn.completed`.
pub const CODE_MISSING_TURN_DONE: &str = "MISSING_TURN_DONE";

// ─── Sandbox / approval mapping ───────────────────────────────────────────

/// Sandbox isolation level passed to `--sandbox`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxMode {
    ReadOnly,
    WorkspaceWrite,
    DangerFullAccess,
}

impl SandboxMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            SandboxMode::ReadOnly => "read-only",
            SandboxMode::WorkspaceWrite => "workspace-write",
            SandboxMode::DangerFullAccess => "danger-full-access",
        }
    }
}

/// Approval policy passed to `--ask-for-approval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalPolicy {
    Untrusted,
    OnRequest,
    Never,
}

impl ApprovalPolicy {
    pub const fn as_str(self) -> &'static str {
        match self {
            ApprovalPolicy::Untrusted => "untrusted",
            ApprovalPolicy::OnRequest => "on-request",
            ApprovalPolicy::Never => "never",
        }
    }
}

/// The codex rendition of a capability policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SandboxPlan {
    pub sandbox: SandboxMode,
    pub approval: ApprovalPolicy,
    /// Workspace network access. `ask` collapses to disabled: the CLI has no
    /// per-request network prompt, so the mapping takes the safer side.
    pub network_access: bool,
}

pub fn sandbox_plan(policy: &CapabilityPolicy) -> SandboxPlan {
    use CapabilityDecision::Allow;

    let sandbox = if policy.any_deny() {
        SandboxMode::ReadOnly
    } else if policy.file_write == Allow && policy.shell_execute == Allow {
        SandboxMode::DangerFullAccess
    } else {
        SandboxMode::WorkspaceWrite
    };

    let approval = if policy.all_allow() {
        ApprovalPolicy::Never
    } else if policy.any_ask() {
        ApprovalPolicy::Untrusted
    } else {
        ApprovalPolicy::OnRequest
    };

    SandboxPlan {
        sandbox,
        approval,
        network_access: policy.network_access == Allow,
    }
}

// ─── Adapter ──────────────────────────────────────────────────────────────

pub struct CodexAdapter {
    binary: PathBuf,
    resume_enabled: bool,
}

impl Default for CodexAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl CodexAdapter {
    pub fn new() -> Self {
        Self {
            binary: PathBuf::from("codex"),
            resume_enabled: true,
        }
    }

    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            resume_enabled: true,
        }
    }

    /// Disables thread resume, e.g. for CLI versions without the `resume`
    /// subcommand. A resume request against such an adapter fails.
    pub fn resume_enabled(mut self, enabled: bool) -> Self {
        self.resume_enabled = enabled;
        self
    }
}

impl Adapter for CodexAdapter {
    fn id(&self) -> &str {
        BACKEND_ID
    }

    fn available(&self) -> bool {
        binary_available(&self.binary)
    }

    fn run(&self, prompt: &str, options: &RunOptions) -> AdapterStream {
        let (tx, stream) = production_channel();

        if options.resume.is_some() && !self.resume_enabled {
            tokio::spawn(async move {
                let _ = tx.send(Err(AdapterError::ResumeUnsupported)).await;
            });
            return stream;
        }

        let binary = self.binary.clone();
        let prompt = prompt.to_string();
        let options = options.clone();
        tokio::spawn(async move {
            run_thread(binary, prompt, options, tx).await;
        });
        stream
    }
}

fn build_command(binary: &Path, options: &RunOptions) -> Command {
    let mut cmd = Command::new(binary);
    cmd.arg("exec");
    if let Some(resume) = &options.resume {
        cmd.arg("resume").arg(resume);
    }
    cmd.arg("--json")
        .arg("--color")
        .arg("never")
        .arg("--skip-git-repo-check");

    let plan = sandbox_plan(&options.permissions);
    cmd.arg("--sandbox").arg(plan.sandbox.as_str());
    cmd.arg("--ask-for-approval").arg(plan.approval.as_str());
    cmd.arg("-c").arg(format!(
        "sandbox_workspace_write.network_access={}",
        plan.network_access
    ));

    if let Some(model) = &options.model {
        cmd.arg("--model").arg(model);
    }
    if let Some(cwd) = &options.cwd {
        cmd.current_dir(cwd);
    }

    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    cmd
}

async fn run_thread(
    binary: PathBuf,
    prompt: String,
    options: RunOptions,
    tx: tokio::sync::mpsc::Sender<Result<AgentEvent, AdapterError>>,
) {
    let cancel = options.cancel.clone();
    let mut translator = CodexTranslator::new(
        new_session_id(),
        options.model.clone(),
        options.cwd.as_ref().map(|p| p.display().to_string()),
    );

    let mut cmd = build_command(&binary, &options);
    let mut child: Child = match cmd.spawn() {
        Ok(child) => child,
        Err(source) => {
            let _ = tx.send(Err(AdapterError::Spawn { binary, source })).await;
            return;
        }
    };
    tracing::debug!(binary = %binary.display(), "spawned codex subprocess");

    // The prompt travels over stdin, one line, then EOF.
    if let Some(mut stdin) = child.stdin.take() {
        let write = async {
            stdin.write_all(prompt.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.shutdown().await
        };
        if let Err(err) = write.await {
            if err.kind() != std::io::ErrorKind::BrokenPipe {
                let _ = tx.send(Err(AdapterError::Io(err))).await;
                process::shutdown_child(&mut child).await;
                return;
            }
        }
    }

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
                            let message = format!("invalid JSONL event: {err}");
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
                    let message = format!("failed to read JSONL stream: {err}");
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
        for event in translator.missing_turn_done() {
            let _ = tx.send(Ok(event)).await;
        }
    }
    process::shutdown_child(&mut child).await;
}

// ─── Translation ──────────────────────────────────────────────────────────

pub(crate) struct CodexTranslator {
    session_id: String,
    model: Option<String>,
    cwd: Option<String>,
    finished: bool,
}

impl CodexTranslator {
    pub(crate) fn new(seed_session: String, model: Option<String>, cwd: Option<String>) -> Self {
        Self {
            session_id: seed_session,
            model,
            cwd,
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
        match kind {
            "thread.started" | "thread.resumed" => {
                if let Some(id) =
                    extract_str_from_keys(value, &["thread_id", "conversation_id", "id"])
                {
                    self.session_id = id.to_string();
                }
                vec![self.emit(EventPayload::Init(InitPayload {
                    model: self.model.clone(),
                    cwd: self.cwd.clone(),
                    tools: Vec::new(),
                    capabilities: None,
                }))]
            }
            "item.completed" => self.translate_item(value),
            "turn.completed" => {
                self.finished = true;
                vec![self.emit(EventPayload::Done(DonePayload {
                    status: map_stop_reason(extract_str_from_keys(
                        value,
                        &["status", "stop_reason"],
                    )),
                    final_text: None,
                    usage: usage_from_value(value),
                    duration_ms: value
                        .get("duration_ms")
                        .and_then(Value::as_u64)
                        .unwrap_or(0),
                }))]
            }
            "turn.failed" => {
                self.finished = true;
                let mut out = Vec::new();
                if let Some(message) = value
                    .get("error")
                    .and_then(|e| extract_str_from_keys(e, &["message", "error"]))
                {
                    out.push(self.emit(EventPayload::Error(ErrorPayload {
                        code: None,
                        message: message.to_string(),
                        recoverable: false,
                    })));
                }
                out.push(self.emit(EventPayload::Done(DonePayload {
                    status: SessionStatus::Error,
                    final_text: None,
                    usage: usage_from_value(value),
                    duration_ms: 0,
                })));
                out
            }
            "error" => vec![self.translate_error(value)],
            _ => Vec::new(),
        }
    }

    fn translate_item(&mut self, value: &Value) -> Vec<AgentEvent> {
        let item = value.get("item").unwrap_or(value);
        let blocks = item
            .get("content")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut out = Vec::new();
        let mut saw_text_block = false;
        for block in &blocks {
            match extract_str(block, "type") {
                Some("output_text") => {
                    saw_text_block = true;
                    if let Some(text) = extract_str(block, "text") {
                        out.push(self.emit(EventPayload::Text(TextPayload {
                            text: text.to_string(),
                        })));
                    }
                }
                Some("tool_call") => {
                    out.push(self.emit(EventPayload::ToolUse(ToolUsePayload {
                        tool_name: extract_str_from_keys(block, &["name", "tool"])
                            .unwrap_or_default()
                            .to_string(),
                        tool_use_id: extract_str_from_keys(block, &["id", "call_id"])
                            .unwrap_or_default()
                            .to_string(),
                        input: block
                            .get("arguments")
                            .or_else(|| block.get("input"))
                            .cloned()
                            .unwrap_or(Value::Null),
                        description: None,
                    })));
                }
                Some("tool_result") => {
                    out.push(self.emit(EventPayload::ToolResult(ToolResultPayload {
                        tool_use_id: extract_str_from_keys(block, &["call_id", "id"])
                            .unwrap_or_default()
                            .to_string(),
                        tool_name: extract_str_from_keys(block, &["name", "tool"])
                            .unwrap_or_default()
                            .to_string(),
                        status: tool_result_status(block),
                        output: block
                            .get("output")
                            .or_else(|| block.get("result"))
                            .cloned()
                            .unwrap_or(Value::Null),
                        duration_ms: None,
                    })));
                }
                Some("file_change") => {
                    out.push(self.emit(EventPayload::Extension {
                        kind: format!("{BACKEND_ID}:file_change"),
                        payload: block.clone(),
                    }));
                }
                _ => {}
            }
        }

        // Top-level text must not duplicate a content text block.
        if !saw_text_block {
            if let Some(text) = extract_str(item, "text") {
                out.insert(
                    0,
                    self.emit(EventPayload::Text(TextPayload {
                        text: text.to_string(),
                    })),
                );
            }
        }
        out
    }

    fn translate_error(&mut self, value: &Value) -> AgentEvent {
        let scope = value.get("error").unwrap_or(value);
        self.emit(EventPayload::Error(ErrorPayload {
            code: extract_str(scope, "code").map(str::to_string),
            message: extract_str_from_keys(scope, &["message", "error"])
                .unwrap_or("unknown error")
                .to_string(),
            recoverable: scope
                .get("recoverable")
                .or_else(|| scope.get("retryable"))
                .and_then(Value::as_bool)
                .unwrap_or(false),
        }))
    }

    pub(crate) fn stream_failure(&mut self, message: &str) -> Vec<AgentEvent> {
        self.failure_pair(CODE_SDK_STREAM_ERROR, message)
    }

    pub(crate) fn missing_turn_done(&mut self) -> Vec<AgentEvent> {
        self.failure_pair(
            CODE_MISSING_TURN_DONE,
            "stream ended without turn.completed",
        )
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
}

fn tool_result_status(block: &Value) -> ToolOutcome {
    match extract_str(block, "status") {
        Some("denied") => return ToolOutcome::Denied,
        Some("failed") | Some("error") => return ToolOutcome::Error,
        Some(_) => return ToolOutcome::Success,
        None => {}
    }
    match block.get("success").and_then(Value::as_bool) {
        Some(false) => ToolOutcome::Error,
        _ => ToolOutcome::Success,
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn policy(
        file_write: CapabilityDecision,
        shell_execute: CapabilityDecision,
        network_access: CapabilityDecision,
    ) -> CapabilityPolicy {
        CapabilityPolicy {
            file_write,
            shell_execute,
            network_access,
        }
    }

    #[test]
    fn sandbox_table() {
        use CapabilityDecision::{Allow, Ask, Deny};

        // Any deny wins, regardless of the other capabilities.
        for p in [
            policy(Deny, Allow, Allow),
            policy(Allow, Deny, Ask),
            policy(Ask, Ask, Deny),
        ] {
            assert_eq!(sandbox_plan(&p).sandbox, SandboxMode::ReadOnly);
        }

        assert_eq!(
            sandbox_plan(&policy(Allow, Allow, Ask)).sandbox,
            SandboxMode::DangerFullAccess
        );
        assert_eq!(
            sandbox_plan(&policy(Allow, Ask, Allow)).sandbox,
            SandboxMode::WorkspaceWrite
        );
        assert_eq!(
            sandbox_plan(&policy(Ask, Ask, Ask)).sandbox,
            SandboxMode::WorkspaceWrite
        );
    }

    #[test]
    fn approval_table() {
        use CapabilityDecision::{Allow, Ask, Deny};
        assert_eq!(
            sandbox_plan(&policy(Allow, Allow, Allow)).approval,
            ApprovalPolicy::Never
        );
        assert_eq!(
            sandbox_plan(&policy(Allow, Ask, Allow)).approval,
            ApprovalPolicy::Untrusted
        );
        assert_eq!(
            sandbox_plan(&policy(Allow, Deny, Allow)).approval,
            ApprovalPolicy::OnRequest
        );
    }

    #[test]
    fn network_ask_collapses_to_disabled() {
        use CapabilityDecision::{Allow, Ask, Deny};
        assert!(sandbox_plan(&policy(Allow, Allow, Allow)).network_access);
        // Lossy by design: the CLI cannot express "ask" for network.
        assert!(!sandbox_plan(&policy(Allow, Allow, Ask)).network_access);
        assert!(!sandbox_plan(&policy(Allow, Allow, Deny)).network_access);
    }

    #[test]
    fn thread_started_adopts_id_and_emits_init() {
        let mut translator =
            CodexTranslator::new("seed".into(), Some("gpt-5".into()), Some("/w".into()));
        let events = translator.translate(&json!({
            "type": "thread.started",
            "thread_id": "thr-1"
        }));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].session_id, "thr-1");
        let EventPayload::Init(init) = &events[0].payload else {
            panic!("expected init");
        };
        assert_eq!(init.model.as_deref(), Some("gpt-5"));
        assert_eq!(init.cwd.as_deref(), Some("/w"));
    }

    #[test]
    fn item_blocks_translate_and_file_change_becomes_extension() {
        let mut translator = CodexTranslator::new("thr-1".into(), None, None);
        let events = translator.translate(&json!({
            "type": "item.completed",
            "item": {
                "content": [
                    {"type": "output_text", "text": "answer"},
                    {"type": "tool_call", "id": "c1", "name": "shell", "arguments": {"cmd": "ls"}},
                    {"type": "tool_result", "call_id": "c1", "output": "ok", "status": "completed"},
                    {"type": "file_change", "path": "src/lib.rs", "kind": "update"},
                ]
            }
        }));
        assert_eq!(events.len(), 4);
        assert_eq!(events[0].kind(), "text");
        assert_eq!(events[1].kind(), "tool_use");
        assert_eq!(events[2].kind(), "tool_result");
        assert_eq!(events[3].kind(), "codex:file_change");

        let EventPayload::Extension { payload, .. } = &events[3].payload else {
            panic!("expected extension");
        };
        assert_eq!(payload["path"], "src/lib.rs");
    }

    #[test]
    fn top_level_text_dedups_against_content_text_block() {
        let mut translator = CodexTranslator::new("thr-1".into(), None, None);

        // With a content text block, the top-level text is suppressed.
        let events = translator.translate(&json!({
            "type": "item.completed",
            "item": {
                "text": "duplicate",
                "content": [{"type": "output_text", "text": "canonical"}]
            }
        }));
        assert_eq!(events.len(), 1);
        let EventPayload::Text(text) = &events[0].payload else {
            panic!("expected text");
        };
        assert_eq!(text.text, "canonical");

        // Without one, the top-level text is the message.
        let events = translator.translate(&json!({
            "type": "item.completed",
            "item": {"text": "only", "content": []}
        }));
        assert_eq!(events.len(), 1);
        let EventPayload::Text(text) = &events[0].payload else {
            panic!("expected text");
        };
        assert_eq!(text.text, "only");
    }

    #[test]
    fn turn_completed_maps_status_and_usage() {
        let mut translator = CodexTranslator::new("thr-1".into(), None, None);
        let events = translator.translate(&json!({
            "type": "turn.completed",
            "status": "completed",
            "usage": {"input_tokens": 5, "output_tokens": 7}
        }));
        assert!(translator.finished());
        let done = events[0].as_done().unwrap();
        assert_eq!(done.status, SessionStatus::Success);
        assert_eq!(done.usage.input_tokens, 5);
        assert_eq!(done.usage.output_tokens, 7);
    }

    #[test]
    fn turn_failed_is_terminal_error() {
        let mut translator = CodexTranslator::new("thr-1".into(), None, None);
        let events = translator.translate(&json!({
            "type": "turn.failed",
            "error": {"message": "model refused"}
        }));
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].as_error().unwrap().message, "model refused");
        assert_eq!(events[1].as_done().unwrap().status, SessionStatus::Error);
    }

    #[test]
    fn missing_turn_done_pair() {
        let mut translator = CodexTranslator::new("thr-1".into(), None, None);
        let events = translator.missing_turn_done();
        assert_eq!(
            events[0].as_error().unwrap().code.as_deref(),
            Some(CODE_MISSING_TURN_DONE)
        );
        assert_eq!(events[1].as_done().unwrap().status, SessionStatus::Error);
        assert!(translator.missing_turn_done().is_empty());
    }

    #[tokio::test]
    async fn resume_without_support_raises() {
        use futures_util::StreamExt;
        let adapter = CodexAdapter::new().resume_enabled(false);
        let options = RunOptions {
            resume: Some("thr-9".into()),
            ..Default::default()
        };
        let mut stream = adapter.run("continue", &options);
        let first = stream.next().await.expect("one item");
        assert!(matches!(first, Err(AdapterError::ResumeUnsupported)));
        assert!(stream.next().await.is_none());
    }
}
