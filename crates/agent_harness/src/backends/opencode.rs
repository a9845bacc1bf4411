//! Backend D — OpenCode SSE normalizer with a managed local server.
//!
//! In `managed` mode the adapter spawns `opencode serve --host H --port P`,
//! waits for a readiness line, then drives the HTTP API: create a session,
//! subscribe to the cross-session `/event` SSE stream, and fire the prompt.
//! In `external` mode it connects to a caller-supplied URL and never spawns.
//! SSE traffic is filtered down to the adapter's own session before
//! translation.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use harness_events::{
    AgentEvent, DonePayload, ErrorPayload, EventPayload, InitPayload, PermissionRequestPayload,
    SessionStatus, TextDeltaPayload, TextPayload, ThinkingPayload, ToolOutcome, ToolResultPayload,
    ToolUsePayload,
};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use crate::adapter::{binary_available, production_channel, Adapter, AdapterStream};
use crate::backends::wire::{extract_str, extract_str_from_keys, map_stop_reason, usage_from_value};
use crate::error::AdapterError;
use crate::options::RunOptions;
use crate::process;

pub const BACKEND_ID: &str = "opencode";
/// Emitted when the managed server exits before the session went idle.
pub const CODE_SERVER_EXIT: &str = "OPENCODE_SERVER_EXIT";
/// Emitted when the SSE stream ends without a `session.idle`.
pub const CODE_MISSING_SESSION_IDLE: &str = "MISSING_SESSION_IDLE";
/// Emitted when the SSE transport itself fails.
pub const CODE_STREAM_ERROR: &str = "OPENCODE_STREAM_ERROR";

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:4096";
const DEFAULT_READINESS_TIMEOUT: Duration = Duration::from_secs(10);

// ─── Adapter ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerMode {
    /// Spawn and supervise a local server (default).
    Managed,
    /// Connect to a caller-supplied URL; never spawn.
    External,
}

pub struct OpencodeAdapter {
    base_url: String,
    mode: ServerMode,
    binary: PathBuf,
    readiness_timeout: Duration,
}

impl Default for OpencodeAdapter {
    fn default() -> Self {
        Self::managed(DEFAULT_BASE_URL)
    }
}

impl OpencodeAdapter {
    pub fn managed(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            mode: ServerMode::Managed,
            binary: PathBuf::from("opencode"),
            readiness_timeout: DEFAULT_READINESS_TIMEOUT,
        }
    }

    pub fn external(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            mode: ServerMode::External,
            binary: PathBuf::from("opencode"),
            readiness_timeout: DEFAULT_READINESS_TIMEOUT,
        }
    }

    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn readiness_timeout(mut self, timeout: Duration) -> Self {
        self.readiness_timeout = timeout;
        self
    }
}

impl Adapter for OpencodeAdapter {
    fn id(&self) -> &str {
        BACKEND_ID
    }

    fn available(&self) -> bool {
        match self.mode {
            ServerMode::Managed => binary_available(&self.binary),
            ServerMode::External => true,
        }
    }

    fn run(&self, prompt: &str, options: &RunOptions) -> AdapterStream {
        let (tx, stream) = production_channel();
        let config = SessionConfig {
            base_url: self.base_url.clone(),
            mode: self.mode,
            binary: self.binary.clone(),
            readiness_timeout: self.readiness_timeout,
            prompt: prompt.to_string(),
            options: options.clone(),
        };
        tokio::spawn(async move {
            run_sse_session(config, tx).await;
        });
        stream
    }
}

struct SessionConfig {
    base_url: String,
    mode: ServerMode,
    binary: PathBuf,
    readiness_timeout: Duration,
    prompt: String,
    options: RunOptions,
}

/// Splits `http(s)://host:port[/…]` into host and port for `serve` flags.
pub(crate) fn host_port(base_url: &str) -> Option<(String, u16)> {
    let rest = base_url
        .strip_prefix("http://")
        .or_else(|| base_url.strip_prefix("https://"))?;
    let authority = rest.split('/').next()?;
    let (host, port) = authority.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port.parse().ok()?))
}

pub(crate) fn line_is_ready(line: &str) -> bool {
    let line = line.to_ascii_lowercase();
    line.contains("ready") || line.contains("listening") || line.contains("http://")
}

// ─── Server lifecycle ─────────────────────────────────────────────────────

async fn spawn_server(config: &SessionConfig) -> Result<Child, AdapterError> {
    let Some((host, port)) = host_port(&config.base_url) else {
        return Err(AdapterError::Message(format!(
            "base URL `{}` must be http(s)://host:port",
            config.base_url
        )));
    };

    let mut cmd = Command::new(&config.binary);
    cmd.arg("serve")
        .arg("--host")
        .arg(&host)
        .arg("--port")
        .arg(port.to_string());
    if let Some(cwd) = &config.options.cwd {
        cmd.current_dir(cwd);
    }
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|source| AdapterError::Spawn {
        binary: config.binary.clone(),
        source,
    })?;
    tracing::debug!(binary = %config.binary.display(), host = %host, port, "spawned opencode server");

    wait_for_ready(&mut child, config.readiness_timeout)
        .await
        .map_err(AdapterError::Message)?;
    Ok(child)
}

/// Buffers stdout/stderr lines until one matches the readiness heuristic, the
/// process exits (failure), or the timeout elapses (failure). The line
/// forwarders keep draining both pipes for the server's lifetime.
async fn wait_for_ready(child: &mut Child, timeout: Duration) -> Result<(), String> {
    let (line_tx, mut line_rx) = mpsc::channel::<String>(16);

    if let Some(stdout) = child.stdout.take() {
        let tx = line_tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let _ = tx.send(line).await;
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        let tx = line_tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let _ = tx.send(line).await;
            }
        });
    }
    drop(line_tx);

    let readiness = async {
        loop {
            tokio::select! {
                line = line_rx.recv() => match line {
                    Some(line) if line_is_ready(&line) => {
                        tracing::debug!(ready_line = line.trim(), "opencode server ready");
                        return Ok(());
                    }
                    Some(_) => {}
                    None => return Err("server closed its output before readiness".to_string()),
                },
                status = child.wait() => {
                    let detail = match status {
                        Ok(status) => describe_exit(status.code()),
                        Err(err) => format!("wait failed: {err}"),
                    };
                    return Err(format!("server exited before readiness: {detail}"));
                }
            }
        }
    };

    match tokio::time::timeout(timeout, readiness).await {
        Ok(result) => result,
        Err(_) => Err(format!("server not ready within {timeout:?}")),
    }
}

fn describe_exit(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("exited with code {code}"),
        None => "terminated by signal".to_string(),
    }
}

async fn server_exit(server: &mut Option<Child>) -> String {
    match server {
        Some(child) => match child.wait().await {
            Ok(status) => describe_exit(status.code()),
            Err(err) => format!("wait failed: {err}"),
        },
        None => std::future::pending().await,
    }
}

// ─── HTTP surface ─────────────────────────────────────────────────────────

async fn create_session(
    client: &reqwest::Client,
    base_url: &str,
) -> Result<String, AdapterError> {
    let response = client
        .post(format!("{base_url}/session"))
        .json(&json!({}))
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(AdapterError::Message(format!(
            "session create failed with status {}",
            response.status()
        )));
    }
    let body: Value = response.json().await?;
    extract_str(&body, "id")
        .map(str::to_string)
        .ok_or_else(|| AdapterError::Message("session create response missing `id`".into()))
}

async fn send_prompt(
    client: &reqwest::Client,
    base_url: &str,
    session_id: &str,
    prompt: &str,
    model: Option<&str>,
) -> Result<(), AdapterError> {
    let mut body = json!({
        "parts": [{"type": "text", "text": prompt}],
    });
    // OpenCode wants {providerID, modelID}; a bare model name is left out.
    if let Some((provider, model)) = model.and_then(|m| m.split_once('/')) {
        body["model"] = json!({"providerID": provider, "modelID": model});
    }

    let response = client
        .post(format!("{base_url}/session/{session_id}/prompt_async"))
        .json(&body)
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(AdapterError::Message(format!(
            "prompt dispatch failed with status {}",
            response.status()
        )));
    }
    Ok(())
}

// ─── Session loop ─────────────────────────────────────────────────────────

async fn run_sse_session(
    config: SessionConfig,
    tx: mpsc::Sender<Result<AgentEvent, AdapterError>>,
) {
    let cancel = config.options.cancel.clone();
    let started = Instant::now();

    let mut server: Option<Child> = None;
    if config.mode == ServerMode::Managed {
        match spawn_server(&config).await {
            Ok(child) => server = Some(child),
            Err(err) => {
                let _ = tx.send(Err(err)).await;
                return;
            }
        }
    }

    let client = reqwest::Client::new();
    let base_url = config.base_url.trim_end_matches('/').to_string();

    let session_id = match create_session(&client, &base_url).await {
        Ok(id) => id,
        Err(err) => {
            let _ = tx.send(Err(err)).await;
            shutdown(server).await;
            return;
        }
    };
    let mut translator = OpencodeTranslator::new(session_id.clone());

    // Subscribe before dispatching the prompt so no events are missed.
    let sse_response = match client
        .get(format!("{base_url}/event"))
        .header("Accept", "text/event-stream")
        .send()
        .await
    {
        Ok(response) if response.status().is_success() => response,
        Ok(response) => {
            let _ = tx
                .send(Err(AdapterError::Message(format!(
                    "event subscription failed with status {}",
                    response.status()
                ))))
                .await;
            shutdown(server).await;
            return;
        }
        Err(err) => {
            let _ = tx.send(Err(AdapterError::Http(err))).await;
            shutdown(server).await;
            return;
        }
    };
    let mut sse = Box::pin(sse_response.bytes_stream());

    if let Err(err) = send_prompt(
        &client,
        &base_url,
        &session_id,
        &config.prompt,
        config.options.model.as_deref(),
    )
    .await
    {
        let _ = tx.send(Err(err)).await;
        shutdown(server).await;
        return;
    }

    let init = translator.init(
        config.options.model.clone(),
        config.options.cwd.as_ref().map(|p| p.display().to_string()),
    );
    if tx.send(Ok(init)).await.is_err() {
        shutdown(server).await;
        return;
    }

    let mut buffer = String::new();
    'events: loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                // Stop emitting promptly; the driver synthesizes the
                // interrupted terminal.
                break 'events;
            }
            detail = server_exit(&mut server) => {
                server = None;
                if cancel.is_cancelled() {
                    let done = translator.exit_interrupted(started.elapsed().as_millis() as u64);
                    if let Some(done) = done {
                        let _ = tx.send(Ok(done)).await;
                    }
                } else {
                    for event in translator.server_exit_failure(&detail) {
                        let _ = tx.send(Ok(event)).await;
                    }
                }
                break 'events;
            }
            chunk = sse.next() => match chunk {
                Some(Ok(bytes)) => {
                    buffer.push_str(&String::from_utf8_lossy(&bytes));
                    while let Some(data) = next_sse_data(&mut buffer) {
                        let Ok(value) = serde_json::from_str::<Value>(&data) else {
                            continue;
                        };
                        let Some(event_type) = extract_str(&value, "type") else {
                            continue;
                        };
                        let empty = json!({});
                        let props = value.get("properties").unwrap_or(&empty);
                        if !translator.matches_session(props) {
                            continue;
                        }
                        for event in translator.translate(event_type, props) {
                            if tx.send(Ok(event)).await.is_err() {
                                break 'events;
                            }
                        }
                        if translator.finished() {
                            break 'events;
                        }
                    }
                }
                Some(Err(err)) => {
                    for event in translator.stream_failure(&format!("SSE stream failed: {err}")) {
                        let _ = tx.send(Ok(event)).await;
                    }
                    break 'events;
                }
                None => {
                    if !cancel.is_cancelled() {
                        for event in translator.missing_idle() {
                            let _ = tx.send(Ok(event)).await;
                        }
                    }
                    break 'events;
                }
            }
        }
    }

    drop(sse);
    shutdown(server).await;
}

async fn shutdown(server: Option<Child>) {
    if let Some(mut child) = server {
        process::shutdown_child(&mut child).await;
    }
}

/// Pops one complete SSE frame off the buffer and returns its `data:`
/// payload, if any. Frames are `\n\n`-delimited.
pub(crate) fn next_sse_data(buffer: &mut String) -> Option<String> {
    loop {
        let end = buffer.find("\n\n")?;
        let frame: String = buffer.drain(..end + 2).collect();
        let data: Vec<&str> = frame
            .lines()
            .filter_map(|line| line.strip_prefix("data:").map(str::trim_start))
            .collect();
        if !data.is_empty() {
            return Some(data.join("\n"));
        }
        // Comment/keep-alive frame; keep scanning.
    }
}

// ─── Translation ──────────────────────────────────────────────────────────

struct PendingPermission {
    tool_name: String,
    reason: Option<String>,
}

pub(crate) struct OpencodeTranslator {
    session_id: String,
    pending_permissions: HashMap<String, PendingPermission>,
    finished: bool,
}

impl OpencodeTranslator {
    pub(crate) fn new(session_id: String) -> Self {
        Self {
            session_id,
            pending_permissions: HashMap::new(),
            finished: false,
        }
    }

    pub(crate) fn finished(&self) -> bool {
        self.finished
    }

    fn emit(&self, payload: EventPayload) -> AgentEvent {
        AgentEvent::new(BACKEND_ID, &self.session_id, payload)
    }

    pub(crate) fn init(&self, model: Option<String>, cwd: Option<String>) -> AgentEvent {
        self.emit(EventPayload::Init(InitPayload {
            model,
            cwd,
            tools: Vec::new(),
            capabilities: None,
        }))
    }

    /// The SSE stream carries every session's traffic; only events for this
    /// adapter's session pass.
    pub(crate) fn matches_session(&self, props: &Value) -> bool {
        event_session(props) == Some(self.session_id.as_str())
    }

    pub(crate) fn translate(&mut self, event_type: &str, props: &Value) -> Vec<AgentEvent> {
        match event_type {
            "message.part.updated" => self.translate_part(props),
            "permission.updated" => self.translate_permission(props),
            "permission.replied" => self.translate_permission_reply(props),
            "error" => {
                let scope = props.get("error").unwrap_or(props);
                vec![self.emit(EventPayload::Error(ErrorPayload {
                    code: extract_str(scope, "code").map(str::to_string),
                    message: extract_str_from_keys(scope, &["message", "error"])
                        .unwrap_or("unknown error")
                        .to_string(),
                    recoverable: false,
                }))]
            }
            "session.idle" => {
                self.finished = true;
                vec![self.emit(EventPayload::Done(DonePayload {
                    status: map_stop_reason(extract_str(props, "status")),
                    final_text: None,
                    usage: usage_from_value(props),
                    duration_ms: props
                        .get("duration_ms")
                        .and_then(Value::as_u64)
                        .unwrap_or(0),
                }))]
            }
            _ => Vec::new(),
        }
    }

    fn translate_part(&mut self, props: &Value) -> Vec<AgentEvent> {
        let Some(part) = props.get("part") else {
            return Vec::new();
        };
        match extract_str(part, "type") {
            Some("text") => {
                if let Some(delta) = extract_str(props, "delta") {
                    vec![self.emit(EventPayload::TextDelta(TextDeltaPayload {
                        delta: delta.to_string(),
                    }))]
                } else {
                    match extract_str(part, "text") {
                        Some(text) => vec![self.emit(EventPayload::Text(TextPayload {
                            text: text.to_string(),
                        }))],
                        None => Vec::new(),
                    }
                }
            }
            Some("tool") | Some("tool_call") | Some("tool_use") => {
                vec![self.emit(EventPayload::ToolUse(ToolUsePayload {
                    tool_name: extract_str_from_keys(part, &["tool", "name"])
                        .unwrap_or_default()
                        .to_string(),
                    tool_use_id: extract_str_from_keys(part, &["callID", "id"])
                        .unwrap_or_default()
                        .to_string(),
                    input: part
                        .get("args")
                        .or_else(|| part.get("input"))
                        .cloned()
                        .unwrap_or(Value::Null),
                    description: None,
                }))]
            }
            Some("thinking") | Some("reasoning") => match extract_str(part, "text") {
                Some(summary) => vec![self.emit(EventPayload::Thinking(ThinkingPayload {
                    summary: summary.to_string(),
                }))],
                None => Vec::new(),
            },
            Some("file") | Some("file_part") => vec![self.emit(EventPayload::Extension {
                kind: format!("{BACKEND_ID}:file_part"),
                payload: part.clone(),
            })],
            Some("image") | Some("image_part") => vec![self.emit(EventPayload::Extension {
                kind: format!("{BACKEND_ID}:image_part"),
                payload: part.clone(),
            })],
            _ => Vec::new(),
        }
    }

    fn translate_permission(&mut self, props: &Value) -> Vec<AgentEvent> {
        let id = extract_str_from_keys(props, &["id", "requestID", "permissionID"])
            .unwrap_or_default()
            .to_string();
        let tool_name = extract_str_from_keys(props, &["tool", "name"])
            .unwrap_or_default()
            .to_string();
        let reason = extract_str_from_keys(props, &["title", "reason"]).map(str::to_string);

        self.pending_permissions.insert(
            id.clone(),
            PendingPermission {
                tool_name: tool_name.clone(),
                reason: reason.clone(),
            },
        );

        vec![self.emit(EventPayload::PermissionRequest(PermissionRequestPayload {
            tool_name,
            tool_use_id: id,
            input: props
                .get("args")
                .or_else(|| props.get("metadata"))
                .cloned()
                .unwrap_or(Value::Null),
            reason,
        }))]
    }

    /// Only denied outcomes surface (as a denied `tool_result`); approvals
    /// stay off the canonical stream.
    fn translate_permission_reply(&mut self, props: &Value) -> Vec<AgentEvent> {
        let decision = extract_str_from_keys(props, &["response", "decision"]).unwrap_or_default();
        let id = extract_str_from_keys(props, &["permissionID", "requestID", "id"])
            .unwrap_or_default()
            .to_string();

        if !matches!(decision, "denied" | "rejected") {
            self.pending_permissions.remove(&id);
            return Vec::new();
        }

        let pending = self.pending_permissions.remove(&id);
        let tool_name = pending
            .as_ref()
            .map(|p| p.tool_name.clone())
            .or_else(|| extract_str(props, "tool").map(str::to_string))
            .unwrap_or_default();
        let output = pending
            .and_then(|p| p.reason)
            .map(Value::String)
            .unwrap_or(Value::Null);

        vec![self.emit(EventPayload::ToolResult(ToolResultPayload {
            tool_use_id: id,
            tool_name,
            status: ToolOutcome::Denied,
            output,
            duration_ms: None,
        }))]
    }

    pub(crate) fn server_exit_failure(&mut self, detail: &str) -> Vec<AgentEvent> {
        self.failure_pair(CODE_SERVER_EXIT, &format!("server {detail}"))
    }

    pub(crate) fn stream_failure(&mut self, message: &str) -> Vec<AgentEvent> {
        self.failure_pair(CODE_STREAM_ERROR, message)
    }

    pub(crate) fn missing_idle(&mut self) -> Vec<AgentEvent> {
        self.failure_pair(
            CODE_MISSING_SESSION_IDLE,
            "event stream ended without session.idle",
        )
    }

    pub(crate) fn exit_interrupted(&mut self, duration_ms: u64) -> Option<AgentEvent> {
        if self.finished {
            return None;
        }
        self.finished = true;
        Some(self.emit(EventPayload::Done(DonePayload {
            status: SessionStatus::Interrupted,
            final_text: None,
            usage: Default::default(),
            duration_ms,
        })))
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

fn event_session(props: &Value) -> Option<&str> {
    extract_str_from_keys(props, &["sessionID", "sessionId"])
        .or_else(|| {
            props
                .get("part")
                .and_then(|part| extract_str_from_keys(part, &["sessionID", "sessionId"]))
        })
        .or_else(|| {
            props
                .get("info")
                .and_then(|info| extract_str_from_keys(info, &["sessionID", "sessionId"]))
        })
}

// ─── Tests ────────────────────────────────────────────────────────────────
