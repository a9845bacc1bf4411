use std::path::PathBuf;

use tokio_util::sync::CancellationToken;

/// What a backend may do with one capability without asking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CapabilityDecision {
    Allow,
    #[default]
    Ask,
    Deny,
}

impl CapabilityDecision {
    pub const fn as_str(self) -> &'static str {
        match self {
            CapabilityDecision::Allow => "allow",
            CapabilityDecision::Ask => "ask",
            CapabilityDecision::Deny => "deny",
        }
    }
}

/// The {fileWrite, shellExecute, networkAccess} triple controlling what a
/// backend may autonomously do. Absent capabilities default to `Ask`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CapabilityPolicy {
    pub file_write: CapabilityDecision,
    pub shell_execute: CapabilityDecision,
    pub network_access: CapabilityDecision,
}

impl CapabilityPolicy {
    pub fn allow_all() -> Self {
        Self {
            file_write: CapabilityDecision::Allow,
            shell_execute: CapabilityDecision::Allow,
            network_access: CapabilityDecision::Allow,
        }
    }

    fn decisions(self) -> [CapabilityDecision; 3] {
        [self.file_write, self.shell_execute, self.network_access]
    }

    pub fn all_allow(self) -> bool {
        self.decisions()
            .iter()
            .all(|d| *d == CapabilityDecision::Allow)
    }

    pub fn any_ask(self) -> bool {
        self.decisions()
            .iter()
            .any(|d| *d == CapabilityDecision::Ask)
    }

    pub fn any_deny(self) -> bool {
        self.decisions()
            .iter()
            .any(|d| *d == CapabilityDecision::Deny)
    }
}

/// Options for one adapter run. All fields are optional; `Default` is a
/// fresh, never-cancelled run with an all-`Ask` policy.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Working directory for the backend (default: inherit).
    pub cwd: Option<PathBuf>,
    pub model: Option<String>,
    pub permissions: CapabilityPolicy,
    pub max_turns: Option<u32>,
    pub max_budget_usd: Option<f64>,
    /// Opaque resume token from a previous run of the same backend.
    pub resume: Option<String>,
    /// One-shot cancellation signal; tripping it requests prompt termination.
    pub cancel: CancellationToken,
    /// Tool names auto-approved without prompting.
    pub allowed_tools: Vec<String>,
    /// Tool names that are never executed.
    pub disallowed_tools: Vec<String>,
}
