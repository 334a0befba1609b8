//! Generation task lifecycle vocabulary.
//!
//! ```text
//! submitting ──> pending ──> completed
//!     │             │
//!     │             └──────> failed
//!     ├────────────────────> failed
//!     └────────────────────> completed   (synchronous providers only)
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Providers
// ---------------------------------------------------------------------------

/// External generation service a task is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "&'static str", try_from = "String")]
pub enum Provider {
    /// Kling video API (per-request signed JWT).
    Kling,
    /// Suno music API (static bearer key, supports callbacks).
    Suno,
    /// fal.ai queue API used for 3D conversion (static bearer key).
    Fal,
    /// Comet OpenAI-compatible image API (static bearer key, synchronous).
    Comet,
}

impl Provider {
    pub const ALL: [Provider; 4] = [Provider::Kling, Provider::Suno, Provider::Fal, Provider::Comet];

    pub fn as_str(self) -> &'static str {
        match self {
            Provider::Kling => "kling",
            Provider::Suno => "suno",
            Provider::Fal => "fal",
            Provider::Comet => "comet",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Provider::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| CoreError::Validation(format!("Unknown provider '{s}'")))
    }
}

impl TryFrom<String> for Provider {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Provider> for &'static str {
    fn from(provider: Provider) -> Self {
        provider.as_str()
    }
}

/// How an adapter authenticates outbound requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStyle {
    /// A configured key sent unchanged for the process lifetime.
    StaticBearer,
    /// A short-lived HMAC-signed token minted for each request.
    SignedToken,
}

// ---------------------------------------------------------------------------
// Task state
// ---------------------------------------------------------------------------

/// Lifecycle state of a generation task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "&'static str", try_from = "String")]
pub enum TaskState {
    Submitting,
    Pending,
    Completed,
    Failed,
}

impl TaskState {
    pub const ALL: [TaskState; 4] = [
        TaskState::Submitting,
        TaskState::Pending,
        TaskState::Completed,
        TaskState::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Submitting => "submitting",
            TaskState::Pending => "pending",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }

    /// Whether `self -> next` is an edge of the lifecycle graph.
    pub fn can_transition_to(self, next: TaskState) -> bool {
        matches!(
            (self, next),
            (TaskState::Submitting, TaskState::Pending)
                | (TaskState::Submitting, TaskState::Completed)
                | (TaskState::Submitting, TaskState::Failed)
                | (TaskState::Pending, TaskState::Completed)
                | (TaskState::Pending, TaskState::Failed)
        )
    }

    /// Validate a transition, producing [`CoreError::InvalidTransition`]
    /// when the edge does not exist.
    pub fn check_transition(self, task_id: &str, next: TaskState) -> Result<(), CoreError> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(CoreError::InvalidTransition {
                task_id: task_id.to_string(),
                from: self.as_str(),
                to: next.as_str(),
            })
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| CoreError::Internal(format!("Unknown task state '{s}'")))
    }
}

impl TryFrom<String> for TaskState {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TaskState> for &'static str {
    fn from(state: TaskState) -> Self {
        state.as_str()
    }
}

// ---------------------------------------------------------------------------
// Failure reasons
// ---------------------------------------------------------------------------

/// Why a task ended in [`TaskState::Failed`].
///
/// Persisted as a stable `code` plus a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The provider permanently refused the submission.
    ProviderRejected(String),
    /// Submission kept failing transiently until the retry budget ran out.
    ProviderUnavailable(String),
    /// The provider reported the job as failed.
    ProviderFailed(String),
    /// The provider reported success with a result we could not decode.
    MalformedResult(String),
    /// The task did not resolve within the provider's polling budget.
    Timeout,
    /// The process stopped while the submission outcome was unknown.
    Interrupted,
}

pub const FAILURE_PROVIDER_REJECTED: &str = "provider_rejected";
pub const FAILURE_PROVIDER_UNAVAILABLE: &str = "provider_unavailable";
pub const FAILURE_PROVIDER_FAILED: &str = "provider_failed";
pub const FAILURE_MALFORMED_RESULT: &str = "malformed_result";
pub const FAILURE_TIMEOUT: &str = "timeout";
pub const FAILURE_INTERRUPTED: &str = "interrupted";

impl FailureReason {
    /// Stable machine-readable code stored alongside the task.
    pub fn code(&self) -> &'static str {
        match self {
            FailureReason::ProviderRejected(_) => FAILURE_PROVIDER_REJECTED,
            FailureReason::ProviderUnavailable(_) => FAILURE_PROVIDER_UNAVAILABLE,
            FailureReason::ProviderFailed(_) => FAILURE_PROVIDER_FAILED,
            FailureReason::MalformedResult(_) => FAILURE_MALFORMED_RESULT,
            FailureReason::Timeout => FAILURE_TIMEOUT,
            FailureReason::Interrupted => FAILURE_INTERRUPTED,
        }
    }

    pub fn message(&self) -> String {
        match self {
            FailureReason::ProviderRejected(msg)
            | FailureReason::ProviderUnavailable(msg)
            | FailureReason::ProviderFailed(msg)
            | FailureReason::MalformedResult(msg) => msg.clone(),
            FailureReason::Timeout => "Task did not resolve within its polling budget".into(),
            FailureReason::Interrupted => {
                "Service restarted before the provider confirmed the submission".into()
            }
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code(), self.message())
    }
}
