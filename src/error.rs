use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How a single work item failed. Item-level failures are values carried in
/// the outcome list, never errors propagated out of a dispatch call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    Transport,
    Parse,
    Unknown,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Timeout => write!(f, "timeout"),
            FailureKind::Transport => write!(f, "transport"),
            FailureKind::Parse => write!(f, "parse"),
            FailureKind::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ItemFailure {
    pub kind: FailureKind,
    pub detail: String,
}

impl ItemFailure {
    pub fn timeout(detail: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Timeout,
            detail: detail.into(),
        }
    }

    pub fn transport(detail: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transport,
            detail: detail.into(),
        }
    }

    pub fn parse(detail: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Parse,
            detail: detail.into(),
        }
    }

    pub fn unknown(detail: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Unknown,
            detail: detail.into(),
        }
    }
}

impl std::fmt::Display for ItemFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.detail)
    }
}

/// Run-level failures. Only these reach the top-level caller; everything
/// item- or pipeline-shaped is absorbed and annotated in the output instead.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("checkpoint unwritable: {0}")]
    CatastrophicWrite(String),

    #[error(transparent)]
    Session(#[from] SessionError),
}

#[derive(Debug, Error, PartialEq)]
pub enum SessionError {
    #[error("unknown or expired session")]
    NotFound,

    #[error("path {0} resolves outside the session workspace")]
    PathOutsideWorkspace(String),
}

#[derive(Debug, Error, PartialEq)]
pub enum DispatchError {
    #[error("concurrency limit must be at least 1")]
    InvalidLimit,
}
