// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Error taxonomy shared by the coordinator, agents and panel clients.

use crate::models::ContextId;
use serde::{Deserialize, Serialize};

/// Wire-level error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    ValidationError,
    NotFound,
    AgentUnreachable,
    QuotaExceeded,
    Unavailable,
    UnsupportedCommand,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "ValidationError",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::AgentUnreachable => "AgentUnreachable",
            ErrorKind::QuotaExceeded => "QuotaExceeded",
            ErrorKind::Unavailable => "Unavailable",
            ErrorKind::UnsupportedCommand => "UnsupportedCommand",
            ErrorKind::Internal => "Internal",
        }
    }

    /// Storage-tier failures are reported as warnings; the in-memory state
    /// stays correct.
    pub fn is_degraded(&self) -> bool {
        matches!(self, ErrorKind::QuotaExceeded | ErrorKind::Unavailable)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error body carried in a response envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

/// Error types for coordinator operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TabmixError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Agent unreachable for context {0}")]
    AgentUnreachable(ContextId),
    #[error("Storage quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
    #[error("Unsupported command: {0}")]
    UnsupportedCommand(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TabmixError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TabmixError::Validation(_) => ErrorKind::ValidationError,
            TabmixError::NotFound(_) => ErrorKind::NotFound,
            TabmixError::AgentUnreachable(_) => ErrorKind::AgentUnreachable,
            TabmixError::QuotaExceeded(_) => ErrorKind::QuotaExceeded,
            TabmixError::Unavailable(_) => ErrorKind::Unavailable,
            TabmixError::UnsupportedCommand(_) => ErrorKind::UnsupportedCommand,
            TabmixError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            kind: self.kind(),
            message: self.to_string(),
        }
    }

    /// Rebuild an error from a wire body (used by clients).
    pub fn from_body(body: &ErrorBody) -> Self {
        let message = body.message.clone();
        match body.kind {
            ErrorKind::ValidationError => TabmixError::Validation(message),
            ErrorKind::NotFound => TabmixError::NotFound(message),
            ErrorKind::AgentUnreachable => message
                .rsplit(' ')
                .next()
                .and_then(|id| id.parse().ok())
                .map(TabmixError::AgentUnreachable)
                .unwrap_or(TabmixError::Internal(message)),
            ErrorKind::QuotaExceeded => TabmixError::QuotaExceeded(message),
            ErrorKind::Unavailable => TabmixError::Unavailable(message),
            ErrorKind::UnsupportedCommand => TabmixError::UnsupportedCommand(message),
            ErrorKind::Internal => TabmixError::Internal(message),
        }
    }
}
