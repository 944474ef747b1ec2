use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Failure categories surfaced to callers in error events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    RoutingUnavailable,
    CapabilityFailure,
    ToolFailure,
    ToolLoopExceeded,
    DelegationDepthExceeded,
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::RoutingUnavailable => "routing_unavailable",
            ErrorKind::CapabilityFailure => "capability_failure",
            ErrorKind::ToolFailure => "tool_failure",
            ErrorKind::ToolLoopExceeded => "tool_loop_exceeded",
            ErrorKind::DelegationDepthExceeded => "delegation_depth_exceeded",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum OrchestrationError {
    #[error("routing unavailable: {0}")]
    RoutingUnavailable(String),

    #[error("generation capability failed: {0}")]
    CapabilityFailure(#[from] GenerationError),

    #[error("tool '{tool}' failed: {source}")]
    ToolFailure {
        tool: String,
        #[source]
        source: ToolError,
    },

    #[error("tool loop exceeded {limit} calls without a final answer")]
    ToolLoopExceeded { limit: usize },

    #[error("delegation to '{target}' would exceed maximum depth {limit}")]
    DelegationDepthExceeded { target: String, limit: u32 },

    #[error("run cancelled")]
    Cancelled,
}

impl OrchestrationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestrationError::RoutingUnavailable(_) => ErrorKind::RoutingUnavailable,
            OrchestrationError::CapabilityFailure(_) => ErrorKind::CapabilityFailure,
            OrchestrationError::ToolFailure { .. } => ErrorKind::ToolFailure,
            OrchestrationError::ToolLoopExceeded { .. } => ErrorKind::ToolLoopExceeded,
            OrchestrationError::DelegationDepthExceeded { .. } => {
                ErrorKind::DelegationDepthExceeded
            }
            OrchestrationError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

/// Errors reported by a [`crate::llm::Generator`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GenerationError {
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("timed out after {0}s")]
    Timeout(u64),
}

/// Errors reported by a [`crate::tools::Tool`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ToolError {
    #[error("tool {0} not found")]
    NotFound(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("{0}")]
    Execution(String),

    #[error("timed out after {0}s")]
    Timeout(u64),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

#[derive(Debug, PartialEq, Error)]
pub enum ScenarioError {
    #[error("scenario '{scenario}' has no entry component '{entry}'")]
    UnknownEntry { scenario: String, entry: String },

    #[error("component '{0}' is defined twice")]
    DuplicateComponent(String),
}

/// A failed agent run, attributed to the agent where the failure started.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("agent '{origin}' failed: {error}")]
pub struct AgentFailure {
    pub origin: String,
    pub error: OrchestrationError,
}

impl AgentFailure {
    pub fn new(origin: impl Into<String>, error: OrchestrationError) -> Self {
        Self {
            origin: origin.into(),
            error,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        let err = OrchestrationError::ToolFailure {
            tool: "searchFlights".to_string(),
            source: ToolError::Timeout(30),
        };
        assert_eq!(err.kind(), ErrorKind::ToolFailure);
        assert_eq!(
            err.to_string(),
            "tool 'searchFlights' failed: timed out after 30s"
        );

        let err: OrchestrationError = GenerationError::Unavailable("503".into()).into();
        assert_eq!(err.kind(), ErrorKind::CapabilityFailure);
    }

    #[test]
    fn test_kind_serializes_camel_case() {
        let json = serde_json::to_string(&ErrorKind::DelegationDepthExceeded).unwrap();
        assert_eq!(json, "\"delegationDepthExceeded\"");
        assert_eq!(ErrorKind::ToolLoopExceeded.to_string(), "tool_loop_exceeded");
    }
}
