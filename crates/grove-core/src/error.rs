use std::fmt;

use crate::op::NodeId;

/// Machine-readable error codes for callers that branch on failure kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    InvalidOp,
    RootMutation,
    CycleDetected,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::InvalidOp => "E1001",
            Self::RootMutation => "E1002",
            Self::CycleDetected => "E2001",
        }
    }

    /// Short human-facing summary for logs.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::InvalidOp => "Malformed operation",
            Self::RootMutation => "Operation targets the root node",
            Self::CycleDetected => "Cycle in candidate parent chain",
        }
    }

    /// Optional remediation hint.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::InvalidOp => Some("Fill entity_id, field_key, and peer_id before applying."),
            Self::RootMutation => Some("The root has no parent; pick a different child node."),
            // Non-fatal: materialization reattaches cycle members under root.
            Self::CycleDetected => None,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Reason an operation was rejected at the `apply` boundary.
///
/// Rejection never mutates state. Cycle detection is deliberately absent
/// here: cycles in the edge set are expected under concurrency and are
/// resolved by materialization, not reported to the writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpError {
    /// The operation is missing a required field.
    InvalidOp(String),
    /// The operation names the root as its entity (the root cannot be moved
    /// or deleted).
    RootMutation(NodeId),
}

impl OpError {
    /// The machine-readable code for this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidOp(_) => ErrorCode::InvalidOp,
            Self::RootMutation(_) => ErrorCode::RootMutation,
        }
    }
}

impl fmt::Display for OpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidOp(reason) => {
                write!(f, "{}: {reason}", self.code())
            }
            Self::RootMutation(field) => {
                write!(
                    f,
                    "{}: root cannot be the entity of an operation (field {field})",
                    self.code()
                )
            }
        }
    }
}

impl std::error::Error for OpError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn all_codes_are_unique() {
        let all = [
            ErrorCode::InvalidOp,
            ErrorCode::RootMutation,
            ErrorCode::CycleDetected,
        ];

        let mut seen = HashSet::new();
        for code in all {
            assert!(seen.insert(code.code()), "duplicate code {}", code.code());
        }
    }

    #[test]
    fn code_format_is_machine_friendly() {
        let code = OpError::InvalidOp("empty peer_id".to_string()).code().code();
        assert_eq!(code.len(), 5);
        assert!(code.starts_with('E'));
        assert!(code.chars().skip(1).all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn display_includes_code_and_reason() {
        let err = OpError::InvalidOp("empty entity_id".to_string());
        let text = err.to_string();
        assert!(text.contains("E1001"));
        assert!(text.contains("empty entity_id"));
    }
}
