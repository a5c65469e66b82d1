#![forbid(unsafe_code)]

/*
 *     ______   __  __     __         ______     ______
 *    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
 *    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
 *     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
 *      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
 *
 * Author: Colin MacRitchie / Ripple Group
 */

//! Error types shared across the engine
//!
//! Violations themselves live in [`crate::report`]; this module holds the
//! failures of the host collaborator and of installation.

use crate::host::{OperationId, ThreadHandle};

/// Result type for host instrumentation calls
pub type FaultResult<T> = Result<T, InstrumentationFault>;

/// Failure of the host instrumentation to provide requested data.
///
/// Faults are never surfaced as violations. The engine counts them and
/// resolves the affected check to `Permitted`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InstrumentationFault {
    /// Stack trace could not be retrieved
    #[error("Stack trace unavailable for thread {0:?}")]
    StackUnavailable(ThreadHandle),

    /// The host cannot inspect the requested thread from the calling thread
    #[error("Thread {0:?} is not accessible from the current thread")]
    ThreadNotAccessible(ThreadHandle),

    /// Type is not loaded yet, its members cannot be resolved
    #[error("Type not loaded: {0}")]
    TypeNotLoaded(String),

    /// Operation identifier is unknown to the host
    #[error("Unknown operation: {0:?}")]
    UnknownOperation(OperationId),

    /// Member name does not exist on a loaded type
    #[error("Unknown member {member} on {declaring_type}")]
    UnknownMember {
        /// Declaring type
        declaring_type: String,
        /// Member name
        member: String,
    },

    /// An entry point was bound with a different function signature
    #[error("Entry point for {0:?} was bound with a different signature")]
    SignatureMismatch(OperationId),

    /// Host refused to place a breakpoint
    #[error("Breakpoint rejected for {0:?}")]
    BreakpointRejected(OperationId),
}

impl InstrumentationFault {
    /// Short label used for metrics and logs
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StackUnavailable(_) => "stack_unavailable",
            Self::ThreadNotAccessible(_) => "thread_not_accessible",
            Self::TypeNotLoaded(_) => "type_not_loaded",
            Self::UnknownOperation(_) => "unknown_operation",
            Self::UnknownMember { .. } => "unknown_member",
            Self::SignatureMismatch(_) => "signature_mismatch",
            Self::BreakpointRejected(_) => "breakpoint_rejected",
        }
    }
}

/// Errors raised while building or installing the engine
#[derive(Debug, thiserror::Error)]
pub enum GuardError {
    /// A global engine is already installed
    #[error("An engine is already installed")]
    AlreadyInstalled,

    /// Configuration rejected by [`crate::config::GuardConfig::validate`]
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Host failed during installation
    #[error("Instrumentation failed: {0}")]
    Instrumentation(#[from] InstrumentationFault),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_kind_labels() {
        assert_eq!(
            InstrumentationFault::StackUnavailable(ThreadHandle(1)).kind(),
            "stack_unavailable"
        );
        assert_eq!(
            InstrumentationFault::TypeNotLoaded("a::B".into()).kind(),
            "type_not_loaded"
        );
    }

    #[test]
    fn test_guard_error_wraps_fault() {
        let err: GuardError = InstrumentationFault::UnknownOperation(OperationId(7)).into();
        assert!(err.to_string().contains("Unknown operation"));
    }
}
