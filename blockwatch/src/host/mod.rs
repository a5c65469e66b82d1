/*
 *     ______   __  __     __         ______     ______
 *    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
 *    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
 *     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
 *      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
 *
 * Author: Colin MacRitchie / Ripple Group
 */

//! Host instrumentation interface
//!
//! The engine never walks stacks or binds entry points itself. Everything it
//! needs from the runtime is expressed by the [`Instrumentation`] trait, and
//! the runtime reports lifecycle events back through [`HostListener`].
//!
//! # Capabilities consumed
//!
//! - Member enumeration and resolution for loaded types
//! - Per-thread capability sets (the "implemented interfaces" of a thread)
//! - Paged stack retrieval, innermost frame first
//! - Breakpoints at member entry
//! - Thread start and type load notifications
//!
//! [`LocalRuntime`] implements the interface for the current process using
//! shadow stacks maintained by frame guards.

use std::sync::Arc;

use crate::error::FaultResult;
use crate::report::BlockingOperationError;

pub mod local;

pub use local::{CapabilityGuard, FrameGuard, Instrumented, LocalRuntime};

/// Stable identifier of a member, issued by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(pub u64);

/// Identity of an execution thread, issued by the host
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ThreadHandle(pub u64);

/// Resolved member metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberInfo {
    /// Member identifier
    pub id: OperationId,
    /// Declaring type in the host's own encoding
    pub declaring_type: String,
    /// Member name
    pub name: String,
    /// Per-type member (no receiver)
    pub is_static: bool,
    /// Implemented by a native entry point
    pub is_native: bool,
}

/// One frame of a call stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackFrame {
    /// Operation executing in this frame
    pub operation: OperationId,
}

/// Thread metadata used for restriction checks
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadInfo {
    /// Thread identity
    pub handle: ThreadHandle,
    /// Thread name, if any
    pub name: Option<String>,
    /// Capability markers the thread declared at start
    pub capabilities: Vec<String>,
}

impl ThreadInfo {
    /// Returns true if the thread declares `marker`
    #[inline]
    #[must_use]
    pub fn has_capability(&self, marker: &str) -> bool {
        self.capabilities.iter().any(|c| c == marker)
    }
}

/// Runtime instrumentation consumed by the engine.
///
/// Implementations must be cheap on the read paths (`current_thread`,
/// `stack_frames`) since those run inline on every guarded call.
pub trait Instrumentation: Send + Sync {
    /// Returns the thread executing the caller
    fn current_thread(&self) -> ThreadHandle;

    /// Returns name and capability set of `thread`
    ///
    /// # Errors
    ///
    /// Returns a fault if the thread cannot be inspected.
    fn thread_info(&self, thread: ThreadHandle) -> FaultResult<ThreadInfo>;

    /// Returns up to `max_frames` frames of `thread` starting at
    /// `start_depth`, innermost first.
    ///
    /// A page shorter than `max_frames` means the stack is exhausted.
    ///
    /// # Errors
    ///
    /// Returns a fault if the stack cannot be retrieved.
    fn stack_frames(
        &self,
        thread: ThreadHandle,
        start_depth: usize,
        max_frames: usize,
    ) -> FaultResult<Vec<StackFrame>>;

    /// Returns all members of a loaded type
    ///
    /// # Errors
    ///
    /// Returns [`crate::InstrumentationFault::TypeNotLoaded`] if the type is
    /// not available yet.
    fn type_members(&self, type_name: &str) -> FaultResult<Vec<MemberInfo>>;

    /// Resolves metadata of an operation
    ///
    /// # Errors
    ///
    /// Returns a fault for unknown operations.
    fn member_info(&self, operation: OperationId) -> FaultResult<MemberInfo>;

    /// Resolves every overload named `member` on `type_name`
    ///
    /// # Errors
    ///
    /// Returns a fault if the type is not loaded.
    fn resolve(&self, type_name: &str, member: &str) -> FaultResult<Vec<OperationId>> {
        Ok(self
            .type_members(type_name)?
            .into_iter()
            .filter(|m| m.name == member)
            .map(|m| m.id)
            .collect())
    }

    /// Places a breakpoint at the entry of `operation`.
    ///
    /// When it is reached the frame of `operation` is already the innermost
    /// frame of the thread's stack.
    ///
    /// # Errors
    ///
    /// Returns a fault if the host rejects the breakpoint.
    fn set_breakpoint(&self, operation: OperationId) -> FaultResult<()>;

    /// Registers a listener for runtime events
    fn subscribe(&self, listener: Arc<dyn HostListener>);
}

/// Runtime events delivered by the host
pub trait HostListener: Send + Sync {
    /// A thread started
    fn on_thread_start(&self, _thread: ThreadHandle) {}

    /// True once the listener can no longer act on events
    fn is_detached(&self) -> bool {
        false
    }

    /// A type was loaded or gained members
    fn on_type_loaded(&self, _type_name: &str) {}

    /// A breakpoint placed by [`Instrumentation::set_breakpoint`] was reached
    ///
    /// # Errors
    ///
    /// Returns the violation to raise at the breakpoint location.
    fn on_breakpoint(
        &self,
        _thread: ThreadHandle,
        _operation: OperationId,
    ) -> Result<(), BlockingOperationError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_info_capability_lookup() {
        let info = ThreadInfo {
            handle: ThreadHandle(3),
            name: Some("worker".into()),
            capabilities: vec!["a::Marker".into(), "blockwatch::NonBlocking".into()],
        };

        assert!(info.has_capability("blockwatch::NonBlocking"));
        assert!(!info.has_capability("blockwatch::Other"));
    }
}
