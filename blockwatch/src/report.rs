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

//! Violation reporting
//!
//! A violation is described by a [`BlockingMethod`] and handed to the
//! configured [`ViolationHandler`]. The default handler turns it into a
//! [`BlockingOperationError`] that propagates out of the guarded call.

use std::fmt;
use std::io;
use std::sync::Arc;

#[cfg(feature = "tracing")]
use tracing::warn;

use crate::host::{Instrumentation, MemberInfo, OperationId};
use crate::metrics::GuardMetrics;

/// A blocking call detected in a restricted context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockingMethod {
    operation: OperationId,
    class_name: String,
    name: String,
    is_static: bool,
}

impl BlockingMethod {
    /// Creates a description from already sanitized parts
    #[must_use]
    pub fn new(
        operation: OperationId,
        class_name: impl Into<String>,
        name: impl Into<String>,
        is_static: bool,
    ) -> Self {
        Self {
            operation,
            class_name: class_name.into(),
            name: name.into(),
            is_static,
        }
    }

    /// Builds a description from host metadata
    #[must_use]
    pub fn from_member(member: &MemberInfo) -> Self {
        Self::new(
            member.id,
            sanitize_type_name(&member.declaring_type),
            member.name.clone(),
            member.is_static,
        )
    }

    /// Operation that was called
    #[must_use]
    pub fn operation(&self) -> OperationId {
        self.operation
    }

    /// Dotted declaring type, e.g. `std.thread.Thread`
    #[must_use]
    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    /// Member name, e.g. `sleep`
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Per-type member
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.is_static
    }
}

impl fmt::Display for BlockingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let separator = if self.is_static { '.' } else { '#' };
        write!(f, "{}{}{}", self.class_name, separator, self.name)
    }
}

/// Raised when a restricted thread performs a blocking call
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Blocking call! {method}")]
pub struct BlockingOperationError {
    method: BlockingMethod,
}

impl BlockingOperationError {
    /// Wraps a detected blocking method
    #[must_use]
    pub fn new(method: BlockingMethod) -> Self {
        Self { method }
    }

    /// The offending method
    #[must_use]
    pub fn method(&self) -> &BlockingMethod {
        &self.method
    }
}

impl From<BlockingOperationError> for io::Error {
    fn from(err: BlockingOperationError) -> Self {
        io::Error::other(err)
    }
}

/// Converts a host type name to dotted form.
///
/// Accepts descriptor encoding (`Ljava/lang/Thread;`), slash-separated
/// internal names and `::` paths.
#[must_use]
pub fn sanitize_type_name(raw: &str) -> String {
    let trimmed = raw
        .strip_prefix('L')
        .and_then(|rest| rest.strip_suffix(';'))
        .unwrap_or(raw);
    trimmed.replace("::", ".").replace('/', ".")
}

/// Decides what happens once a violation is detected.
///
/// Returning `Ok` lets the blocking call proceed.
pub trait ViolationHandler: Send + Sync {
    /// Called synchronously on the offending thread
    ///
    /// # Errors
    ///
    /// Returns the error to propagate to the caller of the blocking call.
    fn on_blocking_method(&self, method: &BlockingMethod) -> Result<(), BlockingOperationError>;
}

/// Default handler: every violation becomes an error.
#[derive(Debug, Default, Clone, Copy)]
pub struct FailingHandler;

impl ViolationHandler for FailingHandler {
    #[inline]
    fn on_blocking_method(&self, method: &BlockingMethod) -> Result<(), BlockingOperationError> {
        Err(BlockingOperationError::new(method.clone()))
    }
}

/// Logs the violation and lets the call proceed
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHandler;

impl ViolationHandler for LoggingHandler {
    fn on_blocking_method(&self, method: &BlockingMethod) -> Result<(), BlockingOperationError> {
        #[cfg(feature = "tracing")]
        warn!(method = %method, "Blocking call detected on a non-blocking thread");

        #[cfg(not(feature = "tracing"))]
        let _ = method;

        Ok(())
    }
}

/// Panics on the offending thread
#[derive(Debug, Default, Clone, Copy)]
pub struct PanicHandler;

impl ViolationHandler for PanicHandler {
    fn on_blocking_method(&self, method: &BlockingMethod) -> Result<(), BlockingOperationError> {
        panic!("{}", BlockingOperationError::new(method.clone()));
    }
}

/// Handler backed by a closure, see [`handler_fn`]
pub struct FnHandler<F> {
    f: F,
}

impl<F> fmt::Debug for FnHandler<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnHandler").finish_non_exhaustive()
    }
}

impl<F> ViolationHandler for FnHandler<F>
where
    F: Fn(&BlockingMethod) -> Result<(), BlockingOperationError> + Send + Sync,
{
    fn on_blocking_method(&self, method: &BlockingMethod) -> Result<(), BlockingOperationError> {
        (self.f)(method)
    }
}

/// Wraps a closure as a [`ViolationHandler`]
pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: Fn(&BlockingMethod) -> Result<(), BlockingOperationError> + Send + Sync,
{
    FnHandler { f }
}

/// Builds violations and passes them to the handler
pub struct ViolationReporter {
    handler: Arc<dyn ViolationHandler>,
    metrics: Arc<GuardMetrics>,
}

impl fmt::Debug for ViolationReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViolationReporter").finish_non_exhaustive()
    }
}

impl ViolationReporter {
    /// Creates a reporter
    #[must_use]
    pub fn new(handler: Arc<dyn ViolationHandler>, metrics: Arc<GuardMetrics>) -> Self {
        Self { handler, metrics }
    }

    /// Reports a violation for `operation`.
    ///
    /// An operation the host can no longer describe is still reported, under
    /// a placeholder name.
    ///
    /// # Errors
    ///
    /// Returns whatever the handler decides, [`BlockingOperationError`] for
    /// the default handler.
    pub fn report(
        &self,
        host: &dyn Instrumentation,
        operation: OperationId,
    ) -> Result<(), BlockingOperationError> {
        let method = match host.member_info(operation) {
            Ok(member) => BlockingMethod::from_member(&member),
            Err(fault) => {
                self.metrics.record_fault(&fault);
                BlockingMethod::new(
                    operation,
                    "<unresolved>",
                    format!("operation-{}", operation.0),
                    false,
                )
            }
        };
        self.report_method(&method)
    }

    /// Reports an already described violation
    ///
    /// # Errors
    ///
    /// Returns whatever the handler decides.
    pub fn report_method(&self, method: &BlockingMethod) -> Result<(), BlockingOperationError> {
        self.metrics.record_violation();
        self.handler.on_blocking_method(method)
    }
}
