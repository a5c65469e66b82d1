#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]
#![warn(rust_2018_idioms)]
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

//! Blocking-call detection for threads that must never block
//!
//! A thread declares itself non-blocking through a capability marker. When
//! such a thread reaches an operation classified as blocking, the engine walks
//! its call stack against a registry of allow and disallow hooks and raises
//! [`BlockingOperationError`] instead of letting the call stall the thread.
//!
//! # Features
//!
//! - **Stack classification**: nearest allowed hook wins, disallowed hooks
//!   make checks apply beneath them
//! - **Three interception paths**: explicit queries, guarded native entry
//!   points and breakpoints on non-native members
//! - **Fail-open**: host faults are counted and never reported as violations
//! - **In-process host**: shadow stacks, `#[frame]` and guarded std primitives
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use blockwatch::host::LocalRuntime;
//!
//! blockwatch::install_local()?;
//!
//! let err = LocalRuntime::global()
//!     .spawn_non_blocking("event-loop", || blockwatch::natives::sleep(Duration::from_millis(1)))?
//!     .join()
//!     .expect("event loop panicked")
//!     .unwrap_err();
//!
//! assert_eq!(err.to_string(), "Blocking call! std.thread.Thread.sleep");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

/// Engine builder and integration trait
pub mod builder;
/// Stack classification
pub mod classifier;
/// Engine configuration
pub mod config;
/// Interception targets
pub mod dispatch;
/// Detection engine
pub mod engine;
/// Fault and installation errors
pub mod error;
/// Hook registry
pub mod hooks;
/// Host instrumentation interface and in-process host
pub mod host;
/// Bundled integrations
pub mod integration;
/// Engine counters
pub mod metrics;
/// Guarded std primitives
pub mod natives;
/// Static policy surface
pub mod policy;
/// Violation reporting
pub mod report;
/// Thread classification
pub mod threads;

use std::sync::Arc;

// Public API exports
pub use builder::{Builder, Integration};
pub use classifier::{ScanStart, StackClassifier, Verdict};
pub use config::{GuardConfig, NON_BLOCKING_MARKER};
pub use dispatch::{Dispatcher, InterceptionTarget, NativeSubstitution};
pub use engine::Engine;
pub use error::{FaultResult, GuardError, InstrumentationFault};
pub use hooks::{HookRegistry, OperationHook};
pub use host::{
    HostListener, Instrumentation, LocalRuntime, MemberInfo, OperationId, ThreadHandle, ThreadInfo,
};
pub use metrics::{GuardMetrics, GuardMetricsSnapshot};
pub use policy::{MemberKind, MemberRef, Policy};
pub use report::{
    handler_fn, sanitize_type_name, BlockingMethod, BlockingOperationError, FailingHandler,
    LoggingHandler, PanicHandler, ViolationHandler,
};
pub use threads::{ThreadClassifier, ThreadPredicate};

#[cfg(feature = "macros")]
#[cfg_attr(docsrs, doc(cfg(feature = "macros")))]
pub use blockwatch_macros::frame;

/// New builder with the std policy and the failing handler
#[must_use]
pub fn builder() -> Builder {
    Builder::new()
}

/// Installs the process-wide engine on `host` with the default
/// integrations followed by `integrations`
///
/// # Errors
///
/// Returns [`GuardError::AlreadyInstalled`] if an engine is installed.
pub fn install<I>(
    host: Arc<dyn Instrumentation>,
    integrations: I,
) -> Result<Arc<Engine>, GuardError>
where
    I: IntoIterator<Item = Box<dyn Integration>>,
{
    let mut all = integration::defaults();
    all.extend(integrations);
    builder().with_integrations(all).install(host)
}

/// Installs the process-wide engine on [`LocalRuntime::global`]
///
/// # Errors
///
/// Returns [`GuardError::AlreadyInstalled`] if an engine is installed.
pub fn install_local() -> Result<Arc<Engine>, GuardError> {
    install(LocalRuntime::global(), Vec::new())
}

/// The process-wide engine, if installed
#[must_use]
pub fn installed() -> Option<&'static Arc<Engine>> {
    engine::GLOBAL.get()
}
