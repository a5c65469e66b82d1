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

//! Detection engine
//!
//! Owns the hook registry, both classifiers, the dispatcher and the reporter,
//! and reacts to host events. Every check runs inline on the calling thread.
//!
//! ```no_run
//! use blockwatch::host::LocalRuntime;
//!
//! let engine = blockwatch::builder()
//!     .allow_blocking_calls_inside("app::Cache", "refresh")
//!     .build(LocalRuntime::global())?;
//!
//! if engine.is_blocking_context() {
//!     // running on a restricted thread, no allowance on the stack
//! }
//! # Ok::<(), blockwatch::GuardError>(())
//! ```

use std::cell::Cell;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock, Weak};

use dashmap::DashMap;

#[cfg(feature = "tracing")]
use tracing::{debug, trace};

use crate::classifier::{ScanStart, StackClassifier, Verdict};
use crate::config::GuardConfig;
use crate::dispatch::{Dispatcher, NativeBinding};
use crate::error::{FaultResult, GuardError, InstrumentationFault};
use crate::hooks::{HookRegistry, OperationHook};
use crate::host::{HostListener, Instrumentation, MemberInfo, OperationId, ThreadHandle};
use crate::metrics::GuardMetrics;
use crate::policy::{MemberRef, Policy};
use crate::report::{BlockingMethod, BlockingOperationError, ViolationHandler, ViolationReporter};
use crate::threads::{ThreadClassifier, ThreadPredicate};

/// Process-wide engine, set once by [`crate::Builder::install`]
pub(crate) static GLOBAL: OnceLock<Arc<Engine>> = OnceLock::new();

thread_local! {
    static IN_CHECK: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as inside a check until dropped.
struct CheckScope;

impl CheckScope {
    /// Returns `None` if the thread is already inside a check
    fn enter() -> Option<Self> {
        IN_CHECK.with(|flag| {
            if flag.get() {
                None
            } else {
                flag.set(true);
                Some(Self)
            }
        })
    }
}

impl Drop for CheckScope {
    fn drop(&mut self) {
        IN_CHECK.with(|flag| flag.set(false));
    }
}

/// Blocking-call detection engine
pub struct Engine {
    host: Arc<dyn Instrumentation>,
    config: GuardConfig,
    policy: Policy,
    hooks: HookRegistry,
    /// Hook requests by type name, kept after resolution
    requested_hooks: DashMap<String, BTreeMap<String, bool>>,
    threads: ThreadClassifier,
    stacks: StackClassifier,
    dispatcher: Dispatcher,
    native_ids: DashMap<(&'static str, &'static str), OperationId>,
    reporter: ViolationReporter,
    metrics: Arc<GuardMetrics>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("hooks", &self.hooks.len())
            .field("targets", &self.dispatcher.len())
            .field("threads", &self.threads)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Wires an engine to `host`.
    ///
    /// Subscribes to host events before resolving the policy, so types that
    /// load concurrently are not missed.
    pub(crate) fn new(
        host: Arc<dyn Instrumentation>,
        config: GuardConfig,
        policy: Policy,
        handler: Arc<dyn ViolationHandler>,
        non_blocking: ThreadPredicate,
        dynamic: Option<ThreadPredicate>,
    ) -> Result<Arc<Self>, GuardError> {
        config.validate()?;

        let metrics = Arc::new(GuardMetrics::new());
        let requested_hooks: DashMap<String, BTreeMap<String, bool>> = DashMap::new();
        for (declaring_type, member, allowed) in policy.allowances() {
            requested_hooks
                .entry(declaring_type.to_string())
                .or_default()
                .insert(member.to_string(), allowed);
        }

        let engine = Arc::new(Self {
            threads: ThreadClassifier::new(non_blocking, dynamic, Arc::clone(&metrics)),
            stacks: StackClassifier::new(&config, Arc::clone(&metrics)),
            dispatcher: Dispatcher::new(Arc::clone(&metrics)),
            reporter: ViolationReporter::new(handler, Arc::clone(&metrics)),
            hooks: HookRegistry::new(),
            native_ids: DashMap::new(),
            requested_hooks,
            host,
            config,
            policy,
            metrics,
        });

        engine.host.subscribe(Arc::new(EngineListener {
            engine: Arc::downgrade(&engine),
        }));

        let mut types: Vec<String> = engine
            .requested_hooks
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        types.extend(engine.policy.blocking_types().map(str::to_string));
        types.sort();
        types.dedup();

        for type_name in &types {
            engine.resolve_type(type_name);
        }

        #[cfg(feature = "tracing")]
        debug!(
            hooks = engine.hooks.len(),
            targets = engine.dispatcher.len(),
            "Blocking-call detection engine ready"
        );

        Ok(engine)
    }

    /// Host the engine is attached to
    #[must_use]
    pub fn host(&self) -> &Arc<dyn Instrumentation> {
        &self.host
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    /// Static policy the engine was built with
    #[must_use]
    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Resolved hooks
    #[must_use]
    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    /// Thread restriction cache
    #[must_use]
    pub fn threads(&self) -> &ThreadClassifier {
        &self.threads
    }

    /// Interception targets
    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Engine counters
    #[must_use]
    pub fn metrics(&self) -> &GuardMetrics {
        &self.metrics
    }

    /// Hooks every overload of `member` on `declaring_type`.
    ///
    /// The request is kept, so a type that is not loaded yet, or that gains
    /// members later, is hooked when the host reports the load. Returns the
    /// number of operations hooked now.
    pub fn register_hook(&self, declaring_type: &str, member: &str, allowed: bool) -> usize {
        self.requested_hooks
            .entry(declaring_type.to_string())
            .or_default()
            .insert(member.to_string(), allowed);

        match self.host.resolve(declaring_type, member) {
            Ok(operations) => {
                for &operation in &operations {
                    self.hooks.register_hook(
                        operation,
                        OperationHook::new(declaring_type, member, allowed),
                    );
                }
                operations.len()
            }
            Err(InstrumentationFault::TypeNotLoaded(_)) => 0,
            Err(fault) => {
                self.metrics.record_fault(&fault);
                0
            }
        }
    }

    /// Applies every hook request and blocking entry of `type_name` to the
    /// members the host currently reports for it.
    pub fn resolve_type(&self, type_name: &str) {
        let requested = self
            .requested_hooks
            .get(type_name)
            .map(|entry| entry.value().clone());
        let blocking = self.policy.blocking_members(type_name);

        if requested.is_none() && blocking.is_none() {
            return;
        }

        let members = match self.host.type_members(type_name) {
            Ok(members) => members,
            Err(InstrumentationFault::TypeNotLoaded(_)) => return,
            Err(fault) => {
                self.metrics.record_fault(&fault);
                return;
            }
        };

        for member in &members {
            if let Some(&allowed) = requested.as_ref().and_then(|r| r.get(&member.name)) {
                self.hooks
                    .register_hook(member.id, OperationHook::new(type_name, &member.name, allowed));
            }

            let is_blocking = blocking.is_some_and(|b| b.contains(&member.name));
            if is_blocking && !member.is_native {
                self.install_breakpoint(member);
            }
        }
    }

    fn install_breakpoint(&self, member: &MemberInfo) {
        match self.dispatcher.install_breakpoint(self.host.as_ref(), member) {
            Ok(true) => {
                #[cfg(feature = "tracing")]
                trace!(operation = member.id.0, member = %member.name, "Breakpoint installed");
            }
            Ok(false) => {}
            Err(fault) => self.metrics.record_fault(&fault),
        }
    }

    /// Verdict for `thread` at its current stack
    pub fn classify(&self, thread: ThreadHandle) -> Verdict {
        self.stacks
            .classify(self.host.as_ref(), &self.hooks, &self.threads, thread)
    }

    /// Returns true if the current thread is restricted and a disallowed hook,
    /// with no allowed hook inside it, is on the stack.
    ///
    /// Always false while the thread is already inside a check.
    pub fn is_blocking_context(&self) -> bool {
        let Some(_scope) = CheckScope::enter() else {
            return false;
        };
        self.classify(self.host.current_thread()).is_violating()
    }

    /// Checks a call to the blocking `operation` made by the current thread.
    ///
    /// # Errors
    ///
    /// Returns the violation raised by the handler.
    pub fn check_blocking(&self, operation: OperationId) -> Result<(), BlockingOperationError> {
        let Some(_scope) = CheckScope::enter() else {
            return Ok(());
        };
        self.check_in_scope(self.host.current_thread(), operation, ScanStart::BLOCKING_CALL)
    }

    fn check_in_scope(
        &self,
        thread: ThreadHandle,
        operation: OperationId,
        start: ScanStart,
    ) -> Result<(), BlockingOperationError> {
        let verdict =
            self.stacks
                .classify_from(self.host.as_ref(), &self.hooks, &self.threads, thread, start);
        if !verdict.is_violating() {
            return Ok(());
        }

        match self.dispatcher.member(operation) {
            Some(member) => self.reporter.report_method(&BlockingMethod::from_member(&member)),
            None => self.reporter.report(self.host.as_ref(), operation),
        }
    }

    /// Trampoline for a native entry point.
    ///
    /// Returns the entry point to call: the original captured on the first
    /// bind of `member`. A guarded member is classified first; if the call
    /// violates and the handler raises, the original is not returned.
    ///
    /// Host faults fail open by returning `original` unchanged.
    ///
    /// # Errors
    ///
    /// Returns the violation raised by the handler.
    pub fn enter_native<F>(
        &self,
        member: &MemberRef,
        original: F,
    ) -> Result<F, BlockingOperationError>
    where
        F: Copy + Send + Sync + 'static,
    {
        let (operation, binding) = match self.native_binding(member, original) {
            Ok(bound) => bound,
            Err(fault) => {
                self.metrics.record_fault(&fault);
                return Ok(original);
            }
        };

        if !binding.guarded {
            return Ok(binding.original);
        }

        let Some(_scope) = CheckScope::enter() else {
            return Ok(binding.original);
        };
        self.check_in_scope(self.host.current_thread(), operation, ScanStart::BLOCKING_CALL)?;
        Ok(binding.original)
    }

    fn native_binding<F>(
        &self,
        member: &MemberRef,
        original: F,
    ) -> FaultResult<(OperationId, NativeBinding<F>)>
    where
        F: Copy + Send + Sync + 'static,
    {
        let key = (member.declaring_type, member.name);
        if let Some(operation) = self.native_ids.get(&key).map(|entry| *entry.value()) {
            return Ok((operation, self.dispatcher.native(operation)?));
        }

        let info = self
            .host
            .type_members(member.declaring_type)?
            .into_iter()
            .find(|m| m.name == member.name)
            .ok_or_else(|| InstrumentationFault::UnknownMember {
                declaring_type: member.declaring_type.to_string(),
                member: member.name.to_string(),
            })?;

        let guarded = self.policy.is_blocking(member.declaring_type, member.name);
        let binding = self.dispatcher.bind_native(&info, guarded, original)?;
        self.native_ids.insert(key, info.id);
        Ok((info.id, binding))
    }

    fn on_breakpoint(
        &self,
        thread: ThreadHandle,
        operation: OperationId,
    ) -> Result<(), BlockingOperationError> {
        if !self.dispatcher.is_breakpoint(operation) {
            return Ok(());
        }
        self.metrics.record_breakpoint_hit();

        let Some(_scope) = CheckScope::enter() else {
            return Ok(());
        };
        self.check_in_scope(thread, operation, ScanStart::BREAKPOINT)
    }
}

/// Forwards host events to an engine without keeping it alive
struct EngineListener {
    engine: Weak<Engine>,
}

impl HostListener for EngineListener {
    fn on_thread_start(&self, thread: ThreadHandle) {
        let Some(engine) = self.engine.upgrade() else {
            return;
        };

        // Declared capabilities may change the verdict
        let _forgotten = engine.threads.forget(thread);

        #[cfg(feature = "tracing")]
        trace!(thread = thread.0, reclassify = _forgotten, "Thread declared");
    }

    fn is_detached(&self) -> bool {
        self.engine.strong_count() == 0
    }

    fn on_type_loaded(&self, type_name: &str) {
        if let Some(engine) = self.engine.upgrade() {
            engine.resolve_type(type_name);
        }
    }

    fn on_breakpoint(
        &self,
        thread: ThreadHandle,
        operation: OperationId,
    ) -> Result<(), BlockingOperationError> {
        match self.engine.upgrade() {
            Some(engine) => engine.on_breakpoint(thread, operation),
            None => Ok(()),
        }
    }
}
