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

//! In-process host
//!
//! Provides [`Instrumentation`] for the current process:
//!
//! - stacks are per-thread shadow stacks of [`FrameGuard`]s
//! - a type is the set of members defined with its name, loaded when its
//!   first member is defined
//! - capabilities are declared by a thread when it starts
//! - breakpoints fire as a frame for the member is entered
//!
//! Shadow stacks and capabilities belong to the thread, not to a runtime
//! instance. Operation identifiers are unique across instances.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::io;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};
use std::thread::{self, JoinHandle};

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use parking_lot::RwLock;
use pin_project_lite::pin_project;

#[cfg(feature = "tracing")]
use tracing::trace;

use super::{
    HostListener, Instrumentation, MemberInfo, OperationId, StackFrame, ThreadHandle, ThreadInfo,
};
use crate::config::NON_BLOCKING_MARKER;
use crate::error::{FaultResult, InstrumentationFault};
use crate::policy::MemberRef;
use crate::report::BlockingOperationError;

static NEXT_OPERATION: AtomicU64 = AtomicU64::new(1);
static NEXT_THREAD: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static HANDLE: ThreadHandle = ThreadHandle(NEXT_THREAD.fetch_add(1, Ordering::Relaxed));

    /// Outermost frame first
    static FRAMES: RefCell<Vec<OperationId>> = const { RefCell::new(Vec::new()) };

    static CAPABILITIES: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
}

fn current_handle() -> ThreadHandle {
    HANDLE.try_with(|handle| *handle).unwrap_or_default()
}

/// Shadow-stack frame, popped on drop
#[must_use = "the frame is popped as soon as the guard is dropped"]
pub struct FrameGuard {
    depth: usize,
    operation: OperationId,
    _not_send: PhantomData<*const ()>,
}

impl FrameGuard {
    fn push(operation: OperationId) -> Self {
        let depth = FRAMES
            .try_with(|frames| {
                let mut frames = frames.borrow_mut();
                frames.push(operation);
                frames.len() - 1
            })
            .unwrap_or(0);

        Self {
            depth,
            operation,
            _not_send: PhantomData,
        }
    }

    /// Operation recorded by this frame
    #[must_use]
    pub fn operation(&self) -> OperationId {
        self.operation
    }
}

impl fmt::Debug for FrameGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameGuard")
            .field("depth", &self.depth)
            .field("operation", &self.operation)
            .finish()
    }
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        // Also discards frames of guards leaked above this one
        let _ = FRAMES.try_with(|frames| frames.borrow_mut().truncate(self.depth));
    }
}

/// Capability held by the current thread until dropped
#[must_use = "the capability is withdrawn as soon as the guard is dropped"]
pub struct CapabilityGuard {
    len: usize,
    _not_send: PhantomData<*const ()>,
}

impl fmt::Debug for CapabilityGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityGuard").field("len", &self.len).finish()
    }
}

impl Drop for CapabilityGuard {
    fn drop(&mut self) {
        let _ = CAPABILITIES.try_with(|current| current.borrow_mut().truncate(self.len));
    }
}

/// In-process [`Instrumentation`] host
pub struct LocalRuntime {
    members: DashMap<OperationId, MemberInfo>,
    types: DashMap<String, Vec<OperationId>>,
    by_ref: DashMap<(&'static str, &'static str), OperationId>,
    breakpoints: DashSet<OperationId>,
    listeners: RwLock<Vec<Arc<dyn HostListener>>>,
}

impl fmt::Debug for LocalRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalRuntime")
            .field("members", &self.members.len())
            .field("types", &self.types.len())
            .field("breakpoints", &self.breakpoints.len())
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}

impl Default for LocalRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalRuntime {
    /// Creates a runtime with the guarded std primitives already defined
    #[must_use]
    pub fn new() -> Self {
        let runtime = Self {
            members: DashMap::new(),
            types: DashMap::new(),
            by_ref: DashMap::new(),
            breakpoints: DashSet::new(),
            listeners: RwLock::new(Vec::new()),
        };
        runtime.define_all(crate::natives::STD_NATIVES);
        runtime
    }

    /// Process-wide runtime used by the guarded primitives and `#[frame]`
    pub fn global() -> Arc<Self> {
        static GLOBAL_RUNTIME: OnceLock<Arc<LocalRuntime>> = OnceLock::new();
        Arc::clone(GLOBAL_RUNTIME.get_or_init(|| Arc::new(Self::new())))
    }

    fn define_quiet(&self, member: &MemberRef) -> (OperationId, bool) {
        match self.by_ref.entry((member.declaring_type, member.name)) {
            Entry::Occupied(entry) => (*entry.get(), false),
            Entry::Vacant(entry) => {
                let id = OperationId(NEXT_OPERATION.fetch_add(1, Ordering::Relaxed));
                self.members.insert(
                    id,
                    MemberInfo {
                        id,
                        declaring_type: member.declaring_type.to_string(),
                        name: member.name.to_string(),
                        is_static: member.is_static(),
                        is_native: member.native,
                    },
                );
                self.types
                    .entry(member.declaring_type.to_string())
                    .or_default()
                    .push(id);
                entry.insert(id);
                (id, true)
            }
        }
    }

    /// Defines `member`, loading its type if needed.
    ///
    /// Listeners see the load before this returns.
    pub fn define(&self, member: &MemberRef) -> OperationId {
        let (id, added) = self.define_quiet(member);
        if added {
            self.notify_type_loaded(member.declaring_type);
        }
        id
    }

    /// Defines several members with one load notification per type
    pub fn define_all(&self, members: &[MemberRef]) {
        let loaded: BTreeSet<&'static str> = members
            .iter()
            .filter(|member| self.define_quiet(member).1)
            .map(|member| member.declaring_type)
            .collect();

        for type_name in loaded {
            self.notify_type_loaded(type_name);
        }
    }

    /// Identifier of `member`, if defined
    #[must_use]
    pub fn operation_id(&self, member: &MemberRef) -> Option<OperationId> {
        self.by_ref
            .get(&(member.declaring_type, member.name))
            .map(|entry| *entry.value())
    }

    /// Live listeners; detached ones are dropped on the way
    fn listeners(&self) -> Vec<Arc<dyn HostListener>> {
        let listeners = self.listeners.read().clone();
        if !listeners.iter().any(|listener| listener.is_detached()) {
            return listeners;
        }

        let mut registered = self.listeners.write();
        registered.retain(|listener| !listener.is_detached());
        registered.clone()
    }

    /// Number of listeners still attached
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners().len()
    }

    fn notify_type_loaded(&self, type_name: &str) {
        #[cfg(feature = "tracing")]
        trace!(type_name, "Type loaded");

        for listener in self.listeners() {
            listener.on_type_loaded(type_name);
        }
    }

    /// Enters a frame for `member`.
    ///
    /// # Errors
    ///
    /// Returns the violation raised by a breakpoint on `member`; the frame is
    /// popped again.
    pub fn enter(&self, member: &MemberRef) -> Result<FrameGuard, BlockingOperationError> {
        let id = self.define(member);
        let guard = FrameGuard::push(id);

        if self.breakpoints.contains(&id) {
            let thread = current_handle();
            for listener in self.listeners() {
                listener.on_breakpoint(thread, id)?;
            }
        }

        Ok(guard)
    }

    /// Enters a frame for `member`, panicking on a breakpoint violation.
    ///
    /// # Panics
    ///
    /// Panics with the violation message if a breakpoint on `member` reports
    /// a violation.
    pub fn enter_frame(&self, member: &MemberRef) -> FrameGuard {
        match self.enter(member) {
            Ok(guard) => guard,
            Err(err) => panic!("{err}"),
        }
    }

    /// Enters a frame without reporting breakpoints
    pub fn push_frame(&self, member: &MemberRef) -> FrameGuard {
        FrameGuard::push(self.define(member))
    }

    /// Runs `future` with a frame for `member` pushed during every poll
    pub fn instrument<F: Future>(
        self: &Arc<Self>,
        member: MemberRef,
        future: F,
    ) -> Instrumented<F> {
        Instrumented {
            inner: future,
            member,
            runtime: Arc::clone(self),
        }
    }

    /// Declares the capabilities of the current thread and announces it.
    ///
    /// Listening engines drop the verdict they cached for the thread.
    pub fn declare_thread<I, S>(&self, capabilities: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let capabilities: Vec<String> = capabilities.into_iter().map(Into::into).collect();
        let _ = CAPABILITIES.try_with(|current| current.borrow_mut().extend(capabilities));

        let thread = current_handle();
        for listener in self.listeners() {
            listener.on_thread_start(thread);
        }
    }

    /// True if the current thread holds `capability`
    #[must_use]
    pub fn has_capability(&self, capability: &str) -> bool {
        CAPABILITIES
            .try_with(|current| current.borrow().iter().any(|held| held == capability))
            .unwrap_or(false)
    }

    /// Adds `capability` to the current thread for the guard's lifetime.
    ///
    /// Only threads selected by a dynamic thread predicate observe the
    /// change; other threads keep their first classification.
    pub fn scoped_capability(&self, capability: impl Into<String>) -> CapabilityGuard {
        let capability = capability.into();
        let len = CAPABILITIES
            .try_with(|current| {
                let mut current = current.borrow_mut();
                current.push(capability);
                current.len() - 1
            })
            .unwrap_or(0);

        CapabilityGuard {
            len,
            _not_send: PhantomData,
        }
    }

    /// Declares the current thread as one that must never block
    pub fn mark_current_thread_non_blocking(&self) {
        self.declare_thread([NON_BLOCKING_MARKER]);
    }

    /// Spawns a named thread declaring `capabilities` before running `f`
    ///
    /// # Errors
    ///
    /// Returns the OS error if the thread cannot be created.
    pub fn spawn_with_capabilities<F, T>(
        self: &Arc<Self>,
        name: impl Into<String>,
        capabilities: Vec<String>,
        f: F,
    ) -> io::Result<JoinHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let runtime = Arc::clone(self);
        thread::Builder::new().name(name.into()).spawn(move || {
            runtime.declare_thread(capabilities);
            f()
        })
    }

    /// Spawns a thread that must never block
    ///
    /// # Errors
    ///
    /// Returns the OS error if the thread cannot be created.
    pub fn spawn_non_blocking<F, T>(
        self: &Arc<Self>,
        name: impl Into<String>,
        f: F,
    ) -> io::Result<JoinHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.spawn_with_capabilities(name, vec![NON_BLOCKING_MARKER.to_string()], f)
    }

    /// Frames of the current thread, innermost first
    #[must_use]
    pub fn current_frames(&self) -> Vec<OperationId> {
        FRAMES
            .try_with(|frames| frames.borrow().iter().rev().copied().collect())
            .unwrap_or_default()
    }

    /// Returns true if a frame for `member` is on the current stack
    #[must_use]
    pub fn is_executing(&self, member: &MemberRef) -> bool {
        self.operation_id(member).is_some_and(|id| {
            FRAMES
                .try_with(|frames| frames.borrow().contains(&id))
                .unwrap_or(false)
        })
    }
}

impl Instrumentation for LocalRuntime {
    fn current_thread(&self) -> ThreadHandle {
        current_handle()
    }

    fn thread_info(&self, thread: ThreadHandle) -> FaultResult<ThreadInfo> {
        if thread != current_handle() {
            return Err(InstrumentationFault::ThreadNotAccessible(thread));
        }

        let capabilities = CAPABILITIES
            .try_with(|current| current.borrow().clone())
            .map_err(|_| InstrumentationFault::ThreadNotAccessible(thread))?;

        Ok(ThreadInfo {
            handle: thread,
            name: thread::current().name().map(str::to_string),
            capabilities,
        })
    }

    fn stack_frames(
        &self,
        thread: ThreadHandle,
        start_depth: usize,
        max_frames: usize,
    ) -> FaultResult<Vec<StackFrame>> {
        if thread != current_handle() {
            return Err(InstrumentationFault::ThreadNotAccessible(thread));
        }

        FRAMES
            .try_with(|frames| {
                frames
                    .borrow()
                    .iter()
                    .rev()
                    .skip(start_depth)
                    .take(max_frames)
                    .map(|&operation| StackFrame { operation })
                    .collect()
            })
            .map_err(|_| InstrumentationFault::StackUnavailable(thread))
    }

    fn type_members(&self, type_name: &str) -> FaultResult<Vec<MemberInfo>> {
        let ids = self
            .types
            .get(type_name)
            .map(|ids| ids.value().clone())
            .ok_or_else(|| InstrumentationFault::TypeNotLoaded(type_name.to_string()))?;

        Ok(ids
            .iter()
            .filter_map(|id| self.members.get(id).map(|member| member.value().clone()))
            .collect())
    }

    fn member_info(&self, operation: OperationId) -> FaultResult<MemberInfo> {
        self.members
            .get(&operation)
            .map(|member| member.value().clone())
            .ok_or(InstrumentationFault::UnknownOperation(operation))
    }

    fn set_breakpoint(&self, operation: OperationId) -> FaultResult<()> {
        if !self.members.contains_key(&operation) {
            return Err(InstrumentationFault::BreakpointRejected(operation));
        }
        self.breakpoints.insert(operation);
        Ok(())
    }

    fn subscribe(&self, listener: Arc<dyn HostListener>) {
        let mut registered = self.listeners.write();
        registered.retain(|listener| !listener.is_detached());
        registered.push(listener);
    }
}

pin_project! {
    /// Future running inside a frame of the in-process host
    #[must_use = "futures do nothing unless polled"]
    pub struct Instrumented<F> {
        #[pin]
        inner: F,
        member: MemberRef,
        runtime: Arc<LocalRuntime>,
    }
}

impl<F> Instrumented<F> {
    /// Member whose frame wraps every poll
    pub fn member(&self) -> &MemberRef {
        &self.member
    }

    /// Unwraps the inner future
    pub fn into_inner(self) -> F {
        self.inner
    }
}

impl<F: Future> Future for Instrumented<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let _frame = this.runtime.push_frame(this.member);
        this.inner.poll(cx)
    }
}

/// Enters a frame on the global runtime
///
/// # Panics
///
/// Panics with the violation message if a breakpoint on `member` reports a
/// violation.
pub fn enter_frame(member: &MemberRef) -> FrameGuard {
    LocalRuntime::global().enter_frame(member)
}

/// Enters a frame on the global runtime
///
/// # Errors
///
/// Returns the violation raised by a breakpoint on `member`.
pub fn try_enter_frame(member: &MemberRef) -> Result<FrameGuard, BlockingOperationError> {
    LocalRuntime::global().enter(member)
}

/// Wraps `future` in a frame of the global runtime
pub fn instrument<F: Future>(member: MemberRef, future: F) -> Instrumented<F> {
    LocalRuntime::global().instrument(member, future)
}
