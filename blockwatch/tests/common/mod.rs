#![allow(dead_code)]

/*
 *     ______   __  __     __         ______     ______
 *    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
 *    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
 *     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
 *      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
 *
 * Author: Colin MacRitchie / Ripple Group
 */

//! Scripted host shared by the integration tests

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use blockwatch::{
    BlockingOperationError, FaultResult, HostListener, Instrumentation, InstrumentationFault,
    MemberInfo, MemberRef, OperationId, ThreadHandle, ThreadInfo, NON_BLOCKING_MARKER,
};
use blockwatch::host::StackFrame;
use dashmap::{DashMap, DashSet};
use parking_lot::RwLock;

/// Host whose threads, stacks and types are set up by the test
#[derive(Default)]
pub struct ScriptedHost {
    current: AtomicU64,
    next_id: AtomicU64,
    threads: DashMap<ThreadHandle, ThreadInfo>,
    /// Outermost frame first
    stacks: DashMap<ThreadHandle, Vec<OperationId>>,
    members: DashMap<OperationId, MemberInfo>,
    types: DashMap<String, Vec<OperationId>>,
    loaded: DashSet<String>,
    breakpoints: DashSet<OperationId>,
    listeners: RwLock<Vec<Arc<dyn HostListener>>>,
    pub thread_info_fetches: AtomicUsize,
    pub stack_fetches: AtomicUsize,
    pub failing_stacks: AtomicBool,
}

impl ScriptedHost {
    pub fn new() -> Arc<Self> {
        let host = Self::default();
        host.next_id.store(1, Ordering::SeqCst);
        host.current.store(1, Ordering::SeqCst);
        Arc::new(host)
    }

    /// Host whose std natives are defined and loaded
    pub fn with_std_natives() -> Arc<Self> {
        let host = Self::new();
        for member in blockwatch::natives::STD_NATIVES {
            host.add(member);
        }
        for member in blockwatch::natives::STD_NATIVES {
            host.load(member.declaring_type);
        }
        host
    }

    /// Adds a member without loading its type
    pub fn add(&self, member: &MemberRef) -> OperationId {
        let id = OperationId(self.next_id.fetch_add(1, Ordering::SeqCst));
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
        id
    }

    /// Marks a type loaded and notifies listeners
    pub fn load(&self, type_name: &str) {
        self.loaded.insert(type_name.to_string());
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.on_type_loaded(type_name);
        }
    }

    /// Adds and loads a member
    pub fn define(&self, member: &MemberRef) -> OperationId {
        let id = self.add(member);
        self.load(member.declaring_type);
        id
    }

    pub fn set_current(&self, thread: ThreadHandle) {
        self.current.store(thread.0, Ordering::SeqCst);
    }

    pub fn set_thread(&self, thread: ThreadHandle, capabilities: &[&str]) {
        self.threads.insert(
            thread,
            ThreadInfo {
                handle: thread,
                name: Some(format!("scripted-{}", thread.0)),
                capabilities: capabilities.iter().map(|c| (*c).to_string()).collect(),
            },
        );
    }

    /// Current thread declared non-blocking
    pub fn restrict_current(&self) {
        self.set_thread(self.current_thread(), &[NON_BLOCKING_MARKER]);
    }

    /// Stack of the current thread, outermost first
    pub fn set_stack(&self, outermost_first: &[OperationId]) {
        self.stacks
            .insert(self.current_thread(), outermost_first.to_vec());
    }

    pub fn has_breakpoint(&self, operation: OperationId) -> bool {
        self.breakpoints.contains(&operation)
    }

    /// Reaches `operation` on the current thread as if its frame was entered
    pub fn reach(&self, operation: OperationId) -> Result<(), BlockingOperationError> {
        let thread = self.current_thread();
        self.stacks.entry(thread).or_default().push(operation);

        let result = if self.breakpoints.contains(&operation) {
            let listeners = self.listeners.read().clone();
            listeners
                .iter()
                .try_for_each(|listener| listener.on_breakpoint(thread, operation))
        } else {
            Ok(())
        };

        if let Some(mut stack) = self.stacks.get_mut(&thread) {
            stack.pop();
        }
        result
    }
}

impl Instrumentation for ScriptedHost {
    fn current_thread(&self) -> ThreadHandle {
        ThreadHandle(self.current.load(Ordering::SeqCst))
    }

    fn thread_info(&self, thread: ThreadHandle) -> FaultResult<ThreadInfo> {
        self.thread_info_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .threads
            .get(&thread)
            .map(|info| info.value().clone())
            .unwrap_or(ThreadInfo {
                handle: thread,
                name: None,
                capabilities: Vec::new(),
            }))
    }

    fn stack_frames(
        &self,
        thread: ThreadHandle,
        start_depth: usize,
        max_frames: usize,
    ) -> FaultResult<Vec<StackFrame>> {
        self.stack_fetches.fetch_add(1, Ordering::SeqCst);
        if self.failing_stacks.load(Ordering::SeqCst) {
            return Err(InstrumentationFault::StackUnavailable(thread));
        }

        Ok(self
            .stacks
            .get(&thread)
            .map(|stack| {
                stack
                    .iter()
                    .rev()
                    .skip(start_depth)
                    .take(max_frames)
                    .map(|&operation| StackFrame { operation })
                    .collect()
            })
            .unwrap_or_default())
    }

    fn type_members(&self, type_name: &str) -> FaultResult<Vec<MemberInfo>> {
        if !self.loaded.contains(type_name) {
            return Err(InstrumentationFault::TypeNotLoaded(type_name.to_string()));
        }
        let ids = self
            .types
            .get(type_name)
            .map(|ids| ids.value().clone())
            .unwrap_or_default();
        Ok(ids
            .iter()
            .filter_map(|id| self.members.get(id).map(|m| m.value().clone()))
            .collect())
    }

    fn member_info(&self, operation: OperationId) -> FaultResult<MemberInfo> {
        self.members
            .get(&operation)
            .map(|m| m.value().clone())
            .ok_or(InstrumentationFault::UnknownOperation(operation))
    }

    fn set_breakpoint(&self, operation: OperationId) -> FaultResult<()> {
        self.breakpoints.insert(operation);
        Ok(())
    }

    fn subscribe(&self, listener: Arc<dyn HostListener>) {
        self.listeners.write().push(listener);
    }
}
