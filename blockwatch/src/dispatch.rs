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

//! Interception targets
//!
//! Every intercepted operation owns exactly one target for the lifetime of the
//! process. Native entry points are captured on their first bind; other
//! blocking members get a breakpoint once their type loads.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

#[cfg(feature = "tracing")]
use tracing::trace;

use crate::error::{FaultResult, InstrumentationFault};
use crate::host::{Instrumentation, MemberInfo, OperationId};
use crate::metrics::GuardMetrics;

/// Captured native entry point
pub struct NativeSubstitution {
    /// Substituted member
    pub member: MemberInfo,
    /// Calls go through the stack classifier
    pub guarded: bool,
    original: Box<dyn Any + Send + Sync>,
}

impl NativeSubstitution {
    /// Returns the captured original if it has type `F`
    #[must_use]
    pub fn original<F: Copy + 'static>(&self) -> Option<F> {
        self.original.downcast_ref::<F>().copied()
    }
}

impl fmt::Debug for NativeSubstitution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeSubstitution")
            .field("member", &self.member)
            .field("guarded", &self.guarded)
            .finish_non_exhaustive()
    }
}

/// How an operation is intercepted
#[derive(Debug)]
pub enum InterceptionTarget {
    /// Reached through a breakpoint or an explicit query, nothing redirected
    CallSiteHook(MemberInfo),
    /// Entry point replaced by a guarded trampoline
    NativeSubstitution(NativeSubstitution),
}

/// Result of binding a native entry point
#[derive(Debug, Clone, Copy)]
pub struct NativeBinding<F> {
    /// Calls must be classified before forwarding
    pub guarded: bool,
    /// Entry point captured on first bind
    pub original: F,
}

/// Owner of all interception targets
#[derive(Debug)]
pub struct Dispatcher {
    targets: DashMap<OperationId, InterceptionTarget>,
    metrics: Arc<GuardMetrics>,
}

impl Dispatcher {
    /// Creates an empty dispatcher
    #[must_use]
    pub fn new(metrics: Arc<GuardMetrics>) -> Self {
        Self {
            targets: DashMap::new(),
            metrics,
        }
    }

    /// Binds `operation` to a native entry point.
    ///
    /// The first bind captures `original` and the guard flag; later binds
    /// return what was captured then, ignoring their own arguments.
    ///
    /// # Errors
    ///
    /// [`InstrumentationFault::SignatureMismatch`] if the operation was bound
    /// with another function type or is already a call-site target.
    pub fn bind_native<F>(
        &self,
        member: &MemberInfo,
        guarded: bool,
        original: F,
    ) -> FaultResult<NativeBinding<F>>
    where
        F: Copy + Send + Sync + 'static,
    {
        match self.targets.entry(member.id) {
            Entry::Occupied(entry) => Self::binding_of(member.id, entry.get()),
            Entry::Vacant(entry) => {
                entry.insert(InterceptionTarget::NativeSubstitution(NativeSubstitution {
                    member: member.clone(),
                    guarded,
                    original: Box::new(original),
                }));
                self.metrics.record_native_bound();

                #[cfg(feature = "tracing")]
                trace!(operation = member.id.0, member = %member.name, guarded, "Native entry point bound");

                Ok(NativeBinding { guarded, original })
            }
        }
    }

    /// Binding of an operation bound earlier
    ///
    /// # Errors
    ///
    /// [`InstrumentationFault::UnknownOperation`] if it was never bound, or
    /// [`InstrumentationFault::SignatureMismatch`] for another function type.
    #[inline]
    pub fn native<F: Copy + 'static>(
        &self,
        operation: OperationId,
    ) -> FaultResult<NativeBinding<F>> {
        match self.targets.get(&operation) {
            Some(target) => Self::binding_of(operation, target.value()),
            None => Err(InstrumentationFault::UnknownOperation(operation)),
        }
    }

    fn binding_of<F: Copy + 'static>(
        operation: OperationId,
        target: &InterceptionTarget,
    ) -> FaultResult<NativeBinding<F>> {
        match target {
            InterceptionTarget::NativeSubstitution(native) => native
                .original::<F>()
                .map(|original| NativeBinding {
                    guarded: native.guarded,
                    original,
                })
                .ok_or(InstrumentationFault::SignatureMismatch(operation)),
            InterceptionTarget::CallSiteHook(_) => {
                Err(InstrumentationFault::SignatureMismatch(operation))
            }
        }
    }

    /// Installs a breakpoint on a non-native blocking member.
    ///
    /// Returns `false` if the operation already has a target.
    ///
    /// # Errors
    ///
    /// Propagates the host's refusal; no target is recorded then.
    pub fn install_breakpoint(
        &self,
        host: &dyn Instrumentation,
        member: &MemberInfo,
    ) -> FaultResult<bool> {
        match self.targets.entry(member.id) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(entry) => {
                host.set_breakpoint(member.id)?;
                entry.insert(InterceptionTarget::CallSiteHook(member.clone()));
                self.metrics.record_breakpoint_installed();
                Ok(true)
            }
        }
    }

    /// Returns true if `operation` is intercepted through a breakpoint
    #[must_use]
    pub fn is_breakpoint(&self, operation: OperationId) -> bool {
        self.targets
            .get(&operation)
            .is_some_and(|target| matches!(target.value(), InterceptionTarget::CallSiteHook(_)))
    }

    /// Member metadata of an intercepted operation
    #[must_use]
    pub fn member(&self, operation: OperationId) -> Option<MemberInfo> {
        self.targets.get(&operation).map(|target| match target.value() {
            InterceptionTarget::CallSiteHook(member) => member.clone(),
            InterceptionTarget::NativeSubstitution(native) => native.member.clone(),
        })
    }

    /// Number of intercepted operations
    #[must_use]
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// True if nothing is intercepted yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}
