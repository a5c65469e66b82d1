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

//! Stack classification
//!
//! Walks the call stack of a restricted thread, innermost frame first, and
//! matches every frame against the hook registry:
//!
//! - an allowed hook ends the scan with [`Verdict::Permitted`]
//! - a disallowed hook is remembered and the scan continues outward
//! - an exhausted stack yields [`Verdict::Violating`] if a disallow was seen
//!
//! Frames are fetched from the host in pages, so the common case of a shallow
//! stack costs a single host call.

use std::sync::Arc;

use crate::config::GuardConfig;
use crate::error::FaultResult;
use crate::hooks::HookRegistry;
use crate::host::{Instrumentation, ThreadHandle};
use crate::metrics::GuardMetrics;
use crate::threads::ThreadClassifier;

/// Outcome of a classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The call may proceed
    Permitted,
    /// The call violates the non-blocking contract
    Violating,
}

impl Verdict {
    /// Returns true for [`Verdict::Violating`]
    #[inline]
    #[must_use]
    pub fn is_violating(self) -> bool {
        matches!(self, Self::Violating)
    }
}

/// Where a check starts and what it assumes before the first frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanStart {
    /// Frames to skip, e.g. the breakpointed member itself
    pub skip_frames: usize,
    /// Treat the context as disallowed before any hook is seen
    pub disallowed: bool,
}

impl ScanStart {
    /// Plain context query: nothing skipped, nothing assumed
    pub const CONTEXT: Self = Self {
        skip_frames: 0,
        disallowed: false,
    };

    /// Entry of a blocking primitive: the primitive itself disallows
    pub const BLOCKING_CALL: Self = Self {
        skip_frames: 0,
        disallowed: true,
    };

    /// Breakpoint on a blocking member whose frame is already on the stack
    pub const BREAKPOINT: Self = Self {
        skip_frames: 1,
        disallowed: true,
    };
}

/// Paged stack scanner
#[derive(Debug)]
pub struct StackClassifier {
    max_depth: usize,
    page_size: usize,
    metrics: Arc<GuardMetrics>,
}

impl StackClassifier {
    /// Creates a scanner bounded by the configured depth and page size
    #[must_use]
    pub fn new(config: &GuardConfig, metrics: Arc<GuardMetrics>) -> Self {
        Self {
            max_depth: config.max_stack_depth,
            page_size: config.stack_page_size.min(config.max_stack_depth),
            metrics,
        }
    }

    /// Classifies the current context of `thread`
    pub fn classify(
        &self,
        host: &dyn Instrumentation,
        hooks: &HookRegistry,
        threads: &ThreadClassifier,
        thread: ThreadHandle,
    ) -> Verdict {
        self.classify_from(host, hooks, threads, thread, ScanStart::CONTEXT)
    }

    /// Classifies a call to a blocking primitive made by `thread`.
    ///
    /// With no hook on the stack the call is violating; only an allowed hook
    /// excuses it.
    pub fn classify_blocking_call(
        &self,
        host: &dyn Instrumentation,
        hooks: &HookRegistry,
        threads: &ThreadClassifier,
        thread: ThreadHandle,
    ) -> Verdict {
        self.classify_from(host, hooks, threads, thread, ScanStart::BLOCKING_CALL)
    }

    /// Full classification with an explicit starting point.
    ///
    /// Unrestricted threads are `Permitted` without touching the stack. A
    /// host fault is counted and resolves to `Permitted`.
    pub fn classify_from(
        &self,
        host: &dyn Instrumentation,
        hooks: &HookRegistry,
        threads: &ThreadClassifier,
        thread: ThreadHandle,
        start: ScanStart,
    ) -> Verdict {
        self.metrics.record_check();

        if !threads.is_restricted(host, thread) {
            return Verdict::Permitted;
        }

        match self.scan(host, hooks, thread, start) {
            Ok(verdict) => verdict,
            Err(fault) => {
                self.metrics.record_fault(&fault);
                Verdict::Permitted
            }
        }
    }

    /// Scans the stack of `thread` without consulting its restriction.
    ///
    /// # Errors
    ///
    /// Propagates the first host fault hit while fetching a page.
    pub fn scan(
        &self,
        host: &dyn Instrumentation,
        hooks: &HookRegistry,
        thread: ThreadHandle,
        start: ScanStart,
    ) -> FaultResult<Verdict> {
        let mut disallowed = start.disallowed;
        let mut depth = start.skip_frames;

        while depth < self.max_depth {
            let want = self.page_size.min(self.max_depth - depth);
            let page = host.stack_frames(thread, depth, want)?;

            for frame in &page {
                match hooks.is_allowed(frame.operation) {
                    Some(true) => return Ok(Verdict::Permitted),
                    Some(false) => disallowed = true,
                    None => {}
                }
            }

            if page.len() < want {
                break;
            }
            depth += page.len();
        }

        Ok(if disallowed {
            Verdict::Violating
        } else {
            Verdict::Permitted
        })
    }
}
