/*
 *     ______   __  __     __         ______     ______
 *    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
 *    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
 *     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
 *      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
 *
 * Author: Colin MacRitchie / Ripple Group
 */

//! Counters for checks, violations and instrumentation faults
//!
//! Faults resolve checks to `Permitted`, so these counters are the only place
//! where a failing host becomes visible.

use std::sync::atomic::{AtomicU64, Ordering};

#[cfg(feature = "metrics")]
use metrics::counter;

#[cfg(feature = "tracing")]
use tracing::debug;

use crate::error::InstrumentationFault;

/// Engine counters
#[derive(Debug, Default)]
pub struct GuardMetrics {
    /// Blocking-call checks performed
    pub checks: AtomicU64,

    /// Violations reported
    pub violations: AtomicU64,

    /// Host faults resolved to `Permitted`
    pub faults: AtomicU64,

    /// Threads classified and cached
    pub threads_classified: AtomicU64,

    /// Cached threads found restricted
    pub restricted_threads: AtomicU64,

    /// Native entry points bound
    pub natives_bound: AtomicU64,

    /// Breakpoints installed
    pub breakpoints_installed: AtomicU64,

    /// Breakpoints reached
    pub breakpoint_hits: AtomicU64,
}

impl GuardMetrics {
    /// Create new metrics instance
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a blocking-call check
    #[inline]
    pub fn record_check(&self) {
        self.checks.fetch_add(1, Ordering::Relaxed);

        #[cfg(feature = "metrics")]
        counter!("blockwatch_checks_total").increment(1);
    }

    /// Record a reported violation
    pub fn record_violation(&self) {
        self.violations.fetch_add(1, Ordering::Relaxed);

        #[cfg(feature = "metrics")]
        counter!("blockwatch_violations_total").increment(1);
    }

    /// Record a host fault
    pub fn record_fault(&self, fault: &InstrumentationFault) {
        self.faults.fetch_add(1, Ordering::Relaxed);

        #[cfg(feature = "tracing")]
        debug!(kind = fault.kind(), %fault, "Instrumentation fault, failing open");

        #[cfg(feature = "metrics")]
        counter!("blockwatch_faults_total", "kind" => fault.kind()).increment(1);

        #[cfg(not(any(feature = "tracing", feature = "metrics")))]
        let _ = fault;
    }

    /// Record a cached thread classification
    pub fn record_thread_classified(&self, restricted: bool) {
        self.threads_classified.fetch_add(1, Ordering::Relaxed);
        if restricted {
            self.restricted_threads.fetch_add(1, Ordering::Relaxed);
        }

        #[cfg(feature = "metrics")]
        counter!("blockwatch_threads_classified_total", "restricted" => restricted.to_string())
            .increment(1);
    }

    /// Record a native entry point bind
    pub fn record_native_bound(&self) {
        self.natives_bound.fetch_add(1, Ordering::Relaxed);

        #[cfg(feature = "metrics")]
        counter!("blockwatch_natives_bound_total").increment(1);
    }

    /// Record an installed breakpoint
    pub fn record_breakpoint_installed(&self) {
        self.breakpoints_installed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a reached breakpoint
    #[inline]
    pub fn record_breakpoint_hit(&self) {
        self.breakpoint_hits.fetch_add(1, Ordering::Relaxed);

        #[cfg(feature = "metrics")]
        counter!("blockwatch_breakpoint_hits_total").increment(1);
    }

    /// Get snapshot of current metrics
    #[must_use]
    pub fn snapshot(&self) -> GuardMetricsSnapshot {
        GuardMetricsSnapshot {
            checks: self.checks.load(Ordering::Relaxed),
            violations: self.violations.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
            threads_classified: self.threads_classified.load(Ordering::Relaxed),
            restricted_threads: self.restricted_threads.load(Ordering::Relaxed),
            natives_bound: self.natives_bound.load(Ordering::Relaxed),
            breakpoints_installed: self.breakpoints_installed.load(Ordering::Relaxed),
            breakpoint_hits: self.breakpoint_hits.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of engine counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GuardMetricsSnapshot {
    /// Blocking-call checks performed
    pub checks: u64,
    /// Violations reported
    pub violations: u64,
    /// Host faults resolved to `Permitted`
    pub faults: u64,
    /// Threads classified and cached
    pub threads_classified: u64,
    /// Cached threads found restricted
    pub restricted_threads: u64,
    /// Native entry points bound
    pub natives_bound: u64,
    /// Breakpoints installed
    pub breakpoints_installed: u64,
    /// Breakpoints reached
    pub breakpoint_hits: u64,
}
