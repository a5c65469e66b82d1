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

//! Thread classification
//!
//! Decides once per thread whether it must never block and keeps the answer
//! in a side table for the lifetime of the process. Threads selected by the
//! dynamic predicate bypass the table and are re-evaluated on every query.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;

#[cfg(feature = "tracing")]
use tracing::trace;

use crate::host::{Instrumentation, ThreadHandle, ThreadInfo};
use crate::metrics::GuardMetrics;

/// Predicate over thread metadata
pub type ThreadPredicate = Arc<dyn Fn(&ThreadInfo) -> bool + Send + Sync>;

/// Predicate that holds for threads declaring `marker`
#[must_use]
pub fn marker_predicate(marker: impl Into<String>) -> ThreadPredicate {
    let marker = marker.into();
    Arc::new(move |info: &ThreadInfo| info.has_capability(&marker))
}

/// Predicate that never holds
#[must_use]
pub fn never() -> ThreadPredicate {
    Arc::new(|_: &ThreadInfo| false)
}

/// Cached verdict for one thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadClassification {
    /// Thread must never block
    pub is_restricted: bool,
}

/// Per-thread restriction cache
pub struct ThreadClassifier {
    cache: DashMap<ThreadHandle, ThreadClassification>,
    non_blocking: ThreadPredicate,
    dynamic: Option<ThreadPredicate>,
    metrics: Arc<GuardMetrics>,
}

impl fmt::Debug for ThreadClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadClassifier")
            .field("cached", &self.cache.len())
            .field("dynamic", &self.dynamic.is_some())
            .finish_non_exhaustive()
    }
}

impl ThreadClassifier {
    /// Creates a classifier
    #[must_use]
    pub fn new(
        non_blocking: ThreadPredicate,
        dynamic: Option<ThreadPredicate>,
        metrics: Arc<GuardMetrics>,
    ) -> Self {
        Self {
            cache: DashMap::new(),
            non_blocking,
            dynamic,
            metrics,
        }
    }

    /// Returns true if `thread` must never block.
    ///
    /// A host fault resolves to `false` and leaves the thread untagged, so
    /// the next query asks the host again.
    pub fn is_restricted(&self, host: &dyn Instrumentation, thread: ThreadHandle) -> bool {
        if let Some(tag) = self.cache.get(&thread) {
            return tag.is_restricted;
        }

        let info = match host.thread_info(thread) {
            Ok(info) => info,
            Err(fault) => {
                self.metrics.record_fault(&fault);
                return false;
            }
        };

        let is_restricted = (self.non_blocking)(&info);

        if self.dynamic.as_ref().is_some_and(|dynamic| dynamic(&info)) {
            return is_restricted;
        }

        // Racing first classifications compute the same value
        self.cache.insert(thread, ThreadClassification { is_restricted });
        self.metrics.record_thread_classified(is_restricted);

        #[cfg(feature = "tracing")]
        trace!(thread = thread.0, name = ?info.name, is_restricted, "Thread classified");

        is_restricted
    }

    /// Cached verdict, if the thread was classified
    #[must_use]
    pub fn cached(&self, thread: ThreadHandle) -> Option<ThreadClassification> {
        self.cache.get(&thread).map(|tag| *tag)
    }

    /// Drops the cached verdict so the next query asks the host again
    pub fn forget(&self, thread: ThreadHandle) -> bool {
        self.cache.remove(&thread).is_some()
    }

    /// Number of cached threads
    #[must_use]
    pub fn cached_count(&self) -> usize {
        self.cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{FaultResult, InstrumentationFault};
    use crate::host::{HostListener, MemberInfo, OperationId, StackFrame};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct ThreadsOnly {
        info: Mutex<ThreadInfo>,
        fetches: AtomicUsize,
        failing: AtomicBool,
    }

    impl Instrumentation for ThreadsOnly {
        fn current_thread(&self) -> ThreadHandle {
            self.info.lock().handle
        }

        fn thread_info(&self, thread: ThreadHandle) -> FaultResult<ThreadInfo> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(InstrumentationFault::ThreadNotAccessible(thread));
            }
            Ok(self.info.lock().clone())
        }

        fn stack_frames(
            &self,
            _: ThreadHandle,
            _: usize,
            _: usize,
        ) -> FaultResult<Vec<StackFrame>> {
            Ok(Vec::new())
        }

        fn type_members(&self, type_name: &str) -> FaultResult<Vec<MemberInfo>> {
            Err(InstrumentationFault::TypeNotLoaded(type_name.to_string()))
        }

        fn member_info(&self, operation: OperationId) -> FaultResult<MemberInfo> {
            Err(InstrumentationFault::UnknownOperation(operation))
        }

        fn set_breakpoint(&self, operation: OperationId) -> FaultResult<()> {
            Err(InstrumentationFault::BreakpointRejected(operation))
        }

        fn subscribe(&self, _: Arc<dyn HostListener>) {}
    }

    fn host_with(capabilities: &[&str]) -> ThreadsOnly {
        let host = ThreadsOnly::default();
        *host.info.lock() = ThreadInfo {
            handle: ThreadHandle(1),
            name: Some("event-loop".into()),
            capabilities: capabilities.iter().map(|c| (*c).to_string()).collect(),
        };
        host
    }

    fn classifier(dynamic: Option<ThreadPredicate>) -> ThreadClassifier {
        ThreadClassifier::new(
            marker_predicate("blockwatch::NonBlocking"),
            dynamic,
            Arc::new(GuardMetrics::new()),
        )
    }

    #[test]
    fn test_marker_thread_is_restricted() {
        let host = host_with(&["blockwatch::NonBlocking"]);
        let classifier = classifier(None);

        assert!(classifier.is_restricted(&host, ThreadHandle(1)));
        assert_eq!(
            classifier.cached(ThreadHandle(1)),
            Some(ThreadClassification { is_restricted: true })
        );
    }

    #[test]
    fn test_classification_computed_once() {
        let host = host_with(&["blockwatch::NonBlocking"]);
        let classifier = classifier(None);

        for _ in 0..10 {
            assert!(classifier.is_restricted(&host, ThreadHandle(1)));
        }
        assert_eq!(host.fetches.load(Ordering::SeqCst), 1);

        // Capability changes after the first query are not observed
        host.info.lock().capabilities.clear();
        assert!(classifier.is_restricted(&host, ThreadHandle(1)));
    }

    #[test]
    fn test_fault_is_not_cached() {
        let host = host_with(&["blockwatch::NonBlocking"]);
        host.failing.store(true, Ordering::SeqCst);
        let classifier = classifier(None);

        assert!(!classifier.is_restricted(&host, ThreadHandle(1)));
        assert_eq!(classifier.cached(ThreadHandle(1)), None);

        host.failing.store(false, Ordering::SeqCst);
        assert!(classifier.is_restricted(&host, ThreadHandle(1)));
    }

    #[test]
    fn test_dynamic_threads_bypass_cache() {
        let host = host_with(&["blockwatch::NonBlocking", "app::Dynamic"]);
        let classifier = classifier(Some(marker_predicate("app::Dynamic")));

        assert!(classifier.is_restricted(&host, ThreadHandle(1)));

        host.info.lock().capabilities = vec!["app::Dynamic".into()];
        assert!(!classifier.is_restricted(&host, ThreadHandle(1)));

        assert_eq!(classifier.cached_count(), 0);
        assert_eq!(host.fetches.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_forgotten_thread_is_reclassified() {
        let host = host_with(&[]);
        let classifier = classifier(None);

        assert!(!classifier.is_restricted(&host, ThreadHandle(1)));
        host.info.lock().capabilities = vec!["blockwatch::NonBlocking".into()];
        assert!(!classifier.is_restricted(&host, ThreadHandle(1)));

        assert!(classifier.forget(ThreadHandle(1)));
        assert!(classifier.is_restricted(&host, ThreadHandle(1)));
        assert!(!classifier.forget(ThreadHandle(2)));
        assert_eq!(host.fetches.load(Ordering::SeqCst), 2);
    }
}
