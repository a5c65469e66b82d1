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

//! Engine builder and integrations

use std::fmt;
use std::mem;
use std::sync::Arc;

#[cfg(feature = "tracing")]
use tracing::debug;

use crate::config::GuardConfig;
use crate::engine::{Engine, GLOBAL};
use crate::error::GuardError;
use crate::host::{Instrumentation, ThreadInfo};
use crate::policy::Policy;
use crate::report::{
    handler_fn, BlockingMethod, BlockingOperationError, FailingHandler, ViolationHandler,
};
use crate::threads::{marker_predicate, ThreadPredicate};

type PredicateComposer = Box<dyn FnOnce(ThreadPredicate) -> ThreadPredicate + Send>;

/// Contributes policy and predicates for a runtime or library
pub trait Integration: Send + Sync {
    /// Applies this integration to `builder`
    fn apply_to(&self, builder: &mut Builder);

    /// Integrations apply in ascending priority, stable for equal values
    fn priority(&self) -> i32 {
        0
    }
}

/// Accumulates configuration, policy, handler and predicates
pub struct Builder {
    config: GuardConfig,
    policy: Policy,
    handler: Arc<dyn ViolationHandler>,
    composers: Vec<PredicateComposer>,
    dynamic: Option<ThreadPredicate>,
}

impl fmt::Debug for Builder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder")
            .field("config", &self.config)
            .field("policy", &self.policy)
            .field("composers", &self.composers.len())
            .field("dynamic", &self.dynamic.is_some())
            .finish_non_exhaustive()
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    /// Builder preloaded with [`Policy::std`] and [`FailingHandler`]
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: GuardConfig::default(),
            policy: Policy::std(),
            handler: Arc::new(FailingHandler),
            composers: Vec::new(),
            dynamic: None,
        }
    }

    /// Replaces the configuration
    pub fn config(&mut self, config: GuardConfig) -> &mut Self {
        self.config = config;
        self
    }

    /// Replaces the policy, dropping the std blocking list
    pub fn policy(&mut self, policy: Policy) -> &mut Self {
        self.policy = policy;
        self
    }

    /// Marks `member` of `declaring_type` as blocking
    pub fn mark_as_blocking(&mut self, declaring_type: &str, member: &str) -> &mut Self {
        self.policy.mark_blocking(declaring_type, member);
        self
    }

    /// Excuses blocking calls made beneath `member`
    pub fn allow_blocking_calls_inside(&mut self, declaring_type: &str, member: &str) -> &mut Self {
        self.policy.set_allowance(declaring_type, member, true);
        self
    }

    /// Makes checks apply beneath `member` unless an outer allowance exists
    pub fn disallow_blocking_calls_inside(
        &mut self,
        declaring_type: &str,
        member: &str,
    ) -> &mut Self {
        self.policy.set_allowance(declaring_type, member, false);
        self
    }

    /// Sets the violation handler
    pub fn violation_handler(&mut self, handler: impl ViolationHandler + 'static) -> &mut Self {
        self.handler = Arc::new(handler);
        self
    }

    /// Sets the violation handler from a closure
    pub fn blocking_method_callback<F>(&mut self, callback: F) -> &mut Self
    where
        F: Fn(&BlockingMethod) -> Result<(), BlockingOperationError> + Send + Sync + 'static,
    {
        self.violation_handler(handler_fn(callback))
    }

    /// Composes the non-blocking thread predicate.
    ///
    /// `compose` receives the predicate built so far, starting from the
    /// marker capability test, and returns its replacement.
    pub fn non_blocking_thread_predicate<F>(&mut self, compose: F) -> &mut Self
    where
        F: FnOnce(ThreadPredicate) -> ThreadPredicate + Send + 'static,
    {
        self.composers.push(Box::new(compose));
        self
    }

    /// Adds a predicate selecting threads that are never cached.
    ///
    /// Several predicates are OR-combined.
    pub fn dynamic_thread_predicate<F>(&mut self, predicate: F) -> &mut Self
    where
        F: Fn(&ThreadInfo) -> bool + Send + Sync + 'static,
    {
        let added: ThreadPredicate = Arc::new(predicate);
        self.dynamic = Some(match self.dynamic.take() {
            Some(current) => Arc::new(move |info: &ThreadInfo| current(info) || added(info)),
            None => added,
        });
        self
    }

    /// Applies `integration` now
    pub fn with(&mut self, integration: impl Integration) -> &mut Self {
        integration.apply_to(self);
        self
    }

    /// Applies `integrations` in priority order
    pub fn with_integrations<I>(&mut self, integrations: I) -> &mut Self
    where
        I: IntoIterator<Item = Box<dyn Integration>>,
    {
        let mut integrations: Vec<_> = integrations.into_iter().collect();
        integrations.sort_by_key(|integration| integration.priority());
        for integration in &integrations {
            integration.apply_to(self);
        }
        self
    }

    /// Builds an engine attached to `host`.
    ///
    /// Predicate composers are consumed; a second build starts again from
    /// the marker predicate.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::InvalidConfig`] for an invalid configuration.
    pub fn build(&mut self, host: Arc<dyn Instrumentation>) -> Result<Arc<Engine>, GuardError> {
        let base = marker_predicate(self.config.non_blocking_marker.clone());
        let non_blocking = mem::take(&mut self.composers)
            .into_iter()
            .fold(base, |current, compose| compose(current));

        Engine::new(
            host,
            self.config.clone(),
            self.policy.clone(),
            Arc::clone(&self.handler),
            non_blocking,
            self.dynamic.clone(),
        )
    }

    /// Builds and installs the process-wide engine
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::AlreadyInstalled`] if an engine is installed.
    pub fn install(&mut self, host: Arc<dyn Instrumentation>) -> Result<Arc<Engine>, GuardError> {
        if GLOBAL.get().is_some() {
            return Err(GuardError::AlreadyInstalled);
        }

        let engine = self.build(host)?;
        GLOBAL
            .set(Arc::clone(&engine))
            .map_err(|_| GuardError::AlreadyInstalled)?;

        #[cfg(feature = "tracing")]
        debug!("Blocking-call detection installed");

        Ok(engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::ThreadHandle;
    use parking_lot::Mutex;

    struct Recording {
        name: &'static str,
        priority: i32,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Integration for Recording {
        fn apply_to(&self, builder: &mut Builder) {
            self.log.lock().push(self.name);
            builder.allow_blocking_calls_inside("app::Integration", self.name);
        }

        fn priority(&self) -> i32 {
            self.priority
        }
    }

    fn info(capabilities: &[&str]) -> ThreadInfo {
        ThreadInfo {
            handle: ThreadHandle(1),
            name: None,
            capabilities: capabilities.iter().map(|c| (*c).to_string()).collect(),
        }
    }

    #[test]
    fn test_integrations_sorted_by_priority() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let integration = |name, priority| -> Box<dyn Integration> {
            Box::new(Recording {
                name,
                priority,
                log: Arc::clone(&log),
            })
        };

        let mut builder = Builder::new();
        builder.with_integrations(vec![
            integration("late", 10),
            integration("first", 0),
            integration("second", 0),
            integration("early", -5),
        ]);

        assert_eq!(*log.lock(), vec!["early", "first", "second", "late"]);
        assert_eq!(builder.policy.allowances().count(), 4);
    }

    #[test]
    fn test_predicate_composition_starts_from_marker() {
        let mut builder = Builder::new();
        builder.non_blocking_thread_predicate(|current| {
            Arc::new(move |info: &ThreadInfo| current(info) || info.has_capability("app::Loop"))
        });

        let base = marker_predicate(builder.config.non_blocking_marker.clone());
        let composed = mem::take(&mut builder.composers)
            .into_iter()
            .fold(base, |current, compose| compose(current));

        assert!(composed(&info(&["blockwatch::NonBlocking"])));
        assert!(composed(&info(&["app::Loop"])));
        assert!(!composed(&info(&["app::Other"])));
    }

    #[test]
    fn test_dynamic_predicates_or_combined() {
        let mut builder = Builder::new();
        builder
            .dynamic_thread_predicate(|info| info.has_capability("a"))
            .dynamic_thread_predicate(|info| info.has_capability("b"));

        let dynamic = builder.dynamic.clone().unwrap();
        assert!(dynamic(&info(&["a"])));
        assert!(dynamic(&info(&["b"])));
        assert!(!dynamic(&info(&["c"])));
    }

    #[test]
    fn test_allowance_overwritten_by_later_call() {
        let mut builder = Builder::new();
        builder
            .disallow_blocking_calls_inside("app::Pool", "run")
            .allow_blocking_calls_inside("app::Pool", "run");

        let allowances: Vec<_> = builder.policy.allowances().collect();
        assert_eq!(allowances, vec![("app::Pool", "run", true)]);
    }
}
